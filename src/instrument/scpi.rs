use crate::error::ScanError;
use log::{debug, warn};
use std::io::{BufRead, BufReader, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;

/// Line-oriented command channel to a SCPI instrument
pub trait ScpiTransport: Send {
    /// Send a command that produces no response
    fn write(&mut self, command: &str) -> Result<(), ScanError>;

    /// Send a command and return its single-line response, terminator stripped
    fn query(&mut self, command: &str) -> Result<String, ScanError>;
}

/// Timeouts for the SCPI socket.
///
/// ```
/// use std::time::Duration;
/// use nearfield_scan::instrument::ConnectionConfig;
///
/// let config = ConnectionConfig {
///     read_timeout: Duration::from_secs(30),
///     ..ConnectionConfig::default()
/// };
/// assert_eq!(config.connect_timeout, Duration::from_secs(5));
/// ```
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
    pub write_timeout: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            read_timeout: Duration::from_secs(10),
            write_timeout: Duration::from_secs(5),
        }
    }
}

/// Builder for [`ScpiClient`].
///
/// ```no_run
/// use std::time::Duration;
/// use nearfield_scan::instrument::ScpiClient;
///
/// let client = ScpiClient::builder()
///     .address("169.254.106.189")
///     .port(5025)
///     .read_timeout(Duration::from_secs(20))
///     .build()?;
/// # Ok::<(), Box<dyn std::error::Error>>(())
/// ```
#[derive(Default)]
pub struct ScpiClientBuilder {
    address: Option<String>,
    port: Option<u16>,
    config: ConnectionConfig,
}

impl ScpiClientBuilder {
    pub fn address(mut self, addr: &str) -> Self {
        self.address = Some(addr.to_string());
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    pub fn config(mut self, config: ConnectionConfig) -> Self {
        self.config = config;
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout = timeout;
        self
    }

    pub fn read_timeout(mut self, timeout: Duration) -> Self {
        self.config.read_timeout = timeout;
        self
    }

    pub fn write_timeout(mut self, timeout: Duration) -> Self {
        self.config.write_timeout = timeout;
        self
    }

    pub fn build(self) -> Result<ScpiClient, ScanError> {
        let address = self
            .address
            .ok_or_else(|| ScanError::Config("Address must be specified".to_string()))?;
        let port = self
            .port
            .ok_or_else(|| ScanError::Config("Port must be specified".to_string()))?;

        let socket_addr = (address.as_str(), port)
            .to_socket_addrs()
            .map_err(|e| ScanError::Io {
                source: e,
                context: format!("Resolving {address}:{port}"),
            })?
            .next()
            .ok_or_else(|| ScanError::Connection(format!("No address found for {address}")))?;

        debug!("Connecting to SCPI instrument at {socket_addr}");

        let stream = TcpStream::connect_timeout(&socket_addr, self.config.connect_timeout)
            .map_err(|e| {
                warn!("Failed to connect to {socket_addr}: {e}");
                if e.kind() == std::io::ErrorKind::TimedOut {
                    ScanError::Timeout
                } else {
                    ScanError::Io {
                        source: e,
                        context: format!("Failed to connect to {socket_addr}"),
                    }
                }
            })?;

        stream.set_read_timeout(Some(self.config.read_timeout))?;
        stream.set_write_timeout(Some(self.config.write_timeout))?;
        stream.set_nodelay(true)?;

        let reader = BufReader::new(stream.try_clone()?);
        debug!("Connected to {socket_addr}");

        Ok(ScpiClient {
            reader,
            writer: stream,
            peer: socket_addr.to_string(),
            config: self.config,
        })
    }
}

/// SCPI over a raw TCP socket, newline terminated
pub struct ScpiClient {
    reader: BufReader<TcpStream>,
    writer: TcpStream,
    peer: String,
    config: ConnectionConfig,
}

impl ScpiClient {
    pub fn new(addr: &str, port: u16) -> Result<Self, ScanError> {
        Self::builder().address(addr).port(port).build()
    }

    pub fn builder() -> ScpiClientBuilder {
        ScpiClientBuilder::default()
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }
}

impl ScpiTransport for ScpiClient {
    fn write(&mut self, command: &str) -> Result<(), ScanError> {
        debug!("[{}] >> {command}", self.peer);
        self.writer
            .write_all(format!("{command}\n").as_bytes())
            .map_err(|e| ScanError::Io {
                source: e,
                context: format!("Writing '{command}'"),
            })
    }

    fn query(&mut self, command: &str) -> Result<String, ScanError> {
        self.write(command)?;

        let mut line = String::new();
        let read = self.reader.read_line(&mut line).map_err(ScanError::from)?;
        if read == 0 {
            return Err(ScanError::Connection(format!(
                "{} closed the connection during '{command}'",
                self.peer
            )));
        }

        let response = line.trim_end_matches(['\r', '\n']).to_string();
        debug!("[{}] << {response}", self.peer);
        Ok(response)
    }
}
