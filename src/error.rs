use thiserror::Error;

#[derive(Error, Debug)]
pub enum ScanError {
    #[error("IO error ({context}): {source}")]
    Io {
        #[source]
        source: std::io::Error,
        context: String,
    },
    #[error("Connection timeout")]
    Timeout,
    #[error("Connection error: {0}")]
    Connection(String),
    #[error("Protocol error: {0}")]
    Protocol(String),
    #[error("Invalid response: {0}")]
    InvalidResponse(String),
    #[error("Instrument {device} error: {message}")]
    Instrument { device: String, message: String },
    #[error("Configuration error: {0}")]
    Config(String),
    #[error(
        "Frequency point count mismatch: channel 1 has {channel1} points, channel 2 has {channel2}"
    )]
    FrequencyPointMismatch { channel1: usize, channel2: usize },
    #[error("A scan is already running")]
    ScanInProgress,
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<std::io::Error> for ScanError {
    fn from(source: std::io::Error) -> Self {
        if matches!(
            source.kind(),
            std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock
        ) {
            ScanError::Timeout
        } else {
            ScanError::Io {
                source,
                context: "unspecified".to_string(),
            }
        }
    }
}

impl ScanError {
    /// Faults that leave the hardware in an unknown state
    pub fn is_instrument_fault(&self) -> bool {
        matches!(
            self,
            ScanError::Io { .. }
                | ScanError::Timeout
                | ScanError::Connection(_)
                | ScanError::Protocol(_)
                | ScanError::InvalidResponse(_)
                | ScanError::Instrument { .. }
        )
    }
}
