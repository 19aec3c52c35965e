use crossbeam_channel::Sender;
use log::{error, info, warn};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crate::error::ScanError;
use crate::instrument::InstrumentLink;
use crate::sequencer::{RunOutcome, RunReport, ScanEvent, ScanSequencer, SequencerSettings};
use crate::store::RecordStore;
use crate::types::{FrequencySweep, ScanConfig, ScanDelays};

type RunHandle = JoinHandle<(InstrumentLink, Result<RunReport, ScanError>)>;

/// Runs scans one at a time on a dedicated thread.
///
/// The instruments move into the worker thread for the duration of a run and
/// come back when it is joined, so two runs can never drive the stage at once.
pub struct ScanWorker {
    link: Mutex<Option<InstrumentLink>>,
    active: Mutex<Option<RunHandle>>,
    settings: SequencerSettings,
    store: Option<RecordStore>,
    cancel: Arc<AtomicBool>,
    events: Sender<ScanEvent>,
}

impl ScanWorker {
    pub fn new(link: InstrumentLink, settings: SequencerSettings, events: Sender<ScanEvent>) -> Self {
        Self {
            link: Mutex::new(Some(link)),
            active: Mutex::new(None),
            settings,
            store: None,
            cancel: Arc::new(AtomicBool::new(false)),
            events,
        }
    }

    pub fn with_store(mut self, store: RecordStore) -> Self {
        self.store = Some(store);
        self
    }

    /// Flag that cancels the active run when raised
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        self.cancel.clone()
    }

    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.active
            .lock()
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Start a run in the background. Rejected with [`ScanError::ScanInProgress`]
    /// while another run is active; configuration errors are reported here
    /// before the thread is spawned.
    pub fn start(
        &self,
        scan: ScanConfig,
        sweep: FrequencySweep,
        delays: ScanDelays,
    ) -> Result<(), ScanError> {
        let mut active = self.active.lock();
        if active.as_ref().is_some_and(|handle| !handle.is_finished()) {
            warn!("Scan start rejected: a scan is already running");
            return Err(ScanError::ScanInProgress);
        }
        if let Some(handle) = active.take() {
            self.reclaim(handle)?;
        }

        sweep.validate()?;
        scan.validate()?;

        let link = self
            .link
            .lock()
            .take()
            .ok_or_else(|| ScanError::Config("instruments are not available".to_string()))?;

        self.cancel.store(false, Ordering::SeqCst);
        let mut sequencer = ScanSequencer::new(link, self.settings.clone(), self.events.clone())
            .with_cancel_flag(self.cancel.clone());
        if let Some(store) = &self.store {
            sequencer = sequencer.with_store(store.clone());
        }

        let handle = thread::Builder::new()
            .name("scan-worker".to_string())
            .spawn(move || {
                let result = sequencer.run(&scan, &sweep, &delays);
                if let Ok(RunReport {
                    outcome:
                        RunOutcome::Failed {
                            instrument_fault: true,
                            ..
                        },
                    ..
                }) = &result
                {
                    warn!("Instrument fault, stopping stage");
                    if let Err(e) = sequencer.link_mut().stage.emergency_stop() {
                        error!("Emergency stop failed: {e}");
                    }
                }
                (sequencer.into_link(), result)
            })
            .map_err(|source| ScanError::Io {
                source,
                context: "Spawning scan worker thread".to_string(),
            })?;

        info!("Scan worker started");
        *active = Some(handle);
        Ok(())
    }

    /// Block until the active run ends and return its report
    pub fn wait(&self) -> Result<Option<RunReport>, ScanError> {
        match self.active.lock().take() {
            Some(handle) => self.reclaim(handle).map(Some),
            None => Ok(None),
        }
    }

    fn reclaim(&self, handle: RunHandle) -> Result<RunReport, ScanError> {
        let (link, result) = handle.join().map_err(|_| ScanError::Instrument {
            device: "scan worker".to_string(),
            message: "scan thread panicked; instruments are lost".to_string(),
        })?;
        *self.link.lock() = Some(link);
        result
    }
}
