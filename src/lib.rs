pub mod calibration;
pub mod complex;
pub mod config;
pub mod error;
pub mod instrument;
pub mod plotting;
pub mod sequencer;
pub mod slice;
pub mod store;
pub mod tensor;
pub mod types;
pub mod utils;
pub mod worker;

pub use calibration::{
    calibrate_record, CalibrationEngine, CalibrationEvent, CalibrationOutput, ReferenceSelection,
    ReferenceValue, RenderKey, SelectionSummary, SummaryLimits,
};
pub use complex::{amplitude_db, complex_mean, polar_to_complex, wrap_phase};
pub use config::{load_config, load_config_or_default, AppConfig};
pub use error::ScanError;
pub use instrument::{
    ConnectionConfig, InstrumentLink, ScpiClient, ScpiGenerator, ScpiVna, SignalGenerator, Stage,
    Vna,
};
pub use plotting::{plot_profile, profile_along_x, profile_along_z, PlaneField, Profile};
pub use sequencer::{
    snake_order, LogEvent, Preview, PreviewMode, Progress, RunOutcome, RunReport, ScanEvent,
    ScanSequencer, SequencerSettings,
};
pub use slice::{extract_xz_slice, y_axis_of, Payload, Plane};
pub use store::RecordStore;
pub use tensor::{demo_frame, MeasureRecord, MeasurementFrame};
pub use types::{
    Axis, AxisSweep, ChannelFormat, ChannelSweep, FrequencySweep, ScanConfig, ScanDelays, Trace,
    VnaParameter, VnaSettings,
};
pub use worker::ScanWorker;
