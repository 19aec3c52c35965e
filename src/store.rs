use log::info;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use crate::error::ScanError;
use crate::tensor::MeasureRecord;

/// Directory of `meas_<id>.json` record files
#[derive(Debug, Clone)]
pub struct RecordStore {
    dir: PathBuf,
}

impl RecordStore {
    pub fn new<P: Into<PathBuf>>(dir: P) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// File name for `record`, suffixed when a run with the same second already exists
    fn path_for(&self, record: &MeasureRecord) -> PathBuf {
        let id = if record.id.is_empty() {
            record.created.format("%Y-%m-%d_%H-%M-%S").to_string()
        } else {
            record.id.clone()
        };

        let mut path = self.dir.join(format!("meas_{id}.json"));
        let mut n = 1;
        while path.exists() {
            path = self.dir.join(format!("meas_{id}_{n}.json"));
            n += 1;
        }
        path
    }

    pub fn save(&self, record: &MeasureRecord) -> Result<PathBuf, ScanError> {
        fs::create_dir_all(&self.dir).map_err(|source| ScanError::Io {
            source,
            context: format!("Could not create record directory {:?}", self.dir),
        })?;

        let path = self.path_for(record);
        let file = File::create(&path).map_err(|source| ScanError::Io {
            source,
            context: format!("Could not create record file {path:?}"),
        })?;

        let mut writer = BufWriter::new(file);
        serde_json::to_writer(&mut writer, record)?;
        writer.flush().map_err(|source| ScanError::Io {
            source,
            context: format!("Could not write record file {path:?}"),
        })?;

        info!("Saved {} frame(s) to {}", record.len(), path.display());
        Ok(path)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<MeasureRecord, ScanError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|source| ScanError::Io {
            source,
            context: format!("Could not read record file {path:?}"),
        })?;
        let record = Self::import_str(&content)?;
        info!("Loaded {} frame(s) from {}", record.len(), path.display());
        Ok(record)
    }

    /// Parse a record document. `data` must be a list of frames; frames
    /// without complex maps are accepted.
    pub fn import_str(content: &str) -> Result<MeasureRecord, ScanError> {
        let value: serde_json::Value = serde_json::from_str(content)?;
        if !value.get("data").is_some_and(|data| data.is_array()) {
            return Err(ScanError::InvalidResponse(
                "record 'data' must be a list of frames".to_string(),
            ));
        }
        Ok(serde_json::from_value(value)?)
    }
}
