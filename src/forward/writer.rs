//! JSON-lines sink over any byte writer (stdout, an append-only file).

use parking_lot::Mutex;
use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::Path;

use super::{Sink, SinkError};
use crate::types::OccurrenceRecord;

pub struct WriterSink {
    writer: Mutex<Box<dyn Write + Send>>,
    immediate_flush: bool,
}

impl WriterSink {
    pub fn new(writer: Box<dyn Write + Send>) -> Self {
        Self {
            writer: Mutex::new(writer),
            immediate_flush: true,
        }
    }

    pub fn stdout() -> Self {
        Self::new(Box::new(io::stdout()))
    }

    /// Append to `path`, creating it if needed.
    pub fn append_to<P: AsRef<Path>>(path: P) -> Result<Self, SinkError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| {
                SinkError::InvalidUrl(format!("{}: {}", parent.display(), e))
            })?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| SinkError::InvalidUrl(format!("{}: {}", path.display(), e)))?;
        Ok(Self::new(Box::new(file)))
    }
}

impl Sink for WriterSink {
    fn send(&self, record: &OccurrenceRecord) -> Result<(), SinkError> {
        let json = serde_json::to_string(record)
            .map_err(|e| SinkError::Rejected(format!("Failed to serialize occurrence: {}", e)))?;

        let mut writer = self.writer.lock();
        writeln!(writer, "{}", json)
            .map_err(|e| SinkError::Unreachable(format!("Failed to write occurrence: {}", e)))?;
        if self.immediate_flush {
            writer
                .flush()
                .map_err(|e| SinkError::Unreachable(format!("Failed to flush occurrence: {}", e)))?;
        }
        Ok(())
    }
}
