use relink_core::service::{ReviewRecord, ReviewSink};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::Mutex;

/// Review sink appending one JSON object per line, append-only so successive
/// runs accumulate into the same file.
pub struct JsonlReviewSink {
    file: Mutex<File>,
}

impl JsonlReviewSink {
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            file: Mutex::new(file),
        })
    }
}

impl ReviewSink for JsonlReviewSink {
    fn record(&self, record: &ReviewRecord) -> anyhow::Result<()> {
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');
        let mut file = self.file.lock().unwrap_or_else(|e| e.into_inner());
        file.write_all(&line)?;
        file.flush()?;
        Ok(())
    }
}
