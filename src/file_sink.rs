//! JSON-lines data log.
//!
//! Every validated record is stamped with `ts` (ingestion time, ns since the
//! epoch) and appended as one line to `{DATA_LOG_PATH}/data.log`, rotated
//! daily.

use crate::influx::now_ns;
use crate::record::SensorRecord;
use crate::rotating_file::DailyRotatingFile;
use crate::sink::RecordWriter;
use anyhow::{anyhow, Context};
use async_trait::async_trait;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::info;

/// Name of the live data log inside the data directory.
pub const DATA_LOG_FILE_NAME: &str = "data.log";

/// [`RecordWriter`] appending to a daily-rotating JSON-lines file.
#[derive(Debug, Clone)]
pub struct FileWriter {
    path: PathBuf,
    file: Arc<Mutex<DailyRotatingFile>>,
}

impl FileWriter {
    /// Open `{dir}/data.log`, creating `dir` if needed.
    pub fn open(dir: impl AsRef<Path>, backups: usize) -> io::Result<Self> {
        let path = dir.as_ref().join(DATA_LOG_FILE_NAME);
        let file = DailyRotatingFile::open(&path, backups)?;
        info!(path = %path.display(), backups, "Created file data logger");
        Ok(Self {
            path,
            file: Arc::new(Mutex::new(file)),
        })
    }

    /// Path of the live data log.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append a record stamped with an explicit ingestion time.
    pub async fn append(&self, record: &SensorRecord, ts_ns: i64) -> anyhow::Result<()> {
        let line = record.with_field("ts", ts_ns).to_json()?;
        let file = self.file.clone();

        tokio::task::spawn_blocking(move || {
            let mut file = file
                .lock()
                .map_err(|_| anyhow!("data log lock poisoned"))?;
            file.write_line(&line).context("Failed to append to data log")
        })
        .await
        .context("spawn_blocking for data log write failed")?
    }
}

#[async_trait]
impl RecordWriter for FileWriter {
    fn name(&self) -> &str {
        "file"
    }

    async fn write(&self, record: &SensorRecord) -> anyhow::Result<()> {
        self.append(record, now_ns()).await
    }
}
