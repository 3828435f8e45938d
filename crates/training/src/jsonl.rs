//! Append-only JSON-lines logs for per-epoch metrics and per-step timings.

use crate::error::{TrainError, TrainResult};
use serde::Serialize;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

pub struct JsonlSink {
    path: PathBuf,
    writer: BufWriter<File>,
}

impl JsonlSink {
    /// Opens `path` for appending, creating parent directories.
    pub fn open(path: &Path) -> TrainResult<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| TrainError::io(parent, e))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| TrainError::io(path, e))?;
        Ok(Self {
            path: path.to_path_buf(),
            writer: BufWriter::new(file),
        })
    }

    pub fn append<T: Serialize>(&mut self, record: &T) -> TrainResult<()> {
        let line = serde_json::to_string(record)
            .map_err(|e| TrainError::io(&self.path, std::io::Error::other(e)))?;
        writeln!(self.writer, "{line}").map_err(|e| TrainError::io(&self.path, e))
    }

    pub fn flush(&mut self) -> TrainResult<()> {
        self.writer
            .flush()
            .map_err(|e| TrainError::io(&self.path, e))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}
