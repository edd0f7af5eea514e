// src/tracker/journal.rs

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use super::TrackerError;
use crate::engine::{Job, JobId};

/// Append-only JSON-lines log of job records. The last line for a job id
/// wins on replay.
pub struct Journal {
    path: PathBuf,
    writer: BufWriter<File>,
}

impl Journal {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, TrackerError> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            path,
            writer: BufWriter::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&mut self, job: &Job) -> Result<(), TrackerError> {
        serde_json::to_writer(&mut self.writer, job)?;
        self.writer.write_all(b"\n")?;
        self.writer.flush()?;
        Ok(())
    }
}

/// Rebuild the latest record of every job from the journal at `path`.
///
/// A missing journal is an empty table. Undecodable lines (e.g. a torn final
/// write) are skipped with a warning.
pub fn replay(path: &Path) -> Result<HashMap<JobId, Job>, TrackerError> {
    let mut jobs = HashMap::new();
    if !path.exists() {
        return Ok(jobs);
    }

    let reader = BufReader::new(File::open(path)?);
    for (lineno, line) in reader.lines().enumerate() {
        let line = line?;
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        match serde_json::from_str::<Job>(trimmed) {
            Ok(job) => {
                jobs.insert(job.id(), job);
            }
            Err(e) => {
                warn!(path = ?path, line = lineno + 1, error = %e, "skipping bad journal line");
            }
        }
    }

    debug!(path = ?path, jobs = jobs.len(), "journal replayed");
    Ok(jobs)
}
