//! On-disk copy of the pending queue.
//!
//! A single JSON array of events at `<dir>/events.json`. Each write replaces
//! the whole file: the new content goes to a sibling temp file which is then
//! renamed over the old one, so a crash mid-write leaves the previous
//! snapshot intact.

use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use warden_core::error::{Result, WardenError};
use warden_core::types::Event;

pub const SNAPSHOT_FILE: &str = "events.json";

#[derive(Debug, Clone)]
pub struct Snapshot {
    path: PathBuf,
}

impl Snapshot {
    pub fn new(dir: &Path) -> Self {
        Self {
            path: dir.join(SNAPSHOT_FILE),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Read the snapshot. A missing file is an empty queue.
    pub fn load(&self) -> Result<Vec<Event>> {
        let data = match fs::read(&self.path) {
            Ok(data) => data,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        if data.iter().all(u8::is_ascii_whitespace) {
            return Ok(Vec::new());
        }
        serde_json::from_slice(&data).map_err(|e| {
            WardenError::Buffer(format!(
                "Corrupt snapshot {}: {}",
                self.path.display(),
                e
            ))
        })
    }

    /// Atomically replace the snapshot with `events`.
    pub fn save<'a>(&self, events: impl IntoIterator<Item = &'a Event>) -> Result<()> {
        let events: Vec<&Event> = events.into_iter().collect();
        let data = serde_json::to_vec(&events)?;

        let tmp = self.path.with_extension("json.tmp");
        {
            let mut file = open_private(&tmp)?;
            file.write_all(&data)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    /// Delete the snapshot. A missing file is not an error.
    pub fn remove(&self) -> Result<()> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(unix)]
fn open_private(path: &Path) -> std::io::Result<fs::File> {
    use std::os::unix::fs::OpenOptionsExt;
    fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)
}

#[cfg(not(unix))]
fn open_private(path: &Path) -> std::io::Result<fs::File> {
    fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)
}
