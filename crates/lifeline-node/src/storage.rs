//! Snapshot persistence as a single JSON file.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use lifeline_heartbeat::Snapshot;
use tracing::{debug, warn};

use crate::error::Result;

pub const SNAPSHOT_FILE: &str = "heartbeat.json";

/// Storage backend for the heartbeat snapshot.
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    path: PathBuf,
}

impl SnapshotStore {
    /// Open or create storage under `data_dir`.
    pub fn open<P: AsRef<Path>>(data_dir: P) -> Result<Self> {
        fs::create_dir_all(data_dir.as_ref())?;
        Ok(Self {
            path: data_dir.as_ref().join(SNAPSHOT_FILE),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The stored snapshot, if there is a readable one.
    ///
    /// A corrupt file is logged and treated as absent.
    pub fn load(&self) -> Option<Snapshot> {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return None,
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "could not read snapshot");
                return None;
            }
        };

        match serde_json::from_slice(&bytes) {
            Ok(snapshot) => Some(snapshot),
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "ignoring corrupt snapshot");
                None
            }
        }
    }

    /// Replace the stored snapshot atomically.
    pub fn save(&self, snapshot: &Snapshot) -> Result<()> {
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(snapshot)?)?;
        fs::rename(&tmp, &self.path)?;
        debug!(path = %self.path.display(), "snapshot written");
        Ok(())
    }
}
