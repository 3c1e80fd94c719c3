//! First-start provisioning marker
//!
//! Written once model provisioning has finished so later starts skip the
//! `/api/tags` round trip.

use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarkerContents {
    pub model: String,
    pub completed_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct ProvisioningMarker {
    path: PathBuf,
}

impl ProvisioningMarker {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_complete(&self) -> bool {
        self.path.is_file()
    }

    pub fn read(&self) -> io::Result<MarkerContents> {
        let raw = std::fs::read_to_string(&self.path)?;
        serde_json::from_str(&raw).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }

    /// Atomically write the marker (temp file + rename)
    pub fn mark_complete(&self, model: &str) -> io::Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = MarkerContents {
            model: model.to_string(),
            completed_at: Utc::now(),
        };
        let json = serde_json::to_string_pretty(&contents)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, &self.path)
    }
}
