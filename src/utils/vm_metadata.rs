//! `vm.json` and `snapshots.json` sidecars kept inside each VM directory.
//!
//! Sidecars are written through a temp file in the same directory and then
//! renamed over the target, so a crash never leaves a truncated file behind.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::vm::instance::{BackendKind, VmConfig};

pub const METADATA_FILE: &str = "vm.json";
pub const SNAPSHOT_NOTES_FILE: &str = "snapshots.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmMetadata {
    pub backend: BackendKind,
    pub config: VmConfig,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_started: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssh_port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vnc_port: Option<u16>,
    /// Present while the VM is defined with a booting ISO attached.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub boot_iso: Option<PathBuf>,
    /// Set once the `post_create` commands have run.
    #[serde(default)]
    pub provisioned: bool,
}

impl VmMetadata {
    pub fn new(backend: BackendKind, config: VmConfig) -> Self {
        Self {
            backend,
            config,
            created_at: Utc::now(),
            last_started: None,
            ssh_port: None,
            vnc_port: None,
            boot_iso: None,
            provisioned: false,
        }
    }

    pub fn path(vm_dir: &Path) -> PathBuf {
        vm_dir.join(METADATA_FILE)
    }

    /// `Ok(None)` when there is no sidecar. A corrupt sidecar is logged and
    /// also treated as absent so that discovery degrades instead of failing.
    pub fn load(vm_dir: &Path) -> io::Result<Option<Self>> {
        let path = Self::path(vm_dir);
        match read_json::<Self>(&path) {
            Ok(meta) => Ok(meta),
            Err(e) if e.kind() == io::ErrorKind::InvalidData => {
                warn!("ignoring unreadable {}: {}", path.display(), e);
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    pub fn save(&self, vm_dir: &Path) -> io::Result<()> {
        write_json_atomic(&Self::path(vm_dir), self)?;
        debug!("saved metadata for {} ({})", self.config.name, self.backend);
        Ok(())
    }

    pub fn touch_started(vm_dir: &Path) -> io::Result<()> {
        if let Some(mut meta) = Self::load(vm_dir)? {
            meta.last_started = Some(Utc::now());
            meta.save(vm_dir)?;
        }
        Ok(())
    }
}

/// Descriptions for snapshots whose tool has no place to store them.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct SnapshotNotes {
    #[serde(default)]
    pub notes: BTreeMap<String, SnapshotNote>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotNote {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl SnapshotNotes {
    pub fn load(vm_dir: &Path) -> Self {
        let path = vm_dir.join(SNAPSHOT_NOTES_FILE);
        match read_json::<Self>(&path) {
            Ok(notes) => notes.unwrap_or_default(),
            Err(e) => {
                warn!("ignoring unreadable {}: {}", path.display(), e);
                Self::default()
            }
        }
    }

    pub fn save(&self, vm_dir: &Path) -> io::Result<()> {
        write_json_atomic(&vm_dir.join(SNAPSHOT_NOTES_FILE), self)
    }
}

fn read_json<T: DeserializeOwned>(path: &Path) -> io::Result<Option<T>> {
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e),
    };
    serde_json::from_str(&content)
        .map(Some)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> io::Result<()> {
    let dir = path
        .parent()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "metadata path has no parent"))?;
    let content = serde_json::to_vec_pretty(value)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(&content)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metadata_round_trips_and_tracks_last_start() {
        let dir = tempfile::tempdir().unwrap();
        assert!(VmMetadata::load(dir.path()).unwrap().is_none());

        let mut meta = VmMetadata::new(BackendKind::Qemu, VmConfig::new("web"));
        meta.ssh_port = Some(22022);
        meta.save(dir.path()).unwrap();

        VmMetadata::touch_started(dir.path()).unwrap();
        let loaded = VmMetadata::load(dir.path()).unwrap().unwrap();
        assert_eq!(loaded.backend, BackendKind::Qemu);
        assert_eq!(loaded.ssh_port, Some(22022));
        assert!(loaded.last_started.is_some());
        assert_eq!(loaded.created_at, meta.created_at);
    }

    #[test]
    fn corrupt_sidecar_reads_as_absent() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(METADATA_FILE), "{not json").unwrap();
        assert!(VmMetadata::load(dir.path()).unwrap().is_none());
        assert!(SnapshotNotes::load(dir.path()).notes.is_empty());
    }
}
