//! Conventional on-disk layout: `<vm_root>/<name>/<name>.qcow2`,
//! `<vm_root>/<name>/run-<name>.sh`, plus the sidecars the drivers keep.

use std::path::{Path, PathBuf};

use crate::utils::vm_metadata::METADATA_FILE;

#[derive(Debug, Clone)]
pub struct VmPaths {
    pub name: String,
    pub dir: PathBuf,
}

impl VmPaths {
    pub fn new(vm_root: &Path, name: &str) -> Self {
        Self {
            name: name.to_string(),
            dir: vm_root.join(name),
        }
    }

    pub fn disk(&self) -> PathBuf {
        self.dir.join(format!("{}.qcow2", self.name))
    }

    pub fn vdi(&self) -> PathBuf {
        self.dir.join(format!("{}.vdi", self.name))
    }

    pub fn script(&self) -> PathBuf {
        self.dir.join(format!("run-{}.sh", self.name))
    }

    pub fn metadata(&self) -> PathBuf {
        self.dir.join(METADATA_FILE)
    }

    pub fn pidfile(&self) -> PathBuf {
        self.dir.join("qemu.pid")
    }

    pub fn monitor(&self) -> PathBuf {
        self.dir.join("monitor.sock")
    }

    pub fn console_log(&self) -> PathBuf {
        self.dir.join("console.log")
    }

    pub fn vbox_file(&self) -> PathBuf {
        self.dir.join(format!("{}.vbox", self.name))
    }

    pub fn exists(&self) -> bool {
        self.dir.is_dir()
    }

    /// A directory left behind by `delete(keep_disk = true)`: a disk image
    /// and nothing that defines a VM around it.
    pub fn is_orphan_disk(&self) -> bool {
        self.exists()
            && (self.disk().is_file() || self.vdi().is_file())
            && !self.metadata().exists()
            && !self.script().exists()
            && !self.vbox_file().exists()
    }

    /// Any file that marks this directory as a VM somebody created.
    pub fn has_vm_markers(&self) -> bool {
        self.metadata().exists()
            || self.script().exists()
            || self.disk().exists()
            || self.vdi().exists()
            || self.vbox_file().exists()
    }

    /// Remove everything in the VM directory except the disk images.
    pub fn remove_all_but_disks(&self) -> std::io::Result<()> {
        let keep = [self.disk(), self.vdi()];
        for entry in std::fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if keep.contains(&path) {
                continue;
            }
            if path.is_dir() {
                std::fs::remove_dir_all(&path)?;
            } else {
                std::fs::remove_file(&path)?;
            }
        }
        Ok(())
    }
}

/// Names of every directory under `vm_root` that looks like a VM.
pub fn scan(vm_root: &Path) -> Vec<String> {
    let Ok(entries) = std::fs::read_dir(vm_root) else {
        return Vec::new();
    };
    let mut names: Vec<String> = entries
        .filter_map(|e| e.ok())
        .filter(|e| e.path().is_dir())
        .filter_map(|e| e.file_name().into_string().ok())
        .filter(|name| VmPaths::new(vm_root, name).has_vm_markers())
        .collect();
    names.sort();
    names
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keep_disk_leaves_an_orphan() {
        let root = tempfile::tempdir().unwrap();
        let paths = VmPaths::new(root.path(), "web");
        std::fs::create_dir_all(&paths.dir).unwrap();
        std::fs::write(paths.disk(), b"qcow").unwrap();
        std::fs::write(paths.script(), b"#!/bin/bash\n").unwrap();
        std::fs::write(paths.metadata(), b"{}").unwrap();
        assert!(!paths.is_orphan_disk());

        paths.remove_all_but_disks().unwrap();
        assert!(paths.is_orphan_disk());
        assert!(paths.disk().exists());
    }

    #[test]
    fn scan_ignores_unrelated_directories() {
        let root = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(root.path().join("notes")).unwrap();
        let vm = VmPaths::new(root.path(), "db");
        std::fs::create_dir_all(&vm.dir).unwrap();
        std::fs::write(vm.script(), b"#!/bin/bash\n").unwrap();

        assert_eq!(scan(root.path()), vec!["db".to_string()]);
        assert!(scan(&root.path().join("missing")).is_empty());
    }
}
