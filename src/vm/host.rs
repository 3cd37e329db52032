//! Host readiness: hardware acceleration plus which drivers can run.

use serde::Serialize;
use std::fs::OpenOptions;
use std::io::ErrorKind as IoErrorKind;
use std::path::Path;
use tracing::debug;

use super::manager::BackendStatus;

pub const KVM_DEVICE: &str = "/dev/kvm";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct KvmStatus {
    /// The device node exists.
    pub present: bool,
    /// The current user can open it read-write.
    pub accessible: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl KvmStatus {
    pub fn usable(&self) -> bool {
        self.present && self.accessible
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HostReport {
    pub os: &'static str,
    pub arch: &'static str,
    pub kvm: KvmStatus,
    pub backends: Vec<BackendStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recommended: Option<&'static str>,
}

pub fn kvm_status() -> KvmStatus {
    kvm_status_at(Path::new(KVM_DEVICE))
}

pub fn kvm_status_at(device: &Path) -> KvmStatus {
    if !device.exists() {
        return KvmStatus {
            present: false,
            accessible: false,
            detail: Some(format!(
                "{} not found; enable virtualization in firmware and load kvm_intel or kvm_amd",
                device.display()
            )),
        };
    }
    match OpenOptions::new().read(true).write(true).open(device) {
        Ok(_) => KvmStatus {
            present: true,
            accessible: true,
            detail: None,
        },
        Err(e) => {
            debug!("cannot open {}: {}", device.display(), e);
            let detail = if e.kind() == IoErrorKind::PermissionDenied {
                format!("{} is not accessible; add the user to the kvm group", device.display())
            } else {
                format!("{}: {}", device.display(), e)
            };
            KvmStatus {
                present: true,
                accessible: false,
                detail: Some(detail),
            }
        }
    }
}

impl HostReport {
    pub fn new(kvm: KvmStatus, backends: Vec<BackendStatus>) -> Self {
        let recommended = backends.iter().find(|b| b.preferred).map(|b| b.name);
        Self {
            os: std::env::consts::OS,
            arch: std::env::consts::ARCH,
            kvm,
            backends,
            recommended,
        }
    }

    /// Problems worth showing next to the report.
    pub fn warnings(&self) -> Vec<String> {
        let mut out = Vec::new();
        if !self.kvm.usable() && self.os == "linux" {
            out.push(
                "QEMU and libvirt guests will run without hardware acceleration".to_string(),
            );
        }
        if !self.backends.iter().any(|b| b.available) {
            out.push("No backend is available; install libvirt, QEMU or VirtualBox".to_string());
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status(name: &'static str, available: bool, preferred: bool) -> BackendStatus {
        BackendStatus {
            name,
            available,
            preferred,
            version: None,
            version_error: None,
        }
    }

    #[test]
    fn missing_device_is_not_present() {
        let dir = tempfile::tempdir().unwrap();
        let kvm = kvm_status_at(&dir.path().join("kvm"));
        assert!(!kvm.present);
        assert!(!kvm.usable());
        assert!(kvm.detail.unwrap().contains("not found"));
    }

    #[test]
    fn openable_device_is_usable() {
        let dir = tempfile::tempdir().unwrap();
        let device = dir.path().join("kvm");
        std::fs::write(&device, b"").unwrap();
        let kvm = kvm_status_at(&device);
        assert!(kvm.usable());
        assert_eq!(kvm.detail, None);
    }

    #[cfg(unix)]
    #[test]
    fn unopenable_device_is_present_but_inaccessible() {
        // A directory exists but cannot be opened for writing, whoever we are.
        let dir = tempfile::tempdir().unwrap();
        let kvm = kvm_status_at(dir.path());
        assert!(kvm.present);
        assert!(!kvm.accessible);
        assert!(kvm.detail.is_some());
    }

    #[test]
    fn recommendation_follows_the_preferred_driver() {
        let kvm = KvmStatus {
            present: true,
            accessible: true,
            detail: None,
        };
        let report = HostReport::new(
            kvm,
            vec![status("libvirt", false, false), status("qemu", true, true)],
        );
        assert_eq!(report.recommended, Some("qemu"));
        assert!(report.warnings().is_empty());
    }

    #[test]
    fn bare_host_warns() {
        let kvm = kvm_status_at(Path::new("/nonexistent/kvm"));
        let report = HostReport::new(kvm, vec![status("qemu", false, false)]);
        assert_eq!(report.recommended, None);
        assert!(report.warnings().iter().any(|w| w.contains("No backend")));
    }
}
