//! Built-in installation templates and source resolution for `create`.

use serde::Serialize;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Clone, Serialize)]
pub struct VmTemplate {
    pub name: &'static str,
    pub description: &'static str,
    pub iso: &'static str,
    pub os_type: &'static str,
    pub os_variant: &'static str,
    pub ram: &'static str,
    pub disk_size: &'static str,
    pub cpus: u32,
    pub features: &'static [&'static str],
}

pub const TEMPLATES: &[VmTemplate] = &[
    VmTemplate {
        name: "ubuntu-24.04",
        description: "Ubuntu 24.04 LTS Desktop",
        iso: "ubuntu-24.04-desktop-amd64.iso",
        os_type: "ubuntu",
        os_variant: "ubuntu24.04",
        ram: "4G",
        disk_size: "25G",
        cpus: 2,
        features: &["desktop", "gnome"],
    },
    VmTemplate {
        name: "ubuntu-22.04",
        description: "Ubuntu 22.04 LTS Desktop",
        iso: "ubuntu-22.04-desktop-amd64.iso",
        os_type: "ubuntu",
        os_variant: "ubuntu22.04",
        ram: "4G",
        disk_size: "25G",
        cpus: 2,
        features: &["desktop", "gnome"],
    },
    VmTemplate {
        name: "ubuntu-22.04-server",
        description: "Ubuntu 22.04 LTS Server",
        iso: "ubuntu-22.04-live-server-amd64.iso",
        os_type: "ubuntu",
        os_variant: "ubuntu22.04",
        ram: "2G",
        disk_size: "20G",
        cpus: 2,
        features: &["server", "cloud-init"],
    },
    VmTemplate {
        name: "debian-12",
        description: "Debian 12 (bookworm)",
        iso: "debian-12-amd64-netinst.iso",
        os_type: "debian",
        os_variant: "debian12",
        ram: "2G",
        disk_size: "20G",
        cpus: 2,
        features: &["server"],
    },
    VmTemplate {
        name: "windows11",
        description: "Windows 11",
        iso: "Win11_English_x64.iso",
        os_type: "windows",
        os_variant: "win11",
        ram: "8G",
        disk_size: "64G",
        cpus: 4,
        features: &["tpm", "uefi", "secure-boot"],
    },
    VmTemplate {
        name: "windows10",
        description: "Windows 10",
        iso: "Win10_English_x64.iso",
        os_type: "windows",
        os_variant: "win10",
        ram: "4G",
        disk_size: "50G",
        cpus: 2,
        features: &["uefi"],
    },
];

pub fn find(name: &str) -> Option<&'static VmTemplate> {
    TEMPLATES.iter().find(|t| t.name.eq_ignore_ascii_case(name))
}

/// Template used when only an OS type is given.
pub fn default_for_os(os_type: &str) -> Option<&'static VmTemplate> {
    let os = os_type.to_lowercase();
    let name = if os.starts_with("ubuntu") {
        "ubuntu-24.04"
    } else if os.starts_with("debian") {
        "debian-12"
    } else if os.starts_with("windows") {
        "windows11"
    } else {
        return None;
    };
    find(name)
}

/// Where the installation media for a new VM comes from.
#[derive(Debug, Clone, PartialEq)]
pub enum Source {
    Iso(PathBuf),
    /// A template matched but its ISO is not downloaded; the VM boots from disk.
    DiskOnly { template: &'static str, missing: PathBuf },
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum SourceError {
    #[error("ISO file not found: {}", .0.display())]
    IsoMissing(PathBuf),
    #[error("unknown template '{0}' (see `vmhub vm templates`)")]
    UnknownTemplate(String),
    #[error("no installation source for os type '{0}'; pass --iso or --template")]
    Unresolvable(String),
}

/// Explicit ISO, then the template's ISO, then the OS type's default
/// template. An explicit ISO must exist; a template ISO that is absent is
/// only a warning.
pub fn resolve_source(
    iso: Option<&Path>,
    template: Option<&str>,
    os_type: &str,
    iso_dir: &Path,
) -> Result<Source, SourceError> {
    if let Some(iso) = iso {
        return if iso.is_file() {
            Ok(Source::Iso(iso.to_path_buf()))
        } else {
            Err(SourceError::IsoMissing(iso.to_path_buf()))
        };
    }

    let tpl = match template {
        Some(name) => find(name).ok_or_else(|| SourceError::UnknownTemplate(name.to_string()))?,
        None => default_for_os(os_type).ok_or_else(|| SourceError::Unresolvable(os_type.to_string()))?,
    };
    let path = iso_dir.join(tpl.iso);
    if path.is_file() {
        Ok(Source::Iso(path))
    } else {
        warn!(
            "ISO for template {} not found at {}; the VM will boot from disk",
            tpl.name,
            path.display()
        );
        Ok(Source::DiskOnly {
            template: tpl.name,
            missing: path,
        })
    }
}

/// One catalogue ISO and whether it is present under the ISO directory.
#[derive(Debug, Clone, Serialize)]
pub struct IsoEntry {
    pub template: &'static str,
    pub iso: &'static str,
    pub path: PathBuf,
    pub downloaded: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size_bytes: Option<u64>,
}

pub fn iso_catalogue(iso_dir: &Path) -> Vec<IsoEntry> {
    TEMPLATES
        .iter()
        .map(|t| {
            let path = iso_dir.join(t.iso);
            let size_bytes = std::fs::metadata(&path).ok().filter(|m| m.is_file()).map(|m| m.len());
            IsoEntry {
                template: t.name,
                iso: t.iso,
                downloaded: size_bytes.is_some(),
                size_bytes,
                path,
            }
        })
        .collect()
}

/// A template name resolves to its ISO under `iso_dir`; anything else is a
/// path.
pub fn iso_path(target: &str, iso_dir: &Path) -> PathBuf {
    match find(target) {
        Some(t) => iso_dir.join(t.iso),
        None => PathBuf::from(target),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("ubuntu", Some("ubuntu-24.04"))]
    #[case("Debian", Some("debian-12"))]
    #[case("windows", Some("windows11"))]
    #[case("freebsd", None)]
    fn os_type_defaults(#[case] os: &str, #[case] expected: Option<&str>) {
        assert_eq!(default_for_os(os).map(|t| t.name), expected);
    }

    #[test]
    fn explicit_iso_must_exist() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope.iso");
        assert_eq!(
            resolve_source(Some(&missing), None, "ubuntu", dir.path()),
            Err(SourceError::IsoMissing(missing))
        );
    }

    #[test]
    fn template_iso_is_found_in_iso_dir() {
        let dir = tempfile::tempdir().unwrap();
        let iso = dir.path().join("debian-12-amd64-netinst.iso");
        std::fs::write(&iso, b"iso").unwrap();
        assert_eq!(
            resolve_source(None, Some("debian-12"), "generic", dir.path()),
            Ok(Source::Iso(iso))
        );
    }

    #[test]
    fn missing_template_iso_degrades_to_disk_boot() {
        let dir = tempfile::tempdir().unwrap();
        let source = resolve_source(None, None, "ubuntu", dir.path()).unwrap();
        assert!(matches!(source, Source::DiskOnly { template: "ubuntu-24.04", .. }));
    }

    #[test]
    fn nothing_resolvable_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            resolve_source(None, None, "generic", dir.path()),
            Err(SourceError::Unresolvable(_))
        ));
        assert!(matches!(
            resolve_source(None, Some("plan9"), "generic", dir.path()),
            Err(SourceError::UnknownTemplate(_))
        ));
    }

    #[test]
    fn catalogue_reports_downloaded_isos() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("debian-12-amd64-netinst.iso"), b"iso").unwrap();
        // A directory with the right name is not a download.
        std::fs::create_dir(dir.path().join("Win10_English_x64.iso")).unwrap();

        let entries = iso_catalogue(dir.path());
        assert_eq!(entries.len(), TEMPLATES.len());
        let debian = entries.iter().find(|e| e.template == "debian-12").unwrap();
        assert!(debian.downloaded);
        assert_eq!(debian.size_bytes, Some(3));
        let win10 = entries.iter().find(|e| e.template == "windows10").unwrap();
        assert!(!win10.downloaded);
        assert_eq!(entries.iter().filter(|e| e.downloaded).count(), 1);
    }

    #[test]
    fn iso_target_by_template_or_path() {
        let dir = Path::new("/isos");
        assert_eq!(iso_path("debian-12", dir), dir.join("debian-12-amd64-netinst.iso"));
        assert_eq!(iso_path("/tmp/custom.iso", dir), PathBuf::from("/tmp/custom.iso"));
    }
}
