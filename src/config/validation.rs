use regex::Regex;
use std::collections::HashSet;
use std::sync::OnceLock;
use thiserror::Error;
use tracing::debug;

use super::templates;
use super::VmHubConfig;
use crate::utils::size::parse_size_mb;
use crate::vm::instance::VmConfig;

#[derive(Debug, Error, PartialEq)]
pub enum ValidationError {
    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Invalid field value: {0}")]
    InvalidValue(String),

    #[error("File does not exist: {0}")]
    FileNotFound(String),

    #[error("Unsupported value: {0}")]
    UnsupportedValue(String),
}

const MAX_NAME_LEN: usize = 64;

fn name_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9._-]*$").expect("static pattern"))
}

/// VM names become directory and file names, so they are kept to a safe charset.
pub fn validate_vm_name(name: &str) -> Result<(), ValidationError> {
    if name.is_empty() {
        return Err(ValidationError::MissingField("name".to_string()));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(ValidationError::InvalidValue(format!(
            "VM name '{}' is longer than {} characters",
            name, MAX_NAME_LEN
        )));
    }
    if !name_pattern().is_match(name) {
        return Err(ValidationError::InvalidValue(format!(
            "VM name '{}' must start with a letter or digit and contain only letters, digits, '.', '_' or '-'",
            name
        )));
    }
    Ok(())
}

pub fn validate_size(field: &str, value: &str) -> Result<(), ValidationError> {
    match parse_size_mb(value) {
        Some(_) => Ok(()),
        None => Err(ValidationError::InvalidValue(format!(
            "{} '{}' must look like <n>M, <n>G or <n>T",
            field, value
        ))),
    }
}

/// Structural checks on a creation request. Source resolution (ISO and
/// template lookup) happens separately, at create time.
pub fn validate_vm_config(config: &VmConfig) -> Result<(), ValidationError> {
    debug!("Validating VM configuration for {}", config.name);

    validate_vm_name(&config.name)?;
    validate_size("ram", &config.ram)?;
    validate_size("disk_size", &config.disk_size)?;

    if config.cpus == 0 {
        return Err(ValidationError::InvalidValue("cpus must be at least 1".to_string()));
    }

    if let Some(template) = &config.template {
        if templates::find(template).is_none() {
            return Err(ValidationError::UnsupportedValue(format!(
                "Unknown template: {}",
                template
            )));
        }
    }

    if let Some(iso) = &config.iso {
        if !iso.is_file() {
            return Err(ValidationError::FileNotFound(format!(
                "ISO file not found: {}",
                iso.display()
            )));
        }
    }

    if let Some(key) = &config.ssh_key {
        if !key.is_file() {
            return Err(ValidationError::FileNotFound(format!(
                "SSH key not found: {}",
                key.display()
            )));
        }
    }

    let mut host_ports = HashSet::new();
    for fwd in &config.network.forwards {
        if fwd.host == 0 || fwd.guest == 0 {
            return Err(ValidationError::InvalidValue(format!(
                "port forward {}:{} uses port 0",
                fwd.host, fwd.guest
            )));
        }
        if !host_ports.insert(fwd.host) {
            return Err(ValidationError::InvalidValue(format!(
                "host port {} is forwarded more than once",
                fwd.host
            )));
        }
    }

    if let Some(ip) = &config.network.ip {
        if ip.parse::<std::net::IpAddr>().is_err() {
            return Err(ValidationError::InvalidValue(format!("Invalid static IP: {}", ip)));
        }
    }

    debug!("VM configuration validation passed");
    Ok(())
}

pub fn validate_settings(config: &VmHubConfig) -> Result<(), ValidationError> {
    validate_size("defaults.ram", &config.defaults.ram)?;
    validate_size("defaults.disk", &config.defaults.disk)?;
    if config.defaults.cpus == 0 {
        return Err(ValidationError::InvalidValue("defaults.cpus must be at least 1".to_string()));
    }
    if config.ssh.user.is_empty() {
        return Err(ValidationError::MissingField("ssh.user".to_string()));
    }
    if config.ssh.wait_timeout_secs == 0 {
        return Err(ValidationError::InvalidValue(
            "ssh.wait_timeout_secs must be at least 1".to_string(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::instance::PortForward;
    use rstest::rstest;

    #[rstest]
    #[case("web")]
    #[case("web-01")]
    #[case("db_primary.v2")]
    #[case("9lives")]
    fn accepts_reasonable_names(#[case] name: &str) {
        assert!(validate_vm_name(name).is_ok());
    }

    #[rstest]
    #[case("")]
    #[case("-leading-dash")]
    #[case("has space")]
    #[case("../escape")]
    #[case("semi;colon")]
    fn rejects_unsafe_names(#[case] name: &str) {
        assert!(validate_vm_name(name).is_err());
    }

    #[test]
    fn rejects_overlong_names() {
        assert!(validate_vm_name(&"a".repeat(65)).is_err());
        assert!(validate_vm_name(&"a".repeat(64)).is_ok());
    }

    #[test]
    fn duplicate_host_ports_are_rejected() {
        let mut config = VmConfig::new("web");
        config.network.forwards = vec![
            "8080:80".parse::<PortForward>().unwrap(),
            "8080:8080/udp".parse::<PortForward>().unwrap(),
        ];
        let err = validate_vm_config(&config).unwrap_err();
        assert!(err.to_string().contains("8080"));
    }

    #[test]
    fn sizes_and_cpus_are_checked() {
        let mut config = VmConfig::new("web");
        config.ram = "lots".to_string();
        assert!(validate_vm_config(&config).is_err());

        let mut config = VmConfig::new("web");
        config.cpus = 0;
        assert!(validate_vm_config(&config).is_err());

        assert!(validate_vm_config(&VmConfig::new("web")).is_ok());
    }

    #[test]
    fn missing_iso_is_reported() {
        let mut config = VmConfig::new("web");
        config.iso = Some("/definitely/not/here.iso".into());
        assert!(matches!(
            validate_vm_config(&config),
            Err(ValidationError::FileNotFound(_))
        ));
    }
}
