//! Permission tiers gating every command before it reaches a backend.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::vm::error::{Result, VmError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PermissionLevel {
    Limited,
    Standard,
    Full,
}

impl fmt::Display for PermissionLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            PermissionLevel::Limited => "limited",
            PermissionLevel::Standard => "standard",
            PermissionLevel::Full => "full",
        })
    }
}

impl FromStr for PermissionLevel {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "limited" => Ok(PermissionLevel::Limited),
            "standard" => Ok(PermissionLevel::Standard),
            "full" => Ok(PermissionLevel::Full),
            other => Err(format!("unknown permission level: {other}")),
        }
    }
}

/// Everything a handler can be asked to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    List,
    Info,
    State,
    SshCheck,
    Backends,
    Templates,
    Check,
    Iso,
    Start,
    Stop,
    Restart,
    Suspend,
    Resume,
    Snapshot,
    Ssh,
    Copy,
    Create,
    Delete,
}

impl Action {
    pub fn required(self) -> PermissionLevel {
        match self {
            Action::List
            | Action::Info
            | Action::State
            | Action::SshCheck
            | Action::Backends
            | Action::Templates
            | Action::Check
            | Action::Iso => PermissionLevel::Limited,
            Action::Start
            | Action::Stop
            | Action::Restart
            | Action::Suspend
            | Action::Resume
            | Action::Snapshot
            | Action::Ssh
            | Action::Copy => PermissionLevel::Standard,
            Action::Create | Action::Delete => PermissionLevel::Full,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Action::List => "list",
            Action::Info => "info",
            Action::State => "state",
            Action::SshCheck => "ssh_check",
            Action::Backends => "backends",
            Action::Templates => "templates",
            Action::Check => "check",
            Action::Iso => "iso",
            Action::Start => "start",
            Action::Stop => "stop",
            Action::Restart => "restart",
            Action::Suspend => "suspend",
            Action::Resume => "resume",
            Action::Snapshot => "snapshot",
            Action::Ssh => "ssh",
            Action::Copy => "copy",
            Action::Create => "create",
            Action::Delete => "delete",
        }
    }
}

pub fn has_permission(level: PermissionLevel, action: Action) -> bool {
    level >= action.required()
}

pub fn check(level: PermissionLevel, action: Action) -> Result<()> {
    if has_permission(level, action) {
        Ok(())
    } else {
        Err(VmError::PermissionDenied {
            action: action.as_str().to_string(),
            required: action.required().to_string(),
            current: level.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::error::ErrorKind;
    use rstest::rstest;

    #[rstest]
    #[case(PermissionLevel::Limited, Action::List, true)]
    #[case(PermissionLevel::Limited, Action::Info, true)]
    #[case(PermissionLevel::Limited, Action::Check, true)]
    #[case(PermissionLevel::Limited, Action::Iso, true)]
    #[case(PermissionLevel::Limited, Action::Start, false)]
    #[case(PermissionLevel::Standard, Action::Snapshot, true)]
    #[case(PermissionLevel::Standard, Action::Create, false)]
    #[case(PermissionLevel::Standard, Action::Delete, false)]
    #[case(PermissionLevel::Full, Action::Delete, true)]
    fn tiers_are_ordered(#[case] level: PermissionLevel, #[case] action: Action, #[case] allowed: bool) {
        assert_eq!(has_permission(level, action), allowed);
    }

    #[test]
    fn denial_names_the_required_tier() {
        let err = check(PermissionLevel::Limited, Action::Create).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PermissionDenied);
        assert!(err.to_string().contains("full"));
    }
}
