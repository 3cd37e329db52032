use clap::Subcommand;
use serde::Serialize;
use std::path::PathBuf;

use vmhub::config::templates::{IsoEntry, VmTemplate};
use vmhub::handlers::{SnapshotAction, SnapshotResult};
use vmhub::utils::checksum::Verification;
use vmhub::utils::size::format_bytes;
use vmhub::vm::{BackendStatus, HostReport, NetworkMode, PortForward, VmInfo};

#[derive(Subcommand)]
pub enum Commands {
    /// Manage virtual machines
    Vm {
        #[command(subcommand)]
        command: VmCommands,
    },
    /// Model Context Protocol server
    Mcp {
        #[command(subcommand)]
        command: McpCommands,
    },
}

#[derive(Subcommand)]
pub enum McpCommands {
    /// Serve JSON-RPC on stdin/stdout
    Serve,
}

#[derive(Subcommand)]
pub enum VmCommands {
    /// List all VMs known to any backend or found on disk
    List,
    /// Create a new VM
    Create {
        name: String,
        /// Operating system type (ubuntu, debian, windows, ...)
        #[arg(long = "os")]
        os_type: Option<String>,
        /// Built-in template (see `vm templates`)
        #[arg(long)]
        template: Option<String>,
        /// Installation ISO
        #[arg(long)]
        iso: Option<PathBuf>,
        #[arg(long)]
        ram: Option<String>,
        #[arg(long)]
        disk_size: Option<String>,
        #[arg(long)]
        cpus: Option<u32>,
        #[arg(long, value_parser = parse_network)]
        network: Option<NetworkMode>,
        /// Host bridge for `--network bridge`
        #[arg(long)]
        bridge: Option<String>,
        /// Port forward host:guest[/proto], repeatable
        #[arg(long = "forward", value_parser = parse_forward)]
        forwards: Vec<PortForward>,
        #[arg(long)]
        ssh_key: Option<PathBuf>,
        /// Do not forward an SSH port
        #[arg(long)]
        no_ssh: bool,
        /// Command run over SSH after the first boot, repeatable
        #[arg(long = "post-create")]
        post_create: Vec<String>,
    },
    /// Start a VM
    Start {
        name: String,
        /// Wait until SSH answers, then run post-create commands
        #[arg(long)]
        wait_ssh: bool,
        /// SSH wait budget in seconds
        #[arg(long)]
        timeout: Option<u64>,
    },
    /// Stop a VM
    Stop {
        name: String,
        #[arg(short, long)]
        force: bool,
    },
    Restart {
        name: String,
    },
    Suspend {
        name: String,
    },
    Resume {
        name: String,
    },
    /// Delete a VM
    Delete {
        name: String,
        /// Keep the disk image for later re-registration
        #[arg(long)]
        keep_disk: bool,
    },
    /// Show VM details
    Info {
        name: String,
    },
    /// Print the VM state only
    State {
        name: String,
    },
    /// Manage snapshots
    Snapshot {
        name: String,
        #[arg(long, value_enum)]
        action: SnapshotAction,
        #[arg(long)]
        snapshot: Option<String>,
        #[arg(long)]
        description: Option<String>,
    },
    /// Open an SSH session or run a command in a VM
    Ssh {
        name: String,
        #[arg(short, long)]
        command: Option<String>,
        #[arg(short, long)]
        user: Option<String>,
        /// Readiness wait budget in seconds
        #[arg(long)]
        timeout: Option<u64>,
        #[arg(long)]
        no_wait: bool,
        #[arg(long)]
        auto_start: bool,
        /// Only report whether SSH is reachable
        #[arg(long)]
        check: bool,
    },
    /// Copy files to or from a VM with scp
    Copy {
        name: String,
        src: String,
        dst: String,
        /// Copy from the VM to the host
        #[arg(long)]
        from_vm: bool,
        #[arg(short, long)]
        user: Option<String>,
    },
    /// Report backend availability
    Backends {
        /// Also query each available tool for its version
        #[arg(long)]
        versions: bool,
    },
    /// List built-in templates
    Templates,
    /// Check hardware acceleration and installed backends
    Check {
        /// Also query each available tool for its version
        #[arg(long)]
        versions: bool,
    },
    /// Installation media for the built-in templates
    Iso {
        #[command(subcommand)]
        command: IsoCommands,
    },
}

#[derive(Subcommand)]
pub enum IsoCommands {
    /// Show which template ISOs are present in the ISO directory
    List,
    /// Hash an ISO and compare it with a known digest
    Verify {
        /// Template name or path to an ISO file
        target: String,
        /// Expected SHA-256 or SHA-512 digest (hex). Without it, a
        /// `<file>.sha256` sidecar or SHA256SUMS beside the file is used
        #[arg(long)]
        sha: Option<String>,
    },
}

fn parse_network(s: &str) -> Result<NetworkMode, String> {
    s.parse()
}

fn parse_forward(s: &str) -> Result<PortForward, String> {
    s.parse()
}

pub fn print_json<T: Serialize>(value: &T) {
    match serde_json::to_string_pretty(value) {
        Ok(text) => println!("{text}"),
        Err(e) => eprintln!("failed to encode output: {e}"),
    }
}

pub fn print_vm_table(vms: &[VmInfo]) {
    if vms.is_empty() {
        println!("No VMs found.");
        return;
    }
    println!("{:<24} {:<12} {:<12} {:<6} {:<6} {}", "NAME", "STATE", "BACKEND", "RAM", "CPUS", "IP");
    for vm in vms {
        println!(
            "{:<24} {:<12} {:<12} {:<6} {:<6} {}",
            vm.name,
            vm.state,
            vm.backend,
            vm.ram.as_deref().unwrap_or("-"),
            vm.cpus.map(|c| c.to_string()).unwrap_or_else(|| "-".to_string()),
            vm.ip.as_deref().unwrap_or("-"),
        );
        if let Some(detail) = &vm.error_detail {
            println!("  ! {detail}");
        }
    }
}

pub fn print_vm_info(vm: &VmInfo) {
    println!("Name:      {}", vm.name);
    println!("State:     {}", vm.state);
    println!("Backend:   {}", vm.backend);
    let rows = [
        ("RAM", vm.ram.clone()),
        ("CPUs", vm.cpus.map(|c| c.to_string())),
        ("Disk", vm.disk_size.clone()),
        ("OS", vm.os_type.clone()),
        ("IP", vm.ip.clone()),
        ("VNC port", vm.vnc_port.map(|p| p.to_string())),
        ("Created", vm.created_at.map(|t| t.to_rfc3339())),
        ("Started", vm.last_started.map(|t| t.to_rfc3339())),
        ("Path", vm.path.as_ref().map(|p| p.display().to_string())),
        ("Note", vm.error_detail.clone()),
    ];
    for (label, value) in rows {
        if let Some(value) = value {
            println!("{:<10} {}", format!("{label}:"), value);
        }
    }
}

pub fn print_snapshot_result(result: &SnapshotResult) {
    match result {
        SnapshotResult::Created { vm, snapshot, backend } => {
            println!("Created snapshot '{snapshot}' of {vm} ({backend})")
        }
        SnapshotResult::Restored { vm, snapshot, backend } => {
            println!("Restored {vm} to snapshot '{snapshot}' ({backend})")
        }
        SnapshotResult::Deleted { vm, snapshot, backend } => {
            println!("Deleted snapshot '{snapshot}' of {vm} ({backend})")
        }
        SnapshotResult::Listed { vm, snapshots } => {
            if snapshots.is_empty() {
                println!("{vm} has no snapshots.");
                return;
            }
            println!("{:<20} {:<20} {:<26} {}", "NAME", "PARENT", "CREATED", "DESCRIPTION");
            for s in snapshots {
                println!(
                    "{:<20} {:<20} {:<26} {}",
                    s.name,
                    s.parent.as_deref().unwrap_or("-"),
                    s.created_at.map(|t| t.to_rfc3339()).unwrap_or_else(|| "-".to_string()),
                    s.description.as_deref().unwrap_or(""),
                );
            }
        }
    }
}

pub fn print_backends(report: &[BackendStatus]) {
    for b in report {
        let status = if b.available { "available" } else { "not installed" };
        let marker = if b.preferred { " (preferred)" } else { "" };
        match (&b.version, &b.version_error) {
            (Some(v), _) => println!("{:<12} {}{} - {}", b.name, status, marker, v),
            (None, Some(e)) => println!("{:<12} {}{} - version unknown: {}", b.name, status, marker, e),
            (None, None) => println!("{:<12} {}{}", b.name, status, marker),
        }
    }
    if !report.iter().any(|b| b.available) {
        println!("No backend is available; only VM directories on disk can be listed.");
    }
}

pub fn print_templates(templates: &[VmTemplate]) {
    println!("{:<22} {:<10} {:<6} {:<6} {}", "TEMPLATE", "OS", "RAM", "DISK", "DESCRIPTION");
    for t in templates {
        println!(
            "{:<22} {:<10} {:<6} {:<6} {}",
            t.name, t.os_type, t.ram, t.disk_size, t.description
        );
    }
}

pub fn print_host(report: &HostReport) {
    println!("Platform:     {}/{}", report.os, report.arch);
    let kvm = match (report.kvm.present, report.kvm.accessible) {
        (true, true) => "available",
        (true, false) => "present but not accessible",
        (false, _) => "not available",
    };
    println!("KVM:          {}", kvm);
    if let Some(detail) = &report.kvm.detail {
        println!("              {}", detail);
    }
    println!("Recommended:  {}", report.recommended.unwrap_or("none"));
    println!();
    print_backends(&report.backends);
    for warning in report.warnings() {
        println!("warning: {}", warning);
    }
}

pub fn print_isos(entries: &[IsoEntry]) {
    println!("{:<22} {:<10} {:<8} {}", "TEMPLATE", "STATUS", "SIZE", "FILE");
    for e in entries {
        let (status, size) = match e.size_bytes {
            Some(bytes) => ("present", format_bytes(bytes)),
            None => ("missing", "-".to_string()),
        };
        println!("{:<22} {:<10} {:<8} {}", e.template, status, size, e.path.display());
    }
}

pub fn print_verification(v: &Verification) {
    match (v.matched, &v.source) {
        (Some(true), Some(source)) => println!("{}: OK ({}, from {})", v.path.display(), v.algorithm, source),
        _ => {
            println!("{}: no published checksum found", v.path.display());
            println!("{} {}", v.algorithm, v.digest);
        }
    }
}
