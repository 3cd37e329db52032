//! Raw QEMU driver: a qcow2 disk, a generated launch script and a
//! daemonized `qemu-system` process supervised through its pid file and
//! HMP monitor socket.

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use regex::Regex;
use serde::Deserialize;
use std::collections::HashSet;
use std::path::Path;
use std::sync::OnceLock;
use std::time::Duration;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, info, warn};

use super::{Backend, DriverContext};
use crate::argv;
use crate::utils::net;
use crate::utils::size::parse_size_mb;
use crate::utils::vm_metadata::{SnapshotNote, SnapshotNotes, VmMetadata};
use crate::vm::error::{Result, VmError};
use crate::vm::instance::{
    BackendKind, NetworkMode, SnapshotInfo, SshEndpoint, VmConfig, VmInfo, VmState,
};
use crate::vm::layout::{self, VmPaths};
use crate::vm::process::pid;

const BACKEND: &str = "qemu";
const QEMU_IMG: &str = "qemu-img";
const QEMU_SYSTEM: &str = "qemu-system-x86_64";

const MONITOR_TIMEOUT: Duration = Duration::from_secs(5);
const LAUNCH_TIMEOUT: Duration = Duration::from_secs(15);
const SIGTERM_GRACE: Duration = Duration::from_secs(10);
const SIGKILL_GRACE: Duration = Duration::from_secs(5);
const POLL_INTERVAL: Duration = Duration::from_millis(250);

pub struct QemuBackend {
    ctx: DriverContext,
}

/// A VM directory this driver has recognised as its own.
struct QemuVm {
    paths: VmPaths,
    meta: Option<VmMetadata>,
}

impl QemuVm {
    /// Scripts we generate always pass `-pidfile`; hand-written ones may not,
    /// and then a missing pid file proves nothing.
    fn launches_with_pidfile(&self) -> bool {
        self.meta.is_some()
            || std::fs::read_to_string(self.paths.script())
                .map(|s| s.contains("-pidfile"))
                .unwrap_or(false)
    }
}

impl QemuBackend {
    pub fn new(ctx: DriverContext) -> Self {
        Self { ctx }
    }

    fn recognise(&self, name: &str) -> Result<QemuVm> {
        let paths = VmPaths::new(&self.ctx.vm_root, name);
        if !paths.exists() {
            return Err(VmError::not_found(BACKEND, name));
        }
        let meta = VmMetadata::load(&paths.dir)?;
        match &meta {
            Some(m) if m.backend != BackendKind::Qemu => Err(VmError::not_found(BACKEND, name)),
            None if !paths.script().is_file() => Err(VmError::not_found(BACKEND, name)),
            _ => Ok(QemuVm { paths, meta }),
        }
    }

    async fn probe_state(&self, vm: &QemuVm) -> VmState {
        match pid::read_pid_file(&vm.paths.pidfile()) {
            Some(p) if pid::is_alive(p) => match monitor_command(&vm.paths.monitor(), "info status").await {
                Ok(reply) => parse_status(&reply),
                Err(e) => {
                    debug!("monitor for {} unreachable ({}), process {} is alive", vm.paths.name, e, p);
                    VmState::Running
                }
            },
            Some(_) => VmState::Stopped,
            None if vm.launches_with_pidfile() => VmState::Stopped,
            None => VmState::Unknown,
        }
    }

    async fn wait_for_pid(&self, paths: &VmPaths) -> Result<i32> {
        let deadline = Instant::now() + LAUNCH_TIMEOUT;
        loop {
            if let Some(p) = pid::read_pid_file(&paths.pidfile()).filter(|p| pid::is_alive(*p)) {
                return Ok(p);
            }
            if Instant::now() >= deadline {
                let console = std::fs::read_to_string(paths.console_log()).unwrap_or_default();
                let tail: Vec<&str> = console.lines().rev().take(5).collect();
                return Err(VmError::failed(
                    BACKEND,
                    "start",
                    None,
                    format!(
                        "qemu did not come up within {}s{}",
                        LAUNCH_TIMEOUT.as_secs(),
                        if tail.is_empty() {
                            String::new()
                        } else {
                            format!(": {}", tail.into_iter().rev().collect::<Vec<_>>().join(" | "))
                        }
                    ),
                ));
            }
            sleep(POLL_INTERVAL).await;
        }
    }

    async fn graceful_stop(&self, vm: &QemuVm, p: i32, state: VmState) -> Result<()> {
        let monitor = vm.paths.monitor();
        if state == VmState::Suspended {
            // A paused guest never sees the power button.
            if let Err(e) = monitor_command(&monitor, "cont").await {
                debug!("cont before powerdown failed: {}", e);
            }
        }

        match monitor_command(&monitor, "system_powerdown").await {
            Ok(_) => {
                if wait_for_exit(p, self.ctx.stop_timeout).await {
                    return Ok(());
                }
                warn!(
                    "{} ignored ACPI powerdown for {}s, sending SIGTERM",
                    vm.paths.name,
                    self.ctx.stop_timeout.as_secs()
                );
            }
            Err(e) => warn!("monitor for {} unreachable ({}), sending SIGTERM", vm.paths.name, e),
        }

        if let Err(e) = pid::terminate(p) {
            debug!("SIGTERM {} failed: {}", p, e);
        }
        if wait_for_exit(p, SIGTERM_GRACE).await {
            return Ok(());
        }
        warn!("{} survived SIGTERM, killing", vm.paths.name);
        kill_and_wait(p).await
    }

    async fn image_info(&self, disk: &Path) -> Result<ImageInfo> {
        let out = self
            .ctx
            .exec(BACKEND, QEMU_IMG, &argv!["info", "--output=json", "-U", disk.display()])
            .await?;
        if !out.success() {
            return Err(VmError::failed(BACKEND, "qemu-img info", out.exit_code, out.diagnostic()));
        }
        serde_json::from_str(&out.stdout).map_err(|e| VmError::Unknown {
            backend: BACKEND.to_string(),
            detail: format!("qemu-img info output: {e}"),
        })
    }

    async fn require_snapshot(&self, vm: &QemuVm, snapshot: &str) -> Result<()> {
        let info = self.image_info(&vm.paths.disk()).await?;
        if info.snapshots.iter().any(|s| s.name == snapshot) {
            Ok(())
        } else {
            Err(VmError::snapshot_not_found(BACKEND, &vm.paths.name, snapshot))
        }
    }

    async fn qemu_img_snapshot(&self, flag: &str, snapshot: &str, disk: &Path) -> Result<()> {
        let out = self
            .ctx
            .exec(BACKEND, QEMU_IMG, &argv!["snapshot", flag, snapshot, disk.display()])
            .await?;
        if out.success() {
            Ok(())
        } else {
            Err(VmError::failed(
                BACKEND,
                &format!("qemu-img snapshot {flag}"),
                out.exit_code,
                out.diagnostic(),
            ))
        }
    }

    /// Host ports already promised to other VMs under this root.
    fn reserved_ports(&self) -> HashSet<u16> {
        layout::scan(&self.ctx.vm_root)
            .iter()
            .filter_map(|name| VmMetadata::load(&VmPaths::new(&self.ctx.vm_root, name).dir).ok().flatten())
            .flat_map(|meta| {
                let forwards = meta.config.network.forwards.iter().map(|f| f.host);
                meta.ssh_port
                    .into_iter()
                    .chain(meta.vnc_port)
                    .chain(forwards)
                    .collect::<Vec<_>>()
            })
            .collect()
    }
}

#[async_trait]
impl Backend for QemuBackend {
    fn name(&self) -> &'static str {
        BACKEND
    }

    fn kind(&self) -> BackendKind {
        BackendKind::Qemu
    }

    fn is_available(&self) -> bool {
        self.ctx.runner.has_binary(QEMU_IMG) && self.ctx.runner.has_binary(QEMU_SYSTEM)
    }

    async fn version(&self) -> Result<String> {
        let out = self.ctx.exec(BACKEND, QEMU_SYSTEM, &argv!["--version"]).await?;
        if !out.success() {
            return Err(VmError::failed(BACKEND, "version", out.exit_code, out.diagnostic()));
        }
        Ok(out.stdout.lines().next().unwrap_or_default().trim().to_string())
    }

    async fn create(&self, config: &VmConfig) -> Result<()> {
        let paths = VmPaths::new(&self.ctx.vm_root, &config.name);
        if paths.metadata().exists() || paths.script().exists() {
            return Err(VmError::Conflict(format!(
                "vm '{}' already exists in {}",
                config.name,
                paths.dir.display()
            )));
        }
        let ram_mb = parse_size_mb(&config.ram)
            .ok_or_else(|| VmError::InvalidInput(format!("invalid RAM size '{}'", config.ram)))?;
        let disk_mb = parse_size_mb(&config.disk_size)
            .ok_or_else(|| VmError::InvalidInput(format!("invalid disk size '{}'", config.disk_size)))?;

        info!("Creating QEMU VM: {}", config.name);
        let created_dir = !paths.exists();
        std::fs::create_dir_all(&paths.dir)?;

        let disk = paths.disk();
        let adopted = disk.is_file();
        if adopted {
            info!("re-registering existing disk {}", disk.display());
        } else {
            let result = self
                .ctx
                .exec_long(BACKEND, QEMU_IMG, &argv!["create", "-f", "qcow2", disk.display(), format!("{disk_mb}M")])
                .await;
            let failure = match result {
                Ok(out) if out.success() => None,
                Ok(out) => Some(VmError::failed(BACKEND, "qemu-img create", out.exit_code, out.diagnostic())),
                Err(e) => Some(e),
            };
            if let Some(err) = failure {
                if created_dir {
                    let _ = std::fs::remove_dir_all(&paths.dir);
                }
                return Err(err);
            }
            info!("Created VM disk: {}", disk.display());
        }

        let mut reserved = self.reserved_ports();
        reserved.extend(config.network.forwards.iter().map(|f| f.host));
        let ssh_port = if config.enable_ssh && config.network.mode != NetworkMode::Bridge {
            let port = net::find_free_port_with_exclusions(&reserved)
                .ok_or_else(|| VmError::failed(BACKEND, "create", None, "no free port for ssh forwarding"))?;
            reserved.insert(port);
            Some(port)
        } else {
            None
        };
        let vnc_port = net::find_free_port_with_exclusions(&reserved)
            .ok_or_else(|| VmError::failed(BACKEND, "create", None, "no free port for vnc"))?;

        let args = launch_args(&paths, config, ram_mb, ssh_port, vnc_port);
        let script = render_launch_script(QEMU_SYSTEM, &args);
        std::fs::write(paths.script(), script)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(paths.script(), std::fs::Permissions::from_mode(0o755))?;
        }

        let mut meta = VmMetadata::new(BackendKind::Qemu, config.clone());
        meta.ssh_port = ssh_port;
        meta.vnc_port = Some(vnc_port);
        meta.boot_iso = config.iso.clone();
        meta.save(&paths.dir)?;

        info!("QEMU VM created: {} (ssh {:?}, vnc {})", config.name, ssh_port, vnc_port);
        Ok(())
    }

    async fn start(&self, name: &str) -> Result<()> {
        let vm = self.recognise(name)?;
        match self.probe_state(&vm).await {
            VmState::Running | VmState::Starting | VmState::Stopping => {
                info!("{} is already running", name);
                return Ok(());
            }
            VmState::Suspended => return self.resume(name).await,
            VmState::Unknown => {
                return Err(VmError::PreconditionFailed(format!(
                    "cannot confirm that '{name}' is stopped (its launch script writes no pid file)"
                )))
            }
            _ => {}
        }

        let script = vm.paths.script();
        if !script.is_file() {
            return Err(VmError::failed(
                BACKEND,
                "start",
                None,
                format!("launch script {} is missing", script.display()),
            ));
        }
        for stale in [vm.paths.pidfile(), vm.paths.monitor()] {
            if stale.exists() {
                std::fs::remove_file(&stale)?;
            }
        }

        info!("Starting QEMU VM: {}", name);
        let out = self.ctx.exec(BACKEND, "bash", &argv![script.display()]).await?;
        if !out.success() {
            return Err(VmError::failed(BACKEND, "start", out.exit_code, out.diagnostic()));
        }
        let p = self.wait_for_pid(&vm.paths).await?;
        VmMetadata::touch_started(&vm.paths.dir)?;
        info!("QEMU VM started: {} (pid {})", name, p);
        Ok(())
    }

    async fn stop(&self, name: &str, force: bool) -> Result<()> {
        let vm = self.recognise(name)?;
        let state = self.probe_state(&vm).await;
        match state {
            VmState::Stopped | VmState::NotFound => {
                info!("{} is already stopped", name);
                return Ok(());
            }
            VmState::Unknown => {
                return Err(VmError::PreconditionFailed(format!(
                    "cannot locate the qemu process for '{name}' (no pid file)"
                )))
            }
            _ => {}
        }
        let Some(p) = pid::read_pid_file(&vm.paths.pidfile()) else {
            return Ok(());
        };

        info!("Stopping QEMU VM: {}{}", name, if force { " (forced)" } else { "" });
        if force {
            kill_and_wait(p).await?;
        } else {
            self.graceful_stop(&vm, p, state).await?;
        }

        for runtime in [vm.paths.pidfile(), vm.paths.monitor()] {
            let _ = std::fs::remove_file(runtime);
        }
        info!("QEMU VM stopped: {}", name);
        Ok(())
    }

    async fn restart(&self, name: &str) -> Result<()> {
        let vm = self.recognise(name)?;
        if self.probe_state(&vm).await.is_active() {
            self.stop(name, false).await?;
        }
        self.start(name).await
    }

    async fn suspend(&self, name: &str) -> Result<()> {
        let vm = self.recognise(name)?;
        match self.probe_state(&vm).await {
            VmState::Suspended => Ok(()),
            VmState::Running => {
                let reply = monitor_command(&vm.paths.monitor(), "stop").await?;
                check_reply("stop", &reply)
            }
            _ => Err(VmError::VmNotRunning(name.to_string())),
        }
    }

    async fn resume(&self, name: &str) -> Result<()> {
        let vm = self.recognise(name)?;
        match self.probe_state(&vm).await {
            VmState::Running => Ok(()),
            VmState::Suspended => {
                let reply = monitor_command(&vm.paths.monitor(), "cont").await?;
                check_reply("cont", &reply)
            }
            _ => Err(VmError::VmNotRunning(name.to_string())),
        }
    }

    async fn delete(&self, name: &str, keep_disk: bool) -> Result<()> {
        let vm = self.recognise(name)?;
        match self.probe_state(&vm).await {
            state if state.is_active() => {
                if let Some(p) = pid::read_pid_file(&vm.paths.pidfile()) {
                    kill_and_wait(p).await?;
                }
            }
            VmState::Unknown => warn!("{} may still be running, deleting anyway", name),
            _ => {}
        }

        info!("Deleting QEMU VM: {}{}", name, if keep_disk { " (keeping disk)" } else { "" });
        if keep_disk {
            vm.paths.remove_all_but_disks()?;
        } else {
            std::fs::remove_dir_all(&vm.paths.dir)?;
        }
        Ok(())
    }

    async fn list(&self) -> Result<Vec<VmInfo>> {
        let mut vms = Vec::new();
        for name in layout::scan(&self.ctx.vm_root) {
            match self.info(&name).await {
                Ok(info) => vms.push(info),
                Err(VmError::NotFound { .. }) => {}
                Err(e) => debug!("skipping {}: {}", name, e),
            }
        }
        Ok(vms)
    }

    async fn info(&self, name: &str) -> Result<VmInfo> {
        let vm = self.recognise(name)?;
        let mut info = VmInfo::new(name, BACKEND, self.probe_state(&vm).await);
        info.path = Some(vm.paths.dir.clone());
        if let Some(meta) = &vm.meta {
            info.ram = Some(meta.config.ram.clone());
            info.cpus = Some(meta.config.cpus);
            info.disk_size = Some(meta.config.disk_size.clone());
            info.os_type = Some(meta.config.os_type.clone());
            info.created_at = Some(meta.created_at);
            info.last_started = meta.last_started;
            info.vnc_port = meta.vnc_port;
        }
        Ok(info)
    }

    async fn state(&self, name: &str) -> Result<VmState> {
        let vm = self.recognise(name)?;
        Ok(self.probe_state(&vm).await)
    }

    async fn ip(&self, name: &str) -> Result<Option<String>> {
        // User-mode networking hides the guest address; ssh goes through a
        // host forward instead.
        self.recognise(name)?;
        Ok(None)
    }

    async fn ssh_endpoint(&self, name: &str) -> Result<SshEndpoint> {
        let vm = self.recognise(name)?;
        let meta = vm.meta.as_ref();
        match meta.and_then(|m| m.ssh_port) {
            Some(port) => {
                let mut endpoint = SshEndpoint::new("127.0.0.1", port);
                endpoint.identity = meta.and_then(|m| m.config.ssh_key.clone());
                Ok(endpoint)
            }
            None => Err(VmError::PreconditionFailed(format!(
                "vm '{name}' has no ssh port forward"
            ))),
        }
    }

    async fn create_snapshot(&self, vm: &str, snapshot: &str, description: Option<String>) -> Result<()> {
        let qvm = self.recognise(vm)?;
        let info = self.image_info(&qvm.paths.disk()).await?;
        if info.snapshots.iter().any(|s| s.name == snapshot) {
            return Err(VmError::Conflict(format!(
                "snapshot '{snapshot}' already exists on vm '{vm}'"
            )));
        }

        if self.probe_state(&qvm).await.is_active() {
            let reply = monitor_command(&qvm.paths.monitor(), &format!("savevm {snapshot}")).await?;
            check_reply("savevm", &reply)?;
        } else {
            self.qemu_img_snapshot("-c", snapshot, &qvm.paths.disk()).await?;
        }

        let mut notes = SnapshotNotes::load(&qvm.paths.dir);
        notes.notes.insert(
            snapshot.to_string(),
            SnapshotNote {
                description,
                created_at: Utc::now(),
            },
        );
        notes.save(&qvm.paths.dir)?;
        info!("Created snapshot {} of {}", snapshot, vm);
        Ok(())
    }

    async fn list_snapshots(&self, vm: &str) -> Result<Vec<SnapshotInfo>> {
        let qvm = self.recognise(vm)?;
        let info = self.image_info(&qvm.paths.disk()).await?;
        let notes = SnapshotNotes::load(&qvm.paths.dir);
        Ok(info
            .snapshots
            .into_iter()
            .map(|s| {
                let note = notes.notes.get(&s.name);
                SnapshotInfo {
                    vm: vm.to_string(),
                    description: note.and_then(|n| n.description.clone()),
                    created_at: Utc
                        .timestamp_opt(s.date_sec, 0)
                        .single()
                        .or_else(|| note.map(|n| n.created_at)),
                    size: Some(s.vm_state_size),
                    parent: None,
                    name: s.name,
                }
            })
            .collect())
    }

    async fn revert_snapshot(&self, vm: &str, snapshot: &str) -> Result<()> {
        let qvm = self.recognise(vm)?;
        match self.probe_state(&qvm).await {
            state if state.is_active() => {
                return Err(VmError::PreconditionFailed(format!(
                    "vm '{vm}' is {state}; stop it before reverting to '{snapshot}'"
                )))
            }
            VmState::Unknown => {
                return Err(VmError::PreconditionFailed(format!(
                    "cannot confirm that '{vm}' is stopped; refusing to revert"
                )))
            }
            _ => {}
        }
        self.require_snapshot(&qvm, snapshot).await?;
        self.qemu_img_snapshot("-a", snapshot, &qvm.paths.disk()).await?;
        info!("Reverted {} to snapshot {}", vm, snapshot);
        Ok(())
    }

    async fn delete_snapshot(&self, vm: &str, snapshot: &str) -> Result<()> {
        let qvm = self.recognise(vm)?;
        self.require_snapshot(&qvm, snapshot).await?;

        // Internal qcow2 snapshots are independent of each other, so there is
        // no chain to protect here.
        if self.probe_state(&qvm).await.is_active() {
            let reply = monitor_command(&qvm.paths.monitor(), &format!("delvm {snapshot}")).await?;
            check_reply("delvm", &reply)?;
        } else {
            self.qemu_img_snapshot("-d", snapshot, &qvm.paths.disk()).await?;
        }

        let mut notes = SnapshotNotes::load(&qvm.paths.dir);
        if notes.notes.remove(snapshot).is_some() {
            notes.save(&qvm.paths.dir)?;
        }
        info!("Deleted snapshot {} of {}", snapshot, vm);
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct ImageInfo {
    #[serde(default)]
    snapshots: Vec<ImageSnapshot>,
}

#[derive(Debug, Deserialize)]
struct ImageSnapshot {
    name: String,
    #[serde(rename = "vm-state-size", default)]
    vm_state_size: u64,
    #[serde(rename = "date-sec", default)]
    date_sec: i64,
}

async fn wait_for_exit(p: i32, budget: Duration) -> bool {
    let deadline = Instant::now() + budget;
    loop {
        if !pid::is_alive(p) {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        sleep(POLL_INTERVAL).await;
    }
}

async fn kill_and_wait(p: i32) -> Result<()> {
    if let Err(e) = pid::force_kill(p) {
        debug!("SIGKILL {} failed: {}", p, e);
    }
    if wait_for_exit(p, SIGKILL_GRACE).await {
        Ok(())
    } else {
        Err(VmError::failed(BACKEND, "stop", None, format!("process {p} survived SIGKILL")))
    }
}

fn launch_args(paths: &VmPaths, config: &VmConfig, ram_mb: u64, ssh_port: Option<u16>, vnc_port: u16) -> Vec<String> {
    let mut args = argv![
        "-name",
        config.name,
        "-machine",
        "q35",
        "-accel",
        "kvm",
        "-accel",
        "tcg",
        "-cpu",
        "max",
        "-m",
        ram_mb,
        "-smp",
        config.cpus,
        "-drive",
        format!("file={},format=qcow2,if=virtio", paths.disk().display()),
    ];

    if let Some(iso) = &config.iso {
        args.extend(argv!["-cdrom", iso.display(), "-boot", "once=d"]);
    }

    match config.network.mode {
        NetworkMode::Bridge => {
            let bridge = config.network.bridge.as_deref().unwrap_or("br0");
            args.extend(argv!["-netdev", format!("bridge,id=net0,br={bridge}")]);
        }
        mode => {
            let mut netdev = String::from("user,id=net0");
            if mode == NetworkMode::Host {
                netdev.push_str(",restrict=on");
            }
            if let Some(port) = ssh_port {
                netdev.push_str(&format!(",hostfwd=tcp:127.0.0.1:{port}-:22"));
            }
            for fwd in &config.network.forwards {
                netdev.push_str(&format!(",hostfwd={}::{}-:{}", fwd.proto, fwd.host, fwd.guest));
            }
            args.extend(argv!["-netdev", netdev]);
        }
    }
    args.extend(argv!["-device", "virtio-net-pci,netdev=net0"]);

    if config.is_windows() {
        args.extend(argv!["-rtc", "base=localtime", "-usb", "-device", "usb-tablet"]);
    }

    args.extend(argv![
        "-vnc",
        format!("127.0.0.1:{}", vnc_port.saturating_sub(5900)),
        "-monitor",
        format!("unix:{},server,nowait", paths.monitor().display()),
        "-serial",
        format!("file:{}", paths.console_log().display()),
        "-pidfile",
        paths.pidfile().display(),
        "-daemonize",
    ]);
    args
}

fn render_launch_script(program: &str, args: &[String]) -> String {
    let mut parts = vec![format!("exec {program}")];
    parts.extend(args.iter().map(|a| shell_quote(a)));
    format!("#!/bin/bash\n{}\n", parts.join(" \\\n  "))
}

fn shell_quote(arg: &str) -> String {
    let safe = !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./:=,@+%".contains(c));
    if safe {
        arg.to_string()
    } else {
        format!("'{}'", arg.replace('\'', r"'\''"))
    }
}

/// Map an HMP `info status` reply onto a state. Anything unrecognised is
/// `Unknown`.
fn parse_status(reply: &str) -> VmState {
    let Some(line) = reply.lines().find(|l| l.contains("VM status:")) else {
        return VmState::Unknown;
    };
    let status = line.split("VM status:").nth(1).unwrap_or_default().trim();
    match status {
        "running" => VmState::Running,
        s if s.starts_with("paused (shutdown)") => VmState::Stopping,
        s if s.starts_with("paused (internal-error)") || s.starts_with("paused (guest-panicked)") => {
            VmState::Error
        }
        s if s.starts_with("paused (prelaunch)") || s.starts_with("paused (inmigrate)") => {
            VmState::Starting
        }
        s if s.starts_with("paused") => VmState::Suspended,
        _ => VmState::Unknown,
    }
}

fn check_reply(command: &str, reply: &str) -> Result<()> {
    if reply.lines().any(|l| l.starts_with("Error") || l.contains("could not")) {
        Err(VmError::failed(BACKEND, &format!("monitor {command}"), None, reply))
    } else {
        Ok(())
    }
}

fn ansi_escapes() -> &'static Regex {
    static ANSI: OnceLock<Regex> = OnceLock::new();
    ANSI.get_or_init(|| Regex::new(r"\x1b\[[0-9;]*[A-Za-z]").expect("static regex"))
}

/// Strip the terminal escapes, prompt and command echo from an HMP reply.
fn clean_monitor_reply(raw: &str, command: &str) -> String {
    ansi_escapes()
        .replace_all(raw, "")
        .lines()
        .map(|l| l.trim_end_matches('\r').replace("(qemu)", ""))
        .map(|l| l.trim().to_string())
        .filter(|l| !l.is_empty() && l != command)
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(unix)]
async fn monitor_command(socket: &Path, command: &str) -> Result<String> {
    use tokio::io::AsyncWriteExt;
    use tokio::net::UnixStream;

    debug!("monitor {}: {}", socket.display(), command);
    let exchange = async {
        let mut stream = UnixStream::connect(socket).await?;
        read_until_prompt(&mut stream).await?;
        stream.write_all(format!("{command}\n").as_bytes()).await?;
        read_until_prompt(&mut stream).await
    };

    match timeout(MONITOR_TIMEOUT, exchange).await {
        Ok(Ok(raw)) => Ok(clean_monitor_reply(&raw, command)),
        Ok(Err(e)) => Err(VmError::failed(BACKEND, &format!("monitor {command}"), None, e.to_string())),
        Err(_) => Err(VmError::Timeout {
            what: format!("qemu monitor '{command}'"),
            after: MONITOR_TIMEOUT,
        }),
    }
}

#[cfg(not(unix))]
async fn monitor_command(_socket: &Path, command: &str) -> Result<String> {
    Err(VmError::unavailable(
        BACKEND,
        format!("monitor command '{command}' needs a unix socket"),
    ))
}

#[cfg(unix)]
async fn read_until_prompt<R>(stream: &mut R) -> std::io::Result<String>
where
    R: tokio::io::AsyncRead + Unpin,
{
    use tokio::io::AsyncReadExt;

    let mut buf = Vec::new();
    let mut chunk = [0u8; 1024];
    loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);
        if buf.ends_with(b"(qemu) ") {
            break;
        }
    }
    Ok(String::from_utf8_lossy(&buf).into_owned())
}
