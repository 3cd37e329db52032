//! VirtualBox driver. Every call shells out to `VBoxManage`; machines are
//! registered with their base folder in the conventional VM directory.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashSet};
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

use super::{Backend, DriverContext};
use crate::argv;
use crate::utils::net;
use crate::utils::size::parse_size_mb;
use crate::utils::vm_metadata::VmMetadata;
use crate::vm::error::{Result, VmError};
use crate::vm::instance::{
    BackendKind, NetworkMode, SnapshotInfo, SshEndpoint, VmConfig, VmInfo, VmState,
};
use crate::vm::layout::{self, VmPaths};
use crate::vm::process::ToolOutput;

const BACKEND: &str = "virtualbox";
const SATA: &str = "SATA Controller";
const GUEST_IP_PROPERTY: &str = "/VirtualBox/GuestInfo/Net/0/V4/IP";

#[cfg(windows)]
const VBOXMANAGE: &str = "VBoxManage.exe";
#[cfg(not(windows))]
const VBOXMANAGE: &str = "VBoxManage";

pub struct VirtualBoxBackend {
    ctx: DriverContext,
}

impl VirtualBoxBackend {
    pub fn new(ctx: DriverContext) -> Self {
        Self { ctx }
    }

    async fn vboxmanage(&self, args: Vec<String>) -> Result<ToolOutput> {
        self.ctx.exec(BACKEND, VBOXMANAGE, &args).await
    }

    async fn vboxmanage_vm(&self, operation: &str, name: &str, args: Vec<String>) -> Result<ToolOutput> {
        let out = self.vboxmanage(args).await?;
        if out.success() {
            Ok(out)
        } else if is_missing_vm(out.diagnostic()) {
            Err(VmError::not_found(BACKEND, name))
        } else {
            Err(VmError::failed(
                BACKEND,
                &format!("VBoxManage {operation}"),
                out.exit_code,
                out.diagnostic(),
            ))
        }
    }

    async fn vm_exists(&self, name: &str) -> Result<bool> {
        let out = self.vboxmanage(argv!["list", "vms"]).await?;
        if !out.success() {
            return Err(VmError::failed(BACKEND, "VBoxManage list vms", out.exit_code, out.diagnostic()));
        }
        Ok(parse_vm_names(&out.stdout).iter().any(|n| n == name))
    }

    async fn showvminfo(&self, name: &str) -> Result<BTreeMap<String, String>> {
        let out = self
            .vboxmanage_vm("showvminfo", name, argv!["showvminfo", name, "--machinereadable"])
            .await?;
        Ok(parse_machine_readable(&out.stdout))
    }

    async fn vm_state(&self, name: &str) -> Result<VmState> {
        let fields = self.showvminfo(name).await?;
        Ok(fields
            .get("VMState")
            .map(|s| map_vmstate(s))
            .unwrap_or(VmState::Unknown))
    }

    async fn controlvm(&self, name: &str, action: &str) -> Result<()> {
        self.vboxmanage_vm(&format!("controlvm {action}"), name, argv!["controlvm", name, action])
            .await
            .map(|_| ())
    }

    async fn wait_until_stopped(&self, name: &str, budget: Duration) -> Result<bool> {
        let deadline = Instant::now() + budget;
        loop {
            if self.vm_state(name).await? == VmState::Stopped {
                return Ok(true);
            }
            if Instant::now() >= deadline {
                return Ok(false);
            }
            sleep(Duration::from_secs(1)).await;
        }
    }

    async fn snapshots(&self, vm: &str) -> Result<Vec<SnapshotInfo>> {
        let out = self
            .vboxmanage(argv!["snapshot", vm, "list", "--machinereadable"])
            .await?;
        if !out.success() {
            let diag = out.diagnostic();
            if diag.contains("does not have any snapshots") || out.stdout.contains("does not have any snapshots") {
                return Ok(Vec::new());
            }
            if is_missing_vm(diag) {
                return Err(VmError::not_found(BACKEND, vm));
            }
            return Err(VmError::failed(BACKEND, "VBoxManage snapshot list", out.exit_code, diag));
        }
        Ok(parse_snapshot_tree(vm, &parse_machine_readable(&out.stdout)))
    }

    fn metadata(&self, name: &str) -> Option<VmMetadata> {
        VmMetadata::load(&VmPaths::new(&self.ctx.vm_root, name).dir)
            .ok()
            .flatten()
            .filter(|m| m.backend == BackendKind::VirtualBox)
    }

    fn reserved_ports(&self) -> HashSet<u16> {
        layout::scan(&self.ctx.vm_root)
            .iter()
            .filter_map(|name| VmMetadata::load(&VmPaths::new(&self.ctx.vm_root, name).dir).ok().flatten())
            .flat_map(|meta| {
                let mut ports: Vec<u16> = meta.config.network.forwards.iter().map(|f| f.host).collect();
                ports.extend(meta.ssh_port);
                ports
            })
            .collect()
    }

    async fn configure(&self, config: &VmConfig, paths: &VmPaths, ram_mb: u64, disk_mb: u64) -> Result<Option<u16>> {
        let name = config.name.as_str();
        let settings = [
            ("--memory", ram_mb.to_string()),
            ("--cpus", config.cpus.to_string()),
            ("--vram", "128".to_string()),
            ("--boot1", "dvd".to_string()),
            ("--boot2", "disk".to_string()),
            ("--acpi", "on".to_string()),
            ("--ioapic", "on".to_string()),
            ("--rtcuseutc", if config.is_windows() { "off" } else { "on" }.to_string()),
        ];
        for (key, value) in &settings {
            self.vboxmanage_vm("modifyvm", name, argv!["modifyvm", name, key, value])
                .await?;
        }

        let nic = match config.network.mode {
            NetworkMode::Nat => argv!["modifyvm", name, "--nic1", "nat", "--cableconnected1", "on"],
            NetworkMode::Bridge => argv![
                "modifyvm",
                name,
                "--nic1",
                "bridged",
                "--bridgeadapter1",
                config.network.bridge.as_deref().unwrap_or("eth0"),
            ],
            NetworkMode::Host => argv!["modifyvm", name, "--nic1", "hostonly", "--hostonlyadapter1", "vboxnet0"],
        };
        self.vboxmanage_vm("modifyvm --nic1", name, nic).await?;

        let mut ssh_port = None;
        if config.network.mode == NetworkMode::Nat {
            let mut reserved = self.reserved_ports();
            reserved.extend(config.network.forwards.iter().map(|f| f.host));
            if config.enable_ssh {
                let port = net::find_free_port_with_exclusions(&reserved)
                    .ok_or_else(|| VmError::failed(BACKEND, "create", None, "no free port for ssh forwarding"))?;
                self.vboxmanage_vm(
                    "modifyvm --natpf1",
                    name,
                    argv!["modifyvm", name, "--natpf1", format!("ssh,tcp,,{port},,22")],
                )
                .await?;
                ssh_port = Some(port);
            }
            for (i, fwd) in config.network.forwards.iter().enumerate() {
                let rule = format!("fwd{i},{},,{},,{}", fwd.proto, fwd.host, fwd.guest);
                self.vboxmanage_vm("modifyvm --natpf1", name, argv!["modifyvm", name, "--natpf1", rule])
                    .await?;
            }
        } else if !config.network.forwards.is_empty() {
            warn!("port forwards only apply to NAT networking; ignoring them for {}", name);
        }

        let vdi = paths.vdi();
        if vdi.is_file() {
            info!("re-registering existing disk {}", vdi.display());
        } else {
            let out = self
                .ctx
                .exec_long(
                    BACKEND,
                    VBOXMANAGE,
                    &argv!["createmedium", "disk", "--filename", vdi.display(), "--size", disk_mb, "--format", "VDI"],
                )
                .await?;
            if !out.success() {
                return Err(VmError::failed(BACKEND, "VBoxManage createmedium", out.exit_code, out.diagnostic()));
            }
        }

        self.vboxmanage_vm(
            "storagectl",
            name,
            argv!["storagectl", name, "--name", SATA, "--add", "sata", "--controller", "IntelAHCI"],
        )
        .await?;
        self.vboxmanage_vm(
            "storageattach",
            name,
            argv![
                "storageattach", name, "--storagectl", SATA, "--port", "0", "--device", "0", "--type", "hdd",
                "--medium", vdi.display(),
            ],
        )
        .await?;

        if let Some(iso) = &config.iso {
            self.vboxmanage_vm(
                "storageattach",
                name,
                argv![
                    "storageattach", name, "--storagectl", SATA, "--port", "1", "--device", "0", "--type",
                    "dvddrive", "--medium", iso.display(),
                ],
            )
            .await?;
        }
        Ok(ssh_port)
    }
}

#[async_trait]
impl Backend for VirtualBoxBackend {
    fn name(&self) -> &'static str {
        BACKEND
    }

    fn kind(&self) -> BackendKind {
        BackendKind::VirtualBox
    }

    fn is_available(&self) -> bool {
        self.ctx.runner.has_binary(VBOXMANAGE)
    }

    async fn version(&self) -> Result<String> {
        let out = self.vboxmanage(argv!["--version"]).await?;
        if !out.success() {
            return Err(VmError::failed(BACKEND, "VBoxManage --version", out.exit_code, out.diagnostic()));
        }
        Ok(format!("VirtualBox {}", out.stdout.trim()))
    }

    async fn create(&self, config: &VmConfig) -> Result<()> {
        let name = config.name.as_str();
        if self.vm_exists(name).await? {
            return Err(VmError::Conflict(format!("VirtualBox VM '{name}' already exists")));
        }
        let paths = VmPaths::new(&self.ctx.vm_root, name);
        if paths.metadata().exists() || paths.script().exists() {
            return Err(VmError::Conflict(format!(
                "vm '{name}' already exists in {}",
                paths.dir.display()
            )));
        }
        let ram_mb = parse_size_mb(&config.ram)
            .ok_or_else(|| VmError::InvalidInput(format!("invalid RAM size '{}'", config.ram)))?;
        let disk_mb = parse_size_mb(&config.disk_size)
            .ok_or_else(|| VmError::InvalidInput(format!("invalid disk size '{}'", config.disk_size)))?;

        info!("Creating VirtualBox VM: {}", name);
        std::fs::create_dir_all(&self.ctx.vm_root)?;
        let adopted = paths.vdi().is_file();
        self.vboxmanage_vm(
            "createvm",
            name,
            argv![
                "createvm",
                "--name",
                name,
                "--ostype",
                vbox_os_type(&config.os_type),
                "--basefolder",
                self.ctx.vm_root.display(),
                "--register",
            ],
        )
        .await?;

        let ssh_port = match self.configure(config, &paths, ram_mb, disk_mb).await {
            Ok(port) => port,
            Err(e) => {
                warn!("creating {} failed, unregistering: {}", name, e);
                let cleanup = if adopted {
                    argv!["unregistervm", name]
                } else {
                    argv!["unregistervm", name, "--delete"]
                };
                if let Err(cleanup_err) = self.vboxmanage(cleanup).await {
                    debug!("cleanup of {} failed: {}", name, cleanup_err);
                }
                return Err(e);
            }
        };

        let mut meta = VmMetadata::new(BackendKind::VirtualBox, config.clone());
        meta.ssh_port = ssh_port;
        meta.boot_iso = config.iso.clone();
        meta.save(&paths.dir)?;
        info!("VirtualBox VM created: {} (ssh {:?})", name, ssh_port);
        Ok(())
    }

    async fn start(&self, name: &str) -> Result<()> {
        match self.vm_state(name).await? {
            VmState::Running | VmState::Starting => {
                info!("{} is already running", name);
                return Ok(());
            }
            VmState::Suspended => return self.resume(name).await,
            _ => {}
        }

        info!("Starting VirtualBox VM: {}", name);
        self.vboxmanage_vm("startvm", name, argv!["startvm", name, "--type", "headless"])
            .await?;
        let dir = VmPaths::new(&self.ctx.vm_root, name).dir;
        if self.metadata(name).is_some() {
            VmMetadata::touch_started(&dir)?;
        }
        Ok(())
    }

    async fn stop(&self, name: &str, force: bool) -> Result<()> {
        let state = self.vm_state(name).await?;
        if state == VmState::Stopped {
            info!("{} is already stopped", name);
            return Ok(());
        }

        if !force {
            if state == VmState::Suspended {
                self.controlvm(name, "resume").await?;
            }
            info!("Sending ACPI power button to {}", name);
            if self.controlvm(name, "acpipowerbutton").await.is_ok()
                && self.wait_until_stopped(name, self.ctx.stop_timeout).await?
            {
                return Ok(());
            }
            warn!("{} did not power off within {}s, forcing", name, self.ctx.stop_timeout.as_secs());
        }

        info!("Powering off VirtualBox VM: {}", name);
        self.controlvm(name, "poweroff").await?;
        if self.wait_until_stopped(name, Duration::from_secs(10)).await? {
            Ok(())
        } else {
            Err(VmError::Timeout {
                what: format!("'{name}' to power off"),
                after: Duration::from_secs(10),
            })
        }
    }

    async fn restart(&self, name: &str) -> Result<()> {
        if self.vm_state(name).await? == VmState::Running {
            info!("Resetting VirtualBox VM: {}", name);
            self.controlvm(name, "reset").await
        } else {
            self.start(name).await
        }
    }

    async fn suspend(&self, name: &str) -> Result<()> {
        match self.vm_state(name).await? {
            VmState::Suspended => Ok(()),
            VmState::Running => self.controlvm(name, "pause").await,
            _ => Err(VmError::VmNotRunning(name.to_string())),
        }
    }

    async fn resume(&self, name: &str) -> Result<()> {
        match self.vm_state(name).await? {
            VmState::Running => Ok(()),
            VmState::Suspended => self.controlvm(name, "resume").await,
            _ => Err(VmError::VmNotRunning(name.to_string())),
        }
    }

    async fn delete(&self, name: &str, keep_disk: bool) -> Result<()> {
        if self.vm_state(name).await?.is_active() {
            self.controlvm(name, "poweroff").await?;
            self.wait_until_stopped(name, Duration::from_secs(10)).await?;
        }

        let paths = VmPaths::new(&self.ctx.vm_root, name);
        info!("Deleting VirtualBox VM: {}{}", name, if keep_disk { " (keeping disk)" } else { "" });
        if keep_disk {
            self.vboxmanage_vm(
                "storageattach",
                name,
                argv![
                    "storageattach", name, "--storagectl", SATA, "--port", "0", "--device", "0", "--medium", "none",
                ],
            )
            .await?;
        }
        self.vboxmanage_vm("unregistervm", name, argv!["unregistervm", name, "--delete"])
            .await?;
        if keep_disk {
            // Forget the medium without deleting it so it can be attached again.
            let out = self
                .vboxmanage(argv!["closemedium", "disk", paths.vdi().display()])
                .await?;
            if !out.success() {
                debug!("closemedium {}: {}", paths.vdi().display(), out.diagnostic());
            }
        }

        if paths.exists() {
            if keep_disk {
                paths.remove_all_but_disks()?;
            } else {
                std::fs::remove_dir_all(&paths.dir)?;
            }
        }
        Ok(())
    }

    async fn list(&self) -> Result<Vec<VmInfo>> {
        let out = self.vboxmanage(argv!["list", "vms"]).await?;
        if !out.success() {
            return Err(VmError::failed(BACKEND, "VBoxManage list vms", out.exit_code, out.diagnostic()));
        }
        let mut vms = Vec::new();
        for name in parse_vm_names(&out.stdout) {
            match self.vm_state(&name).await {
                Ok(state) => {
                    let mut info = VmInfo::new(&name, BACKEND, state);
                    if let Some(meta) = self.metadata(&name) {
                        apply_metadata(&mut info, &meta);
                    }
                    vms.push(info);
                }
                Err(e) => debug!("skipping {}: {}", name, e),
            }
        }
        Ok(vms)
    }

    async fn info(&self, name: &str) -> Result<VmInfo> {
        let fields = self.showvminfo(name).await?;
        let state = fields.get("VMState").map(|s| map_vmstate(s)).unwrap_or(VmState::Unknown);
        let mut info = VmInfo::new(name, BACKEND, state);
        if let Some(meta) = self.metadata(name) {
            apply_metadata(&mut info, &meta);
        }
        if let Some(mb) = fields.get("memory").and_then(|m| m.parse::<u64>().ok()) {
            info.ram = Some(if mb % 1024 == 0 { format!("{}G", mb / 1024) } else { format!("{mb}M") });
        }
        if let Some(cpus) = fields.get("cpus").and_then(|c| c.parse().ok()) {
            info.cpus = Some(cpus);
        }
        if let Some(cfg) = fields.get("CfgFile") {
            info.path = std::path::Path::new(cfg).parent().map(|p| p.to_path_buf());
        }
        if let Some(port) = fields.get("vrdeport").and_then(|p| p.parse::<u16>().ok()).filter(|p| *p > 0) {
            info.vnc_port = Some(port);
        }
        if state == VmState::Running {
            info.ip = self.ip(name).await.ok().flatten();
        }
        Ok(info)
    }

    async fn state(&self, name: &str) -> Result<VmState> {
        self.vm_state(name).await
    }

    async fn ip(&self, name: &str) -> Result<Option<String>> {
        let out = self
            .vboxmanage_vm("guestproperty", name, argv!["guestproperty", "get", name, GUEST_IP_PROPERTY])
            .await?;
        Ok(out
            .stdout
            .trim()
            .strip_prefix("Value: ")
            .map(str::trim)
            .filter(|ip| !ip.is_empty() && *ip != "null")
            .map(String::from))
    }

    async fn ssh_endpoint(&self, name: &str) -> Result<SshEndpoint> {
        let fields = self.showvminfo(name).await?;
        let identity = self.metadata(name).and_then(|m| m.config.ssh_key);

        // A NAT guest address is not routable from the host, so prefer the
        // forwarded port when there is one.
        let forwarded = fields
            .iter()
            .filter(|(k, _)| k.starts_with("Forwarding("))
            .find_map(|(_, rule)| parse_ssh_forward(rule));
        let mut endpoint = match forwarded {
            Some(port) => SshEndpoint::new("127.0.0.1", port),
            None => match self.ip(name).await? {
                Some(ip) => SshEndpoint::new(ip, 22),
                None => {
                    return Err(VmError::PreconditionFailed(format!(
                        "VirtualBox reports no address for '{name}' yet"
                    )))
                }
            },
        };
        endpoint.identity = identity;
        Ok(endpoint)
    }

    async fn create_snapshot(&self, vm: &str, snapshot: &str, description: Option<String>) -> Result<()> {
        if self.snapshots(vm).await?.iter().any(|s| s.name == snapshot) {
            return Err(VmError::Conflict(format!(
                "snapshot '{snapshot}' already exists on vm '{vm}'"
            )));
        }
        let mut args = argv!["snapshot", vm, "take", snapshot];
        if let Some(desc) = description {
            args.extend(argv!["--description", desc]);
        }
        self.vboxmanage_vm("snapshot take", vm, args).await?;
        info!("Created snapshot {} of {}", snapshot, vm);
        Ok(())
    }

    async fn list_snapshots(&self, vm: &str) -> Result<Vec<SnapshotInfo>> {
        // Surface NotFound for unknown VMs before the snapshot listing does.
        self.vm_state(vm).await?;
        self.snapshots(vm).await
    }

    async fn revert_snapshot(&self, vm: &str, snapshot: &str) -> Result<()> {
        let state = self.vm_state(vm).await?;
        if state.is_active() {
            return Err(VmError::PreconditionFailed(format!(
                "vm '{vm}' is {state}; stop it before reverting to '{snapshot}'"
            )));
        }
        if !self.snapshots(vm).await?.iter().any(|s| s.name == snapshot) {
            return Err(VmError::snapshot_not_found(BACKEND, vm, snapshot));
        }
        self.vboxmanage_vm("snapshot restore", vm, argv!["snapshot", vm, "restore", snapshot])
            .await?;
        info!("Reverted {} to snapshot {}", vm, snapshot);
        Ok(())
    }

    async fn delete_snapshot(&self, vm: &str, snapshot: &str) -> Result<()> {
        let all = self.snapshots(vm).await?;
        if !all.iter().any(|s| s.name == snapshot) {
            return Err(VmError::snapshot_not_found(BACKEND, vm, snapshot));
        }
        let children: Vec<String> = all
            .iter()
            .filter(|s| s.parent.as_deref() == Some(snapshot))
            .map(|s| s.name.clone())
            .collect();
        if !children.is_empty() {
            return Err(VmError::Dependency {
                vm: vm.to_string(),
                snapshot: snapshot.to_string(),
                children,
            });
        }
        self.vboxmanage_vm("snapshot delete", vm, argv!["snapshot", vm, "delete", snapshot])
            .await?;
        info!("Deleted snapshot {} of {}", snapshot, vm);
        Ok(())
    }
}

fn is_missing_vm(stderr: &str) -> bool {
    stderr.contains("Could not find a registered machine") || stderr.contains("VBOX_E_OBJECT_NOT_FOUND")
}

fn vbox_os_type(os_type: &str) -> &'static str {
    let os = os_type.to_lowercase();
    if os.starts_with("windows10") {
        "Windows10_64"
    } else if os.starts_with("windows") {
        "Windows11_64"
    } else if os.starts_with("ubuntu") {
        "Ubuntu_64"
    } else if os.starts_with("debian") {
        "Debian_64"
    } else {
        "Linux_64"
    }
}

fn map_vmstate(state: &str) -> VmState {
    match state {
        "running" => VmState::Running,
        "paused" => VmState::Suspended,
        "poweroff" | "aborted" | "saved" => VmState::Stopped,
        "starting" | "restoring" => VmState::Starting,
        "stopping" | "saving" => VmState::Stopping,
        "gurumeditation" => VmState::Error,
        other => {
            debug!("unrecognised VirtualBox state '{}'", other);
            VmState::Unknown
        }
    }
}

/// `"name" {uuid}` lines of `VBoxManage list vms`.
fn parse_vm_names(output: &str) -> Vec<String> {
    output
        .lines()
        .filter_map(|line| {
            let rest = line.trim().strip_prefix('"')?;
            let end = rest.rfind('"')?;
            Some(rest[..end].to_string())
        })
        .collect()
}

/// `key="value"` / `key=value` lines of `--machinereadable` output.
fn parse_machine_readable(output: &str) -> BTreeMap<String, String> {
    output
        .lines()
        .filter_map(|line| line.split_once('='))
        .map(|(k, v)| {
            let key = k.trim().trim_matches('"').to_string();
            let value = v.trim().trim_matches('"').to_string();
            (key, value)
        })
        .collect()
}

/// Snapshot keys nest by suffix: `SnapshotName`, `SnapshotName-1`,
/// `SnapshotName-1-1`; stripping the last `-N` yields the parent's key.
fn parse_snapshot_tree(vm: &str, fields: &BTreeMap<String, String>) -> Vec<SnapshotInfo> {
    let names: BTreeMap<&str, &str> = fields
        .iter()
        .filter_map(|(k, v)| k.strip_prefix("SnapshotName").map(|suffix| (suffix, v.as_str())))
        .collect();

    names
        .iter()
        .map(|(suffix, name)| {
            let parent = if suffix.is_empty() {
                None
            } else {
                let parent_suffix = suffix.rsplit_once('-').map(|(p, _)| p).unwrap_or("");
                names.get(parent_suffix).map(|p| p.to_string())
            };
            SnapshotInfo {
                name: name.to_string(),
                vm: vm.to_string(),
                description: fields
                    .get(&format!("SnapshotDescription{suffix}"))
                    .filter(|d| !d.is_empty())
                    .cloned(),
                created_at: None,
                size: None,
                parent,
            }
        })
        .collect()
}

/// Host port of a `name,proto,hostip,hostport,guestip,guestport` rule
/// forwarding to guest port 22.
fn parse_ssh_forward(rule: &str) -> Option<u16> {
    let parts: Vec<&str> = rule.split(',').collect();
    if parts.len() == 6 && parts[1] == "tcp" && parts[5] == "22" {
        parts[3].parse().ok()
    } else {
        None
    }
}

fn apply_metadata(info: &mut VmInfo, meta: &VmMetadata) {
    info.ram = Some(meta.config.ram.clone());
    info.cpus = Some(meta.config.cpus);
    info.disk_size = Some(meta.config.disk_size.clone());
    info.os_type = Some(meta.config.os_type.clone());
    info.created_at = Some(meta.created_at);
    info.last_started = meta.last_started;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::error::ErrorKind;
    use crate::vm::process::testing::ScriptedRunner;
    use std::sync::Arc;

    #[test]
    fn parses_registered_vm_names() {
        let out = "\"web server\" {a1b2c3d4-0000-0000-0000-000000000000}\n\"db\" {ffffffff-0000-0000-0000-000000000000}\n";
        assert_eq!(parse_vm_names(out), vec!["web server".to_string(), "db".to_string()]);
    }

    #[test]
    fn parses_nested_snapshots() {
        let out = "SnapshotName=\"base\"\nSnapshotUUID=\"1\"\nSnapshotDescription=\"fresh install\"\n\
                   SnapshotName-1=\"tools\"\nSnapshotUUID-1=\"2\"\n\
                   SnapshotName-1-1=\"app\"\nSnapshotUUID-1-1=\"3\"\n\
                   CurrentSnapshotName=\"app\"\nCurrentSnapshotUUID=\"3\"\n";
        let snaps = parse_snapshot_tree("web", &parse_machine_readable(out));
        let by_name = |n: &str| snaps.iter().find(|s| s.name == n).unwrap().clone();

        assert_eq!(snaps.len(), 3);
        assert_eq!(by_name("base").parent, None);
        assert_eq!(by_name("base").description.as_deref(), Some("fresh install"));
        assert_eq!(by_name("tools").parent.as_deref(), Some("base"));
        assert_eq!(by_name("app").parent.as_deref(), Some("tools"));
    }

    #[test]
    fn finds_ssh_forward_rule() {
        assert_eq!(parse_ssh_forward("ssh,tcp,,2222,,22"), Some(2222));
        assert_eq!(parse_ssh_forward("web,tcp,,8080,,80"), None);
        assert_eq!(parse_ssh_forward("garbage"), None);
    }

    #[test]
    fn maps_virtualbox_states() {
        assert_eq!(map_vmstate("running"), VmState::Running);
        assert_eq!(map_vmstate("poweroff"), VmState::Stopped);
        assert_eq!(map_vmstate("paused"), VmState::Suspended);
        assert_eq!(map_vmstate("teleported"), VmState::Unknown);
    }

    fn backend(runner: &ScriptedRunner) -> VirtualBoxBackend {
        VirtualBoxBackend::new(DriverContext::new("/nonexistent/vms", Arc::new(runner.clone())))
    }

    #[tokio::test]
    async fn unregistered_machine_is_not_found() {
        let runner = ScriptedRunner::new(&[VBOXMANAGE]);
        runner.on(VBOXMANAGE, |_| {
            ToolOutput::err(1, "VBoxManage: error: Could not find a registered machine named 'ghost'")
        });
        let err = backend(&runner).start("ghost").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn starting_a_running_machine_is_a_no_op() {
        let runner = ScriptedRunner::new(&[VBOXMANAGE]);
        runner.on(VBOXMANAGE, |args| match args[0].as_str() {
            "showvminfo" => ToolOutput::ok("name=\"web\"\nVMState=\"running\"\n"),
            _ => ToolOutput::err(1, "should not be called"),
        });
        backend(&runner).start("web").await.unwrap();
        assert!(!runner.calls().iter().any(|c| c.contains("startvm")));
    }

    #[tokio::test]
    async fn stopping_a_powered_off_machine_is_a_no_op() {
        let runner = ScriptedRunner::new(&[VBOXMANAGE]);
        runner.on(VBOXMANAGE, |args| match args[0].as_str() {
            "showvminfo" => ToolOutput::ok("name=\"web\"\nVMState=\"poweroff\"\n"),
            _ => ToolOutput::err(1, "should not be called"),
        });
        backend(&runner).stop("web", false).await.unwrap();
        backend(&runner).stop("web", true).await.unwrap();
        assert!(!runner.calls().iter().any(|c| c.contains("controlvm")));
    }

    #[tokio::test]
    async fn deleting_a_parent_snapshot_is_refused() {
        let runner = ScriptedRunner::new(&[VBOXMANAGE]);
        runner.on(VBOXMANAGE, |args| match args[0].as_str() {
            "snapshot" if args[2] == "list" => {
                ToolOutput::ok("SnapshotName=\"base\"\nSnapshotName-1=\"child\"\n")
            }
            _ => ToolOutput::err(1, "should not be called"),
        });
        let err = backend(&runner).delete_snapshot("web", "base").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PreconditionFailed);
        assert!(err.to_string().contains("child"));
    }
}
