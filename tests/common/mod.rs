//! Stand-in for `qemu-img` and the QEMU launch script.
//!
//! Disks are real files and a "running" guest is a real `sleep` process
//! whose pid lands in the VM's pid file, so the QEMU driver's liveness
//! checks see genuine processes.

#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{Child, Command};
use std::sync::Arc;
use std::time::Duration;

use vmhub::vm::layout::VmPaths;
use vmhub::vm::process::{CommandRunner, ToolOutput};
use vmhub::vm::{ManagerSettings, VmConfig, VmManager};
use vmhub::vm::{BackendKind, DriverContext};

#[derive(Default)]
pub struct FakeQemu {
    snapshots: Mutex<HashMap<PathBuf, Vec<String>>>,
    guests: Mutex<Vec<Child>>,
    calls: Mutex<Vec<String>>,
}

impl FakeQemu {
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    pub fn launches(&self) -> usize {
        self.calls().iter().filter(|c| c.starts_with("bash ")).count()
    }

    fn qemu_img(&self, args: &[String]) -> ToolOutput {
        match args.first().map(String::as_str) {
            Some("create") => {
                let disk = &args[3];
                match std::fs::write(disk, b"QFI\xfb") {
                    Ok(()) => ToolOutput::ok(format!("Formatting '{disk}', fmt=qcow2")),
                    Err(e) => ToolOutput::err(1, e.to_string()),
                }
            }
            Some("info") => {
                let disk = PathBuf::from(args.last().cloned().unwrap_or_default());
                if !disk.is_file() {
                    return ToolOutput::err(1, format!("Could not open '{}'", disk.display()));
                }
                let snaps = self.snapshots.lock().get(&disk).cloned().unwrap_or_default();
                let entries: Vec<_> = snaps
                    .iter()
                    .map(|name| serde_json::json!({ "name": name, "vm-state-size": 0, "date-sec": 1_700_000_000 }))
                    .collect();
                ToolOutput::ok(serde_json::json!({ "format": "qcow2", "snapshots": entries }).to_string())
            }
            Some("snapshot") => {
                let (flag, name, disk) = (&args[1], args[2].clone(), PathBuf::from(&args[3]));
                let mut all = self.snapshots.lock();
                let snaps = all.entry(disk).or_default();
                match flag.as_str() {
                    "-c" => snaps.push(name),
                    "-d" => snaps.retain(|s| *s != name),
                    _ => {}
                }
                ToolOutput::ok("")
            }
            _ => ToolOutput::err(1, "unsupported qemu-img call"),
        }
    }

    fn launch(&self, script: &Path) -> io::Result<ToolOutput> {
        let dir = script
            .parent()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "script has no parent"))?;
        let name = dir.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
        let root = dir.parent().unwrap_or(dir);
        let paths = VmPaths::new(root, &name);

        let child = Command::new("sleep").arg("300").spawn()?;
        std::fs::write(paths.pidfile(), child.id().to_string())?;
        self.guests.lock().push(child);
        Ok(ToolOutput::ok(""))
    }
}

impl Drop for FakeQemu {
    fn drop(&mut self) {
        for child in self.guests.lock().iter_mut() {
            let _ = child.kill();
            let _ = child.wait();
        }
    }
}

#[async_trait]
impl CommandRunner for FakeQemu {
    async fn run(&self, program: &str, args: &[String], _timeout: Duration) -> io::Result<ToolOutput> {
        self.calls.lock().push(format!("{} {}", program, args.join(" ")));
        match program {
            "qemu-img" => Ok(self.qemu_img(args)),
            "bash" => self.launch(Path::new(&args[0])),
            "qemu-system-x86_64" => Ok(ToolOutput::ok("QEMU emulator version 8.2.0")),
            other => Err(io::Error::new(io::ErrorKind::NotFound, other.to_string())),
        }
    }

    async fn run_interactive(&self, program: &str, _args: &[String]) -> io::Result<Option<i32>> {
        Err(io::Error::new(io::ErrorKind::NotFound, program.to_string()))
    }

    fn has_binary(&self, program: &str) -> bool {
        matches!(program, "qemu-img" | "qemu-system-x86_64")
    }
}

/// A manager over every driver, with only the QEMU tooling "installed".
pub struct Harness {
    pub root: tempfile::TempDir,
    pub tools: Arc<FakeQemu>,
    pub manager: Arc<VmManager>,
    pub iso: PathBuf,
}

impl Harness {
    pub fn new() -> Self {
        let root = tempfile::tempdir().unwrap();
        let iso = root.path().join("install.iso");
        std::fs::write(&iso, b"CD001").unwrap();

        let vm_root = root.path().join("vms");
        std::fs::create_dir_all(&vm_root).unwrap();

        let tools = Arc::new(FakeQemu::default());
        let mut ctx = DriverContext::new(&vm_root, tools.clone());
        ctx.stop_timeout = Duration::from_secs(2);
        let settings = ManagerSettings::new(root.path().join("iso"), "tester");
        let manager = Arc::new(VmManager::new(ctx, None, settings));

        Self {
            root,
            tools,
            manager,
            iso,
        }
    }

    pub fn config(&self, name: &str) -> VmConfig {
        let mut config = VmConfig::new(name);
        config.iso = Some(self.iso.clone());
        config.ram = "512M".to_string();
        config.disk_size = "1G".to_string();
        config
    }

    pub fn vm_dir(&self, name: &str) -> PathBuf {
        self.manager.vm_root().join(name)
    }

    pub async fn create(&self, name: &str) -> BackendKind {
        self.manager.create(self.config(name)).await.unwrap()
    }
}
