pub mod connect;
pub mod error;
pub mod host;
pub mod instance;
pub mod layout;
pub mod locks;
pub mod manager;
pub mod process;
pub mod providers;
pub mod registry;
pub mod selector;
pub mod snapshot;

pub use error::{ErrorKind, Result, VmError};
pub use host::{HostReport, KvmStatus};
pub use instance::{
    BackendKind, NetworkConfig, NetworkMode, PortForward, Protocol, SnapshotInfo, SshEndpoint, SshOptions,
    VmConfig, VmInfo, VmState,
};
pub use manager::{BackendStatus, ManagerSettings, SshOutcome, VmManager};
pub use providers::{Backend, DriverContext};
pub use registry::Owner;
