pub mod disk;
pub mod fstab;
pub mod host;
pub mod models;
pub mod mounts;
pub mod orchestrator;
pub mod postprocess;
pub mod remote;
pub mod state;
pub mod transfer_engine;

pub use disk::TargetDisk;
pub use host::LocalHost;
pub use models::{CommandOutput, DeviceTable, DiskLayout, FilesystemEntry, Stage, SwapDevice};
pub use mounts::{SourceMounts, UnmountPolicy};
pub use orchestrator::{MigrationRequest, Orchestrator};
pub use remote::{RemoteConnector, RemoteSession};
pub use state::MigrationTracker;
pub use transfer_engine::{TransferEngine, TransferRequest};
