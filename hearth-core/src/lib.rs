pub mod config;
pub mod group;
pub mod ipc;
pub mod protocol;
pub mod store;

pub use config::{load_config, HearthConfig};
pub use group::{normalize_group_id, GroupContainerConfig, MountSpec, RegisteredGroup};
pub use ipc::{IpcMessage, IpcSource, IpcTaskOp};
pub use protocol::{strip_internal_blocks, AgentEvent, AgentInput, AgentRecord, TurnRequest};
pub use store::{now_iso, ScheduledTask, Store};
