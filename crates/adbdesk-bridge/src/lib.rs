//! Desktop-side bridge to Android devices over the platform debug tool:
//! device discovery and state tracking, per-device command execution, and
//! live log stream capture with filtering.

pub mod device;
pub mod discovery;
pub mod error;
pub mod events;
pub mod exec;
pub mod ids;
pub mod logcat;
pub mod props;
pub mod registry;
pub mod session;

pub use device::{ConnectionKind, Device, DeviceState};
pub use discovery::{DiscoveryConfig, DiscoveryMonitor};
pub use error::{BridgeError, Result};
pub use events::{DeviceEvent, DeviceEventKind, EventBus};
pub use exec::{ExecutionResult, ToolRunner};
pub use logcat::{
    FilterConfig, Level, LevelSet, LogBuffer, LogFormat, LogLine, LogStreamWorker,
    StartOptions, StreamEnd, StreamUpdate,
};
pub use registry::{DeviceRegistry, RegistryDelta, RegistrySnapshot};
pub use session::CommandSession;
