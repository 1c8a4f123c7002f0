use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Failures the bridge reports as errors. A tool that ran and exited
/// non-zero is not one of them: that case is carried inside
/// [`crate::exec::ExecutionResult`] with its stderr preserved verbatim, so a
/// device-side failure can never be mistaken for a missing tool or a
/// timeout. Likewise a log stream reaching its end is a condition
/// ([`crate::logcat::StreamEnd`]), not an error.
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("device bridge tool not found: {} (set ADBDESK_ADB_PATH or ANDROID_SDK_ROOT)", path.display())]
    ToolNotFound { path: PathBuf },

    #[error("failed to launch device bridge tool: {0}")]
    Launch(String),

    #[error("command timed out after {0:?}")]
    Timeout(Duration),

    #[error("log stream already active for this device")]
    StreamActive,
}

impl BridgeError {
    pub fn is_tool_not_found(&self) -> bool {
        matches!(self, BridgeError::ToolNotFound { .. })
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, BridgeError::Timeout(_))
    }
}

pub type Result<T> = std::result::Result<T, BridgeError>;
