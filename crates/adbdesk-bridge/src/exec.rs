use std::{
    io,
    path::{Path, PathBuf},
    process::Stdio,
    time::Duration,
};

use serde::Serialize;
use tokio::{
    io::{AsyncBufReadExt, BufReader, Lines},
    process::{Child, ChildStdout, Command},
};
use tracing::warn;

use crate::error::{BridgeError, Result};

/// Exit code reported when the process did not run to completion
/// (timeout or launch failure).
pub const EXIT_CODE_INCOMPLETE: i32 = -1;

/// How long `StreamHandle::cancel` waits for a killed child to be reaped.
pub const STREAM_KILL_GRACE: Duration = Duration::from_millis(500);

/// Outcome of one tool invocation. Produced for every process that ran to
/// completion, including non-zero exits; immutable once returned.
#[derive(Clone, Debug, Serialize)]
pub struct ExecutionResult {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl ExecutionResult {
    /// The `-1` sentinel value for operations that did not complete, with
    /// the reason carried in stderr for display.
    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            success: false,
            stdout: String::new(),
            stderr: message.into(),
            exit_code: EXIT_CODE_INCOMPLETE,
        }
    }

    fn from_output(output: std::process::Output) -> Self {
        Self {
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            exit_code: output.status.code().unwrap_or(EXIT_CODE_INCOMPLETE),
        }
    }
}

/// Runs the external device-bridge tool. Explicitly constructed and passed
/// by reference; tests build their own instance pointing at whatever binary
/// they need.
#[derive(Clone, Debug)]
pub struct ToolRunner {
    tool: PathBuf,
}

impl ToolRunner {
    pub fn new(tool: PathBuf) -> Self {
        Self { tool }
    }

    /// Resolve the tool the way the desktop app does: explicit env override,
    /// then the SDK platform-tools directory, then the search path.
    pub fn from_env() -> Self {
        Self::new(resolve_tool_path())
    }

    pub fn tool(&self) -> &Path {
        &self.tool
    }

    /// Run the tool to completion with a hard timeout. Arguments are always
    /// passed as a vector, never through a shell, so device ids and command
    /// text containing metacharacters round-trip unharmed. On timeout the
    /// child is force-killed and `Err(Timeout)` returned; the process is
    /// never left running.
    pub async fn run<I, S>(&self, args: I, timeout: Duration) -> Result<ExecutionResult>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<std::ffi::OsStr>,
    {
        let mut cmd = Command::new(&self.tool);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let child = cmd.spawn().map_err(|e| self.spawn_error(e))?;

        match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => Ok(ExecutionResult::from_output(output)),
            Ok(Err(e)) => Err(BridgeError::Launch(e.to_string())),
            // Dropping the wait future drops the child; kill_on_drop reaps it.
            Err(_) => Err(BridgeError::Timeout(timeout)),
        }
    }

    /// Launch the tool as a long-lived stream of output lines. The handle is
    /// infinite and not restartable; `cancel` terminates the child.
    pub fn start_stream<I, S>(&self, args: I) -> Result<StreamHandle>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<std::ffi::OsStr>,
    {
        let mut cmd = Command::new(&self.tool);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| self.spawn_error(e))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| BridgeError::Launch("failed to capture tool stdout".into()))?;

        Ok(StreamHandle {
            child,
            lines: BufReader::new(stdout).lines(),
        })
    }

    fn spawn_error(&self, e: io::Error) -> BridgeError {
        if e.kind() == io::ErrorKind::NotFound {
            BridgeError::ToolNotFound {
                path: self.tool.clone(),
            }
        } else {
            BridgeError::Launch(e.to_string())
        }
    }
}

pub(crate) fn resolve_tool_path() -> PathBuf {
    if let Ok(path) = std::env::var("ADBDESK_ADB_PATH") {
        return adbdesk_util::expand_user(&path);
    }
    if let Ok(path) = std::env::var("ADB_PATH") {
        return adbdesk_util::expand_user(&path);
    }
    if let Ok(sdk_root) =
        std::env::var("ANDROID_SDK_ROOT").or_else(|_| std::env::var("ANDROID_HOME"))
    {
        let candidate = PathBuf::from(&sdk_root).join("platform-tools").join("adb");
        if candidate.exists() {
            return candidate;
        }
        let candidate = PathBuf::from(&sdk_root)
            .join("platform-tools")
            .join("adb.exe");
        if candidate.exists() {
            return candidate;
        }
    }
    PathBuf::from("adb")
}

/// A running child process read line by line.
pub struct StreamHandle {
    child: Child,
    lines: Lines<BufReader<ChildStdout>>,
}

impl StreamHandle {
    /// Next output line; `Ok(None)` means the stream ended (process exited
    /// or the device detached).
    pub async fn next_line(&mut self) -> io::Result<Option<String>> {
        self.lines.next_line().await
    }

    /// Terminate the child and unblock any pending read. Waits a bounded
    /// grace period for the process to be reaped, then gives up on it; the
    /// kill signal has already been delivered either way.
    pub async fn cancel(mut self) {
        if let Err(e) = self.child.start_kill() {
            // Already exited is the common case here.
            if e.kind() != io::ErrorKind::InvalidInput {
                warn!("failed to kill streamed child: {e}");
            }
        }
        match tokio::time::timeout(STREAM_KILL_GRACE, self.child.wait()).await {
            Ok(Ok(_)) | Ok(Err(_)) => {}
            Err(_) => warn!("streamed child not reaped within {STREAM_KILL_GRACE:?}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    fn runner(tool: &str) -> ToolRunner {
        ToolRunner::new(PathBuf::from(tool))
    }

    #[tokio::test]
    async fn run_captures_stdout_and_exit_code() {
        let result = runner("echo")
            .run(["hello", "world"], Duration::from_secs(5))
            .await
            .unwrap();
        assert!(result.success);
        assert_eq!(result.exit_code, 0);
        assert_eq!(result.stdout.trim(), "hello world");
    }

    #[tokio::test]
    async fn nonzero_exit_is_a_result_not_an_error() {
        let result = runner("false")
            .run(Vec::<String>::new(), Duration::from_secs(5))
            .await
            .unwrap();
        assert!(!result.success);
        assert_ne!(result.exit_code, 0);
        assert_ne!(result.exit_code, EXIT_CODE_INCOMPLETE);
    }

    #[tokio::test]
    async fn missing_tool_is_a_distinct_error() {
        let err = runner("adbdesk-no-such-tool-xyz")
            .run(["devices"], Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(err.is_tool_not_found());
    }

    #[tokio::test]
    async fn timeout_returns_promptly_and_kills_the_child() {
        let started = Instant::now();
        let err = runner("sleep")
            .run(["5"], Duration::from_millis(200))
            .await
            .unwrap_err();
        assert!(err.is_timeout());
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn stream_yields_lines_then_ends() {
        let mut handle = runner("sh")
            .start_stream(["-c", "echo one; echo two"])
            .unwrap();
        assert_eq!(handle.next_line().await.unwrap().as_deref(), Some("one"));
        assert_eq!(handle.next_line().await.unwrap().as_deref(), Some("two"));
        assert_eq!(handle.next_line().await.unwrap(), None);
    }

    #[tokio::test]
    async fn cancel_terminates_a_silent_child_quickly() {
        let handle = runner("sleep").start_stream(["10"]).unwrap();
        let started = Instant::now();
        handle.cancel().await;
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn env_tool_path_expands_home_prefix() {
        if let Ok(home) = std::env::var("HOME") {
            std::env::set_var("ADBDESK_ADB_PATH", "~/platform-tools/adb");
            let resolved = resolve_tool_path();
            std::env::remove_var("ADBDESK_ADB_PATH");
            assert_eq!(resolved, PathBuf::from(home).join("platform-tools/adb"));
        }
    }

    #[test]
    fn failure_result_uses_the_sentinel_code() {
        let result = ExecutionResult::failure("command timed out after 30s");
        assert!(!result.success);
        assert_eq!(result.exit_code, EXIT_CODE_INCOMPLETE);
        assert!(result.stderr.contains("timed out"));
    }
}
