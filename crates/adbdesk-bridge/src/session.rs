use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::runtime::Handle;
use tracing::{debug, warn};

use crate::error::Result;
use crate::exec::{ExecutionResult, ToolRunner};
use crate::props::parse_properties;

pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(30);

/// Context for issuing commands against one device: the id plus a default
/// timeout. Commands issued sequentially on one session complete in issue
/// order; sessions for different devices are fully independent.
#[derive(Clone)]
pub struct CommandSession {
    runner: Arc<ToolRunner>,
    device_id: String,
    default_timeout: Duration,
}

impl CommandSession {
    pub fn new(runner: Arc<ToolRunner>, device_id: impl Into<String>) -> Self {
        Self {
            runner,
            device_id: device_id.into(),
            default_timeout: DEFAULT_COMMAND_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// Run `<tool> -s <device> <command…>`. The command text is whitespace-
    /// split into an argument vector; empty text passes through unchanged
    /// (validation is the caller's concern). Nothing is ever joined into a
    /// shell string, so device ids with special characters round-trip.
    pub async fn execute(
        &self,
        command_text: &str,
        timeout: Option<Duration>,
    ) -> Result<ExecutionResult> {
        let mut args: Vec<&str> = vec!["-s", self.device_id.as_str()];
        args.extend(command_text.split_whitespace());
        debug!(device = %self.device_id, command = command_text, "executing command");
        self.runner
            .run(args, timeout.unwrap_or(self.default_timeout))
            .await
    }

    /// Run the text as a remote-shell invocation. The text is handed to the
    /// tool as a single argument; the device-side shell interprets it.
    pub async fn execute_shell(
        &self,
        command_text: &str,
        timeout: Option<Duration>,
    ) -> Result<ExecutionResult> {
        let args = ["-s", self.device_id.as_str(), "shell", command_text];
        debug!(device = %self.device_id, command = command_text, "executing shell command");
        self.runner
            .run(args, timeout.unwrap_or(self.default_timeout))
            .await
    }

    /// Like [`execute`](Self::execute) but never `Err`: launch failures and
    /// timeouts are flattened to the `-1` sentinel result with the message
    /// in stderr, for surfaces that only want something to display.
    pub async fn execute_lenient(
        &self,
        command_text: &str,
        timeout: Option<Duration>,
    ) -> ExecutionResult {
        match self.execute(command_text, timeout).await {
            Ok(result) => result,
            Err(err) => ExecutionResult::failure(err.to_string()),
        }
    }

    pub async fn execute_shell_lenient(
        &self,
        command_text: &str,
        timeout: Option<Duration>,
    ) -> ExecutionResult {
        match self.execute_shell(command_text, timeout).await {
            Ok(result) => result,
            Err(err) => ExecutionResult::failure(err.to_string()),
        }
    }

    /// Fetch and parse this device's property block. A tool-side failure
    /// yields an empty map with a warning, matching the listing surface's
    /// expectations.
    pub async fn get_properties(&self) -> Result<HashMap<String, String>> {
        let result = self.execute_shell("getprop", None).await?;
        if !result.success {
            warn!(
                device = %self.device_id,
                stderr = %result.stderr.trim(),
                "getprop failed"
            );
            return Ok(HashMap::new());
        }
        Ok(parse_properties(&result.stdout))
    }

    /// Synchronous variant for contexts that cannot suspend (a presentation
    /// thread). Captures the current runtime handle; the returned session
    /// must be driven from a thread outside the runtime.
    pub fn blocking(&self) -> BlockingSession {
        BlockingSession {
            inner: self.clone(),
            handle: Handle::current(),
        }
    }
}

/// Blocking facade over [`CommandSession`] with identical semantics.
pub struct BlockingSession {
    inner: CommandSession,
    handle: Handle,
}

impl BlockingSession {
    pub fn execute(&self, command_text: &str, timeout: Option<Duration>) -> Result<ExecutionResult> {
        self.handle.block_on(self.inner.execute(command_text, timeout))
    }

    pub fn execute_shell(
        &self,
        command_text: &str,
        timeout: Option<Duration>,
    ) -> Result<ExecutionResult> {
        self.handle
            .block_on(self.inner.execute_shell(command_text, timeout))
    }

    pub fn get_properties(&self) -> Result<HashMap<String, String>> {
        self.handle.block_on(self.inner.get_properties())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn echo_session(device_id: &str) -> CommandSession {
        CommandSession::new(Arc::new(ToolRunner::new(PathBuf::from("echo"))), device_id)
    }

    #[tokio::test]
    async fn execute_prefixes_device_selection() {
        // `echo` stands in for the tool, so stdout shows the exact argv.
        let result = echo_session("ABCD1234")
            .execute("shell ls /sdcard", None)
            .await
            .unwrap();
        assert_eq!(result.stdout.trim(), "-s ABCD1234 shell ls /sdcard");
    }

    #[tokio::test]
    async fn empty_command_text_passes_through_unchanged() {
        let result = echo_session("ABCD1234").execute("", None).await.unwrap();
        assert_eq!(result.stdout.trim(), "-s ABCD1234");
    }

    #[tokio::test]
    async fn shell_command_stays_one_argument() {
        let result = echo_session("ABCD1234")
            .execute_shell("getprop ro.product.model", None)
            .await
            .unwrap();
        assert_eq!(
            result.stdout.trim(),
            "-s ABCD1234 shell getprop ro.product.model"
        );
    }

    #[tokio::test]
    async fn device_id_with_special_characters_round_trips() {
        let result = echo_session("192.168.1.5:5555; rm -rf /")
            .execute("get-state", None)
            .await
            .unwrap();
        assert!(result.stdout.contains("192.168.1.5:5555; rm -rf /"));
    }

    #[tokio::test]
    async fn lenient_execution_flattens_errors_to_the_sentinel() {
        let session = CommandSession::new(
            Arc::new(ToolRunner::new(PathBuf::from("adbdesk-no-such-tool-xyz"))),
            "ABCD1234",
        );
        let result = session.execute_lenient("devices", None).await;
        assert!(!result.success);
        assert_eq!(result.exit_code, crate::exec::EXIT_CODE_INCOMPLETE);
        assert!(result.stderr.contains("not found"));
    }

    #[tokio::test]
    async fn sequential_commands_complete_in_issue_order() {
        let session = echo_session("ABCD1234");
        let first = session.execute("first", None).await.unwrap();
        let second = session.execute("second", None).await.unwrap();
        assert!(first.stdout.contains("first"));
        assert!(second.stdout.contains("second"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn blocking_session_works_off_the_runtime() {
        let session = echo_session("ABCD1234").blocking();
        let result = tokio::task::spawn_blocking(move || session.execute("get-state", None))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(result.stdout.trim(), "-s ABCD1234 get-state");
    }
}
