//! Invocation of the external provisioning tool.
//!
//! Every backend receives the same argument vectors (see [`args`]) and answers
//! with an exit status and text (usually JSON) on standard output.

pub mod args;
pub mod emulated;
pub mod process;
pub mod query;
pub mod response;

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use crate::config::{BbConfig, DATAWARP_BACKEND, EMULATED_BACKEND};
use crate::tool::emulated::EmulatedExecutor;
use crate::tool::process::ProcessExecutor;

pub type ToolResult<T> = anyhow::Result<T>;

pub type ToolFuture = Pin<Box<dyn Future<Output = ToolResult<ToolOutput>> + Send>>;

/// Raw result of a single tool invocation
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ToolOutput {
    /// `None` if the process was killed by a signal
    pub status: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl ToolOutput {
    pub fn ok(stdout: impl Into<String>) -> Self {
        ToolOutput {
            status: Some(0),
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    pub fn failed(status: i32, message: impl Into<String>) -> Self {
        ToolOutput {
            status: Some(status),
            stdout: message.into(),
            stderr: String::new(),
        }
    }

    pub fn success(&self) -> bool {
        self.status == Some(0)
    }

    /// Standard output on success, the diagnostics otherwise
    pub fn into_result(self) -> Result<String, String> {
        if self.success() {
            return Ok(self.stdout);
        }
        let mut message = match self.status {
            Some(code) => format!("exit code {code}"),
            None => "killed by signal".to_string(),
        };
        for text in [self.stdout.trim(), self.stderr.trim()] {
            if !text.is_empty() {
                message.push_str(": ");
                message.push_str(text);
            }
        }
        Err(message)
    }
}

/// A provisioning backend.
pub trait ToolExecutor: Send + Sync {
    fn name(&self) -> &'static str;

    /// Runs the tool with `argv` (function name first). The invocation is
    /// abandoned once `timeout` elapses.
    fn execute(&self, argv: Vec<String>, timeout: Duration) -> ToolFuture;
}

/// Creates the backend selected by `config.backend`.
pub fn create_executor(config: &BbConfig) -> crate::Result<Arc<dyn ToolExecutor>> {
    match config.backend.as_str() {
        DATAWARP_BACKEND => Ok(Arc::new(ProcessExecutor::new(&config.tool_path)?)),
        EMULATED_BACKEND => Ok(Arc::new(EmulatedExecutor::new(&config.emulated_pools))),
        backend => Err(crate::Error::ConfigError(format!(
            "Unknown backend `{backend}`"
        ))),
    }
}

/// Runs a query or operation and returns its standard output, failing on a
/// non-zero exit.
pub async fn run_tool(
    executor: &dyn ToolExecutor,
    argv: Vec<String>,
    timeout: Duration,
) -> Result<String, String> {
    let function = argv.first().cloned().unwrap_or_default();
    log::debug!("Running `{}` ({})", argv.join(" "), executor.name());
    match executor.execute(argv, timeout).await {
        Ok(output) => {
            log::trace!("Output of {function}: {output:?}");
            output.into_result()
        }
        Err(error) => Err(format!("{error:#}")),
    }
}
