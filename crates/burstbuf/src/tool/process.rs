use std::path::{Path, PathBuf};
use std::process::{Output, Stdio};
use std::sync::LazyLock;
use std::time::Duration;

use anyhow::Context;
use bstr::ByteSlice;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use parking_lot::Mutex;
use tokio::process::Command;

use crate::Map;
use crate::config::DATAWARP_BACKEND;
use crate::tool::{ToolExecutor, ToolFuture, ToolOutput};

/// Results of tool lookups, so that a missing tool is reported once and not
/// probed again on every start.
static TOOL_LOOKUP: LazyLock<Mutex<Map<PathBuf, Result<PathBuf, String>>>> =
    LazyLock::new(Default::default);

fn resolve_tool(path: &Path) -> Result<PathBuf, String> {
    TOOL_LOOKUP
        .lock()
        .entry(path.to_path_buf())
        .or_insert_with(|| {
            which::which(path).map_err(|error| {
                log::error!("Provisioning tool {} is not usable: {error}", path.display());
                format!("Cannot find provisioning tool {}: {error}", path.display())
            })
        })
        .clone()
}

/// Runs the provisioning tool as a child process.
pub struct ProcessExecutor {
    tool: PathBuf,
}

impl ProcessExecutor {
    pub fn new(tool_path: &Path) -> crate::Result<Self> {
        let tool = resolve_tool(tool_path).map_err(crate::Error::ConfigError)?;
        Ok(Self { tool })
    }
}

impl ToolExecutor for ProcessExecutor {
    fn name(&self) -> &'static str {
        DATAWARP_BACKEND
    }

    fn execute(&self, argv: Vec<String>, timeout: Duration) -> ToolFuture {
        let tool = self.tool.clone();
        Box::pin(async move { run_process(&tool, &argv, timeout).await })
    }
}

pub fn create_command(program: &Path, args: &[String]) -> Command {
    let mut command = Command::new(program);
    command.args(args);
    command.stdin(Stdio::null());
    command.stdout(Stdio::piped());
    command.stderr(Stdio::piped());
    // The tool spawns helpers of its own, the whole group is killed on timeout
    command.process_group(0);
    command.kill_on_drop(true);
    command
}

pub fn output_to_tool_output(output: Output) -> ToolOutput {
    ToolOutput {
        status: output.status.code(),
        stdout: output.stdout.to_str_lossy().into_owned(),
        stderr: output.stderr.to_str_lossy().into_owned(),
    }
}

fn kill_group(pid: u32) {
    if let Err(error) = signal::killpg(Pid::from_raw(pid as i32), Signal::SIGKILL) {
        log::debug!("Cannot kill process group {pid}: {error:?}");
    }
}

async fn run_process(tool: &Path, argv: &[String], timeout: Duration) -> anyhow::Result<ToolOutput> {
    let function = argv.first().map(String::as_str).unwrap_or_default();
    let child = create_command(tool, argv)
        .spawn()
        .with_context(|| format!("Cannot start {} {function}", tool.display()))?;
    let pid = child.id();

    match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(output) => {
            let output = output.with_context(|| format!("{function} execution failed"))?;
            Ok(output_to_tool_output(output))
        }
        Err(_) => {
            if let Some(pid) = pid {
                kill_group(pid);
            }
            anyhow::bail!(
                "{function} timed out after {}",
                humantime::format_duration(timeout)
            )
        }
    }
}
