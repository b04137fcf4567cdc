//! Drivers of the external operations. They run without any lock held and
//! report a single outcome that is applied to the engine afterwards.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use bbcore::JobId;
use bbcore::comm::{Operation, OperationResult, StageInOutcome};

use crate::common::utils::fs::write_host_file;
use crate::config::TimeoutConfig;
use crate::controller::comm::PreparedOperation;
use crate::controller::scheduler::JobScheduler;
use crate::tool::response::{RealSizeResponse, parse, real_size};
use crate::tool::{ToolExecutor, args, run_tool};

const CLIENT_NODES_FILE: &str = "client_nids";
const EXEC_HOST_FILE: &str = "exec_host";

/// What an operation needs besides the job record
#[derive(Clone)]
pub(crate) struct OperationEnv {
    pub executor: Arc<dyn ToolExecutor>,
    pub scheduler: Arc<dyn JobScheduler>,
    pub timeouts: TimeoutConfig,
    pub node_ready_timeout: Duration,
    pub node_ready_poll: Duration,
}

#[derive(Debug)]
pub(crate) enum OperationOutcome {
    StageIn(StageInOutcome),
    Finished(OperationResult),
}

fn write_node_file(job_dir: &Path, name: &str, hosts: &[String]) -> Result<PathBuf, String> {
    std::fs::create_dir_all(job_dir)
        .map_err(|error| format!("cannot create {}: {error}", job_dir.display()))?;
    let path = job_dir.join(name);
    write_host_file(&path, hosts)
        .map_err(|error| format!("cannot write {}: {error}", path.display()))?;
    Ok(path)
}

pub(crate) async fn run_operation(env: OperationEnv, prepared: PreparedOperation) -> OperationOutcome {
    let PreparedOperation {
        operation,
        script,
        job_dir,
        hosts,
    } = prepared;
    let executor = env.executor.as_ref();
    let timeouts = &env.timeouts;
    let result = match operation {
        Operation::StageIn {
            job_id,
            user_id,
            group_id,
            pool,
            size,
        } => {
            let host_file = match hosts {
                Some(hosts) => match write_node_file(&job_dir, CLIENT_NODES_FILE, &hosts) {
                    Ok(path) => Some(path),
                    Err(message) => {
                        return OperationOutcome::StageIn(StageInOutcome::Failed {
                            setup_done: false,
                            message,
                        });
                    }
                },
                None => None,
            };
            let setup = args::setup(
                job_id,
                user_id,
                group_id,
                &pool,
                size,
                &script,
                host_file.as_deref(),
            );
            return OperationOutcome::StageIn(stage_in(executor, timeouts, job_id, size, &script, setup).await);
        }
        Operation::PreRun { job_id } => pre_run(&env, job_id, &script, &job_dir).await,
        Operation::PostRun { job_id } => {
            run_tool(executor, args::post_run(job_id, &script), timeouts.other).await
        }
        Operation::StageOut { job_id } => {
            run_tool(executor, args::data_out(job_id, &script), timeouts.stage_out).await
        }
        Operation::Teardown { job_id, hurry, .. } => {
            let result =
                run_tool(executor, args::teardown(job_id, &script, hurry), timeouts.other).await;
            if result.is_ok() && job_dir.exists() {
                if let Err(error) = std::fs::remove_dir_all(&job_dir) {
                    log::warn!("Cannot remove {}: {error}", job_dir.display());
                }
            }
            result
        }
        Operation::CreatePersistent {
            name,
            user_id,
            pool,
            size,
            access,
            buffer_type,
            ..
        } => {
            let argv = args::create_persistent(
                &name,
                user_id,
                &pool,
                size,
                access.as_deref(),
                buffer_type.as_deref(),
            );
            run_tool(executor, argv, timeouts.other).await
        }
        Operation::DestroyPersistent { name, hurry, .. } => {
            run_tool(
                executor,
                args::destroy_persistent(&name, &script, hurry),
                timeouts.other,
            )
            .await
        }
    };
    OperationOutcome::Finished(result.map(|_| ()))
}

/// setup, size query and data stage-in
async fn stage_in(
    executor: &dyn ToolExecutor,
    timeouts: &TimeoutConfig,
    job_id: JobId,
    size: u64,
    script: &Path,
    setup: Vec<String>,
) -> StageInOutcome {
    if let Err(message) = run_tool(executor, setup, timeouts.other).await {
        return StageInOutcome::Failed {
            setup_done: false,
            message,
        };
    }

    let real_size = if size > 0 {
        let size = run_tool(executor, args::real_size(job_id), timeouts.other)
            .await
            .map_err(anyhow::Error::msg)
            .and_then(|output| parse::<RealSizeResponse>("real_size", &output))
            .and_then(real_size);
        match size {
            Ok(size) => Some(size),
            Err(error) => {
                log::warn!("Cannot get real size of job {job_id} buffer: {error:#}");
                None
            }
        }
    } else {
        None
    };

    match run_tool(executor, args::data_in(job_id, script), timeouts.stage_in).await {
        Ok(_) => StageInOutcome::Finished { real_size },
        Err(message) => StageInOutcome::Failed {
            setup_done: true,
            message,
        },
    }
}

/// Waits until the scheduler reports the nodes of the job as ready. Only the
/// scheduler lock is taken, for each poll separately.
async fn wait_for_nodes(env: &OperationEnv, job_id: JobId) -> Result<(), String> {
    let deadline = tokio::time::Instant::now() + env.node_ready_timeout;
    loop {
        if env.scheduler.lock_jobs().nodes_ready(job_id) {
            return Ok(());
        }
        if tokio::time::Instant::now() >= deadline {
            return Err(format!(
                "nodes of job {job_id} not ready after {}",
                humantime::format_duration(env.node_ready_timeout)
            ));
        }
        tokio::time::sleep(env.node_ready_poll).await;
    }
}

async fn pre_run(
    env: &OperationEnv,
    job_id: JobId,
    script: &Path,
    job_dir: &Path,
) -> Result<String, String> {
    wait_for_nodes(env, job_id).await?;
    let hosts = env.scheduler.lock_jobs().node_hosts(job_id);
    let (host_file, exec_file) = match hosts {
        Some(hosts) if !hosts.is_empty() => {
            let host_file = write_node_file(job_dir, CLIENT_NODES_FILE, &hosts)?;
            let exec_file = write_node_file(job_dir, EXEC_HOST_FILE, &hosts[..1])?;
            (Some(host_file), Some(exec_file))
        }
        _ => (None, None),
    };
    let argv = args::pre_run(job_id, script, host_file.as_deref(), exec_file.as_deref());
    run_tool(env.executor.as_ref(), argv, env.timeouts.other).await
}

/// Lets the tool check the directives of a job script
pub(crate) async fn validate_script(
    executor: &dyn ToolExecutor,
    timeouts: &TimeoutConfig,
    script: &Path,
) -> Result<(), String> {
    run_tool(executor, args::job_process(script), timeouts.validate)
        .await
        .map(|_| ())
}
