//! The controller object the scheduler talks to.
//!
//! Lock order: the scheduler job lock (through [`JobScheduler::lock_jobs`])
//! is always taken before the controller lock. Neither is held while an
//! external operation runs; operations are dispatched to the
//! [`OperationRunner`] after both are released and their results are applied
//! in a fresh lock section.

mod comm;
mod ops;
mod recovery;
mod refresh;
pub mod scheduler;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use bbcore::admission::{Admission, estimate_start};
use bbcore::comm::Operation;
use bbcore::engine::{Core, StatusReport};
use bbcore::reactor;
use bbcore::request::{JobInfo, StageInStatus, StageOutStatus};
use bbcore::{Timestamp, WrappedArcMutex};
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use tokio::runtime::Handle;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::{BbConfig, BbFlags};
use crate::controller::comm::{CommSender, Effects, PreparedOperation};
use crate::controller::ops::{OperationEnv, OperationOutcome, run_operation};
use crate::controller::scheduler::{JobScheduler, JobTable};
use crate::persist::{StateSaver, StoredAllocation};
use crate::runner::{OperationRunner, RunError};
use crate::tool::{ToolExecutor, create_executor};
use crate::{JobId, Map};

/// Prefix of the trackable resources reported to the scheduler
pub const TRES_PREFIX: &str = "bb/";

struct ControllerInner {
    core: WrappedArcMutex<Core>,
    scheduler: Arc<dyn JobScheduler>,
    executor: Arc<dyn ToolExecutor>,
    runner: OperationRunner,
    saver: StateSaver,
    config: RwLock<BbConfig>,
    config_path: Option<PathBuf>,
    /// Fixed for the lifetime of the controller, changes need a restart
    state_dir: PathBuf,
    runtime: Handle,

    /// Dispatched operations whose result was not applied yet
    pending: AtomicUsize,
    idle: Notify,

    stop: CancellationToken,
    refresh: Mutex<Option<JoinHandle<()>>>,
}

#[derive(Clone)]
pub struct Controller {
    inner: Arc<ControllerInner>,
}

impl Controller {
    /// Starts the controller with the backend selected by the configuration.
    ///
    /// Recovers the recorded allocations and spawns the refresh task. Must be
    /// called from within a tokio runtime.
    pub async fn start(
        config: BbConfig,
        config_path: Option<PathBuf>,
        scheduler: Arc<dyn JobScheduler>,
    ) -> crate::Result<Controller> {
        config.check()?;
        let executor = create_executor(&config)?;
        Self::start_with_executor(config, config_path, scheduler, executor).await
    }

    pub async fn start_with_executor(
        config: BbConfig,
        config_path: Option<PathBuf>,
        scheduler: Arc<dyn JobScheduler>,
        executor: Arc<dyn ToolExecutor>,
    ) -> crate::Result<Controller> {
        std::fs::create_dir_all(&config.state_dir)?;
        log::info!(
            "Starting burst buffer controller {} with backend {}, state in {}",
            crate::BB_VERSION,
            executor.name(),
            config.state_dir.display()
        );

        let mut core = Core::new(config.policy());
        core.ledger_mut()
            .set_default_pool(config.default_pool.clone());
        let core = WrappedArcMutex::wrap(core);

        let snapshot_core = core.clone();
        let saver = StateSaver::start(
            config.state_file(),
            config.flags.contains(BbFlags::EMULATE),
            config.save_debounce(),
            move || {
                snapshot_core
                    .lock()
                    .registry()
                    .sorted()
                    .into_iter()
                    .map(StoredAllocation::from_allocation)
                    .collect()
            },
        );

        let refresh_interval = config.refresh_interval();
        let controller = Controller {
            inner: Arc::new(ControllerInner {
                core,
                scheduler,
                executor,
                runner: OperationRunner::new(config.max_concurrent_operations),
                saver,
                state_dir: config.state_dir.clone(),
                config: RwLock::new(config),
                config_path,
                runtime: Handle::current(),
                pending: AtomicUsize::new(0),
                idle: Notify::new(),
                stop: CancellationToken::new(),
                refresh: Mutex::new(None),
            }),
        };

        if let Err(error) = controller.periodic_refresh(true).await {
            log::error!("Burst buffer controller cannot start: {error}");
            controller.inner.stop.cancel();
            controller.inner.saver.stop().await;
            return Err(error);
        }

        let handle = tokio::spawn(refresh::refresh_process(
            controller.clone(),
            refresh_interval,
            controller.inner.stop.clone(),
        ));
        *controller.inner.refresh.lock() = Some(handle);
        Ok(controller)
    }

    /// Runs `f` with the scheduler job lock and the controller lock held, in
    /// this order. Effects collected by `f` are applied to the job records
    /// after the controller lock is released; operations are dispatched after
    /// both locks are released.
    fn with_locks<R>(
        &self,
        f: impl FnOnce(&mut Core, &mut CommSender, &mut dyn JobTable) -> R,
    ) -> R {
        let mut table = self.inner.scheduler.lock_jobs();
        let mut comm = CommSender::default();
        let result = {
            let mut core = self.inner.core.lock();
            f(&mut core, &mut comm, &mut *table)
        };
        let effects = comm.apply(&mut *table, &self.inner.state_dir);
        drop(table);
        self.carry_out(effects);
        result
    }

    fn carry_out(&self, effects: Effects) {
        if effects.save {
            self.inner.saver.request_save();
        }
        for operation in effects.operations {
            self.dispatch(operation);
        }
    }

    fn operation_env(&self) -> OperationEnv {
        let config = self.inner.config.read();
        OperationEnv {
            executor: self.inner.executor.clone(),
            scheduler: self.inner.scheduler.clone(),
            timeouts: config.timeouts.clone(),
            node_ready_timeout: config.node_ready_timeout,
            node_ready_poll: config.node_ready_poll,
        }
    }

    fn dispatch(&self, prepared: PreparedOperation) {
        let operation = prepared.operation.clone();
        let label = format!("{} of job {}", operation.kind(), operation.job_id());
        self.inner.pending.fetch_add(1, Ordering::SeqCst);

        let delay = match &operation {
            Operation::Teardown { delay, .. } => *delay,
            _ => Duration::ZERO,
        };

        let _guard = self.inner.runtime.enter();
        let receiver = self.inner.runner.submit_after(
            label,
            delay,
            run_operation(self.operation_env(), prepared),
        );
        let controller = self.clone();
        tokio::spawn(async move {
            match receiver.await {
                Ok(Ok(outcome)) => controller.complete(operation, outcome),
                Ok(Err(RunError::Shutdown)) | Err(_) => {
                    let error = crate::Error::OperationFailure {
                        operation: operation.kind().name(),
                        message: RunError::Shutdown.to_string(),
                        shutdown: true,
                    };
                    log::warn!("Job {}: {error}", operation.job_id());
                }
            }
            if controller.inner.pending.fetch_sub(1, Ordering::SeqCst) == 1 {
                controller.inner.idle.notify_waiters();
            }
        });
    }

    /// Applies the result of an operation to the engine.
    fn complete(&self, operation: Operation, outcome: OperationOutcome) {
        let job_id = operation.job_id();
        let now = Utc::now();
        let result = match outcome {
            OperationOutcome::StageIn(outcome) => {
                self.with_locks(|core, comm, _| {
                    reactor::on_stage_in_finished(core, comm, job_id, outcome, now)
                });
                return;
            }
            OperationOutcome::Finished(result) => result,
        };
        if let Err(message) = &result {
            let error = crate::Error::OperationFailure {
                operation: operation.kind().name(),
                message: message.clone(),
                shutdown: false,
            };
            log::warn!("Job {job_id}: {error}");
        }
        self.with_locks(|core, comm, _| match operation {
            Operation::PreRun { .. } => {
                reactor::on_pre_run_finished(core, comm, job_id, result, now)
            }
            Operation::PostRun { .. } => {
                reactor::on_post_run_finished(core, comm, job_id, result, now)
            }
            Operation::StageOut { .. } => {
                reactor::on_stage_out_finished(core, comm, job_id, result, now)
            }
            Operation::Teardown { .. } => {
                reactor::on_teardown_finished(core, comm, job_id, result, now)
            }
            Operation::CreatePersistent { name, .. } | Operation::DestroyPersistent { name, .. } => {
                reactor::on_persistent_finished(core, comm, job_id, &name, result, now)
            }
            Operation::StageIn { .. } => {
                log::error!("Stage-in of job {job_id} finished without a stage-in outcome");
            }
        })
    }

    /// Decides whether a pending job may get its burst buffer now.
    pub fn admit(&self, info: &JobInfo) -> Admission {
        let now = Utc::now();
        self.with_locks(|core, comm, table| {
            let reservations = table.reservations();
            reactor::on_admit(core, comm, info, &reservations, now)
        })
    }

    /// The job was started by the scheduler; runs the pre-run phase.
    pub fn begin(&self, job_id: JobId) -> crate::Result<()> {
        let now = Utc::now();
        self.with_locks(|core, comm, _| reactor::on_job_begin(core, comm, job_id, now))?;
        Ok(())
    }

    /// The job's tasks finished; runs post-run and stage-out.
    pub fn stage_out(&self, job_id: JobId) -> crate::Result<()> {
        let now = Utc::now();
        self.with_locks(|core, comm, _| reactor::on_stage_out_start(core, comm, job_id, now))?;
        Ok(())
    }

    pub fn cancel(&self, job_id: JobId) {
        let now = Utc::now();
        self.with_locks(|core, comm, _| reactor::on_cancel(core, comm, job_id, now));
    }

    /// The scheduler takes back the nodes of a job in pre-run.
    pub fn revoke_allocation(&self, job_id: JobId) -> crate::Result<()> {
        self.with_locks(|core, comm, _| reactor::on_allocation_revoked(core, comm, job_id))?;
        Ok(())
    }

    /// When the job could get its buffer; does not change any state.
    pub fn estimated_start(&self, info: &JobInfo) -> Option<Timestamp> {
        let table = self.inner.scheduler.lock_jobs();
        let reservations = table.reservations();
        let core = self.inner.core.lock();
        estimate_start(&core, info, &reservations, Utc::now())
    }

    /// Fills in the used space of every pool under `bb/<pool>`.
    pub fn set_resource_usage(&self, usage: &mut Map<String, u64>) {
        let core = self.inner.core.lock();
        for (pool, used) in core.ledger().tres_usage() {
            usage.insert(format!("{TRES_PREFIX}{pool}"), used);
        }
    }

    pub fn stage_in_status(&self, job_id: JobId) -> StageInStatus {
        reactor::stage_in_status(&self.inner.core.lock(), job_id)
    }

    pub fn stage_out_status(&self, job_id: JobId) -> StageOutStatus {
        reactor::stage_out_status(&self.inner.core.lock(), job_id)
    }

    /// Drops the buffer record of a job that the scheduler forgot.
    pub fn purge_job(&self, job_id: JobId) -> crate::Result<()> {
        reactor::purge_job(&mut self.inner.core.lock(), job_id)?;
        Ok(())
    }

    pub fn status_report(&self) -> StatusReport {
        self.inner.core.lock().status()
    }

    /// Lets the provisioning tool check the directives of a job script.
    pub async fn validate_job_script(&self, script: &Path) -> crate::Result<()> {
        let timeouts = self.inner.config.read().timeouts.clone();
        ops::validate_script(self.inner.executor.as_ref(), &timeouts, script)
            .await
            .map_err(|message| crate::Error::OperationFailure {
                operation: "validation",
                message,
                shutdown: false,
            })
    }

    /// Re-reads pools and sessions from the storage system. The initial
    /// refresh also recovers the recorded allocations.
    pub async fn periodic_refresh(&self, initial: bool) -> crate::Result<()> {
        refresh::refresh(self, initial).await
    }

    /// Reloads the configuration file the controller was started with.
    pub fn reconfigure(&self) -> crate::Result<()> {
        let Some(path) = &self.inner.config_path else {
            log::debug!("No configuration file to reload");
            return Ok(());
        };
        let config = BbConfig::load(path)?;
        {
            let current = self.inner.config.read();
            let restart_only = [
                ("backend", current.backend != config.backend),
                ("tool_path", current.tool_path != config.tool_path),
                ("state_dir", current.state_dir != config.state_dir),
                (
                    "max_concurrent_operations",
                    current.max_concurrent_operations != config.max_concurrent_operations,
                ),
                ("save_debounce", current.save_debounce != config.save_debounce),
                (
                    "refresh_interval",
                    current.refresh_interval != config.refresh_interval,
                ),
                ("emulated_pools", current.emulated_pools != config.emulated_pools),
            ];
            for (field, _) in restart_only.iter().filter(|(_, changed)| *changed) {
                log::warn!("Change of `{field}` takes effect after restart");
            }
        }
        {
            let mut core = self.inner.core.lock();
            core.set_policy(config.policy());
            if config.default_pool.is_some() {
                core.ledger_mut()
                    .set_default_pool(config.default_pool.clone());
            }
        }
        *self.inner.config.write() = config;
        log::info!("Configuration reloaded from {}", path.display());
        Ok(())
    }

    /// Waits until every dispatched operation had its result applied,
    /// including the operations dispatched by those results.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.inner.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.inner.pending.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Stops the refresh task, drains the operation runner and writes the
    /// state file one last time. Operations abandoned after the grace period
    /// leave the recorded state unchanged.
    pub async fn shutdown(&self) {
        log::info!("Stopping burst buffer controller");
        self.inner.stop.cancel();
        let handle = self.inner.refresh.lock().take();
        if let Some(handle) = handle {
            if let Err(error) = handle.await {
                log::error!("Refresh task failed: {error}");
            }
        }
        let grace = self.inner.config.read().shutdown_grace;
        self.inner.runner.shutdown(grace).await;
        self.wait_idle().await;
        self.inner.saver.stop().await;
    }
}
