use std::path::PathBuf;
use std::sync::Arc;

use bbcore::admission::Admission;
use bbcore::registry::Allocation;
use bbcore::request::JobInfo;
use bbcore::JobId;
use log::LevelFilter;
use tempfile::TempDir;

use crate::config::BbConfig;
use crate::controller::Controller;
use crate::persist::{StateFile, read_state};
use crate::tests::utils::config::{TestConfig, TestConfigBuilder};
use crate::tests::utils::executor::ScriptedExecutor;
use crate::tests::utils::scheduler::TestScheduler;

pub struct TestCtx {
    pub dir: TempDir,
    pub config: TestConfig,
    pub scheduler: Arc<TestScheduler>,
    pub executor: ScriptedExecutor,
    pub controller: Controller,
}

impl TestCtx {
    pub async fn start(config: TestConfigBuilder) -> TestCtx {
        let config = config.finish().unwrap();
        let dir = TempDir::with_prefix("bb").unwrap();
        let scheduler = TestScheduler::new();
        let executor = ScriptedExecutor::new(&config.pools());
        let controller = start_controller(
            config.clone().into_config(dir.path()),
            &scheduler,
            &executor,
        )
        .await
        .unwrap();
        TestCtx {
            dir,
            config,
            scheduler,
            executor,
            controller,
        }
    }

    pub fn bb_config(&self) -> BbConfig {
        self.config.clone().into_config(self.dir.path())
    }

    /// Stops the controller and starts a new one over the same state
    /// directory, scheduler and storage system.
    pub async fn restart(&mut self) -> crate::Result<()> {
        self.controller.shutdown().await;
        self.controller = start_controller(self.bb_config(), &self.scheduler, &self.executor).await?;
        Ok(())
    }

    pub fn add_job(&self, info: JobInfo) -> JobId {
        self.scheduler.add_job(info)
    }

    pub fn admit(&self, job_id: JobId) -> Admission {
        let info = self.scheduler.job_info(job_id);
        self.controller.admit(&info)
    }

    pub fn job_dir(&self, job_id: JobId) -> PathBuf {
        self.dir.path().join(format!("job.{job_id}"))
    }

    pub fn allocations(&self) -> Vec<Allocation> {
        self.controller.status_report().allocations
    }

    pub fn allocation_names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.allocations().into_iter().map(|a| a.name).collect();
        names.sort();
        names
    }

    pub fn saved_state(&self) -> Option<StateFile> {
        read_state(&self.bb_config().state_file()).unwrap()
    }
}

pub async fn start_controller(
    config: BbConfig,
    scheduler: &Arc<TestScheduler>,
    executor: &ScriptedExecutor,
) -> crate::Result<Controller> {
    Controller::start_with_executor(
        config,
        None,
        scheduler.clone(),
        Arc::new(executor.clone()),
    )
    .await
}

pub async fn run_test<F: AsyncFnOnce(TestCtx)>(config: TestConfigBuilder, f: F) {
    let _ = env_logger::Builder::default()
        .filter(None, LevelFilter::Debug)
        .is_test(true)
        .try_init();
    let ctx = TestCtx::start(config).await;
    f(ctx).await;
}
