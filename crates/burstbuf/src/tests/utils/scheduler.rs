use std::path::PathBuf;
use std::sync::Arc;

use bbcore::reconcile::RecoveredJob;
use bbcore::registry::Accounting;
use bbcore::request::{BufferState, JobInfo, Reservation};
use bbcore::{JobId, Map, UserId};
use parking_lot::{Mutex, MutexGuard};

use crate::controller::scheduler::{JobScheduler, JobTable, SchedulerJobState};

pub struct TestJob {
    pub info: JobInfo,
    pub state: SchedulerJobState,
    pub buffer_state: Option<BufferState>,
    pub hosts: Option<Vec<String>>,
    pub nodes_ready: bool,
    pub script: Option<PathBuf>,
    pub holds: Vec<String>,
    pub kills: Vec<String>,
}

#[derive(Default)]
pub struct TestJobs {
    pub jobs: Map<JobId, TestJob>,
    pub reservations: Vec<Reservation>,
}

/// Job records of a fake scheduler
#[derive(Default)]
pub struct TestScheduler {
    jobs: Mutex<TestJobs>,
}

impl TestScheduler {
    pub fn new() -> Arc<TestScheduler> {
        Arc::new(TestScheduler::default())
    }

    pub fn add_job(&self, info: JobInfo) -> JobId {
        let job_id = info.job_id;
        self.jobs.lock().jobs.insert(
            job_id,
            TestJob {
                info,
                state: SchedulerJobState::Pending,
                buffer_state: None,
                hosts: None,
                nodes_ready: false,
                script: None,
                holds: Vec::new(),
                kills: Vec::new(),
            },
        );
        job_id
    }

    pub fn job_info(&self, job_id: JobId) -> JobInfo {
        self.jobs.lock().jobs[&job_id].info.clone()
    }

    pub fn with_job<R>(&self, job_id: JobId, f: impl FnOnce(&mut TestJob) -> R) -> R {
        let mut jobs = self.jobs.lock();
        f(jobs.jobs.get_mut(&job_id).unwrap())
    }

    /// Places the job on nodes that are ready immediately.
    pub fn place(&self, job_id: JobId, hosts: &[&str]) {
        self.with_job(job_id, |job| {
            job.state = SchedulerJobState::Running;
            job.hosts = Some(hosts.iter().map(|h| h.to_string()).collect());
            job.nodes_ready = true;
        });
    }

    pub fn finish(&self, job_id: JobId) {
        self.with_job(job_id, |job| job.state = SchedulerJobState::Finished);
    }

    pub fn forget(&self, job_id: JobId) {
        self.jobs.lock().jobs.remove(&job_id);
    }

    pub fn buffer_state(&self, job_id: JobId) -> Option<BufferState> {
        self.with_job(job_id, |job| job.buffer_state)
    }

    pub fn holds(&self, job_id: JobId) -> Vec<String> {
        self.with_job(job_id, |job| job.holds.clone())
    }

    pub fn kills(&self, job_id: JobId) -> Vec<String> {
        self.with_job(job_id, |job| job.kills.clone())
    }
}

impl JobScheduler for TestScheduler {
    fn lock_jobs(&self) -> Box<dyn JobTable + '_> {
        Box::new(TestTable(self.jobs.lock()))
    }
}

struct TestTable<'a>(MutexGuard<'a, TestJobs>);

impl JobTable for TestTable<'_> {
    fn job_info(&self, job_id: JobId) -> Option<JobInfo> {
        self.0.jobs.get(&job_id).map(|job| job.info.clone())
    }

    fn job_state(&self, job_id: JobId) -> Option<SchedulerJobState> {
        self.0.jobs.get(&job_id).map(|job| job.state)
    }

    fn buffered_jobs(&self) -> Vec<RecoveredJob> {
        let mut jobs: Vec<_> = self
            .0
            .jobs
            .values()
            .filter(|job| !job.info.request.is_empty())
            .map(|job| RecoveredJob {
                info: job.info.clone(),
                state: job.buffer_state,
                finished: job.state == SchedulerJobState::Finished,
            })
            .collect();
        jobs.sort_unstable_by_key(|job| job.info.job_id);
        jobs
    }

    fn reservations(&self) -> Vec<Reservation> {
        self.0.reservations.clone()
    }

    fn user_defaults(&self, _user_id: UserId) -> Accounting {
        Accounting {
            account: "default".to_string(),
            partition: "batch".to_string(),
            qos: "normal".to_string(),
        }
    }

    fn script_path(&self, job_id: JobId) -> Option<PathBuf> {
        self.0.jobs.get(&job_id).and_then(|job| job.script.clone())
    }

    fn node_hosts(&self, job_id: JobId) -> Option<Vec<String>> {
        self.0.jobs.get(&job_id).and_then(|job| job.hosts.clone())
    }

    fn nodes_ready(&self, job_id: JobId) -> bool {
        self.0.jobs.get(&job_id).is_some_and(|job| job.nodes_ready)
    }

    fn hold_job(&mut self, job_id: JobId, reason: &str) {
        if let Some(job) = self.0.jobs.get_mut(&job_id) {
            job.holds.push(reason.to_string());
        }
    }

    fn kill_job(&mut self, job_id: JobId, reason: &str) {
        if let Some(job) = self.0.jobs.get_mut(&job_id) {
            job.kills.push(reason.to_string());
            job.state = SchedulerJobState::Finished;
        }
    }

    fn set_buffer_state(&mut self, job_id: JobId, state: BufferState) {
        if let Some(job) = self.0.jobs.get_mut(&job_id) {
            job.buffer_state = Some(state);
        }
    }
}
