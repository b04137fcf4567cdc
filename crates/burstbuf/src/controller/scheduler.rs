use std::path::PathBuf;

use bbcore::reconcile::RecoveredJob;
use bbcore::registry::Accounting;
use bbcore::request::{BufferState, JobInfo, Reservation};
use bbcore::{JobId, UserId};

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SchedulerJobState {
    Pending,
    Running,
    Finished,
}

/// Job records of the scheduler, accessible while its job lock is held.
pub trait JobTable {
    fn job_info(&self, job_id: JobId) -> Option<JobInfo>;
    /// `None` if the scheduler does not know the job (anymore)
    fn job_state(&self, job_id: JobId) -> Option<SchedulerJobState>;
    /// Jobs with a burst buffer request, including the buffer state recorded
    /// through [`JobTable::set_buffer_state`]
    fn buffered_jobs(&self) -> Vec<RecoveredJob>;
    fn reservations(&self) -> Vec<Reservation>;
    /// Accounting used for allocations that cannot be matched to anything else
    fn user_defaults(&self, user_id: UserId) -> Accounting;
    fn script_path(&self, job_id: JobId) -> Option<PathBuf>;
    /// Hosts allocated to the job, `None` before the job is placed
    fn node_hosts(&self, job_id: JobId) -> Option<Vec<String>>;
    fn nodes_ready(&self, job_id: JobId) -> bool;

    fn hold_job(&mut self, job_id: JobId, reason: &str);
    fn kill_job(&mut self, job_id: JobId, reason: &str);
    fn set_buffer_state(&mut self, job_id: JobId, state: BufferState);
}

/// The scheduler the controller is attached to.
///
/// [`JobScheduler::lock_jobs`] takes the scheduler's job lock; it is always
/// acquired before the controller lock. Controller entry points take it
/// themselves and must not be called while the caller holds it.
pub trait JobScheduler: Send + Sync + 'static {
    fn lock_jobs(&self) -> Box<dyn JobTable + '_>;
}
