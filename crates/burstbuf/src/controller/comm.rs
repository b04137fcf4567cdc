use std::path::{Path, PathBuf};

use bbcore::comm::{Comm, Operation};
use bbcore::request::BufferState;
use bbcore::JobId;

use crate::controller::scheduler::JobTable;

/// Operation ready to be run, with what it needs from the job record
#[derive(Clone, Debug)]
pub(crate) struct PreparedOperation {
    pub operation: Operation,
    pub script: PathBuf,
    /// Directory for the node files of the job
    pub job_dir: PathBuf,
    pub hosts: Option<Vec<String>>,
}

pub(crate) fn job_dir(state_dir: &Path, job_id: JobId) -> PathBuf {
    state_dir.join(format!("job.{job_id}"))
}

/// Effects produced under the controller lock, carried out once it is released
#[derive(Default, Debug)]
pub(crate) struct CommSender {
    operations: Vec<Operation>,
    holds: Vec<(JobId, String)>,
    kills: Vec<(JobId, String)>,
    states: Vec<(JobId, BufferState)>,
    save: bool,
}

pub(crate) struct Effects {
    pub operations: Vec<PreparedOperation>,
    pub save: bool,
}

impl CommSender {
    /// Updates the scheduler job records; must be called with the job lock held
    /// and the controller lock released.
    pub fn apply(self, table: &mut dyn JobTable, state_dir: &Path) -> Effects {
        for (job_id, state) in self.states {
            table.set_buffer_state(job_id, state);
        }
        for (job_id, reason) in self.holds {
            table.hold_job(job_id, &reason);
        }
        for (job_id, reason) in self.kills {
            log::warn!("Killing job {job_id}: {reason}");
            table.kill_job(job_id, &reason);
        }
        let operations = self
            .operations
            .into_iter()
            .map(|operation| {
                let job_id = operation.job_id();
                let job_dir = job_dir(state_dir, job_id);
                PreparedOperation {
                    script: table
                        .script_path(job_id)
                        .unwrap_or_else(|| job_dir.join("script")),
                    hosts: table.node_hosts(job_id),
                    job_dir,
                    operation,
                }
            })
            .collect();
        Effects {
            operations,
            save: self.save,
        }
    }
}

impl Comm for CommSender {
    fn submit(&mut self, operation: Operation) {
        log::debug!("Queueing {operation:?}");
        self.operations.push(operation);
    }

    fn hold_job(&mut self, job_id: JobId, reason: String) {
        self.holds.push((job_id, reason));
    }

    fn kill_job(&mut self, job_id: JobId, reason: String) {
        self.kills.push((job_id, reason));
    }

    fn set_buffer_state(&mut self, job_id: JobId, state: BufferState) {
        self.states.push((job_id, state));
    }

    fn ask_for_save(&mut self) {
        self.save = true;
    }
}
