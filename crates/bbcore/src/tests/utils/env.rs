use chrono::{TimeDelta, TimeZone, Utc};
use std::time::Duration;

use crate::admission::Admission;
use crate::comm::{Comm, Operation, OperationResult, StageInOutcome};
use crate::engine::{Core, Policy};
use crate::reactor::{
    on_admit, on_allocation_revoked, on_cancel, on_job_begin, on_persistent_finished,
    on_post_run_finished, on_pre_run_finished, on_stage_in_finished, on_stage_out_finished,
    on_stage_out_start, on_teardown_finished, request_teardown,
};
use crate::request::{BufferState, JobInfo, Reservation};
use crate::{JobId, Set, Timestamp, UserId};

#[derive(Default, Debug)]
pub struct TestComm {
    pub operations: Vec<Operation>,
    pub holds: Vec<(JobId, String)>,
    pub kills: Vec<(JobId, String)>,
    pub states: Vec<(JobId, BufferState)>,
    pub saves: usize,
}

impl TestComm {
    pub fn take_operations(&mut self, len: usize) -> Vec<Operation> {
        assert_eq!(
            self.operations.len(),
            len,
            "unexpected operations: {:?}",
            self.operations
        );
        std::mem::take(&mut self.operations)
    }

    pub fn take_holds(&mut self, len: usize) -> Vec<(JobId, String)> {
        assert_eq!(self.holds.len(), len, "unexpected holds: {:?}", self.holds);
        std::mem::take(&mut self.holds)
    }

    pub fn take_kills(&mut self, len: usize) -> Vec<(JobId, String)> {
        assert_eq!(self.kills.len(), len);
        std::mem::take(&mut self.kills)
    }

    pub fn take_states(&mut self) -> Vec<(JobId, BufferState)> {
        std::mem::take(&mut self.states)
    }

    pub fn take_saves(&mut self) -> usize {
        std::mem::take(&mut self.saves)
    }

    pub fn emptiness_check(&self) {
        assert!(
            self.operations.is_empty(),
            "unexpected operations: {:?}",
            self.operations
        );
        assert!(self.holds.is_empty(), "unexpected holds: {:?}", self.holds);
        assert!(self.kills.is_empty());
    }
}

impl Comm for TestComm {
    fn submit(&mut self, operation: Operation) {
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
        self.saves += 1;
    }
}

pub fn test_policy() -> Policy {
    Policy {
        privileged_users: Set::from_iter([UserId::new(1000)]),
        teardown_cooldown: Duration::from_secs(10),
        max_pre_run_retries: 1,
        ..Default::default()
    }
}

pub struct TestEnv {
    core: Core,
    pub comm: TestComm,
    now: Timestamp,
}

impl Default for TestEnv {
    fn default() -> Self {
        Self::new()
    }
}

impl TestEnv {
    /// Pool "default" with 1000 bytes and granularity 100
    pub fn new() -> TestEnv {
        let _ = env_logger::Builder::default()
            .filter(None, log::LevelFilter::Debug)
            .is_test(true)
            .try_init();
        let mut env = TestEnv {
            core: Core::new(test_policy()),
            comm: Default::default(),
            now: Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap(),
        };
        env.new_pool("default", 100, 1000);
        env
    }

    pub fn core(&mut self) -> &mut Core {
        &mut self.core
    }

    pub fn split(&mut self) -> (&mut Core, &mut TestComm) {
        (&mut self.core, &mut self.comm)
    }

    pub fn new_pool(&mut self, name: &str, granularity: u64, total: u64) {
        self.core
            .ledger_mut()
            .update_pool(name, granularity, total, 0);
    }

    pub fn now(&self) -> Timestamp {
        self.now
    }

    /// Time `secs` seconds from now
    pub fn at(&self, secs: i64) -> Timestamp {
        self.now + TimeDelta::seconds(secs)
    }

    pub fn advance(&mut self, secs: i64) {
        self.now += TimeDelta::seconds(secs);
    }

    pub fn state<T: Into<JobId>>(&self, job_id: T) -> BufferState {
        self.core.get_job(job_id.into()).unwrap().state
    }

    pub fn used(&self, pool: &str) -> u64 {
        self.core.ledger().pool(pool).unwrap().used()
    }

    pub fn admit(&mut self, job: &JobInfo) -> Admission {
        self.admit_with(job, &[])
    }

    pub fn admit_with(&mut self, job: &JobInfo, reservations: &[Reservation]) -> Admission {
        on_admit(&mut self.core, &mut self.comm, job, reservations, self.now)
    }

    /// Delivers a result of an operation previously taken out of the comm.
    pub fn finish(&mut self, operation: &Operation, result: OperationResult) {
        let now = self.now;
        let core = &mut self.core;
        let comm = &mut self.comm;
        match operation {
            Operation::StageIn { job_id, .. } => {
                let outcome = match result {
                    Ok(()) => StageInOutcome::Finished { real_size: None },
                    Err(message) => StageInOutcome::Failed {
                        setup_done: false,
                        message,
                    },
                };
                on_stage_in_finished(core, comm, *job_id, outcome, now)
            }
            Operation::PreRun { job_id } => on_pre_run_finished(core, comm, *job_id, result, now),
            Operation::PostRun { job_id } => {
                on_post_run_finished(core, comm, *job_id, result, now)
            }
            Operation::StageOut { job_id } => {
                on_stage_out_finished(core, comm, *job_id, result, now)
            }
            Operation::Teardown { job_id, .. } => {
                on_teardown_finished(core, comm, *job_id, result, now)
            }
            Operation::CreatePersistent { job_id, name, .. }
            | Operation::DestroyPersistent { job_id, name, .. } => {
                on_persistent_finished(core, comm, *job_id, name, result, now)
            }
        }
    }

    /// Takes the single submitted operation and finishes it successfully.
    pub fn finish_next(&mut self) -> Operation {
        let operation = self.comm.take_operations(1).pop().unwrap();
        self.finish(&operation, Ok(()));
        operation
    }

    /// Admits the job and finishes all operations until it is staged in.
    pub fn staged_in(&mut self, job: &JobInfo) {
        assert_eq!(self.admit(job), Admission::Started);
        while !self.comm.operations.is_empty() {
            self.finish_next();
        }
        assert_eq!(self.state(job.job_id), BufferState::StagedIn);
    }

    pub fn begin<T: Into<JobId>>(&mut self, job_id: T) -> crate::Result<()> {
        on_job_begin(&mut self.core, &mut self.comm, job_id.into(), self.now)
    }

    pub fn stage_out<T: Into<JobId>>(&mut self, job_id: T) {
        on_stage_out_start(&mut self.core, &mut self.comm, job_id.into(), self.now).unwrap();
    }

    pub fn cancel<T: Into<JobId>>(&mut self, job_id: T) {
        on_cancel(&mut self.core, &mut self.comm, job_id.into(), self.now);
    }

    pub fn revoke<T: Into<JobId>>(&mut self, job_id: T) -> crate::Result<()> {
        on_allocation_revoked(&mut self.core, &mut self.comm, job_id.into())
    }

    pub fn request_teardown<T: Into<JobId>>(&mut self, job_id: T, hurry: bool) {
        request_teardown(&mut self.core, &mut self.comm, job_id.into(), hurry, self.now);
    }

    pub fn stage_in_finished<T: Into<JobId>>(&mut self, job_id: T, outcome: StageInOutcome) {
        on_stage_in_finished(&mut self.core, &mut self.comm, job_id.into(), outcome, self.now);
    }

    /// Runs the whole lifecycle of a staged-in job until its buffer is released.
    pub fn run_to_completion<T: Into<JobId>>(&mut self, job_id: T) {
        let job_id = job_id.into();
        self.begin(job_id).unwrap();
        while !self.comm.operations.is_empty() {
            self.finish_next();
        }
        assert_eq!(self.state(job_id), BufferState::Running);
        self.stage_out(job_id);
        while !self.comm.operations.is_empty() {
            self.finish_next();
        }
        assert_eq!(self.state(job_id), BufferState::Complete);
    }
}
