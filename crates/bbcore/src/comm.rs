use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};
use std::time::Duration;

use crate::request::BufferState;
use crate::{GroupId, JobId, UserId};

/// Tool output fragments meaning that there was nothing left to tear down
pub const BENIGN_TEARDOWN_ERRORS: &[&str] = &["no matching session", "token not found"];

pub fn is_benign_teardown_error(message: &str) -> bool {
    BENIGN_TEARDOWN_ERRORS
        .iter()
        .any(|pattern| message.contains(pattern))
}

/// Result of an external operation, the error carries the tool diagnostics
pub type OperationResult = Result<(), String>;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StageInOutcome {
    Finished {
        /// Size reported by the storage system after setup
        real_size: Option<u64>,
    },
    Failed {
        /// Setup went through, so a session exists on the storage system
        setup_done: bool,
        message: String,
    },
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OperationKind {
    StageIn,
    PreRun,
    PostRun,
    StageOut,
    Teardown,
    CreatePersistent,
    DestroyPersistent,
}

impl OperationKind {
    pub fn name(&self) -> &'static str {
        match self {
            OperationKind::StageIn => "stage-in",
            OperationKind::PreRun => "pre-run",
            OperationKind::PostRun => "post-run",
            OperationKind::StageOut => "stage-out",
            OperationKind::Teardown => "teardown",
            OperationKind::CreatePersistent => "create-persistent",
            OperationKind::DestroyPersistent => "destroy-persistent",
        }
    }
}

impl Display for OperationKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// External operation requested by the engine
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Operation {
    /// Setup of the job session, size query and data stage-in
    StageIn {
        job_id: JobId,
        user_id: UserId,
        group_id: GroupId,
        pool: String,
        size: u64,
    },
    PreRun {
        job_id: JobId,
    },
    PostRun {
        job_id: JobId,
    },
    StageOut {
        job_id: JobId,
    },
    Teardown {
        job_id: JobId,
        hurry: bool,
        /// Cooldown to wait before the tool is invoked
        delay: Duration,
    },
    CreatePersistent {
        job_id: JobId,
        name: String,
        user_id: UserId,
        pool: String,
        size: u64,
        access: Option<String>,
        buffer_type: Option<String>,
    },
    DestroyPersistent {
        job_id: JobId,
        name: String,
        hurry: bool,
    },
}

impl Operation {
    pub fn kind(&self) -> OperationKind {
        match self {
            Operation::StageIn { .. } => OperationKind::StageIn,
            Operation::PreRun { .. } => OperationKind::PreRun,
            Operation::PostRun { .. } => OperationKind::PostRun,
            Operation::StageOut { .. } => OperationKind::StageOut,
            Operation::Teardown { .. } => OperationKind::Teardown,
            Operation::CreatePersistent { .. } => OperationKind::CreatePersistent,
            Operation::DestroyPersistent { .. } => OperationKind::DestroyPersistent,
        }
    }

    pub fn job_id(&self) -> JobId {
        match self {
            Operation::StageIn { job_id, .. }
            | Operation::PreRun { job_id }
            | Operation::PostRun { job_id }
            | Operation::StageOut { job_id }
            | Operation::Teardown { job_id, .. }
            | Operation::CreatePersistent { job_id, .. }
            | Operation::DestroyPersistent { job_id, .. } => *job_id,
        }
    }
}

/// Outbound effects of the engine.
///
/// Implementations must only queue the effects; they are carried out after the
/// engine lock is released.
pub trait Comm {
    fn submit(&mut self, operation: Operation);
    fn hold_job(&mut self, job_id: JobId, reason: String);
    fn kill_job(&mut self, job_id: JobId, reason: String);
    fn set_buffer_state(&mut self, job_id: JobId, state: BufferState);
    fn ask_for_save(&mut self);
}
