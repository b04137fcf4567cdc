use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};

use crate::comm::OperationKind;
use crate::registry::{Accounting, Allocation};
use crate::{GroupId, JobId, Priority, Timestamp, UserId};

/// Lifecycle state of a job's burst buffer or of a single persistent buffer item
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BufferState {
    #[default]
    Pending,
    Allocating,
    Allocated,
    Deleting,
    Deleted,
    StagingIn,
    StagedIn,
    PreRun,
    AllocRevoke,
    Running,
    PostRun,
    StagingOut,
    StagedOut,
    Teardown,
    TeardownFail,
    Complete,
}

impl BufferState {
    pub fn as_str(&self) -> &'static str {
        match self {
            BufferState::Pending => "pending",
            BufferState::Allocating => "allocating",
            BufferState::Allocated => "allocated",
            BufferState::Deleting => "deleting",
            BufferState::Deleted => "deleted",
            BufferState::StagingIn => "staging-in",
            BufferState::StagedIn => "staged-in",
            BufferState::PreRun => "pre-run",
            BufferState::AllocRevoke => "alloc-revoke",
            BufferState::Running => "running",
            BufferState::PostRun => "post-run",
            BufferState::StagingOut => "staging-out",
            BufferState::StagedOut => "staged-out",
            BufferState::Teardown => "teardown",
            BufferState::TeardownFail => "teardown-fail",
            BufferState::Complete => "complete",
        }
    }

    /// The buffer holds (or is about to hold) storage on the external system
    /// and the owning job has not started to use it yet.
    pub fn is_reserved_unused(&self) -> bool {
        matches!(self, BufferState::StagingIn | BufferState::StagedIn)
    }
}

impl Display for BufferState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ItemAction {
    Create {
        size: u64,
        pool: Option<String>,
        access: Option<String>,
        buffer_type: Option<String>,
    },
    Destroy {
        hurry: bool,
    },
    Use,
}

/// A single directive naming a persistent buffer
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemRequest {
    pub name: String,
    pub action: ItemAction,
}

/// Structured form of a job's burst buffer directives
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BufferRequest {
    /// Size of the job-scoped buffer in bytes
    pub capacity: u64,
    pub pool: Option<String>,
    pub access: Option<String>,
    pub buffer_type: Option<String>,
    /// Swap space per compute node in bytes
    pub swap_per_node: u64,
    pub node_count: u32,
    pub items: Vec<ItemRequest>,
}

impl BufferRequest {
    pub fn swap_size(&self) -> u64 {
        self.swap_per_node
            .saturating_mul(self.node_count.max(1) as u64)
    }

    /// Size of the job-scoped buffer including swap
    pub fn job_size(&self) -> u64 {
        self.capacity.saturating_add(self.swap_size())
    }

    /// True if the request resolves to nothing actionable
    pub fn is_empty(&self) -> bool {
        self.capacity == 0 && self.swap_per_node == 0 && self.items.is_empty()
    }

    /// A session is needed for a job-scoped buffer or to attach persistent buffers.
    /// Jobs that only create or destroy persistent buffers do not get one.
    pub fn needs_session(&self) -> bool {
        self.job_size() > 0
            || self
                .items
                .iter()
                .any(|item| matches!(item.action, ItemAction::Use))
    }

    pub fn has_persistent_ops(&self) -> bool {
        self.items
            .iter()
            .any(|item| !matches!(item.action, ItemAction::Use))
    }
}

/// An advance reservation of burst buffer space
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub name: String,
    pub start: Timestamp,
    pub end: Timestamp,
    /// Reserved size per pool
    pub pools: Vec<(String, u64)>,
}

impl Reservation {
    pub fn overlaps(&self, start: Timestamp, end: Timestamp) -> bool {
        self.start < end && start < self.end
    }
}

/// What the scheduler knows about a job, copied out of its job record
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobInfo {
    pub job_id: JobId,
    pub user_id: UserId,
    pub group_id: GroupId,
    pub accounting: Accounting,
    pub priority: Priority,
    /// Expected start; `None` means as soon as possible
    pub start_time: Option<Timestamp>,
    pub end_time: Option<Timestamp>,
    pub reservation: Option<String>,
    pub request: BufferRequest,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BufferItem {
    pub request: ItemRequest,
    pub state: BufferState,
}

/// Runtime state of a job's aggregate burst buffer request
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JobBuffer {
    pub job_id: JobId,
    pub user_id: UserId,
    pub group_id: GroupId,
    pub accounting: Accounting,
    pub priority: Priority,
    pub request: BufferRequest,
    /// Pool of the job-scoped buffer
    pub pool: Option<String>,
    pub state: BufferState,
    pub items: Vec<BufferItem>,
    pub use_time: Option<Timestamp>,
    pub end_time: Option<Timestamp>,
    pub reservation: Option<String>,
    pub retry_count: u32,
    pub cancelled: bool,
    /// Torn down to make space for another job; returns to pending afterwards
    pub preempted: bool,
    /// Setup was issued, so teardown has to go to the external system
    pub session_requested: bool,
    pub stage_in_failed: bool,
    pub stage_out_failed: bool,
    pub last_teardown: Option<Timestamp>,
    pub(crate) in_flight: Option<OperationKind>,
    /// Teardown requested while another operation was in flight (value = hurry)
    pub(crate) teardown_requested: Option<bool>,
}

impl JobBuffer {
    pub fn new(info: &JobInfo, pool: Option<String>) -> Self {
        JobBuffer {
            job_id: info.job_id,
            user_id: info.user_id,
            group_id: info.group_id,
            accounting: info.accounting.clone(),
            priority: info.priority,
            request: info.request.clone(),
            pool,
            state: BufferState::Pending,
            items: info
                .request
                .items
                .iter()
                .map(|request| BufferItem {
                    request: request.clone(),
                    state: BufferState::Pending,
                })
                .collect(),
            use_time: info.start_time,
            end_time: info.end_time,
            reservation: info.reservation.clone(),
            retry_count: 0,
            cancelled: false,
            preempted: false,
            session_requested: false,
            stage_in_failed: false,
            stage_out_failed: false,
            last_teardown: None,
            in_flight: None,
            teardown_requested: None,
        }
    }

    /// Record for an allocation whose job is not tracked, so that its teardown
    /// can be driven like any other.
    pub fn for_allocation(allocation: &Allocation) -> Self {
        let mut job = JobBuffer::new(
            &JobInfo {
                job_id: allocation.job_id,
                user_id: allocation.user_id,
                accounting: allocation.accounting.clone(),
                start_time: allocation.use_time,
                request: BufferRequest {
                    capacity: allocation.size,
                    pool: Some(allocation.pool.clone()),
                    ..Default::default()
                },
                ..Default::default()
            },
            Some(allocation.pool.clone()),
        );
        job.state = BufferState::StagedIn;
        job.session_requested = true;
        job
    }

    #[inline]
    pub fn in_flight(&self) -> Option<OperationKind> {
        self.in_flight
    }

    /// Reset a finished record when the scheduler asks for the buffer again.
    /// The retry counter survives.
    pub(crate) fn reset(&mut self, info: &JobInfo, pool: Option<String>) {
        let retry_count = self.retry_count;
        *self = JobBuffer::new(info, pool);
        self.retry_count = retry_count;
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum StageInStatus {
    NotStarted,
    InProgress,
    Ready,
    Failed,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum StageOutStatus {
    InProgress,
    Complete,
    Failed,
}
