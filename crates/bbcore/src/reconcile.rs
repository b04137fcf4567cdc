//! Matching of the recorded allocations against what the storage system and the
//! scheduler report, both at startup and on every refresh.

use crate::comm::{Comm, Operation};
use crate::engine::Core;
use crate::reactor::request_teardown;
use crate::registry::{Accounting, Allocation};
use crate::request::{BufferState, ItemAction, JobBuffer, JobInfo};
use crate::{JobId, Map, Set, Timestamp, UserId};

/// A session as reported by the storage system
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LiveSession {
    /// Session token; job id for job-bound buffers, the buffer name otherwise
    pub name: String,
    pub user_id: UserId,
    pub created: Timestamp,
    pub size: Option<u64>,
    pub pool: Option<String>,
}

/// A job with a burst buffer request, as known by the scheduler after restart
#[derive(Clone, Debug)]
pub struct RecoveredJob {
    pub info: JobInfo,
    /// Buffer state recorded in the job record before the restart
    pub state: Option<BufferState>,
    pub finished: bool,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum JobLiveness {
    Active,
    /// Finished, or not known by the scheduler at all
    Finished,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RecoverySummary {
    pub adopted: usize,
    pub unexpected: usize,
    /// Allocations of finished jobs scheduled for teardown
    pub discarded: usize,
    /// Recorded allocations that no longer exist
    pub vanished: usize,
    pub resumed: usize,
}

fn teardown_orphan(core: &mut Core, comm: &mut impl Comm, allocation: &Allocation, now: Timestamp) {
    let job_id = allocation.job_id;
    if core.get_job(job_id).is_some_and(|job| {
        matches!(job.state, BufferState::Teardown | BufferState::TeardownFail)
    }) {
        return;
    }
    log::info!(
        "Allocation {} belongs to finished job {}, tearing it down",
        allocation.name,
        job_id
    );
    let job = core
        .jobs
        .entry(job_id)
        .or_insert_with(|| JobBuffer::for_allocation(allocation));
    job.cancelled = true;
    job.session_requested = true;
    if job.state == BufferState::Complete {
        job.state = BufferState::StagedIn;
    }
    request_teardown(core, comm, job_id, true, now);
}

fn unexpected_allocation(
    core: &Core,
    session: &LiveSession,
    user_defaults: &impl Fn(UserId) -> Accounting,
    now: Timestamp,
) -> Allocation {
    let job_id = JobId::from_allocation_name(&session.name).unwrap_or(JobId::NONE);
    let accounting = core
        .registry
        .user_accounting(session.user_id)
        .cloned()
        .unwrap_or_else(|| user_defaults(session.user_id));
    Allocation {
        name: session.name.clone(),
        user_id: session.user_id,
        job_id,
        size: session.size.unwrap_or(0),
        pool: session
            .pool
            .clone()
            .or_else(|| core.ledger.default_pool().map(str::to_string))
            .unwrap_or_default(),
        create_time: session.created,
        seen_time: now,
        use_time: None,
        state: if job_id == JobId::NONE {
            BufferState::Allocated
        } else {
            BufferState::StagedIn
        },
        accounting,
    }
}

/// A job that already has a record keeps its state on the allocation.
fn sync_state(core: &Core, allocation: &mut Allocation) {
    if allocation.is_persistent() {
        return;
    }
    if let Some(job) = core.get_job(allocation.job_id) {
        allocation.state = job.state;
    }
}

/// Rebuilds the registry after a restart.
pub fn recover(
    core: &mut Core,
    comm: &mut impl Comm,
    recovered: Vec<Allocation>,
    sessions: &[LiveSession],
    jobs: &[RecoveredJob],
    user_defaults: impl Fn(UserId) -> Accounting,
    now: Timestamp,
) -> RecoverySummary {
    let mut summary = RecoverySummary::default();
    let live: Map<&str, &LiveSession> = sessions.iter().map(|s| (s.name.as_str(), s)).collect();
    let active: Set<JobId> = jobs
        .iter()
        .filter(|job| !job.finished)
        .map(|job| job.info.job_id)
        .collect();
    let is_active = |allocation: &Allocation| {
        allocation.is_persistent() || active.contains(&allocation.job_id)
    };

    let mut orphans = Vec::new();
    let mut seen: Set<String> = Set::new();
    for mut allocation in recovered {
        let Some(session) = live.get(allocation.name.as_str()) else {
            log::warn!(
                "Recorded allocation {} no longer exists, dropping it",
                allocation.name
            );
            summary.vanished += 1;
            continue;
        };
        seen.insert(allocation.name.clone());
        if let Some(size) = session.size {
            allocation.size = size;
        }
        if let Some(pool) = &session.pool {
            allocation.pool.clone_from(pool);
        }
        allocation.create_time = session.created;
        allocation.seen_time = now;
        sync_state(core, &mut allocation);
        if is_active(&allocation) {
            summary.adopted += 1;
        } else {
            summary.discarded += 1;
            orphans.push(allocation.clone());
        }
        core.add_allocation(allocation);
    }

    for session in sessions {
        if seen.contains(&session.name) {
            continue;
        }
        let mut allocation = unexpected_allocation(core, session, &user_defaults, now);
        sync_state(core, &mut allocation);
        log::warn!(
            "Adopting unexpected allocation {} of user {}",
            allocation.name,
            allocation.user_id
        );
        summary.unexpected += 1;
        if !is_active(&allocation) {
            summary.discarded += 1;
            orphans.push(allocation.clone());
        }
        core.add_allocation(allocation);
    }

    for allocation in &orphans {
        teardown_orphan(core, comm, allocation, now);
    }

    for job in jobs.iter().filter(|job| !job.finished) {
        if resume_job(core, comm, job, now) {
            summary.resumed += 1;
        }
    }
    comm.ask_for_save();
    summary
}

/// Restores the record of a job that had a buffer in flight before the restart.
fn resume_job(core: &mut Core, comm: &mut impl Comm, job: &RecoveredJob, now: Timestamp) -> bool {
    let job_id = job.info.job_id;
    let has_allocation = core.registry.find_by_job(job_id).is_some();
    let Some(state) = job.state.or(has_allocation.then_some(BufferState::StagedIn)) else {
        return false;
    };
    if matches!(
        state,
        BufferState::Pending
            | BufferState::Complete
            | BufferState::Allocated
            | BufferState::Deleting
            | BufferState::Deleted
    ) {
        return false;
    }
    if core
        .get_job(job_id)
        .is_some_and(|record| record.in_flight().is_some())
    {
        return false;
    }

    let pool = core
        .ledger
        .resolve_pool(job.info.request.pool.as_deref())
        .map(str::to_string);
    let mut record = JobBuffer::new(&job.info, pool);
    record.state = state;
    record.session_requested = true;
    for item in record.items.iter_mut() {
        item.state = match item.request.action {
            ItemAction::Destroy { .. } => BufferState::Deleted,
            _ => BufferState::Allocated,
        };
    }
    core.jobs.insert(job_id, record);
    if let Some(allocation) = core.registry.find_by_job_mut(job_id) {
        allocation.state = state;
    }

    log::info!("Job {job_id} had burst buffer in state {state} before restart");
    match state {
        BufferState::Allocating
        | BufferState::StagingIn
        | BufferState::StagedIn
        | BufferState::AllocRevoke => {
            if let Some(record) = core.jobs.get_mut(&job_id) {
                record.state = BufferState::StagingIn;
            }
            request_teardown(core, comm, job_id, true, now);
        }
        BufferState::Running | BufferState::PreRun => {}
        BufferState::PostRun => submit_resumed(core, comm, Operation::PostRun { job_id }),
        BufferState::StagingOut => submit_resumed(core, comm, Operation::StageOut { job_id }),
        _ => request_teardown(core, comm, job_id, false, now),
    }
    true
}

fn submit_resumed(core: &mut Core, comm: &mut impl Comm, operation: Operation) {
    if let Some(record) = core.jobs.get_mut(&operation.job_id()) {
        record.in_flight = Some(operation.kind());
        comm.submit(operation);
    }
}

/// Drops allocations whose sessions vanished and tears down buffers of jobs
/// that are gone. Returns the number of affected allocations.
pub fn purge_vestigial(
    core: &mut Core,
    comm: &mut impl Comm,
    sessions: &[LiveSession],
    liveness: impl Fn(JobId) -> JobLiveness,
    now: Timestamp,
) -> usize {
    let live: Map<&str, &LiveSession> = sessions.iter().map(|s| (s.name.as_str(), s)).collect();
    let mut purged = 0;

    let names: Vec<String> = core.registry.names().map(str::to_string).collect();
    for name in names {
        let Some(allocation) = core.registry.get_mut(&name) else {
            continue;
        };
        if live.contains_key(name.as_str()) {
            allocation.seen_time = now;
            continue;
        }
        let job_id = allocation.job_id;
        if !allocation.is_persistent()
            && core
                .get_job(job_id)
                .is_some_and(|job| job.in_flight().is_some())
        {
            continue;
        }
        log::warn!("Allocation {name} vanished from the storage system, removing it");
        core.remove_allocation(&name);
        comm.ask_for_save();
        purged += 1;
    }

    for session in sessions {
        if core.registry.get(&session.name).is_none() {
            let allocation =
                unexpected_allocation(core, session, &|_| Accounting::default(), now);
            log::warn!("Adopting unexpected allocation {}", allocation.name);
            core.add_allocation(allocation);
            comm.ask_for_save();
        }
    }

    let orphans: Vec<Allocation> = core
        .registry
        .iter()
        .filter(|a| !a.is_persistent() && liveness(a.job_id) == JobLiveness::Finished)
        .filter(|a| {
            core.get_job(a.job_id).is_none_or(|job| {
                job.in_flight().is_none()
                    && !matches!(job.state, BufferState::Teardown | BufferState::TeardownFail)
            })
        })
        .cloned()
        .collect();
    for allocation in &orphans {
        teardown_orphan(core, comm, allocation, now);
        purged += 1;
    }
    purged
}
