use chrono::TimeDelta;
use std::time::Duration;

use crate::admission::{Admission, Decision, evaluate};
use crate::comm::{
    Comm, Operation, OperationKind, OperationResult, StageInOutcome, is_benign_teardown_error,
};
use crate::engine::{Core, Policy};
use crate::ledger::{ChargeKey, Ledger};
use crate::registry::{Allocation, AllocationRegistry};
use crate::request::{
    BufferState, ItemAction, JobBuffer, JobInfo, Reservation, StageInStatus, StageOutStatus,
};
use crate::{JobId, Timestamp};

/// Mutable view of one job together with the shared accounting
pub(crate) struct JobCtx<'a> {
    pub ledger: &'a mut Ledger,
    pub registry: &'a mut AllocationRegistry,
    pub policy: &'a Policy,
    pub job: &'a mut JobBuffer,
}

impl Core {
    pub(crate) fn job_ctx(&mut self, job_id: JobId) -> Option<JobCtx<'_>> {
        let job = self.jobs.get_mut(&job_id)?;
        Some(JobCtx {
            ledger: &mut self.ledger,
            registry: &mut self.registry,
            policy: &self.policy,
            job,
        })
    }
}

impl JobCtx<'_> {
    #[inline]
    fn job_id(&self) -> JobId {
        self.job.job_id
    }

    fn set_state(&mut self, comm: &mut impl Comm, state: BufferState) {
        if self.job.state == state {
            return;
        }
        log::debug!(
            "Job {} burst buffer: {} -> {}",
            self.job.job_id,
            self.job.state,
            state
        );
        self.job.state = state;
        if let Some(allocation) = self.registry.find_by_job_mut(self.job.job_id) {
            allocation.state = state;
        }
        comm.set_buffer_state(self.job.job_id, state);
    }

    fn submit(&mut self, comm: &mut impl Comm, operation: Operation) {
        if let Some(kind) = self.job.in_flight {
            log::error!(
                "Job {} submits {} while {} is still in flight",
                self.job.job_id,
                operation.kind(),
                kind
            );
        }
        debug_assert!(self.job.in_flight.is_none());
        self.job.in_flight = Some(operation.kind());
        comm.submit(operation);
    }

    /// Clears the in-flight marker. Returns false for results nobody waits for.
    fn finish_operation(&mut self, kind: OperationKind) -> bool {
        match self.job.in_flight {
            Some(k) if k == kind => {
                self.job.in_flight = None;
                true
            }
            other => {
                log::warn!(
                    "Job {} received a result of {} while {:?} is in flight, ignoring",
                    self.job.job_id,
                    kind,
                    other
                );
                false
            }
        }
    }

    fn hold(&mut self, comm: &mut impl Comm, reason: String) {
        log::info!("Holding job {}: {}", self.job.job_id, reason);
        if !self.job.cancelled {
            comm.hold_job(self.job.job_id, reason);
        }
    }

    fn start(&mut self, comm: &mut impl Comm, now: Timestamp) {
        let size = self.job.request.job_size();
        if size > 0 {
            if let Some(pool) = self.job.pool.clone() {
                self.ledger
                    .charge(ChargeKey::Job(self.job.job_id), self.job.user_id, &pool, size);
            }
        }
        if self.job.request.has_persistent_ops() {
            self.set_state(comm, BufferState::Allocating);
        }
        self.continue_allocation(comm, now);
    }

    /// Runs the next persistent item; once all items are done continues with stage-in.
    fn continue_allocation(&mut self, comm: &mut impl Comm, now: Timestamp) {
        let job_id = self.job_id();
        let user_id = self.job.user_id;
        for idx in 0..self.job.items.len() {
            if self.job.items[idx].state != BufferState::Pending {
                continue;
            }
            let request = self.job.items[idx].request.clone();
            match request.action {
                ItemAction::Use => {
                    self.job.items[idx].state = BufferState::Allocated;
                }
                ItemAction::Create {
                    size,
                    pool,
                    access,
                    buffer_type,
                } => {
                    if let Some(existing) = self.registry.get(&request.name) {
                        if existing.user_id == user_id {
                            log::debug!(
                                "Persistent buffer {} already exists, job {} reuses it",
                                request.name,
                                job_id
                            );
                            self.job.items[idx].state = BufferState::Allocated;
                            continue;
                        }
                        let reason = format!(
                            "persistent buffer {} is owned by user {}",
                            request.name, existing.user_id
                        );
                        self.fail_allocation(comm, reason);
                        return;
                    }
                    if self
                        .ledger
                        .get_charge(ChargeKey::Persistent(&request.name))
                        .is_some()
                    {
                        self.requeue_allocation(
                            comm,
                            format!("persistent buffer {} is being created", request.name),
                        );
                        return;
                    }
                    let Some(pool) = self
                        .ledger
                        .resolve_pool(pool.as_deref().or(self.job.request.pool.as_deref()))
                        .map(str::to_string)
                    else {
                        let reason = format!("no pool for persistent buffer {}", request.name);
                        self.fail_allocation(comm, reason);
                        return;
                    };
                    let size = self.ledger.charge(
                        ChargeKey::Persistent(&request.name),
                        user_id,
                        &pool,
                        size,
                    );
                    self.job.items[idx].state = BufferState::Allocating;
                    self.submit(
                        comm,
                        Operation::CreatePersistent {
                            job_id,
                            name: request.name,
                            user_id,
                            pool,
                            size,
                            access,
                            buffer_type,
                        },
                    );
                    return;
                }
                ItemAction::Destroy { hurry } => {
                    if self.registry.get(&request.name).is_none() {
                        log::info!(
                            "Persistent buffer {} destroyed by job {} does not exist",
                            request.name,
                            job_id
                        );
                        self.job.items[idx].state = BufferState::Deleted;
                        continue;
                    }
                    self.job.items[idx].state = BufferState::Deleting;
                    self.submit(
                        comm,
                        Operation::DestroyPersistent {
                            job_id,
                            name: request.name,
                            hurry,
                        },
                    );
                    return;
                }
            }
        }

        if self.job.cancelled {
            self.request_teardown(comm, true, now);
        } else if self.job.request.needs_session() {
            self.start_stage_in(comm);
        } else {
            self.set_state(comm, BufferState::StagedIn);
        }
    }

    fn start_stage_in(&mut self, comm: &mut impl Comm) {
        let job_id = self.job_id();
        let (pool, size) = match self.ledger.get_charge(ChargeKey::Job(job_id)) {
            Some(charge) => (charge.pool.clone(), charge.size),
            None => (
                self.job
                    .pool
                    .clone()
                    .or_else(|| self.ledger.default_pool().map(str::to_string))
                    .unwrap_or_default(),
                0,
            ),
        };
        self.job.session_requested = true;
        self.set_state(comm, BufferState::StagingIn);
        self.submit(
            comm,
            Operation::StageIn {
                job_id,
                user_id: self.job.user_id,
                group_id: self.job.group_id,
                pool,
                size,
            },
        );
    }

    /// Persistent item failed; the job goes back to pending and is held.
    fn fail_allocation(&mut self, comm: &mut impl Comm, reason: String) {
        self.ledger.release(ChargeKey::Job(self.job.job_id));
        self.set_state(comm, BufferState::Pending);
        self.hold(comm, reason);
    }

    /// Another job holds a persistent item; the job returns to pending without a hold
    /// and is admitted again once that item settles.
    fn requeue_allocation(&mut self, comm: &mut impl Comm, reason: String) {
        log::info!("Job {} waits: {}", self.job.job_id, reason);
        self.ledger.release(ChargeKey::Job(self.job.job_id));
        self.set_state(comm, BufferState::Pending);
    }

    /// Pool and size charged for a freshly created persistent item. Charges the
    /// requested size if the charge went missing in the meantime.
    fn created_charge(&mut self, idx: usize) -> Option<(String, u64)> {
        let item = &self.job.items[idx].request;
        if let Some(charge) = self.ledger.get_charge(ChargeKey::Persistent(&item.name)) {
            return Some((charge.pool.clone(), charge.size));
        }
        let ItemAction::Create { size, pool, .. } = &item.action else {
            return None;
        };
        log::error!(
            "Persistent buffer {} of job {} has no charge, charging the requested size",
            item.name,
            self.job.job_id
        );
        let pool = self
            .ledger
            .resolve_pool(pool.as_deref().or(self.job.request.pool.as_deref()))?
            .to_string();
        let size = self.ledger.charge(
            ChargeKey::Persistent(&item.name),
            self.job.user_id,
            &pool,
            *size,
        );
        Some((pool, size))
    }

    fn take_teardown_request(&mut self, comm: &mut impl Comm, now: Timestamp) -> bool {
        match self.job.teardown_requested.take() {
            Some(hurry) => {
                self.request_teardown(comm, hurry, now);
                true
            }
            None => false,
        }
    }

    fn request_teardown(&mut self, comm: &mut impl Comm, hurry: bool, now: Timestamp) {
        let job_id = self.job_id();
        if self.job.state == BufferState::Complete {
            return;
        }
        match self.job.in_flight {
            Some(OperationKind::Teardown) => {
                log::debug!("Teardown of job {job_id} is already in flight");
                return;
            }
            Some(kind) => {
                log::debug!("Job {job_id} waits for {kind} before teardown");
                let hurry = hurry || self.job.teardown_requested.unwrap_or(false);
                self.job.teardown_requested = Some(hurry);
                return;
            }
            None => {}
        }
        self.job.teardown_requested = None;
        if !self.job.session_requested {
            self.finish_teardown(comm);
            return;
        }

        let cooldown = TimeDelta::from_std(self.policy.teardown_cooldown).unwrap_or(TimeDelta::zero());
        let delay = self
            .job
            .last_teardown
            .and_then(|last| (last + cooldown - now).to_std().ok())
            .unwrap_or(Duration::ZERO);
        self.job.last_teardown =
            Some(now + TimeDelta::from_std(delay).unwrap_or(TimeDelta::zero()));
        if self.job.state != BufferState::TeardownFail {
            self.set_state(comm, BufferState::Teardown);
        }
        self.submit(
            comm,
            Operation::Teardown {
                job_id,
                hurry,
                delay,
            },
        );
    }

    /// Releases everything the job holds.
    fn finish_teardown(&mut self, comm: &mut impl Comm) {
        let job_id = self.job_id();
        self.ledger.release(ChargeKey::Job(job_id));
        if self.registry.remove_by_job(job_id).is_some() {
            comm.ask_for_save();
        }
        self.job.session_requested = false;
        self.job.teardown_requested = None;
        if self.job.preempted && !self.job.cancelled {
            log::info!("Burst buffer of preempted job {job_id} released, job is pending again");
            self.job.preempted = false;
            self.set_state(comm, BufferState::Pending);
        } else {
            self.set_state(comm, BufferState::Complete);
        }
    }
}

/// Scheduler asks whether a pending job may get its buffer.
pub fn on_admit(
    core: &mut Core,
    comm: &mut impl Comm,
    info: &JobInfo,
    reservations: &[Reservation],
    now: Timestamp,
) -> Admission {
    let job_id = info.job_id;
    let pool = core
        .ledger
        .resolve_pool(info.request.pool.as_deref())
        .map(str::to_string);
    match core.jobs.get_mut(&job_id) {
        Some(job) => match job.state {
            BufferState::Pending => {
                job.priority = info.priority;
                job.use_time = info.start_time;
                job.end_time = info.end_time;
                job.reservation.clone_from(&info.reservation);
                if job.pool.is_none() {
                    job.pool = pool;
                }
            }
            BufferState::Complete if job.cancelled => {
                return Admission::Rejected {
                    reason: format!("burst buffer of job {job_id} was cancelled"),
                };
            }
            BufferState::Complete => {
                log::debug!("Job {job_id} requests its burst buffer again");
                job.reset(info, pool);
            }
            _ => return Admission::Started,
        },
        None => {
            core.jobs.insert(job_id, JobBuffer::new(info, pool));
        }
    }

    if info.request.is_empty() {
        if let Some(mut ctx) = core.job_ctx(job_id) {
            ctx.set_state(comm, BufferState::Complete);
        }
        return Admission::Started;
    }

    match evaluate(core, info, reservations, now) {
        Decision::Reject { reason } => {
            log::info!("Burst buffer of job {job_id} rejected: {reason}");
            comm.hold_job(job_id, reason.clone());
            Admission::Rejected { reason }
        }
        Decision::Defer { reason, retry_at } => {
            log::debug!("Burst buffer of job {job_id} deferred: {reason}");
            Admission::Deferred { reason, retry_at }
        }
        Decision::Start { preempt } => {
            for victim in preempt {
                preempt_job(core, comm, victim, job_id, now);
            }
            if let Some(mut ctx) = core.job_ctx(job_id) {
                ctx.start(comm, now);
            }
            Admission::Started
        }
    }
}

fn preempt_job(core: &mut Core, comm: &mut impl Comm, victim: JobId, job_id: JobId, now: Timestamp) {
    let Some(mut ctx) = core.job_ctx(victim) else {
        return;
    };
    log::info!("Preempting burst buffer of job {victim} in favour of job {job_id}");
    ctx.job.preempted = true;
    ctx.ledger.release(ChargeKey::Job(victim));
    ctx.request_teardown(comm, true, now);
}

pub fn on_persistent_finished(
    core: &mut Core,
    comm: &mut impl Comm,
    job_id: JobId,
    name: &str,
    result: OperationResult,
    now: Timestamp,
) {
    let Some(mut ctx) = core.job_ctx(job_id) else {
        log::warn!("Persistent buffer {name} finished for unknown job {job_id}");
        return;
    };
    let Some(kind) = ctx.job.in_flight.filter(|kind| {
        matches!(
            kind,
            OperationKind::CreatePersistent | OperationKind::DestroyPersistent
        )
    }) else {
        log::warn!("Job {job_id} has no persistent buffer operation in flight");
        return;
    };
    ctx.finish_operation(kind);
    let Some(idx) = ctx.job.items.iter().position(|item| {
        item.request.name == name
            && matches!(item.state, BufferState::Allocating | BufferState::Deleting)
    }) else {
        log::error!("Job {job_id} has no persistent buffer {name} in progress");
        return;
    };

    match (kind, result) {
        (OperationKind::CreatePersistent, Ok(())) => {
            log::info!("Persistent buffer {name} created by job {job_id}");
            if let Some((pool, size)) = ctx.created_charge(idx) {
                ctx.registry.insert(Allocation {
                    name: name.to_string(),
                    user_id: ctx.job.user_id,
                    job_id: JobId::NONE,
                    size,
                    pool,
                    create_time: now,
                    seen_time: now,
                    use_time: None,
                    state: BufferState::Allocated,
                    accounting: ctx.job.accounting.clone(),
                });
            } else {
                log::error!(
                    "Persistent buffer {name} has no pool, leaving it to the next refresh"
                );
            }
            ctx.job.items[idx].state = BufferState::Allocated;
            comm.ask_for_save();
        }
        (OperationKind::CreatePersistent, Err(message)) => {
            // The item is in flight only for the job that placed the charge
            if ctx.registry.get(name).is_none() {
                ctx.ledger.release(ChargeKey::Persistent(name));
            }
            ctx.job.items[idx].state = BufferState::Pending;
            ctx.fail_allocation(comm, format!("create-persistent {name}: {message}"));
        }
        (_, Ok(())) => {
            log::info!("Persistent buffer {name} destroyed by job {job_id}");
            if ctx.registry.remove(name).is_some() {
                ctx.ledger.release(ChargeKey::Persistent(name));
            }
            ctx.job.items[idx].state = BufferState::Deleted;
            comm.ask_for_save();
        }
        (_, Err(message)) => {
            ctx.job.items[idx].state = BufferState::Pending;
            ctx.fail_allocation(comm, format!("destroy-persistent {name}: {message}"));
        }
    }

    if ctx.take_teardown_request(comm, now) {
        return;
    }
    if ctx.job.state == BufferState::Allocating {
        ctx.continue_allocation(comm, now);
    }
}

pub fn on_stage_in_finished(
    core: &mut Core,
    comm: &mut impl Comm,
    job_id: JobId,
    outcome: StageInOutcome,
    now: Timestamp,
) {
    let Some(mut ctx) = core.job_ctx(job_id) else {
        log::warn!("Stage-in finished for unknown job {job_id}");
        return;
    };
    if !ctx.finish_operation(OperationKind::StageIn) {
        return;
    }
    let (setup_done, real_size, error) = match outcome {
        StageInOutcome::Finished { real_size } => (true, real_size, None),
        StageInOutcome::Failed {
            setup_done,
            message,
        } => (setup_done, None, Some(message)),
    };

    if setup_done {
        let key = ChargeKey::Job(job_id);
        if let (Some(real), Some(charge)) = (real_size, ctx.ledger.get_charge(key).cloned()) {
            if real != charge.size {
                log::info!(
                    "Burst buffer of job {job_id} has {real} bytes instead of {}",
                    charge.size
                );
                ctx.ledger.charge(key, charge.user_id, &charge.pool, real);
            }
        }
        let (pool, size) = match ctx.ledger.get_charge(key) {
            Some(charge) => (charge.pool.clone(), charge.size),
            None => (ctx.job.pool.clone().unwrap_or_default(), real_size.unwrap_or(0)),
        };
        ctx.registry.insert(Allocation {
            name: job_id.allocation_name(),
            user_id: ctx.job.user_id,
            job_id,
            size,
            pool,
            create_time: now,
            seen_time: now,
            use_time: ctx.job.use_time,
            state: ctx.job.state,
            accounting: ctx.job.accounting.clone(),
        });
        comm.ask_for_save();
    }

    if let Some(message) = error {
        ctx.job.stage_in_failed = true;
        ctx.hold(comm, format!("stage-in: {message}"));
        ctx.request_teardown(comm, true, now);
        return;
    }
    if ctx.take_teardown_request(comm, now) {
        return;
    }
    ctx.set_state(comm, BufferState::StagedIn);
}

/// Job was placed on nodes and is about to start.
pub fn on_job_begin(
    core: &mut Core,
    comm: &mut impl Comm,
    job_id: JobId,
    now: Timestamp,
) -> crate::Result<()> {
    let Some(mut ctx) = core.job_ctx(job_id) else {
        return Err(crate::Error::UnknownJob(job_id));
    };
    match ctx.job.state {
        BufferState::StagedIn => {
            ctx.job.use_time = Some(now);
            if let Some(allocation) = ctx.registry.find_by_job_mut(job_id) {
                allocation.use_time = Some(now);
            }
            if ctx.job.request.needs_session() {
                ctx.set_state(comm, BufferState::PreRun);
                ctx.submit(comm, Operation::PreRun { job_id });
            } else {
                ctx.set_state(comm, BufferState::Running);
            }
        }
        BufferState::AllocRevoke => {
            ctx.set_state(comm, BufferState::PreRun);
            if ctx.job.in_flight.is_none() {
                ctx.submit(comm, Operation::PreRun { job_id });
            }
        }
        BufferState::PreRun | BufferState::Running => {}
        BufferState::Complete if ctx.job.request.is_empty() => {}
        state => {
            return Err(crate::Error::InvalidState {
                job_id,
                state,
                operation: "begin",
            });
        }
    }
    Ok(())
}

/// The scheduler rescinds the node allocation of a job that did not start yet.
pub fn on_allocation_revoked(
    core: &mut Core,
    comm: &mut impl Comm,
    job_id: JobId,
) -> crate::Result<()> {
    let Some(mut ctx) = core.job_ctx(job_id) else {
        return Err(crate::Error::UnknownJob(job_id));
    };
    match ctx.job.state {
        BufferState::PreRun => ctx.set_state(comm, BufferState::AllocRevoke),
        BufferState::StagedIn | BufferState::AllocRevoke => {}
        state => {
            return Err(crate::Error::InvalidState {
                job_id,
                state,
                operation: "revoke allocation",
            });
        }
    }
    Ok(())
}

pub fn on_pre_run_finished(
    core: &mut Core,
    comm: &mut impl Comm,
    job_id: JobId,
    result: OperationResult,
    now: Timestamp,
) {
    let Some(mut ctx) = core.job_ctx(job_id) else {
        log::warn!("Pre-run finished for unknown job {job_id}");
        return;
    };
    if !ctx.finish_operation(OperationKind::PreRun) || ctx.take_teardown_request(comm, now) {
        return;
    }
    match ctx.job.state {
        BufferState::AllocRevoke => {
            log::debug!("Pre-run of job {job_id} finished after revocation");
            ctx.set_state(comm, BufferState::StagedIn);
        }
        BufferState::PostRun => ctx.submit(comm, Operation::PostRun { job_id }),
        BufferState::PreRun => match result {
            Ok(()) => ctx.set_state(comm, BufferState::Running),
            Err(message) => {
                ctx.job.retry_count += 1;
                let reason = format!("pre-run: {message}");
                if ctx.job.retry_count > ctx.policy.max_pre_run_retries {
                    log::warn!(
                        "Pre-run of job {job_id} failed {} times, killing the job",
                        ctx.job.retry_count
                    );
                    comm.kill_job(job_id, reason);
                } else {
                    ctx.hold(comm, reason);
                }
                ctx.request_teardown(comm, true, now);
            }
        },
        state => log::warn!("Pre-run of job {job_id} finished in state {state}"),
    }
}

/// The job finished running (or never ran) and its data should be drained.
pub fn on_stage_out_start(
    core: &mut Core,
    comm: &mut impl Comm,
    job_id: JobId,
    now: Timestamp,
) -> crate::Result<()> {
    let Some(mut ctx) = core.job_ctx(job_id) else {
        return Ok(());
    };
    ctx.job.preempted = false;
    match ctx.job.state {
        BufferState::Running | BufferState::PreRun | BufferState::AllocRevoke => {
            if !ctx.job.session_requested {
                ctx.finish_teardown(comm);
                return Ok(());
            }
            ctx.set_state(comm, BufferState::PostRun);
            if ctx.job.in_flight.is_none() {
                ctx.submit(comm, Operation::PostRun { job_id });
            }
        }
        BufferState::Pending => ctx.finish_teardown(comm),
        BufferState::Allocating | BufferState::StagingIn | BufferState::StagedIn => {
            ctx.request_teardown(comm, true, now)
        }
        _ => {}
    }
    Ok(())
}

pub fn on_post_run_finished(
    core: &mut Core,
    comm: &mut impl Comm,
    job_id: JobId,
    result: OperationResult,
    now: Timestamp,
) {
    let Some(mut ctx) = core.job_ctx(job_id) else {
        log::warn!("Post-run finished for unknown job {job_id}");
        return;
    };
    if !ctx.finish_operation(OperationKind::PostRun) || ctx.take_teardown_request(comm, now) {
        return;
    }
    match result {
        Ok(()) => {
            ctx.set_state(comm, BufferState::StagingOut);
            ctx.submit(comm, Operation::StageOut { job_id });
        }
        Err(message) => {
            ctx.job.stage_out_failed = true;
            ctx.hold(comm, format!("post-run: {message}"));
            if !ctx.policy.keep_failed_stage_out {
                ctx.request_teardown(comm, true, now);
            }
        }
    }
}

pub fn on_stage_out_finished(
    core: &mut Core,
    comm: &mut impl Comm,
    job_id: JobId,
    result: OperationResult,
    now: Timestamp,
) {
    let Some(mut ctx) = core.job_ctx(job_id) else {
        log::warn!("Stage-out finished for unknown job {job_id}");
        return;
    };
    if !ctx.finish_operation(OperationKind::StageOut) || ctx.take_teardown_request(comm, now) {
        return;
    }
    match result {
        Ok(()) => {
            ctx.set_state(comm, BufferState::StagedOut);
            ctx.request_teardown(comm, false, now);
        }
        Err(message) => {
            ctx.job.stage_out_failed = true;
            ctx.hold(comm, format!("stage-out: {message}"));
            if !ctx.policy.keep_failed_stage_out {
                ctx.request_teardown(comm, true, now);
            }
        }
    }
}

pub fn on_teardown_finished(
    core: &mut Core,
    comm: &mut impl Comm,
    job_id: JobId,
    result: OperationResult,
    now: Timestamp,
) {
    let Some(mut ctx) = core.job_ctx(job_id) else {
        log::warn!("Teardown finished for unknown job {job_id}");
        return;
    };
    if !ctx.finish_operation(OperationKind::Teardown) {
        return;
    }
    match result {
        Err(message) if !is_benign_teardown_error(&message) => {
            log::warn!("Teardown of job {job_id} failed: {message}");
            ctx.set_state(comm, BufferState::TeardownFail);
            ctx.hold(comm, format!("teardown: {message}"));
            ctx.request_teardown(comm, true, now);
        }
        Err(message) => {
            log::debug!("Teardown of job {job_id} found nothing to remove: {message}");
            ctx.finish_teardown(comm);
        }
        Ok(()) => ctx.finish_teardown(comm),
    }
}

/// Forces teardown of the job's buffer. Repeated requests are coalesced.
pub fn request_teardown(
    core: &mut Core,
    comm: &mut impl Comm,
    job_id: JobId,
    hurry: bool,
    now: Timestamp,
) {
    if let Some(mut ctx) = core.job_ctx(job_id) {
        ctx.request_teardown(comm, hurry, now);
    }
}

pub fn on_cancel(core: &mut Core, comm: &mut impl Comm, job_id: JobId, now: Timestamp) {
    let Some(mut ctx) = core.job_ctx(job_id) else {
        return;
    };
    log::debug!("Cancelling burst buffer of job {job_id}");
    ctx.job.cancelled = true;
    ctx.job.preempted = false;
    match ctx.job.state {
        BufferState::Complete => {}
        BufferState::Pending => ctx.finish_teardown(comm),
        _ => ctx.request_teardown(comm, true, now),
    }
}

/// Drops the record of a job whose buffer is gone.
pub fn purge_job(core: &mut Core, job_id: JobId) -> crate::Result<()> {
    let Some(job) = core.jobs.get(&job_id) else {
        return Ok(());
    };
    if job.in_flight.is_some()
        || !matches!(job.state, BufferState::Pending | BufferState::Complete)
    {
        return Err(crate::Error::InvalidState {
            job_id,
            state: job.state,
            operation: "purge",
        });
    }
    core.ledger.release(ChargeKey::Job(job_id));
    core.jobs.remove(&job_id);
    Ok(())
}

pub fn stage_in_status(core: &Core, job_id: JobId) -> StageInStatus {
    let Some(job) = core.jobs.get(&job_id) else {
        return StageInStatus::NotStarted;
    };
    if job.stage_in_failed {
        return StageInStatus::Failed;
    }
    match job.state {
        BufferState::StagingIn => StageInStatus::InProgress,
        BufferState::StagedIn
        | BufferState::PreRun
        | BufferState::AllocRevoke
        | BufferState::Running
        | BufferState::PostRun
        | BufferState::StagingOut
        | BufferState::StagedOut => StageInStatus::Ready,
        BufferState::Complete if job.request.is_empty() => StageInStatus::Ready,
        BufferState::Teardown | BufferState::TeardownFail | BufferState::Complete => {
            StageInStatus::Failed
        }
        BufferState::Pending
        | BufferState::Allocating
        | BufferState::Allocated
        | BufferState::Deleting
        | BufferState::Deleted => StageInStatus::NotStarted,
    }
}

pub fn stage_out_status(core: &Core, job_id: JobId) -> StageOutStatus {
    let Some(job) = core.jobs.get(&job_id) else {
        return StageOutStatus::Complete;
    };
    if job.stage_out_failed {
        StageOutStatus::Failed
    } else if job.state == BufferState::Complete {
        StageOutStatus::Complete
    } else {
        StageOutStatus::InProgress
    }
}
