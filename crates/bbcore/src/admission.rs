//! Decides whether a pending buffer request can start now, later or never.
//!
//! Everything here is free of side effects so that the scheduler may ask
//! speculatively. Applying a decision is done by the reactor.

use std::cmp::Ordering;

use crate::common::size::human_size;
use crate::engine::Core;
use crate::ledger::ChargeKey;
use crate::request::{ItemAction, JobInfo, Reservation};
use crate::{JobId, Map, Timestamp};

/// Outcome of an admission request as seen by the scheduler
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Admission {
    Started,
    Deferred {
        reason: String,
        retry_at: Option<Timestamp>,
    },
    Rejected {
        reason: String,
    },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Decision {
    /// The request fits, possibly after the listed jobs are torn down
    Start { preempt: Vec<JobId> },
    /// The request does not fit now; `retry_at` is the earliest known release
    Defer {
        reason: String,
        retry_at: Option<Timestamp>,
    },
    /// The request can never be satisfied
    Reject { reason: String },
}

/// Checks permissions and limits that do not depend on current usage.
pub fn validate(core: &Core, job: &JobInfo) -> crate::Result<()> {
    let policy = &core.policy;
    let invalid = |msg: String| Err::<(), _>(crate::Error::InvalidRequest(msg));

    if policy.deny_users.contains(&job.user_id)
        || (!policy.allow_users.is_empty() && !policy.allow_users.contains(&job.user_id))
    {
        return invalid(format!(
            "user {} is not permitted to use burst buffers",
            job.user_id
        ));
    }

    let request = &job.request;
    for item in &request.items {
        if matches!(item.action, ItemAction::Use) {
            continue;
        }
        if !policy.may_manage_persistent(job.user_id) {
            return invalid(format!(
                "user {} is not permitted to create or destroy persistent buffer {}",
                job.user_id, item.name
            ));
        }
        if item.name.is_empty() || item.name.bytes().all(|b| b.is_ascii_digit()) {
            return invalid(format!(
                "persistent buffer name '{}' must not be numeric",
                item.name
            ));
        }
    }

    if let Some(limit) = policy.user_size_limit {
        let total = total_request_size(job);
        if total > limit {
            return invalid(format!(
                "requested size {} exceeds user limit {}",
                human_size(total),
                human_size(limit)
            ));
        }
    }

    if core.ledger.has_pools() {
        for pool in requested_pools(core, job) {
            if core.ledger.pool(pool).is_none() {
                return invalid(format!("unknown pool {pool}"));
            }
        }
    }
    Ok(())
}

fn total_request_size(job: &JobInfo) -> u64 {
    let persistent: u64 = job
        .request
        .items
        .iter()
        .map(|item| match &item.action {
            ItemAction::Create { size, .. } => *size,
            _ => 0,
        })
        .sum();
    job.request.job_size().saturating_add(persistent)
}

fn requested_pools<'a>(core: &'a Core, job: &'a JobInfo) -> Vec<&'a str> {
    let mut pools = Vec::new();
    if job.request.job_size() > 0 {
        pools.extend(core.ledger.resolve_pool(job.request.pool.as_deref()));
    }
    for item in &job.request.items {
        if let ItemAction::Create { pool, .. } = &item.action {
            pools.extend(
                core.ledger
                    .resolve_pool(pool.as_deref().or(job.request.pool.as_deref())),
            );
        }
    }
    pools
}

/// Space per pool still needed by the job, rounded to pool granularity.
/// Persistent buffers that already exist need nothing.
pub fn need_vector(core: &Core, job: &JobInfo) -> Vec<(String, u64)> {
    let mut need: Map<&str, u64> = Map::new();
    let ledger = &core.ledger;
    let job_size = job.request.job_size();
    if job_size > 0 {
        if let Some(pool) = ledger.resolve_pool(job.request.pool.as_deref()) {
            *need.entry(pool).or_default() += ledger.round(pool, job_size);
        }
    }
    for item in &job.request.items {
        if let ItemAction::Create { size, pool, .. } = &item.action {
            if core.registry.get(&item.name).is_some() {
                continue;
            }
            if let Some(pool) = ledger.resolve_pool(pool.as_deref().or(job.request.pool.as_deref()))
            {
                *need.entry(pool).or_default() += ledger.round(pool, *size);
            }
        }
    }
    let mut need: Vec<(String, u64)> = need
        .into_iter()
        .filter(|(_, size)| *size > 0)
        .map(|(pool, size)| (pool.to_string(), size))
        .collect();
    need.sort_unstable();
    need
}

fn check_persistent_items(core: &Core, job: &JobInfo) -> Option<Decision> {
    for item in &job.request.items {
        let existing = core.registry.get(&item.name);
        if !matches!(item.action, ItemAction::Use) {
            if let Some(other) = core.persistent_in_flight(&item.name, job.job_id) {
                return Some(Decision::Defer {
                    reason: format!(
                        "persistent buffer {} is being changed by job {}",
                        item.name, other
                    ),
                    retry_at: None,
                });
            }
            if existing.is_none()
                && core
                    .ledger
                    .get_charge(ChargeKey::Persistent(&item.name))
                    .is_some()
            {
                return Some(Decision::Defer {
                    reason: format!("persistent buffer {} is being created", item.name),
                    retry_at: None,
                });
            }
        }
        match (&item.action, existing) {
            (ItemAction::Create { .. }, Some(allocation)) if allocation.user_id != job.user_id => {
                return Some(Decision::Reject {
                    reason: format!(
                        "persistent buffer {} already exists and is owned by user {}",
                        item.name, allocation.user_id
                    ),
                });
            }
            (ItemAction::Destroy { .. }, Some(allocation))
                if allocation.user_id != job.user_id && !core.policy.is_privileged(job.user_id) =>
            {
                return Some(Decision::Reject {
                    reason: format!(
                        "persistent buffer {} is owned by user {}",
                        item.name, allocation.user_id
                    ),
                });
            }
            (ItemAction::Use, None) => {
                let created_here = job.request.items.iter().any(|other| {
                    other.name == item.name && matches!(other.action, ItemAction::Create { .. })
                });
                if !created_here {
                    return Some(Decision::Defer {
                        reason: format!("persistent buffer {} does not exist", item.name),
                        retry_at: None,
                    });
                }
            }
            _ => {}
        }
    }
    None
}

/// Space of reservations overlapping the job's run window, minus what jobs
/// inside the reservation already hold. The job's own reservation is skipped.
fn reserved_space(
    core: &Core,
    job: &JobInfo,
    reservations: &[Reservation],
    start: Timestamp,
) -> Map<String, u64> {
    let mut reserved: Map<String, u64> = Map::new();
    for reservation in reservations {
        if job.reservation.as_deref() == Some(reservation.name.as_str()) {
            continue;
        }
        let overlaps = match job.end_time {
            Some(end) => reservation.overlaps(start, end),
            None => reservation.end > start,
        };
        if !overlaps {
            continue;
        }
        for (pool, size) in &reservation.pools {
            let consumed: u64 = core
                .jobs
                .values()
                .filter(|other| other.reservation.as_deref() == Some(reservation.name.as_str()))
                .filter_map(|other| core.ledger.get_charge(ChargeKey::Job(other.job_id)))
                .filter(|charge| &charge.pool == pool)
                .map(|charge| charge.size)
                .sum();
            *reserved.entry(pool.clone()).or_default() += size.saturating_sub(consumed);
        }
    }
    reserved
}

struct Candidate<'a> {
    job_id: JobId,
    use_time: Timestamp,
    priority: crate::Priority,
    pool: &'a str,
    size: u64,
}

fn candidate_order(a: &Candidate, b: &Candidate) -> Ordering {
    a.use_time
        .cmp(&b.use_time)
        .then(a.priority.cmp(&b.priority))
        .then(a.job_id.cmp(&b.job_id))
}

/// Job-bound buffers that are reserved but whose job starts after `start`
fn preemption_candidates<'a>(core: &'a Core, job_id: JobId, start: Timestamp) -> Vec<Candidate<'a>> {
    let mut candidates: Vec<Candidate> = core
        .jobs
        .values()
        .filter(|other| {
            other.job_id != job_id
                && other.state.is_reserved_unused()
                && !other.cancelled
                && !other.preempted
                && other.teardown_requested.is_none()
        })
        .filter_map(|other| {
            let use_time = other.use_time.filter(|t| *t > start)?;
            let charge = core.ledger.get_charge(ChargeKey::Job(other.job_id))?;
            Some(Candidate {
                job_id: other.job_id,
                use_time,
                priority: other.priority,
                pool: &charge.pool,
                size: charge.size,
            })
        })
        .collect();
    candidates.sort_unstable_by(candidate_order);
    candidates
}

/// Earliest end time of a job holding space in one of `pools`
fn earliest_release(core: &Core, pools: &[&str], now: Timestamp) -> Option<Timestamp> {
    core.jobs
        .values()
        .filter(|other| {
            core.ledger
                .get_charge(ChargeKey::Job(other.job_id))
                .is_some_and(|charge| pools.contains(&charge.pool.as_str()))
        })
        .filter_map(|other| other.end_time)
        .filter(|end| *end > now)
        .min()
}

pub fn evaluate(
    core: &Core,
    job: &JobInfo,
    reservations: &[Reservation],
    now: Timestamp,
) -> Decision {
    if let Err(error) = validate(core, job) {
        return Decision::Reject {
            reason: error.to_string(),
        };
    }
    if let Some(decision) = check_persistent_items(core, job) {
        return decision;
    }

    let need = need_vector(core, job);
    if need.is_empty() {
        return Decision::Start { preempt: vec![] };
    }

    for (pool_name, size) in &need {
        if let Some(pool) = core.ledger.pool(pool_name).filter(|pool| *size > pool.total) {
            return Decision::Reject {
                reason: format!(
                    "requested {} exceeds total capacity {} of pool {}",
                    human_size(*size),
                    human_size(pool.total),
                    pool_name
                ),
            };
        }
    }

    let own_charge = core.ledger.get_charge(ChargeKey::Job(job.job_id));
    if let Some(limit) = core.policy.user_size_limit {
        let total: u64 = need.iter().map(|(_, size)| size).sum();
        let usage = core
            .ledger
            .user_usage(job.user_id)
            .saturating_sub(own_charge.map(|c| c.size).unwrap_or(0));
        if usage.saturating_add(total) > limit {
            return Decision::Defer {
                reason: format!(
                    "user {} would exceed size limit {} ({} in use)",
                    job.user_id,
                    human_size(limit),
                    human_size(usage)
                ),
                retry_at: None,
            };
        }
    }

    let start = job.start_time.unwrap_or(now).max(now);
    let reserved = reserved_space(core, job, reservations, start);

    let mut deficit: Vec<(&str, u64)> = Vec::with_capacity(need.len());
    for (pool_name, size) in &need {
        let Some(pool) = core.ledger.pool(pool_name) else {
            return Decision::Defer {
                reason: format!("pool {pool_name} is not known yet"),
                retry_at: None,
            };
        };
        let mut free = pool.free();
        if let Some(charge) = own_charge.filter(|c| &c.pool == pool_name) {
            free = free.saturating_add(charge.size).min(pool.total);
        }
        let free = free.saturating_sub(reserved.get(pool_name.as_str()).copied().unwrap_or(0));
        deficit.push((pool_name.as_str(), size.saturating_sub(free)));
    }
    if deficit.iter().all(|(_, d)| *d == 0) {
        return Decision::Start { preempt: vec![] };
    }

    let mut preempt = Vec::new();
    for candidate in preemption_candidates(core, job.job_id, start) {
        let Some((_, d)) = deficit
            .iter_mut()
            .find(|(pool, d)| *pool == candidate.pool && *d > 0)
        else {
            continue;
        };
        *d = d.saturating_sub(candidate.size);
        preempt.push(candidate.job_id);
        if deficit.iter().all(|(_, d)| *d == 0) {
            return Decision::Start { preempt };
        }
    }

    let short: Vec<&str> = deficit
        .iter()
        .filter(|(_, d)| *d > 0)
        .map(|(pool, _)| *pool)
        .collect();
    Decision::Defer {
        reason: format!("insufficient burst buffer space in pool {}", short.join(", ")),
        retry_at: earliest_release(core, &short, now),
    }
}

/// When the job could start given the current state, `None` if unknown or never
pub fn estimate_start(
    core: &Core,
    job: &JobInfo,
    reservations: &[Reservation],
    now: Timestamp,
) -> Option<Timestamp> {
    match evaluate(core, job, reservations, now) {
        Decision::Start { .. } => Some(job.start_time.unwrap_or(now).max(now)),
        Decision::Defer { retry_at, .. } => retry_at,
        Decision::Reject { .. } => None,
    }
}
