use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::ledger::{ChargeKey, Ledger, Pool};
use crate::registry::{Allocation, AllocationRegistry};
use crate::request::{BufferState, JobBuffer};
use crate::{JobId, Map, Set, UserId};

/// Limits and permissions applied to every request
#[derive(Clone, Debug, Default)]
pub struct Policy {
    /// Users allowed to create and destroy persistent buffers
    pub privileged_users: Set<UserId>,
    /// If non-empty, only these users may request buffers
    pub allow_users: Set<UserId>,
    pub deny_users: Set<UserId>,
    /// Maximum space charged to a single user over all pools
    pub user_size_limit: Option<u64>,
    /// Everybody may create and destroy persistent buffers
    pub enable_persistent: bool,
    /// Nobody may create and destroy persistent buffers
    pub disable_persistent: bool,
    pub teardown_cooldown: Duration,
    pub max_pre_run_retries: u32,
    /// Leave the buffer in place after a failed stage-out so that the data can be
    /// rescued; it is torn down when the job is cancelled.
    pub keep_failed_stage_out: bool,
}

impl Policy {
    pub fn is_privileged(&self, user_id: UserId) -> bool {
        user_id.is_root() || self.privileged_users.contains(&user_id)
    }

    pub fn may_manage_persistent(&self, user_id: UserId) -> bool {
        !self.disable_persistent && (self.enable_persistent || self.is_privileged(user_id))
    }
}

/// Ledger, registry and per-job state guarded by the controller lock
#[derive(Default, Debug)]
pub struct Core {
    pub(crate) ledger: Ledger,
    pub(crate) registry: AllocationRegistry,
    pub(crate) jobs: Map<JobId, JobBuffer>,
    pub(crate) policy: Policy,
}

impl Core {
    pub fn new(policy: Policy) -> Self {
        Core {
            policy,
            ..Default::default()
        }
    }

    #[inline]
    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    #[inline]
    pub fn ledger_mut(&mut self) -> &mut Ledger {
        &mut self.ledger
    }

    #[inline]
    pub fn registry(&self) -> &AllocationRegistry {
        &self.registry
    }

    #[inline]
    pub fn policy(&self) -> &Policy {
        &self.policy
    }

    pub fn set_policy(&mut self, policy: Policy) {
        self.policy = policy;
    }

    #[inline]
    pub fn get_job(&self, job_id: JobId) -> Option<&JobBuffer> {
        self.jobs.get(&job_id)
    }

    pub fn jobs(&self) -> impl Iterator<Item = &JobBuffer> {
        self.jobs.values()
    }

    /// Job other than `except` with a create or destroy of persistent buffer `name` in flight.
    pub(crate) fn persistent_in_flight(&self, name: &str, except: JobId) -> Option<JobId> {
        self.jobs
            .values()
            .filter(|job| job.job_id != except)
            .find(|job| {
                job.items.iter().any(|item| {
                    item.request.name == name
                        && matches!(
                            item.state,
                            BufferState::Allocating | BufferState::Deleting
                        )
                })
            })
            .map(|job| job.job_id)
    }

    /// Register an allocation and charge its space.
    pub fn add_allocation(&mut self, allocation: Allocation) {
        let key = allocation_key(&allocation);
        self.ledger
            .charge(key, allocation.user_id, &allocation.pool, allocation.size);
        self.registry.insert(allocation);
    }

    /// Remove an allocation and release its space.
    pub fn remove_allocation(&mut self, name: &str) -> Option<Allocation> {
        let allocation = self.registry.remove(name)?;
        self.ledger.release(allocation_key(&allocation));
        Some(allocation)
    }

    pub fn status(&self) -> StatusReport {
        let mut pools: Vec<Pool> = self.ledger.pools().cloned().collect();
        pools.sort_unstable_by(|a, b| a.name.cmp(&b.name));
        let mut jobs: Vec<JobBuffer> = self.jobs.values().cloned().collect();
        jobs.sort_unstable_by_key(|job| job.job_id);
        StatusReport {
            pools,
            allocations: self.registry.sorted().into_iter().cloned().collect(),
            jobs,
        }
    }
}

pub(crate) fn allocation_key(allocation: &Allocation) -> ChargeKey<'_> {
    if allocation.is_persistent() {
        ChargeKey::Persistent(&allocation.name)
    } else {
        ChargeKey::Job(allocation.job_id)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StatusReport {
    pub pools: Vec<Pool>,
    pub allocations: Vec<Allocation>,
    pub jobs: Vec<JobBuffer>,
}
