use serde::{Deserialize, Serialize};

use crate::common::size::{human_size, round_up};
use crate::{JobId, Map, UserId};

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Pool {
    pub name: String,
    /// Minimal allocation unit
    pub granularity: u64,
    pub total: u64,
    /// Sum of all charges recorded against this pool
    claimed: u64,
    /// In-use space reported by the storage system
    reported_used: u64,
}

impl Pool {
    pub fn new(name: String, granularity: u64, total: u64) -> Self {
        Pool {
            name,
            granularity,
            total,
            claimed: 0,
            reported_used: 0,
        }
    }

    #[inline]
    pub fn claimed(&self) -> u64 {
        self.claimed
    }

    #[inline]
    pub fn reported_used(&self) -> u64 {
        self.reported_used
    }

    /// The storage system is authoritative for space it reports as used,
    /// but the result never leaves `[0, total]`.
    pub fn used(&self) -> u64 {
        self.claimed.max(self.reported_used).min(self.total)
    }

    #[inline]
    pub fn free(&self) -> u64 {
        self.total - self.used()
    }

    #[inline]
    pub fn round(&self, size: u64) -> u64 {
        round_up(size, self.granularity)
    }

    fn check_bounds(&self) {
        let used = self.claimed.max(self.reported_used);
        if used > self.total {
            log::error!(
                "Pool {} reports {} used out of {} total, clamping",
                self.name,
                human_size(used),
                human_size(self.total)
            );
        }
    }
}

#[derive(Copy, Clone, Debug, Hash, PartialEq, Eq)]
pub enum ChargeKey<'a> {
    Job(JobId),
    Persistent(&'a str),
}

#[derive(Clone, Debug, Hash, PartialEq, Eq)]
enum OwnedChargeKey {
    Job(JobId),
    Persistent(String),
}

impl From<ChargeKey<'_>> for OwnedChargeKey {
    fn from(key: ChargeKey<'_>) -> Self {
        match key {
            ChargeKey::Job(job_id) => OwnedChargeKey::Job(job_id),
            ChargeKey::Persistent(name) => OwnedChargeKey::Persistent(name.to_string()),
        }
    }
}

impl OwnedChargeKey {
    fn as_key(&self) -> ChargeKey<'_> {
        match self {
            OwnedChargeKey::Job(job_id) => ChargeKey::Job(*job_id),
            OwnedChargeKey::Persistent(name) => ChargeKey::Persistent(name),
        }
    }
}

/// Space held by a job-bound buffer or a persistent buffer
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Charge {
    pub user_id: UserId,
    pub pool: String,
    pub size: u64,
}

/// Per-pool capacity accounting.
///
/// Every buffer holds at most one charge. Charging an existing key replaces the
/// previous charge, releasing an already released key does nothing, so repeated
/// teardowns never free the same space twice.
#[derive(Default, Debug)]
pub struct Ledger {
    pools: Map<String, Pool>,
    charges: Map<OwnedChargeKey, Charge>,
    default_pool: Option<String>,
}

impl Ledger {
    pub fn set_default_pool(&mut self, pool: Option<String>) {
        self.default_pool = pool;
    }

    pub fn default_pool(&self) -> Option<&str> {
        self.default_pool.as_deref()
    }

    /// Returns the name of the pool a request lands in.
    pub fn resolve_pool<'a>(&'a self, pool: Option<&'a str>) -> Option<&'a str> {
        pool.or(self.default_pool.as_deref())
    }

    pub fn has_pools(&self) -> bool {
        !self.pools.is_empty()
    }

    pub fn pool(&self, name: &str) -> Option<&Pool> {
        self.pools.get(name)
    }

    pub fn pools(&self) -> impl Iterator<Item = &Pool> {
        self.pools.values()
    }

    /// Insert a new pool or refresh an existing one from the storage system.
    /// Claimed space is kept.
    pub fn update_pool(&mut self, name: &str, granularity: u64, total: u64, reported_used: u64) {
        let pool = self
            .pools
            .entry_ref(name)
            .or_insert_with(|| Pool::new(name.to_string(), granularity, total));
        pool.granularity = granularity;
        pool.total = total;
        pool.reported_used = reported_used;
        pool.check_bounds();
        if self.default_pool.is_none() {
            log::debug!("Using pool {name} as the default pool");
            self.default_pool = Some(name.to_string());
        }
    }

    /// Rounds `size` to the granularity of `pool`. Unknown pools do not round.
    pub fn round(&self, pool: &str, size: u64) -> u64 {
        self.pools
            .get(pool)
            .map(|p| p.round(size))
            .unwrap_or(size)
    }

    /// Records a charge for `key`, replacing the previous one if present.
    /// Returns the size actually charged (rounded to the pool granularity).
    pub fn charge(&mut self, key: ChargeKey, user_id: UserId, pool: &str, size: u64) -> u64 {
        self.release(key);
        let pool = self.pools.entry_ref(pool).or_insert_with(|| {
            log::error!("Charging unknown pool {pool}");
            Pool::new(pool.to_string(), 1, 0)
        });
        let size = pool.round(size);
        pool.claimed = pool.claimed.saturating_add(size);
        pool.check_bounds();
        log::debug!(
            "Charged {} to pool {} for {:?} (claimed {})",
            human_size(size),
            pool.name,
            key,
            human_size(pool.claimed)
        );
        self.charges.insert(
            key.into(),
            Charge {
                user_id,
                pool: pool.name.clone(),
                size,
            },
        );
        size
    }

    /// Releases the charge of `key`. Releasing a missing charge is a no-op.
    pub fn release(&mut self, key: ChargeKey) -> Option<Charge> {
        let owned: OwnedChargeKey = key.into();
        let charge = self.charges.remove(&owned)?;
        if let Some(pool) = self.pools.get_mut(&charge.pool) {
            if pool.claimed < charge.size {
                log::error!(
                    "Releasing {} from pool {} with only {} claimed",
                    human_size(charge.size),
                    pool.name,
                    human_size(pool.claimed)
                );
            }
            pool.claimed = pool.claimed.saturating_sub(charge.size);
        }
        log::debug!("Released {} for {:?}", human_size(charge.size), key);
        Some(charge)
    }

    pub fn get_charge(&self, key: ChargeKey) -> Option<&Charge> {
        self.charges.get(&OwnedChargeKey::from(key))
    }

    pub fn charges(&self) -> impl Iterator<Item = (ChargeKey<'_>, &Charge)> {
        self.charges.iter().map(|(k, c)| (k.as_key(), c))
    }

    /// Total space charged to a user over all pools
    pub fn user_usage(&self, user_id: UserId) -> u64 {
        self.charges
            .values()
            .filter(|c| c.user_id == user_id)
            .map(|c| c.size)
            .sum()
    }

    /// Used space per pool, as reported to the scheduler's accounting.
    pub fn tres_usage(&self) -> Vec<(String, u64)> {
        let mut usage: Vec<_> = self
            .pools
            .values()
            .map(|p| (p.name.clone(), p.used()))
            .collect();
        usage.sort_unstable();
        usage
    }
}
