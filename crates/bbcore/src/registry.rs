use serde::{Deserialize, Serialize};

use crate::request::BufferState;
use crate::{JobId, Map, Timestamp, UserId};

/// Accounting attributes captured when a buffer is created
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Accounting {
    pub account: String,
    pub partition: String,
    pub qos: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Allocation {
    pub name: String,
    pub user_id: UserId,
    /// `JobId::NONE` for persistent buffers
    pub job_id: JobId,
    pub size: u64,
    pub pool: String,
    pub create_time: Timestamp,
    /// Last time the storage system reported this allocation
    pub seen_time: Timestamp,
    /// Time when the owning job is expected to start using the buffer
    pub use_time: Option<Timestamp>,
    pub state: BufferState,
    pub accounting: Accounting,
}

impl Allocation {
    #[inline]
    pub fn is_persistent(&self) -> bool {
        self.job_id == JobId::NONE
    }
}

/// All known allocations indexed by name, with a secondary index by owning job.
#[derive(Default, Debug)]
pub struct AllocationRegistry {
    allocations: Map<String, Allocation>,
    by_job: Map<JobId, String>,
}

impl AllocationRegistry {
    /// Inserts an allocation, returning the one it replaced.
    pub fn insert(&mut self, allocation: Allocation) -> Option<Allocation> {
        let old = self.remove(&allocation.name);
        if !allocation.is_persistent() {
            self.by_job
                .insert(allocation.job_id, allocation.name.clone());
        }
        self.allocations
            .insert(allocation.name.clone(), allocation);
        old
    }

    pub fn remove(&mut self, name: &str) -> Option<Allocation> {
        let allocation = self.allocations.remove(name)?;
        if !allocation.is_persistent()
            && self.by_job.get(&allocation.job_id).map(|n| n.as_str()) == Some(name)
        {
            self.by_job.remove(&allocation.job_id);
        }
        Some(allocation)
    }

    pub fn remove_by_job(&mut self, job_id: JobId) -> Option<Allocation> {
        let name = self.by_job.remove(&job_id)?;
        self.allocations.remove(&name)
    }

    #[inline]
    pub fn get(&self, name: &str) -> Option<&Allocation> {
        self.allocations.get(name)
    }

    #[inline]
    pub fn get_mut(&mut self, name: &str) -> Option<&mut Allocation> {
        self.allocations.get_mut(name)
    }

    pub fn find_by_job(&self, job_id: JobId) -> Option<&Allocation> {
        self.by_job
            .get(&job_id)
            .and_then(|name| self.allocations.get(name))
    }

    pub fn find_by_job_mut(&mut self, job_id: JobId) -> Option<&mut Allocation> {
        let name = self.by_job.get(&job_id)?;
        self.allocations.get_mut(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Allocation> {
        self.allocations.values()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.allocations.keys().map(|n| n.as_str())
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.allocations.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.allocations.is_empty()
    }

    /// Allocations sorted by name, used for persistence and reports.
    pub fn sorted(&self) -> Vec<&Allocation> {
        let mut allocations: Vec<_> = self.allocations.values().collect();
        allocations.sort_unstable_by(|a, b| a.name.cmp(&b.name));
        allocations
    }

    /// Accounting of any allocation of `user_id`, used to guess the accounting
    /// of allocations discovered without a record.
    pub fn user_accounting(&self, user_id: UserId) -> Option<&Accounting> {
        self.sorted()
            .into_iter()
            .find(|a| a.user_id == user_id)
            .map(|a| &a.accounting)
    }
}
