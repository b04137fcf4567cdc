use crate::define_id_type;

define_id_type!(JobId, u32);
define_id_type!(UserId, u32);
define_id_type!(GroupId, u32);

impl UserId {
    pub const ROOT: UserId = UserId(0);

    #[inline]
    pub fn is_root(&self) -> bool {
        self.0 == 0
    }
}

impl JobId {
    /// Allocations of persistent buffers carry this job id.
    pub const NONE: JobId = JobId(0);

    /// Job-bound allocations are named after the job that owns them.
    pub fn allocation_name(&self) -> String {
        self.0.to_string()
    }

    /// Inverse of [`JobId::allocation_name`].
    pub fn from_allocation_name(name: &str) -> Option<JobId> {
        name.parse::<u32>().ok().filter(|id| *id != 0).map(JobId)
    }
}
