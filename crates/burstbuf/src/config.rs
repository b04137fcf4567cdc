use std::path::{Path, PathBuf};
use std::time::Duration;

use bbcore::engine::Policy;
use serde::{Deserialize, Serialize};

use crate::common::utils::time::{get_duration_from_env, humantime_serde};
use crate::{Set, UserId};

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
    pub struct BbFlags: u32 {
        /// Sizes are stored in the state file (the storage system cannot report them)
        const EMULATE               = 0b00000001;
        /// Every user may create and destroy persistent buffers
        const ENABLE_PERSISTENT     = 0b00000010;
        /// Nobody may create and destroy persistent buffers
        const DISABLE_PERSISTENT    = 0b00000100;
        /// Keep the buffer after a failed stage-out so that the data can be rescued
        const KEEP_FAILED_STAGE_OUT = 0b00001000;
        /// Start with an empty registry when no state file can be read
        const BEST_EFFORT_RECOVERY  = 0b00010000;
    }
}

pub const DATAWARP_BACKEND: &str = "datawarp";
pub const EMULATED_BACKEND: &str = "emulated";

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    #[serde(with = "humantime_serde")]
    pub validate: Duration,
    #[serde(with = "humantime_serde")]
    pub stage_in: Duration,
    #[serde(with = "humantime_serde")]
    pub stage_out: Duration,
    #[serde(with = "humantime_serde")]
    pub other: Duration,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            validate: Duration::from_secs(5),
            stage_in: Duration::from_secs(24 * 60 * 60),
            stage_out: Duration::from_secs(24 * 60 * 60),
            other: Duration::from_secs(5 * 60),
        }
    }
}

/// Pool simulated by the emulated backend
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmulatedPool {
    pub name: String,
    pub granularity: u64,
    pub total: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BbConfig {
    /// Name of the provisioning backend
    pub backend: String,
    pub tool_path: PathBuf,
    /// Directory with the state file and per-job node files
    pub state_dir: PathBuf,
    pub default_pool: Option<String>,
    pub flags: BbFlags,
    pub privileged_users: Vec<u32>,
    pub allow_users: Vec<u32>,
    pub deny_users: Vec<u32>,
    pub user_size_limit: Option<u64>,
    pub timeouts: TimeoutConfig,
    pub max_concurrent_operations: usize,
    #[serde(with = "humantime_serde")]
    pub shutdown_grace: Duration,
    #[serde(with = "humantime_serde")]
    pub refresh_interval: Duration,
    #[serde(with = "humantime_serde")]
    pub save_debounce: Duration,
    #[serde(with = "humantime_serde")]
    pub teardown_cooldown: Duration,
    pub max_pre_run_retries: u32,
    #[serde(with = "humantime_serde")]
    pub node_ready_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub node_ready_poll: Duration,
    pub emulated_pools: Vec<EmulatedPool>,
}

impl Default for BbConfig {
    fn default() -> Self {
        Self {
            backend: DATAWARP_BACKEND.to_string(),
            tool_path: PathBuf::from("/opt/cray/dw_wlm/default/bin/dw_wlm_cli"),
            state_dir: PathBuf::from("/var/spool/burstbuf"),
            default_pool: None,
            flags: BbFlags::empty(),
            privileged_users: Vec::new(),
            allow_users: Vec::new(),
            deny_users: Vec::new(),
            user_size_limit: None,
            timeouts: TimeoutConfig::default(),
            max_concurrent_operations: 16,
            shutdown_grace: Duration::from_secs(30),
            refresh_interval: Duration::from_secs(30),
            save_debounce: Duration::from_secs(1),
            teardown_cooldown: Duration::from_secs(5),
            max_pre_run_retries: 3,
            node_ready_timeout: Duration::from_secs(10 * 60),
            node_ready_poll: Duration::from_secs(1),
            emulated_pools: Vec::new(),
        }
    }
}

impl BbConfig {
    pub fn load(path: &Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|error| {
            crate::Error::ConfigError(format!(
                "Cannot read configuration file {}: {error}",
                path.display()
            ))
        })?;
        let config = Self::parse(&content)?;
        log::debug!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    pub fn parse(content: &str) -> crate::Result<Self> {
        let config: BbConfig = toml::from_str(content)?;
        config.check()?;
        Ok(config)
    }

    pub fn check(&self) -> crate::Result<()> {
        let fail = |message: String| Err(crate::Error::ConfigError(message));
        match self.backend.as_str() {
            DATAWARP_BACKEND | EMULATED_BACKEND => {}
            backend => return fail(format!("Unknown backend `{backend}`")),
        }
        if self
            .flags
            .contains(BbFlags::ENABLE_PERSISTENT | BbFlags::DISABLE_PERSISTENT)
        {
            return fail("ENABLE_PERSISTENT and DISABLE_PERSISTENT are mutually exclusive".into());
        }
        if self.max_concurrent_operations == 0 {
            return fail("max_concurrent_operations has to be at least 1".into());
        }
        if self.node_ready_poll.is_zero() {
            return fail("node_ready_poll cannot be zero".into());
        }
        if let Some(pool) = self
            .emulated_pools
            .iter()
            .find(|pool| pool.granularity == 0)
        {
            return fail(format!("Pool {} has zero granularity", pool.name));
        }
        Ok(())
    }

    pub fn policy(&self) -> Policy {
        let users = |ids: &[u32]| ids.iter().copied().map(UserId::new).collect::<Set<_>>();
        Policy {
            privileged_users: users(&self.privileged_users),
            allow_users: users(&self.allow_users),
            deny_users: users(&self.deny_users),
            user_size_limit: self.user_size_limit,
            enable_persistent: self.flags.contains(BbFlags::ENABLE_PERSISTENT),
            disable_persistent: self.flags.contains(BbFlags::DISABLE_PERSISTENT),
            teardown_cooldown: self.teardown_cooldown,
            max_pre_run_retries: self.max_pre_run_retries,
            keep_failed_stage_out: self.flags.contains(BbFlags::KEEP_FAILED_STAGE_OUT),
        }
    }

    /// Refresh period, `BB_REFRESH_INTERVAL_MS` overrides the configured value.
    pub fn refresh_interval(&self) -> Duration {
        get_duration_from_env("BB_REFRESH_INTERVAL_MS").unwrap_or(self.refresh_interval)
    }

    /// Save debounce, `BB_SAVE_DEBOUNCE_MS` overrides the configured value.
    pub fn save_debounce(&self) -> Duration {
        get_duration_from_env("BB_SAVE_DEBOUNCE_MS").unwrap_or(self.save_debounce)
    }

    pub fn state_file(&self) -> PathBuf {
        self.state_dir.join(crate::persist::STATE_FILE_NAME)
    }
}
