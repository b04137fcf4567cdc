use std::path::Path;
use std::time::Duration;

use derive_builder::Builder;

use crate::config::{BbConfig, BbFlags, EMULATED_BACKEND, EmulatedPool, TimeoutConfig};

pub const TEST_POOL: &str = "wlm_pool";

#[derive(Builder, Clone)]
#[builder(pattern = "owned", build_fn(name = "finish"))]
pub struct TestConfig {
    #[builder(default = "1000")]
    pool_total: u64,
    #[builder(default = "100")]
    granularity: u64,
    #[builder(default)]
    flags: BbFlags,
    #[builder(default)]
    privileged_users: Vec<u32>,
    #[builder(default)]
    user_size_limit: Option<u64>,
    #[builder(default = "Duration::ZERO")]
    teardown_cooldown: Duration,
    #[builder(default = "1")]
    max_pre_run_retries: u32,
    #[builder(default = "Duration::from_secs(5)")]
    shutdown_grace: Duration,
    #[builder(default = "4")]
    max_concurrent_operations: usize,
    #[builder(default = "Duration::from_secs(1)")]
    node_ready_timeout: Duration,
}

impl TestConfig {
    pub fn pools(&self) -> Vec<EmulatedPool> {
        vec![EmulatedPool {
            name: TEST_POOL.to_string(),
            granularity: self.granularity,
            total: self.pool_total,
        }]
    }

    pub fn into_config(self, state_dir: &Path) -> BbConfig {
        BbConfig {
            backend: EMULATED_BACKEND.to_string(),
            state_dir: state_dir.to_path_buf(),
            default_pool: Some(TEST_POOL.to_string()),
            flags: self.flags,
            privileged_users: self.privileged_users.clone(),
            user_size_limit: self.user_size_limit,
            timeouts: TimeoutConfig::default(),
            max_concurrent_operations: self.max_concurrent_operations,
            shutdown_grace: self.shutdown_grace,
            refresh_interval: Duration::from_secs(3600),
            save_debounce: Duration::from_millis(10),
            teardown_cooldown: self.teardown_cooldown,
            max_pre_run_retries: self.max_pre_run_retries,
            node_ready_timeout: self.node_ready_timeout,
            node_ready_poll: Duration::from_millis(10),
            emulated_pools: self.pools(),
            ..Default::default()
        }
    }
}
