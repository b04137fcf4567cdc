//! In-memory stand-in for the storage system, speaking the same argument and
//! JSON contract as the real tool.

use std::time::Duration;

use bbcore::Map;
use bbcore::common::size::round_up;
use parking_lot::Mutex;
use serde_json::json;

use crate::config::{EMULATED_BACKEND, EmulatedPool};
use crate::tool::{ToolExecutor, ToolFuture, ToolOutput};

#[derive(Debug)]
struct Session {
    id: u64,
    owner: u32,
    created: i64,
    pool: String,
    size: u64,
}

#[derive(Debug, Default)]
struct EmulatedState {
    pools: Vec<EmulatedPool>,
    sessions: Map<String, Session>,
    session_counter: u64,
}

impl EmulatedState {
    fn pool(&self, name: &str) -> Option<&EmulatedPool> {
        self.pools.iter().find(|pool| pool.name == name)
    }

    fn used(&self, pool: &str) -> u64 {
        self.sessions
            .values()
            .filter(|session| session.pool == pool)
            .map(|session| session.size)
            .sum()
    }

    fn create_session(&mut self, token: &str, owner: u32, capacity: &str) -> ToolOutput {
        if self.sessions.contains_key(token) {
            return ToolOutput::failed(1, format!("session {token} already exists"));
        }
        let Some((pool_name, size)) = capacity.split_once(':') else {
            return ToolOutput::failed(1, format!("invalid capacity `{capacity}`"));
        };
        let Ok(size) = size.parse::<u64>() else {
            return ToolOutput::failed(1, format!("invalid capacity `{capacity}`"));
        };
        let Some(pool) = self.pool(pool_name) else {
            return ToolOutput::failed(1, format!("unknown pool {pool_name}"));
        };
        let size = round_up(size, pool.granularity);
        if self.used(pool_name) + size > pool.total {
            return ToolOutput::failed(1, format!("insufficient capacity in pool {pool_name}"));
        }
        self.session_counter += 1;
        self.sessions.insert(
            token.to_string(),
            Session {
                id: self.session_counter,
                owner,
                created: chrono::Utc::now().timestamp(),
                pool: pool_name.to_string(),
                size,
            },
        );
        ToolOutput::ok("")
    }

    fn pools_json(&self) -> serde_json::Value {
        let pools: Vec<_> = self
            .pools
            .iter()
            .map(|pool| {
                let free = pool.total.saturating_sub(self.used(&pool.name));
                json!({
                    "id": pool.name,
                    "units": "bytes",
                    "granularity": pool.granularity,
                    "quantity": pool.total / pool.granularity,
                    "free": free / pool.granularity,
                })
            })
            .collect();
        json!({ "pools": pools })
    }

    fn sorted_sessions(&self) -> Vec<(&String, &Session)> {
        let mut sessions: Vec<_> = self.sessions.iter().collect();
        sessions.sort_unstable_by_key(|(_, session)| session.id);
        sessions
    }

    fn sessions_json(&self) -> serde_json::Value {
        let sessions: Vec<_> = self
            .sorted_sessions()
            .into_iter()
            .map(|(token, session)| {
                json!({
                    "id": session.id,
                    "token": token,
                    "created": session.created,
                    "owner": session.owner,
                })
            })
            .collect();
        json!({ "sessions": sessions })
    }

    fn instances_json(&self) -> serde_json::Value {
        let instances: Vec<_> = self
            .sorted_sessions()
            .into_iter()
            .filter(|(_, session)| session.size > 0)
            .map(|(_, session)| {
                json!({
                    "id": session.id,
                    "capacity": { "bytes": session.size },
                    "links": { "session": session.id },
                })
            })
            .collect();
        json!({ "instances": instances })
    }

    fn configurations_json(&self) -> serde_json::Value {
        let configurations: Vec<_> = self
            .sorted_sessions()
            .into_iter()
            .filter(|(_, session)| session.size > 0)
            .map(|(_, session)| {
                json!({
                    "id": session.id,
                    "type": "scratch",
                    "links": { "instance": session.id },
                })
            })
            .collect();
        json!({ "configurations": configurations })
    }

    fn execute(&mut self, argv: &[String]) -> ToolOutput {
        let function = argv.first().map(String::as_str).unwrap_or_default();
        let token = flag(argv, &["--token", "-t"]);
        match function {
            "pools" => ToolOutput::ok(self.pools_json().to_string()),
            "show_sessions" => ToolOutput::ok(self.sessions_json().to_string()),
            "show_instances" => ToolOutput::ok(self.instances_json().to_string()),
            "show_configurations" => ToolOutput::ok(self.configurations_json().to_string()),
            "job_process" => ToolOutput::ok(""),
            "setup" | "create_persistent" => {
                let owner = flag(argv, &["--user", "-u"]).and_then(|u| u.parse::<u32>().ok());
                let capacity = flag(argv, &["--capacity", "-C"]);
                match (token, owner, capacity) {
                    (Some(token), Some(owner), Some(capacity)) => {
                        self.create_session(token, owner, capacity)
                    }
                    _ => ToolOutput::failed(2, format!("{function}: missing arguments")),
                }
            }
            "real_size" => match token.and_then(|token| self.sessions.get(token)) {
                Some(session) => ToolOutput::ok(
                    json!({ "capacity": session.size, "units": "bytes" }).to_string(),
                ),
                None => ToolOutput::failed(1, "token not found"),
            },
            "data_in" | "pre_run" | "post_run" | "data_out" => {
                match token.filter(|token| self.sessions.contains_key(*token)) {
                    Some(_) => ToolOutput::ok(""),
                    None => ToolOutput::failed(1, "token not found"),
                }
            }
            "teardown" | "destroy_persistent" => {
                match token.and_then(|token| self.sessions.remove(token)) {
                    Some(_) => ToolOutput::ok(""),
                    None => ToolOutput::failed(1, "token not found"),
                }
            }
            _ => ToolOutput::failed(2, format!("unknown function `{function}`")),
        }
    }
}

fn flag<'a>(argv: &'a [String], names: &[&str]) -> Option<&'a str> {
    argv.windows(2)
        .find(|pair| names.contains(&pair[0].as_str()))
        .map(|pair| pair[1].as_str())
}

pub struct EmulatedExecutor {
    state: Mutex<EmulatedState>,
}

impl EmulatedExecutor {
    pub fn new(pools: &[EmulatedPool]) -> Self {
        Self {
            state: Mutex::new(EmulatedState {
                pools: pools.to_vec(),
                ..Default::default()
            }),
        }
    }

    pub fn session_count(&self) -> usize {
        self.state.lock().sessions.len()
    }

    pub fn has_session(&self, token: &str) -> bool {
        self.state.lock().sessions.contains_key(token)
    }

    /// Runs a function synchronously.
    pub fn run(&self, argv: &[String]) -> ToolOutput {
        self.state.lock().execute(argv)
    }
}

impl ToolExecutor for EmulatedExecutor {
    fn name(&self) -> &'static str {
        EMULATED_BACKEND
    }

    fn execute(&self, argv: Vec<String>, _timeout: Duration) -> ToolFuture {
        let output = self.run(&argv);
        Box::pin(async move { Ok(output) })
    }
}
