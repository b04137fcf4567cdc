use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use bbcore::Map;
use parking_lot::Mutex;

use crate::config::EmulatedPool;
use crate::tool::emulated::EmulatedExecutor;
use crate::tool::{ToolExecutor, ToolFuture, ToolOutput};

#[derive(Default)]
struct Script {
    calls: Vec<Vec<String>>,
    failures: Map<String, VecDeque<String>>,
    delays: Map<String, Duration>,
    running: Map<String, usize>,
}

struct ScriptedInner {
    emulated: EmulatedExecutor,
    script: Mutex<Script>,
    max_running_per_token: AtomicUsize,
}

/// Emulated storage system that records every invocation and can be told to
/// fail or stall selected functions.
#[derive(Clone)]
pub struct ScriptedExecutor {
    inner: Arc<ScriptedInner>,
}

fn token(argv: &[String]) -> Option<String> {
    argv.windows(2)
        .find(|pair| pair[0] == "--token" || pair[0] == "-t")
        .map(|pair| pair[1].clone())
}

impl ScriptedExecutor {
    pub fn new(pools: &[EmulatedPool]) -> ScriptedExecutor {
        ScriptedExecutor {
            inner: Arc::new(ScriptedInner {
                emulated: EmulatedExecutor::new(pools),
                script: Default::default(),
                max_running_per_token: AtomicUsize::new(0),
            }),
        }
    }

    pub fn emulated(&self) -> &EmulatedExecutor {
        &self.inner.emulated
    }

    /// The next call of `function` exits with 1 and prints `message`.
    pub fn fail_next(&self, function: &str, message: &str) {
        self.inner
            .script
            .lock()
            .failures
            .entry(function.to_string())
            .or_default()
            .push_back(message.to_string());
    }

    pub fn delay(&self, function: &str, delay: Duration) {
        self.inner
            .script
            .lock()
            .delays
            .insert(function.to_string(), delay);
    }

    pub fn calls(&self, function: &str) -> Vec<Vec<String>> {
        self.inner
            .script
            .lock()
            .calls
            .iter()
            .filter(|argv| argv[0] == function)
            .cloned()
            .collect()
    }

    /// Functions invoked with `--token <token>`, in order
    pub fn functions(&self, token_value: &str) -> Vec<String> {
        self.inner
            .script
            .lock()
            .calls
            .iter()
            .filter(|argv| token(argv).as_deref() == Some(token_value))
            .map(|argv| argv[0].clone())
            .collect()
    }

    pub fn max_running_per_token(&self) -> usize {
        self.inner.max_running_per_token.load(Ordering::SeqCst)
    }
}

impl ToolExecutor for ScriptedExecutor {
    fn name(&self) -> &'static str {
        "scripted"
    }

    fn execute(&self, argv: Vec<String>, _timeout: Duration) -> ToolFuture {
        let inner = self.inner.clone();
        Box::pin(async move {
            let function = argv[0].clone();
            let token = token(&argv);
            let delay = {
                let mut script = inner.script.lock();
                script.calls.push(argv.clone());
                if let Some(token) = &token {
                    let running = script.running.entry(token.clone()).or_default();
                    *running += 1;
                    inner
                        .max_running_per_token
                        .fetch_max(*running, Ordering::SeqCst);
                }
                script.delays.get(&function).copied()
            };
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            let failure = {
                let mut script = inner.script.lock();
                if let Some(token) = &token {
                    if let Some(running) = script.running.get_mut(token) {
                        *running -= 1;
                    }
                }
                script
                    .failures
                    .get_mut(&function)
                    .and_then(|queue| queue.pop_front())
            };
            Ok(match failure {
                Some(message) => ToolOutput::failed(1, message),
                None => inner.emulated.run(&argv),
            })
        })
    }
}
