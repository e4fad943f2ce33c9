#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use signal_sandbox::Config;
use signal_sandbox::paths::Paths;
use signal_sandbox::sandbox::runtime::{
    CapturedOutput, InstanceSpec, InstanceSummary, IsolationRuntime, RemoveOutcome, RuntimeError,
    RuntimeProbe,
};

/// In-memory isolation runtime with scripted behaviour.
pub struct ScriptedRuntime {
    state: Mutex<State>,
}

#[derive(Default)]
struct State {
    reachable: bool,
    version: String,
    exit_code: i64,
    stdout: String,
    stderr: String,
    run_for: Duration,
    live: HashMap<String, InstanceSummary>,
    created: Vec<String>,
    removed: Vec<String>,
    killed: Vec<String>,
}

impl ScriptedRuntime {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                reachable: true,
                version: "27.3.1".into(),
                ..State::default()
            }),
        }
    }

    pub fn unreachable(self) -> Self {
        self.state.lock().unwrap().reachable = false;
        self
    }

    pub fn version(self, version: &str) -> Self {
        self.state.lock().unwrap().version = version.to_string();
        self
    }

    pub fn exits_with(self, code: i64) -> Self {
        self.state.lock().unwrap().exit_code = code;
        self
    }

    pub fn prints(self, stdout: &str) -> Self {
        self.state.lock().unwrap().stdout = stdout.to_string();
        self
    }

    pub fn prints_err(self, stderr: &str) -> Self {
        self.state.lock().unwrap().stderr = stderr.to_string();
        self
    }

    /// Make every instance run this long before exiting.
    pub fn runs_for(self, duration: Duration) -> Self {
        self.state.lock().unwrap().run_for = duration;
        self
    }

    /// Pretend an instance already exists, e.g. one leaked by a crash.
    pub fn with_instance(
        self,
        name: &str,
        created_at: Option<DateTime<Utc>>,
        labels: &[(&str, &str)],
    ) -> Self {
        self.state.lock().unwrap().live.insert(
            name.to_string(),
            InstanceSummary {
                name: name.to_string(),
                created_at,
                labels: labels
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
            },
        );
        self
    }

    pub fn created(&self) -> Vec<String> {
        self.state.lock().unwrap().created.clone()
    }

    pub fn removed(&self) -> Vec<String> {
        self.state.lock().unwrap().removed.clone()
    }

    pub fn killed(&self) -> Vec<String> {
        self.state.lock().unwrap().killed.clone()
    }

    pub fn live_count(&self) -> usize {
        self.state.lock().unwrap().live.len()
    }

    fn check_reachable(&self) -> Result<(), RuntimeError> {
        if self.state.lock().unwrap().reachable {
            Ok(())
        } else {
            Err(RuntimeError::Connect {
                endpoint: "unix:///var/run/docker.sock".into(),
                message: "connection refused".into(),
            })
        }
    }
}

#[async_trait]
impl IsolationRuntime for ScriptedRuntime {
    async fn probe(&self) -> Result<RuntimeProbe, RuntimeError> {
        self.check_reachable()?;
        Ok(RuntimeProbe {
            version: self.state.lock().unwrap().version.clone(),
            mem_total_bytes: Some(16 * 1024 * 1024 * 1024),
        })
    }

    async fn create(&self, spec: &InstanceSpec) -> Result<(), RuntimeError> {
        self.check_reachable()?;
        let mut state = self.state.lock().unwrap();
        state.created.push(spec.name.clone());
        state.live.insert(
            spec.name.clone(),
            InstanceSummary {
                name: spec.name.clone(),
                created_at: Some(Utc::now()),
                labels: spec.labels.clone(),
            },
        );
        Ok(())
    }

    async fn start(&self, name: &str) -> Result<(), RuntimeError> {
        self.check_reachable()?;
        if self.state.lock().unwrap().live.contains_key(name) {
            Ok(())
        } else {
            Err(RuntimeError::NotFound(name.to_string()))
        }
    }

    async fn wait(&self, _name: &str) -> Result<i64, RuntimeError> {
        let (run_for, exit_code) = {
            let state = self.state.lock().unwrap();
            (state.run_for, state.exit_code)
        };
        if !run_for.is_zero() {
            tokio::time::sleep(run_for).await;
        }
        Ok(exit_code)
    }

    async fn logs(&self, _name: &str, _max_bytes: usize) -> Result<CapturedOutput, RuntimeError> {
        let state = self.state.lock().unwrap();
        Ok(CapturedOutput {
            stdout: state.stdout.clone(),
            stderr: state.stderr.clone(),
            truncated: false,
        })
    }

    async fn kill(&self, name: &str) -> Result<(), RuntimeError> {
        self.state.lock().unwrap().killed.push(name.to_string());
        Ok(())
    }

    async fn remove(&self, name: &str) -> Result<RemoveOutcome, RuntimeError> {
        let mut state = self.state.lock().unwrap();
        state.removed.push(name.to_string());
        match state.live.remove(name) {
            Some(_) => Ok(RemoveOutcome::Removed),
            None => Ok(RemoveOutcome::AlreadyGone),
        }
    }

    async fn list_labeled(
        &self,
        key: &str,
        value: &str,
    ) -> Result<Vec<InstanceSummary>, RuntimeError> {
        self.check_reachable()?;
        let state = self.state.lock().unwrap();
        let mut instances: Vec<_> = state
            .live
            .values()
            .filter(|i| i.labels.get(key).map(String::as_str) == Some(value))
            .cloned()
            .collect();
        instances.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(instances)
    }
}

/// Default config rooted in a temporary directory.
pub fn config_in(root: &Path) -> Config {
    Config {
        paths: Paths::under(root),
        ..Config::default()
    }
}

pub fn emitting(payload: &str) -> String {
    format!("<<<RESULT_START>>>{payload}<<<RESULT_END>>>\n")
}
