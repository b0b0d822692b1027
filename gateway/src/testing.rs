//! Test doubles for the process and upstream seams
//!
//! Used by the unit tests and by `tests/`; nothing here spawns a process or
//! touches the network.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use crate::clients::UpstreamClient;
use crate::error::{GatewayError, Result};
use crate::pkg::command::{recovery_command, version_command};
use crate::pkg::ManagerIdentity;
use crate::process::{CommandRunner, ExecutionOutcome};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// A `CommandRunner` that replays scripted outcomes and records every argv.
///
/// Fixed responses (set with `respond`) answer a specific argv every time;
/// everything else consumes the script in order and succeeds silently once
/// it runs out. `new()` pre-answers each manager's `--version` and
/// cache-clearing command with a success.
pub struct ScriptedRunner {
    script: Mutex<VecDeque<ExecutionOutcome>>,
    responses: Mutex<Vec<(Vec<String>, ExecutionOutcome)>>,
    calls: Mutex<Vec<Vec<String>>>,
}

impl ScriptedRunner {
    pub fn new() -> Self {
        let runner = Self {
            script: Mutex::new(VecDeque::new()),
            responses: Mutex::new(Vec::new()),
            calls: Mutex::new(Vec::new()),
        };
        for (manager, version) in [
            (ManagerIdentity::Npm, "10.8.1"),
            (ManagerIdentity::Yarn, "1.22.22"),
            (ManagerIdentity::Pnpm, "9.12.0"),
        ] {
            lock(&runner.responses).push((
                version_command(manager),
                ExecutionOutcome {
                    stdout: format!("{version}\n"),
                    ..Default::default()
                },
            ));
            lock(&runner.responses).push((recovery_command(manager), ExecutionOutcome::default()));
        }
        runner
    }

    pub fn push(&self, outcome: ExecutionOutcome) {
        lock(&self.script).push_back(outcome);
    }

    pub fn push_success(&self, stdout: &str) {
        self.push(ExecutionOutcome {
            stdout: stdout.to_string(),
            ..Default::default()
        });
    }

    pub fn push_failure(&self, exit_code: i32, stderr: &str) {
        self.push(ExecutionOutcome {
            exit_code,
            stderr: stderr.to_string(),
            ..Default::default()
        });
    }

    /// Always answer `argv` with `outcome`; later calls override earlier ones.
    pub fn respond(&self, argv: &[&str], outcome: ExecutionOutcome) {
        let argv = argv.iter().map(|s| s.to_string()).collect();
        lock(&self.responses).push((argv, outcome));
    }

    pub fn calls(&self) -> Vec<Vec<String>> {
        lock(&self.calls).clone()
    }

    pub fn count_calls(&self, argv: &[&str]) -> usize {
        lock(&self.calls)
            .iter()
            .filter(|call| call.iter().map(String::as_str).eq(argv.iter().copied()))
            .count()
    }
}

impl Default for ScriptedRunner {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CommandRunner for ScriptedRunner {
    async fn run(&self, argv: &[String], _working_dir: &Path, _timeout: Duration) -> ExecutionOutcome {
        lock(&self.calls).push(argv.to_vec());

        let fixed = lock(&self.responses)
            .iter()
            .rev()
            .find(|(expected, _)| expected.as_slice() == argv)
            .map(|(_, outcome)| outcome.clone());

        let mut outcome = fixed
            .or_else(|| lock(&self.script).pop_front())
            .unwrap_or_default();
        outcome.attempts = 1;
        outcome
    }
}

/// An `UpstreamClient` answering from a URL → JSON table and counting calls.
/// Unknown URLs fail with a 404.
#[derive(Default)]
pub struct StaticUpstream {
    responses: Mutex<HashMap<String, Value>>,
    calls: Mutex<Vec<String>>,
    bodies: Mutex<Vec<Value>>,
}

impl StaticUpstream {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(self, url: impl Into<String>, value: Value) -> Self {
        lock(&self.responses).insert(url.into(), value);
        self
    }

    pub fn call_count(&self) -> usize {
        lock(&self.calls).len()
    }

    pub fn calls(&self) -> Vec<String> {
        lock(&self.calls).clone()
    }

    /// Bodies sent with `post_json`, in order
    pub fn bodies(&self) -> Vec<Value> {
        lock(&self.bodies).clone()
    }

    fn answer(&self, url: &str) -> Result<Value> {
        lock(&self.calls).push(url.to_string());
        lock(&self.responses)
            .get(url)
            .cloned()
            .ok_or_else(|| GatewayError::Upstream {
                url: url.to_string(),
                status: 404,
            })
    }
}

#[async_trait]
impl UpstreamClient for StaticUpstream {
    async fn get_json(&self, url: &str) -> Result<Value> {
        self.answer(url)
    }

    async fn post_json(&self, url: &str, body: &Value) -> Result<Value> {
        lock(&self.bodies).push(body.clone());
        self.answer(url)
    }
}
