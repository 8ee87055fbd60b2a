//! Test support utilities shared across unit and integration tests.

use std::collections::{BTreeSet, VecDeque};
use std::env;
use std::ffi::OsString;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::{Mutex as AsyncMutex, MutexGuard};

use crate::transport::{CommandOutput, CommandRunner, SpawnError};

mod fixtures;
mod probe;
mod provider;

pub use fixtures::{ROLLOUT_BALANCER, ROLLOUT_DATASTORE, rollout_provider, session_config, stack_config};
pub use probe::ScriptedProbe;
pub use provider::{ProviderCall, ScriptedProvider};

/// Scripted command runner that returns pre-seeded outputs.
///
/// Responses are chosen in this order: the first rule whose needle occurs in
/// the rendered command line and still has a queued response, then the FIFO
/// queue, then the fallback response. With none available the invocation
/// fails to "spawn". Every invocation is recorded.
#[derive(Clone, Debug, Default)]
pub struct ScriptedRunner {
    state: Arc<Mutex<ScriptState>>,
}

#[derive(Debug, Default)]
struct ScriptState {
    responses: VecDeque<CommandOutput>,
    rules: Vec<Rule>,
    fallback: Option<CommandOutput>,
    invocations: Vec<CommandInvocation>,
}

#[derive(Debug)]
struct Rule {
    needle: String,
    responses: VecDeque<CommandOutput>,
    sticky: Option<CommandOutput>,
}

/// Records a single invocation made through [`ScriptedRunner`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CommandInvocation {
    /// Program name as passed to the runner.
    pub program: String,
    /// Arguments passed to the program.
    pub args: Vec<OsString>,
}

impl CommandInvocation {
    /// Returns a shell-like command string for assertions.
    #[must_use]
    pub fn command_string(&self) -> String {
        let mut parts = Vec::with_capacity(self.args.len() + 1);
        parts.push(self.program.clone());
        parts.extend(
            self.args
                .iter()
                .map(|arg| arg.to_string_lossy().into_owned()),
        );
        parts.join(" ")
    }

    /// Returns the final argument, which for `ssh` is the remote command.
    #[must_use]
    pub fn last_arg(&self) -> String {
        self.args
            .last()
            .map(|arg| arg.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

fn output(code: Option<i32>, stdout: &str, stderr: &str) -> CommandOutput {
    CommandOutput {
        code,
        stdout: stdout.to_owned(),
        stderr: stderr.to_owned(),
    }
}

impl ScriptedRunner {
    /// Creates a new runner with no queued responses.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a runner that answers every unmatched invocation with exit
    /// code zero.
    #[must_use]
    pub fn succeeding() -> Self {
        let runner = Self::default();
        runner.set_fallback(Some(0), "", "");
        runner
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut ScriptState) -> T) -> T {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut state)
    }

    /// Returns a snapshot of all invocations recorded so far.
    #[must_use]
    pub fn invocations(&self) -> Vec<CommandInvocation> {
        self.with_state(|state| state.invocations.clone())
    }

    /// Rendered command lines of every invocation, in order.
    #[must_use]
    pub fn command_lines(&self) -> Vec<String> {
        self.invocations()
            .iter()
            .map(CommandInvocation::command_string)
            .collect()
    }

    /// Counts invocations whose command line contains `needle`.
    #[must_use]
    pub fn count_containing(&self, needle: &str) -> usize {
        self.command_lines()
            .iter()
            .filter(|line| line.contains(needle))
            .count()
    }

    /// Pushes a successful exit status.
    pub fn push_success(&self) {
        self.push_output(Some(0), "", "");
    }

    /// Pushes a specific exit code.
    pub fn push_exit_code(&self, code: i32) {
        self.push_output(Some(code), "", "");
    }

    /// Pushes a failing exit code with stderr text.
    pub fn push_failure(&self, code: i32) {
        self.push_output(Some(code), "", "simulated failure");
    }

    /// Pushes a response with no exit code to simulate abnormal termination.
    pub fn push_missing_exit_code(&self) {
        self.push_output(None, "", "");
    }

    /// Pushes an explicit command output response.
    pub fn push_output(
        &self,
        code: Option<i32>,
        stdout: impl Into<String>,
        stderr: impl Into<String>,
    ) {
        let response = CommandOutput {
            code,
            stdout: stdout.into(),
            stderr: stderr.into(),
        };
        self.with_state(|state| state.responses.push_back(response));
    }

    /// Queues one response for the next invocation containing `needle`.
    pub fn respond_once(&self, needle: &str, code: i32, stderr: &str) {
        let response = output(Some(code), "", stderr);
        self.with_state(|state| state.update_rule(needle, |rule| rule.responses.push_back(response)));
    }

    /// Queues a response without an exit code for the next invocation
    /// containing `needle`, as if the process had been killed.
    pub fn respond_once_without_code(&self, needle: &str) {
        let response = output(None, "", "");
        self.with_state(|state| state.update_rule(needle, |rule| rule.responses.push_back(response)));
    }

    /// Answers every invocation containing `needle` with `code` once its
    /// queued responses are exhausted.
    pub fn respond_always(&self, needle: &str, code: i32) {
        let response = output(Some(code), "", "simulated failure");
        self.with_state(|state| state.update_rule(needle, |rule| rule.sticky = Some(response)));
    }

    /// Sets the response used when nothing else matches.
    pub fn set_fallback(&self, code: Option<i32>, stdout: &str, stderr: &str) {
        let response = output(code, stdout, stderr);
        self.with_state(|state| state.fallback = Some(response));
    }
}

impl ScriptState {
    fn update_rule(&mut self, needle: &str, update: impl FnOnce(&mut Rule)) {
        if let Some(rule) = self.rules.iter_mut().find(|rule| rule.needle == needle) {
            update(rule);
            return;
        }
        let mut rule = Rule {
            needle: needle.to_owned(),
            responses: VecDeque::new(),
            sticky: None,
        };
        update(&mut rule);
        self.rules.push(rule);
    }

    fn respond(&mut self, line: &str) -> Option<CommandOutput> {
        for rule in self.rules.iter_mut().filter(|rule| line.contains(&rule.needle)) {
            if let Some(response) = rule.responses.pop_front() {
                return Some(response);
            }
            if let Some(ref response) = rule.sticky {
                return Some(response.clone());
            }
        }
        self.responses
            .pop_front()
            .or_else(|| self.fallback.clone())
    }
}

impl CommandRunner for ScriptedRunner {
    fn run(&self, program: &str, args: &[OsString]) -> Result<CommandOutput, SpawnError> {
        let invocation = CommandInvocation {
            program: program.to_owned(),
            args: args.to_vec(),
        };
        let line = invocation.command_string();
        self.with_state(|state| {
            state.invocations.push(invocation);
            state.respond(&line)
        })
        .ok_or_else(|| SpawnError {
            program: program.to_owned(),
            message: String::from("no scripted response available"),
        })
    }
}

/// Global mutex used to serialise environment mutation in tests.
pub static ENV_LOCK: AsyncMutex<()> = AsyncMutex::const_new(());

/// Guard that holds the env mutex and cleans up variables on drop.
pub struct EnvGuard {
    previous: Vec<(String, Option<OsString>)>,
    _guard: MutexGuard<'static, ()>,
}

impl EnvGuard {
    /// Sets multiple environment variables while holding a global mutex.
    pub async fn set_vars(pairs: &[(&str, &str)]) -> Self {
        debug_assert!(
            {
                let mut seen = BTreeSet::new();
                pairs.iter().all(|(key, _)| seen.insert(*key))
            },
            "duplicate environment variable keys passed to EnvGuard::set_vars"
        );

        let guard = ENV_LOCK.lock().await;
        let mut previous = Vec::with_capacity(pairs.len());
        for (key, value) in pairs {
            let old = env::var_os(key);
            // SAFETY: Environment mutation is serialised by `ENV_LOCK`, preventing races.
            unsafe { env::set_var(key, value) };
            previous.push(((*key).to_owned(), old));
        }

        Self {
            previous,
            _guard: guard,
        }
    }
}

impl Drop for EnvGuard {
    fn drop(&mut self) {
        for (key, old) in &self.previous {
            // SAFETY: Environment mutation is serialised by holding `_guard`.
            unsafe {
                match old {
                    Some(val) => env::set_var(key, val),
                    None => env::remove_var(key),
                }
            }
        }
    }
}
