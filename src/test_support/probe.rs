//! Scripted [`LivenessProbe`] for deterministic liveness waits.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};

use crate::liveness::{LivenessProbe, ProbeError, ProbeFuture};

/// Replays scripted answers; the last one repeats. With nothing scripted the
/// probe answers `200`.
#[derive(Clone, Debug, Default)]
pub struct ScriptedProbe {
    state: Arc<Mutex<ProbeState>>,
}

#[derive(Debug, Default)]
struct ProbeState {
    answers: VecDeque<Result<u16, ProbeError>>,
    requests: Vec<String>,
}

impl ScriptedProbe {
    /// Creates a probe that answers with `statuses` in order.
    #[must_use]
    pub fn with_statuses(statuses: &[u16]) -> Self {
        let probe = Self::default();
        for status in statuses {
            probe.push_status(*status);
        }
        probe
    }

    /// Queues an HTTP status.
    pub fn push_status(&self, status: u16) {
        self.with_state(|state| state.answers.push_back(Ok(status)));
    }

    /// Queues a request that fails before any status is received.
    pub fn push_unreachable(&self) {
        self.with_state(|state| {
            state.answers.push_back(Err(ProbeError {
                url: String::from("scripted"),
                message: String::from("connection refused"),
            }));
        });
    }

    /// URLs requested so far, in order.
    #[must_use]
    pub fn requests(&self) -> Vec<String> {
        self.with_state(|state| state.requests.clone())
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut ProbeState) -> T) -> T {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut state)
    }
}

impl LivenessProbe for ScriptedProbe {
    fn status<'a>(&'a self, url: &'a str) -> ProbeFuture<'a> {
        let answer = self.with_state(|state| {
            state.requests.push(url.to_owned());
            if state.answers.len() > 1 {
                state.answers.pop_front()
            } else {
                state.answers.front().cloned()
            }
        });
        Box::pin(std::future::ready(answer.unwrap_or(Ok(200))))
    }
}
