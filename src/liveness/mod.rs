//! External liveness checks against the public base URL.

use std::future::Future;
use std::pin::Pin;
use std::sync::LazyLock;
use std::time::Duration;

use thiserror::Error;
use tracing::info;

use crate::poller::{PollFailure, PollOutcome, Poller};

/// Per-request timeout for liveness probes.
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Default delay between liveness probes.
pub const DEFAULT_LIVENESS_INTERVAL: Duration = Duration::from_secs(10);

static HTTP_CLIENT: LazyLock<reqwest::Client> = LazyLock::new(|| {
    reqwest::Client::builder()
        .timeout(PROBE_TIMEOUT)
        .connect_timeout(PROBE_TIMEOUT)
        .build()
        .unwrap_or_else(|_| reqwest::Client::new())
});

/// Future returned by [`LivenessProbe::status`].
pub type ProbeFuture<'a> = Pin<Box<dyn Future<Output = Result<u16, ProbeError>> + Send + 'a>>;

/// A single probe attempt that produced no HTTP status.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
#[error("GET {url} failed: {message}")]
pub struct ProbeError {
    /// URL that was requested.
    pub url: String,
    /// Transport diagnostic.
    pub message: String,
}

/// Errors raised while waiting for the service to come alive.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum LivenessError {
    /// The service never answered within the ceiling.
    #[error("{url} did not answer within {}s (waited {}s)", .ceiling.as_secs(), .elapsed.as_secs())]
    Timeout {
        /// URL being probed.
        url: String,
        /// Time spent waiting.
        elapsed: Duration,
        /// Configured ceiling.
        ceiling: Duration,
    },
}

/// Issues one GET request and reports the HTTP status.
pub trait LivenessProbe: Send + Sync {
    /// Requests `url` and returns the response status code.
    fn status<'a>(&'a self, url: &'a str) -> ProbeFuture<'a>;
}

/// [`LivenessProbe`] backed by a shared `reqwest` client.
#[derive(Clone, Copy, Debug, Default)]
pub struct HttpProbe;

impl LivenessProbe for HttpProbe {
    fn status<'a>(&'a self, url: &'a str) -> ProbeFuture<'a> {
        Box::pin(async move {
            HTTP_CLIENT
                .get(url)
                .send()
                .await
                .map(|response| response.status().as_u16())
                .map_err(|err| ProbeError {
                    url: url.to_owned(),
                    message: err.to_string(),
                })
        })
    }
}

/// Any answer below 500 means the service is up, even if it is unhappy with
/// the request.
#[must_use]
pub fn is_alive(status: u16) -> bool {
    (200..500).contains(&status)
}

/// Turns a bare host name into the URL that is probed.
#[must_use]
pub fn probe_url(base_url: &str) -> String {
    if base_url.starts_with("http://") || base_url.starts_with("https://") {
        base_url.to_owned()
    } else {
        format!("http://{}/", base_url.trim_end_matches('/'))
    }
}

async fn observe<P: LivenessProbe>(probe: &P, url: &str) -> Result<bool, PollFailure<LivenessError>> {
    match probe.status(url).await {
        Ok(status) => {
            info!(url, status, "GET returned");
            Ok(is_alive(status))
        }
        Err(err) => {
            info!(url, error = %err, "GET did not complete");
            Ok(false)
        }
    }
}

/// Polls `base_url` until it answers with a status below 500.
///
/// # Errors
///
/// Returns [`LivenessError::Timeout`] when `max_wait` elapses first.
pub async fn await_liveness<P: LivenessProbe>(
    probe: &P,
    base_url: &str,
    max_wait: Duration,
    interval: Duration,
) -> Result<(), LivenessError> {
    let url = probe_url(base_url);
    info!(url = %url, "Waiting for the service to answer on its public URL");
    let outcome = Poller::bounded(max_wait, interval)
        .wait_until(|| observe(probe, &url))
        .await?;

    match outcome {
        PollOutcome::Satisfied { attempts } => {
            info!(url = %url, attempts, "Service is alive");
            Ok(())
        }
        PollOutcome::TimedOut {
            elapsed, ceiling, ..
        } => Err(LivenessError::Timeout {
            url,
            elapsed,
            ceiling,
        }),
    }
}
