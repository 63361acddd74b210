use futures::future::BoxFuture;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Upper bound for a single attempt, connect plus response
pub const ATTEMPT_TIMEOUT: Duration = Duration::from_secs(2);

/// One liveness attempt. `true` only for a definitive success.
pub trait HealthCheck: Send + Sync {
    fn check(&self) -> BoxFuture<'_, bool>;
}

/// GET against the backend's liveness endpoint; only the status code matters
pub struct HttpHealthCheck {
    client: reqwest::Client,
    url: String,
}

impl HttpHealthCheck {
    pub fn new(port: u16, path: &str) -> Self {
        let path = if path.starts_with('/') {
            path.to_string()
        } else {
            format!("/{path}")
        };

        let client = reqwest::Client::builder()
            .connect_timeout(ATTEMPT_TIMEOUT)
            .timeout(ATTEMPT_TIMEOUT)
            .build()
            .unwrap_or_default();

        Self {
            client,
            url: format!("http://127.0.0.1:{port}{path}"),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

impl HealthCheck for HttpHealthCheck {
    fn check(&self) -> BoxFuture<'_, bool> {
        Box::pin(async move {
            match self.client.get(&self.url).send().await {
                Ok(response) => response.status().is_success(),
                Err(e) => {
                    debug!("health check transport error: {}", e);
                    false
                }
            }
        })
    }
}

/// How a probe session ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeOutcome {
    Healthy { attempts: u32 },
    Exhausted { attempts: u32 },
    /// The process exited (or shutdown began) while probing
    Cancelled { attempts: u32 },
}

impl ProbeOutcome {
    pub fn attempts(&self) -> u32 {
        match *self {
            ProbeOutcome::Healthy { attempts }
            | ProbeOutcome::Exhausted { attempts }
            | ProbeOutcome::Cancelled { attempts } => attempts,
        }
    }
}

/// Bounded linear retry loop: a fixed number of attempts with a fixed delay
/// after each failed one. An attempt that outlives `attempt_timeout` counts
/// as failed, so the worst case is `retries * (attempt_timeout + interval)`.
#[derive(Debug, Clone, Copy)]
pub struct HealthProbe {
    retries: u32,
    interval: Duration,
    attempt_timeout: Duration,
}

impl HealthProbe {
    pub fn new(retries: u32, interval: Duration) -> Self {
        Self {
            retries: retries.max(1),
            interval,
            attempt_timeout: ATTEMPT_TIMEOUT,
        }
    }

    pub fn with_attempt_timeout(mut self, timeout: Duration) -> Self {
        self.attempt_timeout = timeout;
        self
    }

    pub fn retries(&self) -> u32 {
        self.retries
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub async fn run<C>(&self, check: &C, cancel: &CancellationToken) -> ProbeOutcome
    where
        C: HealthCheck + ?Sized,
    {
        for attempt in 1..=self.retries {
            let healthy = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    warn!(attempt, "health probe cancelled");
                    return ProbeOutcome::Cancelled { attempts: attempt };
                }
                result = tokio::time::timeout(self.attempt_timeout, check.check()) => {
                    result.unwrap_or_else(|_| {
                        debug!(attempt, "health check timed out after {:?}", self.attempt_timeout);
                        false
                    })
                }
            };

            if healthy {
                info!(attempt, "backend is healthy");
                return ProbeOutcome::Healthy { attempts: attempt };
            }

            debug!(attempt, retries = self.retries, "backend not ready yet");

            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    warn!(attempt, "health probe cancelled");
                    return ProbeOutcome::Cancelled { attempts: attempt };
                }
                _ = tokio::time::sleep(self.interval) => {}
            }
        }

        warn!(attempts = self.retries, "health probe budget exhausted");
        ProbeOutcome::Exhausted {
            attempts: self.retries,
        }
    }
}
