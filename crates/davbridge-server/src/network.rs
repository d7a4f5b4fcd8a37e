//! Network reachability
//!
//! The file server is only started once the storage backend can be reached.
//! [`wait_for_network`] polls a [`NetworkProbe`] with capped exponential
//! backoff until it succeeds or the wait is cancelled. There is no overall
//! timeout.

use std::time::Duration;

use davbridge_core::{domain::BackendError, ports::NetworkProbe};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::lifecycle::ServerError;

/// Capped exponential backoff schedule
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max: max.max(initial),
        }
    }

    /// Delay before retry number `attempt` (0-based)
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.min(16));
        self.initial.saturating_mul(factor).min(self.max)
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(Duration::from_millis(500), Duration::from_secs(30))
    }
}

/// Blocks until `probe` reports the network as reachable
///
/// # Errors
///
/// Returns [`ServerError::Cancelled`] if `cancel` fires first.
pub async fn wait_for_network(
    probe: &dyn NetworkProbe,
    backoff: Backoff,
    cancel: &CancellationToken,
) -> Result<(), ServerError> {
    let mut attempt: u32 = 0;

    loop {
        if cancel.is_cancelled() {
            return Err(ServerError::Cancelled);
        }

        match probe.check().await {
            Ok(()) => {
                if attempt > 0 {
                    info!(attempt, "Network reachable after retry");
                } else {
                    debug!("Network reachable");
                }
                return Ok(());
            }
            Err(e) => {
                let delay = backoff.delay(attempt);
                warn!(
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Network unavailable, retrying"
                );
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = cancel.cancelled() => return Err(ServerError::Cancelled),
                }
                attempt = attempt.saturating_add(1);
            }
        }
    }
}

// ============================================================================
// HttpProbe
// ============================================================================

/// Probe issuing a HEAD request against a fixed URL
///
/// Any HTTP response counts as reachable, whatever its status. Only
/// transport failures (DNS, connect, timeout) are reported as unreachable.
#[derive(Debug, Clone)]
pub struct HttpProbe {
    client: reqwest::Client,
    url: String,
}

impl HttpProbe {
    /// Creates a probe for `url` with a per-attempt `timeout`
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, BackendError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| BackendError::Other(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait::async_trait]
impl NetworkProbe for HttpProbe {
    async fn check(&self) -> Result<(), BackendError> {
        match self.client.head(&self.url).send().await {
            Ok(response) => {
                debug!(url = %self.url, status = %response.status(), "Probe answered");
                Ok(())
            }
            Err(e) => Err(BackendError::Network(e.to_string())),
        }
    }
}
