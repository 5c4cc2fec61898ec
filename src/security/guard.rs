//! Admission control: per-endpoint rate limits plus abuse escalation.
//!
//! Decision order for a request from `client` to `endpoint`:
//!
//! 1. No policy for `endpoint` → allowed (fail open on configuration gaps).
//! 2. `client` blocked → rejected with the block message, no counting.
//! 3. Window absent or elapsed → fresh window with count 1, allowed.
//! 4. Window exhausted → rejected with the policy message and reset time;
//!    the rejection is logged as suspicious activity, which may block the
//!    client for every endpoint.
//! 5. Otherwise counted and allowed.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::debug;

use super::abuse::{ActivityLog, BlockList, BlockedClient, SuspiciousActivity, ceil_secs};
use super::limiter::{WindowLimiter, WindowOutcome};
use crate::config::{EndpointPolicy, SecurityConfig};

/// Client id attributed to events with no known origin
pub const UNKNOWN_CLIENT: &str = "unknown";

/// Shortest API key accepted by [`SecurityGuard::validate_api_key`]
pub const MIN_API_KEY_LEN: usize = 20;

/// Outcome of [`SecurityGuard::check_rate_limit`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RateLimitDecision {
    /// Request admitted
    Allowed,
    /// Endpoint quota exhausted for this window
    Limited {
        /// Policy rejection message
        message: String,
        /// When the window ends
        reset_at: Instant,
    },
    /// Client temporarily blocked on every endpoint
    Blocked {
        /// Block message
        message: String,
    },
}

impl RateLimitDecision {
    /// Whether the request may proceed
    #[must_use]
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed)
    }

    /// Rejection message, if rejected
    #[must_use]
    pub fn message(&self) -> Option<&str> {
        match self {
            Self::Allowed => None,
            Self::Limited { message, .. } | Self::Blocked { message } => Some(message),
        }
    }

    /// End of the exhausted window, for rate-limit rejections
    #[must_use]
    pub fn reset_at(&self) -> Option<Instant> {
        match self {
            Self::Limited { reset_at, .. } => Some(*reset_at),
            _ => None,
        }
    }

    /// Whole seconds until the window resets, at least 1
    #[must_use]
    pub fn retry_after(&self, now: Instant) -> Option<u64> {
        self.reset_at()
            .map(|reset_at| ceil_secs(reset_at.saturating_duration_since(now)).max(1))
    }
}

/// Outcome of [`SecurityGuard::validate_api_key`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiKeyCheck {
    /// Whether the key passed the shape check
    pub valid: bool,
    /// Reason for rejection
    pub message: Option<String>,
}

/// Snapshot of guard state sizes
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SecurityStats {
    /// Clients currently blocked
    pub active_blocks: usize,
    /// Suspicious events retained in the log
    pub suspicious_activities_count: usize,
    /// Open (client, endpoint) counters
    pub rate_limit_store_size: usize,
}

/// Per-client rate limiter with suspicious-activity escalation
#[derive(Debug)]
pub struct SecurityGuard {
    limiter: WindowLimiter,
    activity: ActivityLog,
    blocks: BlockList,
    threshold: usize,
    block_message: String,
}

impl SecurityGuard {
    /// Create a guard from configuration
    #[must_use]
    pub fn new(config: &SecurityConfig) -> Self {
        Self {
            limiter: WindowLimiter::new(config.rate_limits.clone()),
            activity: ActivityLog::new(config.block_duration),
            blocks: BlockList::new(config.block_duration),
            threshold: config.suspicious_threshold,
            block_message: config.block_message.clone(),
        }
    }

    /// Policy configured for `endpoint`
    #[must_use]
    pub fn policy(&self, endpoint: &str) -> Option<&EndpointPolicy> {
        self.limiter.policy(endpoint)
    }

    /// Every configured endpoint identifier
    pub fn endpoints(&self) -> impl Iterator<Item = &str> {
        self.limiter.policies().keys().map(String::as_str)
    }

    /// Map a request path to the most specific protected endpoint
    #[must_use]
    pub fn endpoint_for_path(&self, path: &str) -> Option<&str> {
        self.limiter.endpoint_for_path(path)
    }

    /// Decide whether `client` may call `endpoint` now
    pub fn check_rate_limit(&self, client: &str, endpoint: &str) -> RateLimitDecision {
        self.check_rate_limit_at(client, endpoint, Instant::now())
    }

    /// [`check_rate_limit`](Self::check_rate_limit) evaluated at `now`
    pub fn check_rate_limit_at(
        &self,
        client: &str,
        endpoint: &str,
        now: Instant,
    ) -> RateLimitDecision {
        let Some(policy) = self.limiter.policy(endpoint) else {
            return RateLimitDecision::Allowed;
        };

        if self.blocks.is_blocked_at(client, now) {
            return RateLimitDecision::Blocked {
                message: self.block_message.clone(),
            };
        }

        match self.limiter.admit_at(client, endpoint, policy, now) {
            WindowOutcome::Admitted => RateLimitDecision::Allowed,
            WindowOutcome::Exhausted { reset_at } => {
                debug!(client, endpoint, "Rate limit exceeded");
                self.log_suspicious_activity_at(
                    client,
                    format!("rate limit exceeded for {endpoint}"),
                    now,
                );
                RateLimitDecision::Limited {
                    message: policy.message.clone(),
                    reset_at,
                }
            }
        }
    }

    /// Record a suspicious event, blocking `client` once its recent events
    /// reach the threshold.
    pub fn log_suspicious_activity(&self, client: &str, reason: impl Into<String>) {
        self.log_suspicious_activity_at(client, reason, Instant::now());
    }

    /// [`log_suspicious_activity`](Self::log_suspicious_activity) at `now`
    pub fn log_suspicious_activity_at(
        &self,
        client: &str,
        reason: impl Into<String>,
        now: Instant,
    ) {
        let recent = self.activity.record_at(client, reason.into(), now);
        if recent >= self.threshold {
            self.blocks.block_at(client, now);
        }
    }

    /// Block `client` on every endpoint for the block duration
    pub fn block(&self, client: &str) {
        self.block_at(client, Instant::now());
    }

    /// [`block`](Self::block) at `now`
    pub fn block_at(&self, client: &str, now: Instant) {
        self.blocks.block_at(client, now);
    }

    /// Lift a block before its deadline. Returns `true` if one was active.
    pub fn unblock(&self, client: &str) -> bool {
        self.blocks.unblock(client)
    }

    /// Whether `client` is blocked now
    #[must_use]
    pub fn is_blocked(&self, client: &str) -> bool {
        self.blocks.is_blocked_at(client, Instant::now())
    }

    /// Snapshot of blocked clients
    #[must_use]
    pub fn blocked_clients(&self) -> Vec<BlockedClient> {
        self.blocks.snapshot_at(Instant::now())
    }

    /// Retained suspicious events for `client`, oldest first
    #[must_use]
    pub fn activity_for(&self, client: &str) -> Vec<SuspiciousActivity> {
        self.activity.for_client(client)
    }

    /// Check the shape of an API key presented for `service`.
    ///
    /// Missing or short keys are rejected and logged as suspicious
    /// activity under [`UNKNOWN_CLIENT`].
    pub fn validate_api_key(&self, api_key: Option<&str>, service: &str) -> ApiKeyCheck {
        match api_key.filter(|key| !key.is_empty()) {
            None => {
                self.log_suspicious_activity(
                    UNKNOWN_CLIENT,
                    format!("attempted to access {service} without API key"),
                );
                ApiKeyCheck {
                    valid: false,
                    message: Some("API key is required".to_string()),
                }
            }
            Some(key) if key.chars().count() < MIN_API_KEY_LEN => {
                self.log_suspicious_activity(
                    UNKNOWN_CLIENT,
                    format!("invalid API key format for {service}"),
                );
                ApiKeyCheck {
                    valid: false,
                    message: Some("Invalid API key format".to_string()),
                }
            }
            Some(_) => ApiKeyCheck {
                valid: true,
                message: None,
            },
        }
    }

    /// Current state sizes
    #[must_use]
    pub fn stats(&self) -> SecurityStats {
        self.stats_at(Instant::now())
    }

    /// [`stats`](Self::stats) at `now`
    #[must_use]
    pub fn stats_at(&self, now: Instant) -> SecurityStats {
        SecurityStats {
            active_blocks: self.blocks.active_at(now),
            suspicious_activities_count: self.activity.len(),
            rate_limit_store_size: self.limiter.len(),
        }
    }

    /// Drop elapsed counters, lifted blocks and stale log events
    pub fn sweep(&self) {
        self.sweep_at(Instant::now());
    }

    /// [`sweep`](Self::sweep) at `now`
    pub fn sweep_at(&self, now: Instant) {
        let counters = self.limiter.sweep_at(now);
        let blocks = self.blocks.sweep_at(now);
        let events = self.activity.prune_at(now);
        if counters + blocks + events > 0 {
            debug!(counters, blocks, events, "Swept security state");
        }
    }

    /// Spawn a background task that sweeps every `period`.
    ///
    /// The task stops once every other owner of `guard` has dropped it.
    pub fn spawn_sweeper(guard: Arc<Self>, period: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                if Arc::strong_count(&guard) <= 1 {
                    break;
                }
                guard.sweep();
            }
        })
    }
}

impl Default for SecurityGuard {
    fn default() -> Self {
        Self::new(&SecurityConfig::default())
    }
}
