//! Fixed-window request counters per (client, endpoint)

use std::collections::BTreeMap;
use std::time::Instant;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

use crate::config::EndpointPolicy;

/// Requests seen by one client on one endpoint in the current window
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct WindowCounter {
    count: u32,
    reset_at: Instant,
}

impl WindowCounter {
    fn start(policy: &EndpointPolicy, now: Instant) -> Self {
        Self {
            count: 1,
            reset_at: now + policy.window,
        }
    }

    /// A window ending exactly at `now` is still current; the next
    /// instant starts a fresh one.
    fn is_elapsed(&self, now: Instant) -> bool {
        self.reset_at < now
    }
}

/// Result of counting a request against its window
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WindowOutcome {
    /// Counted within quota
    Admitted,
    /// Quota exhausted until `reset_at`
    Exhausted {
        /// End of the current window
        reset_at: Instant,
    },
}

/// Per-endpoint policies and the counters they govern
#[derive(Debug)]
pub(crate) struct WindowLimiter {
    policies: BTreeMap<String, EndpointPolicy>,
    counters: DashMap<(String, String), WindowCounter>,
}

impl WindowLimiter {
    pub(crate) fn new(policies: BTreeMap<String, EndpointPolicy>) -> Self {
        Self {
            policies,
            counters: DashMap::new(),
        }
    }

    pub(crate) fn policy(&self, endpoint: &str) -> Option<&EndpointPolicy> {
        self.policies.get(endpoint)
    }

    pub(crate) fn policies(&self) -> &BTreeMap<String, EndpointPolicy> {
        &self.policies
    }

    /// Count one request from `client` against `endpoint`'s window.
    pub(crate) fn admit_at(
        &self,
        client: &str,
        endpoint: &str,
        policy: &EndpointPolicy,
        now: Instant,
    ) -> WindowOutcome {
        match self
            .counters
            .entry((client.to_string(), endpoint.to_string()))
        {
            Entry::Vacant(slot) => {
                slot.insert(WindowCounter::start(policy, now));
                WindowOutcome::Admitted
            }
            Entry::Occupied(mut slot) => {
                let counter = slot.get_mut();
                if counter.is_elapsed(now) {
                    *counter = WindowCounter::start(policy, now);
                    WindowOutcome::Admitted
                } else if counter.count >= policy.max_requests {
                    WindowOutcome::Exhausted {
                        reset_at: counter.reset_at,
                    }
                } else {
                    counter.count += 1;
                    WindowOutcome::Admitted
                }
            }
        }
    }

    /// Requests counted in the current window, `0` when none is open
    pub(crate) fn count_at(&self, client: &str, endpoint: &str, now: Instant) -> u32 {
        self.counters
            .get(&(client.to_string(), endpoint.to_string()))
            .filter(|counter| !counter.is_elapsed(now))
            .map_or(0, |counter| counter.count)
    }

    /// Drop counters whose window has elapsed
    pub(crate) fn sweep_at(&self, now: Instant) -> usize {
        let before = self.counters.len();
        self.counters.retain(|_, counter| !counter.is_elapsed(now));
        before.saturating_sub(self.counters.len())
    }

    pub(crate) fn len(&self) -> usize {
        self.counters.len()
    }

    /// Longest configured endpoint that equals `path` or is a
    /// `/`-delimited prefix of it.
    pub(crate) fn endpoint_for_path(&self, path: &str) -> Option<&str> {
        self.policies
            .keys()
            .filter(|endpoint| {
                path.strip_prefix(endpoint.as_str())
                    .is_some_and(|rest| rest.is_empty() || rest.starts_with('/'))
            })
            .max_by_key(|endpoint| endpoint.len())
            .map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn limiter(max: u32) -> (WindowLimiter, EndpointPolicy) {
        let policy = EndpointPolicy::new(Duration::from_secs(60), max, "slow down");
        let limiter = WindowLimiter::new(BTreeMap::from([(
            "/api/trade".to_string(),
            policy.clone(),
        )]));
        (limiter, policy)
    }

    #[test]
    fn admits_up_to_max_then_exhausts() {
        let (limiter, policy) = limiter(3);
        let t0 = Instant::now();

        for _ in 0..3 {
            assert_eq!(
                limiter.admit_at("c", "/api/trade", &policy, t0),
                WindowOutcome::Admitted
            );
        }
        assert_eq!(
            limiter.admit_at("c", "/api/trade", &policy, t0),
            WindowOutcome::Exhausted {
                reset_at: t0 + Duration::from_secs(60)
            }
        );
        assert_eq!(limiter.count_at("c", "/api/trade", t0), 3);
    }

    #[test]
    fn request_at_reset_instant_is_still_in_window() {
        let (limiter, policy) = limiter(1);
        let t0 = Instant::now();
        let reset = t0 + Duration::from_secs(60);

        limiter.admit_at("c", "/api/trade", &policy, t0);
        assert!(matches!(
            limiter.admit_at("c", "/api/trade", &policy, reset),
            WindowOutcome::Exhausted { .. }
        ));
        assert_eq!(
            limiter.admit_at("c", "/api/trade", &policy, reset + Duration::from_millis(1)),
            WindowOutcome::Admitted
        );
        assert_eq!(
            limiter.count_at("c", "/api/trade", reset + Duration::from_millis(1)),
            1
        );
    }

    #[test]
    fn clients_are_counted_separately() {
        let (limiter, policy) = limiter(1);
        let t0 = Instant::now();

        limiter.admit_at("a", "/api/trade", &policy, t0);
        assert_eq!(
            limiter.admit_at("b", "/api/trade", &policy, t0),
            WindowOutcome::Admitted
        );
        assert_eq!(limiter.len(), 2);
    }

    #[test]
    fn sweep_drops_elapsed_windows_only() {
        let (limiter, policy) = limiter(5);
        let t0 = Instant::now();
        limiter.admit_at("old", "/api/trade", &policy, t0);
        limiter.admit_at("new", "/api/trade", &policy, t0 + Duration::from_secs(30));

        assert_eq!(limiter.sweep_at(t0 + Duration::from_secs(61)), 1);
        assert_eq!(limiter.len(), 1);
        assert_eq!(limiter.count_at("new", "/api/trade", t0 + Duration::from_secs(61)), 1);
    }

    #[test]
    fn endpoint_for_path_matches_segments() {
        let limiter = WindowLimiter::new(BTreeMap::from([
            (
                "/api".to_string(),
                EndpointPolicy::new(Duration::from_secs(60), 1, "a"),
            ),
            (
                "/api/trade".to_string(),
                EndpointPolicy::new(Duration::from_secs(60), 1, "b"),
            ),
        ]));

        assert_eq!(limiter.endpoint_for_path("/api/trade"), Some("/api/trade"));
        assert_eq!(limiter.endpoint_for_path("/api/trade/buy"), Some("/api/trade"));
        assert_eq!(limiter.endpoint_for_path("/api/trades"), Some("/api"));
        assert_eq!(limiter.endpoint_for_path("/health"), None);
    }
}
