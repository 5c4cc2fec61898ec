//! Admission control and input checks.
//!
//! Provides the per-endpoint rate limiter with abuse escalation
//! ([`SecurityGuard`]) and stateless input validators.

mod abuse;
mod guard;
mod limiter;
pub mod validate;

pub use abuse::{BlockedClient, SuspiciousActivity};
pub use guard::{
    ApiKeyCheck, MIN_API_KEY_LEN, RateLimitDecision, SecurityGuard, SecurityStats, UNKNOWN_CLIENT,
};
pub use validate::{PasswordCheck, sanitize_input, validate_email, validate_password};
