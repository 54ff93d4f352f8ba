//! Rate-limit policy evaluation.
//!
//! Policies are pure: given a count (supplied by the Store) and a key, a
//! policy decides allow or deny. The counting itself stays in the Store so
//! that concurrent RA instances agree.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime};

/// One named limit: a window, a threshold, and optional overrides.
///
/// A policy with a zero threshold or zero window is disabled.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RateLimitPolicy {
    pub window: Duration,

    /// Requests allowed per window; the threshold-th request in-window is
    /// denied.
    pub threshold: u64,

    /// Per-key threshold overrides (e.g. a domain or an IP address).
    pub overrides: HashMap<String, u64>,

    /// Per-registration threshold overrides.
    pub registration_overrides: HashMap<i64, u64>,
}

impl RateLimitPolicy {
    pub fn new(window: Duration, threshold: u64) -> Self {
        RateLimitPolicy {
            window,
            threshold,
            ..RateLimitPolicy::default()
        }
    }

    pub fn enabled(&self) -> bool {
        self.threshold > 0 && self.window.is_positive()
    }

    /// Start of the counting window ending at `now`.
    pub fn window_begin(&self, now: OffsetDateTime) -> OffsetDateTime {
        now - self.window
    }

    /// The effective threshold for a key/registration pair. A key override
    /// wins over a registration override, which wins over the default.
    pub fn threshold_for(&self, key: &str, registration_id: Option<i64>) -> u64 {
        if let Some(threshold) = self.overrides.get(key) {
            return *threshold;
        }
        if let Some(threshold) = registration_id.and_then(|id| self.registration_overrides.get(&id))
        {
            return *threshold;
        }
        self.threshold
    }

    /// Whether a request is allowed given the current in-window count.
    pub fn allows(&self, key: &str, registration_id: Option<i64>, count: u64) -> bool {
        count < self.threshold_for(key, registration_id)
    }
}

/// The full table of named limits the RA enforces.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Limits {
    /// Registrations per exact source IP.
    pub registrations_per_ip: RateLimitPolicy,

    /// Registrations per IPv6 /48. IPv4 is exempt; it has no comparably
    /// enumerable range at attacker scale.
    pub registrations_per_ip_range: RateLimitPolicy,

    pub pending_authorizations_per_account: RateLimitPolicy,

    /// Failed validations per account and hostname, over a lookback of
    /// pending-authorization lifetime plus this policy's window.
    pub invalid_authorizations_per_account: RateLimitPolicy,

    /// Certificates per eTLD+1 (with the exact-public-suffix carve-out).
    pub certificates_per_name: RateLimitPolicy,

    /// Certificates per exact sorted name-set; lets a subscriber renew the
    /// identical bundle without tripping the per-name limit.
    pub certificates_per_fqdn_set: RateLimitPolicy,

    /// Global issuance ceiling, checked against the periodically refreshed
    /// issued-count cache.
    pub total_certificates: RateLimitPolicy,
}
