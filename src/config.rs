//! RA configuration.

use serde::{Deserialize, Serialize};
use time::Duration;

use crate::limits::Limits;

/// Tunable behavior of the registration authority.
///
/// Every field has a serde default so partial config files stay valid as new
/// knobs appear.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RaConfig {
    /// Maximum contact URLs on a registration.
    pub max_contacts: usize,

    /// Maximum DNS names in one CSR.
    pub max_names: usize,

    /// Lifetime of a finalized (valid) authorization.
    pub authorization_lifetime: Duration,

    /// Lifetime of a pending authorization.
    pub pending_authorization_lifetime: Duration,

    /// Lifetime of an order.
    pub order_lifetime: Duration,

    /// Reuse an existing valid authorization instead of minting a pending
    /// one, when the existing one has enough lifetime left.
    pub reuse_valid_authz: bool,

    /// Reuse a still-usable pending authorization for the same identifier
    /// instead of minting another one.
    pub reuse_pending_authz: bool,

    /// Recheck CAA at finalize time for authorizations validated long enough
    /// ago that their original CAA check has gone stale.
    pub recheck_caa: bool,

    /// Resolve contact email domains during registration.
    pub check_contact_email: bool,

    /// Consult the domain-reputation service before creating authorizations.
    pub check_safe_browsing: bool,

    /// Count certificates per name with exact-match semantics for names that
    /// are themselves public suffixes.
    pub exact_name_counts: bool,

    /// When the CSR carries no common name, promote the first SAN into it.
    pub force_cn_from_san: bool,

    pub limits: Limits,
}

impl Default for RaConfig {
    fn default() -> Self {
        RaConfig {
            max_contacts: 10,
            max_names: 100,
            authorization_lifetime: Duration::days(30),
            pending_authorization_lifetime: Duration::days(7),
            order_lifetime: Duration::days(7),
            reuse_valid_authz: true,
            reuse_pending_authz: false,
            recheck_caa: true,
            check_contact_email: false,
            check_safe_browsing: false,
            exact_name_counts: true,
            force_cn_from_san: false,
            limits: Limits::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_config_deserializes_to_defaults() {
        let config: RaConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.max_names, 100);
        assert!(config.reuse_valid_authz);
        assert!(!config.limits.certificates_per_name.enabled());
    }

    #[test]
    fn partial_config_overrides_only_named_fields() {
        let config: RaConfig =
            serde_json::from_str(r#"{"maxNames": 5, "reuseValidAuthz": false}"#).unwrap();
        assert_eq!(config.max_names, 5);
        assert!(!config.reuse_valid_authz);
        assert_eq!(config.max_contacts, 10);
    }
}
