//! Capability contracts consumed by the RA core.
//!
//! The RA mediates between the public protocol layer and these collaborators:
//! persistence ([`Store`]), domain validation ([`Validator`]), certificate
//! signing ([`Signer`]), issuance policy ([`PolicyOracle`]), CT submission
//! ([`Publisher`]), and DNS lookups for contact validation ([`DnsResolver`]).
//! Production implementations live elsewhere; the RA only depends on these
//! traits.

use std::{collections::HashMap, net::IpAddr};

use async_trait::async_trait;
use time::{Duration, OffsetDateTime};

use crate::{
    error::Error,
    key::AccountKey,
    objects::{
        Authorization, Certificate, Challenge, Identifier, IdentifierType, Order, Problem,
        Registration, RevocationReason, ValidationRecord,
    },
};

/// Injectable time source.
pub trait Clock: Send + Sync {
    fn now(&self) -> OffsetDateTime;
}

/// The wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> OffsetDateTime {
        OffsetDateTime::now_utc()
    }
}

/// A DNS lookup failure during contact validation.
///
/// Timeouts are distinguished because email validation is best-effort: a
/// resolver that cannot answer in time does not block registration.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{detail}")]
pub struct DnsError {
    detail: String,
    timed_out: bool,
}

impl DnsError {
    pub fn new(detail: impl Into<String>) -> Self {
        DnsError {
            detail: detail.into(),
            timed_out: false,
        }
    }

    pub fn timeout(detail: impl Into<String>) -> Self {
        DnsError {
            detail: detail.into(),
            timed_out: true,
        }
    }

    pub fn is_timeout(&self) -> bool {
        self.timed_out
    }
}

/// Resolver used to check that contact email domains exist.
#[async_trait]
pub trait DnsResolver: Send + Sync {
    async fn lookup_mx(&self, domain: &str) -> Result<Vec<String>, DnsError>;
    async fn lookup_host(&self, domain: &str) -> Result<Vec<IpAddr>, DnsError>;
}

/// What a validation attempt produced: evidence records plus an optional
/// problem. Transport-level failures are the `Err` branch instead.
#[derive(Debug, Clone)]
pub struct ValidationOutcome {
    pub records: Vec<ValidationRecord>,
    pub problem: Option<Problem>,
}

/// The domain-validation subsystem.
#[async_trait]
pub trait Validator: Send + Sync {
    /// Executes one challenge against the real network.
    async fn perform_validation(
        &self,
        identifier: &str,
        challenge: &Challenge,
        authz: &Authorization,
    ) -> Result<ValidationOutcome, Error>;

    /// Third-party reputation signal for a domain.
    async fn is_safe_domain(&self, domain: &str) -> Result<bool, Error>;

    /// Rechecks CAA for a domain; `Some` is the per-name failure.
    async fn is_caa_valid(&self, domain: &str) -> Result<Option<Problem>, Error>;
}

/// The certificate-signing subsystem.
#[async_trait]
pub trait Signer: Send + Sync {
    async fn issue_certificate(
        &self,
        csr_der: &[u8],
        registration_id: i64,
    ) -> Result<Certificate, Error>;
}

/// Issuance policy: which identifiers we issue for and which challenges an
/// identifier gets offered.
pub trait PolicyOracle: Send + Sync {
    /// `Err` is a rich rejection reason and is surfaced verbatim.
    fn willing_to_issue(&self, identifier: &Identifier) -> Result<(), Error>;

    /// The challenge set and acceptable combinations for an identifier.
    fn challenges_for(&self, identifier: &Identifier) -> (Vec<Challenge>, Vec<Vec<usize>>);
}

/// Certificate Transparency log submission. Best-effort; failures are logged
/// by the caller and never block issuance.
#[async_trait]
pub trait Publisher: Send + Sync {
    async fn submit_to_ct(&self, cert_der: &[u8]) -> Result<(), Error>;
}

/// The persistence layer.
///
/// The Store is responsible for atomicity: unique-constraint enforcement
/// (duplicate account keys) and consistent counting happen here, not in the
/// RA process.
#[async_trait]
pub trait Store: Send + Sync {
    /// Persists a new registration and assigns its ID. A key already bound
    /// to another account is a `Conflict` whose detail references the
    /// existing registration.
    async fn new_registration(&self, reg: Registration) -> Result<Registration, Error>;
    async fn update_registration(&self, reg: &Registration) -> Result<(), Error>;
    async fn get_registration(&self, id: i64) -> Result<Registration, Error>;
    async fn get_registration_by_key(&self, key: &AccountKey) -> Result<Registration, Error>;
    async fn deactivate_registration(&self, id: i64) -> Result<(), Error>;

    /// Persists a new pending authorization and assigns its ID.
    async fn new_pending_authorization(&self, authz: Authorization)
        -> Result<Authorization, Error>;
    async fn update_pending_authorization(&self, authz: &Authorization) -> Result<(), Error>;
    /// Records an authorization's terminal (valid/invalid) state.
    async fn finalize_authorization(&self, authz: &Authorization) -> Result<(), Error>;
    async fn get_authorization(&self, id: &str) -> Result<Authorization, Error>;
    /// Valid, unexpired authorizations for the given names, keyed by name.
    async fn get_valid_authorizations(
        &self,
        registration_id: i64,
        names: &[String],
        now: OffsetDateTime,
    ) -> Result<HashMap<String, Authorization>, Error>;
    /// A pending authorization for the identifier that remains usable until
    /// at least `valid_until`, if one exists.
    async fn get_pending_authorization(
        &self,
        registration_id: i64,
        identifier_type: IdentifierType,
        value: &str,
        valid_until: OffsetDateTime,
    ) -> Result<Option<Authorization>, Error>;
    async fn deactivate_authorization(&self, id: &str) -> Result<(), Error>;

    async fn count_registrations_by_ip(
        &self,
        ip: IpAddr,
        earliest: OffsetDateTime,
        latest: OffsetDateTime,
    ) -> Result<u64, Error>;
    /// Fuzzy count over the /48 surrounding an IPv6 address.
    async fn count_registrations_by_ip_range(
        &self,
        ip: IpAddr,
        earliest: OffsetDateTime,
        latest: OffsetDateTime,
    ) -> Result<u64, Error>;
    async fn count_pending_authorizations(&self, registration_id: i64) -> Result<u64, Error>;
    async fn count_invalid_authorizations(
        &self,
        registration_id: i64,
        hostname: &str,
        earliest: OffsetDateTime,
        latest: OffsetDateTime,
    ) -> Result<u64, Error>;

    /// Issued-certificate counts per name, matching subdomains too.
    async fn count_certificates_by_names(
        &self,
        names: &[String],
        earliest: OffsetDateTime,
        latest: OffsetDateTime,
    ) -> Result<HashMap<String, u64>, Error>;
    /// Issued-certificate counts per name, exact matches only.
    async fn count_certificates_by_exact_names(
        &self,
        names: &[String],
        earliest: OffsetDateTime,
        latest: OffsetDateTime,
    ) -> Result<HashMap<String, u64>, Error>;
    async fn count_fqdn_sets(&self, window: Duration, names: &[String]) -> Result<u64, Error>;
    async fn fqdn_set_exists(&self, names: &[String]) -> Result<bool, Error>;
    async fn count_certificates_range(
        &self,
        earliest: OffsetDateTime,
        latest: OffsetDateTime,
    ) -> Result<u64, Error>;

    async fn mark_certificate_revoked(
        &self,
        serial: &str,
        reason: RevocationReason,
    ) -> Result<(), Error>;

    /// Persists a new order aggregate and assigns its ID.
    async fn new_order(&self, order: Order) -> Result<Order, Error>;
}
