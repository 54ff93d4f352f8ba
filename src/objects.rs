//! Core RA objects: registrations, authorizations, challenges, orders.
//!
//! These structs are used both internally and by the protocol layer that
//! embeds this crate; wire-shaped fields follow the ACME JSON conventions.

use std::{collections::BTreeSet, fmt, net::IpAddr};

use base64::prelude::*;
use rand::RngCore as _;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::{error::Error, key::AccountKey};

/// State of a registration, authorization, or challenge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Pending,
    Processing,
    Valid,
    Invalid,
    Revoked,
    Deactivated,
}

/// Identification mechanisms for issuance subjects.
///
/// Only DNS names are supported; wildcard and bare domains are both
/// representable as values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IdentifierType {
    Dns,
}

impl fmt::Display for IdentifierType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IdentifierType::Dns => f.write_str("dns"),
        }
    }
}

/// An identifier that can be validated: type plus value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identifier {
    #[serde(rename = "type")]
    pub kind: IdentifierType,
    pub value: String,
}

impl Identifier {
    pub fn dns(value: impl Into<String>) -> Self {
        Identifier {
            kind: IdentifierType::Dns,
            value: value.into(),
        }
    }
}

/// Problem types usable in challenge error details and CAA sub-problems.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProblemType {
    #[serde(rename = "urn:ietf:params:acme:error:connection")]
    Connection,
    #[serde(rename = "urn:ietf:params:acme:error:malformed")]
    Malformed,
    #[serde(rename = "urn:ietf:params:acme:error:serverInternal")]
    ServerInternal,
    #[serde(rename = "urn:ietf:params:acme:error:unauthorized")]
    Unauthorized,
    #[serde(rename = "urn:ietf:params:acme:error:caa")]
    Caa,
    #[serde(rename = "urn:ietf:params:acme:error:dns")]
    Dns,
}

/// A problem document attached to a failed challenge or CAA recheck.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Problem {
    #[serde(rename = "type")]
    pub kind: ProblemType,
    pub detail: String,
}

impl Problem {
    pub fn new(kind: ProblemType, detail: impl Into<String>) -> Self {
        Problem {
            kind,
            detail: detail.into(),
        }
    }

    pub fn server_internal(detail: impl Into<String>) -> Self {
        Self::new(ProblemType::ServerInternal, detail)
    }
}

impl fmt::Display for Problem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} :: {}", self.kind, self.detail)
    }
}

/// Evidence of one validation attempt: what was probed, what resolved, and
/// which address was used. Append-only once validation starts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationRecord {
    /// http-01 only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,

    pub hostname: String,
    pub port: String,
    pub addresses_resolved: Vec<IpAddr>,
    pub address_used: Option<IpAddr>,
}

/// The available challenge types. Legacy types predating RFC 8555 are out of
/// scope for new code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChallengeType {
    #[serde(rename = "http-01")]
    Http01,
    #[serde(rename = "dns-01")]
    Dns01,
    #[serde(rename = "tls-alpn-01")]
    TlsAlpn01,
}

impl fmt::Display for ChallengeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ChallengeType::Http01 => "http-01",
            ChallengeType::Dns01 => "dns-01",
            ChallengeType::TlsAlpn01 => "tls-alpn-01",
        };
        f.write_str(name)
    }
}

/// One candidate proof mechanism within an [`Authorization`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Challenge {
    /// Index-stable numeric ID.
    pub id: i64,

    #[serde(rename = "type")]
    pub kind: ChallengeType,

    pub status: Status,

    /// Server-chosen token from which the key authorization is built.
    pub token: String,

    /// Client-supplied key authorization; only non-empty after the client
    /// responds to the challenge.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provided_key_authorization: Option<String>,

    /// What was actually probed. Evidentiary.
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub validation_record: Vec<ValidationRecord>,

    /// Error detail when the challenge is invalid.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<Problem>,
}

impl Challenge {
    pub fn new(id: i64, kind: ChallengeType) -> Self {
        Challenge {
            id,
            kind,
            status: Status::Pending,
            token: new_token(),
            provided_key_authorization: None,
            validation_record: Vec::new(),
            error: None,
        }
    }

    /// Structural check before a challenge is offered to a client.
    ///
    /// These are our own generated challenges, so any failure here is an RA
    /// bug, not a client error.
    pub fn check_consistency_for_client_offer(&self) -> Result<(), Error> {
        if self.status != Status::Pending {
            return Err(Error::server_internal(format!(
                "challenge {} offered in non-pending status",
                self.id,
            )));
        }
        if !looks_like_a_token(&self.token) {
            return Err(Error::server_internal(format!(
                "challenge {} has a malformed token",
                self.id,
            )));
        }
        // The key authorization is client-provided; it must be absent until
        // the client responds.
        if self.provided_key_authorization.is_some() {
            return Err(Error::server_internal(format!(
                "challenge {} has a key authorization before any response",
                self.id,
            )));
        }
        Ok(())
    }

    /// Structural check before a challenge response is sent for validation.
    pub fn check_consistency_for_validation(&self) -> Result<(), Error> {
        if self.status != Status::Pending {
            return Err(Error::malformed("challenge is not pending"));
        }
        if !looks_like_a_token(&self.token) {
            return Err(Error::malformed("challenge token is malformed"));
        }
        let key_authz = self
            .provided_key_authorization
            .as_deref()
            .ok_or_else(|| Error::malformed("no key authorization provided"))?;
        let Some((token, thumbprint)) = key_authz.split_once('.') else {
            return Err(Error::malformed("malformed key authorization"));
        };
        if !looks_like_a_token(token) || !looks_like_a_token(thumbprint) {
            // Thumbprints share token syntax: 32 base64url-encoded octets.
            return Err(Error::malformed("malformed key authorization"));
        }
        Ok(())
    }

    /// Sanity-checks validation evidence before it is persisted.
    pub fn records_sane(&self) -> bool {
        if self.validation_record.is_empty() {
            return false;
        }

        match self.kind {
            ChallengeType::Http01 => self.validation_record.iter().all(|rec| {
                rec.url.is_some()
                    && !rec.hostname.is_empty()
                    && !rec.port.is_empty()
                    && rec.address_used.is_some()
                    && !rec.addresses_resolved.is_empty()
            }),
            ChallengeType::TlsAlpn01 => {
                if self.validation_record.len() > 1 {
                    return false;
                }
                let rec = &self.validation_record[0];
                rec.url.is_none()
                    && !rec.hostname.is_empty()
                    && !rec.port.is_empty()
                    && rec.address_used.is_some()
                    && !rec.addresses_resolved.is_empty()
            }
            ChallengeType::Dns01 => true,
        }
    }

    /// The key authorization a holder of `key` would produce for this
    /// challenge's token.
    pub fn expected_key_authorization(&self, key: &AccountKey) -> Result<String, Error> {
        key.key_authorization(&self.token)
    }
}

/// Non-public metadata attached to an account key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Registration {
    /// Unique identifier, assigned by the Store.
    pub id: i64,

    /// Account key to which the details are attached. Immutable once bound
    /// except through the verified key-rollover operation.
    pub key: AccountKey,

    /// Contact URIs. `None` means no contact was ever provided; `Some(vec![])`
    /// is an explicit removal.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub contact: Option<Vec<String>>,

    /// Terms-of-service agreement URL, empty until accepted.
    #[serde(skip_serializing_if = "String::is_empty", default)]
    pub agreement: String,

    /// The IP address the registration was created from. Immutable.
    pub initial_ip: IpAddr,

    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,

    pub status: Status,
}

/// Fields of a registration a client may change after creation.
///
/// `None` fields are left untouched by the merge. The key may only be set
/// here after the rollover operation has verified possession of it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegistrationUpdate {
    pub contact: Option<Vec<String>>,
    pub agreement: Option<String>,
    pub key: Option<AccountKey>,
}

/// Proof that an account controls one identifier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Authorization {
    /// Unique across authorizations within this instance.
    pub id: String,

    pub identifier: Identifier,

    /// The owning registration.
    pub registration_id: i64,

    pub status: Status,

    /// When this authorization stops being considered. `None` only
    /// transiently before first persistence; an externally visible
    /// authorization without an expiry is a defect.
    #[serde(with = "time::serde::rfc3339::option")]
    pub expires: Option<OffsetDateTime>,

    /// Candidate proofs. For pending authorizations, what the client may
    /// fulfill; for finalized ones, the evidence used.
    pub challenges: Vec<Challenge>,

    /// Index-sets into `challenges`; satisfying every member of any one set
    /// makes the whole authorization valid.
    pub combinations: Vec<Vec<usize>>,
}

/// An issued certificate as recorded by the signing subsystem.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Certificate {
    pub registration_id: i64,
    pub serial: String,
    pub der: Vec<u8>,
    #[serde(with = "time::serde::rfc3339")]
    pub issued: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub expires: OffsetDateTime,
}

/// Groups one CSR with the authorizations needed to satisfy it.
///
/// The authorizations list is fixed at creation; the order's status and
/// expiry are independent of any one authorization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Order {
    pub id: i64,
    pub registration_id: i64,
    pub status: Status,
    #[serde(with = "time::serde::rfc3339")]
    pub expires: OffsetDateTime,
    pub csr_der: Vec<u8>,
    pub authorization_ids: Vec<String>,
}

/// Enumeration of reasons for revocation.
///
/// The reason codes are taken from [RFC 5280 §5.3.1].
///
/// [RFC 5280 §5.3.1]: https://tools.ietf.org/html/rfc5280#section-5.3.1
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RevocationReason {
    Unspecified = 0,
    KeyCompromise = 1,
    CACompromise = 2,
    AffiliationChanged = 3,
    Superseded = 4,
    CessationOfOperation = 5,
    CertificateHold = 6,
    // value 7 is not used
    RemoveFromCRL = 8,
    PrivilegeWithdrawn = 9,
    AACompromise = 10,
}

/// Length of a base64url-encoded 32-octet token, unpadded.
const TOKEN_LEN: usize = 43;

/// Random token for challenges and audit event IDs.
pub fn new_token() -> String {
    let mut buf = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut buf);
    BASE64_URL_SAFE_NO_PAD.encode(buf)
}

/// Whether `s` has the syntax of a server-generated token.
pub fn looks_like_a_token(s: &str) -> bool {
    s.len() == TOKEN_LEN
        && s.bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
}

/// Lowercases, deduplicates, and sorts a name list.
pub fn unique_lower_names(names: &[String]) -> Vec<String> {
    names
        .iter()
        .map(|name| name.to_lowercase())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}
