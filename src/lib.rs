//! ACME registration authority core.
//!
//! This crate is the policy-enforcing middle of an ACME certificate
//! authority: it mediates between the protocol front end, the
//! domain-validation subsystem, and the signing subsystem, and it owns the
//! business rules that must hold before anything is signed. Account
//! lifecycle, authorization and challenge state, layered rate limits, CAA
//! recheck timing, and the post-signing integrity check all live here.
//!
//! The network-facing pieces are deliberately absent. Persistence, challenge
//! probing, signing, issuance policy, and CT submission are consumed through
//! the traits in [`interfaces`]; the crate is a library embedded by an API
//! layer, not a server.
//!
//! Relevant RFCs: [RFC 8555] (ACME), [RFC 7638] (JWK thumbprints),
//! [RFC 8659] (CAA).
//!
//! [RFC 8555]: https://datatracker.ietf.org/doc/html/rfc8555
//! [RFC 7638]: https://datatracker.ietf.org/doc/html/rfc7638
//! [RFC 8659]: https://datatracker.ietf.org/doc/html/rfc8659

#![deny(rust_2018_idioms, nonstandard_style, future_incompatible)]

mod audit;
mod authorization;
mod config;
mod csr;
mod domain;
mod error;
pub mod interfaces;
mod issuance;
mod issued_count;
mod key;
mod limits;
mod objects;
mod ra;
mod registration;


pub use self::{
    audit::AUDIT_TARGET,
    authorization::ChallengeResponse,
    config::RaConfig,
    csr::{csr_public_key, csr_subject, matches_csr, verify_csr, SubjectNames},
    domain::{partition_by_registered_domain, NamePartition},
    error::{Error, ErrorKind, Result},
    issued_count::TotalIssuedCache,
    key::{create_p256_key, AccountKey, KeyPolicy},
    limits::{Limits, RateLimitPolicy},
    objects::{
        new_token, unique_lower_names, Authorization, Certificate, Challenge, ChallengeType,
        Identifier, IdentifierType, Order, Problem, ProblemType, Registration, RegistrationUpdate,
        RevocationReason, Status, ValidationRecord,
    },
    ra::{Collaborators, RegistrationAuthority},
    registration::RegistrationInit,
};
