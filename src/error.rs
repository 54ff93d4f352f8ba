//! Typed errors shared across the RA.
//!
//! Every error that can reach the API boundary carries a coarse [`ErrorKind`]
//! so the protocol layer can map it to a public problem type. Detail text for
//! [`ErrorKind::InternalServer`] is meant for audit logs, not for clients.

use std::fmt;

use crate::objects::Problem;

/// Coarse category for RA errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Client sent structurally or semantically invalid input.
    Malformed,
    /// Authenticated but not entitled (key mismatch, unsafe domain, expired
    /// authorization).
    Unauthorized,
    NotFound,
    /// Transient; the client should back off and retry after the limit window.
    RateLimited,
    /// CAA rechecks failed; aggregates per-name sub-problems.
    Caa,
    /// Duplicate key or account.
    Conflict,
    /// The server's own invariant was violated. Never attributed to client
    /// input.
    InternalServer,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::Malformed => "malformed",
            ErrorKind::Unauthorized => "unauthorized",
            ErrorKind::NotFound => "notFound",
            ErrorKind::RateLimited => "rateLimited",
            ErrorKind::Caa => "caa",
            ErrorKind::Conflict => "conflict",
            ErrorKind::InternalServer => "serverInternal",
        };
        f.write_str(name)
    }
}

/// An RA error: a kind discriminant plus human-readable detail.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{kind} :: {detail}")]
pub struct Error {
    kind: ErrorKind,
    detail: String,
    /// Per-name sub-problems, populated for [`ErrorKind::Caa`].
    subproblems: Vec<Problem>,
}

impl Error {
    pub fn new(kind: ErrorKind, detail: impl Into<String>) -> Self {
        Error {
            kind,
            detail: detail.into(),
            subproblems: Vec::new(),
        }
    }

    pub fn malformed(detail: impl Into<String>) -> Self {
        Self::new(ErrorKind::Malformed, detail)
    }

    pub fn unauthorized(detail: impl Into<String>) -> Self {
        Self::new(ErrorKind::Unauthorized, detail)
    }

    pub fn not_found(detail: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, detail)
    }

    pub fn rate_limited(detail: impl Into<String>) -> Self {
        Self::new(ErrorKind::RateLimited, detail)
    }

    pub fn conflict(detail: impl Into<String>) -> Self {
        Self::new(ErrorKind::Conflict, detail)
    }

    pub fn server_internal(detail: impl Into<String>) -> Self {
        Self::new(ErrorKind::InternalServer, detail)
    }

    /// A CAA failure aggregating the sub-problems of each rechecked name.
    pub fn caa(detail: impl Into<String>, subproblems: Vec<Problem>) -> Self {
        Error {
            kind: ErrorKind::Caa,
            detail: detail.into(),
            subproblems,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn detail(&self) -> &str {
        &self.detail
    }

    pub fn subproblems(&self) -> &[Problem] {
        &self.subproblems
    }

    /// Returns true if this error is of the given kind.
    pub fn is(&self, kind: ErrorKind) -> bool {
        self.kind == kind
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
