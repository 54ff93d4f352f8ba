//! Audit logging.
//!
//! Lifecycle events (registration created, authorization finalized,
//! certificate issued, ...) are serialized to JSON and emitted on the
//! dedicated `audit` log target so deployments can route them separately
//! from diagnostic output.

use serde::Serialize;

pub const AUDIT_TARGET: &str = "audit";

/// Emits one audit event. Serialization failure degrades to an error-level
/// diagnostic rather than dropping the event name.
pub fn audit_object(event: &str, payload: &impl Serialize) {
    match serde_json::to_string(payload) {
        Ok(json) => log::info!(target: AUDIT_TARGET, "{event} JSON={json}"),
        Err(err) => {
            log::error!(target: AUDIT_TARGET, "{event} (unserializable payload: {err})");
        }
    }
}

/// Emits one audit-level error event.
pub fn audit_err(event: &str, err: &crate::error::Error) {
    log::error!(target: AUDIT_TARGET, "{event}: {err}");
}
