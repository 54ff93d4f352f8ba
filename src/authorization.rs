//! Authorization lifecycle: creation with reuse, challenge response
//! handling, asynchronous validation, and finalization.

use serde_json::json;
use sha2::{Digest as _, Sha256};
use time::Duration;

use crate::{
    audit::{audit_err, audit_object},
    error::Error,
    objects::{Authorization, ChallengeType, Identifier, Problem, Status},
    ra::RegistrationAuthority,
};

/// A valid authorization this close to expiry is not worth reusing; the
/// client gets a fresh one instead.
const AUTHZ_REUSE_CUTOFF: Duration = Duration::hours(24);

/// How much usable lifetime a pending authorization must retain to be
/// reused.
const PENDING_REUSE_CUTOFF: Duration = Duration::hours(1);

/// The client's POST body for a challenge: everything else on the challenge
/// is server-owned.
#[derive(Debug, Clone, Default)]
pub struct ChallengeResponse {
    pub kind: Option<ChallengeType>,
    pub key_authorization: Option<String>,
}

impl RegistrationAuthority {
    /// Creates (or reuses) an authorization for one identifier.
    ///
    /// Order matters: the policy oracle first (its error is the rejection
    /// reason, surfaced verbatim), then rate limits, then the domain
    /// reputation signal, then reuse, and only then a fresh pending record.
    pub async fn new_authorization(
        &self,
        identifier: Identifier,
        registration_id: i64,
    ) -> Result<Authorization, Error> {
        let identifier = Identifier {
            kind: identifier.kind,
            value: identifier.value.to_lowercase(),
        };

        self.policy.willing_to_issue(&identifier)?;
        self.check_authorization_limits(registration_id, &identifier.value)
            .await?;

        if self.config.check_safe_browsing {
            // Fail closed: not knowing whether a domain is safe is our
            // problem, not grounds to issue.
            let safe = self
                .validator
                .is_safe_domain(&identifier.value)
                .await
                .map_err(|err| {
                    Error::server_internal(format!("unable to determine if domain was safe: {err}"))
                })?;
            if !safe {
                return Err(Error::unauthorized(format!(
                    "{:?} was considered an unsafe domain by a third-party API",
                    identifier.value,
                )));
            }
        }

        let now = self.now();

        if self.config.reuse_valid_authz {
            let mut existing = self
                .store
                .get_valid_authorizations(registration_id, &[identifier.value.clone()], now)
                .await?;
            if let Some(authz) = existing.remove(&identifier.value) {
                // Only reuse when enough lifetime remains to finish an order.
                if authz.expires.is_some_and(|exp| exp - now > AUTHZ_REUSE_CUTOFF) {
                    log::debug!("reusing valid authorization {}", authz.id);
                    return Ok(authz);
                }
            }
        }

        if self.config.reuse_pending_authz {
            let pending = self
                .store
                .get_pending_authorization(
                    registration_id,
                    identifier.kind,
                    &identifier.value,
                    now + PENDING_REUSE_CUTOFF,
                )
                .await?;
            if let Some(authz) = pending {
                log::debug!("reusing pending authorization {}", authz.id);
                return Ok(authz);
            }
        }

        let (challenges, combinations) = self.policy.challenges_for(&identifier);
        let authz = Authorization {
            id: String::new(),
            identifier,
            registration_id,
            status: Status::Pending,
            expires: Some(now + self.config.pending_authorization_lifetime),
            challenges,
            combinations,
        };

        let authz = self.store.new_pending_authorization(authz).await?;

        // These are our own challenges; a malformed one is an RA bug and
        // must not reach the client.
        for challenge in &authz.challenges {
            challenge.check_consistency_for_client_offer()?;
        }

        audit_object("New authorization", &authz);
        Ok(authz)
    }

    /// Accepts a challenge response, persists the in-flight state, and
    /// dispatches validation in the background. The returned authorization
    /// is still pending; the client polls for the outcome.
    pub async fn update_authorization(
        &self,
        mut authz: Authorization,
        challenge_index: usize,
        response: ChallengeResponse,
    ) -> Result<Authorization, Error> {
        let now = self.now();
        if !authz.expires.is_some_and(|exp| exp > now) {
            return Err(Error::malformed("expired authorization"));
        }
        if challenge_index >= authz.challenges.len() {
            return Err(Error::malformed("invalid challenge index"));
        }

        if authz.status == Status::Valid && self.config.reuse_valid_authz {
            // Re-posting against an already-valid authorization is a client
            // retry; answer idempotently instead of re-validating.
            return Ok(authz);
        }
        if authz.status != Status::Pending {
            return Err(Error::malformed(format!(
                "authorization is not pending (status {:?})",
                authz.status,
            )));
        }

        let challenge = &mut authz.challenges[challenge_index];
        if let Some(kind) = response.kind {
            if kind != challenge.kind {
                // Tolerated: some clients echo the wrong type back.
                log::warn!(
                    "challenge type mismatch in response: offered {}, got {kind}",
                    challenge.kind,
                );
            }
        }

        let registration = self.store.get_registration(authz.registration_id).await?;
        let expected = challenge.expected_key_authorization(&registration.key)?;
        let provided = response
            .key_authorization
            .as_deref()
            .ok_or_else(|| Error::malformed("no key authorization provided"))?;
        if Sha256::digest(expected.as_bytes()) != Sha256::digest(provided.as_bytes()) {
            return Err(Error::malformed(
                "provided key authorization was incorrect",
            ));
        }
        challenge.provided_key_authorization = Some(provided.to_owned());

        challenge.check_consistency_for_validation()?;

        // Durable before dispatch, so a crash mid-validation leaves an
        // accurate in-flight record.
        self.store.update_pending_authorization(&authz).await?;

        // Fire and forget: the task owns its own lifetime, and the outcome
        // reaches the client only through the Store. An RA mid-shutdown
        // simply doesn't dispatch.
        if let Some(ra) = self.self_ref.upgrade() {
            let task_authz = authz.clone();
            tokio::spawn(async move {
                ra.validate_challenge(task_authz, challenge_index).await;
            });
        }

        Ok(authz)
    }

    /// Only pending and valid authorizations may be deactivated.
    pub async fn deactivate_authorization(&self, authz: &Authorization) -> Result<(), Error> {
        if !matches!(authz.status, Status::Pending | Status::Valid) {
            return Err(Error::malformed(
                "only pending and valid authorizations can be deactivated",
            ));
        }
        self.store.deactivate_authorization(&authz.id).await?;
        audit_object("Authorization deactivated", &json!({ "id": authz.id }));
        Ok(())
    }

    async fn validate_challenge(&self, mut authz: Authorization, challenge_index: usize) {
        let outcome = self
            .validator
            .perform_validation(
                &authz.identifier.value,
                &authz.challenges[challenge_index],
                &authz,
            )
            .await;

        let challenge = &mut authz.challenges[challenge_index];
        match outcome {
            Ok(outcome) => {
                challenge.validation_record = outcome.records;
                if let Some(problem) = outcome.problem {
                    challenge.status = Status::Invalid;
                    challenge.error = Some(problem);
                } else if !challenge.records_sane() {
                    challenge.status = Status::Invalid;
                    challenge.error = Some(Problem::server_internal(
                        "records for validation failed sanity check",
                    ));
                } else {
                    challenge.status = Status::Valid;
                }
            }
            Err(err) => {
                challenge.status = Status::Invalid;
                challenge.error = Some(Problem::server_internal(format!(
                    "could not communicate with validator: {err}",
                )));
            }
        }

        if let Err(err) = self.on_validation_update(authz).await {
            audit_err("Could not record validation outcome", &err);
        }
    }

    /// Resolves an authorization once a challenge reaches a terminal state
    /// and persists the result.
    pub(crate) async fn on_validation_update(&self, mut authz: Authorization) -> Result<(), Error> {
        if combination_satisfied(&authz) {
            authz.status = Status::Valid;
            // The pending deadline no longer applies; the validated proof
            // gets the full authorization lifetime.
            authz.expires = Some(self.now() + self.config.authorization_lifetime);
        } else {
            authz.status = Status::Invalid;
        }

        self.store.finalize_authorization(&authz).await?;
        audit_object("Validation result", &authz);
        Ok(())
    }

    async fn check_authorization_limits(
        &self,
        registration_id: i64,
        hostname: &str,
    ) -> Result<(), Error> {
        let limit = &self.config.limits.pending_authorizations_per_account;
        if limit.enabled() {
            let count = self.store.count_pending_authorizations(registration_id).await?;
            if !limit.allows(&registration_id.to_string(), Some(registration_id), count) {
                return Err(Error::rate_limited(
                    "too many currently pending authorizations",
                ));
            }
        }

        // Throttles repeated failed validations against one hostname. The
        // lookback covers authorizations that could still have been pending
        // at the window's start.
        let limit = &self.config.limits.invalid_authorizations_per_account;
        if limit.enabled() {
            let now = self.now();
            let earliest = now - (self.config.pending_authorization_lifetime + limit.window);
            let count = self
                .store
                .count_invalid_authorizations(registration_id, hostname, earliest, now)
                .await?;
            if !limit.allows(hostname, Some(registration_id), count) {
                return Err(Error::rate_limited(format!(
                    "too many failed authorizations recently for {hostname:?}",
                )));
            }
        }

        Ok(())
    }
}

/// Whether any one combination's every member challenge is valid.
///
/// In practice only one challenge is ever dispatched per authorization, but
/// the evaluation stays general. An authorization with no combinations is
/// satisfied by any single valid challenge.
pub(crate) fn combination_satisfied(authz: &Authorization) -> bool {
    if authz.combinations.is_empty() {
        return authz.challenges.iter().any(|ch| ch.status == Status::Valid);
    }
    authz.combinations.iter().any(|combo| {
        !combo.is_empty()
            && combo.iter().all(|&idx| {
                authz
                    .challenges
                    .get(idx)
                    .is_some_and(|ch| ch.status == Status::Valid)
            })
    })
}
