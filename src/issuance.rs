//! Certificate issuance: CSR vetting, rate limiting, authorization
//! coverage, CAA rechecks, signing, and the post-signing self-check.

use std::sync::Arc;

use der::Decode as _;
use serde::Serialize;
use serde_json::json;
use time::{Duration, OffsetDateTime};
use x509_cert::request::CertReq;

use crate::{
    audit::{audit_err, audit_object},
    csr::{csr_public_key, csr_subject, matches_csr, verify_csr},
    domain::partition_by_registered_domain,
    error::Error,
    objects::{Certificate, Order, Problem, RevocationReason, Status},
    ra::RegistrationAuthority,
};

/// CAA findings must be no older than this at issuance time.
const CAA_RECHECK_MARGIN: Duration = Duration::hours(8);

/// The compliance record for one issuance attempt; written exactly once per
/// attempt, success or failure.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CertificateRequestEvent {
    id: String,
    requester: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    serial_number: Option<String>,
    requested_names: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    common_name: Option<String>,
    #[serde(with = "time::serde::rfc3339::option", skip_serializing_if = "Option::is_none")]
    not_before: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option", skip_serializing_if = "Option::is_none")]
    not_after: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339")]
    request_time: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    response_time: Option<OffsetDateTime>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl RegistrationAuthority {
    /// Issues a certificate for a CSR, enforcing every business rule on the
    /// way: structural CSR checks, rate limits, authorization coverage with
    /// CAA rechecks, and a post-signing comparison of the certificate
    /// against the request.
    pub async fn new_certificate(
        &self,
        csr_der: &[u8],
        registration_id: i64,
    ) -> Result<Certificate, Error> {
        let mut event = CertificateRequestEvent {
            id: crate::objects::new_token(),
            requester: registration_id,
            serial_number: None,
            requested_names: Vec::new(),
            common_name: None,
            not_before: None,
            not_after: None,
            request_time: self.now(),
            response_time: None,
            error: None,
        };

        let result = self
            .issue_certificate_inner(csr_der, registration_id, &mut event)
            .await;

        event.response_time = Some(self.now());
        match &result {
            Ok(cert) => {
                event.serial_number = Some(cert.serial.clone());
                event.not_before = Some(cert.issued);
                event.not_after = Some(cert.expires);
                audit_object("Certificate request - successful", &event);
            }
            Err(err) => {
                event.error = Some(err.to_string());
                audit_object("Certificate request - error", &event);
            }
        }

        result
    }

    async fn issue_certificate_inner(
        &self,
        csr_der: &[u8],
        registration_id: i64,
        event: &mut CertificateRequestEvent,
    ) -> Result<Certificate, Error> {
        if registration_id <= 0 {
            return Err(Error::malformed(format!(
                "invalid registration ID: {registration_id}",
            )));
        }

        let registration = self.store.get_registration(registration_id).await?;

        let csr = CertReq::from_der(csr_der)
            .map_err(|err| Error::malformed(format!("unparseable CSR: {err}")))?;
        let names = verify_csr(
            &csr,
            self.config.max_names,
            &self.key_policy,
            self.policy.as_ref(),
        )?;
        event.requested_names = names.clone();
        event.common_name = csr_subject(&csr)?.common_name;

        // Certifying the account key would let a challenge response double
        // as a certificate request.
        if csr_public_key(&csr)?.digest() == registration.key.digest() {
            return Err(Error::malformed(
                "certificate public key must be different than account key",
            ));
        }

        // Limits run before the authorization check so a rate-limited client
        // gets a back-off signal instead of a misleading prompt to go get
        // authorizations.
        self.check_issuance_limits(&names, registration_id).await?;
        self.check_authorizations(&names, registration_id).await?;

        let certificate = self.signer.issue_certificate(csr_der, registration_id).await?;

        let parsed = x509_cert::Certificate::from_der(&certificate.der)
            .map_err(|err| Error::server_internal(format!("unparseable certificate: {err}")))?;
        matches_csr(&parsed, &csr, self.now(), self.config.force_cn_from_san)?;

        if let Some(publisher) = &self.publisher {
            let publisher = Arc::clone(publisher);
            let der = certificate.der.clone();
            tokio::spawn(async move {
                if let Err(err) = publisher.submit_to_ct(&der).await {
                    log::warn!("CT submission failed: {err}");
                }
            });
        }

        Ok(certificate)
    }

    /// Creates an order: one authorization per name (reused where possible)
    /// plus the persisted order aggregate. No signing happens here.
    pub async fn new_order(&self, csr_der: &[u8], registration_id: i64) -> Result<Order, Error> {
        if registration_id <= 0 {
            return Err(Error::malformed(format!(
                "invalid registration ID: {registration_id}",
            )));
        }

        let csr = CertReq::from_der(csr_der)
            .map_err(|err| Error::malformed(format!("unparseable CSR: {err}")))?;
        let names = verify_csr(
            &csr,
            self.config.max_names,
            &self.key_policy,
            self.policy.as_ref(),
        )?;

        let mut authorization_ids = Vec::with_capacity(names.len());
        for name in &names {
            let authz = self
                .new_authorization(crate::objects::Identifier::dns(name.clone()), registration_id)
                .await?;
            authorization_ids.push(authz.id);
        }

        let order = Order {
            id: 0,
            registration_id,
            status: Status::Pending,
            expires: self.now() + self.config.order_lifetime,
            csr_der: csr_der.to_vec(),
            authorization_ids,
        };
        let order = self.store.new_order(order).await?;
        audit_object("New order", &order);
        Ok(order)
    }

    /// Marks a certificate revoked on behalf of its subscriber or an
    /// administrator.
    pub async fn revoke_certificate(
        &self,
        cert: &Certificate,
        reason: RevocationReason,
        requester: Option<i64>,
    ) -> Result<(), Error> {
        let result = self
            .store
            .mark_certificate_revoked(&cert.serial, reason)
            .await;
        match &result {
            Ok(()) => audit_object(
                "Revocation - certificate revoked",
                &json!({
                    "serial": cert.serial,
                    "reason": reason,
                    "requester": requester,
                }),
            ),
            Err(err) => audit_err("Revocation - failed", err),
        }
        result
    }

    /// Marks a certificate revoked at an administrator's request, outside any
    /// subscriber account. The acting administrator is named in the audit
    /// record.
    pub async fn administratively_revoke_certificate(
        &self,
        cert: &Certificate,
        reason: RevocationReason,
        admin: &str,
    ) -> Result<(), Error> {
        let result = self
            .store
            .mark_certificate_revoked(&cert.serial, reason)
            .await;
        match &result {
            Ok(()) => audit_object(
                "Revocation - certificate revoked by administrator",
                &json!({
                    "serial": cert.serial,
                    "reason": reason,
                    "admin": admin,
                }),
            ),
            Err(err) => audit_err("Revocation - failed", err),
        }
        result
    }

    /// Every requested name needs a valid, unexpired authorization owned by
    /// this registration, and CAA findings old enough to have gone stale get
    /// rechecked synchronously.
    async fn check_authorizations(&self, names: &[String], registration_id: i64) -> Result<(), Error> {
        let now = self.now();
        let authorizations = self
            .store
            .get_valid_authorizations(registration_id, names, now)
            .await?;

        // The validation timestamp isn't stored; an authorization's expiry
        // minus the authorization lifetime approximates it. Anything
        // validated more than the margin ago gets a fresh CAA check.
        let recheck_before = now + self.config.authorization_lifetime - CAA_RECHECK_MARGIN;

        let mut bad_names = Vec::new();
        let mut recheck_names = Vec::new();
        for name in names {
            match authorizations.get(name) {
                Some(authz) if authz.expires.is_some_and(|exp| exp > now) => {
                    if self.config.recheck_caa
                        && authz.expires.is_some_and(|exp| exp < recheck_before)
                    {
                        recheck_names.push(name.as_str());
                    }
                }
                _ => bad_names.push(name.as_str()),
            }
        }

        if !bad_names.is_empty() {
            return Err(Error::unauthorized(format!(
                "authorizations for these names not found or expired: {}",
                bad_names.join(", "),
            )));
        }

        let mut failures: Vec<Problem> = Vec::new();
        for name in recheck_names {
            if let Some(problem) = self.validator.is_caa_valid(name).await? {
                failures.push(problem);
            }
        }
        if !failures.is_empty() {
            return Err(Error::caa(
                format!("rechecking CAA: {} name(s) failed", failures.len()),
                failures,
            ));
        }

        Ok(())
    }

    async fn check_issuance_limits(&self, names: &[String], registration_id: i64) -> Result<(), Error> {
        let now = self.now();

        let limit = &self.config.limits.certificates_per_name;
        if limit.enabled() {
            let partition = partition_by_registered_domain(names.iter().map(String::as_str));
            let earliest = limit.window_begin(now);

            let mut counts = self
                .store
                .count_certificates_by_names(&partition.registered, earliest, now)
                .await?;
            if !partition.exact_suffixes.is_empty() {
                // Counting whole public suffixes by subdomain would let
                // unrelated registrants exhaust each other's limit.
                let suffix_counts = if self.config.exact_name_counts {
                    self.store
                        .count_certificates_by_exact_names(&partition.exact_suffixes, earliest, now)
                        .await?
                } else {
                    self.store
                        .count_certificates_by_names(&partition.exact_suffixes, earliest, now)
                        .await?
                };
                counts.extend(suffix_counts);
            }

            let mut over: Vec<&str> = counts
                .iter()
                .filter(|(bucket, &count)| !limit.allows(bucket, Some(registration_id), count))
                .map(|(bucket, _)| bucket.as_str())
                .collect();
            if !over.is_empty() {
                // Renewal exemption: an identical FQDN set already on file
                // bypasses the per-name limit.
                if self.store.fqdn_set_exists(names).await? {
                    log::debug!("per-name limit bypassed for renewal of {names:?}");
                } else {
                    over.sort_unstable();
                    return Err(Error::rate_limited(format!(
                        "too many certificates already issued for: {}",
                        over.join(", "),
                    )));
                }
            }
        }

        let limit = &self.config.limits.certificates_per_fqdn_set;
        if limit.enabled() {
            let count = self.store.count_fqdn_sets(limit.window, names).await?;
            if !limit.allows(&names.join(","), Some(registration_id), count) {
                return Err(Error::rate_limited(format!(
                    "too many certificates already issued for exact set of domains: {}",
                    names.join(","),
                )));
            }
        }

        let limit = &self.config.limits.total_certificates;
        if limit.enabled() {
            let count = self.issued.current(now)?;
            if count >= limit.threshold {
                return Err(Error::rate_limited(
                    "global certificate issuance limit reached",
                ));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use time::Duration;

    use super::*;
    use crate::{
        error::ErrorKind,
        key::create_p256_key,
        limits::RateLimitPolicy,
        objects::ProblemType,
        test::{encode_csr, rig, rig_with, test_config},
    };

    #[tokio::test]
    async fn issues_certificate_end_to_end() {
        let t = rig();
        let reg = t.register().await;
        t.finalized_authorization(reg.id, "example.com").await;

        let csr = encode_csr(&create_p256_key(), &["example.com"]);
        let cert = t.ra.new_certificate(&csr, reg.id).await.unwrap();

        assert_eq!(cert.registration_id, reg.id);
        assert!(!cert.serial.is_empty());
        assert_eq!(
            t.store.certificate_names(&cert.serial),
            vec!["example.com".to_owned()],
        );
    }

    #[tokio::test]
    async fn nonpositive_registration_id_is_malformed() {
        let t = rig();
        let csr = encode_csr(&create_p256_key(), &["example.com"]);
        let err = t.ra.new_certificate(&csr, 0).await.unwrap_err();
        assert!(err.is(ErrorKind::Malformed));
    }

    #[tokio::test]
    async fn account_key_cannot_be_certified() {
        let t = rig();
        let account_key = create_p256_key();
        let reg = t.register_with_key(&account_key).await;
        t.finalized_authorization(reg.id, "example.com").await;

        let csr = encode_csr(&account_key, &["example.com"]);
        let err = t.ra.new_certificate(&csr, reg.id).await.unwrap_err();
        assert!(err.is(ErrorKind::Malformed));
        assert!(err.detail().contains("account key"));
    }

    #[tokio::test]
    async fn missing_authorization_blocks_issuance() {
        let t = rig();
        let reg = t.register().await;
        t.finalized_authorization(reg.id, "example.com").await;

        let csr = encode_csr(&create_p256_key(), &["example.com", "www.example.com"]);
        let err = t.ra.new_certificate(&csr, reg.id).await.unwrap_err();
        assert!(err.is(ErrorKind::Unauthorized));
        assert!(err.detail().contains("www.example.com"));
        assert!(!err.detail().contains("example.com,"));
    }

    #[tokio::test]
    async fn expired_authorization_counts_as_missing() {
        let t = rig();
        let reg = t.register().await;
        t.finalized_authorization(reg.id, "example.com").await;

        t.clock
            .advance(t.ra.config().authorization_lifetime + Duration::minutes(1));

        let csr = encode_csr(&create_p256_key(), &["example.com"]);
        let err = t.ra.new_certificate(&csr, reg.id).await.unwrap_err();
        assert!(err.is(ErrorKind::Unauthorized));
    }

    #[tokio::test]
    async fn fresh_authorizations_skip_the_caa_recheck() {
        let t = rig();
        let reg = t.register().await;
        t.finalized_authorization(reg.id, "example.com").await;

        let csr = encode_csr(&create_p256_key(), &["example.com"]);
        t.ra.new_certificate(&csr, reg.id).await.unwrap();
        assert_eq!(t.validator.caa_checks(), 0);
    }

    #[tokio::test]
    async fn stale_authorizations_get_caa_rechecked() {
        let t = rig();
        let reg = t.register().await;
        t.finalized_authorization(reg.id, "example.com").await;

        // past the recheck margin, the original CAA finding is stale
        t.clock.advance(Duration::hours(9));

        let csr = encode_csr(&create_p256_key(), &["example.com"]);
        t.ra.new_certificate(&csr, reg.id).await.unwrap();
        assert_eq!(t.validator.caa_checks(), 1);
    }

    #[tokio::test]
    async fn caa_recheck_failure_aborts_with_subproblems() {
        let t = rig();
        let reg = t.register().await;
        t.finalized_authorization(reg.id, "example.com").await;
        t.clock.advance(Duration::hours(9));
        t.validator.fail_caa(
            "example.com",
            Problem::new(ProblemType::Caa, "CAA record forbids issuance"),
        );

        let csr = encode_csr(&create_p256_key(), &["example.com"]);
        let err = t.ra.new_certificate(&csr, reg.id).await.unwrap_err();
        assert!(err.is(ErrorKind::Caa));
        assert_eq!(err.subproblems().len(), 1);
    }

    #[tokio::test]
    async fn rate_limits_run_before_authorization_checks() {
        let mut config = test_config();
        config.limits.certificates_per_name = RateLimitPolicy::new(Duration::hours(24), 1);
        let t = rig_with(config);
        let reg = t.register().await;
        t.store
            .record_issuance(&["old.example.com".to_owned()], "aa11", t.clock.now());

        // no authorization exists either; the limit error must win
        let csr = encode_csr(&create_p256_key(), &["example.com"]);
        let err = t.ra.new_certificate(&csr, reg.id).await.unwrap_err();
        assert!(err.is(ErrorKind::RateLimited));
    }

    #[tokio::test]
    async fn per_name_limit_counts_subdomains_into_one_bucket() {
        let mut config = test_config();
        config.limits.certificates_per_name = RateLimitPolicy::new(Duration::hours(24), 1);
        let t = rig_with(config);
        let reg = t.register().await;
        t.store
            .record_issuance(&["old.example.com".to_owned()], "aa22", t.clock.now());
        t.finalized_authorization(reg.id, "new.example.com").await;

        let csr = encode_csr(&create_p256_key(), &["new.example.com"]);
        let err = t.ra.new_certificate(&csr, reg.id).await.unwrap_err();
        assert!(err.is(ErrorKind::RateLimited));
        assert!(err.detail().contains("example.com"));
    }

    #[tokio::test]
    async fn identical_fqdn_set_bypasses_the_per_name_limit() {
        let mut config = test_config();
        config.limits.certificates_per_name = RateLimitPolicy::new(Duration::hours(24), 1);
        let t = rig_with(config);
        let reg = t.register().await;
        t.store
            .record_issuance(&["example.com".to_owned()], "aa33", t.clock.now());
        t.finalized_authorization(reg.id, "example.com").await;

        // renewal of the exact same set succeeds despite the full bucket
        let csr = encode_csr(&create_p256_key(), &["example.com"]);
        t.ra.new_certificate(&csr, reg.id).await.unwrap();

        // a different set under the same bucket stays limited
        t.finalized_authorization(reg.id, "www.example.com").await;
        let csr = encode_csr(&create_p256_key(), &["example.com", "www.example.com"]);
        let err = t.ra.new_certificate(&csr, reg.id).await.unwrap_err();
        assert!(err.is(ErrorKind::RateLimited));
    }

    #[tokio::test]
    async fn fqdn_set_limit_caps_exact_renewals() {
        let mut config = test_config();
        config.limits.certificates_per_fqdn_set = RateLimitPolicy::new(Duration::hours(24), 1);
        let t = rig_with(config);
        let reg = t.register().await;
        t.store
            .record_issuance(&["example.com".to_owned()], "aa44", t.clock.now());
        t.finalized_authorization(reg.id, "example.com").await;

        let csr = encode_csr(&create_p256_key(), &["example.com"]);
        let err = t.ra.new_certificate(&csr, reg.id).await.unwrap_err();
        assert!(err.is(ErrorKind::RateLimited));
        assert!(err.detail().contains("exact set"));
    }

    #[tokio::test]
    async fn global_limit_uses_the_issued_count_cache() {
        let mut config = test_config();
        config.limits.total_certificates = RateLimitPolicy::new(Duration::hours(24), 5);
        let t = rig_with(config);
        let reg = t.register().await;
        t.finalized_authorization(reg.id, "example.com").await;
        let csr = encode_csr(&create_p256_key(), &["example.com"]);

        // the refresher populates the cache right at startup; wait for it so
        // the manual snapshots below are not overwritten
        tokio::time::timeout(std::time::Duration::from_secs(5), async {
            while t.ra.issued.current(t.clock.now()).is_err() {
                tokio::time::sleep(std::time::Duration::from_millis(2)).await;
            }
        })
        .await
        .expect("issued-count cache was not populated at startup");
        t.ra.new_certificate(&csr, reg.id).await.unwrap();

        t.ra.issued.store(5, t.clock.now());
        let err = t.ra.new_certificate(&csr, reg.id).await.unwrap_err();
        assert!(err.is(ErrorKind::RateLimited));

        t.ra.issued.store(4, t.clock.now());
        t.ra.new_certificate(&csr, reg.id).await.unwrap();
    }

    #[tokio::test]
    async fn post_signing_mismatch_is_a_server_error() {
        let t = rig();
        let reg = t.register().await;
        t.finalized_authorization(reg.id, "example.com").await;
        t.signer.sabotage_names(vec!["wrong.example".to_owned()]);

        let csr = encode_csr(&create_p256_key(), &["example.com"]);
        let err = t.ra.new_certificate(&csr, reg.id).await.unwrap_err();
        assert!(err.is(ErrorKind::InternalServer));
    }

    #[tokio::test]
    async fn new_order_creates_one_authorization_per_name() {
        let t = rig();
        let reg = t.register().await;
        let existing = t.finalized_authorization(reg.id, "example.com").await;

        let csr = encode_csr(&create_p256_key(), &["example.com", "www.example.com"]);
        let order = t.ra.new_order(&csr, reg.id).await.unwrap();

        assert!(order.id > 0);
        assert_eq!(order.status, Status::Pending);
        assert_eq!(order.expires, t.ra.now() + t.ra.config().order_lifetime);
        assert_eq!(order.authorization_ids.len(), 2);
        // the valid authorization is reused, the other is freshly pending
        assert!(order.authorization_ids.contains(&existing.id));
    }

    #[tokio::test]
    async fn revocation_marks_the_certificate() {
        let t = rig();
        let reg = t.register().await;
        t.finalized_authorization(reg.id, "example.com").await;

        let csr = encode_csr(&create_p256_key(), &["example.com"]);
        let cert = t.ra.new_certificate(&csr, reg.id).await.unwrap();

        t.ra.revoke_certificate(&cert, RevocationReason::KeyCompromise, Some(reg.id))
            .await
            .unwrap();
        assert!(t.store.certificate_revoked(&cert.serial));
    }

    #[tokio::test]
    async fn administrative_revocation_marks_the_certificate() {
        let t = rig();
        let reg = t.register().await;
        t.finalized_authorization(reg.id, "example.com").await;

        let csr = encode_csr(&create_p256_key(), &["example.com"]);
        let cert = t.ra.new_certificate(&csr, reg.id).await.unwrap();

        t.ra.administratively_revoke_certificate(&cert, RevocationReason::Superseded, "ops")
            .await
            .unwrap();
        assert!(t.store.certificate_revoked(&cert.serial));

        let mut unknown = cert.clone();
        unknown.serial = "ffff".to_owned();
        let err = t
            .ra
            .administratively_revoke_certificate(&unknown, RevocationReason::Superseded, "ops")
            .await
            .unwrap_err();
        assert!(err.is(ErrorKind::NotFound));
    }
}
