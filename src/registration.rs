//! Account lifecycle: creation, updates, key rollover, deactivation.

use std::net::IpAddr;

use serde_json::json;

use crate::{
    audit::audit_object,
    error::{Error, ErrorKind},
    key::AccountKey,
    objects::{Registration, RegistrationUpdate, Status},
    ra::RegistrationAuthority,
};

/// Client-supplied material for a new account.
#[derive(Debug, Clone)]
pub struct RegistrationInit {
    pub key: AccountKey,
    pub contact: Option<Vec<String>>,
    pub agreement: String,
    pub initial_ip: IpAddr,
}

impl RegistrationAuthority {
    /// Creates an account: key policy, per-IP limits, contact validation,
    /// then persistence. The Store enforces key uniqueness; a duplicate key
    /// comes back as a `Conflict` referencing the existing account.
    pub async fn new_registration(&self, init: RegistrationInit) -> Result<Registration, Error> {
        self.key_policy.good_key(&init.key)?;
        self.check_registration_limits(init.initial_ip).await?;
        if let Some(contact) = &init.contact {
            self.validate_contacts(contact).await?;
        }

        let reg = Registration {
            id: 0,
            key: init.key,
            contact: init.contact,
            agreement: init.agreement,
            initial_ip: init.initial_ip,
            created_at: self.now(),
            status: Status::Valid,
        };

        let reg = self.store.new_registration(reg).await?;
        audit_object("New registration", &reg);
        Ok(reg)
    }

    /// Merges `update` into `base` and persists the result. A merge that
    /// changes nothing short-circuits without a Store write.
    ///
    /// A key in `update` is only legitimate after the rollover operation has
    /// verified possession; use [`Self::rollover_key`] for client requests.
    pub async fn update_registration(
        &self,
        mut base: Registration,
        update: RegistrationUpdate,
    ) -> Result<Registration, Error> {
        let mut changed = false;

        if let Some(contact) = update.contact {
            if base.contact.as_ref() != Some(&contact) {
                self.validate_contacts(&contact).await?;
                base.contact = Some(contact);
                changed = true;
            }
        }
        if let Some(agreement) = update.agreement {
            if base.agreement != agreement {
                base.agreement = agreement;
                changed = true;
            }
        }
        if let Some(key) = update.key {
            if base.key != key {
                base.key = key;
                changed = true;
            }
        }

        if !changed {
            return Ok(base);
        }

        self.store.update_registration(&base).await?;
        audit_object("Registration updated", &base);
        Ok(base)
    }

    /// Replaces an account's key. The caller must already have verified
    /// possession of `new_key` via the outer signed rollover request.
    pub async fn rollover_key(
        &self,
        base: Registration,
        new_key: AccountKey,
    ) -> Result<Registration, Error> {
        self.key_policy.good_key(&new_key)?;

        if new_key == base.key {
            return Err(Error::malformed(
                "new key specified by rollover request is the same as the old key",
            ));
        }

        match self.store.get_registration_by_key(&new_key).await {
            Ok(existing) => {
                return Err(Error::conflict(format!(
                    "new key is already in use for account {}",
                    existing.id,
                )));
            }
            Err(err) if err.is(ErrorKind::NotFound) => {}
            Err(err) => return Err(err),
        }

        self.update_registration(
            base,
            RegistrationUpdate {
                key: Some(new_key),
                ..RegistrationUpdate::default()
            },
        )
        .await
    }

    /// One-way transition valid -> deactivated.
    pub async fn deactivate_registration(&self, reg: &Registration) -> Result<(), Error> {
        if reg.status != Status::Valid {
            return Err(Error::malformed(
                "only valid registrations can be deactivated",
            ));
        }
        self.store.deactivate_registration(reg.id).await?;
        audit_object("Registration deactivated", &json!({ "id": reg.id }));
        Ok(())
    }

    async fn check_registration_limits(&self, ip: IpAddr) -> Result<(), Error> {
        let now = self.now();

        let limit = &self.config.limits.registrations_per_ip;
        if limit.enabled() {
            let count = self
                .store
                .count_registrations_by_ip(ip, limit.window_begin(now), now)
                .await?;
            if !limit.allows(&ip.to_string(), None, count) {
                return Err(Error::rate_limited(
                    "too many registrations for this IP",
                ));
            }
        }

        // Exact-IP evasion is trivial within an IPv6 allocation, so a
        // coarser /48 counter backs the exact one up. IPv4 is exempt.
        let limit = &self.config.limits.registrations_per_ip_range;
        if limit.enabled() && ip.is_ipv6() {
            let count = self
                .store
                .count_registrations_by_ip_range(ip, limit.window_begin(now), now)
                .await?;
            if !limit.allows(&ip.to_string(), None, count) {
                return Err(Error::rate_limited(
                    "too many registrations for this IP range",
                ));
            }
        }

        Ok(())
    }

    async fn validate_contacts(&self, contacts: &[String]) -> Result<(), Error> {
        if contacts.len() > self.config.max_contacts {
            return Err(Error::malformed(format!(
                "too many contacts provided: {} > {}",
                contacts.len(),
                self.config.max_contacts,
            )));
        }

        for contact in contacts {
            if contact.contains(',') {
                return Err(Error::malformed("contact contains multiple addresses"));
            }
            if !contact.is_ascii() {
                return Err(Error::malformed(
                    "contact email contains non-ASCII characters",
                ));
            }
            let parsed = url::Url::parse(contact)
                .map_err(|err| Error::malformed(format!("invalid contact {contact:?}: {err}")))?;
            if parsed.scheme() != "mailto" {
                return Err(Error::malformed(format!(
                    "contact method {:?} is not supported",
                    parsed.scheme(),
                )));
            }
            if parsed.query().is_some() {
                return Err(Error::malformed("contact email contains hfields"));
            }
            let address = parsed.path();
            if address.is_empty() {
                return Err(Error::malformed("contact email is empty"));
            }
            if self.config.check_contact_email {
                self.validate_email(address).await?;
            }
        }

        Ok(())
    }

    /// Checks that an email's domain exists in DNS: an MX record or, failing
    /// that, an A/AAAA record. Lookups that time out do not block
    /// registration.
    async fn validate_email(&self, address: &str) -> Result<(), Error> {
        let Some((_, domain)) = address.split_once('@') else {
            return Err(Error::malformed(format!(
                "{address:?} is not a valid e-mail address",
            )));
        };
        if domain.is_empty() {
            return Err(Error::malformed(format!(
                "{address:?} is not a valid e-mail address",
            )));
        }

        let (mx, host) = tokio::join!(
            self.resolver.lookup_mx(domain),
            self.resolver.lookup_host(domain),
        );

        if matches!(&mx, Ok(records) if !records.is_empty()) {
            return Ok(());
        }
        if matches!(&host, Ok(addrs) if !addrs.is_empty()) {
            return Ok(());
        }
        if matches!(&mx, Err(err) if err.is_timeout()) || matches!(&host, Err(err) if err.is_timeout())
        {
            // Best effort: a slow resolver must not block registration.
            log::warn!("DNS timed out while validating contact domain {domain}");
            return Ok(());
        }

        Err(Error::malformed(format!(
            "no MX or A records for contact domain {domain}",
        )))
    }
}

#[cfg(test)]
mod tests {
    use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

    use time::Duration;

    use super::*;
    use crate::{
        key::{create_p256_key, AccountKey},
        limits::RateLimitPolicy,
        test::{rig, rig_with, test_config},
    };

    fn test_key() -> AccountKey {
        AccountKey::from_verifying_key(create_p256_key().verifying_key())
    }

    fn init_with(key: AccountKey, ip: IpAddr) -> RegistrationInit {
        RegistrationInit {
            key,
            contact: Some(vec!["mailto:admin@example.com".to_owned()]),
            agreement: "https://example.com/terms".to_owned(),
            initial_ip: ip,
        }
    }

    fn init(key: AccountKey) -> RegistrationInit {
        init_with(key, IpAddr::V4(Ipv4Addr::new(192, 0, 2, 1)))
    }

    #[tokio::test]
    async fn registration_round_trip() {
        let t = rig();

        let reg = t.ra.new_registration(init(test_key())).await.unwrap();
        assert!(reg.id > 0);
        assert_eq!(reg.status, Status::Valid);

        let fetched = t.store.get_registration(reg.id).await.unwrap();
        assert_eq!(fetched, reg);
    }

    #[tokio::test]
    async fn duplicate_key_conflicts_with_existing_account() {
        let t = rig();
        let key = test_key();

        let first = t.ra.new_registration(init(key.clone())).await.unwrap();
        let err = t.ra.new_registration(init(key)).await.unwrap_err();

        assert!(err.is(ErrorKind::Conflict));
        assert!(err.detail().contains(&first.id.to_string()));
        assert_eq!(t.store.registration_count(), 1);
    }

    #[tokio::test]
    async fn identical_update_skips_the_store_write() {
        let t = rig();
        let reg = t.ra.new_registration(init(test_key())).await.unwrap();
        let writes_before = t.store.registration_writes();

        let update = RegistrationUpdate {
            contact: reg.contact.clone(),
            agreement: Some(reg.agreement.clone()),
            key: Some(reg.key.clone()),
        };
        let merged = t.ra.update_registration(reg.clone(), update).await.unwrap();

        assert_eq!(merged, reg);
        assert_eq!(t.store.registration_writes(), writes_before);
    }

    #[tokio::test]
    async fn update_persists_changed_contact() {
        let t = rig();
        let reg = t.ra.new_registration(init(test_key())).await.unwrap();

        let update = RegistrationUpdate {
            contact: Some(vec!["mailto:security@example.com".to_owned()]),
            ..RegistrationUpdate::default()
        };
        let merged = t.ra.update_registration(reg.clone(), update).await.unwrap();

        assert_ne!(merged.contact, reg.contact);
        let stored = t.store.get_registration(reg.id).await.unwrap();
        assert_eq!(stored.contact, merged.contact);
    }

    #[tokio::test]
    async fn contact_validation_rejects_bad_input() {
        let t = rig();

        let cases = [
            "tel:+15551234567",
            "mailto:a@example.com,b@example.com",
            "mailto:admin@example.com?subject=hi",
            "mailto:admin@exämple.com",
            "mailto:admin",
        ];
        for contact in cases {
            let mut init = init(test_key());
            init.contact = Some(vec![contact.to_owned()]);
            let err = t.ra.new_registration(init).await.unwrap_err();
            assert!(err.is(ErrorKind::Malformed), "{contact}: {err}");
        }
    }

    #[tokio::test]
    async fn contact_count_ceiling() {
        let mut config = test_config();
        config.max_contacts = 1;
        let t = rig_with(config);

        let mut init = init(test_key());
        init.contact = Some(vec![
            "mailto:a@example.com".to_owned(),
            "mailto:b@example.com".to_owned(),
        ]);
        let err = t.ra.new_registration(init).await.unwrap_err();
        assert!(err.is(ErrorKind::Malformed));
    }

    #[tokio::test]
    async fn email_domain_without_records_is_rejected() {
        let t = rig();
        t.resolver.clear_records("nodomain.example");

        let mut init = init(test_key());
        init.contact = Some(vec!["mailto:admin@nodomain.example".to_owned()]);
        let err = t.ra.new_registration(init).await.unwrap_err();
        assert!(err.is(ErrorKind::Malformed));
    }

    #[tokio::test]
    async fn email_dns_timeout_is_best_effort() {
        let t = rig();
        t.resolver.time_out("slow.example");

        let mut init = init(test_key());
        init.contact = Some(vec!["mailto:admin@slow.example".to_owned()]);
        t.ra.new_registration(init).await.unwrap();
    }

    #[tokio::test]
    async fn per_ip_limit_hits_at_threshold() {
        let mut config = test_config();
        config.limits.registrations_per_ip = RateLimitPolicy::new(Duration::hours(1), 2);
        let t = rig_with(config);
        let ip = IpAddr::V4(Ipv4Addr::new(192, 0, 2, 7));

        t.ra.new_registration(init_with(test_key(), ip))
            .await
            .unwrap();
        t.ra.new_registration(init_with(test_key(), ip))
            .await
            .unwrap();

        let err = t
            .ra
            .new_registration(init_with(test_key(), ip))
            .await
            .unwrap_err();
        assert!(err.is(ErrorKind::RateLimited));
    }

    #[tokio::test]
    async fn ip_range_limit_only_applies_to_ipv6() {
        let mut config = test_config();
        config.limits.registrations_per_ip_range = RateLimitPolicy::new(Duration::hours(1), 1);
        let t = rig_with(config);

        // two addresses in the same /48
        let a = IpAddr::V6("2001:db8:1::1".parse::<Ipv6Addr>().unwrap());
        let b = IpAddr::V6("2001:db8:1:2::1".parse::<Ipv6Addr>().unwrap());
        t.ra.new_registration(init_with(test_key(), a))
            .await
            .unwrap();
        let err = t
            .ra
            .new_registration(init_with(test_key(), b))
            .await
            .unwrap_err();
        assert!(err.is(ErrorKind::RateLimited));

        // IPv4 neighbors are exempt from the range counter
        for host in 1..=3u8 {
            let ip = IpAddr::V4(Ipv4Addr::new(198, 51, 100, host));
            t.ra.new_registration(init_with(test_key(), ip))
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn rollover_rejects_degenerate_and_bound_keys() {
        let t = rig();
        let reg = t.ra.new_registration(init(test_key())).await.unwrap();
        let other = t.ra.new_registration(init(test_key())).await.unwrap();

        let err = t
            .ra
            .rollover_key(reg.clone(), reg.key.clone())
            .await
            .unwrap_err();
        assert!(err.is(ErrorKind::Malformed));

        let err = t
            .ra
            .rollover_key(reg.clone(), other.key.clone())
            .await
            .unwrap_err();
        assert!(err.is(ErrorKind::Conflict));
        assert!(err.detail().contains(&other.id.to_string()));

        let fresh = test_key();
        let rolled = t.ra.rollover_key(reg.clone(), fresh.clone()).await.unwrap();
        assert_eq!(rolled.key, fresh);
        let stored = t.store.get_registration(reg.id).await.unwrap();
        assert_eq!(stored.key, fresh);
    }

    #[tokio::test]
    async fn deactivation_is_one_way() {
        let t = rig();
        let mut reg = t.ra.new_registration(init(test_key())).await.unwrap();

        t.ra.deactivate_registration(&reg).await.unwrap();
        let stored = t.store.get_registration(reg.id).await.unwrap();
        assert_eq!(stored.status, Status::Deactivated);

        reg.status = Status::Deactivated;
        let err = t.ra.deactivate_registration(&reg).await.unwrap_err();
        assert!(err.is(ErrorKind::Malformed));
    }
}
