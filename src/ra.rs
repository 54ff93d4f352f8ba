//! The registration authority instance: collaborators, configuration, and
//! shared state.

use std::sync::{Arc, Weak};

use time::OffsetDateTime;

use crate::{
    config::RaConfig,
    interfaces::{Clock, DnsResolver, PolicyOracle, Publisher, Signer, Store, Validator},
    issued_count::TotalIssuedCache,
    key::KeyPolicy,
};

/// The external subsystems an RA instance mediates between.
pub struct Collaborators {
    pub store: Arc<dyn Store>,
    pub validator: Arc<dyn Validator>,
    pub signer: Arc<dyn Signer>,
    pub policy: Arc<dyn PolicyOracle>,
    pub resolver: Arc<dyn DnsResolver>,
    /// Optional CT-log submission; absent means no submission attempted.
    pub publisher: Option<Arc<dyn Publisher>>,
    pub clock: Arc<dyn Clock>,
}

/// The registration authority.
///
/// Invoked concurrently, one call per inbound API request, with no mutual
/// exclusion across requests. Correctness of counting and uniqueness relies
/// on the Store; the only shared mutable in-process state is the issuance
/// count cache.
pub struct RegistrationAuthority {
    pub(crate) store: Arc<dyn Store>,
    pub(crate) validator: Arc<dyn Validator>,
    pub(crate) signer: Arc<dyn Signer>,
    pub(crate) policy: Arc<dyn PolicyOracle>,
    pub(crate) resolver: Arc<dyn DnsResolver>,
    pub(crate) publisher: Option<Arc<dyn Publisher>>,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) key_policy: KeyPolicy,
    pub(crate) config: RaConfig,
    pub(crate) issued: TotalIssuedCache,
    /// Handle on ourselves for tasks that must outlive the calling request.
    pub(crate) self_ref: Weak<Self>,
    refresher: Option<tokio::task::JoinHandle<()>>,
}

impl RegistrationAuthority {
    /// Builds an RA and, when the global issuance limit is enabled, starts
    /// the background count refresher. Must be called within a tokio runtime
    /// in that case.
    pub fn new(collab: Collaborators, key_policy: KeyPolicy, config: RaConfig) -> Arc<Self> {
        let issued = TotalIssuedCache::new();

        let refresher = config.limits.total_certificates.enabled().then(|| {
            issued.spawn_refresher(
                Arc::clone(&collab.store),
                Arc::clone(&collab.clock),
                config.limits.total_certificates.clone(),
            )
        });

        Arc::new_cyclic(|self_ref| RegistrationAuthority {
            store: collab.store,
            validator: collab.validator,
            signer: collab.signer,
            policy: collab.policy,
            resolver: collab.resolver,
            publisher: collab.publisher,
            clock: collab.clock,
            key_policy,
            config,
            issued,
            self_ref: self_ref.clone(),
            refresher,
        })
    }

    pub fn config(&self) -> &RaConfig {
        &self.config
    }

    pub(crate) fn now(&self) -> OffsetDateTime {
        self.clock.now()
    }
}

impl Drop for RegistrationAuthority {
    fn drop(&mut self) {
        if let Some(refresher) = self.refresher.take() {
            refresher.abort();
        }
    }
}
