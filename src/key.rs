//! Account public keys and the policy that vets them.

use std::collections::HashSet;

use base64::prelude::*;
use p256::elliptic_curve::sec1::ToEncodedPoint as _;
use pkcs8::{DecodePublicKey as _, EncodePublicKey as _};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest as _, Sha256};

use crate::error::Error;

/// Make a P-256 private key (from which we can derive a public key).
pub fn create_p256_key() -> p256::ecdsa::SigningKey {
    let csprng = &mut rand::thread_rng();
    ecdsa::SigningKey::from(p256::SecretKey::random(csprng))
}

/// An account public key, held as DER-encoded SubjectPublicKeyInfo.
///
/// The key uniquely identifies at most one active registration; it is
/// immutable once bound except through the explicit rollover operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountKey {
    spki: Vec<u8>,
}

impl AccountKey {
    /// Parses a DER SubjectPublicKeyInfo. The encoding is canonicalized so
    /// equality and digests are stable.
    pub fn from_spki_der(der: &[u8]) -> Result<Self, Error> {
        let key = p256::PublicKey::from_public_key_der(der)
            .map_err(|err| Error::malformed(format!("invalid public key: {err}")))?;
        Ok(Self::from_public_key(&key))
    }

    pub fn from_verifying_key(key: &p256::ecdsa::VerifyingKey) -> Self {
        Self::from_public_key(&p256::PublicKey::from(key))
    }

    fn from_public_key(key: &p256::PublicKey) -> Self {
        let spki = key
            .to_public_key_der()
            .expect("P-256 public keys always encode")
            .into_vec();
        AccountKey { spki }
    }

    pub fn spki_der(&self) -> &[u8] {
        &self.spki
    }

    /// SHA-256 over the SPKI encoding. Two keys are the same iff their
    /// digests are equal.
    pub fn digest(&self) -> [u8; 32] {
        Sha256::digest(&self.spki).into()
    }

    pub(crate) fn public_key(&self) -> p256::PublicKey {
        // The SPKI was validated at construction.
        p256::PublicKey::from_public_key_der(&self.spki).expect("stored SPKI parses")
    }

    /// The RFC 7638 JWK thumbprint, base64url-encoded.
    pub fn jwk_thumbprint(&self) -> String {
        let point = self.public_key().to_encoded_point(false);

        let jwk_thumb = JwkThumb {
            crv: "P-256",
            kty: "EC",
            x: BASE64_URL_SAFE_NO_PAD.encode(point.x().expect("uncompressed point has x")),
            y: BASE64_URL_SAFE_NO_PAD.encode(point.y().expect("uncompressed point has y")),
        };
        let jwk_json = serde_json::to_string(&jwk_thumb).expect("thumbprint serializes");

        BASE64_URL_SAFE_NO_PAD.encode(Sha256::digest(jwk_json))
    }

    /// The key authorization a holder of this key produces for `token`:
    /// `<token>.<jwk thumbprint>`.
    pub fn key_authorization(&self, token: &str) -> Result<String, Error> {
        if token.is_empty() {
            return Err(Error::server_internal("empty challenge token"));
        }
        Ok(format!("{token}.{}", self.jwk_thumbprint()))
    }
}

impl Serialize for AccountKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&BASE64_URL_SAFE_NO_PAD.encode(&self.spki))
    }
}

impl<'de> Deserialize<'de> for AccountKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        let der = BASE64_URL_SAFE_NO_PAD
            .decode(encoded)
            .map_err(serde::de::Error::custom)?;
        AccountKey::from_spki_der(&der).map_err(serde::de::Error::custom)
    }
}

// LEXICAL ORDER OF FIELDS MATTER!
#[derive(Serialize)]
struct JwkThumb<'a> {
    crv: &'a str,
    kty: &'a str,
    x: String,
    y: String,
}

/// Vets public keys presented in registrations and CSRs.
///
/// Only P-256 ECDSA keys are accepted; known-weak keys are refused by SPKI
/// digest.
#[derive(Debug, Clone, Default)]
pub struct KeyPolicy {
    weak_key_digests: HashSet<[u8; 32]>,
}

impl KeyPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a policy from a blocklist of SPKI digests.
    pub fn with_weak_keys(weak_key_digests: impl IntoIterator<Item = [u8; 32]>) -> Self {
        KeyPolicy {
            weak_key_digests: weak_key_digests.into_iter().collect(),
        }
    }

    /// Checks a key against the policy. The curve itself was already
    /// enforced when the [`AccountKey`] was parsed.
    pub fn good_key(&self, key: &AccountKey) -> Result<(), Error> {
        if self.weak_key_digests.contains(&key.digest()) {
            return Err(Error::malformed("invalid public key: known weak key"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_key() -> AccountKey {
        AccountKey::from_verifying_key(create_p256_key().verifying_key())
    }

    #[test]
    fn key_authorization_is_deterministic() {
        let key = test_key();
        let token = crate::objects::new_token();

        let first = key.key_authorization(&token).unwrap();
        let second = key.key_authorization(&token).unwrap();
        assert_eq!(first, second);
        assert!(first.starts_with(&format!("{token}.")));
    }

    #[test]
    fn distinct_keys_have_distinct_thumbprints() {
        assert_ne!(test_key().jwk_thumbprint(), test_key().jwk_thumbprint());
    }

    #[test]
    fn spki_round_trips() {
        let key = test_key();
        let reparsed = AccountKey::from_spki_der(key.spki_der()).unwrap();
        assert_eq!(key, reparsed);
        assert_eq!(key.digest(), reparsed.digest());
    }

    #[test]
    fn weak_keys_are_refused() {
        let good = test_key();
        let weak = test_key();

        let policy = KeyPolicy::with_weak_keys([weak.digest()]);
        assert!(policy.good_key(&good).is_ok());

        let err = policy.good_key(&weak).unwrap_err();
        assert!(err.is(crate::error::ErrorKind::Malformed));
    }
}
