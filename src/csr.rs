//! CSR verification and the post-signing certificate/CSR comparison.

use der::{
    asn1::{ObjectIdentifier, PrintableStringRef, Utf8StringRef},
    time::PrimitiveDateTime,
    Decode as _, Encode as _,
};
use ecdsa::signature::Verifier as _;
use pkcs8::DecodePublicKey as _;
use sha2::{Digest as _, Sha256};
use time::{Duration, OffsetDateTime};
use x509_cert::{
    ext::pkix::{name::GeneralName, BasicConstraints, ExtendedKeyUsage, SubjectAltName},
    ext::Extension,
    name::Name,
    request::CertReq,
    Certificate,
};

use crate::{
    error::Error,
    interfaces::PolicyOracle,
    key::{AccountKey, KeyPolicy},
    objects::{unique_lower_names, Identifier},
};

/// PKCS#9 extensionRequest.
const OID_EXTENSION_REQUEST: ObjectIdentifier =
    ObjectIdentifier::new_unwrap("1.2.840.113549.1.9.14");
const OID_SUBJECT_ALT_NAME: ObjectIdentifier = ObjectIdentifier::new_unwrap("2.5.29.17");
const OID_BASIC_CONSTRAINTS: ObjectIdentifier = ObjectIdentifier::new_unwrap("2.5.29.19");
const OID_EXT_KEY_USAGE: ObjectIdentifier = ObjectIdentifier::new_unwrap("2.5.29.37");
const OID_COMMON_NAME: ObjectIdentifier = ObjectIdentifier::new_unwrap("2.5.4.3");

pub(crate) const OID_KP_SERVER_AUTH: ObjectIdentifier =
    ObjectIdentifier::new_unwrap("1.3.6.1.5.5.7.3.1");
pub(crate) const OID_KP_CLIENT_AUTH: ObjectIdentifier =
    ObjectIdentifier::new_unwrap("1.3.6.1.5.5.7.3.2");

/// Maximum age of a freshly issued certificate's NotBefore.
const MAX_BACKDATE: Duration = Duration::hours(24);

/// Subject material extracted from a CSR or certificate SAN list.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubjectNames {
    pub common_name: Option<String>,
    pub dns_names: Vec<String>,
    pub ip_addresses: Vec<Vec<u8>>,
    pub email_addresses: Vec<String>,
}

impl SubjectNames {
    /// All hostnames covered: the SAN DNS entries plus the CN when present,
    /// lowercased, deduplicated, and sorted.
    pub fn hostnames(&self) -> Vec<String> {
        let mut names = self.dns_names.clone();
        if let Some(cn) = &self.common_name {
            names.push(cn.clone());
        }
        unique_lower_names(&names)
    }

    fn from_parts(common_name: Option<String>, entries: &[GeneralName]) -> Self {
        let mut subject = SubjectNames {
            common_name,
            ..SubjectNames::default()
        };
        for entry in entries {
            match entry {
                GeneralName::DnsName(name) => subject.dns_names.push(name.to_string()),
                GeneralName::Rfc822Name(name) => subject.email_addresses.push(name.to_string()),
                GeneralName::IpAddress(octets) => {
                    subject.ip_addresses.push(octets.as_bytes().to_vec());
                }
                _ => {}
            }
        }
        subject.ip_addresses.sort();
        subject.email_addresses.sort();
        subject
    }
}

/// Extracts the CN and SAN entries requested by a CSR.
pub fn csr_subject(csr: &CertReq) -> Result<SubjectNames, Error> {
    let san = csr_san_entries(csr)?;
    Ok(SubjectNames::from_parts(
        common_name(&csr.info.subject)?,
        &san,
    ))
}

fn csr_san_entries(csr: &CertReq) -> Result<Vec<GeneralName>, Error> {
    for attr in csr.info.attributes.iter() {
        if attr.oid != OID_EXTENSION_REQUEST {
            continue;
        }
        for value in attr.values.iter() {
            let extensions: Vec<Extension> = value
                .decode_as()
                .map_err(|err| Error::malformed(format!("invalid extensionRequest: {err}")))?;
            for ext in extensions {
                if ext.extn_id == OID_SUBJECT_ALT_NAME {
                    let san = SubjectAltName::from_der(ext.extn_value.as_bytes())
                        .map_err(|err| Error::malformed(format!("invalid SAN: {err}")))?;
                    return Ok(san.0);
                }
            }
        }
    }
    Ok(Vec::new())
}

fn common_name(name: &Name) -> Result<Option<String>, Error> {
    for rdn in &name.0 {
        for atv in rdn.0.iter() {
            if atv.oid != OID_COMMON_NAME {
                continue;
            }
            if let Ok(s) = atv.value.decode_as::<Utf8StringRef<'_>>() {
                return Ok(Some(s.to_string()));
            }
            if let Ok(s) = atv.value.decode_as::<PrintableStringRef<'_>>() {
                return Ok(Some(s.to_string()));
            }
            return Err(Error::malformed("unsupported commonName encoding"));
        }
    }
    Ok(None)
}

/// Structural verification of a CSR before any issuance work.
///
/// Checks the embedded key against policy, verifies the CSR's own signature,
/// enforces the name-count ceiling, and asks the policy oracle whether we are
/// willing to issue for every covered name. Returns the normalized hostname
/// list.
pub fn verify_csr(
    csr: &CertReq,
    max_names: usize,
    key_policy: &KeyPolicy,
    policy: &dyn PolicyOracle,
) -> Result<Vec<String>, Error> {
    let key = csr_public_key(csr)?;
    key_policy.good_key(&key)?;

    verify_csr_signature(csr, &key)?;

    let names = csr_subject(csr)?.hostnames();
    if names.is_empty() {
        return Err(Error::malformed("CSR has no names in it"));
    }
    if max_names > 0 && names.len() > max_names {
        return Err(Error::malformed(format!(
            "CSR contains more than {max_names} DNS names",
        )));
    }

    for name in &names {
        // Surfaced verbatim: the rejection reason is the policy's to state.
        policy.willing_to_issue(&Identifier::dns(name.clone()))?;
    }

    Ok(names)
}

/// The public key a CSR asks to certify.
pub fn csr_public_key(csr: &CertReq) -> Result<AccountKey, Error> {
    let spki_der = csr
        .info
        .public_key
        .to_der()
        .map_err(|err| Error::malformed(format!("invalid CSR public key: {err}")))?;
    AccountKey::from_spki_der(&spki_der)
}

fn verify_csr_signature(csr: &CertReq, key: &AccountKey) -> Result<(), Error> {
    let verifying_key = p256::ecdsa::VerifyingKey::from_public_key_der(key.spki_der())
        .map_err(|err| Error::malformed(format!("invalid CSR public key: {err}")))?;

    let message = csr
        .info
        .to_der()
        .map_err(|err| Error::malformed(format!("unencodable CSR body: {err}")))?;
    let signature = p256::ecdsa::DerSignature::try_from(csr.signature.raw_bytes())
        .map_err(|err| Error::malformed(format!("invalid CSR signature: {err}")))?;

    verifying_key
        .verify(&message, &signature)
        .map_err(|_| Error::malformed("CSR signature does not verify"))
}

/// Compares an issued certificate against the CSR that requested it.
///
/// The signer is trusted, but a silent mismatch here would be an
/// issuance-integrity bug, so every discrepancy is an internal server error.
/// Verified: public key, CN, SAN/IP/email lists, NotBefore recency, basic
/// constraints with the CA flag off, and the extended key usage set.
pub fn matches_csr(
    cert: &Certificate,
    csr: &CertReq,
    now: OffsetDateTime,
    force_cn_from_san: bool,
) -> Result<(), Error> {
    let requested = csr_subject(csr)?;
    let issued = cert_subject(cert)?;

    let cert_spki = cert
        .tbs_certificate
        .subject_public_key_info
        .to_der()
        .map_err(|err| Error::server_internal(format!("unencodable certificate SPKI: {err}")))?;
    let csr_spki = csr
        .info
        .public_key
        .to_der()
        .map_err(|err| Error::server_internal(format!("unencodable CSR SPKI: {err}")))?;
    if Sha256::digest(&cert_spki) != Sha256::digest(&csr_spki) {
        return Err(Error::server_internal(
            "generated certificate public key doesn't match CSR public key",
        ));
    }

    if !force_cn_from_san {
        if let Some(csr_cn) = &requested.common_name {
            if issued.common_name.as_deref() != Some(csr_cn.to_lowercase().as_str()) {
                return Err(Error::server_internal(
                    "generated certificate CommonName doesn't match CSR CommonName",
                ));
            }
        }
    }

    if unique_lower_names(&issued.dns_names) != requested.hostnames() {
        return Err(Error::server_internal(
            "generated certificate DNSNames don't match CSR DNSNames",
        ));
    }
    if issued.ip_addresses != requested.ip_addresses {
        return Err(Error::server_internal(
            "generated certificate IPAddresses don't match CSR IPAddresses",
        ));
    }
    if issued.email_addresses != requested.email_addresses {
        return Err(Error::server_internal(
            "generated certificate EmailAddresses don't match CSR EmailAddresses",
        ));
    }

    let not_before = cert_not_before(cert)?;
    if now - not_before > MAX_BACKDATE {
        return Err(Error::server_internal(format!(
            "generated certificate is back dated {}",
            now - not_before,
        )));
    }

    let constraints = cert_extension::<BasicConstraints>(cert, OID_BASIC_CONSTRAINTS)?
        .ok_or_else(|| {
            Error::server_internal("generated certificate doesn't have basic constraints set")
        })?;
    if constraints.ca {
        return Err(Error::server_internal(
            "generated certificate can sign other certificates",
        ));
    }

    let eku = cert_extension::<ExtendedKeyUsage>(cert, OID_EXT_KEY_USAGE)?.ok_or_else(|| {
        Error::server_internal("generated certificate doesn't have correct key usage extensions")
    })?;
    let mut purposes = eku.0;
    purposes.sort();
    let mut wanted = vec![OID_KP_SERVER_AUTH, OID_KP_CLIENT_AUTH];
    wanted.sort();
    if purposes != wanted {
        return Err(Error::server_internal(
            "generated certificate doesn't have correct key usage extensions",
        ));
    }

    Ok(())
}

fn cert_subject(cert: &Certificate) -> Result<SubjectNames, Error> {
    let san = cert_extension::<SubjectAltName>(cert, OID_SUBJECT_ALT_NAME)?
        .map(|san| san.0)
        .unwrap_or_default();
    Ok(SubjectNames::from_parts(
        common_name(&cert.tbs_certificate.subject)?,
        &san,
    ))
}

fn cert_extension<T: for<'a> der::Decode<'a>>(
    cert: &Certificate,
    oid: ObjectIdentifier,
) -> Result<Option<T>, Error> {
    let Some(extensions) = &cert.tbs_certificate.extensions else {
        return Ok(None);
    };
    for ext in extensions {
        if ext.extn_id == oid {
            let parsed = T::from_der(ext.extn_value.as_bytes()).map_err(|err| {
                Error::server_internal(format!("unparseable certificate extension {oid}: {err}"))
            })?;
            return Ok(Some(parsed));
        }
    }
    Ok(None)
}

fn cert_not_before(cert: &Certificate) -> Result<OffsetDateTime, Error> {
    let not_before = cert.tbs_certificate.validity.not_before.to_date_time();
    let not_before = PrimitiveDateTime::try_from(not_before)
        .map_err(|err| Error::server_internal(format!("unrepresentable NotBefore: {err}")))?;
    Ok(not_before.assume_utc())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        key::create_p256_key,
        test::{create_csr, TestPolicy},
    };

    #[test]
    fn subject_includes_cn_and_san() {
        let signer = create_p256_key();
        let csr = create_csr(&signer, &["EXAMPLE.com", "www.example.com"]);

        let subject = csr_subject(&csr).unwrap();
        assert_eq!(subject.common_name.as_deref(), Some("EXAMPLE.com"));
        assert_eq!(
            subject.hostnames(),
            vec!["example.com".to_owned(), "www.example.com".to_owned()],
        );
    }

    #[test]
    fn verify_csr_accepts_self_consistent_request() {
        let signer = create_p256_key();
        let csr = create_csr(&signer, &["example.com"]);

        let names = verify_csr(&csr, 100, &KeyPolicy::new(), &TestPolicy::default()).unwrap();
        assert_eq!(names, vec!["example.com".to_owned()]);
    }

    #[test]
    fn verify_csr_rejects_tampered_signature() {
        let signer = create_p256_key();
        let mut csr = create_csr(&signer, &["example.com"]);

        // graft on a subject from a different request
        let other = create_csr(&create_p256_key(), &["other.example"]);
        csr.info = other.info;

        let err = verify_csr(&csr, 100, &KeyPolicy::new(), &TestPolicy::default()).unwrap_err();
        assert!(err.is(crate::error::ErrorKind::Malformed));
    }

    #[test]
    fn verify_csr_enforces_name_ceiling() {
        let signer = create_p256_key();
        let csr = create_csr(&signer, &["a.example.com", "b.example.com", "c.example.com"]);

        let err = verify_csr(&csr, 2, &KeyPolicy::new(), &TestPolicy::default()).unwrap_err();
        assert!(err.is(crate::error::ErrorKind::Malformed));
    }

    #[test]
    fn verify_csr_consults_policy_per_name() {
        let signer = create_p256_key();
        let csr = create_csr(&signer, &["blocked.example"]);

        let policy = TestPolicy::default().blocking("blocked.example");
        let err = verify_csr(&csr, 100, &KeyPolicy::new(), &policy).unwrap_err();
        assert!(err.is(crate::error::ErrorKind::Unauthorized));
    }
}
