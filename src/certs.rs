// SPDX-License-Identifier: MIT OR Apache-2.0

//! Provides the `CertManager`, the X.509 trust anchor store. Root metadata
//! embeds a certificate for its GUN; the manager pins that certificate on
//! first contact and requires later roots to validate against a pinned
//! certificate.

use crate::error::{self, Result};
use crate::schema::{RoleType, Role, Root, Signed};
use chrono::Utc;
use log::debug;
use openssl::asn1::Asn1Time;
use openssl::bn::{BigNum, MsbOption};
use openssl::hash::MessageDigest;
use openssl::nid::Nid;
use openssl::pkey::PKey;
use openssl::x509::extension::{BasicConstraints, KeyUsage};
use openssl::x509::{X509Builder, X509NameBuilder, X509};
use ring::digest::{digest, SHA256};
use snafu::{ensure, OptionExt, ResultExt};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

// X.509 certificate parameters. The serial is a random 159-bit positive
// integer per RFC 5280's 20-octet limit; version value 2 means X.509 v3.
const CERTIFICATE_VERSION: i32 = 2;
const SERIAL_NUMBER_BITS: i32 = 159;

/// Days a generated GUN certificate stays valid: ten years.
pub const CERTIFICATE_VALIDITY_DAYS: u32 = 3650;

/// Stores trusted certificates for GUNs and validates fetched root
/// metadata against them.
#[derive(Debug, Clone)]
pub struct CertManager {
    trust_dir: PathBuf,
}

impl CertManager {
    /// Opens (creating if needed) the trusted certificate store under
    /// `<base_dir>/trusted_certificates`.
    pub fn new<P: AsRef<Path>>(base_dir: P) -> Result<Self> {
        let trust_dir = base_dir.as_ref().join("trusted_certificates");
        std::fs::create_dir_all(&trust_dir)
            .context(error::DirCreateSnafu { path: &trust_dir })?;
        Ok(Self { trust_dir })
    }

    /// Adds a PEM certificate to the trusted store, named by fingerprint.
    pub fn add_trusted_cert(&self, pem: &[u8]) -> Result<()> {
        let cert = X509::from_pem(pem).context(error::CertificateSnafu {
            context: "parsing a certificate to trust",
        })?;
        let path = self.trust_dir.join(format!("{}.crt", fingerprint(&cert)?));
        debug!("pinning certificate '{}'", path.display());
        std::fs::write(&path, pem).context(error::FileWriteSnafu { path })
    }

    /// All trusted certificates whose subject common name is `gun`.
    pub fn get_certificates_by_cn(&self, gun: &str) -> Result<Vec<X509>> {
        Ok(self
            .cert_files()?
            .into_iter()
            .filter(|(cert, _)| common_name(cert).as_deref() == Some(gun))
            .map(|(cert, _)| cert)
            .collect())
    }

    /// Removes every pinned certificate.
    pub fn remove_all(&self) -> Result<()> {
        for (_, path) in self.cert_files()? {
            std::fs::remove_file(&path).context(error::FileRemoveSnafu { path })?;
        }
        Ok(())
    }

    /// Removes the pinned certificates for one GUN.
    pub fn remove_by_cn(&self, gun: &str) -> Result<()> {
        for (cert, path) in self.cert_files()? {
            if common_name(&cert).as_deref() == Some(gun) {
                debug!("removing pinned certificate '{}'", path.display());
                std::fs::remove_file(&path).context(error::FileRemoveSnafu { path })?;
            }
        }
        Ok(())
    }

    fn cert_files(&self) -> Result<Vec<(X509, PathBuf)>> {
        let entries = match std::fs::read_dir(&self.trust_dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => {
                return Err(err).context(error::DirReadSnafu { path: &self.trust_dir })
            }
        };
        let mut found = Vec::new();
        for entry in entries {
            let path = entry
                .context(error::DirReadSnafu { path: &self.trust_dir })?
                .path();
            if path.extension().map_or(true, |ext| ext != "crt") {
                continue;
            }
            let pem = std::fs::read(&path).context(error::FileReadSnafu { path: &path })?;
            let cert = X509::from_pem(&pem).context(error::CertificateSnafu {
                context: "parsing a pinned certificate",
            })?;
            found.push((cert, path));
        }
        Ok(found)
    }

    /// Validates fetched root metadata for `gun`.
    ///
    /// The root role's key set must contain at least one X.509 certificate
    /// whose common name is the GUN and whose validity window covers now.
    /// If certificates are already pinned for the GUN, a signature by one of
    /// them must verify. Otherwise the root must be self-consistent (meet
    /// its own declared threshold with its embedded certificates) and the
    /// embedded certificates are pinned for future contacts.
    pub fn validate_root(&self, signed_root: &Signed<Root>, gun: &str) -> Result<()> {
        let root = &signed_root.signed;
        let message = root.canonical_form().context(error::SchemaSnafu)?;
        let record = root
            .roles
            .get(&RoleType::Root)
            .context(error::BadHierarchySnafu {
                reason: "root metadata has no root role record",
            })?;

        // The certificates declared by the root role itself, keyed by the
        // key ID that signatures will reference.
        let mut root_certs = Vec::new();
        for keyid in &record.keyids {
            let Some(key) = root.keys.get(keyid) else {
                continue;
            };
            let Some(pem) = key.certificate_pem() else {
                continue;
            };
            let cert = X509::from_pem(pem).context(error::CertificateSnafu {
                context: "parsing a root certificate",
            })?;
            if common_name(&cert).as_deref() != Some(gun) {
                continue;
            }
            if !validity_covers_now(&cert) {
                continue;
            }
            root_certs.push((keyid.clone(), key.clone(), cert, pem.to_vec()));
        }
        ensure!(!root_certs.is_empty(), error::NoCertificatesFoundSnafu { gun });

        let trusted = self.get_certificates_by_cn(gun)?;
        if !trusted.is_empty() {
            let trusted_prints = trusted
                .iter()
                .map(fingerprint)
                .collect::<Result<Vec<_>>>()?;
            for sig in &signed_root.signatures {
                if let Some((_, key, cert, _)) =
                    root_certs.iter().find(|(keyid, ..)| *keyid == sig.keyid)
                {
                    if trusted_prints.contains(&fingerprint(cert)?)
                        && key.verify(&message, &sig.sig)
                    {
                        return Ok(());
                    }
                }
            }
            return error::RootValidationFailSnafu {
                gun,
                reason: "no signature chains to a pinned certificate",
            }
            .fail();
        }

        // First contact: require the root to satisfy its own threshold with
        // the embedded certificates, then pin them.
        let mut verified = 0;
        let mut seen = Vec::new();
        for sig in &signed_root.signatures {
            if seen.contains(&sig.keyid) {
                continue;
            }
            if let Some((_, key, ..)) = root_certs.iter().find(|(keyid, ..)| *keyid == sig.keyid) {
                if key.verify(&message, &sig.sig) {
                    verified += 1;
                    seen.push(sig.keyid.clone());
                }
            }
        }
        ensure!(
            verified as u64 >= record.threshold,
            error::RootValidationFailSnafu {
                gun,
                reason: "root is not signed by its own declared certificates",
            }
        );
        for (.., pem) in &root_certs {
            self.add_trusted_cert(pem)?;
        }
        Ok(())
    }
}

/// The hex SHA-256 fingerprint of a certificate's DER form.
pub(crate) fn fingerprint(cert: &X509) -> Result<String> {
    let der = cert.to_der().context(error::CertificateSnafu {
        context: "encoding a certificate",
    })?;
    Ok(hex::encode(digest(&SHA256, &der)))
}

fn common_name(cert: &X509) -> Option<String> {
    cert.subject_name()
        .entries_by_nid(Nid::COMMONNAME)
        .next()
        .and_then(|entry| entry.data().as_utf8().ok())
        .map(|s| s.to_string())
}

fn validity_covers_now(cert: &X509) -> bool {
    use std::cmp::Ordering;
    let now = match Asn1Time::days_from_now(0) {
        Ok(now) => now,
        Err(_) => return false,
    };
    let started = cert
        .not_before()
        .compare(&now)
        .map_or(false, |ord| ord != Ordering::Greater);
    let unexpired = cert
        .not_after()
        .compare(&now)
        .map_or(false, |ord| ord != Ordering::Less);
    started && unexpired
}

/// Generates a self-signed X.509 certificate binding `gun` to the given
/// private key, valid for [`CERTIFICATE_VALIDITY_DAYS`] starting now.
/// Returns the certificate as PEM.
pub(crate) fn generate_certificate(pkcs8: &[u8], gun: &str) -> Result<Vec<u8>> {
    let pkey = PKey::private_key_from_pkcs8(pkcs8).context(error::CertificateSnafu {
        context: "loading the root private key",
    })?;

    let mut name = X509NameBuilder::new().context(error::CertificateSnafu {
        context: "building the certificate name",
    })?;
    name.append_entry_by_nid(Nid::COMMONNAME, gun)
        .context(error::CertificateSnafu {
            context: "setting the certificate common name",
        })?;
    let name = name.build();

    let mut builder = X509Builder::new().context(error::CertificateSnafu {
        context: "creating the certificate builder",
    })?;
    let context = "building the certificate";
    builder
        .set_version(CERTIFICATE_VERSION)
        .context(error::CertificateSnafu { context })?;
    let mut serial = BigNum::new().context(error::CertificateSnafu { context })?;
    serial
        .rand(SERIAL_NUMBER_BITS, MsbOption::MAYBE_ZERO, false)
        .context(error::CertificateSnafu { context })?;
    let serial = serial
        .to_asn1_integer()
        .context(error::CertificateSnafu { context })?;
    builder
        .set_serial_number(&serial)
        .context(error::CertificateSnafu { context })?;
    builder
        .set_subject_name(&name)
        .context(error::CertificateSnafu { context })?;
    builder
        .set_issuer_name(&name)
        .context(error::CertificateSnafu { context })?;
    builder
        .set_pubkey(&pkey)
        .context(error::CertificateSnafu { context })?;
    let not_before = Asn1Time::days_from_now(0).context(error::CertificateSnafu { context })?;
    let not_after = Asn1Time::days_from_now(CERTIFICATE_VALIDITY_DAYS)
        .context(error::CertificateSnafu { context })?;
    builder
        .set_not_before(&not_before)
        .context(error::CertificateSnafu { context })?;
    builder
        .set_not_after(&not_after)
        .context(error::CertificateSnafu { context })?;
    builder
        .append_extension(
            BasicConstraints::new()
                .critical()
                .ca()
                .build()
                .context(error::CertificateSnafu { context })?,
        )
        .context(error::CertificateSnafu { context })?;
    builder
        .append_extension(
            KeyUsage::new()
                .critical()
                .digital_signature()
                .key_cert_sign()
                .build()
                .context(error::CertificateSnafu { context })?,
        )
        .context(error::CertificateSnafu { context })?;
    builder
        .sign(&pkey, MessageDigest::sha256())
        .context(error::CertificateSnafu {
            context: "signing the certificate",
        })?;

    builder
        .build()
        .to_pem()
        .context(error::CertificateSnafu {
            context: "encoding the certificate",
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::KeyAlgorithm;
    use crate::schema::key::{certificate_key_bytes, Key, KeyVal};
    use crate::sign::Sign;
    use crate::schema::{RoleKeys, Root, Signature, Signed};
    use ring::rand::SystemRandom;
    use std::collections::HashMap;

    const GUN: &str = "example.com/app";

    /// A root signed by a fresh keypair whose X.509 certificate is embedded
    /// as the root key, the way `initialize` builds one.
    fn root_with_cert() -> Signed<Root> {
        let rng = SystemRandom::new();
        let pkcs8 = crate::sign::generate(KeyAlgorithm::Ecdsa, &rng).unwrap();
        let pair = crate::sign::parse_keypair(KeyAlgorithm::Ecdsa, &pkcs8).unwrap();
        let pem = generate_certificate(&pkcs8, GUN).unwrap();
        let root_key = Key::EcdsaX509 {
            keyval: KeyVal::new(pem),
        };
        let keyid = root_key.key_id().unwrap();

        let mut keys = HashMap::new();
        keys.insert(keyid.clone(), root_key);
        let mut roles = HashMap::new();
        roles.insert(RoleType::Root, RoleKeys::new(vec![keyid.clone()], 1));
        let root = Root {
            version: 1,
            expires: Utc::now() + chrono::Duration::days(3650),
            keys,
            roles,
            _extra: HashMap::new(),
        };

        let message = root.canonical_form().unwrap();
        let sig = pair.sign(&message, &rng).unwrap();
        Signed {
            signed: root,
            signatures: vec![Signature {
                keyid,
                method: "ecdsa".to_string(),
                sig: sig.into(),
            }],
        }
    }

    #[test]
    fn generated_certificate_embeds_key() {
        let rng = SystemRandom::new();
        let pkcs8 = crate::sign::generate(KeyAlgorithm::Ecdsa, &rng).unwrap();
        let pair = crate::sign::parse_keypair(KeyAlgorithm::Ecdsa, &pkcs8).unwrap();
        let pem = generate_certificate(&pkcs8, GUN).unwrap();

        let embedded = certificate_key_bytes(&pem).unwrap();
        match pair.tuf_key() {
            Key::Ecdsa { keyval } => assert_eq!(embedded, keyval.public.to_vec()),
            other => panic!("unexpected key type {other:?}"),
        }
        let cert = X509::from_pem(&pem).unwrap();
        assert_eq!(common_name(&cert).as_deref(), Some(GUN));
        assert!(validity_covers_now(&cert));
    }

    #[test]
    fn first_contact_pins_certificate() {
        let dir = tempfile::tempdir().unwrap();
        let manager = CertManager::new(dir.path()).unwrap();
        let signed = root_with_cert();

        assert!(manager.get_certificates_by_cn(GUN).unwrap().is_empty());
        manager.validate_root(&signed, GUN).unwrap();
        assert_eq!(manager.get_certificates_by_cn(GUN).unwrap().len(), 1);

        // a second validation goes through the pinned path
        manager.validate_root(&signed, GUN).unwrap();
    }

    #[test]
    fn different_anchor_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let manager = CertManager::new(dir.path()).unwrap();
        manager.validate_root(&root_with_cert(), GUN).unwrap();

        // a freshly keyed root for the same GUN must not validate
        assert!(manager.validate_root(&root_with_cert(), GUN).is_err());
    }

    #[test]
    fn tampered_root_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let manager = CertManager::new(dir.path()).unwrap();
        let mut signed = root_with_cert();
        signed.signed.version = 7;
        assert!(manager.validate_root(&signed, GUN).is_err());
    }

    #[test]
    fn remove_by_cn_unpins() {
        let dir = tempfile::tempdir().unwrap();
        let manager = CertManager::new(dir.path()).unwrap();
        manager.validate_root(&root_with_cert(), GUN).unwrap();
        manager.remove_by_cn(GUN).unwrap();
        assert!(manager.get_certificates_by_cn(GUN).unwrap().is_empty());
    }
}
