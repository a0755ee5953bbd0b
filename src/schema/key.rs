// SPDX-License-Identifier: MIT OR Apache-2.0

//! Provides the public key object embedded in signed metadata.

use crate::schema::decoded::{Base64, Decoded, Hex};
use crate::schema::error::{self, Result};
use olpc_cjson::CanonicalFormatter;
use openssl::bn::BigNumContext;
use openssl::ec::PointConversionForm;
use openssl::x509::X509;
use ring::digest::{digest, SHA256};
use ring::signature::UnparsedPublicKey;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use snafu::{OptionExt, ResultExt};
use std::collections::HashMap;

/// A public key as it appears in the `keys` maps of root and delegating
/// targets metadata.
///
/// The `-x509` variants carry a PEM-encoded X.509 certificate instead of a
/// bare key; they are used for the root role so that root metadata is
/// anchored in a certificate a [`crate::CertManager`] can pin. Verifiers
/// extract the subject public key from the certificate before checking
/// signatures.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(tag = "keytype")]
pub enum Key {
    /// An ECDSA key over the P-256 curve, stored as an uncompressed point.
    #[serde(rename = "ecdsa")]
    Ecdsa {
        /// The public key.
        keyval: KeyVal,
    },
    /// An ECDSA key wrapped in an X.509 certificate.
    #[serde(rename = "ecdsa-x509")]
    EcdsaX509 {
        /// The PEM-encoded certificate.
        keyval: KeyVal,
    },
    /// An Ed25519 key.
    #[serde(rename = "ed25519")]
    Ed25519 {
        /// The public key.
        keyval: KeyVal,
    },
    /// An RSA key, stored as PKCS#1 DER. Signatures use RSASSA-PSS-SHA256.
    #[serde(rename = "rsa")]
    Rsa {
        /// The public key.
        keyval: KeyVal,
    },
    /// An RSA key wrapped in an X.509 certificate.
    #[serde(rename = "rsa-x509")]
    RsaX509 {
        /// The PEM-encoded certificate.
        keyval: KeyVal,
    },
}

/// The value of a public key: base64-encoded key material.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct KeyVal {
    /// The public key material. Its exact format depends on the key type.
    pub public: Decoded<Base64>,

    /// Extra arguments found during deserialization, preserved so that
    /// signatures over this object still verify.
    #[serde(flatten)]
    pub _extra: HashMap<String, Value>,
}

impl KeyVal {
    /// Wrap raw public key material.
    pub fn new(public: Vec<u8>) -> Self {
        Self {
            public: public.into(),
            _extra: HashMap::new(),
        }
    }
}

impl Key {
    /// The key ID: the hex-encoded SHA-256 digest of this key's canonical
    /// JSON form.
    pub fn key_id(&self) -> Result<Decoded<Hex>> {
        let mut buf = Vec::new();
        let mut ser = serde_json::Serializer::with_formatter(&mut buf, CanonicalFormatter::new());
        self.serialize(&mut ser)
            .context(error::JsonSerializationSnafu { what: "key" })?;
        Ok(digest(&SHA256, &buf).as_ref().to_vec().into())
    }

    /// The signature method produced by the corresponding private key.
    pub fn method(&self) -> &'static str {
        match self {
            Key::Ecdsa { .. } | Key::EcdsaX509 { .. } => "ecdsa",
            Key::Ed25519 { .. } => "ed25519",
            Key::Rsa { .. } | Key::RsaX509 { .. } => "rsapss",
        }
    }

    /// Verifies `sig` over `msg`, returning `false` for invalid signatures
    /// or key material we cannot parse.
    pub fn verify(&self, msg: &[u8], sig: &[u8]) -> bool {
        let (alg, public): (&'static dyn ring::signature::VerificationAlgorithm, Vec<u8>) =
            match self {
                Key::Ecdsa { keyval } => (
                    &ring::signature::ECDSA_P256_SHA256_FIXED,
                    keyval.public.to_vec(),
                ),
                Key::Ed25519 { keyval } => (&ring::signature::ED25519, keyval.public.to_vec()),
                Key::Rsa { keyval } => (
                    &ring::signature::RSA_PSS_2048_8192_SHA256,
                    keyval.public.to_vec(),
                ),
                Key::EcdsaX509 { keyval } => match certificate_key_bytes(&keyval.public) {
                    Ok(bytes) => (&ring::signature::ECDSA_P256_SHA256_FIXED, bytes),
                    Err(_) => return false,
                },
                Key::RsaX509 { keyval } => match certificate_key_bytes(&keyval.public) {
                    Ok(bytes) => (&ring::signature::RSA_PSS_2048_8192_SHA256, bytes),
                    Err(_) => return false,
                },
            };
        UnparsedPublicKey::new(alg, &public).verify(msg, sig).is_ok()
    }

    /// The PEM-encoded certificate for `-x509` keys, `None` otherwise.
    pub fn certificate_pem(&self) -> Option<&[u8]> {
        match self {
            Key::EcdsaX509 { keyval } | Key::RsaX509 { keyval } => Some(&keyval.public),
            _ => None,
        }
    }
}

/// Extracts raw public key bytes from a PEM certificate: the uncompressed
/// EC point for ECDSA keys, PKCS#1 DER for RSA keys.
pub(crate) fn certificate_key_bytes(pem: &[u8]) -> Result<Vec<u8>> {
    let cert = X509::from_pem(pem).context(error::CertificateParseSnafu)?;
    let pkey = cert.public_key().context(error::CertificateParseSnafu)?;
    if let Ok(ec) = pkey.ec_key() {
        let mut ctx = BigNumContext::new().context(error::CertificateParseSnafu)?;
        return ec
            .public_key()
            .to_bytes(ec.group(), PointConversionForm::UNCOMPRESSED, &mut ctx)
            .context(error::CertificateParseSnafu);
    }
    if let Ok(rsa) = pkey.rsa() {
        return rsa
            .public_key_to_der_pkcs1()
            .context(error::CertificateParseSnafu);
    }
    None.context(error::CertificateKeyTypeSnafu)
}

#[cfg(test)]
mod tests {
    use super::{Key, KeyVal};

    #[test]
    fn key_id_is_stable() {
        let key = Key::Ed25519 {
            keyval: KeyVal::new(vec![0xab; 32]),
        };
        let first = key.key_id().unwrap();
        let second = key.key_id().unwrap();
        assert_eq!(first, second);
        assert_eq!(first.as_ref().len(), 32);
    }

    #[test]
    fn key_ids_differ_by_type() {
        let ed = Key::Ed25519 {
            keyval: KeyVal::new(vec![0xab; 32]),
        };
        let ec = Key::Ecdsa {
            keyval: KeyVal::new(vec![0xab; 32]),
        };
        assert_ne!(ed.key_id().unwrap(), ec.key_id().unwrap());
    }

    #[test]
    fn wire_form_uses_keytype_tag() {
        let key = Key::Ecdsa {
            keyval: KeyVal::new(b"point".to_vec()),
        };
        let json = serde_json::to_value(&key).unwrap();
        assert_eq!(json["keytype"], "ecdsa");
        assert_eq!(json["keyval"]["public"], base64::encode(b"point"));
    }
}
