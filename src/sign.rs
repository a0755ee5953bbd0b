// SPDX-License-Identifier: MIT OR Apache-2.0

//! Signing abstractions over the key types the engine can hold, and
//! generation/parsing of the underlying keypairs.

use crate::error::{self, Result};
use crate::schema::key::{Key, KeyVal};
use serde::{Deserialize, Serialize};
use serde_plain::{forward_display_to_serde, forward_from_str_to_serde};
use snafu::{ensure, OptionExt, ResultExt};
use ring::rand::SecureRandom;
use ring::signature::{EcdsaKeyPair, Ed25519KeyPair, KeyPair, RsaKeyPair};

/// The signing algorithms a keypair may use. ECDSA over P-256 is the
/// default for every generated key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyAlgorithm {
    /// ECDSA over the P-256 curve with SHA-256.
    Ecdsa,
    /// Ed25519.
    Ed25519,
    /// 2048-bit RSA with RSASSA-PSS-SHA256 signatures.
    Rsa,
}

forward_display_to_serde!(KeyAlgorithm);
forward_from_str_to_serde!(KeyAlgorithm);

/// This trait must be implemented for each type of key with which you will
/// sign things.
pub trait Sign: Send + Sync {
    /// Returns the public half in metadata form.
    fn tuf_key(&self) -> Key;

    /// Signs the supplied message.
    fn sign(&self, msg: &[u8], rng: &dyn SecureRandom) -> Result<Vec<u8>>;
}

impl Sign for EcdsaKeyPair {
    fn tuf_key(&self) -> Key {
        Key::Ecdsa {
            keyval: KeyVal::new(self.public_key().as_ref().to_vec()),
        }
    }

    fn sign(&self, msg: &[u8], rng: &dyn SecureRandom) -> Result<Vec<u8>> {
        let sig = EcdsaKeyPair::sign(self, rng, msg).context(error::SignSnafu)?;
        Ok(sig.as_ref().to_vec())
    }
}

impl Sign for Ed25519KeyPair {
    fn tuf_key(&self) -> Key {
        Key::Ed25519 {
            keyval: KeyVal::new(self.public_key().as_ref().to_vec()),
        }
    }

    fn sign(&self, msg: &[u8], _rng: &dyn SecureRandom) -> Result<Vec<u8>> {
        Ok(Ed25519KeyPair::sign(self, msg).as_ref().to_vec())
    }
}

impl Sign for RsaKeyPair {
    fn tuf_key(&self) -> Key {
        Key::Rsa {
            keyval: KeyVal::new(self.public_key().as_ref().to_vec()),
        }
    }

    fn sign(&self, msg: &[u8], rng: &dyn SecureRandom) -> Result<Vec<u8>> {
        let mut signature = vec![0; self.public_modulus_len()];
        RsaKeyPair::sign(
            self,
            &ring::signature::RSA_PSS_SHA256,
            rng,
            msg,
            &mut signature,
        )
        .context(error::SignSnafu)?;
        Ok(signature)
    }
}

/// Generates a fresh keypair and returns it as PKCS#8 DER.
///
/// RSA generation goes through openssl because ring does not generate RSA
/// keys.
pub(crate) fn generate(algorithm: KeyAlgorithm, rng: &dyn SecureRandom) -> Result<Vec<u8>> {
    match algorithm {
        KeyAlgorithm::Ecdsa => Ok(EcdsaKeyPair::generate_pkcs8(
            &ring::signature::ECDSA_P256_SHA256_FIXED_SIGNING,
            rng,
        )
        .ok()
        .context(error::KeyGenerationSnafu { algorithm: "ecdsa" })?
        .as_ref()
        .to_vec()),
        KeyAlgorithm::Ed25519 => Ok(Ed25519KeyPair::generate_pkcs8(rng)
            .ok()
            .context(error::KeyGenerationSnafu {
                algorithm: "ed25519",
            })?
            .as_ref()
            .to_vec()),
        KeyAlgorithm::Rsa => {
            let rsa = openssl::rsa::Rsa::generate(2048).context(error::CertificateSnafu {
                context: "generating an RSA key",
            })?;
            let pkey =
                openssl::pkey::PKey::from_rsa(rsa).context(error::CertificateSnafu {
                    context: "wrapping an RSA key",
                })?;
            let pem = pkey
                .private_key_to_pem_pkcs8()
                .context(error::CertificateSnafu {
                    context: "encoding an RSA key",
                })?;
            let parsed = pem::parse(pem).ok().context(error::KeyUnrecognizedSnafu)?;
            Ok(parsed.contents)
        }
    }
}

/// Parses a PKCS#8 keypair of a known algorithm and returns an object that
/// implements the [`Sign`] trait.
pub(crate) fn parse_keypair(algorithm: KeyAlgorithm, pkcs8: &[u8]) -> Result<Box<dyn Sign>> {
    match algorithm {
        KeyAlgorithm::Ecdsa => {
            let pair =
                EcdsaKeyPair::from_pkcs8(&ring::signature::ECDSA_P256_SHA256_FIXED_SIGNING, pkcs8)
                    .context(error::KeyRejectedSnafu)?;
            Ok(Box::new(pair))
        }
        KeyAlgorithm::Ed25519 => {
            let pair = Ed25519KeyPair::from_pkcs8(pkcs8).context(error::KeyRejectedSnafu)?;
            Ok(Box::new(pair))
        }
        KeyAlgorithm::Rsa => {
            let pair = RsaKeyPair::from_pkcs8(pkcs8).context(error::KeyRejectedSnafu)?;
            Ok(Box::new(pair))
        }
    }
}

/// Parses a PEM-encoded private key, recognizing the PKCS#8 tag.
#[allow(dead_code)]
pub(crate) fn parse_pem_keypair(algorithm: KeyAlgorithm, data: &[u8]) -> Result<Box<dyn Sign>> {
    let pem = pem::parse(data).ok().context(error::KeyUnrecognizedSnafu)?;
    ensure!(pem.tag == "PRIVATE KEY", error::KeyUnrecognizedSnafu);
    parse_keypair(algorithm, &pem.contents)
}
