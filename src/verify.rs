// SPDX-License-Identifier: MIT OR Apache-2.0

//! Signature, threshold, expiry and version checks for signed metadata.

use crate::error::{self, Result};
use crate::keydb::KeyDb;
use crate::schema::{Role, Signed};
use chrono::Utc;
use log::debug;
use serde::Serialize;
use snafu::{ensure, OptionExt, ResultExt};

/// Verifies that `signed` carries at least `threshold(role)` valid
/// signatures from distinct keys authorized for `role`.
pub(crate) fn verify_signatures<T>(signed: &Signed<T>, role: &str, keydb: &KeyDb) -> Result<()>
where
    T: Role + Serialize,
{
    let record = keydb
        .role(role)
        .context(error::NoSuchRoleSnafu { role })?;
    let message = signed.signed.canonical_form().context(error::SchemaSnafu)?;

    let mut verified = 0usize;
    let mut seen = Vec::new();
    for sig in &signed.signatures {
        if seen.contains(&&sig.keyid) {
            continue;
        }
        if !record.keyids.contains(&sig.keyid) {
            debug!("signature by key {} not authorized for {}", sig.keyid, role);
            continue;
        }
        let Some(key) = keydb.key(&sig.keyid) else {
            continue;
        };
        if key.verify(&message, &sig.sig) {
            verified += 1;
            seen.push(&sig.keyid);
        }
    }

    ensure!(
        verified as u64 >= record.threshold,
        error::VerificationFailSnafu {
            role,
            verified,
            threshold: record.threshold,
        }
    );
    Ok(())
}

/// Verifies signatures and rejects expired metadata.
pub(crate) fn verify_meta<T>(signed: &Signed<T>, role: &str, keydb: &KeyDb) -> Result<()>
where
    T: Role + Serialize,
{
    verify_signatures(signed, role, keydb)?;
    ensure!(
        signed.signed.expires() >= Utc::now(),
        error::ExpiredSnafu {
            role,
            expired_at: signed.signed.expires(),
        }
    );
    Ok(())
}

/// Rejects a fetched version lower than the version already trusted.
pub(crate) fn check_version(role: &str, fetched: u64, current: u64) -> Result<()> {
    ensure!(
        fetched >= current,
        error::LowVersionSnafu {
            role,
            fetched,
            current,
        }
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{CryptoService, KeyAlgorithm};
    use crate::keystore::MemoryKeyStore;
    use crate::schema::{FileMeta, RoleKeys, Signature, Timestamp};
    use crate::sign::Sign;
    use chrono::Duration;
    use std::collections::HashMap;

    fn signed_timestamp(
        service: &CryptoService,
        keydb: &KeyDb,
        expires: chrono::DateTime<Utc>,
    ) -> Signed<Timestamp> {
        let timestamp = Timestamp {
            version: 1,
            expires,
            meta: maplit::hashmap! {
                "snapshot".to_string() => FileMeta::from_bytes(b"snap"),
            },
            _extra: HashMap::new(),
        };
        let message = timestamp.canonical_form().unwrap();
        let record = keydb.role("timestamp").unwrap().clone();
        let keyid = record.keyids[0].clone();
        let (pair, _) = service.get_private_key(&hex::encode(&keyid)).unwrap();
        let rng = ring::rand::SystemRandom::new();
        let sig = pair.sign(&message, &rng).unwrap();
        Signed {
            signed: timestamp,
            signatures: vec![Signature {
                keyid,
                method: "ecdsa".to_string(),
                sig: sig.into(),
            }],
        }
    }

    fn service_and_db() -> (CryptoService, KeyDb) {
        let service = CryptoService::new("gun", vec![Box::new(MemoryKeyStore::new())]);
        let key = service.create("timestamp", KeyAlgorithm::Ecdsa).unwrap();
        let mut keydb = KeyDb::new();
        let keyid = keydb.add_key(key).unwrap();
        keydb
            .add_role("timestamp", RoleKeys::new(vec![keyid], 1))
            .unwrap();
        (service, keydb)
    }

    #[test]
    fn valid_signature_passes() {
        let (service, keydb) = service_and_db();
        let signed = signed_timestamp(&service, &keydb, Utc::now() + Duration::days(14));
        verify_meta(&signed, "timestamp", &keydb).unwrap();
    }

    #[test]
    fn tampered_content_fails_threshold() {
        let (service, keydb) = service_and_db();
        let mut signed = signed_timestamp(&service, &keydb, Utc::now() + Duration::days(14));
        signed.signed.version = 9;
        assert!(matches!(
            verify_meta(&signed, "timestamp", &keydb),
            Err(crate::error::Error::VerificationFail { .. })
        ));
    }

    #[test]
    fn expired_metadata_is_rejected() {
        let (service, keydb) = service_and_db();
        let signed = signed_timestamp(&service, &keydb, Utc::now() - Duration::days(1));
        assert!(matches!(
            verify_meta(&signed, "timestamp", &keydb),
            Err(crate::error::Error::Expired { .. })
        ));
    }

    #[test]
    fn duplicate_signatures_count_once() {
        let (service, mut keydb) = service_and_db();
        // raise the threshold to 2 and duplicate the one signature
        let record = keydb.role("timestamp").unwrap().clone();
        keydb
            .add_role("timestamp", RoleKeys::new(record.keyids.clone(), 2))
            .unwrap();
        let mut signed = signed_timestamp(&service, &keydb, Utc::now() + Duration::days(14));
        let dup = signed.signatures[0].clone();
        signed.signatures.push(dup);
        assert!(matches!(
            verify_meta(&signed, "timestamp", &keydb),
            Err(crate::error::Error::VerificationFail { .. })
        ));
    }

    #[test]
    fn version_floor() {
        assert!(check_version("snapshot", 3, 3).is_ok());
        assert!(check_version("snapshot", 4, 3).is_ok());
        assert!(matches!(
            check_version("snapshot", 2, 3),
            Err(crate::error::Error::LowVersion { .. })
        ));
    }
}
