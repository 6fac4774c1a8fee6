//! Crypto Sealer (C2) — authenticated encryption/decryption of payloads.
//!
//! `SealedPayload`'s wire encoding is `[key_version: u32 BE][nonce: 12
//! bytes][ciphertext || tag]`. AES-256-GCM gives us the 96-bit nonce and
//! 128-bit tag the design calls for directly; nonces are drawn from the
//! OS CSPRNG per message and are never reused for a given key version.

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use dashmap::DashMap;
use rand::RngCore;
use std::sync::Arc;
use zeroize::Zeroizing;

use crate::audit::{Actor, AuditEventBuilder, AuditLog, EventType, Outcome};
use crate::error::{Result, TacEdgeError};
use crate::model::Classification;

const NONCE_LEN: usize = 12;
const VERSION_LEN: usize = 4;

/// Opaque ciphertext + nonce + tag + key version, as produced by `seal`.
/// Implements `Debug` without leaking bytes — length only.
#[derive(Clone)]
pub struct SealedPayload(Vec<u8>);

impl std::fmt::Debug for SealedPayload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SealedPayload({} bytes)", self.0.len())
    }
}

impl SealedPayload {
    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }

    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    fn key_version(&self) -> Option<u32> {
        self.0
            .get(..VERSION_LEN)
            .map(|b| u32::from_be_bytes(b.try_into().unwrap()))
    }
}

/// A single symmetric key, identified by version, held for the process
/// lifetime unless rotated. Retired keys stay in the ring so payloads
/// sealed under them remain openable until the retention horizon (§4.2).
struct KeyEntry {
    key: Zeroizing<[u8; 32]>,
}

/// Holds the active key plus retired-but-still-openable versions.
/// Reads (the common case: `open` under the active key) never block,
/// matching the "Crypto key material" shared-resource policy in §5 —
/// `DashMap` gives lock-free reads for the common path, writes only
/// occur on rotation.
pub struct CryptoSealer {
    keys: DashMap<u32, KeyEntry>,
    active_version: std::sync::atomic::AtomicU32,
    audit: Arc<AuditLog>,
}

impl CryptoSealer {
    pub fn new(initial_key: &[u8], initial_version: u32, audit: Arc<AuditLog>) -> Result<Self> {
        let keys = DashMap::new();
        keys.insert(
            initial_version,
            KeyEntry {
                key: Zeroizing::new(derive_key_bytes(initial_key)),
            },
        );
        Ok(Self {
            keys,
            active_version: std::sync::atomic::AtomicU32::new(initial_version),
            audit,
        })
    }

    /// Key rotation never reuses a (key, nonce) pair because each version
    /// gets its own independently keyed cipher and its version tag is
    /// embedded in every sealed payload it produces (§9 "Nonces and key
    /// rotation").
    pub fn rotate(&self, new_key: &[u8], new_version: u32) {
        self.keys.insert(
            new_version,
            KeyEntry {
                key: Zeroizing::new(derive_key_bytes(new_key)),
            },
        );
        self.active_version
            .store(new_version, std::sync::atomic::Ordering::SeqCst);
    }

    fn active(&self) -> u32 {
        self.active_version.load(std::sync::atomic::Ordering::SeqCst)
    }

    pub async fn seal(
        &self,
        plaintext: &[u8],
        classification: Classification,
        actor: Actor,
    ) -> Result<SealedPayload> {
        let version = self.active();
        let entry = self
            .keys
            .get(&version)
            .ok_or_else(|| TacEdgeError::internal("active key version missing from ring"))?;

        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(entry.key.as_ref()));
        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = cipher
            .encrypt(
                nonce,
                Payload {
                    msg: plaintext,
                    aad: &[],
                },
            )
            .map_err(|_| TacEdgeError::internal("seal operation failed"))?;

        let mut out = Vec::with_capacity(VERSION_LEN + NONCE_LEN + ciphertext.len());
        out.extend_from_slice(&version.to_be_bytes());
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&ciphertext);

        self.audit
            .append_best_effort(
                AuditEventBuilder::new(EventType::Encrypt, actor)
                    .operation("seal")
                    .message_context(crate::model::Precedence::Routine, classification)
                    .outcome(Outcome::Success)
                    .build(),
            )
            .await;

        Ok(SealedPayload(out))
    }

    /// Verifies the authentication tag before returning plaintext. On any
    /// failure — unknown key version, truncated payload, tag mismatch —
    /// this returns an error and never returns partial data, per §4.2.
    pub async fn open(&self, sealed: &SealedPayload, actor: Actor) -> Result<Vec<u8>> {
        let result = self.open_inner(sealed);

        let outcome = if result.is_ok() {
            Outcome::Success
        } else {
            Outcome::Failure
        };
        self.audit
            .append_best_effort(
                AuditEventBuilder::new(EventType::IntegrityCheck, actor.clone())
                    .operation("open")
                    .outcome(outcome)
                    .build(),
            )
            .await;

        if result.is_ok() {
            self.audit
                .append_best_effort(
                    AuditEventBuilder::new(EventType::Decrypt, actor)
                        .operation("open")
                        .outcome(Outcome::Success)
                        .build(),
                )
                .await;
        }

        result
    }

    fn open_inner(&self, sealed: &SealedPayload) -> Result<Vec<u8>> {
        let bytes = &sealed.0;
        if bytes.len() < VERSION_LEN + NONCE_LEN {
            return Err(TacEdgeError::Integrity);
        }
        let version = sealed.key_version().ok_or(TacEdgeError::Integrity)?;
        let entry = self.keys.get(&version).ok_or(TacEdgeError::Integrity)?;

        let nonce_bytes = &bytes[VERSION_LEN..VERSION_LEN + NONCE_LEN];
        let ciphertext = &bytes[VERSION_LEN + NONCE_LEN..];

        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(entry.key.as_ref()));
        let nonce = Nonce::from_slice(nonce_bytes);

        cipher
            .decrypt(
                nonce,
                Payload {
                    msg: ciphertext,
                    aad: &[],
                },
            )
            .map_err(|_| TacEdgeError::Integrity)
    }
}

fn derive_key_bytes(key_material: &[u8]) -> [u8; 32] {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(key_material);
    let digest = hasher.finalize();
    let mut out = [0u8; 32];
    out.copy_from_slice(&digest);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn actor() -> Actor {
        Actor {
            node_id: "node-a".to_string(),
            role: "operator".to_string(),
            source_address: "10.0.0.1".to_string(),
        }
    }

    async fn sealer() -> (CryptoSealer, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let db = sled::open(dir.path()).unwrap();
        let audit = AuditLog::open(&db).unwrap();
        (
            CryptoSealer::new(b"test-key-material", 1, audit).unwrap(),
            dir,
        )
    }

    #[tokio::test]
    async fn seal_then_open_round_trips() {
        let (sealer, _dir) = sealer().await;
        let sealed = sealer
            .seal(b"hello", Classification::Secret, actor())
            .await
            .unwrap();
        let opened = sealer.open(&sealed, actor()).await.unwrap();
        assert_eq!(opened, b"hello");
    }

    #[tokio::test]
    async fn single_bit_mutation_fails_to_open() {
        let (sealer, _dir) = sealer().await;
        let sealed = sealer
            .seal(b"hello", Classification::Secret, actor())
            .await
            .unwrap();
        let mut bytes = sealed.into_bytes();
        let last = bytes.len() - 1;
        bytes[last] ^= 0x01;
        let mutated = SealedPayload::from_bytes(bytes);

        let result = sealer.open(&mutated, actor()).await;
        assert!(matches!(result, Err(TacEdgeError::Integrity)));
    }

    #[tokio::test]
    async fn opening_under_retired_key_version_still_succeeds() {
        let (sealer, _dir) = sealer().await;
        let sealed_v1 = sealer
            .seal(b"old-message", Classification::Confidential, actor())
            .await
            .unwrap();

        sealer.rotate(b"new-key-material", 2);

        let sealed_v2 = sealer
            .seal(b"new-message", Classification::Confidential, actor())
            .await
            .unwrap();

        assert_eq!(
            sealer.open(&sealed_v1, actor()).await.unwrap(),
            b"old-message"
        );
        assert_eq!(
            sealer.open(&sealed_v2, actor()).await.unwrap(),
            b"new-message"
        );
    }

    #[tokio::test]
    async fn nonces_are_unique_across_seals() {
        let (sealer, _dir) = sealer().await;
        let mut nonces = std::collections::HashSet::new();
        for _ in 0..50 {
            let sealed = sealer
                .seal(b"payload", Classification::Unclassified, actor())
                .await
                .unwrap();
            let bytes = sealed.into_bytes();
            let nonce = bytes[VERSION_LEN..VERSION_LEN + NONCE_LEN].to_vec();
            assert!(nonces.insert(nonce), "nonce reused across seals");
        }
    }

    proptest::proptest! {
        #[test]
        fn seal_open_round_trips_for_arbitrary_plaintext(bytes in proptest::collection::vec(proptest::num::u8::ANY, 0..512)) {
            let rt = tokio::runtime::Runtime::new().unwrap();
            rt.block_on(async {
                let (sealer, _dir) = sealer().await;
                let sealed = sealer
                    .seal(&bytes, Classification::Unclassified, actor())
                    .await
                    .unwrap();
                let opened = sealer.open(&sealed, actor()).await.unwrap();
                prop_assert_eq!(opened, bytes);
                Ok(())
            })?;
        }
    }
}
