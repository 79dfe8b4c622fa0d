// src/cipher/mod.rs
//! Symmetric encryption keyed from accepted BB84 bits.
//!
//! The first 32 key bits are rendered as a `0`/`1` digit string and hashed with
//! SHA-256 into a ChaCha20-Poly1305 key. Envelopes carry the ciphertext, nonce
//! and detached tag as hex strings.

use aead::{AeadInPlace, KeyInit, Nonce};
use chacha20poly1305::{ChaCha20Poly1305, Key, Tag};
use chrono::{DateTime, Utc};
use rand::RngCore;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::debug;
use zeroize::Zeroizing;

use crate::history::BoundedLog;
use crate::{KEY_BITS, QkdError};

const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;
/// Hex characters of SHA-256(key) kept as the fingerprint.
const FINGERPRINT_LEN: usize = 16;

/// Output of [`QuantumCipher::encrypt`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptionEnvelope {
    /// Hex ciphertext, same length as the plaintext.
    pub ciphertext: String,
    /// Hex 12-byte nonce, fresh per message.
    pub nonce: String,
    /// Hex 16-byte Poly1305 tag.
    pub tag: String,
    pub encrypted_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyHistoryEntry {
    pub timestamp: DateTime<Utc>,
    /// Bit count handed to `set_key` after zero padding.
    pub raw_key_length: usize,
    pub key_fingerprint: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyStats {
    pub key_active: bool,
    pub generated_at: Option<DateTime<Utc>>,
    pub encryptions_performed: u64,
    pub key_history: Vec<KeyHistoryEntry>,
}

/// Holds the current key and performs authenticated encryption with it.
pub struct QuantumCipher {
    key: Option<Zeroizing<[u8; 32]>>,
    key_generated_at: Option<DateTime<Utc>>,
    encryption_count: u64,
    key_history: BoundedLog<KeyHistoryEntry>,
}

impl std::fmt::Debug for QuantumCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QuantumCipher")
            .field("key_active", &self.key.is_some())
            .field("key_generated_at", &self.key_generated_at)
            .field("encryption_count", &self.encryption_count)
            .field("key_history_len", &self.key_history.len())
            .finish()
    }
}

impl Default for QuantumCipher {
    fn default() -> Self {
        Self::new(10)
    }
}

/// SHA-256 of the first [`KEY_BITS`] bits rendered as digits, zero padded.
pub fn derive_key(bits: &[u8]) -> [u8; 32] {
    let digits: String = bits
        .iter()
        .copied()
        .chain(std::iter::repeat(0))
        .take(KEY_BITS)
        .map(|bit| if bit == 0 { '0' } else { '1' })
        .collect();
    Sha256::digest(digits.as_bytes()).into()
}

/// First 16 hex characters of SHA-256(key).
pub fn key_fingerprint(key: &[u8]) -> String {
    let mut fingerprint = hex::encode(Sha256::digest(key));
    fingerprint.truncate(FINGERPRINT_LEN);
    fingerprint
}

fn decode_field(name: &str, value: &str, expected_len: Option<usize>) -> Result<Vec<u8>, QkdError> {
    let bytes = hex::decode(value)
        .map_err(|e| QkdError::AuthenticationFailure(format!("invalid {name} encoding: {e}")))?;
    match expected_len {
        Some(len) if bytes.len() != len => Err(QkdError::AuthenticationFailure(format!(
            "invalid {name} length {} (expected {len})",
            bytes.len()
        ))),
        _ => Ok(bytes),
    }
}

fn seal_error(e: aead::Error) -> QkdError {
    QkdError::Encryption(format!("AEAD encryption error: {e}"))
}

impl QuantumCipher {
    /// Creates a cipher with no key and a key history of `history_capacity` entries.
    pub fn new(history_capacity: usize) -> Self {
        Self {
            key: None,
            key_generated_at: None,
            encryption_count: 0,
            key_history: BoundedLog::new(history_capacity),
        }
    }

    pub fn is_active(&self) -> bool {
        self.key.is_some()
    }

    pub fn encryption_count(&self) -> u64 {
        self.encryption_count
    }

    /// Installs a key derived from `bits`, replacing any previous key.
    ///
    /// # Arguments
    /// * `bits`: Final key bits (`0`/`1`). Fewer than 32 are right padded with zeros.
    ///
    /// # Returns
    /// * The `KeyHistoryEntry` appended for this key.
    pub fn set_key(&mut self, bits: &[u8]) -> KeyHistoryEntry {
        let key = Zeroizing::new(derive_key(bits));
        let now = Utc::now();
        let entry = KeyHistoryEntry {
            timestamp: now,
            raw_key_length: bits.len().max(KEY_BITS),
            key_fingerprint: key_fingerprint(key.as_slice()),
        };
        debug!(fingerprint = %entry.key_fingerprint, bits = bits.len(), "installed new key");

        self.key = Some(key);
        self.key_generated_at = Some(now);
        self.encryption_count = 0;
        self.key_history.push(entry.clone());
        entry
    }

    fn cipher(&self) -> Result<ChaCha20Poly1305, QkdError> {
        let key = self.key.as_ref().ok_or(QkdError::NoKey)?;
        Ok(ChaCha20Poly1305::new(Key::from_slice(key.as_slice())))
    }

    /// Encrypts raw bytes under the current key.
    ///
    /// # Returns
    /// * `Ok(EncryptionEnvelope)` with a fresh random nonce.
    /// * `Err(QkdError::NoKey)` if no key is installed.
    /// * `Err(QkdError::Encryption)` if the AEAD rejects the plaintext.
    pub fn encrypt(&mut self, plaintext: &[u8]) -> Result<EncryptionEnvelope, QkdError> {
        let cipher = self.cipher()?;

        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::<ChaCha20Poly1305>::from_slice(&nonce_bytes);

        let mut buffer = plaintext.to_vec();
        let tag = cipher
            .encrypt_in_place_detached(nonce, &[], &mut buffer)
            .map_err(seal_error)?;

        self.encryption_count += 1;
        Ok(EncryptionEnvelope {
            ciphertext: hex::encode(&buffer),
            nonce: hex::encode(nonce_bytes),
            tag: hex::encode(tag),
            encrypted_at: Utc::now(),
        })
    }

    /// Serializes `record` to canonical JSON text and encrypts it.
    ///
    /// Object keys come out sorted, so equal records yield equal plaintexts.
    pub fn encrypt_record<T: Serialize + ?Sized>(&mut self, record: &T) -> Result<EncryptionEnvelope, QkdError> {
        if !self.is_active() {
            return Err(QkdError::NoKey);
        }
        let canonical = serde_json::to_value(record)?;
        let text = serde_json::to_string(&canonical)?;
        self.encrypt(text.as_bytes())
    }

    /// Verifies and decrypts an envelope.
    ///
    /// # Returns
    /// * `Ok(Vec<u8>)` with the original plaintext.
    /// * `Err(QkdError::NoKey)` if no key is installed.
    /// * `Err(QkdError::AuthenticationFailure)` for malformed hex, wrong nonce or
    ///   tag length, or a tag that does not verify under the current key.
    pub fn decrypt(&self, envelope: &EncryptionEnvelope) -> Result<Vec<u8>, QkdError> {
        let cipher = self.cipher()?;

        let nonce_bytes = decode_field("nonce", &envelope.nonce, Some(NONCE_LEN))?;
        let tag_bytes = decode_field("tag", &envelope.tag, Some(TAG_LEN))?;
        let mut buffer = decode_field("ciphertext", &envelope.ciphertext, None)?;

        let nonce = Nonce::<ChaCha20Poly1305>::from_slice(&nonce_bytes);
        let tag = Tag::from_slice(&tag_bytes);
        cipher
            .decrypt_in_place_detached(nonce, &[], &mut buffer, tag)
            .map_err(|e| QkdError::AuthenticationFailure(format!("AEAD decryption/authentication failed: {e}")))?;
        Ok(buffer)
    }

    /// Decrypts an envelope produced by [`QuantumCipher::encrypt_record`].
    pub fn decrypt_record<T: DeserializeOwned>(&self, envelope: &EncryptionEnvelope) -> Result<T, QkdError> {
        let plaintext = self.decrypt(envelope)?;
        Ok(serde_json::from_slice(&plaintext)?)
    }

    pub fn key_stats(&self) -> KeyStats {
        KeyStats {
            key_active: self.is_active(),
            generated_at: self.key_generated_at,
            encryptions_performed: self.encryption_count,
            key_history: self.key_history.snapshot(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{Value, json};

    fn keyed(bits: &[u8]) -> QuantumCipher {
        let mut cipher = QuantumCipher::default();
        cipher.set_key(bits);
        cipher
    }

    #[test]
    fn zero_key_round_trips_record() {
        let mut cipher = keyed(&[0u8; 32]);
        let envelope = cipher.encrypt_record(&json!({"a": 1})).unwrap();
        let plaintext = cipher.decrypt(&envelope).unwrap();
        assert_eq!(plaintext, br#"{"a":1}"#);
        let record: Value = cipher.decrypt_record(&envelope).unwrap();
        assert_eq!(record, json!({"a": 1}));
    }

    #[test]
    fn envelope_fields_are_hex_of_expected_size() {
        let mut cipher = keyed(&[1, 0, 1, 1]);
        let plaintext = b"patient P001";
        let envelope = cipher.encrypt(plaintext).unwrap();
        assert_eq!(envelope.nonce.len(), NONCE_LEN * 2);
        assert_eq!(envelope.tag.len(), TAG_LEN * 2);
        assert_eq!(envelope.ciphertext.len(), plaintext.len() * 2);
        assert!(hex::decode(&envelope.ciphertext).is_ok());
    }

    #[test]
    fn nonces_are_fresh() {
        let mut cipher = keyed(&[1; 40]);
        let a = cipher.encrypt(b"same").unwrap();
        let b = cipher.encrypt(b"same").unwrap();
        assert_ne!(a.nonce, b.nonce);
        assert_ne!(a.ciphertext, b.ciphertext);
    }

    #[test]
    fn operations_without_key_fail() {
        let mut cipher = QuantumCipher::default();
        assert!(matches!(cipher.encrypt(b"x"), Err(QkdError::NoKey)));
        assert!(matches!(cipher.encrypt_record(&json!({"a": 1})), Err(QkdError::NoKey)));
        let envelope = EncryptionEnvelope {
            ciphertext: "00".into(),
            nonce: "00".repeat(NONCE_LEN),
            tag: "00".repeat(TAG_LEN),
            encrypted_at: Utc::now(),
        };
        assert!(matches!(cipher.decrypt(&envelope), Err(QkdError::NoKey)));
        assert!(!cipher.key_stats().key_active);
    }

    #[test]
    fn seal_failures_are_not_authentication_failures() {
        let err = seal_error(aead::Error);
        assert!(matches!(err, QkdError::Encryption(_)));
        assert!(err.to_string().starts_with("encryption failed"));
    }

    #[test]
    fn short_keys_are_zero_padded() {
        assert_eq!(derive_key(&[]), derive_key(&[0; 32]));
        assert_eq!(derive_key(&[1, 1]), derive_key(&[1, 1, 0, 0]));
        // Only the first 32 bits matter.
        let mut long = vec![1u8; 32];
        long.extend([0, 1, 0]);
        assert_eq!(derive_key(&long), derive_key(&[1; 32]));
        assert_ne!(derive_key(&[1; 32]), derive_key(&[0; 32]));
    }

    #[test]
    fn derived_key_is_sha256_of_digit_string() {
        let expected: [u8; 32] = Sha256::digest("1".repeat(32).as_bytes()).into();
        assert_eq!(derive_key(&[1; 32]), expected);
    }

    #[test]
    fn tampering_is_an_authentication_failure() {
        let mut cipher = keyed(&[1, 0, 1]);
        let envelope = cipher.encrypt(b"do not tamper").unwrap();

        let mut bad_ct = envelope.clone();
        let mut bytes = hex::decode(&bad_ct.ciphertext).unwrap();
        bytes[0] ^= 0xAA;
        bad_ct.ciphertext = hex::encode(bytes);

        let mut bad_tag = envelope.clone();
        bad_tag.tag = format!("{}00", &envelope.tag[..TAG_LEN * 2 - 2]);
        if bad_tag.tag == envelope.tag {
            bad_tag.tag = format!("{}ff", &envelope.tag[..TAG_LEN * 2 - 2]);
        }

        let mut bad_nonce = envelope.clone();
        bad_nonce.nonce = "00".repeat(NONCE_LEN);

        let mut bad_hex = envelope.clone();
        bad_hex.ciphertext = "zz".into();

        let mut short_nonce = envelope.clone();
        short_nonce.nonce = "00".repeat(NONCE_LEN - 1);

        for broken in [bad_ct, bad_tag, bad_nonce, bad_hex, short_nonce] {
            assert!(matches!(
                cipher.decrypt(&broken),
                Err(QkdError::AuthenticationFailure(_))
            ));
        }
        assert_eq!(cipher.decrypt(&envelope).unwrap(), b"do not tamper");
    }

    #[test]
    fn rotated_key_cannot_open_old_envelopes() {
        let mut cipher = keyed(&[0; 32]);
        let envelope = cipher.encrypt(b"old").unwrap();
        assert_eq!(cipher.encryption_count(), 1);

        cipher.set_key(&[1; 32]);
        assert_eq!(cipher.encryption_count(), 0);
        assert!(matches!(
            cipher.decrypt(&envelope),
            Err(QkdError::AuthenticationFailure(_))
        ));
    }

    #[test]
    fn key_history_is_bounded_and_fingerprinted() {
        let mut cipher = QuantumCipher::default();
        for i in 0..15u8 {
            let bits: Vec<u8> = (0..8).map(|b| (i >> (b % 4)) & 1).collect();
            cipher.set_key(&bits);
        }
        let stats = cipher.key_stats();
        assert!(stats.key_active);
        assert!(stats.generated_at.is_some());
        assert_eq!(stats.key_history.len(), 10);
        for entry in &stats.key_history {
            assert_eq!(entry.key_fingerprint.len(), FINGERPRINT_LEN);
            assert_eq!(entry.raw_key_length, 32);
        }

        let entry = cipher.set_key(&[1; 48]);
        assert_eq!(entry.raw_key_length, 48);
        assert_eq!(cipher.key_stats().key_history.last(), Some(&entry));
    }
}
