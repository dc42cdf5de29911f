//! Password hashing, webhook-secret comparison, and credential sealing.
//!
//! API keys are sealed with an HMAC-SHA256 keystream (encrypt-then-MAC) so
//! they are never persisted in the clear. The cipher sits behind one type so
//! a managed KMS can replace it without touching callers.

use anyhow::{anyhow, Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use hmac::{Hmac, Mac};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

type HmacSha256 = Hmac<Sha256>;

const NONCE_LEN: usize = 16;
const MAC_LEN: usize = 32;

/// Compares two byte strings without short-circuiting on the first mismatch.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

pub fn hash_password(password: &str) -> Result<String> {
    bcrypt::hash(password, bcrypt::DEFAULT_COST).context("Failed to hash password")
}

pub fn verify_password(password: &str, hash: &str) -> bool {
    bcrypt::verify(password, hash).unwrap_or(false)
}

#[derive(Serialize, Deserialize)]
struct KeyPayload {
    api_key: String,
    secret_key: String,
}

/// Seals and unseals exchange API credentials.
pub struct CredentialCipher {
    key: [u8; 32],
}

impl CredentialCipher {
    pub fn new(encryption_key: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(encryption_key.as_bytes());
        let digest = hasher.finalize();
        let mut key = [0u8; 32];
        key.copy_from_slice(&digest);
        Self { key }
    }

    pub fn seal_keys(&self, api_key: &str, secret_key: &str) -> Result<String> {
        let payload = serde_json::to_vec(&KeyPayload {
            api_key: api_key.to_string(),
            secret_key: secret_key.to_string(),
        })?;

        let mut nonce = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce);

        let mut ciphertext = payload;
        self.apply_keystream(&nonce, &mut ciphertext);
        let mac = self.mac(&nonce, &ciphertext);

        let mut blob = Vec::with_capacity(NONCE_LEN + MAC_LEN + ciphertext.len());
        blob.extend_from_slice(&nonce);
        blob.extend_from_slice(&mac);
        blob.extend_from_slice(&ciphertext);
        Ok(BASE64.encode(blob))
    }

    pub fn unseal_keys(&self, sealed: &str) -> Result<(String, String)> {
        let blob = BASE64
            .decode(sealed.trim())
            .context("sealed credentials are not valid base64")?;
        if blob.len() < NONCE_LEN + MAC_LEN {
            return Err(anyhow!("sealed credentials are truncated"));
        }
        let (nonce, rest) = blob.split_at(NONCE_LEN);
        let (mac, ciphertext) = rest.split_at(MAC_LEN);

        let expected = self.mac(nonce, ciphertext);
        if !constant_time_eq(mac, &expected) {
            return Err(anyhow!("sealed credentials failed authentication"));
        }

        let mut plaintext = ciphertext.to_vec();
        self.apply_keystream(nonce, &mut plaintext);
        let payload: KeyPayload =
            serde_json::from_slice(&plaintext).context("sealed payload is malformed")?;
        Ok((payload.api_key, payload.secret_key))
    }

    fn apply_keystream(&self, nonce: &[u8], data: &mut [u8]) {
        let mut counter: u32 = 0;
        let mut offset = 0;
        while offset < data.len() {
            let mut mac = HmacSha256::new_from_slice(&self.key).expect("key length");
            mac.update(nonce);
            mac.update(&counter.to_le_bytes());
            let block = mac.finalize().into_bytes();
            for (byte, pad) in data[offset..].iter_mut().zip(block.iter()) {
                *byte ^= pad;
            }
            offset += block.len();
            counter += 1;
        }
    }

    fn mac(&self, nonce: &[u8], ciphertext: &[u8]) -> [u8; MAC_LEN] {
        let mut mac = HmacSha256::new_from_slice(&self.key).expect("key length");
        mac.update(b"auth");
        mac.update(nonce);
        mac.update(ciphertext);
        let digest = mac.finalize().into_bytes();
        let mut out = [0u8; MAC_LEN];
        out.copy_from_slice(&digest);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seal_unseal_roundtrip() {
        let cipher = CredentialCipher::new("test-encryption-key");
        let sealed = cipher.seal_keys("api-key-123", "secret-key-456").unwrap();
        let (api, secret) = cipher.unseal_keys(&sealed).unwrap();
        assert_eq!(api, "api-key-123");
        assert_eq!(secret, "secret-key-456");
    }

    #[test]
    fn test_sealed_blob_is_not_plaintext() {
        let cipher = CredentialCipher::new("test-encryption-key");
        let sealed = cipher.seal_keys("SENSITIVE", "ALSO_SENSITIVE").unwrap();
        assert!(!sealed.contains("SENSITIVE"));
    }

    #[test]
    fn test_wrong_key_fails_authentication() {
        let cipher = CredentialCipher::new("key-one");
        let other = CredentialCipher::new("key-two");
        let sealed = cipher.seal_keys("a", "b").unwrap();
        assert!(other.unseal_keys(&sealed).is_err());
    }

    #[test]
    fn test_tampered_blob_rejected() {
        let cipher = CredentialCipher::new("key");
        let sealed = cipher.seal_keys("a", "b").unwrap();
        let mut raw = BASE64.decode(&sealed).unwrap();
        let last = raw.len() - 1;
        raw[last] ^= 0x01;
        let tampered = BASE64.encode(raw);
        assert!(cipher.unseal_keys(&tampered).is_err());
    }

    #[test]
    fn test_constant_time_eq() {
        assert!(constant_time_eq(b"secret", b"secret"));
        assert!(!constant_time_eq(b"secret", b"secreT"));
        assert!(!constant_time_eq(b"secret", b"secre"));
    }

    #[test]
    fn test_password_hashing() {
        let hash = hash_password("hunter2").unwrap();
        assert!(verify_password("hunter2", &hash));
        assert!(!verify_password("hunter3", &hash));
    }
}
