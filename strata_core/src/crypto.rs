//! Cryptographic primitives: AES-256-GCM envelope encryption, SHA-256
//! hashing with constant-time comparison, and token generation.

use aes_gcm::aead::Aead;
use aes_gcm::{Aes256Gcm, KeyInit, Nonce};
use base64::Engine;
use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::models::ApiKeyType;
use crate::{Error, Result};

const IV_LEN: usize = 12;
const TAG_LEN: usize = 16;

/// Envelope-encrypted value: ciphertext, IV, and GCM tag, each base64.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedPayload {
    pub ciphertext: String,
    pub iv: String,
    pub auth_tag: String,
}

/// Derive the 32-byte master key from the configured secret.
///
/// Rules: 64 hex characters decode to the key; any other string of at
/// least 32 bytes contributes its first 32 bytes; anything shorter fails.
pub fn derive_master_key(secret: &str) -> Result<[u8; 32]> {
    let trimmed = secret.trim();
    if trimmed.len() == 64 && trimmed.bytes().all(|b| b.is_ascii_hexdigit()) {
        let mut key = [0u8; 32];
        for (i, chunk) in trimmed.as_bytes().chunks(2).enumerate() {
            let hi = (chunk[0] as char).to_digit(16).unwrap_or(0) as u8;
            let lo = (chunk[1] as char).to_digit(16).unwrap_or(0) as u8;
            key[i] = (hi << 4) | lo;
        }
        return Ok(key);
    }
    let bytes = trimmed.as_bytes();
    if bytes.len() >= 32 {
        let mut key = [0u8; 32];
        key.copy_from_slice(&bytes[..32]);
        return Ok(key);
    }
    Err(Error::Crypto(format!(
        "master key secret must be 64 hex chars or at least 32 bytes, got {} bytes",
        bytes.len()
    )))
}

/// Process-wide crypto service holding the AES-256-GCM cipher built from
/// the master key.
#[derive(Clone)]
pub struct CryptoService {
    cipher: Aes256Gcm,
}

impl CryptoService {
    pub fn new(master_key: &[u8; 32]) -> Self {
        let cipher =
            Aes256Gcm::new_from_slice(master_key).expect("32-byte key is always valid for AES-256");
        Self { cipher }
    }

    pub fn from_secret(secret: &str) -> Result<Self> {
        let key = derive_master_key(secret)?;
        Ok(Self::new(&key))
    }

    /// Encrypt with a fresh random 12-byte IV.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<EncryptedPayload> {
        let mut iv = [0u8; IV_LEN];
        rand::thread_rng().fill_bytes(&mut iv);
        let nonce = Nonce::from_slice(&iv);
        let mut sealed = self
            .cipher
            .encrypt(nonce, plaintext)
            .map_err(|e| Error::Crypto(format!("encrypt: {e}")))?;
        if sealed.len() < TAG_LEN {
            return Err(Error::Crypto("sealed output shorter than tag".to_string()));
        }
        let tag = sealed.split_off(sealed.len() - TAG_LEN);
        Ok(EncryptedPayload {
            ciphertext: STANDARD.encode(&sealed),
            iv: STANDARD.encode(iv),
            auth_tag: STANDARD.encode(tag),
        })
    }

    pub fn encrypt_str(&self, plaintext: &str) -> Result<EncryptedPayload> {
        self.encrypt(plaintext.as_bytes())
    }

    /// Decrypt an envelope. Fails with `Error::Crypto` if the tag does not
    /// verify; callers must not fall back.
    pub fn decrypt(&self, payload: &EncryptedPayload) -> Result<Vec<u8>> {
        let ciphertext = STANDARD
            .decode(&payload.ciphertext)
            .map_err(|e| Error::Crypto(format!("decode ciphertext: {e}")))?;
        let iv = STANDARD
            .decode(&payload.iv)
            .map_err(|e| Error::Crypto(format!("decode iv: {e}")))?;
        let tag = STANDARD
            .decode(&payload.auth_tag)
            .map_err(|e| Error::Crypto(format!("decode auth tag: {e}")))?;
        if iv.len() != IV_LEN {
            return Err(Error::Crypto(format!("iv must be {IV_LEN} bytes")));
        }
        if tag.len() != TAG_LEN {
            return Err(Error::Crypto(format!("auth tag must be {TAG_LEN} bytes")));
        }
        let mut sealed = ciphertext;
        sealed.extend_from_slice(&tag);
        let nonce = Nonce::from_slice(&iv);
        self.cipher
            .decrypt(nonce, sealed.as_ref())
            .map_err(|_| Error::Crypto("authentication tag verification failed".to_string()))
    }

    pub fn decrypt_str(&self, payload: &EncryptedPayload) -> Result<String> {
        let bytes = self.decrypt(payload)?;
        String::from_utf8(bytes).map_err(|e| Error::Crypto(format!("plaintext not utf-8: {e}")))
    }
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut h = Sha256::new();
    h.update(bytes);
    let out = h.finalize();
    let mut s = String::with_capacity(out.len() * 2);
    for b in out {
        use std::fmt::Write as _;
        let _ = write!(&mut s, "{:02x}", b);
    }
    s
}

/// Constant-time equality of two stored hashes.
///
/// Both inputs are re-hashed to equal-length digests first, so the
/// comparison never short-circuits on length or content.
pub fn constant_time_compare(a: &str, b: &str) -> bool {
    let da = Sha256::digest(a.as_bytes());
    let db = Sha256::digest(b.as_bytes());
    let mut diff = 0u8;
    for (x, y) in da.iter().zip(db.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

/// Generate a plaintext API key: `pk_` / `sk_` + base64url of 32 random
/// bytes. Returned exactly once; only the SHA-256 hex is stored.
pub fn generate_api_key(key_type: ApiKeyType) -> String {
    let mut material = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut material);
    format!(
        "{}_{}",
        key_type.token_prefix(),
        URL_SAFE_NO_PAD.encode(material)
    )
}

/// Generate an invite token: `inv_` + base64url of 16 random bytes.
pub fn generate_invite_token() -> String {
    let mut material = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut material);
    format!("inv_{}", URL_SAFE_NO_PAD.encode(material))
}

/// Generate an alphanumeric password for a provisioned database role.
pub fn generate_role_password() -> String {
    use rand::Rng;
    const CHARSET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";
    let mut rng = rand::thread_rng();
    (0..32)
        .map(|_| CHARSET[rng.gen_range(0..CHARSET.len())] as char)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service() -> CryptoService {
        CryptoService::new(&[7u8; 32])
    }

    #[test]
    fn encrypt_decrypt_roundtrip() {
        let svc = service();
        let payload = svc.encrypt(b"postgres://owner:pw@db/proj_x").unwrap();
        let plain = svc.decrypt(&payload).unwrap();
        assert_eq!(plain, b"postgres://owner:pw@db/proj_x");
    }

    #[test]
    fn fresh_iv_per_encryption() {
        let svc = service();
        let a = svc.encrypt(b"same input").unwrap();
        let b = svc.encrypt(b"same input").unwrap();
        assert_ne!(a.iv, b.iv);
        assert_ne!(a.ciphertext, b.ciphertext);
    }

    #[test]
    fn tampered_ciphertext_fails() {
        let svc = service();
        let mut payload = svc.encrypt(b"secret").unwrap();
        let mut raw = STANDARD.decode(&payload.ciphertext).unwrap();
        raw[0] ^= 0x01;
        payload.ciphertext = STANDARD.encode(raw);
        assert!(matches!(svc.decrypt(&payload), Err(Error::Crypto(_))));
    }

    #[test]
    fn tampered_iv_fails() {
        let svc = service();
        let mut payload = svc.encrypt(b"secret").unwrap();
        let mut raw = STANDARD.decode(&payload.iv).unwrap();
        raw[3] ^= 0xff;
        payload.iv = STANDARD.encode(raw);
        assert!(matches!(svc.decrypt(&payload), Err(Error::Crypto(_))));
    }

    #[test]
    fn tampered_tag_fails() {
        let svc = service();
        let mut payload = svc.encrypt(b"secret").unwrap();
        let mut raw = STANDARD.decode(&payload.auth_tag).unwrap();
        raw[15] ^= 0x80;
        payload.auth_tag = STANDARD.encode(raw);
        assert!(matches!(svc.decrypt(&payload), Err(Error::Crypto(_))));
    }

    #[test]
    fn wrong_key_fails() {
        let svc = service();
        let payload = svc.encrypt(b"secret").unwrap();
        let other = CryptoService::new(&[8u8; 32]);
        assert!(other.decrypt(&payload).is_err());
    }

    #[test]
    fn master_key_from_hex() {
        let key = derive_master_key(&"ab".repeat(32)).unwrap();
        assert_eq!(key, [0xabu8; 32]);
    }

    #[test]
    fn master_key_from_long_secret_takes_first_32_bytes() {
        let secret = "x".repeat(40);
        let key = derive_master_key(&secret).unwrap();
        assert_eq!(key, [b'x'; 32]);
    }

    #[test]
    fn master_key_too_short_fails() {
        assert!(derive_master_key("short").is_err());
    }

    #[test]
    fn constant_time_compare_matches_hash_equality() {
        let h1 = sha256_hex(b"sk_abc");
        let h2 = sha256_hex(b"sk_abc");
        let h3 = sha256_hex(b"sk_abd");
        assert!(constant_time_compare(&h1, &h2));
        assert!(!constant_time_compare(&h1, &h3));
        assert!(!constant_time_compare(&h1, "deadbeef"));
    }

    #[test]
    fn api_key_format() {
        let pk = generate_api_key(ApiKeyType::Publishable);
        let sk = generate_api_key(ApiKeyType::Secret);
        assert!(pk.starts_with("pk_"));
        assert!(sk.starts_with("sk_"));
        // 32 bytes base64url without padding is 43 chars.
        assert_eq!(pk.len(), 3 + 43);
        assert_ne!(generate_api_key(ApiKeyType::Secret), sk);
    }

    #[test]
    fn invite_token_format() {
        let tok = generate_invite_token();
        assert!(tok.starts_with("inv_"));
        assert_eq!(tok.len(), 4 + 22);
    }
}
