//! Symmetric encryption of provenance markers
//!
//! Envelope: `enc:v1:<nonce>:<ciphertext>`, both parts URL-safe base64
//! without padding. The key is derived from a shared passphrase so every
//! writer configured with the same passphrase can read every marker.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use chacha20poly1305::aead::Aead;
use chacha20poly1305::{ChaCha20Poly1305, Key, KeyInit, Nonce};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use super::provenance::ProvenanceError;

const ENVELOPE_PREFIX: &str = "enc:v1:";

#[derive(Clone)]
pub struct ProvenanceCipher {
    aead: ChaCha20Poly1305,
}

impl std::fmt::Debug for ProvenanceCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ProvenanceCipher(..)")
    }
}

impl ProvenanceCipher {
    pub fn new(passphrase: &str) -> Self {
        let key = Sha256::digest(passphrase.as_bytes());
        Self {
            aead: ChaCha20Poly1305::new(Key::from_slice(key.as_slice())),
        }
    }

    pub fn is_encrypted(value: &str) -> bool {
        value.starts_with(ENVELOPE_PREFIX)
    }

    pub fn encrypt(&self, plaintext: &str) -> Result<String, ProvenanceError> {
        if Self::is_encrypted(plaintext) {
            return Ok(plaintext.to_string());
        }

        let nonce_source = Uuid::new_v4().as_bytes().to_owned();
        let nonce = Nonce::from_slice(&nonce_source[..12]);
        let ciphertext = self
            .aead
            .encrypt(nonce, plaintext.as_bytes())
            .map_err(|e| ProvenanceError::Decrypt(format!("encryption failed: {}", e)))?;

        Ok(format!(
            "{}{}:{}",
            ENVELOPE_PREFIX,
            URL_SAFE_NO_PAD.encode(&nonce_source[..12]),
            URL_SAFE_NO_PAD.encode(ciphertext)
        ))
    }

    /// Plaintext values pass through unchanged
    pub fn decrypt(&self, stored: &str) -> Result<String, ProvenanceError> {
        let Some(envelope) = stored.strip_prefix(ENVELOPE_PREFIX) else {
            return Ok(stored.to_string());
        };

        let (nonce_b64, ciphertext_b64) = envelope
            .split_once(':')
            .ok_or_else(|| ProvenanceError::Decrypt("invalid envelope".to_string()))?;

        let nonce_raw = URL_SAFE_NO_PAD
            .decode(nonce_b64.as_bytes())
            .map_err(|e| ProvenanceError::Decrypt(format!("invalid nonce: {}", e)))?;
        if nonce_raw.len() != 12 {
            return Err(ProvenanceError::Decrypt("invalid nonce length".to_string()));
        }
        let ciphertext = URL_SAFE_NO_PAD
            .decode(ciphertext_b64.as_bytes())
            .map_err(|e| ProvenanceError::Decrypt(format!("invalid ciphertext: {}", e)))?;

        let plaintext = self
            .aead
            .decrypt(Nonce::from_slice(&nonce_raw), ciphertext.as_ref())
            .map_err(|_| ProvenanceError::Decrypt("authentication failed".to_string()))?;

        String::from_utf8(plaintext).map_err(|e| ProvenanceError::Decrypt(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encrypt_then_decrypt() {
        let cipher = ProvenanceCipher::new("shared-secret");
        let sealed = cipher.encrypt("heritage=external-dns,owner=a,version=1").unwrap();

        assert!(ProvenanceCipher::is_encrypted(&sealed));
        assert!(!sealed.contains("owner=a"));
        assert_eq!(cipher.decrypt(&sealed).unwrap(), "heritage=external-dns,owner=a,version=1");
    }

    #[test]
    fn test_nonces_differ_between_encryptions() {
        let cipher = ProvenanceCipher::new("shared-secret");
        assert_ne!(cipher.encrypt("x").unwrap(), cipher.encrypt("x").unwrap());
    }

    #[test]
    fn test_wrong_key_fails() {
        let sealed = ProvenanceCipher::new("one").encrypt("secret").unwrap();
        assert!(ProvenanceCipher::new("two").decrypt(&sealed).is_err());
        assert!(ProvenanceCipher::new("one").decrypt("enc:v1:garbage").is_err());
    }

    #[test]
    fn test_plaintext_passes_through() {
        let cipher = ProvenanceCipher::new("k");
        assert_eq!(cipher.decrypt("heritage=external-dns").unwrap(), "heritage=external-dns");
    }
}
