use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use rand::RngCore;

/// Prefix marking a value encrypted by [`SecretBox`].
pub const SEALED_PREFIX: &str = "enc:v1:";

const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SecretError {
    #[error("encryption key is not configured")]
    KeyUnavailable,
    #[error("encryption key must be 32 bytes")]
    InvalidKey,
    #[error("stored secret is malformed")]
    Malformed,
    #[error("stored secret failed authentication")]
    Decrypt,
    #[error("encryption failed")]
    Encrypt,
}

/// AES-256-GCM encryption for secrets at rest.
///
/// Stored form is `enc:v1:` followed by base64 of `nonce(12) || ciphertext`.
/// Values without the prefix predate encryption and are returned as-is.
#[derive(Clone)]
pub struct SecretBox {
    cipher: Option<Aes256Gcm>,
}

impl std::fmt::Debug for SecretBox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretBox")
            .field("available", &self.is_available())
            .finish()
    }
}

impl SecretBox {
    pub fn new(key: &[u8]) -> Result<Self, SecretError> {
        let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| SecretError::InvalidKey)?;
        Ok(Self {
            cipher: Some(cipher),
        })
    }

    /// A box with no key. Legacy plaintext still reads; everything else
    /// fails with [`SecretError::KeyUnavailable`].
    pub fn unavailable() -> Self {
        Self { cipher: None }
    }

    pub fn is_available(&self) -> bool {
        self.cipher.is_some()
    }

    pub fn is_sealed(stored: &str) -> bool {
        stored.starts_with(SEALED_PREFIX)
    }

    pub fn seal(&self, plaintext: &str) -> Result<String, SecretError> {
        let cipher = self.cipher.as_ref().ok_or(SecretError::KeyUnavailable)?;
        let mut nonce = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce);
        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext.as_bytes())
            .map_err(|_| SecretError::Encrypt)?;
        let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ciphertext);
        Ok(format!("{SEALED_PREFIX}{}", STANDARD.encode(out)))
    }

    pub fn open(&self, stored: &str) -> Result<String, SecretError> {
        let Some(encoded) = stored.strip_prefix(SEALED_PREFIX) else {
            return Ok(stored.to_string());
        };
        let cipher = self.cipher.as_ref().ok_or(SecretError::KeyUnavailable)?;
        let data = STANDARD.decode(encoded).map_err(|_| SecretError::Malformed)?;
        if data.len() < NONCE_LEN + TAG_LEN {
            return Err(SecretError::Malformed);
        }
        let (nonce, ciphertext) = data.split_at(NONCE_LEN);
        let plaintext = cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| SecretError::Decrypt)?;
        String::from_utf8(plaintext).map_err(|_| SecretError::Malformed)
    }
}
