//! Single-use recovery codes for operators who lose their authenticator.

use rand::Rng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use super::secret_box::{SecretBox, SecretError};

pub const CODE_COUNT: usize = 10;

/// Unambiguous lowercase alphabet (no 0/o, 1/l/i).
const ALPHABET: &[u8] = b"abcdefghjkmnpqrstuvwxyz23456789";

fn normalize(code: &str) -> String {
    code.chars()
        .filter(|c| !c.is_whitespace() && *c != '-')
        .map(|c| c.to_ascii_lowercase())
        .collect()
}

fn digest(salt: &str, code: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(salt.as_bytes());
    hasher.update(code.as_bytes());
    hex::encode(hasher.finalize())
}

fn hash_code(code: &str) -> String {
    let salt = hex::encode(rand::thread_rng().gen::<[u8; 16]>());
    let hash = digest(&salt, &normalize(code));
    format!("{salt}${hash}")
}

fn matches(stored: &str, code: &str) -> bool {
    let Some((salt, hash)) = stored.split_once('$') else {
        return false;
    };
    let candidate = digest(salt, code);
    hash.len() == candidate.len() && bool::from(candidate.as_bytes().ct_eq(hash.as_bytes()))
}

fn random_code() -> String {
    let mut rng = rand::thread_rng();
    let mut raw: String = (0..8)
        .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
        .collect();
    raw.insert(4, '-');
    raw
}

/// The hashed remainder of an operator's backup codes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BackupCodes {
    hashes: Vec<String>,
}

impl BackupCodes {
    /// Fresh set. Returns the clear codes (shown once) and their hashes.
    pub fn generate() -> (Vec<String>, Self) {
        let codes: Vec<String> = (0..CODE_COUNT).map(|_| random_code()).collect();
        let hashes = codes.iter().map(|c| hash_code(c)).collect();
        (codes, Self { hashes })
    }

    pub fn remaining(&self) -> usize {
        self.hashes.len()
    }

    /// Remove and report the matching code. A consumed code never matches
    /// again.
    pub fn consume(&mut self, code: &str) -> bool {
        let code = normalize(code);
        if code.is_empty() {
            return false;
        }
        match self.hashes.iter().position(|stored| matches(stored, &code)) {
            Some(idx) => {
                self.hashes.remove(idx);
                true
            }
            None => false,
        }
    }

    /// Encrypt for storage.
    pub fn seal(&self, secrets: &SecretBox) -> Result<String, SecretError> {
        let json = serde_json::to_string(self).map_err(|_| SecretError::Malformed)?;
        secrets.seal(&json)
    }

    pub fn open(stored: &str, secrets: &SecretBox) -> Result<Self, SecretError> {
        let json = secrets.open(stored)?;
        serde_json::from_str(&json).map_err(|_| SecretError::Malformed)
    }
}
