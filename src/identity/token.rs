//! Signed bearer tokens.
//!
//! A token is `base64url(claims_json) "." base64url(hmac_sha256(claims_json))`.
//! Session tokens carry no purpose. Purpose tokens are short-lived and only
//! accepted by the one step they were minted for.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use super::{Principal, Role};

type HmacSha256 = Hmac<Sha256>;

/// Session lifetime in seconds (8 hours).
pub const SESSION_TTL_SECS: i64 = 8 * 60 * 60;
/// Purpose token lifetime in seconds (5 minutes).
pub const PURPOSE_TTL_SECS: i64 = 5 * 60;
/// Shortest signing key accepted.
pub const MIN_KEY_LEN: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Purpose {
    #[serde(rename = "2fa-login")]
    TwoFactorLogin,
    #[serde(rename = "2fa-setup")]
    TwoFactorSetup,
    #[serde(rename = "password-reset")]
    PasswordReset,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub name: String,
    pub role: Role,
    pub exp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub purpose: Option<Purpose>,
}

impl Claims {
    fn principal(self) -> Principal {
        Principal {
            id: self.sub,
            display_name: self.name,
            role: self.role,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TokenError {
    #[error("signing key must be at least {MIN_KEY_LEN} bytes")]
    InvalidKey,
    #[error("malformed token")]
    Malformed,
    #[error("invalid token signature")]
    BadSignature,
    #[error("token expired")]
    Expired,
    #[error("token not valid for this purpose")]
    WrongPurpose,
}

/// Issues and verifies tokens with one HMAC key.
#[derive(Clone)]
pub struct TokenService {
    mac: HmacSha256,
}

impl std::fmt::Debug for TokenService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenService").finish_non_exhaustive()
    }
}

impl TokenService {
    pub fn new(key: &[u8]) -> Result<Self, TokenError> {
        if key.len() < MIN_KEY_LEN {
            return Err(TokenError::InvalidKey);
        }
        let mac = HmacSha256::new_from_slice(key).map_err(|_| TokenError::InvalidKey)?;
        Ok(Self { mac })
    }

    pub fn issue_session(&self, principal: &Principal) -> String {
        self.issue(principal, None, now() + SESSION_TTL_SECS)
    }

    pub fn issue_purpose(&self, principal: &Principal, purpose: Purpose) -> String {
        self.issue(principal, Some(purpose), now() + PURPOSE_TTL_SECS)
    }

    /// Accept only an unexpired token without a purpose.
    pub fn verify_session(&self, token: &str) -> Result<Principal, TokenError> {
        let claims = self.decode(token, now())?;
        if claims.purpose.is_some() {
            return Err(TokenError::WrongPurpose);
        }
        Ok(claims.principal())
    }

    /// Accept only an unexpired token minted for exactly `expected`.
    pub fn verify_purpose(&self, token: &str, expected: Purpose) -> Result<Principal, TokenError> {
        let claims = self.decode(token, now())?;
        if claims.purpose != Some(expected) {
            return Err(TokenError::WrongPurpose);
        }
        Ok(claims.principal())
    }

    fn issue(&self, principal: &Principal, purpose: Option<Purpose>, exp: i64) -> String {
        let claims = Claims {
            sub: principal.id.clone(),
            name: principal.display_name.clone(),
            role: principal.role,
            exp,
            purpose,
        };
        // Claims is plain data; serialization cannot fail.
        let body = serde_json::to_vec(&claims).unwrap_or_default();
        let mut mac = self.mac.clone();
        mac.update(&body);
        let sig = mac.finalize().into_bytes();
        format!("{}.{}", URL_SAFE_NO_PAD.encode(&body), URL_SAFE_NO_PAD.encode(sig))
    }

    fn decode(&self, token: &str, now: i64) -> Result<Claims, TokenError> {
        let (body_b64, sig_b64) = token.split_once('.').ok_or(TokenError::Malformed)?;
        let body = URL_SAFE_NO_PAD
            .decode(body_b64)
            .map_err(|_| TokenError::Malformed)?;
        let sig = URL_SAFE_NO_PAD
            .decode(sig_b64)
            .map_err(|_| TokenError::Malformed)?;

        let mut mac = self.mac.clone();
        mac.update(&body);
        mac.verify_slice(&sig).map_err(|_| TokenError::BadSignature)?;

        let claims: Claims = serde_json::from_slice(&body).map_err(|_| TokenError::Malformed)?;
        if claims.exp <= now {
            return Err(TokenError::Expired);
        }
        Ok(claims)
    }
}

fn now() -> i64 {
    chrono::Utc::now().timestamp()
}
