//! Bearer-token issuing and verification (HS256 compact tokens).
//!
//! The token carries the tenant's credential so the pipeline can re-resolve
//! the tenant on every request without server-side session state.

use std::sync::Arc;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use thiserror::Error;

use crate::clock::Clock;

type HmacSha256 = Hmac<Sha256>;

pub const TOKEN_TTL_SECONDS: u64 = 24 * 60 * 60;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Claims {
    pub tenant_id: i64,
    pub api_key: String,
    pub iat: u64,
    pub exp: u64,
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("malformed token")]
    Malformed,
    #[error("signature mismatch")]
    BadSignature,
    #[error("token expired")]
    Expired,
    #[error("token encoding failed: {0}")]
    Encoding(#[from] serde_json::Error),
    #[error("invalid signing key: {0}")]
    Key(String),
}

pub struct TokenService {
    secret: Vec<u8>,
    clock: Arc<dyn Clock>,
}

impl TokenService {
    pub fn new(secret: impl AsRef<[u8]>, clock: Arc<dyn Clock>) -> Self {
        Self {
            secret: secret.as_ref().to_vec(),
            clock,
        }
    }

    pub fn issue(&self, tenant_id: i64, api_key: &str) -> Result<String, AuthError> {
        let now = self.clock.now_epoch_seconds();
        let claims = Claims {
            tenant_id,
            api_key: api_key.to_string(),
            iat: now,
            exp: now + TOKEN_TTL_SECONDS,
        };
        let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"HS256","typ":"JWT"}"#);
        let payload = URL_SAFE_NO_PAD.encode(serde_json::to_vec(&claims)?);
        let signing_input = format!("{header}.{payload}");
        let signature = URL_SAFE_NO_PAD.encode(self.sign(signing_input.as_bytes())?);
        Ok(format!("{signing_input}.{signature}"))
    }

    pub fn verify(&self, token: &str) -> Result<Claims, AuthError> {
        let mut parts = token.splitn(3, '.');
        let (Some(header), Some(payload), Some(signature)) =
            (parts.next(), parts.next(), parts.next())
        else {
            return Err(AuthError::Malformed);
        };
        let signature = URL_SAFE_NO_PAD
            .decode(signature)
            .map_err(|_| AuthError::Malformed)?;

        let mut mac = HmacSha256::new_from_slice(&self.secret)
            .map_err(|err| AuthError::Key(err.to_string()))?;
        mac.update(header.as_bytes());
        mac.update(b".");
        mac.update(payload.as_bytes());
        mac.verify_slice(&signature)
            .map_err(|_| AuthError::BadSignature)?;

        let payload = URL_SAFE_NO_PAD
            .decode(payload)
            .map_err(|_| AuthError::Malformed)?;
        let claims: Claims = serde_json::from_slice(&payload).map_err(|_| AuthError::Malformed)?;
        if self.clock.now_epoch_seconds() >= claims.exp {
            return Err(AuthError::Expired);
        }
        Ok(claims)
    }

    fn sign(&self, data: &[u8]) -> Result<Vec<u8>, AuthError> {
        let mut mac = HmacSha256::new_from_slice(&self.secret)
            .map_err(|err| AuthError::Key(err.to_string()))?;
        mac.update(data);
        Ok(mac.finalize().into_bytes().to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn service(clock: Arc<ManualClock>) -> TokenService {
        TokenService::new("test-secret", clock)
    }

    #[test]
    fn issued_tokens_verify_and_carry_claims() {
        let clock = Arc::new(ManualClock::new(1_000));
        let tokens = service(clock);
        let token = tokens.issue(7, "key-abc").unwrap();
        let claims = tokens.verify(&token).unwrap();
        assert_eq!(claims.tenant_id, 7);
        assert_eq!(claims.api_key, "key-abc");
        assert_eq!(claims.iat, 1_000);
        assert_eq!(claims.exp, 1_000 + TOKEN_TTL_SECONDS);
    }

    #[test]
    fn expired_tokens_are_rejected() {
        let clock = Arc::new(ManualClock::new(1_000));
        let tokens = service(clock.clone());
        let token = tokens.issue(1, "key").unwrap();
        clock.advance(TOKEN_TTL_SECONDS);
        assert!(matches!(tokens.verify(&token), Err(AuthError::Expired)));
    }

    #[test]
    fn tampered_payload_fails_signature_check() {
        let clock = Arc::new(ManualClock::new(1_000));
        let tokens = service(clock);
        let token = tokens.issue(1, "key").unwrap();
        let mut parts: Vec<&str> = token.split('.').collect();
        let forged = URL_SAFE_NO_PAD.encode(
            br#"{"tenant_id":2,"api_key":"key","iat":1000,"exp":90000}"#,
        );
        parts[1] = &forged;
        let forged_token = parts.join(".");
        assert!(matches!(
            tokens.verify(&forged_token),
            Err(AuthError::BadSignature)
        ));
    }

    #[test]
    fn wrong_secret_fails_verification() {
        let clock = Arc::new(ManualClock::new(1_000));
        let tokens = service(clock.clone());
        let other = TokenService::new("other-secret", clock);
        let token = tokens.issue(1, "key").unwrap();
        assert!(matches!(other.verify(&token), Err(AuthError::BadSignature)));
    }

    #[test]
    fn garbage_is_malformed() {
        let clock = Arc::new(ManualClock::new(1_000));
        let tokens = service(clock);
        assert!(matches!(tokens.verify("not-a-token"), Err(AuthError::Malformed)));
        assert!(matches!(tokens.verify("a.b"), Err(AuthError::Malformed)));
    }
}
