//! Bearer token issuance and verification (§6 "Bearer token format").
//!
//! Tokens are `base64url(claims_json) "." base64url(hmac_sha256(claims_json))`.
//! There is no unsigned header segment — the claims alone are the
//! canonical serialization the signature covers, keeping the format a
//! single HMAC-over-JSON rather than a general JWT implementation.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::{DateTime, Duration, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use uuid::Uuid;

use crate::error::{Result, TacEdgeError};
use crate::model::{default_permissions, Classification, Permission, Role};

type HmacSha256 = Hmac<Sha256>;

/// Clock-skew tolerance applied to `nbf`/`exp`, per §6.
const CLOCK_SKEW: Duration = Duration::seconds(30);
const DEFAULT_TTL_SECONDS: i64 = 3600;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub iss: String,
    pub sub: String,
    pub aud: String,
    pub exp: DateTime<Utc>,
    pub iat: DateTime<Utc>,
    pub nbf: DateTime<Utc>,
    pub jti: Uuid,
    pub role: Role,
    pub permissions: Vec<Permission>,
    pub node_id: String,
    pub classification_level: Classification,
}

pub struct TokenService {
    signing_key: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthFailureReason {
    Expired,
    NotYetValid,
    BadSignature,
    Malformed,
}

impl AuthFailureReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthFailureReason::Expired => "expired",
            AuthFailureReason::NotYetValid => "not_yet_valid",
            AuthFailureReason::BadSignature => "bad_signature",
            AuthFailureReason::Malformed => "malformed",
        }
    }
}

impl TokenService {
    pub fn new(signing_key: Vec<u8>) -> Self {
        Self { signing_key }
    }

    /// Issues a token for `node_id` under `role`. `requested_permissions`
    /// narrows the role's default grant; `None` grants the role default.
    pub fn issue(
        &self,
        node_id: &str,
        role: Role,
        requested_permissions: Option<Vec<Permission>>,
    ) -> Result<String> {
        let now = Utc::now();
        let permissions = requested_permissions.unwrap_or_else(|| default_permissions(role));

        let claims = Claims {
            iss: "tacedge-gateway".to_string(),
            sub: node_id.to_string(),
            aud: "tacedge".to_string(),
            exp: now + Duration::seconds(DEFAULT_TTL_SECONDS),
            iat: now,
            nbf: now,
            jti: Uuid::new_v4(),
            role,
            permissions,
            node_id: node_id.to_string(),
            classification_level: role.classification_ceiling(),
        };

        self.encode(&claims)
    }

    fn encode(&self, claims: &Claims) -> Result<String> {
        let payload = serde_json::to_vec(claims)?;
        let payload_b64 = URL_SAFE_NO_PAD.encode(&payload);

        let mut mac = HmacSha256::new_from_slice(&self.signing_key)
            .map_err(|_| TacEdgeError::internal("invalid HMAC key length"))?;
        mac.update(payload_b64.as_bytes());
        let signature = mac.finalize().into_bytes();
        let signature_b64 = URL_SAFE_NO_PAD.encode(signature);

        Ok(format!("{payload_b64}.{signature_b64}"))
    }

    /// Verifies the signature and temporal validity of `token`, returning
    /// its claims on success. Per §8 invariant 6, a tampered signature or
    /// an expired token is rejected with probability 1 — there is no
    /// fallback decode path that skips verification.
    pub fn verify(&self, token: &str) -> std::result::Result<Claims, AuthFailureReason> {
        let (payload_b64, signature_b64) = token
            .split_once('.')
            .ok_or(AuthFailureReason::Malformed)?;

        let mut mac = HmacSha256::new_from_slice(&self.signing_key)
            .map_err(|_| AuthFailureReason::Malformed)?;
        mac.update(payload_b64.as_bytes());

        let signature =
            URL_SAFE_NO_PAD.decode(signature_b64).map_err(|_| AuthFailureReason::Malformed)?;
        mac.verify_slice(&signature)
            .map_err(|_| AuthFailureReason::BadSignature)?;

        let payload = URL_SAFE_NO_PAD
            .decode(payload_b64)
            .map_err(|_| AuthFailureReason::Malformed)?;
        let claims: Claims =
            serde_json::from_slice(&payload).map_err(|_| AuthFailureReason::Malformed)?;

        let now = Utc::now();
        if now > claims.exp + CLOCK_SKEW {
            return Err(AuthFailureReason::Expired);
        }
        if now + CLOCK_SKEW < claims.nbf {
            return Err(AuthFailureReason::NotYetValid);
        }

        Ok(claims)
    }
}

impl Claims {
    pub fn has_permission(&self, perm: Permission) -> bool {
        self.permissions.contains(&perm)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn issued_token_verifies() {
        let svc = TokenService::new(b"test-signing-key".to_vec());
        let token = svc.issue("node-a", Role::Operator, None).unwrap();
        let claims = svc.verify(&token).unwrap();
        assert_eq!(claims.node_id, "node-a");
        assert!(claims.has_permission(Permission::MessageSend));
    }

    #[test]
    fn tampered_signature_rejected() {
        let svc = TokenService::new(b"test-signing-key".to_vec());
        let token = svc.issue("node-a", Role::Operator, None).unwrap();
        let mut tampered = token.clone();
        tampered.push('x');
        assert_eq!(svc.verify(&tampered), Err(AuthFailureReason::BadSignature));
    }

    #[test]
    fn expired_token_rejected() {
        let svc = TokenService::new(b"test-signing-key".to_vec());
        let mut claims_token = svc.issue("node-a", Role::Operator, None).unwrap();
        // Forge an already-expired token by re-encoding claims with exp in the past.
        let (payload_b64, _) = claims_token.split_once('.').unwrap().to_owned();
        let mut claims: Claims = serde_json::from_slice(
            &URL_SAFE_NO_PAD.decode(payload_b64).unwrap(),
        )
        .unwrap();
        claims.exp = Utc::now() - Duration::hours(1);
        claims_token = svc.encode(&claims).unwrap();

        assert_eq!(svc.verify(&claims_token), Err(AuthFailureReason::Expired));
    }

    #[test]
    fn wrong_key_rejected() {
        let svc = TokenService::new(b"key-one".to_vec());
        let other = TokenService::new(b"key-two".to_vec());
        let token = svc.issue("node-a", Role::Operator, None).unwrap();
        assert_eq!(other.verify(&token), Err(AuthFailureReason::BadSignature));
    }
}
