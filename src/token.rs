//! Tokens: admin API tokens and subscription tokens
//!
//! Admin tokens are HS256 JWTs. Subscription tokens use a compact scheme
//! clients can carry in a URL: base64url(account_number ',' unix_ts) plus a
//! truncated SHA-256 signature over the payload and the panel secret.

use base64::engine::general_purpose::{URL_SAFE, URL_SAFE_NO_PAD};
use base64::Engine;
use chrono::{DateTime, Utc};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{PanelError, Result};
use crate::models::User;

const SUB_SIGNATURE_LEN: usize = 10;
const MIN_TOKEN_LEN: usize = 15;

#[derive(Debug, Serialize, Deserialize)]
struct AdminTokenClaims {
    sub: String,
    access: String,
    iat: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    exp: Option<i64>,
}

/// Validated admin token payload
#[derive(Debug, Clone)]
pub struct AdminClaims {
    pub username: String,
    pub is_sudo: bool,
    pub issued_at: DateTime<Utc>,
}

/// Validated subscription token payload
#[derive(Debug, Clone)]
pub struct SubscriptionClaims {
    pub account_number: String,
    pub issued_at: DateTime<Utc>,
}

/// Token mint and verification, bound to the panel secret
#[derive(Clone)]
pub struct TokenService {
    secret: String,
}

impl TokenService {
    pub fn new(secret: impl Into<String>) -> Self {
        TokenService {
            secret: secret.into(),
        }
    }

    pub fn create_admin_token(
        &self,
        username: &str,
        is_sudo: bool,
        ttl_minutes: u64,
    ) -> Result<String> {
        let now = Utc::now();
        let claims = AdminTokenClaims {
            sub: username.to_string(),
            access: if is_sudo { "sudo" } else { "admin" }.to_string(),
            iat: now.timestamp(),
            exp: (ttl_minutes > 0).then(|| now.timestamp() + ttl_minutes as i64 * 60),
        };
        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(self.secret.as_bytes()),
        )
        .map_err(|e| PanelError::Internal(format!("token encode failed: {}", e)))
    }

    pub fn verify_admin_token(&self, token: &str) -> Result<AdminClaims> {
        let mut validation = Validation::default();
        validation.required_spec_claims.clear();
        let data = decode::<AdminTokenClaims>(
            token,
            &DecodingKey::from_secret(self.secret.as_bytes()),
            &validation,
        )
        .map_err(|_| PanelError::AuthFailed)?;
        let is_sudo = match data.claims.access.as_str() {
            "sudo" => true,
            "admin" => false,
            _ => return Err(PanelError::AuthFailed),
        };
        let issued_at =
            DateTime::from_timestamp(data.claims.iat, 0).ok_or(PanelError::AuthFailed)?;
        Ok(AdminClaims {
            username: data.claims.sub,
            is_sudo,
            issued_at,
        })
    }

    fn sub_signature(&self, payload_b64: &str) -> String {
        let digest = Sha256::digest(format!("{}{}", payload_b64, self.secret).as_bytes());
        URL_SAFE.encode(digest)[..SUB_SIGNATURE_LEN].to_string()
    }

    /// Mint an opaque subscription token for an account.
    pub fn create_subscription_token(&self, account_number: &str) -> String {
        let payload = format!("{},{}", account_number, Utc::now().timestamp());
        let payload_b64 = URL_SAFE_NO_PAD.encode(payload.as_bytes());
        let signature = self.sub_signature(&payload_b64);
        format!("{}{}", payload_b64, signature)
    }

    /// Verify integrity and unpack a subscription token. Business checks
    /// against the owning user happen in
    /// [`validate_subscription_claims`].
    pub fn verify_subscription_token(&self, token: &str) -> Result<SubscriptionClaims> {
        if token.len() < MIN_TOKEN_LEN {
            return Err(PanelError::AuthFailed);
        }
        let (payload_b64, signature) = token.split_at(token.len() - SUB_SIGNATURE_LEN);
        if self.sub_signature(payload_b64) != signature {
            return Err(PanelError::AuthFailed);
        }
        let payload_bytes = URL_SAFE_NO_PAD
            .decode(payload_b64.as_bytes())
            .map_err(|_| PanelError::AuthFailed)?;
        let payload = String::from_utf8(payload_bytes).map_err(|_| PanelError::AuthFailed)?;
        let (account_number, ts) = payload.split_once(',').ok_or(PanelError::AuthFailed)?;
        let ts: i64 = ts.parse().map_err(|_| PanelError::AuthFailed)?;
        let issued_at = DateTime::from_timestamp(ts, 0).ok_or(PanelError::AuthFailed)?;
        Ok(SubscriptionClaims {
            account_number: account_number.to_string(),
            issued_at,
        })
    }
}

/// A token is only as fresh as the account it names: anything issued before
/// the account existed or before the last revocation is rejected.
pub fn validate_subscription_claims(user: &User, claims: &SubscriptionClaims) -> Result<()> {
    if claims.issued_at.timestamp() < user.created_at.timestamp() {
        return Err(PanelError::AuthFailed);
    }
    if let Some(revoked_at) = user.sub_revoked_at {
        if claims.issued_at.timestamp() < revoked_at.timestamp() {
            return Err(PanelError::AuthFailed);
        }
    }
    Ok(())
}
