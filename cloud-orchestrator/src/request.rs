//! Signed, time-limited instance requests.
//!
//! A tenant's request is not stored anywhere. It travels to an administrator
//! as a token `base64url(json) "." base64url(hmac-sha256(secret, json))` and
//! is verified again when approved or denied.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Duration, Utc};
use cloud_core::{CloudError, Result};
use cloud_provider::{InstanceKind, RequestDetail};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

const MAX_TTL_SECS: i64 = 10 * 365 * 24 * 3600;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceRequest {
    pub owner: String,
    pub hostname: String,
    pub kind: InstanceKind,
    pub detail: RequestDetail,
    /// Issued at, unix seconds.
    pub iat: i64,
    /// Expires at, unix seconds.
    pub exp: i64,
}

#[derive(Clone)]
pub struct RequestSigner {
    secret: Vec<u8>,
    ttl: Duration,
}

impl RequestSigner {
    pub fn new(secret: &str, ttl_secs: u64) -> Self {
        Self {
            secret: secret.as_bytes().to_vec(),
            ttl: Duration::seconds(i64::try_from(ttl_secs).unwrap_or(i64::MAX).min(MAX_TTL_SECS)),
        }
    }

    fn mac(&self) -> Result<HmacSha256> {
        HmacSha256::new_from_slice(&self.secret)
            .map_err(|e| CloudError::Unavailable(format!("invalid signing secret: {e}")))
    }

    pub fn request_at(
        &self,
        owner: &str,
        hostname: &str,
        kind: InstanceKind,
        detail: RequestDetail,
        now: DateTime<Utc>,
    ) -> InstanceRequest {
        InstanceRequest {
            owner: owner.to_string(),
            hostname: hostname.to_string(),
            kind,
            detail,
            iat: now.timestamp(),
            exp: now
                .checked_add_signed(self.ttl)
                .unwrap_or(DateTime::<Utc>::MAX_UTC)
                .timestamp(),
        }
    }

    /// Sign a new request valid from now for the configured lifetime.
    pub fn issue(
        &self,
        owner: &str,
        hostname: &str,
        kind: InstanceKind,
        detail: RequestDetail,
    ) -> Result<String> {
        self.sign(&self.request_at(owner, hostname, kind, detail, Utc::now()))
    }

    pub fn sign(&self, request: &InstanceRequest) -> Result<String> {
        let payload = serde_json::to_vec(request)
            .map_err(|e| CloudError::Unavailable(format!("cannot encode request: {e}")))?;
        let mut mac = self.mac()?;
        mac.update(&payload);
        let signature = mac.finalize().into_bytes();

        Ok(format!(
            "{}.{}",
            URL_SAFE_NO_PAD.encode(&payload),
            URL_SAFE_NO_PAD.encode(signature)
        ))
    }

    pub fn verify(&self, token: &str) -> Result<InstanceRequest> {
        self.verify_at(token, Utc::now())
    }

    pub fn verify_at(&self, token: &str, now: DateTime<Utc>) -> Result<InstanceRequest> {
        let malformed = || CloudError::Unavailable("malformed request token".to_string());

        let (payload, signature) = token.trim().split_once('.').ok_or_else(malformed)?;
        let payload = URL_SAFE_NO_PAD.decode(payload).map_err(|_| malformed())?;
        let signature = URL_SAFE_NO_PAD.decode(signature).map_err(|_| malformed())?;

        let mut mac = self.mac()?;
        mac.update(&payload);
        mac.verify_slice(&signature)
            .map_err(|_| CloudError::Unavailable("request token signature mismatch".to_string()))?;

        let request: InstanceRequest =
            serde_json::from_slice(&payload).map_err(|_| malformed())?;
        if now.timestamp() > request.exp {
            return Err(CloudError::Unavailable(format!(
                "request for {} by {} has expired",
                request.hostname, request.owner
            )));
        }
        Ok(request)
    }
}
