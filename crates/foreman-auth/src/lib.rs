#![forbid(unsafe_code)]

//! **foreman-auth** – Authority tokens and webhook signature verification
//! for the Foreman control plane.
//!
//! Defines the canonical [`Claims`] embedded in every authority token and
//! the [`CapabilityToken`] / [`TokenValidator`] traits used by Guardian
//! interventions (§4.16) to check `authority ≥ required`. A bundled HS256
//! JWT implementation (`hs256::JwtHs256Token` / `hs256::JwtHs256Validator`)
//! backs the v0.1 deployment; other algorithms can be added behind crate
//! features without touching the trait contracts.
//!
//! The [`webhook`] module verifies inbound webhook signatures with a
//! constant-time HMAC-SHA256 comparison.

use serde::{Deserialize, Serialize};
use async_trait::async_trait;

/// Ordered authority level for Guardian interventions. `WORKER < WATCHDOG
/// < MONITOR < GUARDIAN`; an action that requires `authority ≥ GUARDIAN`
/// is rejected for any token whose `authority` ranks lower.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Authority {
    /// An ordinary task-executing agent. Cannot perform interventions.
    Worker,
    /// The Idle Sandbox Monitor and similar passive watchers.
    Watchdog,
    /// The Monitoring Loop driving Guardian/Conductor analyzers.
    Monitor,
    /// The Guardian itself; the only level permitted to execute
    /// interventions by default.
    Guardian,
}

impl Authority {
    /// Whether this authority is sufficient to act where `required` is demanded.
    pub fn satisfies(self, required: Authority) -> bool {
        self >= required
    }
}

/// Canonical claim set embedded in every authority token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    /// Subject – the agent or service identifier the token was minted for.
    pub sub: String,
    /// Authority level granted to the subject.
    pub authority: Authority,
    /// Issued-at timestamp (seconds since Unix epoch).
    pub iat: u64,
    /// Absolute expiry timestamp (seconds since Unix epoch).
    pub exp: u64,
    /// Unique token identifier (UUIDv4) for replay protection.
    pub jti: String,
}

/// Minimal in-crate error type.
#[derive(Debug)]
pub struct Error {
    msg: String,
}

impl Error {
    /// Construct an error carrying `msg`.
    pub fn new(msg: &str) -> Self {
        Self { msg: msg.into() }
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.msg.fmt(f)
    }
}

impl std::error::Error for Error {}

/// Crate result helper.
pub type Result<T> = std::result::Result<T, Error>;

/// Abstract behaviour common to all authority token formats.
#[async_trait]
pub trait CapabilityToken: Sized + Send + Sync {
    /// Mint a new token from raw `claims` using the provided secret key.
    async fn mint(claims: &Claims, key: &[u8]) -> Result<Self>;

    /// Return the serialized wire representation (e.g. a JWT string).
    fn as_str(&self) -> &str;
}

/// Verifier trait consulted before executing a Guardian intervention.
#[async_trait]
pub trait TokenValidator: Send + Sync {
    /// Verify authenticity and expiry, returning the embedded [`Claims`].
    async fn validate(&self, raw: &str) -> Result<Claims>;
}

/// HS256 JWT implementation of [`CapabilityToken`] / [`TokenValidator`].
pub mod hs256 {
    use super::{Authority, CapabilityToken, Claims, Error, Result, TokenValidator};
    use async_trait::async_trait;
    use jsonwebtoken::{
        decode, encode, Algorithm, DecodingKey, EncodingKey, Header, TokenData, Validation,
    };
    use std::time::{SystemTime, UNIX_EPOCH};
    use uuid::Uuid;

    /// Concrete JWT (HS256) authority token implementation.
    #[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
    pub struct JwtHs256Token {
        token: String,
    }

    impl JwtHs256Token {
        /// Decode and validate the token, returning [`Claims`] (expiry enforced).
        pub fn claims(&self, secret: &str) -> Result<Claims> {
            Self::decode_internal(&self.token, secret)
                .map(|d| d.claims)
                .map_err(|e| Error::new(&e.to_string()))
        }

        /// Quick authenticity, expiry, and authority check.
        pub fn is_valid_for(&self, secret: &str, required: Authority) -> bool {
            let data = match Self::decode_internal(&self.token, secret) {
                Ok(d) => d,
                Err(_) => return false,
            };
            let now = match SystemTime::now().duration_since(UNIX_EPOCH) {
                Ok(d) => d.as_secs(),
                Err(_) => return false,
            };
            now < data.claims.exp && data.claims.authority.satisfies(required)
        }

        fn decode_internal(
            token: &str,
            secret: &str,
        ) -> std::result::Result<TokenData<Claims>, jsonwebtoken::errors::Error> {
            let mut validation = Validation::new(Algorithm::HS256);
            validation.validate_exp = true;
            validation.leeway = 0;
            decode::<Claims>(token, &DecodingKey::from_secret(secret.as_bytes()), &validation)
        }

        /// Synchronous convenience constructor.
        pub fn new(subject: &str, authority: Authority, secret: &str, ttl_secs: u64) -> Result<Self> {
            let claims = build_claims(subject, authority, ttl_secs)?;
            let mut header = Header::new(Algorithm::HS256);
            header.typ = Some("foreman.authority+jwt".into());
            let jwt = encode(&header, &claims, &EncodingKey::from_secret(secret.as_bytes()))
                .map_err(|e| Error::new(&e.to_string()))?;
            Ok(Self { token: jwt })
        }
    }

    #[async_trait]
    impl CapabilityToken for JwtHs256Token {
        async fn mint(claims: &Claims, key: &[u8]) -> Result<Self> {
            let mut header = Header::new(Algorithm::HS256);
            header.typ = Some("foreman.authority+jwt".into());
            let jwt = encode(&header, claims, &EncodingKey::from_secret(key))
                .map_err(|e| Error::new(&e.to_string()))?;
            Ok(Self { token: jwt })
        }

        fn as_str(&self) -> &str {
            &self.token
        }
    }

    /// Build standard claims for `subject` at `authority`, valid for `ttl_secs`.
    pub fn build_claims(subject: &str, authority: Authority, ttl_secs: u64) -> Result<Claims> {
        let issued_at = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_err(|e| Error::new(&e.to_string()))?
            .as_secs();
        Ok(Claims {
            sub: subject.to_owned(),
            authority,
            iat: issued_at,
            exp: issued_at + ttl_secs,
            jti: Uuid::new_v4().to_string(),
        })
    }

    /// HS256 JWT validator bound to a single required authority level.
    #[derive(Clone, Debug)]
    pub struct JwtHs256Validator {
        secret: String,
        validation: Validation,
    }

    impl JwtHs256Validator {
        /// Construct a validator checking signatures against `secret`.
        pub fn new(secret: impl Into<String>) -> Self {
            let mut validation = Validation::new(Algorithm::HS256);
            validation.validate_exp = true;
            Self {
                secret: secret.into(),
                validation,
            }
        }
    }

    #[async_trait]
    impl TokenValidator for JwtHs256Validator {
        async fn validate(&self, raw: &str) -> Result<Claims> {
            let data = decode::<Claims>(
                raw,
                &DecodingKey::from_secret(self.secret.as_bytes()),
                &self.validation,
            )
            .map_err(|e| Error::new(&e.to_string()))?;
            Ok(data.claims)
        }
    }

    /// Glob-import helper.
    pub mod prelude {
        pub use super::{JwtHs256Token, JwtHs256Validator};
        pub use crate::{Authority, CapabilityToken, Claims, TokenValidator};
    }
}

/// Webhook signature verification, grounded in the control plane's
/// `hmac.compare_digest` check over `sha256=<hex>` signature headers.
pub mod webhook {
    use hmac::{Hmac, Mac};
    use sha2::Sha256;

    type HmacSha256 = Hmac<Sha256>;

    /// Errors raised while verifying an inbound webhook signature.
    #[derive(Debug, thiserror::Error)]
    pub enum WebhookError {
        /// The `sha256=<hex>` header was missing the expected prefix.
        #[error("signature header missing 'sha256=' prefix")]
        MissingPrefix,
        /// The hex digest could not be decoded.
        #[error("signature header is not valid hex")]
        InvalidHex,
        /// The computed digest did not match the supplied signature.
        #[error("signature mismatch")]
        Mismatch,
    }

    /// Verify `signature_header` (the raw `X-Hub-Signature-256`-style value,
    /// `"sha256=<hex>"`) against `body` under `secret`, using a
    /// constant-time comparison.
    pub fn verify_signature(
        secret: &[u8],
        body: &[u8],
        signature_header: &str,
    ) -> Result<(), WebhookError> {
        let hex_digest = signature_header
            .strip_prefix("sha256=")
            .ok_or(WebhookError::MissingPrefix)?;
        let expected = hex_decode(hex_digest).ok_or(WebhookError::InvalidHex)?;

        let mut mac = HmacSha256::new_from_slice(secret).expect("HMAC accepts any key length");
        mac.update(body);
        mac.verify_slice(&expected).map_err(|_| WebhookError::Mismatch)
    }

    fn hex_decode(s: &str) -> Option<Vec<u8>> {
        if s.len() % 2 != 0 {
            return None;
        }
        (0..s.len())
            .step_by(2)
            .map(|i| u8::from_str_radix(&s[i..i + 2], 16).ok())
            .collect()
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn accepts_a_correctly_signed_body() {
            let secret = b"shh";
            let body = b"{\"event\":\"task.completed\"}";
            let mut mac = HmacSha256::new_from_slice(secret).unwrap();
            mac.update(body);
            let digest = mac.finalize().into_bytes();
            let header = format!("sha256={}", hex_encode(&digest));
            assert!(verify_signature(secret, body, &header).is_ok());
        }

        #[test]
        fn rejects_a_tampered_body() {
            let secret = b"shh";
            let mut mac = HmacSha256::new_from_slice(secret).unwrap();
            mac.update(b"original");
            let digest = mac.finalize().into_bytes();
            let header = format!("sha256={}", hex_encode(&digest));
            assert!(matches!(
                verify_signature(secret, b"tampered", &header),
                Err(WebhookError::Mismatch)
            ));
        }

        #[test]
        fn rejects_a_header_without_the_sha256_prefix() {
            assert!(matches!(
                verify_signature(b"shh", b"body", "deadbeef"),
                Err(WebhookError::MissingPrefix)
            ));
        }

        fn hex_encode(bytes: &[u8]) -> String {
            bytes.iter().map(|b| format!("{:02x}", b)).collect()
        }
    }
}

/// Top-level convenience re-export of the HS256 implementation.
pub use hs256::prelude::*;

/// Single-line glob import for downstream crates.
pub mod prelude {
    pub use super::hs256::prelude::*;
    pub use super::{Authority, CapabilityToken, Claims, TokenValidator};
}
