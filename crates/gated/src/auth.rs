//! Bearer-token verification.
//!
//! The gateway never issues tokens; it only checks signatures from the
//! configured issuer and extracts the claims payload. `TokenVerifier` is the
//! seam; `HmacVerifier` covers compact JWS HS256 tokens, `StaticVerifier` is
//! a deterministic resolver for single-node development and tests.

use std::path::Path;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use dashmap::DashMap;
use ring::hmac;
use serde::Deserialize;

use gated_core::error::{GateError, Result};

use crate::clock;

/// Verified token payload.
#[derive(Debug, Clone, Default)]
pub struct Claims {
    pub uid: i64,
    /// Source IP asserted by the issuer; overrides the socket peer address.
    pub ip: Option<String>,
    /// Remaining claims, forwarded to the back-end as JSON.
    pub values: serde_json::Map<String, serde_json::Value>,
}

pub trait TokenVerifier: Send + Sync {
    fn verify(&self, issuer: &str, token: &str) -> Result<Claims>;
}

#[derive(Debug, Deserialize)]
struct Header {
    alg: String,
    #[serde(default)]
    kid: String,
}

#[derive(Debug, Deserialize)]
struct Payload {
    iss: String,
    exp: i64,
    uid: i64,
    #[serde(default)]
    ip: Option<String>,
    #[serde(flatten)]
    values: serde_json::Map<String, serde_json::Value>,
}

/// Compact-JWS HS256 verifier. The key file holds the raw secret bytes.
pub struct HmacVerifier {
    key: hmac::Key,
    key_id: String,
}

impl HmacVerifier {
    pub fn from_file(path: impl AsRef<Path>, key_id: &str) -> Result<Self> {
        let secret = std::fs::read(path.as_ref())
            .map_err(|e| GateError::Internal(format!("read jwt key failed: {e}")))?;
        Ok(Self::from_secret(&secret, key_id))
    }

    pub fn from_secret(secret: &[u8], key_id: &str) -> Self {
        Self {
            key: hmac::Key::new(hmac::HMAC_SHA256, secret),
            key_id: key_id.to_string(),
        }
    }
}

fn decode_part(part: &str) -> Result<Vec<u8>> {
    URL_SAFE_NO_PAD
        .decode(part)
        .map_err(|_| GateError::Unauthorized)
}

impl TokenVerifier for HmacVerifier {
    fn verify(&self, issuer: &str, token: &str) -> Result<Claims> {
        let mut parts = token.split('.');
        let (Some(h), Some(p), Some(s), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(GateError::Unauthorized);
        };

        let header: Header =
            serde_json::from_slice(&decode_part(h)?).map_err(|_| GateError::Unauthorized)?;
        if header.alg != "HS256" {
            return Err(GateError::Unauthorized);
        }
        if !self.key_id.is_empty() && header.kid != self.key_id {
            return Err(GateError::Unauthorized);
        }

        let signing_input_len = h.len() + 1 + p.len();
        let signing_input = &token.as_bytes()[..signing_input_len];
        hmac::verify(&self.key, signing_input, &decode_part(s)?)
            .map_err(|_| GateError::Unauthorized)?;

        let payload: Payload =
            serde_json::from_slice(&decode_part(p)?).map_err(|_| GateError::Unauthorized)?;
        if payload.iss != issuer {
            return Err(GateError::Unauthorized);
        }
        if payload.exp <= clock::now_ms() / 1000 {
            return Err(GateError::Unauthorized);
        }

        Ok(Claims {
            uid: payload.uid,
            ip: payload.ip,
            values: payload.values,
        })
    }
}

/// Deterministic token resolver: token string → claims. Development and
/// test use only.
#[derive(Default)]
pub struct StaticVerifier {
    tokens: DashMap<String, Claims>,
}

impl StaticVerifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, token: impl Into<String>, claims: Claims) {
        self.tokens.insert(token.into(), claims);
    }
}

impl TokenVerifier for StaticVerifier {
    fn verify(&self, _issuer: &str, token: &str) -> Result<Claims> {
        self.tokens
            .get(token)
            .map(|c| c.value().clone())
            .ok_or(GateError::Unauthorized)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn sign(secret: &[u8], header: &str, payload: &str) -> String {
        let h = URL_SAFE_NO_PAD.encode(header);
        let p = URL_SAFE_NO_PAD.encode(payload);
        let input = format!("{h}.{p}");
        let key = hmac::Key::new(hmac::HMAC_SHA256, secret);
        let sig = hmac::sign(&key, input.as_bytes());
        format!("{input}.{}", URL_SAFE_NO_PAD.encode(sig.as_ref()))
    }

    #[test]
    fn verifies_valid_token() {
        let v = HmacVerifier::from_secret(b"secret", "k1");
        let exp = clock::now_ms() / 1000 + 3600;
        let token = sign(
            b"secret",
            r#"{"alg":"HS256","kid":"k1"}"#,
            &format!(
                r#"{{"iss":"gateway","exp":{exp},"uid":42,"ip":"203.0.113.7","device":"ios"}}"#
            ),
        );

        let claims = v.verify("gateway", &token).unwrap();
        assert_eq!(claims.uid, 42);
        assert_eq!(claims.ip.as_deref(), Some("203.0.113.7"));
        assert_eq!(claims.values.get("device").and_then(|v| v.as_str()), Some("ios"));
    }

    #[test]
    fn rejects_bad_signature() {
        let v = HmacVerifier::from_secret(b"secret", "");
        let exp = clock::now_ms() / 1000 + 3600;
        let token = sign(
            b"other-secret",
            r#"{"alg":"HS256"}"#,
            &format!(r#"{{"iss":"gateway","exp":{exp},"uid":42}}"#),
        );
        assert!(matches!(v.verify("gateway", &token), Err(GateError::Unauthorized)));
    }

    #[test]
    fn rejects_wrong_issuer_and_expired() {
        let v = HmacVerifier::from_secret(b"secret", "");
        let exp = clock::now_ms() / 1000 + 3600;
        let wrong_iss = sign(
            b"secret",
            r#"{"alg":"HS256"}"#,
            &format!(r#"{{"iss":"someone","exp":{exp},"uid":42}}"#),
        );
        assert!(v.verify("gateway", &wrong_iss).is_err());

        let expired = sign(
            b"secret",
            r#"{"alg":"HS256"}"#,
            r#"{"iss":"gateway","exp":1,"uid":42}"#,
        );
        assert!(v.verify("gateway", &expired).is_err());
    }

    #[test]
    fn rejects_kid_mismatch_and_malformed() {
        let v = HmacVerifier::from_secret(b"secret", "k1");
        let exp = clock::now_ms() / 1000 + 3600;
        let token = sign(
            b"secret",
            r#"{"alg":"HS256","kid":"other"}"#,
            &format!(r#"{{"iss":"gateway","exp":{exp},"uid":42}}"#),
        );
        assert!(v.verify("gateway", &token).is_err());
        assert!(v.verify("gateway", "not-a-token").is_err());
    }
}
