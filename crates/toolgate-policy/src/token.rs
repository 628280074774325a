use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use toolgate_protocol::{Permission, Signer};
use tracing::debug;

use crate::PolicyError;

/// What an issuer grants: the subject and its permissions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilityGrant {
    pub subject: String,
    pub permissions: Vec<Permission>,
}

impl CapabilityGrant {
    pub fn new(subject: impl Into<String>, permissions: Vec<Permission>) -> Self {
        Self {
            subject: subject.into(),
            permissions,
        }
    }
}

/// Claims carried inside a capability token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilityClaims {
    pub sub: String,
    pub permissions: Vec<Permission>,
    /// Issued-at, unix seconds.
    pub iat: i64,
    /// Expiry, unix seconds. The token is invalid from this instant on.
    pub exp: i64,
    /// Unique token id. Absent on tokens minted by issuers that do not set one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jti: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TokenRejection {
    #[error("token is malformed")]
    Malformed,
    #[error("token signature is invalid")]
    BadSignature,
    #[error("token has expired")]
    Expired,
}

/// Mints and verifies capability tokens.
///
/// Wire format: `base64url(claims json) "." signature`, where the signature is
/// produced by the shared [`Signer`] over the encoded claims segment.
#[derive(Clone)]
pub struct CapabilityVerifier {
    signer: Arc<dyn Signer>,
}

impl CapabilityVerifier {
    pub fn new(signer: Arc<dyn Signer>) -> Self {
        Self { signer }
    }

    pub fn generate_token(
        &self,
        grant: &CapabilityGrant,
        ttl: Duration,
    ) -> Result<String, PolicyError> {
        self.generate_token_at(grant, ttl, Utc::now())
    }

    pub fn generate_token_at(
        &self,
        grant: &CapabilityGrant,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<String, PolicyError> {
        let iat = now.timestamp();
        let ttl_secs = i64::try_from(ttl.as_secs()).unwrap_or(i64::MAX);
        let claims = CapabilityClaims {
            sub: grant.subject.clone(),
            permissions: grant.permissions.clone(),
            iat,
            exp: iat.saturating_add(ttl_secs),
            jti: Some(uuid::Uuid::new_v4().to_string()),
        };
        let encoded = URL_SAFE_NO_PAD.encode(serde_json::to_vec(&claims)?);
        let signature = self.signer.sign(encoded.as_bytes());
        Ok(format!("{encoded}.{signature}"))
    }

    /// True when the token is well-formed, correctly signed, and unexpired.
    pub fn verify(&self, token: &str) -> bool {
        self.check(token).is_ok()
    }

    pub fn claims(&self, token: &str) -> Option<CapabilityClaims> {
        self.check(token).ok()
    }

    pub fn check(&self, token: &str) -> Result<CapabilityClaims, TokenRejection> {
        self.check_at(token, Utc::now())
    }

    pub fn check_at(
        &self,
        token: &str,
        now: DateTime<Utc>,
    ) -> Result<CapabilityClaims, TokenRejection> {
        let result = self.inspect(token, now);
        if let Err(rejection) = &result {
            debug!(%rejection, "capability token rejected");
        }
        result
    }

    fn inspect(&self, token: &str, now: DateTime<Utc>) -> Result<CapabilityClaims, TokenRejection> {
        let (encoded, signature) = token
            .trim()
            .split_once('.')
            .ok_or(TokenRejection::Malformed)?;
        if encoded.is_empty() || signature.is_empty() {
            return Err(TokenRejection::Malformed);
        }
        if !self.signer.verify(encoded.as_bytes(), signature) {
            return Err(TokenRejection::BadSignature);
        }
        let raw = URL_SAFE_NO_PAD
            .decode(encoded)
            .map_err(|_| TokenRejection::Malformed)?;
        let claims: CapabilityClaims =
            serde_json::from_slice(&raw).map_err(|_| TokenRejection::Malformed)?;
        if claims.sub.trim().is_empty() {
            return Err(TokenRejection::Malformed);
        }
        if now.timestamp() >= claims.exp {
            return Err(TokenRejection::Expired);
        }
        Ok(claims)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::HmacSigner;

    fn verifier(key_id: &str, secret: &[u8]) -> CapabilityVerifier {
        CapabilityVerifier::new(Arc::new(HmacSigner::new(key_id, secret).unwrap()))
    }

    fn grant() -> CapabilityGrant {
        CapabilityGrant::new(
            "agent-7",
            vec![Permission::new("scripts:run"), Permission::new("metrics:*")],
        )
    }

    #[test]
    fn generated_token_verifies_and_carries_claims() {
        let verifier = verifier("k1", b"token-secret-0123456789");
        let token = verifier
            .generate_token(&grant(), Duration::from_secs(300))
            .unwrap();

        assert!(verifier.verify(&token));
        let claims = verifier.claims(&token).unwrap();
        assert_eq!(claims.sub, "agent-7");
        assert_eq!(claims.permissions.len(), 2);
        assert_eq!(claims.exp - claims.iat, 300);
    }

    #[test]
    fn expired_token_is_rejected() {
        let verifier = verifier("k1", b"token-secret-0123456789");
        let issued = Utc::now() - chrono::Duration::seconds(120);
        let token = verifier
            .generate_token_at(&grant(), Duration::from_secs(60), issued)
            .unwrap();

        assert!(!verifier.verify(&token));
        assert_eq!(verifier.check(&token), Err(TokenRejection::Expired));
    }

    #[test]
    fn token_from_other_key_is_rejected() {
        let issuer = verifier("k1", b"token-secret-0123456789");
        let other = verifier("k1", b"a-different-secret-value");
        let token = issuer
            .generate_token(&grant(), Duration::from_secs(60))
            .unwrap();
        assert_eq!(other.check(&token), Err(TokenRejection::BadSignature));
    }

    #[test]
    fn tampered_claims_break_the_signature() {
        let verifier = verifier("k1", b"token-secret-0123456789");
        let token = verifier
            .generate_token(&grant(), Duration::from_secs(60))
            .unwrap();
        let (_, signature) = token.split_once('.').unwrap();

        let forged_claims = CapabilityClaims {
            sub: "agent-7".into(),
            permissions: vec![Permission::new("*")],
            iat: 0,
            exp: i64::MAX,
            jti: Some("forged".into()),
        };
        let forged = format!(
            "{}.{signature}",
            URL_SAFE_NO_PAD.encode(serde_json::to_vec(&forged_claims).unwrap())
        );
        assert!(!verifier.verify(&forged));
    }

    #[test]
    fn token_without_jti_is_accepted() {
        let signer = HmacSigner::new("k1", b"token-secret-0123456789").unwrap();
        let claims = serde_json::json!({
            "sub": "agent-7",
            "permissions": ["scripts:run"],
            "iat": Utc::now().timestamp(),
            "exp": Utc::now().timestamp() + 60,
        });
        let encoded = URL_SAFE_NO_PAD.encode(serde_json::to_vec(&claims).unwrap());
        let token = format!("{encoded}.{}", signer.sign(encoded.as_bytes()));

        let verifier = CapabilityVerifier::new(Arc::new(signer));
        let accepted = verifier.check(&token).unwrap();
        assert_eq!(accepted.jti, None);
        assert_eq!(accepted.sub, "agent-7");
    }

    #[test]
    fn generated_tokens_carry_distinct_ids() {
        let verifier = verifier("k1", b"token-secret-0123456789");
        let first = verifier.generate_token(&grant(), Duration::from_secs(60)).unwrap();
        let second = verifier.generate_token(&grant(), Duration::from_secs(60)).unwrap();
        let first_id = verifier.claims(&first).and_then(|claims| claims.jti);
        assert!(first_id.is_some());
        assert_ne!(first_id, verifier.claims(&second).and_then(|claims| claims.jti));
    }

    #[test]
    fn structural_garbage_never_panics() {
        let verifier = verifier("k1", b"token-secret-0123456789");
        for token in ["", ".", "abc", "abc.", ".sig", "%%%.k1:00", "a.b.c"] {
            assert!(!verifier.verify(token), "accepted {token:?}");
        }
        assert_eq!(verifier.check("abc"), Err(TokenRejection::Malformed));
    }
}
