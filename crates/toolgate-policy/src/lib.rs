//! Capability verification and permission evaluation.
//!
//! - [`HmacSigner`] signs tokens, responses, and audit records with a key ring
//!   that supports rotation.
//! - [`CapabilityVerifier`] mints and checks bearer capability tokens.
//! - [`evaluate_permissions`] decides whether granted permissions cover what a
//!   tool requires.

mod signer;
mod token;

use indexmap::IndexSet;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use toolgate_protocol::Permission;

pub use signer::HmacSigner;
pub use token::{CapabilityClaims, CapabilityGrant, CapabilityVerifier, TokenRejection};

/// Minimum secret length accepted for HMAC keys.
pub const MIN_SECRET_BYTES: usize = 16;

#[derive(Debug, Error)]
pub enum PolicyError {
    #[error("signing key {key_id} is too short: {len} bytes, need at least {MIN_SECRET_BYTES}")]
    WeakKey { key_id: String, len: usize },
    #[error("signing key id must not be empty or contain ':'")]
    InvalidKeyId,
    #[error("duplicate signing key id: {0}")]
    DuplicateKey(String),
    #[error("failed to encode token claims: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Result of checking granted permissions against a tool's requirements.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PermissionEvaluation {
    pub allowed: Vec<Permission>,
    pub denied: Vec<Permission>,
}

impl PermissionEvaluation {
    pub fn is_allowed(&self) -> bool {
        self.denied.is_empty()
    }
}

pub fn evaluate_permissions(granted: &[Permission], required: &[Permission]) -> PermissionEvaluation {
    let mut allowed = IndexSet::new();
    let mut denied = IndexSet::new();

    for permission in required {
        if granted.iter().any(|held| held.covers(permission)) {
            allowed.insert(permission.clone());
        } else {
            denied.insert(permission.clone());
        }
    }

    PermissionEvaluation {
        allowed: allowed.into_iter().collect(),
        denied: denied.into_iter().collect(),
    }
}
