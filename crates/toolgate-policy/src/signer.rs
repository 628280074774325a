use std::fmt;

use hmac::{Hmac, Mac};
use indexmap::IndexMap;
use sha2::Sha256;
use subtle::ConstantTimeEq;
use toolgate_protocol::Signer;

use crate::{MIN_SECRET_BYTES, PolicyError};

type HmacSha256 = Hmac<Sha256>;

/// HMAC-SHA256 signer over a key ring.
///
/// New signatures always use the active key. Retired keys stay in the ring for
/// verification only, so records signed before a rotation keep verifying.
/// Signatures have the form `<key_id>:<hex mac>`.
#[derive(Clone)]
pub struct HmacSigner {
    active_key_id: String,
    keys: IndexMap<String, HmacSha256>,
}

impl HmacSigner {
    pub fn new(key_id: impl Into<String>, secret: &[u8]) -> Result<Self, PolicyError> {
        let key_id = key_id.into();
        let mac = keyed_mac(&key_id, secret)?;
        let mut keys = IndexMap::new();
        keys.insert(key_id.clone(), mac);
        Ok(Self {
            active_key_id: key_id,
            keys,
        })
    }

    /// Add a verification-only key.
    pub fn with_retired_key(
        mut self,
        key_id: impl Into<String>,
        secret: &[u8],
    ) -> Result<Self, PolicyError> {
        let key_id = key_id.into();
        if self.keys.contains_key(&key_id) {
            return Err(PolicyError::DuplicateKey(key_id));
        }
        let mac = keyed_mac(&key_id, secret)?;
        self.keys.insert(key_id, mac);
        Ok(self)
    }

    pub fn key_ids(&self) -> impl Iterator<Item = &str> {
        self.keys.keys().map(String::as_str)
    }

    fn compute(mac: &HmacSha256, payload: &[u8]) -> Vec<u8> {
        let mut mac = mac.clone();
        mac.update(payload);
        mac.finalize().into_bytes().to_vec()
    }
}

fn keyed_mac(key_id: &str, secret: &[u8]) -> Result<HmacSha256, PolicyError> {
    if key_id.is_empty() || key_id.contains(':') {
        return Err(PolicyError::InvalidKeyId);
    }
    if secret.len() < MIN_SECRET_BYTES {
        return Err(PolicyError::WeakKey {
            key_id: key_id.to_owned(),
            len: secret.len(),
        });
    }
    HmacSha256::new_from_slice(secret).map_err(|_| PolicyError::WeakKey {
        key_id: key_id.to_owned(),
        len: secret.len(),
    })
}

impl Signer for HmacSigner {
    fn key_id(&self) -> &str {
        &self.active_key_id
    }

    fn sign(&self, payload: &[u8]) -> String {
        let digest = self
            .keys
            .get(&self.active_key_id)
            .map(|mac| Self::compute(mac, payload))
            .unwrap_or_default();
        format!("{}:{}", self.active_key_id, hex::encode(digest))
    }

    fn verify(&self, payload: &[u8], signature: &str) -> bool {
        let Some((key_id, encoded)) = signature.split_once(':') else {
            return false;
        };
        let Some(mac) = self.keys.get(key_id) else {
            return false;
        };
        let Ok(expected) = hex::decode(encoded) else {
            return false;
        };
        let actual = Self::compute(mac, payload);
        if expected.len() != actual.len() {
            return false;
        }
        expected.ct_eq(actual.as_slice()).into()
    }
}

impl fmt::Debug for HmacSigner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HmacSigner")
            .field("active_key_id", &self.active_key_id)
            .field("key_ids", &self.keys.keys().collect::<Vec<_>>())
            .finish()
    }
}
