//! Permission strings granted by capability tokens and required by tools.

use serde::{Deserialize, Serialize};

/// A permission such as `"scripts:run"` or `"config:write"`.
///
/// A granted permission ending in `*` covers every required permission that
/// starts with the part before the `*`; a lone `"*"` covers everything.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct Permission(pub String);

impl Permission {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether this (granted) permission covers `required`.
    pub fn covers(&self, required: &Permission) -> bool {
        if let Some(prefix) = self.0.strip_suffix('*') {
            prefix.is_empty() || required.0.starts_with(prefix)
        } else {
            self.0 == required.0
        }
    }
}

impl From<&str> for Permission {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}
