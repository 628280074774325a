//! Typed identifiers for the gateway.
//!
//! IDs are opaque String wrappers (serde-transparent). Request ids are
//! caller-generated and arrive as arbitrary strings; the gateway mints UUID v4
//! values for the ids it owns.

use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! typed_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Create from any string value.
            pub fn from_string(s: impl Into<String>) -> Self {
                Self(s.into())
            }

            /// View as string slice.
            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// True when the id is empty or whitespace only.
            pub fn is_blank(&self) -> bool {
                self.0.trim().is_empty()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

typed_id!(
    /// Caller-supplied identifier of one invocation, used to correlate audit records.
    RequestId
);
typed_id!(
    /// Identity of the caller; must match the capability token subject.
    CallerId
);
typed_id!(
    /// Identifier of a persisted audit event.
    EventId
);
typed_id!(
    /// Identifier returned by mutating adapters for the change they applied.
    ChangeId
);

impl EventId {
    pub fn new_uuid() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

impl Default for EventId {
    fn default() -> Self {
        Self::new_uuid()
    }
}

impl ChangeId {
    /// Mint a change id of the form `chg-<uuid>`.
    pub fn generate() -> Self {
        Self(format!("chg-{}", uuid::Uuid::new_v4().simple()))
    }
}
