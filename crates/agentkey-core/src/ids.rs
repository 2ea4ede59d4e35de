//! Strongly typed identifiers.
//!
//! Every persisted entity is addressed by a UUID v4 wrapped in its own
//! newtype, so a checkout id can never be passed where a secret id is
//! expected. Services are named by the administrator and carried as
//! validated strings.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(Uuid);

        impl $name {
            /// Generate a fresh random id.
            #[must_use]
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            /// The underlying UUID.
            #[must_use]
            pub fn as_uuid(&self) -> Uuid {
                self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl From<Uuid> for $name {
            fn from(id: Uuid) -> Self {
                Self(id)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                fmt::Display::fmt(&self.0, f)
            }
        }

        impl FromStr for $name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Uuid::parse_str(s).map(Self)
            }
        }
    };
}

uuid_id!(
    /// An administrator-managed organization.
    TenantId
);
uuid_id!(
    /// An authenticated principal (administrator or agent).
    ActorId
);
uuid_id!(
    /// A checkout policy.
    PolicyId
);
uuid_id!(
    /// A stored upstream secret.
    SecretId
);
uuid_id!(
    /// A checkout record.
    CheckoutId
);
uuid_id!(
    /// A unit of quota capacity held by the tracker.
    ReservationId
);

/// Maximum length of a service name.
const MAX_SERVICE_LEN: usize = 64;

/// The name of an upstream service (e.g. `openai`, `stripe`).
///
/// Lowercase ASCII letters, digits, `-`, `_` and `.`, at most 64 bytes.
/// Input is trimmed and lowercased before validation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ServiceId(String);

impl ServiceId {
    /// Validate and normalize a service name.
    ///
    /// # Errors
    ///
    /// Returns a description of the problem if the name is empty, too long,
    /// or contains characters outside the allowed set.
    pub fn parse(raw: &str) -> Result<Self, String> {
        let name = raw.trim().to_ascii_lowercase();
        if name.is_empty() {
            return Err("service name must not be empty".to_owned());
        }
        if name.len() > MAX_SERVICE_LEN {
            return Err(format!("service name exceeds {MAX_SERVICE_LEN} bytes"));
        }
        if let Some(bad) = name
            .chars()
            .find(|&c| !(c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.')))
        {
            return Err(format!("service name contains invalid character '{bad}'"));
        }
        Ok(Self(name))
    }

    /// The normalized name.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for ServiceId {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<ServiceId> for String {
    fn from(id: ServiceId) -> Self {
        id.0
    }
}

impl fmt::Display for ServiceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
