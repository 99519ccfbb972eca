use std::fmt;

use serde::{Deserialize, Serialize};

/// Server-issued number authorizing one state-changing transaction.
pub type TransactionNumber = u64;

/// Per-context sequence number echoed by the server in its reply.
pub type RequestNumber = u64;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(id: &str) -> Self {
                Self(id.to_owned())
            }
        }
    };
}

string_id!(
    /// Client-side cryptographic actor (a "nym").
    IdentityId
);
string_id!(
    /// Notary that countersigns this client's transactions.
    ServerId
);
string_id!(AccountId);
string_id!(
    /// Instrument definition an account is denominated in.
    UnitId
);
