//! Identifier and payload types shared by every call component.

use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! define_string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }

            pub fn is_empty(&self) -> bool {
                self.0.trim().is_empty()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }
    };
}

define_string_id! {
    /// Identifier of a call session.
    CallId
}

define_string_id! {
    /// Identifier of an application user, as resolved by the identity collaborator.
    UserId
}

define_string_id! {
    /// Identifier of the 1:1 conversation a call belongs to.
    ConversationId
}

impl CallId {
    /// Generate a fresh random call id (32 uppercase hex characters).
    pub fn generate() -> Self {
        let bytes: [u8; 16] = rand::random();
        Self(hex::encode_upper(bytes))
    }
}

/// Which side of the call a participant is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Caller,
    Receiver,
}

impl Role {
    /// The role on the other end of the call.
    pub fn peer(self) -> Self {
        match self {
            Self::Caller => Self::Receiver,
            Self::Receiver => Self::Caller,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Caller => f.write_str("caller"),
            Self::Receiver => f.write_str("receiver"),
        }
    }
}

/// Serialized SDP offer or answer. Never parsed by this crate.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionDescription(String);

/// Serialized ICE candidate. Never parsed by this crate.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IceCandidate(String);

macro_rules! impl_opaque_blob {
    ($($name:ident),*) => {
        $(
            impl $name {
                pub fn new(blob: impl Into<String>) -> Self {
                    Self(blob.into())
                }

                pub fn as_str(&self) -> &str {
                    &self.0
                }

                pub fn is_empty(&self) -> bool {
                    self.0.is_empty()
                }

                pub fn into_inner(self) -> String {
                    self.0
                }
            }

            impl From<&str> for $name {
                fn from(value: &str) -> Self {
                    Self(value.to_string())
                }
            }
        )*
    };
}

impl_opaque_blob!(SessionDescription, IceCandidate);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_call_ids_are_unique_hex() {
        let a = CallId::generate();
        let b = CallId::generate();

        assert_eq!(a.as_str().len(), 32);
        assert!(a.as_str().chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a, b);
    }

    #[test]
    fn test_role_peer_is_symmetric() {
        assert_eq!(Role::Caller.peer(), Role::Receiver);
        assert_eq!(Role::Receiver.peer(), Role::Caller);
        assert_eq!(Role::Caller.peer().peer(), Role::Caller);
    }

    #[test]
    fn test_blank_ids_are_empty() {
        assert!(UserId::new("   ").is_empty());
        assert!(!ConversationId::from("conv-1").is_empty());
    }
}
