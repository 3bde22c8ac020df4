//! Opaque identifiers for conversations and message authors
//!
//! Both ids are raw byte strings (a group id, a service id, ...). They compare
//! and hash by bytes, print as lowercase hex and serialize as hex strings.

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

macro_rules! byte_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name(Vec<u8>);

        impl $name {
            /// Create a new id from a byte slice
            pub fn from_slice(bytes: &[u8]) -> Self {
                Self(bytes.to_vec())
            }

            /// Parse an id from its hex representation
            pub fn from_hex(hex_str: &str) -> Result<Self, hex::FromHexError> {
                hex::decode(hex_str).map(Self)
            }

            /// Borrow the id bytes
            pub fn as_slice(&self) -> &[u8] {
                &self.0
            }

            /// Copy the id bytes into a new vector
            pub fn to_vec(&self) -> Vec<u8> {
                self.0.clone()
            }

            /// Lowercase hex representation
            pub fn to_hex(&self) -> String {
                hex::encode(&self.0)
            }

            /// Whether the id has no bytes at all
            pub fn is_empty(&self) -> bool {
                self.0.is_empty()
            }
        }

        impl From<Vec<u8>> for $name {
            fn from(bytes: Vec<u8>) -> Self {
                Self(bytes)
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self.to_hex())
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.to_hex())
            }
        }

        impl Serialize for $name {
            fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
            where
                S: Serializer,
            {
                serializer.serialize_str(&self.to_hex())
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
            where
                D: Deserializer<'de>,
            {
                let s: String = String::deserialize(deserializer)?;
                Self::from_hex(&s).map_err(serde::de::Error::custom)
            }
        }
    };
}

byte_id!(
    /// Identifier of a conversation (a 1:1 thread or a group)
    ConversationId
);

byte_id!(
    /// Identifier of the account that authored a message
    AuthorId
);
