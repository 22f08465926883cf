use std::borrow::Borrow;
use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

// Macro keeps all ID wrappers structurally identical; server and client ids share one shape.
macro_rules! define_string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(raw: impl Into<String>) -> Self {
                Self(raw.into())
            }

            /// Mints a client-side id. UUIDv7 keeps locally created ids time-ordered.
            pub fn generate() -> Self {
                Self(Uuid::now_v7().to_string())
            }

            /// Parses untrusted input, rejecting empty or whitespace-only values.
            pub fn parse(raw: &str) -> Option<Self> {
                let trimmed = raw.trim();
                if trimmed.is_empty() {
                    None
                } else {
                    Some(Self(trimmed.to_string()))
                }
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }

            pub fn is_blank(&self) -> bool {
                self.0.trim().is_empty()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
                formatter.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self::new(value)
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }

        impl From<$name> for String {
            fn from(value: $name) -> Self {
                value.0
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl Borrow<str> for $name {
            fn borrow(&self) -> &str {
                &self.0
            }
        }
    };
}

define_string_id!(
    /// Stable identifier for one conversation, assigned by the URL, the client, or the server.
    ConversationId
);
define_string_id!(
    /// Identifier for one message, unique within its conversation.
    MessageId
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_rejects_blank_input() {
        assert_eq!(ConversationId::parse("   "), None);
        assert_eq!(ConversationId::parse(""), None);
        assert_eq!(
            ConversationId::parse("  c123 "),
            Some(ConversationId::new("c123"))
        );
    }

    #[test]
    fn generated_ids_are_unique_and_non_blank() {
        let first = MessageId::generate();
        let second = MessageId::generate();
        assert_ne!(first, second);
        assert!(!first.is_blank());
    }

    #[test]
    fn ids_serialize_as_plain_strings() {
        let id = MessageId::new("m-1");
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"m-1\"");
    }
}
