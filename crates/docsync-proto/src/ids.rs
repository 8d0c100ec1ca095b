//! Newtype identifiers used throughout the message model.
//!
//! Each id wraps an opaque string (UUID-generated, not a node-local counter), since ids here
//! must be globally unique across broker nodes.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! string_id {
    ($name:ident) => {
        #[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name(pub String);

        impl $name {
            /// Generates a fresh random id.
            pub fn generate() -> Self {
                Self(Uuid::new_v4().to_string())
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
    };
}

string_id!(MessageId);
string_id!(ClientId);
string_id!(UserId);
string_id!(SessionId);

/// A client-facing document name, e.g. `"notes/todo"`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DocumentName(pub String);

impl DocumentName {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DocumentName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for DocumentName {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for DocumentName {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// The namespaced key used for storage and pub/sub topics: `"{room.len()}:{room}/{document}"`
/// when a non-empty room is present, else just `"{document}"`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NamespacedDocId(pub String);

impl NamespacedDocId {
    /// The room's byte length is prefixed so a `/` inside `room` or `document` can never shift
    /// the room/document boundary and collide two distinct pairs onto the same key.
    pub fn compute(document: &DocumentName, room: Option<&str>) -> Self {
        match room {
            Some(r) if !r.is_empty() => Self(format!("{}:{r}/{document}", r.len(), document = document.0)),
            _ => Self(document.0.clone()),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NamespacedDocId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn namespaced_id_without_room_is_bare_document() {
        let doc = DocumentName::from("todo");
        assert_eq!(NamespacedDocId::compute(&doc, None).as_str(), "todo");
        assert_eq!(NamespacedDocId::compute(&doc, Some("")).as_str(), "todo");
    }

    #[test]
    fn namespaced_id_with_room_is_prefixed() {
        let doc = DocumentName::from("todo");
        assert_eq!(
            NamespacedDocId::compute(&doc, Some("team-a")).as_str(),
            "6:team-a/todo"
        );
    }

    #[test]
    fn room_and_document_boundary_cannot_be_shifted_by_embedded_slashes() {
        let a = NamespacedDocId::compute(&DocumentName::from("shared/doc"), Some("tenantA"));
        let b = NamespacedDocId::compute(&DocumentName::from("doc"), Some("tenantA/shared"));
        assert_ne!(a, b);
    }

    #[test]
    fn generated_ids_are_unique() {
        assert_ne!(MessageId::generate(), MessageId::generate());
    }
}
