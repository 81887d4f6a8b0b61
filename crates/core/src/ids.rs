use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

macro_rules! uuid_id {
    ($name:ident) => {
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        pub struct $name(Uuid);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::now_v7())
            }

            pub fn parse(s: &str) -> Result<Self, crate::CoreError> {
                Uuid::parse_str(s)
                    .map(Self)
                    .map_err(|e| crate::CoreError::InvalidData(e.to_string()))
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), &self.0.to_string()[..8])
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

uuid_id!(DraftActionId);

/// Prefix of every client-generated record id. Server ids never carry it.
pub const DRAFT_RECORD_ID_PREFIX: &str = "DRAFT-";

pub const RECORD_KEY_PREFIX: &str = "UiApi::RecordRepresentation:";

const FIELD_KEY_SEPARATOR: &str = "__fields__";

/// Generate a temporary id for a record that only exists as a create draft.
pub fn generate_draft_record_id(key_prefix: &str) -> String {
    format!(
        "{DRAFT_RECORD_ID_PREFIX}{key_prefix}-{}",
        Uuid::now_v7().simple()
    )
}

pub fn is_draft_record_id(id: &str) -> bool {
    id.starts_with(DRAFT_RECORD_ID_PREFIX)
}

pub fn record_key(record_id: &str) -> String {
    format!("{RECORD_KEY_PREFIX}{record_id}")
}

pub fn field_key(record_key: &str, field_name: &str) -> String {
    format!("{record_key}{FIELD_KEY_SEPARATOR}{field_name}")
}

/// True for `UiApi::RecordRepresentation:<id>`, false for field keys and anything else.
pub fn is_record_key(key: &str) -> bool {
    key.starts_with(RECORD_KEY_PREFIX) && !key.contains(FIELD_KEY_SEPARATOR)
}

pub fn is_field_key(key: &str) -> bool {
    key.starts_with(RECORD_KEY_PREFIX) && key.contains(FIELD_KEY_SEPARATOR)
}

pub fn record_id_from_key(key: &str) -> Option<&str> {
    if !is_record_key(key) {
        return None;
    }
    key.strip_prefix(RECORD_KEY_PREFIX).filter(|id| !id.is_empty())
}

/// Split a field key into `(record_key, field_name)`.
pub fn split_field_key(key: &str) -> Option<(&str, &str)> {
    if !key.starts_with(RECORD_KEY_PREFIX) {
        return None;
    }
    key.split_once(FIELD_KEY_SEPARATOR)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_and_field_keys() {
        let key = record_key("001xyz");
        assert_eq!(key, "UiApi::RecordRepresentation:001xyz");
        assert!(is_record_key(&key));
        assert_eq!(record_id_from_key(&key), Some("001xyz"));

        let fkey = field_key(&key, "Name");
        assert!(is_field_key(&fkey));
        assert!(!is_record_key(&fkey));
        assert_eq!(split_field_key(&fkey), Some((key.as_str(), "Name")));
        assert_eq!(record_id_from_key(&fkey), None);
    }

    #[test]
    fn unrelated_keys_are_not_records() {
        assert!(!is_record_key("ObjectInfo::Account"));
        assert!(split_field_key("ObjectInfo::Account__fields__Name").is_none());
        assert_eq!(record_id_from_key(RECORD_KEY_PREFIX), None);
    }

    #[test]
    fn draft_ids_are_recognizable() {
        let a = generate_draft_record_id("001");
        let b = generate_draft_record_id("001");
        assert!(is_draft_record_id(&a));
        assert!(a.starts_with("DRAFT-001-"));
        assert_ne!(a, b);
        assert!(!is_draft_record_id("001xyz"));
    }

    #[test]
    fn action_id_parse_roundtrip() {
        let id = DraftActionId::new();
        assert_eq!(DraftActionId::parse(&id.to_string()).unwrap(), id);
        assert!(DraftActionId::parse("not-a-uuid").is_err());
    }
}
