use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Row ids assigned by the persistence gateway.
macro_rules! define_row_id {
    ($name:ident) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(i64);

        impl $name {
            pub fn new(value: i64) -> Self {
                Self(value)
            }

            pub fn get(self) -> i64 {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<i64> for $name {
            fn from(value: i64) -> Self {
                Self(value)
            }
        }

        impl From<$name> for i64 {
            fn from(value: $name) -> Self {
                value.0
            }
        }
    };
}

macro_rules! define_uuid_id {
    ($name:ident) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(Uuid);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            pub fn from_uuid(uuid: Uuid) -> Self {
                Self(uuid)
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

        impl From<Uuid> for $name {
            fn from(value: Uuid) -> Self {
                Self(value)
            }
        }

        impl From<$name> for Uuid {
            fn from(value: $name) -> Self {
                value.0
            }
        }
    };
}

// Persistence rows
define_row_id!(SessionId);
define_row_id!(PlayerId);
define_row_id!(RollId);

// Queue envelopes (also the idempotency key for applied commands)
define_uuid_id!(EnvelopeId);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn row_ids_serialize_as_plain_integers() {
        let id = SessionId::new(7);
        assert_eq!(serde_json::to_string(&id).expect("serialize"), "7");
        let back: SessionId = serde_json::from_str("7").expect("deserialize");
        assert_eq!(back, id);
    }

    #[test]
    fn row_ids_order_by_value() {
        assert!(SessionId::new(1) < SessionId::new(2));
    }

    #[test]
    fn envelope_ids_are_unique() {
        assert_ne!(EnvelopeId::new(), EnvelopeId::new());
    }
}
