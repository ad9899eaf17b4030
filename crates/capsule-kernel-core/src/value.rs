//! Frozen values: immutable snapshots of structured data.
//!
//! A [`Frozen`] owns a private deep copy of a JSON value behind an `Arc`.
//! It hands out shared references only, so once a proof captures its inputs
//! the caller's original object can change without affecting the record.

use std::fmt;
use std::ops::Deref;
use std::sync::Arc;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

use crate::canonical::canonical_json_bytes;
use crate::error::Result;

/// An immutable, cheaply clonable JSON value.
#[derive(Clone, PartialEq)]
pub struct Frozen(Arc<Value>);

impl Frozen {
    /// Freeze a copy of `value`.
    pub fn new(value: &Value) -> Self {
        Self(Arc::new(value.clone()))
    }

    /// Freeze an owned value without copying.
    pub fn from_owned(value: Value) -> Self {
        Self(Arc::new(value))
    }

    /// Borrow the frozen value.
    pub fn value(&self) -> &Value {
        &self.0
    }

    /// Return a mutable copy that is detached from this snapshot.
    pub fn thaw(&self) -> Value {
        (*self.0).clone()
    }

    /// Canonical CBOR bytes of the frozen value.
    pub fn canonical_bytes(&self) -> Result<Vec<u8>> {
        canonical_json_bytes(&self.0)
    }

    /// Look up a top-level field.
    pub fn field(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    /// True if the top-level field `key` is the boolean `true`.
    pub fn flag(&self, key: &str) -> bool {
        matches!(self.0.get(key), Some(Value::Bool(true)))
    }
}

impl Deref for Frozen {
    type Target = Value;

    fn deref(&self) -> &Value {
        &self.0
    }
}

impl From<Value> for Frozen {
    fn from(value: Value) -> Self {
        Self::from_owned(value)
    }
}

impl Default for Frozen {
    fn default() -> Self {
        Self::from_owned(Value::Null)
    }
}

impl fmt::Debug for Frozen {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Frozen({})", self.0)
    }
}

impl Serialize for Frozen {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        self.0.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Frozen {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        Value::deserialize(deserializer).map(Self::from_owned)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_caller_mutation_does_not_leak() {
        let mut original = json!({"hoursWorked": 80});
        let frozen = Frozen::new(&original);

        original["hoursWorked"] = json!(1);

        assert_eq!(frozen.field("hoursWorked"), Some(&json!(80)));
    }

    #[test]
    fn test_thaw_is_detached() {
        let frozen = Frozen::from(json!({"capped": true}));
        let mut copy = frozen.thaw();
        copy["capped"] = json!(false);
        assert!(frozen.flag("capped"));
    }

    #[test]
    fn test_clones_share_storage() {
        let frozen = Frozen::from(json!([1, 2, 3]));
        let other = frozen.clone();
        assert!(Arc::ptr_eq(&frozen.0, &other.0));
    }
}
