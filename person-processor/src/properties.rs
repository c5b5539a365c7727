//! Person property merge policy.
//!
//! Two distinct rules live here:
//! - [`apply`] folds one event's `$unset`, `$set` and `$set_once` operations into the
//!   current properties of a person. Per key the operations are evaluated in that order,
//!   so the result never depends on map iteration order.
//! - [`merge_for_survivor`] combines the properties of two persons being merged. The
//!   survivor's value wins every collision.

use crate::types::{Properties, PropertyOps};

/// Result of applying property operations.
#[derive(Debug, Clone, PartialEq)]
pub struct Applied {
    pub properties: Properties,
    /// False when the operations left the properties untouched and no write is needed.
    pub changed: bool,
}

pub fn apply(current: &Properties, ops: &PropertyOps) -> Applied {
    let mut properties = current.clone();

    for key in &ops.unset {
        properties.remove(key);
    }

    for (key, value) in &ops.set {
        properties.insert(key.clone(), value.clone());
    }

    for (key, value) in &ops.set_once {
        if !properties.contains_key(key) {
            properties.insert(key.clone(), value.clone());
        }
    }

    let changed = &properties != current;
    Applied {
        properties,
        changed,
    }
}

pub fn merge_for_survivor(survivor: &Properties, absorbed: &Properties) -> Properties {
    let mut merged = absorbed.clone();
    merged.extend(survivor.iter().map(|(k, v)| (k.clone(), v.clone())));
    merged
}
