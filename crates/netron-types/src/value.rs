//! Values carried by get/set/call results.

use crate::definition::{Definition, DefinitionId};
use serde::{Deserialize, Serialize};

/// Result of a remote get or call, or one argument of a call.
///
/// `Undefined` is distinct from JSON `null`: a property holding `null` is
/// returned as such, while an unset property lets the caller's default apply.
/// A `Definition` means the sender handed over a context, now reachable
/// through a weak stub on the sender's node. A `Reference` points back at a
/// context living on the receiver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum WireValue {
    Undefined,
    Value(serde_json::Value),
    Definition(Definition),
    Reference(DefinitionId),
}

impl From<serde_json::Value> for WireValue {
    fn from(value: serde_json::Value) -> Self {
        WireValue::Value(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_null_is_not_undefined() {
        let null = serde_json::to_value(WireValue::Value(json!(null))).unwrap();
        let undefined = serde_json::to_value(WireValue::Undefined).unwrap();
        assert_ne!(null, undefined);

        let back: WireValue = serde_json::from_value(undefined).unwrap();
        assert_eq!(back, WireValue::Undefined);
        let back: WireValue = serde_json::from_value(null).unwrap();
        assert_eq!(back, WireValue::Value(json!(null)));
    }

    #[test]
    fn test_reference_layout() {
        let json = serde_json::to_value(WireValue::Reference(12)).unwrap();
        assert_eq!(json, json!({"kind": "reference", "value": 12}));
    }
}
