//! Context definitions: the wire-visible shape of an exposed context.

use serde::{Deserialize, Serialize};

/// Identifier of a definition, unique within the node that minted it.
pub type DefinitionId = u64;

/// A property exposed by a context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PropertyDef {
    /// Property name.
    pub name: String,
    /// Whether remote writes are rejected.
    #[serde(default)]
    pub readonly: bool,
}

/// Immutable description of one exposed context.
///
/// Captured once at attach time and transmitted verbatim; dispatchers check
/// every member access against it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Definition {
    /// Id of the stub backing this definition on its owning node.
    pub id: DefinitionId,
    /// Type name of the context (not necessarily its registration name).
    pub name: String,
    /// Free-form description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Public method names.
    #[serde(default)]
    pub methods: Vec<String>,
    /// Public properties.
    #[serde(default)]
    pub properties: Vec<PropertyDef>,
    /// Definition of the context that returned this one, for weak contexts.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<DefinitionId>,
}

impl Definition {
    /// Whether `name` is a public method.
    pub fn has_method(&self, name: &str) -> bool {
        self.methods.iter().any(|m| m == name)
    }

    /// Look up a public property by name.
    pub fn property(&self, name: &str) -> Option<&PropertyDef> {
        self.properties.iter().find(|p| p.name == name)
    }

    /// Whether this definition backs a context returned from a call.
    pub fn is_weak(&self) -> bool {
        self.parent_id.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Definition {
        Definition {
            id: 7,
            name: "A".into(),
            description: None,
            methods: vec!["method1".into()],
            properties: vec![PropertyDef {
                name: "prop".into(),
                readonly: true,
            }],
            parent_id: None,
        }
    }

    #[test]
    fn test_member_lookup() {
        let def = sample();
        assert!(def.has_method("method1"));
        assert!(!def.has_method("prop"));
        assert!(def.property("prop").is_some_and(|p| p.readonly));
        assert!(def.property("missing").is_none());
        assert!(!def.is_weak());
    }

    #[test]
    fn test_optional_fields_omitted() {
        let json = serde_json::to_value(sample()).unwrap();
        assert!(json.get("description").is_none());
        assert!(json.get("parent_id").is_none());
        let back: Definition = serde_json::from_value(json).unwrap();
        assert_eq!(back, sample());
    }
}
