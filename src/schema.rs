//! JSON-schema-subset compilation and matching.
//!
//! Queries carry a schema describing the object values the caller will
//! accept; the server is obliged to return only matching objects and the
//! client re-checks every message. Only the structural subset the protocol
//! needs is supported: `type`, `properties`, `required`, `items`, `enum`,
//! `const`, and boolean or schema-valued `additionalProperties`. The empty
//! schema `{}` matches everything.

use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

#[derive(Debug)]
pub enum SchemaError {
    NotAnObject,
    BadType(String),
    BadKeyword(&'static str, String),
}

impl fmt::Display for SchemaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SchemaError::NotAnObject => write!(f, "schema must be a json object"),
            SchemaError::BadType(name) => write!(f, "unknown type name: {name}"),
            SchemaError::BadKeyword(keyword, detail) => {
                write!(f, "bad {keyword} keyword: {detail}")
            }
        }
    }
}

impl std::error::Error for SchemaError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TypeName {
    Null,
    Boolean,
    Number,
    Integer,
    String,
    Array,
    Object,
}

impl TypeName {
    fn parse(name: &str) -> Result<Self, SchemaError> {
        match name {
            "null" => Ok(TypeName::Null),
            "boolean" => Ok(TypeName::Boolean),
            "number" => Ok(TypeName::Number),
            "integer" => Ok(TypeName::Integer),
            "string" => Ok(TypeName::String),
            "array" => Ok(TypeName::Array),
            "object" => Ok(TypeName::Object),
            other => Err(SchemaError::BadType(other.to_string())),
        }
    }

    fn matches(self, value: &Value) -> bool {
        match self {
            TypeName::Null => value.is_null(),
            TypeName::Boolean => value.is_boolean(),
            TypeName::Number => value.is_number(),
            TypeName::Integer => value.is_i64() || value.is_u64(),
            TypeName::String => value.is_string(),
            TypeName::Array => value.is_array(),
            TypeName::Object => value.is_object(),
        }
    }
}

#[derive(Debug, Clone)]
enum Additional {
    Allowed,
    Forbidden,
    Schema(Box<Schema>),
}

/// A compiled schema. Compile once with [`Schema::compile`], then match any
/// number of values.
#[derive(Debug, Clone)]
pub struct Schema {
    source: Value,
    types: Option<Vec<TypeName>>,
    const_value: Option<Value>,
    enum_values: Option<Vec<Value>>,
    properties: BTreeMap<String, Schema>,
    required: Vec<String>,
    items: Option<Box<Schema>>,
    additional: Additional,
}

impl Schema {
    /// Compile a JSON value into a matcher. Fails with [`SchemaError`] when
    /// the value is not a valid schema for the supported subset.
    pub fn compile(source: &Value) -> Result<Self, SchemaError> {
        let map = source.as_object().ok_or(SchemaError::NotAnObject)?;

        let types = match map.get("type") {
            None => None,
            Some(Value::String(name)) => Some(vec![TypeName::parse(name)?]),
            Some(Value::Array(names)) => {
                let mut parsed = Vec::with_capacity(names.len());
                for name in names {
                    let name = name
                        .as_str()
                        .ok_or_else(|| SchemaError::BadKeyword("type", "non-string entry".into()))?;
                    parsed.push(TypeName::parse(name)?);
                }
                Some(parsed)
            }
            Some(other) => {
                return Err(SchemaError::BadKeyword("type", format!("{other}")));
            }
        };

        let enum_values = match map.get("enum") {
            None => None,
            Some(Value::Array(values)) => Some(values.clone()),
            Some(other) => {
                return Err(SchemaError::BadKeyword("enum", format!("{other}")));
            }
        };

        let mut properties = BTreeMap::new();
        if let Some(value) = map.get("properties") {
            let props = value
                .as_object()
                .ok_or_else(|| SchemaError::BadKeyword("properties", "not an object".into()))?;
            for (name, sub) in props {
                properties.insert(name.clone(), Schema::compile(sub)?);
            }
        }

        let mut required = Vec::new();
        if let Some(value) = map.get("required") {
            let names = value
                .as_array()
                .ok_or_else(|| SchemaError::BadKeyword("required", "not an array".into()))?;
            for name in names {
                let name = name
                    .as_str()
                    .ok_or_else(|| SchemaError::BadKeyword("required", "non-string entry".into()))?;
                required.push(name.to_string());
            }
        }

        let items = match map.get("items") {
            None => None,
            Some(sub) => Some(Box::new(Schema::compile(sub)?)),
        };

        let additional = match map.get("additionalProperties") {
            None | Some(Value::Bool(true)) => Additional::Allowed,
            Some(Value::Bool(false)) => Additional::Forbidden,
            Some(sub) => Additional::Schema(Box::new(Schema::compile(sub)?)),
        };

        Ok(Schema {
            source: source.clone(),
            types,
            const_value: map.get("const").cloned(),
            enum_values,
            properties,
            required,
            items,
            additional,
        })
    }

    /// The schema that matches every value.
    pub fn any() -> Self {
        Schema {
            source: Value::Object(serde_json::Map::new()),
            types: None,
            const_value: None,
            enum_values: None,
            properties: BTreeMap::new(),
            required: Vec::new(),
            items: None,
            additional: Additional::Allowed,
        }
    }

    /// The source JSON the schema was compiled from; this is what travels
    /// on the wire and what cursor serialization embeds.
    pub fn as_value(&self) -> &Value {
        &self.source
    }

    /// Whether `value` satisfies the schema.
    pub fn matches(&self, value: &Value) -> bool {
        if let Some(types) = &self.types {
            if !types.iter().any(|t| t.matches(value)) {
                return false;
            }
        }
        if let Some(expected) = &self.const_value {
            if value != expected {
                return false;
            }
        }
        if let Some(allowed) = &self.enum_values {
            if !allowed.iter().any(|candidate| candidate == value) {
                return false;
            }
        }
        if let Some(map) = value.as_object() {
            for name in &self.required {
                if !map.contains_key(name) {
                    return false;
                }
            }
            for (name, entry) in map {
                match self.properties.get(name) {
                    Some(sub) => {
                        if !sub.matches(entry) {
                            return false;
                        }
                    }
                    None => match &self.additional {
                        Additional::Allowed => {}
                        Additional::Forbidden => return false,
                        Additional::Schema(sub) => {
                            if !sub.matches(entry) {
                                return false;
                            }
                        }
                    },
                }
            }
        }
        if let (Some(item_schema), Some(entries)) = (&self.items, value.as_array()) {
            for entry in entries {
                if !item_schema.matches(entry) {
                    return false;
                }
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn empty_schema_matches_anything() {
        let schema = Schema::any();
        assert!(schema.matches(&json!(null)));
        assert!(schema.matches(&json!({"m": "hi"})));
        assert!(schema.matches(&json!([1, 2, 3])));
    }

    #[test]
    fn type_and_required_are_enforced() {
        let schema = Schema::compile(&json!({
            "type": "object",
            "properties": {"m": {"type": "string"}},
            "required": ["m"],
        }))
        .unwrap();
        assert!(schema.matches(&json!({"m": "hi"})));
        assert!(!schema.matches(&json!({"m": 4})));
        assert!(!schema.matches(&json!({})));
        assert!(!schema.matches(&json!("hi")));
    }

    #[test]
    fn additional_properties_false_rejects_extras() {
        let schema = Schema::compile(&json!({
            "type": "object",
            "properties": {"x": {"type": "integer"}},
            "additionalProperties": false,
        }))
        .unwrap();
        assert!(schema.matches(&json!({"x": 1})));
        assert!(!schema.matches(&json!({"x": 1, "y": 2})));
    }

    #[test]
    fn items_and_enum_match_recursively() {
        let schema = Schema::compile(&json!({
            "type": "array",
            "items": {"enum": ["a", "b"]},
        }))
        .unwrap();
        assert!(schema.matches(&json!(["a", "b", "a"])));
        assert!(!schema.matches(&json!(["a", "c"])));
    }

    #[test]
    fn bad_schemas_fail_to_compile() {
        assert!(Schema::compile(&json!("string")).is_err());
        assert!(Schema::compile(&json!({"type": "whatever"})).is_err());
        assert!(Schema::compile(&json!({"required": [4]})).is_err());
    }
}
