//! Resource - Representing resources and their state

use std::collections::HashMap;

use serde_json::json;

/// Unique identifier for a resource
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceId {
    /// Resource type (e.g., "vpc", "rds_instance")
    pub resource_type: String,
    /// Resource name (the block name in configuration)
    pub name: String,
}

impl ResourceId {
    pub fn new(resource_type: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            resource_type: resource_type.into(),
            name: name.into(),
        }
    }

    /// Binding key used by references (`type.name`)
    pub fn binding(&self) -> String {
        format!("{}.{}", self.resource_type, self.name)
    }
}

impl std::fmt::Display for ResourceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.resource_type, self.name)
    }
}

/// Attribute value of a resource
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    String(String),
    Int(i64),
    Float(f64),
    Bool(bool),
    List(Vec<Value>),
    Map(HashMap<String, Value>),
    /// Reference to another resource's attribute (binding, attribute_name),
    /// where binding is `type.name`
    ResourceRef(String, String),
}

impl Value {
    /// Parse a `${type.name.attr}` reference out of a string, if it is one
    pub fn parse_reference(s: &str) -> Option<Value> {
        let inner = s.strip_prefix("${")?.strip_suffix('}')?;
        let (binding, attr) = inner.rsplit_once('.')?;
        if !binding.contains('.') || attr.is_empty() {
            return None;
        }
        Some(Value::ResourceRef(binding.to_string(), attr.to_string()))
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    /// Convert JSON into a Value. Strings of the form `${type.name.attr}`
    /// become references; `null` has no Value and yields None.
    pub fn from_json(value: &serde_json::Value) -> Option<Value> {
        match value {
            serde_json::Value::Null => None,
            serde_json::Value::String(s) => {
                Some(Value::parse_reference(s).unwrap_or_else(|| Value::String(s.clone())))
            }
            serde_json::Value::Bool(b) => Some(Value::Bool(*b)),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Some(Value::Int(i))
                } else {
                    n.as_f64().map(Value::Float)
                }
            }
            serde_json::Value::Array(arr) => {
                Some(Value::List(arr.iter().filter_map(Value::from_json).collect()))
            }
            serde_json::Value::Object(obj) => Some(Value::Map(
                obj.iter()
                    .filter_map(|(k, v)| Value::from_json(v).map(|v| (k.clone(), v)))
                    .collect(),
            )),
        }
    }

    /// Convert a Value into JSON. References are written back in `${...}` form.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::String(s) => json!(s),
            Value::Int(i) => json!(i),
            Value::Float(f) => json!(f),
            Value::Bool(b) => json!(b),
            Value::List(items) => {
                serde_json::Value::Array(items.iter().map(Value::to_json).collect())
            }
            Value::Map(map) => serde_json::Value::Object(
                map.iter().map(|(k, v)| (k.clone(), v.to_json())).collect(),
            ),
            Value::ResourceRef(binding, attr) => json!(format!("${{{}.{}}}", binding, attr)),
        }
    }

    /// Returns true if this value (or any nested value) is an unresolved reference
    pub fn has_reference(&self) -> bool {
        match self {
            Value::ResourceRef(_, _) => true,
            Value::List(items) => items.iter().any(Value::has_reference),
            Value::Map(map) => map.values().any(Value::has_reference),
            _ => false,
        }
    }
}

/// Convert an attribute map into a JSON object
pub fn attributes_to_json(attributes: &HashMap<String, Value>) -> serde_json::Value {
    serde_json::Value::Object(
        attributes
            .iter()
            .map(|(k, v)| (k.clone(), v.to_json()))
            .collect(),
    )
}

/// Convert a JSON object into an attribute map, dropping nulls
pub fn attributes_from_json(value: &serde_json::Value) -> HashMap<String, Value> {
    match value {
        serde_json::Value::Object(obj) => obj
            .iter()
            .filter_map(|(k, v)| Value::from_json(v).map(|v| (k.clone(), v)))
            .collect(),
        _ => HashMap::new(),
    }
}

/// Desired state declared in configuration
#[derive(Debug, Clone, PartialEq)]
pub struct Resource {
    pub id: ResourceId,
    pub attributes: HashMap<String, Value>,
    /// If true, this is a data source (read-only) that won't be modified
    pub read_only: bool,
}

impl Resource {
    pub fn new(resource_type: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: ResourceId::new(resource_type, name),
            attributes: HashMap::new(),
            read_only: false,
        }
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: Value) -> Self {
        self.attributes.insert(key.into(), value);
        self
    }

    pub fn with_read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    /// Returns true if this resource is a data source (read-only)
    pub fn is_data_source(&self) -> bool {
        self.read_only
    }

    /// Names of the resources this one references, as `type.name` bindings
    pub fn dependencies(&self) -> Vec<String> {
        fn collect(value: &Value, deps: &mut Vec<String>) {
            match value {
                Value::ResourceRef(binding, _) => {
                    if !deps.contains(binding) {
                        deps.push(binding.clone());
                    }
                }
                Value::List(items) => items.iter().for_each(|v| collect(v, deps)),
                Value::Map(map) => map.values().for_each(|v| collect(v, deps)),
                _ => {}
            }
        }

        let mut deps = Vec::new();
        for value in self.attributes.values() {
            collect(value, &mut deps);
        }
        deps.sort();
        deps
    }
}

/// Current state fetched from the cloud
#[derive(Debug, Clone, PartialEq)]
pub struct State {
    pub id: ResourceId,
    /// Cloud-side identifier (e.g., the VPC UUID)
    pub identifier: Option<String>,
    pub attributes: HashMap<String, Value>,
    /// Whether this state exists
    pub exists: bool,
}

impl State {
    pub fn not_found(id: ResourceId) -> Self {
        Self {
            id,
            identifier: None,
            attributes: HashMap::new(),
            exists: false,
        }
    }

    pub fn existing(id: ResourceId, attributes: HashMap<String, Value>) -> Self {
        Self {
            id,
            identifier: None,
            attributes,
            exists: true,
        }
    }

    pub fn with_identifier(mut self, identifier: impl Into<String>) -> Self {
        self.identifier = Some(identifier.into());
        self
    }

    /// Look up an attribute; `id` falls back to the identifier
    pub fn attribute(&self, name: &str) -> Option<Value> {
        match self.attributes.get(name) {
            Some(v) => Some(v.clone()),
            None if name == "id" => self.identifier.clone().map(Value::String),
            None => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_reference_string() {
        assert_eq!(
            Value::parse_reference("${vpc.main.id}"),
            Some(Value::ResourceRef("vpc.main".to_string(), "id".to_string()))
        );
        assert_eq!(Value::parse_reference("${vpc}"), None);
        assert_eq!(Value::parse_reference("plain"), None);
    }

    #[test]
    fn json_conversion_keeps_references() {
        let json = serde_json::json!({
            "vpc_id": "${vpc.main.id}",
            "cidr": "10.0.1.0/24",
            "dhcp_enable": true,
            "ignored": null
        });
        let attrs = attributes_from_json(&json);
        assert_eq!(attrs.len(), 3);
        assert!(attrs["vpc_id"].has_reference());
        assert_eq!(
            attributes_to_json(&attrs)["vpc_id"],
            serde_json::json!("${vpc.main.id}")
        );
    }

    #[test]
    fn resource_dependencies() {
        let resource = Resource::new("vpc_subnet", "web")
            .with_attribute(
                "vpc_id",
                Value::ResourceRef("vpc.main".to_string(), "id".to_string()),
            )
            .with_attribute(
                "tags",
                Value::List(vec![Value::ResourceRef(
                    "vpc.main".to_string(),
                    "name".to_string(),
                )]),
            );
        assert_eq!(resource.dependencies(), vec!["vpc.main".to_string()]);
    }

    #[test]
    fn state_id_attribute_falls_back_to_identifier() {
        let state = State::existing(ResourceId::new("vpc", "main"), HashMap::new())
            .with_identifier("vpc-123");
        assert_eq!(state.attribute("id"), Some(Value::String("vpc-123".into())));
        assert_eq!(state.attribute("name"), None);
    }
}
