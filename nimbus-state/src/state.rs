//! State file structures for persisting managed resources

use std::collections::HashMap;

use nimbus_core::resource::{ResourceId, State, Value, attributes_from_json};
use serde::{Deserialize, Serialize};

/// The state file written by a backend after every apply
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateFile {
    /// State file format version
    pub version: u32,
    /// Incremented on every write
    pub serial: u64,
    /// Identifies one history of state; two files with different lineages
    /// describe different infrastructure
    pub lineage: String,
    /// Version of Nimbus that last wrote this state
    pub nimbus_version: String,
    /// Managed resources, ordered by type then name
    pub resources: Vec<ResourceState>,
}

impl StateFile {
    /// Current state file format version
    pub const CURRENT_VERSION: u32 = 1;

    pub fn new() -> Self {
        Self::with_lineage(uuid::Uuid::new_v4().to_string())
    }

    pub fn with_lineage(lineage: String) -> Self {
        Self {
            version: Self::CURRENT_VERSION,
            serial: 0,
            lineage,
            nimbus_version: env!("CARGO_PKG_VERSION").to_string(),
            resources: Vec::new(),
        }
    }

    /// Prepare for a write: bump the serial and stamp the running version
    pub fn increment_serial(&mut self) {
        self.serial += 1;
        self.nimbus_version = env!("CARGO_PKG_VERSION").to_string();
    }

    pub fn find(&self, id: &ResourceId) -> Option<&ResourceState> {
        self.resources
            .iter()
            .find(|r| r.resource_type == id.resource_type && r.name == id.name)
    }

    /// Record a resource, replacing any previous entry for the same id
    pub fn upsert(&mut self, resource: ResourceState) {
        match self
            .resources
            .binary_search_by(|r| r.sort_key().cmp(&resource.sort_key()))
        {
            Ok(pos) => self.resources[pos] = resource,
            Err(pos) => self.resources.insert(pos, resource),
        }
    }

    pub fn remove(&mut self, id: &ResourceId) -> Option<ResourceState> {
        let pos = self
            .resources
            .iter()
            .position(|r| r.resource_type == id.resource_type && r.name == id.name)?;
        Some(self.resources.remove(pos))
    }

    /// Record the outcome of an operation: existing states are stored,
    /// states of deleted resources are dropped
    pub fn record(&mut self, state: &State) {
        if state.exists {
            self.upsert(ResourceState::from_state(state));
        } else {
            self.remove(&state.id);
        }
    }

    /// Every recorded resource as a core `State`
    pub fn states(&self) -> Vec<State> {
        self.resources.iter().map(ResourceState::to_state).collect()
    }
}

impl Default for StateFile {
    fn default() -> Self {
        Self::new()
    }
}

/// State of a single managed resource
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceState {
    /// Resource type (e.g., "vpc", "rds_instance")
    pub resource_type: String,
    /// Resource name (the block name in configuration)
    pub name: String,
    /// Cloud-side identifier
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identifier: Option<String>,
    /// Attributes as last read from the cloud
    pub attributes: HashMap<String, serde_json::Value>,
}

impl ResourceState {
    pub fn new(resource_type: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            resource_type: resource_type.into(),
            name: name.into(),
            identifier: None,
            attributes: HashMap::new(),
        }
    }

    pub fn with_identifier(mut self, identifier: impl Into<String>) -> Self {
        self.identifier = Some(identifier.into());
        self
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.attributes.insert(key.into(), value);
        self
    }

    pub fn id(&self) -> ResourceId {
        ResourceId::new(&self.resource_type, &self.name)
    }

    fn sort_key(&self) -> (&str, &str) {
        (&self.resource_type, &self.name)
    }

    pub fn from_state(state: &State) -> Self {
        Self {
            resource_type: state.id.resource_type.clone(),
            name: state.id.name.clone(),
            identifier: state.identifier.clone(),
            attributes: state
                .attributes
                .iter()
                .map(|(k, v)| (k.clone(), v.to_json()))
                .collect(),
        }
    }

    pub fn to_state(&self) -> State {
        let attributes: HashMap<String, Value> =
            attributes_from_json(&serde_json::Value::Object(
                self.attributes
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect(),
            ));
        let state = State::existing(self.id(), attributes);
        match self.identifier {
            Some(ref identifier) => state.with_identifier(identifier.clone()),
            None => state,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_state_file_new() {
        let state = StateFile::new();
        assert_eq!(state.version, StateFile::CURRENT_VERSION);
        assert_eq!(state.serial, 0);
        assert!(!state.lineage.is_empty());
        assert!(state.resources.is_empty());
    }

    #[test]
    fn test_upsert_keeps_order_and_replaces() {
        let mut state = StateFile::new();
        state.upsert(ResourceState::new("vpc_subnet", "web"));
        state.upsert(ResourceState::new("vpc", "main").with_identifier("vpc-1"));
        state.upsert(ResourceState::new("vpc", "main").with_identifier("vpc-2"));

        let ids: Vec<String> = state.resources.iter().map(|r| r.id().to_string()).collect();
        assert_eq!(ids, vec!["vpc.main", "vpc_subnet.web"]);
        assert_eq!(
            state.find(&ResourceId::new("vpc", "main")).unwrap().identifier.as_deref(),
            Some("vpc-2")
        );
    }

    #[test]
    fn test_record_removes_deleted_resources() {
        let mut state = StateFile::new();
        let id = ResourceId::new("vpc", "main");
        state.record(&State::existing(id.clone(), HashMap::new()).with_identifier("vpc-1"));
        assert!(state.find(&id).is_some());

        state.record(&State::not_found(id.clone()));
        assert!(state.find(&id).is_none());
    }

    #[test]
    fn test_core_state_conversion() {
        let resource = ResourceState::new("vpc_subnet", "web")
            .with_identifier("subnet-1")
            .with_attribute("cidr", json!("10.0.1.0/24"))
            .with_attribute("dhcp_enable", json!(true));

        let state = resource.to_state();
        assert!(state.exists);
        assert_eq!(state.attribute("id"), Some(Value::String("subnet-1".into())));
        assert_eq!(state.attributes.get("dhcp_enable"), Some(&Value::Bool(true)));
        assert_eq!(ResourceState::from_state(&state), resource);
    }

    #[test]
    fn test_identifier_is_optional_in_file() {
        let parsed: ResourceState = serde_json::from_value(json!({
            "resource_type": "vpc",
            "name": "main",
            "attributes": {}
        }))
        .unwrap();
        assert_eq!(parsed.identifier, None);
        assert!(!serde_json::to_string(&parsed).unwrap().contains("identifier"));
    }
}
