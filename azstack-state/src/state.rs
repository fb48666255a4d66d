//! State file structures for persisting infrastructure state

use std::collections::HashMap;

use azstack_core::resource::{ResourceId, State, Value};
use serde::{Deserialize, Serialize};

/// The main state file structure that persists to the backend
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateFile {
    /// State file format version
    pub version: u32,
    /// Monotonically increasing number for each state modification
    pub serial: u64,
    /// Unique identifier for this state lineage (prevents accidental overwrites)
    pub lineage: String,
    /// Version of azstack that last modified this state
    pub azstack_version: String,
    /// All managed resources and their current state
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
            azstack_version: env!("CARGO_PKG_VERSION").to_string(),
            resources: Vec::new(),
        }
    }

    /// Increment serial and stamp the running version before a write
    pub fn increment_serial(&mut self) {
        self.serial += 1;
        self.azstack_version = env!("CARGO_PKG_VERSION").to_string();
    }

    /// Find a resource by type and name
    pub fn find_resource(&self, resource_type: &str, name: &str) -> Option<&ResourceState> {
        self.resources
            .iter()
            .find(|r| r.resource_type == resource_type && r.name == name)
    }

    pub fn find_resource_mut(
        &mut self,
        resource_type: &str,
        name: &str,
    ) -> Option<&mut ResourceState> {
        self.resources
            .iter_mut()
            .find(|r| r.resource_type == resource_type && r.name == name)
    }

    /// Add or update a resource in the state
    pub fn upsert_resource(&mut self, resource: ResourceState) {
        if let Some(existing) = self.find_resource_mut(&resource.resource_type, &resource.name) {
            *existing = resource;
        } else {
            self.resources.push(resource);
        }
    }

    pub fn remove_resource(&mut self, resource_type: &str, name: &str) -> Option<ResourceState> {
        let pos = self
            .resources
            .iter()
            .position(|r| r.resource_type == resource_type && r.name == name)?;
        Some(self.resources.remove(pos))
    }

    /// Record the outcome of a provider call
    ///
    /// A state that no longer exists removes the resource. The `protected`
    /// flag of an already tracked resource is kept.
    pub fn record(&mut self, state: &State, provider: &str) {
        if !state.exists {
            self.remove_resource(&state.id.resource_type, &state.id.name);
            return;
        }
        let protected = self
            .find_resource(&state.id.resource_type, &state.id.name)
            .is_some_and(|r| r.protected);
        self.upsert_resource(ResourceState::from_state(state, provider).with_protected(protected));
    }

    /// Runtime view of every tracked resource, keyed by address
    pub fn states(&self) -> HashMap<ResourceId, State> {
        self.resources
            .iter()
            .map(|r| {
                let state = r.to_state();
                (state.id.clone(), state)
            })
            .collect()
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
    /// Resource type (e.g., "azurestack_managed_disk")
    pub resource_type: String,
    /// Resource name (the address in `azstack.json`, not the remote name)
    pub name: String,
    /// Provider name (e.g., "azurestack")
    pub provider: String,
    /// Canonical ARM ID of the remote resource
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identifier: Option<String>,
    /// All attributes of the resource as JSON values
    pub attributes: HashMap<String, serde_json::Value>,
    /// Whether this resource is protected from deletion
    #[serde(default)]
    pub protected: bool,
}

impl ResourceState {
    pub fn new(
        resource_type: impl Into<String>,
        name: impl Into<String>,
        provider: impl Into<String>,
    ) -> Self {
        Self {
            resource_type: resource_type.into(),
            name: name.into(),
            provider: provider.into(),
            identifier: None,
            attributes: HashMap::new(),
            protected: false,
        }
    }

    /// Snapshot a provider state
    pub fn from_state(state: &State, provider: impl Into<String>) -> Self {
        Self {
            resource_type: state.id.resource_type.clone(),
            name: state.id.name.clone(),
            provider: provider.into(),
            identifier: state.identifier.clone(),
            attributes: state
                .attributes
                .iter()
                .map(|(k, v)| (k.clone(), v.to_json()))
                .collect(),
            protected: false,
        }
    }

    /// Convert back into the runtime representation
    ///
    /// Null attributes are dropped.
    pub fn to_state(&self) -> State {
        let id = ResourceId::new(&self.resource_type, &self.name);
        let attributes = self
            .attributes
            .iter()
            .filter_map(|(k, v)| Value::from_json(v).map(|v| (k.clone(), v)))
            .collect();
        let state = State::existing(id, attributes);
        match &self.identifier {
            Some(identifier) => state.with_identifier(identifier.clone()),
            None => state,
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

    pub fn with_protected(mut self, protected: bool) -> Self {
        self.protected = protected;
        self
    }

    /// Address in `type.name` form
    pub fn address(&self) -> String {
        format!("{}.{}", self.resource_type, self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const DISK_ID: &str = "/subscriptions/00000000-0000-0000-0000-000000000000/resourceGroups/rg/providers/Microsoft.Compute/disks/data1";

    fn disk_state() -> State {
        let mut attributes = HashMap::new();
        attributes.insert("name".to_string(), Value::from("data1"));
        attributes.insert("disk_size_gb".to_string(), Value::from(10_i64));
        attributes.insert(
            "tags".to_string(),
            Value::Map([("env".to_string(), Value::from("dev"))].into_iter().collect()),
        );
        State::existing(ResourceId::new("azurestack_managed_disk", "data"), attributes)
            .with_identifier(DISK_ID)
    }

    #[test]
    fn test_state_file_new() {
        let state = StateFile::new();
        assert_eq!(state.version, StateFile::CURRENT_VERSION);
        assert_eq!(state.serial, 0);
        assert!(!state.lineage.is_empty());
        assert!(state.resources.is_empty());
    }

    #[test]
    fn test_state_file_increment_serial() {
        let mut state = StateFile::new();
        state.increment_serial();
        state.increment_serial();
        assert_eq!(state.serial, 2);
    }

    #[test]
    fn test_state_file_upsert_resource() {
        let mut state = StateFile::new();

        state.upsert_resource(
            ResourceState::new("azurestack_availability_set", "web", "azurestack")
                .with_attribute("platform_fault_domain_count", json!(2)),
        );
        state.upsert_resource(
            ResourceState::new("azurestack_availability_set", "web", "azurestack")
                .with_attribute("platform_fault_domain_count", json!(3)),
        );

        assert_eq!(state.resources.len(), 1);
        assert_eq!(
            state.resources[0].attributes.get("platform_fault_domain_count"),
            Some(&json!(3))
        );
    }

    #[test]
    fn test_state_file_remove_resource() {
        let mut state = StateFile::new();
        state.upsert_resource(ResourceState::new("azurestack_image", "base", "azurestack"));

        assert!(state.remove_resource("azurestack_image", "base").is_some());
        assert!(state.resources.is_empty());
        assert!(state.remove_resource("azurestack_image", "other").is_none());
    }

    #[test]
    fn test_resource_state_keeps_identifier_and_attributes() {
        let resource = ResourceState::from_state(&disk_state(), "azurestack");
        assert_eq!(resource.identifier.as_deref(), Some(DISK_ID));
        assert_eq!(resource.attributes.get("tags"), Some(&json!({"env": "dev"})));
        assert_eq!(resource.address(), "azurestack_managed_disk.data");

        assert_eq!(resource.to_state(), disk_state());
    }

    #[test]
    fn test_record_removes_missing_resources() {
        let mut file = StateFile::new();
        file.record(&disk_state(), "azurestack");
        assert_eq!(file.resources.len(), 1);

        file.record(
            &State::not_found(ResourceId::new("azurestack_managed_disk", "data")),
            "azurestack",
        );
        assert!(file.resources.is_empty());
    }

    #[test]
    fn test_record_keeps_protection() {
        let mut file = StateFile::new();
        file.upsert_resource(
            ResourceState::from_state(&disk_state(), "azurestack").with_protected(true),
        );

        file.record(&disk_state(), "azurestack");
        assert!(file.resources[0].protected);
    }

    #[test]
    fn test_states_are_keyed_by_address() {
        let mut file = StateFile::new();
        file.record(&disk_state(), "azurestack");

        let states = file.states();
        let state = &states[&ResourceId::new("azurestack_managed_disk", "data")];
        assert!(state.exists);
        assert_eq!(state.identifier.as_deref(), Some(DISK_ID));
    }

    #[test]
    fn test_state_file_serialization() {
        let mut state = StateFile::new();
        state.record(&disk_state(), "azurestack");

        let json = serde_json::to_string_pretty(&state).unwrap();
        assert!(json.contains("azstack_version"));
        let deserialized: StateFile = serde_json::from_str(&json).unwrap();

        assert_eq!(deserialized.lineage, state.lineage);
        assert_eq!(deserialized.resources, state.resources);
    }
}
