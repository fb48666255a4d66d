//! Loading of `azstack.json`

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::Path;

use serde::Deserialize;

use azstack_core::graph::{lift_references, sort_resources};
use azstack_core::resource::{Resource, ResourceId, Value};
use azstack_core::schema::ResourceSchema;
use azstack_provider_compute::ProviderConfig;
use azstack_provider_compute::resources::{resource_types, schema_for};
use azstack_state::BackendConfig;

/// Default configuration file name
pub const DEFAULT_CONFIG_FILE: &str = "azstack.json";

/// The whole configuration file
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigFile {
    #[serde(default)]
    pub provider: ProviderConfig,
    #[serde(default = "BackendConfig::local")]
    pub backend: BackendConfig,
    #[serde(default)]
    pub resources: Vec<ResourceBlock>,
}

/// One entry of the `resources` array
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ResourceBlock {
    #[serde(rename = "type")]
    pub resource_type: String,
    pub name: String,
    #[serde(default)]
    pub attributes: serde_json::Map<String, serde_json::Value>,
}

impl ResourceBlock {
    /// Convert to a Resource, turning `${type.name.attribute}` strings into references
    pub fn to_resource(&self) -> Resource {
        let mut resource = Resource::new(&self.resource_type, &self.name);
        for (key, value) in &self.attributes {
            if let Some(value) = Value::from_json(value) {
                resource
                    .attributes
                    .insert(key.clone(), lift_references(value));
            }
        }
        resource
    }
}

impl ConfigFile {
    pub fn load(path: &Path) -> Result<Self, String> {
        let content = fs::read_to_string(path)
            .map_err(|e| format!("Failed to read {}: {}", path.display(), e))?;
        Self::parse(&content).map_err(|e| format!("{}: {}", path.display(), e))
    }

    pub fn parse(content: &str) -> Result<Self, String> {
        serde_json::from_str(content).map_err(|e| format!("Parse error: {}", e))
    }

    /// Declared resources in dependency order
    ///
    /// Fails on duplicate addresses, references to undeclared resources and
    /// dependency cycles.
    pub fn resources(&self) -> Result<Vec<Resource>, String> {
        let mut seen: HashSet<ResourceId> = HashSet::new();
        let mut resources = Vec::with_capacity(self.resources.len());
        for block in &self.resources {
            let resource = block.to_resource();
            if !seen.insert(resource.id.clone()) {
                return Err(format!("Duplicate resource {}", resource.id));
            }
            resources.push(resource);
        }
        sort_resources(&resources).map_err(|e| e.to_string())
    }

    /// Address of a declared resource, if any
    pub fn find(&self, id: &ResourceId) -> Option<&ResourceBlock> {
        self.resources
            .iter()
            .find(|b| b.resource_type == id.resource_type && b.name == id.name)
    }
}

/// Schemas of every supported resource type, keyed by type name
pub fn schemas() -> HashMap<String, ResourceSchema> {
    resource_types()
        .into_iter()
        .map(|t| (t.name().to_string(), t.schema()))
        .collect()
}

/// Check every resource against its schema, collecting all errors
pub fn validate_resources(resources: &[Resource]) -> Result<(), String> {
    let mut all_errors = Vec::new();

    for resource in resources {
        match schema_for(&resource.id.resource_type) {
            Some(schema) => {
                if let Err(errors) = schema.validate(&resource.attributes) {
                    for error in errors {
                        all_errors.push(format!("{}: {}", resource.id, error));
                    }
                }
            }
            None => all_errors.push(format!(
                "{}: unknown resource type {:?}",
                resource.id, resource.id.resource_type
            )),
        }
    }

    if all_errors.is_empty() {
        Ok(())
    } else {
        Err(all_errors.join("\n"))
    }
}
