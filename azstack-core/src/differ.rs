//! Differ - Compare desired state with current state to generate a Plan
//!
//! Compares the desired state declared in the configuration with the current
//! state fetched from the Provider, and generates the required Effects (Plan).
//! Comparison is per attribute and follows the resource schema: computed
//! attributes that are not configured are ignored, diff-suppress rules apply,
//! and a change to a force-new attribute (at any nesting depth) turns an
//! update into a replacement.

use std::collections::HashMap;

use crate::effect::Effect;
use crate::plan::Plan;
use crate::resource::{Resource, ResourceId, State, Value};
use crate::schema::ResourceSchema;

/// Result of a diff operation
#[derive(Debug, Clone, PartialEq)]
pub enum Diff {
    /// Resource does not exist -> needs creation
    Create(Resource),
    /// Resource exists with differences in mutable attributes -> needs update
    Update {
        id: ResourceId,
        from: State,
        to: Resource,
        changed_attributes: Vec<String>,
    },
    /// Resource exists with differences in force-new attributes -> needs replacement
    Replace {
        id: ResourceId,
        from: State,
        to: Resource,
        changed_attributes: Vec<String>,
    },
    /// Resource exists with no differences -> no action needed
    NoChange(ResourceId),
}

impl Diff {
    /// Returns whether this Diff involves a change
    pub fn is_change(&self) -> bool {
        !matches!(self, Diff::NoChange(_))
    }
}

/// Compare desired state with current state to compute a Diff
pub fn diff(desired: &Resource, current: &State, schema: Option<&ResourceSchema>) -> Diff {
    if !current.exists {
        return Diff::Create(desired.clone());
    }

    let changed = find_changed_attributes(&desired.attributes, &current.attributes, schema);

    if changed.is_empty() {
        return Diff::NoChange(desired.id.clone());
    }

    let replace = schema
        .is_some_and(|s| s.requires_replacement(&changed, &desired.attributes, &current.attributes));
    if replace {
        Diff::Replace {
            id: desired.id.clone(),
            from: current.clone(),
            to: desired.clone(),
            changed_attributes: changed,
        }
    } else {
        Diff::Update {
            id: desired.id.clone(),
            from: current.clone(),
            to: desired.clone(),
            changed_attributes: changed,
        }
    }
}

/// Find changed attributes between desired and current state
///
/// The result is sorted by attribute name.
pub fn find_changed_attributes(
    desired: &HashMap<String, Value>,
    current: &HashMap<String, Value>,
    schema: Option<&ResourceSchema>,
) -> Vec<String> {
    let mut keys: Vec<&String> = desired.keys().collect();
    if let Some(schema) = schema {
        keys.extend(
            schema
                .attributes
                .values()
                .filter(|s| !s.read_only)
                .map(|s| &s.name),
        );
    }
    keys.sort();
    keys.dedup();

    let mut changed = Vec::new();

    for key in keys {
        // Skip internal attributes (starting with _)
        if key.starts_with('_') {
            continue;
        }

        let attr = schema.and_then(|s| s.get(key));
        let is_changed = match (desired.get(key), current.get(key)) {
            // Unknown until the referenced resource is applied
            (Some(d), _) if d.has_references() => true,
            (Some(d), Some(c)) => match attr {
                Some(attr) => !attr.matches(d, c),
                None => d != c,
            },
            (Some(_), None) => true,
            (None, Some(_)) => attr.is_some_and(|a| !a.computed),
            (None, None) => false,
        };

        if is_changed {
            changed.push(key.clone());
        }
    }

    changed
}

/// Copy write-only attributes from the last applied state into a freshly read state
///
/// The remote API never returns these values, so the last applied value is
/// the only thing the configuration can be compared against.
pub fn carry_write_only(
    current: &mut State,
    saved: &HashMap<String, Value>,
    schema: &ResourceSchema,
) {
    if !current.exists {
        return;
    }
    for name in schema.write_only_attributes() {
        if let Some(value) = saved.get(name) {
            current.attributes.insert(name.to_string(), value.clone());
        }
    }
}

/// Compute Diff for multiple resources and generate a Plan
///
/// Resources must already be in dependency order. Schema defaults are
/// applied to the desired attributes before comparing.
pub fn create_plan(
    desired: &[Resource],
    current_states: &HashMap<ResourceId, State>,
    schemas: &HashMap<String, ResourceSchema>,
) -> Plan {
    let mut plan = Plan::new();

    for resource in desired {
        let schema = schemas.get(&resource.id.resource_type);
        let mut resource = resource.clone();
        if let Some(schema) = schema {
            schema.apply_defaults(&mut resource.attributes);
        }

        let current = current_states
            .get(&resource.id)
            .cloned()
            .unwrap_or_else(|| State::not_found(resource.id.clone()));

        match diff(&resource, &current, schema) {
            Diff::Create(r) => plan.add(Effect::Create(r)),
            Diff::Update {
                id,
                from,
                to,
                changed_attributes,
            } => plan.add(Effect::Update {
                id,
                from,
                to,
                changed_attributes,
            }),
            Diff::Replace {
                id,
                from,
                to,
                changed_attributes,
            } => plan.add(Effect::Replace {
                id,
                from,
                to,
                changed_attributes,
            }),
            Diff::NoChange(_) => {}
        }
    }

    plan
}

/// Generate a Plan deleting the given states, in the order given
pub fn destroy_plan(states: &[State]) -> Plan {
    let mut plan = Plan::new();
    for state in states {
        if let (true, Some(identifier)) = (state.exists, &state.identifier) {
            plan.add(Effect::Delete {
                id: state.id.clone(),
                identifier: identifier.clone(),
            });
        }
    }
    plan
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{AttributeSchema, AttributeType, DiffSuppress, types};

    fn disk_schema() -> ResourceSchema {
        ResourceSchema::new("azurestack_managed_disk")
            .attribute(AttributeSchema::new("name", AttributeType::String).required().force_new())
            .attribute(
                AttributeSchema::new("location", AttributeType::String)
                    .required()
                    .force_new()
                    .with_diff_suppress(DiffSuppress::Location),
            )
            .attribute(
                AttributeSchema::new("storage_account_type", AttributeType::String)
                    .required()
                    .with_diff_suppress(DiffSuppress::CaseInsensitive),
            )
            .attribute(AttributeSchema::new("disk_size_gb", AttributeType::Int).computed())
            .attribute(AttributeSchema::new("tags", types::tags()))
            .attribute(AttributeSchema::new("id", AttributeType::String).read_only())
    }

    fn attrs(pairs: &[(&str, Value)]) -> HashMap<String, Value> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    fn existing(pairs: &[(&str, Value)]) -> State {
        State::existing(ResourceId::new("azurestack_managed_disk", "data"), attrs(pairs))
            .with_identifier("/disks/data")
    }

    #[test]
    fn diff_create_when_not_exists() {
        let desired = Resource::new("azurestack_managed_disk", "data");
        let current = State::not_found(ResourceId::new("azurestack_managed_disk", "data"));

        let result = diff(&desired, &current, None);
        assert!(matches!(result, Diff::Create(_)));
    }

    #[test]
    fn diff_no_change_with_suppressed_differences() {
        let schema = disk_schema();
        let desired = Resource::new("azurestack_managed_disk", "data")
            .with_attribute("name", "data")
            .with_attribute("location", "West Europe")
            .with_attribute("storage_account_type", "standard_lrs");
        let current = existing(&[
            ("name", Value::from("data")),
            ("location", Value::from("westeurope")),
            ("storage_account_type", Value::from("Standard_LRS")),
            ("disk_size_gb", Value::Int(10)),
            ("id", Value::from("/disks/data")),
        ]);

        let result = diff(&desired, &current, Some(&schema));
        assert!(matches!(result, Diff::NoChange(_)), "{:?}", result);
    }

    #[test]
    fn diff_update_when_mutable_attribute_changes() {
        let schema = disk_schema();
        let desired = Resource::new("azurestack_managed_disk", "data")
            .with_attribute("name", "data")
            .with_attribute("location", "westeurope")
            .with_attribute("storage_account_type", "Premium_LRS")
            .with_attribute("disk_size_gb", 20i64);
        let current = existing(&[
            ("name", Value::from("data")),
            ("location", Value::from("westeurope")),
            ("storage_account_type", Value::from("Standard_LRS")),
            ("disk_size_gb", Value::Int(10)),
        ]);

        match diff(&desired, &current, Some(&schema)) {
            Diff::Update {
                changed_attributes, ..
            } => {
                assert_eq!(
                    changed_attributes,
                    vec!["disk_size_gb".to_string(), "storage_account_type".to_string()]
                );
            }
            other => panic!("Expected Update, got {:?}", other),
        }
    }

    #[test]
    fn removed_optional_attribute_is_a_change() {
        let schema = disk_schema();
        let desired = Resource::new("azurestack_managed_disk", "data")
            .with_attribute("name", "data")
            .with_attribute("location", "westeurope")
            .with_attribute("storage_account_type", "Standard_LRS");
        let mut tags = HashMap::new();
        tags.insert("env".to_string(), Value::from("test"));
        let current = existing(&[
            ("name", Value::from("data")),
            ("location", Value::from("westeurope")),
            ("storage_account_type", Value::from("Standard_LRS")),
            ("tags", Value::Map(tags)),
        ]);

        match diff(&desired, &current, Some(&schema)) {
            Diff::Update {
                changed_attributes, ..
            } => assert_eq!(changed_attributes, vec!["tags".to_string()]),
            other => panic!("Expected Update, got {:?}", other),
        }
    }

    #[test]
    fn diff_replace_when_force_new_attribute_changes() {
        let schema = disk_schema();
        let desired = Resource::new("azurestack_managed_disk", "data")
            .with_attribute("name", "data")
            .with_attribute("location", "eastus")
            .with_attribute("storage_account_type", "Standard_LRS");
        let current = existing(&[
            ("name", Value::from("data")),
            ("location", Value::from("westeurope")),
            ("storage_account_type", Value::from("Standard_LRS")),
        ]);

        assert!(matches!(
            diff(&desired, &current, Some(&schema)),
            Diff::Replace { .. }
        ));
    }

    #[test]
    fn unresolved_reference_counts_as_change() {
        let desired = Resource::new("azurestack_virtual_machine_extension", "ext").with_attribute(
            "virtual_machine_id",
            Value::ResourceRef(
                ResourceId::new("azurestack_linux_virtual_machine", "vm"),
                "id".to_string(),
            ),
        );
        let changed = find_changed_attributes(
            &desired.attributes,
            &attrs(&[("virtual_machine_id", Value::from("/vm"))]),
            None,
        );
        assert_eq!(changed, vec!["virtual_machine_id".to_string()]);
    }

    #[test]
    fn write_only_values_are_carried_forward() {
        let schema = ResourceSchema::new("azurestack_virtual_machine_extension").attribute(
            AttributeSchema::new("protected_settings", types::json_object())
                .sensitive()
                .write_only(),
        );
        let saved = attrs(&[("protected_settings", Value::from(r#"{"secret":"a"}"#))]);
        let mut current = existing(&[]);
        carry_write_only(&mut current, &saved, &schema);

        let desired = attrs(&[("protected_settings", Value::from(r#"{"secret":"a"}"#))]);
        assert!(find_changed_attributes(&desired, &current.attributes, Some(&schema)).is_empty());

        let desired = attrs(&[("protected_settings", Value::from(r#"{"secret":"b"}"#))]);
        assert_eq!(
            find_changed_attributes(&desired, &current.attributes, Some(&schema)),
            vec!["protected_settings".to_string()]
        );
    }

    #[test]
    fn diff_replace_when_nested_force_new_field_changes() {
        let schema = ResourceSchema::new("azurestack_linux_virtual_machine").attribute(
            AttributeSchema::new(
                "os_disk",
                AttributeType::Block(vec![
                    AttributeSchema::new("caching", AttributeType::String).required(),
                    AttributeSchema::new("storage_account_type", AttributeType::String)
                        .required()
                        .force_new(),
                ]),
            )
            .required(),
        );
        let os_disk = |caching: &str, storage: &str| {
            Value::Map(attrs(&[
                ("caching", Value::from(caching)),
                ("storage_account_type", Value::from(storage)),
            ]))
        };
        let id = ResourceId::new("azurestack_linux_virtual_machine", "web");
        let current = State::existing(
            id.clone(),
            attrs(&[("os_disk", os_disk("ReadWrite", "Standard_LRS"))]),
        )
        .with_identifier("/virtualMachines/web");

        let desired = Resource::new("azurestack_linux_virtual_machine", "web")
            .with_attribute("os_disk", os_disk("ReadWrite", "Premium_LRS"));
        assert!(matches!(
            diff(&desired, &current, Some(&schema)),
            Diff::Replace { .. }
        ));

        let desired = Resource::new("azurestack_linux_virtual_machine", "web")
            .with_attribute("os_disk", os_disk("ReadOnly", "Standard_LRS"));
        assert!(matches!(
            diff(&desired, &current, Some(&schema)),
            Diff::Update { .. }
        ));
    }

    #[test]
    fn create_plan_from_resources() {
        let resources = vec![
            Resource::new("azurestack_managed_disk", "new"),
            Resource::new("azurestack_managed_disk", "data")
                .with_attribute("storage_account_type", "Premium_LRS"),
        ];

        let mut current_states = HashMap::new();
        current_states.insert(
            ResourceId::new("azurestack_managed_disk", "data"),
            existing(&[("storage_account_type", Value::from("Standard_LRS"))]),
        );

        let plan = create_plan(&resources, &current_states, &HashMap::new());

        assert_eq!(plan.effects().len(), 2);
        assert!(matches!(plan.effects()[0], Effect::Create(_)));
        assert!(matches!(plan.effects()[1], Effect::Update { .. }));
    }

    #[test]
    fn destroy_plan_skips_missing_states() {
        let gone = State::not_found(ResourceId::new("azurestack_managed_disk", "gone"));
        let plan = destroy_plan(&[existing(&[]), gone]);
        assert_eq!(plan.len(), 1);
        assert!(matches!(
            &plan.effects()[0],
            Effect::Delete { identifier, .. } if identifier == "/disks/data"
        ));
    }
}
