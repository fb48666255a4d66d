//! Graph - References between resources
//!
//! A string attribute of the form `${<type>.<name>.<attribute>}` refers to an
//! attribute of another resource. References order the resources for apply
//! and are substituted with concrete values as states become known.

use std::collections::{BTreeSet, HashMap};

use crate::resource::{Resource, ResourceId, State, Value};

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum GraphError {
    #[error("{from} refers to undeclared resource {to}")]
    UnknownReference { from: ResourceId, to: ResourceId },

    #[error("Dependency cycle between: {}", .0.iter().map(|id| id.to_string()).collect::<Vec<_>>().join(", "))]
    Cycle(Vec<ResourceId>),

    #[error("Reference {0} cannot be resolved")]
    Unresolved(String),
}

/// Parse a `${type.name.attribute}` reference
pub fn parse_reference(s: &str) -> Option<(ResourceId, String)> {
    let inner = s.strip_prefix("${")?.strip_suffix('}')?;
    let mut parts = inner.split('.');
    let (resource_type, name, attribute) = (parts.next()?, parts.next()?, parts.next()?);
    if parts.next().is_some()
        || [resource_type, name, attribute]
            .iter()
            .any(|p| p.is_empty() || p.contains(char::is_whitespace))
    {
        return None;
    }
    Some((ResourceId::new(resource_type, name), attribute.to_string()))
}

/// Turn reference strings inside a value into `Value::ResourceRef`
pub fn lift_references(value: Value) -> Value {
    match value {
        Value::String(s) => match parse_reference(&s) {
            Some((id, attr)) => Value::ResourceRef(id, attr),
            None => Value::String(s),
        },
        Value::List(items) => Value::List(items.into_iter().map(lift_references).collect()),
        Value::Map(map) => Value::Map(
            map.into_iter()
                .map(|(k, v)| (k, lift_references(v)))
                .collect(),
        ),
        other => other,
    }
}

fn collect_references(value: &Value, deps: &mut BTreeSet<ResourceId>) {
    match value {
        Value::ResourceRef(id, _) => {
            deps.insert(id.clone());
        }
        Value::List(items) => items.iter().for_each(|v| collect_references(v, deps)),
        Value::Map(map) => map.values().for_each(|v| collect_references(v, deps)),
        _ => {}
    }
}

/// Resources this resource refers to
pub fn dependencies(resource: &Resource) -> BTreeSet<ResourceId> {
    let mut deps = BTreeSet::new();
    for value in resource.attributes.values() {
        collect_references(value, &mut deps);
    }
    deps.remove(&resource.id);
    deps
}

/// Order resources so every resource comes after the ones it refers to
///
/// Resources without a mutual ordering keep their declaration order.
pub fn sort_resources(resources: &[Resource]) -> Result<Vec<Resource>, GraphError> {
    let index: HashMap<&ResourceId, usize> = resources
        .iter()
        .enumerate()
        .map(|(i, r)| (&r.id, i))
        .collect();

    let mut deps: Vec<BTreeSet<usize>> = Vec::with_capacity(resources.len());
    for resource in resources {
        let mut set = BTreeSet::new();
        for dep in dependencies(resource) {
            let Some(&i) = index.get(&dep) else {
                return Err(GraphError::UnknownReference {
                    from: resource.id.clone(),
                    to: dep,
                });
            };
            set.insert(i);
        }
        deps.push(set);
    }

    let mut placed = vec![false; resources.len()];
    let mut sorted = Vec::with_capacity(resources.len());
    while sorted.len() < resources.len() {
        let next = (0..resources.len())
            .find(|&i| !placed[i] && deps[i].iter().all(|&d| placed[d]));
        match next {
            Some(i) => {
                placed[i] = true;
                sorted.push(resources[i].clone());
            }
            None => {
                let remaining = (0..resources.len())
                    .filter(|&i| !placed[i])
                    .map(|i| resources[i].id.clone())
                    .collect();
                return Err(GraphError::Cycle(remaining));
            }
        }
    }

    Ok(sorted)
}

/// Known attribute values of resources, used to substitute references
#[derive(Debug, Clone, Default)]
pub struct Bindings {
    values: HashMap<ResourceId, HashMap<String, Value>>,
}

impl Bindings {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed bindings from existing states
    pub fn from_states(states: &HashMap<ResourceId, State>) -> Self {
        let mut bindings = Self::new();
        for state in states.values() {
            bindings.insert_state(state);
        }
        bindings
    }

    pub fn insert_state(&mut self, state: &State) {
        if !state.exists {
            self.values.remove(&state.id);
            return;
        }
        let mut attrs = state.attributes.clone();
        if let Some(identifier) = &state.identifier {
            attrs
                .entry("id".to_string())
                .or_insert_with(|| Value::String(identifier.clone()));
        }
        self.values.insert(state.id.clone(), attrs);
    }

    pub fn remove(&mut self, id: &ResourceId) {
        self.values.remove(id);
    }

    pub fn get(&self, id: &ResourceId, attribute: &str) -> Option<&Value> {
        self.values.get(id).and_then(|attrs| attrs.get(attribute))
    }

    /// Substitute every reference, failing on the first unknown one
    pub fn resolve(&self, value: &Value) -> Result<Value, GraphError> {
        match value {
            Value::ResourceRef(id, attr) => self
                .get(id, attr)
                .cloned()
                .ok_or_else(|| GraphError::Unresolved(format!("{}.{}", id, attr))),
            Value::List(items) => items
                .iter()
                .map(|v| self.resolve(v))
                .collect::<Result<Vec<_>, _>>()
                .map(Value::List),
            Value::Map(map) => map
                .iter()
                .map(|(k, v)| self.resolve(v).map(|v| (k.clone(), v)))
                .collect::<Result<HashMap<_, _>, _>>()
                .map(Value::Map),
            other => Ok(other.clone()),
        }
    }

    /// Substitute the references that are known, leaving the rest in place
    pub fn resolve_partial(&self, value: &Value) -> Value {
        match value {
            Value::ResourceRef(id, attr) => self
                .get(id, attr)
                .cloned()
                .unwrap_or_else(|| value.clone()),
            Value::List(items) => Value::List(items.iter().map(|v| self.resolve_partial(v)).collect()),
            Value::Map(map) => Value::Map(
                map.iter()
                    .map(|(k, v)| (k.clone(), self.resolve_partial(v)))
                    .collect(),
            ),
            other => other.clone(),
        }
    }

    pub fn resolve_resource(&self, resource: &Resource) -> Result<Resource, GraphError> {
        let mut resolved = resource.clone();
        for (key, value) in &resource.attributes {
            resolved.attributes.insert(key.clone(), self.resolve(value)?);
        }
        Ok(resolved)
    }

    pub fn resolve_resource_partial(&self, resource: &Resource) -> Resource {
        let mut resolved = resource.clone();
        for (key, value) in &resource.attributes {
            resolved
                .attributes
                .insert(key.clone(), self.resolve_partial(value));
        }
        resolved
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reference(t: &str, n: &str, a: &str) -> Value {
        Value::ResourceRef(ResourceId::new(t, n), a.to_string())
    }

    #[test]
    fn parse_reference_forms() {
        let (id, attr) = parse_reference("${azurestack_linux_virtual_machine.web.id}").unwrap();
        assert_eq!(id, ResourceId::new("azurestack_linux_virtual_machine", "web"));
        assert_eq!(attr, "id");

        assert!(parse_reference("azurestack_linux_virtual_machine.web.id").is_none());
        assert!(parse_reference("${a.b}").is_none());
        assert!(parse_reference("${a.b.c.d}").is_none());
        assert!(parse_reference("${a. b.c}").is_none());
    }

    #[test]
    fn lift_references_in_nested_values() {
        let mut map = HashMap::new();
        map.insert(
            "managed_disk_id".to_string(),
            Value::from("${azurestack_managed_disk.data.id}"),
        );
        let lifted = lift_references(Value::List(vec![Value::Map(map)]));
        let item = &lifted.as_list().unwrap()[0];
        assert_eq!(
            item.as_map().unwrap()["managed_disk_id"],
            reference("azurestack_managed_disk", "data", "id")
        );
    }

    #[test]
    fn sort_places_dependencies_first() {
        let ext = Resource::new("azurestack_virtual_machine_extension", "ext").with_attribute(
            "virtual_machine_id",
            reference("azurestack_linux_virtual_machine", "vm", "id"),
        );
        let vm = Resource::new("azurestack_linux_virtual_machine", "vm").with_attribute(
            "availability_set_id",
            reference("azurestack_availability_set", "set", "id"),
        );
        let set = Resource::new("azurestack_availability_set", "set");

        let sorted = sort_resources(&[ext, vm, set]).unwrap();
        let names: Vec<&str> = sorted.iter().map(|r| r.id.name.as_str()).collect();
        assert_eq!(names, vec!["set", "vm", "ext"]);
    }

    #[test]
    fn sort_detects_cycles_and_unknown_targets() {
        let a = Resource::new("t", "a").with_attribute("x", reference("t", "b", "id"));
        let b = Resource::new("t", "b").with_attribute("x", reference("t", "a", "id"));
        assert!(matches!(
            sort_resources(&[a.clone(), b]),
            Err(GraphError::Cycle(ids)) if ids.len() == 2
        ));

        assert!(matches!(
            sort_resources(&[a]),
            Err(GraphError::UnknownReference { .. })
        ));
    }

    #[test]
    fn bindings_resolve_from_state() {
        let id = ResourceId::new("azurestack_managed_disk", "data");
        let state = State::existing(id.clone(), HashMap::new()).with_identifier("/disk/data");
        let mut bindings = Bindings::new();

        let value = reference("azurestack_managed_disk", "data", "id");
        assert!(bindings.resolve(&value).is_err());
        assert_eq!(bindings.resolve_partial(&value), value);

        bindings.insert_state(&state);
        assert_eq!(bindings.resolve(&value).unwrap(), Value::from("/disk/data"));

        bindings.remove(&id);
        assert!(bindings.get(&id, "id").is_none());
    }
}
