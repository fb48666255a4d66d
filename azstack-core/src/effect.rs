//! Effect - Side effects represented as values
//!
//! An Effect describes one operation against a Provider. Nothing happens
//! until an Interpreter executes it.

use crate::resource::{Resource, ResourceId, State};

#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    /// Create a resource that does not exist yet
    Create(Resource),
    /// Update mutable attributes in place
    Update {
        id: ResourceId,
        from: State,
        to: Resource,
        changed_attributes: Vec<String>,
    },
    /// Delete the existing resource, then create it again
    Replace {
        id: ResourceId,
        from: State,
        to: Resource,
        changed_attributes: Vec<String>,
    },
    /// Delete a resource by its remote identifier
    Delete { id: ResourceId, identifier: String },
}

impl Effect {
    pub fn resource_id(&self) -> &ResourceId {
        match self {
            Effect::Create(r) => &r.id,
            Effect::Update { id, .. } | Effect::Replace { id, .. } | Effect::Delete { id, .. } => {
                id
            }
        }
    }

    /// Attributes that triggered this effect (empty for create and delete)
    pub fn changed_attributes(&self) -> &[String] {
        match self {
            Effect::Update {
                changed_attributes, ..
            }
            | Effect::Replace {
                changed_attributes, ..
            } => changed_attributes,
            Effect::Create(_) | Effect::Delete { .. } => &[],
        }
    }

    /// Symbol used when rendering plans
    pub fn symbol(&self) -> &'static str {
        match self {
            Effect::Create(_) => "+",
            Effect::Update { .. } => "~",
            Effect::Replace { .. } => "-/+",
            Effect::Delete { .. } => "-",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn replace_reports_changed_attributes() {
        let id = ResourceId::new("azurestack_image", "golden");
        let effect = Effect::Replace {
            id: id.clone(),
            from: State::existing(id.clone(), HashMap::new()),
            to: Resource::new("azurestack_image", "golden"),
            changed_attributes: vec!["location".to_string()],
        };
        assert_eq!(effect.resource_id(), &id);
        assert_eq!(effect.changed_attributes(), ["location".to_string()]);
        assert_eq!(effect.symbol(), "-/+");
    }
}
