//! Compute resource types
//!
//! This module defines:
//! - Resource type definitions (implementing the ResourceType trait)
//! - Attribute schemas shared by several resource types
//!
//! Each submodule holds the schema and the create/read/update/delete
//! handlers of one resource type.

pub mod availability_set;
pub mod image;
pub mod managed_disk;
pub mod virtual_machine;
pub mod virtual_machine_data_disk_attachment;
pub mod virtual_machine_extension;
pub mod virtual_machine_scale_set;
pub mod virtual_machine_scale_set_extension;

use azstack_core::provider::{ProviderError, ProviderResult, ResourceType};
use azstack_core::resource::{ResourceId, State};
use azstack_core::schema::{AttributeSchema, AttributeType, DiffSuppress, ResourceSchema, types};

use crate::parse::validate_arm_id;

// =============================================================================
// Resource Type Definitions
// =============================================================================

macro_rules! define_resource_type {
    ($name:ident, $type_name:expr, $schema:path) => {
        pub struct $name;
        impl ResourceType for $name {
            fn name(&self) -> &'static str {
                $type_name
            }
            fn schema(&self) -> ResourceSchema {
                $schema()
            }
        }
    };
}

define_resource_type!(
    AvailabilitySetType,
    availability_set::TYPE_NAME,
    availability_set::schema
);
define_resource_type!(ManagedDiskType, managed_disk::TYPE_NAME, managed_disk::schema);
define_resource_type!(ImageType, image::TYPE_NAME, image::schema);
define_resource_type!(
    LinuxVirtualMachineType,
    virtual_machine::LINUX_TYPE_NAME,
    virtual_machine::linux_schema
);
define_resource_type!(
    WindowsVirtualMachineType,
    virtual_machine::WINDOWS_TYPE_NAME,
    virtual_machine::windows_schema
);
define_resource_type!(
    VirtualMachineExtensionType,
    virtual_machine_extension::TYPE_NAME,
    virtual_machine_extension::schema
);
define_resource_type!(
    VirtualMachineDataDiskAttachmentType,
    virtual_machine_data_disk_attachment::TYPE_NAME,
    virtual_machine_data_disk_attachment::schema
);
define_resource_type!(
    LinuxVirtualMachineScaleSetType,
    virtual_machine_scale_set::LINUX_TYPE_NAME,
    virtual_machine_scale_set::linux_schema
);
define_resource_type!(
    WindowsVirtualMachineScaleSetType,
    virtual_machine_scale_set::WINDOWS_TYPE_NAME,
    virtual_machine_scale_set::windows_schema
);
define_resource_type!(
    VirtualMachineScaleSetExtensionType,
    virtual_machine_scale_set_extension::TYPE_NAME,
    virtual_machine_scale_set_extension::schema
);

/// Returns all resource types supported by this provider
pub fn resource_types() -> Vec<Box<dyn ResourceType>> {
    vec![
        Box::new(AvailabilitySetType),
        Box::new(ManagedDiskType),
        Box::new(ImageType),
        Box::new(LinuxVirtualMachineType),
        Box::new(WindowsVirtualMachineType),
        Box::new(VirtualMachineDataDiskAttachmentType),
        Box::new(VirtualMachineExtensionType),
        Box::new(LinuxVirtualMachineScaleSetType),
        Box::new(WindowsVirtualMachineScaleSetType),
        Box::new(VirtualMachineScaleSetExtensionType),
    ]
}

/// Schema of a resource type by name
pub fn schema_for(type_name: &str) -> Option<ResourceSchema> {
    resource_types()
        .into_iter()
        .find(|t| t.name() == type_name)
        .map(|t| t.schema())
}

// =============================================================================
// Shared Attributes
// =============================================================================

/// Canonical ARM ID, filled in by every read
pub(crate) fn id_attribute() -> AttributeSchema {
    AttributeSchema::new("id", AttributeType::String).read_only()
}

pub(crate) fn name_attribute() -> AttributeSchema {
    AttributeSchema::new("name", types::non_empty_string())
        .required()
        .force_new()
}

pub(crate) fn resource_group_name_attribute() -> AttributeSchema {
    AttributeSchema::new("resource_group_name", resource_group_name_type())
        .required()
        .force_new()
        .with_diff_suppress(DiffSuppress::CaseInsensitive)
}

fn resource_group_name_type() -> AttributeType {
    AttributeType::Custom {
        name: "ResourceGroupName".to_string(),
        base: Box::new(AttributeType::String),
        validate: |value| {
            azstack_core::schema::validate_regex(
                value,
                r"^[-\w\._\(\)]{1,90}$",
                "resource group names may only contain alphanumeric characters, dash, \
                 underscores, parentheses and periods",
            )?;
            match value.as_str() {
                Some(name) if name.ends_with('.') => {
                    Err("resource group names cannot end with a period".to_string())
                }
                _ => Ok(()),
            }
        },
    }
}

pub(crate) fn location_attribute() -> AttributeSchema {
    AttributeSchema::new("location", types::non_empty_string())
        .required()
        .force_new()
        .with_diff_suppress(DiffSuppress::Location)
}

pub(crate) fn tags_attribute() -> AttributeSchema {
    AttributeSchema::new("tags", types::tags()).computed()
}

/// ARM ID of a resource outside the Compute provider (subnet, storage account, ...)
pub(crate) fn arm_id_type() -> AttributeType {
    AttributeType::Custom {
        name: "ResourceId".to_string(),
        base: Box::new(AttributeType::String),
        validate: validate_arm_id,
    }
}

pub(crate) fn one_of(values: &[&str]) -> AttributeType {
    AttributeType::Enum(values.iter().map(|v| v.to_string()).collect())
}

// =============================================================================
// Lifecycle Helpers
// =============================================================================

/// Fail a create when the resource already exists remotely
pub(crate) fn ensure_absent<T>(existing: Option<T>, type_name: &str, id: &str) -> ProviderResult<()> {
    match existing {
        Some(_) => Err(ProviderError::requires_import(type_name, id)),
        None => Ok(()),
    }
}

/// State for a resource that disappeared outside of azstack
pub(crate) fn gone(id: &ResourceId, description: &impl std::fmt::Display) -> State {
    log::warn!("{} was not found - removing from state", description);
    State::not_found(id.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use azstack_core::resource::Value;

    #[test]
    fn every_type_has_a_schema_with_an_id() {
        for resource_type in resource_types() {
            let schema = resource_type.schema();
            assert_eq!(schema.resource_type, resource_type.name());
            assert!(
                schema.get("id").is_some_and(|a| a.read_only),
                "{} has no read-only id",
                resource_type.name()
            );
            assert!(resource_type.name().starts_with("azurestack_"));
        }
    }

    #[test]
    fn schema_lookup_by_name() {
        assert!(schema_for("azurestack_managed_disk").is_some());
        assert!(schema_for("azurestack_virtual_machine").is_none());
    }

    #[test]
    fn resource_group_names_are_validated() {
        let t = resource_group_name_type();
        assert!(t.validate(&Value::from("my-rg_(1).x")).is_ok());
        assert!(t.validate(&Value::from("ends.")).is_err());
        assert!(t.validate(&Value::from("has space")).is_err());
    }

    #[test]
    fn create_refuses_existing_resources() {
        assert!(ensure_absent::<()>(None, "t", "/id").is_ok());
        let err = ensure_absent(Some(()), "azurestack_image", "/id").unwrap_err();
        assert!(err.is_requires_import());
    }
}
