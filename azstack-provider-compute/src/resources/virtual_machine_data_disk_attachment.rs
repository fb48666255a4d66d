//! azurestack_virtual_machine_data_disk_attachment
//!
//! An attachment has no ARM endpoint of its own: it is one entry of the
//! machine's `storageProfile.dataDisks`, keyed by the disk name. Every change
//! reads the whole machine, edits that list and `PUT`s the machine back.
//! The machine is handled as raw JSON there, so fields without a model in
//! this crate survive the round trip.

use azstack_core::provider::{ProviderError, ProviderResult};
use azstack_core::resource::{Resource, ResourceId, State};
use azstack_core::schema::{AttributeSchema, AttributeType, DiffSuppress, ResourceSchema, types};

use super::virtual_machine::CACHING_TYPES;
use super::{ensure_absent, gone, id_attribute, one_of};
use crate::client::{ArmClient, ArmResultExt, api_version};
use crate::models::{DataDisk, Disk, ManagedDiskParameters, VirtualMachine};
use crate::parse::{DataDiskId, ManagedDiskId, VirtualMachineId, validate_id};
use crate::utils::{Attributes, get_bool, get_int, get_str, require_str, set_bool, set_int, set_str};

pub const TYPE_NAME: &str = "azurestack_virtual_machine_data_disk_attachment";

const CREATE_ATTACH: &str = "Attach";
const CREATE_EMPTY: &str = "Empty";

pub fn schema() -> ResourceSchema {
    ResourceSchema::new(TYPE_NAME)
        .with_description("Managed disk attached to a virtual machine")
        .attribute(id_attribute())
        .attribute(
            AttributeSchema::new(
                "managed_disk_id",
                AttributeType::Custom {
                    name: "ManagedDiskId".to_string(),
                    base: Box::new(AttributeType::String),
                    validate: validate_id::<ManagedDiskId>,
                },
            )
            .required()
            .force_new()
            .with_diff_suppress(DiffSuppress::CaseInsensitive),
        )
        .attribute(
            AttributeSchema::new(
                "virtual_machine_id",
                AttributeType::Custom {
                    name: "VirtualMachineId".to_string(),
                    base: Box::new(AttributeType::String),
                    validate: validate_id::<VirtualMachineId>,
                },
            )
            .required()
            .force_new()
            .with_diff_suppress(DiffSuppress::CaseInsensitive),
        )
        .attribute(
            AttributeSchema::new("lun", types::non_negative_int())
                .required()
                .force_new(),
        )
        .attribute(
            AttributeSchema::new("caching", one_of(CACHING_TYPES))
                .required()
                .with_diff_suppress(DiffSuppress::CaseInsensitive),
        )
        .attribute(
            AttributeSchema::new("create_option", one_of(&[CREATE_ATTACH, CREATE_EMPTY]))
                .with_default(CREATE_ATTACH)
                .force_new()
                .with_diff_suppress(DiffSuppress::CaseInsensitive),
        )
        .attribute(
            AttributeSchema::new("write_accelerator_enabled", AttributeType::Bool)
                .with_default(false),
        )
}

fn expand(
    name: &str,
    managed_disk_id: &str,
    storage_account_type: &str,
    attrs: &Attributes,
) -> ProviderResult<DataDisk> {
    let lun = get_int(attrs, "lun")
        .ok_or_else(|| ProviderError::validation("`lun` is required"))?;
    Ok(DataDisk {
        lun,
        name: Some(name.to_string()),
        caching: Some(require_str(attrs, "caching")?.to_string()),
        create_option: Some(get_str(attrs, "create_option").unwrap_or(CREATE_ATTACH).to_string()),
        write_accelerator_enabled: Some(
            get_bool(attrs, "write_accelerator_enabled").unwrap_or(false),
        ),
        managed_disk: Some(ManagedDiskParameters {
            id: Some(managed_disk_id.to_string()),
            storage_account_type: Some(storage_account_type.to_string()),
        }),
    })
}

fn flatten(id: &DataDiskId, vm_id: &str, disk: &DataDisk) -> Attributes {
    let mut attrs = Attributes::new();
    set_str(&mut attrs, "id", Some(id.id()));
    set_str(&mut attrs, "virtual_machine_id", Some(vm_id));
    set_int(&mut attrs, "lun", Some(disk.lun));
    set_str(&mut attrs, "caching", disk.caching.as_ref());
    set_str(&mut attrs, "create_option", disk.create_option.as_ref());
    set_bool(
        &mut attrs,
        "write_accelerator_enabled",
        Some(disk.write_accelerator_enabled.unwrap_or(false)),
    );
    set_str(
        &mut attrs,
        "managed_disk_id",
        disk.managed_disk.as_ref().and_then(|m| m.id.as_ref()),
    );
    attrs
}

fn disk_name(disk: &serde_json::Value) -> Option<&str> {
    disk.get("name").and_then(serde_json::Value::as_str)
}

/// The raw `dataDisks` entries of a machine
fn data_disks(vm: &serde_json::Value) -> Vec<serde_json::Value> {
    vm.pointer("/properties/storageProfile/dataDisks")
        .and_then(serde_json::Value::as_array)
        .cloned()
        .unwrap_or_default()
}

/// Machine body carrying `disks` as its data disks
///
/// `identity` and `resources` are dropped: the API rejects them in a `PUT`
/// of an existing machine.
fn with_data_disks(
    mut vm: serde_json::Value,
    disks: Vec<serde_json::Value>,
) -> ProviderResult<serde_json::Value> {
    let object = vm
        .as_object_mut()
        .ok_or_else(|| ProviderError::new("the Virtual Machine response was not an object"))?;
    object.remove("identity");
    object.remove("resources");
    let storage = object
        .get_mut("properties")
        .and_then(|p| p.get_mut("storageProfile"))
        .and_then(serde_json::Value::as_object_mut)
        .ok_or_else(|| {
            ProviderError::new("the Virtual Machine response has no `properties.storageProfile`")
        })?;
    storage.insert("dataDisks".to_string(), serde_json::Value::Array(disks));
    Ok(vm)
}

pub async fn create(client: &ArmClient, resource: &Resource) -> ProviderResult<State> {
    create_or_update(client, &resource.id, &resource.attributes, true).await
}

pub async fn update(client: &ArmClient, rid: &ResourceId, to: &Resource) -> ProviderResult<State> {
    create_or_update(client, rid, &to.attributes, false).await
}

async fn create_or_update(
    client: &ArmClient,
    rid: &ResourceId,
    attrs: &Attributes,
    is_new: bool,
) -> ProviderResult<State> {
    let raw_vm_id = require_str(attrs, "virtual_machine_id")?;
    let vm_id = VirtualMachineId::parse(raw_vm_id).map_err(|e| {
        ProviderError::invalid_id(format!("parsing Virtual Machine ID {:?}: {}", raw_vm_id, e))
    })?;

    let vm: serde_json::Value = client
        .get(&vm_id.id(), api_version::VIRTUAL_MACHINES)
        .await
        .with_context(|| format!("loading {}", vm_id))?
        .ok_or_else(|| ProviderError::not_found(format!("{} was not found", vm_id)))?;

    let managed_disk_id = require_str(attrs, "managed_disk_id")?;
    let disk_id = ManagedDiskId::parse(managed_disk_id)?;
    let disk: Disk = client
        .get(&disk_id.id(), api_version::DISKS)
        .await
        .with_context(|| format!("retrieving {}", disk_id))?
        .ok_or_else(|| ProviderError::not_found(format!("{} was not found", disk_id)))?;
    let Some(storage_account_type) = disk.sku.as_ref().and_then(|s| s.name.as_deref()) else {
        return Err(ProviderError::validation(format!(
            "unable to determine Storage Account Type for {}",
            disk_id
        )));
    };

    let name = disk.name.clone().unwrap_or_else(|| disk_id.disk_name.clone());
    let id = DataDiskId::new(&vm_id.subscription_id, &vm_id.resource_group, &vm_id.name, &name);
    let entry = expand(&name, managed_disk_id, storage_account_type, attrs)?;
    let entry = serde_json::to_value(entry)
        .map_err(|e| ProviderError::new(format!("encoding Data Disk {:?}", name)).with_cause(e))?;

    let mut disks = data_disks(&vm);
    let position = disks.iter().position(|d| disk_name(d) == Some(name.as_str()));
    if is_new {
        ensure_absent(position, TYPE_NAME, &id.id())?;
        disks.push(entry);
    } else {
        let Some(i) = position else {
            return Err(ProviderError::not_found(format!(
                "unable to find Disk {:?} attached to {}",
                name, vm_id
            )));
        };
        disks[i] = entry;
    }

    log::info!("attaching Disk {:?} to {} at LUN {:?}", name, vm_id, get_int(attrs, "lun"));
    let body = with_data_disks(vm, disks)?;
    client
        .put(&vm_id.id(), api_version::VIRTUAL_MACHINES, &body)
        .await
        .with_context(|| format!("updating {} with Disk {:?}", vm_id, name))?;

    read(client, rid, &id.id()).await
}

pub async fn read(client: &ArmClient, rid: &ResourceId, identifier: &str) -> ProviderResult<State> {
    let id = DataDiskId::parse(identifier)?;
    let vm_id = VirtualMachineId::new(&id.subscription_id, &id.resource_group, &id.virtual_machine_name);

    let Some(vm) = client
        .get::<VirtualMachine>(&vm_id.id(), api_version::VIRTUAL_MACHINES)
        .await
        .with_context(|| format!("loading {}", vm_id))?
    else {
        return Ok(gone(rid, &vm_id));
    };

    // disk names are matched exactly, as the API does
    let disk = vm
        .properties
        .as_ref()
        .and_then(|p| p.storage_profile.as_ref())
        .and_then(|s| s.data_disks.as_deref())
        .unwrap_or_default()
        .iter()
        .find(|d| d.name.as_deref() == Some(id.name.as_str()));
    let Some(disk) = disk else {
        return Ok(gone(rid, &id));
    };

    let vm_arm_id = vm.id.clone().unwrap_or_else(|| vm_id.id());
    Ok(State::existing(rid.clone(), flatten(&id, &vm_arm_id, disk)).with_identifier(id.id()))
}

pub async fn delete(client: &ArmClient, identifier: &str) -> ProviderResult<()> {
    let id = DataDiskId::parse(identifier)?;
    let vm_id = VirtualMachineId::new(&id.subscription_id, &id.resource_group, &id.virtual_machine_name);

    let vm: serde_json::Value = client
        .get(&vm_id.id(), api_version::VIRTUAL_MACHINES)
        .await
        .with_context(|| format!("loading {}", vm_id))?
        .ok_or_else(|| ProviderError::not_found(format!("{} was not found", vm_id)))?;

    let disks = data_disks(&vm)
        .into_iter()
        .filter(|d| disk_name(d) != Some(id.name.as_str()))
        .collect();
    let body = with_data_disks(vm, disks)?;

    log::debug!("detaching Disk {:?} from {}", id.name, vm_id);
    client
        .put(&vm_id.id(), api_version::VIRTUAL_MACHINES, &body)
        .await
        .with_context(|| format!("removing Disk {:?} from {}", id.name, vm_id))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use azstack_core::resource::Value;
    use serde_json::json;

    const VM: &str =
        "/subscriptions/sub/resourceGroups/rg1/providers/Microsoft.Compute/virtualMachines/vm1";
    const DISK: &str = "/subscriptions/sub/resourceGroups/rg1/providers/Microsoft.Compute/disks/logs";

    fn config() -> Attributes {
        let mut attrs = Attributes::new();
        attrs.insert("managed_disk_id".to_string(), Value::from(DISK));
        attrs.insert("virtual_machine_id".to_string(), Value::from(VM));
        attrs.insert("lun".to_string(), Value::Int(10));
        attrs.insert("caching".to_string(), Value::from("ReadWrite"));
        attrs
    }

    #[test]
    fn entry_takes_the_storage_type_of_the_disk() {
        let disk = serde_json::to_value(expand("logs", DISK, "Premium_LRS", &config()).unwrap())
            .unwrap();
        assert_eq!(
            disk,
            json!({
                "lun": 10,
                "name": "logs",
                "caching": "ReadWrite",
                "createOption": "Attach",
                "writeAcceleratorEnabled": false,
                "managedDisk": {"id": DISK, "storageAccountType": "Premium_LRS"}
            })
        );
    }

    #[test]
    fn machine_body_keeps_unknown_fields_and_drops_identity() {
        let vm = json!({
            "id": VM,
            "identity": {"type": "SystemAssigned"},
            "resources": [{"id": "ext"}],
            "properties": {
                "licenseType": "Windows_Server",
                "storageProfile": {
                    "osDisk": {"name": "os"},
                    "dataDisks": [{"lun": 0, "name": "old", "diskSizeGB": 8}]
                }
            }
        });
        let mut disks = data_disks(&vm);
        assert_eq!(disks.len(), 1);
        disks.push(json!({"lun": 1, "name": "new"}));

        let body = with_data_disks(vm, disks).unwrap();
        assert!(body.get("identity").is_none());
        assert!(body.get("resources").is_none());
        assert_eq!(body["properties"]["licenseType"], "Windows_Server");
        assert_eq!(body["properties"]["storageProfile"]["osDisk"]["name"], "os");
        assert_eq!(
            body["properties"]["storageProfile"]["dataDisks"],
            json!([{"lun": 0, "name": "old", "diskSizeGB": 8}, {"lun": 1, "name": "new"}])
        );
    }

    #[test]
    fn machine_without_storage_profile_is_an_error() {
        let err = with_data_disks(json!({"properties": {}}), vec![]).unwrap_err();
        assert!(err.message.contains("storageProfile"));
    }

    #[test]
    fn flatten_matches_the_configuration() {
        let id = DataDiskId::new("sub", "rg1", "vm1", "logs");
        let disk = expand("logs", DISK, "Standard_LRS", &config()).unwrap();
        let attrs = flatten(&id, VM, &disk);
        assert_eq!(attrs.get("id"), Some(&Value::from(format!("{}/dataDisks/logs", VM))));

        let schema = schema();
        for (name, value) in config() {
            assert!(
                schema.get(&name).unwrap().matches(&value, attrs.get(&name).unwrap()),
                "{} differs after a round trip",
                name
            );
        }
    }
}
