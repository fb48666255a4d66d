//! azurestack_managed_disk
//!
//! Resizing a disk or changing its sku is not allowed while the virtual
//! machine it is attached to is running. Update powers that machine down
//! around the disk `PATCH` and brings it back up afterwards.

use azstack_core::differ::find_changed_attributes;
use azstack_core::provider::{ProviderError, ProviderResult};
use azstack_core::resource::{Resource, ResourceId, State, Value};
use azstack_core::schema::{
    AttributeSchema, AttributeType, DiffSuppress, ResourceSchema, normalize_location,
    validate_int_between, validate_string_in_slice,
};

use super::{
    arm_id_type, ensure_absent, gone, id_attribute, location_attribute, name_attribute, one_of,
    resource_group_name_attribute, tags_attribute, virtual_machine,
};
use crate::client::{ArmClient, ArmResultExt, api_version};
use crate::models::{
    CreationData, Disk, DiskProperties, DiskUpdate, DiskUpdateProperties,
    EncryptionSettingsCollection, EncryptionSettingsElement, KeyVaultAndKeyReference,
    KeyVaultAndSecretReference, Sku, SubResource,
};
use crate::parse::{ManagedDiskId, VirtualMachineId};
use crate::utils::{
    Attributes, expand_tags, flatten_tags, get_block, get_bool, get_int, get_str, require_str,
    set_block, set_int, set_str,
};

pub const TYPE_NAME: &str = "azurestack_managed_disk";

const STORAGE_ACCOUNT_TYPES: &[&str] = &["Standard_LRS", "Premium_LRS"];

pub fn schema() -> ResourceSchema {
    ResourceSchema::new(TYPE_NAME)
        .with_description("Managed disk")
        .attribute(id_attribute())
        .attribute(name_attribute())
        .attribute(resource_group_name_attribute())
        .attribute(location_attribute())
        .attribute(
            AttributeSchema::new(
                "storage_account_type",
                AttributeType::Custom {
                    name: "StorageAccountType".to_string(),
                    base: Box::new(AttributeType::String),
                    validate: |value| validate_string_in_slice(value, STORAGE_ACCOUNT_TYPES, false),
                },
            )
            .required()
            .with_diff_suppress(DiffSuppress::CaseInsensitive),
        )
        .attribute(
            AttributeSchema::new("create_option", one_of(&["Copy", "Empty", "FromImage", "Import"]))
                .required()
                .force_new(),
        )
        .attribute(
            AttributeSchema::new(
                "disk_size_gb",
                AttributeType::Custom {
                    name: "ManagedDiskSizeGB".to_string(),
                    base: Box::new(AttributeType::Int),
                    validate: |value| validate_int_between(value, 0, 32767),
                },
            )
            .computed(),
        )
        .attribute(
            AttributeSchema::new(
                "os_type",
                AttributeType::Custom {
                    name: "OsType".to_string(),
                    base: Box::new(AttributeType::String),
                    validate: |value| validate_string_in_slice(value, &["Windows", "Linux"], true),
                },
            )
            .with_diff_suppress(DiffSuppress::CaseInsensitive),
        )
        .attribute(AttributeSchema::new("hyper_v_generation", one_of(&["V1", "V2"])).force_new())
        .attribute(
            AttributeSchema::new("source_uri", AttributeType::String)
                .computed()
                .force_new(),
        )
        .attribute(AttributeSchema::new("source_resource_id", AttributeType::String).force_new())
        .attribute(AttributeSchema::new("storage_account_id", arm_id_type()).force_new())
        .attribute(AttributeSchema::new("image_reference_id", AttributeType::String).force_new())
        .attribute(AttributeSchema::new("encryption", encryption_block()))
        .attribute(tags_attribute())
}

fn encryption_block() -> AttributeType {
    AttributeType::Block(vec![
        AttributeSchema::new("enabled", AttributeType::Bool).required(),
        AttributeSchema::new(
            "disk_encryption_key",
            AttributeType::Block(vec![
                AttributeSchema::new("secret_url", AttributeType::String).required(),
                AttributeSchema::new("source_vault_id", arm_id_type()).required(),
            ]),
        ),
        AttributeSchema::new(
            "key_encryption_key",
            AttributeType::Block(vec![
                AttributeSchema::new("key_url", AttributeType::String).required(),
                AttributeSchema::new("source_vault_id", arm_id_type()).required(),
            ]),
        ),
    ])
}

/// Canonical casing of a storage account type
fn storage_account_type(value: &str) -> String {
    STORAGE_ACCOUNT_TYPES
        .iter()
        .find(|t| t.eq_ignore_ascii_case(value))
        .map(|t| t.to_string())
        .unwrap_or_else(|| value.to_string())
}

fn expand_creation_data(attrs: &Attributes) -> ProviderResult<CreationData> {
    let create_option = require_str(attrs, "create_option")?;
    let mut data = CreationData {
        create_option: create_option.to_string(),
        ..Default::default()
    };

    match create_option {
        "Import" => {
            let source_uri = get_str(attrs, "source_uri").ok_or_else(|| {
                ProviderError::validation(
                    "`source_uri` must be specified when `create_option` is set to `Import`",
                )
            })?;
            let storage_account_id = get_str(attrs, "storage_account_id").ok_or_else(|| {
                ProviderError::validation(
                    "`storage_account_id` must be specified when `create_option` is set to `Import`",
                )
            })?;
            data.source_uri = Some(source_uri.to_string());
            data.storage_account_id = Some(storage_account_id.to_string());
        }
        "Copy" => {
            let source = get_str(attrs, "source_resource_id").ok_or_else(|| {
                ProviderError::validation(
                    "`source_resource_id` must be specified when `create_option` is set to `Copy` or `Restore`",
                )
            })?;
            data.source_resource_id = Some(source.to_string());
        }
        "FromImage" => {
            let image = get_str(attrs, "image_reference_id").ok_or_else(|| {
                ProviderError::validation(
                    "`image_reference_id` must be specified when `create_option` is set to `FromImage`",
                )
            })?;
            data.image_reference = Some(SubResource::new(image));
        }
        _ => {}
    }

    Ok(data)
}

fn expand_encryption(block: &Attributes) -> EncryptionSettingsCollection {
    let disk_encryption_key = get_block(block, "disk_encryption_key").map(|key| {
        KeyVaultAndSecretReference {
            secret_url: get_str(key, "secret_url").unwrap_or_default().to_string(),
            source_vault: SubResource::new(get_str(key, "source_vault_id").unwrap_or_default()),
        }
    });
    let key_encryption_key = get_block(block, "key_encryption_key").map(|key| {
        KeyVaultAndKeyReference {
            key_url: get_str(key, "key_url").unwrap_or_default().to_string(),
            source_vault: SubResource::new(get_str(key, "source_vault_id").unwrap_or_default()),
        }
    });

    let has_keys = disk_encryption_key.is_some() || key_encryption_key.is_some();
    EncryptionSettingsCollection {
        enabled: get_bool(block, "enabled").unwrap_or(false),
        encryption_settings: has_keys.then(|| {
            vec![EncryptionSettingsElement {
                disk_encryption_key,
                key_encryption_key,
            }]
        }),
    }
}

fn flatten_encryption(settings: &EncryptionSettingsCollection) -> Attributes {
    let mut block = Attributes::new();
    block.insert("enabled".to_string(), Value::Bool(settings.enabled));

    let element = settings
        .encryption_settings
        .as_ref()
        .and_then(|elements| elements.first());
    if let Some(key) = element.and_then(|e| e.disk_encryption_key.as_ref()) {
        let mut dek = Attributes::new();
        set_str(&mut dek, "secret_url", Some(&key.secret_url));
        set_str(&mut dek, "source_vault_id", key.source_vault.id.as_ref());
        set_block(&mut block, "disk_encryption_key", dek);
    }
    if let Some(key) = element.and_then(|e| e.key_encryption_key.as_ref()) {
        let mut kek = Attributes::new();
        set_str(&mut kek, "key_url", Some(&key.key_url));
        set_str(&mut kek, "source_vault_id", key.source_vault.id.as_ref());
        set_block(&mut block, "key_encryption_key", kek);
    }
    block
}

fn expand(id: &ManagedDiskId, attrs: &Attributes) -> ProviderResult<Disk> {
    let mut props = DiskProperties {
        creation_data: Some(expand_creation_data(attrs)?),
        os_type: get_str(attrs, "os_type").map(str::to_string),
        hyper_v_generation: get_str(attrs, "hyper_v_generation").map(str::to_string),
        encryption_settings_collection: get_block(attrs, "encryption").map(expand_encryption),
        ..Default::default()
    };
    if let Some(size) = get_int(attrs, "disk_size_gb").filter(|size| *size != 0) {
        props.disk_size_gb = Some(size);
    }

    Ok(Disk {
        name: Some(id.disk_name.clone()),
        location: Some(normalize_location(require_str(attrs, "location")?)),
        tags: Some(expand_tags(attrs)),
        sku: Some(Sku {
            name: Some(storage_account_type(require_str(attrs, "storage_account_type")?)),
            ..Default::default()
        }),
        properties: Some(props),
        ..Default::default()
    })
}

fn flatten(id: &ManagedDiskId, disk: &Disk) -> Attributes {
    let mut attrs = Attributes::new();
    set_str(&mut attrs, "id", Some(id.id()));
    set_str(&mut attrs, "name", disk.name.as_ref().or(Some(&id.disk_name)));
    set_str(&mut attrs, "resource_group_name", Some(&id.resource_group));
    set_str(
        &mut attrs,
        "location",
        disk.location.as_deref().map(normalize_location),
    );
    set_str(
        &mut attrs,
        "storage_account_type",
        disk.sku.as_ref().and_then(|sku| sku.name.as_ref()),
    );

    if let Some(props) = &disk.properties {
        if let Some(data) = &props.creation_data {
            set_str(&mut attrs, "create_option", Some(&data.create_option));
            set_str(
                &mut attrs,
                "image_reference_id",
                data.image_reference.as_ref().and_then(|r| r.id.as_ref()),
            );
            set_str(&mut attrs, "source_resource_id", data.source_resource_id.as_ref());
            set_str(&mut attrs, "source_uri", data.source_uri.as_ref());
            set_str(&mut attrs, "storage_account_id", data.storage_account_id.as_ref());
        }
        set_int(&mut attrs, "disk_size_gb", props.disk_size_gb);
        set_str(&mut attrs, "os_type", props.os_type.as_ref());
        set_str(&mut attrs, "hyper_v_generation", props.hyper_v_generation.as_ref());
        if let Some(settings) = &props.encryption_settings_collection {
            set_block(&mut attrs, "encryption", flatten_encryption(settings));
        }
    }

    flatten_tags(&mut attrs, disk.tags.as_ref());
    attrs
}

/// `PATCH` body holding only the changed attributes
///
/// The flag tells whether the change needs the owning virtual machine to be
/// shut down.
fn expand_update(
    changed: &[String],
    from: &Attributes,
    to: &Attributes,
) -> ProviderResult<(DiskUpdate, bool)> {
    let has_change = |name: &str| changed.iter().any(|c| c == name);
    let mut update = DiskUpdate::default();
    let mut props = DiskUpdateProperties::default();
    let mut needs_shutdown = false;

    if has_change("tags") {
        update.tags = Some(expand_tags(to));
    }

    if has_change("storage_account_type") {
        needs_shutdown = true;
        update.sku = Some(Sku {
            name: Some(storage_account_type(require_str(to, "storage_account_type")?)),
            ..Default::default()
        });
    }

    if has_change("os_type") {
        props.os_type = get_str(to, "os_type").map(str::to_string);
    }

    if has_change("disk_size_gb") {
        let old = get_int(from, "disk_size_gb").unwrap_or(0);
        match get_int(to, "disk_size_gb") {
            Some(new) if new > old => {
                needs_shutdown = true;
                props.disk_size_gb = Some(new);
            }
            _ => {
                return Err(ProviderError::validation(
                    "- New size must be greater than original size. Shrinking disks is not supported on Azure",
                ));
            }
        }
    }

    if has_change("encryption") {
        props.encryption_settings_collection = get_block(to, "encryption").map(expand_encryption);
    }

    if !props.is_empty() {
        update.properties = Some(props);
    }
    Ok((update, needs_shutdown))
}

pub async fn create(client: &ArmClient, resource: &Resource) -> ProviderResult<State> {
    let attrs = &resource.attributes;
    log::info!("preparing arguments for Managed Disk creation");
    let id = ManagedDiskId::new(
        client.subscription_id(),
        require_str(attrs, "resource_group_name")?,
        require_str(attrs, "name")?,
    );

    let existing: Option<Disk> = client
        .get(&id.id(), api_version::DISKS)
        .await
        .with_context(|| format!("checking for presence of existing {}", id))?;
    ensure_absent(existing, TYPE_NAME, &id.id())?;

    let body = expand(&id, attrs)?;
    client
        .put(&id.id(), api_version::DISKS, &body)
        .await
        .with_context(|| format!("creating/updating {}", id))?;

    read(client, &resource.id, &id.id()).await
}

pub async fn read(client: &ArmClient, rid: &ResourceId, identifier: &str) -> ProviderResult<State> {
    let id = ManagedDiskId::parse(identifier)?;
    let Some(disk) = client
        .get::<Disk>(&id.id(), api_version::DISKS)
        .await
        .with_context(|| format!("making Read request on {}", id))?
    else {
        return Ok(gone(rid, &id));
    };
    Ok(State::existing(rid.clone(), flatten(&id, &disk)).with_identifier(id.id()))
}

pub async fn update(
    client: &ArmClient,
    rid: &ResourceId,
    identifier: &str,
    from: &State,
    to: &Resource,
) -> ProviderResult<State> {
    let id = ManagedDiskId::parse(identifier)?;
    log::info!("preparing arguments for {} update", id);

    let disk: Disk = client
        .get(&id.id(), api_version::DISKS)
        .await
        .with_context(|| format!("making Read request on {}", id))?
        .ok_or_else(|| {
            ProviderError::not_found(format!(
                "Managed Disk {:?} (Resource Group {:?}) was not found",
                id.disk_name, id.resource_group
            ))
        })?;

    let changed = find_changed_attributes(&to.attributes, &from.attributes, Some(&schema()));
    let (body, needs_shutdown) = expand_update(&changed, &from.attributes, &to.attributes)?;

    // Only a disk attached to a machine needs that machine powered down
    let owner = match (&disk.managed_by, needs_shutdown) {
        (Some(managed_by), true) => Some(
            VirtualMachineId::parse_insensitively(managed_by)
                .map_err(|e| {
                    ProviderError::invalid_id(format!(
                        "parsing VMID {:?} for disk attachment: {}",
                        managed_by, e
                    ))
                })?,
        ),
        _ => None,
    };

    match owner {
        Some(vm) => {
            let state = virtual_machine::power_state(client, &vm).await?;
            let cycle = virtual_machine::PowerCycle::for_state(state.as_deref());
            cycle.stop(client, &vm).await?;
            patch(client, &id, &body).await?;
            cycle.restart(client, &vm).await?;
        }
        None => patch(client, &id, &body).await?,
    }

    read(client, rid, &id.id()).await
}

async fn patch(client: &ArmClient, id: &ManagedDiskId, body: &DiskUpdate) -> ProviderResult<()> {
    client
        .patch(&id.id(), api_version::DISKS, body)
        .await
        .with_context(|| format!("updating {}", id))
}

pub async fn delete(client: &ArmClient, identifier: &str) -> ProviderResult<()> {
    let id = ManagedDiskId::parse(identifier)?;
    client
        .delete(&id.id(), api_version::DISKS, &[])
        .await
        .with_context(|| format!("deleting {}", id))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn config(pairs: &[(&str, Value)]) -> Attributes {
        let mut attrs = Attributes::new();
        attrs.insert("name".to_string(), Value::from("disk1"));
        attrs.insert("resource_group_name".to_string(), Value::from("rg1"));
        attrs.insert("location".to_string(), Value::from("local"));
        attrs.insert("storage_account_type".to_string(), Value::from("standard_lrs"));
        attrs.insert("create_option".to_string(), Value::from("Empty"));
        for (k, v) in pairs {
            attrs.insert(k.to_string(), v.clone());
        }
        attrs
    }

    fn id() -> ManagedDiskId {
        ManagedDiskId::new("sub", "rg1", "disk1")
    }

    #[test]
    fn empty_disk_body() {
        let body = expand(&id(), &config(&[("disk_size_gb", Value::Int(10))])).unwrap();
        assert_eq!(
            serde_json::to_value(body).unwrap(),
            json!({
                "name": "disk1",
                "location": "local",
                "tags": {},
                "sku": {"name": "Standard_LRS"},
                "properties": {
                    "creationData": {"createOption": "Empty"},
                    "diskSizeGB": 10
                }
            })
        );
    }

    #[test]
    fn zero_size_is_not_sent() {
        let body = expand(&id(), &config(&[("disk_size_gb", Value::Int(0))])).unwrap();
        assert!(body.properties.unwrap().disk_size_gb.is_none());
    }

    #[test]
    fn create_options_require_their_source() {
        let cases = [
            ("Import", "`source_uri` must be specified when `create_option` is set to `Import`"),
            (
                "Copy",
                "`source_resource_id` must be specified when `create_option` is set to `Copy` or `Restore`",
            ),
            (
                "FromImage",
                "`image_reference_id` must be specified when `create_option` is set to `FromImage`",
            ),
        ];
        for (option, message) in cases {
            let err = expand(&id(), &config(&[("create_option", Value::from(option))])).unwrap_err();
            assert_eq!(err.message, message);
        }

        let err = expand(
            &id(),
            &config(&[
                ("create_option", Value::from("Import")),
                ("source_uri", Value::from("https://acct.blob/vhds/os.vhd")),
            ]),
        )
        .unwrap_err();
        assert_eq!(
            err.message,
            "`storage_account_id` must be specified when `create_option` is set to `Import`"
        );
    }

    #[test]
    fn encryption_round_trips() {
        let mut dek = Attributes::new();
        dek.insert("secret_url".to_string(), Value::from("https://vault/secrets/s/1"));
        dek.insert("source_vault_id".to_string(), Value::from("/subscriptions/s/resourceGroups/rg/providers/Microsoft.KeyVault/vaults/v"));
        let mut block = Attributes::new();
        block.insert("enabled".to_string(), Value::Bool(true));
        block.insert("disk_encryption_key".to_string(), Value::Map(dek));

        let settings = expand_encryption(&block);
        assert!(settings.enabled);
        assert_eq!(settings.encryption_settings.as_ref().map(Vec::len), Some(1));
        assert_eq!(flatten_encryption(&settings), block);
    }

    #[test]
    fn update_sends_only_changed_fields() {
        let from = config(&[("disk_size_gb", Value::Int(10))]);
        let mut tags = std::collections::HashMap::new();
        tags.insert("env".to_string(), Value::from("prod"));
        let to = config(&[("disk_size_gb", Value::Int(10)), ("tags", Value::Map(tags))]);

        let changed = find_changed_attributes(&to, &from, Some(&schema()));
        assert_eq!(changed, vec!["tags".to_string()]);

        let (body, needs_shutdown) = expand_update(&changed, &from, &to).unwrap();
        assert!(!needs_shutdown);
        assert_eq!(
            serde_json::to_value(body).unwrap(),
            json!({"tags": {"env": "prod"}})
        );
    }

    #[test]
    fn growing_needs_shutdown_and_shrinking_fails() {
        let from = config(&[("disk_size_gb", Value::Int(20))]);
        let grow = config(&[("disk_size_gb", Value::Int(30))]);
        let changed = vec!["disk_size_gb".to_string()];

        let (body, needs_shutdown) = expand_update(&changed, &from, &grow).unwrap();
        assert!(needs_shutdown);
        assert_eq!(
            serde_json::to_value(body).unwrap(),
            json!({"properties": {"diskSizeGB": 30}})
        );

        let shrink = config(&[("disk_size_gb", Value::Int(10))]);
        let err = expand_update(&changed, &from, &shrink).unwrap_err();
        assert!(err.message.contains("Shrinking disks is not supported"));
    }

    #[test]
    fn storage_account_type_is_compared_case_insensitively() {
        let from = config(&[("storage_account_type", Value::from("Standard_LRS"))]);
        let to = config(&[]);
        assert!(find_changed_attributes(&to, &from, Some(&schema())).is_empty());
    }

    #[test]
    fn flatten_reads_the_api_shape() {
        let disk: Disk = serde_json::from_value(json!({
            "name": "disk1",
            "location": "Local",
            "sku": {"name": "Premium_LRS"},
            "managedBy": "/subscriptions/sub/resourceGroups/rg1/providers/Microsoft.Compute/virtualMachines/vm1",
            "properties": {
                "creationData": {"createOption": "Empty"},
                "diskSizeGB": 32,
                "osType": "Linux"
            },
            "tags": {"env": "test"}
        }))
        .unwrap();
        let attrs = flatten(&id(), &disk);
        assert_eq!(attrs.get("location"), Some(&Value::from("local")));
        assert_eq!(attrs.get("storage_account_type"), Some(&Value::from("Premium_LRS")));
        assert_eq!(attrs.get("disk_size_gb"), Some(&Value::Int(32)));
        assert_eq!(attrs.get("create_option"), Some(&Value::from("Empty")));
        assert!(!attrs.contains_key("encryption"));
    }
}
