//! azurestack_image

use azstack_core::provider::{ProviderError, ProviderResult};
use azstack_core::resource::{Resource, ResourceId, State, Value};
use azstack_core::schema::{
    AttributeSchema, AttributeType, DiffSuppress, ResourceSchema, normalize_location,
    validate_string_in_slice,
};

use super::{
    arm_id_type, ensure_absent, gone, id_attribute, location_attribute, name_attribute,
    resource_group_name_attribute, tags_attribute,
};
use crate::client::{ArmClient, ArmResultExt, api_version};
use crate::models::{
    Image, ImageDataDisk, ImageOsDisk, ImageProperties, ImageStorageProfile, SubResource,
};
use crate::parse::ImageId;
use crate::utils::{
    Attributes, expand_tags, flatten_tags, get_block, get_blocks, get_int, get_str, require_str,
    set_blocks, set_int, set_str,
};

pub const TYPE_NAME: &str = "azurestack_image";

const CACHING_TYPES: &[&str] = &["None", "ReadOnly", "ReadWrite"];

fn caching_type() -> AttributeType {
    AttributeType::Custom {
        name: "CachingType".to_string(),
        base: Box::new(AttributeType::String),
        validate: |value| validate_string_in_slice(value, CACHING_TYPES, true),
    }
}

fn positive_int() -> AttributeType {
    AttributeType::Custom {
        name: "PositiveInt".to_string(),
        base: Box::new(AttributeType::Int),
        validate: |value| match value {
            Value::Int(n) if *n > 0 => Ok(()),
            Value::Int(_) => Err("must not be zero".to_string()),
            _ => Err("Expected integer".to_string()),
        },
    }
}

pub fn schema() -> ResourceSchema {
    let os_disk = AttributeType::Block(vec![
        AttributeSchema::new(
            "os_type",
            AttributeType::Custom {
                name: "OsType".to_string(),
                base: Box::new(AttributeType::String),
                validate: |value| validate_string_in_slice(value, &["Linux", "Windows"], true),
            },
        )
        .with_diff_suppress(DiffSuppress::CaseInsensitive),
        AttributeSchema::new(
            "os_state",
            AttributeType::Custom {
                name: "OsState".to_string(),
                base: Box::new(AttributeType::String),
                validate: |value| {
                    validate_string_in_slice(value, &["Generalized", "Specialized"], true)
                },
            },
        )
        .with_diff_suppress(DiffSuppress::CaseInsensitive),
        AttributeSchema::new("managed_disk_id", arm_id_type())
            .computed()
            .with_diff_suppress(DiffSuppress::CaseInsensitive),
        AttributeSchema::new("blob_uri", AttributeType::String).computed(),
        AttributeSchema::new("caching", caching_type())
            .with_default("None")
            .with_diff_suppress(DiffSuppress::CaseInsensitive),
        AttributeSchema::new("size_gb", positive_int()).computed(),
    ]);

    let data_disk = AttributeType::Block(vec![
        AttributeSchema::new("lun", AttributeType::Int),
        AttributeSchema::new("managed_disk_id", arm_id_type()),
        AttributeSchema::new("blob_uri", AttributeType::String).computed(),
        AttributeSchema::new("caching", caching_type())
            .with_default("None")
            .with_diff_suppress(DiffSuppress::CaseInsensitive),
        AttributeSchema::new("size_gb", positive_int()).computed(),
    ]);

    ResourceSchema::new(TYPE_NAME)
        .with_description("Custom image captured from a virtual machine or from disks")
        .attribute(id_attribute())
        .attribute(name_attribute())
        .attribute(resource_group_name_attribute())
        .attribute(location_attribute())
        .attribute(AttributeSchema::new("source_virtual_machine_id", arm_id_type()))
        .attribute(AttributeSchema::new("os_disk", os_disk).force_new())
        .attribute(AttributeSchema::new(
            "data_disk",
            AttributeType::List(Box::new(data_disk)),
        ))
        .attribute(tags_attribute())
}

fn expand_os_disk(block: &Attributes) -> ImageOsDisk {
    ImageOsDisk {
        os_type: get_str(block, "os_type").map(str::to_string),
        os_state: get_str(block, "os_state").map(str::to_string),
        managed_disk: get_str(block, "managed_disk_id").map(SubResource::new),
        blob_uri: get_str(block, "blob_uri").map(str::to_string),
        caching: get_str(block, "caching").map(str::to_string),
        disk_size_gb: get_int(block, "size_gb").filter(|size| *size > 0),
    }
}

fn expand_data_disk(block: &Attributes) -> ImageDataDisk {
    ImageDataDisk {
        lun: get_int(block, "lun").unwrap_or(0),
        managed_disk: get_str(block, "managed_disk_id").map(SubResource::new),
        blob_uri: get_str(block, "blob_uri").map(str::to_string),
        caching: get_str(block, "caching").map(str::to_string),
        disk_size_gb: get_int(block, "size_gb").filter(|size| *size > 0),
    }
}

fn expand(id: &ImageId, attrs: &Attributes) -> ProviderResult<Image> {
    // Either a source VM or a storage profile, never both
    let properties = match get_str(attrs, "source_virtual_machine_id") {
        Some(vm) => ImageProperties {
            source_virtual_machine: Some(SubResource::new(vm)),
            ..Default::default()
        },
        None => {
            let os_disk = get_block(attrs, "os_disk").map(expand_os_disk);
            let data_disks: Vec<ImageDataDisk> = get_blocks(attrs, "data_disk")
                .into_iter()
                .map(expand_data_disk)
                .collect();
            if os_disk.is_none() && data_disks.is_empty() {
                return Err(ProviderError::validation(
                    "Cannot create image when both source VM and storage profile are empty",
                ));
            }
            ImageProperties {
                storage_profile: Some(ImageStorageProfile {
                    os_disk,
                    data_disks: Some(data_disks),
                    zone_resilient: Some(false),
                }),
                ..Default::default()
            }
        }
    };

    Ok(Image {
        name: Some(id.name.clone()),
        location: Some(normalize_location(require_str(attrs, "location")?)),
        tags: Some(expand_tags(attrs)),
        properties: Some(properties),
        ..Default::default()
    })
}

fn flatten_os_disk(disk: &ImageOsDisk) -> Attributes {
    let mut block = Attributes::new();
    set_str(&mut block, "blob_uri", disk.blob_uri.as_ref());
    set_int(&mut block, "size_gb", disk.disk_size_gb);
    set_str(
        &mut block,
        "managed_disk_id",
        disk.managed_disk.as_ref().and_then(|d| d.id.as_ref()),
    );
    set_str(&mut block, "caching", disk.caching.as_ref());
    set_str(&mut block, "os_type", disk.os_type.as_ref());
    set_str(&mut block, "os_state", disk.os_state.as_ref());
    block
}

fn flatten_data_disk(disk: &ImageDataDisk) -> Attributes {
    let mut block = Attributes::new();
    set_str(&mut block, "blob_uri", disk.blob_uri.as_ref());
    set_str(&mut block, "caching", disk.caching.as_ref());
    set_int(&mut block, "size_gb", disk.disk_size_gb);
    set_int(&mut block, "lun", Some(disk.lun));
    set_str(
        &mut block,
        "managed_disk_id",
        disk.managed_disk.as_ref().and_then(|d| d.id.as_ref()),
    );
    block
}

fn flatten(id: &ImageId, image: &Image) -> Attributes {
    let mut attrs = Attributes::new();
    set_str(&mut attrs, "id", Some(id.id()));
    set_str(&mut attrs, "name", Some(&id.name));
    set_str(&mut attrs, "resource_group_name", Some(&id.resource_group));
    set_str(
        &mut attrs,
        "location",
        image.location.as_deref().map(normalize_location),
    );

    if let Some(props) = &image.properties {
        if let Some(vm) = props.source_virtual_machine.as_ref().and_then(|vm| vm.id.as_ref()) {
            set_str(&mut attrs, "source_virtual_machine_id", Some(vm));
        } else if let Some(profile) = &props.storage_profile {
            if let Some(disk) = &profile.os_disk {
                attrs.insert("os_disk".to_string(), Value::Map(flatten_os_disk(disk)));
            }
            set_blocks(
                &mut attrs,
                "data_disk",
                profile
                    .data_disks
                    .iter()
                    .flatten()
                    .map(flatten_data_disk)
                    .collect(),
            );
        }
    }

    flatten_tags(&mut attrs, image.tags.as_ref());
    attrs
}

pub async fn create(client: &ArmClient, resource: &Resource) -> ProviderResult<State> {
    log::info!("preparing arguments for Image creation");
    let attrs = &resource.attributes;
    let id = ImageId::new(
        client.subscription_id(),
        require_str(attrs, "resource_group_name")?,
        require_str(attrs, "name")?,
    );

    let existing: Option<Image> = client
        .get(&id.id(), api_version::IMAGES)
        .await
        .with_context(|| format!("checking for presence of existing {}", id))?;
    ensure_absent(existing, TYPE_NAME, &id.id())?;

    create_or_update(client, &resource.id, &id, attrs).await
}

pub async fn update(
    client: &ArmClient,
    rid: &ResourceId,
    identifier: &str,
    to: &Resource,
) -> ProviderResult<State> {
    let id = ImageId::parse(identifier)?;
    create_or_update(client, rid, &id, &to.attributes).await
}

async fn create_or_update(
    client: &ArmClient,
    rid: &ResourceId,
    id: &ImageId,
    attrs: &Attributes,
) -> ProviderResult<State> {
    let body = expand(id, attrs)?;
    client
        .put(&id.id(), api_version::IMAGES, &body)
        .await
        .with_context(|| format!("creating/updating {}", id))?;
    read(client, rid, &id.id()).await
}

pub async fn read(client: &ArmClient, rid: &ResourceId, identifier: &str) -> ProviderResult<State> {
    let id = ImageId::parse(identifier)?;
    let Some(image) = client
        .get::<Image>(&id.id(), api_version::IMAGES)
        .await
        .with_context(|| format!("making Read request on {}", id))?
    else {
        return Ok(gone(rid, &id));
    };
    Ok(State::existing(rid.clone(), flatten(&id, &image)).with_identifier(id.id()))
}

pub async fn delete(client: &ArmClient, identifier: &str) -> ProviderResult<()> {
    let id = ImageId::parse(identifier)?;
    client
        .delete(&id.id(), api_version::IMAGES, &[])
        .await
        .with_context(|| format!("deleting {}", id))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn base() -> Attributes {
        let mut attrs = Attributes::new();
        attrs.insert("name".to_string(), Value::from("golden"));
        attrs.insert("resource_group_name".to_string(), Value::from("rg1"));
        attrs.insert("location".to_string(), Value::from("local"));
        attrs
    }

    fn id() -> ImageId {
        ImageId::new("sub", "rg1", "golden")
    }

    #[test]
    fn source_vm_wins_over_storage_profile() {
        let mut attrs = base();
        attrs.insert(
            "source_virtual_machine_id".to_string(),
            Value::from("/subscriptions/sub/resourceGroups/rg1/providers/Microsoft.Compute/virtualMachines/vm1"),
        );
        let mut disk = Attributes::new();
        disk.insert("os_type".to_string(), Value::from("Linux"));
        attrs.insert("os_disk".to_string(), Value::Map(disk));

        let props = expand(&id(), &attrs).unwrap().properties.unwrap();
        assert!(props.source_virtual_machine.is_some());
        assert!(props.storage_profile.is_none());
    }

    #[test]
    fn storage_profile_from_blobs() {
        let mut attrs = base();
        let mut disk = Attributes::new();
        disk.insert("os_type".to_string(), Value::from("Linux"));
        disk.insert("os_state".to_string(), Value::from("Generalized"));
        disk.insert("blob_uri".to_string(), Value::from("https://acct.blob/vhds/os.vhd"));
        disk.insert("caching".to_string(), Value::from("ReadWrite"));
        attrs.insert("os_disk".to_string(), Value::Map(disk));

        let body = serde_json::to_value(expand(&id(), &attrs).unwrap()).unwrap();
        assert_eq!(
            body["properties"],
            json!({
                "storageProfile": {
                    "osDisk": {
                        "osType": "Linux",
                        "osState": "Generalized",
                        "blobUri": "https://acct.blob/vhds/os.vhd",
                        "caching": "ReadWrite"
                    },
                    "dataDisks": [],
                    "zoneResilient": false
                }
            })
        );
    }

    #[test]
    fn empty_source_is_rejected() {
        let err = expand(&id(), &base()).unwrap_err();
        assert_eq!(
            err.message,
            "Cannot create image when both source VM and storage profile are empty"
        );
    }

    #[test]
    fn flatten_data_disks() {
        let image: Image = serde_json::from_value(json!({
            "location": "local",
            "properties": {
                "storageProfile": {
                    "dataDisks": [
                        {"lun": 1, "caching": "None", "diskSizeGB": 10, "blobUri": "https://b/1.vhd"}
                    ]
                }
            }
        }))
        .unwrap();
        let attrs = flatten(&id(), &image);
        let disks = attrs.get("data_disk").and_then(Value::as_list).unwrap();
        assert_eq!(disks.len(), 1);
        let disk = disks[0].as_map().unwrap();
        assert_eq!(disk.get("lun"), Some(&Value::Int(1)));
        assert_eq!(disk.get("size_gb"), Some(&Value::Int(10)));
        assert!(!attrs.contains_key("os_disk"));
    }
}
