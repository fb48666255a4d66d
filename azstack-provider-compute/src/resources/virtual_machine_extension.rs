//! azurestack_virtual_machine_extension

use azstack_core::provider::{ProviderError, ProviderResult};
use azstack_core::resource::{Resource, ResourceId, State};
use azstack_core::schema::{AttributeSchema, AttributeType, DiffSuppress, ResourceSchema, types};

use super::{ensure_absent, gone, id_attribute, tags_attribute};
use crate::client::{ArmClient, ArmResultExt, api_version};
use crate::models::{Extension, ExtensionProperties, VirtualMachine};
use crate::parse::{VirtualMachineExtensionId, VirtualMachineId, validate_id};
use crate::utils::{
    Attributes, expand_json_object, expand_tags, flatten_json_object, flatten_tags, get_bool,
    require_str, set_bool, set_str,
};

pub const TYPE_NAME: &str = "azurestack_virtual_machine_extension";

pub fn schema() -> ResourceSchema {
    ResourceSchema::new(TYPE_NAME)
        .with_description("Extension installed on a virtual machine")
        .attribute(id_attribute())
        .attribute(
            AttributeSchema::new("name", types::non_empty_string())
                .required()
                .force_new(),
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
            .force_new(),
        )
        .attribute(
            AttributeSchema::new("publisher", types::non_empty_string())
                .required()
                .force_new(),
        )
        .attribute(AttributeSchema::new("type", types::non_empty_string()).required())
        .attribute(AttributeSchema::new("type_handler_version", types::non_empty_string()).required())
        .attribute(AttributeSchema::new("auto_upgrade_minor_version", AttributeType::Bool))
        .attribute(
            AttributeSchema::new("settings", types::json_object())
                .with_diff_suppress(DiffSuppress::Json),
        )
        .attribute(
            AttributeSchema::new("protected_settings", types::json_object())
                .sensitive()
                .write_only()
                .with_diff_suppress(DiffSuppress::Json),
        )
        .attribute(tags_attribute())
}

/// Extension ID from the configured parent machine and name
fn extension_id(attrs: &Attributes) -> ProviderResult<(VirtualMachineId, VirtualMachineExtensionId)> {
    let raw = require_str(attrs, "virtual_machine_id")?;
    let vm = VirtualMachineId::parse(raw).map_err(|e| {
        ProviderError::invalid_id(format!("parsing Virtual Machine ID {:?}: {}", raw, e))
    })?;
    let id = VirtualMachineExtensionId::new(
        &vm.subscription_id,
        &vm.resource_group,
        &vm.name,
        require_str(attrs, "name")?,
    );
    Ok((vm, id))
}

fn expand(location: &str, attrs: &Attributes) -> ProviderResult<Extension> {
    Ok(Extension {
        location: Some(location.to_string()),
        tags: Some(expand_tags(attrs)),
        properties: Some(ExtensionProperties {
            publisher: Some(require_str(attrs, "publisher")?.to_string()),
            extension_type: Some(require_str(attrs, "type")?.to_string()),
            type_handler_version: Some(require_str(attrs, "type_handler_version")?.to_string()),
            auto_upgrade_minor_version: Some(
                get_bool(attrs, "auto_upgrade_minor_version").unwrap_or(false),
            ),
            settings: expand_json_object(attrs, "settings")?,
            protected_settings: expand_json_object(attrs, "protected_settings")?,
            ..Default::default()
        }),
        ..Default::default()
    })
}

fn flatten(id: &VirtualMachineExtensionId, vm_id: &str, extension: &Extension) -> Attributes {
    let mut attrs = Attributes::new();
    set_str(&mut attrs, "id", Some(id.id()));
    set_str(
        &mut attrs,
        "name",
        extension.name.as_deref().or(Some(id.extension_name.as_str())),
    );
    set_str(&mut attrs, "virtual_machine_id", Some(vm_id));
    if let Some(props) = &extension.properties {
        set_str(&mut attrs, "publisher", props.publisher.as_ref());
        set_str(&mut attrs, "type", props.extension_type.as_ref());
        set_str(&mut attrs, "type_handler_version", props.type_handler_version.as_ref());
        set_bool(
            &mut attrs,
            "auto_upgrade_minor_version",
            props.auto_upgrade_minor_version,
        );
        set_str(
            &mut attrs,
            "settings",
            flatten_json_object(props.settings.as_ref()),
        );
    }
    flatten_tags(&mut attrs, extension.tags.as_ref());
    attrs
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
    let (vm_id, id) = extension_id(attrs)?;
    log::info!("preparing arguments for {}", id);

    let vm: VirtualMachine = client
        .get(&vm_id.id(), api_version::VIRTUAL_MACHINES)
        .await
        .with_context(|| format!("getting {}", vm_id))?
        .ok_or_else(|| ProviderError::not_found(format!("getting {}: not found", vm_id)))?;
    let Some(location) = vm.location.filter(|l| !l.is_empty()) else {
        return Err(ProviderError::validation(format!(
            "reading location of {}",
            vm_id
        )));
    };

    if is_new {
        let existing: Option<Extension> = client
            .get(&id.id(), api_version::VIRTUAL_MACHINES)
            .await
            .with_context(|| format!("checking for presence of existing {}", id))?;
        ensure_absent(existing, TYPE_NAME, &id.id())?;
    }

    let body = expand(&location, attrs)?;
    client
        .put(&id.id(), api_version::VIRTUAL_MACHINES, &body)
        .await
        .with_context(|| format!("creating/updating {}", id))?;

    read(client, rid, &id.id()).await
}

pub async fn read(client: &ArmClient, rid: &ResourceId, identifier: &str) -> ProviderResult<State> {
    let id = VirtualMachineExtensionId::parse(identifier)?;
    let vm_id = VirtualMachineId::new(&id.subscription_id, &id.resource_group, &id.virtual_machine_name);

    let Some(vm) = client
        .get::<VirtualMachine>(&vm_id.id(), api_version::VIRTUAL_MACHINES)
        .await
        .with_context(|| format!("making Read request on Virtual Machine {}", id.extension_name))?
    else {
        return Ok(gone(rid, &vm_id));
    };

    let Some(extension) = client
        .get::<Extension>(&id.id(), api_version::VIRTUAL_MACHINES)
        .await
        .with_context(|| {
            format!(
                "making Read request on Virtual Machine Extension {}",
                id.extension_name
            )
        })?
    else {
        return Ok(gone(rid, &id));
    };

    let vm_id = vm.id.unwrap_or_else(|| vm_id.id());
    Ok(State::existing(rid.clone(), flatten(&id, &vm_id, &extension)).with_identifier(id.id()))
}

pub async fn delete(client: &ArmClient, identifier: &str) -> ProviderResult<()> {
    let id = VirtualMachineExtensionId::parse(identifier)?;
    client
        .delete(&id.id(), api_version::VIRTUAL_MACHINES, &[])
        .await
        .with_context(|| format!("deleting {}", id))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use azstack_core::resource::Value;
    use serde_json::json;

    const VM: &str =
        "/subscriptions/sub/resourceGroups/rg1/providers/Microsoft.Compute/virtualMachines/vm1";

    fn config() -> Attributes {
        let mut attrs = Attributes::new();
        attrs.insert("name".to_string(), Value::from("script"));
        attrs.insert("virtual_machine_id".to_string(), Value::from(VM));
        attrs.insert("publisher".to_string(), Value::from("Microsoft.Azure.Extensions"));
        attrs.insert("type".to_string(), Value::from("CustomScript"));
        attrs.insert("type_handler_version".to_string(), Value::from("2.0"));
        attrs.insert(
            "settings".to_string(),
            Value::from(r#"{"commandToExecute": "hostname"}"#),
        );
        attrs.insert(
            "protected_settings".to_string(),
            Value::from(r#"{"storageAccountKey": "secret"}"#),
        );
        attrs
    }

    #[test]
    fn id_is_built_from_the_parent_machine() {
        let (vm, id) = extension_id(&config()).unwrap();
        assert_eq!(vm.id(), VM);
        assert_eq!(id.id(), format!("{}/extensions/script", VM));
    }

    #[test]
    fn body_carries_both_settings_objects() {
        let body = serde_json::to_value(expand("local", &config()).unwrap()).unwrap();
        assert_eq!(body["location"], "local");
        assert_eq!(body["properties"]["type"], "CustomScript");
        assert_eq!(body["properties"]["autoUpgradeMinorVersion"], false);
        assert_eq!(body["properties"]["settings"], json!({"commandToExecute": "hostname"}));
        assert_eq!(body["properties"]["protectedSettings"], json!({"storageAccountKey": "secret"}));
    }

    #[test]
    fn invalid_settings_are_rejected() {
        let mut attrs = config();
        attrs.insert("settings".to_string(), Value::from("not json"));
        assert!(expand("local", &attrs).is_err());
    }

    #[test]
    fn flatten_never_returns_protected_settings() {
        let (_, id) = extension_id(&config()).unwrap();
        let extension: Extension = serde_json::from_value(json!({
            "name": "script",
            "properties": {
                "publisher": "Microsoft.Azure.Extensions",
                "type": "CustomScript",
                "typeHandlerVersion": "2.0",
                "settings": {"commandToExecute": "hostname"}
            }
        }))
        .unwrap();
        let attrs = flatten(&id, VM, &extension);
        assert!(!attrs.contains_key("protected_settings"));
        assert_eq!(attrs.get("type"), Some(&Value::from("CustomScript")));
        let settings = schema();
        let settings = settings.get("settings").unwrap();
        assert!(settings.matches(
            &Value::from(r#"{ "commandToExecute":  "hostname" }"#),
            attrs.get("settings").unwrap()
        ));
    }
}
