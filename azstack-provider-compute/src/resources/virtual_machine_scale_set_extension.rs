//! azurestack_virtual_machine_scale_set_extension

use azstack_core::differ::find_changed_attributes;
use azstack_core::provider::ProviderResult;
use azstack_core::resource::{Resource, ResourceId, State};
use azstack_core::schema::{AttributeSchema, AttributeType, DiffSuppress, ResourceSchema, types};

use super::{ensure_absent, gone, id_attribute};
use crate::client::{ArmClient, ArmResultExt, api_version};
use crate::models::{Extension, ExtensionProperties, VirtualMachineScaleSet};
use crate::parse::{VirtualMachineScaleSetExtensionId, VirtualMachineScaleSetId, validate_id};
use crate::utils::{
    Attributes, expand_json_object, flatten_json_object, get_bool, get_str, require_str, set_bool,
    set_str,
};

pub const TYPE_NAME: &str = "azurestack_virtual_machine_scale_set_extension";

pub fn schema() -> ResourceSchema {
    ResourceSchema::new(TYPE_NAME)
        .with_description("Extension installed on every instance of a scale set")
        .attribute(id_attribute())
        .attribute(
            AttributeSchema::new("name", types::non_empty_string())
                .required()
                .force_new(),
        )
        .attribute(
            AttributeSchema::new(
                "virtual_machine_scale_set_id",
                AttributeType::Custom {
                    name: "VirtualMachineScaleSetId".to_string(),
                    base: Box::new(AttributeType::String),
                    validate: validate_id::<VirtualMachineScaleSetId>,
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
        .attribute(
            AttributeSchema::new("type", types::non_empty_string())
                .required()
                .force_new(),
        )
        .attribute(AttributeSchema::new("type_handler_version", types::non_empty_string()).required())
        .attribute(
            AttributeSchema::new("auto_upgrade_minor_version", AttributeType::Bool).with_default(true),
        )
        .attribute(AttributeSchema::new("force_update_tag", AttributeType::String))
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
}

fn extension_id(attrs: &Attributes) -> ProviderResult<VirtualMachineScaleSetExtensionId> {
    let set = VirtualMachineScaleSetId::parse(require_str(attrs, "virtual_machine_scale_set_id")?)?;
    Ok(VirtualMachineScaleSetExtensionId::new(
        set.subscription_id,
        set.resource_group,
        set.name,
        require_str(attrs, "name")?,
    ))
}

fn expand(id: &VirtualMachineScaleSetExtensionId, attrs: &Attributes) -> ProviderResult<Extension> {
    Ok(Extension {
        name: Some(id.extension_name.clone()),
        properties: Some(ExtensionProperties {
            publisher: Some(require_str(attrs, "publisher")?.to_string()),
            extension_type: Some(require_str(attrs, "type")?.to_string()),
            type_handler_version: Some(require_str(attrs, "type_handler_version")?.to_string()),
            auto_upgrade_minor_version: Some(
                get_bool(attrs, "auto_upgrade_minor_version").unwrap_or(true),
            ),
            force_update_tag: get_str(attrs, "force_update_tag").map(str::to_string),
            settings: Some(empty_when_unset(expand_json_object(attrs, "settings")?)),
            protected_settings: Some(empty_when_unset(expand_json_object(
                attrs,
                "protected_settings",
            )?)),
            ..Default::default()
        }),
        ..Default::default()
    })
}

fn empty_when_unset(value: Option<serde_json::Value>) -> serde_json::Value {
    value.unwrap_or_else(|| serde_json::Value::Object(Default::default()))
}

/// Body carrying only the changed properties
fn expand_update(
    id: &VirtualMachineScaleSetExtensionId,
    changed: &[String],
    to: &Attributes,
) -> ProviderResult<Extension> {
    let has = |name: &str| changed.iter().any(|c| c == name);

    // the API resets this to false when omitted
    let mut props = ExtensionProperties {
        auto_upgrade_minor_version: Some(get_bool(to, "auto_upgrade_minor_version").unwrap_or(true)),
        ..Default::default()
    };
    if has("force_update_tag") {
        props.force_update_tag = Some(get_str(to, "force_update_tag").unwrap_or_default().to_string());
    }
    if has("protected_settings") {
        props.protected_settings = Some(empty_when_unset(expand_json_object(to, "protected_settings")?));
    }
    if has("publisher") {
        props.publisher = get_str(to, "publisher").map(str::to_string);
    }
    if has("settings") {
        props.settings = Some(empty_when_unset(expand_json_object(to, "settings")?));
    }
    if has("type") {
        props.extension_type = get_str(to, "type").map(str::to_string);
    }
    if has("type_handler_version") {
        props.type_handler_version = get_str(to, "type_handler_version").map(str::to_string);
    }

    Ok(Extension {
        name: Some(id.extension_name.clone()),
        properties: Some(props),
        ..Default::default()
    })
}

fn flatten(id: &VirtualMachineScaleSetExtensionId, set_id: &str, extension: &Extension) -> Attributes {
    let mut attrs = Attributes::new();
    set_str(&mut attrs, "id", Some(id.id()));
    set_str(&mut attrs, "name", Some(&id.extension_name));
    set_str(&mut attrs, "virtual_machine_scale_set_id", Some(set_id));
    if let Some(props) = &extension.properties {
        set_bool(
            &mut attrs,
            "auto_upgrade_minor_version",
            props.auto_upgrade_minor_version,
        );
        set_str(&mut attrs, "force_update_tag", props.force_update_tag.as_ref());
        set_str(&mut attrs, "publisher", props.publisher.as_ref());
        set_str(&mut attrs, "type", props.extension_type.as_ref());
        set_str(&mut attrs, "type_handler_version", props.type_handler_version.as_ref());
        let settings = props
            .settings
            .as_ref()
            .filter(|s| s.as_object().is_some_and(|o| !o.is_empty()));
        set_str(&mut attrs, "settings", flatten_json_object(settings));
    }
    attrs
}

pub async fn create(client: &ArmClient, resource: &Resource) -> ProviderResult<State> {
    let id = extension_id(&resource.attributes)?;

    let existing: Option<Extension> = client
        .get(&id.id(), api_version::VIRTUAL_MACHINE_SCALE_SETS)
        .await
        .with_context(|| format!("checking for existing {}", id))?;
    ensure_absent(existing, TYPE_NAME, &id.id())?;

    let body = expand(&id, &resource.attributes)?;
    client
        .put(&id.id(), api_version::VIRTUAL_MACHINE_SCALE_SETS, &body)
        .await
        .with_context(|| format!("creating {}", id))?;

    read(client, &resource.id, &id.id()).await
}

pub async fn update(
    client: &ArmClient,
    rid: &ResourceId,
    identifier: &str,
    from: &State,
    to: &Resource,
) -> ProviderResult<State> {
    let id = VirtualMachineScaleSetExtensionId::parse(identifier)?;
    let changed = find_changed_attributes(&to.attributes, &from.attributes, Some(&schema()));
    let body = expand_update(&id, &changed, &to.attributes)?;

    client
        .put(&id.id(), api_version::VIRTUAL_MACHINE_SCALE_SETS, &body)
        .await
        .with_context(|| {
            format!(
                "updating Extension {:?} (Virtual Machine Scale Set {:?} / Resource Group {:?})",
                id.extension_name, id.virtual_machine_scale_set_name, id.resource_group
            )
        })?;

    read(client, rid, &id.id()).await
}

pub async fn read(client: &ArmClient, rid: &ResourceId, identifier: &str) -> ProviderResult<State> {
    let id = VirtualMachineScaleSetExtensionId::parse(identifier)?;
    let set_id = VirtualMachineScaleSetId::new(
        &id.subscription_id,
        &id.resource_group,
        &id.virtual_machine_scale_set_name,
    );

    let Some(set) = client
        .get::<VirtualMachineScaleSet>(&set_id.id(), api_version::VIRTUAL_MACHINE_SCALE_SETS)
        .await
        .with_context(|| {
            format!(
                "retrieving Virtual Machine Scale Set {:?} (Resource Group {:?})",
                set_id.name, set_id.resource_group
            )
        })?
    else {
        return Ok(gone(rid, &set_id));
    };

    let Some(extension) = client
        .get::<Extension>(&id.id(), api_version::VIRTUAL_MACHINE_SCALE_SETS)
        .await
        .with_context(|| {
            format!(
                "retrieving Extension {:?} (Virtual Machine Scale Set {:?} / Resource Group {:?})",
                id.extension_name, id.virtual_machine_scale_set_name, id.resource_group
            )
        })?
    else {
        return Ok(gone(rid, &id));
    };

    let set_id = set.id.unwrap_or_else(|| set_id.id());
    Ok(State::existing(rid.clone(), flatten(&id, &set_id, &extension)).with_identifier(id.id()))
}

pub async fn delete(client: &ArmClient, identifier: &str) -> ProviderResult<()> {
    let id = VirtualMachineScaleSetExtensionId::parse(identifier)?;
    client
        .delete(&id.id(), api_version::VIRTUAL_MACHINE_SCALE_SETS, &[])
        .await
        .with_context(|| {
            format!(
                "deleting Extension {:?} (Virtual Machine Scale Set {:?} / Resource Group {:?})",
                id.extension_name, id.virtual_machine_scale_set_name, id.resource_group
            )
        })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use azstack_core::resource::Value;
    use serde_json::json;

    const SET: &str = "/subscriptions/sub/resourceGroups/rg1/providers/Microsoft.Compute/virtualMachineScaleSets/vmss1";

    fn config() -> Attributes {
        let mut attrs = Attributes::new();
        attrs.insert("name".to_string(), Value::from("health"));
        attrs.insert("virtual_machine_scale_set_id".to_string(), Value::from(SET));
        attrs.insert("publisher".to_string(), Value::from("Microsoft.ManagedServices"));
        attrs.insert("type".to_string(), Value::from("ApplicationHealthLinux"));
        attrs.insert("type_handler_version".to_string(), Value::from("1.0"));
        attrs.insert("settings".to_string(), Value::from(r#"{"port": 80}"#));
        attrs
    }

    #[test]
    fn create_body_defaults_auto_upgrade_and_empty_protected_settings() {
        let id = extension_id(&config()).unwrap();
        assert_eq!(id.id(), format!("{}/extensions/health", SET));

        let body = serde_json::to_value(expand(&id, &config()).unwrap()).unwrap();
        assert_eq!(body["name"], "health");
        assert_eq!(body["properties"]["autoUpgradeMinorVersion"], true);
        assert_eq!(body["properties"]["settings"], json!({"port": 80}));
        assert_eq!(body["properties"]["protectedSettings"], json!({}));
        assert!(body.get("location").is_none());
    }

    #[test]
    fn update_sends_only_changed_properties() {
        let id = extension_id(&config()).unwrap();
        let mut to = config();
        to.insert("type_handler_version".to_string(), Value::from("1.1"));
        to.insert("auto_upgrade_minor_version".to_string(), Value::Bool(false));

        let changed = vec![
            "auto_upgrade_minor_version".to_string(),
            "type_handler_version".to_string(),
        ];
        let body = serde_json::to_value(expand_update(&id, &changed, &to).unwrap()).unwrap();
        assert_eq!(
            body["properties"],
            json!({"typeHandlerVersion": "1.1", "autoUpgradeMinorVersion": false})
        );
    }

    #[test]
    fn unchanged_auto_upgrade_is_still_sent() {
        let id = extension_id(&config()).unwrap();
        let changed = vec!["force_update_tag".to_string()];
        let mut to = config();
        to.insert("force_update_tag".to_string(), Value::from("2"));
        let body = serde_json::to_value(expand_update(&id, &changed, &to).unwrap()).unwrap();
        assert_eq!(
            body["properties"],
            json!({"forceUpdateTag": "2", "autoUpgradeMinorVersion": true})
        );
    }

    #[test]
    fn empty_settings_read_back_as_unset() {
        let id = extension_id(&config()).unwrap();
        let extension: Extension = serde_json::from_value(json!({
            "properties": {"publisher": "p", "type": "t", "typeHandlerVersion": "1.0", "settings": {}}
        }))
        .unwrap();
        let attrs = flatten(&id, SET, &extension);
        assert!(!attrs.contains_key("settings"));
        assert!(!attrs.contains_key("protected_settings"));
        assert_eq!(attrs.get("virtual_machine_scale_set_id"), Some(&Value::from(SET)));
    }
}
