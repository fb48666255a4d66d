//! azurestack_availability_set

use azstack_core::provider::ProviderResult;
use azstack_core::resource::{Resource, ResourceId, State, Value};
use azstack_core::schema::{
    AttributeSchema, AttributeType, ResourceSchema, normalize_location, validate_int_between,
    validate_regex,
};

use super::{
    ensure_absent, gone, id_attribute, location_attribute, resource_group_name_attribute,
    tags_attribute,
};
use crate::client::{ArmClient, ArmResultExt, api_version};
use crate::models::{AvailabilitySet, AvailabilitySetProperties, Sku};
use crate::parse::AvailabilitySetId;
use crate::utils::{
    Attributes, expand_tags, flatten_tags, get_bool, get_int, require_str, set_int, set_str,
};

pub const TYPE_NAME: &str = "azurestack_availability_set";

const MANAGED_SKU: &str = "Aligned";

pub fn schema() -> ResourceSchema {
    ResourceSchema::new(TYPE_NAME)
        .with_description("Availability set grouping virtual machines across fault and update domains")
        .attribute(id_attribute())
        .attribute(
            AttributeSchema::new(
                "name",
                AttributeType::Custom {
                    name: "AvailabilitySetName".to_string(),
                    base: Box::new(AttributeType::String),
                    validate: |value| {
                        validate_regex(
                            value,
                            r"^[a-zA-Z0-9]([-._a-zA-Z0-9]{0,78}[a-zA-Z0-9_])?$",
                            "The Availability set name can contain only letters, numbers, \
                             periods (.), hyphens (-), and underscores (_), up to 80 characters, \
                             and it must begin a letter or number and end with a letter, number \
                             or underscore.",
                        )
                    },
                },
            )
            .required()
            .force_new(),
        )
        .attribute(resource_group_name_attribute())
        .attribute(location_attribute())
        .attribute(
            AttributeSchema::new(
                "platform_update_domain_count",
                AttributeType::Custom {
                    name: "UpdateDomainCount".to_string(),
                    base: Box::new(AttributeType::Int),
                    validate: |value| validate_int_between(value, 1, 20),
                },
            )
            .with_default(Value::Int(5))
            .force_new(),
        )
        .attribute(
            AttributeSchema::new(
                "platform_fault_domain_count",
                AttributeType::Custom {
                    name: "FaultDomainCount".to_string(),
                    base: Box::new(AttributeType::Int),
                    validate: |value| validate_int_between(value, 1, 3),
                },
            )
            .with_default(Value::Int(3))
            .force_new(),
        )
        .attribute(
            AttributeSchema::new("managed", AttributeType::Bool)
                .with_default(true)
                .with_description("Use the Aligned sku required by managed disks")
                .force_new(),
        )
        .attribute(tags_attribute())
}

fn set_id(client: &ArmClient, attrs: &Attributes) -> ProviderResult<AvailabilitySetId> {
    Ok(AvailabilitySetId::new(
        client.subscription_id(),
        require_str(attrs, "resource_group_name")?,
        require_str(attrs, "name")?,
    ))
}

fn expand(id: &AvailabilitySetId, attrs: &Attributes) -> ProviderResult<AvailabilitySet> {
    let managed = get_bool(attrs, "managed").unwrap_or(true);
    Ok(AvailabilitySet {
        name: Some(id.name.clone()),
        location: Some(normalize_location(require_str(attrs, "location")?)),
        tags: Some(expand_tags(attrs)),
        sku: managed.then(|| Sku {
            name: Some(MANAGED_SKU.to_string()),
            ..Default::default()
        }),
        properties: Some(AvailabilitySetProperties {
            platform_fault_domain_count: Some(get_int(attrs, "platform_fault_domain_count").unwrap_or(3)),
            platform_update_domain_count: Some(
                get_int(attrs, "platform_update_domain_count").unwrap_or(5),
            ),
        }),
        ..Default::default()
    })
}

fn flatten(id: &AvailabilitySetId, set: &AvailabilitySet) -> Attributes {
    let mut attrs = Attributes::new();
    set_str(&mut attrs, "id", Some(&id.id()));
    set_str(&mut attrs, "name", set.name.as_deref().or(Some(id.name.as_str())));
    set_str(&mut attrs, "resource_group_name", Some(&id.resource_group));
    set_str(
        &mut attrs,
        "location",
        set.location.as_deref().map(normalize_location),
    );
    let managed = set
        .sku
        .as_ref()
        .and_then(|sku| sku.name.as_deref())
        .is_some_and(|name| name.eq_ignore_ascii_case(MANAGED_SKU));
    attrs.insert("managed".to_string(), Value::Bool(managed));
    if let Some(props) = &set.properties {
        set_int(&mut attrs, "platform_update_domain_count", props.platform_update_domain_count);
        set_int(&mut attrs, "platform_fault_domain_count", props.platform_fault_domain_count);
    }
    flatten_tags(&mut attrs, set.tags.as_ref());
    attrs
}

pub async fn create(client: &ArmClient, resource: &Resource) -> ProviderResult<State> {
    let id = set_id(client, &resource.attributes)?;
    let existing: Option<AvailabilitySet> = client
        .get(&id.id(), api_version::AVAILABILITY_SETS)
        .await
        .with_context(|| format!("checking for presence of existing {}", id))?;
    ensure_absent(existing, TYPE_NAME, &id.id())?;

    create_or_update(client, &resource.id, &id, &resource.attributes).await
}

pub async fn update(
    client: &ArmClient,
    rid: &ResourceId,
    identifier: &str,
    to: &Resource,
) -> ProviderResult<State> {
    let id = AvailabilitySetId::parse(identifier)?;
    create_or_update(client, rid, &id, &to.attributes).await
}

async fn create_or_update(
    client: &ArmClient,
    rid: &ResourceId,
    id: &AvailabilitySetId,
    attrs: &Attributes,
) -> ProviderResult<State> {
    log::info!("preparing arguments for {}", id);
    let body = expand(id, attrs)?;
    client
        .put(&id.id(), api_version::AVAILABILITY_SETS, &body)
        .await
        .with_context(|| format!("creating/updating {}", id))?;
    read(client, rid, &id.id()).await
}

pub async fn read(client: &ArmClient, rid: &ResourceId, identifier: &str) -> ProviderResult<State> {
    let id = AvailabilitySetId::parse(identifier)?;
    let Some(set) = client
        .get::<AvailabilitySet>(&id.id(), api_version::AVAILABILITY_SETS)
        .await
        .with_context(|| format!("making Read request on {}", id))?
    else {
        return Ok(gone(rid, &id));
    };
    Ok(State::existing(rid.clone(), flatten(&id, &set)).with_identifier(id.id()))
}

pub async fn delete(client: &ArmClient, identifier: &str) -> ProviderResult<()> {
    let id = AvailabilitySetId::parse(identifier)?;
    client
        .delete(&id.id(), api_version::AVAILABILITY_SETS, &[])
        .await
        .with_context(|| format!("deleting {}", id))?;
    Ok(())
}
