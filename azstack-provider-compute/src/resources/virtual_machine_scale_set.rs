//! azurestack_linux_virtual_machine_scale_set / azurestack_windows_virtual_machine_scale_set
//!
//! Both types share one handler, switched on `OsKind` like the single
//! machines. Updates are sent as a `PATCH` of the changed fields. The existing image
//! reference and upgrade policy are always threaded through, since the API
//! rejects a partial storage profile and breaks automatic/rolling sets
//! without an upgrade policy. Changes to the instance model are rolled out
//! to every instance afterwards when the set uses manual upgrades.

use azstack_core::differ::find_changed_attributes;
use azstack_core::provider::{ProviderError, ProviderResult};
use azstack_core::resource::{Resource, ResourceId, State, Value};
use azstack_core::schema::{
    AttributeSchema, AttributeType, DiffSuppress, ResourceSchema, normalize_location,
    validate_int_between, types,
};
use serde_json::json;

use super::virtual_machine::{
    CACHING_TYPES, OsKind, STORAGE_ACCOUNT_TYPES, admin_ssh_key_attribute, boot_diagnostics_attribute,
    expand_boot_diagnostics, expand_image_reference, expand_ssh_keys, flatten_boot_diagnostics,
    flatten_image_reference, flatten_ssh_keys, source_image_reference_attribute,
};
use super::{
    arm_id_type, ensure_absent, gone, id_attribute, location_attribute, name_attribute, one_of,
    resource_group_name_attribute, tags_attribute,
};
use crate::client::{ArmClient, ArmResultExt, api_version};
use crate::config::VirtualMachineScaleSetFeatures;
use crate::models::{
    LinuxConfiguration, ManagedDiskParameters, ScaleSetDataDisk, ScaleSetInstance,
    ScaleSetIpConfiguration, ScaleSetIpConfigurationProperties, ScaleSetNetworkConfiguration,
    ScaleSetNetworkConfigurationProperties, ScaleSetNetworkProfile, ScaleSetOsDisk,
    ScaleSetOsProfile, ScaleSetStorageProfile, ScaleSetVmProfile, Sku, SshConfiguration,
    SubResource, UpgradePolicy, VirtualMachineScaleSet, VirtualMachineScaleSetProperties,
    WindowsConfiguration,
};
use crate::parse::VirtualMachineScaleSetId;
use crate::utils::{
    Attributes, expand_tags, flatten_tags, get_block, get_blocks, get_bool, get_int, get_str,
    get_string_list, require_str, set_block, set_blocks, set_bool, set_int, set_str,
};

pub const LINUX_TYPE_NAME: &str = "azurestack_linux_virtual_machine_scale_set";
pub const WINDOWS_TYPE_NAME: &str = "azurestack_windows_virtual_machine_scale_set";

const UPGRADE_AUTOMATIC: &str = "Automatic";
const UPGRADE_MANUAL: &str = "Manual";
const UPGRADE_ROLLING: &str = "Rolling";

/// Longest computer name prefix a Linux scale set accepts
const LINUX_COMPUTER_NAME_PREFIX_MAX: usize = 58;

/// Longest computer name prefix a Windows scale set accepts
const WINDOWS_COMPUTER_NAME_PREFIX_MAX: usize = 9;

pub fn type_name(kind: OsKind) -> &'static str {
    match kind {
        OsKind::Linux => LINUX_TYPE_NAME,
        OsKind::Windows => WINDOWS_TYPE_NAME,
    }
}

fn percent() -> AttributeType {
    AttributeType::Custom {
        name: "Percent".to_string(),
        base: Box::new(AttributeType::Int),
        validate: |value| validate_int_between(value, 5, 100),
    }
}

fn network_interface_attribute() -> AttributeSchema {
    let ip_configuration = AttributeType::Block(vec![
        AttributeSchema::new("name", types::non_empty_string()).required(),
        AttributeSchema::new("primary", AttributeType::Bool).with_default(false),
        AttributeSchema::new("subnet_id", arm_id_type())
            .with_diff_suppress(DiffSuppress::CaseInsensitive),
        AttributeSchema::new(
            "load_balancer_backend_address_pool_ids",
            AttributeType::List(Box::new(arm_id_type())),
        )
        .with_diff_suppress(DiffSuppress::CaseInsensitive),
    ]);

    AttributeSchema::new(
        "network_interface",
        AttributeType::List(Box::new(AttributeType::Block(vec![
            AttributeSchema::new("name", types::non_empty_string())
                .required()
                .force_new(),
            AttributeSchema::new("primary", AttributeType::Bool).with_default(false),
            AttributeSchema::new("network_security_group_id", arm_id_type())
                .with_diff_suppress(DiffSuppress::CaseInsensitive),
            AttributeSchema::new("ip_configuration", AttributeType::List(Box::new(ip_configuration)))
                .required(),
        ]))),
    )
    .required()
}

fn common_schema(kind: OsKind, description: &str) -> ResourceSchema {
    ResourceSchema::new(type_name(kind))
        .with_description(description)
        .attribute(id_attribute())
        .attribute(name_attribute())
        .attribute(resource_group_name_attribute())
        .attribute(location_attribute())
        .attribute(AttributeSchema::new("sku", types::non_empty_string()).required())
        .attribute(AttributeSchema::new("instances", types::non_negative_int()).required())
        .attribute(
            AttributeSchema::new("admin_username", types::non_empty_string())
                .required()
                .force_new(),
        )
        .attribute(
            AttributeSchema::new("computer_name_prefix", types::non_empty_string())
                .computed()
                .force_new(),
        )
        .attribute(
            AttributeSchema::new("custom_data", AttributeType::String)
                .sensitive()
                .write_only(),
        )
        .attribute(
            AttributeSchema::new("provision_vm_agent", AttributeType::Bool)
                .with_default(true)
                .force_new(),
        )
        .attribute(network_interface_attribute())
        .attribute(
            AttributeSchema::new("health_probe_id", arm_id_type())
                .with_diff_suppress(DiffSuppress::CaseInsensitive),
        )
        .attribute(
            AttributeSchema::new(
                "os_disk",
                AttributeType::Block(vec![
                    AttributeSchema::new("caching", one_of(CACHING_TYPES)).required(),
                    AttributeSchema::new("storage_account_type", one_of(STORAGE_ACCOUNT_TYPES))
                        .required()
                        .force_new(),
                    AttributeSchema::new(
                        "disk_size_gb",
                        AttributeType::Custom {
                            name: "DiskSizeGB".to_string(),
                            base: Box::new(AttributeType::Int),
                            validate: |value| validate_int_between(value, 0, 4095),
                        },
                    )
                    .computed(),
                ]),
            )
            .required(),
        )
        .attribute(AttributeSchema::new(
            "data_disk",
            AttributeType::List(Box::new(AttributeType::Block(vec![
                AttributeSchema::new(
                    "lun",
                    AttributeType::Custom {
                        name: "Lun".to_string(),
                        base: Box::new(AttributeType::Int),
                        validate: |value| validate_int_between(value, 0, 2000),
                    },
                )
                .required(),
                AttributeSchema::new("caching", one_of(CACHING_TYPES)).required(),
                AttributeSchema::new("storage_account_type", one_of(STORAGE_ACCOUNT_TYPES))
                    .required(),
                AttributeSchema::new(
                    "disk_size_gb",
                    AttributeType::Custom {
                        name: "DiskSizeGB".to_string(),
                        base: Box::new(AttributeType::Int),
                        validate: |value| validate_int_between(value, 1, 32767),
                    },
                )
                .required(),
                AttributeSchema::new("create_option", one_of(&["Empty", "FromImage"]))
                    .with_default("Empty"),
            ]))),
        ))
        .attribute(source_image_reference_attribute())
        .attribute(
            AttributeSchema::new("source_image_id", arm_id_type())
                .with_diff_suppress(DiffSuppress::CaseInsensitive),
        )
        .attribute(
            AttributeSchema::new(
                "upgrade_mode",
                one_of(&[UPGRADE_AUTOMATIC, UPGRADE_MANUAL, UPGRADE_ROLLING]),
            )
            .with_default(UPGRADE_MANUAL)
            .force_new(),
        )
        .attribute(AttributeSchema::new(
            "rolling_upgrade_policy",
            AttributeType::Block(vec![
                AttributeSchema::new("max_batch_instance_percent", percent()).required(),
                AttributeSchema::new("max_unhealthy_instance_percent", percent()).required(),
                AttributeSchema::new("max_unhealthy_upgraded_instance_percent", percent())
                    .required(),
                AttributeSchema::new("pause_time_between_batches", types::non_empty_string())
                    .required(),
            ]),
        ))
        .attribute(AttributeSchema::new("overprovision", AttributeType::Bool).with_default(true))
        .attribute(
            AttributeSchema::new("single_placement_group", AttributeType::Bool).with_default(true),
        )
        .attribute(boot_diagnostics_attribute())
        .attribute(AttributeSchema::new("unique_id", AttributeType::String).read_only())
        .attribute(tags_attribute())
}

pub fn linux_schema() -> ResourceSchema {
    common_schema(OsKind::Linux, "Linux virtual machine scale set")
        .attribute(
            AttributeSchema::new("admin_password", types::non_empty_string())
                .force_new()
                .sensitive()
                .write_only(),
        )
        .attribute(admin_ssh_key_attribute())
        .attribute(
            AttributeSchema::new("disable_password_authentication", AttributeType::Bool)
                .with_default(true),
        )
}

pub fn windows_schema() -> ResourceSchema {
    common_schema(OsKind::Windows, "Windows virtual machine scale set")
        .attribute(
            AttributeSchema::new("admin_password", types::non_empty_string())
                .required()
                .force_new()
                .sensitive()
                .write_only(),
        )
        .attribute(
            AttributeSchema::new("enable_automatic_updates", AttributeType::Bool).with_default(true),
        )
        .attribute(
            AttributeSchema::new("timezone", types::non_empty_string())
                .with_diff_suppress(DiffSuppress::CaseInsensitive),
        )
}

pub fn schema(kind: OsKind) -> ResourceSchema {
    match kind {
        OsKind::Linux => linux_schema(),
        OsKind::Windows => windows_schema(),
    }
}

// =============================================================================
// Expand / Flatten
// =============================================================================

fn expand_ip_configuration(raw: &Attributes) -> ScaleSetIpConfiguration {
    let pools: Vec<SubResource> = get_string_list(raw, "load_balancer_backend_address_pool_ids")
        .into_iter()
        .map(SubResource::new)
        .collect();
    ScaleSetIpConfiguration {
        name: get_str(raw, "name").map(str::to_string),
        properties: Some(ScaleSetIpConfigurationProperties {
            primary: Some(get_bool(raw, "primary").unwrap_or(false)),
            subnet: get_str(raw, "subnet_id").map(SubResource::new),
            load_balancer_backend_address_pools: (!pools.is_empty()).then_some(pools),
        }),
    }
}

fn expand_network_interfaces(attrs: &Attributes) -> Vec<ScaleSetNetworkConfiguration> {
    get_blocks(attrs, "network_interface")
        .into_iter()
        .map(|nic| ScaleSetNetworkConfiguration {
            name: get_str(nic, "name").map(str::to_string),
            properties: Some(ScaleSetNetworkConfigurationProperties {
                primary: Some(get_bool(nic, "primary").unwrap_or(false)),
                network_security_group: get_str(nic, "network_security_group_id")
                    .map(SubResource::new),
                ip_configurations: Some(
                    get_blocks(nic, "ip_configuration")
                        .into_iter()
                        .map(expand_ip_configuration)
                        .collect(),
                ),
            }),
        })
        .collect()
}

fn expand_network_profile(attrs: &Attributes) -> ScaleSetNetworkProfile {
    ScaleSetNetworkProfile {
        health_probe: get_str(attrs, "health_probe_id").map(SubResource::new),
        network_interface_configurations: Some(expand_network_interfaces(attrs)),
    }
}

fn flatten_network_interfaces(configs: &[ScaleSetNetworkConfiguration]) -> Vec<Attributes> {
    configs
        .iter()
        .map(|config| {
            let mut nic = Attributes::new();
            set_str(&mut nic, "name", config.name.as_ref());
            let Some(props) = &config.properties else {
                return nic;
            };
            set_bool(&mut nic, "primary", Some(props.primary.unwrap_or(false)));
            set_str(
                &mut nic,
                "network_security_group_id",
                props.network_security_group.as_ref().and_then(|n| n.id.as_ref()),
            );
            let ip_configurations = props
                .ip_configurations
                .iter()
                .flatten()
                .map(|ip| {
                    let mut block = Attributes::new();
                    set_str(&mut block, "name", ip.name.as_ref());
                    if let Some(p) = &ip.properties {
                        set_bool(&mut block, "primary", Some(p.primary.unwrap_or(false)));
                        set_str(
                            &mut block,
                            "subnet_id",
                            p.subnet.as_ref().and_then(|s| s.id.as_ref()),
                        );
                        let pools: Vec<Value> = p
                            .load_balancer_backend_address_pools
                            .iter()
                            .flatten()
                            .filter_map(|pool| pool.id.as_deref())
                            .map(Value::from)
                            .collect();
                        if !pools.is_empty() {
                            block.insert(
                                "load_balancer_backend_address_pool_ids".to_string(),
                                Value::List(pools),
                            );
                        }
                    }
                    block
                })
                .collect();
            set_blocks(&mut nic, "ip_configuration", ip_configurations);
            nic
        })
        .collect()
}

fn expand_os_disk(kind: OsKind, attrs: &Attributes) -> ProviderResult<ScaleSetOsDisk> {
    let Some(disk) = get_block(attrs, "os_disk") else {
        return Err(ProviderError::validation("an `os_disk` block must be specified"));
    };
    Ok(ScaleSetOsDisk {
        caching: get_str(disk, "caching").map(str::to_string),
        create_option: Some("FromImage".to_string()),
        os_type: Some(kind.label().to_string()),
        disk_size_gb: get_int(disk, "disk_size_gb").filter(|size| *size > 0),
        managed_disk: Some(ManagedDiskParameters {
            storage_account_type: get_str(disk, "storage_account_type").map(str::to_string),
            id: None,
        }),
    })
}

fn flatten_os_disk(disk: &ScaleSetOsDisk) -> Attributes {
    let mut block = Attributes::new();
    set_str(&mut block, "caching", disk.caching.as_ref());
    set_int(&mut block, "disk_size_gb", disk.disk_size_gb.filter(|size| *size > 0));
    set_str(
        &mut block,
        "storage_account_type",
        disk.managed_disk
            .as_ref()
            .and_then(|m| m.storage_account_type.as_ref()),
    );
    block
}

fn expand_data_disks(attrs: &Attributes) -> Vec<ScaleSetDataDisk> {
    get_blocks(attrs, "data_disk")
        .into_iter()
        .map(|disk| ScaleSetDataDisk {
            lun: get_int(disk, "lun").unwrap_or(0),
            caching: get_str(disk, "caching").map(str::to_string),
            create_option: Some(get_str(disk, "create_option").unwrap_or("Empty").to_string()),
            disk_size_gb: get_int(disk, "disk_size_gb"),
            managed_disk: Some(ManagedDiskParameters {
                storage_account_type: get_str(disk, "storage_account_type").map(str::to_string),
                id: None,
            }),
        })
        .collect()
}

fn flatten_data_disks(disks: &[ScaleSetDataDisk]) -> Vec<Attributes> {
    disks
        .iter()
        .map(|disk| {
            let mut block = Attributes::new();
            set_int(&mut block, "lun", Some(disk.lun));
            set_str(&mut block, "caching", disk.caching.as_ref());
            set_str(&mut block, "create_option", disk.create_option.as_ref());
            set_int(&mut block, "disk_size_gb", disk.disk_size_gb);
            set_str(
                &mut block,
                "storage_account_type",
                disk.managed_disk
                    .as_ref()
                    .and_then(|m| m.storage_account_type.as_ref()),
            );
            block
        })
        .collect()
}

fn expand_rolling_upgrade_policy(attrs: &Attributes) -> Option<serde_json::Value> {
    let policy = get_block(attrs, "rolling_upgrade_policy")?;
    Some(json!({
        "maxBatchInstancePercent": get_int(policy, "max_batch_instance_percent"),
        "maxUnhealthyInstancePercent": get_int(policy, "max_unhealthy_instance_percent"),
        "maxUnhealthyUpgradedInstancePercent": get_int(policy, "max_unhealthy_upgraded_instance_percent"),
        "pauseTimeBetweenBatches": get_str(policy, "pause_time_between_batches"),
    }))
}

fn flatten_rolling_upgrade_policy(policy: &serde_json::Value) -> Attributes {
    let mut block = Attributes::new();
    for (key, field) in [
        ("max_batch_instance_percent", "maxBatchInstancePercent"),
        ("max_unhealthy_instance_percent", "maxUnhealthyInstancePercent"),
        (
            "max_unhealthy_upgraded_instance_percent",
            "maxUnhealthyUpgradedInstancePercent",
        ),
    ] {
        set_int(&mut block, key, policy.get(field).and_then(serde_json::Value::as_i64));
    }
    set_str(
        &mut block,
        "pause_time_between_batches",
        policy
            .get("pauseTimeBetweenBatches")
            .and_then(serde_json::Value::as_str),
    );
    block
}

fn expand_upgrade_policy(attrs: &Attributes) -> ProviderResult<UpgradePolicy> {
    let mode = get_str(attrs, "upgrade_mode").unwrap_or(UPGRADE_MANUAL);
    let rolling = expand_rolling_upgrade_policy(attrs);

    if mode == UPGRADE_MANUAL && rolling.is_some() {
        return Err(ProviderError::validation(format!(
            "a `rolling_upgrade_policy` block cannot be specified when `upgrade_mode` is set to {:?}",
            mode
        )));
    }
    if mode == UPGRADE_ROLLING {
        if rolling.is_none() {
            return Err(ProviderError::validation(format!(
                "a `rolling_upgrade_policy` block must be specified when `upgrade_mode` is set to {:?}",
                mode
            )));
        }
        if get_str(attrs, "health_probe_id").is_none() {
            return Err(ProviderError::validation(format!(
                "`health_probe_id` must be set or a health extension must be specified when \
                 `upgrade_mode` is set to {:?}",
                mode
            )));
        }
    }

    Ok(UpgradePolicy {
        mode: Some(mode.to_string()),
        rolling_upgrade_policy: rolling,
    })
}

/// Computer name prefix, defaulting to the scale set name
fn computer_name_prefix(kind: OsKind, attrs: &Attributes, name: &str) -> ProviderResult<String> {
    if let Some(prefix) = get_str(attrs, "computer_name_prefix") {
        return Ok(prefix.to_string());
    }
    let max = match kind {
        OsKind::Linux => LINUX_COMPUTER_NAME_PREFIX_MAX,
        OsKind::Windows => WINDOWS_COMPUTER_NAME_PREFIX_MAX,
    };
    let invalid = name.len() > max
        || name.starts_with('_')
        || name.ends_with('.')
        || name.ends_with('-');
    if invalid {
        return Err(ProviderError::validation(
            "unable to assume default computer name prefix from `name`. Please adjust the \
             \"name\", or specify an explicit \"computer_name_prefix\"",
        ));
    }
    Ok(name.to_string())
}

fn expand_os_profile(
    kind: OsKind,
    id: &VirtualMachineScaleSetId,
    attrs: &Attributes,
) -> ProviderResult<ScaleSetOsProfile> {
    let admin_password = get_str(attrs, "admin_password").map(str::to_string);
    let provision_vm_agent = Some(get_bool(attrs, "provision_vm_agent").unwrap_or(true));
    let mut profile = ScaleSetOsProfile {
        computer_name_prefix: Some(computer_name_prefix(kind, attrs, &id.name)?),
        admin_username: Some(require_str(attrs, "admin_username")?.to_string()),
        admin_password,
        custom_data: get_str(attrs, "custom_data").map(str::to_string),
        ..Default::default()
    };

    match kind {
        OsKind::Linux => {
            let disable_password = get_bool(attrs, "disable_password_authentication").unwrap_or(true);
            let keys = expand_ssh_keys(attrs);
            if disable_password && profile.admin_password.is_none() && keys.is_empty() {
                return Err(ProviderError::validation(
                    "at least one SSH key must be specified if `disable_password_authentication` is enabled",
                ));
            }
            profile.linux_configuration = Some(LinuxConfiguration {
                disable_password_authentication: Some(disable_password),
                provision_vm_agent,
                ssh: Some(SshConfiguration {
                    public_keys: Some(keys),
                }),
            });
        }
        OsKind::Windows => {
            if profile.admin_password.is_none() {
                return Err(ProviderError::validation("`admin_password` is required"));
            }
            profile.windows_configuration = Some(WindowsConfiguration {
                provision_vm_agent,
                enable_automatic_updates: Some(
                    get_bool(attrs, "enable_automatic_updates").unwrap_or(true),
                ),
                time_zone: get_str(attrs, "timezone").map(str::to_string),
            });
        }
    }
    Ok(profile)
}

fn expand(
    kind: OsKind,
    id: &VirtualMachineScaleSetId,
    attrs: &Attributes,
) -> ProviderResult<VirtualMachineScaleSet> {
    let instances = get_int(attrs, "instances")
        .ok_or_else(|| ProviderError::validation("`instances` is required"))?;

    Ok(VirtualMachineScaleSet {
        name: Some(id.name.clone()),
        location: Some(normalize_location(require_str(attrs, "location")?)),
        tags: Some(expand_tags(attrs)),
        sku: Some(Sku {
            name: Some(require_str(attrs, "sku")?.to_string()),
            capacity: Some(instances),
            tier: Some("Standard".to_string()),
        }),
        properties: Some(VirtualMachineScaleSetProperties {
            overprovision: Some(get_bool(attrs, "overprovision").unwrap_or(true)),
            single_placement_group: Some(get_bool(attrs, "single_placement_group").unwrap_or(true)),
            upgrade_policy: Some(expand_upgrade_policy(attrs)?),
            virtual_machine_profile: Some(ScaleSetVmProfile {
                os_profile: Some(expand_os_profile(kind, id, attrs)?),
                storage_profile: Some(ScaleSetStorageProfile {
                    image_reference: Some(expand_image_reference(attrs)?),
                    os_disk: Some(expand_os_disk(kind, attrs)?),
                    data_disks: Some(expand_data_disks(attrs)),
                }),
                network_profile: Some(expand_network_profile(attrs)),
                diagnostics_profile: Some(expand_boot_diagnostics(attrs)),
            }),
            ..Default::default()
        }),
        ..Default::default()
    })
}

fn flatten(kind: OsKind, id: &VirtualMachineScaleSetId, set: &VirtualMachineScaleSet) -> Attributes {
    let mut attrs = Attributes::new();
    set_str(&mut attrs, "id", Some(id.id()));
    set_str(&mut attrs, "name", Some(&id.name));
    set_str(&mut attrs, "resource_group_name", Some(&id.resource_group));
    set_str(
        &mut attrs,
        "location",
        set.location.as_deref().map(normalize_location),
    );

    let sku = set.sku.as_ref();
    set_str(&mut attrs, "sku", sku.and_then(|s| s.name.as_ref()));
    set_int(
        &mut attrs,
        "instances",
        Some(sku.and_then(|s| s.capacity).unwrap_or(0)),
    );
    flatten_tags(&mut attrs, set.tags.as_ref());

    let Some(props) = &set.properties else {
        return attrs;
    };
    set_bool(&mut attrs, "overprovision", props.overprovision);
    set_bool(&mut attrs, "single_placement_group", props.single_placement_group);
    set_str(&mut attrs, "unique_id", props.unique_id.as_ref());

    if let Some(policy) = &props.upgrade_policy {
        set_str(&mut attrs, "upgrade_mode", policy.mode.as_ref());
        if let Some(rolling) = &policy.rolling_upgrade_policy {
            set_block(&mut attrs, "rolling_upgrade_policy", flatten_rolling_upgrade_policy(rolling));
        }
    }

    let Some(profile) = &props.virtual_machine_profile else {
        return attrs;
    };
    flatten_boot_diagnostics(&mut attrs, profile.diagnostics_profile.as_ref());

    if let Some(storage) = &profile.storage_profile {
        flatten_image_reference(&mut attrs, storage.image_reference.as_ref());
        if let Some(disk) = &storage.os_disk {
            set_block(&mut attrs, "os_disk", flatten_os_disk(disk));
        }
        set_blocks(
            &mut attrs,
            "data_disk",
            flatten_data_disks(storage.data_disks.as_deref().unwrap_or_default()),
        );
    }

    if let Some(os) = &profile.os_profile {
        set_str(&mut attrs, "admin_username", os.admin_username.as_ref());
        set_str(&mut attrs, "computer_name_prefix", os.computer_name_prefix.as_ref());
        match kind {
            OsKind::Linux => {
                if let Some(linux) = &os.linux_configuration {
                    set_bool(
                        &mut attrs,
                        "disable_password_authentication",
                        linux.disable_password_authentication,
                    );
                    set_bool(&mut attrs, "provision_vm_agent", linux.provision_vm_agent);
                    let keys = linux
                        .ssh
                        .as_ref()
                        .and_then(|ssh| ssh.public_keys.as_deref())
                        .unwrap_or_default();
                    set_blocks(&mut attrs, "admin_ssh_key", flatten_ssh_keys(keys));
                }
            }
            OsKind::Windows => {
                if let Some(windows) = &os.windows_configuration {
                    set_bool(&mut attrs, "provision_vm_agent", windows.provision_vm_agent);
                    set_bool(
                        &mut attrs,
                        "enable_automatic_updates",
                        windows.enable_automatic_updates,
                    );
                    set_str(&mut attrs, "timezone", windows.time_zone.as_ref());
                }
            }
        }
    }

    if let Some(network) = &profile.network_profile {
        set_blocks(
            &mut attrs,
            "network_interface",
            flatten_network_interfaces(
                network
                    .network_interface_configurations
                    .as_deref()
                    .unwrap_or_default(),
            ),
        );
        set_str(
            &mut attrs,
            "health_probe_id",
            network.health_probe.as_ref().and_then(|p| p.id.as_ref()),
        );
    }

    attrs
}

/// `PATCH` body for the changed fields on top of the existing scale set
///
/// Returns the body and whether the instances need the new model rolled out.
fn expand_update(
    kind: OsKind,
    changed: &[String],
    existing: &VirtualMachineScaleSet,
    to: &Attributes,
) -> ProviderResult<(VirtualMachineScaleSet, bool)> {
    let id_context = existing.name.as_deref().unwrap_or_default();
    let existing_props = existing.properties.as_ref().ok_or_else(|| {
        ProviderError::new(format!(
            "retrieving {} Virtual Machine Scale Set {:?}: `properties` was nil",
            kind.label(),
            id_context
        ))
    })?;
    let existing_storage = existing_props
        .virtual_machine_profile
        .as_ref()
        .and_then(|p| p.storage_profile.as_ref())
        .ok_or_else(|| {
            ProviderError::new(format!(
                "retrieving {} Virtual Machine Scale Set {:?}: \
                 `properties.virtualMachineProfile.storageProfile` was nil",
                kind.label(),
                id_context
            ))
        })?;

    let has = |name: &str| changed.iter().any(|c| c == name);
    let mut update_instances = false;

    let mut storage = ScaleSetStorageProfile {
        image_reference: existing_storage.image_reference.clone(),
        ..Default::default()
    };
    let mut profile = ScaleSetVmProfile::default();
    let mut props = VirtualMachineScaleSetProperties {
        upgrade_policy: existing_props.upgrade_policy.clone(),
        ..Default::default()
    };
    let mut update = VirtualMachineScaleSet::default();

    if has("rolling_upgrade_policy") {
        let mut policy = existing_props.upgrade_policy.clone().unwrap_or_default();
        policy.mode = get_str(to, "upgrade_mode").map(str::to_string);
        policy.rolling_upgrade_policy = expand_rolling_upgrade_policy(to);
        props.upgrade_policy = Some(policy);
    }

    if has("single_placement_group") {
        props.single_placement_group = get_bool(to, "single_placement_group");
    }
    if has("overprovision") {
        props.overprovision = get_bool(to, "overprovision");
    }

    let os_fields: &[&str] = match kind {
        OsKind::Linux => &["admin_ssh_key", "disable_password_authentication", "provision_vm_agent"],
        OsKind::Windows => &["enable_automatic_updates", "provision_vm_agent", "timezone"],
    };
    let os_changed = os_fields.iter().any(|name| has(name));
    if os_changed || has("custom_data") {
        let mut os = ScaleSetOsProfile::default();
        if os_changed {
            match kind {
                OsKind::Linux => {
                    let mut linux = LinuxConfiguration::default();
                    if has("admin_ssh_key") {
                        linux.ssh = Some(SshConfiguration {
                            public_keys: Some(expand_ssh_keys(to)),
                        });
                    }
                    if has("disable_password_authentication") {
                        linux.disable_password_authentication =
                            get_bool(to, "disable_password_authentication");
                    }
                    if has("provision_vm_agent") {
                        linux.provision_vm_agent = get_bool(to, "provision_vm_agent");
                    }
                    os.linux_configuration = Some(linux);
                }
                OsKind::Windows => {
                    let mut windows = WindowsConfiguration::default();
                    if has("enable_automatic_updates") {
                        if get_str(to, "upgrade_mode") == Some(UPGRADE_AUTOMATIC) {
                            return Err(ProviderError::validation(
                                "`enable_automatic_updates` cannot be changed when \
                                 `upgrade_mode` is `Automatic`",
                            ));
                        }
                        windows.enable_automatic_updates = get_bool(to, "enable_automatic_updates");
                    }
                    if has("provision_vm_agent") {
                        windows.provision_vm_agent = get_bool(to, "provision_vm_agent");
                    }
                    if has("timezone") {
                        windows.time_zone = get_str(to, "timezone").map(str::to_string);
                    }
                    os.windows_configuration = Some(windows);
                }
            }
        }
        if has("custom_data") {
            update_instances = true;
            // custom data can't be removed without replacing the set
            os.custom_data = get_str(to, "custom_data").map(str::to_string);
        }
        profile.os_profile = Some(os);
    }

    let image_changed = has("source_image_id") || has("source_image_reference");
    if has("data_disk") || has("os_disk") || image_changed {
        update_instances = true;
        if has("data_disk") {
            storage.data_disks = Some(expand_data_disks(to));
        }
        if has("os_disk") {
            let mut disk = expand_os_disk(kind, to)?;
            disk.create_option = None;
            disk.os_type = None;
            storage.os_disk = Some(disk);
        }
        if image_changed {
            // the whole storage profile must be sent along with a new image
            storage.data_disks = existing_storage.data_disks.clone();
            storage.image_reference = Some(expand_image_reference(to)?);
            storage.os_disk = existing_storage.os_disk.as_ref().map(|disk| ScaleSetOsDisk {
                caching: disk.caching.clone(),
                disk_size_gb: disk.disk_size_gb,
                managed_disk: disk.managed_disk.clone(),
                ..Default::default()
            });
        }
    }

    if has("network_interface") || has("health_probe_id") {
        profile.network_profile = Some(expand_network_profile(to));
    }

    if has("boot_diagnostics") {
        update_instances = true;
        profile.diagnostics_profile = Some(expand_boot_diagnostics(to));
    }

    if has("sku") || has("instances") {
        let mut sku = existing.sku.clone().unwrap_or_default();
        if has("sku") {
            update_instances = true;
            sku.name = get_str(to, "sku").map(str::to_string);
        }
        if has("instances") {
            sku.capacity = get_int(to, "instances");
        }
        update.sku = Some(sku);
    }

    if has("tags") {
        update.tags = Some(expand_tags(to));
    }

    profile.storage_profile = Some(storage);
    props.virtual_machine_profile = Some(profile);
    update.properties = Some(props);
    Ok((update, update_instances))
}

// =============================================================================
// Lifecycle
// =============================================================================

pub async fn create(client: &ArmClient, kind: OsKind, resource: &Resource) -> ProviderResult<State> {
    let attrs = &resource.attributes;
    let id = VirtualMachineScaleSetId::new(
        client.subscription_id(),
        require_str(attrs, "resource_group_name")?,
        require_str(attrs, "name")?,
    );

    let existing: Option<VirtualMachineScaleSet> = client
        .get(&id.id(), api_version::VIRTUAL_MACHINE_SCALE_SETS)
        .await
        .with_context(|| format!("checking for existing {} {}", kind.label(), id))?;
    ensure_absent(existing, type_name(kind), &id.id())?;

    let body = expand(kind, &id, attrs)?;
    log::info!("creating {} {}", kind.label(), id);
    client
        .put(&id.id(), api_version::VIRTUAL_MACHINE_SCALE_SETS, &body)
        .await
        .with_context(|| format!("creating {} {}", kind.label(), id))?;
    log::debug!("{} was created", id);

    read(client, kind, &resource.id, &id.id()).await
}

pub async fn read(
    client: &ArmClient,
    kind: OsKind,
    rid: &ResourceId,
    identifier: &str,
) -> ProviderResult<State> {
    let id = VirtualMachineScaleSetId::parse(identifier)?;
    let Some(set) = client
        .get::<VirtualMachineScaleSet>(&id.id(), api_version::VIRTUAL_MACHINE_SCALE_SETS)
        .await
        .with_context(|| {
            format!(
                "retrieving {} Virtual Machine Scale Set {:?} (Resource Group {:?})",
                kind.label(),
                id.name,
                id.resource_group
            )
        })?
    else {
        return Ok(gone(rid, &id));
    };
    if set.properties.is_none() {
        return Err(ProviderError::new(format!(
            "retrieving {} Virtual Machine Scale Set {:?} (Resource Group {:?}): `properties` was nil",
            kind.label(),
            id.name,
            id.resource_group
        )));
    }
    Ok(State::existing(rid.clone(), flatten(kind, &id, &set)).with_identifier(id.id()))
}

pub async fn update(
    client: &ArmClient,
    kind: OsKind,
    rid: &ResourceId,
    identifier: &str,
    from: &State,
    to: &Resource,
    features: &VirtualMachineScaleSetFeatures,
) -> ProviderResult<State> {
    let id = VirtualMachineScaleSetId::parse(identifier)?;
    log::info!("preparing arguments for {} {} update", kind.label(), id);

    let existing: VirtualMachineScaleSet = client
        .get(&id.id(), api_version::VIRTUAL_MACHINE_SCALE_SETS)
        .await
        .with_context(|| {
            format!(
                "retrieving {} Virtual Machine Scale Set {:?} (Resource Group {:?})",
                kind.label(),
                id.name,
                id.resource_group
            )
        })?
        .ok_or_else(|| ProviderError::not_found(format!("{} was not found", id)))?;

    let changed = find_changed_attributes(&to.attributes, &from.attributes, Some(&schema(kind)));
    let (body, update_instances) = expand_update(kind, &changed, &existing, &to.attributes)?;

    client
        .patch(&id.id(), api_version::VIRTUAL_MACHINE_SCALE_SETS, &body)
        .await
        .with_context(|| format!("updating {} {}", kind.label(), id))?;

    let mode = existing
        .properties
        .as_ref()
        .and_then(|p| p.upgrade_policy.as_ref())
        .and_then(|p| p.mode.as_deref())
        .unwrap_or(UPGRADE_MANUAL);
    if update_instances && mode.eq_ignore_ascii_case(UPGRADE_MANUAL) {
        if features.roll_instances_when_required {
            upgrade_instances(client, &id).await?;
        } else {
            log::info!(
                "not rolling instances of {}: `roll_instances_when_required` is disabled",
                id
            );
        }
    }

    read(client, kind, rid, &id.id()).await
}

/// Apply the latest scale set model to every instance still on an older one
async fn upgrade_instances(client: &ArmClient, id: &VirtualMachineScaleSetId) -> ProviderResult<()> {
    let instances: Vec<ScaleSetInstance> = client
        .list(
            &format!("{}/virtualMachines", id.id()),
            api_version::VIRTUAL_MACHINE_SCALE_SETS,
        )
        .await
        .with_context(|| format!("listing instances of {}", id))?;

    for instance in instances {
        let latest = instance
            .properties
            .as_ref()
            .and_then(|p| p.latest_model_applied)
            .unwrap_or(false);
        let Some(instance_id) = instance.instance_id.filter(|_| !latest) else {
            continue;
        };
        log::debug!("upgrading instance {:?} of {} to the latest model", instance_id, id);
        client
            .post(
                &format!("{}/manualupgrade", id.id()),
                api_version::VIRTUAL_MACHINE_SCALE_SETS,
                &[],
                Some(json!({ "instanceIds": [instance_id] })),
            )
            .await
            .with_context(|| format!("updating instance {:?} of {}", instance_id, id))?;
    }
    Ok(())
}

pub async fn delete(
    client: &ArmClient,
    kind: OsKind,
    identifier: &str,
    features: &VirtualMachineScaleSetFeatures,
) -> ProviderResult<()> {
    let id = VirtualMachineScaleSetId::parse(identifier)?;
    let Some(existing) = client
        .get::<VirtualMachineScaleSet>(&id.id(), api_version::VIRTUAL_MACHINE_SCALE_SETS)
        .await
        .with_context(|| {
            format!(
                "retrieving {} Virtual Machine Scale Set {:?} (Resource Group {:?})",
                kind.label(),
                id.name,
                id.resource_group
            )
        })?
    else {
        return Ok(());
    };

    if features.scale_to_zero_on_delete
        && let Some(sku) = existing.sku.filter(|s| s.capacity.unwrap_or(0) > 0)
    {
        log::debug!("scaling {} to 0 instances before deletion", id);
        let body = VirtualMachineScaleSet {
            sku: Some(Sku {
                capacity: Some(0),
                ..sku
            }),
            ..Default::default()
        };
        client
            .patch(&id.id(), api_version::VIRTUAL_MACHINE_SCALE_SETS, &body)
            .await
            .with_context(|| format!("scaling {} to 0 instances", id))?;
    }

    log::debug!("deleting {} {}", kind.label(), id);
    let query: &[(&str, &str)] = if features.force_delete {
        &[("forceDeletion", "true")]
    } else {
        &[]
    };
    client
        .delete(&id.id(), api_version::VIRTUAL_MACHINE_SCALE_SETS, query)
        .await
        .with_context(|| format!("deleting {} {}", kind.label(), id))?;
    Ok(())
}

/// Refuse to import a scale set whose instances run the other OS
pub async fn ensure_os(client: &ArmClient, kind: OsKind, identifier: &str) -> ProviderResult<()> {
    let id = VirtualMachineScaleSetId::parse(identifier)?;
    let Some(set) = client
        .get::<VirtualMachineScaleSet>(&id.id(), api_version::VIRTUAL_MACHINE_SCALE_SETS)
        .await
        .with_context(|| format!("retrieving {}", id))?
    else {
        return Err(ProviderError::not_found(format!("{} was not found", id)));
    };
    let os = set
        .properties
        .as_ref()
        .and_then(|p| p.virtual_machine_profile.as_ref())
        .and_then(|p| p.os_profile.as_ref());
    let actual = match os {
        Some(os) if os.windows_configuration.is_some() => Some(OsKind::Windows),
        Some(os) if os.linux_configuration.is_some() => Some(OsKind::Linux),
        _ => None,
    };
    match actual {
        Some(actual) if actual != kind => Err(ProviderError::validation(format!(
            "{} is not a {} Virtual Machine Scale Set. Please use `{}` instead",
            id,
            kind.label(),
            type_name(actual)
        ))),
        _ => Ok(()),
    }
}
