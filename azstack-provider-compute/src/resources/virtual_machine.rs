//! azurestack_linux_virtual_machine / azurestack_windows_virtual_machine
//!
//! Both types share one handler; `OsKind` selects the operating system
//! specific attributes and the `linuxConfiguration`/`windowsConfiguration`
//! block of the request.
//!
//! The power helpers at the bottom are also used by the managed disk
//! handler, which must power down the owning machine before resizing a
//! disk attached to it.

use azstack_core::differ::find_changed_attributes;
use azstack_core::provider::{ProviderError, ProviderResult};
use azstack_core::resource::{Resource, ResourceId, State, Value};
use azstack_core::schema::{
    AttributeSchema, AttributeType, DiffSuppress, ResourceSchema, normalize_location,
    validate_int_between, types,
};

use super::{
    arm_id_type, ensure_absent, gone, id_attribute, location_attribute, name_attribute, one_of,
    resource_group_name_attribute, tags_attribute,
};
use crate::client::{ArmClient, ArmResultExt, api_version};
use crate::config::VirtualMachineFeatures;
use crate::models::{
    BootDiagnostics, DiagnosticsProfile, HardwareProfile, ImageReference, InstanceView,
    LinuxConfiguration, ManagedDiskParameters, NetworkInterface, NetworkInterfaceReference,
    NetworkInterfaceReferenceProperties, NetworkProfile, OsDisk, OsProfile, SshConfiguration,
    SshPublicKey, StorageProfile, SubResource, VirtualMachine, VirtualMachineProperties,
    WindowsConfiguration,
};
use crate::parse::VirtualMachineId;
use crate::utils::{
    Attributes, expand_tags, flatten_tags, get_block, get_blocks, get_bool, get_int, get_str,
    get_string_list, require_str, set_block, set_blocks, set_bool, set_int, set_str,
};

pub const LINUX_TYPE_NAME: &str = "azurestack_linux_virtual_machine";
pub const WINDOWS_TYPE_NAME: &str = "azurestack_windows_virtual_machine";

/// Longest computer name Windows accepts
const WINDOWS_COMPUTER_NAME_MAX: usize = 15;

pub(crate) const CACHING_TYPES: &[&str] = &["None", "ReadOnly", "ReadWrite"];
pub(crate) const STORAGE_ACCOUNT_TYPES: &[&str] = &["Standard_LRS", "Premium_LRS"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OsKind {
    Linux,
    Windows,
}

impl OsKind {
    pub fn type_name(self) -> &'static str {
        match self {
            OsKind::Linux => LINUX_TYPE_NAME,
            OsKind::Windows => WINDOWS_TYPE_NAME,
        }
    }

    pub(crate) fn label(self) -> &'static str {
        match self {
            OsKind::Linux => "Linux",
            OsKind::Windows => "Windows",
        }
    }
}

// =============================================================================
// Schemas
// =============================================================================

fn os_disk_attribute() -> AttributeSchema {
    AttributeSchema::new(
        "os_disk",
        AttributeType::Block(vec![
            AttributeSchema::new("name", AttributeType::String)
                .computed()
                .force_new(),
            AttributeSchema::new("caching", one_of(CACHING_TYPES)).required(),
            AttributeSchema::new("storage_account_type", one_of(STORAGE_ACCOUNT_TYPES))
                .required()
                .force_new(),
            AttributeSchema::new(
                "disk_size_gb",
                AttributeType::Custom {
                    name: "DiskSizeGB".to_string(),
                    base: Box::new(AttributeType::Int),
                    validate: |value| validate_int_between(value, 0, 1023),
                },
            )
            .computed(),
        ]),
    )
    .required()
}

pub(crate) fn source_image_reference_attribute() -> AttributeSchema {
    AttributeSchema::new(
        "source_image_reference",
        AttributeType::Block(vec![
            AttributeSchema::new("publisher", types::non_empty_string()).required(),
            AttributeSchema::new("offer", types::non_empty_string()).required(),
            AttributeSchema::new("sku", types::non_empty_string()).required(),
            AttributeSchema::new("version", types::non_empty_string()).required(),
        ]),
    )
    .force_new()
}

pub(crate) fn admin_ssh_key_attribute() -> AttributeSchema {
    AttributeSchema::new(
        "admin_ssh_key",
        AttributeType::List(Box::new(AttributeType::Block(vec![
            AttributeSchema::new("username", types::non_empty_string()).required(),
            AttributeSchema::new("public_key", types::non_empty_string()).required(),
        ]))),
    )
}

pub(crate) fn boot_diagnostics_attribute() -> AttributeSchema {
    AttributeSchema::new(
        "boot_diagnostics",
        AttributeType::Block(vec![
            AttributeSchema::new("storage_account_uri", types::non_empty_string()).required(),
        ]),
    )
}

fn common_schema(kind: OsKind, description: &str) -> ResourceSchema {
    ResourceSchema::new(kind.type_name())
        .with_description(description)
        .attribute(id_attribute())
        .attribute(name_attribute())
        .attribute(resource_group_name_attribute())
        .attribute(location_attribute())
        .attribute(AttributeSchema::new("size", types::non_empty_string()).required())
        .attribute(
            AttributeSchema::new("admin_username", types::non_empty_string())
                .required()
                .force_new(),
        )
        .attribute(
            AttributeSchema::new("network_interface_ids", AttributeType::List(Box::new(arm_id_type())))
                .required()
                .with_diff_suppress(DiffSuppress::CaseInsensitive),
        )
        .attribute(os_disk_attribute())
        .attribute(source_image_reference_attribute())
        .attribute(
            AttributeSchema::new("source_image_id", arm_id_type())
                .force_new()
                .with_diff_suppress(DiffSuppress::CaseInsensitive),
        )
        .attribute(
            AttributeSchema::new("availability_set_id", arm_id_type())
                .force_new()
                .with_diff_suppress(DiffSuppress::CaseInsensitive),
        )
        .attribute(
            AttributeSchema::new("computer_name", types::non_empty_string())
                .computed()
                .force_new(),
        )
        .attribute(
            AttributeSchema::new("custom_data", AttributeType::String)
                .force_new()
                .sensitive()
                .write_only(),
        )
        .attribute(boot_diagnostics_attribute())
        .attribute(
            AttributeSchema::new("provision_vm_agent", AttributeType::Bool)
                .with_default(true)
                .force_new(),
        )
        .attribute(
            AttributeSchema::new("allow_extension_operations", AttributeType::Bool)
                .with_default(true),
        )
        .attribute(AttributeSchema::new("private_ip_address", AttributeType::String).read_only())
        .attribute(AttributeSchema::new("virtual_machine_id", AttributeType::String).read_only())
        .attribute(tags_attribute())
}

pub fn linux_schema() -> ResourceSchema {
    common_schema(OsKind::Linux, "Linux virtual machine")
        .attribute(
            AttributeSchema::new("admin_password", types::non_empty_string())
                .force_new()
                .sensitive()
                .write_only(),
        )
        .attribute(admin_ssh_key_attribute().force_new())
        .attribute(
            AttributeSchema::new("disable_password_authentication", AttributeType::Bool)
                .with_default(true)
                .force_new(),
        )
}

pub fn windows_schema() -> ResourceSchema {
    common_schema(OsKind::Windows, "Windows virtual machine")
        .attribute(
            AttributeSchema::new("admin_password", types::non_empty_string())
                .required()
                .force_new()
                .sensitive()
                .write_only(),
        )
        .attribute(
            AttributeSchema::new("enable_automatic_updates", AttributeType::Bool)
                .with_default(true)
                .force_new(),
        )
        .attribute(
            AttributeSchema::new("timezone", types::non_empty_string())
                .force_new()
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

pub(crate) fn ssh_key_path(username: &str) -> String {
    format!("/home/{}/.ssh/authorized_keys", username)
}

/// Recover the username from an `authorized_keys` path
pub(crate) fn username_from_ssh_key_path(path: &str) -> Option<&str> {
    path.strip_prefix("/home/")?
        .strip_suffix("/.ssh/authorized_keys")
        .filter(|name| !name.is_empty() && !name.contains('/'))
}

pub(crate) fn expand_ssh_keys(attrs: &Attributes) -> Vec<SshPublicKey> {
    get_blocks(attrs, "admin_ssh_key")
        .into_iter()
        .map(|key| SshPublicKey {
            path: get_str(key, "username").map(ssh_key_path),
            key_data: get_str(key, "public_key").map(str::to_string),
        })
        .collect()
}

pub(crate) fn flatten_ssh_keys(keys: &[SshPublicKey]) -> Vec<Attributes> {
    keys.iter()
        .map(|key| {
            let mut block = Attributes::new();
            set_str(
                &mut block,
                "username",
                key.path.as_deref().and_then(username_from_ssh_key_path),
            );
            set_str(&mut block, "public_key", key.key_data.as_ref());
            block
        })
        .collect()
}

/// Image reference from either `source_image_id` or `source_image_reference`
pub(crate) fn expand_image_reference(attrs: &Attributes) -> ProviderResult<ImageReference> {
    if let Some(id) = get_str(attrs, "source_image_id") {
        return Ok(ImageReference {
            id: Some(id.to_string()),
            ..Default::default()
        });
    }
    let Some(reference) = get_block(attrs, "source_image_reference") else {
        return Err(ProviderError::validation(
            "either a `source_image_id` or a `source_image_reference` block must be specified",
        ));
    };
    Ok(ImageReference {
        publisher: get_str(reference, "publisher").map(str::to_string),
        offer: get_str(reference, "offer").map(str::to_string),
        sku: get_str(reference, "sku").map(str::to_string),
        version: get_str(reference, "version").map(str::to_string),
        id: None,
    })
}

pub(crate) fn flatten_image_reference(attrs: &mut Attributes, image: Option<&ImageReference>) {
    let Some(image) = image else {
        return;
    };
    if let Some(id) = &image.id {
        set_str(attrs, "source_image_id", Some(id));
        return;
    }
    let mut block = Attributes::new();
    set_str(&mut block, "publisher", image.publisher.as_ref());
    set_str(&mut block, "offer", image.offer.as_ref());
    set_str(&mut block, "sku", image.sku.as_ref());
    set_str(&mut block, "version", image.version.as_ref());
    set_block(attrs, "source_image_reference", block);
}

pub(crate) fn expand_boot_diagnostics(attrs: &Attributes) -> DiagnosticsProfile {
    let storage_uri = get_block(attrs, "boot_diagnostics")
        .and_then(|block| get_str(block, "storage_account_uri"))
        .map(str::to_string);
    DiagnosticsProfile {
        boot_diagnostics: Some(BootDiagnostics {
            enabled: Some(storage_uri.is_some()),
            storage_uri,
        }),
    }
}

pub(crate) fn flatten_boot_diagnostics(attrs: &mut Attributes, profile: Option<&DiagnosticsProfile>) {
    let Some(diagnostics) = profile.and_then(|p| p.boot_diagnostics.as_ref()) else {
        return;
    };
    if diagnostics.enabled != Some(true) {
        return;
    }
    let mut block = Attributes::new();
    set_str(&mut block, "storage_account_uri", diagnostics.storage_uri.as_ref());
    set_block(attrs, "boot_diagnostics", block);
}

fn expand_network_profile(attrs: &Attributes) -> NetworkProfile {
    let ids = get_string_list(attrs, "network_interface_ids");
    NetworkProfile {
        network_interfaces: Some(
            ids.into_iter()
                .enumerate()
                .map(|(i, id)| NetworkInterfaceReference {
                    id: Some(id),
                    properties: Some(NetworkInterfaceReferenceProperties {
                        primary: Some(i == 0),
                    }),
                })
                .collect(),
        ),
    }
}

fn expand_os_disk(attrs: &Attributes) -> ProviderResult<OsDisk> {
    let Some(disk) = get_block(attrs, "os_disk") else {
        return Err(ProviderError::validation("an `os_disk` block must be specified"));
    };
    Ok(OsDisk {
        name: get_str(disk, "name").map(str::to_string),
        caching: get_str(disk, "caching").map(str::to_string),
        create_option: Some("FromImage".to_string()),
        disk_size_gb: get_int(disk, "disk_size_gb").filter(|size| *size > 0),
        managed_disk: Some(ManagedDiskParameters {
            storage_account_type: get_str(disk, "storage_account_type").map(str::to_string),
            id: None,
        }),
        os_type: None,
    })
}

fn flatten_os_disk(disk: &OsDisk) -> Attributes {
    let mut block = Attributes::new();
    set_str(&mut block, "name", disk.name.as_ref());
    set_str(&mut block, "caching", disk.caching.as_ref());
    set_int(&mut block, "disk_size_gb", disk.disk_size_gb);
    set_str(
        &mut block,
        "storage_account_type",
        disk.managed_disk
            .as_ref()
            .and_then(|m| m.storage_account_type.as_ref()),
    );
    block
}

/// Computer name, defaulting to the resource name
fn computer_name(kind: OsKind, attrs: &Attributes, name: &str) -> ProviderResult<String> {
    if let Some(computer_name) = get_str(attrs, "computer_name") {
        return Ok(computer_name.to_string());
    }
    if kind == OsKind::Windows && name.len() > WINDOWS_COMPUTER_NAME_MAX {
        return Err(ProviderError::validation(
            "unable to assume default computer name `computer_name` must be specified \
             since `name` exceeds 15 characters",
        ));
    }
    Ok(name.to_string())
}

fn expand_os_profile(kind: OsKind, id: &VirtualMachineId, attrs: &Attributes) -> ProviderResult<OsProfile> {
    let provision_vm_agent = get_bool(attrs, "provision_vm_agent").unwrap_or(true);
    let mut profile = OsProfile {
        computer_name: Some(computer_name(kind, attrs, &id.name)?),
        admin_username: Some(require_str(attrs, "admin_username")?.to_string()),
        admin_password: get_str(attrs, "admin_password").map(str::to_string),
        custom_data: get_str(attrs, "custom_data").map(str::to_string),
        allow_extension_operations: Some(
            get_bool(attrs, "allow_extension_operations").unwrap_or(true),
        ),
        ..Default::default()
    };

    match kind {
        OsKind::Linux => {
            let disable_password = get_bool(attrs, "disable_password_authentication").unwrap_or(true);
            let keys = expand_ssh_keys(attrs);
            if disable_password && keys.is_empty() {
                return Err(ProviderError::validation(
                    "at least one `admin_ssh_key` must be specified when \
                     `disable_password_authentication` is set to `true`",
                ));
            }
            if !disable_password && profile.admin_password.is_none() {
                return Err(ProviderError::validation(
                    "an `admin_password` must be specified if \
                     `disable_password_authentication` is set to `false`",
                ));
            }
            profile.linux_configuration = Some(LinuxConfiguration {
                disable_password_authentication: Some(disable_password),
                provision_vm_agent: Some(provision_vm_agent),
                ssh: (!keys.is_empty()).then(|| SshConfiguration {
                    public_keys: Some(keys),
                }),
            });
        }
        OsKind::Windows => {
            if profile.admin_password.is_none() {
                return Err(ProviderError::validation("`admin_password` is required"));
            }
            profile.windows_configuration = Some(WindowsConfiguration {
                provision_vm_agent: Some(provision_vm_agent),
                enable_automatic_updates: Some(
                    get_bool(attrs, "enable_automatic_updates").unwrap_or(true),
                ),
                time_zone: get_str(attrs, "timezone").map(str::to_string),
            });
        }
    }
    Ok(profile)
}

fn expand(kind: OsKind, id: &VirtualMachineId, attrs: &Attributes) -> ProviderResult<VirtualMachine> {
    Ok(VirtualMachine {
        name: Some(id.name.clone()),
        location: Some(normalize_location(require_str(attrs, "location")?)),
        tags: Some(expand_tags(attrs)),
        properties: Some(VirtualMachineProperties {
            hardware_profile: Some(HardwareProfile {
                vm_size: Some(require_str(attrs, "size")?.to_string()),
            }),
            storage_profile: Some(StorageProfile {
                image_reference: Some(expand_image_reference(attrs)?),
                os_disk: Some(expand_os_disk(attrs)?),
                data_disks: None,
            }),
            os_profile: Some(expand_os_profile(kind, id, attrs)?),
            network_profile: Some(expand_network_profile(attrs)),
            diagnostics_profile: Some(expand_boot_diagnostics(attrs)),
            availability_set: get_str(attrs, "availability_set_id").map(SubResource::new),
            ..Default::default()
        }),
        ..Default::default()
    })
}

fn flatten(kind: OsKind, id: &VirtualMachineId, vm: &VirtualMachine) -> Attributes {
    let mut attrs = Attributes::new();
    set_str(&mut attrs, "id", Some(id.id()));
    set_str(&mut attrs, "name", Some(&id.name));
    set_str(&mut attrs, "resource_group_name", Some(&id.resource_group));
    set_str(
        &mut attrs,
        "location",
        vm.location.as_deref().map(normalize_location),
    );
    flatten_tags(&mut attrs, vm.tags.as_ref());

    let Some(props) = &vm.properties else {
        return attrs;
    };
    set_str(&mut attrs, "virtual_machine_id", props.vm_id.as_ref());
    set_str(
        &mut attrs,
        "size",
        props.hardware_profile.as_ref().and_then(|h| h.vm_size.as_ref()),
    );
    set_str(
        &mut attrs,
        "availability_set_id",
        props.availability_set.as_ref().and_then(|a| a.id.as_ref()),
    );

    if let Some(storage) = &props.storage_profile {
        flatten_image_reference(&mut attrs, storage.image_reference.as_ref());
        if let Some(disk) = &storage.os_disk {
            set_block(&mut attrs, "os_disk", flatten_os_disk(disk));
        }
    }

    if let Some(network) = &props.network_profile {
        let ids: Vec<Value> = network
            .network_interfaces
            .iter()
            .flatten()
            .filter_map(|nic| nic.id.as_deref())
            .map(Value::from)
            .collect();
        attrs.insert("network_interface_ids".to_string(), Value::List(ids));
    }

    flatten_boot_diagnostics(&mut attrs, props.diagnostics_profile.as_ref());

    if let Some(os) = &props.os_profile {
        set_str(&mut attrs, "computer_name", os.computer_name.as_ref());
        set_str(&mut attrs, "admin_username", os.admin_username.as_ref());
        set_bool(
            &mut attrs,
            "allow_extension_operations",
            os.allow_extension_operations,
        );
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

    attrs
}

/// Operating system a machine was provisioned with
fn detect_os(vm: &VirtualMachine) -> Option<OsKind> {
    let props = vm.properties.as_ref()?;
    if let Some(os) = &props.os_profile {
        if os.linux_configuration.is_some() {
            return Some(OsKind::Linux);
        }
        if os.windows_configuration.is_some() {
            return Some(OsKind::Windows);
        }
    }
    let os_type = props.storage_profile.as_ref()?.os_disk.as_ref()?.os_type.as_deref()?;
    match os_type.to_ascii_lowercase().as_str() {
        "linux" => Some(OsKind::Linux),
        "windows" => Some(OsKind::Windows),
        _ => None,
    }
}

/// Update body holding only the changed fields
///
/// Returns the body and whether the machine has to be deallocated while it
/// is applied.
fn expand_update(
    changed: &[String],
    from: &Attributes,
    to: &Attributes,
) -> ProviderResult<(VirtualMachine, bool)> {
    let mut update = VirtualMachine::default();
    let mut props = VirtualMachineProperties::default();
    let mut needs_deallocate = false;

    for name in changed {
        match name.as_str() {
            "size" => {
                props.hardware_profile = Some(HardwareProfile {
                    vm_size: Some(require_str(to, "size")?.to_string()),
                });
                needs_deallocate = true;
            }
            "os_disk" => {
                let old_size = get_block(from, "os_disk").and_then(|d| get_int(d, "disk_size_gb"));
                let new_disk = get_block(to, "os_disk");
                let new_size = new_disk.and_then(|d| get_int(d, "disk_size_gb"));
                let mut disk = OsDisk::default();
                if let Some(new_size) = new_size
                    && Some(new_size) != old_size
                {
                    if let Some(old_size) = old_size
                        && new_size < old_size
                    {
                        return Err(ProviderError::validation(
                            "the `disk_size_gb` of the `os_disk` can only be increased",
                        ));
                    }
                    disk.disk_size_gb = Some(new_size);
                    needs_deallocate = true;
                }
                disk.caching = new_disk
                    .and_then(|d| get_str(d, "caching"))
                    .map(str::to_string);
                props.storage_profile = Some(StorageProfile {
                    os_disk: Some(disk),
                    ..Default::default()
                });
            }
            "boot_diagnostics" => props.diagnostics_profile = Some(expand_boot_diagnostics(to)),
            "allow_extension_operations" => {
                props.os_profile = Some(OsProfile {
                    allow_extension_operations: Some(
                        get_bool(to, "allow_extension_operations").unwrap_or(true),
                    ),
                    ..Default::default()
                });
            }
            "network_interface_ids" => {
                props.network_profile = Some(expand_network_profile(to));
                needs_deallocate = true;
            }
            "tags" => update.tags = Some(expand_tags(to)),
            _ => {}
        }
    }

    let has_properties = props.hardware_profile.is_some()
        || props.storage_profile.is_some()
        || props.diagnostics_profile.is_some()
        || props.os_profile.is_some()
        || props.network_profile.is_some();
    if has_properties {
        update.properties = Some(props);
    }
    Ok((update, needs_deallocate))
}

// =============================================================================
// Lifecycle
// =============================================================================

pub async fn create(client: &ArmClient, kind: OsKind, resource: &Resource) -> ProviderResult<State> {
    let attrs = &resource.attributes;
    let id = VirtualMachineId::new(
        client.subscription_id(),
        require_str(attrs, "resource_group_name")?,
        require_str(attrs, "name")?,
    );
    log::info!("preparing arguments for {} {}", kind.label(), id);

    let existing: Option<VirtualMachine> = client
        .get(&id.id(), api_version::VIRTUAL_MACHINES)
        .await
        .with_context(|| format!("checking for presence of existing {}", id))?;
    ensure_absent(existing, kind.type_name(), &id.id())?;

    let body = expand(kind, &id, attrs)?;
    client
        .put(&id.id(), api_version::VIRTUAL_MACHINES, &body)
        .await
        .with_context(|| format!("creating {} {}", kind.label(), id))?;

    read(client, kind, &resource.id, &id.id()).await
}

pub async fn read(
    client: &ArmClient,
    kind: OsKind,
    rid: &ResourceId,
    identifier: &str,
) -> ProviderResult<State> {
    let id = VirtualMachineId::parse(identifier)?;
    let Some(vm) = client
        .get::<VirtualMachine>(&id.id(), api_version::VIRTUAL_MACHINES)
        .await
        .with_context(|| format!("retrieving {} {}", kind.label(), id))?
    else {
        return Ok(gone(rid, &id));
    };

    let mut attrs = flatten(kind, &id, &vm);
    let nics = vm
        .properties
        .as_ref()
        .and_then(|p| p.network_profile.as_ref())
        .and_then(|n| n.network_interfaces.as_deref())
        .unwrap_or_default();
    if let Some(ip) = primary_private_ip(client, nics).await? {
        attrs.insert("private_ip_address".to_string(), Value::from(ip));
    }

    Ok(State::existing(rid.clone(), attrs).with_identifier(id.id()))
}

/// Private IP address of the machine's primary network interface
async fn primary_private_ip(
    client: &ArmClient,
    nics: &[NetworkInterfaceReference],
) -> ProviderResult<Option<String>> {
    let primary = nics
        .iter()
        .find(|nic| nic.properties.as_ref().and_then(|p| p.primary) == Some(true))
        .or_else(|| nics.first());
    let Some(nic_id) = primary.and_then(|nic| nic.id.as_deref()) else {
        return Ok(None);
    };

    let Some(nic) = client
        .get::<NetworkInterface>(nic_id, api_version::NETWORK_INTERFACES)
        .await
        .with_context(|| format!("retrieving Network Interface {:?}", nic_id))?
    else {
        return Ok(None);
    };

    let configs = nic
        .properties
        .map(|p| p.ip_configurations)
        .unwrap_or_default();
    let primary = configs
        .iter()
        .filter_map(|c| c.properties.as_ref())
        .find(|p| p.primary == Some(true))
        .or_else(|| configs.iter().find_map(|c| c.properties.as_ref()));
    Ok(primary.and_then(|p| p.private_ip_address.clone()))
}

pub async fn update(
    client: &ArmClient,
    kind: OsKind,
    rid: &ResourceId,
    identifier: &str,
    from: &State,
    to: &Resource,
) -> ProviderResult<State> {
    let id = VirtualMachineId::parse(identifier)?;
    log::info!("preparing arguments for {} {} update", kind.label(), id);

    let changed = find_changed_attributes(&to.attributes, &from.attributes, Some(&schema(kind)));
    let (body, needs_deallocate) = expand_update(&changed, &from.attributes, &to.attributes)?;

    if needs_deallocate {
        let state = power_state(client, &id).await?;
        let cycle = PowerCycle::for_state(state.as_deref());
        cycle.stop(client, &id).await?;
        patch(client, kind, &id, &body).await?;
        cycle.restart(client, &id).await?;
    } else {
        patch(client, kind, &id, &body).await?;
    }

    read(client, kind, rid, &id.id()).await
}

async fn patch(
    client: &ArmClient,
    kind: OsKind,
    id: &VirtualMachineId,
    body: &VirtualMachine,
) -> ProviderResult<()> {
    client
        .patch(&id.id(), api_version::VIRTUAL_MACHINES, body)
        .await
        .with_context(|| format!("updating {} {}", kind.label(), id))
}

pub async fn delete(
    client: &ArmClient,
    identifier: &str,
    features: &VirtualMachineFeatures,
) -> ProviderResult<()> {
    let id = VirtualMachineId::parse(identifier)?;
    let Some(vm) = client
        .get::<VirtualMachine>(&id.id(), api_version::VIRTUAL_MACHINES)
        .await
        .with_context(|| format!("retrieving {}", id))?
    else {
        return Ok(());
    };

    if !features.skip_shutdown_and_force_delete {
        let state = power_state(client, &id).await?;
        let already_off = matches!(
            state.as_deref(),
            Some("stopped" | "stopping" | "deallocated" | "deallocating")
        );
        if !already_off {
            let skip_shutdown = if features.graceful_shutdown { "false" } else { "true" };
            log::debug!("powering off {} (skipShutdown={})", id, skip_shutdown);
            client
                .post(
                    &format!("{}/powerOff", id.id()),
                    api_version::VIRTUAL_MACHINES,
                    &[("skipShutdown", skip_shutdown)],
                    None,
                )
                .await
                .with_context(|| format!("powering off {}", id))?;
        }
    }

    let force = features.force_delete || features.skip_shutdown_and_force_delete;
    let query: &[(&str, &str)] = if force {
        &[("forceDeletion", "true")]
    } else {
        &[]
    };
    client
        .delete(&id.id(), api_version::VIRTUAL_MACHINES, query)
        .await
        .with_context(|| format!("deleting {}", id))?;

    if features.delete_os_disk_on_deletion {
        let os_disk_id = vm
            .properties
            .as_ref()
            .and_then(|p| p.storage_profile.as_ref())
            .and_then(|s| s.os_disk.as_ref())
            .and_then(|d| d.managed_disk.as_ref())
            .and_then(|m| m.id.as_deref());
        if let Some(disk_id) = os_disk_id {
            log::debug!("deleting OS disk {:?} of {}", disk_id, id);
            client
                .delete(disk_id, api_version::DISKS, &[])
                .await
                .with_context(|| format!("deleting OS disk {:?} of {}", disk_id, id))?;
        }
    }

    Ok(())
}

/// Refuse to import a machine under the type of the other operating system
pub async fn ensure_os(client: &ArmClient, kind: OsKind, identifier: &str) -> ProviderResult<()> {
    let id = VirtualMachineId::parse(identifier)?;
    let Some(vm) = client
        .get::<VirtualMachine>(&id.id(), api_version::VIRTUAL_MACHINES)
        .await
        .with_context(|| format!("retrieving {}", id))?
    else {
        return Err(ProviderError::not_found(format!("{} was not found", id)));
    };
    match detect_os(&vm) {
        Some(actual) if actual != kind => Err(ProviderError::validation(format!(
            "{} is not a {} Virtual Machine. Please use `{}` instead",
            id,
            kind.label(),
            actual.type_name()
        ))),
        _ => Ok(()),
    }
}

// =============================================================================
// Power management
// =============================================================================

/// Current power state (`running`, `deallocated`, ...) from the instance view
pub(crate) async fn power_state(
    client: &ArmClient,
    id: &VirtualMachineId,
) -> ProviderResult<Option<String>> {
    let view: Option<InstanceView> = client
        .get(&format!("{}/instanceView", id.id()), api_version::VIRTUAL_MACHINES)
        .await
        .with_context(|| format!("retrieving InstanceView for {}", id))?;
    let state = view.and_then(|v| v.power_state());
    log::debug!("power state of {} is {:?}", id, state);
    Ok(state)
}

/// Steps needed to take a machine down for maintenance and bring it back
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct PowerCycle {
    pub shut_down: bool,
    pub deallocate: bool,
    pub start_again: bool,
}

impl PowerCycle {
    pub fn for_state(state: Option<&str>) -> Self {
        match state {
            Some("deallocated" | "deallocating") => Self {
                shut_down: false,
                deallocate: false,
                start_again: false,
            },
            Some("stopped" | "stopping") => Self {
                shut_down: false,
                deallocate: true,
                start_again: false,
            },
            _ => Self {
                shut_down: true,
                deallocate: true,
                start_again: true,
            },
        }
    }

    pub async fn stop(&self, client: &ArmClient, id: &VirtualMachineId) -> ProviderResult<()> {
        if self.shut_down {
            log::debug!("shutting down {}", id);
            client
                .post(
                    &format!("{}/powerOff", id.id()),
                    api_version::VIRTUAL_MACHINES,
                    &[("skipShutdown", "false")],
                    None,
                )
                .await
                .with_context(|| format!("sending Power Off to {}", id))?;
        }
        if self.deallocate {
            log::debug!("deallocating {}", id);
            client
                .post(
                    &format!("{}/deallocate", id.id()),
                    api_version::VIRTUAL_MACHINES,
                    &[],
                    None,
                )
                .await
                .with_context(|| format!("deallocating {}", id))?;
        }
        Ok(())
    }

    pub async fn restart(&self, client: &ArmClient, id: &VirtualMachineId) -> ProviderResult<()> {
        if self.start_again {
            log::debug!("starting {}", id);
            client
                .post(
                    &format!("{}/start", id.id()),
                    api_version::VIRTUAL_MACHINES,
                    &[],
                    None,
                )
                .await
                .with_context(|| format!("starting {}", id))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn linux_config() -> Attributes {
        let mut key = Attributes::new();
        key.insert("username".to_string(), Value::from("adminuser"));
        key.insert("public_key".to_string(), Value::from("ssh-rsa AAAA"));

        let mut os_disk = Attributes::new();
        os_disk.insert("caching".to_string(), Value::from("ReadWrite"));
        os_disk.insert("storage_account_type".to_string(), Value::from("Standard_LRS"));

        let mut image = Attributes::new();
        image.insert("publisher".to_string(), Value::from("Canonical"));
        image.insert("offer".to_string(), Value::from("UbuntuServer"));
        image.insert("sku".to_string(), Value::from("16.04-LTS"));
        image.insert("version".to_string(), Value::from("latest"));

        let mut attrs = Attributes::new();
        attrs.insert("name".to_string(), Value::from("vm1"));
        attrs.insert("resource_group_name".to_string(), Value::from("rg1"));
        attrs.insert("location".to_string(), Value::from("local"));
        attrs.insert("size".to_string(), Value::from("Standard_F2"));
        attrs.insert("admin_username".to_string(), Value::from("adminuser"));
        attrs.insert(
            "network_interface_ids".to_string(),
            Value::List(vec![
                Value::from("/subscriptions/sub/resourceGroups/rg1/providers/Microsoft.Network/networkInterfaces/nic1"),
                Value::from("/subscriptions/sub/resourceGroups/rg1/providers/Microsoft.Network/networkInterfaces/nic2"),
            ]),
        );
        attrs.insert("os_disk".to_string(), Value::Map(os_disk));
        attrs.insert("source_image_reference".to_string(), Value::Map(image));
        attrs.insert("admin_ssh_key".to_string(), Value::List(vec![Value::Map(key)]));
        attrs
    }

    fn vm_id() -> VirtualMachineId {
        VirtualMachineId::new("sub", "rg1", "vm1")
    }

    #[test]
    fn linux_body_carries_ssh_keys_and_primary_nic() {
        let body = serde_json::to_value(expand(OsKind::Linux, &vm_id(), &linux_config()).unwrap())
            .unwrap();
        let props = &body["properties"];
        assert_eq!(props["hardwareProfile"]["vmSize"], "Standard_F2");
        assert_eq!(props["osProfile"]["computerName"], "vm1");
        assert_eq!(
            props["osProfile"]["linuxConfiguration"]["ssh"]["publicKeys"][0],
            json!({"path": "/home/adminuser/.ssh/authorized_keys", "keyData": "ssh-rsa AAAA"})
        );
        assert_eq!(props["networkProfile"]["networkInterfaces"][0]["properties"]["primary"], true);
        assert_eq!(props["networkProfile"]["networkInterfaces"][1]["properties"]["primary"], false);
        assert_eq!(props["storageProfile"]["osDisk"]["createOption"], "FromImage");
        assert_eq!(props["storageProfile"]["imageReference"]["offer"], "UbuntuServer");
        assert!(props["osProfile"].get("windowsConfiguration").is_none());
    }

    #[test]
    fn linux_authentication_requirements() {
        let mut attrs = linux_config();
        attrs.remove("admin_ssh_key");
        let err = expand(OsKind::Linux, &vm_id(), &attrs).unwrap_err();
        assert!(err.message.contains("admin_ssh_key"));

        attrs.insert("disable_password_authentication".to_string(), Value::Bool(false));
        let err = expand(OsKind::Linux, &vm_id(), &attrs).unwrap_err();
        assert!(err.message.contains("admin_password"));

        attrs.insert("admin_password".to_string(), Value::from("P@ssw0rd1234!"));
        assert!(expand(OsKind::Linux, &vm_id(), &attrs).is_ok());
    }

    #[test]
    fn windows_computer_name_falls_back_to_name() {
        let mut attrs = linux_config();
        attrs.remove("admin_ssh_key");
        attrs.insert("admin_password".to_string(), Value::from("P@ssw0rd1234!"));
        let body = expand(OsKind::Windows, &vm_id(), &attrs).unwrap();
        let os = body.properties.unwrap().os_profile.unwrap();
        assert_eq!(os.computer_name.as_deref(), Some("vm1"));
        assert_eq!(
            os.windows_configuration.unwrap().enable_automatic_updates,
            Some(true)
        );

        let long = VirtualMachineId::new("sub", "rg1", "a-very-long-machine-name");
        let err = expand(OsKind::Windows, &long, &attrs).unwrap_err();
        assert!(err.message.contains("computer_name"));
    }

    #[test]
    fn flatten_reads_back_the_configuration() {
        let vm: VirtualMachine = serde_json::from_value(json!({
            "location": "local",
            "properties": {
                "vmId": "1234",
                "hardwareProfile": {"vmSize": "Standard_F2"},
                "storageProfile": {
                    "imageReference": {"publisher": "Canonical", "offer": "UbuntuServer", "sku": "16.04-LTS", "version": "latest"},
                    "osDisk": {"name": "vm1_OsDisk", "caching": "ReadWrite", "diskSizeGB": 30,
                               "managedDisk": {"storageAccountType": "Standard_LRS"}}
                },
                "osProfile": {
                    "computerName": "vm1",
                    "adminUsername": "adminuser",
                    "allowExtensionOperations": true,
                    "linuxConfiguration": {
                        "disablePasswordAuthentication": true,
                        "provisionVMAgent": true,
                        "ssh": {"publicKeys": [{"path": "/home/adminuser/.ssh/authorized_keys", "keyData": "ssh-rsa AAAA"}]}
                    }
                },
                "networkProfile": {"networkInterfaces": [{"id": "/nic1"}]},
                "diagnosticsProfile": {"bootDiagnostics": {"enabled": false}}
            }
        }))
        .unwrap();
        let attrs = flatten(OsKind::Linux, &vm_id(), &vm);
        assert_eq!(attrs.get("virtual_machine_id"), Some(&Value::from("1234")));
        assert_eq!(attrs.get("provision_vm_agent"), Some(&Value::Bool(true)));
        assert!(!attrs.contains_key("boot_diagnostics"));
        let keys = attrs.get("admin_ssh_key").and_then(Value::as_list).unwrap();
        assert_eq!(
            keys[0].as_map().unwrap().get("username"),
            Some(&Value::from("adminuser"))
        );
        let disk = get_block(&attrs, "os_disk").unwrap();
        assert_eq!(disk.get("disk_size_gb"), Some(&Value::Int(30)));
        assert_eq!(detect_os(&vm), Some(OsKind::Linux));
    }

    #[test]
    fn update_sends_changed_fields_only() {
        let from = linux_config();
        let mut to = linux_config();
        to.insert("size".to_string(), Value::from("Standard_F4"));
        let mut tags = std::collections::HashMap::new();
        tags.insert("env".to_string(), Value::from("prod"));
        to.insert("tags".to_string(), Value::Map(tags));

        let changed = vec!["size".to_string(), "tags".to_string()];
        let (body, deallocate) = expand_update(&changed, &from, &to).unwrap();
        assert!(deallocate);
        let body = serde_json::to_value(body).unwrap();
        assert_eq!(
            body,
            json!({
                "tags": {"env": "prod"},
                "properties": {"hardwareProfile": {"vmSize": "Standard_F4"}}
            })
        );
    }

    #[test]
    fn metadata_changes_are_patched_without_power_cycle() {
        let from = linux_config();
        let mut to = linux_config();
        let mut tags = std::collections::HashMap::new();
        tags.insert("env".to_string(), Value::from("prod"));
        to.insert("tags".to_string(), Value::Map(tags));
        to.insert("allow_extension_operations".to_string(), Value::Bool(false));

        let changed = vec!["allow_extension_operations".to_string(), "tags".to_string()];
        let (body, deallocate) = expand_update(&changed, &from, &to).unwrap();
        assert!(!deallocate);
        let body = serde_json::to_value(body).unwrap();
        assert_eq!(
            body,
            json!({
                "tags": {"env": "prod"},
                "properties": {"osProfile": {"allowExtensionOperations": false}}
            })
        );
    }

    #[test]
    fn os_disk_storage_type_change_replaces_the_machine() {
        use azstack_core::differ::{Diff, diff};

        let os_disk = |storage: &str, size: i64| {
            let mut config = linux_config();
            if let Some(Value::Map(disk)) = config.get_mut("os_disk") {
                disk.insert("storage_account_type".to_string(), Value::from(storage));
                disk.insert("disk_size_gb".to_string(), Value::Int(size));
            }
            config
        };
        let rid = ResourceId::new(LINUX_TYPE_NAME, "web");
        let current = State::existing(rid.clone(), os_disk("Standard_LRS", 30))
            .with_identifier(vm_id().id());
        let schema = linux_schema();

        let mut desired = Resource::new(LINUX_TYPE_NAME, "web");
        desired.attributes = os_disk("Premium_LRS", 30);
        assert!(matches!(diff(&desired, &current, Some(&schema)), Diff::Replace { .. }));

        desired.attributes = os_disk("Standard_LRS", 64);
        assert!(matches!(diff(&desired, &current, Some(&schema)), Diff::Update { .. }));
    }

    #[test]
    fn os_disk_can_grow_but_not_shrink() {
        let mut from = linux_config();
        if let Some(Value::Map(disk)) = from.get_mut("os_disk") {
            disk.insert("disk_size_gb".to_string(), Value::Int(30));
        }
        let mut to = from.clone();
        if let Some(Value::Map(disk)) = to.get_mut("os_disk") {
            disk.insert("disk_size_gb".to_string(), Value::Int(64));
        }
        let changed = vec!["os_disk".to_string()];
        let (body, deallocate) = expand_update(&changed, &from, &to).unwrap();
        assert!(deallocate);
        let disk = body.properties.unwrap().storage_profile.unwrap().os_disk.unwrap();
        assert_eq!(disk.disk_size_gb, Some(64));

        let err = expand_update(&changed, &to, &from).unwrap_err();
        assert!(err.message.contains("can only be increased"));
    }

    #[test]
    fn power_cycle_skips_unneeded_steps() {
        let running = PowerCycle::for_state(Some("running"));
        assert!(running.shut_down && running.deallocate && running.start_again);

        let stopped = PowerCycle::for_state(Some("stopped"));
        assert!(!stopped.shut_down && stopped.deallocate && !stopped.start_again);

        let deallocated = PowerCycle::for_state(Some("deallocated"));
        assert_eq!(
            deallocated,
            PowerCycle {
                shut_down: false,
                deallocate: false,
                start_again: false
            }
        );

        assert_eq!(PowerCycle::for_state(None), running);
    }

    #[test]
    fn ssh_key_paths_round_trip_the_username() {
        assert_eq!(username_from_ssh_key_path(&ssh_key_path("bob")), Some("bob"));
        assert_eq!(username_from_ssh_key_path("/root/.ssh/authorized_keys"), None);
    }
}
