//! Azure Stack Compute provider
//!
//! Routes each lifecycle call to the resource module that owns its type,
//! bounds it by the type's timeout and tags failures with the resource
//! address.

use std::future::Future;
use std::time::Duration;

use azstack_core::differ::carry_write_only;
use azstack_core::provider::{BoxFuture, Provider, ProviderError, ProviderResult, ResourceType};
use azstack_core::resource::{Resource, ResourceId, State};

use crate::client::ArmClient;
use crate::config::{Features, ProviderConfig};
use crate::parse::{
    AvailabilitySetId, DataDiskId, ImageId, ManagedDiskId, VirtualMachineExtensionId,
    VirtualMachineId, VirtualMachineScaleSetExtensionId, VirtualMachineScaleSetId,
};
use crate::resources::virtual_machine::OsKind;
use crate::resources::{
    availability_set, image, managed_disk, resource_types, schema_for, virtual_machine,
    virtual_machine_data_disk_attachment, virtual_machine_extension, virtual_machine_scale_set,
    virtual_machine_scale_set_extension,
};

const MINUTE: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Operation {
    Create,
    Read,
    Update,
    Delete,
}

impl Operation {
    fn verb(self) -> &'static str {
        match self {
            Operation::Create => "create",
            Operation::Read => "read",
            Operation::Update => "update",
            Operation::Delete => "delete",
        }
    }
}

/// Deadline of one operation on a resource type
fn timeout_for(resource_type: &str, operation: Operation) -> Duration {
    match (resource_type, operation) {
        (_, Operation::Read) => 5 * MINUTE,
        (image::TYPE_NAME, _) => 90 * MINUTE,
        (
            virtual_machine_scale_set::LINUX_TYPE_NAME | virtual_machine_scale_set::WINDOWS_TYPE_NAME,
            Operation::Update,
        ) => 60 * MINUTE,
        _ => 30 * MINUTE,
    }
}

fn unknown_type(id: &ResourceId) -> ProviderError {
    ProviderError::validation(format!("Unknown resource type: {}", id.resource_type))
        .for_resource(id.clone())
}

/// Azure Stack Compute provider
pub struct AzureStackProvider {
    client: ArmClient,
    features: Features,
}

impl AzureStackProvider {
    pub fn new(client: ArmClient, features: Features) -> Self {
        Self { client, features }
    }

    /// Build a provider from the `provider` block, falling back to `ARM_*` variables
    pub fn from_config(config: &ProviderConfig) -> ProviderResult<Self> {
        let resolved = config
            .resolve()
            .map_err(|e| ProviderError::validation(e.to_string()).with_cause(e))?;
        let mut client = ArmClient::new(
            &resolved.arm_endpoint,
            resolved.subscription_id,
            resolved.credentials,
        )?;
        if resolved.disable_correlation_request_id {
            client = client.without_correlation_id();
        }
        Ok(Self::new(client, resolved.features))
    }

    pub fn client(&self) -> &ArmClient {
        &self.client
    }

    /// Run one operation under the deadline of its resource type
    async fn bounded<T>(
        &self,
        id: &ResourceId,
        operation: Operation,
        future: impl Future<Output = ProviderResult<T>>,
    ) -> ProviderResult<T> {
        let limit = timeout_for(&id.resource_type, operation);
        match tokio::time::timeout(limit, future).await {
            Ok(result) => result.map_err(|e| e.for_resource(id.clone())),
            Err(_) => Err(ProviderError::timeout(format!(
                "timed out after {}m waiting for {} to finish",
                limit.as_secs() / 60,
                operation.verb()
            ))
            .for_resource(id.clone())),
        }
    }

    async fn read_resource(&self, id: &ResourceId, identifier: &str) -> ProviderResult<State> {
        let client = &self.client;
        match id.resource_type.as_str() {
            availability_set::TYPE_NAME => availability_set::read(client, id, identifier).await,
            managed_disk::TYPE_NAME => managed_disk::read(client, id, identifier).await,
            image::TYPE_NAME => image::read(client, id, identifier).await,
            virtual_machine::LINUX_TYPE_NAME => {
                virtual_machine::read(client, OsKind::Linux, id, identifier).await
            }
            virtual_machine::WINDOWS_TYPE_NAME => {
                virtual_machine::read(client, OsKind::Windows, id, identifier).await
            }
            virtual_machine_extension::TYPE_NAME => {
                virtual_machine_extension::read(client, id, identifier).await
            }
            virtual_machine_data_disk_attachment::TYPE_NAME => {
                virtual_machine_data_disk_attachment::read(client, id, identifier).await
            }
            virtual_machine_scale_set::LINUX_TYPE_NAME => {
                virtual_machine_scale_set::read(client, OsKind::Linux, id, identifier).await
            }
            virtual_machine_scale_set::WINDOWS_TYPE_NAME => {
                virtual_machine_scale_set::read(client, OsKind::Windows, id, identifier).await
            }
            virtual_machine_scale_set_extension::TYPE_NAME => {
                virtual_machine_scale_set_extension::read(client, id, identifier).await
            }
            _ => Err(unknown_type(id)),
        }
    }

    async fn create_resource(&self, resource: &Resource) -> ProviderResult<State> {
        let client = &self.client;
        let id = &resource.id;
        let mut state = match id.resource_type.as_str() {
            availability_set::TYPE_NAME => availability_set::create(client, resource).await,
            managed_disk::TYPE_NAME => managed_disk::create(client, resource).await,
            image::TYPE_NAME => image::create(client, resource).await,
            virtual_machine::LINUX_TYPE_NAME => {
                virtual_machine::create(client, OsKind::Linux, resource).await
            }
            virtual_machine::WINDOWS_TYPE_NAME => {
                virtual_machine::create(client, OsKind::Windows, resource).await
            }
            virtual_machine_extension::TYPE_NAME => {
                virtual_machine_extension::create(client, resource).await
            }
            virtual_machine_data_disk_attachment::TYPE_NAME => {
                virtual_machine_data_disk_attachment::create(client, resource).await
            }
            virtual_machine_scale_set::LINUX_TYPE_NAME => {
                virtual_machine_scale_set::create(client, OsKind::Linux, resource).await
            }
            virtual_machine_scale_set::WINDOWS_TYPE_NAME => {
                virtual_machine_scale_set::create(client, OsKind::Windows, resource).await
            }
            virtual_machine_scale_set_extension::TYPE_NAME => {
                virtual_machine_scale_set_extension::create(client, resource).await
            }
            _ => Err(unknown_type(id)),
        }?;
        self.keep_write_only(&mut state, resource);
        Ok(state)
    }

    async fn update_resource(
        &self,
        id: &ResourceId,
        identifier: &str,
        from: &State,
        to: &Resource,
    ) -> ProviderResult<State> {
        let client = &self.client;
        let mut state = match id.resource_type.as_str() {
            availability_set::TYPE_NAME => {
                availability_set::update(client, id, identifier, to).await
            }
            managed_disk::TYPE_NAME => managed_disk::update(client, id, identifier, from, to).await,
            image::TYPE_NAME => image::update(client, id, identifier, to).await,
            virtual_machine::LINUX_TYPE_NAME => {
                virtual_machine::update(client, OsKind::Linux, id, identifier, from, to).await
            }
            virtual_machine::WINDOWS_TYPE_NAME => {
                virtual_machine::update(client, OsKind::Windows, id, identifier, from, to).await
            }
            virtual_machine_extension::TYPE_NAME => {
                virtual_machine_extension::update(client, id, to).await
            }
            virtual_machine_data_disk_attachment::TYPE_NAME => {
                virtual_machine_data_disk_attachment::update(client, id, to).await
            }
            virtual_machine_scale_set::LINUX_TYPE_NAME => {
                virtual_machine_scale_set::update(
                    client,
                    OsKind::Linux,
                    id,
                    identifier,
                    from,
                    to,
                    &self.features.virtual_machine_scale_set,
                )
                .await
            }
            virtual_machine_scale_set::WINDOWS_TYPE_NAME => {
                virtual_machine_scale_set::update(
                    client,
                    OsKind::Windows,
                    id,
                    identifier,
                    from,
                    to,
                    &self.features.virtual_machine_scale_set,
                )
                .await
            }
            virtual_machine_scale_set_extension::TYPE_NAME => {
                virtual_machine_scale_set_extension::update(client, id, identifier, from, to).await
            }
            _ => Err(unknown_type(id)),
        }?;
        self.keep_write_only(&mut state, to);
        Ok(state)
    }

    async fn delete_resource(&self, id: &ResourceId, identifier: &str) -> ProviderResult<()> {
        let client = &self.client;
        match id.resource_type.as_str() {
            availability_set::TYPE_NAME => availability_set::delete(client, identifier).await,
            managed_disk::TYPE_NAME => managed_disk::delete(client, identifier).await,
            image::TYPE_NAME => image::delete(client, identifier).await,
            virtual_machine::LINUX_TYPE_NAME | virtual_machine::WINDOWS_TYPE_NAME => {
                virtual_machine::delete(client, identifier, &self.features.virtual_machine).await
            }
            virtual_machine_extension::TYPE_NAME => {
                virtual_machine_extension::delete(client, identifier).await
            }
            virtual_machine_data_disk_attachment::TYPE_NAME => {
                virtual_machine_data_disk_attachment::delete(client, identifier).await
            }
            virtual_machine_scale_set::LINUX_TYPE_NAME => {
                virtual_machine_scale_set::delete(
                    client,
                    OsKind::Linux,
                    identifier,
                    &self.features.virtual_machine_scale_set,
                )
                .await
            }
            virtual_machine_scale_set::WINDOWS_TYPE_NAME => {
                virtual_machine_scale_set::delete(
                    client,
                    OsKind::Windows,
                    identifier,
                    &self.features.virtual_machine_scale_set,
                )
                .await
            }
            virtual_machine_scale_set_extension::TYPE_NAME => {
                virtual_machine_scale_set_extension::delete(client, identifier).await
            }
            _ => Err(unknown_type(id)),
        }
    }

    /// The API never returns write-only values; keep the configured ones
    fn keep_write_only(&self, state: &mut State, resource: &Resource) {
        if let Some(schema) = schema_for(&resource.id.resource_type) {
            carry_write_only(state, &resource.attributes, &schema);
        }
    }

    /// Reject an import ID that does not belong to the resource type
    async fn check_import(&self, id: &ResourceId, identifier: &str) -> ProviderResult<()> {
        match id.resource_type.as_str() {
            availability_set::TYPE_NAME => {
                AvailabilitySetId::parse(identifier)?;
            }
            managed_disk::TYPE_NAME => {
                ManagedDiskId::parse(identifier)?;
            }
            image::TYPE_NAME => {
                ImageId::parse(identifier)?;
            }
            virtual_machine::LINUX_TYPE_NAME => {
                VirtualMachineId::parse(identifier)?;
                virtual_machine::ensure_os(&self.client, OsKind::Linux, identifier).await?;
            }
            virtual_machine::WINDOWS_TYPE_NAME => {
                VirtualMachineId::parse(identifier)?;
                virtual_machine::ensure_os(&self.client, OsKind::Windows, identifier).await?;
            }
            virtual_machine_extension::TYPE_NAME => {
                VirtualMachineExtensionId::parse(identifier)?;
            }
            virtual_machine_data_disk_attachment::TYPE_NAME => {
                DataDiskId::parse(identifier)?;
            }
            virtual_machine_scale_set::LINUX_TYPE_NAME => {
                VirtualMachineScaleSetId::parse(identifier)?;
                virtual_machine_scale_set::ensure_os(&self.client, OsKind::Linux, identifier).await?;
            }
            virtual_machine_scale_set::WINDOWS_TYPE_NAME => {
                VirtualMachineScaleSetId::parse(identifier)?;
                virtual_machine_scale_set::ensure_os(&self.client, OsKind::Windows, identifier)
                    .await?;
            }
            virtual_machine_scale_set_extension::TYPE_NAME => {
                VirtualMachineScaleSetExtensionId::parse(identifier)?;
            }
            _ => return Err(unknown_type(id)),
        }
        Ok(())
    }
}

impl Provider for AzureStackProvider {
    fn name(&self) -> &'static str {
        "azurestack"
    }

    fn resource_types(&self) -> Vec<Box<dyn ResourceType>> {
        resource_types()
    }

    fn read(
        &self,
        id: &ResourceId,
        identifier: Option<&str>,
    ) -> BoxFuture<'_, ProviderResult<State>> {
        let id = id.clone();
        let identifier = identifier.map(|s| s.to_string());
        Box::pin(async move {
            let Some(identifier) = identifier else {
                return Ok(State::not_found(id));
            };
            self.bounded(&id, Operation::Read, self.read_resource(&id, &identifier))
                .await
        })
    }

    fn create(&self, resource: &Resource) -> BoxFuture<'_, ProviderResult<State>> {
        let resource = resource.clone();
        Box::pin(async move {
            log::info!("creating {}", resource.id);
            self.bounded(&resource.id, Operation::Create, self.create_resource(&resource))
                .await
        })
    }

    fn update(
        &self,
        id: &ResourceId,
        identifier: &str,
        from: &State,
        to: &Resource,
    ) -> BoxFuture<'_, ProviderResult<State>> {
        let id = id.clone();
        let identifier = identifier.to_string();
        let from = from.clone();
        let to = to.clone();
        Box::pin(async move {
            log::info!("updating {}", id);
            self.bounded(
                &id,
                Operation::Update,
                self.update_resource(&id, &identifier, &from, &to),
            )
            .await
        })
    }

    fn delete(&self, id: &ResourceId, identifier: &str) -> BoxFuture<'_, ProviderResult<()>> {
        let id = id.clone();
        let identifier = identifier.to_string();
        Box::pin(async move {
            log::info!("deleting {}", id);
            self.bounded(&id, Operation::Delete, self.delete_resource(&id, &identifier))
                .await
        })
    }

    fn import(&self, id: &ResourceId, identifier: &str) -> BoxFuture<'_, ProviderResult<State>> {
        let id = id.clone();
        let identifier = identifier.to_string();
        Box::pin(async move {
            self.check_import(&id, &identifier)
                .await
                .map_err(|e| e.for_resource(id.clone()))?;
            let state = self.read(&id, Some(&identifier)).await?;
            if !state.exists {
                return Err(ProviderError::not_found(format!(
                    "Cannot import non-existent remote object {:?}",
                    identifier
                ))
                .for_resource(id));
            }
            Ok(state)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::Credentials;
    use azstack_core::provider::ErrorKind;

    fn provider() -> AzureStackProvider {
        let client = ArmClient::new(
            "https://management.local.azurestack.external",
            "sub",
            Credentials::Static("token".to_string()),
        )
        .unwrap();
        AzureStackProvider::new(client, Features::default())
    }

    #[test]
    fn timeouts_follow_the_resource_type() {
        assert_eq!(timeout_for(image::TYPE_NAME, Operation::Create), 90 * MINUTE);
        assert_eq!(timeout_for(image::TYPE_NAME, Operation::Read), 5 * MINUTE);
        assert_eq!(
            timeout_for(virtual_machine_scale_set::LINUX_TYPE_NAME, Operation::Update),
            60 * MINUTE
        );
        assert_eq!(
            timeout_for(virtual_machine_scale_set::WINDOWS_TYPE_NAME, Operation::Update),
            60 * MINUTE
        );
        assert_eq!(
            timeout_for(virtual_machine_scale_set::LINUX_TYPE_NAME, Operation::Delete),
            30 * MINUTE
        );
        assert_eq!(timeout_for(managed_disk::TYPE_NAME, Operation::Update), 30 * MINUTE);
    }

    #[test]
    fn every_type_is_advertised() {
        let names: Vec<&str> = provider().resource_types().iter().map(|t| t.name()).collect();
        for name in [
            availability_set::TYPE_NAME,
            managed_disk::TYPE_NAME,
            image::TYPE_NAME,
            virtual_machine::LINUX_TYPE_NAME,
            virtual_machine::WINDOWS_TYPE_NAME,
            virtual_machine_data_disk_attachment::TYPE_NAME,
            virtual_machine_extension::TYPE_NAME,
            virtual_machine_scale_set::LINUX_TYPE_NAME,
            virtual_machine_scale_set::WINDOWS_TYPE_NAME,
            virtual_machine_scale_set_extension::TYPE_NAME,
        ] {
            assert!(names.contains(&name), "{} missing", name);
        }
    }

    #[tokio::test]
    async fn read_without_identifier_is_not_found() {
        let id = ResourceId::new(managed_disk::TYPE_NAME, "data");
        let state = provider().read(&id, None).await.unwrap();
        assert!(!state.exists);
    }

    #[tokio::test]
    async fn unknown_type_is_rejected() {
        let id = ResourceId::new("azurestack_storage_account", "sa");
        let err = provider().read(&id, Some("/x")).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Validation);
        assert_eq!(err.resource_id, Some(id));
    }

    #[tokio::test]
    async fn import_rejects_an_id_of_another_type() {
        let id = ResourceId::new(availability_set::TYPE_NAME, "set");
        let err = provider()
            .import(
                &id,
                "/subscriptions/sub/resourceGroups/rg1/providers/Microsoft.Compute/disks/d1",
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidId);
    }
}
