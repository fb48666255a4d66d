//! Provider configuration
//!
//! The `provider` block of `azstack.json`. Every connection setting may be
//! left out of the file and supplied through the matching `ARM_*`
//! environment variable instead.

use serde::Deserialize;

use crate::client::Credentials;

/// Errors raised while resolving the provider configuration
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("`{field}` must be set in the provider block or through {env}")]
    Missing { field: &'static str, env: &'static str },

    #[error("{env} must be `true` or `false`, got {value:?}")]
    InvalidBool { env: &'static str, value: String },
}

/// Behaviour switches for resources whose lifecycle has several valid strategies
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Features {
    pub virtual_machine: VirtualMachineFeatures,
    pub virtual_machine_scale_set: VirtualMachineScaleSetFeatures,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct VirtualMachineFeatures {
    /// Delete the managed OS disk together with the virtual machine
    pub delete_os_disk_on_deletion: bool,
    /// Power off before deleting
    pub graceful_shutdown: bool,
    /// Power off without a graceful shutdown before deleting
    pub skip_shutdown_and_force_delete: bool,
    pub force_delete: bool,
}

impl Default for VirtualMachineFeatures {
    fn default() -> Self {
        Self {
            delete_os_disk_on_deletion: true,
            graceful_shutdown: false,
            skip_shutdown_and_force_delete: false,
            force_delete: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct VirtualMachineScaleSetFeatures {
    /// Upgrade instances of a `Manual` scale set after its model changed
    pub roll_instances_when_required: bool,
    /// Scale to zero instances before deleting
    pub scale_to_zero_on_delete: bool,
    pub force_delete: bool,
}

impl Default for VirtualMachineScaleSetFeatures {
    fn default() -> Self {
        Self {
            roll_instances_when_required: true,
            scale_to_zero_on_delete: true,
            force_delete: false,
        }
    }
}

/// The `provider` block as written in the configuration file
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    pub subscription_id: Option<String>,
    pub tenant_id: Option<String>,
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    /// ARM endpoint of the stamp, e.g. `https://management.local.azurestack.external`
    pub arm_endpoint: Option<String>,
    /// Bearer token acquired outside of azstack; replaces the client secret flow
    pub access_token: Option<String>,
    pub disable_correlation_request_id: Option<bool>,
    pub features: Features,
}

/// Configuration with every fallback applied
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub subscription_id: String,
    pub arm_endpoint: String,
    pub credentials: Credentials,
    pub disable_correlation_request_id: bool,
    pub features: Features,
}

impl ProviderConfig {
    /// Resolve against the process environment
    pub fn resolve(&self) -> Result<ResolvedConfig, ConfigError> {
        self.resolve_with(|key| std::env::var(key).ok())
    }

    /// Resolve against an arbitrary variable lookup
    pub fn resolve_with<F>(&self, lookup: F) -> Result<ResolvedConfig, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let value = |configured: &Option<String>, env: &str| {
            configured
                .clone()
                .or_else(|| lookup(env))
                .filter(|v| !v.trim().is_empty())
        };
        let required = |configured: &Option<String>, field: &'static str, env: &'static str| {
            value(configured, env).ok_or(ConfigError::Missing { field, env })
        };

        let subscription_id = required(
            &self.subscription_id,
            "subscription_id",
            "ARM_SUBSCRIPTION_ID",
        )?;
        let arm_endpoint = required(&self.arm_endpoint, "arm_endpoint", "ARM_ENDPOINT")?;

        let credentials = match value(&self.access_token, "ARM_ACCESS_TOKEN") {
            Some(token) => Credentials::Static(token),
            None => Credentials::ClientSecret {
                tenant_id: required(&self.tenant_id, "tenant_id", "ARM_TENANT_ID")?,
                client_id: required(&self.client_id, "client_id", "ARM_CLIENT_ID")?,
                client_secret: required(&self.client_secret, "client_secret", "ARM_CLIENT_SECRET")?,
            },
        };

        let disable_correlation_request_id = match self.disable_correlation_request_id {
            Some(flag) => flag,
            None => match lookup("ARM_DISABLE_CORRELATION_REQUEST_ID") {
                Some(raw) => parse_bool("ARM_DISABLE_CORRELATION_REQUEST_ID", &raw)?,
                None => false,
            },
        };

        Ok(ResolvedConfig {
            subscription_id,
            arm_endpoint,
            credentials,
            disable_correlation_request_id,
            features: self.features.clone(),
        })
    }
}

fn parse_bool(env: &'static str, raw: &str) -> Result<bool, ConfigError> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "true" | "1" => Ok(true),
        "false" | "0" | "" => Ok(false),
        _ => Err(ConfigError::InvalidBool {
            env,
            value: raw.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn features_default_to_the_documented_values() {
        let config: ProviderConfig = serde_json::from_str("{}").unwrap();
        assert!(config.features.virtual_machine.delete_os_disk_on_deletion);
        assert!(!config.features.virtual_machine.graceful_shutdown);
        assert!(config.features.virtual_machine_scale_set.roll_instances_when_required);
        assert!(config.features.virtual_machine_scale_set.scale_to_zero_on_delete);
    }

    #[test]
    fn partial_feature_blocks_keep_other_defaults() {
        let config: ProviderConfig = serde_json::from_str(
            r#"{"features": {"virtual_machine": {"graceful_shutdown": true}}}"#,
        )
        .unwrap();
        assert!(config.features.virtual_machine.graceful_shutdown);
        assert!(config.features.virtual_machine.delete_os_disk_on_deletion);
    }

    #[test]
    fn environment_fills_missing_fields() {
        let config = ProviderConfig {
            subscription_id: Some("from-file".to_string()),
            ..Default::default()
        };
        let resolved = config
            .resolve_with(env(&[
                ("ARM_SUBSCRIPTION_ID", "from-env"),
                ("ARM_ENDPOINT", "https://management.local.azurestack.external"),
                ("ARM_TENANT_ID", "adfs"),
                ("ARM_CLIENT_ID", "client"),
                ("ARM_CLIENT_SECRET", "secret"),
                ("ARM_DISABLE_CORRELATION_REQUEST_ID", "true"),
            ]))
            .unwrap();

        assert_eq!(resolved.subscription_id, "from-file");
        assert!(resolved.disable_correlation_request_id);
        assert!(matches!(
            resolved.credentials,
            Credentials::ClientSecret { ref tenant_id, .. } if tenant_id == "adfs"
        ));
    }

    #[test]
    fn access_token_skips_client_secret() {
        let resolved = ProviderConfig::default()
            .resolve_with(env(&[
                ("ARM_SUBSCRIPTION_ID", "sub"),
                ("ARM_ENDPOINT", "https://arm"),
                ("ARM_ACCESS_TOKEN", "token"),
            ]))
            .unwrap();
        assert!(matches!(resolved.credentials, Credentials::Static(_)));
    }

    #[test]
    fn missing_settings_name_the_variable() {
        let err = ProviderConfig::default()
            .resolve_with(env(&[("ARM_SUBSCRIPTION_ID", "sub")]))
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "`arm_endpoint` must be set in the provider block or through ARM_ENDPOINT"
        );
    }

    #[test]
    fn invalid_bool_is_rejected() {
        let err = ProviderConfig::default()
            .resolve_with(env(&[
                ("ARM_SUBSCRIPTION_ID", "sub"),
                ("ARM_ENDPOINT", "https://arm"),
                ("ARM_ACCESS_TOKEN", "token"),
                ("ARM_DISABLE_CORRELATION_REQUEST_ID", "maybe"),
            ]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidBool { .. }));
    }
}
