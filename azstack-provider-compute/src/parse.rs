//! ARM resource IDs of the Compute resource provider
//!
//! Each ID type parses from and renders to the canonical form
//! `/subscriptions/{sub}/resourceGroups/{rg}/providers/Microsoft.Compute/{type}/{name}[/...]`.
//! The `*_insensitively` parsers accept any casing of the segment keys and
//! are meant for re-casing IDs the API returns, not for validating input.

use std::fmt;
use std::str::FromStr;

use azstack_core::provider::ProviderError;
use azstack_core::resource::Value;

pub const PROVIDER_NAMESPACE: &str = "Microsoft.Compute";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("cannot parse an empty string as a resource ID")]
    Empty,

    #[error("the number of segments in ID {0:?} is not divisible by 2")]
    OddSegments(String),

    #[error("ID was missing the '{0}' element")]
    MissingSegment(String),

    #[error("ID contained more segments than required: {0:?}")]
    ExtraSegments(String),

    #[error("ID {id:?} is for provider {found:?}, expected \"Microsoft.Compute\"")]
    WrongProvider { id: String, found: String },
}

/// The key/value segments of an ARM ID, consumed by the typed parsers
#[derive(Debug)]
struct IdSegments {
    subscription_id: String,
    resource_group: String,
    path: Vec<(String, String)>,
}

impl IdSegments {
    fn parse(input: &str) -> Result<Self, ParseError> {
        let trimmed = input.strip_prefix('/').unwrap_or(input);
        let trimmed = trimmed.strip_suffix('/').unwrap_or(trimmed);
        if trimmed.is_empty() {
            return Err(ParseError::Empty);
        }

        let components: Vec<&str> = trimmed.split('/').collect();
        if components.len() % 2 != 0 {
            return Err(ParseError::OddSegments(input.to_string()));
        }

        let mut subscription_id = None;
        let mut resource_group = None;
        let mut provider = None;
        let mut path = Vec::new();
        for pair in components.chunks(2) {
            let (key, value) = (pair[0], pair[1]);
            match key {
                "subscriptions" if subscription_id.is_none() => {
                    subscription_id = Some(value.to_string())
                }
                "resourceGroups" | "resourcegroups" if resource_group.is_none() => {
                    resource_group = Some(value.to_string())
                }
                "providers" if provider.is_none() => provider = Some(value.to_string()),
                _ => path.push((key.to_string(), value.to_string())),
            }
        }

        let subscription_id = subscription_id
            .filter(|s| !s.is_empty())
            .ok_or_else(|| ParseError::MissingSegment("subscriptions".to_string()))?;
        let resource_group = resource_group
            .filter(|s| !s.is_empty())
            .ok_or_else(|| ParseError::MissingSegment("resourceGroups".to_string()))?;
        match provider {
            Some(p) if p.eq_ignore_ascii_case(PROVIDER_NAMESPACE) => {}
            Some(p) => {
                return Err(ParseError::WrongProvider {
                    id: input.to_string(),
                    found: p,
                });
            }
            None => return Err(ParseError::MissingSegment("providers".to_string())),
        }

        Ok(Self {
            subscription_id,
            resource_group,
            path,
        })
    }

    /// Remove the segment with the given key and return its value
    fn pop(&mut self, key: &str, insensitive: bool) -> Result<String, ParseError> {
        let position = self.path.iter().position(|(k, _)| {
            if insensitive {
                k.eq_ignore_ascii_case(key)
            } else {
                k == key
            }
        });
        match position {
            Some(i) => {
                let (_, value) = self.path.remove(i);
                if value.is_empty() {
                    Err(ParseError::MissingSegment(key.to_string()))
                } else {
                    Ok(value)
                }
            }
            None => Err(ParseError::MissingSegment(key.to_string())),
        }
    }

    fn ensure_consumed(&self, input: &str) -> Result<(), ParseError> {
        if self.path.is_empty() {
            Ok(())
        } else {
            Err(ParseError::ExtraSegments(input.to_string()))
        }
    }
}

macro_rules! define_resource_id {
    (
        $(#[$meta:meta])*
        $name:ident, $description:literal {
            $($field:ident: $key:literal => $label:literal),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash)]
        pub struct $name {
            pub subscription_id: String,
            pub resource_group: String,
            $(pub $field: String,)+
        }

        impl $name {
            pub fn new(
                subscription_id: impl Into<String>,
                resource_group: impl Into<String>,
                $($field: impl Into<String>,)+
            ) -> Self {
                Self {
                    subscription_id: subscription_id.into(),
                    resource_group: resource_group.into(),
                    $($field: $field.into(),)+
                }
            }

            /// Canonical ARM ID
            pub fn id(&self) -> String {
                let mut id = format!(
                    "/subscriptions/{}/resourceGroups/{}/providers/{}",
                    self.subscription_id, self.resource_group, PROVIDER_NAMESPACE
                );
                $(
                    id.push('/');
                    id.push_str($key);
                    id.push('/');
                    id.push_str(&self.$field);
                )+
                id
            }

            pub fn parse(input: &str) -> Result<Self, ParseError> {
                Self::parse_with(input, false)
            }

            /// Parse matching segment keys case-insensitively
            pub fn parse_insensitively(input: &str) -> Result<Self, ParseError> {
                Self::parse_with(input, true)
            }

            fn parse_with(input: &str, insensitive: bool) -> Result<Self, ParseError> {
                let mut segments = IdSegments::parse(input)?;
                $(let $field = segments.pop($key, insensitive)?;)+
                segments.ensure_consumed(input)?;
                Ok(Self {
                    subscription_id: segments.subscription_id,
                    resource_group: segments.resource_group,
                    $($field,)+
                })
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                let mut segments = vec![$(format!("{} {:?}", $label, self.$field)),+];
                segments.reverse();
                segments.push(format!("Resource Group {:?}", self.resource_group));
                write!(f, "{}: ({})", $description, segments.join(" / "))
            }
        }

        impl FromStr for $name {
            type Err = ParseError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::parse(s)
            }
        }
    };
}

define_resource_id! {
    AvailabilitySetId, "Availability Set" {
        name: "availabilitySets" => "Name",
    }
}

define_resource_id! {
    ManagedDiskId, "Managed Disk" {
        disk_name: "disks" => "Disk Name",
    }
}

define_resource_id! {
    ImageId, "Image" {
        name: "images" => "Name",
    }
}

define_resource_id! {
    VirtualMachineId, "Virtual Machine" {
        name: "virtualMachines" => "Name",
    }
}

define_resource_id! {
    /// Extension installed on a single virtual machine
    VirtualMachineExtensionId, "Virtual Machine Extension" {
        virtual_machine_name: "virtualMachines" => "Virtual Machine Name",
        extension_name: "extensions" => "Extension Name",
    }
}

define_resource_id! {
    /// Managed disk attached to a virtual machine, keyed by the disk name
    DataDiskId, "Data Disk" {
        virtual_machine_name: "virtualMachines" => "Virtual Machine Name",
        name: "dataDisks" => "Name",
    }
}

define_resource_id! {
    VirtualMachineScaleSetId, "Virtual Machine Scale Set" {
        name: "virtualMachineScaleSets" => "Name",
    }
}

define_resource_id! {
    /// Extension installed on every instance of a scale set
    VirtualMachineScaleSetExtensionId, "Virtual Machine Scale Set Extension" {
        virtual_machine_scale_set_name: "virtualMachineScaleSets" => "Virtual Machine Scale Set Name",
        extension_name: "extensions" => "Extension Name",
    }
}

impl From<ParseError> for ProviderError {
    fn from(err: ParseError) -> Self {
        ProviderError::invalid_id(err.to_string()).with_cause(err)
    }
}

/// Schema validator for attributes holding an ARM ID of type `T`
pub fn validate_id<T>(value: &Value) -> Result<(), String>
where
    T: FromStr<Err = ParseError>,
{
    match value {
        Value::String(s) => T::from_str(s).map(|_| ()).map_err(|e| e.to_string()),
        _ => Err("Expected string".to_string()),
    }
}

/// Loose check for IDs of resources outside the Compute provider
pub fn validate_arm_id(value: &Value) -> Result<(), String> {
    let Value::String(s) = value else {
        return Err("Expected string".to_string());
    };
    let segments: Vec<&str> = s.trim_matches('/').split('/').collect();
    let valid = s.starts_with('/')
        && segments.len() >= 8
        && segments.len() % 2 == 0
        && segments[0].eq_ignore_ascii_case("subscriptions")
        && segments[2].eq_ignore_ascii_case("resourceGroups")
        && segments[4].eq_ignore_ascii_case("providers")
        && segments.iter().all(|s| !s.is_empty());
    if valid {
        Ok(())
    } else {
        Err(format!("{:?} is not a valid Azure resource ID", s))
    }
}
