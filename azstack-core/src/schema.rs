//! Schema - Define type schemas for resources
//!
//! Providers define schemas for each resource type. The schema drives
//! validation, default values, and the per-field change detection in the differ.

use std::collections::HashMap;
use std::fmt;

use regex::Regex;

use crate::resource::Value;

/// Attribute type
#[derive(Debug, Clone)]
pub enum AttributeType {
    /// String
    String,
    /// Integer
    Int,
    /// Boolean
    Bool,
    /// Enum (list of allowed values)
    Enum(Vec<String>),
    /// Custom type (with validation function)
    Custom {
        name: String,
        base: Box<AttributeType>,
        validate: fn(&Value) -> Result<(), String>,
    },
    /// List
    List(Box<AttributeType>),
    /// Map
    Map(Box<AttributeType>),
    /// Nested block with its own attribute schemas
    Block(Vec<AttributeSchema>),
}

impl AttributeType {
    /// Check if a value conforms to this type
    pub fn validate(&self, value: &Value) -> Result<(), TypeError> {
        match (self, value) {
            // References resolve to strings at apply time
            (AttributeType::String, Value::String(_) | Value::ResourceRef(_, _)) => Ok(()),
            (AttributeType::Int, Value::Int(_)) => Ok(()),
            (AttributeType::Bool, Value::Bool(_)) => Ok(()),

            (AttributeType::Enum(variants), Value::String(s)) => {
                if variants.iter().any(|v| v == s) {
                    Ok(())
                } else {
                    Err(TypeError::InvalidEnumVariant {
                        value: s.clone(),
                        expected: variants.clone(),
                    })
                }
            }

            (AttributeType::Custom { base, .. }, Value::ResourceRef(_, _)) => base.validate(value),
            (AttributeType::Custom { validate, .. }, v) => {
                validate(v).map_err(|msg| TypeError::ValidationFailed { message: msg })
            }

            (AttributeType::List(inner), Value::List(items)) => {
                for (i, item) in items.iter().enumerate() {
                    inner.validate(item).map_err(|e| TypeError::ListItemError {
                        index: i,
                        inner: Box::new(e),
                    })?;
                }
                Ok(())
            }

            (AttributeType::Map(inner), Value::Map(map)) => {
                for (k, v) in map {
                    inner.validate(v).map_err(|e| TypeError::MapValueError {
                        key: k.clone(),
                        inner: Box::new(e),
                    })?;
                }
                Ok(())
            }

            (AttributeType::Block(attrs), Value::Map(map)) => {
                validate_block(attrs, map).map_err(|mut errors| errors.remove(0))
            }

            _ => Err(TypeError::TypeMismatch {
                expected: self.type_name(),
                got: value.type_name(),
            }),
        }
    }

    fn type_name(&self) -> String {
        match self {
            AttributeType::String => "String".to_string(),
            AttributeType::Int => "Int".to_string(),
            AttributeType::Bool => "Bool".to_string(),
            AttributeType::Enum(variants) => format!("Enum({})", variants.join(" | ")),
            AttributeType::Custom { name, .. } => name.clone(),
            AttributeType::List(inner) => format!("List<{}>", inner.type_name()),
            AttributeType::Map(inner) => format!("Map<{}>", inner.type_name()),
            AttributeType::Block(_) => "Block".to_string(),
        }
    }
}

impl fmt::Display for AttributeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.type_name())
    }
}

/// Type error
#[derive(Debug, Clone, thiserror::Error)]
pub enum TypeError {
    #[error("Type mismatch: expected {expected}, got {got}")]
    TypeMismatch { expected: String, got: String },

    #[error("Invalid enum variant '{value}', expected one of: {}", expected.join(", "))]
    InvalidEnumVariant {
        value: String,
        expected: Vec<String>,
    },

    #[error("Validation failed: {message}")]
    ValidationFailed { message: String },

    #[error("Required attribute '{name}' is missing")]
    MissingRequired { name: String },

    #[error("Unknown attribute '{name}'")]
    UnknownAttribute { name: String },

    #[error("Attribute '{name}' is computed and cannot be set")]
    ReadOnlyAttribute { name: String },

    #[error("Attribute '{name}': {inner}")]
    AttributeError { name: String, inner: Box<TypeError> },

    #[error("List item at index {index}: {inner}")]
    ListItemError { index: usize, inner: Box<TypeError> },

    #[error("Map value for key '{key}': {inner}")]
    MapValueError { key: String, inner: Box<TypeError> },
}

impl Value {
    fn type_name(&self) -> String {
        match self {
            Value::String(_) => "String".to_string(),
            Value::Int(_) => "Int".to_string(),
            Value::Bool(_) => "Bool".to_string(),
            Value::List(_) => "List".to_string(),
            Value::Map(_) => "Map".to_string(),
            Value::ResourceRef(id, attr) => format!("ResourceRef({}.{})", id, attr),
        }
    }
}

/// How two values of an attribute are compared by the differ
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiffSuppress {
    /// Strings compare equal ignoring ASCII case
    CaseInsensitive,
    /// Strings holding JSON documents compare by their parsed content
    Json,
    /// Locations compare after normalization ("West Europe" == "westeurope")
    Location,
}

impl DiffSuppress {
    pub fn equivalent(&self, desired: &Value, current: &Value) -> bool {
        let (Value::String(d), Value::String(c)) = (desired, current) else {
            return desired == current;
        };
        match self {
            DiffSuppress::CaseInsensitive => d.eq_ignore_ascii_case(c),
            DiffSuppress::Location => normalize_location(d) == normalize_location(c),
            DiffSuppress::Json => {
                match (
                    serde_json::from_str::<serde_json::Value>(d),
                    serde_json::from_str::<serde_json::Value>(c),
                ) {
                    (Ok(d), Ok(c)) => d == c,
                    _ => d == c,
                }
            }
        }
    }
}

/// Normalize an Azure location: lower case with whitespace removed
pub fn normalize_location(location: &str) -> String {
    location
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect::<String>()
        .to_lowercase()
}

/// Attribute schema
#[derive(Debug, Clone)]
pub struct AttributeSchema {
    pub name: String,
    pub attr_type: AttributeType,
    pub required: bool,
    pub default: Option<Value>,
    pub description: Option<String>,
    /// Changing this attribute replaces the resource
    pub force_new: bool,
    /// Value may be filled in by the remote API when not configured
    pub computed: bool,
    /// Value is only ever produced by the remote API
    pub read_only: bool,
    /// Value is masked in plan output
    pub sensitive: bool,
    /// Value is never returned by the remote API
    pub write_only: bool,
    pub diff_suppress: Option<DiffSuppress>,
}

impl AttributeSchema {
    pub fn new(name: impl Into<String>, attr_type: AttributeType) -> Self {
        Self {
            name: name.into(),
            attr_type,
            required: false,
            default: None,
            description: None,
            force_new: false,
            computed: false,
            read_only: false,
            sensitive: false,
            write_only: false,
            diff_suppress: None,
        }
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn with_default(mut self, value: impl Into<Value>) -> Self {
        self.default = Some(value.into());
        self
    }

    pub fn with_description(mut self, desc: impl Into<String>) -> Self {
        self.description = Some(desc.into());
        self
    }

    pub fn force_new(mut self) -> Self {
        self.force_new = true;
        self
    }

    pub fn computed(mut self) -> Self {
        self.computed = true;
        self
    }

    pub fn read_only(mut self) -> Self {
        self.read_only = true;
        self.computed = true;
        self
    }

    pub fn sensitive(mut self) -> Self {
        self.sensitive = true;
        self
    }

    pub fn write_only(mut self) -> Self {
        self.write_only = true;
        self
    }

    pub fn with_diff_suppress(mut self, suppress: DiffSuppress) -> Self {
        self.diff_suppress = Some(suppress);
        self
    }

    /// Compare a desired value against the current one for this attribute
    pub fn matches(&self, desired: &Value, current: &Value) -> bool {
        values_match(&self.attr_type, self.diff_suppress, desired, current)
    }

    /// Whether going from `current` to `desired` replaces the resource
    ///
    /// Looks inside nested blocks, so a changed force-new field of a block
    /// (or of any element of a list of blocks) counts too.
    pub fn forces_replacement(&self, desired: Option<&Value>, current: Option<&Value>) -> bool {
        let changed = match (desired, current) {
            (Some(d), Some(c)) => !self.matches(d, c),
            (Some(_), None) => true,
            (None, Some(_)) => !self.computed,
            (None, None) => false,
        };
        changed && (self.force_new || nested_forces_replacement(&self.attr_type, desired, current))
    }
}

fn nested_forces_replacement(
    attr_type: &AttributeType,
    desired: Option<&Value>,
    current: Option<&Value>,
) -> bool {
    match attr_type {
        AttributeType::Block(attrs) => {
            let empty = HashMap::new();
            let d = desired.and_then(Value::as_map).unwrap_or(&empty);
            let c = current.and_then(Value::as_map).unwrap_or(&empty);
            attrs
                .iter()
                .any(|a| a.forces_replacement(d.get(&a.name), c.get(&a.name)))
        }
        AttributeType::List(inner) => {
            let d = desired.and_then(Value::as_list).unwrap_or(&[]);
            let c = current.and_then(Value::as_list).unwrap_or(&[]);
            (0..d.len().max(c.len()))
                .any(|i| nested_forces_replacement(inner, d.get(i), c.get(i)))
        }
        _ => false,
    }
}

fn values_match(
    attr_type: &AttributeType,
    suppress: Option<DiffSuppress>,
    desired: &Value,
    current: &Value,
) -> bool {
    match (attr_type, desired, current) {
        (AttributeType::Block(attrs), Value::Map(d), Value::Map(c)) => block_matches(attrs, d, c),
        (AttributeType::List(inner), Value::List(d), Value::List(c)) => {
            d.len() == c.len()
                && d.iter()
                    .zip(c.iter())
                    .all(|(d, c)| values_match(inner, suppress, d, c))
        }
        _ => match suppress {
            Some(s) => s.equivalent(desired, current),
            None => desired == current,
        },
    }
}

fn block_matches(
    attrs: &[AttributeSchema],
    desired: &HashMap<String, Value>,
    current: &HashMap<String, Value>,
) -> bool {
    attrs
        .iter()
        .all(|schema| match (desired.get(&schema.name), current.get(&schema.name)) {
            (Some(d), Some(c)) => schema.matches(d, c),
            (Some(_), None) => false,
            (None, Some(_)) => schema.computed,
            (None, None) => true,
        })
}

fn validate_block(
    attrs: &[AttributeSchema],
    values: &HashMap<String, Value>,
) -> Result<(), Vec<TypeError>> {
    let mut errors = Vec::new();

    for schema in attrs {
        if schema.required && !values.contains_key(&schema.name) && schema.default.is_none() {
            errors.push(TypeError::MissingRequired {
                name: schema.name.clone(),
            });
        }
    }

    let mut names: Vec<&String> = values.keys().collect();
    names.sort();
    for name in names {
        match attrs.iter().find(|s| &s.name == name) {
            Some(schema) if schema.read_only => {
                errors.push(TypeError::ReadOnlyAttribute { name: name.clone() });
            }
            Some(schema) => {
                if let Err(e) = schema.attr_type.validate(&values[name]) {
                    errors.push(TypeError::AttributeError {
                        name: name.clone(),
                        inner: Box::new(e),
                    });
                }
            }
            None => errors.push(TypeError::UnknownAttribute { name: name.clone() }),
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

fn apply_block_defaults(attrs: &[AttributeSchema], values: &mut HashMap<String, Value>) {
    for schema in attrs {
        match values.get_mut(&schema.name) {
            None => {
                if let Some(default) = &schema.default {
                    values.insert(schema.name.clone(), default.clone());
                }
            }
            Some(value) => {
                if let AttributeType::Block(nested) = &schema.attr_type {
                    if let Value::Map(map) = value {
                        apply_block_defaults(nested, map);
                    }
                } else if let AttributeType::List(inner) = &schema.attr_type
                    && let AttributeType::Block(nested) = inner.as_ref()
                    && let Value::List(items) = value
                {
                    for item in items.iter_mut() {
                        if let Value::Map(map) = item {
                            apply_block_defaults(nested, map);
                        }
                    }
                }
            }
        }
    }
}

/// Resource schema
#[derive(Debug, Clone)]
pub struct ResourceSchema {
    pub resource_type: String,
    pub attributes: HashMap<String, AttributeSchema>,
    pub description: Option<String>,
}

impl ResourceSchema {
    pub fn new(resource_type: impl Into<String>) -> Self {
        Self {
            resource_type: resource_type.into(),
            attributes: HashMap::new(),
            description: None,
        }
    }

    pub fn attribute(mut self, schema: AttributeSchema) -> Self {
        self.attributes.insert(schema.name.clone(), schema);
        self
    }

    pub fn with_description(mut self, desc: impl Into<String>) -> Self {
        self.description = Some(desc.into());
        self
    }

    pub fn get(&self, name: &str) -> Option<&AttributeSchema> {
        self.attributes.get(name)
    }

    /// Validate resource attributes
    pub fn validate(&self, attributes: &HashMap<String, Value>) -> Result<(), Vec<TypeError>> {
        let attrs: Vec<AttributeSchema> = self.attributes.values().cloned().collect();
        validate_block(&attrs, attributes)
    }

    /// Fill in schema defaults for attributes that are not configured
    pub fn apply_defaults(&self, attributes: &mut HashMap<String, Value>) {
        let attrs: Vec<AttributeSchema> = self.attributes.values().cloned().collect();
        apply_block_defaults(&attrs, attributes);
    }

    /// Returns true if changing any of the given attributes replaces the resource
    pub fn requires_replacement(
        &self,
        changed: &[String],
        desired: &HashMap<String, Value>,
        current: &HashMap<String, Value>,
    ) -> bool {
        changed.iter().any(|name| {
            self.attributes
                .get(name)
                .is_some_and(|s| s.forces_replacement(desired.get(name), current.get(name)))
        })
    }

    pub fn is_sensitive(&self, name: &str) -> bool {
        self.attributes.get(name).is_some_and(|s| s.sensitive)
    }

    /// Names of attributes the remote API never returns
    pub fn write_only_attributes(&self) -> impl Iterator<Item = &str> {
        self.attributes
            .values()
            .filter(|s| s.write_only)
            .map(|s| s.name.as_str())
    }
}

/// Validate that an integer lies within `[min, max]`
pub fn validate_int_between(value: &Value, min: i64, max: i64) -> Result<(), String> {
    match value {
        Value::Int(n) if (min..=max).contains(n) => Ok(()),
        Value::Int(n) => Err(format!(
            "expected value to be in the range ({} - {}), got {}",
            min, max, n
        )),
        _ => Err("Expected integer".to_string()),
    }
}

/// Validate that a string is one of the allowed values
pub fn validate_string_in_slice(
    value: &Value,
    valid: &[&str],
    ignore_case: bool,
) -> Result<(), String> {
    let Value::String(s) = value else {
        return Err("Expected string".to_string());
    };
    let found = valid.iter().any(|v| {
        if ignore_case {
            v.eq_ignore_ascii_case(s)
        } else {
            v == s
        }
    });
    if found {
        Ok(())
    } else {
        Err(format!(
            "expected value to be one of [{}], got {}",
            valid.join(", "),
            s
        ))
    }
}

/// Validate a string against a regular expression
pub fn validate_regex(value: &Value, pattern: &str, message: &str) -> Result<(), String> {
    let Value::String(s) = value else {
        return Err("Expected string".to_string());
    };
    let re = Regex::new(pattern).map_err(|e| format!("invalid pattern {}: {}", pattern, e))?;
    if re.is_match(s) {
        Ok(())
    } else {
        Err(format!("{:?}: {}", s, message))
    }
}

/// Validate that a string holds a JSON object
pub fn validate_json_object(value: &Value) -> Result<(), String> {
    let Value::String(s) = value else {
        return Err("Expected string".to_string());
    };
    match serde_json::from_str::<serde_json::Value>(s) {
        Ok(serde_json::Value::Object(_)) => Ok(()),
        Ok(_) => Err("expected a JSON object".to_string()),
        Err(e) => Err(format!("invalid JSON: {}", e)),
    }
}

/// Helper functions for common types
pub mod types {
    use super::*;

    /// Integer >= 0
    pub fn non_negative_int() -> AttributeType {
        AttributeType::Custom {
            name: "NonNegativeInt".to_string(),
            base: Box::new(AttributeType::Int),
            validate: |value| validate_int_between(value, 0, i64::MAX),
        }
    }

    /// String holding a JSON object
    pub fn json_object() -> AttributeType {
        AttributeType::Custom {
            name: "JsonObject".to_string(),
            base: Box::new(AttributeType::String),
            validate: validate_json_object,
        }
    }

    /// Non-empty string
    pub fn non_empty_string() -> AttributeType {
        AttributeType::Custom {
            name: "NonEmptyString".to_string(),
            base: Box::new(AttributeType::String),
            validate: |value| match value {
                Value::String(s) if !s.trim().is_empty() => Ok(()),
                Value::String(_) => Err("must not be empty".to_string()),
                _ => Err("Expected string".to_string()),
            },
        }
    }

    /// Tags (string to string map)
    pub fn tags() -> AttributeType {
        AttributeType::Map(Box::new(AttributeType::String))
    }

    /// List of strings
    pub fn string_list() -> AttributeType {
        AttributeType::List(Box::new(AttributeType::String))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn os_disk_block() -> AttributeType {
        AttributeType::Block(vec![
            AttributeSchema::new("caching", AttributeType::String).required(),
            AttributeSchema::new("disk_size_gb", AttributeType::Int).computed(),
            AttributeSchema::new("write_accelerator_enabled", AttributeType::Bool)
                .with_default(false),
        ])
    }

    #[test]
    fn validate_string_type() {
        let t = AttributeType::String;
        assert!(t.validate(&Value::String("hello".to_string())).is_ok());
        assert!(t.validate(&Value::Int(42)).is_err());
    }

    #[test]
    fn validate_enum_type() {
        let t = AttributeType::Enum(vec!["Manual".to_string(), "Rolling".to_string()]);
        assert!(t.validate(&Value::from("Manual")).is_ok());
        assert!(t.validate(&Value::from("manual")).is_err());
    }

    #[test]
    fn validate_custom_int_range() {
        let t = AttributeType::Custom {
            name: "FaultDomainCount".to_string(),
            base: Box::new(AttributeType::Int),
            validate: |v| validate_int_between(v, 1, 3),
        };
        assert!(t.validate(&Value::Int(1)).is_ok());
        assert!(t.validate(&Value::Int(3)).is_ok());
        assert!(t.validate(&Value::Int(0)).is_err());
        assert!(t.validate(&Value::Int(4)).is_err());
    }

    #[test]
    fn string_in_slice_ignores_case_when_asked() {
        let valid = &["Standard_LRS", "Premium_LRS"];
        assert!(validate_string_in_slice(&Value::from("standard_lrs"), valid, true).is_ok());
        assert!(validate_string_in_slice(&Value::from("standard_lrs"), valid, false).is_err());
    }

    #[test]
    fn regex_validation() {
        let pattern = r"^[a-zA-Z0-9]([-._a-zA-Z0-9]{0,78}[a-zA-Z0-9_])?$";
        assert!(validate_regex(&Value::from("avset-1"), pattern, "bad name").is_ok());
        assert!(validate_regex(&Value::from("-avset"), pattern, "bad name").is_err());
    }

    #[test]
    fn json_object_type() {
        let t = types::json_object();
        assert!(t.validate(&Value::from(r#"{"a": 1}"#)).is_ok());
        assert!(t.validate(&Value::from("[1, 2]")).is_err());
        assert!(t.validate(&Value::from("{not json")).is_err());
    }

    #[test]
    fn validate_resource_schema() {
        let schema = ResourceSchema::new("resource")
            .attribute(AttributeSchema::new("name", AttributeType::String).required())
            .attribute(AttributeSchema::new("count", types::non_negative_int()))
            .attribute(AttributeSchema::new("enabled", AttributeType::Bool));

        let mut attrs = HashMap::new();
        attrs.insert("name".to_string(), Value::String("my-resource".to_string()));
        attrs.insert("count".to_string(), Value::Int(5));
        attrs.insert("enabled".to_string(), Value::Bool(true));

        assert!(schema.validate(&attrs).is_ok());
    }

    #[test]
    fn missing_required_and_unknown_attributes() {
        let schema = ResourceSchema::new("disk")
            .attribute(AttributeSchema::new("name", AttributeType::String).required())
            .attribute(AttributeSchema::new("id", AttributeType::String).read_only());

        let mut attrs = HashMap::new();
        attrs.insert("bogus".to_string(), Value::Bool(true));
        attrs.insert("id".to_string(), Value::from("/x"));
        let errors = schema.validate(&attrs).unwrap_err();
        assert_eq!(errors.len(), 3);
        assert!(
            errors
                .iter()
                .any(|e| matches!(e, TypeError::MissingRequired { name } if name == "name"))
        );
        assert!(
            errors
                .iter()
                .any(|e| matches!(e, TypeError::ReadOnlyAttribute { name } if name == "id"))
        );
    }

    #[test]
    fn nested_block_validation() {
        let schema =
            ResourceSchema::new("vm").attribute(AttributeSchema::new("os_disk", os_disk_block()));

        let mut attrs = HashMap::new();
        attrs.insert("os_disk".to_string(), Value::Map(HashMap::new()));
        let errors = schema.validate(&attrs).unwrap_err();
        assert!(errors[0].to_string().contains("caching"));
    }

    #[test]
    fn defaults_are_applied_inside_blocks() {
        let schema = ResourceSchema::new("vm")
            .attribute(AttributeSchema::new("os_disk", os_disk_block()))
            .attribute(AttributeSchema::new("managed", AttributeType::Bool).with_default(true));

        let mut disk = HashMap::new();
        disk.insert("caching".to_string(), Value::from("ReadWrite"));
        let mut attrs = HashMap::new();
        attrs.insert("os_disk".to_string(), Value::Map(disk));

        schema.apply_defaults(&mut attrs);
        assert_eq!(attrs["managed"], Value::Bool(true));
        let disk = attrs["os_disk"].as_map().unwrap();
        assert_eq!(disk["write_accelerator_enabled"], Value::Bool(false));
    }

    #[test]
    fn block_matching_ignores_computed_fields() {
        let schema = AttributeSchema::new("os_disk", os_disk_block());

        let mut desired = HashMap::new();
        desired.insert("caching".to_string(), Value::from("ReadWrite"));
        let mut current = desired.clone();
        current.insert("disk_size_gb".to_string(), Value::Int(30));

        assert!(schema.matches(&Value::Map(desired.clone()), &Value::Map(current.clone())));

        current.insert("caching".to_string(), Value::from("None"));
        assert!(!schema.matches(&Value::Map(desired), &Value::Map(current)));
    }

    #[test]
    fn force_new_field_inside_block_replaces() {
        let block = AttributeType::Block(vec![
            AttributeSchema::new("caching", AttributeType::String),
            AttributeSchema::new("storage_account_type", AttributeType::String).force_new(),
            AttributeSchema::new("name", AttributeType::String)
                .computed()
                .force_new(),
        ]);
        let schema = ResourceSchema::new("vm").attribute(AttributeSchema::new("os_disk", block));
        let os_disk = |caching: &str, storage: &str| {
            let mut map = HashMap::new();
            map.insert("caching".to_string(), Value::from(caching));
            map.insert("storage_account_type".to_string(), Value::from(storage));
            let mut attrs = HashMap::new();
            attrs.insert("os_disk".to_string(), Value::Map(map));
            attrs
        };
        let changed = vec!["os_disk".to_string()];

        let mut current = os_disk("ReadWrite", "Standard_LRS");
        if let Some(Value::Map(map)) = current.get_mut("os_disk") {
            map.insert("name".to_string(), Value::from("web-osdisk"));
        }

        assert!(schema.requires_replacement(
            &changed,
            &os_disk("ReadWrite", "Premium_LRS"),
            &current
        ));
        // an unset computed name and a mutable field do not replace
        assert!(!schema.requires_replacement(
            &changed,
            &os_disk("ReadOnly", "Standard_LRS"),
            &current
        ));
    }

    #[test]
    fn force_new_field_inside_list_of_blocks_replaces() {
        let nic = AttributeType::List(Box::new(AttributeType::Block(vec![
            AttributeSchema::new("name", AttributeType::String).force_new(),
            AttributeSchema::new("primary", AttributeType::Bool),
        ])));
        let schema =
            ResourceSchema::new("vmss").attribute(AttributeSchema::new("network_interface", nic));
        let nics = |entries: &[(&str, bool)]| {
            let items = entries
                .iter()
                .map(|(name, primary)| {
                    let mut map = HashMap::new();
                    map.insert("name".to_string(), Value::from(*name));
                    map.insert("primary".to_string(), Value::Bool(*primary));
                    Value::Map(map)
                })
                .collect();
            let mut attrs = HashMap::new();
            attrs.insert("network_interface".to_string(), Value::List(items));
            attrs
        };
        let changed = vec!["network_interface".to_string()];
        let current = nics(&[("nic0", true)]);

        assert!(schema.requires_replacement(&changed, &nics(&[("nic1", true)]), &current));
        assert!(schema.requires_replacement(
            &changed,
            &nics(&[("nic0", true), ("nic1", false)]),
            &current
        ));
        assert!(!schema.requires_replacement(&changed, &nics(&[("nic0", false)]), &current));
    }

    #[test]
    fn diff_suppress_rules() {
        assert!(DiffSuppress::Location.equivalent(&Value::from("West Europe"), &Value::from("westeurope")));
        assert!(DiffSuppress::CaseInsensitive.equivalent(
            &Value::from("Premium_LRS"),
            &Value::from("premium_lrs")
        ));
        assert!(DiffSuppress::Json.equivalent(
            &Value::from(r#"{"a":1,"b":2}"#),
            &Value::from(r#"{ "b": 2, "a": 1 }"#)
        ));
        assert!(!DiffSuppress::Json.equivalent(&Value::from(r#"{"a":1}"#), &Value::from(r#"{"a":2}"#)));
    }
}
