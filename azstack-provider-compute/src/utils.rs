//! Helpers for moving values between configuration attributes and API models

use std::collections::HashMap;

use azstack_core::provider::{ProviderError, ProviderResult};
use azstack_core::resource::Value;

use crate::models::Tags;

pub type Attributes = HashMap<String, Value>;

/// String attribute; empty strings count as unset
pub fn get_str<'a>(attrs: &'a Attributes, key: &str) -> Option<&'a str> {
    attrs
        .get(key)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
}

pub fn require_str<'a>(attrs: &'a Attributes, key: &str) -> ProviderResult<&'a str> {
    get_str(attrs, key)
        .ok_or_else(|| ProviderError::validation(format!("`{}` is required", key)))
}

pub fn get_bool(attrs: &Attributes, key: &str) -> Option<bool> {
    attrs.get(key).and_then(Value::as_bool)
}

pub fn get_int(attrs: &Attributes, key: &str) -> Option<i64> {
    attrs.get(key).and_then(Value::as_int)
}

/// A single nested block, written either as a map or as a one-element list
pub fn get_block<'a>(attrs: &'a Attributes, key: &str) -> Option<&'a Attributes> {
    match attrs.get(key)? {
        Value::Map(map) => Some(map),
        Value::List(items) => items.first().and_then(Value::as_map),
        _ => None,
    }
}

/// Repeatable nested blocks
pub fn get_blocks<'a>(attrs: &'a Attributes, key: &str) -> Vec<&'a Attributes> {
    match attrs.get(key) {
        Some(Value::List(items)) => items.iter().filter_map(Value::as_map).collect(),
        Some(Value::Map(map)) => vec![map],
        _ => Vec::new(),
    }
}

pub fn get_string_list(attrs: &Attributes, key: &str) -> Vec<String> {
    attrs
        .get(key)
        .and_then(Value::as_list)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

pub fn set_str<S: AsRef<str>>(attrs: &mut Attributes, key: &str, value: Option<S>) {
    if let Some(value) = value {
        attrs.insert(key.to_string(), Value::from(value.as_ref()));
    }
}

pub fn set_bool(attrs: &mut Attributes, key: &str, value: Option<bool>) {
    if let Some(value) = value {
        attrs.insert(key.to_string(), Value::Bool(value));
    }
}

pub fn set_int(attrs: &mut Attributes, key: &str, value: Option<i64>) {
    if let Some(value) = value {
        attrs.insert(key.to_string(), Value::Int(value));
    }
}

/// Insert a nested block, skipping blocks that came back empty
pub fn set_block(attrs: &mut Attributes, key: &str, block: Attributes) {
    if !block.is_empty() {
        attrs.insert(key.to_string(), Value::Map(block));
    }
}

pub fn set_blocks(attrs: &mut Attributes, key: &str, blocks: Vec<Attributes>) {
    if !blocks.is_empty() {
        attrs.insert(
            key.to_string(),
            Value::List(blocks.into_iter().map(Value::Map).collect()),
        );
    }
}

/// `tags` attribute as sent to the API; no tags clears them remotely
pub fn expand_tags(attrs: &Attributes) -> Tags {
    attrs
        .get("tags")
        .and_then(Value::as_map)
        .map(|tags| {
            tags.iter()
                .filter_map(|(k, v)| v.as_str().map(|v| (k.clone(), v.to_string())))
                .collect()
        })
        .unwrap_or_default()
}

pub fn flatten_tags(attrs: &mut Attributes, tags: Option<&Tags>) {
    let tags: HashMap<String, Value> = tags
        .into_iter()
        .flatten()
        .map(|(k, v)| (k.clone(), Value::from(v.as_str())))
        .collect();
    attrs.insert("tags".to_string(), Value::Map(tags));
}

/// Parse a JSON-object string attribute
pub fn expand_json_object(
    attrs: &Attributes,
    key: &str,
) -> ProviderResult<Option<serde_json::Value>> {
    let Some(raw) = get_str(attrs, key) else {
        return Ok(None);
    };
    match serde_json::from_str::<serde_json::Value>(raw) {
        Ok(value @ serde_json::Value::Object(_)) => Ok(Some(value)),
        Ok(_) => Err(ProviderError::validation(format!(
            "`{}` must be a JSON object",
            key
        ))),
        Err(e) => Err(ProviderError::validation(format!(
            "parsing `{}`: {}",
            key, e
        ))),
    }
}

/// Render a JSON object returned by the API; empty objects count as unset
pub fn flatten_json_object(value: Option<&serde_json::Value>) -> Option<String> {
    match value {
        Some(serde_json::Value::Object(map)) if map.is_empty() => None,
        Some(value @ serde_json::Value::Object(_)) => Some(value.to_string()),
        _ => None,
    }
}
