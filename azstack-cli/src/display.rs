//! Terminal rendering of plans and states

use std::collections::HashMap;

use colored::Colorize;

use azstack_core::effect::Effect;
use azstack_core::plan::Plan;
use azstack_core::resource::{ResourceId, State, Value};
use azstack_core::schema::ResourceSchema;

const SENSITIVE: &str = "(sensitive)";

pub fn format_effect(effect: &Effect) -> String {
    match effect {
        Effect::Create(r) => format!("Create {}", r.id),
        Effect::Update { id, .. } => format!("Update {}", id),
        Effect::Replace { id, .. } => format!("Replace {}", id),
        Effect::Delete { id, .. } => format!("Delete {}", id),
    }
}

/// Render a value, with map keys in sorted order
pub fn format_value(value: &Value) -> String {
    match value {
        Value::String(s) => format!("{:?}", s),
        Value::Int(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        Value::List(items) => {
            let strs: Vec<_> = items.iter().map(format_value).collect();
            format!("[{}]", strs.join(", "))
        }
        Value::Map(map) => {
            let mut keys: Vec<_> = map.keys().collect();
            keys.sort();
            let strs: Vec<_> = keys
                .into_iter()
                .map(|k| format!("{}: {}", k, format_value(&map[k])))
                .collect();
            format!("{{{}}}", strs.join(", "))
        }
        Value::ResourceRef(id, attr) => format!("(known after apply: {}.{})", id, attr),
    }
}

fn format_attribute(schema: Option<&ResourceSchema>, key: &str, value: &Value) -> String {
    if schema.is_some_and(|s| s.is_sensitive(key)) {
        SENSITIVE.to_string()
    } else {
        format_value(value)
    }
}

/// Attribute names with `name` first, the rest sorted
fn ordered_keys(attributes: &HashMap<String, Value>) -> Vec<&String> {
    let mut keys: Vec<_> = attributes.keys().collect();
    keys.sort_by(|a, b| match (a.as_str(), b.as_str()) {
        ("name", _) => std::cmp::Ordering::Less,
        (_, "name") => std::cmp::Ordering::Greater,
        _ => a.cmp(b),
    });
    keys
}

/// `old → new` lines for the attributes an effect changes
pub fn changed_lines(
    schema: Option<&ResourceSchema>,
    from: &State,
    to: &HashMap<String, Value>,
    changed: &[String],
) -> Vec<String> {
    changed
        .iter()
        .map(|key| {
            let old = from
                .attributes
                .get(key)
                .map(|v| format_attribute(schema, key, v))
                .unwrap_or_else(|| "(none)".to_string());
            let new = to
                .get(key)
                .map(|v| format_attribute(schema, key, v))
                .unwrap_or_else(|| "(none)".to_string());
            let forces = schema
                .and_then(|s| s.get(key))
                .is_some_and(|a| a.forces_replacement(to.get(key), from.attributes.get(key)));
            if forces {
                format!("{}: {} → {} (forces replacement)", key, old, new)
            } else {
                format!("{}: {} → {}", key, old, new)
            }
        })
        .collect()
}

pub fn print_plan(plan: &Plan, schemas: &HashMap<String, ResourceSchema>) {
    if plan.is_empty() {
        println!("{}", "No changes. Infrastructure is up-to-date.".green());
        return;
    }

    println!("{}", "Execution Plan:".cyan().bold());
    println!();

    let attr_prefix = "      ";
    for effect in plan.effects() {
        let schema = schemas.get(&effect.resource_id().resource_type);
        match effect {
            Effect::Create(r) => {
                println!("  {} {}", "+".green().bold(), r.id.to_string().cyan().bold());
                for key in ordered_keys(&r.attributes) {
                    let value = format_attribute(schema, key, &r.attributes[key]);
                    if key == "name" {
                        println!("{}{}: {}", attr_prefix, key.bold(), value.white().bold());
                    } else {
                        println!("{}{}: {}", attr_prefix, key, value.green());
                    }
                }
            }
            Effect::Update {
                id,
                from,
                to,
                changed_attributes,
            } => {
                println!("  {} {}", "~".yellow().bold(), id.to_string().cyan().bold());
                for line in changed_lines(schema, from, &to.attributes, changed_attributes) {
                    println!("{}{}", attr_prefix, line.yellow());
                }
            }
            Effect::Replace {
                id,
                from,
                to,
                changed_attributes,
            } => {
                println!("  {} {}", "-/+".magenta().bold(), id.to_string().cyan().bold());
                for line in changed_lines(schema, from, &to.attributes, changed_attributes) {
                    println!("{}{}", attr_prefix, line.magenta());
                }
            }
            Effect::Delete { id, identifier } => {
                println!("  {} {}", "-".red().bold(), id.to_string().cyan().bold());
                println!("{}{}: {}", attr_prefix, "id".bold(), identifier.red());
            }
        }
    }

    println!();
    let summary = plan.summary();
    println!(
        "Plan: {} to add, {} to change, {} to replace, {} to destroy.",
        summary.create.to_string().green(),
        summary.update.to_string().yellow(),
        summary.replace.to_string().magenta(),
        summary.delete.to_string().red()
    );
}

/// Print every attribute of a tracked resource
pub fn print_state(
    id: &ResourceId,
    identifier: Option<&str>,
    attributes: &HashMap<String, Value>,
    schema: Option<&ResourceSchema>,
) {
    println!("{}", id.to_string().cyan().bold());
    if let Some(identifier) = identifier {
        println!("  {}: {}", "id".bold(), identifier);
    }
    for key in ordered_keys(attributes) {
        if key == "id" {
            continue;
        }
        println!(
            "  {}: {}",
            key,
            format_attribute(schema, key, &attributes[key])
        );
    }
}
