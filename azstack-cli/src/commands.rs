//! Subcommand implementations
//!
//! Each `run_*` function loads the configuration, opens the backend and
//! builds the provider, then hands off to a function that only depends on
//! the `Provider` and `StateBackend` traits.

use std::collections::{HashMap, HashSet};
use std::path::Path;

use colored::Colorize;
use log::{debug, warn};

use azstack_core::differ::{carry_write_only, create_plan, destroy_plan};
use azstack_core::graph::Bindings;
use azstack_core::interpreter::Interpreter;
use azstack_core::plan::Plan;
use azstack_core::provider::Provider;
use azstack_core::resource::{Resource, ResourceId, State};
use azstack_core::schema::ResourceSchema;
use azstack_provider_compute::AzureStackProvider;
use azstack_provider_compute::resources::schema_for;
use azstack_state::{LockInfo, StateBackend, StateFile, create_backend};

use crate::config::{ConfigFile, schemas, validate_resources};
use crate::display::{format_effect, print_plan, print_state};

// =============================================================================
// Shared plumbing
// =============================================================================

async fn open_backend(config: &ConfigFile) -> Result<Box<dyn StateBackend>, String> {
    create_backend(&config.backend)
        .await
        .map_err(|e| e.to_string())
}

fn build_provider(config: &ConfigFile) -> Result<AzureStackProvider, String> {
    AzureStackProvider::from_config(&config.provider).map_err(|e| e.to_string())
}

async fn read_state_file(backend: &dyn StateBackend) -> Result<StateFile, String> {
    Ok(backend
        .read_state()
        .await
        .map_err(|e| e.to_string())?
        .unwrap_or_default())
}

async fn persist(backend: &dyn StateBackend, file: &mut StateFile) -> Result<(), String> {
    file.increment_serial();
    backend
        .write_state(file)
        .await
        .map_err(|e| format!("Failed to save state: {}", e))
}

async fn acquire(backend: &dyn StateBackend, operation: &str) -> Result<LockInfo, String> {
    backend
        .acquire_lock(operation)
        .await
        .map_err(|e| e.to_string())
}

async fn release(backend: &dyn StateBackend, lock: &LockInfo) {
    if let Err(e) = backend.release_lock(lock).await {
        warn!("failed to release state lock {}: {}", lock.id, e);
    }
}

/// Read every tracked resource again
///
/// Resources that no longer exist are dropped from `file`. Write-only
/// attributes are carried over from the saved state, since reads never
/// return them.
pub async fn refresh<P: Provider>(
    provider: &P,
    file: &mut StateFile,
    schemas: &HashMap<String, ResourceSchema>,
) -> Result<HashMap<ResourceId, State>, String> {
    let mut states = HashMap::new();

    for tracked in file.resources.clone() {
        let saved = tracked.to_state();
        debug!("refreshing {}", saved.id);
        let mut state = provider
            .read(&saved.id, saved.identifier.as_deref())
            .await
            .map_err(|e| format!("Failed to read {}: {}", saved.id, e))?;

        if !state.exists {
            warn!("{} no longer exists, removing it from state", saved.id);
            file.remove_resource(&saved.id.resource_type, &saved.id.name);
            continue;
        }

        if let Some(schema) = schemas.get(&saved.id.resource_type) {
            carry_write_only(&mut state, &saved.attributes, schema);
        }
        file.record(&state, provider.name());
        states.insert(state.id.clone(), state);
    }

    Ok(states)
}

/// Plan the changes that bring `states` to `desired`
///
/// Tracked resources that are no longer declared are deleted first, most
/// recently added first. References to existing resources are substituted
/// before diffing so unchanged references do not show up as changes.
pub fn build_plan(
    desired: &[Resource],
    file: &StateFile,
    states: &HashMap<ResourceId, State>,
    schemas: &HashMap<String, ResourceSchema>,
) -> Plan {
    let declared: HashSet<&ResourceId> = desired.iter().map(|r| &r.id).collect();
    let orphans: Vec<State> = file
        .resources
        .iter()
        .rev()
        .map(|r| r.to_state())
        .filter(|s| !declared.contains(&s.id) && states.contains_key(&s.id))
        .collect();

    let bindings = Bindings::from_states(states);
    let resolved: Vec<Resource> = desired
        .iter()
        .map(|r| bindings.resolve_resource_partial(r))
        .collect();

    let mut plan = destroy_plan(&orphans);
    for effect in create_plan(&resolved, states, schemas).effects() {
        plan.add(effect.clone());
    }
    plan
}

/// Execute a plan, saving state after every effect
///
/// Stops at the first failure. Returns the number of applied effects.
pub async fn apply_plan<P: Provider>(
    provider: P,
    plan: &Plan,
    states: &HashMap<ResourceId, State>,
    file: &mut StateFile,
    backend: &dyn StateBackend,
) -> Result<usize, String> {
    let provider_name = provider.name();
    let mut interpreter = Interpreter::new(provider).with_bindings(Bindings::from_states(states));
    let mut applied = 0;

    for effect in plan.effects() {
        match interpreter.execute(effect).await {
            Ok(outcome) => {
                println!("  {} {}", "✓".green(), format_effect(effect));
                match outcome.state() {
                    Some(state) => file.record(state, provider_name),
                    None => {
                        let id = effect.resource_id();
                        file.remove_resource(&id.resource_type, &id.name);
                    }
                }
                persist(backend, file).await?;
                applied += 1;
            }
            Err(e) => {
                println!("  {} {} - {}", "✗".red(), format_effect(effect), e);
                return Err(format!(
                    "Apply failed after {} of {} changes: {}",
                    applied,
                    plan.len(),
                    e
                ));
            }
        }
    }

    Ok(applied)
}

/// Tracked states in the order they should be deleted
///
/// Undeclared resources come first, then declared ones in reverse
/// dependency order.
pub fn destroy_order(sorted: &[Resource], file: &StateFile) -> Vec<State> {
    let declared: HashSet<&ResourceId> = sorted.iter().map(|r| &r.id).collect();
    let tracked = file.states();

    let mut order: Vec<State> = file
        .resources
        .iter()
        .rev()
        .map(|r| r.to_state())
        .filter(|s| !declared.contains(&s.id))
        .collect();
    order.extend(sorted.iter().rev().filter_map(|r| tracked.get(&r.id).cloned()));
    order
}

/// Bring a remote resource under management at `id`
pub async fn import_resource<P: Provider>(
    provider: &P,
    id: &ResourceId,
    identifier: &str,
    file: &mut StateFile,
) -> Result<State, String> {
    if let Some(existing) = file.find_resource(&id.resource_type, &id.name) {
        return Err(format!(
            "{} is already managed (ID {})",
            id,
            existing.identifier.as_deref().unwrap_or("unknown")
        ));
    }

    let state = provider
        .import(id, identifier)
        .await
        .map_err(|e| e.to_string())?;
    file.record(&state, provider.name());
    Ok(state)
}

// =============================================================================
// Commands
// =============================================================================

pub fn run_validate(path: &Path) -> Result<(), String> {
    let config = ConfigFile::load(path)?;

    println!("{}", "Validating...".cyan());

    let resources = config.resources()?;
    validate_resources(&resources)?;

    println!(
        "{}",
        format!("✓ {} resources validated successfully.", resources.len())
            .green()
            .bold()
    );
    for resource in &resources {
        println!("  • {}", resource.id);
    }
    Ok(())
}

pub async fn run_plan(path: &Path) -> Result<(), String> {
    let config = ConfigFile::load(path)?;
    let resources = config.resources()?;
    validate_resources(&resources)?;

    let provider = build_provider(&config)?;
    let backend = open_backend(&config).await?;
    let schemas = schemas();

    let lock = acquire(backend.as_ref(), "plan").await?;
    let result = async {
        let mut file = read_state_file(backend.as_ref()).await?;
        let states = refresh(&provider, &mut file, &schemas).await?;
        Ok::<_, String>(build_plan(&resources, &file, &states, &schemas))
    }
    .await;
    release(backend.as_ref(), &lock).await;

    print_plan(&result?, &schemas);
    Ok(())
}

pub async fn run_apply(path: &Path) -> Result<(), String> {
    let config = ConfigFile::load(path)?;
    let resources = config.resources()?;
    validate_resources(&resources)?;

    let provider = build_provider(&config)?;
    let backend = open_backend(&config).await?;
    let schemas = schemas();

    let lock = acquire(backend.as_ref(), "apply").await?;
    let result = async {
        let mut file = read_state_file(backend.as_ref()).await?;
        let states = refresh(&provider, &mut file, &schemas).await?;
        persist(backend.as_ref(), &mut file).await?;

        let plan = build_plan(&resources, &file, &states, &schemas);
        if plan.is_empty() {
            println!("{}", "No changes needed.".green());
            return Ok(());
        }

        print_plan(&plan, &schemas);
        println!();
        println!("{}", "Applying changes...".cyan().bold());
        println!();

        let applied = apply_plan(provider, &plan, &states, &mut file, backend.as_ref()).await?;

        println!();
        println!(
            "{}",
            format!("Apply complete! {} changes applied.", applied)
                .green()
                .bold()
        );
        Ok(())
    }
    .await;
    release(backend.as_ref(), &lock).await;
    result
}

pub async fn run_destroy(path: &Path, auto_approve: bool) -> Result<(), String> {
    let config = ConfigFile::load(path)?;
    let resources = config.resources()?;

    let provider = build_provider(&config)?;
    let backend = open_backend(&config).await?;

    let lock = acquire(backend.as_ref(), "destroy").await?;
    let result = async {
        let mut file = read_state_file(backend.as_ref()).await?;
        let order = destroy_order(&resources, &file);
        let plan = destroy_plan(&order);

        if plan.is_empty() {
            println!("{}", "No resources to destroy.".green());
            return Ok(());
        }

        println!("{}", "Destroy Plan:".red().bold());
        println!();
        for effect in plan.effects() {
            println!("  {} {}", "-".red().bold(), effect.resource_id());
        }
        println!();
        println!("Plan: {} to destroy.", plan.len().to_string().red());
        println!();

        if !auto_approve && !confirm("Do you really want to destroy all resources?")? {
            println!();
            println!("{}", "Destroy cancelled.".yellow());
            return Ok(());
        }

        println!("{}", "Destroying resources...".red().bold());
        println!();

        let destroyed =
            apply_plan(provider, &plan, &HashMap::new(), &mut file, backend.as_ref()).await?;

        println!();
        println!(
            "{}",
            format!("Destroy complete! {} resources destroyed.", destroyed)
                .green()
                .bold()
        );
        Ok(())
    }
    .await;
    release(backend.as_ref(), &lock).await;
    result
}

pub async fn run_import(path: &Path, address: &str, identifier: &str) -> Result<(), String> {
    let config = ConfigFile::load(path)?;
    let id = ResourceId::parse_address(address)
        .ok_or_else(|| format!("Invalid resource address {:?}, expected type.name", address))?;
    if config.find(&id).is_none() {
        return Err(format!(
            "{} is not declared in {}; declare it before importing",
            id,
            path.display()
        ));
    }

    let provider = build_provider(&config)?;
    let backend = open_backend(&config).await?;

    let lock = acquire(backend.as_ref(), "import").await?;
    let result = async {
        let mut file = read_state_file(backend.as_ref()).await?;
        let state = import_resource(&provider, &id, identifier, &mut file).await?;
        persist(backend.as_ref(), &mut file).await?;
        Ok::<_, String>(state)
    }
    .await;
    release(backend.as_ref(), &lock).await;

    let state = result?;
    println!(
        "{} {} imported from {}",
        "✓".green(),
        state.id.to_string().cyan().bold(),
        identifier
    );
    Ok(())
}

pub async fn run_state_list(path: &Path) -> Result<(), String> {
    let config = ConfigFile::load(path)?;
    let backend = open_backend(&config).await?;
    let file = read_state_file(backend.as_ref()).await?;

    if file.resources.is_empty() {
        println!("{}", "No resources are managed.".yellow());
        return Ok(());
    }
    for resource in &file.resources {
        println!(
            "{}  {}",
            resource.address(),
            resource.identifier.as_deref().unwrap_or("").dimmed()
        );
    }
    Ok(())
}

pub async fn run_state_show(path: &Path, address: &str) -> Result<(), String> {
    let config = ConfigFile::load(path)?;
    let id = ResourceId::parse_address(address)
        .ok_or_else(|| format!("Invalid resource address {:?}, expected type.name", address))?;
    let backend = open_backend(&config).await?;
    let file = read_state_file(backend.as_ref()).await?;

    let tracked = file
        .find_resource(&id.resource_type, &id.name)
        .ok_or_else(|| format!("{} is not in the state", id))?;
    let state = tracked.to_state();
    let schema = schema_for(&id.resource_type);
    print_state(
        &state.id,
        state.identifier.as_deref(),
        &state.attributes,
        schema.as_ref(),
    );
    Ok(())
}

pub async fn run_force_unlock(path: &Path, lock_id: &str) -> Result<(), String> {
    let config = ConfigFile::load(path)?;
    let backend = open_backend(&config).await?;
    backend
        .force_unlock(lock_id)
        .await
        .map_err(|e| e.to_string())?;
    println!("{}", format!("Lock {} released.", lock_id).green());
    Ok(())
}

fn confirm(question: &str) -> Result<bool, String> {
    println!("{}", question.yellow().bold());
    println!(
        "  {}",
        "This action cannot be undone. Type 'yes' to confirm.".yellow()
    );
    print!("\n  Enter a value: ");
    std::io::Write::flush(&mut std::io::stdout()).map_err(|e| e.to_string())?;

    let mut input = String::new();
    std::io::stdin()
        .read_line(&mut input)
        .map_err(|e| e.to_string())?;
    Ok(input.trim() == "yes")
}
