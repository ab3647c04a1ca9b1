mod config;

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use clap::{Args, Parser, Subcommand};
use colored::Colorize;
use log::{debug, warn};

use nimbus_core::differ::{create_plan, destroy_plan};
use nimbus_core::effect::Effect;
use nimbus_core::interpreter::{EffectOutcome, Interpreter};
use nimbus_core::plan::Plan;
use nimbus_core::provider::Provider;
use nimbus_core::reference::{Bindings, unresolved_reference};
use nimbus_core::resource::{Resource, ResourceId, State, Value};
use nimbus_core::schema::ResourceSchema;
use nimbus_provider::{NimbusProvider, ProviderContext, data_source_schemas, resource_schemas};
use nimbus_sdk::{ApiClient, ClientConfig, Credentials, Endpoints};
use nimbus_state::{StateBackend, StateFile, create_backend};

use crate::config::ProjectConfig;

#[derive(Parser)]
#[command(name = "nimbus")]
#[command(about = "Declarative resource management for the Nimbus cloud", long_about = None)]
struct Cli {
    /// Path to the project configuration
    #[arg(long, short, global = true, default_value = "nimbus.toml")]
    config: PathBuf,

    /// Log API calls and polling progress
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(flatten)]
    credentials: CredentialArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct CredentialArgs {
    /// Access key id
    #[arg(long, global = true, env = "NIMBUS_ACCESS_KEY", hide_env_values = true)]
    access_key: Option<String>,

    /// Secret access key
    #[arg(long, global = true, env = "NIMBUS_SECRET_KEY", hide_env_values = true)]
    secret_key: Option<String>,

    /// Security token of temporary credentials
    #[arg(long, global = true, env = "NIMBUS_SECURITY_TOKEN", hide_env_values = true)]
    security_token: Option<String>,

    /// Region, overriding `provider.region`
    #[arg(long, global = true, env = "NIMBUS_REGION")]
    region: Option<String>,

    /// Project id, overriding `provider.project_id`
    #[arg(long, global = true, env = "NIMBUS_PROJECT_ID")]
    project_id: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate the configuration file
    Validate,
    /// Show execution plan without applying changes
    Plan,
    /// Apply changes to reach the desired state
    Apply {
        /// Skip confirmation prompt (auto-approve)
        #[arg(long)]
        auto_approve: bool,
    },
    /// Update the state file from the cloud without changing anything
    Refresh,
    /// Destroy every resource recorded in the state
    Destroy {
        /// Skip confirmation prompt (auto-approve)
        #[arg(long)]
        auto_approve: bool,
    },
    /// Inspect the state file
    State {
        #[command(subcommand)]
        command: StateCommands,
    },
    /// Release a lock left behind by an interrupted run
    ForceUnlock {
        /// Lock ID shown in the "state is locked" error
        lock_id: String,
    },
}

#[derive(Subcommand)]
enum StateCommands {
    /// List recorded resources
    List,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let level = if cli.verbose { "debug" } else { "warn" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    let result = match cli.command {
        Commands::Validate => run_validate(&cli.config),
        Commands::Plan => run_plan(&cli.config, &cli.credentials).await,
        Commands::Apply { auto_approve } => {
            run_apply(&cli.config, &cli.credentials, auto_approve).await
        }
        Commands::Refresh => run_refresh(&cli.config, &cli.credentials).await,
        Commands::Destroy { auto_approve } => {
            run_destroy(&cli.config, &cli.credentials, auto_approve).await
        }
        Commands::State {
            command: StateCommands::List,
        } => run_state_list(&cli.config).await,
        Commands::ForceUnlock { lock_id } => run_force_unlock(&cli.config, &lock_id).await,
    };

    if let Err(e) = result {
        eprintln!("{} {}", "Error:".red().bold(), e);
        std::process::exit(1);
    }
}

/// Load, validate and order the declared blocks
fn load_project(path: &Path) -> Result<(ProjectConfig, Vec<Resource>), String> {
    let project = ProjectConfig::load(path).map_err(|e| e.to_string())?;
    let mut declared = project.declared().map_err(|e| e.to_string())?;
    config::validate(&mut declared, &resource_schemas(), &data_source_schemas())
        .map_err(|e| e.to_string())?;
    Ok((project, sort_resources_by_dependencies(&declared)))
}

fn build_provider(
    project: &ProjectConfig,
    credentials: &CredentialArgs,
) -> Result<NimbusProvider, String> {
    let settings = &project.provider;
    let region = credentials
        .region
        .clone()
        .or_else(|| settings.region.clone())
        .ok_or("no region configured (set provider.region or NIMBUS_REGION)")?;
    let project_id = credentials
        .project_id
        .clone()
        .or_else(|| settings.project_id.clone())
        .ok_or("no project id configured (set provider.project_id or NIMBUS_PROJECT_ID)")?;
    let (Some(access_key), Some(secret_key)) = (&credentials.access_key, &credentials.secret_key)
    else {
        return Err("missing credentials: set NIMBUS_ACCESS_KEY and NIMBUS_SECRET_KEY".to_string());
    };

    let mut creds = Credentials::new(access_key, secret_key);
    if let Some(ref token) = credentials.security_token {
        creds = creds.with_security_token(token);
    }

    let mut endpoints = Endpoints::new(region);
    if let Some(ref cloud) = settings.cloud {
        endpoints = endpoints.with_cloud(cloud);
    }
    for (service, url) in &settings.endpoints {
        endpoints = endpoints.with_override(service, url);
    }

    let mut client_config = ClientConfig::new(creds, project_id, endpoints);
    if let Some(retries) = settings.max_retries {
        client_config = client_config.with_max_retries(retries);
    }
    let client = ApiClient::new(client_config).map_err(|e| e.to_string())?;
    let ctx = ProviderContext::new(client).with_timeouts(settings.timeouts.to_timeouts());
    Ok(NimbusProvider::new(ctx))
}

async fn open_backend(project: &ProjectConfig) -> Result<Box<dyn StateBackend>, String> {
    let config = project.backend_config().map_err(|e| e.to_string())?;
    create_backend(&config).await.map_err(|e| e.to_string())
}

async fn read_state_file(backend: &dyn StateBackend) -> Result<StateFile, String> {
    Ok(backend
        .read_state()
        .await
        .map_err(|e| format!("Failed to read state from {}: {}", backend.describe(), e))?
        .unwrap_or_default())
}

/// Run `operation` while holding the state lock. The lock is released
/// whether or not the operation succeeds.
async fn with_lock<F, Fut>(
    backend: &dyn StateBackend,
    operation: &str,
    f: F,
) -> Result<(), String>
where
    F: FnOnce() -> Fut,
    Fut: std::future::Future<Output = Result<(), String>>,
{
    let lock = backend
        .acquire_lock(operation)
        .await
        .map_err(|e| e.to_string())?;
    debug!("acquired lock {}", lock);

    let result = f().await;

    if let Err(e) = backend.release_lock(&lock).await {
        warn!("failed to release lock {}: {}", lock.id, e);
        eprintln!(
            "{} failed to release lock {}: {}",
            "Warning:".yellow().bold(),
            lock.id,
            e
        );
    }
    result
}

/// Sort resources so that every resource comes after the ones it references
fn sort_resources_by_dependencies(resources: &[Resource]) -> Vec<Resource> {
    let by_binding: HashMap<String, &Resource> =
        resources.iter().map(|r| (r.id.binding(), r)).collect();

    let mut sorted = Vec::new();
    let mut visited: HashSet<String> = HashSet::new();
    let mut visiting: HashSet<String> = HashSet::new();

    fn visit<'a>(
        resource: &'a Resource,
        by_binding: &HashMap<String, &'a Resource>,
        visited: &mut HashSet<String>,
        visiting: &mut HashSet<String>,
        sorted: &mut Vec<Resource>,
    ) {
        let binding = resource.id.binding();
        if visited.contains(&binding) || visiting.contains(&binding) {
            // Cycles are reported by the interpreter as unresolved references
            return;
        }
        visiting.insert(binding.clone());

        for dep in resource.dependencies() {
            if let Some(dep_resource) = by_binding.get(&dep) {
                visit(dep_resource, by_binding, visited, visiting, sorted);
            }
        }

        visiting.remove(&binding);
        visited.insert(binding);
        sorted.push(resource.clone());
    }

    for resource in resources {
        visit(resource, &by_binding, &mut visited, &mut visiting, &mut sorted);
    }

    sorted
}

/// Keep sensitive attributes the API never returns
fn merge_sensitive(schema: Option<&ResourceSchema>, previous: &State, current: &mut State) {
    let Some(schema) = schema else {
        return;
    };
    for (name, value) in &previous.attributes {
        if schema.is_sensitive(name) && !current.attributes.contains_key(name) {
            current.attributes.insert(name.clone(), value.clone());
        }
    }
}

/// Result of reading every recorded resource and declared data source
struct Refreshed {
    /// Recorded resources as they are now, including ones that vanished
    managed: Vec<State>,
    /// Existing states by id, data sources included
    current: HashMap<ResourceId, State>,
}

async fn refresh(
    provider: &NimbusProvider,
    state_file: &StateFile,
    declared: &[Resource],
) -> Result<Refreshed, String> {
    let schemas = resource_schemas();
    let mut managed = Vec::new();
    let mut current = HashMap::new();

    for previous in state_file.states() {
        let mut state = provider
            .read(&previous.id, previous.identifier.as_deref())
            .await
            .map_err(|e| format!("Failed to refresh: {}", e))?;
        if state.exists {
            merge_sensitive(
                schemas.get(&previous.id.resource_type),
                &previous,
                &mut state,
            );
            current.insert(state.id.clone(), state.clone());
        } else {
            debug!("{} no longer exists", previous.id);
        }
        managed.push(state);
    }

    let mut bindings = Bindings::new();
    for state in current.values() {
        bindings.insert_state(state);
    }
    for resource in declared.iter().filter(|r| r.is_data_source()) {
        let resolved = bindings.resolve_resource(resource);
        if let Some(reference) = unresolved_reference(&resolved) {
            debug!(
                "deferring read of {} until ${{{}}} exists",
                resource.id, reference
            );
            continue;
        }
        let state = provider
            .read_data_source(&resolved)
            .await
            .map_err(|e| format!("Failed to read data source: {}", e))?;
        bindings.insert_state(&state);
        current.insert(state.id.clone(), state);
    }

    Ok(Refreshed { managed, current })
}

fn run_validate(path: &Path) -> Result<(), String> {
    let (_, declared) = load_project(path)?;
    let data = declared.iter().filter(|r| r.is_data_source()).count();
    println!("{}", "Configuration is valid.".green().bold());
    println!(
        "  {} resources, {} data sources",
        declared.len() - data,
        data
    );
    for resource in &declared {
        let kind = if resource.is_data_source() {
            "data".cyan()
        } else {
            "resource".normal()
        };
        println!("  {} {}", kind, resource.id);
    }
    Ok(())
}

async fn run_plan(path: &Path, credentials: &CredentialArgs) -> Result<(), String> {
    let (project, declared) = load_project(path)?;
    let provider = build_provider(&project, credentials)?;
    let backend = open_backend(&project).await?;
    let state_file = read_state_file(backend.as_ref()).await?;

    let refreshed = refresh(&provider, &state_file, &declared).await?;
    let plan = create_plan(&declared, &refreshed.current, &resource_schemas());
    print_plan(&plan);
    Ok(())
}

async fn run_apply(
    path: &Path,
    credentials: &CredentialArgs,
    auto_approve: bool,
) -> Result<(), String> {
    let (project, declared) = load_project(path)?;
    let provider = build_provider(&project, credentials)?;
    let backend = open_backend(&project).await?;

    with_lock(backend.as_ref(), "apply", || {
        apply_locked(provider, backend.as_ref(), &declared, auto_approve)
    })
    .await
}

async fn apply_locked(
    provider: NimbusProvider,
    backend: &dyn StateBackend,
    declared: &[Resource],
    auto_approve: bool,
) -> Result<(), String> {
    let mut state_file = read_state_file(backend).await?;
    let refreshed = refresh(&provider, &state_file, declared).await?;
    for state in &refreshed.managed {
        state_file.record(state);
    }

    let plan = create_plan(declared, &refreshed.current, &resource_schemas());
    print_plan(&plan);
    if !plan.has_changes() {
        return save_state(backend, &mut state_file).await;
    }

    println!();
    if !auto_approve && !confirm("Do you want to perform these actions?")? {
        println!();
        println!("{}", "Apply cancelled.".yellow());
        return Ok(());
    }

    println!("{}", "Applying changes...".cyan().bold());
    println!();

    let known: Vec<State> = refreshed.current.into_values().collect();
    let result = Interpreter::new(provider).apply(&plan, &known).await;
    record_outcomes(&plan, &result.outcomes, &mut state_file);
    save_state(backend, &mut state_file).await?;

    println!();
    let not_attempted = plan.effects().len() - result.outcomes.len();
    if result.is_success() {
        println!(
            "{}",
            format!(
                "Apply complete! {} changes applied.",
                plan.mutation_count()
            )
            .green()
            .bold()
        );
        Ok(())
    } else {
        Err(format!(
            "Apply failed. {} succeeded, {} failed, {} not attempted.",
            result.success_count, result.failure_count, not_attempted
        ))
    }
}

async fn run_refresh(path: &Path, credentials: &CredentialArgs) -> Result<(), String> {
    let (project, declared) = load_project(path)?;
    let provider = build_provider(&project, credentials)?;
    let backend = open_backend(&project).await?;

    with_lock(backend.as_ref(), "refresh", || async {
        let mut state_file = read_state_file(backend.as_ref()).await?;
        let refreshed = refresh(&provider, &state_file, &declared).await?;

        for state in &refreshed.managed {
            state_file.record(state);
            if state.exists {
                println!(
                    "  {} {} ({})",
                    "✓".green(),
                    state.id,
                    state.identifier.as_deref().unwrap_or("-")
                );
            } else {
                println!(
                    "  {} {} {}",
                    "-".red().bold(),
                    state.id,
                    "no longer exists, removed from state".red()
                );
            }
        }
        save_state(backend.as_ref(), &mut state_file).await?;

        println!();
        println!(
            "{}",
            format!("Refresh complete! {} resources tracked.", state_file.resources.len())
                .green()
                .bold()
        );
        Ok::<(), String>(())
    })
    .await
}

async fn run_destroy(
    path: &Path,
    credentials: &CredentialArgs,
    auto_approve: bool,
) -> Result<(), String> {
    let (project, declared) = load_project(path)?;
    let provider = build_provider(&project, credentials)?;
    let backend = open_backend(&project).await?;

    with_lock(backend.as_ref(), "destroy", || {
        destroy_locked(provider, backend.as_ref(), &declared, auto_approve)
    })
    .await
}

async fn destroy_locked(
    provider: NimbusProvider,
    backend: &dyn StateBackend,
    declared: &[Resource],
    auto_approve: bool,
) -> Result<(), String> {
    let mut state_file = read_state_file(backend).await?;
    let refreshed = refresh(&provider, &state_file, declared).await?;
    for state in &refreshed.managed {
        state_file.record(state);
    }

    let existing: Vec<State> = refreshed
        .managed
        .into_iter()
        .filter(|s| s.exists)
        .collect();
    let ordered = destroy_order(declared, existing);
    let plan = destroy_plan(&ordered);

    if plan.is_empty() {
        println!("{}", "No resources to destroy.".green());
        return save_state(backend, &mut state_file).await;
    }

    println!("{}", "Destroy Plan:".red().bold());
    println!();
    for effect in plan.effects() {
        println!("  {} {}", "-".red().bold(), effect.resource_id());
    }
    println!();
    println!(
        "Plan: {} to destroy.",
        plan.mutation_count().to_string().red()
    );
    println!();

    if !auto_approve {
        println!(
            "  {}",
            "This action cannot be undone. Type 'yes' to confirm.".yellow()
        );
        if !confirm("Do you really want to destroy all resources?")? {
            println!();
            println!("{}", "Destroy cancelled.".yellow());
            return Ok(());
        }
    }

    println!("{}", "Destroying resources...".red().bold());
    println!();

    let result = Interpreter::new(provider).apply(&plan, &[]).await;
    record_outcomes(&plan, &result.outcomes, &mut state_file);
    save_state(backend, &mut state_file).await?;

    println!();
    if result.is_success() {
        println!(
            "{}",
            format!(
                "Destroy complete! {} resources destroyed.",
                result.success_count
            )
            .green()
            .bold()
        );
        Ok(())
    } else {
        Err(format!(
            "Destroy failed. {} succeeded, {} failed.",
            result.success_count, result.failure_count
        ))
    }
}

/// Order states the way they were created: declared resources in
/// dependency order, then anything no longer declared. Deletion walks
/// this list backwards.
fn destroy_order(declared: &[Resource], states: Vec<State>) -> Vec<State> {
    let position: HashMap<&ResourceId, usize> = declared
        .iter()
        .enumerate()
        .map(|(i, r)| (&r.id, i))
        .collect();
    let mut states = states;
    states.sort_by_key(|s| (position.get(&s.id).copied().unwrap_or(usize::MAX), s.id.clone()));
    states
}

async fn run_state_list(path: &Path) -> Result<(), String> {
    let project = ProjectConfig::load(path).map_err(|e| e.to_string())?;
    let backend = open_backend(&project).await?;
    let state_file = read_state_file(backend.as_ref()).await?;

    if state_file.resources.is_empty() {
        println!("{}", "No resources recorded.".yellow());
        return Ok(());
    }
    for resource in &state_file.resources {
        println!(
            "{}  {}",
            resource.id(),
            resource.identifier.as_deref().unwrap_or("-").dimmed()
        );
    }
    println!();
    println!(
        "serial {}, lineage {}",
        state_file.serial, state_file.lineage
    );
    Ok(())
}

async fn run_force_unlock(path: &Path, lock_id: &str) -> Result<(), String> {
    let project = ProjectConfig::load(path).map_err(|e| e.to_string())?;
    let backend = open_backend(&project).await?;
    backend
        .force_unlock(lock_id)
        .await
        .map_err(|e| e.to_string())?;
    println!("{}", format!("Lock {} released.", lock_id).green());
    Ok(())
}

/// Apply interpreter outcomes to the state file. Data source reads are
/// never persisted.
fn record_outcomes(
    plan: &Plan,
    outcomes: &[Result<EffectOutcome, nimbus_core::provider::ProviderError>],
    state_file: &mut StateFile,
) {
    for (effect, outcome) in plan.effects().iter().zip(outcomes) {
        match outcome {
            Ok(outcome) => {
                println!("  {} {}", "✓".green(), effect);
                match outcome {
                    EffectOutcome::Read { .. } | EffectOutcome::Skipped { .. } => {}
                    EffectOutcome::Deleted { id } => {
                        state_file.remove(id);
                    }
                    EffectOutcome::Created { state }
                    | EffectOutcome::Updated { state }
                    | EffectOutcome::Replaced { state } => state_file.record(state),
                }
            }
            Err(e) => println!("  {} {} - {}", "✗".red(), effect, e),
        }
    }
}

async fn save_state(backend: &dyn StateBackend, state_file: &mut StateFile) -> Result<(), String> {
    state_file.increment_serial();
    backend
        .write_state(state_file)
        .await
        .map_err(|e| format!("Failed to write state to {}: {}", backend.describe(), e))
}

fn confirm(question: &str) -> Result<bool, String> {
    println!("{}", question.yellow().bold());
    print!("\n  Enter a value: ");
    std::io::Write::flush(&mut std::io::stdout()).map_err(|e| e.to_string())?;

    let mut input = String::new();
    std::io::stdin()
        .read_line(&mut input)
        .map_err(|e| e.to_string())?;
    println!();
    Ok(input.trim() == "yes")
}

fn print_plan(plan: &Plan) {
    if !plan.has_changes() {
        println!("{}", "No changes. Infrastructure is up-to-date.".green());
        return;
    }

    println!("{}", "Execution Plan:".cyan().bold());
    println!();

    let schemas = resource_schemas();

    for effect in plan.effects() {
        let symbol = match effect {
            Effect::Read(_) => effect.symbol().cyan().bold(),
            Effect::Create(_) => effect.symbol().green().bold(),
            Effect::Update { .. } => effect.symbol().yellow().bold(),
            Effect::Replace { .. } => effect.symbol().magenta().bold(),
            Effect::Delete { .. } => effect.symbol().red().bold(),
        };
        println!("  {} {}", symbol, effect.resource_id().to_string().bold());

        match effect {
            Effect::Read(_) => {}
            Effect::Create(resource) => {
                let schema = schemas.get(&resource.id.resource_type);
                let mut keys: Vec<_> = resource.attributes.keys().collect();
                keys.sort();
                for key in keys {
                    let shown = display_value(schema, key, &resource.attributes[key]);
                    println!("      {}: {}", key, shown.green());
                }
            }
            Effect::Update {
                from,
                to,
                changed_attributes,
                ..
            } => {
                let schema = schemas.get(&to.id.resource_type);
                for key in changed_attributes {
                    print_change(schema, key, from, to, "");
                }
            }
            Effect::Replace {
                from,
                to,
                forced_by,
            } => {
                let schema = schemas.get(&to.id.resource_type);
                for key in forced_by {
                    print_change(
                        schema,
                        key,
                        from,
                        to,
                        " (forces replacement)",
                    );
                }
            }
            Effect::Delete { identifier, .. } => {
                println!("      id: {}", identifier.red());
            }
        }
    }

    println!();
    let summary = plan.summary();
    println!(
        "Plan: {} to create, {} to update, {} to replace, {} to delete.",
        summary.create.to_string().green(),
        summary.update.to_string().yellow(),
        summary.replace.to_string().magenta(),
        summary.delete.to_string().red()
    );
}

fn print_change(
    schema: Option<&ResourceSchema>,
    key: &str,
    from: &State,
    to: &Resource,
    note: &str,
) {
    let old = from
        .attributes
        .get(key)
        .map(|v| display_value(schema, key, v))
        .unwrap_or_else(|| "(none)".to_string());
    let new = to
        .attributes
        .get(key)
        .map(|v| display_value(schema, key, v))
        .unwrap_or_else(|| "(none)".to_string());
    println!(
        "      {}: {} → {}{}",
        key,
        old.red(),
        new.green(),
        note.magenta()
    );
}

fn display_value(schema: Option<&ResourceSchema>, key: &str, value: &Value) -> String {
    if schema.is_some_and(|s| s.is_sensitive(key)) {
        return "(sensitive)".to_string();
    }
    format_value(value)
}

fn format_value(value: &Value) -> String {
    match value {
        Value::String(s) => format!("\"{}\"", s),
        Value::Int(n) => n.to_string(),
        Value::Float(f) => f.to_string(),
        Value::Bool(b) => b.to_string(),
        Value::List(items) => {
            let strs: Vec<_> = items.iter().map(format_value).collect();
            format!("[{}]", strs.join(", "))
        }
        Value::Map(map) => {
            let mut strs: Vec<_> = map
                .iter()
                .map(|(k, v)| format!("{}: {}", k, format_value(v)))
                .collect();
            strs.sort();
            format!("{{{}}}", strs.join(", "))
        }
        Value::ResourceRef(binding, attr) => format!("(known after apply: {}.{})", binding, attr),
    }
}
