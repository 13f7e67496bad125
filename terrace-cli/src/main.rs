mod display;
mod file_provider;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use colored::Colorize;

use terrace_core::dependency::sort_resources;
use terrace_core::differ::{create_plan, destroy_plan};
use terrace_core::interpreter::{CancelToken, Interpreter, InterpreterConfig};
use terrace_core::loader::{Config, LoadOptions, Loader};
use terrace_core::output::{bind_output, bind_outputs};
use terrace_core::plan::Plan;
use terrace_core::provider::Provider;
use terrace_core::refresh::refresh_states;
use terrace_core::resource::{ResourceId, State};
use terrace_core::schema::SchemaRegistry;
use terrace_core::store::StateStore;
use terrace_provider_aws::{AwsProvider, region_from_settings};
use terrace_state::{BackendStore, StateBackend, backend_for};

use display::{print_outputs, print_plan, print_report};
use file_provider::FileProvider;

/// Exit code of `plan` when the plan has changes
const EXIT_CHANGES: i32 = 2;

#[derive(Parser)]
#[command(name = "terrace")]
#[command(about = "A declarative provisioning engine", long_about = None)]
struct Cli {
    /// More log output (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Set a variable (repeatable)
    #[arg(long = "var", value_name = "NAME=VALUE", value_parser = parse_var, global = true)]
    vars: Vec<(String, String)>,

    /// Use the file-based local provider instead of the configured one
    #[arg(long, global = true)]
    offline: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate the configuration
    Validate {
        /// Path to a .trc file or a directory of them
        #[arg(default_value = ".")]
        path: PathBuf,
    },
    /// Show execution plan without applying changes
    ///
    /// Exits with 0 when there is nothing to do, 2 when there are changes.
    Plan {
        /// Path to a .trc file or a directory of them
        #[arg(default_value = ".")]
        path: PathBuf,

        /// Read every recorded object back before planning: vanished objects
        /// are recreated and arguments changed outside Terrace are updated
        #[arg(long)]
        refresh: bool,
    },
    /// Apply changes to reach the desired state
    Apply {
        /// Path to a .trc file or a directory of them
        #[arg(default_value = ".")]
        path: PathBuf,

        /// Read every recorded object back before planning: vanished objects
        /// are recreated and arguments changed outside Terrace are updated
        #[arg(long)]
        refresh: bool,

        /// Maximum number of operations in flight
        #[arg(long, default_value_t = 10)]
        parallelism: usize,
    },
    /// Destroy every resource recorded in state
    Destroy {
        /// Path to a .trc file or a directory of them
        #[arg(default_value = ".")]
        path: PathBuf,

        /// Skip confirmation prompt (auto-approve)
        #[arg(long)]
        auto_approve: bool,
    },
    /// Print declared outputs
    Output {
        /// Output to print; all outputs when omitted
        name: Option<String>,

        /// Path to a .trc file or a directory of them
        #[arg(long, default_value = ".")]
        path: PathBuf,

        /// Print as JSON (sensitive values included)
        #[arg(long)]
        json: bool,
    },
    /// Remove a state lock left behind by an interrupted run
    ForceUnlock {
        lock_id: String,

        /// Path to a .trc file or a directory of them
        #[arg(long, default_value = ".")]
        path: PathBuf,
    },
}

fn parse_var(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((name, value)) if !name.trim().is_empty() => {
            Ok((name.trim().to_string(), value.to_string()))
        }
        _ => Err(format!("expected NAME=VALUE, got '{}'", s)),
    }
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let ctx = Context {
        vars: cli.vars,
        offline: cli.offline,
    };

    let result = match cli.command {
        Commands::Validate { path } => ctx.run_validate(&path),
        Commands::Plan { path, refresh } => ctx.run_plan(&path, refresh).await,
        Commands::Apply {
            path,
            refresh,
            parallelism,
        } => ctx.run_apply(&path, refresh, parallelism).await,
        Commands::Destroy { path, auto_approve } => ctx.run_destroy(&path, auto_approve).await,
        Commands::Output { name, path, json } => ctx.run_output(&path, name.as_deref(), json).await,
        Commands::ForceUnlock { lock_id, path } => ctx.run_force_unlock(&path, &lock_id).await,
    };

    match result {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("{} {}", "Error:".red().bold(), e);
            std::process::exit(1);
        }
    }
}

/// Cancel `token` on Ctrl-C; a second Ctrl-C exits without waiting
fn cancel_on_interrupt(token: CancelToken) {
    tokio::spawn(async move {
        let interrupted = || async { tokio::signal::ctrl_c().await.is_ok() };
        if interrupt_twice(interrupted, token).await {
            eprintln!("{}", "Second interrupt received, exiting".red());
            std::process::exit(1);
        }
    });
}

/// Cancel `token` on the first interrupt; true once a second one arrives
async fn interrupt_twice<F, Fut>(mut interrupted: F, token: CancelToken) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    if !interrupted().await {
        return false;
    }
    eprintln!(
        "{}",
        "Interrupt received, waiting for in-flight operations (Ctrl-C again to exit)...".yellow()
    );
    token.cancel();
    interrupted().await
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
    println!();
    Ok(input.trim() == "yes")
}

/// Settings shared by every command
struct Context {
    vars: Vec<(String, String)>,
    offline: bool,
}

impl Context {
    fn load(&self, path: &Path, schemas: &SchemaRegistry) -> Result<Config, String> {
        let mut options = LoadOptions::from_process_env();
        for (name, value) in &self.vars {
            options = options.with_override(name.clone(), value.clone());
        }
        Loader::new(schemas, options)
            .load_path(path)
            .map_err(|e| e.to_string())
    }

    async fn provider(&self, config: &Config) -> Box<dyn Provider> {
        match config.provider("aws") {
            Some(settings) if !self.offline => {
                let region = region_from_settings(Some(settings));
                println!(
                    "{}",
                    format!("Using AWS provider (region: {})", region).cyan()
                );
                Box::new(AwsProvider::new(&region).await)
            }
            _ => {
                println!("{}", "Using file-based local provider".cyan());
                Box::new(FileProvider::new(terrace_provider_aws::schemas()))
            }
        }
    }

    async fn working_states(
        &self,
        config: &Config,
        states: HashMap<ResourceId, State>,
        refresh: bool,
    ) -> Result<HashMap<ResourceId, State>, String> {
        if !refresh || states.is_empty() {
            return Ok(states);
        }
        println!("{}", "Refreshing state...".cyan());
        let provider = self.provider(config).await;
        refresh_states(provider.as_ref(), states)
            .await
            .map_err(|e| format!("Failed to refresh state: {}", e))
    }

    fn run_validate(&self, path: &Path) -> Result<i32, String> {
        let schemas = terrace_provider_aws::schemas();
        println!("{}", "Validating...".cyan());
        let config = self.load(path, &schemas)?;
        let sorted = sort_resources(config.resources).map_err(|e| e.to_string())?;

        println!(
            "{}",
            format!("✓ {} resources validated successfully.", sorted.len())
                .green()
                .bold()
        );
        for resource in &sorted {
            println!("  • {}", resource.id);
        }
        Ok(0)
    }

    async fn run_plan(&self, path: &Path, refresh: bool) -> Result<i32, String> {
        let schemas = terrace_provider_aws::schemas();
        let config = self.load(path, &schemas)?;

        let backend = backend_for(config.backend.as_ref())
            .await
            .map_err(|e| e.to_string())?;
        let store = BackendStore::open_read_only(backend)
            .await
            .map_err(|e| e.to_string())?;
        let states = store.snapshot().await.map_err(|e| e.to_string())?;
        let states = self.working_states(&config, states, refresh).await?;

        let plan = create_plan(&config.resources, &states, &schemas).map_err(|e| e.to_string())?;
        print_plan(&plan);

        Ok(if plan.summary().has_changes() {
            EXIT_CHANGES
        } else {
            0
        })
    }

    async fn run_apply(&self, path: &Path, refresh: bool, parallelism: usize) -> Result<i32, String> {
        let schemas = terrace_provider_aws::schemas();
        let config = self.load(path, &schemas)?;

        let backend = backend_for(config.backend.as_ref())
            .await
            .map_err(|e| e.to_string())?;
        let store = Arc::new(
            BackendStore::open(backend, "apply")
                .await
                .map_err(|e| e.to_string())?,
        );

        let result = self
            .apply_locked(&config, &schemas, store.clone(), refresh, parallelism)
            .await;
        if let Err(e) = store.close().await {
            log::error!("Failed to release state lock: {}", e);
        }
        result
    }

    async fn apply_locked(
        &self,
        config: &Config,
        schemas: &SchemaRegistry,
        store: Arc<BackendStore>,
        refresh: bool,
        parallelism: usize,
    ) -> Result<i32, String> {
        let states = store.snapshot().await.map_err(|e| e.to_string())?;
        let states = self.working_states(config, states, refresh).await?;
        let plan = create_plan(&config.resources, &states, schemas).map_err(|e| e.to_string())?;

        if !plan.summary().has_changes() {
            println!("{}", "No changes needed.".green());
            self.print_bound_outputs(config, store.as_ref()).await;
            return Ok(0);
        }

        print_plan(&plan);
        println!();
        println!("{}", "Applying changes...".cyan().bold());
        println!();

        let succeeded = self
            .execute(config, &plan, store.clone(), parallelism, "Apply")
            .await;
        if succeeded {
            self.print_bound_outputs(config, store.as_ref()).await;
            Ok(0)
        } else {
            Ok(1)
        }
    }

    /// Run a plan against the store; true when every step succeeded
    async fn execute(
        &self,
        config: &Config,
        plan: &Plan,
        store: Arc<BackendStore>,
        parallelism: usize,
        verb: &str,
    ) -> bool {
        let provider = self.provider(config).await;
        let interpreter = Interpreter::new(provider).with_config(InterpreterConfig {
            max_parallelism: parallelism,
            ..InterpreterConfig::default()
        });
        cancel_on_interrupt(interpreter.cancel_token());

        let result = interpreter.apply(plan, store).await;
        print_report(&result, verb);
        result.is_success()
    }

    async fn print_bound_outputs(&self, config: &Config, store: &BackendStore) {
        if config.outputs.is_empty() {
            return;
        }
        let states = match store.snapshot().await {
            Ok(states) => states,
            Err(e) => {
                log::error!("Failed to read state for outputs: {}", e);
                return;
            }
        };
        match bind_outputs(&config.outputs, &config.resources, &states) {
            Ok(outputs) => print_outputs(&outputs),
            Err(e) => eprintln!("{} {}", "Warning:".yellow().bold(), e),
        }
    }

    async fn run_destroy(&self, path: &Path, auto_approve: bool) -> Result<i32, String> {
        let schemas = terrace_provider_aws::schemas();
        let config = self.load(path, &schemas)?;

        let backend = backend_for(config.backend.as_ref())
            .await
            .map_err(|e| e.to_string())?;
        let store = Arc::new(
            BackendStore::open(backend, "destroy")
                .await
                .map_err(|e| e.to_string())?,
        );

        let result = self.destroy_locked(&config, store.clone(), auto_approve).await;
        if let Err(e) = store.close().await {
            log::error!("Failed to release state lock: {}", e);
        }
        result
    }

    async fn destroy_locked(
        &self,
        config: &Config,
        store: Arc<BackendStore>,
        auto_approve: bool,
    ) -> Result<i32, String> {
        let states = store.snapshot().await.map_err(|e| e.to_string())?;
        if states.is_empty() {
            println!("{}", "No resources to destroy.".green());
            return Ok(0);
        }

        let plan = destroy_plan(&states).map_err(|e| e.to_string())?;
        print_plan(&plan);
        println!();

        if !auto_approve && !confirm("Do you really want to destroy all resources?")? {
            println!("{}", "Destroy cancelled.".yellow());
            return Ok(0);
        }

        println!("{}", "Destroying resources...".red().bold());
        println!();
        let succeeded = self
            .execute(config, &plan, store, InterpreterConfig::default().max_parallelism, "Destroy")
            .await;
        Ok(if succeeded { 0 } else { 1 })
    }

    async fn run_output(&self, path: &Path, name: Option<&str>, json: bool) -> Result<i32, String> {
        let schemas = terrace_provider_aws::schemas();
        let config = self.load(path, &schemas)?;

        let backend = backend_for(config.backend.as_ref())
            .await
            .map_err(|e| e.to_string())?;
        let store = BackendStore::open_read_only(backend)
            .await
            .map_err(|e| e.to_string())?;
        let states = store.snapshot().await.map_err(|e| e.to_string())?;

        match name {
            Some(name) => {
                let output = bind_output(name, &config.outputs, &config.resources, &states)
                    .map_err(|e| e.to_string())?;
                if json {
                    println!("{}", output.to_json());
                } else {
                    println!("{}", output.display_value());
                }
            }
            None => {
                let outputs = bind_outputs(&config.outputs, &config.resources, &states)
                    .map_err(|e| e.to_string())?;
                if json {
                    let map: serde_json::Map<String, serde_json::Value> = outputs
                        .iter()
                        .map(|(k, v)| (k.clone(), v.to_json()))
                        .collect();
                    println!(
                        "{}",
                        serde_json::to_string_pretty(&map).map_err(|e| e.to_string())?
                    );
                } else {
                    for (name, output) in &outputs {
                        println!("{} = {}", name, output.display_value());
                    }
                }
            }
        }
        Ok(0)
    }

    async fn run_force_unlock(&self, path: &Path, lock_id: &str) -> Result<i32, String> {
        let schemas = terrace_provider_aws::schemas();
        let config = self.load(path, &schemas)?;

        let backend = backend_for(config.backend.as_ref())
            .await
            .map_err(|e| e.to_string())?;
        backend
            .force_unlock(lock_id)
            .await
            .map_err(|e| e.to_string())?;

        println!(
            "{}",
            format!("Lock {} on {} removed.", lock_id, backend.location())
                .green()
                .bold()
        );
        Ok(0)
    }
}
