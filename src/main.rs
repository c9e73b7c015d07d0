//! modshard CLI - test-module sharding across devices.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use modshard::config::{self, Config};
use modshard::invocation::Invocation;
use modshard::module::loader::ModuleLoader;
use modshard::options::SchedulingOptions;
use modshard::report::print_summary;
use modshard::repository::{InitRequest, ModuleRepository};
use modshard::retry::store::{JsonResultStore, ResultStore};

#[derive(Parser)]
#[command(name = "modshard")]
#[command(about = "Shard test modules across devices", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "modshard.toml")]
    config: PathBuf,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run modules across the configured devices
    Run {
        #[command(flatten)]
        options: SchedulingOptions,
    },

    /// List the module instances a run would schedule, without devices
    ListModules {
        #[command(flatten)]
        options: SchedulingOptions,
    },

    /// List stored invocations
    ListResults,

    /// Validate the configuration file and module declarations
    Validate,

    /// Write a starter configuration file
    Init,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    match cli.command {
        Commands::Run { options } => run(&cli.config, options).await,
        Commands::ListModules { options } => list_modules(&cli.config, &options),
        Commands::ListResults => list_results(&cli.config),
        Commands::Validate => validate_config(&cli.config),
        Commands::Init => init_config(&cli.config),
    }
}

/// Loads the config file, or the defaults when it does not exist.
fn load_or_default(path: &Path) -> Result<Config> {
    if path.exists() {
        let config = config::load_config(path)?;
        info!("Loaded configuration from {}", path.display());
        Ok(config)
    } else {
        info!("{} not found, using defaults", path.display());
        Ok(Config::default())
    }
}

async fn run(config_path: &Path, options: SchedulingOptions) -> Result<()> {
    let config = load_or_default(config_path)?;
    let outcome = Invocation::new(config, options).run().await?;
    print_summary(&outcome.record, &outcome.shards);
    std::process::exit(outcome.exit_code());
}

fn list_modules(config_path: &Path, options: &SchedulingOptions) -> Result<()> {
    let config = load_or_default(config_path)?;
    options.validate()?;

    let variants = if !options.abis.is_empty() {
        options.abis.clone()
    } else if !config.harness.architectures.is_empty() {
        config.harness.architectures.clone()
    } else {
        bail!("No architecture given; pass --abi or set harness.architectures");
    };

    let request = InitRequest {
        shard_count: 1,
        source_dir: config.harness.expanded_source_dir(),
        variants,
        test_args: options.test_args.clone(),
        module_args: options.module_args.clone(),
        include_filters: options.effective_include_filters(),
        exclude_filters: options.exclude_filters.clone(),
        ..Default::default()
    };
    let repository = ModuleRepository::new();
    repository.initialize(&request, &config.harness.module_loader())?;

    let modules = repository.pending_modules()?;
    println!("{} module instances:", modules.len());
    for module in &modules {
        let tokens = if module.required_tokens.is_empty() {
            String::new()
        } else {
            let names: Vec<&str> = module.required_tokens.iter().map(String::as_str).collect();
            format!(" [tokens: {}]", names.join(", "))
        };
        println!(
            "  {} ({:?}, ~{}s){}",
            module.display_name(),
            module.bucket(),
            module.runtime_hint.as_secs(),
            tokens
        );
    }
    Ok(())
}

fn list_results(config_path: &Path) -> Result<()> {
    let config = load_or_default(config_path)?;
    let store = JsonResultStore::new(config.harness.expanded_results_dir());

    let ids = store.list()?;
    if ids.is_empty() {
        println!("No invocations in {}", store.root().display());
        return Ok(());
    }

    for id in ids {
        let Some(record) = store.load(&id)? else {
            continue;
        };
        let (passed, failed, skipped) = record.counts();
        let retry = record
            .retry_of
            .as_deref()
            .map(|prior| format!(" (retry of {})", prior))
            .unwrap_or_default();
        println!(
            "{}  {}  modules={} passed={} failed={} skipped={}{}",
            record.invocation_id,
            record.build_fingerprint,
            record.modules.len(),
            console::style(passed).green(),
            console::style(failed).red(),
            console::style(skipped).yellow(),
            retry
        );
    }
    Ok(())
}

fn validate_config(config_path: &Path) -> Result<()> {
    let config = match config::load_config(config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Configuration error: {:#}", e);
            std::process::exit(1);
        }
    };

    let source_dir = config.harness.expanded_source_dir();
    let declarations = config
        .harness
        .module_loader()
        .load(&source_dir)
        .with_context(|| format!("Invalid module declarations in {}", source_dir.display()))?;

    println!("Configuration is valid!");
    println!();
    println!("Settings:");
    match config.harness.shard_count {
        Some(count) => println!("  Shards: {}", count),
        None => println!("  Shards: one per device"),
    }
    println!("  Devices: {}", config.devices.len());
    for device in &config.devices {
        if device.tokens.is_empty() {
            println!("    {}", device.serial);
        } else {
            println!("    {} [tokens: {}]", device.serial, device.tokens.join(", "));
        }
    }
    println!("  Modules: {} in {}", declarations.len(), source_dir.display());
    let gated = declarations
        .iter()
        .filter(|d| !d.required_tokens().is_empty())
        .count();
    if gated > 0 {
        println!("    {} token-gated", gated);
    }
    println!("  Results: {}", config.harness.expanded_results_dir().display());
    println!(
        "  Reboots: {}",
        if config.coordinator.disable_reboot {
            "disabled"
        } else {
            "enabled"
        }
    );
    println!(
        "  Health checkers: {}",
        config.coordinator.enabled_health_checkers().join(", ")
    );

    Ok(())
}

const STARTER_CONFIG: &str = r#"# modshard configuration file

[harness]
source_dir = "modules"
results_dir = "results"
# shard_count = 2
# architectures = ["arm64-v8a"]
# step_timeout_secs = 300

[[devices]]
serial = "emulator-5554"
# tokens = ["sim-card"]

[coordinator]
disable_reboot = false
health_checkers = ["boot-completed"]

[report]
output_dir = "test-results"
junit = true
junit_file = "junit.xml"
"#;

fn init_config(path: &Path) -> Result<()> {
    if path.exists() {
        eprintln!(
            "{} already exists. Remove it first or edit manually.",
            path.display()
        );
        std::process::exit(1);
    }

    std::fs::write(path, STARTER_CONFIG)?;
    println!("Created {}", path.display());
    println!();
    println!("Add module declarations under modules/, then run:");
    println!("  modshard run");

    Ok(())
}
