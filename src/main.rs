//! Stackwarden CLI entrypoint.
//!
//! This is the main entrypoint for the stackwarden command-line tool.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use stackwarden::cli::{
    Cli, Commands, ConsoleSink, LogFormat, OutputFormat, OutputFormatter, StateCommands,
};
use stackwarden::config::{
    ConfigParser, ConfigValidator, PASSPHRASE_ENV, StackConfig, StateBackend, find_config_file,
};
use stackwarden::credentials::{
    BrokerSettings, CredentialBroker, StsTrustExchange, TrustParams, source_from_config,
};
use stackwarden::error::{ConfigError, Result, WardenError};
use stackwarden::orchestrator::{Orchestrator, PassReport};
use stackwarden::planner::OperationOutcome;
use stackwarden::provider::{BUCKET_TYPE, BucketAdapter, ProviderRegistry};
use stackwarden::reconciler::RefreshStatus;
use stackwarden::state::{LocalStateStore, Passphrase, S3StateStore, STATE_DIR, StateStore};

use clap::Parser;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

/// Main entrypoint.
fn main() -> ExitCode {
    let cli = Cli::parse();

    // Initialize logging
    init_logging(cli.verbose, cli.log_format);

    // Run async runtime
    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("Failed to create async runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(run(cli)) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error [{}]: {e}", e.kind());
            ExitCode::FAILURE
        }
    }
}

/// Initializes the logging system. `RUST_LOG` wins over `--verbose`.
fn init_logging(verbose: bool, format: LogFormat) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

/// Main async entry point.
async fn run(cli: Cli) -> Result<ExitCode> {
    let formatter = OutputFormatter::new(cli.output);
    let command = cli.command();

    let (config, config_file) = load_config(cli.config.as_ref())?;
    let store = create_state_store(&config, &config_file).await?;
    let orchestrator = build_orchestrator(config, store, cli.output)?;

    match command {
        Commands::Up => run_pass(&orchestrator, &formatter, PassVerb::Up).await,
        Commands::Refresh => run_pass(&orchestrator, &formatter, PassVerb::Refresh).await,
        Commands::Destroy { yes } => {
            let plan = orchestrator.preview_destroy().await?;
            if plan.is_empty() {
                eprintln!("No resources recorded for '{}'.", orchestrator.stack_id());
            } else {
                eprintln!("{}", formatter.format_plan(&plan));
            }
            if !yes && !confirm("This action is IRREVERSIBLE. Type 'destroy' to confirm: ", "destroy")? {
                eprintln!("Destroy cancelled.");
                return Ok(ExitCode::SUCCESS);
            }
            run_pass(&orchestrator, &formatter, PassVerb::Destroy).await
        }
        Commands::Preview { destroy } => {
            let plan = if destroy {
                orchestrator.preview_destroy().await?
            } else {
                orchestrator.preview().await?
            };
            println!("{}", formatter.format_plan(&plan));
            Ok(ExitCode::SUCCESS)
        }
        Commands::State { command } => cmd_state(&orchestrator, command, &formatter).await,
    }
}

#[derive(Debug, Clone, Copy)]
enum PassVerb {
    Up,
    Refresh,
    Destroy,
}

/// Runs one mutating pass, cancelling it on Ctrl-C.
async fn run_pass(
    orchestrator: &Orchestrator,
    formatter: &OutputFormatter,
    verb: PassVerb,
) -> Result<ExitCode> {
    let cancel = orchestrator.cancellation_token();
    let watcher = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received; waiting for in-flight operations");
            cancel.cancel();
        }
    });

    let outcome = match verb {
        PassVerb::Up => orchestrator.up().await,
        PassVerb::Refresh => orchestrator.refresh().await,
        PassVerb::Destroy => orchestrator.destroy().await,
    };
    watcher.abort();

    let report = outcome?;
    println!("{}", formatter.format_report(&report));

    if report.success() {
        Ok(ExitCode::SUCCESS)
    } else {
        report_failures(&report);
        Ok(ExitCode::FAILURE)
    }
}

/// Names every failing resource and its error kind on stderr.
fn report_failures(report: &PassReport) {
    if let Some(kind) = report.failure_kind() {
        eprintln!("Pass failed [{kind}]: {}", report.failure_summary());
    }
    if let Some(refresh) = &report.refresh {
        for entry in &refresh.entries {
            if let RefreshStatus::Unreadable { kind, .. } = &entry.status {
                eprintln!("  {} [{kind}]", entry.name);
            }
        }
    }
    for result in report.execution.failures() {
        if let OperationOutcome::Failed { kind, .. } = &result.outcome {
            eprintln!("  {} [{kind}]", result.name);
        }
    }
}

/// State management commands.
async fn cmd_state(
    orchestrator: &Orchestrator,
    command: StateCommands,
    formatter: &OutputFormatter,
) -> Result<ExitCode> {
    match command {
        StateCommands::Show => {
            let state = orchestrator.stored_state().await?;
            if state.sequence == 0 && state.is_empty() {
                eprintln!("No state found for '{}'.", orchestrator.stack_id());
            } else {
                println!("{}", formatter.format_state(&state));
            }
        }
        StateCommands::Unlock { force } => {
            let stack = orchestrator.stack_id();
            let lock = orchestrator.lock_info().await?;
            println!("{}", formatter.format_lock(&stack, lock.as_ref()));
            if force && lock.is_some() {
                if orchestrator.force_unlock().await? {
                    eprintln!("State forcefully unlocked.");
                }
            } else if lock.is_some() {
                eprintln!("Use --force to remove the lock.");
            }
        }
    }
    Ok(ExitCode::SUCCESS)
}

// ============================================================================
// Helper Functions
// ============================================================================

/// Resolves the configuration file path.
fn resolve_config_path(config_path: Option<&PathBuf>) -> Result<PathBuf> {
    config_path.map_or_else(|| find_config_file("."), |path| Ok(path.clone()))
}

/// Loads `.env`, the stack file and environment overrides, then validates.
fn load_config(config_path: Option<&PathBuf>) -> Result<(StackConfig, PathBuf)> {
    let config_file = resolve_config_path(config_path)?;
    debug!("Loading configuration from: {}", config_file.display());

    let parser = ConfigParser::new().with_base_path(config_dir(&config_file));
    parser.load_dotenv()?;

    let config = parser.load_with_env(&config_file)?;
    ConfigValidator::new().validate(&config)?;

    Ok((config, config_file))
}

fn config_dir(config_file: &Path) -> PathBuf {
    config_file
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."))
        .to_path_buf()
}

/// Reads the state passphrase, if one is configured.
fn state_passphrase() -> Result<Option<Passphrase>> {
    match ConfigParser::state_passphrase() {
        Ok(value) => Passphrase::new(value).map(Some),
        Err(_) => {
            debug!("{PASSPHRASE_ENV} not set; sensitive values cannot be stored");
            Ok(None)
        }
    }
}

/// Creates the state store named by the configuration.
async fn create_state_store(
    config: &StackConfig,
    config_file: &Path,
) -> Result<Arc<dyn StateStore>> {
    let passphrase = state_passphrase()?;

    let store: Arc<dyn StateStore> = match config.state.backend {
        StateBackend::Local => {
            let path = config
                .state
                .path
                .as_ref()
                .map_or_else(|| config_dir(config_file).join(STATE_DIR), PathBuf::from);
            let mut store = LocalStateStore::with_base_dir(path);
            if let Some(passphrase) = passphrase {
                store = store.with_passphrase(passphrase);
            }
            Arc::new(store)
        }
        StateBackend::S3 => {
            let bucket = config.state.bucket.as_deref().ok_or_else(|| {
                WardenError::Config(ConfigError::ValidationError {
                    message: String::from("S3 bucket not configured"),
                    field: Some(String::from("state.bucket")),
                })
            })?;
            let mut store = S3StateStore::new(
                bucket,
                config.state.prefix.as_deref(),
                config.state.region.as_deref(),
            )
            .await;
            if let Some(passphrase) = passphrase {
                store = store.with_passphrase(passphrase);
            }
            Arc::new(store)
        }
    };

    info!("Using {} state backend", store.backend_type());
    Ok(store)
}

/// Wires the credential broker, provider registry and progress sink.
fn build_orchestrator(
    config: StackConfig,
    store: Arc<dyn StateStore>,
    output: OutputFormat,
) -> Result<Orchestrator> {
    let credentials = &config.credentials;

    let mut exchange = StsTrustExchange::new()?;
    if let Some(endpoint) = &credentials.endpoint {
        exchange = exchange.with_endpoint(endpoint.clone());
    }
    let broker = CredentialBroker::new(
        Arc::from(source_from_config(&credentials.token)),
        Arc::new(exchange),
        TrustParams::from(credentials),
    )
    .with_settings(BrokerSettings::from(credentials));

    let registry = ProviderRegistry::new().with(BUCKET_TYPE, Arc::new(BucketAdapter::new()));

    Ok(
        Orchestrator::new(config, store, Arc::new(broker), registry)
            .with_sink(Arc::new(ConsoleSink::new(output))),
    )
}

/// Asks for confirmation on stderr. Returns true if `expected` was typed.
fn confirm(prompt: &str, expected: &str) -> Result<bool> {
    eprint!("{prompt}");
    std::io::stderr().flush()?;

    let mut input = String::new();
    std::io::stdin().read_line(&mut input)?;
    Ok(input.trim() == expected)
}
