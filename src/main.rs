//! Stackwright CLI entrypoint.
//!
//! This is the main entrypoint for the stackwright command-line tool.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use stackwright::cli::{Cli, Commands, MessageLevel, OutputFormat, OutputFormatter, StateCommands};
use stackwright::config::{
    DescriptionParser, DescriptionValidator, ProviderKind, StackDescription, StateBackend,
    find_config_file,
};
use stackwright::error::{Result, StackError};
use stackwright::planner::ApplyReport;
use stackwright::provider::{HttpProvider, Provider, SandboxProvider};
use stackwright::reconciler::Reconciler;
use stackwright::state::{LocalStateStore, S3StateStore, STATE_DIR, StateStore, generate_holder_id};

use colored::Colorize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

/// Exit code for a run that left state partially applied.
const EXIT_APPLY_FAILED: u8 = 2;

/// Main entrypoint.
fn main() -> ExitCode {
    let cli = Cli::parse_args();

    // Initialize logging
    init_logging(cli.verbose, cli.log_json);

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
            eprintln!("{} {e}", "Error:".red().bold());
            ExitCode::from(e.exit_code())
        }
    }
}

/// Initializes the logging system.
fn init_logging(verbose: bool, json: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Main async entry point.
async fn run(cli: Cli) -> Result<ExitCode> {
    let formatter = OutputFormatter::new(cli.output);
    let config = cli.config.as_deref();

    match cli.command {
        Commands::Init { path, force } => cmd_init(&path, force),
        Commands::Validate { warnings } => cmd_validate(config, warnings, &formatter),
        Commands::Graph => cmd_graph(config, &formatter).await,
        Commands::Plan { detailed } => cmd_plan(config, detailed, &formatter).await,
        Commands::Apply { yes } => cmd_apply(config, yes, &formatter).await,
        Commands::Destroy { yes } => cmd_destroy(config, yes, &formatter).await,
        Commands::State { command } => cmd_state(config, command, &formatter).await,
    }
}

/// Initialize a new stack directory.
fn cmd_init(path: &Path, force: bool) -> Result<ExitCode> {
    info!("Initializing new stack in: {}", path.display());

    let config_path = path.join("stackwright.yaml");
    let env_path = path.join(".env.example");
    let gitignore_path = path.join(".gitignore");

    if !force && config_path.exists() {
        eprintln!("Stack description already exists: {}", config_path.display());
        eprintln!("Use --force to overwrite.");
        return Ok(ExitCode::from(1));
    }

    if !path.exists() {
        std::fs::create_dir_all(path)?;
    }

    std::fs::write(&config_path, include_str!("../templates/stackwright.yaml"))?;
    eprintln!("Created: {}", config_path.display());

    std::fs::write(&env_path, include_str!("../templates/.env.example"))?;
    eprintln!("Created: {}", env_path.display());

    let state_entry = format!("{STATE_DIR}/");
    if gitignore_path.exists() {
        let existing = std::fs::read_to_string(&gitignore_path)?;
        let has_env = existing.lines().any(|l| l.trim() == ".env");
        let has_state = existing.lines().any(|l| l.trim() == state_entry);

        if !has_env || !has_state {
            let mut file = std::fs::OpenOptions::new()
                .append(true)
                .open(&gitignore_path)?;
            writeln!(file, "\n# Stackwright")?;
            if !has_env {
                writeln!(file, ".env")?;
            }
            if !has_state {
                writeln!(file, "{state_entry}")?;
            }
            eprintln!("Updated: {}", gitignore_path.display());
        }
    } else {
        std::fs::write(&gitignore_path, format!(".env\n{state_entry}\n"))?;
        eprintln!("Created: {}", gitignore_path.display());
    }

    eprintln!("\nStack initialized successfully!");
    eprintln!("Next steps:");
    eprintln!("  1. Copy .env.example to .env if you use the http provider or s3 state");
    eprintln!("  2. Edit stackwright.yaml to describe your resources");
    eprintln!("  3. Run 'stackwright validate' to check the description");
    eprintln!("  4. Run 'stackwright plan' to see what will change");
    eprintln!("  5. Run 'stackwright apply' to provision");

    Ok(ExitCode::SUCCESS)
}

/// Validate the stack description.
fn cmd_validate(
    config_path: Option<&Path>,
    show_warnings: bool,
    formatter: &OutputFormatter,
) -> Result<ExitCode> {
    let config_file = resolve_config_path(config_path)?;
    info!("Validating stack description: {}", config_file.display());

    let parser = DescriptionParser::new().with_base_path(base_dir(&config_file));
    parser.load_dotenv()?;
    let description = parser.load_with_env(&config_file)?;

    let result = DescriptionValidator::new().check(&description);
    emit(
        formatter,
        &formatter.format_validation(&description, &result, show_warnings),
    );

    if result.is_valid() {
        Ok(ExitCode::SUCCESS)
    } else {
        Ok(ExitCode::from(1))
    }
}

/// Print the resolved dependency order.
async fn cmd_graph(config_path: Option<&Path>, formatter: &OutputFormatter) -> Result<ExitCode> {
    let workspace = Workspace::open(config_path).await?;
    let reconciler = workspace.reconciler();

    let graph = reconciler.graph()?;
    emit(formatter, &formatter.format_graph(&graph));

    Ok(ExitCode::SUCCESS)
}

/// Show the provisioning plan.
async fn cmd_plan(
    config_path: Option<&Path>,
    detailed: bool,
    formatter: &OutputFormatter,
) -> Result<ExitCode> {
    let workspace = Workspace::open(config_path).await?;
    let plan = workspace.reconciler().plan().await?;

    emit(formatter, &formatter.format_plan(&plan, detailed));
    Ok(ExitCode::SUCCESS)
}

/// Apply the provisioning plan.
async fn cmd_apply(
    config_path: Option<&Path>,
    auto_approve: bool,
    formatter: &OutputFormatter,
) -> Result<ExitCode> {
    let workspace = Workspace::open(config_path).await?;
    let reconciler = workspace.reconciler();
    let plan = reconciler.plan().await?;

    if plan.is_empty() {
        emit(
            formatter,
            &formatter.message(MessageLevel::Success, "No changes to apply."),
        );
        return Ok(ExitCode::SUCCESS);
    }

    emit(formatter, &formatter.format_plan(&plan, false));

    if !auto_approve && !confirm("Do you want to apply this plan? [y/N]: ", "y")? {
        eprintln!("Apply cancelled.");
        return Ok(ExitCode::SUCCESS);
    }

    let cancel = cancel_on_interrupt();
    let report = reconciler.apply(plan, &cancel).await?;
    finish(formatter, &report)
}

/// Delete every provisioned resource.
async fn cmd_destroy(
    config_path: Option<&Path>,
    auto_approve: bool,
    formatter: &OutputFormatter,
) -> Result<ExitCode> {
    let workspace = Workspace::open(config_path).await?;
    let reconciler = workspace.reconciler();
    let plan = reconciler.destroy_plan().await?;

    if plan.is_empty() {
        emit(
            formatter,
            &formatter.message(MessageLevel::Success, "No resources to destroy."),
        );
        return Ok(ExitCode::SUCCESS);
    }

    emit(formatter, &formatter.format_plan(&plan, false));

    if !auto_approve
        && !confirm(
            "\nThis action is IRREVERSIBLE. Type 'destroy' to confirm: ",
            "destroy",
        )?
    {
        eprintln!("Destruction cancelled.");
        return Ok(ExitCode::SUCCESS);
    }

    let cancel = cancel_on_interrupt();
    let report = reconciler.destroy(&cancel).await?;
    finish(formatter, &report)
}

/// State management commands.
async fn cmd_state(
    config_path: Option<&Path>,
    command: StateCommands,
    formatter: &OutputFormatter,
) -> Result<ExitCode> {
    let workspace = Workspace::open(config_path).await?;
    let store = &workspace.state_store;

    match command {
        StateCommands::Show => {
            if let Some(state) = store.load().await? {
                emit(formatter, &formatter.format_state(&state));
            } else {
                emit(formatter, &formatter.message(MessageLevel::Warning, "No state found."));
            }
            if let Some(lock) = store.get_lock_info().await? {
                emit(formatter, &formatter.format_lock(&lock));
            }
        }
        StateCommands::Lock { holder } => {
            let holder = holder.unwrap_or_else(generate_holder_id);
            let lock = store.acquire_lock(&holder, "manual").await?;
            emit(formatter, &formatter.format_lock(&lock));
        }
        StateCommands::Unlock { lock_id, force } => {
            if force {
                store.force_unlock().await?;
                emit(
                    formatter,
                    &formatter.message(MessageLevel::Success, "State forcefully unlocked."),
                );
            } else if let Some(id) = lock_id {
                store.release_lock(&id).await?;
                emit(formatter, &formatter.message(MessageLevel::Success, "State unlocked."));
            } else {
                emit(
                    formatter,
                    &formatter.message(MessageLevel::Error, "Please provide --lock-id or use --force"),
                );
                return Ok(ExitCode::from(1));
            }
        }
    }

    Ok(ExitCode::SUCCESS)
}

// ============================================================================
// Helper Functions
// ============================================================================

/// Everything a stateful command needs.
struct Workspace {
    description: StackDescription,
    state_store: Box<dyn StateStore>,
    provider: Arc<dyn Provider>,
}

impl Workspace {
    /// Loads and validates the description, then opens its backends.
    async fn open(config_path: Option<&Path>) -> Result<Self> {
        let config_file = resolve_config_path(config_path)?;
        debug!("Loading stack description from: {}", config_file.display());

        let config_dir = base_dir(&config_file);
        let parser = DescriptionParser::new().with_base_path(config_dir);
        parser.load_dotenv()?;

        let description = parser.load_with_env(&config_file)?;
        let validation = DescriptionValidator::new().validate(&description)?;
        for warning in &validation.warnings {
            warn!("{warning}");
        }

        let state_dir = description
            .state
            .path
            .as_deref()
            .map_or_else(|| config_dir.join(STATE_DIR), |p| expand_home(p, config_dir));

        let state_store: Box<dyn StateStore> = match description.state.backend {
            StateBackend::Local => Box::new(LocalStateStore::with_base_dir(&state_dir)),
            StateBackend::S3 => {
                let bucket = description
                    .state
                    .bucket
                    .as_deref()
                    .ok_or_else(|| StackError::internal("S3 bucket not configured"))?;
                let prefix = description.state.prefix.as_deref();
                let region = description
                    .state
                    .region
                    .as_deref()
                    .or(description.stack.region.as_deref());
                Box::new(S3StateStore::new(bucket, prefix, region).await?)
            }
        };

        let provider: Arc<dyn Provider> = match description.provider.kind {
            ProviderKind::Sandbox => {
                let inventory = description
                    .provider
                    .inventory
                    .as_deref()
                    .map_or_else(|| state_dir.join("sandbox.json"), |p| expand_home(p, config_dir));
                Arc::new(SandboxProvider::open(inventory).await?)
            }
            ProviderKind::Http => {
                let endpoint = description
                    .provider
                    .endpoint
                    .as_deref()
                    .ok_or_else(|| StackError::internal("Provider endpoint not configured"))?;
                let token = DescriptionParser::provider_token().ok();
                if token.is_none() {
                    warn!("No provider token set; calling {endpoint} without authentication");
                }
                let provider = match description.provider.request_timeout_secs {
                    Some(secs) => HttpProvider::with_timeout(endpoint, token, secs)?,
                    None => HttpProvider::new(endpoint, token)?,
                };
                Arc::new(provider)
            }
        };

        Ok(Self {
            description,
            state_store,
            provider,
        })
    }

    fn reconciler(&self) -> Reconciler<'_, Box<dyn StateStore>> {
        Reconciler::new(
            &self.description,
            &self.state_store,
            Arc::clone(&self.provider),
        )
    }
}

/// Resolves the stack description path.
fn resolve_config_path(config_path: Option<&Path>) -> Result<PathBuf> {
    config_path.map_or_else(|| find_config_file("."), |path| Ok(path.to_path_buf()))
}

/// Directory holding the description.
fn base_dir(config_file: &Path) -> &Path {
    config_file
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."))
}

/// Expands `~/` and resolves relative paths against the description directory.
fn expand_home(path: &str, config_dir: &Path) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/")
        && let Some(home) = dirs::home_dir()
    {
        return home.join(rest);
    }

    let path = Path::new(path);
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        config_dir.join(path)
    }
}

/// Cancels the returned token on Ctrl-C.
fn cancel_on_interrupt() -> CancellationToken {
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received; waiting for in-flight operations to finish");
            trigger.cancel();
        }
    });

    cancel
}

/// Asks for confirmation on stderr.
fn confirm(prompt: &str, expected: &str) -> Result<bool> {
    eprint!("{prompt}");
    std::io::stderr().flush()?;

    let mut input = String::new();
    std::io::stdin().read_line(&mut input)?;

    Ok(input.trim().eq_ignore_ascii_case(expected))
}

/// Prints the run report and maps it to an exit code.
fn finish(formatter: &OutputFormatter, report: &ApplyReport) -> Result<ExitCode> {
    emit(formatter, &formatter.format_report(report));

    match report.partial_error() {
        Some(e) => {
            eprintln!("{} {e}", "Error:".red().bold());
            Ok(ExitCode::from(EXIT_APPLY_FAILED))
        }
        None => Ok(ExitCode::SUCCESS),
    }
}

/// JSON goes to stdout for scripting, text to stderr.
fn emit(formatter: &OutputFormatter, output: &str) {
    match formatter.format() {
        OutputFormat::Json => println!("{output}"),
        OutputFormat::Text => eprintln!("{output}"),
    }
}
