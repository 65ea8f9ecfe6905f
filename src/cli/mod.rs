use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::fs;

use crate::config::{
    validate_devcontainer_config, ConfigFormat, ConfigParser, DevContainerConfig, Settings,
};
use crate::core::Backend;
use crate::environments::{
    AutoForwardAction, CommandStatus, DryRunProvisioner, EnvironmentManager, Provisioner,
    ResolvedEnvironment, SessionReport, StepOutcome, StepRecord,
};

pub mod interactive;

use interactive::{InitAnswers, InitWizard};

#[derive(Parser, Debug)]
#[command(name = "forge", author, version, about = "Provision development environments from devcontainer descriptors", long_about = None)]
pub struct Cli {
    /// Workspace folder holding the descriptor
    #[arg(short, long, global = true, default_value = ".")]
    pub workspace: PathBuf,

    /// Descriptor to use instead of discovering one
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Log level or filter directives, e.g. `debug` or `forge_devcontainer=trace`
    #[arg(long, global = true, env = "FORGE_LOG_LEVEL")]
    pub log_level: Option<String>,

    /// Record what would happen without touching a container runtime
    #[arg(long, global = true)]
    pub dry_run: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Check the descriptor and report every problem found
    Validate {
        /// Treat warnings as errors
        #[arg(long)]
        strict: bool,
    },
    /// Print the normalized descriptor
    Show {
        #[arg(short, long, value_enum, default_value_t = OutputFormat::Json)]
        format: OutputFormat,
        /// Merge patch applied on top of the descriptor
        #[arg(long = "override")]
        overlay: Option<PathBuf>,
    },
    /// Print the lifecycle steps in execution order
    Plan,
    /// Create or reuse the environment and start a session
    Up {
        #[arg(long = "override")]
        overlay: Option<PathBuf>,
        /// Do not wait for forwarded ports to start listening. Ports are still published,
        /// but openBrowser and openBrowserOnce are not applied
        #[arg(long)]
        no_wait: bool,
    },
    /// Start a new session in a provisioned environment
    Start {
        /// Do not wait for forwarded ports; browser actions are skipped
        #[arg(long)]
        no_wait: bool,
    },
    /// Stop the environment
    Down {
        /// Also delete the container and forget its state
        #[arg(long)]
        remove: bool,
    },
    /// Show the recorded environment state
    Status,
    /// List forwarded ports and what happens when they open
    Ports,
    /// Find descriptors under a directory
    Discover {
        dir: Option<PathBuf>,
    },
    /// Scaffold .devcontainer/devcontainer.json
    Init {
        /// Accept every default without prompting
        #[arg(short, long)]
        yes: bool,
        /// Overwrite an existing descriptor
        #[arg(long)]
        force: bool,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum OutputFormat {
    Json,
    Yaml,
    Toml,
}

impl From<OutputFormat> for ConfigFormat {
    fn from(format: OutputFormat) -> Self {
        match format {
            OutputFormat::Json => ConfigFormat::Json,
            OutputFormat::Yaml => ConfigFormat::Yaml,
            OutputFormat::Toml => ConfigFormat::Toml,
        }
    }
}

impl Cli {
    pub fn backend(&self, settings: &Settings) -> Backend {
        if self.dry_run {
            Backend::DryRun
        } else {
            settings.backend
        }
    }
}

pub fn build_provisioner(backend: Backend) -> Result<Arc<dyn Provisioner>> {
    match backend {
        Backend::DryRun => Ok(Arc::new(DryRunProvisioner::new())),
        #[cfg(feature = "docker")]
        Backend::Docker => Ok(Arc::new(
            crate::docker::DockerProvisioner::new().context("Docker backend unavailable")?,
        )),
        #[cfg(not(feature = "docker"))]
        Backend::Docker => anyhow::bail!("built without docker support; use --dry-run"),
    }
}

pub async fn run(cli: Cli, settings: Settings) -> Result<()> {
    match &cli.command {
        Commands::Validate { strict } => return validate(&cli, *strict).await,
        Commands::Discover { dir } => return discover(dir.as_deref().unwrap_or(&cli.workspace)),
        Commands::Init { yes, force } => return init(&cli.workspace, *yes, *force).await,
        _ => {}
    }

    let backend = cli.backend(&settings);
    let manager = EnvironmentManager::new(settings, build_provisioner(backend)?);

    match &cli.command {
        Commands::Show { format, overlay } => {
            let env = load(&manager, &cli, overlay.as_deref()).await?;
            println!("{}", env.config.to_format((*format).into())?);
        }
        Commands::Plan => {
            let env = load(&manager, &cli, None).await?;
            println!(
                "{} {} ({})",
                style("Lifecycle for").bold(),
                style(env.name()).cyan(),
                env.config.detect_environment_type()
            );
            print!("{}", manager.plan(&env));
        }
        Commands::Up { overlay, no_wait } => {
            let env = load(&manager, &cli, overlay.as_deref()).await?;
            let wait = !no_wait && backend != Backend::DryRun;

            let spinner = spinner(&format!("Bringing up {} on {}", env.name(), manager.backend_name()))?;
            let result = manager.up(&env, wait).await;
            spinner.finish_and_clear();
            let report = result?;

            print_steps(&report.steps);
            println!(
                "{} {} {}",
                style("✓").green().bold(),
                if report.reused { "Reused container" } else { "Created container" },
                style(&report.container_id).cyan()
            );
            print_session(&report.session);
        }
        Commands::Start { no_wait } => {
            let env = load(&manager, &cli, None).await?;
            let wait = !no_wait && backend != Backend::DryRun;
            let spinner = spinner(&format!("Starting session in {}", env.name()))?;
            let result = manager.start_session(&env, wait).await;
            spinner.finish_and_clear();
            print_session(&result?);
        }
        Commands::Down { remove } => match manager.down(&cli.workspace, *remove).await? {
            Some(_) if *remove => println!("{}", style("Environment removed").green()),
            Some(_) => println!("{}", style("Environment stopped").green()),
            None => println!("{}", style("No environment recorded for this workspace").yellow()),
        },
        Commands::Status => match manager.status(&cli.workspace).await? {
            Some(state) => {
                println!("{:<14} {}", style("status").bold(), style(&state.status).cyan());
                println!(
                    "{:<14} {}",
                    style("container").bold(),
                    state.container_id.as_deref().unwrap_or("-")
                );
                println!(
                    "{:<14} {}",
                    style("post-create").bold(),
                    state
                        .post_create_completed_at
                        .map_or_else(|| "pending".to_string(), |at| at.to_rfc3339())
                );
                println!("{:<14} {}", style("sessions").bold(), state.sessions.len());
                if let Some(last) = state.sessions.last() {
                    println!(
                        "{:<14} {} ({})",
                        style("last session").bold(),
                        last.started_at.to_rfc3339(),
                        command_status(&last.post_start)
                    );
                }
            }
            None => println!("{}", style("Not provisioned").yellow()),
        },
        Commands::Ports => {
            let env = load(&manager, &cli, None).await?;
            let state = manager.status(&cli.workspace).await?;
            print_ports(&env, state.as_ref().map(|s| &s.port_bindings));
        }
        Commands::Validate { .. } | Commands::Discover { .. } | Commands::Init { .. } => {}
    }

    Ok(())
}

async fn load(
    manager: &EnvironmentManager,
    cli: &Cli,
    overlay: Option<&Path>,
) -> Result<ResolvedEnvironment> {
    let overlay: Option<Value> = match overlay {
        Some(path) => Some(
            ConfigParser::parse_file(path, None)
                .with_context(|| format!("Failed to read override {}", path.display()))?,
        ),
        None => None,
    };
    Ok(manager
        .load(&cli.workspace, cli.config.as_deref(), overlay.as_ref())
        .await?)
}

async fn validate(cli: &Cli, strict: bool) -> Result<()> {
    let path = EnvironmentManager::locate_descriptor(&cli.workspace, cli.config.as_deref())?;

    let config = DevContainerConfig::from_file(&path).await?;
    let report = validate_devcontainer_config(&config);
    print!("{}", report);

    match report.into_result(strict) {
        Ok(report) => {
            println!(
                "{} {} is valid ({} warnings)",
                style("✓").green().bold(),
                path.display(),
                report.warnings.len()
            );
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

fn discover(dir: &Path) -> Result<()> {
    let found = EnvironmentManager::discover(dir)?;
    if found.is_empty() {
        println!("{}", style("No descriptors found").yellow());
    }
    for (i, path) in found.iter().enumerate() {
        let marker = if i == 0 { style("*").green() } else { style(" ") };
        println!("{} {}", marker, path.display());
    }
    Ok(())
}

async fn init(workspace: &Path, yes: bool, force: bool) -> Result<()> {
    let path = workspace.join(".devcontainer").join("devcontainer.json");
    if fs::try_exists(&path).await? && !force && (yes || !InitWizard::confirm_overwrite(&path)?) {
        anyhow::bail!("{} already exists; pass --force to overwrite", path.display());
    }

    let answers = if yes {
        InitAnswers::default()
    } else {
        InitWizard::prompt()?
    };
    let config = answers.into_config();
    config.check_schema()?;
    let report = validate_devcontainer_config(&config).into_result(false)?;
    print!("{}", report);

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }
    fs::write(&path, format!("{}\n", config.to_json_pretty()?))
        .await
        .with_context(|| format!("Failed to write {}", path.display()))?;

    println!("{} Wrote {}", style("✓").green().bold(), path.display());
    Ok(())
}

fn spinner(message: &str) -> Result<ProgressBar> {
    let pb = ProgressBar::new_spinner();
    pb.set_style(ProgressStyle::default_spinner().template("{spinner:.green} [{elapsed}] {msg}")?);
    pb.set_message(message.to_string());
    pb.enable_steady_tick(Duration::from_millis(100));
    Ok(pb)
}

fn print_steps(steps: &[StepRecord]) {
    for record in steps {
        let marker = match &record.outcome {
            StepOutcome::Completed => style("✓").green(),
            StepOutcome::Skipped(_) => style("-").dim(),
            StepOutcome::Failed(_) => style("✗").red(),
        };
        println!(
            "  {} {} {} {}",
            marker,
            record.step,
            style(&record.outcome).dim(),
            style(format!("{}ms", record.elapsed.as_millis())).dim()
        );
    }
}

fn print_session(session: &SessionReport) {
    print_steps(&session.steps);
    match &session.post_start {
        CommandStatus::Failed { exit_code } => println!(
            "{} postStartCommand exited with {}; the container is still usable",
            style("!").yellow().bold(),
            exit_code
        ),
        CommandStatus::Running => println!(
            "{} postStartCommand is running in the background",
            style("…").cyan()
        ),
        CommandStatus::Succeeded | CommandStatus::NotDeclared => {}
    }

    for report in &session.forwards {
        let state = match report.active {
            Some(true) => style("listening").green(),
            Some(false) => style("not listening").red(),
            None => style("not awaited").dim(),
        };
        let action = match &report.action {
            AutoForwardAction::OpenBrowser(url) => format!("open {}", url),
            AutoForwardAction::OpenPreview(url) => format!("preview {}", url),
            AutoForwardAction::Notify(url) => format!("notify {}", url),
            AutoForwardAction::None => "none".to_string(),
        };
        println!(
            "  {} {} -> localhost:{} [{}] {}",
            style("⇄").cyan(),
            report.forward.display_label(),
            report.forward.host_port,
            state,
            action
        );
    }
    println!("{} session {}", style("Started").bold(), session.session_id);
}

fn print_ports(env: &ResolvedEnvironment, bindings: Option<&std::collections::BTreeMap<String, u16>>) {
    println!(
        "{:<22} {:<12} {:<18} {:<16}",
        style("PORT").bold(),
        style("HOST").bold(),
        style("LABEL").bold(),
        style("ON AUTO FORWARD").bold()
    );
    for port in &env.resolved.forward_ports {
        let attrs = env.resolved.attributes_for(port).cloned().unwrap_or_default();
        let host = bindings
            .and_then(|b| b.get(&port.to_string()))
            .map_or_else(|| "-".to_string(), |p| p.to_string());
        println!(
            "{:<22} {:<12} {:<18} {:<16}",
            port.to_string(),
            host,
            attrs.label.unwrap_or_default(),
            attrs.on_auto_forward.unwrap_or_default().to_string()
        );
    }
}

fn command_status(status: &CommandStatus) -> String {
    match status {
        CommandStatus::NotDeclared => "no postStartCommand".to_string(),
        CommandStatus::Succeeded => "postStartCommand ok".to_string(),
        CommandStatus::Running => "postStartCommand running".to_string(),
        CommandStatus::Failed { exit_code } => format!("postStartCommand exited {}", exit_code),
    }
}
