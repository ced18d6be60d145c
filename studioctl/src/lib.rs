use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{Datelike, Local};
use clap::{Args, CommandFactory, Parser, Subcommand, ValueEnum};
use clap_complete::Shell;
use serde::Serialize;
use studio_core::checkpoint::{CheckpointError, CheckpointStore, ProjectState};
use studio_core::config::{load_studio_config, weekday_key, StudioConfig};
use studio_core::failover::{FailoverExecutor, HttpClientFactory, RetrySettings};
use studio_core::integrity::{IntegrityError, IntegrityRecord, VerifyReport};
use studio_core::pipeline::{
    tracked_artifacts, ExternalTools, Orchestrator, OrchestratorSettings, PipelineError,
    ProductionBrief, ProjectLayout, RunSummary, StudioBackend,
};
use studio_core::provider::{Capability, ProviderRegistry};
use studio_core::usage::{SystemClock, UsageLedger, UsageReport, UsageStatus};
use thiserror::Error;
use tracing::{error, info};
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::EnvFilter;

pub type Result<T> = std::result::Result<T, AppError>;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("config error: {0}")]
    Config(#[from] studio_core::ConfigError),
    #[error("{0}")]
    Pipeline(#[from] PipelineError),
    #[error("checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),
    #[error("integrity error: {0}")]
    Integrity(#[from] IntegrityError),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("required resource missing: {0}")]
    MissingResource(String),
    #[error("{count} artifacts drifted from their recorded hashes")]
    Drift { count: usize },
    #[error("interrupted by user")]
    Interrupted,
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Studio production control interface", long_about = None)]
pub struct Cli {
    /// Path to studio.toml
    #[arg(long, default_value = "configs/studio.toml")]
    pub config: PathBuf,
    /// Overrides system.base_dir
    #[arg(long)]
    pub base_dir: Option<PathBuf>,
    /// Output format
    #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
    pub format: OutputFormat,
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Produces one video, resuming from its checkpoint
    Run(RunArgs),
    /// Shows the checkpoint of a production
    Status(ProjectArgs),
    /// Shows today's provider usage
    Usage,
    /// Lists ranked providers per capability
    Providers,
    /// Re-hashes a production's artifacts against its integrity record
    Verify(ProjectArgs),
    /// Prints shell completions
    Completions {
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(Args, Debug, Default)]
pub struct RunArgs {
    /// Channel name; defaults to today's daily task
    pub channel: Option<String>,
    /// Video topic
    pub topic: Option<String>,
    /// Target script length in letters
    pub target_length: Option<usize>,
}

#[derive(Args, Debug)]
pub struct ProjectArgs {
    pub channel: String,
    pub topic: String,
}

pub async fn run(cli: Cli) -> Result<()> {
    if let Commands::Completions { shell } = &cli.command {
        let mut command = Cli::command();
        clap_complete::generate(*shell, &mut command, "studioctl", &mut io::stdout());
        return Ok(());
    }

    let context = AppContext::new(&cli)?;
    match &cli.command {
        Commands::Run(args) => {
            let outcome = context.produce(args).await?;
            render(&outcome, cli.format)?;
        }
        Commands::Status(args) => {
            let status = context.project_status(args)?;
            render(&status, cli.format)?;
        }
        Commands::Usage => {
            render(&context.ledger.report(), cli.format)?;
        }
        Commands::Providers => {
            render(&context.providers(), cli.format)?;
        }
        Commands::Verify(args) => {
            let outcome = context.verify(args)?;
            render(&outcome, cli.format)?;
            ensure_clean(&outcome.report)?;
        }
        Commands::Completions { .. } => {}
    }
    Ok(())
}

fn ensure_clean(report: &VerifyReport) -> Result<()> {
    match report.drifted().count() {
        0 => Ok(()),
        count => Err(AppError::Drift { count }),
    }
}

fn log_filter(default_level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level))
}

/// Installs the global subscriber; `RUST_LOG` wins over the configured level.
pub fn init_tracing(default_level: &str) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(log_filter(default_level))
        .with_writer(io::stderr)
        .with_target(false)
        .try_init();
}

/// Loads the config under a scoped subscriber, so warnings raised while
/// parsing it are shown before the configured level is known.
fn load_config<W>(path: &Path, writer: W) -> Result<StudioConfig>
where
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    let bootstrap = tracing_subscriber::fmt()
        .with_env_filter(log_filter("info"))
        .with_writer(writer)
        .with_target(false)
        .finish();
    Ok(tracing::subscriber::with_default(bootstrap, || load_studio_config(path))?)
}

fn render<T>(value: &T, format: OutputFormat) -> Result<()>
where
    T: Serialize + DisplayFallback,
{
    match format {
        OutputFormat::Text => {
            println!("{}", value.display());
            Ok(())
        }
        OutputFormat::Json => {
            let json = serde_json::to_string_pretty(value)?;
            println!("{}", json);
            Ok(())
        }
    }
}

trait DisplayFallback {
    fn display(&self) -> String;
}

#[derive(Debug, Clone, PartialEq)]
struct Task {
    channel: String,
    topic: String,
    target_length: usize,
}

struct AppContext {
    config: StudioConfig,
    base_dir: PathBuf,
    ledger: Arc<UsageLedger>,
    registry: Arc<ProviderRegistry>,
}

impl AppContext {
    fn new(cli: &Cli) -> Result<Self> {
        let mut config = load_config(&cli.config, io::stderr)?;
        if let Some(base_dir) = &cli.base_dir {
            config.system.base_dir = base_dir.display().to_string();
        }
        init_tracing(&config.system.log_level);
        let base_dir = PathBuf::from(&config.system.base_dir);
        let ledger = Arc::new(UsageLedger::load(config.usage_path(), Arc::new(SystemClock)));
        let registry = Arc::new(ProviderRegistry::load(&config.providers, &ledger));
        Ok(Self {
            config,
            base_dir,
            ledger,
            registry,
        })
    }

    fn resolve_task(&self, args: &RunArgs) -> Result<Task> {
        match (&args.channel, &args.topic) {
            (Some(channel), Some(topic)) => Ok(Task {
                channel: channel.clone(),
                topic: topic.clone(),
                target_length: args.target_length.unwrap_or(1500),
            }),
            (None, None) => {
                let weekday = Local::now().weekday();
                let task = self.config.daily_task(weekday).ok_or_else(|| {
                    AppError::MissingResource(format!(
                        "no daily task configured for {}",
                        weekday_key(weekday)
                    ))
                })?;
                info!(day = weekday_key(weekday), channel = %task.channel, topic = %task.topic, "using daily task");
                Ok(Task {
                    channel: task.channel.clone(),
                    topic: task.topic.clone(),
                    target_length: args.target_length.unwrap_or(task.target_length),
                })
            }
            _ => Err(AppError::MissingResource(
                "both channel and topic are required".to_string(),
            )),
        }
    }

    fn brief(&self, channel: &str, topic: &str, target_length: usize) -> ProductionBrief {
        ProductionBrief::new(channel, topic, target_length, self.config.channel(channel))
    }

    fn layout(&self, channel: &str, topic: &str) -> ProjectLayout {
        let brief = self.brief(channel, topic, 0);
        ProjectLayout::new(&self.base_dir, brief.channel_slug(), topic)
    }

    async fn produce(&self, args: &RunArgs) -> Result<RunOutcome> {
        let task = self.resolve_task(args)?;
        let executor = Arc::new(FailoverExecutor::new(
            Arc::clone(&self.registry),
            Arc::clone(&self.ledger),
            HttpClientFactory,
            RetrySettings::from_config(&self.config.failover),
        ));
        let backend = StudioBackend::new(executor, ExternalTools::from_config(&self.config));
        let orchestrator = Orchestrator::new(
            Arc::new(backend),
            &self.base_dir,
            self.brief(&task.channel, &task.topic, task.target_length),
            OrchestratorSettings::from_config(&self.config.pipeline),
        )?;

        let result = tokio::select! {
            result = orchestrator.run() => result.map_err(AppError::from),
            _ = tokio::signal::ctrl_c() => Err(AppError::Interrupted),
        };
        self.ledger.save();
        match result {
            Ok(summary) => Ok(RunOutcome {
                summary,
                usage: self.ledger.report(),
            }),
            Err(err) => {
                error!(channel = %task.channel, topic = %task.topic, error = %err, "production halted");
                eprintln!("{}", self.ledger.report());
                Err(err)
            }
        }
    }

    fn project_status(&self, args: &ProjectArgs) -> Result<ProjectStatus> {
        let layout = self.layout(&args.channel, &args.topic);
        let state = CheckpointStore::load_existing(&layout.project_name(), layout.root())?;
        Ok(ProjectStatus {
            project: layout.project_name(),
            path: layout.root().to_path_buf(),
            final_video: layout.final_video().is_file(),
            state,
        })
    }

    fn providers(&self) -> ProviderListing {
        let capabilities = Capability::ALL
            .into_iter()
            .map(|capability| CapabilityRanking {
                capability,
                providers: self
                    .registry
                    .candidates(capability)
                    .iter()
                    .filter_map(|key| self.registry.config(key))
                    .map(|config| {
                        let usage = self.ledger.snapshot(&config.key);
                        ProviderRow {
                            provider: config.key.to_string(),
                            kind: config.kind.as_str().to_string(),
                            model: config.model(capability).unwrap_or_default().to_string(),
                            priority: config.priority,
                            daily_quota: config.daily_quota,
                            requests_today: usage.as_ref().map(|u| u.requests_today).unwrap_or(0),
                            status: usage.map(|u| u.status).unwrap_or_default(),
                        }
                    })
                    .collect(),
            })
            .collect();
        ProviderListing { capabilities }
    }

    fn verify(&self, args: &ProjectArgs) -> Result<VerifyOutcome> {
        let layout = self.layout(&args.channel, &args.topic);
        if !layout.root().is_dir() {
            return Err(AppError::MissingResource(format!(
                "no production at {}",
                layout.root().display()
            )));
        }
        let state = CheckpointStore::load_existing(&layout.project_name(), layout.root())?;
        let files = tracked_artifacts(&layout, state.as_ref());
        let record = IntegrityRecord::load(layout.integrity_file())?;
        let report = record.verify(&files)?;
        Ok(VerifyOutcome {
            project: layout.project_name(),
            checked: files.len(),
            report,
        })
    }
}

#[derive(Debug, Serialize)]
pub struct RunOutcome {
    pub summary: RunSummary,
    pub usage: UsageReport,
}

impl DisplayFallback for RunOutcome {
    fn display(&self) -> String {
        format!("{}\n\n{}", self.summary, self.usage)
    }
}

impl DisplayFallback for UsageReport {
    fn display(&self) -> String {
        self.to_string()
    }
}

#[derive(Debug, Serialize)]
pub struct ProjectStatus {
    pub project: String,
    pub path: PathBuf,
    pub final_video: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<ProjectState>,
}

impl DisplayFallback for ProjectStatus {
    fn display(&self) -> String {
        let mut lines = vec![format!("Project: {} ({})", self.project, self.path.display())];
        let Some(state) = &self.state else {
            lines.push(if self.final_video {
                "No checkpoint: production finished".to_string()
            } else {
                "No checkpoint: production not started".to_string()
            });
            return lines.join("\n");
        };
        lines.push(format!(
            "Status: {} (updated {})",
            state.global_status.as_str(),
            state.last_updated.format("%Y-%m-%d %H:%M:%S")
        ));
        for (name, op) in &state.operations {
            let mut line = format!(
                "  - {name}: {} {:>3.0}% ({}/{})",
                op.status.as_str(),
                op.progress * 100.0,
                op.current_item,
                op.total_items
            );
            if let Some(message) = &op.error_message {
                line.push_str(&format!(" error: {message}"));
            }
            lines.push(line);
        }
        lines.join("\n")
    }
}

#[derive(Debug, Serialize)]
pub struct ProviderListing {
    pub capabilities: Vec<CapabilityRanking>,
}

#[derive(Debug, Serialize)]
pub struct CapabilityRanking {
    pub capability: Capability,
    pub providers: Vec<ProviderRow>,
}

#[derive(Debug, Serialize)]
pub struct ProviderRow {
    pub provider: String,
    pub kind: String,
    pub model: String,
    pub priority: u32,
    pub daily_quota: Option<u64>,
    pub requests_today: u64,
    pub status: UsageStatus,
}

impl DisplayFallback for ProviderListing {
    fn display(&self) -> String {
        let mut lines = Vec::new();
        for ranking in &self.capabilities {
            lines.push(format!("{}:", ranking.capability));
            if ranking.providers.is_empty() {
                lines.push("  (none)".to_string());
            }
            for row in &ranking.providers {
                let quota = row
                    .daily_quota
                    .map(|quota| format!("{}/{quota}", row.requests_today))
                    .unwrap_or_else(|| format!("{}/-", row.requests_today));
                lines.push(format!(
                    "  {}. {} [{}] model={} requests={} status={}",
                    row.priority,
                    row.provider,
                    row.kind,
                    row.model,
                    quota,
                    row.status.as_str()
                ));
            }
        }
        lines.join("\n")
    }
}

#[derive(Debug, Serialize)]
pub struct VerifyOutcome {
    pub project: String,
    pub checked: usize,
    pub report: VerifyReport,
}

fn push_paths(lines: &mut Vec<String>, label: &str, paths: &[PathBuf]) {
    for path in paths {
        lines.push(format!("  {label}: {}", path.display()));
    }
}

impl DisplayFallback for VerifyOutcome {
    fn display(&self) -> String {
        let mut lines = vec![format!("Project: {} ({} files checked)", self.project, self.checked)];
        if self.report.is_clean() {
            lines.push("All tracked artifacts match their recorded hashes".to_string());
        }
        push_paths(&mut lines, "mismatch", &self.report.mismatched);
        push_paths(&mut lines, "missing", &self.report.missing);
        push_paths(&mut lines, "untracked", &self.report.untracked);
        lines.join("\n")
    }
}
