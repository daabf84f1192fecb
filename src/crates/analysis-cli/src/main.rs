//! # contract-pipeline
//!
//! Command line front end of the contract analysis pipeline. State lives
//! under `--data-dir` (`registry/`, `checkpoints/` and `documents/`) as plain
//! JSON files, so separate invocations see each other's tasks.

mod simulated;

use analysis_checkpoint::{FileCheckpointStore, FileTaskRegistry, TaskState};
use analysis_workflow::store::StoreConnector;
use analysis_workflow::{
    AnalysisEngine, ContextPooledStore, DocumentInput, DocumentStore, FallbackGenerator, FileDocumentStore,
    GenerationProvider, IsolationTier, PipelineConfig, PipelineDeps, ProgressNotifier, RecoveryOutcome,
    RecoveryReport, RetryPolicyTable, RetryResponse, RetryingStore, StartRequest, TemplateRenderer, WorkerRequest,
    WorkerResponse, WorkflowServices,
};
use anyhow::Context;
use clap::{Parser, Subcommand};
use serde::Serialize;
use simulated::{FileExtraction, KeywordProvider, LogSink};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, info, warn};

#[derive(Parser)]
#[command(name = "contract-pipeline")]
#[command(about = "Run, inspect and recover contract analyses", long_about = None)]
#[command(version)]
struct Cli {
    /// Pipeline configuration file (YAML)
    #[arg(short, long, global = true, env = "CONTRACT_PIPELINE_CONFIG")]
    config: Option<PathBuf>,

    /// Directory holding the task registry, checkpoints and results
    #[arg(
        short,
        long,
        global = true,
        env = "CONTRACT_PIPELINE_DATA",
        default_value = ".contract-pipeline"
    )]
    data_dir: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Analyse a document and wait for the result
    Start {
        /// Document path or `file://` reference
        document: String,

        /// Who asked for the analysis
        #[arg(long)]
        requester: String,

        /// Content fingerprint (defaults to the document reference)
        #[arg(long)]
        fingerprint: Option<String>,

        #[arg(long, default_value = "purchase_agreement")]
        document_type: String,

        /// Australian state or territory code, e.g. NSW
        #[arg(long)]
        state: Option<String>,

        /// Explicit task id (a UUID is generated otherwise)
        #[arg(long)]
        task_id: Option<String>,

        #[arg(long, default_value_t = 0)]
        priority: i32,

        /// Isolation tier: context, worker or process
        #[arg(long, value_parser = parse_tier)]
        tier: Option<IsolationTier>,
    },

    /// Print the status of a task
    Status {
        task_id: String,
    },

    /// Manually retry a failed or interrupted task
    Retry {
        task_id: String,
    },

    /// Recover every stale or failed task once
    Recover,

    /// Validate a configuration file
    ValidateConfig {
        /// Path to YAML file
        file: PathBuf,

        /// Also print the workflow graph
        #[arg(long)]
        describe: bool,
    },

    /// Print the workflow graph as a Mermaid diagram
    Describe,

    /// Serve one process-tier request from stdin
    #[command(hide = true)]
    Worker,
}

fn parse_tier(value: &str) -> Result<IsolationTier, String> {
    match value {
        "context" => Ok(IsolationTier::Context),
        "worker" => Ok(IsolationTier::Worker),
        "process" => Ok(IsolationTier::Process),
        other => Err(format!("unknown isolation tier '{}'", other)),
    }
}

/// Recovery report as printed by `recover`
#[derive(Debug, Serialize)]
struct RecoveryView {
    task_id: String,
    strategy: Option<&'static str>,
    outcome: &'static str,
    detail: Option<String>,
}

impl From<&RecoveryReport> for RecoveryView {
    fn from(report: &RecoveryReport) -> Self {
        let (outcome, detail) = match &report.outcome {
            RecoveryOutcome::Skipped { reason } => ("skipped", Some(reason.clone())),
            RecoveryOutcome::Aborted { error } => ("aborted", Some(error.to_string())),
            RecoveryOutcome::AlreadyComplete => ("already_complete", None),
            RecoveryOutcome::Completed { .. } => ("completed", None),
            RecoveryOutcome::Failed { failure } => ("failed", Some(failure.error.to_string())),
        };
        Self {
            task_id: report.task_id.clone(),
            strategy: report.strategy,
            outcome,
            detail,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    // stdout carries command output (and worker responses), logs go to stderr
    let rust_log = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());
    tracing_subscriber::fmt()
        .with_env_filter(rust_log)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match &cli.command {
        Commands::ValidateConfig { file, describe } => validate_config(file, *describe).await,
        Commands::Worker => serve_worker(&cli).await,
        command => {
            let config = load_config(&cli)?;
            let app = App::open(&cli, config)?;
            let code = app.dispatch(command).await;
            app.notifier.flush().await;
            code
        }
    }
}

fn load_config(cli: &Cli) -> anyhow::Result<PipelineConfig> {
    match &cli.config {
        Some(path) => PipelineConfig::from_file(path)
            .with_context(|| format!("failed to load configuration from {}", path.display())),
        None => Ok(PipelineConfig::default()),
    }
}

/// Arguments that make a child invocation of this binary serve worker requests
fn worker_args(cli: &Cli) -> Vec<String> {
    let mut args = vec!["--data-dir".to_string(), cli.data_dir.display().to_string()];
    if let Some(config) = &cli.config {
        args.push("--config".to_string());
        args.push(config.display().to_string());
    }
    args.push("worker".to_string());
    args
}

/// Opens a retrying file store connection on every call
fn document_connector(root: PathBuf, retry: RetryPolicyTable) -> StoreConnector {
    Arc::new(move || {
        debug!(root = %root.display(), "Opening document store connection");
        let files: Arc<dyn DocumentStore> = Arc::new(FileDocumentStore::new(root.clone()));
        Ok(Arc::new(RetryingStore::new(files, retry.clone())) as Arc<dyn DocumentStore>)
    })
}

fn pipeline_parts(data_dir: &Path, config: &PipelineConfig) -> (PipelineDeps, WorkflowServices, ProgressNotifier) {
    // each isolation context gets its own connection
    let connector = document_connector(data_dir.join("documents"), config.retry.clone());
    let store: Arc<dyn DocumentStore> = Arc::new(ContextPooledStore::new(connector));

    let notifier = ProgressNotifier::spawn(Arc::new(LogSink), config.notifier.clone());
    let services = WorkflowServices::new(
        Arc::new(FileTaskRegistry::new(data_dir)),
        Arc::new(FileCheckpointStore::new(data_dir)),
        store.clone(),
        notifier.clone(),
    );

    let providers: Vec<Arc<dyn GenerationProvider>> = config
        .generation
        .providers
        .iter()
        .map(|name| Arc::new(KeywordProvider::new(name)) as Arc<dyn GenerationProvider>)
        .collect();
    let deps = PipelineDeps {
        extraction: Arc::new(FileExtraction),
        generator: Arc::new(FallbackGenerator::new(providers)),
        renderer: Arc::new(TemplateRenderer),
        store,
    };

    (deps, services, notifier)
}

struct App {
    engine: AnalysisEngine,
    notifier: ProgressNotifier,
}

impl App {
    fn open(cli: &Cli, mut config: PipelineConfig) -> anyhow::Result<Self> {
        if config.isolation.worker_program.is_none() {
            match std::env::current_exe() {
                Ok(program) => {
                    config.isolation.worker_program = Some(program);
                    config.isolation.worker_args = worker_args(cli);
                }
                Err(e) => warn!(error = %e, "Cannot locate own executable; process tier unavailable"),
            }
        }

        let (deps, services, notifier) = pipeline_parts(&cli.data_dir, &config);
        let engine = AnalysisEngine::contract_analysis(deps, services, &config)?;
        Ok(Self { engine, notifier })
    }

    async fn dispatch(&self, command: &Commands) -> anyhow::Result<ExitCode> {
        match command {
            Commands::Start {
                document,
                requester,
                fingerprint,
                document_type,
                state,
                task_id,
                priority,
                tier,
            } => {
                let mut input = DocumentInput::new(
                    document.clone(),
                    requester.clone(),
                    fingerprint.clone().unwrap_or_else(|| document.clone()),
                );
                input.document_type = document_type.clone();
                input.australian_state = state.clone();

                let mut request = StartRequest::new(input).with_priority(*priority);
                if let Some(id) = task_id {
                    request = request.with_task_id(id.clone());
                }
                if let Some(tier) = tier {
                    request = request.with_tier(*tier);
                }

                let accepted = self.engine.start(request).await?;
                if accepted.duplicate {
                    info!(task_id = %accepted.task_id, "Identical analysis already in flight");
                }
                self.engine.wait(&accepted.task_id).await?;
                self.print_status(&accepted.task_id).await
            }
            Commands::Status { task_id } => {
                let status = self.engine.status(task_id).await?;
                println!("{}", serde_json::to_string_pretty(&status)?);
                Ok(ExitCode::SUCCESS)
            }
            Commands::Retry { task_id } => {
                let response = self.engine.retry(task_id).await?;
                println!("{}", serde_json::to_string_pretty(&response)?);
                match response {
                    RetryResponse::Accepted { task_id } => {
                        self.engine.wait(&task_id).await?;
                        self.print_status(&task_id).await
                    }
                    RetryResponse::Rejected { .. } => Ok(ExitCode::FAILURE),
                }
            }
            Commands::Recover => {
                let reports = self.engine.recover_stale().await?;
                let views: Vec<RecoveryView> = reports.iter().map(RecoveryView::from).collect();
                println!("{}", serde_json::to_string_pretty(&views)?);
                let all_settled = reports
                    .iter()
                    .all(|r| !matches!(r.outcome, RecoveryOutcome::Failed { .. }));
                Ok(if all_settled { ExitCode::SUCCESS } else { ExitCode::FAILURE })
            }
            Commands::Describe => {
                println!("{}", self.engine.graph().describe());
                Ok(ExitCode::SUCCESS)
            }
            Commands::ValidateConfig { .. } | Commands::Worker => {
                anyhow::bail!("command is dispatched before the engine is opened")
            }
        }
    }

    async fn print_status(&self, task_id: &str) -> anyhow::Result<ExitCode> {
        let status = self.engine.status(task_id).await?;
        println!("{}", serde_json::to_string_pretty(&status)?);
        Ok(if status.state == TaskState::Completed {
            ExitCode::SUCCESS
        } else {
            ExitCode::FAILURE
        })
    }
}

async fn validate_config(file: &Path, describe: bool) -> anyhow::Result<ExitCode> {
    let config = match PipelineConfig::from_file(file) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("✗ {}: {}", file.display(), e);
            return Ok(ExitCode::FAILURE);
        }
    };

    // Building the engine also validates the workflow graph against the config
    let scratch = std::env::temp_dir().join(format!("contract-pipeline-validate-{}", std::process::id()));
    let (deps, services, _notifier) = pipeline_parts(&scratch, &config);
    let engine = match AnalysisEngine::contract_analysis(deps, services, &config) {
        Ok(engine) => engine,
        Err(e) => {
            eprintln!("✗ {}: {}", file.display(), e);
            return Ok(ExitCode::FAILURE);
        }
    };

    println!("✓ {} is valid", file.display());
    if describe {
        println!("{}", engine.graph().describe());
    }
    Ok(ExitCode::SUCCESS)
}

async fn serve_worker(cli: &Cli) -> anyhow::Result<ExitCode> {
    let mut input = String::new();
    tokio::io::stdin()
        .read_to_string(&mut input)
        .await
        .context("failed to read worker request")?;
    let request: WorkerRequest = serde_json::from_str(&input).context("malformed worker request")?;

    let config = load_config(cli)?;
    let (deps, services, notifier) = pipeline_parts(&cli.data_dir, &config);
    let engine = AnalysisEngine::contract_analysis(deps, services, &config)?;

    info!(task_id = %request.task_id, "Worker serving request");
    let result = engine.graph().run_at(request.state, request.start).await;
    notifier.flush().await;

    let response = serde_json::to_vec(&WorkerResponse::from_run(result))?;
    let mut stdout = tokio::io::stdout();
    stdout.write_all(&response).await?;
    stdout.flush().await?;
    Ok(ExitCode::SUCCESS)
}
