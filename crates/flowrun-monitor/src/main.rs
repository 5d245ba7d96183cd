//! FlowRun Monitor Server

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use flowrun_client::{HttpJobProcessor, HttpTaskApi, JobProcessor, TaskApi};
use flowrun_core::{TaskId, Vocabulary, WorkflowDefinition};
use flowrun_monitor::ledger::{run_pruner, FileLedger, InMemoryLedger, JobLedger};
use flowrun_monitor::{http, AppState, JobDispatcher, MonitorConfig};

/// FlowRun workflow monitor and job dispatcher.
#[derive(Parser, Debug)]
#[command(name = "flowrun-monitor", about = "FlowRun workflow monitor and job dispatcher")]
struct Args {
    /// Base URL of the task system of record
    #[arg(long, default_value = "http://localhost:8000/api")]
    api_url: String,

    /// Job processor submission endpoint
    #[arg(long, default_value = "http://localhost:8080/jobs")]
    processor_url: String,

    /// Bearer token for the job processor
    #[arg(long)]
    processor_token: Option<String>,

    /// Connection name the processor uses to reach the system of record
    #[arg(long, default_value = "flowrun")]
    connection_name: String,

    /// HTTP server address
    #[arg(long, default_value = "127.0.0.1:7070")]
    http_addr: String,

    /// Persist the job ledger to this JSON file
    #[arg(long)]
    ledger_path: Option<PathBuf>,

    /// Workflow definition (JSON)
    #[arg(long)]
    workflow: Option<PathBuf>,

    /// Log marker vocabulary (JSON)
    #[arg(long)]
    vocabulary: Option<PathBuf>,

    /// Workflow reference used for automatic resumes
    #[arg(long)]
    workflow_ref: Option<String>,

    /// Poll interval in milliseconds
    #[arg(long, default_value = "2000")]
    poll_interval_ms: u64,

    /// Minimum seconds between two dispatches for one task
    #[arg(long, default_value = "10")]
    debounce_secs: u64,

    /// Task to monitor from startup (repeatable)
    #[arg(long = "task")]
    tasks: Vec<String>,
}

impl Args {
    fn config(&self) -> MonitorConfig {
        MonitorConfig {
            api_url: self.api_url.clone(),
            processor_url: self.processor_url.clone(),
            processor_token: self.processor_token.clone(),
            connection_name: self.connection_name.clone(),
            http_addr: self.http_addr.clone(),
            ledger_path: self.ledger_path.clone(),
            workflow_ref: self.workflow_ref.clone(),
            poll_interval: Duration::from_millis(self.poll_interval_ms.max(100)),
            debounce: Duration::from_secs(self.debounce_secs),
            ..MonitorConfig::default()
        }
    }
}

fn load_json<T: serde::de::DeserializeOwned>(
    path: &Path,
    what: &str,
) -> Result<T, Box<dyn std::error::Error>> {
    let data = std::fs::read_to_string(path)
        .map_err(|e| format!("Failed to read {} from '{}': {}", what, path.display(), e))?;
    let value = serde_json::from_str(&data)
        .map_err(|e| format!("Failed to parse {} '{}': {}", what, path.display(), e))?;
    Ok(value)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("flowrun=info".parse()?))
        .with_target(true)
        .init();

    let args = Args::parse();
    let config = args.config();
    let http_addr: SocketAddr = config.http_addr.parse()?;

    let workflow = match &args.workflow {
        Some(path) => load_json::<WorkflowDefinition>(path, "workflow definition")?,
        None => WorkflowDefinition::new(Vec::<String>::new())?,
    };
    let vocabulary = match &args.vocabulary {
        Some(path) => load_json::<Vocabulary>(path, "vocabulary")?,
        None => Vocabulary::default(),
    };

    let ledger: Arc<dyn JobLedger> = match &config.ledger_path {
        Some(path) => {
            let ledger = FileLedger::open(path.clone()).await?;
            info!(path = %ledger.path().display(), "Using file job ledger");
            Arc::new(ledger)
        }
        None => Arc::new(InMemoryLedger::new()),
    };

    let task_api = HttpTaskApi::new(&config.api_url, config.request_timeout)?;
    let api_base_url = task_api.base_url().to_string();
    let api: Arc<dyn TaskApi> = Arc::new(task_api);
    let processor: Arc<dyn JobProcessor> = Arc::new(HttpJobProcessor::new(
        &config.processor_url,
        config.processor_token.clone(),
        config.request_timeout,
    )?);

    let dispatcher = Arc::new(
        JobDispatcher::new(api.clone(), processor, ledger.clone(), api_base_url)
            .with_retry(config.retry)
            .with_connection_name(config.connection_name.clone()),
    );

    let pruner = tokio::spawn(run_pruner(
        ledger,
        config.ledger_retention,
        config.prune_interval,
    ));

    info!(
        api_url = %config.api_url,
        processor_url = %config.processor_url,
        http_addr = %http_addr,
        "Starting FlowRun monitor"
    );

    let state = AppState::new(api, dispatcher, workflow, vocabulary, config);

    for task in &args.tasks {
        state.watch(TaskId::new(task.as_str())).await;
    }

    let router = http::create_router(state.clone());
    let listener = TcpListener::bind(http_addr).await?;
    info!("HTTP server listening on {}", http_addr);

    tokio::select! {
        result = axum::serve(listener, router) => {
            if let Err(e) = result {
                error!(error = %e, "HTTP server error");
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down");
        }
    }

    state.shutdown().await;
    pruner.abort();

    Ok(())
}
