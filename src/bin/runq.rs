//! runq CLI — operator interface to the run queue.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use clap::{Parser, Subcommand};
use secrecy::ExposeSecret;

use runq::config::Config;
use runq::model::{NewRun, ProjectId};
use runq::service::RunService;
use runq::store::{PgStore, PgStoreOptions};
use runq::telemetry::{TelemetryConfig, init_telemetry};
use runq::worker::{ExecError, Executor, Worker, WorkerConfig};

#[derive(Parser)]
#[command(name = "runq", about = "Submit-and-watch run queue")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the worker loop (dequeue, execute, heartbeat) until ctrl-c
    Worker {
        /// Worker identity reported with heartbeats
        #[arg(long)]
        id: Option<String>,
    },
    /// Project operations
    Project {
        #[command(subcommand)]
        action: ProjectAction,
    },
    /// Run operations
    Run {
        #[command(subcommand)]
        action: RunAction,
    },
    /// Queue depths, counters, and worker heartbeat age
    Status,
    /// Dead-letter channel operations
    Dlq {
        #[command(subcommand)]
        action: DlqAction,
    },
}

#[derive(Subcommand)]
enum ProjectAction {
    /// Create a project
    Create { name: String },
    /// List projects, newest first
    List {
        #[arg(long, default_value_t = 50)]
        limit: i64,
    },
}

#[derive(Subcommand)]
enum RunAction {
    /// Submit a run
    Submit {
        /// Owning project id
        #[arg(long)]
        project: ProjectId,
        /// Work kind (routes to the executor)
        #[arg(long)]
        kind: String,
        /// Work payload, opaque to the queue core
        #[arg(long)]
        payload: String,
        /// Explicit idempotency key (wins over the content fingerprint)
        #[arg(long)]
        idempotency_key: Option<String>,
    },
    /// Show a run with its logs and result. Accepts a full id or a
    /// unique prefix.
    Show { id: String },
}

#[derive(Subcommand)]
enum DlqAction {
    /// Peek at dead-lettered items
    Show {
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Move items back onto the pending channel
    Requeue {
        #[arg(long, default_value_t = 100)]
        limit: usize,
    },
}

/// Placeholder execution unit. Real deployments swap this for the service
/// that actually runs the submitted work.
struct StubExecutor;

#[async_trait]
impl Executor for StubExecutor {
    async fn execute(&self, kind: &str, payload: &str) -> Result<String, ExecError> {
        tokio::time::sleep(Duration::from_millis(500)).await;
        Ok(format!("[{kind}] OK len(payload)={}", payload.len()))
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let config = Config::from_env()?;

    match cli.command {
        Command::Worker { id } => cmd_worker(config, id).await,
        command => {
            let store = Arc::new(connect(&config).await?);
            let service = RunService::new(store, config.idempotency_ttl);

            match command {
                Command::Worker { .. } => unreachable!(),
                Command::Project { action } => cmd_project(&service, action).await,
                Command::Run { action } => cmd_run(&service, action).await,
                Command::Status => cmd_status(&service).await,
                Command::Dlq { action } => cmd_dlq(&service, action).await,
            }
        }
    }
}

async fn connect(config: &Config) -> anyhow::Result<PgStore> {
    let store = PgStore::connect(
        config.database_url.expose_secret(),
        PgStoreOptions {
            pending_queue: config.pending_queue.clone(),
            dead_queue: config.dead_queue.clone(),
            max_log_lines: config.max_log_lines as i64,
            ..PgStoreOptions::default()
        },
    )
    .await?;
    store.migrate().await?;
    store.create_queues().await?;
    Ok(store)
}

async fn cmd_worker(config: Config, id: Option<String>) -> anyhow::Result<()> {
    let _guard = init_telemetry(TelemetryConfig {
        endpoint: config.otel_endpoint.clone(),
        service_name: "runq-worker".to_string(),
    })?;

    let store = Arc::new(connect(&config).await?);

    let mut worker_config = WorkerConfig {
        poll_timeout: config.poll_timeout,
        max_retries: config.max_retries,
        backoff_base: config.backoff_base,
        backoff_cap: config.backoff_cap,
        heartbeat_interval: config.heartbeat_interval,
        ..WorkerConfig::default()
    };
    if let Some(id) = id {
        worker_config.worker_id = id;
    }

    let worker = Worker::new(store, Arc::new(StubExecutor), worker_config);

    let handle = worker.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        handle.shutdown();
    });

    worker.run().await?;
    Ok(())
}

async fn cmd_project(service: &RunService<PgStore>, action: ProjectAction) -> anyhow::Result<()> {
    match action {
        ProjectAction::Create { name } => {
            let project = service.create_project(name).await?;
            println!("Created: {} ({})", project.id, project.name);
        }
        ProjectAction::List { limit } => {
            let projects = service.list_projects(limit).await?;
            if projects.is_empty() {
                println!("No projects found.");
                return Ok(());
            }
            for project in &projects {
                println!(
                    "{}  {:<30}  {}",
                    project.id,
                    project.name,
                    project.created_at.format("%Y-%m-%d %H:%M")
                );
            }
            println!("\n{} project(s)", projects.len());
        }
    }
    Ok(())
}

async fn cmd_run(service: &RunService<PgStore>, action: RunAction) -> anyhow::Result<()> {
    match action {
        RunAction::Submit {
            project,
            kind,
            payload,
            idempotency_key,
        } => {
            let mut new = NewRun::new(project, kind, payload);
            if let Some(key) = idempotency_key {
                new = new.idempotency_key(key);
            }

            let submission = service.submit(new).await?;
            println!(
                "{}: {} (status: {}, idempotent: {})",
                if submission.idempotent {
                    "Existing"
                } else {
                    "Submitted"
                },
                submission.run_id,
                submission.status,
                submission.idempotent
            );
        }
        RunAction::Show { id } => {
            let run_id = service.resolve_run(&id).await?;
            let view = service.fetch(run_id).await?;
            let run = &view.run;

            println!("ID:          {}", run.id);
            println!("Project:     {}", run.project_id);
            println!("Kind:        {}", run.kind);
            println!("Status:      {}", run.status);
            println!("Attempt:     {}", run.attempt);
            println!("Fingerprint: {}", run.fingerprint);
            println!("Created:     {}", run.created_at);
            println!("Updated:     {}", run.updated_at);
            if !view.logs.is_empty() {
                println!("--- logs");
                for line in &view.logs {
                    println!("{line}");
                }
            }
            if let Some(ref result) = run.result {
                println!("--- result");
                println!("{result}");
            }
        }
    }
    Ok(())
}

async fn cmd_status(service: &RunService<PgStore>) -> anyhow::Result<()> {
    let report = service.status().await?;

    println!("Pending:    {}", report.pending);
    println!("Dead:       {}", report.dead);
    println!("Processed:  {}", report.processed);
    println!("Failed:     {}", report.failed);
    if !report.processed_by_kind.is_empty() {
        let mut kinds: Vec<_> = report.processed_by_kind.iter().collect();
        kinds.sort();
        for (kind, count) in kinds {
            println!("  {kind}: {count}");
        }
    }
    match report.heartbeat_age {
        Some(age) => println!("Heartbeat:  {}s ago", age.as_secs()),
        None => println!("Heartbeat:  none (no live worker)"),
    }
    Ok(())
}

async fn cmd_dlq(service: &RunService<PgStore>, action: DlqAction) -> anyhow::Result<()> {
    match action {
        DlqAction::Show { limit } => {
            let items = service.dead_letters(limit).await?;
            if items.is_empty() {
                println!("Dead-letter channel is empty.");
                return Ok(());
            }
            for item in &items {
                println!("{}  {}", item.dead_at.format("%Y-%m-%d %H:%M:%S"), item.reason);
                println!("    {}", item.raw);
            }
            println!("\n{} item(s)", items.len());
        }
        DlqAction::Requeue { limit } => {
            let moved = service.requeue_dead_letters(limit).await?;
            println!("Requeued {moved} item(s)");
        }
    }
    Ok(())
}
