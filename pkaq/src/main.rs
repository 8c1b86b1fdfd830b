use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use futures::StreamExt;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use pkaq::cluster::{ClusterDispatcher, SlurmCli};
use pkaq::persistence::{connect, run_migrations, PostgresAdmissionQueue, PostgresLifecycleStore};
use pkaq::{
    run_computation, AdmissionProbe, AdmissionQueue, ClusterProbe, CommandRoutine,
    CompositeProbe, ComputationRunner, DispatchMode, InProcEventBus, JobDispatcher,
    JobEventPayload, JobId, JobToken, LeaseExpiryScanner, LifecycleStore, LocalDispatcher,
    LogSource, OrchestratorRuntimeBuilder, OrchestratorRuntimeConfig, ParameterBag, PkaqConfig,
    ProgressReporter, ProteinId, SubmissionRequest, WorkItem,
};

#[derive(Parser, Debug)]
#[command(name = "pkaq")]
#[command(version)]
#[command(about = "FIFO admission and dispatch for protein titration jobs")]
#[command(propagate_version = true)]
struct Args {
    /// Path to the TOML configuration file
    #[arg(long, short = 'c', global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Submit a request and wait until its job finishes
    Submit {
        /// JSON file holding the submission request
        request: PathBuf,
    },

    /// Run one computation and record its outcome (cluster entry point)
    RunComputation {
        #[arg(long)]
        parameters: PathBuf,
        #[arg(long)]
        token: String,
        #[arg(long)]
        job_id: i64,
        #[arg(long)]
        protein_id: i64,
    },

    /// Print the status document for a token
    Status { token: String },

    /// Stream status documents until the job reaches a terminal state
    Watch { token: String },

    /// Admission queue maintenance
    Queue {
        #[command(subcommand)]
        command: QueueCommands,
    },

    /// List recent submissions
    Submissions {
        #[arg(long, default_value = "25")]
        limit: usize,
    },

    /// Create the database schema
    Migrate,
}

#[derive(Subcommand, Debug)]
enum QueueCommands {
    /// Show queued entries in arrival order
    List,
    /// Drop entries whose lease expired
    EvictExpired,
    /// Remove every entry for a token
    Remove { token: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let config = match &args.config {
        Some(path) => PkaqConfig::load(path)
            .with_context(|| format!("failed to load config from {}", path.display()))?,
        None => PkaqConfig::default(),
    };

    let pool = connect(&config.persistence)
        .await
        .context("failed to connect to the database")?;
    let store = Arc::new(PostgresLifecycleStore::new(pool.clone()));
    let queue = Arc::new(PostgresAdmissionQueue::new(pool.clone()));

    match args.command {
        Commands::Migrate => {
            run_migrations(&pool).await?;
            info!("schema is up to date");
        }
        Commands::RunComputation {
            parameters,
            token,
            job_id,
            protein_id,
        } => {
            let raw = tokio::fs::read_to_string(&parameters)
                .await
                .with_context(|| format!("failed to read {}", parameters.display()))?;
            let parameters: ParameterBag = serde_json::from_str(&raw)?;
            let work = WorkItem {
                token: JobToken::new(token),
                job_id: JobId(job_id),
                protein_id: ProteinId(protein_id),
                parameters,
            };
            let runner = ComputationRunner::new(
                CommandRoutine::new(
                    config.runner.routine_program.clone(),
                    config.runner.routine_version.clone(),
                ),
                config.runner.clone(),
            );
            let outcome = run_computation(&runner, store.as_ref(), &work).await?;
            info!(token = %work.token, outcome = outcome.label(), "computation finished");
        }
        Commands::Status { token } => {
            let reporter = reporter(&config, queue, store);
            let report = reporter.status(&JobToken::new(token)).await?;
            println!("{}", serde_json::to_string_pretty(&report.to_wire())?);
        }
        Commands::Watch { token } => {
            let reporter = reporter(&config, queue, store);
            let stream = reporter.stream(JobToken::new(token));
            futures::pin_mut!(stream);
            while let Some(report) = stream.next().await {
                let report = report?;
                println!("{}", serde_json::to_string(&report.to_wire())?);
            }
        }
        Commands::Queue { command } => match command {
            QueueCommands::List => {
                for entry in queue.entries().await? {
                    println!(
                        "{}\t{}\t{}\t{}",
                        entry.lease_id, entry.token, entry.holder, entry.expires_at
                    );
                }
            }
            QueueCommands::EvictExpired => {
                let evicted = queue.evict_expired().await?;
                for entry in &evicted {
                    warn!(token = %entry.token, lease_id = %entry.lease_id, "evicted expired entry");
                }
                println!("{} entries evicted", evicted.len());
            }
            QueueCommands::Remove { token } => {
                let removed = queue.remove_token(&JobToken::new(token)).await?;
                println!("{} entries removed", removed);
            }
        },
        Commands::Submissions { limit } => {
            for summary in store.recent_submissions(limit).await? {
                println!(
                    "{}\t{}\t{}\t{}",
                    summary.token,
                    summary.submitted_at.to_rfc3339(),
                    summary.protein_name.as_deref().unwrap_or("-"),
                    if summary.queued { "queued" } else { "done" }
                );
            }
        }
        Commands::Submit { request } => {
            let raw = tokio::fs::read_to_string(&request)
                .await
                .with_context(|| format!("failed to read {}", request.display()))?;
            let request: SubmissionRequest = serde_json::from_str(&raw)?;

            match config.dispatch.cluster_strategy() {
                None => {
                    let runner = ComputationRunner::new(
                        CommandRoutine::new(
                            config.runner.routine_program.clone(),
                            config.runner.routine_version.clone(),
                        ),
                        config.runner.clone(),
                    );
                    let dispatcher = LocalDispatcher::new(runner, Arc::clone(&store));
                    submit_and_wait(&config, queue, store, dispatcher, request).await?;
                }
                Some(strategy) => {
                    let events = Arc::new(InProcEventBus::default());
                    let dispatcher = ClusterDispatcher::new(
                        Arc::new(SlurmCli::new()),
                        Arc::clone(&store),
                        config.cluster.clone(),
                        strategy,
                    )
                    .with_events(Arc::clone(&events));
                    submit_and_wait_with(&config, queue, store, dispatcher, events, request)
                        .await?;
                }
            }
        }
    }

    Ok(())
}

fn reporter(
    config: &PkaqConfig,
    queue: Arc<PostgresAdmissionQueue>,
    store: Arc<PostgresLifecycleStore>,
) -> ProgressReporter<PostgresLifecycleStore> {
    let mut probe = CompositeProbe::new().with(Arc::new(AdmissionProbe::new(queue)));
    if config.dispatch != DispatchMode::Local {
        probe = probe.with(Arc::new(ClusterProbe::new(
            Arc::new(SlurmCli::new()),
            config.cluster.job_name_prefix.clone(),
        )));
    }
    ProgressReporter::new(
        store,
        Arc::new(probe),
        LogSource::for_config(config),
        config.progress.clone(),
    )
}

async fn submit_and_wait<Q, S, D>(
    config: &PkaqConfig,
    queue: Arc<Q>,
    store: Arc<S>,
    dispatcher: D,
    request: SubmissionRequest,
) -> Result<()>
where
    Q: AdmissionQueue + LeaseExpiryScanner + 'static,
    S: LifecycleStore + 'static,
    D: JobDispatcher + 'static,
{
    let events = Arc::new(InProcEventBus::default());
    submit_and_wait_with(config, queue, store, dispatcher, events, request).await
}

async fn submit_and_wait_with<Q, S, D>(
    config: &PkaqConfig,
    queue: Arc<Q>,
    store: Arc<S>,
    dispatcher: D,
    events: Arc<InProcEventBus>,
    request: SubmissionRequest,
) -> Result<()>
where
    Q: AdmissionQueue + LeaseExpiryScanner + 'static,
    S: LifecycleStore + 'static,
    D: JobDispatcher + 'static,
{
    let runtime = OrchestratorRuntimeBuilder::new(OrchestratorRuntimeConfig::from(config))
        .with_queue(queue)
        .with_store(store)
        .with_dispatcher(Arc::new(dispatcher))
        .with_events(events)
        .build()?;

    let mut rx = runtime.events().subscribe();
    let housekeeper = runtime.spawn_housekeeper();
    let receipt = runtime.submit(request).await?;
    println!(
        "{}",
        serde_json::json!({ "subID": receipt.token, "job_id": receipt.job_id.0 })
    );

    let succeeded = loop {
        tokio::select! {
            event = rx.recv() => match event {
                Ok(event) if event.meta.token == receipt.token => {
                    if let JobEventPayload::Finished { succeeded } = event.payload {
                        break succeeded;
                    }
                }
                Ok(_) => {}
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "event receiver lagged");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                    bail!("event bus closed before job {} finished", receipt.token);
                }
            },
            _ = tokio::signal::ctrl_c() => {
                warn!(token = %receipt.token, "interrupted, shutting down");
                break false;
            }
        }
    };

    runtime.shutdown().await?;
    housekeeper.abort();
    info!(token = %receipt.token, succeeded, "submission finished");
    Ok(())
}
