use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use serde::Serialize;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;
use tracing_subscriber::EnvFilter;

use gantry::config::{GantryConfig, MonitoringConfig, SandboxConfig};
use gantry::credentials::CredentialRequirement;
use gantry::job::{ApplicationRef, BackendRef, Fqid, Job, JobSpec, JobStatus};
use gantry::registry::{IndexFilter, TransitionEvent};
use gantry::session::Session;
use gantry::shutdown::install_shutdown_handler;

type CliResult = Result<(), Box<dyn std::error::Error>>;

#[derive(Parser, Debug)]
#[command(name = "gantry")]
#[command(version)]
#[command(about = "Persistent job registry with backend monitoring")]
#[command(propagate_version = true)]
struct Args {
    /// Repository root directory
    #[arg(long, short = 'r', global = true, default_value = "gantry")]
    root: PathBuf,

    /// Output format
    #[arg(long, short = 'o', global = true, default_value = "table")]
    output: OutputFormat,

    /// Number of worker pool executors
    #[arg(long, global = true, default_value = "3")]
    workers: usize,

    /// Run local jobs inside a Docker container
    #[arg(long, global = true)]
    sandbox: bool,

    /// Docker image to use for sandboxed jobs
    #[arg(long, global = true, default_value = "alpine:latest")]
    image: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Job management commands
    Job {
        #[command(subcommand)]
        command: JobCommands,
    },

    /// Backend status monitoring
    Monitor {
        #[command(subcommand)]
        command: MonitorCommands,
    },

    /// Print the job status transition graph
    Graph {
        #[arg(long, default_value = "table")]
        format: GraphFormat,

        /// Include the administrative forced transitions
        #[arg(long)]
        forced: bool,
    },

    /// Sessions sharing this repository
    Session {
        #[command(subcommand)]
        command: SessionCommands,
    },
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

#[derive(Debug, Clone, ValueEnum)]
enum GraphFormat {
    Table,
    Json,
    Dot,
}

// =============================================================================
// Job Commands
// =============================================================================

#[derive(clap::Subcommand, Debug)]
enum JobCommands {
    /// Create a new job running a shell command
    Create {
        /// The command to execute (e.g., "echo hello")
        command: String,

        #[arg(long)]
        name: Option<String>,

        /// Backend to run on
        #[arg(long, default_value = "local")]
        backend: String,

        /// Number of subjobs, each running the command
        #[arg(long, default_value = "0")]
        subjobs: usize,

        #[arg(long)]
        comment: Option<String>,

        /// Credential needed to submit, as kind[:vo][/role]
        #[arg(long)]
        credential: Option<CredentialRequirement>,

        /// Submit right after creating
        #[arg(long)]
        submit: bool,
    },
    /// Submit a new job to its backend
    Submit { id: u64 },
    /// Kill a submitted or running job
    Kill { id: u64 },
    /// Submit the failed or killed parts of a job again
    Resubmit { id: u64 },
    /// Delete a job, killing it first if it is still active
    Remove {
        id: u64,

        /// Delete without killing
        #[arg(long)]
        force: bool,
    },
    /// Set a status bypassing the transition graph
    Force {
        /// Job or subjob id (e.g. 12 or 12.3)
        fqid: Fqid,
        status: JobStatus,

        #[arg(long, default_value = "manual repair")]
        reason: String,
    },
    /// Show a job or subjob
    Show { fqid: Fqid },
    /// List jobs from the index without loading them
    List {
        #[arg(long)]
        status: Vec<JobStatus>,

        #[arg(long)]
        backend: Option<String>,

        /// Substring of the job name
        #[arg(long)]
        name: Option<String>,
    },
}

// =============================================================================
// Monitor and Session Commands
// =============================================================================

#[derive(clap::Subcommand, Debug)]
enum MonitorCommands {
    /// Poll backends until interrupted
    Run {
        /// Run a single cycle and exit
        #[arg(long)]
        once: bool,

        /// Base loop interval in milliseconds
        #[arg(long, default_value = "2000")]
        interval_ms: u64,

        /// Poll interval for every backend in milliseconds
        #[arg(long)]
        backend_interval_ms: Option<u64>,
    },
}

#[derive(clap::Subcommand, Debug)]
enum SessionCommands {
    /// List live sessions on this repository
    List,
    /// Clear locks left behind by dead sessions
    Reap,
}

// =============================================================================
// JSON Output Types
// =============================================================================

#[derive(Serialize)]
struct JobOutput {
    id: String,
    name: String,
    status: JobStatus,
    application: String,
    command: Option<String>,
    backend: String,
    remote_id: Option<String>,
    comment: String,
    created_at: String,
    subjobs: Vec<JobOutput>,
}

impl From<&Job> for JobOutput {
    fn from(job: &Job) -> Self {
        Self {
            id: job.fqid().to_string(),
            name: job.name.clone(),
            status: job.status(),
            application: job.application().kind.clone(),
            command: job.application().setting("command").map(str::to_string),
            backend: job.backend().kind.clone(),
            remote_id: job.remote_id().map(str::to_string),
            comment: job.comment().to_string(),
            created_at: job.created_at.to_rfc3339(),
            subjobs: job.subjobs().iter().map(JobOutput::from).collect(),
        }
    }
}

#[derive(Serialize)]
struct OperationOutput {
    id: String,
    operation: &'static str,
    status: JobStatus,
}

// =============================================================================
// Helper Functions
// =============================================================================

fn init_logging(default: &str) {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default)),
        )
        .with_writer(std::io::stderr)
        .init();
}

fn print_operation(id: u64, operation: &'static str, status: JobStatus, output: &OutputFormat) -> CliResult {
    match output {
        OutputFormat::Json => {
            let out = OperationOutput {
                id: id.to_string(),
                operation,
                status,
            };
            println!("{}", serde_json::to_string_pretty(&out)?);
        }
        OutputFormat::Table => {
            println!("Job {} {}: {}", id, operation, status);
        }
    }
    Ok(())
}

fn print_event(event: &TransitionEvent, output: &OutputFormat) -> CliResult {
    match output {
        OutputFormat::Json => println!("{}", serde_json::to_string(event)?),
        OutputFormat::Table => {
            let marker = if event.forced { " (forced)" } else { "" };
            println!(
                "{}  {:<8} {} -> {}{}",
                event.at.format("%H:%M:%S"),
                event.fqid,
                event.from,
                event.to,
                marker
            );
        }
    }
    Ok(())
}

fn truncate(text: &str, max: usize) -> String {
    if text.chars().count() > max {
        let kept: String = text.chars().take(max.saturating_sub(3)).collect();
        format!("{}...", kept)
    } else {
        text.to_string()
    }
}

// =============================================================================
// Job Command Handlers
// =============================================================================

async fn handle_job(session: &Session, command: JobCommands, output: &OutputFormat) -> CliResult {
    let registry = &session.registry;
    match command {
        JobCommands::Create {
            command,
            name,
            backend,
            subjobs,
            comment,
            credential,
            submit,
        } => {
            let mut spec = JobSpec::new(ApplicationRef::executable(command), BackendRef::new(backend))
                .with_subjobs(subjobs);
            if let Some(name) = name {
                spec = spec.with_name(name);
            }
            if let Some(comment) = comment {
                spec = spec.with_comment(comment);
            }
            if let Some(credential) = credential {
                spec = spec.with_credential(credential);
            }

            let job = registry.create(spec).await?;
            match output {
                OutputFormat::Json => {
                    println!("{}", serde_json::to_string_pretty(&JobOutput::from(&job))?)
                }
                OutputFormat::Table => println!("Job created with ID: {}", job.id),
            }
            if submit {
                let status = registry.submit(job.id).await?.wait().await?;
                print_operation(job.id, "submitted", status, output)?;
            }
        }
        JobCommands::Submit { id } => {
            let status = registry.submit(id).await?.wait().await?;
            print_operation(id, "submitted", status, output)?;
        }
        JobCommands::Kill { id } => {
            let status = registry.kill(id).await?.wait().await?;
            print_operation(id, "killed", status, output)?;
        }
        JobCommands::Resubmit { id } => {
            let status = registry.resubmit(id).await?.wait().await?;
            print_operation(id, "resubmitted", status, output)?;
        }
        JobCommands::Remove { id, force } => {
            registry.remove(id, force).await?;
            print_operation(id, "removed", JobStatus::Removed, output)?;
        }
        JobCommands::Force {
            fqid,
            status,
            reason,
        } => {
            let job = registry.force_status(fqid, status, reason).await?;
            print_operation(fqid.id, "forced", job.status(), output)?;
        }
        JobCommands::Show { fqid } => {
            let job = registry.get_fqid(fqid).await?;
            handle_job_show(&job, output)?;
        }
        JobCommands::List {
            status,
            backend,
            name,
        } => {
            let filter = IndexFilter {
                statuses: status,
                backend,
                application: None,
                name,
            };
            handle_job_list(session, &filter, output).await?;
        }
    }
    Ok(())
}

fn handle_job_show(job: &Job, output: &OutputFormat) -> CliResult {
    match output {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&JobOutput::from(job))?);
        }
        OutputFormat::Table => {
            println!("Job ID:      {}", job.fqid());
            println!("Name:        {}", job.name);
            println!("Status:      {}", job.status());
            println!("Application: {}", job.application().kind);
            if let Some(command) = job.application().setting("command") {
                println!("Command:     {}", command);
            }
            println!("Backend:     {}", job.backend().kind);
            if let Some(remote_id) = job.remote_id() {
                println!("Remote ID:   {}", remote_id);
            }
            if let Some(credential) = &job.credential {
                println!("Credential:  {}", credential);
            }
            if !job.comment().is_empty() {
                println!("Comment:     {}", job.comment());
            }
            println!("Created:     {}", job.created_at.to_rfc3339());
            for status in JobStatus::ALL {
                if let Some(at) = job.status_time(status) {
                    println!("  {:<11} {}", status, at.to_rfc3339());
                }
            }

            if !job.subjobs().is_empty() {
                println!();
                println!("{:<10} {:<12} REMOTE ID", "SUBJOB", "STATUS");
                println!("{}", "-".repeat(40));
                for sub in job.subjobs() {
                    println!(
                        "{:<10} {:<12} {}",
                        sub.fqid(),
                        sub.status(),
                        sub.remote_id().unwrap_or("-")
                    );
                }
            }
        }
    }
    Ok(())
}

async fn handle_job_list(session: &Session, filter: &IndexFilter, output: &OutputFormat) -> CliResult {
    let records = session.registry.select(filter).await;
    match output {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&records)?);
        }
        OutputFormat::Table => {
            if records.is_empty() {
                println!("No jobs found.");
            } else {
                println!(
                    "{:<8} {:<12} {:<10} {:<8} NAME",
                    "JOB ID", "STATUS", "BACKEND", "SUBJOBS"
                );
                println!("{}", "-".repeat(60));
                for record in &records {
                    println!(
                        "{:<8} {:<12} {:<10} {:<8} {}",
                        record.fqid,
                        record.status,
                        truncate(&record.backend, 10),
                        record.subjobs,
                        truncate(&record.name, 24)
                    );
                }
                println!();
                println!("Showing {} jobs", records.len());
            }
            let incomplete = session.registry.incomplete().await;
            if !incomplete.is_empty() {
                println!("{} job(s) could not be read:", incomplete.len());
                for (id, reason) in incomplete {
                    println!("  {}: {}", id, reason);
                }
            }
        }
    }
    Ok(())
}

// =============================================================================
// Monitor, Graph and Session Handlers
// =============================================================================

async fn handle_monitor_run(session: &Session, once: bool, output: &OutputFormat) -> CliResult {
    if once {
        let report = session.monitor.run_cycle().await;
        match output {
            OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&report)?),
            OutputFormat::Table => {
                println!("Polled:   {}", report.polled);
                println!("Applied:  {}", report.applied);
                println!("Rejected: {}", report.rejected);
                println!("Skipped:  {}", report.skipped);
                for error in &report.errors {
                    println!("Error:    {}", error);
                }
            }
        }
        if !report.errors.is_empty() {
            return Err(format!("{} error(s) during monitoring cycle", report.errors.len()).into());
        }
        return Ok(());
    }

    let shutdown = install_shutdown_handler()?;
    let mut events = BroadcastStream::new(session.registry.subscribe());
    session.monitor.start().await;
    session.monitor.poll_now();

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            event = events.next() => match event {
                Some(Ok(event)) => print_event(&event, output)?,
                Some(Err(e)) => tracing::warn!(error = %e, "Missed transition events"),
                None => break,
            },
        }
    }
    Ok(())
}

fn handle_graph(session: &Session, format: GraphFormat, forced: bool) -> CliResult {
    let export = session.registry.graph().export(forced);
    match format {
        GraphFormat::Json => println!("{}", serde_json::to_string_pretty(&export)?),
        GraphFormat::Dot => print!("{}", export.to_dot()),
        GraphFormat::Table => {
            let names = |states: &[JobStatus]| {
                states
                    .iter()
                    .map(JobStatus::to_string)
                    .collect::<Vec<_>>()
                    .join(", ")
            };
            println!("Initial:   {}", names(export.initial.as_slice()));
            println!("Transient: {}", names(export.transient.as_slice()));
            println!();
            println!("{:<12} {:<12} {:<30} FORCED", "FROM", "TO", "LABEL");
            println!("{}", "-".repeat(62));
            for edge in &export.edges {
                println!(
                    "{:<12} {:<12} {:<30} {}",
                    edge.from,
                    edge.to,
                    truncate(&edge.label, 30),
                    if edge.forced { "yes" } else { "" }
                );
            }
        }
    }
    Ok(())
}

async fn handle_session(session: &Session, command: SessionCommands, output: &OutputFormat) -> CliResult {
    match command {
        SessionCommands::List => {
            let sessions = session.repository.sessions().await?;
            match output {
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&sessions)?),
                OutputFormat::Table => {
                    println!("{:<38} {:<8} {:<26} HEARTBEAT", "SESSION", "PID", "STARTED");
                    println!("{}", "-".repeat(98));
                    for info in sessions {
                        let marker = if info.id == session.repository.session_id() {
                            " (this)"
                        } else {
                            ""
                        };
                        println!(
                            "{:<38} {:<8} {:<26} {}{}",
                            info.id,
                            info.pid,
                            info.started_at.to_rfc3339(),
                            info.heartbeat_at.to_rfc3339(),
                            marker
                        );
                    }
                }
            }
        }
        SessionCommands::Reap => {
            let reaped = session.repository.reap_locks().await?;
            match output {
                OutputFormat::Json => {
                    let keys: Vec<String> = reaped.iter().map(ToString::to_string).collect();
                    println!("{}", serde_json::to_string_pretty(&keys)?);
                }
                OutputFormat::Table => println!("Reaped {} stale lock(s)", reaped.len()),
            }
        }
    }
    Ok(())
}

// =============================================================================
// Main Entry Point
// =============================================================================

async fn run(args: Args) -> CliResult {
    let mut config = GantryConfig::new(&args.root);
    config.pool = config.pool.with_workers(args.workers);
    config = config.with_sandbox(SandboxConfig {
        enabled: args.sandbox,
        image: args.image.clone(),
        ..SandboxConfig::default()
    });

    if let Commands::Monitor {
        command:
            MonitorCommands::Run {
                interval_ms,
                backend_interval_ms,
                ..
            },
    } = &args.command
    {
        let mut monitoring =
            MonitoringConfig::default().with_poll_interval(Duration::from_millis(*interval_ms));
        if let Some(ms) = backend_interval_ms {
            monitoring = monitoring.with_default_backend_interval(Duration::from_millis(*ms));
        }
        config = config.with_monitoring(monitoring);
    }

    let session = Session::open(config).await?;
    let result = match args.command {
        Commands::Job { command } => handle_job(&session, command, &args.output).await,
        Commands::Monitor {
            command: MonitorCommands::Run { once, .. },
        } => handle_monitor_run(&session, once, &args.output).await,
        Commands::Graph { format, forced } => handle_graph(&session, format, forced),
        Commands::Session { command } => handle_session(&session, command, &args.output).await,
    };

    session.close().await?;
    result
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    let default_level = match args.command {
        Commands::Monitor { .. } => "info",
        _ => "warn",
    };
    init_logging(default_level);

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}
