use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use prism_ai_review::config::ServiceConfig;
use prism_ai_review::intake::InboundEvent;
use prism_ai_review::pipeline::DirectorySource;
use prism_ai_review::retrieval::ChangedFile;
use prism_ai_review::service::ReviewContext;
use prism_ai_review::storage::EmbeddingJob;
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::info;

/// Event intake, embedding queue and review-context retrieval.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// TOML configuration file; built-in defaults when omitted
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Database file, overriding `[store].path`
    #[arg(long)]
    db: Option<PathBuf>,

    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create the database and its tables
    Init,
    /// Claim a webhook event read from a JSON file
    Claim {
        /// JSON payload of the event ("-" for stdin)
        event: PathBuf,
        /// Event kind, e.g. merge_request, push, note, reaction
        #[arg(short, long)]
        kind: String,
    },
    /// Mark a claim completed
    Complete { id: i64 },
    /// Mark a claim failed
    Fail {
        id: i64,
        #[arg(short, long)]
        reason: String,
    },
    /// Queue an embedding job
    Enqueue {
        #[arg(long)]
        resource: String,
        /// Checkout directory the worker reads files from
        #[arg(long)]
        location: String,
        /// Identifier callers can await on
        #[arg(long)]
        correlation: String,
        /// Higher runs first; defaults to `[queue].default_priority`
        #[arg(short, long)]
        priority: Option<i64>,
        /// Replace existing records of the resource
        #[arg(long)]
        reembed: bool,
    },
    /// Wait for the job with a correlation id to finish
    Await {
        correlation: String,
        #[arg(short, long, default_value_t = 30)]
        timeout_secs: u64,
    },
    /// List recent jobs
    Jobs {
        #[arg(short, long, default_value_t = 20)]
        limit: u32,
        #[arg(long, default_value_t = 0)]
        offset: u32,
        #[arg(short, long, default_value = "summary")]
        format: OutputFormat,
    },
    /// Show claim and job counts
    Stats,
    /// Process queued jobs and reap stale claims until Ctrl-C
    Worker,
    /// Select review context for changed files
    Context {
        #[arg(long)]
        resource: String,
        /// Changed file paths, relative to --root
        #[arg(long = "changed", num_args = 1..)]
        changed: Vec<String>,
        /// Directory the changed files are read from
        #[arg(long, default_value = ".")]
        root: PathBuf,
        #[arg(short, long, default_value = "summary")]
        format: OutputFormat,
    },
    /// Show comprehensive status information
    Status {
        #[arg(short, long, default_value = "summary")]
        format: OutputFormat,
    },
}

#[derive(Debug, Clone, PartialEq)]
enum OutputFormat {
    Summary,
    Json,
}

impl std::str::FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "summary" => Ok(OutputFormat::Summary),
            "json" => Ok(OutputFormat::Json),
            _ => Err(format!("Invalid format: {s}")),
        }
    }
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    let level = match args.verbose {
        0 => tracing::Level::INFO,
        1 => tracing::Level::DEBUG,
        _ => tracing::Level::TRACE,
    };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = run(args).await {
        eprintln!("Error: {e:#}");
        process::exit(1);
    }
}

fn print_job(job: &EmbeddingJob) {
    println!(
        "  #{} | {} | resource {} | priority {} | attempts {}/{} | {}{}",
        job.id,
        job.status,
        job.resource_id,
        job.priority,
        job.attempts,
        job.max_attempts,
        job.correlation_id,
        job.last_error
            .as_deref()
            .map(|e| format!(" | last error: {e}"))
            .unwrap_or_default()
    );
}

async fn run(args: Args) -> anyhow::Result<()> {
    let mut config = ServiceConfig::load_or_default(args.config.as_deref())?;
    if let Some(db) = args.db {
        config.store.path = db;
    }
    let ctx = ReviewContext::open(config).await?;

    match args.command {
        Commands::Init => {
            println!(
                "Initialized database at {}",
                ctx.config().store.path.display()
            );
        }
        Commands::Claim { event, kind } => {
            let raw = if event.as_os_str() == "-" {
                std::io::read_to_string(std::io::stdin()).context("Failed to read stdin")?
            } else {
                std::fs::read_to_string(&event)
                    .with_context(|| format!("Failed to read {}", event.display()))?
            };
            let payload: serde_json::Value =
                serde_json::from_str(&raw).context("Event payload is not valid JSON")?;
            let event = InboundEvent::from_payload(&kind, &payload);
            let outcome = ctx.guard().claim(&event).await?;
            println!("{}", serde_json::to_string_pretty(&outcome)?);
        }
        Commands::Complete { id } => {
            if !ctx.guard().complete(id).await? {
                bail!("Claim {id} is not active");
            }
            println!("Claim {id} completed");
        }
        Commands::Fail { id, reason } => {
            if !ctx.guard().fail(id, &reason).await? {
                bail!("Claim {id} is not active");
            }
            println!("Claim {id} failed");
        }
        Commands::Enqueue {
            resource,
            location,
            correlation,
            priority,
            reembed,
        } => {
            let priority = priority.unwrap_or(ctx.config().queue.default_priority);
            let job = ctx
                .queue()
                .enqueue(&resource, &location, &correlation, priority, reembed)
                .await?;
            println!("{}", serde_json::to_string_pretty(&job)?);
        }
        Commands::Await {
            correlation,
            timeout_secs,
        } => {
            let job = ctx
                .queue()
                .await_completion(&correlation, Duration::from_secs(timeout_secs))
                .await?;
            match job {
                Some(job) => println!("{}", serde_json::to_string_pretty(&job)?),
                None => bail!("No job with correlation id {correlation}"),
            }
        }
        Commands::Jobs {
            limit,
            offset,
            format,
        } => {
            let jobs = ctx.queue().recent_jobs(limit, offset).await?;
            match format {
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&jobs)?),
                OutputFormat::Summary => {
                    println!("Found {} jobs:", jobs.len());
                    jobs.iter().for_each(print_job);
                }
            }
        }
        Commands::Stats => {
            let stats = serde_json::json!({
                "claims": ctx.guard().stats().await?,
                "jobs": ctx.queue().stats().await?,
            });
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }
        Commands::Worker => {
            let (shutdown_tx, shutdown_rx) = watch::channel(false);
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    info!("Shutdown requested");
                }
                let _ = shutdown_tx.send(true);
            });
            let processed = ctx
                .run_worker(Arc::new(DirectorySource::new()), shutdown_rx)
                .await?;
            println!("Processed {processed} jobs");
        }
        Commands::Context {
            resource,
            changed,
            root,
            format,
        } => {
            let changed: Vec<ChangedFile> = changed
                .into_iter()
                .map(|path| {
                    let content = std::fs::read_to_string(root.join(&path)).unwrap_or_default();
                    ChangedFile::new(path, content)
                })
                .collect();
            let result = ctx.context_engine().get_context(&resource, &changed).await?;
            match format {
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&result)?),
                OutputFormat::Summary => {
                    if result.ranked_files.is_empty() {
                        if result.embedding_in_progress {
                            println!("No context yet: embedding for {resource} is in progress");
                        } else {
                            println!("No context available for {resource}");
                        }
                    } else {
                        print!("{}", result.summary);
                    }
                }
            }
        }
        Commands::Status { format } => {
            let status = ctx.status().await?;
            match format {
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&status)?),
                OutputFormat::Summary => print!("{status}"),
            }
        }
    }

    ctx.store().close().await;
    Ok(())
}
