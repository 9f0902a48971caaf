//! Thin CLI binding over the engine: every subcommand maps onto one core
//! operation and prints JSON to stdout.
//!
//! Exit codes: 0 success, 2 invalid argument, 3 not found, 4 conflict or
//! forbidden, 5 i/o, 6 timeout, 1 anything else.

use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use mindcache_config::MindCacheConfig;
use mindcache_core::{
    CallOptions, ErrorKind, Memory, MemoryError, MemoryInput, MindCache, RecallFilter,
    metadata_from_json, metadata_to_json,
};

#[derive(Debug, Parser)]
#[command(
    name = "mindcache",
    version,
    about = "Persistent per-user memory store with decay and recall"
)]
struct Cli {
    /// Storage root; ignored when a frozen config.json already exists there.
    #[arg(long, global = true, default_value = "./mindcache_data")]
    data: PathBuf,
    /// Seed configuration file for a fresh store.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Per-call deadline in milliseconds.
    #[arg(long, global = true)]
    timeout_ms: Option<u64>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Save one memory; prints its id.
    Save {
        #[arg(long)]
        user: String,
        #[arg(long)]
        session: String,
        #[arg(long)]
        content: String,
        #[arg(long)]
        importance: Option<f32>,
        #[arg(long)]
        ttl_hours: Option<u64>,
        /// Metadata as a JSON object.
        #[arg(long)]
        metadata: Option<String>,
        /// Idempotency key for retried saves.
        #[arg(long)]
        request_id: Option<String>,
    },
    /// Recall memories matching the given filters.
    Recall {
        #[arg(long)]
        user: String,
        #[arg(long)]
        session: Option<String>,
        #[arg(long)]
        query: Option<String>,
        #[arg(long = "keyword")]
        keywords: Vec<String>,
        #[arg(long)]
        min_importance: Option<f32>,
        /// RFC 3339 lower bound on created_at.
        #[arg(long)]
        from: Option<String>,
        /// RFC 3339 upper bound on created_at.
        #[arg(long)]
        to: Option<String>,
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Deterministic digest of one session.
    Summarize {
        session: String,
    },
    /// Manage sessions.
    Sessions {
        #[command(subcommand)]
        command: SessionCommands,
    },
    /// Delete one memory by id.
    Delete {
        #[arg(long)]
        user: String,
        id: Uuid,
        #[arg(long)]
        request_id: Option<String>,
    },
    /// Stream every memory for a user as JSON lines.
    Export {
        #[arg(long)]
        user: String,
    },
    /// Run a decay sweep now.
    Decay {
        /// Also compact every sealed segment carrying dead records.
        #[arg(long)]
        force: bool,
    },
    /// Storage, index, and last-decay statistics.
    Stats,
}

#[derive(Debug, Subcommand)]
enum SessionCommands {
    List {
        #[arg(long)]
        user: String,
    },
    Create {
        #[arg(long)]
        user: String,
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        metadata: Option<String>,
        #[arg(long)]
        request_id: Option<String>,
    },
    Update {
        #[arg(long)]
        user: String,
        session: String,
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        metadata: Option<String>,
    },
    Delete {
        #[arg(long)]
        user: String,
        session: String,
        #[arg(long)]
        request_id: Option<String>,
    },
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    if let Err(err) = run(cli) {
        eprintln!("error: {err}");
        std::process::exit(exit_code(&err));
    }
}

fn exit_code(err: &MemoryError) -> i32 {
    match err.kind() {
        ErrorKind::InvalidArgument | ErrorKind::TooLarge | ErrorKind::SessionEmpty => 2,
        ErrorKind::NotFound => 3,
        ErrorKind::Conflict | ErrorKind::Forbidden => 4,
        ErrorKind::Io | ErrorKind::CorruptRecord => 5,
        ErrorKind::Timeout => 6,
        ErrorKind::Internal => 1,
    }
}

fn run(cli: Cli) -> Result<(), MemoryError> {
    let mut config = match &cli.config {
        Some(path) => MindCacheConfig::load_from(path)
            .map_err(|err| MemoryError::InvalidArgument(err.to_string()))?,
        None => MindCacheConfig::default(),
    };
    config.storage_path = cli.data.clone();
    let engine = MindCache::open(config)?;

    let timeout = cli.timeout_ms.map(Duration::from_millis);
    let options = move |request_id: Option<String>| CallOptions {
        request_id,
        timeout,
    };

    match cli.command {
        Commands::Save {
            user,
            session,
            content,
            importance,
            ttl_hours,
            metadata,
            request_id,
        } => {
            let input = MemoryInput {
                user_id: user,
                session_id: session,
                content,
                metadata: parse_metadata(metadata.as_deref())?,
                importance,
                ttl_hours,
            };
            let id = engine.save(input, &options(request_id))?;
            println!("{}", serde_json::json!({ "id": id }));
        }
        Commands::Recall {
            user,
            session,
            query,
            keywords,
            min_importance,
            from,
            to,
            limit,
        } => {
            let filter = RecallFilter {
                user_id: user,
                session_id: session,
                date_from: from.as_deref().map(parse_timestamp).transpose()?,
                date_to: to.as_deref().map(parse_timestamp).transpose()?,
                query,
                keywords,
                min_importance,
                limit,
            };
            let result = engine.recall(&filter, &options(None))?;
            let memories: Vec<_> = result.memories.iter().map(memory_json).collect();
            println!(
                "{}",
                serde_json::json!({ "memories": memories, "count": result.count })
            );
        }
        Commands::Summarize { session } => {
            let digest = engine.summarize(&session, &options(None))?;
            println!(
                "{}",
                serde_json::to_string_pretty(&digest)
                    .map_err(|err| MemoryError::Internal(err.to_string()))?
            );
        }
        Commands::Sessions { command } => match command {
            SessionCommands::List { user } => {
                let sessions = engine.list_sessions(&user)?;
                println!(
                    "{}",
                    serde_json::to_string_pretty(&sessions)
                        .map_err(|err| MemoryError::Internal(err.to_string()))?
                );
            }
            SessionCommands::Create {
                user,
                name,
                metadata,
                request_id,
            } => {
                let session_id = engine.create_session(
                    &user,
                    name,
                    parse_metadata(metadata.as_deref())?,
                    &options(request_id),
                )?;
                println!("{}", serde_json::json!({ "session_id": session_id }));
            }
            SessionCommands::Update {
                user,
                session,
                name,
                metadata,
            } => {
                engine.update_session(&user, &session, name, parse_metadata(metadata.as_deref())?)?;
                println!("{}", serde_json::json!({ "updated": session }));
            }
            SessionCommands::Delete {
                user,
                session,
                request_id,
            } => {
                let removed = engine.delete_session(&user, &session, &options(request_id))?;
                println!("{}", serde_json::json!({ "memories_deleted": removed }));
            }
        },
        Commands::Delete {
            user,
            id,
            request_id,
        } => {
            engine.delete_memory(&user, id, &options(request_id))?;
            println!("{}", serde_json::json!({ "deleted": id }));
        }
        Commands::Export { user } => {
            for memory in engine.export_user(&user)? {
                println!("{}", memory_json(&memory?));
            }
        }
        Commands::Decay { force } => {
            let stats = engine.run_decay(force)?;
            println!(
                "{}",
                serde_json::to_string_pretty(&stats)
                    .map_err(|err| MemoryError::Internal(err.to_string()))?
            );
        }
        Commands::Stats => {
            let stats = engine.stats();
            println!(
                "{}",
                serde_json::to_string_pretty(&stats)
                    .map_err(|err| MemoryError::Internal(err.to_string()))?
            );
        }
    }

    engine.close()?;
    Ok(())
}

fn parse_metadata(raw: Option<&str>) -> Result<mindcache_core::Metadata, MemoryError> {
    match raw {
        None => Ok(Default::default()),
        Some(raw) => {
            let value: serde_json::Value = serde_json::from_str(raw)
                .map_err(|err| MemoryError::InvalidArgument(format!("metadata is not JSON: {err}")))?;
            metadata_from_json(&value)
        }
    }
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, MemoryError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|at| at.with_timezone(&Utc))
        .map_err(|err| {
            MemoryError::InvalidArgument(format!("timestamp {raw} is not RFC 3339: {err}"))
        })
}

/// External JSON shape for one memory; metadata rendered as plain JSON.
fn memory_json(memory: &Memory) -> serde_json::Value {
    serde_json::json!({
        "id": memory.id,
        "user_id": memory.user_id,
        "session_id": memory.session_id,
        "content": memory.content,
        "metadata": metadata_to_json(&memory.metadata),
        "importance": memory.importance,
        "created_at": memory.created_at,
        "expires_at": memory.expires_at,
        "last_accessed_at": memory.last_accessed_at,
        "access_count": memory.access_count,
    })
}
