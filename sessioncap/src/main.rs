//! sessioncap - session capture from the command line
//!
//! This tool provides commands for:
//! - Checking tracker configuration and persisted identity
//! - Recording a session from a stream of JSONL messages
//! - Forcing a new session or wiping persisted identity
//! - Checking tracker version compatibility
//!
//! Uses XDG Base Directory specification for file locations:
//! - Config: $XDG_CONFIG_HOME/sessioncap/config.toml (~/.config/sessioncap/config.toml)
//! - User UUID: $XDG_DATA_HOME/sessioncap/durable.json
//! - Session token and page counter: $XDG_STATE_HOME/sessioncap/session.json

use std::io::{BufRead, BufReader};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use sessioncap_core::config::TrackerConfig;
use sessioncap_core::storage::{FileStorage, PersistedState, Storage};
use sessioncap_core::worker::{HttpWorker, WorkerConfig};
use sessioncap_core::{App, Config, Message, StartOptions, TRACKER_VERSION};

#[derive(Parser)]
#[command(name = "sessioncap")]
#[command(about = "Record sessions against an ingest service")]
#[command(version)]
struct Args {
    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Show tracker configuration and persisted identity
    Status,

    /// Start a session, stream messages into it, then stop
    Record {
        /// JSONL file of messages, or `-` for stdin
        #[arg(short, long, default_value = "-")]
        input: String,

        /// Project key (default: from config)
        #[arg(long)]
        project_key: Option<String>,

        /// User id to attach to the session
        #[arg(long)]
        user_id: Option<String>,

        /// Session metadata as key=value, may be repeated
        #[arg(long = "metadata", value_parser = parse_key_value)]
        metadata: Vec<(String, String)>,

        /// Ask the ingest service for a new session
        #[arg(long)]
        force_new: bool,
    },

    /// Make the next recording start a new session
    Reset {
        /// Wipe all persisted identity instead, including the user UUID
        #[arg(long)]
        all: bool,
    },

    /// Check that this tracker satisfies a required version
    CheckVersion {
        /// Required version, e.g. 1.2.0
        required: String,
    },
}

fn parse_key_value(s: &str) -> std::result::Result<(String, String), String> {
    match s.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected key=value, got '{}'", s)),
    }
}

fn main() -> Result<()> {
    let args = Args::parse();

    // Load configuration
    let config = Config::load().context("failed to load configuration")?;

    // Initialize logging if verbose
    let _log_guard = if args.verbose {
        Some(sessioncap_core::logging::init(&config.logging).context("failed to initialize logging")?)
    } else {
        None
    };

    match args.command {
        Command::Status => cmd_status(&config),
        Command::Record {
            input,
            project_key,
            user_id,
            metadata,
            force_new,
        } => {
            let options = StartOptions {
                user_id,
                metadata: metadata.into_iter().collect(),
                force_new,
            };
            cmd_record(config, project_key, &input, options)
        }
        Command::Reset { all } => cmd_reset(&config, all),
        Command::CheckVersion { required } => cmd_check_version(&required),
    }
}

fn open_state(config: &Config) -> Result<(Arc<dyn Storage>, Arc<dyn Storage>, PersistedState)> {
    let session: Arc<dyn Storage> = Arc::new(
        FileStorage::open(Config::session_store_path()).context("failed to open session store")?,
    );
    let durable: Arc<dyn Storage> = Arc::new(
        FileStorage::open(Config::durable_store_path()).context("failed to open durable store")?,
    );
    let persisted = PersistedState::new(config.storage.clone(), session.clone(), durable.clone());
    Ok((session, durable, persisted))
}

fn cmd_status(config: &Config) -> Result<()> {
    println!("sessioncap Configuration");
    println!("========================");
    println!();

    let tracker = &config.tracker;
    let project_key = if tracker.project_key.is_empty() {
        "(not set)"
    } else {
        tracker.project_key.as_str()
    };

    println!("Tracker version:  {}", TRACKER_VERSION);
    println!("Project key:      {}", project_key);
    println!("Ingest point:     {}", tracker.ingest_point);
    if !tracker.rev_id.is_empty() {
        println!("Revision:         {}", tracker.rev_id);
    }
    println!(
        "Connection:       {} attempts, {}ms apart",
        tracker.conn_attempt_count, tracker.conn_attempt_gap_ms
    );
    println!("Config file:      {}", Config::config_path().display());
    println!(
        "Log file:         {}",
        sessioncap_core::logging::log_file_path().display()
    );
    println!();

    let (_, _, persisted) = open_state(config)?;
    let show = |value: Option<String>| value.unwrap_or_else(|| "(none)".to_string());

    println!("Persisted Identity");
    println!("------------------");
    println!("User UUID:        {}", show(persisted.user_uuid()?));
    println!("Session token:    {}", show(persisted.token()?));
    println!(
        "Page number:      {}",
        show(persisted.page_no()?.map(|n| n.to_string()))
    );
    println!("Session store:    {}", Config::session_store_path().display());
    println!("Durable store:    {}", Config::durable_store_path().display());

    Ok(())
}

fn read_messages(input: &str) -> Result<Vec<Message>> {
    let reader: Box<dyn BufRead> = if input == "-" {
        Box::new(BufReader::new(std::io::stdin()))
    } else {
        let path = PathBuf::from(input);
        let file = std::fs::File::open(&path)
            .with_context(|| format!("failed to open {}", path.display()))?;
        Box::new(BufReader::new(file))
    };

    let mut messages = Vec::new();
    for (i, line) in reader.lines().enumerate() {
        let line = line.context("failed to read input")?;
        if line.trim().is_empty() {
            continue;
        }
        let message: Message = serde_json::from_str(&line)
            .with_context(|| format!("invalid message on line {}", i + 1))?;
        messages.push(message);
    }
    Ok(messages)
}

fn cmd_record(
    config: Config,
    project_key: Option<String>,
    input: &str,
    options: StartOptions,
) -> Result<()> {
    let tracker: TrackerConfig = config.tracker.clone();
    let project_key = project_key.unwrap_or_else(|| tracker.project_key.clone());
    if project_key.is_empty() {
        bail!("no project key: pass --project-key or set tracker.project_key in config.toml");
    }

    let messages = read_messages(input)?;
    let (session, durable, _) = open_state(&config)?;

    let runtime = tokio::runtime::Runtime::new().context("failed to create async runtime")?;
    runtime.block_on(async move {
        let worker = Arc::new(
            HttpWorker::spawn(WorkerConfig {
                flush_interval: tracker.worker_flush_interval(),
                ..Default::default()
            })
            .context("failed to start delivery worker")?,
        );

        let app = App::builder(project_key, tracker)
            .storage_keys(config.storage.clone())
            .session_storage(session)
            .durable_storage(durable)
            .transport(worker.clone())
            .build()
            .context("failed to create tracker")?;

        let info = app
            .start(options)
            .await
            .context("failed to start session")?;
        tracing::info!(session_id = ?info.session_id, "Recording session");

        let count = messages.len();
        for message in messages {
            app.send(message, false);
        }
        app.stop();
        worker
            .drain()
            .await
            .context("failed to flush recorded messages")?;

        println!(
            "Recorded {} message(s) in session {}",
            count,
            info.session_id.as_deref().unwrap_or("(unknown)")
        );
        println!("User UUID: {}", info.user_uuid);
        Ok(())
    })
}

fn cmd_reset(config: &Config, all: bool) -> Result<()> {
    let (_, _, persisted) = open_state(config)?;

    if all {
        persisted
            .clear_all()
            .context("failed to clear persisted identity")?;
        println!("Cleared all persisted identity.");
    } else {
        persisted
            .set_reset_flag(true)
            .context("failed to set reset flag")?;
        println!("The next recording will start a new session.");
    }
    Ok(())
}

fn cmd_check_version(required: &str) -> Result<()> {
    if sessioncap_core::version::check_required_version(TRACKER_VERSION, required) {
        println!("sessioncap {} satisfies {}", TRACKER_VERSION, required);
        Ok(())
    } else {
        bail!("sessioncap {} does not satisfy {}", TRACKER_VERSION, required)
    }
}
