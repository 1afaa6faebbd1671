//! streamtask - drive per-stream tasks from the command line

use clap::{Parser, Subcommand};
use serde_json::json;
use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;
use streamtask::hooks;
use streamtask::observability::{init_default_logging, metrics};
use streamtask::pipeline::Http1Pipeline;
use streamtask::protocol::{RequestHead, StreamId};
use streamtask::session::{Ownership, Session, StreamResponse};
use streamtask::task::MasterConnection;
use streamtask::{StreamTaskConfig, TaskResult};
use tokio::signal;
use tracing::{error, info, warn};

const DEFAULT_CONFIG_PATHS: &[&str] = &["streamtask.toml", "config/streamtask.toml"];

/// Run multiplexed streams as independent request tasks
#[derive(Parser)]
#[command(name = "streamtask")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE", env = "STREAMTASK_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Open streams on a demo session and print the collected responses
    Run {
        /// Number of concurrent streams
        #[arg(long, default_value_t = 3)]
        streams: u32,
        /// Request path for every stream
        #[arg(long, default_value = "/")]
        path: String,
        /// Request body sent on every stream
        #[arg(long)]
        body: Option<String>,
        /// Let tasks destroy themselves instead of the session
        #[arg(long)]
        auto_destroy: bool,
    },
    /// Validate configuration
    Config {
        /// Show the effective configuration
        #[arg(long)]
        show: bool,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    init_default_logging();
    hooks::init_hooks();

    let config = match load_configuration(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            process::exit(1);
        }
    };

    let result = match cli.command {
        Commands::Run {
            streams,
            path,
            body,
            auto_destroy,
        } => {
            let ownership = if auto_destroy {
                Ownership::AutoDestroy
            } else {
                Ownership::Explicit
            };
            run_session(config, streams, &path, body.as_deref(), ownership).await
        }
        Commands::Config { show } => handle_config_command(&config, show),
    };

    if let Err(e) = result {
        error!("Command failed: {}", e);
        process::exit(1);
    }
}

fn load_configuration(
    config_path: Option<&Path>,
) -> Result<StreamTaskConfig, Box<dyn std::error::Error>> {
    if let Some(path) = config_path {
        info!("Loading configuration from: {}", path.display());
        return Ok(StreamTaskConfig::load_from_file(path)?);
    }

    for path in DEFAULT_CONFIG_PATHS.iter().map(PathBuf::from) {
        if path.exists() {
            info!("Loading configuration from: {}", path.display());
            return Ok(StreamTaskConfig::load_from_file(&path)?);
        }
    }

    info!("No configuration file found, using defaults");
    Ok(StreamTaskConfig::default())
}

async fn run_session(
    config: StreamTaskConfig,
    streams: u32,
    path: &str,
    body: Option<&str>,
    ownership: Ownership,
) -> Result<(), Box<dyn std::error::Error>> {
    let connection = MasterConnection::new(config, Arc::new(Http1Pipeline::echo()));
    let mut session = Session::new(connection);

    // Client-initiated streams carry odd ids
    let ids: Vec<StreamId> = (0..streams).map(|i| i * 2 + 1).collect();

    let responses = tokio::select! {
        result = drive_streams(&mut session, &ids, path, body, ownership) => result?,
        _ = signal::ctrl_c() => {
            warn!("Interrupted, aborting open streams");
            Vec::new()
        }
    };

    for (stream_id, result) in session.shutdown().await {
        if let Err(e) = result {
            warn!(stream_id, error = %e, "Stream did not shut down cleanly");
        }
    }

    let report = json!({
        "responses": responses,
        "metrics": metrics().get_metrics(),
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

async fn drive_streams(
    session: &mut Session,
    ids: &[StreamId],
    path: &str,
    body: Option<&str>,
    ownership: Ownership,
) -> TaskResult<Vec<StreamResponse>> {
    let method = if body.is_some() { "POST" } else { "GET" };
    for &stream_id in ids {
        let mut request = RequestHead::new(method, path).with_authority("localhost");
        if let Some(body) = body {
            request = request.with_header("content-length", body.len().to_string());
        }
        session.open_stream(stream_id, &request, ownership)?;
        if let Some(body) = body {
            session.push_data(stream_id, body.to_string()).await?;
        }
        session.end_stream(stream_id).await?;
    }

    // Demo echo replies span a few output entries at most, well under the
    // output capacity, so collecting one stream at a time cannot stall.
    let mut responses = Vec::with_capacity(ids.len());
    for &stream_id in ids {
        let response = session.collect_response(stream_id).await?;
        let status = session.reap(stream_id).await?;
        info!(stream_id, status = ?status, "Stream finished");
        responses.push(response);
    }
    Ok(responses)
}

fn handle_config_command(
    config: &StreamTaskConfig,
    show: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    config.validate()?;
    info!("Configuration is valid");

    if show {
        println!("{}", toml::to_string_pretty(config)?);
    }
    Ok(())
}
