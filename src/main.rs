use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use futures::channel::mpsc;
use futures::StreamExt;
use tokio::sync::watch;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use calls_client::config::{AppConfig, ConfigStore};
use calls_client::events::ClientEvent;
use calls_client::media::synthetic::SyntheticCamera;
use calls_client::media::{device_tracks, ConstraintsCell};
use calls_client::webrtc::{MediaKind, SessionClient, TrackDescriptor};

/// Log level for the application
#[derive(Debug, Clone, Copy, Default, ValueEnum)]
enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Verbose,
    Debug,
    Trace,
}

/// Push a synthetic track into a session and pull it back
#[derive(Parser, Debug)]
#[command(name = "calls-client")]
#[command(version, about = "Loopback check against an SFU signaling service", long_about = None)]
struct CliArgs {
    /// Application id (overrides database config)
    #[arg(long, value_name = "ID")]
    app_id: Option<String>,

    /// Bearer token (overrides database config)
    #[arg(long, value_name = "TOKEN", env = "CALLS_APP_TOKEN")]
    token: Option<String>,

    /// Signaling API base URL (overrides database config)
    #[arg(long, value_name = "URL")]
    api_base: Option<String>,

    /// Persist the overrides above into the data directory
    #[arg(long)]
    save: bool,

    /// Stop after this many seconds (default: run until Ctrl-C)
    #[arg(long, value_name = "SECS")]
    duration_secs: Option<u64>,

    /// Data directory path (default: ./calls-client-data)
    #[arg(short = 'd', long, value_name = "DIR")]
    data_dir: Option<PathBuf>,

    /// Log level (error, warn, info, verbose, debug, trace)
    #[arg(short = 'l', long, value_name = "LEVEL", default_value = "info")]
    log_level: LogLevel,

    /// Increase verbosity (-v for verbose, -vv for debug, -vvv for trace)
    #[arg(short = 'v', long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Emit logs as JSON lines
    #[arg(long)]
    log_json: bool,
}

// Batching and the scheduler lane assume a single logical thread
#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let args = CliArgs::parse();
    init_logging(args.log_level, args.verbose, args.log_json);

    tracing::info!("Starting calls-client v{}", env!("CARGO_PKG_VERSION"));

    let data_dir = args.data_dir.clone().unwrap_or_else(get_data_dir);
    tokio::fs::create_dir_all(&data_dir).await?;
    tracing::info!("Data directory: {}", data_dir.display());

    let config_store = ConfigStore::new(&data_dir.join("calls-client.db")).await?;
    let mut config = (*config_store.get()).clone();
    apply_overrides(&mut config, &args);
    if args.save {
        config_store.set(config.clone()).await?;
        tracing::info!("Saved configuration overrides");
    }

    let client = Arc::new(SessionClient::connect(&config).await?);
    tokio::spawn(log_events(client.events()));

    let mut state = client.connection_state();
    tokio::spawn(async move {
        while state.changed().await.is_ok() {
            tracing::info!("Connection state: {}", *state.borrow_and_update());
        }
    });

    let session = client.wait_for_session().await?;
    tracing::info!("Session {} ready", session.id());

    // Local media: one synthetic camera
    let (_devices_tx, devices) = watch::channel(vec![SyntheticCamera::device()]);
    let constraints = ConstraintsCell::new(config.media.constraints.clone());
    let camera = Arc::new(SyntheticCamera::new("calls-client"));
    let tracks = device_tracks(MediaKind::Video, devices, constraints.subscribe(), camera);

    // Every pushed descriptor is pulled straight back
    let (descriptor_tx, descriptor_rx) = mpsc::unbounded::<TrackDescriptor>();
    let pushed = client.push_track(tracks);
    tokio::spawn(async move {
        let mut pushed = Box::pin(pushed);
        while let Some(result) = pushed.next().await {
            match result {
                Ok(descriptor) => {
                    tracing::info!("Pushed {} via {}", descriptor.track_name, descriptor.session_id);
                    if descriptor_tx.unbounded_send(descriptor).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    tracing::error!("Push pipeline failed: {}", e);
                    break;
                }
            }
        }
    });

    let packets = Arc::new(AtomicU64::new(0));
    let pulled = client.pull_track(descriptor_rx);
    let counter = packets.clone();
    tokio::spawn(async move {
        let mut pulled = Box::pin(pulled);
        while let Some(result) = pulled.next().await {
            match result {
                Ok(track) => {
                    tracing::info!("Pulled track {} on mid {}", track.id(), track.mid());
                    if let Some(remote) = track.remote().cloned() {
                        let counter = counter.clone();
                        tokio::spawn(async move {
                            while remote.read_rtp().await.is_ok() {
                                counter.fetch_add(1, Ordering::Relaxed);
                            }
                        });
                    }
                }
                Err(e) => {
                    tracing::error!("Pull pipeline failed: {}", e);
                    break;
                }
            }
        }
    });

    let deadline = async {
        match args.duration_secs {
            Some(secs) => tokio::time::sleep(Duration::from_secs(secs)).await,
            None => std::future::pending().await,
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => tracing::info!("Shutdown signal received"),
        _ = deadline => tracing::info!("Run duration elapsed"),
    }

    tracing::info!("Received {} RTP packet(s) over loopback", packets.load(Ordering::Relaxed));
    client.shutdown().await;
    Ok(())
}

fn apply_overrides(config: &mut AppConfig, args: &CliArgs) {
    if let Some(app_id) = &args.app_id {
        config.signaling.app_id = app_id.clone();
    }
    if let Some(token) = &args.token {
        config.signaling.token = token.clone();
    }
    if let Some(api_base) = &args.api_base {
        config.signaling.api_base = api_base.trim_end_matches('/').to_string();
    }
}

async fn log_events(mut events: tokio::sync::broadcast::Receiver<ClientEvent>) {
    loop {
        match events.recv().await {
            Ok(ClientEvent::SessionFailed { peer_id, message }) => {
                tracing::debug!("Negotiation on peer {} failed: {}", peer_id, message)
            }
            Ok(event) => tracing::debug!("Event {}", event.event_name()),
            Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                tracing::debug!("Event log lagged by {}", n)
            }
            Err(_) => break,
        }
    }
}

/// Initialize logging with tracing
fn init_logging(level: LogLevel, verbose_count: u8, json: bool) {
    // Verbose count overrides log level
    let effective_level = match verbose_count {
        0 => level,
        1 => LogLevel::Verbose,
        2 => LogLevel::Debug,
        _ => LogLevel::Trace,
    };

    let filter = match effective_level {
        LogLevel::Error => "calls_client=error,webrtc=error",
        LogLevel::Warn => "calls_client=warn,webrtc=warn",
        LogLevel::Info => "calls_client=info,webrtc=warn",
        LogLevel::Verbose => "calls_client=debug,webrtc=warn",
        LogLevel::Debug => "calls_client=debug,webrtc=info",
        LogLevel::Trace => "calls_client=trace,webrtc=debug",
    };

    // Environment variable takes highest priority
    let env_filter =
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into());

    if let Err(err) = tracing_subscriber::registry()
        .with(env_filter)
        .with(json.then(|| tracing_subscriber::fmt::layer().json()))
        .with((!json).then(tracing_subscriber::fmt::layer))
        .try_init()
    {
        eprintln!("failed to initialize tracing: {}", err);
    }
}

fn get_data_dir() -> PathBuf {
    if let Ok(path) = std::env::var("CALLS_CLIENT_DATA_DIR") {
        return PathBuf::from(path);
    }
    PathBuf::from("calls-client-data")
}
