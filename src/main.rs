use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use tokio::sync::broadcast;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use voxa_call::call::{CallManager, CallPhase, CallStatus};
use voxa_call::config::ConfigStore;
use voxa_call::events::CallEvent;
use voxa_call::media::{MediaDevices, SyntheticDevices};
use voxa_call::negotiation::Backends;
use voxa_call::rtc::{PeerConnector, SimulatedConnector, WebRtcConnector};
use voxa_call::store::SqliteStore;

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

/// Voxa call demo: two participants call each other in one process
#[derive(Parser, Debug)]
#[command(name = "voxa-call")]
#[command(version, about = "Peer-to-peer call negotiation demo", long_about = None)]
struct CliArgs {
    /// Data directory path (default: ./voxa-data)
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

    /// Identity of the calling participant
    #[arg(long, default_value = "u1")]
    caller: String,

    /// Identity of the called participant
    #[arg(long, default_value = "u2")]
    callee: String,

    /// Place a video call instead of an audio call
    #[arg(long)]
    video: bool,

    /// Seconds to stay connected before hanging up
    #[arg(long, value_name = "SECS", default_value_t = 3)]
    hold_secs: u64,

    /// Use the in-process connection instead of real WebRTC
    #[arg(long)]
    simulated: bool,

    /// Replace the saved STUN server list (repeatable)
    #[arg(long = "stun", value_name = "URL")]
    stun_servers: Vec<String>,

    /// Save a new connect timeout
    #[arg(long, value_name = "SECS")]
    connect_timeout_secs: Option<u64>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = CliArgs::parse();
    init_logging(args.log_level, args.verbose, args.log_json);

    tracing::info!("Starting voxa-call v{}", env!("CARGO_PKG_VERSION"));

    let data_dir = args.data_dir.clone().unwrap_or_else(get_data_dir);
    tracing::info!("Data directory: {}", data_dir.display());
    tokio::fs::create_dir_all(&data_dir).await?;

    let config_store = ConfigStore::new(&data_dir.join("voxa-call.db")).await?;
    if !args.stun_servers.is_empty() || args.connect_timeout_secs.is_some() {
        let stun_servers = args.stun_servers.clone();
        let connect_timeout = args.connect_timeout_secs;
        config_store
            .update(|config| {
                if !stun_servers.is_empty() {
                    config.ice.stun_servers = stun_servers;
                }
                if let Some(secs) = connect_timeout {
                    config.call.connect_timeout_ms = secs * 1000;
                }
            })
            .await?;
        tracing::info!("Saved updated call settings");
    }
    let config = config_store.get();
    tracing::info!(
        "ICE: {} STUN server(s), {} TURN server(s)",
        config.ice.stun_servers.len(),
        config.ice.turn_servers.len()
    );

    // Both participants share the store, like two clients on one backend
    let store = Arc::new(SqliteStore::new(config_store.pool().clone()).await?);

    let participant = |id: &str| {
        let devices: Arc<dyn MediaDevices> = Arc::new(SyntheticDevices::new());
        let connector: Arc<dyn PeerConnector> = if args.simulated {
            Arc::new(SimulatedConnector::new())
        } else {
            Arc::new(WebRtcConnector::new())
        };
        let manager = CallManager::new(
            id,
            &config,
            Backends {
                store: store.clone(),
                signaling: store.clone(),
                devices,
                connector,
            },
        );
        manager.start();
        manager.follow_config(&config_store);
        manager
    };
    let caller = participant(&args.caller);
    let callee = participant(&args.callee);

    spawn_event_log(&caller);
    spawn_auto_answer(&callee);

    let call = caller.start_call(&args.callee, args.video).await?;
    tracing::info!("{} is calling {} ({})", args.caller, args.callee, call.kind);

    wait_for(&caller, Duration::from_secs(20), |phase| {
        matches!(
            phase.status(),
            CallStatus::Connected | CallStatus::Ended | CallStatus::Idle
        )
    })
    .await;
    if caller.phase().status() != CallStatus::Connected {
        tracing::error!("Call was not connected");
    } else {
        tracing::info!("Connected; holding for {}s (Ctrl+C to hang up)", args.hold_secs);
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_secs(args.hold_secs)) => {}
            _ = tokio::signal::ctrl_c() => tracing::info!("Interrupted"),
        }
    }

    caller.end_call().await?;
    wait_for(&caller, config.call.end_grace() * 3, |phase| {
        matches!(phase, CallPhase::Idle)
    })
    .await;
    wait_for(&callee, config.call.end_grace() * 3, |phase| {
        matches!(phase, CallPhase::Idle)
    })
    .await;

    for manager in [&caller, &callee] {
        println!("Call history of {}:", manager.local_id());
        for summary in manager.history(10).await? {
            println!(
                "  {:<8} {:<8} {:<5} {:<10} {:>6}  {}",
                format!("{:?}", summary.direction).to_lowercase(),
                summary.peer_id,
                summary.kind,
                summary.status,
                summary.duration_label(),
                summary.started_at.format("%Y-%m-%d %H:%M:%S")
            );
        }
    }

    tracing::info!("Demo complete");
    Ok(())
}

/// Answer every incoming call as soon as it rings
fn spawn_auto_answer(manager: &CallManager) {
    let manager = manager.clone();
    let mut events = manager.events().subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(CallEvent::IncomingCall(incoming)) => {
                    tracing::info!(
                        "{} answering {} call from {}",
                        manager.local_id(),
                        incoming.kind,
                        incoming.caller_id
                    );
                    if let Err(e) = manager.answer_call().await {
                        tracing::error!("Failed to answer: {}", e);
                    }
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });
}

fn spawn_event_log(manager: &CallManager) {
    let local_id = manager.local_id().to_string();
    let mut events = manager.events().subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(CallEvent::RemoteStreamUpdated { stream, track, .. }) => {
                    tracing::info!(
                        "{} receiving remote {} ({} track(s))",
                        local_id,
                        track.kind(),
                        stream.len()
                    );
                }
                Ok(CallEvent::Notice { level, message }) => {
                    tracing::warn!("{} notice ({:?}): {}", local_id, level, message);
                }
                Ok(event) => tracing::debug!("{} event: {}", local_id, event.name()),
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });
}

/// Poll the manager's phase until `done` holds or `timeout` passes
async fn wait_for<F>(manager: &CallManager, timeout: Duration, done: F) -> bool
where
    F: Fn(&CallPhase) -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if done(&manager.phase()) {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    done(&manager.phase())
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
        LogLevel::Error => "voxa_call=error,webrtc=error",
        LogLevel::Warn => "voxa_call=warn,webrtc=warn",
        LogLevel::Info => "voxa_call=info,webrtc=warn",
        LogLevel::Verbose => "voxa_call=debug,webrtc=warn",
        LogLevel::Debug => "voxa_call=debug,webrtc=info",
        LogLevel::Trace => "voxa_call=trace,webrtc=debug",
    };

    // Environment variable takes highest priority
    let env_filter =
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into());

    let (plain, json) = if json {
        (None, Some(tracing_subscriber::fmt::layer().json()))
    } else {
        (Some(tracing_subscriber::fmt::layer()), None)
    };

    if let Err(err) = tracing_subscriber::registry()
        .with(env_filter)
        .with(plain)
        .with(json)
        .try_init()
    {
        eprintln!("failed to initialize tracing: {}", err);
    }
}

/// Get the application data directory
fn get_data_dir() -> PathBuf {
    if let Ok(path) = std::env::var("VOXA_CALL_DATA_DIR") {
        return PathBuf::from(path);
    }
    PathBuf::from("voxa-data")
}
