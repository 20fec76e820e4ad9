use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use tokio::sync::{broadcast, Notify};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use webrtc::track::track_remote::TrackRemote;

use whep_player::config::{ConfigStore, PlayerConfig};
use whep_player::events::{EventBus, PlayerEvent};
use whep_player::webrtc::{
    CapabilityInspector, ConnectionState, OverrideInspector, PeerConnectionManager,
    PlatformInspector, RtcEngine, WhepClient,
};

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

/// whep-player command line arguments
#[derive(Parser, Debug)]
#[command(name = "whep-player")]
#[command(version, about = "Play a WebRTC stream from a WHEP endpoint", long_about = None)]
struct CliArgs {
    /// WHEP endpoint URL
    #[arg(value_name = "URL")]
    url: String,

    /// Path to JSON configuration file (created with defaults if missing)
    #[arg(short = 'c', long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Offer H.265 when the device can decode it in hardware
    #[arg(long, conflicts_with = "disable_h265")]
    enable_h265: bool,

    /// Never offer H.265
    #[arg(long)]
    disable_h265: bool,

    /// Send the offer immediately and trickle candidates afterwards
    #[arg(long)]
    trickle: bool,

    /// Also receive audio
    #[arg(long)]
    receive_audio: bool,

    /// Bearer token for the WHEP endpoint
    #[arg(long, value_name = "TOKEN")]
    token: Option<String>,

    /// Print player events as JSON lines on stdout, optionally only those
    /// matching --print-events=TOPIC (e.g. "connection.*")
    #[arg(
        long,
        value_name = "TOPIC",
        num_args = 0..=1,
        require_equals = true,
        default_missing_value = "*"
    )]
    print_events: Option<String>,

    /// Log level (error, warn, info, verbose, debug, trace)
    #[arg(short = 'l', long, value_name = "LEVEL", default_value = "info")]
    log_level: LogLevel,

    /// Increase verbosity (-v for verbose, -vv for debug, -vvv for trace)
    #[arg(short = 'v', long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Emit logs as JSON
    #[arg(long)]
    json_logs: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = CliArgs::parse();

    init_logging(args.log_level, args.verbose, args.json_logs);

    tracing::info!("Starting whep-player v{}", env!("CARGO_PKG_VERSION"));

    let mut config = match &args.config {
        Some(path) => {
            tracing::info!("Configuration file: {}", path.display());
            (*ConfigStore::open(path).await?.get()).clone()
        }
        None => PlayerConfig::default(),
    };
    apply_overrides(&mut config, &args);

    let inspector: Arc<dyn CapabilityInspector> = Arc::new(OverrideInspector::new(
        Arc::new(PlatformInspector::new()),
        config.capability_override.clone(),
    ));
    let signaling = Arc::new(WhepClient::new(&config.signaling)?);
    let engine = Arc::new(RtcEngine::new());
    let events = Arc::new(EventBus::new());

    // Command line overrides are not written back to the file
    let store = ConfigStore::in_memory(config);
    let manager = PeerConnectionManager::new(engine, signaling, inspector, events.clone(), store);

    let failed = Arc::new(Notify::new());
    let event_task = tokio::spawn(watch_events(
        events.subscribe(),
        failed.clone(),
        args.print_events.clone(),
    ));

    let session_id = manager.play_stream(&args.url).await?;
    tracing::info!("Session {} started", session_id);

    let result = tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Shutdown signal received");
            Ok(())
        }
        _ = failed.notified() => Err(anyhow::anyhow!("playback failed")),
    };

    manager.dispose().await?;
    event_task.abort();

    tracing::info!("Player shutdown complete");
    result
}

fn apply_overrides(config: &mut PlayerConfig, args: &CliArgs) {
    if args.enable_h265 {
        config.codecs.enable_h265 = true;
    }
    if args.disable_h265 {
        config.codecs.enable_h265 = false;
    }
    if args.trickle {
        config.signaling.trickle_ice = true;
    }
    if args.receive_audio {
        config.codecs.receive_audio = true;
    }
    if let Some(token) = &args.token {
        config.signaling.auth_token = Some(token.clone());
    }
}

/// Log events, start a reader per remote track and flag session failure
async fn watch_events(
    mut rx: broadcast::Receiver<PlayerEvent>,
    failed: Arc<Notify>,
    print_topic: Option<String>,
) {
    loop {
        let event = match rx.recv().await {
            Ok(event) => event,
            Err(broadcast::error::RecvError::Lagged(n)) => {
                tracing::warn!("Event watcher lagged, {} events dropped", n);
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };

        if print_topic.as_deref().is_some_and(|topic| event.matches_topic(topic)) {
            match serde_json::to_string(&event) {
                Ok(line) => println!("{}", line),
                Err(e) => tracing::warn!("Failed to serialize event: {}", e),
            }
        }

        match &event {
            PlayerEvent::ConnectionStateChanged { state, .. } => {
                tracing::info!("Connection state: {}", state);
                if *state == ConnectionState::Failed {
                    failed.notify_one();
                }
            }
            PlayerEvent::RemoteStreamAdded { track, .. } => match track.downcast::<TrackRemote>() {
                Some(remote) => {
                    tokio::spawn(read_track(remote, track.mime_type.clone()));
                }
                None => tracing::warn!("Remote track {} has no RTP handle", track.track_id),
            },
            PlayerEvent::ConnectionError { kind, message, .. } => {
                tracing::error!("Connection error ({}): {}", kind, message);
            }
            _ => tracing::debug!("Event: {}", event.event_name()),
        }
    }
}

/// Drain RTP from a remote track and report throughput
async fn read_track(track: Arc<TrackRemote>, codec: String) {
    const REPORT_EVERY: u64 = 1000;

    tracing::info!("Reading {} track {}", codec, track.id());

    let mut packets: u64 = 0;
    let mut payload_bytes: u64 = 0;
    loop {
        match track.read_rtp().await {
            Ok((packet, _)) => {
                packets += 1;
                payload_bytes += packet.payload.len() as u64;
                if packets % REPORT_EVERY == 0 {
                    tracing::info!(
                        "{} track {}: {} packets, {} KiB",
                        codec,
                        track.id(),
                        packets,
                        payload_bytes / 1024
                    );
                }
            }
            Err(e) => {
                tracing::debug!("Track {} ended: {}", track.id(), e);
                break;
            }
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
        LogLevel::Error => "whep_player=error,webrtc=error",
        LogLevel::Warn => "whep_player=warn,webrtc=warn",
        LogLevel::Info => "whep_player=info,webrtc=warn",
        LogLevel::Verbose => "whep_player=debug,webrtc=warn",
        LogLevel::Debug => "whep_player=debug,webrtc=info",
        LogLevel::Trace => "whep_player=trace,webrtc=debug",
    };

    // Environment variable takes highest priority
    let env_filter =
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into());

    let result = if json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json())
            .try_init()
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer())
            .try_init()
    };
    if let Err(err) = result {
        eprintln!("failed to initialize tracing: {}", err);
    }
}
