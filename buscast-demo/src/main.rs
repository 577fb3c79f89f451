//! buscast - command-line front end for live bus tracking.
//!
//! `relay` hosts the shared location collection, `broadcast` publishes one
//! bus (simulated movement on machines without a position sensor), and
//! `watch` prints every active bus as the markers move.

use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use log::{info, warn};

use buscast_sync::{
    spawn_session, spawn_viewer, AnonymousIdentity, BroadcasterProfile, DeviceSources, LatLng,
    MemoryPreferences, RelayConfig, RelayServer, RelayStore, SessionConfig, SessionController,
    SessionState, SimulationConfig, ViewerConfig, ViewerFrame,
};

type DemoResult = Result<(), Box<dyn std::error::Error + Send + Sync>>;

#[derive(Parser)]
#[command(name = "buscast", version, about = "Live bus position broadcasting")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the WebSocket relay.
    Relay {
        /// Address to listen on.
        #[arg(short, long, default_value = "127.0.0.1:9090")]
        bind: String,
    },

    /// Broadcast this bus until Ctrl-C.
    Broadcast {
        #[arg(long, default_value = "ws://127.0.0.1:9090")]
        url: String,

        #[arg(long)]
        bus: String,

        #[arg(long)]
        driver: String,

        /// Random-walk around the anchor instead of reading a sensor.
        #[arg(long)]
        simulate: bool,

        /// Seconds between simulated moves.
        #[arg(long, default_value_t = 3)]
        tick: u64,

        /// Simulation anchor as `lat,lng`.
        #[arg(long, value_parser = parse_lat_lng)]
        anchor: Option<LatLng>,
    },

    /// Print every active bus until Ctrl-C.
    Watch {
        #[arg(long, default_value = "ws://127.0.0.1:9090")]
        url: String,

        /// Seconds between printed summaries.
        #[arg(long, default_value_t = 1)]
        every: u64,
    },
}

fn parse_lat_lng(s: &str) -> Result<LatLng, String> {
    let (lat, lng) = s
        .split_once(',')
        .ok_or_else(|| format!("expected `lat,lng`, got `{s}`"))?;
    let parse = |v: &str| v.trim().parse::<f64>().map_err(|e| e.to_string());
    let point = LatLng::new(parse(lat)?, parse(lng)?);
    if !point.is_valid() {
        return Err(format!("`{s}` is not a valid coordinate"));
    }
    Ok(point)
}

#[tokio::main]
async fn main() -> DemoResult {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    match Args::parse().command {
        Command::Relay { bind } => run_relay(bind).await,
        Command::Broadcast {
            url,
            bus,
            driver,
            simulate,
            tick,
            anchor,
        } => {
            let mut simulation = SimulationConfig {
                tick: Duration::from_secs(tick.max(1)),
                ..SimulationConfig::default()
            };
            if let Some(anchor) = anchor {
                simulation.anchor = anchor;
            }
            run_broadcast(url, BroadcasterProfile::new(bus, driver, simulate), simulation).await
        }
        Command::Watch { url, every } => run_watch(url, Duration::from_secs(every.max(1))).await,
    }
}

async fn run_relay(bind: String) -> DemoResult {
    let server = RelayServer::new(RelayConfig {
        bind_addr: bind,
        ..RelayConfig::default()
    });
    info!("Starting relay on {}", server.bind_addr());

    tokio::select! {
        result = server.run() => result,
        _ = tokio::signal::ctrl_c() => {
            let stats = server.stats().await;
            info!(
                "Relay shutting down: {} connections, {} puts, {} deletes",
                stats.total_connections, stats.puts, stats.deletes
            );
            Ok(())
        }
    }
}

async fn run_broadcast(url: String, profile: BroadcasterProfile, simulation: SimulationConfig) -> DemoResult {
    let store = Arc::new(RelayStore::connect(url).await?);
    let controller = SessionController::new(
        SessionConfig::default(),
        store,
        Arc::new(AnonymousIdentity::new()),
        Box::new(MemoryPreferences::new()),
        Box::new(DeviceSources::simulated(simulation)),
    );
    let session = spawn_session(controller)?;
    session.start(profile).await?;

    let mut status = session.subscribe_status();
    loop {
        tokio::select! {
            changed = status.changed() => {
                if changed.is_err() {
                    warn!("Session ended unexpectedly");
                    return Ok(());
                }
                let s = status.borrow_and_update().clone();
                info!(
                    "{:?} (broadcasting: {}, buses online: {})",
                    s.state, s.is_broadcasting, s.active_count
                );
                if let Some(e) = &s.last_error {
                    warn!("{e}");
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    info!("Stopping broadcast");
    if let Err(e) = session.stop().await {
        warn!("{e}");
    }
    let idle = tokio::time::timeout(
        Duration::from_secs(2),
        session.wait_for(|s| s.state == SessionState::Idle),
    )
    .await;
    if idle.is_err() {
        warn!("Relay did not confirm removal");
    }
    session.shutdown().await;
    Ok(())
}

async fn run_watch(url: String, every: Duration) -> DemoResult {
    let store = Arc::new(RelayStore::connect(url).await?);
    let viewer = spawn_viewer(store, None, ViewerConfig::default())?;
    let mut ticker = tokio::time::interval(every);
    let mut last_printed: Option<ViewerFrame> = None;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let frame = viewer.frame();
                if last_printed.as_ref() != Some(&frame) {
                    print_frame(&frame);
                    last_printed = Some(frame);
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    viewer.shutdown().await;
    Ok(())
}

fn print_frame(frame: &ViewerFrame) {
    if let Some(e) = &frame.error {
        println!("! {e}");
    }
    println!("Active Buses: {}", frame.active_count);
    if frame.active_count == 0 {
        println!("  No active buses at the moment.");
    }
    for marker in &frame.markers {
        println!("  {:<32} {}", marker.popup_label, marker.coords_label);
    }
}
