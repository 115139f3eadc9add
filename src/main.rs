//! Relocalization client demo against in-process sensor and service stand-ins

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use color_eyre::Result;
use nalgebra::{Matrix4, Vector3};
use tracing::{info, warn};

use reloc_relay::session::{SessionController, SessionEvent};
use reloc_relay::session::events::EventSink;
use reloc_relay::sim::{LoopbackTransport, RecordingScene, SyntheticSensor};
use reloc_relay::Config;

const RUN_TIME: Duration = Duration::from_secs(5);
const TICK: Duration = Duration::from_millis(16);

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize error handling and logging
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter("reloc_relay=debug")
        .with_timer(tracing_subscriber::fmt::time::uptime())
        .init();

    info!("Relocalization client launching...");

    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let config = Config::load(config_path.as_deref())?;
    info!("Capture: {:?}", config.capture);

    let sensor = Arc::new(SyntheticSensor::new(1280, 960));
    let transport = Arc::new(LoopbackTransport::new());
    transport.set_echo(true);

    let (events, event_rx) = EventSink::channel();
    tokio::spawn(async move {
        while let Ok(event) = event_rx.recv_async().await {
            if let SessionEvent::Log { .. } = event {
                continue;
            }
            info!("Event: {:?}", event);
        }
    });

    let mut session = SessionController::builder(config)
        .sensor(sensor.clone())
        .transport(transport.clone())
        .events(events)
        .build()?;

    session.connect().await?;
    session.start().await?;

    // Camera feed: 30 Hz, slowly orbiting
    let feed = {
        let sensor = sensor.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_millis(33));
            let mut angle = 0.0f32;
            loop {
                interval.tick().await;
                angle += 0.02;
                sensor.set_pose(Matrix4::new_translation(&Vector3::new(angle.cos(), 1.5, angle.sin())));
                sensor.trigger();
            }
        })
    };

    let mut scene = RecordingScene::default();
    let mut ticker = tokio::time::interval(TICK);
    let started = Instant::now();
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                session.tick(&mut scene, Instant::now());
                if started.elapsed() >= RUN_TIME {
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                warn!("Interrupted");
                break;
            }
        }
    }

    feed.abort();
    session.stop().await?;
    session.disconnect().await?;

    let stats = session.pipeline().stats();
    info!(
        "Done: {} sent, {} rejected, {} dropped, {} scene updates",
        stats.sent,
        stats.rejected,
        stats.dropped,
        scene.poses.len()
    );
    if let Some(pose) = scene.last() {
        info!("Last origin position: {:?}", pose.position);
    }

    Ok(())
}
