// src/main.rs

mod annotate;
mod config;
mod detector;
mod dispatch;
mod evidence;
mod frame_source;
mod mjpeg;
mod session;
mod tracker;
mod types;
mod violations;
mod zones;

use anyhow::{Context, Result};
use detector::{NullPlateReader, SharedDetector, YoloDetector};
use dispatch::ViolationDispatcher;
use mjpeg::MjpegBroadcaster;
use session::CameraSession;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{error, info, warn};
use types::Config;

#[tokio::main]
async fn main() -> Result<()> {
    let config_path =
        std::env::args().nth(1).unwrap_or_else(|| "config.yaml".to_string());

    let config = Config::load(&config_path)?;

    tracing_subscriber::fmt()
        .with_env_filter(format!(
            "violation_monitor={},ort=warn",
            config.logging.level
        ))
        .init();

    info!("🚦 Traffic Violation Monitor Starting");
    info!(
        "✓ Configuration loaded: {} camera(s), model {}",
        config.cameras.len(),
        config.detector.model_path
    );

    let dispatcher = ViolationDispatcher::spawn(config.dispatch.clone())?;
    let stop = Arc::new(AtomicBool::new(false));

    // One model load for the whole process; sessions share the instance.
    let detector: SharedDetector = Arc::new(Mutex::new(
        YoloDetector::new(config.detector.clone()).context("loading detector")?,
    ));

    let mut sessions = Vec::new();
    for camera in &config.cameras {
        // Zone geometry comes per camera; a fetch failure skips the camera
        // rather than taking the whole process down.
        let zone_doc = match config::fetch_zone_document(&config.zone_source, &camera.id).await {
            Ok(doc) => doc,
            Err(e) => {
                error!("Camera '{}': zone configuration failed: {:#}", camera.id, e);
                continue;
            }
        };

        let broadcaster = match &camera.stream_addr {
            Some(addr) => {
                let broadcaster = MjpegBroadcaster::new(8);
                tokio::spawn(mjpeg::serve(addr.clone(), broadcaster.clone()));
                Some(broadcaster)
            }
            None => None,
        };

        let mut session = CameraSession::new(
            camera.clone(),
            config.tracker.clone(),
            config.violations.clone(),
            config.evidence.clone(),
            zone_doc,
            Arc::clone(&detector),
            Box::new(NullPlateReader),
            dispatcher.clone(),
            broadcaster,
            Arc::clone(&stop),
        );

        let camera_id = camera.id.clone();
        sessions.push(tokio::task::spawn_blocking(move || {
            if let Err(e) = session.run() {
                error!("Camera '{}' session terminated: {:#}", camera_id, e);
            }
        }));
    }

    if sessions.is_empty() {
        anyhow::bail!("no camera session could be started");
    }
    info!("✓ {} camera session(s) running", sessions.len());

    tokio::signal::ctrl_c().await?;
    warn!("Shutdown requested; stopping camera sessions");
    stop.store(true, Ordering::Relaxed);

    for session in sessions {
        let _ = session.await;
    }
    info!("All sessions stopped");
    Ok(())
}
