// src/dispatch.rs
//
// Asynchronous violation upload.
//
// The frame loop never blocks on network I/O: finalized evidence is handed
// to a bounded queue with `try_send`, and a fixed pool of workers drains it.
// A full queue rejects the job outright. Upload failures are logged and the
// event is dropped, never retried. Each job owns a `TempArtifacts` guard,
// so its evidence files are deleted when the job is dropped on any path:
// upload success, upload failure, or queue rejection.

use crate::evidence::TempArtifacts;
use crate::types::{DispatchConfig, ViolationEvent};
use anyhow::{Context, Result};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use time::format_description::well_known::Rfc3339;
use tokio::sync::{mpsc, Mutex};
use tracing::{error, info, warn};

// ============================================================================
// JOBS
// ============================================================================

/// One upload unit: the event, its materialized evidence files, and the
/// guard that removes them.
pub struct EvidenceJob {
    pub event: ViolationEvent,
    pub image_path: PathBuf,
    /// Missing when the clip could not be encoded; the event still uploads
    /// with the snapshot alone.
    pub video_path: Option<PathBuf>,
    pub artifacts: TempArtifacts,
}

// ============================================================================
// WIRE FORMAT (violation-ingestion API)
// ============================================================================

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct UploadPayload {
    camera: CameraRef,
    status: &'static str,
    created_at: String,
    violation_details: Vec<ViolationDetail>,
}

#[derive(Debug, Serialize)]
struct CameraRef {
    id: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ViolationDetail {
    violation_type_id: u32,
    violation_time: String,
    license_plate: String,
    description: String,
}

fn build_payload(event: &ViolationEvent) -> Result<UploadPayload> {
    let timestamp = event.detected_at.format(&Rfc3339)?;
    Ok(UploadPayload {
        camera: CameraRef {
            id: event.camera_id.clone(),
        },
        status: "PENDING",
        created_at: timestamp.clone(),
        violation_details: vec![ViolationDetail {
            violation_type_id: event.kind.type_id(),
            violation_time: timestamp,
            license_plate: event.license_plate.clone(),
            description: event.description.clone(),
        }],
    })
}

// ============================================================================
// DISPATCHER
// ============================================================================

#[derive(Clone)]
pub struct DispatcherHandle {
    tx: mpsc::Sender<EvidenceJob>,
}

impl DispatcherHandle {
    /// Non-blocking submit. A rejected job is dropped on the spot and its
    /// artifact guard cleans the evidence files.
    pub fn submit(&self, job: EvidenceJob) {
        let event_id = job.event.id.clone();
        match self.tx.try_send(job) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(
                    "Dispatch queue full; dropping evidence for event {}",
                    event_id
                );
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                warn!(
                    "Dispatcher stopped; dropping evidence for event {}",
                    event_id
                );
            }
        }
    }
}

pub struct ViolationDispatcher;

impl ViolationDispatcher {
    /// Start the worker pool on the current tokio runtime and return the
    /// submission handle.
    pub fn spawn(config: DispatchConfig) -> Result<DispatcherHandle> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(config.timeout_secs))
            .build()
            .context("Failed to build HTTP client")?;

        let (tx, rx) = mpsc::channel::<EvidenceJob>(config.queue_capacity.max(1));
        let rx = Arc::new(Mutex::new(rx));

        for worker_id in 0..config.workers.max(1) {
            let rx = Arc::clone(&rx);
            let client = client.clone();
            let url = config.upload_url.clone();

            tokio::spawn(async move {
                loop {
                    let job = { rx.lock().await.recv().await };
                    let Some(job) = job else { break };

                    match upload(&client, &url, &job).await {
                        Ok(()) => info!(
                            "Worker {}: uploaded {} event {} for camera {}",
                            worker_id,
                            job.event.kind.as_str(),
                            job.event.id,
                            job.event.camera_id
                        ),
                        Err(e) => error!(
                            "Worker {}: upload of event {} failed, dropping: {:#}",
                            worker_id, job.event.id, e
                        ),
                    }
                    // Job drops here; TempArtifacts removes the files.
                }
            });
        }

        info!(
            "Violation dispatcher started: {} worker(s), queue capacity {}",
            config.workers.max(1),
            config.queue_capacity.max(1)
        );
        Ok(DispatcherHandle { tx })
    }
}

async fn upload(client: &reqwest::Client, url: &str, job: &EvidenceJob) -> Result<()> {
    let payload = build_payload(&job.event)?;
    let json = serde_json::to_string(&payload)?;

    let image = tokio::fs::read(&job.image_path)
        .await
        .with_context(|| format!("reading snapshot {}", job.image_path.display()))?;

    let mut form = reqwest::multipart::Form::new()
        .part(
            "data",
            reqwest::multipart::Part::text(json).mime_str("application/json")?,
        )
        .part(
            "imageFile",
            reqwest::multipart::Part::bytes(image)
                .file_name(format!("{}.jpg", job.event.id))
                .mime_str("image/jpeg")?,
        );

    if let Some(video_path) = &job.video_path {
        let video = tokio::fs::read(video_path)
            .await
            .with_context(|| format!("reading clip {}", video_path.display()))?;
        form = form.part(
            "videoFile",
            reqwest::multipart::Part::bytes(video)
                .file_name(format!("{}.mp4", job.event.id))
                .mime_str("video/mp4")?,
        );
    }

    let response = client
        .post(url)
        .multipart(form)
        .send()
        .await
        .context("upload request failed")?;

    if !response.status().is_success() {
        let status = response.status();
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| "<no body>".to_string());
        anyhow::bail!("ingestion API returned {}: {}", status, body);
    }
    Ok(())
}
