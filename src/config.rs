// src/config.rs
//
// Configuration loading and zone-document retrieval.
//
// The application config is a YAML file. Zone geometry comes from an
// external configuration service per camera, fetched over HTTP with the
// configured retry policy; a local file path can override the endpoint for
// development and tests.

use crate::types::{Config, RetryPolicy, ZoneSourceConfig};
use crate::zones::ZoneDocument;
use anyhow::{Context, Result};
use std::fs;
use tracing::{info, warn};

impl Config {
    pub fn load(path: &str) -> Result<Self> {
        let contents =
            fs::read_to_string(path).with_context(|| format!("reading config {}", path))?;
        let config: Config = serde_yaml::from_str(&contents)
            .with_context(|| format!("parsing config {}", path))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.cameras.is_empty() {
            anyhow::bail!("no cameras configured");
        }
        for camera in &self.cameras {
            if camera.id.is_empty() {
                anyhow::bail!("camera with empty id");
            }
            if camera.source_url.is_empty() {
                anyhow::bail!("camera '{}' has no source_url", camera.id);
            }
        }
        if self.detector.class_names.is_empty() {
            anyhow::bail!("detector.class_names must not be empty");
        }
        Ok(())
    }
}

/// Fetch the zone document for one camera. A configured file takes
/// precedence over the endpoint; the endpoint is retried per policy and a
/// final failure terminates the camera session.
pub async fn fetch_zone_document(
    source: &ZoneSourceConfig,
    camera_id: &str,
) -> Result<ZoneDocument> {
    if let Some(path) = &source.file {
        let contents =
            fs::read_to_string(path).with_context(|| format!("reading zone file {}", path))?;
        let doc: ZoneDocument = serde_json::from_str(&contents)
            .with_context(|| format!("parsing zone file {}", path))?;
        info!("Loaded zone document for {} from {}", camera_id, path);
        return Ok(doc);
    }

    let endpoint = source
        .endpoint
        .as_ref()
        .context("zone_source needs either a file or an endpoint")?;
    let url = format!("{}/{}", endpoint.trim_end_matches('/'), camera_id);

    let client = reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(10))
        .build()
        .context("Failed to build HTTP client")?;

    fetch_with_retry(&client, &url, &source.retry).await
}

async fn fetch_with_retry(
    client: &reqwest::Client,
    url: &str,
    retry: &RetryPolicy,
) -> Result<ZoneDocument> {
    let attempts = retry.max_attempts.max(1);
    let mut last_err = None;

    for attempt in 0..attempts {
        match try_fetch(client, url).await {
            Ok(doc) => {
                info!("Fetched zone document from {} (attempt {})", url, attempt + 1);
                return Ok(doc);
            }
            Err(e) => {
                warn!(
                    "Zone fetch attempt {}/{} failed: {:#}",
                    attempt + 1,
                    attempts,
                    e
                );
                last_err = Some(e);
                if attempt + 1 < attempts {
                    tokio::time::sleep(retry.delay_for(attempt)).await;
                }
            }
        }
    }

    Err(last_err
        .unwrap_or_else(|| anyhow::anyhow!("zone fetch failed"))
        .context(format!("zone fetch exhausted {} attempt(s)", attempts)))
}

async fn try_fetch(client: &reqwest::Client, url: &str) -> Result<ZoneDocument> {
    let response = client.get(url).send().await.context("request failed")?;
    if !response.status().is_success() {
        anyhow::bail!("zone service returned {}", response.status());
    }
    response
        .json::<ZoneDocument>()
        .await
        .context("decoding zone document")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SAMPLE_CONFIG: &str = r#"
cameras:
  - id: cam-1
    source_url: rtsp://example/stream
    enabled_violations: [red_light, wrong_lane]
    stream_addr: "0.0.0.0:8554"
detector:
  model_path: models/traffic.onnx
  confidence_threshold: 0.4
  class_names: [car, motorcycle, bus, truck, red_light, green_light]
  input_size: 640
  intra_threads: 4
  use_cuda: false
zone_source:
  endpoint: http://localhost:9000/zones
logging:
  level: info
"#;

    fn write_temp(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_load_sample_config() {
        let file = write_temp(SAMPLE_CONFIG);
        let config = Config::load(file.path().to_str().unwrap()).unwrap();

        assert_eq!(config.cameras.len(), 1);
        assert_eq!(config.cameras[0].id, "cam-1");
        assert_eq!(config.cameras[0].enabled_violations.len(), 2);
        // Omitted sections fall back to defaults.
        assert_eq!(config.tracker.grace_frames, 0);
        assert_eq!(config.dispatch.workers, 5);
        assert_eq!(config.zone_source.retry.max_attempts, 3);
    }

    #[test]
    fn test_rejects_config_without_cameras() {
        let file = write_temp(&SAMPLE_CONFIG.replace(
            "cameras:
  - id: cam-1
    source_url: rtsp://example/stream
    enabled_violations: [red_light, wrong_lane]
    stream_addr: \"0.0.0.0:8554\"",
            "cameras: []",
        ));
        assert!(Config::load(file.path().to_str().unwrap()).is_err());
    }

    #[tokio::test]
    async fn test_zone_file_overrides_endpoint() {
        let zone_json = r#"{
            "coordinateSpace": "percent",
            "zones": [
                {"id": 1, "name": "lane", "zoneType": "lane",
                 "coordinates": [[0, 0], [100, 0], [100, 100], [0, 100]]}
            ],
            "laneTransitions": [],
            "lightLinks": []
        }"#;
        let file = write_temp(zone_json);

        let source = ZoneSourceConfig {
            endpoint: Some("http://127.0.0.1:9/unreachable".to_string()),
            file: Some(file.path().to_str().unwrap().to_string()),
            retry: RetryPolicy::default(),
        };

        let doc = fetch_zone_document(&source, "cam-1").await.unwrap();
        assert_eq!(doc.zones.len(), 1);
        assert_eq!(doc.zones[0].id, 1);
    }

    #[tokio::test]
    async fn test_endpoint_failure_exhausts_retries() {
        let source = ZoneSourceConfig {
            endpoint: Some("http://127.0.0.1:9".to_string()),
            file: None,
            retry: RetryPolicy {
                max_attempts: 2,
                base_delay_ms: 10,
                multiplier: 1.0,
            },
        };
        let err = fetch_zone_document(&source, "cam-1").await.unwrap_err();
        assert!(format!("{:#}", err).contains("2 attempt"));
    }
}
