// src/types.rs

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

// ============================================================================
// GEOMETRY
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Point {
    pub x: f32,
    pub y: f32,
}

impl Point {
    pub fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }

    pub fn length(&self) -> f32 {
        (self.x * self.x + self.y * self.y).sqrt()
    }

    /// Unit vector, or None for a (near-)zero displacement.
    pub fn normalized(&self) -> Option<Point> {
        let len = self.length();
        if len < 1e-6 {
            return None;
        }
        Some(Point::new(self.x / len, self.y / len))
    }

    pub fn dot(&self, other: &Point) -> f32 {
        self.x * other.x + self.y * other.y
    }
}

/// Axis-aligned box in original image coordinates, [x1, y1] top-left.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoundingBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

impl BoundingBox {
    pub fn new(x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
        Self { x1, y1, x2, y2 }
    }

    pub fn centroid(&self) -> Point {
        Point::new((self.x1 + self.x2) / 2.0, (self.y1 + self.y2) / 2.0)
    }

    pub fn area(&self) -> f32 {
        (self.x2 - self.x1).max(0.0) * (self.y2 - self.y1).max(0.0)
    }

    pub fn iou(&self, other: &BoundingBox) -> f32 {
        let x1 = self.x1.max(other.x1);
        let y1 = self.y1.max(other.y1);
        let x2 = self.x2.min(other.x2);
        let y2 = self.y2.min(other.y2);

        let intersection = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
        let union = self.area() + other.area() - intersection;

        if union > 0.0 {
            intersection / union
        } else {
            0.0
        }
    }
}

// ============================================================================
// DETECTIONS AND TRACKS
// ============================================================================

/// One detector output for a single frame. No identity across frames.
#[derive(Debug, Clone)]
pub struct Detection {
    pub bbox: BoundingBox,
    pub class_name: String,
    pub confidence: f32,
}

/// A cross-frame identity maintained by the IdentityTracker.
#[derive(Debug, Clone)]
pub struct Track {
    pub id: u64,
    pub bbox: BoundingBox,
    /// Always overwritten with the matched detection's label; tracks do not
    /// enforce class consistency across frames.
    pub class_name: String,
    pub confidence: f32,
    pub last_seen: u64,
    /// Consecutive frames without a matching detection.
    pub missed: u32,
}

// ============================================================================
// VIOLATIONS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationKind {
    RedLight,
    WrongLane,
    WrongWay,
    ProlongedPresence,
    Overspeed,
    NoHelmet,
    Pothole,
    Accident,
}

impl ViolationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RedLight => "RED_LIGHT",
            Self::WrongLane => "WRONG_LANE",
            Self::WrongWay => "WRONG_WAY",
            Self::ProlongedPresence => "PROLONGED_PRESENCE",
            Self::Overspeed => "OVERSPEED",
            Self::NoHelmet => "NO_HELMET",
            Self::Pothole => "POTHOLE",
            Self::Accident => "ACCIDENT",
        }
    }

    /// Numeric id expected by the violation-ingestion API.
    pub fn type_id(&self) -> u32 {
        match self {
            Self::RedLight => 1,
            Self::WrongLane => 2,
            Self::WrongWay => 3,
            Self::ProlongedPresence => 4,
            Self::Overspeed => 5,
            Self::NoHelmet => 6,
            Self::Pothole => 7,
            Self::Accident => 8,
        }
    }
}

/// Created exactly once per qualifying episode; immutable afterwards.
#[derive(Debug, Clone)]
pub struct ViolationEvent {
    pub id: String,
    pub camera_id: String,
    pub track_id: u64,
    pub kind: ViolationKind,
    pub detected_at: time::OffsetDateTime,
    pub frame_id: u64,
    pub license_plate: String,
    pub description: String,
}

impl ViolationEvent {
    pub fn new(
        camera_id: &str,
        track_id: u64,
        kind: ViolationKind,
        frame_id: u64,
        description: String,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            camera_id: camera_id.to_string(),
            track_id,
            kind,
            detected_at: time::OffsetDateTime::now_utc(),
            frame_id,
            license_plate: "unknown".to_string(),
            description,
        }
    }
}

// ============================================================================
// CONFIGURATION
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub cameras: Vec<CameraConfig>,
    pub detector: DetectorConfig,
    #[serde(default)]
    pub tracker: TrackerConfig,
    #[serde(default)]
    pub violations: ViolationConfig,
    #[serde(default)]
    pub evidence: EvidenceConfig,
    #[serde(default)]
    pub dispatch: DispatchConfig,
    pub zone_source: ZoneSourceConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CameraConfig {
    pub id: String,
    /// Anything OpenCV can open: file path, RTSP/HTTP URL, resolved stream.
    pub source_url: String,
    /// Explicit predicate selection per camera; the state machine evaluates
    /// only these kinds.
    pub enabled_violations: Vec<ViolationKind>,
    /// TCP address for the live MJPEG output of this camera, if any.
    pub stream_addr: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectorConfig {
    pub model_path: String,
    pub confidence_threshold: f32,
    /// Class vocabulary of the deployed model, index = class id.
    pub class_names: Vec<String>,
    pub input_size: usize,
    pub intra_threads: usize,
    pub use_cuda: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackerConfig {
    /// Minimum IoU for a detection to extend an existing track.
    pub match_threshold: f32,
    /// Frames a track survives without a match before eviction.
    /// 0 = drop on first miss.
    pub grace_frames: u32,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            match_threshold: 0.7,
            grace_frames: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ViolationConfig {
    /// Displacements below this many pixels do not contribute direction samples.
    pub min_displacement_px: f32,
    pub position_history: usize,
    pub direction_history: usize,
    /// Dot product against the lane reference below this fires WRONG_WAY.
    pub direction_oppose_threshold: f32,
    /// Red/green smoothing: red wins when more than `red_majority` of the
    /// last `red_history_len` samples are red.
    pub red_history_len: usize,
    pub red_majority: usize,
    /// Continuous presence in a restricted zone before PROLONGED_PRESENCE.
    pub presence_threshold_secs: f32,
    pub speed_limit_kmh: f32,
    pub meters_per_pixel: f32,
    /// Detector classes that directly imply a violation kind.
    #[serde(default)]
    pub class_triggers: HashMap<String, ViolationKind>,
    /// Detector classes sampled as light-state observations.
    pub light_red_classes: Vec<String>,
    pub light_green_classes: Vec<String>,
}

impl Default for ViolationConfig {
    fn default() -> Self {
        Self {
            min_displacement_px: 5.0,
            position_history: 10,
            direction_history: 8,
            direction_oppose_threshold: -0.3,
            red_history_len: 3,
            red_majority: 1,
            presence_threshold_secs: 30.0,
            speed_limit_kmh: 60.0,
            meters_per_pixel: 0.05,
            class_triggers: HashMap::new(),
            light_red_classes: vec!["red_light".to_string()],
            light_green_classes: vec!["green_light".to_string()],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvidenceConfig {
    /// Ring capacity: frames kept before an event (~1s at source FPS).
    pub pre_frames: usize,
    /// Frames appended after the event before the clip is finalized.
    pub tail_frames: usize,
    pub jpeg_quality: i32,
    pub temp_dir: String,
}

impl Default for EvidenceConfig {
    fn default() -> Self {
        Self {
            pre_frames: 15,
            tail_frames: 15,
            jpeg_quality: 80,
            temp_dir: std::env::temp_dir()
                .join("violation-evidence")
                .to_string_lossy()
                .to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchConfig {
    pub upload_url: String,
    pub workers: usize,
    pub queue_capacity: usize,
    pub timeout_secs: u64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            upload_url: "http://localhost:8080/api/violations".to_string(),
            workers: 5,
            queue_capacity: 32,
            timeout_secs: 30,
        }
    }
}

/// Where zone geometry comes from. `file` wins when both are present.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ZoneSourceConfig {
    pub endpoint: Option<String>,
    pub file: Option<String>,
    #[serde(default)]
    pub retry: RetryPolicy,
}

/// Explicit retry policy: max attempts, base delay, multiplier.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 500,
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Delay before retrying after the given failed attempt (0-based).
    pub fn delay_for(&self, attempt: u32) -> std::time::Duration {
        let ms = self.base_delay_ms as f64 * self.multiplier.powi(attempt as i32);
        std::time::Duration::from_millis(ms as u64)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_iou_identical_boxes() {
        let b = BoundingBox::new(10.0, 10.0, 50.0, 50.0);
        assert!((b.iou(&b) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_iou_disjoint_boxes() {
        let a = BoundingBox::new(0.0, 0.0, 10.0, 10.0);
        let b = BoundingBox::new(100.0, 100.0, 110.0, 110.0);
        assert_eq!(a.iou(&b), 0.0);
    }

    #[test]
    fn test_iou_partial_overlap() {
        let a = BoundingBox::new(0.0, 0.0, 10.0, 10.0);
        let b = BoundingBox::new(5.0, 0.0, 15.0, 10.0);
        // intersection 50, union 150
        assert!((a.iou(&b) - 1.0 / 3.0).abs() < 1e-6);
    }

    #[test]
    fn test_retry_delay_multiplies() {
        let policy = RetryPolicy {
            max_attempts: 3,
            base_delay_ms: 100,
            multiplier: 2.0,
        };
        assert_eq!(policy.delay_for(0).as_millis(), 100);
        assert_eq!(policy.delay_for(1).as_millis(), 200);
        assert_eq!(policy.delay_for(2).as_millis(), 400);
    }

    #[test]
    fn test_normalized_zero_vector() {
        assert!(Point::new(0.0, 0.0).normalized().is_none());
        let n = Point::new(3.0, 4.0).normalized().unwrap();
        assert!((n.length() - 1.0).abs() < 1e-6);
    }
}
