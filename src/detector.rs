// src/detector.rs
//
// YOLO-family object detection over ONNX Runtime.
//
// The model is custom-trained for traffic scenes: its class vocabulary
// (vehicles, light states, riders without helmets, potholes, crashed
// vehicles) comes from configuration rather than a hardcoded COCO list, so
// a retrained model only needs a config change.
//
// Output layout assumed: [1, 4 + num_classes, num_predictions] with
// center-format boxes, the standard YOLOv8 export shape.

use crate::types::{BoundingBox, Detection, DetectorConfig};
use anyhow::{Context, Result};
use ort::{
    execution_providers::CUDAExecutionProvider,
    session::{builder::GraphOptimizationLevel, Session},
};
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

const NMS_IOU_THRESHOLD: f32 = 0.45;
const LETTERBOX_FILL: u8 = 114;

/// Seam for the per-frame detection step. The production implementation is
/// ONNX-backed; tests substitute scripted detections.
pub trait Detector: Send {
    /// Detect objects in one RGB frame (HWC, 8-bit).
    fn detect(&mut self, frame: &[u8], width: usize, height: usize) -> Result<Vec<Detection>>;
}

/// One detector instance per process. Loading the model is expensive, so
/// every camera session shares the same instance behind a mutex; inference
/// serializes across cameras.
pub type SharedDetector = Arc<Mutex<dyn Detector>>;

/// Seam for license-plate extraction from an evidence snapshot.
pub trait PlateReader: Send {
    fn read_plate(&self, snapshot_jpeg: &[u8]) -> Option<String>;
}

/// No OCR deployed: every plate reads as unknown.
pub struct NullPlateReader;

impl PlateReader for NullPlateReader {
    fn read_plate(&self, _snapshot_jpeg: &[u8]) -> Option<String> {
        None
    }
}

// ============================================================================
// ONNX DETECTOR
// ============================================================================

pub struct YoloDetector {
    session: Session,
    config: DetectorConfig,
}

impl YoloDetector {
    pub fn new(config: DetectorConfig) -> Result<Self> {
        info!("Loading detection model: {}", config.model_path);

        let mut builder = Session::builder()?;
        if config.use_cuda {
            builder = builder.with_execution_providers([CUDAExecutionProvider::default()
                .with_device_id(0)
                .build()])?;
        }
        let session = builder
            .with_optimization_level(GraphOptimizationLevel::Level3)?
            .with_intra_threads(config.intra_threads)?
            .commit_from_file(&config.model_path)
            .with_context(|| format!("loading model {}", config.model_path))?;

        info!(
            "Detector initialized: {} class(es), input {}x{}",
            config.class_names.len(),
            config.input_size,
            config.input_size
        );
        Ok(Self { session, config })
    }

    fn infer(&mut self, input: &[f32]) -> Result<Vec<f32>> {
        let size = self.config.input_size;
        let shape = [1usize, 3, size, size];
        let input_value =
            ort::value::Value::from_array((shape.as_slice(), input.to_vec().into_boxed_slice()))?;

        let outputs = self.session.run(ort::inputs!["images" => input_value])?;
        let output = &outputs[0];
        let (_, data) = output.try_extract_tensor::<f32>()?;
        Ok(data.to_vec())
    }
}

impl Detector for YoloDetector {
    fn detect(&mut self, frame: &[u8], width: usize, height: usize) -> Result<Vec<Detection>> {
        let (input, letterbox) = preprocess(frame, width, height, self.config.input_size);
        let output = self.infer(&input)?;
        let detections = postprocess(
            &output,
            &letterbox,
            &self.config.class_names,
            self.config.confidence_threshold,
        );
        debug!("Detected {} object(s)", detections.len());
        Ok(detections)
    }
}

// ============================================================================
// PRE/POST-PROCESSING
// ============================================================================

/// Letterbox transform parameters, needed to map model-space boxes back to
/// original image coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Letterbox {
    pub scale: f32,
    pub pad_x: f32,
    pub pad_y: f32,
}

impl Letterbox {
    pub fn fit(src_w: usize, src_h: usize, target: usize) -> Self {
        let scale = (target as f32 / src_w as f32).min(target as f32 / src_h as f32);
        let scaled_w = (src_w as f32 * scale) as usize;
        let scaled_h = (src_h as f32 * scale) as usize;
        Self {
            scale,
            pad_x: (target - scaled_w) as f32 / 2.0,
            pad_y: (target - scaled_h) as f32 / 2.0,
        }
    }

    /// Model-space point back to original image coordinates.
    pub fn unmap(&self, x: f32, y: f32) -> (f32, f32) {
        ((x - self.pad_x) / self.scale, (y - self.pad_y) / self.scale)
    }
}

/// Resize onto a gray letterboxed canvas, normalize to [0, 1], HWC -> CHW.
fn preprocess(src: &[u8], src_w: usize, src_h: usize, target: usize) -> (Vec<f32>, Letterbox) {
    let letterbox = Letterbox::fit(src_w, src_h, target);
    let scaled_w = (src_w as f32 * letterbox.scale) as usize;
    let scaled_h = (src_h as f32 * letterbox.scale) as usize;

    let resized = resize_bilinear(src, src_w, src_h, scaled_w, scaled_h);

    let mut canvas = vec![LETTERBOX_FILL; target * target * 3];
    let off_x = letterbox.pad_x as usize;
    let off_y = letterbox.pad_y as usize;
    for y in 0..scaled_h {
        for x in 0..scaled_w {
            let src_idx = (y * scaled_w + x) * 3;
            let dst_idx = ((y + off_y) * target + (x + off_x)) * 3;
            canvas[dst_idx..dst_idx + 3].copy_from_slice(&resized[src_idx..src_idx + 3]);
        }
    }

    let mut input = vec![0.0f32; 3 * target * target];
    for c in 0..3 {
        for h in 0..target {
            for w in 0..target {
                let hwc_idx = (h * target + w) * 3 + c;
                let chw_idx = c * target * target + h * target + w;
                input[chw_idx] = canvas[hwc_idx] as f32 / 255.0;
            }
        }
    }

    (input, letterbox)
}

fn resize_bilinear(src: &[u8], src_w: usize, src_h: usize, dst_w: usize, dst_h: usize) -> Vec<u8> {
    let mut dst = vec![0u8; dst_h * dst_w * 3];
    if dst_w == 0 || dst_h == 0 || src_w == 0 || src_h == 0 {
        return dst;
    }
    let x_ratio = src_w as f32 / dst_w as f32;
    let y_ratio = src_h as f32 / dst_h as f32;

    for dy in 0..dst_h {
        for dx in 0..dst_w {
            let sx = dx as f32 * x_ratio;
            let sy = dy as f32 * y_ratio;
            let sx0 = sx.floor() as usize;
            let sy0 = sy.floor() as usize;
            let sx1 = (sx0 + 1).min(src_w - 1);
            let sy1 = (sy0 + 1).min(src_h - 1);
            let fx = sx - sx0 as f32;
            let fy = sy - sy0 as f32;

            for c in 0..3 {
                let p00 = src[(sy0 * src_w + sx0) * 3 + c] as f32;
                let p10 = src[(sy0 * src_w + sx1) * 3 + c] as f32;
                let p01 = src[(sy1 * src_w + sx0) * 3 + c] as f32;
                let p11 = src[(sy1 * src_w + sx1) * 3 + c] as f32;

                let val = p00 * (1.0 - fx) * (1.0 - fy)
                    + p10 * fx * (1.0 - fy)
                    + p01 * (1.0 - fx) * fy
                    + p11 * fx * fy;

                dst[(dy * dst_w + dx) * 3 + c] = val.round() as u8;
            }
        }
    }
    dst
}

/// Parse the flat [1, 4+C, N] tensor, map boxes back through the letterbox,
/// filter by confidence and suppress overlaps.
fn postprocess(
    output: &[f32],
    letterbox: &Letterbox,
    class_names: &[String],
    conf_thresh: f32,
) -> Vec<Detection> {
    let channels = 4 + class_names.len();
    if channels == 4 || output.len() % channels != 0 {
        return Vec::new();
    }
    let preds = output.len() / channels;

    let mut detections = Vec::new();
    for i in 0..preds {
        let cx = output[i];
        let cy = output[preds + i];
        let w = output[preds * 2 + i];
        let h = output[preds * 3 + i];

        let mut max_conf = 0.0f32;
        let mut best_class = 0;
        for (c, _) in class_names.iter().enumerate() {
            let conf = output[preds * (4 + c) + i];
            if conf > max_conf {
                max_conf = conf;
                best_class = c;
            }
        }
        if max_conf < conf_thresh {
            continue;
        }

        let (x1, y1) = letterbox.unmap(cx - w / 2.0, cy - h / 2.0);
        let (x2, y2) = letterbox.unmap(cx + w / 2.0, cy + h / 2.0);

        detections.push(Detection {
            bbox: BoundingBox::new(x1, y1, x2, y2),
            class_name: class_names[best_class].clone(),
            confidence: max_conf,
        });
    }

    nms(detections, NMS_IOU_THRESHOLD)
}

/// Greedy non-maximum suppression, highest confidence first.
fn nms(mut detections: Vec<Detection>, iou_threshold: f32) -> Vec<Detection> {
    detections.sort_by(|a, b| {
        b.confidence
            .partial_cmp(&a.confidence)
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut keep: Vec<Detection> = Vec::new();
    while !detections.is_empty() {
        let current = detections.remove(0);
        detections.retain(|det| current.bbox.iou(&det.bbox) < iou_threshold);
        keep.push(current);
    }
    keep
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_letterbox_wide_frame() {
        // 1280x720 into 640: scale by width, pad vertically.
        let lb = Letterbox::fit(1280, 720, 640);
        assert!((lb.scale - 0.5).abs() < 1e-6);
        assert_eq!(lb.pad_x, 0.0);
        assert_eq!(lb.pad_y, 140.0);

        // A model-space point maps back through scale and padding.
        let (x, y) = lb.unmap(320.0, 320.0);
        assert!((x - 640.0).abs() < 1e-4);
        assert!((y - 360.0).abs() < 1e-4);
    }

    #[test]
    fn test_letterbox_square_frame_is_identity_pad() {
        let lb = Letterbox::fit(640, 640, 640);
        assert!((lb.scale - 1.0).abs() < 1e-6);
        assert_eq!(lb.pad_x, 0.0);
        assert_eq!(lb.pad_y, 0.0);
    }

    /// Flat [1, 4+C, N] tensor from per-prediction rows.
    fn tensor(preds: &[(f32, f32, f32, f32, Vec<f32>)]) -> Vec<f32> {
        let n = preds.len();
        let classes = preds[0].4.len();
        let mut out = vec![0.0f32; (4 + classes) * n];
        for (i, (cx, cy, w, h, confs)) in preds.iter().enumerate() {
            out[i] = *cx;
            out[n + i] = *cy;
            out[n * 2 + i] = *w;
            out[n * 3 + i] = *h;
            for (c, conf) in confs.iter().enumerate() {
                out[n * (4 + c) + i] = *conf;
            }
        }
        out
    }

    fn classes() -> Vec<String> {
        vec!["car".to_string(), "red_light".to_string()]
    }

    #[test]
    fn test_postprocess_filters_by_confidence_and_picks_best_class() {
        let identity = Letterbox {
            scale: 1.0,
            pad_x: 0.0,
            pad_y: 0.0,
        };
        let output = tensor(&[
            (100.0, 100.0, 40.0, 40.0, vec![0.9, 0.1]),
            (300.0, 300.0, 40.0, 40.0, vec![0.1, 0.2]), // below threshold
        ]);

        let dets = postprocess(&output, &identity, &classes(), 0.5);
        assert_eq!(dets.len(), 1);
        assert_eq!(dets[0].class_name, "car");
        assert!((dets[0].bbox.x1 - 80.0).abs() < 1e-4);
        assert!((dets[0].bbox.y2 - 120.0).abs() < 1e-4);
    }

    #[test]
    fn test_postprocess_reverses_letterbox() {
        let lb = Letterbox::fit(1280, 720, 640);
        // Center of the model space corresponds to the frame center.
        let output = tensor(&[(320.0, 320.0, 64.0, 64.0, vec![0.9, 0.0])]);

        let dets = postprocess(&output, &lb, &classes(), 0.5);
        assert_eq!(dets.len(), 1);
        let c = dets[0].bbox.centroid();
        assert!((c.x - 640.0).abs() < 1.0);
        assert!((c.y - 360.0).abs() < 1.0);
    }

    #[test]
    fn test_nms_suppresses_overlapping_duplicates() {
        let identity = Letterbox {
            scale: 1.0,
            pad_x: 0.0,
            pad_y: 0.0,
        };
        // Two near-identical boxes and one far away.
        let output = tensor(&[
            (100.0, 100.0, 40.0, 40.0, vec![0.9, 0.0]),
            (102.0, 101.0, 40.0, 40.0, vec![0.8, 0.0]),
            (400.0, 400.0, 40.0, 40.0, vec![0.7, 0.0]),
        ]);

        let dets = postprocess(&output, &identity, &classes(), 0.5);
        assert_eq!(dets.len(), 2);
        // Highest confidence survived the overlap.
        assert!((dets[0].confidence - 0.9).abs() < 1e-6);
    }

    #[test]
    fn test_preprocess_shape_and_range() {
        let frame = vec![255u8; 64 * 32 * 3];
        let (input, lb) = preprocess(&frame, 64, 32, 64);
        assert_eq!(input.len(), 3 * 64 * 64);
        assert!(input.iter().all(|&v| (0.0..=1.0).contains(&v)));
        // Width-bound scale; vertical padding filled with gray.
        assert!((lb.scale - 1.0).abs() < 1e-6);
        assert_eq!(lb.pad_y, 16.0);
        let gray = LETTERBOX_FILL as f32 / 255.0;
        assert!((input[0] - gray).abs() < 1e-6);
    }

    #[test]
    fn test_null_plate_reader() {
        assert!(NullPlateReader.read_plate(b"jpeg").is_none());
    }
}
