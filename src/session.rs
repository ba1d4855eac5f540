// src/session.rs
//
// One camera, one synchronous frame loop.
//
// Every frame runs capture -> detect -> track -> evaluate-violations ->
// annotate -> encode -> emit, in that order. A frame is never published to
// the live stream before its violation evaluation has completed, so the
// overlays always match what the state machine decided for that frame. The
// only work leaving this loop is evidence dispatch, which goes through a
// non-blocking queue.
//
// Error containment: a failure inside a single frame is logged and the loop
// moves on (detection failures degrade to an empty detection set). A stream
// drop triggers a reconnect. Only stream-open failures terminate the
// session.

use crate::annotate::StreamAnnotator;
use crate::detector::{Detector, PlateReader, SharedDetector};
use crate::dispatch::{DispatcherHandle, EvidenceJob};
use crate::evidence::{encode_jpeg, EvidenceClip, EvidenceRecorder};
use crate::frame_source::{FrameSource, SourceFrame, VideoFrameSource};
use crate::mjpeg::MjpegBroadcaster;
use crate::tracker::IdentityTracker;
use crate::types::{CameraConfig, Detection, EvidenceConfig, TrackerConfig, ViolationConfig};
use crate::violations::ViolationStateMachine;
use crate::zones::{ZoneDocument, ZoneIndex};
use anyhow::{Context, Result};
use opencv::{core::Mat, imgproc, prelude::*};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{error, info, warn};

const RECONNECT_DELAY: std::time::Duration = std::time::Duration::from_secs(3);
const DENSITY_WINDOW: usize = 90;
const STATS_LOG_INTERVAL: u64 = 300;

// ============================================================================
// STATS
// ============================================================================

/// Rolling per-session counters, including the traffic-density gauge (mean
/// live-track count over the recent window).
#[derive(Default)]
pub struct SessionStats {
    pub frames: u64,
    pub violations: u64,
    pub clips_submitted: u64,
    density: VecDeque<usize>,
}

impl SessionStats {
    fn note_frame(&mut self, live_tracks: usize) {
        self.frames += 1;
        self.density.push_back(live_tracks);
        while self.density.len() > DENSITY_WINDOW {
            self.density.pop_front();
        }
    }

    pub fn traffic_density(&self) -> f32 {
        if self.density.is_empty() {
            return 0.0;
        }
        self.density.iter().sum::<usize>() as f32 / self.density.len() as f32
    }
}

// ============================================================================
// SESSION
// ============================================================================

pub enum LoopExit {
    StreamEnded,
    Stopped,
}

pub struct CameraSession {
    camera: CameraConfig,
    tracker_config: TrackerConfig,
    violation_config: ViolationConfig,
    evidence_config: EvidenceConfig,
    zone_doc: ZoneDocument,

    detector: SharedDetector,
    plate_reader: Box<dyn PlateReader>,
    tracker: IdentityTracker,
    annotator: StreamAnnotator,
    dispatcher: DispatcherHandle,
    broadcaster: Option<MjpegBroadcaster>,

    // Built on the first frame, when stream dimensions and FPS are known.
    zones: Option<ZoneIndex>,
    machine: Option<ViolationStateMachine>,
    recorder: Option<EvidenceRecorder>,

    pub stats: SessionStats,
    stop: Arc<AtomicBool>,
}

impl CameraSession {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        camera: CameraConfig,
        tracker_config: TrackerConfig,
        violation_config: ViolationConfig,
        evidence_config: EvidenceConfig,
        zone_doc: ZoneDocument,
        detector: SharedDetector,
        plate_reader: Box<dyn PlateReader>,
        dispatcher: DispatcherHandle,
        broadcaster: Option<MjpegBroadcaster>,
        stop: Arc<AtomicBool>,
    ) -> Self {
        let tracker = IdentityTracker::new(tracker_config.clone());
        let annotator = StreamAnnotator::new(&camera.id);
        Self {
            camera,
            tracker_config,
            violation_config,
            evidence_config,
            zone_doc,
            detector,
            plate_reader,
            tracker,
            annotator,
            dispatcher,
            broadcaster,
            zones: None,
            machine: None,
            recorder: None,
            stats: SessionStats::default(),
            stop,
        }
    }

    /// Run until stopped. Opens the stream, processes frames, reconnects on
    /// stream drops. A stream-open failure propagates and ends the session.
    pub fn run(&mut self) -> Result<()> {
        loop {
            let mut source = VideoFrameSource::open(&self.camera.source_url)
                .with_context(|| format!("camera '{}'", self.camera.id))?;

            match self.run_with_source(&mut source) {
                LoopExit::Stopped => {
                    info!(
                        "Camera '{}' stopped after {} frame(s), {} violation(s)",
                        self.camera.id, self.stats.frames, self.stats.violations
                    );
                    return Ok(());
                }
                LoopExit::StreamEnded => {
                    if self.stop.load(Ordering::Relaxed) {
                        return Ok(());
                    }
                    warn!(
                        "Camera '{}' stream dropped at frame {}; reconnecting",
                        self.camera.id, self.stats.frames
                    );
                    self.reset_stream_state();
                    std::thread::sleep(RECONNECT_DELAY);
                }
            }
        }
    }

    /// A reopened stream restarts frame numbering from zero and may change
    /// dimensions or FPS, so nothing per-stream survives the gap: track
    /// identities, per-track violation state, unfinished evidence, and
    /// overlay flashes all start fresh on the next first frame.
    fn reset_stream_state(&mut self) {
        if let Some(recorder) = &self.recorder {
            let pending = recorder.pending_count();
            if pending > 0 {
                warn!(
                    "Camera '{}': dropping {} unfinished evidence clip(s) with the stream",
                    self.camera.id, pending
                );
            }
        }
        self.tracker = IdentityTracker::new(self.tracker_config.clone());
        self.annotator = StreamAnnotator::new(&self.camera.id);
        self.zones = None;
        self.machine = None;
        self.recorder = None;
    }

    /// Drain one opened source. Per-frame failures are contained here.
    pub fn run_with_source(&mut self, source: &mut dyn FrameSource) -> LoopExit {
        let fps = source.fps();
        loop {
            if self.stop.load(Ordering::Relaxed) {
                return LoopExit::Stopped;
            }
            let Some(frame) = source.next_frame() else {
                return LoopExit::StreamEnded;
            };
            let frame_id = frame.frame_id;
            if let Err(e) = self.process_frame(frame, fps) {
                warn!(
                    "Camera '{}' frame {} failed: {:#}",
                    self.camera.id, frame_id, e
                );
            }
        }
    }

    fn process_frame(&mut self, frame: SourceFrame, fps: f64) -> Result<()> {
        let SourceFrame { frame_id, mut mat } = frame;
        let width = mat.cols() as usize;
        let height = mat.rows() as usize;

        if self.zones.is_none() {
            self.zones = Some(ZoneIndex::build(&self.zone_doc, width as f32, height as f32));
            self.machine = Some(ViolationStateMachine::new(
                &self.camera.id,
                &self.camera.enabled_violations,
                self.violation_config.clone(),
                fps,
            ));
            self.recorder = Some(EvidenceRecorder::new(self.evidence_config.clone(), fps));
            info!(
                "Camera '{}' session initialized: {}x{} @ {:.1} FPS",
                self.camera.id, width, height, fps
            );
        }

        // Detection failure degrades to an empty set; the stream keeps going.
        let detections = match detect_rgb(&self.detector, &mat, width, height) {
            Ok(d) => d,
            Err(e) => {
                warn!("Detection failed on frame {}: {:#}", frame_id, e);
                Vec::new()
            }
        };

        let zones = self.zones.as_ref().context("zones not initialized")?;
        let machine = self.machine.as_mut().context("machine not initialized")?;

        // Light-state observations come straight from detections, before
        // tracking: light classes are static objects, not vehicles.
        for det in &detections {
            let is_red = self.violation_config.light_red_classes.contains(&det.class_name);
            let is_green = self
                .violation_config
                .light_green_classes
                .contains(&det.class_name);
            if !is_red && !is_green {
                continue;
            }
            let centroid = det.bbox.centroid();
            for light in zones.light_zones() {
                if light.contains(centroid) {
                    machine.note_light_sample(light.id, is_red);
                    break;
                }
            }
        }

        let tracks = self.tracker.update(detections, frame_id);
        let live_count = tracks.len();

        let events = machine.observe_frame(&tracks, zones, frame_id);

        self.annotator.note_events(&events, frame_id);
        self.annotator.annotate(&mut mat, &tracks, Some(zones), frame_id)?;
        drop(tracks);

        let evicted = self.tracker.evicted().to_vec();
        machine.forget_tracks(&evicted);

        // Evidence and live output share one encode of the annotated frame.
        let jpeg = encode_jpeg(&mat, self.evidence_config.jpeg_quality)?;
        let recorder = self.recorder.as_mut().context("recorder not initialized")?;
        let finished = recorder.push_encoded(frame_id, jpeg.clone());

        for event in events {
            self.stats.violations += 1;
            recorder.begin_clip(event);
        }
        for clip in finished {
            self.submit_clip(clip);
        }

        if let Some(broadcaster) = &self.broadcaster {
            broadcaster.publish(jpeg);
        }

        self.stats.note_frame(live_count);
        if self.stats.frames % STATS_LOG_INTERVAL == 0 {
            info!(
                "Camera '{}': frame {}, traffic density {:.1}, {} violation(s), {} clip(s) sent",
                self.camera.id,
                self.stats.frames,
                self.stats.traffic_density(),
                self.stats.violations,
                self.stats.clips_submitted
            );
        }

        Ok(())
    }

    fn submit_clip(&mut self, mut clip: EvidenceClip) {
        if let Some(plate) = self.plate_reader.read_plate(&clip.snapshot_jpeg) {
            clip.event.license_plate = plate;
        }

        let recorder = match self.recorder.as_ref() {
            Some(r) => r,
            None => return,
        };

        let job = match recorder.materialize(&clip) {
            Ok((image_path, video_path, artifacts)) => EvidenceJob {
                event: clip.event,
                image_path,
                video_path: Some(video_path),
                artifacts,
            },
            Err(e) => {
                warn!(
                    "Clip encode failed for event {}: {:#}; sending snapshot only",
                    clip.event.id, e
                );
                match recorder.materialize_snapshot(&clip) {
                    Ok((image_path, artifacts)) => EvidenceJob {
                        event: clip.event,
                        image_path,
                        video_path: None,
                        artifacts,
                    },
                    Err(e) => {
                        error!("Evidence for event {} lost entirely: {:#}", clip.event.id, e);
                        return;
                    }
                }
            }
        };

        self.dispatcher.submit(job);
        self.stats.clips_submitted += 1;
    }
}

fn detect_rgb(
    detector: &SharedDetector,
    mat: &Mat,
    width: usize,
    height: usize,
) -> Result<Vec<Detection>> {
    let mut rgb = Mat::default();
    imgproc::cvt_color(mat, &mut rgb, imgproc::COLOR_BGR2RGB, 0)?;
    let data = rgb.data_bytes()?;
    let mut detector = detector
        .lock()
        .map_err(|_| anyhow::anyhow!("detector lock poisoned"))?;
    detector.detect(data, width, height)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::ViolationDispatcher;
    use crate::types::{BoundingBox, DispatchConfig, ViolationKind};
    use crate::zones::{CoordinateSpace, LaneTransitionSpec, ZoneKind, ZoneSpec};
    use opencv::core;
    use std::sync::Mutex;

    /// Fixed-length stream of black frames.
    struct ScriptedSource {
        remaining: usize,
        next_id: u64,
    }

    impl FrameSource for ScriptedSource {
        fn next_frame(&mut self) -> Option<SourceFrame> {
            if self.remaining == 0 {
                return None;
            }
            self.remaining -= 1;
            let mat = Mat::new_rows_cols_with_default(
                200,
                200,
                core::CV_8UC3,
                core::Scalar::all(0.0),
            )
            .ok()?;
            let frame_id = self.next_id;
            self.next_id += 1;
            Some(SourceFrame { frame_id, mat })
        }

        fn fps(&self) -> f64 {
            10.0
        }
    }

    /// Replays a fixed per-frame detection script, ignoring pixels.
    struct ScriptedDetector {
        script: Vec<Vec<Detection>>,
        call: usize,
    }

    impl Detector for ScriptedDetector {
        fn detect(&mut self, _: &[u8], _: usize, _: usize) -> Result<Vec<Detection>> {
            let dets = self.script.get(self.call).cloned().unwrap_or_default();
            self.call += 1;
            Ok(dets)
        }
    }

    struct NoPlates;
    impl PlateReader for NoPlates {
        fn read_plate(&self, _: &[u8]) -> Option<String> {
            None
        }
    }

    fn scripted(script: Vec<Vec<Detection>>) -> SharedDetector {
        Arc::new(Mutex::new(ScriptedDetector { script, call: 0 }))
    }

    fn car_at(cy: f32) -> Detection {
        Detection {
            bbox: BoundingBox::new(80.0, cy - 15.0, 120.0, cy + 15.0),
            class_name: "car".to_string(),
            confidence: 0.9,
        }
    }

    /// Lanes A (top half) and B (bottom half) of a 200x200 frame; no legal
    /// transition from A to B.
    fn zone_doc() -> ZoneDocument {
        let lane = |id: u32, name: &str, coords: Vec<(f32, f32)>| ZoneSpec {
            id,
            name: name.to_string(),
            zone_type: ZoneKind::Lane,
            coordinates: coords,
            allowed_classes: None,
            restricted: false,
            presence_threshold_secs: None,
        };
        ZoneDocument {
            coordinate_space: CoordinateSpace::Reference,
            reference_width: Some(200.0),
            reference_height: Some(200.0),
            zones: vec![
                lane(1, "lane-a", vec![(0.0, 0.0), (200.0, 0.0), (200.0, 95.0), (0.0, 95.0)]),
                lane(
                    2,
                    "lane-b",
                    vec![(0.0, 105.0), (200.0, 105.0), (200.0, 200.0), (0.0, 200.0)],
                ),
            ],
            lane_transitions: vec![LaneTransitionSpec {
                from_lane_zone_id: 2,
                to_lane_zone_id: 1,
            }],
            light_links: vec![],
        }
    }

    fn session(detector: SharedDetector, dispatcher: DispatcherHandle) -> CameraSession {
        let camera = CameraConfig {
            id: "cam-test".to_string(),
            source_url: "unused".to_string(),
            enabled_violations: vec![ViolationKind::WrongLane],
            stream_addr: None,
        };
        let evidence = EvidenceConfig {
            pre_frames: 3,
            tail_frames: 2,
            jpeg_quality: 80,
            temp_dir: tempfile::tempdir().unwrap().keep().to_string_lossy().to_string(),
        };
        CameraSession::new(
            camera,
            TrackerConfig::default(),
            ViolationConfig::default(),
            evidence,
            zone_doc(),
            detector,
            Box::new(NoPlates),
            dispatcher,
            None,
            Arc::new(AtomicBool::new(false)),
        )
    }

    #[tokio::test]
    async fn test_illegal_lane_change_yields_one_clip() {
        // Unroutable upload endpoint: submission still counts, upload fails
        // in the background and the worker cleans up.
        let dispatcher = ViolationDispatcher::spawn(DispatchConfig {
            upload_url: "http://127.0.0.1:9/api/violations".to_string(),
            workers: 1,
            queue_capacity: 8,
            timeout_secs: 1,
        })
        .unwrap();

        // One car descending from lane A into lane B in steps small enough
        // to keep its track identity, then holding still long enough for
        // the evidence tail to complete.
        let mut script: Vec<Vec<Detection>> =
            (0..10).map(|i| vec![car_at(80.0 + i as f32 * 4.0)]).collect();
        for _ in 0..5 {
            script.push(vec![car_at(116.0)]);
        }

        let frames = script.len();
        let mut session = session(scripted(script), dispatcher);
        let mut source = ScriptedSource {
            remaining: frames,
            next_id: 0,
        };

        let exit = session.run_with_source(&mut source);
        assert!(matches!(exit, LoopExit::StreamEnded));
        assert_eq!(session.stats.frames, frames as u64);
        assert_eq!(session.stats.violations, 1);
        assert_eq!(session.stats.clips_submitted, 1);
    }

    #[tokio::test]
    async fn test_stop_flag_halts_loop() {
        let dispatcher = ViolationDispatcher::spawn(DispatchConfig::default()).unwrap();
        let mut session = session(scripted(vec![]), dispatcher);
        session.stop.store(true, Ordering::Relaxed);

        let mut source = ScriptedSource {
            remaining: 100,
            next_id: 0,
        };
        let exit = session.run_with_source(&mut source);
        assert!(matches!(exit, LoopExit::Stopped));
        assert_eq!(session.stats.frames, 0);
    }

    #[tokio::test]
    async fn test_detector_failure_degrades_to_empty_frame() {
        struct FailingDetector;
        impl Detector for FailingDetector {
            fn detect(&mut self, _: &[u8], _: usize, _: usize) -> Result<Vec<Detection>> {
                anyhow::bail!("inference backend unavailable")
            }
        }

        let dispatcher = ViolationDispatcher::spawn(DispatchConfig::default()).unwrap();
        let mut s = session(Arc::new(Mutex::new(FailingDetector)), dispatcher);

        let mut source = ScriptedSource {
            remaining: 5,
            next_id: 0,
        };
        let exit = s.run_with_source(&mut source);
        assert!(matches!(exit, LoopExit::StreamEnded));
        // All frames processed despite the detector failing every time.
        assert_eq!(s.stats.frames, 5);
        assert_eq!(s.stats.violations, 0);
    }

    #[tokio::test]
    async fn test_reconnect_drops_stale_track_state() {
        // A stream that dropped deep into its frame numbering reopens at
        // frame 0, and the tracker hands out the same low ids again. Any
        // per-track state carried across the gap would pair a fresh frame
        // counter with an old entry frame.
        let dispatcher = ViolationDispatcher::spawn(DispatchConfig::default()).unwrap();
        let camera = CameraConfig {
            id: "cam-test".to_string(),
            source_url: "unused".to_string(),
            enabled_violations: vec![ViolationKind::ProlongedPresence],
            stream_addr: None,
        };
        let restricted_doc = ZoneDocument {
            coordinate_space: CoordinateSpace::Reference,
            reference_width: Some(200.0),
            reference_height: Some(200.0),
            zones: vec![ZoneSpec {
                id: 1,
                name: "no-stopping".to_string(),
                zone_type: ZoneKind::Lane,
                coordinates: vec![(0.0, 0.0), (200.0, 0.0), (200.0, 200.0), (0.0, 200.0)],
                allowed_classes: None,
                restricted: true,
                presence_threshold_secs: Some(30.0),
            }],
            lane_transitions: vec![],
            light_links: vec![],
        };
        let evidence = EvidenceConfig {
            pre_frames: 3,
            tail_frames: 2,
            jpeg_quality: 80,
            temp_dir: tempfile::tempdir().unwrap().keep().to_string_lossy().to_string(),
        };
        let parked: Vec<Vec<Detection>> = (0..6).map(|_| vec![car_at(100.0)]).collect();
        let mut session = CameraSession::new(
            camera,
            TrackerConfig::default(),
            ViolationConfig::default(),
            evidence,
            restricted_doc,
            scripted(parked),
            Box::new(NoPlates),
            dispatcher,
            None,
            Arc::new(AtomicBool::new(false)),
        );

        // First leg ends at frame 1002 with the car inside the zone.
        let mut first = ScriptedSource {
            remaining: 3,
            next_id: 1000,
        };
        assert!(matches!(session.run_with_source(&mut first), LoopExit::StreamEnded));

        session.reset_stream_state();

        // Reopened stream numbers from zero; the reused track id must meet
        // fresh state, not the 1000-frame-old occupancy record.
        let mut second = ScriptedSource {
            remaining: 3,
            next_id: 0,
        };
        assert!(matches!(session.run_with_source(&mut second), LoopExit::StreamEnded));
        assert_eq!(session.stats.frames, 6);
        assert_eq!(session.stats.violations, 0);
    }

    #[tokio::test]
    async fn test_sessions_share_one_detector() {
        let dispatcher = ViolationDispatcher::spawn(DispatchConfig::default()).unwrap();
        let inner = Arc::new(Mutex::new(ScriptedDetector {
            script: vec![],
            call: 0,
        }));
        let shared: SharedDetector = inner.clone();

        let mut a = session(shared.clone(), dispatcher.clone());
        let mut b = session(shared, dispatcher);

        let mut src_a = ScriptedSource {
            remaining: 3,
            next_id: 0,
        };
        let mut src_b = ScriptedSource {
            remaining: 2,
            next_id: 0,
        };
        let _ = a.run_with_source(&mut src_a);
        let _ = b.run_with_source(&mut src_b);

        // Both sessions drove the same instance.
        assert_eq!(inner.lock().unwrap().call, 5);
    }
}
