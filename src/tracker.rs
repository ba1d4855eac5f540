// src/tracker.rs
//
// IoU-based identity tracker.
//
// Greedy global matching: of all (track, detection) pairs whose IoU clears
// the match threshold, the highest pair is taken first, both sides are
// removed from consideration, and the process repeats. Unmatched detections
// spawn fresh tracks with monotonically increasing ids.
//
// Eviction policy (canonical): a track unmatched for more than
// `grace_frames` consecutive frames is evicted. The default of 0 drops a
// track on its first miss; raising the grace window keeps identities alive
// through brief detector dropouts at the cost of stale boxes.
//
// Intentionally simple — the correctness bar is "stable identity for a few
// seconds", not frame-perfect re-identification.

use crate::types::{Detection, Track, TrackerConfig};
use std::collections::HashMap;
use tracing::debug;

pub struct IdentityTracker {
    config: TrackerConfig,
    next_id: u64,
    tracks: HashMap<u64, Track>,
    /// Ids evicted during the most recent update, for state cleanup.
    evicted: Vec<u64>,
}

impl IdentityTracker {
    pub fn new(config: TrackerConfig) -> Self {
        Self {
            config,
            next_id: 0,
            tracks: HashMap::new(),
            evicted: Vec::new(),
        }
    }

    /// Associate one frame's detections with the live track set.
    /// Returns the full set of currently live tracks.
    pub fn update(&mut self, detections: Vec<Detection>, frame_id: u64) -> Vec<&Track> {
        self.evicted.clear();

        // All candidate pairs above the threshold, then greedy best-first.
        let mut candidates: Vec<(u64, usize, f32)> = Vec::new();
        for track in self.tracks.values() {
            for (det_idx, det) in detections.iter().enumerate() {
                let iou = track.bbox.iou(&det.bbox);
                if iou >= self.config.match_threshold {
                    candidates.push((track.id, det_idx, iou));
                }
            }
        }
        candidates.sort_by(|a, b| b.2.partial_cmp(&a.2).unwrap_or(std::cmp::Ordering::Equal));

        let mut matched_tracks: Vec<u64> = Vec::new();
        let mut matched_dets: Vec<usize> = Vec::new();
        for (track_id, det_idx, _) in candidates {
            if matched_tracks.contains(&track_id) || matched_dets.contains(&det_idx) {
                continue;
            }
            matched_tracks.push(track_id);
            matched_dets.push(det_idx);

            let det = &detections[det_idx];
            if let Some(track) = self.tracks.get_mut(&track_id) {
                track.bbox = det.bbox;
                // Class label always follows the detection, with no
                // cross-frame consistency enforcement.
                track.class_name = det.class_name.clone();
                track.confidence = det.confidence;
                track.last_seen = frame_id;
                track.missed = 0;
            }
        }

        // Unmatched detections spawn new tracks.
        for (det_idx, det) in detections.iter().enumerate() {
            if matched_dets.contains(&det_idx) {
                continue;
            }
            let id = self.next_id;
            self.next_id += 1;
            self.tracks.insert(
                id,
                Track {
                    id,
                    bbox: det.bbox,
                    class_name: det.class_name.clone(),
                    confidence: det.confidence,
                    last_seen: frame_id,
                    missed: 0,
                },
            );
            debug!("New track #{} ({})", id, det.class_name);
        }

        // Age and evict unmatched tracks per the grace-window policy.
        let grace = self.config.grace_frames;
        let evicted = &mut self.evicted;
        self.tracks.retain(|id, track| {
            if track.last_seen == frame_id {
                return true;
            }
            track.missed += 1;
            if track.missed > grace {
                debug!("Evicting track #{} after {} missed frame(s)", id, track.missed);
                evicted.push(*id);
                false
            } else {
                true
            }
        });

        let mut live: Vec<&Track> = self.tracks.values().collect();
        live.sort_by_key(|t| t.id);
        live
    }

    /// Track ids removed by the most recent `update` call.
    pub fn evicted(&self) -> &[u64] {
        &self.evicted
    }

    /// Total identities ever assigned.
    pub fn total_tracks(&self) -> u64 {
        self.next_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::BoundingBox;

    fn det(x1: f32, y1: f32, x2: f32, y2: f32) -> Detection {
        Detection {
            bbox: BoundingBox::new(x1, y1, x2, y2),
            class_name: "car".to_string(),
            confidence: 0.9,
        }
    }

    fn default_tracker() -> IdentityTracker {
        IdentityTracker::new(TrackerConfig {
            match_threshold: 0.5,
            grace_frames: 0,
        })
    }

    #[test]
    fn test_stable_identity_across_smooth_motion() {
        let mut tracker = default_tracker();

        // A box drifting down 5px per frame keeps high IoU with itself.
        for frame in 0..20u64 {
            let y = frame as f32 * 5.0;
            let live = tracker.update(vec![det(100.0, y, 200.0, y + 100.0)], frame);
            assert_eq!(live.len(), 1);
            assert_eq!(live[0].id, 0);
        }
        assert_eq!(tracker.total_tracks(), 1);
    }

    #[test]
    fn test_low_iou_spawns_new_track_and_evicts_old() {
        let mut tracker = default_tracker();

        tracker.update(vec![det(0.0, 0.0, 50.0, 50.0)], 0);
        // Detection jumps across the frame: no overlap at all.
        let live = tracker.update(vec![det(500.0, 500.0, 550.0, 550.0)], 1);

        assert_eq!(live.len(), 1);
        assert_eq!(live[0].id, 1);
        assert_eq!(tracker.evicted(), &[0]);
    }

    #[test]
    fn test_grace_window_retains_track_through_dropout() {
        let mut tracker = IdentityTracker::new(TrackerConfig {
            match_threshold: 0.5,
            grace_frames: 2,
        });

        tracker.update(vec![det(0.0, 0.0, 100.0, 100.0)], 0);

        // Two empty frames: track survives on grace.
        assert_eq!(tracker.update(vec![], 1).len(), 1);
        assert_eq!(tracker.update(vec![], 2).len(), 1);

        // Reappears and keeps its identity.
        let live = tracker.update(vec![det(0.0, 0.0, 100.0, 100.0)], 3);
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].id, 0);

        // Three consecutive misses exceed the window.
        tracker.update(vec![], 4);
        tracker.update(vec![], 5);
        let live = tracker.update(vec![], 6);
        assert!(live.is_empty());
        assert_eq!(tracker.evicted(), &[0]);
    }

    #[test]
    fn test_empty_detections_evict_immediately_without_grace() {
        let mut tracker = default_tracker();
        tracker.update(vec![det(0.0, 0.0, 100.0, 100.0)], 0);
        let live = tracker.update(vec![], 1);
        assert!(live.is_empty());
        assert_eq!(tracker.evicted(), &[0]);
    }

    #[test]
    fn test_greedy_matching_prefers_highest_iou() {
        let mut tracker = default_tracker();
        tracker.update(vec![det(0.0, 0.0, 100.0, 100.0)], 0);

        // Two detections overlap the track; the near-identical one must win
        // and the offset one must spawn a new id.
        let near = det(1.0, 1.0, 101.0, 101.0);
        let offset = det(40.0, 0.0, 140.0, 100.0);
        let live = tracker.update(vec![offset, near], 1);

        assert_eq!(live.len(), 2);
        let original = live.iter().find(|t| t.id == 0).unwrap();
        assert!((original.bbox.x1 - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_class_label_follows_detection() {
        let mut tracker = default_tracker();
        tracker.update(vec![det(0.0, 0.0, 100.0, 100.0)], 0);

        let mut truck = det(0.0, 0.0, 100.0, 100.0);
        truck.class_name = "truck".to_string();
        let live = tracker.update(vec![truck], 1);

        assert_eq!(live[0].id, 0);
        assert_eq!(live[0].class_name, "truck");
    }
}
