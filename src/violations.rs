// src/violations.rs
//
// Per-track violation state machine — the heart of the pipeline.
//
// Every frame, each live track's centroid is resolved against the zone
// index and its rolling state (zone occupancy, direction samples, presence
// duration, crossing history) is advanced. Each enabled predicate fires at
// most once per episode: a `fired` flag per violation kind blocks re-firing
// until the track is observed to leave the triggering condition, at which
// point the flag clears and a new episode may fire again.
//
// Lane direction convention: the first track that produces a stable
// smoothed direction inside a lane seeds that lane's reference vector for
// the whole session. Later tracks are compared by dot product; below the
// opposing threshold fires WRONG_WAY. This is a heuristic, not ground
// truth — a first vehicle travelling the wrong way mis-calibrates the lane
// for the rest of the session.

use crate::types::{Point, Track, ViolationConfig, ViolationEvent, ViolationKind};
use crate::zones::{ZoneIndex, ZoneKind, CLASS_ZONE_VIOLATION};
use std::collections::{HashMap, HashSet, VecDeque};
use tracing::{debug, info};

/// Rolling per-track state, created on first sighting, dropped on eviction.
#[derive(Debug)]
struct TrackState {
    current_zone: Option<u32>,
    /// Last distinct zone occupied. Persists across gaps between zones so a
    /// transition through unzoned pixels still reads as from -> to.
    previous_zone: Option<u32>,
    entered_zone_at: Option<u64>,
    positions: VecDeque<Point>,
    directions: VecDeque<Point>,
    fired: HashSet<ViolationKind>,
}

impl TrackState {
    fn new() -> Self {
        Self {
            current_zone: None,
            previous_zone: None,
            entered_zone_at: None,
            positions: VecDeque::new(),
            directions: VecDeque::new(),
            fired: HashSet::new(),
        }
    }

    /// Mean of the bounded direction samples, renormalized.
    fn smoothed_direction(&self) -> Option<Point> {
        if self.directions.is_empty() {
            return None;
        }
        let sum = self
            .directions
            .iter()
            .fold(Point::new(0.0, 0.0), |acc, d| {
                Point::new(acc.x + d.x, acc.y + d.y)
            });
        sum.normalized()
    }

    /// Mean per-frame displacement over the position history, in pixels.
    fn mean_speed_px(&self) -> Option<f32> {
        if self.positions.len() < 2 {
            return None;
        }
        let mut total = 0.0;
        for (a, b) in self.positions.iter().zip(self.positions.iter().skip(1)) {
            total += Point::new(b.x - a.x, b.y - a.y).length();
        }
        Some(total / (self.positions.len() - 1) as f32)
    }
}

pub struct ViolationStateMachine {
    camera_id: String,
    enabled: HashSet<ViolationKind>,
    config: ViolationConfig,
    fps: f64,
    states: HashMap<u64, TrackState>,
    /// Session-lifetime reference direction per lane zone, seeded by the
    /// first stable track observed in that lane.
    lane_directions: HashMap<u32, Point>,
    /// Rolling red/green observations per light zone (true = red).
    light_history: HashMap<u32, VecDeque<bool>>,
}

impl ViolationStateMachine {
    pub fn new(
        camera_id: &str,
        enabled: &[ViolationKind],
        config: ViolationConfig,
        fps: f64,
    ) -> Self {
        Self {
            camera_id: camera_id.to_string(),
            enabled: enabled.iter().copied().collect(),
            config,
            fps,
            states: HashMap::new(),
            lane_directions: HashMap::new(),
            light_history: HashMap::new(),
        }
    }

    /// Record one red/green observation for a light zone.
    pub fn note_light_sample(&mut self, light_zone_id: u32, is_red: bool) {
        let history = self.light_history.entry(light_zone_id).or_default();
        history.push_back(is_red);
        while history.len() > self.config.red_history_len {
            history.pop_front();
        }
    }

    /// Majority vote over the smoothing window for one light zone.
    pub fn light_is_red(&self, light_zone_id: u32) -> bool {
        majority_red(self.light_history.get(&light_zone_id), self.config.red_majority)
    }

    /// Drop state for tracks evicted by the tracker.
    pub fn forget_tracks(&mut self, ids: &[u64]) {
        for id in ids {
            self.states.remove(id);
        }
    }

    /// Advance every live track one frame and collect new violation events.
    /// Distinct kinds may fire for the same track in the same frame; the
    /// same kind never fires twice within one unresolved episode.
    pub fn observe_frame(
        &mut self,
        tracks: &[&Track],
        zones: &ZoneIndex,
        frame_id: u64,
    ) -> Vec<ViolationEvent> {
        let mut events = Vec::new();

        for track in tracks {
            let centroid = track.bbox.centroid();
            let state = self.states.entry(track.id).or_insert_with(TrackState::new);
            let prev_centroid = state.positions.back().copied();

            // Positions and direction samples (jitter below the noise floor
            // does not contribute direction).
            if let Some(prev) = prev_centroid {
                let disp = Point::new(centroid.x - prev.x, centroid.y - prev.y);
                if disp.length() >= self.config.min_displacement_px {
                    if let Some(unit) = disp.normalized() {
                        state.directions.push_back(unit);
                        while state.directions.len() > self.config.direction_history {
                            state.directions.pop_front();
                        }
                    }
                }
            }
            state.positions.push_back(centroid);
            while state.positions.len() > self.config.position_history {
                state.positions.pop_front();
            }

            // Zone occupancy.
            let new_zone = zones.zone_containing(centroid);
            let zone_changed = new_zone != state.current_zone;
            if zone_changed {
                if state.current_zone.is_some() {
                    state.previous_zone = state.current_zone;
                }
                state.current_zone = new_zone;
                state.entered_zone_at = new_zone.map(|_| frame_id);
                // Any zone exit ends a presence episode, even straight into
                // an adjacent zone; the counter restarts with the new stay.
                state.fired.remove(&ViolationKind::ProlongedPresence);
            }

            // Leaving all zones ends every episode for this track.
            if state.current_zone.is_none() {
                if !state.fired.is_empty() {
                    debug!("Track #{} left all zones; episodes reset", track.id);
                }
                state.fired.clear();
            }

            let mut fire = |state: &mut TrackState, kind: ViolationKind, description: String| {
                if !state.fired.contains(&kind) {
                    state.fired.insert(kind);
                    info!(
                        "VIOLATION {} track #{} frame {}: {}",
                        kind.as_str(),
                        track.id,
                        frame_id,
                        description
                    );
                    events.push(ViolationEvent::new(
                        &self.camera_id,
                        track.id,
                        kind,
                        frame_id,
                        description,
                    ));
                }
            };

            // ── Zone-transition legality ─────────────────────────────────
            if zone_changed {
                if let (Some(from), Some(to)) = (state.previous_zone, state.current_zone) {
                    if from == to {
                        // Re-entered the same zone after a gap; not a transition.
                    } else if zones.is_legal_transition(from, to) {
                        // Back on a legal path: a new episode may fire later.
                        state.fired.remove(&ViolationKind::WrongLane);
                    } else if self.enabled.contains(&ViolationKind::WrongLane) {
                        fire(
                            state,
                            ViolationKind::WrongLane,
                            format!("illegal transition from zone {} to zone {}", from, to),
                        );
                    }
                }
            }

            // ── Class-vs-zone legality ───────────────────────────────────
            if self.enabled.contains(&CLASS_ZONE_VIOLATION) {
                if let Some(zone) = state.current_zone.and_then(|id| zones.zone(id)) {
                    if let Some(allowed) = &zone.allowed_classes {
                        if !allowed.contains(&track.class_name) {
                            fire(
                                state,
                                CLASS_ZONE_VIOLATION,
                                format!(
                                    "class '{}' not allowed in zone '{}'",
                                    track.class_name, zone.name
                                ),
                            );
                        }
                    }
                }
            }

            // ── Wrong-way travel ─────────────────────────────────────────
            if self.enabled.contains(&ViolationKind::WrongWay) {
                let stable = state.directions.len() >= 3;
                if let (Some(zone_id), Some(dir), true) =
                    (state.current_zone, state.smoothed_direction(), stable)
                {
                    let is_lane = zones
                        .zone(zone_id)
                        .map(|z| z.kind == ZoneKind::Lane)
                        .unwrap_or(false);
                    if is_lane {
                        match self.lane_directions.get(&zone_id) {
                            None => {
                                // First stable vehicle calibrates the lane.
                                self.lane_directions.insert(zone_id, dir);
                                debug!(
                                    "Lane {} reference direction seeded by track #{}: ({:.2}, {:.2})",
                                    zone_id, track.id, dir.x, dir.y
                                );
                            }
                            Some(reference) => {
                                let dot = dir.dot(reference);
                                if dot < self.config.direction_oppose_threshold {
                                    fire(
                                        state,
                                        ViolationKind::WrongWay,
                                        format!(
                                            "travel opposes lane {} direction (dot {:.2})",
                                            zone_id, dot
                                        ),
                                    );
                                } else if dot > 0.0 {
                                    // Realigned with the lane: episode over.
                                    state.fired.remove(&ViolationKind::WrongWay);
                                }
                            }
                        }
                    }
                }
            }

            // ── Red-light line crossing ──────────────────────────────────
            if self.enabled.contains(&ViolationKind::RedLight) {
                if let Some(prev) = prev_centroid {
                    for line in zones.line_zones() {
                        if !zones.crosses_line(prev, centroid, line) {
                            continue;
                        }
                        let Some(light_id) = zones.light_for(line.id) else {
                            continue;
                        };
                        if majority_red(
                            self.light_history.get(&light_id),
                            self.config.red_majority,
                        ) {
                            fire(
                                state,
                                ViolationKind::RedLight,
                                format!("crossed '{}' while light {} was red", line.name, light_id),
                            );
                        }
                    }
                }
            }

            // ── Prolonged presence in a restricted zone ──────────────────
            if self.enabled.contains(&ViolationKind::ProlongedPresence) {
                if let (Some(zone_id), Some(entered)) = (state.current_zone, state.entered_zone_at)
                {
                    if let Some(zone) = zones.zone(zone_id) {
                        if zone.restricted {
                            let threshold_secs = zone
                                .presence_threshold_secs
                                .unwrap_or(self.config.presence_threshold_secs);
                            let threshold_frames =
                                (threshold_secs as f64 * self.fps).round().max(1.0) as u64;
                            let present = frame_id - entered + 1;
                            if present >= threshold_frames {
                                fire(
                                    state,
                                    ViolationKind::ProlongedPresence,
                                    format!(
                                        "present in restricted zone '{}' for {} frames (~{:.0}s)",
                                        zone.name,
                                        present,
                                        present as f64 / self.fps
                                    ),
                                );
                            }
                        }
                    }
                }
            }

            // ── Overspeed ────────────────────────────────────────────────
            if self.enabled.contains(&ViolationKind::Overspeed) {
                if let (Some(zone_id), Some(px_per_frame)) =
                    (state.current_zone, state.mean_speed_px())
                {
                    let in_lane = zones
                        .zone(zone_id)
                        .map(|z| z.kind == ZoneKind::Lane)
                        .unwrap_or(false);
                    if in_lane {
                        let kmh = px_per_frame as f64
                            * self.config.meters_per_pixel as f64
                            * self.fps
                            * 3.6;
                        if kmh >= self.config.speed_limit_kmh as f64 {
                            fire(
                                state,
                                ViolationKind::Overspeed,
                                format!(
                                    "estimated {:.0} km/h exceeds limit {:.0} km/h",
                                    kmh, self.config.speed_limit_kmh
                                ),
                            );
                        } else {
                            state.fired.remove(&ViolationKind::Overspeed);
                        }
                    }
                }
            }

            // ── Class-triggered kinds (no-helmet, pothole, accident) ─────
            for (class, &kind) in &self.config.class_triggers {
                if !self.enabled.contains(&kind) {
                    continue;
                }
                if &track.class_name == class {
                    fire(
                        state,
                        kind,
                        format!("detected class '{}'", class),
                    );
                } else {
                    // Class no longer matches: that episode is over.
                    state.fired.remove(&kind);
                }
            }
        }

        events
    }

    #[cfg(test)]
    fn fired_kinds(&self, track_id: u64) -> Vec<ViolationKind> {
        self.states
            .get(&track_id)
            .map(|s| s.fired.iter().copied().collect())
            .unwrap_or_default()
    }
}

/// Red wins when more than `majority` of the retained samples are red. An
/// unobserved light has no history and reads as not-red.
fn majority_red(history: Option<&VecDeque<bool>>, majority: usize) -> bool {
    history
        .map(|h| h.iter().filter(|&&r| r).count() > majority)
        .unwrap_or(false)
}
