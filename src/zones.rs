// src/zones.rs
//
// Static zone geometry for a camera session.
//
// Zones are authored against a reference coordinate space (percentages of
// the frame, or a fixed reference resolution) in an external configuration
// service. `ZoneIndex::build` rescales them to the actual stream dimensions
// exactly once, at first-frame time; every per-frame query afterwards works
// in frame pixels.
//
// Line-crossing convention: a crossing is reported when the signed
// cross-product of (line_end - line_start) x (point - line_start) goes from
// negative ("below" the line) to positive ("above"). Which physical
// direction that corresponds to is fixed by the order the line's two
// endpoints are authored in, not derived from geometry.

use crate::types::{Point, ViolationKind};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use tracing::info;

// ============================================================================
// AUTHORED CONFIGURATION (wire format of the zone service)
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ZoneKind {
    Lane,
    Light,
    Line,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CoordinateSpace {
    /// Coordinates are percentages of the frame, 0..100.
    Percent,
    /// Coordinates are pixels of a fixed reference resolution.
    Reference,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ZoneSpec {
    pub id: u32,
    pub name: String,
    pub zone_type: ZoneKind,
    /// Closed polygon for lane/light, 2-point (or polyline) segment for line.
    pub coordinates: Vec<(f32, f32)>,
    /// Classes allowed inside this zone; None = unrestricted.
    #[serde(default)]
    pub allowed_classes: Option<Vec<String>>,
    /// Whether prolonged presence in this zone is a violation.
    #[serde(default)]
    pub restricted: bool,
    /// Per-zone override of the global presence threshold.
    #[serde(default)]
    pub presence_threshold_secs: Option<f32>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LaneTransitionSpec {
    pub from_lane_zone_id: u32,
    pub to_lane_zone_id: u32,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LightLinkSpec {
    /// Lane or stop-line zone controlled by the light.
    pub lane_zone_id: u32,
    pub light_zone_id: u32,
}

/// The full document served per camera by the zone-configuration service.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ZoneDocument {
    pub coordinate_space: CoordinateSpace,
    #[serde(default)]
    pub reference_width: Option<f32>,
    #[serde(default)]
    pub reference_height: Option<f32>,
    pub zones: Vec<ZoneSpec>,
    #[serde(default)]
    pub lane_transitions: Vec<LaneTransitionSpec>,
    #[serde(default)]
    pub light_links: Vec<LightLinkSpec>,
}

// ============================================================================
// SCALED RUNTIME GEOMETRY
// ============================================================================

#[derive(Debug, Clone)]
pub struct Zone {
    pub id: u32,
    pub name: String,
    pub kind: ZoneKind,
    /// Frame-pixel coordinates after the one-shot rescale.
    pub points: Vec<Point>,
    pub allowed_classes: Option<HashSet<String>>,
    pub restricted: bool,
    pub presence_threshold_secs: Option<f32>,
}

impl Zone {
    /// Ray-cast containment test; only meaningful for polygon zones.
    pub fn contains(&self, p: Point) -> bool {
        if self.points.len() < 3 {
            return false;
        }
        let mut inside = false;
        let mut j = self.points.len() - 1;
        for i in 0..self.points.len() {
            let (a, b) = (self.points[i], self.points[j]);
            if (a.y > p.y) != (b.y > p.y)
                && p.x < (b.x - a.x) * (p.y - a.y) / (b.y - a.y) + a.x
            {
                inside = !inside;
            }
            j = i;
        }
        inside
    }

    /// Line endpoints for a `line` zone: first and last authored point.
    pub fn segment(&self) -> Option<(Point, Point)> {
        if self.kind != ZoneKind::Line || self.points.len() < 2 {
            return None;
        }
        Some((*self.points.first()?, *self.points.last()?))
    }
}

pub struct ZoneIndex {
    /// Configured order preserved: first matching polygon wins.
    zones: Vec<Zone>,
    legal_transitions: HashSet<(u32, u32)>,
    /// zone id (lane or line) -> controlling light zone id
    light_links: HashMap<u32, u32>,
}

impl ZoneIndex {
    /// Rescale the authored document to the actual frame dimensions.
    /// Called once per session, at first-frame time.
    pub fn build(doc: &ZoneDocument, frame_width: f32, frame_height: f32) -> Self {
        let (sx, sy) = match doc.coordinate_space {
            CoordinateSpace::Percent => (frame_width / 100.0, frame_height / 100.0),
            CoordinateSpace::Reference => {
                let rw = doc.reference_width.unwrap_or(frame_width);
                let rh = doc.reference_height.unwrap_or(frame_height);
                (frame_width / rw, frame_height / rh)
            }
        };

        let zones: Vec<Zone> = doc
            .zones
            .iter()
            .map(|spec| Zone {
                id: spec.id,
                name: spec.name.clone(),
                kind: spec.zone_type,
                points: spec
                    .coordinates
                    .iter()
                    .map(|&(x, y)| Point::new(x * sx, y * sy))
                    .collect(),
                allowed_classes: spec
                    .allowed_classes
                    .as_ref()
                    .map(|v| v.iter().cloned().collect()),
                restricted: spec.restricted,
                presence_threshold_secs: spec.presence_threshold_secs,
            })
            .collect();

        let legal_transitions = doc
            .lane_transitions
            .iter()
            .map(|t| (t.from_lane_zone_id, t.to_lane_zone_id))
            .collect();

        let light_links = doc
            .light_links
            .iter()
            .map(|l| (l.lane_zone_id, l.light_zone_id))
            .collect();

        info!(
            "Zone index built: {} zone(s) rescaled to {}x{}",
            zones.len(),
            frame_width as i32,
            frame_height as i32
        );

        Self {
            zones,
            legal_transitions,
            light_links,
        }
    }

    /// First polygon zone (lane or light) containing the point, in
    /// configured order. Ties resolve by order, not distance.
    pub fn zone_containing(&self, p: Point) -> Option<u32> {
        self.zones
            .iter()
            .find(|z| matches!(z.kind, ZoneKind::Lane | ZoneKind::Light) && z.contains(p))
            .map(|z| z.id)
    }

    pub fn zone(&self, id: u32) -> Option<&Zone> {
        self.zones.iter().find(|z| z.id == id)
    }

    pub fn zones(&self) -> &[Zone] {
        &self.zones
    }

    pub fn line_zones(&self) -> impl Iterator<Item = &Zone> {
        self.zones.iter().filter(|z| z.kind == ZoneKind::Line)
    }

    pub fn light_zones(&self) -> impl Iterator<Item = &Zone> {
        self.zones.iter().filter(|z| z.kind == ZoneKind::Light)
    }

    pub fn is_legal_transition(&self, from: u32, to: u32) -> bool {
        self.legal_transitions.contains(&(from, to))
    }

    /// The light zone controlling the given lane/line zone, if linked.
    pub fn light_for(&self, zone_id: u32) -> Option<u32> {
        self.light_links.get(&zone_id).copied()
    }

    /// Signed-cross-product crossing test: fires when the point moves from
    /// the negative side of the line to the positive side, and the movement
    /// happens within the segment's extent.
    pub fn crosses_line(&self, prev: Point, curr: Point, line: &Zone) -> bool {
        let Some((start, end)) = line.segment() else {
            return false;
        };

        let side = |p: Point| (end.x - start.x) * (p.y - start.y) - (end.y - start.y) * (p.x - start.x);

        let before = side(prev);
        let after = side(curr);
        if !(before < 0.0 && after > 0.0) {
            return false;
        }

        // Reject sign flips far beyond the segment's endpoints.
        let seg = Point::new(end.x - start.x, end.y - start.y);
        let seg_len_sq = seg.dot(&seg).max(1e-6);
        let mid = Point::new(
            (prev.x + curr.x) / 2.0 - start.x,
            (prev.y + curr.y) / 2.0 - start.y,
        );
        let t = mid.dot(&seg) / seg_len_sq;
        (0.0..=1.0).contains(&t)
    }
}

/// Kind fired when a track's class is not allowed in its current zone.
pub const CLASS_ZONE_VIOLATION: ViolationKind = ViolationKind::WrongLane;
