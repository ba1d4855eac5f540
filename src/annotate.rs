// src/annotate.rs
//
// Live-stream overlays: zone outlines, track boxes with labels, and a red
// flash on tracks that just produced a violation. Drawing happens after the
// frame's violation evaluation, so the overlays always reflect what the
// state machine saw for this exact frame.

use crate::types::{Track, ViolationEvent};
use crate::zones::{ZoneIndex, ZoneKind};
use anyhow::Result;
use opencv::{
    core::{self, Mat},
    imgproc,
    prelude::*,
};
use std::collections::HashMap;

/// Frames a violating track stays highlighted after its event.
const FLASH_FRAMES: u64 = 20;

const COLOR_LANE: core::Scalar = core::Scalar::new(0.0, 200.0, 0.0, 0.0);
const COLOR_LIGHT: core::Scalar = core::Scalar::new(0.0, 215.0, 255.0, 0.0);
const COLOR_LINE: core::Scalar = core::Scalar::new(0.0, 0.0, 255.0, 0.0);
const COLOR_TRACK: core::Scalar = core::Scalar::new(230.0, 230.0, 230.0, 0.0);
const COLOR_FLASH: core::Scalar = core::Scalar::new(0.0, 0.0, 255.0, 0.0);

pub struct StreamAnnotator {
    camera_id: String,
    /// track id -> last frame id on which its box still flashes
    flashes: HashMap<u64, u64>,
}

impl StreamAnnotator {
    pub fn new(camera_id: &str) -> Self {
        Self {
            camera_id: camera_id.to_string(),
            flashes: HashMap::new(),
        }
    }

    /// Register this frame's violation events so their tracks flash.
    pub fn note_events(&mut self, events: &[ViolationEvent], frame_id: u64) {
        for event in events {
            self.flashes.insert(event.track_id, frame_id + FLASH_FRAMES);
        }
        self.flashes.retain(|_, until| *until >= frame_id);
    }

    fn is_flashing(&self, track_id: u64, frame_id: u64) -> bool {
        self.flashes
            .get(&track_id)
            .map(|until| frame_id <= *until)
            .unwrap_or(false)
    }

    /// Draw all overlays onto the frame in place.
    pub fn annotate(
        &self,
        frame: &mut Mat,
        tracks: &[&Track],
        zones: Option<&ZoneIndex>,
        frame_id: u64,
    ) -> Result<()> {
        if let Some(index) = zones {
            for zone in index.zones() {
                draw_zone_outline(frame, &zone.points, zone_color(zone.kind))?;
            }
        }

        for track in tracks {
            let flashing = self.is_flashing(track.id, frame_id);
            let (color, thickness) = if flashing {
                (COLOR_FLASH, 3)
            } else {
                (COLOR_TRACK, 1)
            };

            let x = track.bbox.x1 as i32;
            let y = track.bbox.y1 as i32;
            let w = (track.bbox.x2 - track.bbox.x1) as i32;
            let h = (track.bbox.y2 - track.bbox.y1) as i32;
            if w <= 0 || h <= 0 {
                continue;
            }
            imgproc::rectangle(
                frame,
                core::Rect::new(x, y, w, h),
                color,
                thickness,
                imgproc::LINE_8,
                0,
            )?;

            let label = format!("#{} {} {:.0}%", track.id, track.class_name, track.confidence * 100.0);
            imgproc::put_text(
                frame,
                &label,
                core::Point::new(x, (y - 6).max(12)),
                imgproc::FONT_HERSHEY_SIMPLEX,
                0.45,
                color,
                1,
                imgproc::LINE_AA,
                false,
            )?;
        }

        let banner = format!("{}  frame {}  tracks {}", self.camera_id, frame_id, tracks.len());
        imgproc::put_text(
            frame,
            &banner,
            core::Point::new(10, 24),
            imgproc::FONT_HERSHEY_SIMPLEX,
            0.6,
            COLOR_TRACK,
            1,
            imgproc::LINE_AA,
            false,
        )?;

        Ok(())
    }
}

fn zone_color(kind: ZoneKind) -> core::Scalar {
    match kind {
        ZoneKind::Lane => COLOR_LANE,
        ZoneKind::Light => COLOR_LIGHT,
        ZoneKind::Line => COLOR_LINE,
    }
}

fn draw_zone_outline(
    frame: &mut Mat,
    points: &[crate::types::Point],
    color: core::Scalar,
) -> Result<()> {
    if points.len() < 2 {
        return Ok(());
    }
    let closed = points.len() > 2;
    let n = points.len();
    let edges = if closed { n } else { n - 1 };
    for i in 0..edges {
        let a = points[i];
        let b = points[(i + 1) % n];
        imgproc::line(
            frame,
            core::Point::new(a.x as i32, a.y as i32),
            core::Point::new(b.x as i32, b.y as i32),
            color,
            2,
            imgproc::LINE_8,
            0,
        )?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ViolationKind;

    fn event(track_id: u64) -> ViolationEvent {
        ViolationEvent::new("cam-1", track_id, ViolationKind::RedLight, 0, String::new())
    }

    #[test]
    fn test_flash_covers_window_then_expires() {
        let mut annotator = StreamAnnotator::new("cam-1");
        annotator.note_events(&[event(7)], 100);

        assert!(annotator.is_flashing(7, 100));
        assert!(annotator.is_flashing(7, 100 + FLASH_FRAMES));
        assert!(!annotator.is_flashing(7, 101 + FLASH_FRAMES));
        assert!(!annotator.is_flashing(8, 100));
    }

    #[test]
    fn test_expired_flashes_are_pruned() {
        let mut annotator = StreamAnnotator::new("cam-1");
        annotator.note_events(&[event(1)], 0);
        // A later frame's (empty) event batch prunes the stale entry.
        annotator.note_events(&[], FLASH_FRAMES + 10);
        assert!(annotator.flashes.is_empty());
    }
}
