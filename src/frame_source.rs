// src/frame_source.rs
//
// Decodable video stream abstraction.
//
// A source yields BGR frames in order until the stream ends or drops. The
// OpenCV implementation wraps anything `VideoCapture` can open (file, RTSP,
// resolved HTTP stream). "Cannot open" is a distinguishable error because
// it is the one failure allowed to terminate a camera session; mid-stream
// read failures surface as `None` and the session reconnects instead.

use opencv::{
    core::Mat,
    prelude::*,
    videoio::{self, VideoCapture, VideoCaptureTrait, VideoCaptureTraitConst},
};
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("cannot open source '{url}'")]
    CannotOpen { url: String },
    #[error("source '{url}': {source}")]
    Backend {
        url: String,
        #[source]
        source: opencv::Error,
    },
}

/// One decoded frame with its position in the stream.
pub struct SourceFrame {
    pub frame_id: u64,
    /// BGR pixels as decoded; conversion happens at the detector boundary.
    pub mat: Mat,
}

pub trait FrameSource: Send {
    /// Next frame in order, or None when the stream ends or drops.
    fn next_frame(&mut self) -> Option<SourceFrame>;
    fn fps(&self) -> f64;
}

// ============================================================================
// OPENCV SOURCE
// ============================================================================

pub struct VideoFrameSource {
    url: String,
    cap: VideoCapture,
    fps: f64,
    next_id: u64,
}

const FALLBACK_FPS: f64 = 30.0;

impl VideoFrameSource {
    pub fn open(url: &str) -> Result<Self, SourceError> {
        info!("Opening stream: {}", url);

        let cap = VideoCapture::from_file(url, videoio::CAP_ANY).map_err(|e| {
            SourceError::Backend {
                url: url.to_string(),
                source: e,
            }
        })?;

        let opened = cap.is_opened().map_err(|e| SourceError::Backend {
            url: url.to_string(),
            source: e,
        })?;
        if !opened {
            return Err(SourceError::CannotOpen {
                url: url.to_string(),
            });
        }

        let fps = VideoCaptureTraitConst::get(&cap, videoio::CAP_PROP_FPS).unwrap_or(0.0);
        let fps = if fps.is_finite() && fps > 1.0 {
            fps
        } else {
            // Live streams often report 0; assume a sane default.
            FALLBACK_FPS
        };
        let width =
            VideoCaptureTraitConst::get(&cap, videoio::CAP_PROP_FRAME_WIDTH).unwrap_or(0.0) as usize;
        let height = VideoCaptureTraitConst::get(&cap, videoio::CAP_PROP_FRAME_HEIGHT)
            .unwrap_or(0.0) as usize;

        info!("Stream open: {}x{} @ {:.1} FPS", width, height, fps);

        Ok(Self {
            url: url.to_string(),
            cap,
            fps,
            next_id: 0,
        })
    }
}

impl FrameSource for VideoFrameSource {
    fn next_frame(&mut self) -> Option<SourceFrame> {
        let mut mat = Mat::default();
        match self.cap.read(&mut mat) {
            Ok(true) if !mat.empty() => {
                let frame_id = self.next_id;
                self.next_id += 1;
                Some(SourceFrame { frame_id, mat })
            }
            Ok(_) => None,
            Err(e) => {
                warn!("Read error on '{}': {}", self.url, e);
                None
            }
        }
    }

    fn fps(&self) -> f64 {
        self.fps
    }
}
