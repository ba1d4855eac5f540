// src/evidence.rs
//
// Evidence capture around violation events.
//
// Recent frames are kept JPEG-encoded in a fixed-size ring buffer so that
// when an event fires we can look back without re-encoding. A clip is
// assembled from the frames already in the ring (the event frame plus the
// window before it), then fed with subsequent frames until its tail is
// complete, at which point it is finalized and handed to dispatch.
//
// Temp files written for upload are owned by a `TempArtifacts` guard that
// deletes them on drop, so cleanup happens on every exit path: successful
// upload, failed upload, and queue rejection alike.

use crate::types::{EvidenceConfig, ViolationEvent};
use anyhow::{Context, Result};
use opencv::{
    core::{Mat, Vector},
    imgcodecs,
    prelude::*,
    videoio::{VideoWriter, VideoWriterTrait, VideoWriterTraitConst},
};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

// ============================================================================
// FRAME RING + PENDING CLIPS
// ============================================================================

struct FrameEntry {
    frame_id: u64,
    jpeg_bytes: Vec<u8>,
}

struct PendingClip {
    event: ViolationEvent,
    snapshot_jpeg: Vec<u8>,
    frames: Vec<Vec<u8>>,
    remaining_tail: usize,
}

/// A finalized clip: the event frame's snapshot plus the surrounding window,
/// ready to be written to disk and uploaded.
pub struct EvidenceClip {
    pub event: ViolationEvent,
    pub snapshot_jpeg: Vec<u8>,
    pub frames: Vec<Vec<u8>>,
}

pub struct EvidenceRecorder {
    config: EvidenceConfig,
    fps: f64,
    entries: Vec<Option<FrameEntry>>,
    capacity: usize,
    /// Index where the next frame will be written.
    write_idx: usize,
    pending: Vec<PendingClip>,
}

impl EvidenceRecorder {
    pub fn new(config: EvidenceConfig, fps: f64) -> Self {
        // Event frame plus the window before it.
        let capacity = config.pre_frames + 1;
        let mut entries = Vec::with_capacity(capacity);
        entries.resize_with(capacity, || None);
        Self {
            config,
            fps,
            entries,
            capacity,
            write_idx: 0,
            pending: Vec::new(),
        }
    }

    /// Record one encoded frame and advance every pending clip. Returns any
    /// clips whose tail completed on this frame.
    pub fn push_encoded(&mut self, frame_id: u64, jpeg_bytes: Vec<u8>) -> Vec<EvidenceClip> {
        for clip in &mut self.pending {
            clip.frames.push(jpeg_bytes.clone());
            clip.remaining_tail -= 1;
        }

        let mut finished = Vec::new();
        let mut i = 0;
        while i < self.pending.len() {
            if self.pending[i].remaining_tail == 0 {
                let clip = self.pending.remove(i);
                debug!(
                    "Evidence clip for event {} finalized with {} frame(s)",
                    clip.event.id,
                    clip.frames.len()
                );
                finished.push(EvidenceClip {
                    event: clip.event,
                    snapshot_jpeg: clip.snapshot_jpeg,
                    frames: clip.frames,
                });
            } else {
                i += 1;
            }
        }

        self.entries[self.write_idx] = Some(FrameEntry {
            frame_id,
            jpeg_bytes,
        });
        self.write_idx = (self.write_idx + 1) % self.capacity;

        finished
    }

    /// Open a clip for the given event. The ring's newest entry is the event
    /// frame itself (frames are recorded before violations are evaluated);
    /// the clip starts from everything currently retained and completes
    /// after `tail_frames` further frames.
    pub fn begin_clip(&mut self, event: ViolationEvent) {
        let mut window: Vec<&FrameEntry> =
            self.entries.iter().filter_map(|e| e.as_ref()).collect();
        window.sort_by_key(|e| e.frame_id);

        let frames: Vec<Vec<u8>> = window.iter().map(|e| e.jpeg_bytes.clone()).collect();
        let snapshot_jpeg = window.last().map(|e| e.jpeg_bytes.clone()).unwrap_or_default();

        self.pending.push(PendingClip {
            event,
            snapshot_jpeg,
            frames,
            remaining_tail: self.config.tail_frames.max(1),
        });
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Write the clip's snapshot JPEG and MP4 video under the temp dir.
    /// The returned guard removes both files when dropped.
    pub fn materialize(&self, clip: &EvidenceClip) -> Result<(PathBuf, PathBuf, TempArtifacts)> {
        std::fs::create_dir_all(&self.config.temp_dir)
            .with_context(|| format!("creating evidence temp dir {}", self.config.temp_dir))?;

        let mut guard = TempArtifacts::new();

        let image_path = Path::new(&self.config.temp_dir).join(format!("{}.jpg", clip.event.id));
        std::fs::write(&image_path, &clip.snapshot_jpeg)
            .with_context(|| format!("writing snapshot {}", image_path.display()))?;
        guard.track(image_path.clone());

        let video_path = Path::new(&self.config.temp_dir).join(format!("{}.mp4", clip.event.id));
        write_clip_video(&clip.frames, &video_path, self.fps)?;
        guard.track(video_path.clone());

        Ok((image_path, video_path, guard))
    }

    /// Snapshot-only fallback for when the clip cannot be encoded.
    pub fn materialize_snapshot(&self, clip: &EvidenceClip) -> Result<(PathBuf, TempArtifacts)> {
        std::fs::create_dir_all(&self.config.temp_dir)
            .with_context(|| format!("creating evidence temp dir {}", self.config.temp_dir))?;

        let mut guard = TempArtifacts::new();
        let image_path = Path::new(&self.config.temp_dir).join(format!("{}.jpg", clip.event.id));
        std::fs::write(&image_path, &clip.snapshot_jpeg)
            .with_context(|| format!("writing snapshot {}", image_path.display()))?;
        guard.track(image_path.clone());
        Ok((image_path, guard))
    }
}

// ============================================================================
// ENCODING
// ============================================================================

pub fn encode_jpeg(frame: &Mat, quality: i32) -> Result<Vec<u8>> {
    let mut buf = Vector::<u8>::new();
    let mut params = Vector::<i32>::new();
    params.push(imgcodecs::IMWRITE_JPEG_QUALITY);
    params.push(quality);
    imgcodecs::imencode(".jpg", frame, &mut buf, &params).context("JPEG encoding failed")?;
    Ok(buf.to_vec())
}

fn write_clip_video(frames: &[Vec<u8>], path: &Path, fps: f64) -> Result<()> {
    let first = frames.first().context("clip has no frames")?;
    let first_mat = imgcodecs::imdecode(&Vector::<u8>::from_slice(first), imgcodecs::IMREAD_COLOR)?;
    let size = first_mat.size()?;

    let fourcc = VideoWriter::fourcc('m', 'p', '4', 'v')?;
    let mut writer = VideoWriter::new(
        path.to_str().context("non-UTF8 clip path")?,
        fourcc,
        fps,
        size,
        true,
    )?;
    if !writer.is_opened()? {
        anyhow::bail!("failed to open video writer for {}", path.display());
    }

    for jpeg in frames {
        let mat = imgcodecs::imdecode(&Vector::<u8>::from_slice(jpeg), imgcodecs::IMREAD_COLOR)?;
        if !mat.empty() {
            writer.write(&mat)?;
        }
    }
    writer.release()?;
    Ok(())
}

// ============================================================================
// TEMP FILE LIFETIME
// ============================================================================

/// Deletes the tracked files on drop. Owned by the dispatch job so evidence
/// files disappear regardless of how the job ends.
pub struct TempArtifacts {
    paths: Vec<PathBuf>,
}

impl TempArtifacts {
    pub fn new() -> Self {
        Self { paths: Vec::new() }
    }

    pub fn track(&mut self, path: PathBuf) {
        self.paths.push(path);
    }
}

impl Default for TempArtifacts {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for TempArtifacts {
    fn drop(&mut self) {
        for path in &self.paths {
            match std::fs::remove_file(path) {
                Ok(()) => debug!("Removed temp artifact {}", path.display()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!("Failed to remove temp artifact {}: {}", path.display(), e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ViolationKind;

    fn config(pre: usize, tail: usize) -> EvidenceConfig {
        EvidenceConfig {
            pre_frames: pre,
            tail_frames: tail,
            jpeg_quality: 80,
            temp_dir: std::env::temp_dir().to_string_lossy().to_string(),
        }
    }

    fn event() -> ViolationEvent {
        ViolationEvent::new("cam-1", 0, ViolationKind::RedLight, 10, "test".to_string())
    }

    fn bytes(n: u8) -> Vec<u8> {
        vec![n; 4]
    }

    #[test]
    fn test_ring_retains_only_window() {
        let mut rec = EvidenceRecorder::new(config(3, 2), 30.0);

        // 10 frames into a ring of capacity 4 (3 pre + event frame).
        for id in 0..10u64 {
            rec.push_encoded(id, bytes(id as u8));
        }
        rec.begin_clip(event());

        // Clip opens with frames 6..=9; two tail frames complete it.
        rec.push_encoded(10, bytes(10));
        let done = rec.push_encoded(11, bytes(11));
        assert_eq!(done.len(), 1);

        let clip = &done[0];
        assert_eq!(clip.frames.len(), 6);
        assert_eq!(clip.frames[0], bytes(6));
        assert_eq!(clip.frames[3], bytes(9));
        assert_eq!(clip.frames[5], bytes(11));
        // Snapshot is the event frame, the newest entry at begin time.
        assert_eq!(clip.snapshot_jpeg, bytes(9));
    }

    #[test]
    fn test_clip_waits_for_full_tail() {
        let mut rec = EvidenceRecorder::new(config(2, 3), 30.0);
        rec.push_encoded(0, bytes(0));
        rec.begin_clip(event());

        assert!(rec.push_encoded(1, bytes(1)).is_empty());
        assert!(rec.push_encoded(2, bytes(2)).is_empty());
        let done = rec.push_encoded(3, bytes(3));
        assert_eq!(done.len(), 1);
        assert_eq!(rec.pending_count(), 0);
    }

    #[test]
    fn test_overlapping_clips_finalize_independently() {
        let mut rec = EvidenceRecorder::new(config(2, 2), 30.0);
        rec.push_encoded(0, bytes(0));
        rec.begin_clip(event());
        rec.push_encoded(1, bytes(1));
        rec.begin_clip(event());
        assert_eq!(rec.pending_count(), 2);

        // First clip's tail completes one frame before the second's.
        let done = rec.push_encoded(2, bytes(2));
        assert_eq!(done.len(), 1);
        let done = rec.push_encoded(3, bytes(3));
        assert_eq!(done.len(), 1);
        assert_eq!(rec.pending_count(), 0);
    }

    #[test]
    fn test_clip_on_first_frame_has_single_pre_frame() {
        let mut rec = EvidenceRecorder::new(config(5, 1), 30.0);
        rec.push_encoded(0, bytes(0));
        rec.begin_clip(event());
        let done = rec.push_encoded(1, bytes(1));
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].frames.len(), 2);
        assert_eq!(done[0].snapshot_jpeg, bytes(0));
    }

    #[test]
    fn test_temp_artifacts_removed_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.jpg");
        let b = dir.path().join("b.mp4");
        std::fs::write(&a, b"x").unwrap();
        std::fs::write(&b, b"y").unwrap();

        {
            let mut guard = TempArtifacts::new();
            guard.track(a.clone());
            guard.track(b.clone());
            assert!(a.exists());
        }

        assert!(!a.exists());
        assert!(!b.exists());
    }

    #[test]
    fn test_temp_artifacts_tolerate_missing_files() {
        let dir = tempfile::tempdir().unwrap();
        let mut guard = TempArtifacts::new();
        guard.track(dir.path().join("never-created.jpg"));
        drop(guard);
    }
}
