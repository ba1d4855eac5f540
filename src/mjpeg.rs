// src/mjpeg.rs
//
// Live MJPEG output: multipart/x-mixed-replace over plain TCP, one
// broadcaster per camera. The frame loop publishes encoded JPEGs into a
// broadcast channel and never blocks on slow viewers; a lagging client
// skips ahead to the newest frame instead of stalling the stream.

use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

const BOUNDARY: &str = "frame";

#[derive(Clone)]
pub struct MjpegBroadcaster {
    tx: broadcast::Sender<Arc<Vec<u8>>>,
}

impl MjpegBroadcaster {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Publish one encoded frame. Dropped silently when nobody is watching.
    pub fn publish(&self, jpeg: Vec<u8>) {
        let _ = self.tx.send(Arc::new(jpeg));
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Arc<Vec<u8>>> {
        self.tx.subscribe()
    }

    pub fn viewer_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

/// Accept viewers on `addr` and stream frames to each until they hang up.
pub async fn serve(addr: String, broadcaster: MjpegBroadcaster) -> Result<()> {
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding MJPEG listener on {}", addr))?;
    info!("MJPEG stream listening on {}", addr);

    loop {
        let (stream, peer) = listener.accept().await?;
        debug!("Viewer connected from {}", peer);
        let rx = broadcaster.subscribe();
        tokio::spawn(async move {
            if let Err(e) = stream_to_viewer(stream, rx).await {
                debug!("Viewer {} disconnected: {}", peer, e);
            }
        });
    }
}

async fn stream_to_viewer(
    mut stream: TcpStream,
    mut rx: broadcast::Receiver<Arc<Vec<u8>>>,
) -> Result<()> {
    stream.write_all(response_header().as_bytes()).await?;

    loop {
        match rx.recv().await {
            Ok(jpeg) => {
                stream.write_all(&frame_part(&jpeg)).await?;
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                // Slow consumer: resume from the newest frame.
                warn!("Viewer lagged, skipped {} frame(s)", skipped);
            }
            Err(broadcast::error::RecvError::Closed) => return Ok(()),
        }
    }
}

fn response_header() -> String {
    format!(
        "HTTP/1.1 200 OK\r\n\
         Content-Type: multipart/x-mixed-replace; boundary={}\r\n\
         Cache-Control: no-cache\r\n\
         Connection: close\r\n\r\n",
        BOUNDARY
    )
}

/// One multipart segment: boundary, JPEG headers, body, trailing CRLF.
fn frame_part(jpeg: &[u8]) -> Vec<u8> {
    let header = format!(
        "--{}\r\nContent-Type: image/jpeg\r\nContent-Length: {}\r\n\r\n",
        BOUNDARY,
        jpeg.len()
    );
    let mut part = Vec::with_capacity(header.len() + jpeg.len() + 2);
    part.extend_from_slice(header.as_bytes());
    part.extend_from_slice(jpeg);
    part.extend_from_slice(b"\r\n");
    part
}
