use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use cam_feed_common::frame::encode_part;
use futures_util::{stream, Stream};
use tracing::{debug, warn};

use crate::camera::SharedSource;
use crate::encoder;

/// Counters shared between the HTTP handlers and every streaming loop.
#[derive(Debug, Default)]
pub struct StreamStats {
    /// Streams currently being served.
    pub active_clients: AtomicUsize,
    /// Parts written across all clients since startup.
    pub frames_streamed: AtomicU64,
}

/// Outcome of one pull on the frame source.
enum StepOutcome {
    /// A framed part, ready to write to the client.
    Part(Bytes),
    /// The frame was dropped (capture or encode failure); pull again.
    Skip,
    /// The source is exhausted; close this connection.
    Finished,
}

/// One iteration of the streaming loop: grab under the device lock, encode
/// unlocked. Runs on the blocking pool since the grab blocks on device I/O.
fn pull_one(source: &SharedSource, quality: u8) -> StepOutcome {
    let grabbed = {
        let mut guard = match source.lock() {
            Ok(g) => g,
            // A panicked capture call leaves no torn state behind; recover
            // the lock instead of wedging every future client.
            Err(poisoned) => poisoned.into_inner(),
        };
        guard.next_frame()
    };

    match grabbed {
        Ok(Some(frame)) => match encoder::encode_jpeg(&frame, quality) {
            Ok(jpeg) => {
                debug!(
                    captured_at_ms = frame.captured_at_ms,
                    bytes = jpeg.len(),
                    "frame encoded"
                );
                StepOutcome::Part(encode_part(&jpeg))
            }
            Err(e) => {
                warn!(error = %e, "frame encode failed, dropping frame");
                StepOutcome::Skip
            }
        },
        Ok(None) => StepOutcome::Finished,
        Err(e) => {
            warn!(error = %e, "frame capture failed, dropping frame");
            StepOutcome::Skip
        }
    }
}

/// Registers one connected client; de-registers when the stream is dropped,
/// whether it ended cleanly or the client went away mid-part.
struct ClientGuard {
    stats: Arc<StreamStats>,
}

impl ClientGuard {
    fn register(stats: Arc<StreamStats>) -> Self {
        let active = stats.active_clients.fetch_add(1, Ordering::Relaxed) + 1;
        debug!(active, "client connected to stream");
        Self { stats }
    }
}

impl Drop for ClientGuard {
    fn drop(&mut self) {
        let active = self.stats.active_clients.fetch_sub(1, Ordering::Relaxed) - 1;
        debug!(active, "client left stream");
    }
}

/// Unbounded multipart body for one client connection.
///
/// Each pull performs one loop iteration: acquire a frame from the shared
/// source, JPEG-encode it, yield one `--frame` part. The stream completes
/// when the source reports end-of-stream; bad frames are dropped and the
/// next one is pulled instead. Backpressure is implicit: nothing is grabbed
/// until the transport asks for the next chunk.
pub fn part_stream(
    source: SharedSource,
    quality: u8,
    stats: Arc<StreamStats>,
) -> impl Stream<Item = Bytes> {
    let guard = ClientGuard::register(Arc::clone(&stats));
    stream::unfold(
        (source, stats, guard),
        move |(source, stats, guard)| async move {
            loop {
                let src = Arc::clone(&source);
                let step = match tokio::task::spawn_blocking(move || pull_one(&src, quality)).await
                {
                    Ok(step) => step,
                    Err(e) => {
                        warn!(error = %e, "frame grab task failed, closing stream");
                        return None;
                    }
                };

                match step {
                    StepOutcome::Part(part) => {
                        let seq = stats.frames_streamed.fetch_add(1, Ordering::Relaxed);
                        debug!(seq, bytes = part.len(), "streaming part");
                        return Some((part, (source, stats, guard)));
                    }
                    StepOutcome::Skip => continue,
                    StepOutcome::Finished => return None,
                }
            }
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::{CaptureError, FrameSource};
    use cam_feed_common::frame::{RawFrame, PART_HEADERS, PART_PRELUDE};
    use futures_util::StreamExt;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    enum Step {
        Frame(RawFrame),
        Bad,
    }

    /// Yields its scripted steps in order, then reports end-of-stream.
    struct ScriptedSource {
        steps: VecDeque<Step>,
    }

    impl ScriptedSource {
        fn new(steps: Vec<Step>) -> Self {
            Self {
                steps: steps.into(),
            }
        }

        fn of_frames(n: usize) -> Self {
            Self::new((0..n).map(|_| Step::Frame(rgb_frame(8, 8))).collect())
        }
    }

    impl FrameSource for ScriptedSource {
        fn next_frame(&mut self) -> Result<Option<RawFrame>, CaptureError> {
            match self.steps.pop_front() {
                Some(Step::Frame(frame)) => Ok(Some(frame)),
                Some(Step::Bad) => Err(CaptureError::Decode(
                    nokhwa::NokhwaError::GeneralError("scripted capture failure".into()),
                )),
                None => Ok(None),
            }
        }
    }

    fn rgb_frame(width: u32, height: u32) -> RawFrame {
        RawFrame::new(width, height, vec![0x40; (width * height * 3) as usize], 0)
    }

    /// Buffer too short for the claimed dimensions, so JPEG encoding fails.
    fn unencodable_frame() -> RawFrame {
        RawFrame::new(8, 8, vec![0x40; 16], 0)
    }

    fn shared(source: ScriptedSource) -> SharedSource {
        Arc::new(Mutex::new(source))
    }

    async fn collect_bytes(stream: impl Stream<Item = Bytes>) -> Vec<u8> {
        stream
            .fold(Vec::new(), |mut acc, chunk| async move {
                acc.extend_from_slice(&chunk);
                acc
            })
            .await
    }

    fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
        haystack
            .windows(needle.len())
            .position(|window| window == needle)
    }

    /// Split a collected body into JPEG payloads, asserting the framing
    /// grammar: boundary line, header block, payload, trailing CRLF.
    fn split_parts(body: &[u8]) -> Vec<Vec<u8>> {
        let mut parts = Vec::new();
        let mut rest = body;
        while !rest.is_empty() {
            assert!(
                rest.starts_with(PART_PRELUDE),
                "part must start with the boundary line"
            );
            rest = &rest[PART_PRELUDE.len()..];
            assert!(
                rest.starts_with(PART_HEADERS),
                "part must carry exactly the content-type header block"
            );
            rest = &rest[PART_HEADERS.len()..];
            let end = find_subsequence(rest, PART_PRELUDE).unwrap_or(rest.len());
            assert!(end >= 2 && &rest[end - 2..end] == b"\r\n");
            parts.push(rest[..end - 2].to_vec());
            rest = &rest[end..];
        }
        parts
    }

    #[tokio::test]
    async fn one_part_per_frame_then_stream_ends() {
        let stats = Arc::new(StreamStats::default());
        let source = shared(ScriptedSource::of_frames(3));
        let body = collect_bytes(part_stream(source, 80, Arc::clone(&stats))).await;

        let parts = split_parts(&body);
        assert_eq!(parts.len(), 3);
        for payload in &parts {
            assert_eq!(&payload[..2], &[0xFF, 0xD8]);
        }
        assert_eq!(stats.frames_streamed.load(Ordering::Relaxed), 3);
        assert_eq!(stats.active_clients.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn empty_source_yields_no_parts() {
        let stats = Arc::new(StreamStats::default());
        let body =
            collect_bytes(part_stream(shared(ScriptedSource::of_frames(0)), 80, stats)).await;
        assert!(body.is_empty());
    }

    #[tokio::test]
    async fn encode_failure_drops_only_that_frame() {
        let stats = Arc::new(StreamStats::default());
        let source = shared(ScriptedSource::new(vec![
            Step::Frame(rgb_frame(8, 8)),
            Step::Frame(unencodable_frame()),
            Step::Frame(rgb_frame(8, 8)),
        ]));
        let body = collect_bytes(part_stream(source, 80, stats)).await;

        let parts = split_parts(&body);
        assert_eq!(parts.len(), 2, "bad frame must be skipped, not framed");
        for payload in &parts {
            assert_eq!(&payload[..2], &[0xFF, 0xD8]);
        }
    }

    #[tokio::test]
    async fn capture_error_drops_only_that_frame() {
        let stats = Arc::new(StreamStats::default());
        let source = shared(ScriptedSource::new(vec![
            Step::Frame(rgb_frame(8, 8)),
            Step::Bad,
            Step::Frame(rgb_frame(8, 8)),
        ]));
        let body = collect_bytes(part_stream(source, 80, stats)).await;
        assert_eq!(split_parts(&body).len(), 2);
    }

    #[tokio::test]
    async fn concurrent_clients_share_the_source() {
        let stats = Arc::new(StreamStats::default());
        let source = shared(ScriptedSource::of_frames(16));
        let a = part_stream(Arc::clone(&source), 80, Arc::clone(&stats));
        let b = part_stream(source, 80, Arc::clone(&stats));

        let (body_a, body_b) = tokio::join!(collect_bytes(a), collect_bytes(b));
        let parts_a = split_parts(&body_a);
        let parts_b = split_parts(&body_b);

        // Frames are split between the clients, never duplicated or torn.
        assert_eq!(parts_a.len() + parts_b.len(), 16);
        for payload in parts_a.iter().chain(parts_b.iter()) {
            assert_eq!(&payload[..2], &[0xFF, 0xD8]);
        }
        assert_eq!(stats.frames_streamed.load(Ordering::Relaxed), 16);
        assert_eq!(stats.active_clients.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn dropping_one_client_leaves_the_source_usable() {
        let stats = Arc::new(StreamStats::default());
        let source = shared(ScriptedSource::of_frames(4));

        let mut first = Box::pin(part_stream(Arc::clone(&source), 80, Arc::clone(&stats)));
        assert!(first.next().await.is_some());
        assert_eq!(stats.active_clients.load(Ordering::Relaxed), 1);
        drop(first);
        assert_eq!(stats.active_clients.load(Ordering::Relaxed), 0);

        // The remaining frames are still there for a later client.
        let second = part_stream(source, 80, Arc::clone(&stats));
        let parts = split_parts(&collect_bytes(second).await);
        assert_eq!(parts.len(), 3);
    }
}
