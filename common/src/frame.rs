use bytes::{Bytes, BytesMut};

/// Boundary token announced in the stream's `Content-Type` header.
pub const BOUNDARY: &str = "frame";

/// Content type of the multipart stream endpoint. Browsers replace the
/// displayed image on every part, which is what makes MJPEG-over-HTTP work.
pub const STREAM_CONTENT_TYPE: &str = "multipart/x-mixed-replace; boundary=frame";

/// One part on the wire:
///
///   --frame\r\n
///   Content-Type: image/jpeg\r\n
///   \r\n
///   <raw JPEG bytes>\r\n
///
/// The layout must stay byte-exact; MJPEG clients key on these delimiters.
pub const PART_PRELUDE: &[u8] = b"--frame\r\n";
pub const PART_HEADERS: &[u8] = b"Content-Type: image/jpeg\r\n\r\n";
const PART_TRAILER: &[u8] = b"\r\n";

/// A raw image grabbed from the capture device: tightly-packed RGB8 pixels,
/// row-major. Owned by the frame source until handed to the encoder; only the
/// encoded bytes outlive the streaming-loop iteration that produced it.
#[derive(Debug, Clone)]
pub struct RawFrame {
    pub width: u32,
    pub height: u32,
    pub data: Vec<u8>,
    /// Capture time in Unix millis. Diagnostic only, never sent on the wire.
    pub captured_at_ms: i64,
}

impl RawFrame {
    pub fn new(width: u32, height: u32, data: Vec<u8>, captured_at_ms: i64) -> Self {
        Self {
            width,
            height,
            data,
            captured_at_ms,
        }
    }

    /// Buffer length a well-formed frame of these dimensions must have.
    pub fn expected_len(&self) -> usize {
        self.width as usize * self.height as usize * 3
    }

    pub fn is_well_formed(&self) -> bool {
        self.data.len() == self.expected_len()
    }
}

/// Frame one encoded JPEG as a multipart part. Built fresh per frame and
/// dropped once written to the connection.
pub fn encode_part(jpeg: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(
        PART_PRELUDE.len() + PART_HEADERS.len() + jpeg.len() + PART_TRAILER.len(),
    );
    buf.extend_from_slice(PART_PRELUDE);
    buf.extend_from_slice(PART_HEADERS);
    buf.extend_from_slice(jpeg);
    buf.extend_from_slice(PART_TRAILER);
    buf.freeze()
}
