use std::sync::{Arc, Mutex};

use cam_feed_common::frame::RawFrame;
use chrono::Utc;
use nokhwa::pixel_format::RgbFormat;
use nokhwa::utils::{CameraIndex, RequestedFormat, RequestedFormatType};
use nokhwa::{Camera, NokhwaError};
use tracing::{info, warn};

/// The camera handle is the one process-wide shared mutable resource; every
/// per-client streaming loop pulls from it through this lock.
pub type SharedSource = Arc<Mutex<dyn FrameSource>>;

/// Anything that can produce raw frames on demand.
///
/// `Ok(None)` means the source is exhausted and the caller must stop pulling
/// and close its stream. `Err` marks a single bad frame; the caller drops it
/// and polls again. Implementations must be safe to call in a tight loop.
pub trait FrameSource: Send {
    fn next_frame(&mut self) -> Result<Option<RawFrame>, CaptureError>;
}

#[derive(Debug, thiserror::Error)]
pub enum CameraError {
    #[error("failed to open camera device {index}: {source}")]
    Open { index: u32, source: NokhwaError },
}

#[derive(Debug, thiserror::Error)]
pub enum CaptureError {
    #[error("failed to decode captured frame: {0}")]
    Decode(NokhwaError),
}

/// Webcam-backed frame source. The device is opened once at startup and held
/// for the process lifetime; an open failure is fatal since there is no
/// functional fallback.
pub struct WebcamSource {
    camera: Camera,
}

impl WebcamSource {
    pub fn open(index: u32) -> Result<Self, CameraError> {
        let requested =
            RequestedFormat::new::<RgbFormat>(RequestedFormatType::AbsoluteHighestFrameRate);
        let mut camera = Camera::new(CameraIndex::Index(index), requested)
            .map_err(|source| CameraError::Open { index, source })?;
        camera
            .open_stream()
            .map_err(|source| CameraError::Open { index, source })?;
        info!(index, format = %camera.camera_format(), "camera device opened");
        Ok(Self { camera })
    }
}

impl FrameSource for WebcamSource {
    fn next_frame(&mut self) -> Result<Option<RawFrame>, CaptureError> {
        let buffer = match self.camera.frame() {
            Ok(b) => b,
            Err(e) => {
                // Device disconnect and end-of-device are not distinguished;
                // either way this source is done.
                warn!(error = %e, "camera read failed, ending stream");
                return Ok(None);
            }
        };
        let image = buffer
            .decode_image::<RgbFormat>()
            .map_err(CaptureError::Decode)?;
        let (width, height) = (image.width(), image.height());
        Ok(Some(RawFrame::new(
            width,
            height,
            image.into_raw(),
            Utc::now().timestamp_millis(),
        )))
    }
}
