use cam_feed_common::frame::RawFrame;
use image::codecs::jpeg::JpegEncoder;
use image::ExtendedColorType;

#[derive(Debug, thiserror::Error)]
pub enum EncodeError {
    #[error("jpeg encoding failed: {0}")]
    Jpeg(#[from] image::ImageError),
}

/// JPEG-encode one raw RGB frame. A frame whose buffer does not match its
/// dimensions fails here rather than producing a corrupt part.
pub fn encode_jpeg(frame: &RawFrame, quality: u8) -> Result<Vec<u8>, EncodeError> {
    let mut jpeg = Vec::with_capacity(frame.data.len() / 8);
    let encoder = JpegEncoder::new_with_quality(&mut jpeg, quality);
    encoder.encode(
        &frame.data,
        frame.width,
        frame.height,
        ExtendedColorType::Rgb8,
    )?;
    Ok(jpeg)
}
