use std::io::Cursor;

use bytes::Bytes;
use image::codecs::gif::{GifDecoder, GifEncoder, Repeat};
use image::codecs::jpeg::JpegEncoder;
use image::codecs::png::{CompressionType, FilterType, PngEncoder};
use image::{AnimationDecoder, ColorType, DynamicImage, Frame, ImageBuffer, ImageFormat, Rgba};
use photon_rs::PhotonImage;

use crate::error::AppError;

/// A decoded raster, owned by one request for its whole lifetime: either a
/// single frame or an animated GIF sequence.
pub enum Media {
    Static(DynamicImage),
    Animated(Vec<Frame>),
}

impl Media {
    /// Decode raw bytes, sniffing the container format. A GIF with more than
    /// one frame becomes [`Media::Animated`]; everything else is static.
    pub fn decode(bytes: &[u8]) -> Result<Self, AppError> {
        if matches!(image::guess_format(bytes), Ok(ImageFormat::Gif)) {
            let decoder = GifDecoder::new(Cursor::new(bytes))?;
            let frames = decoder.into_frames().collect_frames()?;

            if frames.len() > 1 {
                return Ok(Media::Animated(frames));
            }
            if let Some(frame) = frames.into_iter().next() {
                return Ok(Media::Static(DynamicImage::ImageRgba8(frame.into_buffer())));
            }
            // zero-frame GIF: let the generic loader produce the error
        }

        image::load_from_memory(bytes)
            .map(Media::Static)
            .map_err(AppError::from)
    }

    pub fn frame_count(&self) -> usize {
        match self {
            Media::Static(_) => 1,
            Media::Animated(frames) => frames.len(),
        }
    }

    /// Dimensions of the image, or of the first frame for animations.
    pub fn dimensions(&self) -> (u32, u32) {
        match self {
            Media::Static(img) => (img.width(), img.height()),
            Media::Animated(frames) => frames
                .first()
                .map(|f| f.buffer().dimensions())
                .unwrap_or((0, 0)),
        }
    }

    /// Encode to an output buffer plus its content type.
    ///
    /// Static images encode as PNG with the quality parameter clamped to the
    /// encoder's compression band; animations encode as GIF with quality
    /// clamped to the gif encoder's 1..=30 speed scale. `jpeg` overrides both
    /// and re-encodes (the first frame of) the image as JPEG.
    pub fn encode(&self, quality: u32, jpeg: bool) -> Result<(Bytes, &'static str), AppError> {
        if jpeg {
            return self.encode_jpeg(quality);
        }

        match self {
            Media::Static(img) => {
                let mut buf = Vec::new();
                // 1 = fastest/largest, 3 = best; keeps output size bounded
                let compression = match quality.clamp(1, 3) {
                    1 => CompressionType::Fast,
                    2 => CompressionType::Default,
                    _ => CompressionType::Best,
                };
                let encoder = PngEncoder::new_with_quality(&mut buf, compression, FilterType::Sub);
                img.write_with_encoder(encoder)
                    .map_err(|e| AppError::ImageEncodeError {
                        format: "png".into(),
                        source: e,
                    })?;
                Ok((buf.into(), "image/png"))
            }
            Media::Animated(frames) => {
                let mut buf = Vec::new();
                let speed = quality.clamp(1, 30) as i32;
                {
                    let mut encoder = GifEncoder::new_with_speed(&mut buf, speed);
                    encoder
                        .set_repeat(Repeat::Infinite)
                        .map_err(|e| AppError::ImageEncodeError {
                            format: "gif".into(),
                            source: e,
                        })?;
                    encoder
                        .encode_frames(frames.iter().cloned())
                        .map_err(|e| AppError::ImageEncodeError {
                            format: "gif".into(),
                            source: e,
                        })?;
                }
                Ok((buf.into(), "image/gif"))
            }
        }
    }

    fn encode_jpeg(&self, quality: u32) -> Result<(Bytes, &'static str), AppError> {
        let img = match self {
            Media::Static(img) => img.clone(),
            // only the first frame survives a JPEG override
            Media::Animated(frames) => frames
                .first()
                .map(|f| DynamicImage::ImageRgba8(f.buffer().clone()))
                .ok_or(AppError::ImageBufferError)?,
        };

        let mut buf = Vec::new();
        let q = quality.clamp(1, 100) as u8;
        let mut encoder = JpegEncoder::new_with_quality(&mut buf, q);
        let rgb = img.to_rgb8();
        encoder
            .encode(&rgb, img.width(), img.height(), ColorType::Rgb8.into())
            .map_err(|e| AppError::ImageEncodeError {
                format: "jpeg".into(),
                source: e,
            })?;
        Ok((buf.into(), "image/jpeg"))
    }
}

/// Apply a per-frame callback. Static images get one call; animations map the
/// callback over every frame and reassemble, carrying each frame's original
/// delay and offsets through. Frame count is always preserved.
pub fn transform_frames<F>(media: Media, cb: F) -> Result<Media, AppError>
where
    F: Fn(DynamicImage) -> Result<DynamicImage, AppError>,
{
    match media {
        Media::Static(img) => cb(img).map(Media::Static),
        Media::Animated(frames) => {
            let mut out = Vec::with_capacity(frames.len());
            for frame in frames {
                let delay = frame.delay();
                let (left, top) = (frame.left(), frame.top());
                let img = cb(DynamicImage::ImageRgba8(frame.into_buffer()))?;
                out.push(Frame::from_parts(img.into_rgba8(), left, top, delay));
            }
            Ok(Media::Animated(out))
        }
    }
}

/// Hand a frame to the photon backend as raw RGBA pixels.
pub(crate) fn to_photon(img: &DynamicImage) -> PhotonImage {
    let raw_pixels = img.to_rgba8().into_raw();
    PhotonImage::new(raw_pixels, img.width(), img.height())
}

/// Rebuild a frame from the photon backend's raw pixels.
pub(crate) fn from_photon(img: PhotonImage) -> Result<DynamicImage, AppError> {
    let buffer = ImageBuffer::<Rgba<u8>, _>::from_raw(
        img.get_width(),
        img.get_height(),
        img.get_raw_pixels(),
    )
    .ok_or(AppError::ImageBufferError)?;
    Ok(DynamicImage::ImageRgba8(buffer))
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Delay, RgbaImage};

    fn png_bytes(width: u32, height: u32) -> Vec<u8> {
        let img = DynamicImage::ImageRgba8(RgbaImage::from_pixel(
            width,
            height,
            Rgba([120, 40, 200, 255]),
        ));
        let mut buf = Vec::new();
        img.write_to(&mut Cursor::new(&mut buf), ImageFormat::Png)
            .unwrap();
        buf
    }

    fn gif_bytes(frames: u32) -> Vec<u8> {
        let mut buf = Vec::new();
        {
            let mut encoder = GifEncoder::new(&mut buf);
            for i in 0..frames {
                let shade = (i * 60 % 256) as u8;
                let frame = Frame::from_parts(
                    RgbaImage::from_pixel(16, 16, Rgba([shade, 0, 0, 255])),
                    0,
                    0,
                    Delay::from_numer_denom_ms(100, 1),
                );
                encoder.encode_frames(std::iter::once(frame)).unwrap();
            }
        }
        buf
    }

    #[test]
    fn decode_png_is_static() {
        let media = Media::decode(&png_bytes(20, 10)).unwrap();
        assert!(matches!(media, Media::Static(_)));
        assert_eq!(media.dimensions(), (20, 10));
    }

    #[test]
    fn decode_multi_frame_gif_is_animated() {
        let media = Media::decode(&gif_bytes(3)).unwrap();
        assert!(matches!(media, Media::Animated(_)));
        assert_eq!(media.frame_count(), 3);
    }

    #[test]
    fn decode_garbage_fails() {
        assert!(Media::decode(b"not an image at all").is_err());
    }

    #[test]
    fn transform_preserves_frame_count_and_delay() {
        let media = Media::decode(&gif_bytes(3)).unwrap();
        let out = transform_frames(media, |img| {
            Ok(img.resize_exact(4, 4, image::imageops::FilterType::Nearest))
        })
        .unwrap();

        assert_eq!(out.frame_count(), 3);
        assert_eq!(out.dimensions(), (4, 4));
        if let Media::Animated(frames) = out {
            for frame in frames {
                assert_eq!(frame.delay(), Delay::from_numer_denom_ms(100, 1));
            }
        }
    }

    #[test]
    fn encode_static_yields_png() {
        let media = Media::decode(&png_bytes(8, 8)).unwrap();
        let (bytes, content_type) = media.encode(5, false).unwrap();
        assert_eq!(content_type, "image/png");
        assert_eq!(&bytes[..8], b"\x89PNG\r\n\x1a\n");
    }

    #[test]
    fn encode_animated_yields_gif() {
        let media = Media::decode(&gif_bytes(2)).unwrap();
        let (bytes, content_type) = media.encode(40, false).unwrap();
        assert_eq!(content_type, "image/gif");
        assert_eq!(&bytes[..3], b"GIF");
    }

    #[test]
    fn jpeg_override_takes_first_frame() {
        let media = Media::decode(&gif_bytes(2)).unwrap();
        let (bytes, content_type) = media.encode(80, true).unwrap();
        assert_eq!(content_type, "image/jpeg");
        assert_eq!(&bytes[..2], b"\xff\xd8");
    }

    #[test]
    fn photon_round_trip_preserves_dimensions() {
        let img = DynamicImage::ImageRgba8(RgbaImage::from_pixel(7, 5, Rgba([1, 2, 3, 255])));
        let photon = to_photon(&img);
        let back = from_photon(photon).unwrap();
        assert_eq!((back.width(), back.height()), (7, 5));
    }
}
