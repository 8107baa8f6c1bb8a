use std::borrow::Cow;
use std::fs;
use std::io::Cursor;
use std::path::{Path, PathBuf};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use calldk_contracts::content::ImageFormat;
use calldk_contracts::envelope::{EncodedImage, MAX_IMAGE_BYTES};
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{ColorType, DynamicImage, ImageReader, Rgb, RgbImage, RgbaImage};
use thiserror::Error;

pub const THUMBNAIL_MAX_WIDTH: u32 = 100;
pub const THUMBNAIL_MAX_HEIGHT: u32 = 70;

const JPEG_MAX_QUALITY: u8 = 100;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("image file {filename} exceeds the {limit} byte limit ({size} bytes)")]
    FileTooLarge {
        filename: String,
        size: u64,
        limit: u64,
    },

    #[error("failed reading {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("error processing image {filename}: {reason}")]
    ImageProcessing { filename: String, reason: String },

    #[error("image {filename} has an invalid base64 payload: {reason}")]
    InvalidPayload { filename: String, reason: String },
}

impl CodecError {
    pub fn filename(&self) -> Option<&str> {
        match self {
            Self::FileTooLarge { filename, .. }
            | Self::ImageProcessing { filename, .. }
            | Self::InvalidPayload { filename, .. } => Some(filename.as_str()),
            Self::Io { .. } => None,
        }
    }
}

/// Turns image files into transport records and back.
///
/// Pixel dimensions are never changed. The output format follows the file
/// extension (`jpeg` when there is none) and anything outside the transport
/// set is re-encoded as PNG.
#[derive(Debug, Clone, Copy)]
pub struct ImageCodec {
    max_bytes: u64,
}

impl Default for ImageCodec {
    fn default() -> Self {
        Self {
            max_bytes: MAX_IMAGE_BYTES,
        }
    }
}

impl ImageCodec {
    pub fn with_max_bytes(max_bytes: u64) -> Self {
        Self { max_bytes }
    }

    pub fn max_bytes(&self) -> u64 {
        self.max_bytes
    }

    pub fn encode(&self, path: &Path) -> Result<EncodedImage, CodecError> {
        let filename = basename(path);
        let metadata = fs::metadata(path).map_err(|source| CodecError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        if metadata.len() > self.max_bytes {
            return Err(CodecError::FileTooLarge {
                filename,
                size: metadata.len(),
                limit: self.max_bytes,
            });
        }

        let format = output_format_for(path);
        let source = ImageReader::open(path)
            .and_then(|reader| reader.with_guessed_format())
            .map_err(|source| CodecError::Io {
                path: path.to_path_buf(),
                source,
            })?
            .decode()
            .map_err(|err| CodecError::ImageProcessing {
                filename: filename.clone(),
                reason: err.to_string(),
            })?;
        let bytes = encode_as(&source, format).map_err(|err| CodecError::ImageProcessing {
            filename: filename.clone(),
            reason: err.to_string(),
        })?;

        tracing::debug!(
            filename = %filename,
            format = %format,
            width = source.width(),
            height = source.height(),
            encoded_bytes = bytes.len(),
            "encoded image attachment"
        );
        Ok(EncodedImage {
            filename,
            data: BASE64.encode(bytes),
            mime_type: format.mime_type().to_string(),
        })
    }

    /// Encodes every path independently; one bad file never stops the rest.
    pub fn encode_all<P: AsRef<Path>>(&self, paths: &[P]) -> Vec<Result<EncodedImage, CodecError>> {
        paths.iter().map(|path| self.encode(path.as_ref())).collect()
    }
}

/// Raw image bytes carried by an encoded record.
pub fn decode(image: &EncodedImage) -> Result<Vec<u8>, CodecError> {
    BASE64
        .decode(image.data.trim().as_bytes())
        .map_err(|err| CodecError::InvalidPayload {
            filename: image.filename.clone(),
            reason: err.to_string(),
        })
}

/// Preview-sized copy that fits within 100x70, aspect ratio kept. Images that
/// already fit are returned at their own size.
pub fn thumbnail(image: &EncodedImage) -> Result<DynamicImage, CodecError> {
    let bytes = decode(image)?;
    let decoded =
        image::load_from_memory(&bytes).map_err(|err| CodecError::ImageProcessing {
            filename: image.filename.clone(),
            reason: err.to_string(),
        })?;
    if decoded.width() <= THUMBNAIL_MAX_WIDTH && decoded.height() <= THUMBNAIL_MAX_HEIGHT {
        return Ok(decoded);
    }
    Ok(decoded.resize(
        THUMBNAIL_MAX_WIDTH,
        THUMBNAIL_MAX_HEIGHT,
        FilterType::Lanczos3,
    ))
}

/// Output formats whose encoder works in this build.
pub fn probe_output_formats() -> Vec<ImageFormat> {
    let sample = DynamicImage::ImageRgba8(RgbaImage::from_pixel(
        1,
        1,
        image::Rgba([12, 34, 56, 128]),
    ));
    [
        ImageFormat::Jpeg,
        ImageFormat::Png,
        ImageFormat::Gif,
        ImageFormat::Bmp,
        ImageFormat::Webp,
    ]
    .into_iter()
    .filter(|format| encode_as(&sample, *format).is_ok())
    .collect()
}

fn basename(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_else(|| path.display().to_string())
}

fn output_format_for(path: &Path) -> ImageFormat {
    let ext = path
        .extension()
        .and_then(|value| value.to_str())
        .map(|value| value.trim().to_ascii_lowercase())
        .unwrap_or_default();
    if ext.is_empty() {
        return ImageFormat::Jpeg;
    }
    ImageFormat::normalize(&ext)
}

fn encode_as(source: &DynamicImage, format: ImageFormat) -> image::ImageResult<Vec<u8>> {
    if format == ImageFormat::Jpeg {
        let flattened = flatten_onto_white(source);
        let mut bytes = Vec::new();
        let mut encoder = JpegEncoder::new_with_quality(&mut bytes, JPEG_MAX_QUALITY);
        encoder.encode_image(&flattened)?;
        return Ok(bytes);
    }

    let prepared = lossless_input(source, format);
    let mut buffer = Cursor::new(Vec::new());
    prepared.write_to(&mut buffer, raster_format(format))?;
    Ok(buffer.into_inner())
}

fn raster_format(format: ImageFormat) -> image::ImageFormat {
    match format {
        ImageFormat::Jpeg => image::ImageFormat::Jpeg,
        ImageFormat::Png => image::ImageFormat::Png,
        ImageFormat::Gif => image::ImageFormat::Gif,
        ImageFormat::Bmp => image::ImageFormat::Bmp,
        ImageFormat::Webp => image::ImageFormat::WebP,
    }
}

// JPEG has no alpha: composite over opaque white.
fn flatten_onto_white(source: &DynamicImage) -> RgbImage {
    if !source.color().has_alpha() {
        return source.to_rgb8();
    }
    let rgba = source.to_rgba8();
    let mut flattened = RgbImage::new(rgba.width(), rgba.height());
    for (x, y, pixel) in rgba.enumerate_pixels() {
        let alpha = u16::from(pixel[3]);
        let blend =
            |channel: u8| -> u8 { (((u16::from(channel) * alpha) + (255 * (255 - alpha))) / 255) as u8 };
        flattened.put_pixel(x, y, Rgb([blend(pixel[0]), blend(pixel[1]), blend(pixel[2])]));
    }
    flattened
}

// Keeps the source pixel layout unless the target encoder cannot take it.
fn lossless_input(source: &DynamicImage, format: ImageFormat) -> Cow<'_, DynamicImage> {
    let color = source.color();
    let accepted = match format {
        ImageFormat::Png => !matches!(color, ColorType::Rgb32F | ColorType::Rgba32F),
        ImageFormat::Bmp | ImageFormat::Webp => matches!(
            color,
            ColorType::L8 | ColorType::La8 | ColorType::Rgb8 | ColorType::Rgba8
        ),
        ImageFormat::Gif => matches!(color, ColorType::Rgb8 | ColorType::Rgba8),
        ImageFormat::Jpeg => true,
    };
    if accepted {
        return Cow::Borrowed(source);
    }
    let converted = match (format, color.has_alpha()) {
        (ImageFormat::Png, true) => DynamicImage::ImageRgba16(source.to_rgba16()),
        (ImageFormat::Png, false) => DynamicImage::ImageRgb16(source.to_rgb16()),
        (_, true) => DynamicImage::ImageRgba8(source.to_rgba8()),
        (_, false) => DynamicImage::ImageRgb8(source.to_rgb8()),
    };
    Cow::Owned(converted)
}
