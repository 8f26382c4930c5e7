use crate::error::CodecError;
use base64::{Engine, engine::general_purpose::STANDARD};
use image::{DynamicImage, ImageFormat, ImageReader};
use std::{io::Cursor, path::Path};

/// Picks the format an image is re-encoded to before upload, based on the
/// file extension. Unrecognized extensions fall back to JPEG.
pub fn target_format(path: &Path) -> ImageFormat {
    let extension = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_ascii_lowercase());

    match extension.as_deref() {
        Some("jpg" | "jpeg") => ImageFormat::Jpeg,
        Some("png") => ImageFormat::Png,
        Some("gif") => ImageFormat::Gif,
        Some("bmp") => ImageFormat::Bmp,
        Some("tif" | "tiff") => ImageFormat::Tiff,
        _ => ImageFormat::Jpeg,
    }
}

/// Loads the image at `path`, re-encodes it in its target format and
/// returns the encoded bytes as standard base64.
pub fn encode_image_base64(path: &Path) -> Result<String, CodecError> {
    let bytes = encode_image(path)?;
    Ok(STANDARD.encode(bytes))
}

/// Loads and re-encodes the image at `path` into an in-memory buffer.
pub fn encode_image(path: &Path) -> Result<Vec<u8>, CodecError> {
    let image = ImageReader::open(path)
        .and_then(|reader| reader.with_guessed_format())
        .map_err(|source| CodecError::Open {
            path: path.to_path_buf(),
            source,
        })?
        .decode()
        .map_err(|source| CodecError::Decode {
            path: path.to_path_buf(),
            source,
        })?;

    let format = target_format(path);
    let image = fit_color_type(image, format);

    let mut buffer = Cursor::new(Vec::new());
    image
        .write_to(&mut buffer, format)
        .map_err(|source| CodecError::Encode {
            path: path.to_path_buf(),
            source,
        })?;

    log::trace!(
        "Encoded {} as {:?} ({} bytes)",
        path.display(),
        format,
        buffer.get_ref().len()
    );

    Ok(buffer.into_inner())
}

// Encoders only accept a subset of color types.
fn fit_color_type(image: DynamicImage, format: ImageFormat) -> DynamicImage {
    match format {
        ImageFormat::Png => image,
        ImageFormat::Jpeg => DynamicImage::ImageRgb8(image.to_rgb8()),
        ImageFormat::Gif => DynamicImage::ImageRgba8(image.to_rgba8()),
        ImageFormat::Tiff => match image {
            DynamicImage::ImageLuma8(_)
            | DynamicImage::ImageLuma16(_)
            | DynamicImage::ImageRgb8(_)
            | DynamicImage::ImageRgb16(_)
            | DynamicImage::ImageRgba8(_)
            | DynamicImage::ImageRgba16(_) => image,
            DynamicImage::ImageLumaA8(_) => DynamicImage::ImageRgba8(image.to_rgba8()),
            _ if image.color().has_alpha() => DynamicImage::ImageRgba16(image.to_rgba16()),
            _ => DynamicImage::ImageRgb16(image.to_rgb16()),
        },
        _ if image.color().has_alpha() => DynamicImage::ImageRgba8(image.to_rgba8()),
        _ => DynamicImage::ImageRgb8(image.to_rgb8()),
    }
}
