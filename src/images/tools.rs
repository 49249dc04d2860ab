use image::codecs::jpeg::JpegEncoder;
use image::{DynamicImage, Rgb, RgbImage};
use lazy_static::lazy_static;
use regex::Regex;
use thiserror::Error;

lazy_static! {
    // An absolute http(s) URL token. Tokens stop at whitespace, quotes and
    // angle brackets so that JSON/HTML wrappers with several links stay apart.
    static ref URL_TOKEN: Regex = Regex::new(r#"(?i)https?://[^\s"'<>]+"#).unwrap();
    // The longest prefix of a token whose last path piece carries a supported
    // extension. Hostname labels such as `i.jpg.dog` do not end the match.
    static ref IMAGE_URL: Regex =
        Regex::new(r"(?i)^(https?://.+\.(?:jpe?g|png))(?:$|[^\w./-])").unwrap();
    static ref IMAGE_EXTENSION: Regex = Regex::new(r"(?i).+\.(jpg|jpeg|png)$").unwrap();
}

#[derive(Error, Debug)]
pub enum TranscodeError {
    #[error("Failed to decode image: {0}")]
    Decode(#[from] image::ImageError),
}

/// Maps an image MIME type to the file extension it is stored under.
/// Parameters such as `; charset=...` are ignored.
pub fn extension_for_mime(content_type: &str) -> Option<&'static str> {
    let mime = content_type.split(';').next().unwrap_or(content_type).trim();
    if mime.eq_ignore_ascii_case("image/jpeg") {
        Some("jpg")
    } else if mime.eq_ignore_ascii_case("image/png") {
        Some("png")
    } else {
        None
    }
}

/// Lower-cased supported extension of a file name or URL path, if any.
pub fn image_extension(name: &str) -> Option<String> {
    IMAGE_EXTENSION
        .captures(name)
        .and_then(|caps| caps.get(1))
        .map(|ext| ext.as_str().to_ascii_lowercase())
}

// Function to detect image type from the image data. Cache entries are all
// named `.jpg` but may hold PNG bytes, so the extension is not trusted.
pub fn detect_image_type(data: &[u8]) -> &'static str {
    if data.starts_with(&[0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A]) {
        "image/png"
    } else {
        "image/jpeg"
    }
}

/// Pulls the first image URL out of a text response (JSON, HTML, ...).
/// JSON-escaped slashes are unescaped first.
pub fn extract_image_url(body: &str) -> Option<String> {
    let body = body.replace(r"\/", "/");
    URL_TOKEN.find_iter(&body).find_map(|token| {
        IMAGE_URL
            .captures(token.as_str())
            .and_then(|caps| caps.get(1))
            .map(|url| url.as_str().to_string())
    })
}

// Composite onto white so transparent PNGs do not turn black as JPEG.
fn flatten_on_white(img: &DynamicImage) -> RgbImage {
    let rgba = img.to_rgba8();
    let mut flattened = RgbImage::new(rgba.width(), rgba.height());

    for (x, y, pixel) in rgba.enumerate_pixels() {
        let [r, g, b, a] = pixel.0;
        let alpha = a as u32;
        let blend = |channel: u8| ((channel as u32 * alpha + 255 * (255 - alpha)) / 255) as u8;
        flattened.put_pixel(x, y, Rgb([blend(r), blend(g), blend(b)]));
    }

    flattened
}

/// Re-encodes an image as JPEG at `quality`.
///
/// The output is never larger than the input: when re-encoding does not
/// shrink the image, or the encoder fails, the original bytes come back
/// unchanged. Only a decode failure is an error.
pub fn transcode(data: Vec<u8>, quality: u8) -> Result<Vec<u8>, TranscodeError> {
    let img = image::load_from_memory(&data)?;
    let flattened = flatten_on_white(&img);

    let mut output = Vec::new();
    let encoded = {
        let mut encoder = JpegEncoder::new_with_quality(&mut output, quality.clamp(1, 100));
        encoder.encode_image(&flattened)
    };
    if let Err(e) = encoded {
        log::warn!("JPEG encoding failed, keeping original bytes: {}", e);
        return Ok(data);
    }

    if output.len() > data.len() {
        log::debug!(
            "Re-encoded image is larger ({} > {} bytes), keeping original",
            output.len(),
            data.len()
        );
        return Ok(data);
    }

    Ok(output)
}
