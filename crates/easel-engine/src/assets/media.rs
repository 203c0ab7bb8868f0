use std::path::Path;

use anyhow::{bail, Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{DynamicImage, Rgba, RgbaImage};

const THUMBNAIL_QUALITY: u8 = 80;

pub fn encode_data_url(bytes: &[u8], mime: &str) -> String {
    format!("data:{mime};base64,{}", BASE64.encode(bytes))
}

pub fn decode_data_url(data_url: &str) -> Result<(Vec<u8>, String)> {
    let rest = data_url
        .trim()
        .strip_prefix("data:")
        .context("payload is not a data URL")?;
    let (meta, payload) = rest
        .split_once(',')
        .context("data URL carries no payload")?;
    let mime = meta
        .split(';')
        .next()
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .unwrap_or("application/octet-stream")
        .to_string();
    let bytes = if meta.ends_with(";base64") {
        BASE64
            .decode(payload.trim())
            .context("data URL payload is not valid base64")?
    } else {
        payload.as_bytes().to_vec()
    };
    Ok((bytes, mime))
}

/// Accepts a data URL or bare base64 and returns a data URL. Remote
/// references and undecodable text are not inline data.
pub fn normalize_inline(raw: &str) -> Option<String> {
    let raw = raw.trim();
    if raw.is_empty() || is_remote_reference(raw) {
        return None;
    }
    if raw.starts_with("data:") {
        return decode_data_url(raw).ok().map(|_| raw.to_string());
    }
    let bytes = BASE64.decode(raw).ok()?;
    Some(encode_data_url(&bytes, sniff_mime(&bytes)))
}

pub fn is_remote_reference(raw: &str) -> bool {
    ["http://", "https://", "file://", "mem://", "blob:"]
        .iter()
        .any(|scheme| raw.starts_with(scheme))
}

pub fn sniff_mime(bytes: &[u8]) -> &'static str {
    if bytes.starts_with(b"\x89PNG") {
        "image/png"
    } else if bytes.starts_with(&[0xFF, 0xD8, 0xFF]) {
        "image/jpeg"
    } else if bytes.starts_with(b"GIF8") {
        "image/gif"
    } else if bytes.len() >= 12 && &bytes[..4] == b"RIFF" && &bytes[8..12] == b"WEBP" {
        "image/webp"
    } else if bytes.starts_with(b"<svg") || bytes.starts_with(b"<?xml") {
        "image/svg+xml"
    } else {
        "application/octet-stream"
    }
}

pub fn guess_image_mime(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|value| value.to_str())
        .map(|value| value.to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "jpg" | "jpeg" => "image/jpeg",
        "webp" => "image/webp",
        "gif" => "image/gif",
        "svg" => "image/svg+xml",
        _ => "image/png",
    }
}

/// Reads a local image into a data URL. Remote references and data URLs
/// pass through untouched.
pub async fn load_source(raw: &str) -> Result<String> {
    if raw.starts_with("data:") || is_remote_reference(raw) {
        return Ok(raw.to_string());
    }
    let path = Path::new(raw);
    let bytes = tokio::fs::read(path)
        .await
        .with_context(|| format!("failed reading image {}", path.display()))?;
    Ok(encode_data_url(&bytes, guess_image_mime(path)))
}

pub fn extension_for_mime(mime: &str) -> &'static str {
    match mime {
        "image/jpeg" => "jpg",
        "image/webp" => "webp",
        "image/gif" => "gif",
        "image/svg+xml" => "svg",
        "video/mp4" => "mp4",
        "image/png" => "png",
        _ => "bin",
    }
}

/// JPEG preview no larger than `max_dim` on either side. Transparent
/// pixels are flattened onto white first.
pub fn make_thumbnail(data_url: &str, max_dim: u32) -> Result<String> {
    let (bytes, mime) = decode_data_url(data_url)?;
    if mime == "image/svg+xml" {
        bail!("vector payloads have no raster thumbnail");
    }
    let image = image::load_from_memory(&bytes).context("failed decoding image payload")?;
    let rgba = image.to_rgba8();
    let mut flattened = RgbaImage::new(rgba.width(), rgba.height());
    for (x, y, pixel) in rgba.enumerate_pixels() {
        let alpha = u16::from(pixel[3]);
        let blend = |channel: u8| -> u8 {
            (((u16::from(channel) * alpha) + (255 * (255 - alpha))) / 255) as u8
        };
        flattened.put_pixel(
            x,
            y,
            Rgba([blend(pixel[0]), blend(pixel[1]), blend(pixel[2]), 255]),
        );
    }
    let mut image = DynamicImage::ImageRgba8(flattened);
    let dim = max_dim.max(16);
    if image.width() > dim || image.height() > dim {
        image = image.resize(dim, dim, FilterType::Triangle);
    }
    let mut out = Vec::new();
    JpegEncoder::new_with_quality(&mut out, THUMBNAIL_QUALITY)
        .encode_image(&DynamicImage::ImageRgb8(image.to_rgb8()))
        .context("failed encoding thumbnail")?;
    Ok(encode_data_url(&out, "image/jpeg"))
}
