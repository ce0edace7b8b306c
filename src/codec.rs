//! Base64/PNG text representation <-> in-memory images.

use std::io::Cursor;

use anyhow::{Context, Result};
use base64::{Engine as _, engine::general_purpose::STANDARD};
use image::{DynamicImage, GrayImage, ImageFormat, RgbaImage};
use thiserror::Error;

const DATA_PREFIX: &str = "data:";
const BASE64_MARKER: &str = ";base64,";

#[derive(Debug, Error)]
pub enum DecodeError {
	#[error("malformed data URI marker (expected `data:<type>;base64,`)")]
	MalformedMarker,
	#[error("invalid base64: {0}")]
	Base64(#[from] base64::DecodeError),
	#[error("unrecognized image data: {0}")]
	Image(#[from] image::ImageError)
}

pub fn decode(payload: &str) -> Result<DynamicImage, DecodeError> {
	let bytes = decode_base64(payload)?;
	Ok(image::load_from_memory(&bytes)?)
}

fn decode_base64(payload: &str) -> Result<Vec<u8>, DecodeError> {
	let body = strip_marker(payload)?;
	let mut b64: String = body.chars().filter(|c| !c.is_ascii_whitespace()).collect();
	while b64.ends_with('=') {
		b64.pop();
	}
	let padding = (4 - b64.len() % 4) % 4;
	b64.extend(std::iter::repeat_n('=', padding));
	Ok(STANDARD.decode(b64.as_bytes())?)
}

fn strip_marker(payload: &str) -> Result<&str, DecodeError> {
	if !payload.starts_with(DATA_PREFIX) {
		return Ok(payload);
	}
	if !payload.contains(BASE64_MARKER) {
		return Err(DecodeError::MalformedMarker);
	}
	payload
		.split_once(',')
		.map(|(_, body)| body)
		.ok_or(DecodeError::MalformedMarker)
}

pub fn encode(img: &DynamicImage) -> Result<String> {
	encode_png(|w| img.write_to(w, ImageFormat::Png))
}

pub fn encode_rgba(img: &RgbaImage) -> Result<String> {
	encode_png(|w| img.write_to(w, ImageFormat::Png))
}

pub fn encode_mask(mask: &GrayImage) -> Result<String> {
	encode_png(|w| mask.write_to(w, ImageFormat::Png))
}

fn encode_png(write: impl FnOnce(&mut Cursor<&mut Vec<u8>>) -> image::ImageResult<()>) -> Result<String> {
	let mut buf = Vec::new();
	write(&mut Cursor::new(&mut buf)).context("encode png")?;
	Ok(STANDARD.encode(&buf))
}

/// Adds an opaque alpha channel unless the image already is 8-bit RGBA.
pub fn to_rgba(img: DynamicImage) -> RgbaImage {
	match img {
		DynamicImage::ImageRgba8(rgba) => rgba,
		other => other.to_rgba8()
	}
}

pub fn extract_alpha(img: &RgbaImage) -> GrayImage {
	GrayImage::from_fn(img.width(), img.height(), |x, y| image::Luma([img.get_pixel(x, y)[3]]))
}
