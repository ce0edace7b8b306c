//! Generic background removal used when the primary model cannot be provisioned.

use std::{
	path::PathBuf,
	sync::OnceLock
};

use anyhow::Result;
use image::{DynamicImage, GrayImage, RgbImage, RgbaImage};

use crate::{config::Device, u2net::U2Net};

pub trait BackgroundRemover: Send + Sync {
	/// Returns a cutout with the same dimensions as `img`.
	fn remove(&self, img: &RgbaImage) -> Result<RgbaImage>;
}

/// A foreground matte at the input's resolution.
pub trait MaskPredictor: Send + Sync {
	fn predict_mask(&self, img: &RgbImage) -> Result<GrayImage>;
}

impl MaskPredictor for U2Net {
	fn predict_mask(&self, img: &RgbImage) -> Result<GrayImage> {
		U2Net::predict_mask(self, img)
	}
}

type Loader = Box<dyn Fn() -> Result<Box<dyn MaskPredictor>> + Send + Sync>;

/// rembg-style removal with U2Net-p. Degrades to [`ColorKeyRemover`] if U2Net cannot be loaded.
pub struct RembgBackend {
	loader: Loader,
	model: OnceLock<Option<Box<dyn MaskPredictor>>>,
	color_key: ColorKeyRemover
}

impl RembgBackend {
	pub fn new(cache_dir: impl Into<PathBuf>, device: Device) -> Self {
		let cache_dir = cache_dir.into();
		Self::with_loader(move || Ok(Box::new(U2Net::load(&cache_dir, device)?) as Box<dyn MaskPredictor>))
	}

	/// `load` runs on the first removal only; its failure is remembered.
	pub fn with_loader<F>(load: F) -> Self
	where
		F: Fn() -> Result<Box<dyn MaskPredictor>> + Send + Sync + 'static
	{
		Self {
			loader: Box::new(load),
			model: OnceLock::new(),
			color_key: ColorKeyRemover::default()
		}
	}

	fn model(&self) -> Option<&dyn MaskPredictor> {
		self.model
			.get_or_init(|| match (self.loader)() {
				Ok(model) => Some(model),
				Err(e) => {
					tracing::warn!("u2net unavailable, using color key: {e:#}");
					None
				}
			})
			.as_deref()
	}
}

impl BackgroundRemover for RembgBackend {
	fn remove(&self, img: &RgbaImage) -> Result<RgbaImage> {
		let Some(model) = self.model() else {
			return self.color_key.remove(img);
		};

		let rgb = DynamicImage::ImageRgba8(img.clone()).to_rgb8();
		let mask = model.predict_mask(&rgb)?;
		let mut out = img.clone();
		for (p, m) in out.pixels_mut().zip(mask.pixels()) {
			p[3] = m[0];
		}
		Ok(out)
	}
}

/// Clears alpha for pixels close to the background color sampled from the corners.
#[derive(Debug, Clone, Copy)]
pub struct ColorKeyRemover {
	pub tolerance: u8
}

impl Default for ColorKeyRemover {
	fn default() -> Self {
		Self { tolerance: 32 }
	}
}

impl BackgroundRemover for ColorKeyRemover {
	fn remove(&self, img: &RgbaImage) -> Result<RgbaImage> {
		let (br, bg, bb) = estimate_bg_rgb(img);
		let tol2 = (self.tolerance as i32) * (self.tolerance as i32);

		let mut out = img.clone();
		for p in out.pixels_mut() {
			let dr = p[0] as i32 - br as i32;
			let dg = p[1] as i32 - bg as i32;
			let db = p[2] as i32 - bb as i32;
			if dr * dr + dg * dg + db * db <= tol2 {
				p[3] = 0;
			}
		}
		Ok(out)
	}
}

/// Mean color of the four 6x6 corner patches; white for an empty image.
fn estimate_bg_rgb(img: &RgbaImage) -> (u8, u8, u8) {
	let (w, h) = img.dimensions();
	if w == 0 || h == 0 {
		return (255, 255, 255);
	}

	let patch = 6u32.min(w).min(h);
	let corners = [
		(0, 0),
		(w - patch, 0),
		(0, h - patch),
		(w - patch, h - patch)
	];

	let mut sum = [0u64; 3];
	let mut n = 0u64;
	for (ox, oy) in corners {
		for y in oy..oy + patch {
			for x in ox..ox + patch {
				let p = img.get_pixel(x, y);
				for c in 0..3 {
					sum[c] += p[c] as u64;
				}
				n += 1;
			}
		}
	}

	((sum[0] / n) as u8, (sum[1] / n) as u8, (sum[2] / n) as u8)
}
