use anyhow::{Context, Result, anyhow, bail};
use image::imageops::FilterType;
use image::{DynamicImage, GrayImage, RgbImage, Rgba, RgbaImage};
use ndarray::{Array4, ArrayD, Axis};

use crate::{
	codec,
	fallback::BackgroundRemover,
	provision::{ModelLibrary, Provisioner, RawOutput, SegmentationModel, SegmentationNetwork}
};

/// Checked in order when a model returns named outputs.
pub const OUTPUT_KEYS: [&str; 4] = ["pred", "alpha", "out", "mask"];

pub struct Pipeline<L: ModelLibrary> {
	provisioner: Provisioner<L>,
	fallback: Box<dyn BackgroundRemover>
}

impl<L: ModelLibrary> Pipeline<L> {
	pub fn new(provisioner: Provisioner<L>, fallback: Box<dyn BackgroundRemover>) -> Self {
		Self { provisioner, fallback }
	}

	pub fn provisioner(&self) -> &Provisioner<L> {
		&self.provisioner
	}

	/// Original colors with the predicted opacity as alpha.
	pub fn infer(&self, img: DynamicImage) -> Result<RgbaImage> {
		match self.provisioner.get_or_load().as_ref() {
			SegmentationModel::Loaded(network) => run_network(network.as_ref(), &img),
			SegmentationModel::Fallback => {
				tracing::debug!("running fallback backend");
				self.fallback
					.remove(&codec::to_rgba(img))
					.context("fallback background removal")
			}
		}
	}
}

pub fn run_network(network: &dyn SegmentationNetwork, img: &DynamicImage) -> Result<RgbaImage> {
	let rgb = img.to_rgb8();
	let (width, height) = rgb.dimensions();

	let model_input = match network.input_size() {
		Some(size) if (width, height) != (size, size) => {
			image::imageops::resize(&rgb, size, size, FilterType::Lanczos3)
		}
		_ => rgb.clone()
	};

	let tensor = image_to_tensor_nchw(&model_input);
	let raw = network.forward(tensor.view()).context("forward pass")?;
	let pred = unwrap_output(raw).context("unwrap model output")?;
	let mask = prediction_to_mask(pred, model_input.width(), model_input.height())?;

	let mask = if mask.dimensions() == (width, height) {
		mask
	} else {
		image::imageops::resize(&mask, width, height, FilterType::Lanczos3)
	};
	Ok(composite(&rgb, &mask))
}

/// `[0, 255]` -> `[-1, 1]`, laid out as a `(1, 3, H, W)` batch.
pub fn image_to_tensor_nchw(img: &RgbImage) -> Array4<f32> {
	let (w, h) = (img.width() as usize, img.height() as usize);
	let mut t = Array4::<f32>::zeros((1, 3, h, w));

	for (x, y, p) in img.enumerate_pixels() {
		let (x, y) = (x as usize, y as usize);
		for c in 0..3 {
			let v = p[c] as f32 / 255.0;
			t[[0, c, y, x]] = (v - 0.5) / 0.5;
		}
	}
	t
}

/// Named outputs are resolved by [`OUTPUT_KEYS`], sequences by their last element.
pub fn unwrap_output(out: RawOutput) -> Result<ArrayD<f32>> {
	let out = match out {
		RawOutput::Map(entries) => select_output(entries)?,
		other => other
	};
	let out = match out {
		RawOutput::Sequence(mut items) => items
			.pop()
			.ok_or_else(|| anyhow!("model returned an empty output sequence"))?,
		other => other
	};
	match out {
		RawOutput::Tensor(t) => Ok(t),
		RawOutput::Map(_) | RawOutput::Sequence(_) => bail!("model output is nested too deeply")
	}
}

fn select_output(mut entries: Vec<(String, RawOutput)>) -> Result<RawOutput> {
	for key in OUTPUT_KEYS {
		if let Some(i) = entries.iter().position(|(name, _)| name == key) {
			return Ok(entries.swap_remove(i).1);
		}
	}
	let names: Vec<&str> = entries.iter().map(|(n, _)| n.as_str()).collect();
	bail!("no recognized output among {names:?} (expected one of {OUTPUT_KEYS:?})")
}

/// Sigmoid, clamp, squeeze, first channel, then `[0, 1]` -> `[0, 255]` (truncating).
pub fn prediction_to_mask(pred: ArrayD<f32>, width: u32, height: u32) -> Result<GrayImage> {
	let prob = pred.mapv(|v| sigmoid(v).clamp(0.0, 1.0));
	let prob = squeeze(prob)?;
	let prob = if prob.ndim() == 3 && matches!(prob.shape()[0], 1 | 3) {
		prob.index_axis_move(Axis(0), 0)
	} else {
		prob
	};

	let (w, h) = (width as usize, height as usize);
	let fits = match prob.shape() {
		[ph, pw] => (*ph, *pw) == (h, w),
		// A 1-pixel-wide input squeezes below two dimensions.
		_ => prob.ndim() < 2 && prob.len() == w * h
	};
	if !fits {
		bail!("unexpected prediction shape {:?} for a {width}x{height} input", prob.shape());
	}

	let alpha: Vec<u8> = prob.iter().map(|p| (p * 255.0) as u8).collect();
	GrayImage::from_raw(width, height, alpha).ok_or_else(|| anyhow!("mask buffer size mismatch"))
}

fn sigmoid(v: f32) -> f32 {
	1.0 / (1.0 + (-v).exp())
}

fn squeeze(a: ArrayD<f32>) -> Result<ArrayD<f32>> {
	let dims: Vec<usize> = a.shape().iter().copied().filter(|&d| d != 1).collect();
	a.into_shape_with_order(dims).context("squeeze prediction")
}

pub fn composite(rgb: &RgbImage, mask: &GrayImage) -> RgbaImage {
	RgbaImage::from_fn(rgb.width(), rgb.height(), |x, y| {
		let p = rgb.get_pixel(x, y);
		Rgba([p[0], p[1], p[2], mask.get_pixel(x, y)[0]])
	})
}
