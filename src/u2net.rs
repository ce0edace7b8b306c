use std::{
	path::{Path, PathBuf},
	sync::Mutex
};

use anyhow::{Context, Result, anyhow, bail};
use image::imageops::FilterType;
use image::{GrayImage, Luma, RgbImage};
use ort::ep;
use ort::session::Session;
use ort::session::builder::{GraphOptimizationLevel, SessionBuilder};
use ort::value::TensorRef;

use crate::{config::Device, download, pipeline, runtime};

const MODEL_NAME: &str = "u2netp";
const MODEL_URL: &str = "https://github.com/danielgatis/rembg/releases/download/v0.0.0/u2netp.onnx";
const INPUT_SIZE: u32 = 320;

/// The small U2Net from the rembg release assets, used when the primary model is unavailable.
pub struct U2Net {
	session: Mutex<Session>,
	input_size: u32
}

impl U2Net {
	pub fn load(cache_dir: &Path, device: Device) -> Result<Self> {
		runtime::ensure_initialized(device)?;
		let path = ensure_model(cache_dir)?;
		let session = open_session(&path, device, GraphOptimizationLevel::Level3)?;
		tracing::info!(model = MODEL_NAME, "fallback model ready");
		Ok(Self {
			session: Mutex::new(session),
			input_size: INPUT_SIZE
		})
	}

	pub fn predict_mask(&self, img: &RgbImage) -> Result<GrayImage> {
		let resized = image::imageops::resize(img, self.input_size, self.input_size, FilterType::Lanczos3);
		let input = pipeline::image_to_tensor_nchw(&resized);

		let mut session = self.session.lock().map_err(|_| anyhow!("u2net session lock poisoned"))?;
		let outputs = session
			.run(ort::inputs![TensorRef::from_array_view(&input)?])
			.context("run inference")?;

		if outputs.len() == 0 {
			bail!("model produced no outputs");
		}

		let out = outputs[0].try_extract_array::<f32>().context("extract output tensor")?;
		let shape = out.shape();
		if shape.len() != 4 || shape[0] != 1 || shape[1] != 1 {
			bail!("unexpected u2net output shape {shape:?} (expected [1, 1, H, W])");
		}
		let (h, w) = (shape[2], shape[3]);

		// Some exports already end in a sigmoid; squashing twice would lift the background to ~0.5.
		let (min_v, max_v) = out
			.iter()
			.fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), v| (lo.min(*v), hi.max(*v)));
		let treat_as_prob = min_v >= -0.01 && max_v <= 1.01;

		let mut mask_small = GrayImage::new(w as u32, h as u32);
		for y in 0..h {
			for x in 0..w {
				let v = out[[0, 0, y, x]];
				let s = if treat_as_prob { v } else { 1.0 / (1.0 + (-v).exp()) };
				let px = (s.clamp(0.0, 1.0) * 255.0).round() as u8;
				mask_small.put_pixel(x as u32, y as u32, Luma([px]));
			}
		}

		Ok(image::imageops::resize(&mask_small, img.width(), img.height(), FilterType::Lanczos3))
	}
}

fn ensure_model(cache_dir: &Path) -> Result<PathBuf> {
	let path = cache_dir.join("rembg").join(format!("{MODEL_NAME}.onnx"));
	download::fetch_cached(MODEL_URL, &path, None)
		.with_context(|| format!("download model {MODEL_NAME} from {MODEL_URL}"))?;
	Ok(path)
}

/// A session builder for `device`. CUDA registration failures surface at commit time.
pub(crate) fn session_builder(device: Device, level: GraphOptimizationLevel) -> Result<SessionBuilder> {
	let builder = Session::builder()
		.context("create ORT session builder")?
		.with_optimization_level(level)
		.context("set graph optimization level")?;
	match device {
		Device::Cpu => Ok(builder),
		Device::Cuda => builder
			.with_execution_providers([ep::CUDA::default().build()])
			.context("configure CUDA EP")
	}
}

/// Commits `builder`, retrying on plain CPU when the CUDA provider cannot be initialized.
pub(crate) fn commit_with_cpu_fallback(
	builder: SessionBuilder,
	path: &Path,
	device: Device,
	level: GraphOptimizationLevel
) -> Result<Session> {
	match builder.commit_from_file(path) {
		Ok(s) => Ok(s),
		Err(e) if device == Device::Cuda => {
			tracing::warn!("CUDA init failed, falling back to CPU: {e:#}");
			session_builder(Device::Cpu, level)?
				.commit_from_file(path)
				.with_context(|| format!("load onnx model (CPU fallback): {}", path.display()))
		}
		Err(e) => Err(anyhow!("load onnx model: {}: {e:#}", path.display()))
	}
}

fn open_session(path: &Path, device: Device, level: GraphOptimizationLevel) -> Result<Session> {
	let builder = session_builder(device, level)?;
	commit_with_cpu_fallback(builder, path, device, level)
}
