//! BiRefNet / ToonOut served through ONNX Runtime.

use std::{
	fs,
	path::{Path, PathBuf},
	sync::Mutex,
	time::Instant
};

use anyhow::{Context, Result, anyhow, bail};
use ndarray::{Array4, ArrayView4};
use ort::session::Session;
use ort::session::builder::{GraphOptimizationLevel, SessionBuilder};
use ort::value::TensorRef;

use crate::{
	config::{self, Device},
	download,
	pipeline::OUTPUT_KEYS,
	provision::{Checkpoint, LoadReport, ModelConfig, ModelLibrary, RawOutput, SegmentationNetwork},
	runtime,
	u2net
};

pub struct OrtLibrary {
	device: Device,
	input_size: Option<u32>
}

impl OrtLibrary {
	pub fn new(device: Device, input_size: Option<u32>) -> Self {
		Self { device, input_size }
	}
}

pub struct OrtBuilder {
	builder: SessionBuilder,
	device: Device,
	level: GraphOptimizationLevel
}

impl ModelLibrary for OrtLibrary {
	type Builder = OrtBuilder;
	type Weights = PathBuf;
	type Network = OrtNetwork;

	fn entry_point(&self) -> Result<()> {
		runtime::ensure_initialized(self.device).map(|_| ())
	}

	fn fetch(&self, repo_id: &str, filename: &str, cache_dir: &Path) -> Result<PathBuf> {
		let url = download::hf_resolve_url(repo_id, filename);
		let dst = config::repo_cache_dir(cache_dir, repo_id).join(filename);
		download::fetch_cached(&url, &dst, None)?;
		Ok(dst)
	}

	fn construct(&self, config: ModelConfig, device: Device) -> Result<OrtBuilder> {
		// The alternate build skips graph rewrites that older runtimes reject for some exports.
		let level = match config {
			ModelConfig::Default => GraphOptimizationLevel::Level3,
			ModelConfig::Backbone(_) => GraphOptimizationLevel::Disable
		};
		tracing::debug!(%config, ?device, "building session");
		Ok(OrtBuilder {
			builder: u2net::session_builder(device, level)?,
			device,
			level
		})
	}

	fn read_checkpoint(&self, path: &Path) -> Result<Checkpoint<PathBuf>> {
		let len = fs::metadata(path)
			.with_context(|| format!("stat {}", path.display()))?
			.len();
		if len == 0 {
			bail!("empty weights file: {}", path.display());
		}
		// ONNX graphs embed their initializers; there is no outer container to unwrap.
		Ok(Checkpoint::Weights(path.to_path_buf()))
	}

	fn load_weights(&self, builder: OrtBuilder, weights: PathBuf) -> Result<(OrtNetwork, LoadReport)> {
		let session = u2net::commit_with_cpu_fallback(builder.builder, &weights, builder.device, builder.level)?;
		let network = OrtNetwork {
			session: Mutex::new(session),
			input_size: self.input_size
		};
		Ok((network, LoadReport::default()))
	}

	fn prepare(&self, network: OrtNetwork, _device: Device) -> Result<OrtNetwork> {
		// The first run allocates device memory and picks kernels; pay for it before the first request.
		if let Some(size) = network.input_size {
			let start = Instant::now();
			let zeros = Array4::<f32>::zeros((1, 3, size as usize, size as usize));
			network.forward(zeros.view()).context("warm-up run")?;
			tracing::info!(ms = start.elapsed().as_millis() as u64, "warm-up finished");
		}
		Ok(network)
	}
}

pub struct OrtNetwork {
	session: Mutex<Session>,
	input_size: Option<u32>
}

impl SegmentationNetwork for OrtNetwork {
	fn input_size(&self) -> Option<u32> {
		self.input_size
	}

	fn forward(&self, input: ArrayView4<'_, f32>) -> Result<RawOutput> {
		let mut session = self.session.lock().map_err(|_| anyhow!("session lock poisoned"))?;
		let input = input.as_standard_layout();
		let outputs = session
			.run(ort::inputs![TensorRef::from_array_view(&input)?])
			.context("run inference")?;

		let names: Vec<String> = outputs.keys().map(|k| k.to_string()).collect();
		let mut tensors = Vec::with_capacity(names.len());
		for name in names {
			let value = outputs
				.get(name.as_str())
				.ok_or_else(|| anyhow!("output {name} disappeared"))?;
			let array = value
				.try_extract_array::<f32>()
				.with_context(|| format!("extract output tensor {name}"))?
				.to_owned();
			tensors.push((name, RawOutput::Tensor(array)));
		}
		into_raw_output(tensors)
	}
}

/// One output is the prediction; several are named if any name is recognized, positional otherwise.
fn into_raw_output(mut tensors: Vec<(String, RawOutput)>) -> Result<RawOutput> {
	match tensors.len() {
		0 => bail!("model produced no outputs"),
		1 => Ok(tensors.remove(0).1),
		_ if tensors.iter().any(|(n, _)| OUTPUT_KEYS.contains(&n.as_str())) => Ok(RawOutput::Map(tensors)),
		_ => Ok(RawOutput::Sequence(tensors.into_iter().map(|(_, t)| t).collect()))
	}
}

#[cfg(test)]
mod tests {
	use ndarray::{ArrayD, IxDyn};

	use super::*;
	use crate::pipeline::unwrap_output;

	fn t(v: f32) -> RawOutput {
		RawOutput::Tensor(ArrayD::from_elem(IxDyn(&[1]), v))
	}

	#[test]
	fn single_output_is_the_prediction() {
		let raw = into_raw_output(vec![("output_image".into(), t(4.0))]).unwrap();
		assert_eq!(unwrap_output(raw).unwrap()[[0]], 4.0);
	}

	#[test]
	fn recognized_names_select_by_priority() {
		let raw = into_raw_output(vec![("mask".into(), t(1.0)), ("pred".into(), t(2.0))]).unwrap();
		assert_eq!(unwrap_output(raw).unwrap()[[0]], 2.0);
	}

	#[test]
	fn anonymous_outputs_use_the_last() {
		let raw = into_raw_output(vec![("o1".into(), t(1.0)), ("o2".into(), t(2.0)), ("o3".into(), t(3.0))]).unwrap();
		assert_eq!(unwrap_output(raw).unwrap()[[0]], 3.0);
	}

	#[test]
	fn no_outputs_is_an_error() {
		assert!(into_raw_output(vec![]).is_err());
	}

	#[test]
	fn weights_are_cached_under_repo_dir() {
		let dir = tempfile::tempdir().unwrap();
		let dst = config::repo_cache_dir(dir.path(), "joelseytre/toonout").join("model.onnx");
		fs::create_dir_all(dst.parent().unwrap()).unwrap();
		fs::write(&dst, b"onnx").unwrap();

		let lib = OrtLibrary::new(Device::Cpu, Some(1024));
		let path = lib.fetch("joelseytre/toonout", "model.onnx", dir.path()).unwrap();
		assert_eq!(path, dst);
		assert_eq!(lib.read_checkpoint(&path).unwrap(), Checkpoint::Weights(dst));
	}

	#[test]
	fn empty_weights_file_is_rejected() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("model.onnx");
		fs::write(&path, b"").unwrap();
		assert!(OrtLibrary::new(Device::Cpu, None).read_checkpoint(&path).is_err());
	}
}
