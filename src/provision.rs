//! Lazy, once-per-process acquisition of the segmentation model.
//!
//! Acquisition is a fixed sequence of fallible stages (entry point, weights
//! download, construction, weight load, preparation). The first stage that
//! cannot be resolved degrades the whole provisioner to
//! [`SegmentationModel::Fallback`]; no error ever leaves this module.

use std::{
	fmt,
	panic::{self, AssertUnwindSafe},
	path::{Path, PathBuf},
	sync::{Arc, OnceLock}
};

use anyhow::{Context, Result, anyhow};
use ndarray::{ArrayD, ArrayView4};

use crate::{
	config::{Device, ModelSpec, Settings},
	error::panic_message
};

/// Raw prediction as returned by a forward pass, before it is unwrapped to a single tensor.
#[derive(Debug, Clone)]
pub enum RawOutput {
	Tensor(ArrayD<f32>),
	/// Named outputs in the order the model declares them.
	Map(Vec<(String, RawOutput)>),
	Sequence(Vec<RawOutput>)
}

/// A network that has weights loaded and is ready for inference.
pub trait SegmentationNetwork: Send + Sync {
	/// Fixed square input resolution, or `None` if any size is accepted.
	fn input_size(&self) -> Option<u32>;

	/// `input` is a normalized NCHW batch of one.
	fn forward(&self, input: ArrayView4<'_, f32>) -> Result<RawOutput>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelConfig {
	Default,
	Backbone(&'static str)
}

impl fmt::Display for ModelConfig {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			ModelConfig::Default => f.write_str("default"),
			ModelConfig::Backbone(name) => write!(f, "backbone={name}")
		}
	}
}

/// A weights container as found on disk.
#[derive(Debug, Clone, PartialEq)]
pub enum Checkpoint<W> {
	Weights(W),
	/// Training checkpoints keep the weights under a `state_dict` entry.
	Wrapped { state_dict: W }
}

impl<W> Checkpoint<W> {
	pub fn into_state_dict(self) -> W {
		match self {
			Checkpoint::Weights(w) => w,
			Checkpoint::Wrapped { state_dict } => state_dict
		}
	}
}

/// Key mismatches found by a permissive weight load. Diagnostics only.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadReport {
	pub missing_keys: Vec<String>,
	pub unexpected_keys: Vec<String>
}

impl LoadReport {
	pub fn is_clean(&self) -> bool {
		self.missing_keys.is_empty() && self.unexpected_keys.is_empty()
	}
}

/// The runtime-specific operations the provisioner sequences.
pub trait ModelLibrary: Send + Sync {
	/// A constructed model without weights.
	type Builder;
	type Weights;
	type Network: SegmentationNetwork + 'static;

	/// Makes the model implementation usable at all.
	fn entry_point(&self) -> Result<()>;

	/// Obtains one candidate weights file, returning its local path.
	fn fetch(&self, repo_id: &str, filename: &str, cache_dir: &Path) -> Result<PathBuf>;

	fn construct(&self, config: ModelConfig, device: Device) -> Result<Self::Builder>;

	fn read_checkpoint(&self, path: &Path) -> Result<Checkpoint<Self::Weights>>;

	/// Best-effort load: key mismatches belong in the report, not in `Err`.
	fn load_weights(&self, builder: Self::Builder, weights: Self::Weights) -> Result<(Self::Network, LoadReport)>;

	/// Switches the network to inference mode on `device`.
	fn prepare(&self, network: Self::Network, device: Device) -> Result<Self::Network>;
}

pub enum SegmentationModel {
	Loaded(Box<dyn SegmentationNetwork>),
	Fallback
}

impl SegmentationModel {
	pub fn is_fallback(&self) -> bool {
		matches!(self, SegmentationModel::Fallback)
	}
}

impl fmt::Debug for SegmentationModel {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			SegmentationModel::Loaded(_) => f.write_str("Loaded(..)"),
			SegmentationModel::Fallback => f.write_str("Fallback")
		}
	}
}

pub struct Provisioner<L: ModelLibrary> {
	library: L,
	spec: ModelSpec,
	cache_dir: PathBuf,
	device: Device,
	state: OnceLock<Arc<SegmentationModel>>
}

impl<L: ModelLibrary> Provisioner<L> {
	pub fn new(library: L, settings: &Settings, device: Device) -> Self {
		Self {
			library,
			spec: settings.model.clone(),
			cache_dir: settings.cache_dir.clone(),
			device,
			state: OnceLock::new()
		}
	}

	pub fn library(&self) -> &L {
		&self.library
	}

	/// Resolves the model on first call; later calls return the same `Arc`.
	/// Concurrent first callers block until the single load attempt finishes.
	/// A panicking stage counts as a failed load.
	pub fn get_or_load(&self) -> Arc<SegmentationModel> {
		Arc::clone(self.state.get_or_init(|| {
			let loaded = panic::catch_unwind(AssertUnwindSafe(|| self.load()))
				.unwrap_or_else(|payload| Err(anyhow!("load panicked: {}", panic_message(payload.as_ref()))));
			let state = match loaded {
				Ok(network) => {
					tracing::info!(repo = self.spec.repo_id, device = ?self.device, "segmentation model ready");
					SegmentationModel::Loaded(Box::new(network))
				}
				Err(e) => {
					tracing::warn!("primary model unavailable, using fallback backend: {e:#}");
					SegmentationModel::Fallback
				}
			};
			Arc::new(state)
		}))
	}

	fn load(&self) -> Result<L::Network> {
		self.library.entry_point().context("model entry point")?;
		let path = self.fetch_weights()?;
		let builder = self.construct()?;

		let checkpoint = self
			.library
			.read_checkpoint(&path)
			.with_context(|| format!("read checkpoint: {}", path.display()))?;
		let (network, report) = self
			.library
			.load_weights(builder, checkpoint.into_state_dict())
			.context("load weights")?;
		if !report.is_clean() {
			tracing::warn!(
				missing = ?report.missing_keys,
				unexpected = ?report.unexpected_keys,
				"weights loaded with key mismatches"
			);
		}

		self.library
			.prepare(network, self.device)
			.context("prepare model for inference")
	}

	fn fetch_weights(&self) -> Result<PathBuf> {
		for filename in self.spec.candidates {
			match self.library.fetch(self.spec.repo_id, filename, &self.cache_dir) {
				Ok(path) => {
					tracing::info!(file = filename, path = %path.display(), "weights available");
					return Ok(path);
				}
				Err(e) => tracing::debug!(file = filename, "candidate unavailable: {e:#}")
			}
		}
		Err(anyhow!(
			"no weights found in {} (tried {})",
			self.spec.repo_id,
			self.spec.candidates.join(", ")
		))
	}

	fn construct(&self) -> Result<L::Builder> {
		match self.library.construct(ModelConfig::Default, self.device) {
			Ok(b) => Ok(b),
			Err(e) => {
				let alternate = ModelConfig::Backbone(self.spec.alternate_backbone);
				tracing::warn!("default construction failed, retrying with {alternate}: {e:#}");
				self.library
					.construct(alternate, self.device)
					.with_context(|| format!("construct model ({alternate})"))
			}
		}
	}
}
