use std::{
	env,
	path::{Path, PathBuf},
	sync::OnceLock
};

use serde::{Deserialize, Serialize};

/// Hugging Face repository holding the ToonOut (BiRefNet fine-tune) export.
pub const MODEL_REPO_ID: &str = "joelseytre/toonout";

/// Tried in order; the first file that can be fetched is used.
pub const MODEL_CANDIDATES: &[&str] = &["onnx/model.onnx", "model.onnx", "birefnet.onnx"];

/// Label of the construction retried when the default one fails.
pub const ALTERNATE_BACKBONE: &str = "mit_b5";

/// BiRefNet exports are traced at a fixed square resolution.
pub const MODEL_INPUT_SIZE: Option<u32> = Some(1024);

pub const CACHE_DIR_ENV: &str = "HF_HOME";
pub const DEFAULT_CACHE_DIR: &str = "/workspace/huggingface";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Device {
	Cpu,
	Cuda
}

static DEVICE: OnceLock<Device> = OnceLock::new();

impl Device {
	/// Device chosen for this process. Probed on first call, fixed afterwards.
	pub fn selected() -> Device {
		*DEVICE.get_or_init(|| {
			let device = Device::probe();
			tracing::info!(?device, "selected compute device");
			device
		})
	}

	fn probe() -> Device {
		let arch_ok = matches!(env::consts::ARCH, "x86_64" | "aarch64");
		if env::consts::OS != "linux" || !arch_ok {
			return Device::Cpu;
		}
		if !cuda_visible(env::var("CUDA_VISIBLE_DEVICES").ok().as_deref()) {
			return Device::Cpu;
		}
		if Path::new("/proc/driver/nvidia/version").exists() || Path::new("/dev/nvidia0").exists() {
			Device::Cuda
		} else {
			Device::Cpu
		}
	}
}

fn cuda_visible(var: Option<&str>) -> bool {
	match var.map(str::trim) {
		None => true,
		Some("") | Some("-1") | Some("none") | Some("NoDevFiles") => false,
		Some(_) => true
	}
}

/// Where a model lives and how it is cached.
#[derive(Debug, Clone)]
pub struct ModelSpec {
	pub repo_id: &'static str,
	pub candidates: &'static [&'static str],
	pub alternate_backbone: &'static str,
	pub input_size: Option<u32>
}

impl Default for ModelSpec {
	fn default() -> Self {
		Self {
			repo_id: MODEL_REPO_ID,
			candidates: MODEL_CANDIDATES,
			alternate_backbone: ALTERNATE_BACKBONE,
			input_size: MODEL_INPUT_SIZE
		}
	}
}

#[derive(Debug, Clone)]
pub struct Settings {
	pub cache_dir: PathBuf,
	pub model: ModelSpec
}

impl Settings {
	pub fn from_env() -> Self {
		Self::with_cache_dir(cache_dir_from(env::var_os(CACHE_DIR_ENV)))
	}

	pub fn with_cache_dir(cache_dir: impl Into<PathBuf>) -> Self {
		Self {
			cache_dir: cache_dir.into(),
			model: ModelSpec::default()
		}
	}
}

fn cache_dir_from(var: Option<std::ffi::OsString>) -> PathBuf {
	match var {
		Some(v) if !v.is_empty() => PathBuf::from(v),
		_ => PathBuf::from(DEFAULT_CACHE_DIR)
	}
}

/// `<cache>/models--org--name`, holding files directly (no `snapshots/<rev>` level).
pub fn repo_cache_dir(cache_dir: &Path, repo_id: &str) -> PathBuf {
	cache_dir.join(format!("models--{}", repo_id.replace('/', "--")))
}
