//! Locating and loading the ONNX Runtime shared library (`ort` is built with `load-dynamic`).

use std::{
	cmp::Ordering,
	env,
	fs,
	io::{Read, Write},
	path::{Path, PathBuf},
	sync::OnceLock
};

use anyhow::{Context, Result, anyhow, bail};

use crate::{config::Device, download, pypi};

pub const DYLIB_ENV: &str = "ORT_DYLIB_PATH";

// Resolution is attempted once per process; a failure is remembered as its message.
static RUNTIME: OnceLock<std::result::Result<PathBuf, String>> = OnceLock::new();

/// Makes ONNX Runtime usable for this process. Must succeed before any `Session` is built.
pub fn ensure_initialized(device: Device) -> Result<PathBuf> {
	RUNTIME
		.get_or_init(|| {
			resolve_and_init(device).map_err(|e| {
				tracing::warn!("onnx runtime unavailable: {e:#}");
				format!("{e:#}")
			})
		})
		.clone()
		.map_err(|msg| anyhow!(msg))
}

fn resolve_and_init(device: Device) -> Result<PathBuf> {
	let main_lib = match env::var_os(DYLIB_ENV) {
		Some(p) if !p.is_empty() => {
			let p = PathBuf::from(p);
			if !p.is_file() {
				bail!("{DYLIB_ENV} points to a missing file: {}", p.display());
			}
			p
		}
		_ => ensure_onnxruntime(runtime_package(device))?
	};

	let builder = ort::init_from(&main_lib)
		.with_context(|| format!("load onnxruntime from {}", main_lib.display()))?;
	builder.commit();
	tracing::info!(lib = %main_lib.display(), "onnx runtime initialized");
	Ok(main_lib)
}

pub fn runtime_package(device: Device) -> &'static str {
	match device {
		Device::Cpu => "onnxruntime",
		Device::Cuda => "onnxruntime-gpu"
	}
}

/// Returns the main library of a cached runtime, fetching the latest wheel from PyPI if none is cached.
pub fn ensure_onnxruntime(package: &str) -> Result<PathBuf> {
	let os = env::consts::OS;
	let pkg_dir = cache_base_dir().join("onnxruntime").join(package);

	if let Some(main_lib) = find_any_installed_lib(os, &pkg_dir)? {
		return Ok(main_lib);
	}

	let project = pypi::fetch_project(package)?;
	let wheel = pypi::select_wheel(&project, os, env::consts::ARCH)?;

	let base = pkg_dir.join(&project.info.version);
	let wheel_path = base.join(&wheel.filename);
	let lib_dir = base.join("lib");

	download::fetch_cached(&wheel.url, &wheel_path, Some(&wheel.digests.sha256))
		.with_context(|| format!("download wheel: {}", wheel.filename))?;
	extract_ort_libs_from_wheel(&wheel_path, &lib_dir)?;

	find_main_lib(os, &lib_dir)
		.ok_or_else(|| anyhow!("unable to find ONNX Runtime library after extraction in {}", lib_dir.display()))
}

fn cache_base_dir() -> PathBuf {
	match directories::ProjectDirs::from("rs", "toonout", "toonout-worker") {
		Some(dirs) => dirs.cache_dir().to_path_buf(),
		None => env::temp_dir().join("toonout-worker")
	}
}

fn find_main_lib(os: &str, lib_dir: &Path) -> Option<PathBuf> {
	let prefer = match os {
		"windows" => "onnxruntime.dll",
		"macos" => "libonnxruntime.dylib",
		_ => "libonnxruntime.so"
	};
	let p = lib_dir.join(prefer);
	if p.exists() {
		return Some(p);
	}

	// Versioned names only; pick the largest file (the real library, not a provider shim).
	let mut best: Option<(u64, PathBuf)> = None;
	for ent in fs::read_dir(lib_dir).ok()?.flatten() {
		let path = ent.path();
		let name = path.file_name().and_then(|s| s.to_str()).unwrap_or("").to_ascii_lowercase();
		let ok = match os {
			"windows" => name == "onnxruntime.dll",
			"macos" => name.starts_with("libonnxruntime") && name.ends_with(".dylib"),
			_ => name.starts_with("libonnxruntime.so")
		};
		if !ok {
			continue;
		}
		let len = ent.metadata().map(|m| m.len()).unwrap_or(0);
		if best.as_ref().is_none_or(|(best_len, _)| len > *best_len) {
			best = Some((len, path));
		}
	}
	best.map(|(_, p)| p)
}

fn extract_ort_libs_from_wheel(wheel_path: &Path, lib_dir: &Path) -> Result<()> {
	fs::create_dir_all(lib_dir).with_context(|| format!("create lib dir: {}", lib_dir.display()))?;

	let file = fs::File::open(wheel_path).with_context(|| format!("open wheel: {}", wheel_path.display()))?;
	let mut zip = zip::ZipArchive::new(file).context("open zip archive")?;

	for i in 0..zip.len() {
		let mut entry = zip.by_index(i).context("read zip entry")?;
		let name = entry.name().replace('\\', "/");
		if entry.is_dir() || !name.contains("/capi/") || !is_runtime_lib_file(&name) {
			continue;
		}

		let base = Path::new(&name)
			.file_name()
			.ok_or_else(|| anyhow!("invalid zip entry name: {name}"))?;
		let dst = lib_dir.join(base);
		if dst.exists() {
			continue;
		}

		let mut bytes = Vec::new();
		entry.read_to_end(&mut bytes).context("read zip entry bytes")?;
		let mut out = fs::File::create(&dst).with_context(|| format!("create file: {}", dst.display()))?;
		out.write_all(&bytes).context("write extracted file")?;
		tracing::debug!(file = %dst.display(), "extracted runtime library");
	}

	Ok(())
}

fn is_runtime_lib_file(name: &str) -> bool {
	let lower = name.to_ascii_lowercase();
	lower.ends_with(".dll") || lower.ends_with(".so") || lower.contains(".so.") || lower.ends_with(".dylib")
}

fn find_any_installed_lib(os: &str, pkg_dir: &Path) -> Result<Option<PathBuf>> {
	if !pkg_dir.exists() {
		return Ok(None);
	}

	let mut versions: Vec<PathBuf> = fs::read_dir(pkg_dir)
		.with_context(|| format!("read cache dir: {}", pkg_dir.display()))?
		.flatten()
		.map(|e| e.path())
		.filter(|p| p.is_dir())
		.collect();
	versions.sort_by(|a, b| cmp_versions(dir_name(b), dir_name(a)));

	for vdir in versions {
		let lib_dir = vdir.join("lib");
		if let Some(main) = find_main_lib(os, &lib_dir) {
			return Ok(Some(main));
		}

		// A wheel without extracted libs means an interrupted earlier run.
		if let Some(wheel_path) = find_any_wheel(&vdir)? {
			extract_ort_libs_from_wheel(&wheel_path, &lib_dir)?;
			if let Some(main) = find_main_lib(os, &lib_dir) {
				return Ok(Some(main));
			}
		}
	}

	Ok(None)
}

fn find_any_wheel(dir: &Path) -> Result<Option<PathBuf>> {
	let rd = fs::read_dir(dir).with_context(|| format!("read dir: {}", dir.display()))?;
	Ok(rd
		.flatten()
		.map(|e| e.path())
		.find(|p| p.is_file() && p.extension().and_then(|s| s.to_str()).is_some_and(|e| e.eq_ignore_ascii_case("whl"))))
}

fn dir_name(p: &Path) -> &str {
	p.file_name().and_then(|s| s.to_str()).unwrap_or("")
}

fn cmp_versions(a: &str, b: &str) -> Ordering {
	let pa = parse_version_prefix(a);
	let pb = parse_version_prefix(b);

	for i in 0..pa.len().max(pb.len()) {
		let av = pa.get(i).copied().unwrap_or(0);
		let bv = pb.get(i).copied().unwrap_or(0);
		match av.cmp(&bv) {
			Ordering::Equal => continue,
			ord => return ord
		}
	}
	a.cmp(b)
}

/// `1.24.1.post1` -> `[1, 24, 1]`
fn parse_version_prefix(s: &str) -> Vec<u64> {
	let mut out = Vec::new();
	for part in s.split('.') {
		let digits: String = part.chars().take_while(char::is_ascii_digit).collect();
		match digits.parse::<u64>() {
			Ok(v) => out.push(v),
			Err(_) => break
		}
	}
	out
}
