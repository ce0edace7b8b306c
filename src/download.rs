use std::{
	fs,
	fs::File,
	io::{Read, Write},
	path::Path,
	time::Instant
};

use anyhow::{Context, Result, bail};
use sha2::Digest as _;

const HF_ENDPOINT: &str = "https://huggingface.co";

#[derive(Debug, Clone, Copy)]
pub struct Progress {
	pub downloaded: u64,
	pub total: Option<u64>,
	pub secs: f64,
	pub done: bool
}

/// `https://huggingface.co/<repo>/resolve/main/<file>`
pub fn hf_resolve_url(repo_id: &str, filename: &str) -> String {
	format!("{HF_ENDPOINT}/{repo_id}/resolve/main/{}", filename.trim_start_matches('/'))
}

/// Downloads `url` to `dst` unless `dst` already exists. Returns true if the network was used.
pub fn fetch_cached(url: &str, dst: &Path, sha256_hex: Option<&str>) -> Result<bool> {
	if dst.is_file() {
		tracing::debug!(path = %dst.display(), "cache hit");
		return Ok(false);
	}
	download_to_path(url, dst, sha256_hex)?;
	Ok(true)
}

pub fn download_to_path(url: &str, dst: &Path, sha256_hex: Option<&str>) -> Result<()> {
	download_to_path_with_progress(url, dst, sha256_hex, |p| log_progress(url, p))
}

/// Streams into `<dst>.part` and renames on success, so an interrupted download
/// never leaves a truncated file at `dst`.
pub fn download_to_path_with_progress(
	url: &str,
	dst: &Path,
	sha256_hex: Option<&str>,
	mut on_progress: impl FnMut(Progress)
) -> Result<()> {
	if let Some(parent) = dst.parent() {
		fs::create_dir_all(parent).with_context(|| format!("create dir: {}", parent.display()))?;
	}

	let tmp = dst.with_extension("part");
	let _ = fs::remove_file(&tmp);

	tracing::info!(%url, dst = %dst.display(), "downloading");
	let resp = ureq::get(url)
		.call()
		.with_context(|| format!("GET {url}"))?;

	let status = resp.status().as_u16();
	if status / 100 != 2 {
		bail!("download failed (HTTP {status}): {url}");
	}

	let total_len = resp
		.headers()
		.get(ureq::http::header::CONTENT_LENGTH)
		.and_then(|v| v.to_str().ok())
		.and_then(|s| s.parse::<u64>().ok());

	let mut reader = resp.into_body().into_reader();
	let mut file = File::create(&tmp).with_context(|| format!("create file: {}", tmp.display()))?;
	let mut hasher = sha256_hex.map(|_| sha2::Sha256::new());

	let mut buf = vec![0u8; 64 * 1024];
	let mut downloaded: u64 = 0;
	let start = Instant::now();
	let mut last = Instant::now();

	loop {
		let n = reader.read(&mut buf).context("read response body")?;
		if n == 0 {
			break;
		}
		downloaded += n as u64;

		if let Some(h) = hasher.as_mut() {
			h.update(&buf[..n]);
		}
		file.write_all(&buf[..n]).context("write file")?;

		if last.elapsed().as_millis() >= 250 {
			on_progress(Progress {
				downloaded,
				total: total_len,
				secs: start.elapsed().as_secs_f64(),
				done: false
			});
			last = Instant::now();
		}
	}
	file.flush().context("flush file")?;
	drop(file);

	on_progress(Progress {
		downloaded,
		total: total_len,
		secs: start.elapsed().as_secs_f64(),
		done: true
	});

	if let (Some(expected), Some(h)) = (sha256_hex, hasher) {
		let got = hex::encode(h.finalize());
		if !eq_hex(expected, &got) {
			let _ = fs::remove_file(&tmp);
			bail!("sha256 mismatch for {url}: expected {expected}, got {got}");
		}
	}

	fs::rename(&tmp, dst).with_context(|| format!("rename {} -> {}", tmp.display(), dst.display()))?;
	Ok(())
}

fn log_progress(url: &str, p: Progress) {
	let mb = |b: u64| (b as f64) / (1024.0 * 1024.0);
	let speed = if p.secs > 0.0 { mb(p.downloaded) / p.secs } else { 0.0 };

	match p.total {
		Some(t) if t > 0 => {
			let pct = (p.downloaded as f64) * 100.0 / (t as f64);
			tracing::debug!(%url, done = p.done, "{:.1}/{:.1} MiB ({:.0}%) {:.1} MiB/s", mb(p.downloaded), mb(t), pct, speed);
		}
		_ => {
			tracing::debug!(%url, done = p.done, "{:.1} MiB {:.1} MiB/s", mb(p.downloaded), speed);
		}
	}
}

fn eq_hex(a: &str, b: &str) -> bool {
	a.trim().trim_start_matches("0x").eq_ignore_ascii_case(b.trim().trim_start_matches("0x"))
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn resolve_url_joins_repo_and_file() {
		assert_eq!(
			hf_resolve_url("joelseytre/toonout", "onnx/model.onnx"),
			"https://huggingface.co/joelseytre/toonout/resolve/main/onnx/model.onnx"
		);
		assert_eq!(
			hf_resolve_url("a/b", "/model.onnx"),
			"https://huggingface.co/a/b/resolve/main/model.onnx"
		);
	}

	#[test]
	fn hex_comparison_ignores_case_and_prefix() {
		assert!(eq_hex("0xABCD", "abcd"));
		assert!(!eq_hex("abce", "abcd"));
	}

	#[test]
	fn cached_file_skips_network() {
		let dir = tempfile::tempdir().unwrap();
		let dst = dir.path().join("model.onnx");
		fs::write(&dst, b"weights").unwrap();
		// Unroutable URL: reaching the network would fail the test.
		let used_network = fetch_cached("http://127.0.0.1:9/model.onnx", &dst, None).unwrap();
		assert!(!used_network);
	}
}
