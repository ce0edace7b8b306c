//! Just enough of the PyPI JSON API to find an ONNX Runtime wheel for this platform.

use std::collections::HashMap;

use anyhow::{Context, Result, bail};
use serde::Deserialize;

#[derive(Debug, Deserialize)]
pub struct Project {
	pub info: Info,
	pub releases: HashMap<String, Vec<ReleaseFile>>
}

#[derive(Debug, Deserialize)]
pub struct Info {
	pub version: String
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReleaseFile {
	pub filename: String,
	pub url: String,
	pub packagetype: String,
	pub digests: Digests
}

#[derive(Debug, Clone, Deserialize)]
pub struct Digests {
	pub sha256: String
}

pub fn fetch_project(name: &str) -> Result<Project> {
	let url = format!("https://pypi.org/pypi/{name}/json");
	let mut resp = ureq::get(&url)
		.call()
		.with_context(|| format!("GET {url}"))?;
	let status = resp.status().as_u16();
	if status / 100 != 2 {
		bail!("pypi request failed (HTTP {status}): {url}");
	}
	let body = resp.body_mut().read_to_string().context("read pypi json")?;
	parse_project(&body)
}

fn parse_project(body: &str) -> Result<Project> {
	serde_json::from_str(body).context("parse pypi json")
}

/// Picks the wheel of the latest release matching `os`/`arch`.
pub fn select_wheel<'a>(project: &'a Project, os: &str, arch: &str) -> Result<&'a ReleaseFile> {
	let version = &project.info.version;
	let files = project
		.releases
		.get(version)
		.with_context(|| format!("missing releases entry for version {version}"))?;

	let mut wheels: Vec<&ReleaseFile> = files
		.iter()
		.filter(|f| f.packagetype == "bdist_wheel")
		.collect();
	wheels.sort_by(|a, b| a.filename.cmp(&b.filename));

	wheels
		.into_iter()
		.find(|f| wheel_matches(&f.filename, os, arch))
		.with_context(|| format!("no wheel found for {os}/{arch} in {version}"))
}

// Python tags are irrelevant, only the platform suffix matters.
fn wheel_matches(filename: &str, os: &str, arch: &str) -> bool {
	match (os, arch) {
		("windows", "x86_64") => filename.ends_with("win_amd64.whl"),
		("linux", "x86_64") => filename.ends_with("x86_64.whl") && filename.contains("manylinux"),
		("linux", "aarch64") => filename.ends_with("aarch64.whl") && filename.contains("manylinux"),
		("macos", "aarch64") => filename.ends_with("arm64.whl") && filename.contains("macosx"),
		("macos", "x86_64") => filename.ends_with("x86_64.whl") && filename.contains("macosx"),
		_ => false
	}
}
