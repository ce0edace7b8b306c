use std::io::{self, BufRead, Write};

use anyhow::{Context, Result};
use clap::Parser;
use serde_json::Value;
use tracing_subscriber::EnvFilter;

use toonout_worker::{Handler, Response, cli};

fn main() {
	// Stdout carries responses only; logs go to stderr.
	tracing_subscriber::fmt()
		.with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
		.with_writer(io::stderr)
		.init();

	if let Err(e) = run() {
		eprintln!("{e:#}");
		std::process::exit(1);
	}
}

fn run() -> Result<()> {
	let args = cli::Args::parse();
	let handler = Handler::from_env();

	if args.preload {
		let state = handler.pipeline().provisioner().get_or_load();
		tracing::info!(fallback = state.is_fallback(), "model preloaded");
	}

	let stdout = io::stdout();
	let mut out = stdout.lock();

	if let Some(path) = args.request.as_deref() {
		let text = std::fs::read_to_string(path).with_context(|| format!("read request: {}", path.display()))?;
		let event: Value = serde_json::from_str(&text).with_context(|| format!("parse request: {}", path.display()))?;
		return write_response(&mut out, &handler.handle(&event));
	}

	for line in io::stdin().lock().lines() {
		let line = line.context("read stdin")?;
		if line.trim().is_empty() {
			continue;
		}
		let response = match serde_json::from_str::<Value>(&line) {
			Ok(event) => handler.handle(&event),
			Err(e) => Response::Error(format!("invalid request JSON: {e}"))
		};
		write_response(&mut out, &response)?;
	}
	Ok(())
}

fn write_response(out: &mut impl Write, response: &Response) -> Result<()> {
	serde_json::to_writer(&mut *out, response).context("write response")?;
	writeln!(out).context("write response")?;
	out.flush().context("flush stdout")
}
