use std::path::PathBuf;

use clap::Parser;

#[derive(Debug, Parser)]
#[command(name = "toonout-worker", version, about = "Background removal worker: JSON events in, JSON results out")]
pub struct Args {
	/// Handle the single event in this JSON file instead of reading events from stdin.
	#[arg(short, long)]
	pub request: Option<PathBuf>,

	/// Resolve the model before reading the first event.
	#[arg(long)]
	pub preload: bool
}
