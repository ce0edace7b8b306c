use std::any::Any;

use thiserror::Error;

use crate::codec::DecodeError;

pub const MISSING_IMAGE: &str = "Missing 'image' (base64)";

/// Failures surfaced to the host as `{"error": ...}`.
///
/// Provisioning problems never show up here: they degrade to the fallback backend.
#[derive(Debug, Error)]
pub enum WorkerError {
	#[error("{0}")]
	Validation(String),
	#[error("BiRef inference failed: {0}")]
	Decode(#[from] DecodeError),
	#[error("BiRef inference failed: {0:#}")]
	Inference(anyhow::Error),
	#[error("BiRef inference failed: {0:#}")]
	Encode(anyhow::Error)
}

impl WorkerError {
	pub fn missing_image() -> Self {
		WorkerError::Validation(MISSING_IMAGE.to_string())
	}
}

pub type Result<T> = std::result::Result<T, WorkerError>;

/// Text of a `panic!` payload caught with `catch_unwind`.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> &str {
	if let Some(s) = payload.downcast_ref::<&str>() {
		s
	} else if let Some(s) = payload.downcast_ref::<String>() {
		s.as_str()
	} else {
		"unknown panic"
	}
}
