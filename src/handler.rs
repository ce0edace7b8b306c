use std::{
	panic::{self, AssertUnwindSafe},
	time::Instant
};

use anyhow::anyhow;
use serde::Serialize;
use serde_json::Value;

use crate::{
	birefnet::OrtLibrary,
	codec,
	config::{Device, Settings},
	error::{Result, WorkerError, panic_message},
	fallback::RembgBackend,
	pipeline::Pipeline,
	provision::{ModelLibrary, Provisioner}
};

/// Exactly one key: `image`, `mask` or `error`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Response {
	Image(String),
	Mask(String),
	Error(String)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
	pub image: String,
	pub return_mask: bool
}

impl Request {
	/// Reads `input.image` and `input.return_mask` from a host event.
	pub fn from_event(event: &Value) -> Result<Self> {
		let input = event.get("input").filter(|v| v.is_object());
		let field = |name: &str| input.and_then(|i| i.get(name));

		let image = match field("image") {
			None | Some(Value::Null) => return Err(WorkerError::missing_image()),
			Some(Value::String(s)) if s.is_empty() => return Err(WorkerError::missing_image()),
			Some(Value::String(s)) => s.clone(),
			Some(_) => return Err(WorkerError::Validation("'image' must be a base64 string".to_string()))
		};

		Ok(Self {
			image,
			return_mask: field("return_mask").is_some_and(truthy)
		})
	}
}

// JSON analogue of Python truthiness.
fn truthy(v: &Value) -> bool {
	match v {
		Value::Null => false,
		Value::Bool(b) => *b,
		Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
		Value::String(s) => !s.is_empty(),
		Value::Array(a) => !a.is_empty(),
		Value::Object(o) => !o.is_empty()
	}
}

pub struct Handler<L: ModelLibrary> {
	pipeline: Pipeline<L>
}

impl Handler<OrtLibrary> {
	/// ONNX Runtime primary model with the rembg fallback, configured from the environment.
	pub fn from_env() -> Self {
		Self::from_settings(&Settings::from_env())
	}

	pub fn from_settings(settings: &Settings) -> Self {
		let device = Device::selected();
		let library = OrtLibrary::new(device, settings.model.input_size);
		let provisioner = Provisioner::new(library, settings, device);
		let fallback = RembgBackend::new(settings.cache_dir.clone(), device);
		Self::new(Pipeline::new(provisioner, Box::new(fallback)))
	}
}

impl<L: ModelLibrary> Handler<L> {
	pub fn new(pipeline: Pipeline<L>) -> Self {
		Self { pipeline }
	}

	pub fn pipeline(&self) -> &Pipeline<L> {
		&self.pipeline
	}

	/// Never fails: every error, panics included, becomes `Response::Error`.
	pub fn handle(&self, event: &Value) -> Response {
		let start = Instant::now();
		let result = Request::from_event(event).and_then(|request| {
			panic::catch_unwind(AssertUnwindSafe(|| self.process(&request)))
				.unwrap_or_else(|payload| Err(WorkerError::Inference(anyhow!("panicked: {}", panic_message(payload.as_ref())))))
		});

		match result {
			Ok(response) => {
				tracing::debug!(ms = start.elapsed().as_millis() as u64, "request handled");
				response
			}
			Err(e) => {
				tracing::warn!("request failed: {e}");
				Response::Error(e.to_string())
			}
		}
	}

	fn process(&self, request: &Request) -> Result<Response> {
		let img = codec::decode(&request.image)?;
		tracing::debug!(width = img.width(), height = img.height(), return_mask = request.return_mask, "decoded input");

		let rgba = self.pipeline.infer(img).map_err(WorkerError::Inference)?;

		if request.return_mask {
			let mask = codec::extract_alpha(&rgba);
			codec::encode_mask(&mask)
				.map(Response::Mask)
				.map_err(WorkerError::Encode)
		} else {
			codec::encode_rgba(&rgba)
				.map(Response::Image)
				.map_err(WorkerError::Encode)
		}
	}
}
