//! Background removal for a serverless worker.
//!
//! [`handler::Handler`] takes a host event (`{"input": {"image": ..., "return_mask": ...}}`)
//! and always answers with exactly one of `image`, `mask` or `error`. The primary model
//! (ToonOut, a BiRefNet fine-tune exported to ONNX) is provisioned lazily on the first
//! request; when it cannot be obtained the worker keeps serving through a rembg-style
//! fallback instead of failing.

pub mod birefnet;
pub mod cli;
pub mod codec;
pub mod config;
pub mod download;
pub mod error;
pub mod fallback;
pub mod handler;
pub mod pipeline;
pub mod provision;
pub mod pypi;
pub mod runtime;
pub mod u2net;

pub use error::{Result, WorkerError};
pub use handler::{Handler, Request, Response};
