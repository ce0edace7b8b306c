use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::{Result, bail};
use base64::{Engine as _, engine::general_purpose::STANDARD};
use image::{DynamicImage, GenericImageView, ImageFormat, Rgb, RgbImage};
use ndarray::{ArrayD, ArrayView4, IxDyn};
use serde_json::{Value, json};

use toonout_worker::{
	Handler, Response,
	config::{Device, Settings},
	fallback::ColorKeyRemover,
	pipeline::Pipeline,
	provision::{Checkpoint, LoadReport, ModelConfig, ModelLibrary, Provisioner, RawOutput, SegmentationNetwork}
};

// Left half foreground (high logit), right half background.
struct HalfNet {
	panic: bool
}

impl SegmentationNetwork for HalfNet {
	fn input_size(&self) -> Option<u32> {
		None
	}

	fn forward(&self, input: ArrayView4<'_, f32>) -> Result<RawOutput> {
		if self.panic {
			panic!("kernel exploded");
		}
		let (h, w) = (input.shape()[2], input.shape()[3]);
		let pred = ArrayD::from_shape_fn(IxDyn(&[1, 1, h, w]), |ix| if ix[3] < w / 2 { 20.0 } else { -20.0 });
		Ok(RawOutput::Map(vec![("aux".into(), RawOutput::Tensor(pred.clone())), ("pred".into(), RawOutput::Tensor(pred))]))
	}
}

struct MockLibrary {
	available: bool,
	panic: bool,
	entry_calls: AtomicUsize,
	fetch_calls: AtomicUsize
}

impl MockLibrary {
	fn new(available: bool) -> Self {
		Self {
			available,
			panic: false,
			entry_calls: AtomicUsize::new(0),
			fetch_calls: AtomicUsize::new(0)
		}
	}
}

impl ModelLibrary for MockLibrary {
	type Builder = ();
	type Weights = PathBuf;
	type Network = HalfNet;

	fn entry_point(&self) -> Result<()> {
		self.entry_calls.fetch_add(1, Ordering::SeqCst);
		if !self.available {
			bail!("onnx runtime not installed");
		}
		Ok(())
	}

	fn fetch(&self, _repo_id: &str, filename: &str, cache_dir: &Path) -> Result<PathBuf> {
		self.fetch_calls.fetch_add(1, Ordering::SeqCst);
		Ok(cache_dir.join(filename))
	}

	fn construct(&self, _config: ModelConfig, _device: Device) -> Result<()> {
		Ok(())
	}

	fn read_checkpoint(&self, path: &Path) -> Result<Checkpoint<PathBuf>> {
		Ok(Checkpoint::Wrapped {
			state_dict: path.to_path_buf()
		})
	}

	fn load_weights(&self, _builder: (), _weights: PathBuf) -> Result<(HalfNet, LoadReport)> {
		Ok((HalfNet { panic: self.panic }, LoadReport::default()))
	}

	fn prepare(&self, network: HalfNet, _device: Device) -> Result<HalfNet> {
		Ok(network)
	}
}

fn handler(library: MockLibrary) -> (Handler<MockLibrary>, tempfile::TempDir) {
	let dir = tempfile::tempdir().unwrap();
	let settings = Settings::with_cache_dir(dir.path());
	let provisioner = Provisioner::new(library, &settings, Device::Cpu);
	let pipeline = Pipeline::new(provisioner, Box::new(ColorKeyRemover::default()));
	(Handler::new(pipeline), dir)
}

fn library(h: &Handler<MockLibrary>) -> &MockLibrary {
	h.pipeline().provisioner().library()
}

fn opaque_jpeg_b64(w: u32, h: u32) -> String {
	// Subject in the middle of a white canvas.
	let img = RgbImage::from_fn(w, h, |x, y| {
		if (w / 4..3 * w / 4).contains(&x) && (h / 4..3 * h / 4).contains(&y) {
			Rgb([20, 60, 200])
		} else {
			Rgb([255, 255, 255])
		}
	});
	let mut buf = Vec::new();
	DynamicImage::ImageRgb8(img)
		.write_to(&mut Cursor::new(&mut buf), ImageFormat::Jpeg)
		.unwrap();
	STANDARD.encode(&buf)
}

fn decode_png(b64: &str) -> DynamicImage {
	let bytes = STANDARD.decode(b64).unwrap();
	assert_eq!(image::guess_format(&bytes).unwrap(), ImageFormat::Png);
	image::load_from_memory(&bytes).unwrap()
}

fn event(image: &str, return_mask: Option<bool>) -> Value {
	match return_mask {
		Some(m) => json!({ "input": { "image": image, "return_mask": m } }),
		None => json!({ "input": { "image": image } })
	}
}

#[test]
fn missing_image_never_touches_the_model() {
	let (h, _dir) = handler(MockLibrary::new(true));
	assert_eq!(h.handle(&json!({ "input": {} })), Response::Error("Missing 'image' (base64)".into()));
	assert_eq!(h.handle(&json!({})), Response::Error("Missing 'image' (base64)".into()));
	assert_eq!(library(&h).entry_calls.load(Ordering::SeqCst), 0);
	assert_eq!(library(&h).fetch_calls.load(Ordering::SeqCst), 0);
}

#[test]
fn fallback_returns_rgba_image_of_input_size() {
	let (h, _dir) = handler(MockLibrary::new(false));
	let Response::Image(b64) = h.handle(&event(&opaque_jpeg_b64(100, 100), Some(false))) else {
		panic!("expected an image response");
	};
	let out = decode_png(&b64);
	assert!(matches!(out, DynamicImage::ImageRgba8(_)));
	assert_eq!(out.dimensions(), (100, 100));
	// White corners are keyed out.
	assert_eq!(out.to_rgba8().get_pixel(0, 0)[3], 0);
	assert!(h.pipeline().provisioner().get_or_load().is_fallback());
}

#[test]
fn fallback_mask_is_single_channel() {
	let (h, _dir) = handler(MockLibrary::new(false));
	let Response::Mask(b64) = h.handle(&event(&opaque_jpeg_b64(100, 100), Some(true))) else {
		panic!("expected a mask response");
	};
	let mask = decode_png(&b64);
	assert!(matches!(mask, DynamicImage::ImageLuma8(_)));
	assert_eq!(mask.dimensions(), (100, 100));
}

#[test]
fn loaded_model_alpha_follows_prediction() {
	let (h, _dir) = handler(MockLibrary::new(true));
	let Response::Mask(b64) = h.handle(&event(&opaque_jpeg_b64(64, 32), Some(true))) else {
		panic!("expected a mask response");
	};
	let mask = decode_png(&b64).to_luma8();
	assert_eq!(mask.dimensions(), (64, 32));
	assert_eq!(mask.get_pixel(0, 0)[0], 255);
	assert_eq!(mask.get_pixel(63, 31)[0], 0);
}

#[test]
fn loaded_model_preserves_colors() {
	let (h, _dir) = handler(MockLibrary::new(true));
	let payload = opaque_jpeg_b64(40, 40);
	let input = image::load_from_memory(&STANDARD.decode(&payload).unwrap()).unwrap().to_rgb8();

	let Response::Image(b64) = h.handle(&event(&payload, None)) else {
		panic!("expected an image response");
	};
	let out = decode_png(&b64).to_rgba8();
	for (x, y, p) in out.enumerate_pixels() {
		assert_eq!(&p.0[..3], &input.get_pixel(x, y).0[..]);
	}
}

#[test]
fn model_is_provisioned_once_across_requests() {
	let (h, _dir) = handler(MockLibrary::new(true));
	let payload = opaque_jpeg_b64(8, 8);
	for _ in 0..3 {
		assert!(matches!(h.handle(&event(&payload, None)), Response::Image(_)));
	}
	assert_eq!(library(&h).entry_calls.load(Ordering::SeqCst), 1);
	assert_eq!(library(&h).fetch_calls.load(Ordering::SeqCst), 1);
}

#[test]
fn data_uri_without_padding_is_accepted() {
	let (h, _dir) = handler(MockLibrary::new(false));
	let payload = format!("data:image/jpeg;base64,{}", opaque_jpeg_b64(30, 20).trim_end_matches('='));
	let Response::Image(b64) = h.handle(&event(&payload, None)) else {
		panic!("expected an image response");
	};
	assert_eq!(decode_png(&b64).dimensions(), (30, 20));
}

#[test]
fn undecodable_payload_is_an_error_response() {
	let (h, _dir) = handler(MockLibrary::new(true));
	let Response::Error(msg) = h.handle(&event(&STANDARD.encode(b"plain text"), None)) else {
		panic!("expected an error response");
	};
	assert!(msg.starts_with("BiRef inference failed: "), "{msg}");
}

#[test]
fn panicking_model_becomes_an_error_response() {
	let mut lib = MockLibrary::new(true);
	lib.panic = true;
	let (h, _dir) = handler(lib);
	let Response::Error(msg) = h.handle(&event(&opaque_jpeg_b64(8, 8), None)) else {
		panic!("expected an error response");
	};
	assert!(msg.contains("kernel exploded"), "{msg}");
}
