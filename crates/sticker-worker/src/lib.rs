//! Web worker entry point for sticker processing.
//!
//! This crate compiles to a standalone WASM module that runs inside a
//! `Worker`. It receives image bytes, matte bytes and `StickerOptions`
//! via `postMessage`, runs the sticker pipeline, and posts the PNG back.
//!
//! Image data travels as raw `Uint8Array` buffers; only the options and
//! errors are JSON strings. Running in a worker keeps the page's main
//! thread free while the pipeline blocks this one.

use sticker_pipeline::{
    BackendPreference, MatteImage, NoCheckpoint, PipelineConfig, StickerError, StickerOptions,
    StickerOutput, StickerPipeline,
};
use wasm_bindgen::JsCast;
use wasm_bindgen::prelude::*;

/// One decoded request from the main thread.
struct Request {
    image_bytes: Vec<u8>,
    matte_bytes: Vec<u8>,
    options: StickerOptions,
}

impl Request {
    fn from_js(data: &JsValue) -> Result<Self, StickerError> {
        let options_json = field(data, "optionsJson")?
            .as_string()
            .ok_or_else(|| StickerError::InvalidOptions("optionsJson is not a string".into()))?;
        let options = serde_json::from_str(&options_json)
            .map_err(|e| StickerError::InvalidOptions(format!("failed to parse options: {e}")))?;
        Ok(Self {
            image_bytes: bytes_field(data, "imageBytes")?,
            matte_bytes: bytes_field(data, "matteBytes")?,
            options,
        })
    }
}

fn field(data: &JsValue, name: &str) -> Result<JsValue, StickerError> {
    js_sys::Reflect::get(data, &JsValue::from_str(name))
        .map_err(|_| StickerError::InvalidOptions(format!("missing {name} field")))
}

fn bytes_field(data: &JsValue, name: &str) -> Result<Vec<u8>, StickerError> {
    field(data, name)?
        .dyn_into::<js_sys::Uint8Array>()
        .map(|array| array.to_vec())
        .map_err(|_| StickerError::InvalidOptions(format!("{name} is not a Uint8Array")))
}

/// Message protocol: the main thread sends a JS object with:
/// - `imageBytes`: `Uint8Array` containing the photo (PNG or JPEG)
/// - `matteBytes`: `Uint8Array` containing the matte (PNG or JPEG)
/// - `optionsJson`: `String` containing JSON-serialized `StickerOptions`
/// - `generation`: `f64` generation counter (passed through to response)
///
/// On success the worker responds with a JS object containing:
/// - `generation`: `f64` matching the request generation
/// - `ok`: `true`
/// - `pngBytes`: `Uint8Array` with the sticker PNG
/// - `width`, `height`: `f64`
/// - `backend`: `String` naming the backend that ran
///
/// On error the worker responds with:
/// - `generation`: `f64`
/// - `ok`: `false`
/// - `errorJson`: `String` with the JSON-serialized `StickerError`
///
/// # Worker entry point
///
/// Called automatically when the WASM module is instantiated in the
/// worker context.
#[wasm_bindgen(start)]
pub fn worker_main() {
    console_error_panic_hook::set_once();

    let global: web_sys::DedicatedWorkerGlobalScope = js_sys::global()
        .dyn_into()
        .expect_throw("not running in a DedicatedWorkerGlobalScope");

    // No threads in the browser; caches persist across messages.
    let pipeline = StickerPipeline::new(PipelineConfig {
        backend: BackendPreference::Portable,
        ..PipelineConfig::default()
    })
    .expect_throw("invalid worker pipeline config");

    let onmessage =
        Closure::<dyn FnMut(web_sys::MessageEvent)>::new(move |event: web_sys::MessageEvent| {
            handle_message(&pipeline, &event);
        });
    global.set_onmessage(Some(onmessage.as_ref().unchecked_ref()));
    onmessage.forget(); // lives for the worker lifetime
}

/// Run one request and post the outcome back.
fn handle_message(pipeline: &StickerPipeline, event: &web_sys::MessageEvent) {
    let data = event.data();
    let generation = field(&data, "generation")
        .ok()
        .and_then(|v| v.as_f64())
        .expect_throw("generation is not a number");

    let outcome = Request::from_js(&data).and_then(|request| {
        let matte = decode_matte(&request.matte_bytes)?;
        pipeline.make_sticker(&request.image_bytes, &request.options, &matte, &mut NoCheckpoint)
    });

    match outcome {
        Ok(output) => post_success(generation, &output),
        Err(e) => post_error(generation, &e),
    }
}

/// Decode the matte, tagging failures so they are not mistaken for a
/// bad photo.
fn decode_matte(bytes: &[u8]) -> Result<MatteImage, StickerError> {
    MatteImage::from_bytes(bytes)
        .map_err(|e| StickerError::UpstreamMaskFailure(format!("matteBytes: {e}")))
}

fn post_success(generation: f64, output: &StickerOutput) {
    let response = js_sys::Object::new();
    set(&response, "generation", &JsValue::from_f64(generation));
    set(&response, "ok", &JsValue::from_bool(true));
    set(
        &response,
        "pngBytes",
        &js_sys::Uint8Array::from(output.png.as_slice()),
    );
    set(
        &response,
        "width",
        &JsValue::from_f64(f64::from(output.dimensions.width)),
    );
    set(
        &response,
        "height",
        &JsValue::from_f64(f64::from(output.dimensions.height)),
    );
    set(
        &response,
        "backend",
        &JsValue::from_str(&output.backend.to_string()),
    );
    post(&response);
}

fn post_error(generation: f64, error: &StickerError) {
    let error_json = serde_json::to_string(error)
        .unwrap_or_else(|ser_err| format!("\"serialization error: {ser_err}\""));
    let response = js_sys::Object::new();
    set(&response, "generation", &JsValue::from_f64(generation));
    set(&response, "ok", &JsValue::from_bool(false));
    set(&response, "errorJson", &JsValue::from_str(&error_json));
    post(&response);
}

fn set(target: &js_sys::Object, key: &str, value: &JsValue) {
    if js_sys::Reflect::set(target, &JsValue::from_str(key), value).is_err() {
        web_sys::console::warn_1(&JsValue::from_str(&format!("failed to set {key}")));
    }
}

fn post(response: &js_sys::Object) {
    let posted = js_sys::global()
        .dyn_into::<web_sys::DedicatedWorkerGlobalScope>()
        .map_err(JsValue::from)
        .and_then(|global| global.post_message(response));
    if let Err(e) = posted {
        web_sys::console::error_2(&JsValue::from_str("failed to postMessage"), &e);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;

    #[test]
    fn empty_matte_is_reported_as_mask_failure() {
        let err = decode_matte(&[]).unwrap_err();
        assert_eq!(
            err,
            StickerError::UpstreamMaskFailure(format!("matteBytes: {}", StickerError::EmptyInput))
        );
    }

    #[test]
    fn unrecognized_matte_names_the_matte() {
        match decode_matte(b"GIF89a").unwrap_err() {
            StickerError::UpstreamMaskFailure(message) => {
                assert!(message.starts_with("matteBytes: "), "{message}");
            }
            other => panic!("expected UpstreamMaskFailure, got {other:?}"),
        }
    }
}
