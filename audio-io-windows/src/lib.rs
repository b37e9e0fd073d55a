//! # audio-io-windows
//!
//! Windows WASAPI backend for audio-io-core.
//!
//! Provides:
//! - `WasapiBackend`: `AudioBackend` over shared-mode render and capture endpoints
//! - `EndpointEnumerator`: endpoint listing and id resolution via the MMDevice API
//! - `format`: `REFERENCE_TIME`/frame arithmetic (platform independent)
//!
//! ## Platform Requirements
//! - Windows 7+ for `AUDCLNT_STREAMFLAGS_AUTOCONVERTPCM`
//! - Visual Studio Build Tools 2022 + Windows SDK for linking
//!
//! ## Usage
//! ```ignore
//! use std::sync::Arc;
//! use audio_io_core::{AudioEngine, StreamRequest};
//! use audio_io_windows::WasapiBackend;
//!
//! let engine = AudioEngine::new(Arc::new(WasapiBackend::new()));
//! let mut session = engine.negotiate_and_open(&StreamRequest::default(), &[])?;
//! session.start()?;
//! ```

pub mod format;

#[cfg(target_os = "windows")]
mod com;
#[cfg(target_os = "windows")]
pub mod device_enumerator;
#[cfg(target_os = "windows")]
pub mod wasapi_backend;
#[cfg(target_os = "windows")]
mod wasapi_stream;

#[cfg(target_os = "windows")]
pub use device_enumerator::{EndpointEnumerator, EndpointInfo, DEFAULT_INPUT_ID};
#[cfg(target_os = "windows")]
pub use wasapi_backend::{WasapiBackend, WasapiDevice, BACKEND_NAME};
#[cfg(target_os = "windows")]
pub use wasapi_stream::WasapiStream;
