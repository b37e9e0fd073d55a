//! # audio-io-core
//!
//! Platform-agnostic realtime audio I/O engine.
//!
//! Negotiates a format against a device's advertised capabilities, builds the
//! stream topology that can serve the request, and runs a callback session
//! that converts native sample buffers to planar f32, fans each hardware
//! period out to every registered consumer and sums their output.
//! Platform backends (Windows WASAPI, the in-process virtual backend)
//! implement the `AudioBackend` trait and plug into `AudioEngine`.
//!
//! ## Architecture
//!
//! ```text
//! audio-io-core (this crate)
//! ├── traits/       ← AudioBackend, DeviceHandle, NativeStream, StreamCallbacks,
//! │                   AudioConsumer, SessionDelegate
//! ├── models/       ← EngineError, SessionState, StreamRequest, StreamConfig,
//! │                   DeviceCapabilities, FaultRecord, SessionReport
//! ├── processing/   ← AudioBuffer, SampleCodec
//! ├── topology/     ← negotiator, plan_topology, StreamTopology
//! ├── session/      ← Session, CallbackFanout, CallbackGuard
//! ├── backend/      ← DeviceRegistry, VirtualBackend
//! └── engine        ← AudioEngine (negotiate_and_open)
//! ```
//!
//! ## Data flow
//!
//! ```text
//! StreamRequest ─→ negotiate ─→ StreamConfig ─→ plan_topology ─→ Session::open
//!
//! hardware period:
//! [native input] ─→ SampleCodec::read ─→ AudioBuffer ─→ CallbackFanout ─→ AudioBuffer
//!                                                                          │
//! [native output] ←─────────────── SampleCodec::write ←────────────────────┘
//! ```

pub mod backend;
pub mod engine;
pub mod models;
pub mod processing;
pub mod session;
pub mod topology;
pub mod traits;

// Re-export key types at crate root for convenience.
pub use backend::registry::{DeviceLease, DeviceRegistry};
pub use backend::virtual_device::{VirtualBackend, VirtualDeviceSpec};
pub use engine::{AudioEngine, PendingSession};
pub use models::audio_models::{Latency, ProcessFormat, SessionReport, TopologyKind};
pub use models::capabilities::{BufferSizeRange, BufferUnit, DeviceCapabilities};
pub use models::config::{StreamConfig, StreamRequest, DEFAULT_DEVICE_ID};
pub use models::error::{EngineError, EngineResult};
pub use models::fault::{FaultKind, FaultRecord};
pub use models::sample::{Direction, SampleEncoding, SampleLayout};
pub use models::state::SessionState;
pub use processing::audio_buffer::AudioBuffer;
pub use processing::codec::SampleCodec;
pub use session::audio_session::Session;
pub use session::fanout::{CallbackFanout, FanoutOutcome};
pub use session::guard::CallbackGuard;
pub use topology::negotiator::{
    choose_buffer_size, choose_layout, choose_sample_encoding, choose_sample_rate, negotiate,
};
pub use topology::plan::{plan_topology, LegPlan, LegRole, ResolvedDevice, TopologyPlan};
pub use topology::stream::{open_topology, StreamTopology};
pub use traits::backend::{
    AudioBackend, CallbackStatus, DeviceHandle, NativeFormat, NativeStream, StreamCallbacks,
};
pub use traits::consumer::AudioConsumer;
pub use traits::session_delegate::SessionDelegate;
