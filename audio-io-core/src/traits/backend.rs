use std::sync::Arc;

use serde::Serialize;

use crate::models::audio_models::Latency;
use crate::models::capabilities::{BufferSizeRange, BufferUnit, DeviceCapabilities};
use crate::models::config::StreamConfig;
use crate::models::error::EngineResult;
use crate::models::sample::{Direction, SampleEncoding, SampleLayout};

/// Format a native stream is opened with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct NativeFormat {
    pub sample_rate: u32,
    pub encoding: SampleEncoding,
    pub layout: SampleLayout,
    /// Negotiated frames per callback. The stream may realise a different count.
    pub frames: u32,
    pub input_channels: u16,
    pub output_channels: u16,
}

impl NativeFormat {
    pub fn from_config(config: &StreamConfig) -> Self {
        Self {
            sample_rate: config.sample_rate,
            encoding: config.encoding,
            layout: config.layout,
            frames: config.frames_per_buffer(),
            input_channels: config.input_channels,
            output_channels: config.output_channels,
        }
    }
}

/// Status returned from [`StreamCallbacks::on_buffer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackStatus {
    /// Output buffers hold processed audio.
    Processed,
    /// Output buffers hold silence (reentrant call, stopped session or fault).
    Silenced,
}

/// Entry points a native stream calls on its realtime thread.
///
/// Implementations must not block, allocate in steady state, or panic.
pub trait StreamCallbacks: Send + Sync {
    /// One hardware period. `input` and `output` follow the stream's
    /// [`SampleLayout`]: one buffer when interleaved, one per channel otherwise.
    fn on_buffer(&self, input: &[&[u8]], output: &mut [&mut [u8]], frames: usize)
        -> CallbackStatus;

    /// The hardware missed a deadline.
    fn on_xrun(&self, index: u32);

    /// The hardware started or stopped producing interrupts.
    fn on_running(&self, running: bool, error_code: i32);
}

/// An opened native stream. Dropping it disposes the native handle.
pub trait NativeStream: Send {
    fn start(&mut self) -> EngineResult<()>;

    fn stop(&mut self) -> EngineResult<()>;

    /// Frames per callback as realised by the backend. Only reliable after open.
    fn frames_per_buffer(&self) -> u32;

    /// `None` until the backend has reported latency.
    fn latency(&self) -> Option<Latency>;
}

/// An opened device.
pub trait DeviceHandle: Send + Sync {
    /// Canonical device id. May differ from the id the device was opened with.
    fn id(&self) -> &str;

    /// Captured once when the device was opened.
    fn capabilities(&self) -> &DeviceCapabilities;

    fn channel_count(&self, direction: Direction) -> u16 {
        self.capabilities().max_channels(direction)
    }

    fn supports_format(&self, format: &NativeFormat) -> bool {
        let caps = self.capabilities();
        caps.supports_rate(format.sample_rate)
            && caps.supports_encoding(format.encoding)
            && caps.supports_layout(format.layout)
            && format.input_channels <= self.channel_count(Direction::Input)
            && format.output_channels <= self.channel_count(Direction::Output)
    }

    /// Frames-per-callback range for `format`, in frames at its sample rate.
    fn buffer_size(&self, format: &NativeFormat) -> BufferSizeRange {
        let range = self.capabilities().buffer_size;
        let to_frames = |size| range.unit.to_frames(size, format.sample_rate);
        BufferSizeRange {
            min: to_frames(range.min),
            max: to_frames(range.max),
            current: to_frames(range.current),
            unit: BufferUnit::Frames,
        }
    }

    fn open_stream(
        &self,
        format: &NativeFormat,
        callbacks: Arc<dyn StreamCallbacks>,
    ) -> EngineResult<Box<dyn NativeStream>>;
}

/// A vendor audio API.
pub trait AudioBackend: Send + Sync {
    fn name(&self) -> &str;

    /// Ids of the devices currently present.
    fn device_ids(&self) -> EngineResult<Vec<String>>;

    fn open_device(&self, id: &str) -> EngineResult<Arc<dyn DeviceHandle>>;
}
