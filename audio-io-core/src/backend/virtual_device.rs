//! In-process software backend.
//!
//! Devices are described by [`DeviceCapabilities`] and their streams are
//! driven either explicitly with [`VirtualBackend::pump`] (one hardware
//! period per call) or by a clock thread started with
//! [`VirtualBackend::with_clock`]. Native buffers are real byte buffers in the
//! negotiated encoding and layout, so the full conversion path is exercised.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;

use crate::models::audio_models::Latency;
use crate::models::capabilities::{BufferSizeRange, DeviceCapabilities};
use crate::models::error::{EngineError, EngineResult};
use crate::models::sample::SampleEncoding;
use crate::processing::audio_buffer::AudioBuffer;
use crate::processing::codec::SampleCodec;
use crate::traits::backend::{
    AudioBackend, DeviceHandle, NativeFormat, NativeStream, StreamCallbacks,
};

pub const BACKEND_NAME: &str = "virtual";

/// Tick used by the clock thread when no stream is running.
const IDLE_TICK: Duration = Duration::from_millis(5);

/// Builder for a virtual device's capabilities.
#[derive(Debug, Clone)]
pub struct VirtualDeviceSpec {
    caps: DeviceCapabilities,
}

impl VirtualDeviceSpec {
    pub fn new(id: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            caps: DeviceCapabilities {
                name: format!("Virtual {}", id),
                id,
                backend: BACKEND_NAME.into(),
                sample_rates: vec![44100, 48000, 96000],
                current_sample_rate: Some(48000),
                encodings: SampleEncoding::PREFERENCE.to_vec(),
                buffer_size: BufferSizeRange::frames(32, 4096),
                max_input_channels: 0,
                max_output_channels: 2,
                supports_interleaved: true,
                supports_non_interleaved: true,
                supports_full_duplex: true,
                supports_aggregation: true,
            },
        }
    }

    pub fn output(id: impl Into<String>, channels: u16) -> Self {
        Self::duplex(id, 0, channels)
    }

    pub fn input(id: impl Into<String>, channels: u16) -> Self {
        Self::duplex(id, channels, 0)
    }

    pub fn duplex(id: impl Into<String>, inputs: u16, outputs: u16) -> Self {
        let mut spec = Self::new(id);
        spec.caps.max_input_channels = inputs;
        spec.caps.max_output_channels = outputs;
        spec
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.caps.name = name.into();
        self
    }

    pub fn sample_rates(mut self, rates: &[u32]) -> Self {
        self.caps.sample_rates = rates.to_vec();
        self
    }

    pub fn current_sample_rate(mut self, rate: Option<u32>) -> Self {
        self.caps.current_sample_rate = rate;
        self
    }

    pub fn encodings(mut self, encodings: &[SampleEncoding]) -> Self {
        self.caps.encodings = encodings.to_vec();
        self
    }

    pub fn buffer_size(mut self, range: BufferSizeRange) -> Self {
        self.caps.buffer_size = range;
        self
    }

    pub fn layouts(mut self, interleaved: bool, non_interleaved: bool) -> Self {
        self.caps.supports_interleaved = interleaved;
        self.caps.supports_non_interleaved = non_interleaved;
        self
    }

    pub fn full_duplex(mut self, supported: bool) -> Self {
        self.caps.supports_full_duplex = supported;
        self
    }

    pub fn aggregation(mut self, supported: bool) -> Self {
        self.caps.supports_aggregation = supported;
        self
    }

    pub fn build(self) -> DeviceCapabilities {
        self.caps
    }
}

struct DeviceSlot {
    caps: DeviceCapabilities,
    open_count: usize,
    realized_frames: Option<u32>,
    input_signal: Option<AudioBuffer>,
    last_output: Option<AudioBuffer>,
}

struct NativeBuffers {
    input: Vec<Vec<u8>>,
    output: Vec<Vec<u8>>,
}

struct StreamCore {
    device_id: String,
    format: NativeFormat,
    frames: u32,
    codec: SampleCodec,
    callbacks: Arc<dyn StreamCallbacks>,
    running: AtomicBool,
    disposed: AtomicBool,
    reported_latency: AtomicBool,
    xrun_index: AtomicU32,
    native: Mutex<NativeBuffers>,
}

impl StreamCore {
    fn is_live(&self) -> bool {
        !self.disposed.load(Ordering::Acquire)
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire) && self.is_live()
    }

    /// Run one period. Returns the decoded output, if the stream has outputs.
    fn pump(&self, frames: usize, signal: Option<&AudioBuffer>) -> Option<AudioBuffer> {
        let mut native = self.native.lock();
        if !self.is_running() {
            return None;
        }
        let inputs = self.format.input_channels as usize;
        let outputs = self.format.output_channels as usize;

        let NativeBuffers { input, output } = &mut *native;
        for (buffers, channels) in [(&mut *input, inputs), (&mut *output, outputs)] {
            let needed = self.codec.native_len(channels, frames);
            for buffer in buffers.iter_mut().filter(|b| b.len() < needed) {
                buffer.resize(needed, 0);
            }
        }
        {
            let mut input_refs: Vec<&mut [u8]> = input.iter_mut().map(|b| b.as_mut_slice()).collect();
            match signal {
                Some(signal) => {
                    self.codec.write(signal, &mut input_refs, frames, inputs);
                }
                None => SampleCodec::silence(&mut input_refs),
            }
        }

        let input_refs: Vec<&[u8]> = input.iter().map(|b| b.as_slice()).collect();
        let mut output_refs: Vec<&mut [u8]> = output.iter_mut().map(|b| b.as_mut_slice()).collect();
        self.callbacks.on_buffer(&input_refs, &mut output_refs, frames);
        self.reported_latency.store(true, Ordering::Release);

        if outputs == 0 {
            return None;
        }
        let output_refs: Vec<&[u8]> = output.iter().map(|b| b.as_slice()).collect();
        let mut decoded = AudioBuffer::new(outputs, frames);
        self.codec.read(&output_refs, &mut decoded, frames, outputs);
        Some(decoded)
    }
}

struct ClockHandle {
    running: Arc<AtomicBool>,
    handle: Option<thread::JoinHandle<()>>,
}

#[derive(Default)]
struct Inner {
    devices: Mutex<BTreeMap<String, DeviceSlot>>,
    default_device: Mutex<Option<String>>,
    streams: Mutex<Vec<Weak<StreamCore>>>,
    clock: Mutex<Option<ClockHandle>>,
}

impl Inner {
    fn streams_for(&self, device_id: Option<&str>) -> Vec<Arc<StreamCore>> {
        let mut streams = self.streams.lock();
        streams.retain(|s| s.upgrade().is_some_and(|s| s.is_live()));
        streams
            .iter()
            .filter_map(Weak::upgrade)
            .filter(|s| device_id.is_none_or(|id| s.device_id == id))
            .collect()
    }

    fn pump_stream(&self, stream: &StreamCore, frames: Option<usize>) -> bool {
        if !stream.is_running() {
            return false;
        }
        let frames = frames.unwrap_or(stream.frames as usize);
        let signal = self
            .devices
            .lock()
            .get(&stream.device_id)
            .and_then(|slot| slot.input_signal.clone());
        let output = stream.pump(frames, signal.as_ref());
        if let Some(output) = output {
            if let Some(slot) = self.devices.lock().get_mut(&stream.device_id) {
                slot.last_output = Some(output);
            }
        }
        true
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Some(clock) = self.clock.get_mut().as_ref() {
            clock.running.store(false, Ordering::SeqCst);
        }
    }
}

/// Software backend for tests, demos and headless hosts.
#[derive(Clone, Default)]
pub struct VirtualBackend {
    inner: Arc<Inner>,
}

impl VirtualBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Backend whose running streams are pumped in real time by a clock thread.
    pub fn with_clock() -> EngineResult<Self> {
        let backend = Self::new();
        backend.start_clock()?;
        Ok(backend)
    }

    pub fn add_device(&self, caps: DeviceCapabilities) -> &Self {
        let id = caps.id.clone();
        self.inner.devices.lock().insert(
            id,
            DeviceSlot {
                caps,
                open_count: 0,
                realized_frames: None,
                input_signal: None,
                last_output: None,
            },
        );
        self
    }

    /// Device `"default"` resolves to. Without one, the first device with outputs.
    pub fn set_default_device(&self, id: &str) {
        *self.inner.default_device.lock() = Some(id.to_string());
    }

    /// Frames per callback that streams opened from now on realise,
    /// regardless of the negotiated size.
    pub fn set_realized_frames(&self, device_id: &str, frames: Option<u32>) {
        if let Some(slot) = self.inner.devices.lock().get_mut(device_id) {
            slot.realized_frames = frames;
        }
    }

    /// Signal fed to every input stream of the device on each period.
    pub fn set_input_signal(&self, device_id: &str, signal: AudioBuffer) {
        if let Some(slot) = self.inner.devices.lock().get_mut(device_id) {
            slot.input_signal = Some(signal);
        }
    }

    /// Output of the most recent period, decoded to float.
    pub fn output_samples(&self, device_id: &str) -> Option<AudioBuffer> {
        self.inner
            .devices
            .lock()
            .get(device_id)
            .and_then(|slot| slot.last_output.clone())
    }

    /// Times `open_device` resolved to this device.
    pub fn open_count(&self, device_id: &str) -> usize {
        self.inner
            .devices
            .lock()
            .get(device_id)
            .map_or(0, |slot| slot.open_count)
    }

    /// Streams opened on the device and not yet disposed.
    pub fn live_streams(&self, device_id: &str) -> usize {
        self.inner.streams_for(Some(device_id)).len()
    }

    /// Callbacks of the device's live streams, for driving them by hand.
    pub fn stream_callbacks(&self, device_id: &str) -> Vec<Arc<dyn StreamCallbacks>> {
        self.inner
            .streams_for(Some(device_id))
            .iter()
            .map(|s| Arc::clone(&s.callbacks))
            .collect()
    }

    /// Run one hardware period on every running stream of the device.
    /// Returns the number of streams pumped.
    pub fn pump(&self, device_id: &str) -> usize {
        self.inner
            .streams_for(Some(device_id))
            .iter()
            .filter(|s| self.inner.pump_stream(s, None))
            .count()
    }

    /// Like [`pump`](Self::pump) but delivers `frames` frames instead of the
    /// realised period size.
    pub fn pump_frames(&self, device_id: &str, frames: usize) -> usize {
        self.inner
            .streams_for(Some(device_id))
            .iter()
            .filter(|s| self.inner.pump_stream(s, Some(frames)))
            .count()
    }

    /// Run one period on every running stream of every device.
    pub fn pump_all(&self) -> usize {
        self.inner
            .streams_for(None)
            .iter()
            .filter(|s| self.inner.pump_stream(s, None))
            .count()
    }

    /// Report an xrun on every live stream of the device.
    pub fn inject_xrun(&self, device_id: &str) -> usize {
        let streams = self.inner.streams_for(Some(device_id));
        for stream in &streams {
            let index = stream.xrun_index.fetch_add(1, Ordering::Relaxed);
            stream.callbacks.on_xrun(index);
        }
        streams.len()
    }

    pub fn start_clock(&self) -> EngineResult<()> {
        let mut clock = self.inner.clock.lock();
        if clock.is_some() {
            return Ok(());
        }
        let running = Arc::new(AtomicBool::new(true));
        let flag = Arc::clone(&running);
        let weak = Arc::downgrade(&self.inner);

        let handle = thread::Builder::new()
            .name("virtual-audio-clock".into())
            .spawn(move || {
                while flag.load(Ordering::SeqCst) {
                    let Some(inner) = weak.upgrade() else {
                        break;
                    };
                    let streams = inner.streams_for(None);
                    let mut tick = IDLE_TICK;
                    for stream in &streams {
                        if inner.pump_stream(stream, None) && stream.format.sample_rate > 0 {
                            let period = Duration::from_secs_f64(
                                stream.frames as f64 / stream.format.sample_rate as f64,
                            );
                            tick = tick.min(period);
                        }
                    }
                    drop(streams);
                    drop(inner);
                    thread::sleep(tick);
                }
            })
            .map_err(|e| EngineError::Backend(format!("failed to spawn clock thread: {}", e)))?;

        *clock = Some(ClockHandle {
            running,
            handle: Some(handle),
        });
        Ok(())
    }

    pub fn stop_clock(&self) {
        let clock = self.inner.clock.lock().take();
        if let Some(mut clock) = clock {
            clock.running.store(false, Ordering::SeqCst);
            if let Some(handle) = clock.handle.take() {
                let _ = handle.join();
            }
        }
    }

    fn resolve(&self, id: &str) -> Option<String> {
        let devices = self.inner.devices.lock();
        if devices.contains_key(id) {
            return Some(id.to_string());
        }
        if id != crate::models::config::DEFAULT_DEVICE_ID {
            return None;
        }
        if let Some(default) = self.inner.default_device.lock().clone() {
            return devices.contains_key(&default).then_some(default);
        }
        devices
            .values()
            .find(|slot| slot.caps.has_output())
            .or_else(|| devices.values().next())
            .map(|slot| slot.caps.id.clone())
    }
}

impl AudioBackend for VirtualBackend {
    fn name(&self) -> &str {
        BACKEND_NAME
    }

    fn device_ids(&self) -> EngineResult<Vec<String>> {
        Ok(self.inner.devices.lock().keys().cloned().collect())
    }

    fn open_device(&self, id: &str) -> EngineResult<Arc<dyn DeviceHandle>> {
        let canonical = self
            .resolve(id)
            .ok_or_else(|| EngineError::DeviceNotFound(id.to_string()))?;
        let mut devices = self.inner.devices.lock();
        let slot = devices
            .get_mut(&canonical)
            .ok_or_else(|| EngineError::DeviceNotFound(id.to_string()))?;
        slot.open_count += 1;
        Ok(Arc::new(VirtualDevice {
            caps: slot.caps.clone(),
            inner: Arc::clone(&self.inner),
        }))
    }
}

struct VirtualDevice {
    caps: DeviceCapabilities,
    inner: Arc<Inner>,
}

impl DeviceHandle for VirtualDevice {
    fn id(&self) -> &str {
        &self.caps.id
    }

    fn capabilities(&self) -> &DeviceCapabilities {
        &self.caps
    }

    fn open_stream(
        &self,
        format: &NativeFormat,
        callbacks: Arc<dyn StreamCallbacks>,
    ) -> EngineResult<Box<dyn NativeStream>> {
        if !self.supports_format(format) {
            return Err(EngineError::StreamOpenFailure(format!(
                "'{}' rejected format {:?}",
                self.caps.id, format
            )));
        }
        if format.frames == 0 || format.input_channels + format.output_channels == 0 {
            return Err(EngineError::StreamOpenFailure(format!(
                "'{}' cannot open an empty stream",
                self.caps.id
            )));
        }

        let frames = self
            .inner
            .devices
            .lock()
            .get(&self.caps.id)
            .and_then(|slot| slot.realized_frames)
            .unwrap_or(format.frames);
        let codec = SampleCodec::new(format.encoding, format.layout);
        let core = Arc::new(StreamCore {
            device_id: self.caps.id.clone(),
            format: *format,
            frames,
            codec,
            callbacks,
            running: AtomicBool::new(false),
            disposed: AtomicBool::new(false),
            reported_latency: AtomicBool::new(false),
            xrun_index: AtomicU32::new(0),
            native: Mutex::new(NativeBuffers {
                input: codec.alloc_native(format.input_channels as usize, frames as usize),
                output: codec.alloc_native(format.output_channels as usize, frames as usize),
            }),
        });
        self.inner.streams.lock().push(Arc::downgrade(&core));

        Ok(Box::new(VirtualStream { core }))
    }
}

struct VirtualStream {
    core: Arc<StreamCore>,
}

impl NativeStream for VirtualStream {
    fn start(&mut self) -> EngineResult<()> {
        if !self.core.is_live() {
            return Err(EngineError::Backend("stream disposed".into()));
        }
        if !self.core.running.swap(true, Ordering::AcqRel) {
            self.core.callbacks.on_running(true, 0);
        }
        Ok(())
    }

    fn stop(&mut self) -> EngineResult<()> {
        if self.core.running.swap(false, Ordering::AcqRel) {
            // Wait out a period in progress.
            drop(self.core.native.lock());
            self.core.callbacks.on_running(false, 0);
        }
        Ok(())
    }

    fn frames_per_buffer(&self) -> u32 {
        self.core.frames
    }

    fn latency(&self) -> Option<Latency> {
        if !self.core.reported_latency.load(Ordering::Acquire) {
            return None;
        }
        let frames = self.core.frames;
        Some(Latency {
            input_frames: if self.core.format.input_channels > 0 { frames } else { 0 },
            output_frames: if self.core.format.output_channels > 0 { frames } else { 0 },
        })
    }
}

impl Drop for VirtualStream {
    fn drop(&mut self) {
        self.core.running.store(false, Ordering::Release);
        self.core.disposed.store(true, Ordering::Release);
        drop(self.core.native.lock());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::sample::SampleLayout;
    use crate::traits::backend::CallbackStatus;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct Echo {
        calls: AtomicUsize,
        xruns: AtomicUsize,
        running: AtomicBool,
    }

    impl StreamCallbacks for Echo {
        fn on_buffer(
            &self,
            input: &[&[u8]],
            output: &mut [&mut [u8]],
            _frames: usize,
        ) -> CallbackStatus {
            self.calls.fetch_add(1, Ordering::SeqCst);
            for (src, dst) in input.iter().zip(output.iter_mut()) {
                dst.copy_from_slice(src);
            }
            CallbackStatus::Processed
        }

        fn on_xrun(&self, _index: u32) {
            self.xruns.fetch_add(1, Ordering::SeqCst);
        }

        fn on_running(&self, running: bool, _error_code: i32) {
            self.running.store(running, Ordering::SeqCst);
        }
    }

    fn format(frames: u32) -> NativeFormat {
        NativeFormat {
            sample_rate: 48000,
            encoding: SampleEncoding::Int16Lsb,
            layout: SampleLayout::Interleaved,
            frames,
            input_channels: 1,
            output_channels: 1,
        }
    }

    #[test]
    fn pump_drives_running_streams_only() {
        let backend = VirtualBackend::new();
        backend.add_device(VirtualDeviceSpec::duplex("card", 1, 1).build());
        let device = backend.open_device("card").unwrap();
        let echo = Arc::new(Echo::default());
        let mut stream = device.open_stream(&format(64), echo.clone()).unwrap();

        assert_eq!(backend.pump("card"), 0);
        stream.start().unwrap();
        assert!(echo.running.load(Ordering::SeqCst));
        assert!(stream.latency().is_none());

        let mut signal = AudioBuffer::new(1, 64);
        signal.fill(0.5);
        backend.set_input_signal("card", signal);
        assert_eq!(backend.pump("card"), 1);

        let out = backend.output_samples("card").unwrap();
        assert!((out.channel(0)[10] - 0.5).abs() < 1e-4);
        assert_eq!(stream.latency().unwrap().output_frames, 64);

        stream.stop().unwrap();
        assert!(!echo.running.load(Ordering::SeqCst));
        assert_eq!(backend.pump("card"), 0);
        assert_eq!(echo.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn realized_frames_override_negotiated() {
        let backend = VirtualBackend::new();
        backend.add_device(VirtualDeviceSpec::duplex("card", 1, 1).build());
        backend.set_realized_frames("card", Some(100));
        let device = backend.open_device("card").unwrap();

        let stream = device.open_stream(&format(64), Arc::new(Echo::default())).unwrap();

        assert_eq!(stream.frames_per_buffer(), 100);
    }

    #[test]
    fn dropped_stream_is_disposed() {
        let backend = VirtualBackend::new();
        backend.add_device(VirtualDeviceSpec::duplex("card", 1, 1).build());
        let device = backend.open_device("card").unwrap();
        let echo = Arc::new(Echo::default());
        let mut stream = device.open_stream(&format(64), echo.clone()).unwrap();
        stream.start().unwrap();
        assert_eq!(backend.live_streams("card"), 1);

        drop(stream);

        assert_eq!(backend.live_streams("card"), 0);
        assert_eq!(backend.pump("card"), 0);
        assert_eq!(backend.inject_xrun("card"), 0);
    }

    #[test]
    fn unsupported_format_fails_to_open() {
        let backend = VirtualBackend::new();
        backend.add_device(VirtualDeviceSpec::output("out", 2).sample_rates(&[44100]).build());
        let device = backend.open_device("out").unwrap();

        let err = device
            .open_stream(&format(64), Arc::new(Echo::default()))
            .err()
            .unwrap();

        assert!(matches!(err, EngineError::StreamOpenFailure(_)));
    }

    #[test]
    fn default_resolves_to_first_output_device() {
        let backend = VirtualBackend::new();
        backend.add_device(VirtualDeviceSpec::input("a-mic", 1).build());
        backend.add_device(VirtualDeviceSpec::output("b-speakers", 2).build());

        let device = backend.open_device("default").unwrap();

        assert_eq!(device.id(), "b-speakers");
        assert!(matches!(
            backend.open_device("nope"),
            Err(EngineError::DeviceNotFound(_))
        ));
    }

    #[test]
    fn clock_pumps_running_streams() {
        let backend = VirtualBackend::with_clock().unwrap();
        backend.add_device(VirtualDeviceSpec::duplex("card", 1, 1).build());
        let device = backend.open_device("card").unwrap();
        let echo = Arc::new(Echo::default());
        let mut stream = device.open_stream(&format(48), echo.clone()).unwrap();
        stream.start().unwrap();

        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while echo.calls.load(Ordering::SeqCst) < 3 && std::time::Instant::now() < deadline {
            thread::sleep(Duration::from_millis(1));
        }

        stream.stop().unwrap();
        backend.stop_clock();
        assert!(echo.calls.load(Ordering::SeqCst) >= 3);
    }
}
