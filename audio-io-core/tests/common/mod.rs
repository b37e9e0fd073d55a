#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use audio_io_core::{
    AudioBuffer, AudioConsumer, AudioEngine, EngineError, FaultRecord, ProcessFormat,
    SessionDelegate, SessionState, VirtualBackend,
};
use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;

pub fn engine_with(backend: &VirtualBackend) -> AudioEngine {
    AudioEngine::new(Arc::new(backend.clone()))
}

/// Writes a fixed value to every output sample.
#[derive(Default)]
pub struct Constant {
    pub value: f32,
    pub prepared: Mutex<Option<ProcessFormat>>,
    pub stopped: AtomicUsize,
    pub calls: AtomicUsize,
}

impl Constant {
    pub fn new(value: f32) -> Arc<Self> {
        Arc::new(Self {
            value,
            ..Default::default()
        })
    }
}

impl AudioConsumer for Constant {
    fn prepare(&self, format: &ProcessFormat) {
        *self.prepared.lock() = Some(*format);
    }

    fn process(&self, _input: &AudioBuffer, output: &mut AudioBuffer) {
        self.calls.fetch_add(1, Ordering::SeqCst);
        output.fill(self.value);
    }

    fn stopped(&self) {
        self.stopped.fetch_add(1, Ordering::SeqCst);
    }
}

/// Copies input channels to the matching output channels.
pub struct PassThrough;

impl AudioConsumer for PassThrough {
    fn prepare(&self, _format: &ProcessFormat) {}

    fn process(&self, input: &AudioBuffer, output: &mut AudioBuffer) {
        output.copy_from(input);
    }

    fn stopped(&self) {}
}

/// Copies input channel `channel` to every output channel.
pub struct Monitor {
    pub channel: usize,
}

impl AudioConsumer for Monitor {
    fn prepare(&self, _format: &ProcessFormat) {}

    fn process(&self, input: &AudioBuffer, output: &mut AudioBuffer) {
        if self.channel >= input.channel_count() {
            return;
        }
        let source = input.channel(self.channel);
        for out in output.channels_mut() {
            let frames = out.len().min(source.len());
            out[..frames].copy_from_slice(&source[..frames]);
        }
    }

    fn stopped(&self) {}
}

/// Writes a sine at `frequency` Hz, continuing its phase across callbacks.
pub struct Sine {
    pub frequency: f32,
    pub amplitude: f32,
    phase: Mutex<f32>,
    sample_rate: Mutex<f32>,
}

impl Sine {
    pub fn new(frequency: f32, amplitude: f32) -> Arc<Self> {
        Arc::new(Self {
            frequency,
            amplitude,
            phase: Mutex::new(0.0),
            sample_rate: Mutex::new(48000.0),
        })
    }
}

impl AudioConsumer for Sine {
    fn prepare(&self, format: &ProcessFormat) {
        *self.sample_rate.lock() = format.sample_rate as f32;
        *self.phase.lock() = 0.0;
    }

    fn process(&self, _input: &AudioBuffer, output: &mut AudioBuffer) {
        let step = self.frequency / *self.sample_rate.lock() * std::f32::consts::TAU;
        let mut phase = self.phase.lock();
        let start = *phase;
        for channel in output.channels_mut() {
            let mut p = start;
            for sample in channel.iter_mut() {
                *sample = self.amplitude * p.sin();
                p = (p + step) % std::f32::consts::TAU;
            }
            *phase = p;
        }
    }

    fn stopped(&self) {}
}

/// Panics on every callback.
pub struct Panicking;

impl AudioConsumer for Panicking {
    fn prepare(&self, _format: &ProcessFormat) {}

    fn process(&self, _input: &AudioBuffer, _output: &mut AudioBuffer) {
        panic!("consumer exploded");
    }

    fn stopped(&self) {}
}

/// Signals when its first callback starts, then waits before returning.
pub struct Slow {
    entered: Sender<()>,
    release: Receiver<()>,
    delay: Duration,
    blocked: AtomicBool,
    pub exited: AtomicBool,
}

impl Slow {
    /// Sleeps `delay` on its first callback.
    pub fn sleeping(delay: Duration) -> (Arc<Self>, Receiver<()>) {
        let (entered, entered_rx) = crossbeam_channel::bounded(1);
        let (_release_tx, release) = crossbeam_channel::bounded(0);
        let slow = Arc::new(Self {
            entered,
            release,
            delay,
            blocked: AtomicBool::new(false),
            exited: AtomicBool::new(false),
        });
        (slow, entered_rx)
    }

    /// Blocks on its first callback until the returned sender fires.
    pub fn blocking() -> (Arc<Self>, Receiver<()>, Sender<()>) {
        let (entered, entered_rx) = crossbeam_channel::bounded(1);
        let (release_tx, release) = crossbeam_channel::bounded(1);
        let slow = Arc::new(Self {
            entered,
            release,
            delay: Duration::ZERO,
            blocked: AtomicBool::new(false),
            exited: AtomicBool::new(false),
        });
        (slow, entered_rx, release_tx)
    }
}

impl AudioConsumer for Slow {
    fn prepare(&self, _format: &ProcessFormat) {}

    fn process(&self, _input: &AudioBuffer, output: &mut AudioBuffer) {
        if !self.blocked.swap(true, Ordering::SeqCst) {
            let _ = self.entered.try_send(());
            if self.delay.is_zero() {
                let _ = self.release.recv_timeout(Duration::from_secs(5));
            } else {
                std::thread::sleep(self.delay);
            }
            self.exited.store(true, Ordering::SeqCst);
        }
        output.fill(1.0);
    }

    fn stopped(&self) {}
}

/// Records every delegate notification.
#[derive(Default)]
pub struct RecordingDelegate {
    pub states: Mutex<Vec<SessionState>>,
    pub faults: Mutex<Vec<FaultRecord>>,
    pub errors: Mutex<Vec<EngineError>>,
}

impl SessionDelegate for RecordingDelegate {
    fn on_state_changed(&self, state: SessionState) {
        self.states.lock().push(state);
    }

    fn on_faults(&self, faults: &[FaultRecord]) {
        self.faults.lock().extend_from_slice(faults);
    }

    fn on_error(&self, error: &EngineError) {
        self.errors.lock().push(error.clone());
    }
}

pub fn all_samples(buffer: &AudioBuffer) -> impl Iterator<Item = f32> + '_ {
    buffer.channels().flat_map(|c| c.iter().copied())
}
