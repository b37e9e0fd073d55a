//! Plays a test tone through the default device while metering the input,
//! then prints the session report as JSON.
//!
//! Usage: `audio-io-demo [seconds]` (default 3). `RUST_LOG=debug` shows
//! negotiation decisions.

use std::process::ExitCode;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;

use audio_io_core::{
    AudioBackend, AudioBuffer, AudioConsumer, AudioEngine, EngineError, EngineResult,
    FaultRecord, ProcessFormat, Session, SessionDelegate, SessionState, StreamRequest,
};

const DEFAULT_SECONDS: u64 = 3;
const TONE_HZ: f32 = 440.0;
const TONE_GAIN: f32 = 0.2;

fn main() -> ExitCode {
    env_logger::init();

    let seconds = std::env::args()
        .nth(1)
        .and_then(|arg| arg.parse().ok())
        .unwrap_or(DEFAULT_SECONDS);

    match run(Duration::from_secs(seconds)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("demo failed: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn run(duration: Duration) -> EngineResult<()> {
    let backend = platform_backend()?;
    let engine = AudioEngine::new(backend);
    log::info!("using {} backend", engine.backend_name());

    let mut session = open_session(&engine)?;
    session.set_delegate(Arc::new(LoggingDelegate));

    let tone = Arc::new(Tone::new(TONE_HZ, TONE_GAIN));
    let meter = Arc::new(LevelMeter::default());
    session.register_consumer(tone);
    session.register_consumer(meter.clone());

    session.start()?;
    let ticks = duration.as_millis() / 250;
    for _ in 0..ticks {
        thread::sleep(Duration::from_millis(250));
        log::info!(
            "input peak {:.3}, callbacks {}, xruns {}",
            meter.take_peak(),
            session.callback_count(),
            session.xrun_count()
        );
    }
    session.stop()?;

    println!("{}", session.report().to_json()?);
    session.close()
}

/// Output on the default device plus whatever input the platform offers.
fn open_session(engine: &AudioEngine) -> EngineResult<Session> {
    let output = StreamRequest::default();

    #[cfg(target_os = "windows")]
    {
        let input = StreamRequest::input(audio_io_windows::DEFAULT_INPUT_ID, 1);
        match engine.negotiate_and_open(&output, &[input]) {
            Ok(session) => return Ok(session),
            Err(e) => log::warn!("no usable capture endpoint, output only: {}", e),
        }
        engine.negotiate_and_open(&output, &[])
    }

    #[cfg(not(target_os = "windows"))]
    {
        let duplex = StreamRequest {
            input_channels: 1,
            ..output
        };
        engine.negotiate_and_open(&duplex, &[])
    }
}

#[cfg(target_os = "windows")]
fn platform_backend() -> EngineResult<Arc<dyn AudioBackend>> {
    Ok(Arc::new(audio_io_windows::WasapiBackend::new()))
}

/// A clocked virtual interface whose input carries a quiet 220 Hz tone.
#[cfg(not(target_os = "windows"))]
fn platform_backend() -> EngineResult<Arc<dyn AudioBackend>> {
    use audio_io_core::{VirtualBackend, VirtualDeviceSpec};

    let backend = VirtualBackend::with_clock()?;
    backend.add_device(
        VirtualDeviceSpec::duplex("demo-interface", 2, 2)
            .name("Demo Interface")
            .build(),
    );
    backend.set_default_device("demo-interface");

    let mut signal = AudioBuffer::new(2, 48000);
    let step = 220.0 / 48000.0 * std::f32::consts::TAU;
    for channel in signal.channels_mut() {
        for (i, sample) in channel.iter_mut().enumerate() {
            *sample = 0.1 * (step * i as f32).sin();
        }
    }
    backend.set_input_signal("demo-interface", signal);
    Ok(Arc::new(backend))
}

/// Sine generator on every output channel.
struct Tone {
    frequency: f32,
    gain: f32,
    step: AtomicU32,
    phase: Mutex<f32>,
}

impl Tone {
    fn new(frequency: f32, gain: f32) -> Self {
        Self {
            frequency,
            gain,
            step: AtomicU32::new(0),
            phase: Mutex::new(0.0),
        }
    }
}

impl AudioConsumer for Tone {
    fn prepare(&self, format: &ProcessFormat) {
        let step = self.frequency / format.sample_rate as f32 * std::f32::consts::TAU;
        self.step.store(step.to_bits(), Ordering::Relaxed);
        *self.phase.lock() = 0.0;
    }

    fn process(&self, _input: &AudioBuffer, output: &mut AudioBuffer) {
        let step = f32::from_bits(self.step.load(Ordering::Relaxed));
        // Skip the period rather than wait on a concurrent prepare().
        let Some(mut phase) = self.phase.try_lock() else {
            return;
        };
        let start = *phase;
        let mut end = start;
        for channel in output.channels_mut() {
            end = start;
            for sample in channel.iter_mut() {
                *sample = self.gain * end.sin();
                end = (end + step) % std::f32::consts::TAU;
            }
        }
        *phase = end;
    }

    fn stopped(&self) {
        log::debug!("tone stopped");
    }
}

/// Tracks the input peak between reads. Contributes silence.
#[derive(Default)]
struct LevelMeter {
    peak: AtomicU32,
}

impl LevelMeter {
    fn take_peak(&self) -> f32 {
        f32::from_bits(self.peak.swap(0, Ordering::Relaxed))
    }
}

impl AudioConsumer for LevelMeter {
    fn prepare(&self, format: &ProcessFormat) {
        log::info!(
            "metering {} input channel(s) at {} Hz",
            format.input_channels,
            format.sample_rate
        );
    }

    fn process(&self, input: &AudioBuffer, _output: &mut AudioBuffer) {
        let peak = input.peak();
        // Non-negative floats order the same as their bit patterns.
        self.peak.fetch_max(peak.to_bits(), Ordering::Relaxed);
    }

    fn stopped(&self) {}
}

struct LoggingDelegate;

impl SessionDelegate for LoggingDelegate {
    fn on_state_changed(&self, state: SessionState) {
        log::info!("session {:?}", state);
    }

    fn on_faults(&self, faults: &[FaultRecord]) {
        for fault in faults {
            log::warn!("fault at callback {}: {:?}", fault.callback_index, fault.kind);
        }
    }

    fn on_error(&self, error: &EngineError) {
        log::error!("session error: {}", error);
    }
}
