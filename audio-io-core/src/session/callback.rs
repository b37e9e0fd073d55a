//! Realtime side of a session: the callbacks each native stream invokes.
//!
//! Nothing in here blocks, logs or allocates in steady state. Faults are
//! pushed into a pre-allocated bounded queue and counted; the control side
//! drains and logs them.

use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, Ordering};
use std::sync::Arc;

use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;

use crate::models::fault::{FaultKind, FaultRecord};
use crate::processing::audio_buffer::AudioBuffer;
use crate::processing::codec::SampleCodec;
use crate::session::fanout::{CallbackFanout, FanoutOutcome};
use crate::session::guard::CallbackGuard;
use crate::topology::plan::{LegPlan, LegRole};
use crate::traits::backend::{CallbackStatus, StreamCallbacks};

/// Faults buffered between drains. Further faults are counted but dropped.
pub const FAULT_QUEUE_CAPACITY: usize = 256;

pub(crate) struct FaultLog {
    tx: Sender<FaultRecord>,
    rx: Receiver<FaultRecord>,
    recorded: AtomicU64,
    dropped: AtomicU64,
}

impl FaultLog {
    fn new(capacity: usize) -> Self {
        let (tx, rx) = crossbeam_channel::bounded(capacity);
        Self {
            tx,
            rx,
            recorded: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    /// Realtime safe.
    pub fn record(&self, kind: FaultKind, callback_index: u64) {
        self.recorded.fetch_add(1, Ordering::Relaxed);
        if self.tx.try_send(FaultRecord { kind, callback_index }).is_err() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn drain(&self) -> Vec<FaultRecord> {
        self.rx.try_iter().collect()
    }

    pub fn recorded(&self) -> u64 {
        self.recorded.load(Ordering::Relaxed)
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

#[derive(Default)]
pub(crate) struct Counters {
    pub callbacks: AtomicU64,
    pub xruns: AtomicU64,
    pub skipped: AtomicU64,
    pub hardware_running: AtomicBool,
    pub last_error: AtomicI32,
}

/// State shared by the control side and every leg callback of a session.
pub(crate) struct SessionShared {
    pub fanout: CallbackFanout,
    pub faults: FaultLog,
    pub counters: Counters,
    /// Cleared first when stopping; callbacks then produce silence.
    pub accepting: AtomicBool,
}

impl SessionShared {
    pub fn new() -> Self {
        Self {
            fanout: CallbackFanout::new(),
            faults: FaultLog::new(FAULT_QUEUE_CAPACITY),
            counters: Counters::default(),
            accepting: AtomicBool::new(false),
        }
    }

    fn callback_index(&self) -> u64 {
        self.counters.callbacks.load(Ordering::Relaxed)
    }
}

struct LegBuffers {
    input: AudioBuffer,
    output: AudioBuffer,
    scratch: AudioBuffer,
}

/// Callbacks for one leg of a topology.
///
/// The driver leg decodes input, runs the fanout and encodes output.
/// Feeder legs (aggregate inputs) only decode into their channel range of
/// the shared staging buffer, which the driver copies from.
pub(crate) struct LegCallback {
    shared: Arc<SessionShared>,
    guard: CallbackGuard,
    role: LegRole,
    codec: SampleCodec,
    input_channels: usize,
    output_channels: usize,
    input_offset: usize,
    /// Channels of the buffer consumers see as input.
    unified_inputs: usize,
    staging: Option<Arc<Mutex<AudioBuffer>>>,
    buffers: Mutex<LegBuffers>,
}

impl LegCallback {
    pub fn new(
        shared: Arc<SessionShared>,
        leg: &LegPlan,
        unified_inputs: usize,
        staging: Option<Arc<Mutex<AudioBuffer>>>,
    ) -> Self {
        let frames = leg.config.frames_per_buffer() as usize;
        let outputs = leg.config.output_channels as usize;
        Self {
            shared,
            guard: CallbackGuard::new(),
            role: leg.role,
            codec: SampleCodec::new(leg.config.encoding, leg.config.layout),
            input_channels: leg.config.input_channels as usize,
            output_channels: outputs,
            input_offset: leg.input_offset,
            unified_inputs,
            staging,
            buffers: Mutex::new(LegBuffers {
                input: AudioBuffer::new(unified_inputs, frames),
                output: AudioBuffer::new(outputs, frames),
                scratch: AudioBuffer::new(outputs.max(1), frames),
            }),
        }
    }

    /// Size the buffers for `frames` frames per callback. Control thread only.
    pub fn reserve(&self, frames: usize) {
        let mut buffers = self.buffers.lock();
        buffers.input.resize(self.unified_inputs, frames);
        buffers.output.resize(self.output_channels, frames);
        buffers.scratch.resize(self.output_channels.max(1), frames);
    }

    pub fn wait_idle(&self) {
        self.guard.wait_idle();
    }

    fn drive(&self, input: &[&[u8]], output: &mut [&mut [u8]], frames: usize) -> CallbackStatus {
        let shared = &self.shared;
        let index = shared.counters.callbacks.fetch_add(1, Ordering::Relaxed);

        // Pairs with the store in `Session::stop`; see `CallbackGuard`.
        if !shared.accepting.load(Ordering::SeqCst) {
            SampleCodec::silence(output);
            return CallbackStatus::Silenced;
        }
        // Uncontended while the guard is held.
        let Some(mut buffers) = self.buffers.try_lock() else {
            SampleCodec::silence(output);
            return CallbackStatus::Silenced;
        };
        let LegBuffers {
            input: in_buf,
            output: out_buf,
            scratch,
        } = &mut *buffers;

        let grew = in_buf.resize(self.unified_inputs, frames)
            | out_buf.resize(self.output_channels, frames)
            | scratch.resize(self.output_channels.max(1), frames);
        if grew {
            shared.faults.record(FaultKind::BufferGrown { frames }, index);
        }

        match &self.staging {
            Some(staging) => match staging.try_lock() {
                Some(mut staged) => {
                    if self.input_channels > 0 {
                        self.codec.read_into(
                            input,
                            &mut staged,
                            self.input_offset,
                            frames,
                            self.input_channels,
                        );
                    }
                    in_buf.copy_from(&staged);
                    // Feeders refill their range every period; one that
                    // misses a period reads as silence, not the last period.
                    staged.clear();
                }
                None => in_buf.clear(),
            },
            None => {
                in_buf.clear();
                if self.input_channels > 0 {
                    self.codec.read(input, in_buf, frames, self.input_channels);
                }
            }
        }

        let outcome = shared.fanout.process(in_buf, out_buf, scratch);
        if let FanoutOutcome::Fault { consumer } = outcome {
            shared.faults.record(FaultKind::CallbackFault { consumer }, index);
        }

        if self.output_channels > 0 {
            self.codec.write(out_buf, output, frames, self.output_channels);
        }

        match outcome {
            FanoutOutcome::Processed => CallbackStatus::Processed,
            FanoutOutcome::Silent | FanoutOutcome::Fault { .. } => CallbackStatus::Silenced,
        }
    }

    fn feed(&self, input: &[&[u8]], output: &mut [&mut [u8]], frames: usize) -> CallbackStatus {
        SampleCodec::silence(output);
        if !self.shared.accepting.load(Ordering::SeqCst) {
            return CallbackStatus::Silenced;
        }
        let Some(staging) = &self.staging else {
            return CallbackStatus::Silenced;
        };
        // The driver is copying out; drop this period rather than wait.
        let Some(mut staged) = staging.try_lock() else {
            return CallbackStatus::Silenced;
        };
        self.codec.read_into(
            input,
            &mut staged,
            self.input_offset,
            frames,
            self.input_channels,
        );
        CallbackStatus::Processed
    }
}

impl StreamCallbacks for LegCallback {
    fn on_buffer(&self, input: &[&[u8]], output: &mut [&mut [u8]], frames: usize) -> CallbackStatus {
        let Some(_active) = self.guard.try_enter() else {
            let shared = &self.shared;
            shared.counters.skipped.fetch_add(1, Ordering::Relaxed);
            shared
                .faults
                .record(FaultKind::ReentrantCallback, shared.callback_index());
            SampleCodec::silence(output);
            return CallbackStatus::Silenced;
        };

        match self.role {
            LegRole::Driver => self.drive(input, output, frames),
            LegRole::Feeder => self.feed(input, output, frames),
        }
    }

    fn on_xrun(&self, index: u32) {
        let shared = &self.shared;
        shared.counters.xruns.fetch_add(1, Ordering::Relaxed);
        shared
            .faults
            .record(FaultKind::XRun { index }, shared.callback_index());
    }

    fn on_running(&self, running: bool, error_code: i32) {
        if self.role == LegRole::Driver {
            self.shared
                .counters
                .hardware_running
                .store(running, Ordering::Release);
        }
        if error_code != 0 {
            self.shared
                .counters
                .last_error
                .store(error_code, Ordering::Release);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::audio_models::ProcessFormat;
    use crate::models::capabilities::BufferUnit;
    use crate::models::config::StreamConfig;
    use crate::models::sample::{SampleEncoding, SampleLayout};
    use crate::traits::consumer::AudioConsumer;

    struct PassThrough;

    impl AudioConsumer for PassThrough {
        fn prepare(&self, _format: &ProcessFormat) {}
        fn process(&self, input: &AudioBuffer, output: &mut AudioBuffer) {
            output.copy_from(input);
        }
        fn stopped(&self) {}
    }

    fn leg(role: LegRole, inputs: u16, outputs: u16, offset: usize) -> LegPlan {
        LegPlan {
            config: StreamConfig {
                device_id: "dev".into(),
                sample_rate: 48000,
                encoding: SampleEncoding::Float32,
                buffer_size: 4,
                buffer_unit: BufferUnit::Frames,
                input_channels: inputs,
                output_channels: outputs,
                layout: SampleLayout::NonInterleaved,
            },
            role,
            input_offset: offset,
        }
    }

    fn samples(values: &[f32]) -> Vec<u8> {
        values.iter().flat_map(|v| v.to_le_bytes()).collect()
    }

    fn floats(bytes: &[u8]) -> Vec<f32> {
        bytes
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect()
    }

    #[test]
    fn driver_passes_input_to_output() {
        let shared = Arc::new(SessionShared::new());
        shared.fanout.add_consumer(Arc::new(PassThrough));
        shared.accepting.store(true, Ordering::SeqCst);
        let cb = LegCallback::new(Arc::clone(&shared), &leg(LegRole::Driver, 1, 1, 0), 1, None);

        let input = samples(&[0.1, 0.2, 0.3, 0.4]);
        let mut output = vec![0u8; 16];
        let status = cb.on_buffer(&[&input], &mut [output.as_mut_slice()], 4);

        assert_eq!(status, CallbackStatus::Processed);
        assert_eq!(floats(&output), vec![0.1, 0.2, 0.3, 0.4]);
        assert_eq!(shared.counters.callbacks.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn not_accepting_produces_silence() {
        let shared = Arc::new(SessionShared::new());
        shared.fanout.add_consumer(Arc::new(PassThrough));
        let cb = LegCallback::new(Arc::clone(&shared), &leg(LegRole::Driver, 1, 1, 0), 1, None);

        let input = samples(&[1.0; 4]);
        let mut output = vec![0xFFu8; 16];
        let status = cb.on_buffer(&[&input], &mut [output.as_mut_slice()], 4);

        assert_eq!(status, CallbackStatus::Silenced);
        assert!(output.iter().all(|b| *b == 0));
    }

    #[test]
    fn feeder_fills_its_channel_range() {
        let shared = Arc::new(SessionShared::new());
        shared.fanout.add_consumer(Arc::new(PassThrough));
        shared.accepting.store(true, Ordering::SeqCst);
        let staging = Arc::new(Mutex::new(AudioBuffer::new(2, 4)));
        let driver = LegCallback::new(
            Arc::clone(&shared),
            &leg(LegRole::Driver, 1, 2, 0),
            2,
            Some(Arc::clone(&staging)),
        );
        let feeder = LegCallback::new(
            Arc::clone(&shared),
            &leg(LegRole::Feeder, 1, 0, 1),
            2,
            Some(Arc::clone(&staging)),
        );

        let feed = samples(&[0.5; 4]);
        feeder.on_buffer(&[&feed], &mut [], 4);

        let own = samples(&[0.25; 4]);
        let mut left = vec![0u8; 16];
        let mut right = vec![0u8; 16];
        driver.on_buffer(&[&own], &mut [left.as_mut_slice(), right.as_mut_slice()], 4);

        assert_eq!(floats(&left), vec![0.25; 4]);
        assert_eq!(floats(&right), vec![0.5; 4]);
    }

    #[test]
    fn feeder_that_misses_a_period_reads_as_silence() {
        let shared = Arc::new(SessionShared::new());
        shared.fanout.add_consumer(Arc::new(PassThrough));
        shared.accepting.store(true, Ordering::SeqCst);
        let staging = Arc::new(Mutex::new(AudioBuffer::new(2, 4)));
        let driver = LegCallback::new(
            Arc::clone(&shared),
            &leg(LegRole::Driver, 1, 2, 0),
            2,
            Some(Arc::clone(&staging)),
        );
        let feeder = LegCallback::new(
            Arc::clone(&shared),
            &leg(LegRole::Feeder, 1, 0, 1),
            2,
            Some(Arc::clone(&staging)),
        );

        feeder.on_buffer(&[&samples(&[0.5; 4])], &mut [], 4);

        let own = samples(&[0.25; 4]);
        let mut left = vec![0u8; 16];
        let mut right = vec![0u8; 16];
        driver.on_buffer(&[&own], &mut [left.as_mut_slice(), right.as_mut_slice()], 4);
        assert_eq!(floats(&right), vec![0.5; 4]);

        for _ in 0..3 {
            driver.on_buffer(&[&own], &mut [left.as_mut_slice(), right.as_mut_slice()], 4);
            assert_eq!(floats(&left), vec![0.25; 4]);
            assert_eq!(floats(&right), vec![0.0; 4]);
        }
    }

    #[test]
    fn larger_period_grows_buffers_and_records_it() {
        let shared = Arc::new(SessionShared::new());
        shared.accepting.store(true, Ordering::SeqCst);
        let cb = LegCallback::new(Arc::clone(&shared), &leg(LegRole::Driver, 0, 1, 0), 0, None);

        let mut output = vec![0u8; 32];
        cb.on_buffer(&[], &mut [output.as_mut_slice()], 8);

        let faults = shared.faults.drain();
        assert_eq!(faults.len(), 1);
        assert_eq!(faults[0].kind, FaultKind::BufferGrown { frames: 8 });

        cb.on_buffer(&[], &mut [output.as_mut_slice()], 8);
        assert!(shared.faults.drain().is_empty());
    }

    #[test]
    fn xruns_are_counted_not_raised() {
        let shared = Arc::new(SessionShared::new());
        let cb = LegCallback::new(Arc::clone(&shared), &leg(LegRole::Driver, 0, 1, 0), 0, None);

        cb.on_xrun(0);
        cb.on_xrun(1);

        assert_eq!(shared.counters.xruns.load(Ordering::SeqCst), 2);
        let kinds: Vec<_> = shared.faults.drain().into_iter().map(|f| f.kind).collect();
        assert_eq!(kinds, vec![FaultKind::XRun { index: 0 }, FaultKind::XRun { index: 1 }]);
    }

    #[test]
    fn fault_queue_overflow_is_counted() {
        let log = FaultLog::new(2);
        for _ in 0..5 {
            log.record(FaultKind::ReentrantCallback, 0);
        }
        assert_eq!(log.recorded(), 5);
        assert_eq!(log.dropped(), 3);
        assert_eq!(log.drain().len(), 2);
    }
}
