use std::sync::atomic::Ordering;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::backend::registry::DeviceRegistry;
use crate::models::audio_models::{Latency, ProcessFormat, SessionReport, TopologyKind};
use crate::models::error::{EngineError, EngineResult};
use crate::models::fault::FaultRecord;
use crate::models::state::SessionState;
use crate::processing::audio_buffer::AudioBuffer;
use crate::session::callback::{LegCallback, SessionShared};
use crate::topology::plan::TopologyPlan;
use crate::topology::stream::StreamTopology;
use crate::traits::backend::StreamCallbacks;
use crate::traits::consumer::AudioConsumer;
use crate::traits::session_delegate::SessionDelegate;

/// Owns the native streams of one topology and the consumers they drive.
///
/// State transitions:
/// ```text
/// closed → opening → open ⇄ running
///    ↑                 │       │
///    └──── close ──────┴───────┘
/// ```
///
/// `stop` and `close` are idempotent. Once `stop` returns no callback is
/// running consumer code; once `close` returns (or the session is dropped)
/// the native streams are disposed and no callback can fire.
pub struct Session {
    plan: TopologyPlan,
    registry: DeviceRegistry,
    shared: Arc<SessionShared>,
    state: SessionState,
    topology: Option<StreamTopology>,
    legs: Vec<Arc<LegCallback>>,
    delegate: Option<Arc<dyn SessionDelegate>>,
    max_frames: usize,
}

impl Session {
    /// A closed session for `plan`. Call [`open`](Self::open) to acquire streams.
    pub fn new(plan: TopologyPlan, registry: DeviceRegistry) -> Self {
        Self {
            plan,
            registry,
            shared: Arc::new(SessionShared::new()),
            state: SessionState::Closed,
            topology: None,
            legs: Vec::new(),
            delegate: None,
            max_frames: 0,
        }
    }

    pub fn set_delegate(&mut self, delegate: Arc<dyn SessionDelegate>) {
        self.delegate = Some(delegate);
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn plan(&self) -> &TopologyPlan {
        &self.plan
    }

    pub fn kind(&self) -> TopologyKind {
        self.plan.kind
    }

    /// Open every native stream. Transitions: closed → opening → open.
    pub fn open(&mut self) -> EngineResult<()> {
        if !self.state.is_closed() {
            return Err(EngineError::InvalidState(format!(
                "can only open a closed session (state: {:?})",
                self.state
            )));
        }
        self.set_state(SessionState::Opening);

        let staging = (self.plan.kind == TopologyKind::Aggregate && self.plan.input_channels > 0)
            .then(|| Arc::new(Mutex::new(AudioBuffer::new(self.plan.input_channels, 0))));
        let unified_inputs = self.plan.input_channels;
        let shared = Arc::clone(&self.shared);
        let mut legs = Vec::with_capacity(self.plan.legs.len());

        let opened = StreamTopology::open(&self.plan, &self.registry, |_, leg| {
            let callback = Arc::new(LegCallback::new(
                Arc::clone(&shared),
                leg,
                unified_inputs,
                staging.clone(),
            ));
            legs.push(Arc::clone(&callback));
            callback as Arc<dyn StreamCallbacks>
        });

        let topology = match opened {
            Ok(topology) => topology,
            Err(e) => {
                log::error!("failed to open {:?} session: {}", self.plan.kind, e);
                self.notify_error(&e);
                self.set_state(SessionState::Closed);
                return Err(e);
            }
        };

        for (callback, leg) in legs.iter().zip(topology.legs()) {
            callback.reserve(leg.frames());
        }
        self.max_frames = topology.max_frames();
        if let Some(staging) = &staging {
            staging.lock().resize(unified_inputs, self.max_frames);
            staging.lock().clear();
        }

        log::info!(
            "opened {:?} session: {} leg(s), {} Hz, {} frames, {} in / {} out",
            self.plan.kind,
            topology.legs().len(),
            self.plan.sample_rate,
            self.max_frames,
            self.plan.input_channels,
            self.plan.output_channels
        );
        self.legs = legs;
        self.topology = Some(topology);
        self.set_state(SessionState::Open);
        Ok(())
    }

    /// Start hardware callbacks. Transitions: open → running. No-op if running.
    pub fn start(&mut self) -> EngineResult<()> {
        match self.state {
            SessionState::Running => return Ok(()),
            SessionState::Open => {}
            other => {
                return Err(EngineError::InvalidState(format!(
                    "can only start an open session (state: {:?})",
                    other
                )))
            }
        }
        let Some(topology) = self.topology.as_mut() else {
            return Err(EngineError::InvalidState("session has no streams".into()));
        };

        let format = ProcessFormat {
            sample_rate: self.plan.sample_rate,
            max_frames: self.max_frames,
            input_channels: self.plan.input_channels,
            output_channels: self.plan.output_channels,
        };
        self.shared.fanout.prepare_all(format);
        self.shared.accepting.store(true, Ordering::SeqCst);

        if let Err(e) = topology.start() {
            self.shared.accepting.store(false, Ordering::SeqCst);
            self.wait_idle();
            self.shared.fanout.stop_all();
            self.notify_error(&e);
            return Err(e);
        }

        log::info!("session started");
        self.set_state(SessionState::Running);
        Ok(())
    }

    /// Stop hardware callbacks. Transitions: running → open. No-op otherwise.
    ///
    /// Blocks until any in-flight callback has exited.
    pub fn stop(&mut self) -> EngineResult<()> {
        if !self.state.is_running() {
            return Ok(());
        }

        self.shared.accepting.store(false, Ordering::SeqCst);
        self.wait_idle();
        let result = match self.topology.as_mut() {
            Some(topology) => topology.stop(),
            None => Ok(()),
        };
        self.wait_idle();
        self.shared.fanout.stop_all();

        if let Err(e) = &result {
            self.notify_error(e);
        }
        log::info!(
            "session stopped after {} callbacks, {} xruns",
            self.callback_count(),
            self.xrun_count()
        );
        self.set_state(SessionState::Open);
        self.drain_faults();
        result
    }

    /// Stop if running and dispose every native stream. Transitions: open/running → closed.
    pub fn close(&mut self) -> EngineResult<()> {
        if !self.state.holds_streams() {
            return Ok(());
        }
        let result = self.stop();

        if let Some(topology) = self.topology.take() {
            drop(topology);
        }
        self.wait_idle();
        self.legs.clear();

        log::info!("session closed");
        self.set_state(SessionState::Closed);
        self.drain_faults();
        result
    }

    /// Register a consumer. Visible from the next callback; prepared
    /// immediately if the session is running. Returns `false` if already registered.
    pub fn register_consumer(&self, consumer: Arc<dyn AudioConsumer>) -> bool {
        self.shared.fanout.add_consumer(consumer)
    }

    /// Unregister a consumer and notify it "stopped". Returns `false` if it was not registered.
    pub fn unregister_consumer(&self, consumer: &Arc<dyn AudioConsumer>) -> bool {
        self.shared.fanout.remove_consumer(consumer)
    }

    pub fn consumer_count(&self) -> usize {
        self.shared.fanout.consumer_count()
    }

    /// Format consumers were prepared with, while running.
    pub fn process_format(&self) -> Option<ProcessFormat> {
        self.shared.fanout.format()
    }

    /// `None` until the backend has reported, usually after the first callback.
    pub fn latency(&self) -> Option<Latency> {
        self.topology.as_ref().and_then(StreamTopology::latency)
    }

    pub fn xrun_count(&self) -> u64 {
        self.shared.counters.xruns.load(Ordering::Relaxed)
    }

    pub fn callback_count(&self) -> u64 {
        self.shared.counters.callbacks.load(Ordering::Relaxed)
    }

    /// Callbacks refused because another was still in flight.
    pub fn skipped_callbacks(&self) -> u64 {
        self.shared.counters.skipped.load(Ordering::Relaxed)
    }

    /// Whether the hardware last reported itself as producing interrupts.
    pub fn is_hardware_running(&self) -> bool {
        self.shared.counters.hardware_running.load(Ordering::Acquire)
    }

    /// Last non-zero error code reported with a running-state change.
    pub fn last_backend_error(&self) -> Option<i32> {
        match self.shared.counters.last_error.load(Ordering::Acquire) {
            0 => None,
            code => Some(code),
        }
    }

    /// Take the faults recorded on the realtime thread since the last drain,
    /// log them and pass them to the delegate.
    pub fn drain_faults(&self) -> Vec<FaultRecord> {
        let faults = self.shared.faults.drain();
        if faults.is_empty() {
            return faults;
        }
        for fault in &faults {
            log::warn!("{}", fault);
        }
        let dropped = self.shared.faults.dropped();
        if dropped > 0 {
            log::warn!("{} faults dropped: queue full", dropped);
        }
        if let Some(delegate) = &self.delegate {
            delegate.on_faults(&faults);
        }
        faults
    }

    pub fn report(&self) -> SessionReport {
        SessionReport {
            state: self.state,
            topology: Some(self.plan.kind),
            configs: self.plan.configs(),
            latency: self.latency(),
            frames_per_callback: self.max_frames as u32,
            callback_count: self.callback_count(),
            xrun_count: self.xrun_count(),
            fault_count: self.shared.faults.recorded(),
            skipped_callbacks: self.skipped_callbacks(),
            consumer_count: self.consumer_count(),
            hardware_running: self.is_hardware_running(),
            last_error: self.last_backend_error(),
        }
    }

    fn wait_idle(&self) {
        for leg in &self.legs {
            leg.wait_idle();
        }
    }

    fn set_state(&mut self, state: SessionState) {
        if self.state == state {
            return;
        }
        log::debug!("session state: {:?} -> {:?}", self.state, state);
        self.state = state;
        if let Some(delegate) = &self.delegate {
            delegate.on_state_changed(state);
        }
    }

    fn notify_error(&self, error: &EngineError) {
        if let Some(delegate) = &self.delegate {
            delegate.on_error(error);
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            log::error!("error closing session on drop: {}", e);
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("kind", &self.plan.kind)
            .field("state", &self.state)
            .field("legs", &self.plan.legs.len())
            .finish()
    }
}
