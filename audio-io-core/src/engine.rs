use std::sync::Arc;
use std::thread;

use crossbeam_channel::{Receiver, RecvTimeoutError};

use crate::backend::registry::DeviceRegistry;
use crate::models::capabilities::DeviceCapabilities;
use crate::models::config::StreamRequest;
use crate::models::error::{EngineError, EngineResult};
use crate::session::audio_session::Session;
use crate::topology::negotiator::negotiate;
use crate::topology::plan::{plan_topology, ResolvedDevice, TopologyPlan};
use crate::traits::backend::AudioBackend;

/// Entry point: negotiates requests against live devices and opens sessions.
///
/// Owns the [`DeviceRegistry`], so every session opened through one engine
/// shares device handles.
#[derive(Clone)]
pub struct AudioEngine {
    registry: DeviceRegistry,
}

impl AudioEngine {
    pub fn new(backend: Arc<dyn AudioBackend>) -> Self {
        Self {
            registry: DeviceRegistry::new(backend),
        }
    }

    pub fn registry(&self) -> &DeviceRegistry {
        &self.registry
    }

    pub fn backend_name(&self) -> &str {
        self.registry.backend().name()
    }

    pub fn device_ids(&self) -> EngineResult<Vec<String>> {
        self.registry.backend().device_ids()
    }

    /// Capabilities of a device, as captured when it was opened.
    pub fn capabilities(&self, device_id: &str) -> EngineResult<DeviceCapabilities> {
        let lease = self.registry.lease(device_id)?;
        Ok(lease.capabilities().clone())
    }

    /// Negotiate every request and decide the topology. Nothing is opened
    /// beyond the device handles needed to read capabilities.
    pub fn plan(
        &self,
        primary: &StreamRequest,
        secondaries: &[StreamRequest],
    ) -> EngineResult<TopologyPlan> {
        let primary = self.resolve(primary)?;
        let secondaries = secondaries
            .iter()
            .map(|request| self.resolve(request))
            .collect::<EngineResult<Vec<_>>>()?;
        let plan = plan_topology(&primary, &secondaries)?;
        log::debug!(
            "planned {:?} topology with {} leg(s)",
            plan.kind,
            plan.legs.len()
        );
        Ok(plan)
    }

    /// Negotiate, plan and open a session. The session is left open, not running.
    pub fn negotiate_and_open(
        &self,
        primary: &StreamRequest,
        secondaries: &[StreamRequest],
    ) -> EngineResult<Session> {
        let plan = self.plan(primary, secondaries)?;
        let mut session = Session::new(plan, self.registry.clone());
        session.open()?;
        Ok(session)
    }

    /// [`negotiate_and_open`](Self::negotiate_and_open) on a background
    /// thread. First opens can take noticeable wall time on some drivers.
    pub fn negotiate_and_open_async(
        &self,
        primary: StreamRequest,
        secondaries: Vec<StreamRequest>,
    ) -> EngineResult<PendingSession> {
        let engine = self.clone();
        let (tx, rx) = crossbeam_channel::bounded(1);
        let handle = thread::Builder::new()
            .name("audio-session-open".into())
            .spawn(move || {
                let result = engine.negotiate_and_open(&primary, &secondaries);
                // Receiver gone: the session is dropped here and closes itself.
                let _ = tx.send(result);
            })
            .map_err(|e| EngineError::Backend(format!("failed to spawn open thread: {}", e)))?;

        Ok(PendingSession {
            rx,
            handle: Some(handle),
        })
    }

    fn resolve(&self, request: &StreamRequest) -> EngineResult<ResolvedDevice> {
        request.validate()?;
        let lease = self.registry.lease(&request.device_id)?;
        let capabilities = lease.capabilities().clone();
        let config = negotiate(&capabilities, request)?;
        Ok(ResolvedDevice::new(config, capabilities))
    }
}

/// A session being opened on a background thread.
pub struct PendingSession {
    rx: Receiver<EngineResult<Session>>,
    handle: Option<thread::JoinHandle<()>>,
}

impl PendingSession {
    /// Block until the session is open or opening failed.
    pub fn wait(mut self) -> EngineResult<Session> {
        let result = self
            .rx
            .recv()
            .map_err(|_| EngineError::Backend("open thread exited without a result".into()))?;
        self.join();
        result
    }

    /// Like [`wait`](Self::wait) with a deadline. `None` if still opening.
    pub fn wait_timeout(&mut self, timeout: std::time::Duration) -> Option<EngineResult<Session>> {
        match self.rx.recv_timeout(timeout) {
            Ok(result) => {
                self.join();
                Some(result)
            }
            Err(RecvTimeoutError::Timeout) => None,
            Err(RecvTimeoutError::Disconnected) => Some(Err(EngineError::Backend(
                "open thread exited without a result".into(),
            ))),
        }
    }

    fn join(&mut self) {
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                log::error!("session open thread panicked");
            }
        }
    }
}
