use crate::models::error::EngineError;
use crate::models::fault::FaultRecord;
use crate::models::state::SessionState;

/// Event delegate for session notifications.
///
/// Never called from the realtime thread. Calls happen on whichever thread
/// drives the session (open, start, stop, close, `drain_faults`).
pub trait SessionDelegate: Send + Sync {
    /// Called when the session state changes.
    fn on_state_changed(&self, state: SessionState);

    /// Called with faults recorded on the realtime thread since the last drain.
    fn on_faults(&self, faults: &[FaultRecord]) {
        let _ = faults;
    }

    /// Called when a control operation fails inside the backend.
    fn on_error(&self, error: &EngineError) {
        let _ = error;
    }
}
