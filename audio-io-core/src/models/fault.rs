use serde::Serialize;

/// Non-fatal runtime fault observed on the realtime thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultKind {
    /// Hardware reported a missed deadline. `index` is the backend's xrun index.
    XRun { index: u32 },
    /// A consumer panicked; the period was replaced by silence.
    CallbackFault { consumer: usize },
    /// A callback arrived while another was still running and was skipped.
    ReentrantCallback,
    /// The backend delivered more frames than the buffers were sized for.
    BufferGrown { frames: usize },
}

/// A fault plus the callback it happened in.
///
/// `Copy` so recording it on the realtime thread never allocates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FaultRecord {
    pub kind: FaultKind,
    pub callback_index: u64,
}

impl std::fmt::Display for FaultRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.kind {
            FaultKind::XRun { index } => {
                write!(f, "xrun #{} at callback {}", index, self.callback_index)
            }
            FaultKind::CallbackFault { consumer } => write!(
                f,
                "consumer {} panicked in callback {}; output silenced",
                consumer, self.callback_index
            ),
            FaultKind::ReentrantCallback => {
                write!(f, "reentrant callback skipped at {}", self.callback_index)
            }
            FaultKind::BufferGrown { frames } => write!(
                f,
                "callback {} delivered {} frames; buffers grown",
                self.callback_index, frames
            ),
        }
    }
}
