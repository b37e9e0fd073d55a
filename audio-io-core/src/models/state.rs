use serde::Serialize;

/// Session state machine.
///
/// State transitions:
/// ```text
/// closed → opening → open ⇄ running
///    ↑                 │       │
///    └─────── close ───┴───────┘
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Closed,
    Opening,
    Open,
    Running,
}

impl SessionState {
    pub fn is_closed(&self) -> bool {
        matches!(self, Self::Closed)
    }

    pub fn is_open(&self) -> bool {
        matches!(self, Self::Open)
    }

    pub fn is_running(&self) -> bool {
        matches!(self, Self::Running)
    }

    /// Native streams exist in this state.
    pub fn holds_streams(&self) -> bool {
        matches!(self, Self::Open | Self::Running)
    }
}

impl Default for SessionState {
    fn default() -> Self {
        Self::Closed
    }
}
