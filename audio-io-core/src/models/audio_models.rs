use serde::Serialize;

use super::config::StreamConfig;
use super::error::{EngineError, EngineResult};
use super::state::SessionState;

/// Shape of a stream topology.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TopologyKind {
    Input,
    Output,
    /// Input and output on one device and one hardware clock.
    FullDuplex,
    /// Independent devices combined at the buffer level.
    Aggregate,
}

/// Format consumers are prepared with before their first callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ProcessFormat {
    pub sample_rate: u32,
    /// Upper bound on frames per callback. Individual callbacks may be shorter.
    pub max_frames: usize,
    pub input_channels: usize,
    pub output_channels: usize,
}

/// Latency reported by the backend, in frames.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Latency {
    pub input_frames: u32,
    pub output_frames: u32,
}

impl Latency {
    pub fn input_ms(&self, sample_rate: u32) -> f64 {
        frames_to_ms(self.input_frames, sample_rate)
    }

    pub fn output_ms(&self, sample_rate: u32) -> f64 {
        frames_to_ms(self.output_frames, sample_rate)
    }
}

fn frames_to_ms(frames: u32, sample_rate: u32) -> f64 {
    if sample_rate == 0 {
        return 0.0;
    }
    frames as f64 * 1000.0 / sample_rate as f64
}

/// Snapshot of a session for diagnostics and export.
#[derive(Debug, Clone, Serialize)]
pub struct SessionReport {
    pub state: SessionState,
    pub topology: Option<TopologyKind>,
    pub configs: Vec<StreamConfig>,
    /// `None` until the backend has reported latency (usually after the first callback).
    pub latency: Option<Latency>,
    pub frames_per_callback: u32,
    pub callback_count: u64,
    pub xrun_count: u64,
    pub fault_count: u64,
    pub skipped_callbacks: u64,
    pub consumer_count: usize,
    pub hardware_running: bool,
    /// Last non-zero code the backend reported with a running-state change.
    pub last_error: Option<i32>,
}

impl SessionReport {
    pub fn to_json(&self) -> EngineResult<String> {
        serde_json::to_string_pretty(self)
            .map_err(|e| EngineError::Backend(format!("failed to serialize report: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn latency_in_milliseconds() {
        let latency = Latency {
            input_frames: 480,
            output_frames: 96,
        };
        assert_abs_diff_eq!(latency.input_ms(48000), 10.0, epsilon = 1e-9);
        assert_abs_diff_eq!(latency.output_ms(48000), 2.0, epsilon = 1e-9);
        assert_eq!(latency.output_ms(0), 0.0);
    }

    #[test]
    fn report_serializes() {
        let report = SessionReport {
            state: SessionState::Running,
            topology: Some(TopologyKind::FullDuplex),
            configs: Vec::new(),
            latency: None,
            frames_per_callback: 256,
            callback_count: 3,
            xrun_count: 1,
            fault_count: 0,
            skipped_callbacks: 0,
            consumer_count: 2,
            hardware_running: true,
            last_error: Some(-5),
        };
        let json = report.to_json().unwrap();
        assert!(json.contains("\"state\": \"running\""));
        assert!(json.contains("\"topology\": \"full_duplex\""));
        assert!(json.contains("\"last_error\": -5"));
    }
}
