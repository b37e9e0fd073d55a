use serde::{Deserialize, Serialize};

use super::capabilities::{BufferUnit, DeviceCapabilities};
use super::error::{EngineError, EngineResult};
use super::sample::{SampleEncoding, SampleLayout};

/// Device id that backends resolve to their default endpoint.
pub const DEFAULT_DEVICE_ID: &str = "default";

/// What the application asks for on one device, before negotiation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamRequest {
    /// Opaque id produced by device enumeration, or [`DEFAULT_DEVICE_ID`].
    pub device_id: String,

    /// Desired sample rate in Hz (default: 48000).
    pub sample_rate: u32,

    /// Desired buffer size (default: 512 frames).
    pub buffer_size: u32,

    /// Unit of `buffer_size`.
    pub buffer_unit: BufferUnit,

    /// Desired encoding, or `None` to let the negotiator pick the best one.
    pub encoding: Option<SampleEncoding>,

    /// Active input channels (default: 0).
    pub input_channels: u16,

    /// Active output channels (default: 2).
    pub output_channels: u16,

    /// Prefer interleaved native buffers (default: true).
    pub interleaved: bool,
}

impl StreamRequest {
    pub fn output(device_id: impl Into<String>, channels: u16) -> Self {
        Self {
            device_id: device_id.into(),
            input_channels: 0,
            output_channels: channels,
            ..Default::default()
        }
    }

    pub fn input(device_id: impl Into<String>, channels: u16) -> Self {
        Self {
            device_id: device_id.into(),
            input_channels: channels,
            output_channels: 0,
            ..Default::default()
        }
    }

    pub fn duplex(device_id: impl Into<String>, inputs: u16, outputs: u16) -> Self {
        Self {
            device_id: device_id.into(),
            input_channels: inputs,
            output_channels: outputs,
            ..Default::default()
        }
    }

    pub fn validate(&self) -> EngineResult<()> {
        if self.device_id.is_empty() {
            return Err(EngineError::DeviceNotFound("empty device id".into()));
        }
        if self.sample_rate == 0 {
            return Err(EngineError::UnsupportedFormat("sample rate must be positive".into()));
        }
        if self.buffer_size == 0 {
            return Err(EngineError::UnsupportedFormat("buffer size must be positive".into()));
        }
        if self.input_channels == 0 && self.output_channels == 0 {
            return Err(EngineError::UnsupportedFormat("no channels requested".into()));
        }
        Ok(())
    }
}

impl Default for StreamRequest {
    fn default() -> Self {
        Self {
            device_id: DEFAULT_DEVICE_ID.into(),
            sample_rate: 48000,
            buffer_size: 512,
            buffer_unit: BufferUnit::Frames,
            encoding: None,
            input_channels: 0,
            output_channels: 2,
            interleaved: true,
        }
    }
}

/// A negotiated configuration bound to one device.
///
/// Only produced by negotiation; every field lies within the device's
/// [`DeviceCapabilities`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamConfig {
    pub device_id: String,
    pub sample_rate: u32,
    pub encoding: SampleEncoding,
    pub buffer_size: u32,
    pub buffer_unit: BufferUnit,
    pub input_channels: u16,
    pub output_channels: u16,
    pub layout: SampleLayout,
}

impl StreamConfig {
    pub fn frames_per_buffer(&self) -> u32 {
        self.buffer_unit.to_frames(self.buffer_size, self.sample_rate)
    }

    pub fn is_interleaved(&self) -> bool {
        self.layout.is_interleaved()
    }

    pub fn has_input(&self) -> bool {
        self.input_channels > 0
    }

    pub fn has_output(&self) -> bool {
        self.output_channels > 0
    }

    /// Check every field against the owning device.
    pub fn validate_against(&self, caps: &DeviceCapabilities) -> EngineResult<()> {
        if self.device_id != caps.id {
            return Err(EngineError::UnsupportedFormat(format!(
                "config for '{}' checked against device '{}'",
                self.device_id, caps.id
            )));
        }
        if !caps.supports_rate(self.sample_rate) {
            return Err(EngineError::UnsupportedFormat(format!(
                "sample rate {} not supported by '{}'",
                self.sample_rate, caps.id
            )));
        }
        if !caps.supports_encoding(self.encoding) {
            return Err(EngineError::UnsupportedFormat(format!(
                "encoding {:?} not supported by '{}'",
                self.encoding, caps.id
            )));
        }
        if self.buffer_unit != caps.buffer_size.unit || !caps.buffer_size.contains(self.buffer_size) {
            return Err(EngineError::UnsupportedFormat(format!(
                "buffer size {} {:?} outside [{}, {}] {:?}",
                self.buffer_size,
                self.buffer_unit,
                caps.buffer_size.min,
                caps.buffer_size.max,
                caps.buffer_size.unit
            )));
        }
        if self.input_channels > caps.max_input_channels {
            return Err(EngineError::UnsupportedFormat(format!(
                "{} input channels requested, '{}' has {}",
                self.input_channels, caps.id, caps.max_input_channels
            )));
        }
        if self.output_channels > caps.max_output_channels {
            return Err(EngineError::UnsupportedFormat(format!(
                "{} output channels requested, '{}' has {}",
                self.output_channels, caps.id, caps.max_output_channels
            )));
        }
        if !caps.supports_layout(self.layout) {
            return Err(EngineError::UnsupportedFormat(format!(
                "layout {:?} not supported by '{}'",
                self.layout, caps.id
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_request_is_valid() {
        assert!(StreamRequest::default().validate().is_ok());
    }

    #[test]
    fn request_without_channels_is_rejected() {
        let request = StreamRequest {
            output_channels: 0,
            ..Default::default()
        };
        assert!(matches!(request.validate(), Err(EngineError::UnsupportedFormat(_))));
    }

    #[test]
    fn request_deserializes_with_defaults() {
        let request: StreamRequest =
            serde_json::from_str(r#"{"device_id":"usb-1","input_channels":4}"#).unwrap();
        assert_eq!(request.device_id, "usb-1");
        assert_eq!(request.input_channels, 4);
        assert_eq!(request.output_channels, 2);
        assert_eq!(request.sample_rate, 48000);
    }
}
