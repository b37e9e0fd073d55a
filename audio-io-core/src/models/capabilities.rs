use serde::{Deserialize, Serialize};

use super::sample::{Direction, SampleEncoding, SampleLayout};

/// Unit in which a device advertises its buffer-size range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BufferUnit {
    Frames,
    Milliseconds,
}

impl BufferUnit {
    /// Convert a size in this unit to frames at `sample_rate`.
    pub fn to_frames(self, size: u32, sample_rate: u32) -> u32 {
        match self {
            Self::Frames => size,
            Self::Milliseconds => {
                ((size as u64 * sample_rate as u64) / 1000).max(1) as u32
            }
        }
    }
}

/// Inclusive buffer-size range plus the size the device currently uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BufferSizeRange {
    pub min: u32,
    pub max: u32,
    pub current: u32,
    pub unit: BufferUnit,
}

impl BufferSizeRange {
    pub fn frames(min: u32, max: u32) -> Self {
        Self {
            min,
            max,
            current: min + (max - min) / 2,
            unit: BufferUnit::Frames,
        }
    }

    pub fn contains(&self, size: u32) -> bool {
        size >= self.min && size <= self.max
    }

    pub fn midpoint(&self) -> u32 {
        self.min + (self.max - self.min) / 2
    }
}

/// What an opened device supports. Captured once at open time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceCapabilities {
    pub id: String,
    pub name: String,
    /// Backend the device belongs to (e.g. "wasapi", "virtual").
    pub backend: String,
    /// Advertised sample rates, ascending.
    pub sample_rates: Vec<u32>,
    /// Rate the hardware is configured for right now, if known.
    pub current_sample_rate: Option<u32>,
    pub encodings: Vec<SampleEncoding>,
    pub buffer_size: BufferSizeRange,
    pub max_input_channels: u16,
    pub max_output_channels: u16,
    pub supports_interleaved: bool,
    pub supports_non_interleaved: bool,
    /// Input and output can run on one stream sharing one hardware clock.
    pub supports_full_duplex: bool,
    /// The backend can combine this device with others into an aggregate stream.
    pub supports_aggregation: bool,
}

impl DeviceCapabilities {
    pub fn supports_rate(&self, rate: u32) -> bool {
        self.sample_rates.contains(&rate)
    }

    pub fn supports_encoding(&self, encoding: SampleEncoding) -> bool {
        self.encodings.contains(&encoding)
    }

    pub fn supports_layout(&self, layout: SampleLayout) -> bool {
        match layout {
            SampleLayout::Interleaved => self.supports_interleaved,
            SampleLayout::NonInterleaved => self.supports_non_interleaved,
        }
    }

    pub fn max_channels(&self, direction: Direction) -> u16 {
        match direction {
            Direction::Input => self.max_input_channels,
            Direction::Output => self.max_output_channels,
        }
    }

    pub fn has_input(&self) -> bool {
        self.max_input_channels > 0
    }

    pub fn has_output(&self) -> bool {
        self.max_output_channels > 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn millisecond_buffers_convert_to_frames() {
        assert_eq!(BufferUnit::Milliseconds.to_frames(10, 48000), 480);
        assert_eq!(BufferUnit::Milliseconds.to_frames(0, 48000), 1);
        assert_eq!(BufferUnit::Frames.to_frames(256, 48000), 256);
    }

    #[test]
    fn range_midpoint() {
        let range = BufferSizeRange::frames(256, 1024);
        assert_eq!(range.midpoint(), 640);
        assert!(range.contains(256));
        assert!(range.contains(1024));
        assert!(!range.contains(1025));
    }
}
