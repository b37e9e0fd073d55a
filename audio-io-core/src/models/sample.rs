use serde::{Deserialize, Serialize};

/// Native sample encoding as advertised by a device.
///
/// All integer encodings are little-endian signed PCM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SampleEncoding {
    Int16Lsb,
    /// Packed 3-byte samples.
    Int24Lsb,
    Int32Lsb,
    Float32,
}

impl SampleEncoding {
    /// Negotiation preference, best first.
    pub const PREFERENCE: [SampleEncoding; 4] = [
        SampleEncoding::Float32,
        SampleEncoding::Int32Lsb,
        SampleEncoding::Int24Lsb,
        SampleEncoding::Int16Lsb,
    ];

    #[inline]
    pub fn bytes_per_sample(self) -> usize {
        match self {
            Self::Int16Lsb => 2,
            Self::Int24Lsb => 3,
            Self::Int32Lsb | Self::Float32 => 4,
        }
    }

    pub fn bits_per_sample(self) -> u16 {
        self.bytes_per_sample() as u16 * 8
    }

    pub fn is_float(self) -> bool {
        matches!(self, Self::Float32)
    }
}

/// Memory layout of a native buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SampleLayout {
    /// Frame-major: `ch0, ch1, .., ch0, ch1, ..` in a single buffer.
    Interleaved,
    /// One contiguous run per channel, one buffer per channel.
    NonInterleaved,
}

impl SampleLayout {
    pub fn from_interleaved(interleaved: bool) -> Self {
        if interleaved {
            Self::Interleaved
        } else {
            Self::NonInterleaved
        }
    }

    pub fn is_interleaved(self) -> bool {
        matches!(self, Self::Interleaved)
    }

    /// Number of native buffers a stream with `channels` channels exposes.
    pub fn buffer_count(self, channels: usize) -> usize {
        match self {
            Self::Interleaved => usize::from(channels > 0),
            Self::NonInterleaved => channels,
        }
    }

    /// Byte length of each native buffer.
    pub fn buffer_len(self, encoding: SampleEncoding, channels: usize, frames: usize) -> usize {
        match self {
            Self::Interleaved => encoding.bytes_per_sample() * channels * frames,
            Self::NonInterleaved => encoding.bytes_per_sample() * frames,
        }
    }
}

/// Direction of a stream or device port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Input,
    Output,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sample_sizes() {
        assert_eq!(SampleEncoding::Int16Lsb.bytes_per_sample(), 2);
        assert_eq!(SampleEncoding::Int24Lsb.bytes_per_sample(), 3);
        assert_eq!(SampleEncoding::Int32Lsb.bits_per_sample(), 32);
        assert!(SampleEncoding::Float32.is_float());
    }

    #[test]
    fn buffer_shapes() {
        let il = SampleLayout::Interleaved;
        assert_eq!(il.buffer_count(2), 1);
        assert_eq!(il.buffer_count(0), 0);
        assert_eq!(il.buffer_len(SampleEncoding::Int24Lsb, 2, 10), 60);

        let ni = SampleLayout::NonInterleaved;
        assert_eq!(ni.buffer_count(3), 3);
        assert_eq!(ni.buffer_len(SampleEncoding::Int16Lsb, 3, 10), 20);
    }
}
