//! Conversion between native sample buffers and planar f32.
//!
//! Native buffers are passed as slices of byte slices: one slice holding all
//! channels for [`SampleLayout::Interleaved`], one slice per channel for
//! [`SampleLayout::NonInterleaved`]. The float domain `[-1.0, 1.0]` maps
//! linearly onto the full integer range of each encoding:
//! - Int16: scaled by 32767
//! - Int24: scaled by 2^23, packed 3-byte little-endian, sign-extended on decode
//! - Int32: scaled by 2147483647
//! - Float32: copied as-is
//!
//! Nothing here allocates. The converter pair for an (encoding, layout) is
//! chosen once in [`SampleCodec::new`]; the per-sample loops are monomorphised.

use crate::models::sample::{SampleEncoding, SampleLayout};
use crate::processing::audio_buffer::AudioBuffer;

const I16_SCALE: f32 = i16::MAX as f32;
const I24_SCALE: f64 = 8_388_608.0;
const I24_MIN: f64 = -8_388_608.0;
const I24_MAX: f64 = 8_388_607.0;
const I32_SCALE: f64 = i32::MAX as f64;

/// One native sample type.
trait NativeSample {
    const BYTES: usize;

    fn decode(bytes: &[u8]) -> f32;

    fn encode(sample: f32, out: &mut [u8]);
}

struct I16Le;
struct I24Le;
struct I32Le;
struct F32Le;

impl NativeSample for I16Le {
    const BYTES: usize = 2;

    #[inline]
    fn decode(bytes: &[u8]) -> f32 {
        i16::from_le_bytes([bytes[0], bytes[1]]) as f32 / I16_SCALE
    }

    #[inline]
    fn encode(sample: f32, out: &mut [u8]) {
        let value = (sample.clamp(-1.0, 1.0) * I16_SCALE).round() as i16;
        out[..2].copy_from_slice(&value.to_le_bytes());
    }
}

impl NativeSample for I24Le {
    const BYTES: usize = 3;

    #[inline]
    fn decode(bytes: &[u8]) -> f32 {
        let raw = (bytes[0] as i32) | ((bytes[1] as i32) << 8) | ((bytes[2] as i32) << 16);
        // Move bit 23 into the sign bit, then shift back arithmetically.
        let signed = (raw << 8) >> 8;
        (signed as f64 / I24_SCALE) as f32
    }

    #[inline]
    fn encode(sample: f32, out: &mut [u8]) {
        let value = (sample as f64 * I24_SCALE).round().clamp(I24_MIN, I24_MAX) as i32;
        let bytes = value.to_le_bytes();
        out[..3].copy_from_slice(&bytes[..3]);
    }
}

impl NativeSample for I32Le {
    const BYTES: usize = 4;

    #[inline]
    fn decode(bytes: &[u8]) -> f32 {
        let value = i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        (value as f64 / I32_SCALE) as f32
    }

    #[inline]
    fn encode(sample: f32, out: &mut [u8]) {
        let value = (sample as f64 * I32_SCALE)
            .round()
            .clamp(i32::MIN as f64, i32::MAX as f64) as i32;
        out[..4].copy_from_slice(&value.to_le_bytes());
    }
}

impl NativeSample for F32Le {
    const BYTES: usize = 4;

    #[inline]
    fn decode(bytes: &[u8]) -> f32 {
        f32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
    }

    #[inline]
    fn encode(sample: f32, out: &mut [u8]) {
        out[..4].copy_from_slice(&sample.to_le_bytes());
    }
}

/// Decode up to `dst.len()` samples spaced `stride` bytes apart.
type DecodeRun = fn(src: &[u8], stride: usize, dst: &mut [f32]) -> usize;

/// Encode `src` into samples spaced `stride` bytes apart.
type EncodeRun = fn(src: &[f32], dst: &mut [u8], stride: usize) -> usize;

fn decode_run<S: NativeSample>(src: &[u8], stride: usize, dst: &mut [f32]) -> usize {
    let mut converted = 0;
    for (out, chunk) in dst.iter_mut().zip(src.chunks(stride)) {
        if chunk.len() < S::BYTES {
            break;
        }
        *out = S::decode(chunk);
        converted += 1;
    }
    converted
}

fn encode_run<S: NativeSample>(src: &[f32], dst: &mut [u8], stride: usize) -> usize {
    let mut converted = 0;
    for (&sample, chunk) in src.iter().zip(dst.chunks_mut(stride)) {
        if chunk.len() < S::BYTES {
            break;
        }
        S::encode(sample, chunk);
        converted += 1;
    }
    converted
}

/// Zero `frames` samples of `bytes` width spaced `stride` apart.
fn silence_run(dst: &mut [u8], stride: usize, bytes: usize, frames: usize) {
    for chunk in dst.chunks_mut(stride).take(frames) {
        let len = bytes.min(chunk.len());
        chunk[..len].fill(0);
    }
}

/// Converter for one (encoding, layout) pair.
#[derive(Clone, Copy)]
pub struct SampleCodec {
    encoding: SampleEncoding,
    layout: SampleLayout,
    decode: DecodeRun,
    encode: EncodeRun,
}

impl std::fmt::Debug for SampleCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SampleCodec")
            .field("encoding", &self.encoding)
            .field("layout", &self.layout)
            .finish()
    }
}

impl SampleCodec {
    pub fn new(encoding: SampleEncoding, layout: SampleLayout) -> Self {
        let (decode, encode): (DecodeRun, EncodeRun) = match encoding {
            SampleEncoding::Int16Lsb => (decode_run::<I16Le>, encode_run::<I16Le>),
            SampleEncoding::Int24Lsb => (decode_run::<I24Le>, encode_run::<I24Le>),
            SampleEncoding::Int32Lsb => (decode_run::<I32Le>, encode_run::<I32Le>),
            SampleEncoding::Float32 => (decode_run::<F32Le>, encode_run::<F32Le>),
        };
        Self {
            encoding,
            layout,
            decode,
            encode,
        }
    }

    pub fn encoding(&self) -> SampleEncoding {
        self.encoding
    }

    pub fn layout(&self) -> SampleLayout {
        self.layout
    }

    /// Byte length of each native buffer for `channels` x `frames`.
    pub fn native_len(&self, channels: usize, frames: usize) -> usize {
        self.layout.buffer_len(self.encoding, channels, frames)
    }

    /// Allocate zeroed native buffers of the right shape. Not for the audio thread.
    pub fn alloc_native(&self, channels: usize, frames: usize) -> Vec<Vec<u8>> {
        let len = self.native_len(channels, frames);
        (0..self.layout.buffer_count(channels))
            .map(|_| vec![0u8; len])
            .collect()
    }

    /// Decode `channels` native channels into `dst` channels `0..channels`.
    pub fn read(
        &self,
        native: &[&[u8]],
        dst: &mut AudioBuffer,
        frames: usize,
        channels: usize,
    ) -> usize {
        self.read_into(native, dst, 0, frames, channels)
    }

    /// Decode `channels` native channels into `dst` starting at channel `offset`.
    ///
    /// Channels that do not fit in `dst` are skipped. Returns the number of
    /// frames converted for every channel.
    pub fn read_into(
        &self,
        native: &[&[u8]],
        dst: &mut AudioBuffer,
        offset: usize,
        frames: usize,
        channels: usize,
    ) -> usize {
        let frames = frames.min(dst.frame_count());
        let writable = channels.min(dst.channel_count().saturating_sub(offset));
        let bytes = self.encoding.bytes_per_sample();
        let mut converted = frames;

        match self.layout {
            SampleLayout::Interleaved => {
                let Some(src) = native.first() else {
                    return 0;
                };
                let stride = bytes * channels;
                for ch in 0..writable {
                    let Some(run) = src.get(ch * bytes..) else {
                        return 0;
                    };
                    let out = &mut dst.channel_mut(offset + ch)[..frames];
                    converted = converted.min((self.decode)(run, stride, out));
                }
            }
            SampleLayout::NonInterleaved => {
                for ch in 0..writable {
                    let Some(src) = native.get(ch) else {
                        return 0;
                    };
                    let out = &mut dst.channel_mut(offset + ch)[..frames];
                    converted = converted.min((self.decode)(src, bytes, out));
                }
            }
        }
        if writable == 0 {
            return 0;
        }
        converted
    }

    /// Encode `src` channels `0..channels` into native buffers.
    pub fn write(
        &self,
        src: &AudioBuffer,
        native: &mut [&mut [u8]],
        frames: usize,
        channels: usize,
    ) -> usize {
        self.write_from(src, 0, native, frames, channels)
    }

    /// Encode `channels` native channels from `src` starting at channel `offset`.
    ///
    /// Native channels with no source channel are written as silence.
    /// Returns the number of frames encoded from `src`.
    pub fn write_from(
        &self,
        src: &AudioBuffer,
        offset: usize,
        native: &mut [&mut [u8]],
        frames: usize,
        channels: usize,
    ) -> usize {
        let bytes = self.encoding.bytes_per_sample();
        let readable = channels.min(src.channel_count().saturating_sub(offset));
        let src_frames = frames.min(src.frame_count());
        let mut converted = src_frames;

        match self.layout {
            SampleLayout::Interleaved => {
                let Some(dst) = native.first_mut() else {
                    return 0;
                };
                let stride = bytes * channels;
                for ch in 0..channels {
                    let Some(run) = dst.get_mut(ch * bytes..) else {
                        return 0;
                    };
                    if ch < readable {
                        let input = &src.channel(offset + ch)[..src_frames];
                        converted = converted.min((self.encode)(input, run, stride));
                        if frames > src_frames {
                            let tail = run.get_mut(src_frames * stride..).unwrap_or_default();
                            silence_run(tail, stride, bytes, frames - src_frames);
                        }
                    } else {
                        silence_run(run, stride, bytes, frames);
                    }
                }
            }
            SampleLayout::NonInterleaved => {
                for ch in 0..channels {
                    let Some(dst) = native.get_mut(ch) else {
                        return 0;
                    };
                    if ch < readable {
                        let input = &src.channel(offset + ch)[..src_frames];
                        converted = converted.min((self.encode)(input, dst, bytes));
                        if frames > src_frames {
                            let tail = dst.get_mut(src_frames * bytes..).unwrap_or_default();
                            silence_run(tail, bytes, bytes, frames - src_frames);
                        }
                    } else {
                        silence_run(dst, bytes, bytes, frames);
                    }
                }
            }
        }
        if readable == 0 {
            return 0;
        }
        converted
    }

    /// Zero every native buffer. All supported encodings represent silence as zero bytes.
    pub fn silence(native: &mut [&mut [u8]]) {
        for buffer in native.iter_mut() {
            buffer.fill(0);
        }
    }
}
