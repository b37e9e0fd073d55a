//! Format arithmetic shared by the WASAPI endpoints.
//!
//! WASAPI measures durations in 100-nanosecond units (`REFERENCE_TIME`);
//! the engine measures them in frames.

use audio_io_core::BufferSizeRange;

/// `REFERENCE_TIME` ticks per second.
pub const HNS_PER_SECOND: i64 = 10_000_000;

/// Rates offered on top of the mix rate. Shared-mode streams are opened with
/// `AUTOCONVERTPCM`, so the audio engine resamples to the mix format.
pub const CONVERTIBLE_RATES: [u32; 6] = [44100, 48000, 88200, 96000, 176400, 192000];

/// Largest shared-mode buffer requested, in milliseconds.
pub const MAX_BUFFER_MS: u32 = 500;

pub fn hns_to_frames(hns: i64, sample_rate: u32) -> u32 {
    if hns <= 0 {
        return 0;
    }
    ((hns as i128 * sample_rate as i128 + HNS_PER_SECOND as i128 - 1) / HNS_PER_SECOND as i128)
        as u32
}

pub fn frames_to_hns(frames: u32, sample_rate: u32) -> i64 {
    if sample_rate == 0 {
        return 0;
    }
    (frames as i64 * HNS_PER_SECOND) / sample_rate as i64
}

/// Advertised rates: the convertible set plus the mix rate, ascending.
pub fn advertised_rates(mix_rate: u32) -> Vec<u32> {
    let mut rates = CONVERTIBLE_RATES.to_vec();
    if !rates.contains(&mix_rate) {
        rates.push(mix_rate);
    }
    rates.sort_unstable();
    rates
}

/// Buffer range derived from the device periods.
///
/// The minimum is one minimum period, the current size one default period.
pub fn buffer_range(default_period: i64, min_period: i64, mix_rate: u32) -> BufferSizeRange {
    let min = hns_to_frames(min_period, mix_rate).max(1);
    let max = (mix_rate as u64 * MAX_BUFFER_MS as u64 / 1000).max(min as u64) as u32;
    let current = hns_to_frames(default_period, mix_rate).clamp(min, max);
    BufferSizeRange {
        min,
        max,
        current,
        unit: audio_io_core::BufferUnit::Frames,
    }
}
