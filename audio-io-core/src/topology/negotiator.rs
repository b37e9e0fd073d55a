//! Reconcile a [`StreamRequest`] with what a device advertises.
//!
//! Every chooser is a pure function of the capabilities and the request, and
//! always returns a member of the advertised set.

use crate::models::capabilities::{BufferUnit, DeviceCapabilities};
use crate::models::config::{StreamConfig, StreamRequest};
use crate::models::error::{EngineError, EngineResult};
use crate::models::sample::{SampleEncoding, SampleLayout};

/// Rates at or above this are preferred when neither the requested nor the
/// current rate is available.
pub const PREFERRED_MIN_RATE: u32 = 44_100;

/// Requested rate if supported, else the device's current rate, else the
/// smallest rate >= 44.1 kHz, else the lowest rate.
pub fn choose_sample_rate(caps: &DeviceCapabilities, requested: u32) -> EngineResult<u32> {
    if caps.sample_rates.is_empty() {
        return Err(EngineError::UnsupportedFormat(format!(
            "'{}' advertises no sample rates",
            caps.id
        )));
    }
    if caps.supports_rate(requested) {
        return Ok(requested);
    }
    if let Some(current) = caps.current_sample_rate.filter(|r| caps.supports_rate(*r)) {
        return Ok(current);
    }
    let preferred = caps
        .sample_rates
        .iter()
        .copied()
        .filter(|r| *r >= PREFERRED_MIN_RATE)
        .min();
    let lowest = caps.sample_rates.iter().copied().min();
    preferred
        .or(lowest)
        .ok_or_else(|| EngineError::UnsupportedFormat(format!("'{}' has no usable rate", caps.id)))
}

/// Requested size if it lies within the device range, else the midpoint.
///
/// `requested` is expressed in `unit`; the result is in the device's unit.
/// `sample_rate` is only used when the two units differ.
pub fn choose_buffer_size(
    caps: &DeviceCapabilities,
    requested: u32,
    unit: BufferUnit,
    sample_rate: u32,
) -> EngineResult<u32> {
    let range = &caps.buffer_size;
    if range.max == 0 || range.min > range.max {
        return Err(EngineError::UnsupportedFormat(format!(
            "'{}' advertises an empty buffer size range [{}, {}]",
            caps.id, range.min, range.max
        )));
    }
    let requested = convert_buffer_size(requested, unit, range.unit, sample_rate);
    if range.contains(requested) {
        Ok(requested)
    } else {
        Ok(range.midpoint())
    }
}

fn convert_buffer_size(size: u32, from: BufferUnit, to: BufferUnit, sample_rate: u32) -> u32 {
    match (from, to) {
        (BufferUnit::Frames, BufferUnit::Milliseconds) if sample_rate > 0 => {
            ((size as u64 * 1000) / sample_rate as u64) as u32
        }
        (BufferUnit::Milliseconds, BufferUnit::Frames) => from.to_frames(size, sample_rate),
        _ => size,
    }
}

/// Requested encoding if supported, else Float32 > Int32 > Int24 > Int16,
/// else the first advertised encoding.
pub fn choose_sample_encoding(
    caps: &DeviceCapabilities,
    requested: Option<SampleEncoding>,
) -> EngineResult<SampleEncoding> {
    if let Some(encoding) = requested.filter(|e| caps.supports_encoding(*e)) {
        return Ok(encoding);
    }
    SampleEncoding::PREFERENCE
        .iter()
        .copied()
        .find(|e| caps.supports_encoding(*e))
        .or_else(|| caps.encodings.first().copied())
        .ok_or_else(|| {
            EngineError::UnsupportedFormat(format!("'{}' advertises no sample encodings", caps.id))
        })
}

/// Interleaved if asked for and supported, otherwise whichever layout the device has.
pub fn choose_layout(caps: &DeviceCapabilities, interleaved: bool) -> EngineResult<SampleLayout> {
    let wanted = SampleLayout::from_interleaved(interleaved);
    let other = SampleLayout::from_interleaved(!interleaved);
    [wanted, other]
        .into_iter()
        .find(|layout| caps.supports_layout(*layout))
        .ok_or_else(|| {
            EngineError::UnsupportedFormat(format!("'{}' advertises no buffer layout", caps.id))
        })
}

/// Resolve a request into a config that passes [`StreamConfig::validate_against`].
pub fn negotiate(caps: &DeviceCapabilities, request: &StreamRequest) -> EngineResult<StreamConfig> {
    request.validate()?;

    if request.input_channels > caps.max_input_channels {
        return Err(EngineError::UnsupportedFormat(format!(
            "{} input channels requested, '{}' has {}",
            request.input_channels, caps.id, caps.max_input_channels
        )));
    }
    if request.output_channels > caps.max_output_channels {
        return Err(EngineError::UnsupportedFormat(format!(
            "{} output channels requested, '{}' has {}",
            request.output_channels, caps.id, caps.max_output_channels
        )));
    }

    let sample_rate = choose_sample_rate(caps, request.sample_rate)?;
    if sample_rate != request.sample_rate {
        log::warn!(
            "'{}' does not support {} Hz; using {} Hz",
            caps.id,
            request.sample_rate,
            sample_rate
        );
    }
    let buffer_size =
        choose_buffer_size(caps, request.buffer_size, request.buffer_unit, sample_rate)?;
    let encoding = choose_sample_encoding(caps, request.encoding)?;
    let layout = choose_layout(caps, request.interleaved)?;

    let config = StreamConfig {
        device_id: caps.id.clone(),
        sample_rate,
        encoding,
        buffer_size,
        buffer_unit: caps.buffer_size.unit,
        input_channels: request.input_channels,
        output_channels: request.output_channels,
        layout,
    };
    config.validate_against(caps)?;

    log::debug!(
        "negotiated '{}': {} Hz, {} {:?}, {:?}, {:?}, {} in / {} out",
        config.device_id,
        config.sample_rate,
        config.buffer_size,
        config.buffer_unit,
        config.encoding,
        config.layout,
        config.input_channels,
        config.output_channels
    );
    Ok(config)
}
