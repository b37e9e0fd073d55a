//! WASAPI implementation of the engine's backend traits.
//!
//! Endpoints are opened in shared mode with 32-bit float samples. A render
//! endpoint only has outputs and a capture endpoint only has inputs, so no
//! endpoint is full duplex; duplex requests become aggregate topologies.

use std::sync::Arc;

use windows::Win32::Media::Audio::IAudioClient;
use windows::Win32::System::Com::{CoTaskMemFree, CLSCTX_ALL};

use audio_io_core::{
    AudioBackend, DeviceCapabilities, DeviceHandle, Direction, EngineError, EngineResult,
    NativeFormat, NativeStream, SampleEncoding, SampleLayout, StreamCallbacks,
};

use crate::com::{com_error, ComApartment};
use crate::device_enumerator::{endpoint_direction, endpoint_id, friendly_name, EndpointEnumerator};
use crate::format::{advertised_rates, buffer_range};
use crate::wasapi_stream::WasapiStream;

pub const BACKEND_NAME: &str = "wasapi";

/// Shared-mode WASAPI backend.
///
/// COM is entered on whichever thread calls into the backend; streams run
/// on threads of their own.
#[derive(Debug, Default, Clone, Copy)]
pub struct WasapiBackend;

impl WasapiBackend {
    pub fn new() -> Self {
        Self
    }
}

impl AudioBackend for WasapiBackend {
    fn name(&self) -> &str {
        BACKEND_NAME
    }

    fn device_ids(&self) -> EngineResult<Vec<String>> {
        let _com = ComApartment::enter()?;
        let endpoints = EndpointEnumerator::new()?.endpoints()?;
        Ok(endpoints.into_iter().map(|endpoint| endpoint.id).collect())
    }

    fn open_device(&self, id: &str) -> EngineResult<Arc<dyn DeviceHandle>> {
        let _com = ComApartment::enter()?;
        let enumerator = EndpointEnumerator::new()?;
        let device = enumerator.resolve(id)?;

        let canonical = endpoint_id(&device)?;
        let direction = endpoint_direction(&device)?;
        let name = friendly_name(&device).unwrap_or_else(|| canonical.clone());

        let audio_client: IAudioClient = unsafe { device.Activate(CLSCTX_ALL, None) }
            .map_err(com_error("IMMDevice::Activate"))?;
        let (mix_rate, mix_channels) = unsafe {
            let mix = audio_client.GetMixFormat().map_err(com_error("GetMixFormat"))?;
            let rate = (*mix).nSamplesPerSec;
            let channels = (*mix).nChannels;
            CoTaskMemFree(Some(mix as *const _));
            (rate, channels)
        };
        let mut default_period = 0i64;
        let mut min_period = 0i64;
        unsafe {
            audio_client
                .GetDevicePeriod(Some(&mut default_period), Some(&mut min_period))
                .map_err(com_error("GetDevicePeriod"))?;
        }

        let (max_input_channels, max_output_channels) = match direction {
            Direction::Input => (mix_channels, 0),
            Direction::Output => (0, mix_channels),
        };
        let capabilities = DeviceCapabilities {
            id: canonical.clone(),
            name,
            backend: BACKEND_NAME.to_string(),
            sample_rates: advertised_rates(mix_rate),
            current_sample_rate: Some(mix_rate),
            encodings: vec![SampleEncoding::Float32],
            buffer_size: buffer_range(default_period, min_period, mix_rate),
            max_input_channels,
            max_output_channels,
            supports_interleaved: true,
            supports_non_interleaved: false,
            supports_full_duplex: false,
            supports_aggregation: true,
        };

        log::info!(
            "opened WASAPI endpoint {} ({:?}, {} Hz mix, {} ch)",
            capabilities.name,
            direction,
            mix_rate,
            mix_channels
        );
        Ok(Arc::new(WasapiDevice {
            id: canonical,
            direction,
            capabilities,
        }))
    }
}

/// An endpoint with its capabilities. Holds no COM state; each stream
/// re-resolves the endpoint on its own thread.
pub struct WasapiDevice {
    id: String,
    direction: Direction,
    capabilities: DeviceCapabilities,
}

impl WasapiDevice {
    pub fn direction(&self) -> Direction {
        self.direction
    }
}

impl DeviceHandle for WasapiDevice {
    fn id(&self) -> &str {
        &self.id
    }

    fn capabilities(&self) -> &DeviceCapabilities {
        &self.capabilities
    }

    fn open_stream(
        &self,
        format: &NativeFormat,
        callbacks: Arc<dyn StreamCallbacks>,
    ) -> EngineResult<Box<dyn NativeStream>> {
        if !self.supports_format(format) || format.layout != SampleLayout::Interleaved {
            return Err(EngineError::UnsupportedFormat(format!(
                "{} cannot open {:?}",
                self.id, format
            )));
        }
        if format.input_channels > 0 && format.output_channels > 0 {
            return Err(EngineError::StreamOpenFailure(format!(
                "{} is not a full-duplex endpoint",
                self.id
            )));
        }

        let stream = WasapiStream::open(self.id.clone(), self.direction, *format, callbacks)?;
        Ok(Box::new(stream))
    }
}
