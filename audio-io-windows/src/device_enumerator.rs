//! Endpoint enumeration via the MMDevice API.
//!
//! Wraps `IMMDeviceEnumerator` to resolve endpoint ids (including the
//! `"default"` aliases) and read friendly names and data flow.

use windows::core::{Interface, HSTRING, PWSTR};
use windows::Win32::Devices::FunctionDiscovery::PKEY_Device_FriendlyName;
use windows::Win32::Media::Audio::*;
use windows::Win32::System::Com::*;

use audio_io_core::{Direction, EngineError, EngineResult, DEFAULT_DEVICE_ID};

use crate::com::com_error;

/// Alias for the default console capture endpoint.
pub const DEFAULT_INPUT_ID: &str = "default-input";

/// An active endpoint as listed by [`EndpointEnumerator::endpoints`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointInfo {
    pub id: String,
    pub name: String,
    pub direction: Direction,
    pub is_default: bool,
}

/// Requires COM to be initialised on the calling thread.
pub struct EndpointEnumerator {
    enumerator: IMMDeviceEnumerator,
}

impl EndpointEnumerator {
    pub fn new() -> EngineResult<Self> {
        let enumerator: IMMDeviceEnumerator =
            unsafe { CoCreateInstance(&MMDeviceEnumerator, None, CLSCTX_ALL) }
                .map_err(com_error("CoCreateInstance(MMDeviceEnumerator)"))?;
        Ok(Self { enumerator })
    }

    /// Active render endpoints followed by active capture endpoints.
    pub fn endpoints(&self) -> EngineResult<Vec<EndpointInfo>> {
        let mut endpoints = self.list(eRender, Direction::Output)?;
        endpoints.extend(self.list(eCapture, Direction::Input)?);
        Ok(endpoints)
    }

    /// Resolve an id or alias to an endpoint.
    ///
    /// `"default"` is the default render endpoint, or the default capture
    /// endpoint on machines without one.
    pub fn resolve(&self, id: &str) -> EngineResult<IMMDevice> {
        let device = match id {
            DEFAULT_DEVICE_ID => self
                .default_endpoint(eRender)
                .or_else(|_| self.default_endpoint(eCapture)),
            DEFAULT_INPUT_ID => self.default_endpoint(eCapture),
            _ => unsafe { self.enumerator.GetDevice(&HSTRING::from(id)) },
        };
        device.map_err(|_| EngineError::DeviceNotFound(id.to_string()))
    }

    pub fn default_id(&self, direction: Direction) -> EngineResult<String> {
        let device = self
            .default_endpoint(data_flow(direction))
            .map_err(|_| EngineError::DeviceNotFound(DEFAULT_DEVICE_ID.to_string()))?;
        endpoint_id(&device)
    }

    fn default_endpoint(&self, flow: EDataFlow) -> windows::core::Result<IMMDevice> {
        unsafe { self.enumerator.GetDefaultAudioEndpoint(flow, eConsole) }
    }

    fn list(&self, flow: EDataFlow, direction: Direction) -> EngineResult<Vec<EndpointInfo>> {
        let collection = unsafe { self.enumerator.EnumAudioEndpoints(flow, DEVICE_STATE_ACTIVE) }
            .map_err(com_error("EnumAudioEndpoints"))?;
        let count = unsafe { collection.GetCount() }.map_err(com_error("GetCount"))?;

        let default_id = self
            .default_endpoint(flow)
            .ok()
            .and_then(|device| endpoint_id(&device).ok());

        let mut endpoints = Vec::with_capacity(count as usize);
        for i in 0..count {
            let Ok(device) = (unsafe { collection.Item(i) }) else {
                continue;
            };
            let Ok(id) = endpoint_id(&device) else {
                continue;
            };
            let name = friendly_name(&device).unwrap_or_else(|| format!("Endpoint {}", i));
            let is_default = default_id.as_deref() == Some(id.as_str());
            endpoints.push(EndpointInfo {
                id,
                name,
                direction,
                is_default,
            });
        }
        Ok(endpoints)
    }
}

pub fn endpoint_id(device: &IMMDevice) -> EngineResult<String> {
    unsafe {
        let raw: PWSTR = device.GetId().map_err(com_error("IMMDevice::GetId"))?;
        let id = raw.to_string();
        CoTaskMemFree(Some(raw.0 as *const _));
        id.map_err(|e| EngineError::Backend(format!("endpoint id is not UTF-16: {}", e)))
    }
}

pub fn endpoint_direction(device: &IMMDevice) -> EngineResult<Direction> {
    let endpoint: IMMEndpoint = device.cast().map_err(com_error("IMMEndpoint cast"))?;
    let flow = unsafe { endpoint.GetDataFlow() }.map_err(com_error("GetDataFlow"))?;
    Ok(if flow == eCapture {
        Direction::Input
    } else {
        Direction::Output
    })
}

/// `PKEY_Device_FriendlyName`, if the endpoint has one.
pub fn friendly_name(device: &IMMDevice) -> Option<String> {
    let store = unsafe { device.OpenPropertyStore(STGM_READ) }.ok()?;
    let value = unsafe { store.GetValue(&PKEY_Device_FriendlyName) }.ok()?;
    let name = value.to_string();
    (!name.is_empty()).then_some(name)
}

fn data_flow(direction: Direction) -> EDataFlow {
    match direction {
        Direction::Input => eCapture,
        Direction::Output => eRender,
    }
}
