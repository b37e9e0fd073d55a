use windows::Win32::Foundation::RPC_E_CHANGED_MODE;
use windows::Win32::System::Com::{CoInitializeEx, CoUninitialize, COINIT_MULTITHREADED};

use audio_io_core::{EngineError, EngineResult};

/// Joins the calling thread to the multithreaded apartment for its lifetime.
///
/// A thread already in a single-threaded apartment is left as it is; COM
/// calls from it still work through marshalling.
pub(crate) struct ComApartment {
    owned: bool,
}

impl ComApartment {
    pub(crate) fn enter() -> EngineResult<Self> {
        let hr = unsafe { CoInitializeEx(None, COINIT_MULTITHREADED) };
        if hr == RPC_E_CHANGED_MODE {
            return Ok(Self { owned: false });
        }
        hr.ok()
            .map_err(|e| EngineError::Backend(format!("CoInitializeEx failed: {}", e)))?;
        Ok(Self { owned: true })
    }
}

impl Drop for ComApartment {
    fn drop(&mut self) {
        if self.owned {
            unsafe { CoUninitialize() };
        }
    }
}

/// Map a COM error to a backend error with the failing call's name.
pub(crate) fn com_error(call: &'static str) -> impl FnOnce(windows::core::Error) -> EngineError {
    move |e| EngineError::Backend(format!("{} failed: {}", call, e))
}
