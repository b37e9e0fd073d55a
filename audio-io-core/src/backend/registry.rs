use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::models::capabilities::DeviceCapabilities;
use crate::models::error::EngineResult;
use crate::traits::backend::{AudioBackend, DeviceHandle};

struct Entry {
    handle: Arc<dyn DeviceHandle>,
    leases: usize,
}

#[derive(Default)]
struct Devices {
    /// Keyed by canonical device id.
    open: HashMap<String, Entry>,
    /// Requested id -> canonical id, for ids like "default".
    aliases: HashMap<String, String>,
}

struct RegistryInner {
    backend: Arc<dyn AudioBackend>,
    devices: Mutex<Devices>,
}

/// Shares opened devices between the streams that use them.
///
/// Each device is opened at most once. [`DeviceLease`]s are reference
/// counted and the native device handle is released with the last lease.
#[derive(Clone)]
pub struct DeviceRegistry {
    inner: Arc<RegistryInner>,
}

impl DeviceRegistry {
    pub fn new(backend: Arc<dyn AudioBackend>) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                backend,
                devices: Mutex::new(Devices::default()),
            }),
        }
    }

    pub fn backend(&self) -> &Arc<dyn AudioBackend> {
        &self.inner.backend
    }

    /// Lease `id`, opening the device if nobody holds it yet.
    pub fn lease(&self, id: &str) -> EngineResult<DeviceLease> {
        let mut devices = self.inner.devices.lock();

        let canonical = devices.aliases.get(id).cloned().unwrap_or_else(|| id.to_string());
        if let Some(entry) = devices.open.get_mut(&canonical) {
            entry.leases += 1;
            return Ok(DeviceLease {
                id: canonical,
                handle: Arc::clone(&entry.handle),
                registry: Arc::clone(&self.inner),
            });
        }

        let handle = self.inner.backend.open_device(id)?;
        let canonical = handle.id().to_string();
        if canonical != id {
            devices.aliases.insert(id.to_string(), canonical.clone());
        }
        let entry = devices.open.entry(canonical.clone()).or_insert_with(|| {
            log::debug!("opened device '{}' on {}", canonical, self.inner.backend.name());
            Entry { handle, leases: 0 }
        });
        entry.leases += 1;

        Ok(DeviceLease {
            id: canonical,
            handle: Arc::clone(&entry.handle),
            registry: Arc::clone(&self.inner),
        })
    }

    /// Open leases on `id` (canonical or alias).
    pub fn ref_count(&self, id: &str) -> usize {
        let devices = self.inner.devices.lock();
        let canonical = devices.aliases.get(id).map(String::as_str).unwrap_or(id);
        devices.open.get(canonical).map_or(0, |e| e.leases)
    }

    pub fn open_devices(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.inner.devices.lock().open.keys().cloned().collect();
        ids.sort();
        ids
    }
}

/// Shared use of an opened device.
pub struct DeviceLease {
    id: String,
    handle: Arc<dyn DeviceHandle>,
    registry: Arc<RegistryInner>,
}

impl DeviceLease {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn handle(&self) -> &dyn DeviceHandle {
        self.handle.as_ref()
    }

    pub fn capabilities(&self) -> &DeviceCapabilities {
        self.handle.capabilities()
    }
}

impl Clone for DeviceLease {
    fn clone(&self) -> Self {
        if let Some(entry) = self.registry.devices.lock().open.get_mut(&self.id) {
            entry.leases += 1;
        }
        Self {
            id: self.id.clone(),
            handle: Arc::clone(&self.handle),
            registry: Arc::clone(&self.registry),
        }
    }
}

impl Drop for DeviceLease {
    fn drop(&mut self) {
        let released = {
            let mut devices = self.registry.devices.lock();
            let last = match devices.open.get_mut(&self.id) {
                Some(entry) => {
                    entry.leases = entry.leases.saturating_sub(1);
                    entry.leases == 0
                }
                None => false,
            };
            if last {
                devices.aliases.retain(|_, canonical| canonical != &self.id);
                devices.open.remove(&self.id)
            } else {
                None
            }
        };
        // Release the native handle outside the lock.
        if let Some(entry) = released {
            log::debug!("released device '{}'", self.id);
            drop(entry);
        }
    }
}

impl std::fmt::Debug for DeviceLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceLease").field("id", &self.id).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::virtual_device::{VirtualBackend, VirtualDeviceSpec};

    fn registry() -> (VirtualBackend, DeviceRegistry) {
        let backend = VirtualBackend::new();
        backend.add_device(VirtualDeviceSpec::duplex("card", 2, 2).build());
        let registry = DeviceRegistry::new(Arc::new(backend.clone()));
        (backend, registry)
    }

    #[test]
    fn device_is_opened_once_and_released_with_last_lease() {
        let (backend, registry) = registry();

        let a = registry.lease("card").unwrap();
        let b = registry.lease("card").unwrap();
        let c = b.clone();
        assert_eq!(registry.ref_count("card"), 3);
        assert_eq!(backend.open_count("card"), 1);

        drop(a);
        drop(b);
        assert_eq!(registry.ref_count("card"), 1);
        drop(c);
        assert_eq!(registry.ref_count("card"), 0);
        assert!(registry.open_devices().is_empty());

        let _again = registry.lease("card").unwrap();
        assert_eq!(backend.open_count("card"), 2);
    }

    #[test]
    fn default_alias_shares_the_canonical_device() {
        let (backend, registry) = registry();
        backend.set_default_device("card");

        let by_alias = registry.lease("default").unwrap();
        let by_id = registry.lease("card").unwrap();

        assert_eq!(by_alias.id(), "card");
        assert_eq!(registry.ref_count("card"), 2);
        assert_eq!(registry.ref_count("default"), 2);
        drop(by_alias);
        drop(by_id);
        assert_eq!(registry.ref_count("default"), 0);
    }

    #[test]
    fn unknown_device_fails() {
        let (_backend, registry) = registry();
        assert!(matches!(
            registry.lease("missing"),
            Err(crate::models::error::EngineError::DeviceNotFound(_))
        ));
    }
}
