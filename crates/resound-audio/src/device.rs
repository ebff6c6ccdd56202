//! Device Management
//!
//! Enumerates output devices once at startup and opens the preferred one.
//! Every mixer is registered with the native device manager.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use crossbeam::channel::{Receiver, Sender, unbounded};
use parking_lot::{Mutex, RwLock};
use resound_core::{AtomicHandle, Pending};
use resound_platform::{ManagerHandle, MixerHandle};

use crate::context::AudioContext;
use crate::{AudioError, AudioResult};

/// Device notifications
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceEvent {
    /// A device was found during enumeration
    Added(String),
    /// A device was opened
    Opened(String),
    /// Opening failed; holds the requested device
    OpenFailed(Option<String>),
}

/// Output device enumeration and selection
pub struct DeviceManager {
    ctx: AudioContext,
    self_ref: Weak<DeviceManager>,
    handle: AtomicHandle<ManagerHandle>,
    devices: RwLock<Vec<String>>,
    preferred: Mutex<Option<String>>,
    current: RwLock<Option<String>>,
    ready: AtomicBool,
    events_tx: Sender<DeviceEvent>,
    events_rx: Receiver<DeviceEvent>,
    disposed: AtomicBool,
}

impl DeviceManager {
    /// Create the native manager, enumerate devices and schedule opening
    /// the preferred one. Must run on the owning thread.
    pub(crate) fn new(ctx: &AudioContext, preferred: Option<String>) -> AudioResult<Arc<Self>> {
        let handle = ctx
            .backend
            .create_manager()
            .ok_or(AudioError::NativeCall("create_manager"))?;
        let devices = ctx.backend.list_devices(handle);
        log::info!("Found {} audio device(s): {:?}", devices.len(), devices);

        let (events_tx, events_rx) = unbounded();
        for device in &devices {
            let _ = events_tx.send(DeviceEvent::Added(device.clone()));
        }

        let manager = Arc::new_cyclic(|self_ref| Self {
            ctx: ctx.clone(),
            self_ref: self_ref.clone(),
            handle: AtomicHandle::new(Some(handle)),
            devices: RwLock::new(devices),
            preferred: Mutex::new(preferred),
            current: RwLock::new(None),
            ready: AtomicBool::new(false),
            events_tx,
            events_rx,
            disposed: AtomicBool::new(false),
        });

        drop(manager.reopen());
        Ok(manager)
    }

    /// Names of the devices found at startup
    pub fn list_devices(&self) -> Vec<String> {
        self.devices.read().clone()
    }

    /// Switch to `name`, or the backend default for `None`
    pub fn set_device(&self, name: Option<String>) -> Pending<bool> {
        *self.preferred.lock() = name;
        self.reopen()
    }

    /// Device requested by configuration or [`DeviceManager::set_device`]
    pub fn preferred_device(&self) -> Option<String> {
        self.preferred.lock().clone()
    }

    /// Device currently open
    pub fn current_device(&self) -> Option<String> {
        self.current.read().clone()
    }

    /// Whether a device is open and usable
    pub fn is_current_device_valid(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    /// Receiver for device notifications
    pub fn events(&self) -> Receiver<DeviceEvent> {
        self.events_rx.clone()
    }

    /// Native handle, `None` once disposed
    pub fn handle(&self) -> Option<ManagerHandle> {
        self.handle.load()
    }

    fn reopen(&self) -> Pending<bool> {
        match self.self_ref.upgrade() {
            Some(manager) => self
                .ctx
                .schedule("device_open", move || manager.init_current_device()),
            None => Pending::ready(false),
        }
    }

    fn init_current_device(&self) -> bool {
        if self.disposed.load(Ordering::Acquire) {
            return false;
        }
        let Some(handle) = self.handle.load() else {
            return false;
        };

        let preferred = self.preferred_device();
        if !self.ctx.backend.open_device(handle, preferred.as_deref()) {
            log::error!("Audio device cannot be used! Check your audio system.");
            self.ready.store(false, Ordering::Release);
            *self.current.write() = None;
            let _ = self.events_tx.send(DeviceEvent::OpenFailed(preferred));
            return false;
        }

        let devices = self.devices.read();
        let name = preferred
            .filter(|name| devices.contains(name))
            .or_else(|| devices.first().cloned())
            .unwrap_or_else(|| String::from("Default"));
        drop(devices);

        log::info!("Opened audio device '{}'", name);
        *self.current.write() = Some(name.clone());
        self.ready.store(true, Ordering::Release);
        let _ = self.events_tx.send(DeviceEvent::Opened(name));
        true
    }

    pub(crate) fn attach_mixer(&self, mixer: MixerHandle) {
        if let Some(handle) = self.handle.load() {
            self.ctx.backend.add_mixer(handle, mixer);
        }
    }

    pub(crate) fn detach_mixer(&self, mixer: MixerHandle) {
        if let Some(handle) = self.handle.load() {
            self.ctx.backend.remove_mixer(handle, mixer);
        }
    }

    /// Destroy the native manager
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.ready.store(false, Ordering::Release);
        let Some(handle) = self.handle.take() else {
            return;
        };
        let backend = self.ctx.backend.clone();
        self.ctx.post("device_dispose", move || backend.destroy_manager(handle));
    }
}

impl Drop for DeviceManager {
    fn drop(&mut self) {
        self.dispose();
    }
}
