#![forbid(unsafe_code)]

use crate::backend::{Backend, BackendInfo};
use crate::discovery::{HostListener, ProcessRegistry};
use crate::error::Error;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Opens the local registry facility. Called once, on the first successful
/// activation; later activations resume the same connection.
pub type RegistryConnector = Box<dyn Fn() -> Result<Box<dyn ProcessRegistry>, Error> + Send + Sync>;

struct Poller {
    listener: HostListener,
    registry: Option<Box<dyn ProcessRegistry>>,
}

/// Drives the [`HostListener`] on its own task while active.
pub struct VmMonitorBackend {
    info: BackendInfo,
    connect: RegistryConnector,
    interval: Duration,
    poller: Arc<tokio::sync::Mutex<Poller>>,
    /// Connected registry not yet picked up by a poll task.
    pending: Arc<Mutex<Option<Box<dyn ProcessRegistry>>>>,
    connected: AtomicBool,
    running: Mutex<Option<CancellationToken>>,
}

impl VmMonitorBackend {
    pub fn new(
        info: BackendInfo,
        listener: HostListener,
        connect: RegistryConnector,
        interval: Duration,
    ) -> Self {
        Self {
            info,
            connect,
            interval,
            poller: Arc::new(tokio::sync::Mutex::new(Poller {
                listener,
                registry: None,
            })),
            pending: Arc::new(Mutex::new(None)),
            connected: AtomicBool::new(false),
            running: Mutex::new(None),
        }
    }

    /// The registry remembers which pids it already reported, so a second
    /// connection would announce every running VM as started again.
    fn connect_registry(&self) -> Result<(), Error> {
        if self.connected.load(Ordering::Acquire) {
            return Ok(());
        }
        let registry = (self.connect)()?;
        *self.pending.lock() = Some(registry);
        self.connected.store(true, Ordering::Release);
        Ok(())
    }
}

impl Backend for VmMonitorBackend {
    fn info(&self) -> &BackendInfo {
        &self.info
    }

    fn activate(&self) -> bool {
        let mut running = self.running.lock();
        if running.is_some() {
            return true;
        }
        let Ok(handle) = Handle::try_current() else {
            warn!(backend = %self.info.name, "cannot activate outside of a tokio runtime");
            return false;
        };
        if let Err(err) = self.connect_registry() {
            warn!(backend = %self.info.name, %err, "unable to connect to the vm registry; backend stays inactive");
            return false;
        }

        let cancel = CancellationToken::new();
        let poller = Arc::clone(&self.poller);
        let pending = Arc::clone(&self.pending);
        let interval = self.interval;
        let token = cancel.clone();
        let name = self.info.name.clone();
        handle.spawn(async move {
            let mut guard = poller.lock().await;
            let Poller { listener, registry } = &mut *guard;
            let fresh = pending.lock().take();
            if fresh.is_some() {
                *registry = fresh;
            }
            if token.is_cancelled() {
                return;
            }
            match registry {
                Some(registry) => listener.run_until(registry.as_mut(), interval, token).await,
                None => warn!(backend = %name, "no registry connection; poll task exits"),
            }
        });
        *running = Some(cancel);
        info!(backend = %self.info.name, interval = ?self.interval, "vm monitor activated");
        true
    }

    fn deactivate(&self) -> bool {
        if let Some(cancel) = self.running.lock().take() {
            cancel.cancel();
            info!(backend = %self.info.name, "vm monitor deactivated");
        }
        true
    }

    fn is_active(&self) -> bool {
        self.running.lock().is_some()
    }
}
