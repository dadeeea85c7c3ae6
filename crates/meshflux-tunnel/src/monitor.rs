//! Default-interface monitoring
//!
//! Wraps OS network-path notifications into [`InterfaceUpdateEvent`]s for
//! the engine. Starting blocks until the first event reached the listener;
//! later events are pushed from the path source's own context.

use crate::error::{Result, TunnelError};
use serde::Serialize;
use std::sync::{mpsc, Arc, Mutex, PoisonError};
use tracing::{debug, info};

/// Reachability of a network path
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PathStatus {
    Satisfied,
    Unsatisfied,
    RequiresConnection,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InterfaceKind {
    Wifi,
    Cellular,
    WiredEthernet,
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NetworkInterface {
    pub name: String,
    pub index: i32,
    pub kind: InterfaceKind,
}

/// Snapshot of the system network path, ordered by preference
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkPath {
    pub status: PathStatus,
    pub available_interfaces: Vec<NetworkInterface>,
    pub is_expensive: bool,
    pub is_constrained: bool,
}

impl NetworkPath {
    pub fn unsatisfied() -> Self {
        Self {
            status: PathStatus::Unsatisfied,
            available_interfaces: Vec::new(),
            is_expensive: false,
            is_constrained: false,
        }
    }
}

/// Default interface as reported to the engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceUpdateEvent {
    pub name: String,
    /// `-1` when there is no usable interface
    pub index: i32,
    pub is_expensive: bool,
    pub is_constrained: bool,
}

impl InterfaceUpdateEvent {
    /// Sentinel sent when no route is available
    pub fn none() -> Self {
        Self {
            name: String::new(),
            index: -1,
            is_expensive: false,
            is_constrained: false,
        }
    }

    pub fn from_path(path: &NetworkPath) -> Self {
        if path.status == PathStatus::Unsatisfied {
            return Self::none();
        }

        match path.available_interfaces.first() {
            Some(interface) => Self {
                name: interface.name.clone(),
                index: interface.index,
                is_expensive: path.is_expensive,
                is_constrained: path.is_constrained,
            },
            None => Self::none(),
        }
    }
}

/// Receives default-interface changes
pub trait InterfaceUpdateListener: Send + Sync {
    fn update_default_interface(&self, event: InterfaceUpdateEvent);
}

/// Callback invoked by a [`PathMonitor`] for every path change
pub type PathHandler = Arc<dyn Fn(NetworkPath) + Send + Sync>;

/// OS source of network-path notifications
pub trait PathMonitor: Send + Sync {
    /// Start delivering path changes to `handler`, beginning with the current path
    fn start(&self, handler: PathHandler) -> Box<dyn PathSubscription>;
}

/// A running path-notification subscription
pub trait PathSubscription: Send + Sync {
    /// Latest path seen, `None` before the first notification
    fn current_path(&self) -> Option<NetworkPath>;

    fn cancel(&self);
}

/// Delivery switch shared with the path handler.
///
/// The handler holds the lock for the whole delivery, so clearing it waits
/// for an in-flight event to finish.
type DeliveryGuard = Arc<Mutex<bool>>;

fn stop_delivery(guard: &DeliveryGuard) {
    *guard.lock().unwrap_or_else(PoisonError::into_inner) = false;
}

struct ActiveMonitor {
    subscription: Box<dyn PathSubscription>,
    delivering: DeliveryGuard,
}

impl ActiveMonitor {
    fn close(self) {
        stop_delivery(&self.delivering);
        self.subscription.cancel();
    }
}

/// Default-interface monitor owned by the platform bridge
pub struct InterfaceMonitor {
    source: Arc<dyn PathMonitor>,
    active: Mutex<Option<ActiveMonitor>>,
}

impl InterfaceMonitor {
    pub fn new(source: Arc<dyn PathMonitor>) -> Self {
        Self {
            source,
            active: Mutex::new(None),
        }
    }

    /// Start monitoring and block until `listener` received the first event.
    ///
    /// Must be called from a thread that may block. A monitor that is
    /// already running is closed and replaced. The listener must not call
    /// back into this monitor.
    pub fn start(&self, listener: Arc<dyn InterfaceUpdateListener>) -> Result<()> {
        self.close();

        let delivering: DeliveryGuard = Arc::new(Mutex::new(true));
        let (first_tx, first_rx) = mpsc::sync_channel::<()>(1);
        let first_tx = Mutex::new(Some(first_tx));

        let guard = delivering.clone();
        let handler: PathHandler = Arc::new(move |path: NetworkPath| {
            let delivering = guard.lock().unwrap_or_else(PoisonError::into_inner);
            if !*delivering {
                return;
            }

            let event = InterfaceUpdateEvent::from_path(&path);
            debug!(
                "Default interface: {:?} (index {})",
                event.name, event.index
            );
            listener.update_default_interface(event);
            drop(delivering);

            let first = first_tx
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take();
            if let Some(tx) = first {
                let _ = tx.send(());
            }
        });

        let subscription = self.source.start(handler);

        if first_rx.recv().is_err() {
            // The source dropped the handler without ever calling it
            stop_delivery(&delivering);
            subscription.cancel();
            return Err(TunnelError::BridgeAborted);
        }

        let previous = self
            .active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(ActiveMonitor {
                subscription,
                delivering,
            });
        if let Some(previous) = previous {
            previous.close();
        }

        info!("Default interface monitor started");
        Ok(())
    }

    /// Stop monitoring. Waits for an event being delivered, and no event
    /// reaches the listener once this returns. No-op when idle.
    pub fn close(&self) {
        let active = self
            .active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(active) = active {
            active.close();
            info!("Default interface monitor closed");
        }
    }

    pub fn is_running(&self) -> bool {
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Interfaces of the current path; empty when unsatisfied or not monitoring
    pub fn interfaces(&self) -> Vec<NetworkInterface> {
        let active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
        match active.as_ref().and_then(|a| a.subscription.current_path()) {
            Some(path) if path.status != PathStatus::Unsatisfied => path.available_interfaces,
            _ => Vec::new(),
        }
    }
}

impl Drop for InterfaceMonitor {
    fn drop(&mut self) {
        self.close();
    }
}
