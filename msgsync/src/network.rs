//! Network Monitor: current connectivity plus a stream of transitions.
//!
//! The platform layer reports connectivity through [`NetworkMonitor::set_status`].
//! Consumers either poll [`NetworkMonitor::current_status`], register a
//! callback with [`NetworkMonitor::on_change`], or take a
//! [`tokio::sync::watch`] receiver from [`NetworkMonitor::subscribe`]
//! (the engine actor does the latter).

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tokio::sync::watch;

/// Connectivity as reported by the platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NetworkStatus {
    /// A network interface is up.
    pub connected: bool,
    /// The Remote Store is reachable through it.
    pub reachable: bool,
}

impl NetworkStatus {
    /// Connected and reachable.
    pub const ONLINE: Self = Self {
        connected: true,
        reachable: true,
    };

    /// No connectivity.
    pub const OFFLINE: Self = Self {
        connected: false,
        reachable: false,
    };

    /// Whether a delivery attempt can be made right now.
    #[must_use]
    pub const fn is_online(&self) -> bool {
        self.connected && self.reachable
    }
}

/// Direction of a connectivity change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Went from offline to online.
    Reconnected,
    /// Went from online to offline.
    Disconnected,
    /// Changed detail without crossing the online boundary.
    Unchanged,
}

impl Transition {
    /// Classifies a change from `previous` to `current`.
    #[must_use]
    pub const fn between(previous: NetworkStatus, current: NetworkStatus) -> Self {
        match (previous.is_online(), current.is_online()) {
            (false, true) => Self::Reconnected,
            (true, false) => Self::Disconnected,
            _ => Self::Unchanged,
        }
    }
}

type Listener = Arc<dyn Fn(NetworkStatus, NetworkStatus) + Send + Sync>;

struct Inner {
    status: watch::Sender<NetworkStatus>,
    listeners: Mutex<HashMap<u64, Listener>>,
    next_listener: AtomicU64,
}

/// Observes connectivity. Clones share the same state.
#[derive(Clone)]
pub struct NetworkMonitor {
    inner: Arc<Inner>,
}

impl NetworkMonitor {
    /// Creates a monitor with the given initial status.
    #[must_use]
    pub fn new(initial: NetworkStatus) -> Self {
        let (status, _) = watch::channel(initial);
        Self {
            inner: Arc::new(Inner {
                status,
                listeners: Mutex::new(HashMap::new()),
                next_listener: AtomicU64::new(0),
            }),
        }
    }

    /// The latest reported connectivity.
    #[must_use]
    pub fn current_status(&self) -> NetworkStatus {
        *self.inner.status.borrow()
    }

    /// Records new connectivity and notifies observers if it changed.
    ///
    /// Returns the transition that was observed.
    pub fn set_status(&self, status: NetworkStatus) -> Transition {
        let mut previous = status;
        let changed = self.inner.status.send_if_modified(|current| {
            if *current == status {
                return false;
            }
            previous = *current;
            *current = status;
            true
        });
        if !changed {
            return Transition::Unchanged;
        }

        let transition = Transition::between(previous, status);
        tracing::debug!(
            connected = status.connected,
            reachable = status.reachable,
            ?transition,
            "network status changed"
        );

        // Snapshot the listeners so callbacks may (un)register without deadlocking.
        let listeners: Vec<Listener> = self.inner.listeners.lock().values().cloned().collect();
        for listener in listeners {
            listener(previous, status);
        }
        transition
    }

    /// Registers a callback invoked with `(previous, current)` on every change.
    ///
    /// The callback stays registered until the returned [`Subscription`]
    /// is dropped or [`Subscription::unsubscribe`] is called.
    pub fn on_change<F>(&self, callback: F) -> Subscription
    where
        F: Fn(NetworkStatus, NetworkStatus) + Send + Sync + 'static,
    {
        let id = self.inner.next_listener.fetch_add(1, Ordering::Relaxed);
        self.inner.listeners.lock().insert(id, Arc::new(callback));
        Subscription {
            id,
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// A receiver that observes every status change.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<NetworkStatus> {
        self.inner.status.subscribe()
    }
}

/// Handle that unregisters an [`NetworkMonitor::on_change`] callback on drop.
pub struct Subscription {
    id: u64,
    inner: std::sync::Weak<Inner>,
}

impl Subscription {
    /// Unregisters the callback now.
    pub fn unsubscribe(self) {
        drop(self);
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.upgrade() {
            inner.listeners.lock().remove(&self.id);
        }
    }
}
