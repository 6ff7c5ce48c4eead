//! Shared connection to the system service bus.
//!
//! The manager owns at most one live connection. Callers borrow a
//! [`BusHandle`] for a single call and report failures back through
//! [`ConnectionManager::report_failure`]; the next [`ConnectionManager::acquire`]
//! then reconnects instead of handing out the dead handle again.

pub mod dbus;

use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use anyhow::{anyhow, Result};
use futures::future::BoxFuture;

/// One row of the service manager's unit listing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawUnit {
    pub name: String,
    pub description: String,
    pub active_state: String,
    pub sub_state: String,
}

/// A network device as reported by the network manager
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawDevice {
    pub interface: String,
    /// Network manager device type code
    pub device_type: u32,
    pub ipv4: Vec<String>,
}

/// Queries this daemon runs against the bus. Each is independently fallible.
pub trait Bus: Send + Sync {
    fn list_units(&self) -> BoxFuture<'_, Result<Vec<RawUnit>>>;
    fn network_devices(&self) -> BoxFuture<'_, Result<Vec<RawDevice>>>;
}

/// Establishes new bus connections
pub trait BusConnector: Send + Sync {
    fn connect(&self) -> BoxFuture<'_, Result<Arc<dyn Bus>>>;
}

/// A borrowed connection, valid for the duration of one call
#[derive(Clone)]
pub struct BusHandle {
    bus: Arc<dyn Bus>,
    generation: u64,
}

impl BusHandle {
    pub fn bus(&self) -> &dyn Bus {
        self.bus.as_ref()
    }
}

/// A call rejected by the remote service on a healthy connection, e.g. the
/// service is not installed. Unlike transport failures and timeouts it does
/// not invalidate the connection.
#[derive(Debug)]
pub struct MethodFailure(pub String);

impl fmt::Display for MethodFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "method call rejected: {}", self.0)
    }
}

impl std::error::Error for MethodFailure {}

fn is_method_failure(e: &anyhow::Error) -> bool {
    e.chain().any(|cause| cause.is::<MethodFailure>())
}

/// Observable connection state
#[cfg(test)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusStatus {
    Disconnected,
    Connecting,
    Connected,
}

enum State {
    Disconnected,
    Connecting,
    Connected(BusHandle),
}

pub struct ConnectionManager {
    connector: Box<dyn BusConnector>,
    state: Mutex<State>,
    /// Held for the whole connect attempt so concurrent acquires share it
    connect_gate: tokio::sync::Mutex<()>,
    generation: Mutex<u64>,
    connect_timeout: Duration,
    call_timeout: Duration,
}

impl ConnectionManager {
    pub fn new(connector: Box<dyn BusConnector>, connect_timeout: Duration, call_timeout: Duration) -> Self {
        Self {
            connector,
            state: Mutex::new(State::Disconnected),
            connect_gate: tokio::sync::Mutex::new(()),
            generation: Mutex::new(0),
            connect_timeout,
            call_timeout,
        }
    }

    #[cfg(test)]
    pub fn status(&self) -> BusStatus {
        match &*self.lock_state() {
            State::Disconnected => BusStatus::Disconnected,
            State::Connecting => BusStatus::Connecting,
            State::Connected(_) => BusStatus::Connected,
        }
    }

    /// Return the live connection, connecting first if needed.
    /// None means the bus is unavailable right now; the next call retries.
    pub async fn acquire(&self) -> Option<BusHandle> {
        if let Some(handle) = self.connected() {
            return Some(handle);
        }

        let _gate = self.connect_gate.lock().await;

        // Another caller may have connected while we waited on the gate
        if let Some(handle) = self.connected() {
            return Some(handle);
        }

        *self.lock_state() = State::Connecting;
        tracing::debug!("Connecting to system bus");

        let result = tokio::time::timeout(self.connect_timeout, self.connector.connect()).await;
        match result {
            Ok(Ok(bus)) => {
                let generation = {
                    let mut generation = self.lock_generation();
                    *generation += 1;
                    *generation
                };
                let handle = BusHandle { bus, generation };
                *self.lock_state() = State::Connected(handle.clone());
                tracing::info!("Connected to system bus");
                Some(handle)
            }
            Ok(Err(e)) => {
                *self.lock_state() = State::Disconnected;
                tracing::warn!("System bus unavailable: {:#}", e);
                None
            }
            Err(_) => {
                *self.lock_state() = State::Disconnected;
                tracing::warn!("System bus connect timed out after {:?}", self.connect_timeout);
                None
            }
        }
    }

    /// Drop the retained connection if it is still the one `handle` refers to.
    /// A stale report about an already replaced connection is ignored.
    pub fn report_failure(&self, handle: &BusHandle) {
        let mut state = self.lock_state();
        if let State::Connected(current) = &*state {
            if current.generation == handle.generation {
                tracing::info!("Dropping failed bus connection");
                *state = State::Disconnected;
            }
        }
    }

    /// Run one query against the bus with the call timeout applied.
    /// Transport failures and timeouts mark the connection for reconnect;
    /// a [`MethodFailure`] leaves it in place.
    pub async fn call<T, F, Fut>(&self, what: &str, op: F) -> Option<T>
    where
        F: FnOnce(BusHandle) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let handle = self.acquire().await?;

        let result = tokio::time::timeout(self.call_timeout, op(handle.clone()))
            .await
            .unwrap_or_else(|_| Err(anyhow!("timed out after {:?}", self.call_timeout)));

        match result {
            Ok(value) => Some(value),
            Err(e) if is_method_failure(&e) => {
                tracing::warn!("Bus call {} rejected: {:#}", what, e);
                None
            }
            Err(e) => {
                tracing::warn!("Bus call {} failed: {:#}", what, e);
                self.report_failure(&handle);
                None
            }
        }
    }

    fn connected(&self) -> Option<BusHandle> {
        match &*self.lock_state() {
            State::Connected(handle) => Some(handle.clone()),
            _ => None,
        }
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_generation(&self) -> std::sync::MutexGuard<'_, u64> {
        self.generation.lock().unwrap_or_else(|e| e.into_inner())
    }
}
