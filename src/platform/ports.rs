//! Local port allocation for supervised processes.

use std::collections::{HashMap, HashSet};
use std::net::{Ipv4Addr, SocketAddrV4, TcpListener};
use std::sync::Mutex;

use crate::errors::{PlatformError, PlatformResult};

/// Hands out ports from `[start, end)`, at most one lease per port.
pub struct PortPool {
    start: u16,
    end: u16,
    leases: Mutex<HashMap<u16, String>>,
}

impl PortPool {
    pub fn new(start: u16, end: u16) -> Self {
        Self {
            start,
            end,
            leases: Mutex::new(HashMap::new()),
        }
    }

    fn leases(&self) -> std::sync::MutexGuard<'_, HashMap<u16, String>> {
        // A poisoned map is still a consistent set of leases.
        self.leases.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Lease the first port that is not leased, not in `reserved` and bindable.
    pub fn allocate(&self, app: &str, reserved: &HashSet<u16>) -> PlatformResult<u16> {
        let mut leases = self.leases();
        for port in self.start..self.end {
            if leases.contains_key(&port) || reserved.contains(&port) {
                continue;
            }
            if !port_is_free(port) {
                tracing::debug!(port, "port in use by a foreign process");
                continue;
            }
            leases.insert(port, app.to_string());
            return Ok(port);
        }
        Err(PlatformError::PortsExhausted)
    }

    /// Re-lease a previously assigned port. Succeeds if `app` already holds it.
    pub fn lease(&self, app: &str, port: u16) -> PlatformResult<()> {
        let mut leases = self.leases();
        match leases.get(&port) {
            Some(holder) if holder != app => Err(PlatformError::process(
                app,
                format!("port {} is held by '{}'", port, holder),
            )),
            _ => {
                leases.insert(port, app.to_string());
                Ok(())
            }
        }
    }

    /// Release `port` if `app` holds it.
    pub fn release(&self, app: &str, port: u16) {
        let mut leases = self.leases();
        if leases.get(&port).is_some_and(|holder| holder == app) {
            leases.remove(&port);
        }
    }

    pub fn holder(&self, port: u16) -> Option<String> {
        self.leases().get(&port).cloned()
    }

    pub fn leased_count(&self) -> usize {
        self.leases().len()
    }
}

/// True when nothing is listening on `127.0.0.1:port`.
pub fn port_is_free(port: u16) -> bool {
    TcpListener::bind(SocketAddrV4::new(Ipv4Addr::LOCALHOST, port)).is_ok()
}
