//! Communication audit log and connection registry.

use std::collections::{BTreeMap, VecDeque};
use std::net::SocketAddr;
use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Local};
use serde::Serialize;

/// Origin of an audit entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogDirection {
    /// Frame received from a device
    Device,
    /// Response written by this engine
    Server,
    Info,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Local>,
    pub client_name: String,
    pub address: String,
    pub payload: String,
    pub direction: LogDirection,
}

/// Fixed-capacity log that evicts its oldest entry first
#[derive(Debug)]
pub struct CommunicationLog {
    capacity: usize,
    entries: Mutex<VecDeque<LogEntry>>,
}

impl CommunicationLog {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            entries: Mutex::new(VecDeque::with_capacity(capacity)),
        }
    }

    pub fn append(&self, entry: LogEntry) {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        while entries.len() >= self.capacity {
            entries.pop_front();
        }
        entries.push_back(entry);
    }

    /// Copy of all entries, oldest first
    pub fn snapshot(&self) -> Vec<LogEntry> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }
}

/// Display name used before a device has identified itself
pub const UNKNOWN_CLIENT: &str = "Unknown";

/// Active connections with their learned device names, plus the audit log
#[derive(Debug)]
pub struct ConnectionRegistry {
    connections: Mutex<BTreeMap<SocketAddr, Option<String>>>,
    log: CommunicationLog,
}

impl ConnectionRegistry {
    pub fn new(log_capacity: usize) -> Self {
        Self {
            connections: Mutex::new(BTreeMap::new()),
            log: CommunicationLog::new(log_capacity),
        }
    }

    pub fn register(&self, address: SocketAddr) {
        self.lock().insert(address, None);
        self.record(address, LogDirection::Info, "Connected");
    }

    pub fn unregister(&self, address: SocketAddr) {
        // record first so the entry still carries the learned name
        self.record(address, LogDirection::Info, "Disconnected");
        self.lock().remove(&address);
    }

    pub fn set_name(&self, address: SocketAddr, name: &str) {
        if let Some(slot) = self.lock().get_mut(&address) {
            if slot.as_deref() != Some(name) {
                *slot = Some(name.to_string());
            }
        }
    }

    pub fn display_name(&self, address: SocketAddr) -> String {
        self.lock()
            .get(&address)
            .and_then(|name| name.clone())
            .unwrap_or_else(|| UNKNOWN_CLIENT.to_string())
    }

    /// Append an entry attributed to a connection
    pub fn record(&self, address: SocketAddr, direction: LogDirection, payload: &str) {
        self.log.append(LogEntry {
            timestamp: Local::now(),
            client_name: self.display_name(address),
            address: address.to_string(),
            payload: payload.to_string(),
            direction,
        });
    }

    /// Active connections and their display names
    pub fn connections(&self) -> BTreeMap<SocketAddr, String> {
        self.lock()
            .iter()
            .map(|(address, name)| {
                (
                    *address,
                    name.clone().unwrap_or_else(|| UNKNOWN_CLIENT.to_string()),
                )
            })
            .collect()
    }

    pub fn log(&self) -> &CommunicationLog {
        &self.log
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<SocketAddr, Option<String>>> {
        self.connections.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(payload: &str) -> LogEntry {
        LogEntry {
            timestamp: Local::now(),
            client_name: UNKNOWN_CLIENT.to_string(),
            address: "127.0.0.1:5000".to_string(),
            payload: payload.to_string(),
            direction: LogDirection::Device,
        }
    }

    #[test]
    fn log_evicts_oldest_first() {
        let log = CommunicationLog::new(3);
        for i in 0..5 {
            log.append(entry(&i.to_string()));
        }
        let payloads: Vec<String> = log.snapshot().into_iter().map(|e| e.payload).collect();
        assert_eq!(payloads, vec!["2", "3", "4"]);
    }

    #[test]
    fn registry_learns_names() {
        let registry = ConnectionRegistry::new(10);
        let address: SocketAddr = "10.0.0.5:40000".parse().unwrap();

        registry.register(address);
        assert_eq!(registry.connections()[&address], UNKNOWN_CLIENT);

        registry.set_name(address, "GenruiKT60^Lab");
        registry.record(address, LogDirection::Device, "MSH|...");
        registry.unregister(address);

        assert!(registry.connections().is_empty());
        let entries = registry.log().snapshot();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].client_name, UNKNOWN_CLIENT);
        assert_eq!(entries[1].client_name, "GenruiKT60^Lab");
        assert_eq!(entries[2].payload, "Disconnected");
        assert_eq!(entries[2].direction, LogDirection::Info);
    }

    #[test]
    fn names_for_unknown_addresses_are_ignored() {
        let registry = ConnectionRegistry::new(10);
        let address: SocketAddr = "10.0.0.5:40000".parse().unwrap();
        registry.set_name(address, "Ghost");
        assert!(registry.connections().is_empty());
    }
}
