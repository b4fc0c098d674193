use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Instant;

use tracing::debug;

use types::{AddressBook, Endpoint};

use crate::{HandlerId, Transport};

#[derive(Debug, Clone)]
struct Tracked {
    endpoint: Endpoint,
    last_seen: Option<Instant>,
}

/// Known endpoints keyed by source tag, kept current from inbound traffic.
#[derive(Debug, Clone)]
pub struct EndpointTable {
    entries: Arc<RwLock<HashMap<String, Tracked>>>,
    default_port: u16,
}

impl EndpointTable {
    pub fn new(default_port: u16) -> Self {
        Self {
            entries: Arc::new(RwLock::new(HashMap::new())),
            default_port,
        }
    }

    pub fn insert(&self, endpoint: Endpoint) {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        entries.insert(
            endpoint.source_tag.clone(),
            Tracked {
                endpoint,
                last_seen: None,
            },
        );
    }

    pub fn remove(&self, source_tag: &str) -> Option<Endpoint> {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(source_tag)
            .map(|tracked| tracked.endpoint)
    }

    pub fn get(&self, source_tag: &str) -> Option<Endpoint> {
        self.read(source_tag, |tracked| tracked.endpoint.clone())
    }

    pub fn last_seen(&self, source_tag: &str) -> Option<Instant> {
        self.read(source_tag, |tracked| tracked.last_seen).flatten()
    }

    pub fn endpoints(&self) -> Vec<Endpoint> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(|tracked| tracked.endpoint.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Records traffic from `src`. Unknown tags are ignored; returns whether the address moved.
    pub fn observe(&self, src: &str, remote: SocketAddr) -> bool {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let Some(tracked) = entries.get_mut(src) else {
            return false;
        };
        tracked.last_seen = Some(Instant::now());

        let moved = tracked.endpoint.ip != Some(remote.ip())
            || tracked.endpoint.port.unwrap_or(self.default_port) != remote.port();
        if moved {
            debug!(device = %src, %remote, "endpoint address updated");
            tracked.endpoint.ip = Some(remote.ip());
            tracked.endpoint.port = Some(remote.port());
        }
        moved
    }

    /// Keeps the table current from every inbound frame on `transport`.
    pub fn attach(&self, transport: &Transport) -> HandlerId {
        let table = self.clone();
        transport.on(move |frame, remote| {
            table.observe(&frame.src, remote);
        })
    }

    fn read<T>(&self, source_tag: &str, f: impl FnOnce(&Tracked) -> T) -> Option<T> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(source_tag)
            .map(f)
    }
}

impl AddressBook for EndpointTable {
    fn address_of(&self, device_id: &str) -> Option<SocketAddr> {
        self.get(device_id)?.socket_addr(self.default_port)
    }
}
