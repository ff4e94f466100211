//! In-process transport for simulations and tests.
//!
//! A [`MemoryNetwork`] is a hub of named endpoints. Each node gets its own
//! [`MemoryTransport`] from the hub; taking an address offline makes every
//! send to or from it fail as unreachable, which is how tests model a
//! neighbor dropping off the network.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::error::NetworkError;
use crate::transport::{Bound, INBOUND_CHANNEL_CAPACITY, Transport};

#[derive(Default)]
struct Hub {
    endpoints: HashMap<String, mpsc::Sender<Vec<u8>>>,
    offline: HashSet<String>,
}

/// Shared in-memory network. Cloning yields another handle to the same hub.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    hub: Arc<Mutex<Hub>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// A fresh, unbound endpoint on this network.
    pub fn transport(&self) -> MemoryTransport {
        MemoryTransport {
            network: self.clone(),
            bound: Mutex::new(None),
        }
    }

    /// Take an address off the network (or bring it back).
    pub fn set_offline(&self, addr: &str, offline: bool) {
        let mut hub = self.hub.lock();
        if offline {
            hub.offline.insert(addr.to_string());
        } else {
            hub.offline.remove(addr);
        }
    }

    pub fn is_offline(&self, addr: &str) -> bool {
        self.hub.lock().offline.contains(addr)
    }
}

/// One node's endpoint on a [`MemoryNetwork`].
pub struct MemoryTransport {
    network: MemoryNetwork,
    bound: Mutex<Option<String>>,
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn bind(&self, addr: &str) -> Result<Bound, NetworkError> {
        let (tx, frames) = mpsc::channel(INBOUND_CHANNEL_CAPACITY);
        {
            let mut hub = self.network.hub.lock();
            if hub
                .endpoints
                .get(addr)
                .is_some_and(|existing| !existing.is_closed())
            {
                return Err(NetworkError::Transport(format!("address {addr} already bound")));
            }
            hub.endpoints.insert(addr.to_string(), tx);
        }
        *self.bound.lock() = Some(addr.to_string());
        Ok(Bound {
            local_addr: addr.to_string(),
            frames,
        })
    }

    async fn send(&self, addr: &str, frame: Vec<u8>) -> Result<(), NetworkError> {
        let from = self.bound.lock().clone();
        let tx = {
            let hub = self.network.hub.lock();
            if from.as_ref().is_some_and(|f| hub.offline.contains(f)) {
                return Err(NetworkError::PeerUnreachable(format!(
                    "{addr}: local endpoint offline"
                )));
            }
            if hub.offline.contains(addr) {
                return Err(NetworkError::PeerUnreachable(format!("{addr}: offline")));
            }
            hub.endpoints
                .get(addr)
                .cloned()
                .ok_or_else(|| NetworkError::PeerUnreachable(format!("{addr}: no such endpoint")))?
        };
        tx.send(frame)
            .await
            .map_err(|_| NetworkError::PeerUnreachable(format!("{addr}: endpoint closed")))
    }

    async fn close(&self) {
        let Some(addr) = self.bound.lock().take() else {
            return;
        };
        self.network.hub.lock().endpoints.remove(&addr);
    }
}
