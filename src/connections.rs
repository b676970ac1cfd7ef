//! Arena of live connections.
//!
//! Rosters only store [`ConnId`]s; this table resolves an id to the channel
//! feeding that connection's socket writer.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;
use tokio::sync::mpsc;
use tracing::trace;

use crate::protocol::ServerEvent;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnId(pub u64);

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Work item for a socket writer.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Event(ServerEvent),
    /// Flush what is queued, then close the socket.
    Close,
}

#[derive(Default)]
pub struct Connections {
    next: AtomicU64,
    senders: RwLock<HashMap<ConnId, mpsc::UnboundedSender<Outbound>>>,
}

impl Connections {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocates a handle and the receiver its writer drains.
    pub fn register(&self) -> (ConnId, mpsc::UnboundedReceiver<Outbound>) {
        let id = ConnId(self.next.fetch_add(1, Ordering::Relaxed) + 1);
        let (tx, rx) = mpsc::unbounded_channel();
        self.senders
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, tx);
        (id, rx)
    }

    pub fn unregister(&self, id: ConnId) {
        self.senders
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&id);
    }

    pub fn is_connected(&self, id: ConnId) -> bool {
        self.senders
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(&id)
    }

    pub fn send(&self, id: ConnId, event: ServerEvent) {
        self.push(id, Outbound::Event(event));
    }

    /// Sends `event` to every id in `targets` except `except`.
    pub fn broadcast(
        &self,
        targets: impl IntoIterator<Item = ConnId>,
        except: Option<ConnId>,
        event: &ServerEvent,
    ) {
        let senders = self.senders.read().unwrap_or_else(|e| e.into_inner());
        for id in targets {
            if Some(id) == except {
                continue;
            }
            if let Some(tx) = senders.get(&id) {
                let _ = tx.send(Outbound::Event(event.clone()));
            }
        }
    }

    /// Asks the connection's writer to close the socket. The handle stays
    /// registered until the connection task unregisters it.
    pub fn close(&self, id: ConnId) {
        self.push(id, Outbound::Close);
    }

    fn push(&self, id: ConnId, item: Outbound) {
        let senders = self.senders.read().unwrap_or_else(|e| e.into_inner());
        match senders.get(&id) {
            Some(tx) => {
                let _ = tx.send(item);
            }
            None => trace!(conn = %id, "dropping message for closed connection"),
        }
    }
}
