//! Owns the set of downstream client sockets: id assignment, broadcast,
//! and removal. Grounded on `ServerState.clients: Arc<DashMap<SocketAddr,
//! ClientInfo>>` in `server.rs`, generalized to monotonic `u64` ids (a
//! `SocketAddr` key can be reused across reconnects from the same peer,
//! but ids must never be reassigned within a process lifetime).

use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::AbortHandle;
use tracing::{debug, warn};

pub struct ClientHandle {
    pub addr: String,
    tx: UnboundedSender<Vec<u8>>,
    abort: Option<AbortHandle>,
}

#[derive(Default)]
pub struct ClientRegistry {
    clients: DashMap<u64, ClientHandle>,
    next_id: AtomicU64,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self {
            clients: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    /// Assign the next id, register the client's outbound channel, and
    /// return the id. Ids are never reused within the process lifetime.
    pub fn insert(&self, addr: String, tx: UnboundedSender<Vec<u8>>) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.clients.insert(id, ClientHandle { addr, tx, abort: None });
        debug!(id, population = self.clients.len(), "client registered");
        id
    }

    /// Attach the abort handle of the task driving `id`'s connection, once
    /// that task has been spawned. Lets `clear()` force-close a client's
    /// blocked read instead of only dropping its outbound channel.
    pub fn attach_abort_handle(&self, id: u64, abort: AbortHandle) {
        if let Some(mut entry) = self.clients.get_mut(&id) {
            entry.abort = Some(abort);
        }
    }

    /// Idempotent: removing an id that is already gone is a no-op.
    pub fn remove(&self, id: u64) {
        if self.clients.remove(&id).is_some() {
            debug!(id, population = self.clients.len(), "client removed");
        }
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    /// Abort every client's connection task (unblocking any in-flight read)
    /// and drop its outbound channel.
    pub fn clear(&self) {
        for entry in self.clients.iter() {
            if let Some(abort) = &entry.value().abort {
                abort.abort();
            }
        }
        self.clients.clear();
    }

    /// Enqueue `bytes` for every connected client except `exclude_id`.
    ///
    /// Carries a quirk worth noting: the exclusion check treats
    /// `exclude_id` as falsy when it is zero, so excluding client 0 never
    /// takes effect. Ids are assigned starting at 1, so this is presently
    /// unreachable — kept intentionally rather than changed; see
    /// DESIGN.md.
    pub fn broadcast(&self, bytes: &[u8], exclude_id: Option<u64>) {
        let snapshot: Vec<(u64, UnboundedSender<Vec<u8>>)> = self
            .clients
            .iter()
            .filter(|entry| {
                !exclude_id.is_some_and(|id| id != 0 && id == *entry.key())
            })
            .map(|entry| (*entry.key(), entry.value().tx.clone()))
            .collect();

        let mut dead = Vec::new();
        for (id, tx) in snapshot {
            if tx.send(bytes.to_vec()).is_err() {
                dead.push(id);
            }
        }
        for id in dead {
            warn!(id, "dropping client with closed outbound channel");
            self.remove(id);
        }
    }
}
