//! Path registry: pairing namespaces keyed by the initiator's public key.
//!
//! A path owns at most one initiator slot and up to 254 responder slots
//! (ids `0x02..=0xff`). All mutations on one path are serialized by that
//! path's own lock; the map of paths is only locked briefly to look up or
//! insert an entry, so distinct paths proceed fully in parallel.
//!
//! Tasks never share connection state directly: a slot holds a
//! [`ConnectionHandle`], and anything addressed to that connection goes
//! through its queue to be written by its own task.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use tracing::debug;
use uuid::Uuid;

use crate::error::SignalingError;
use shoal_core::message::ControlMessage;
use shoal_core::reason::DisconnectReason;
use shoal_core::{ClientId, PathKey};

/// An item on a connection's outbound queue, drained exclusively by the
/// owning task.
pub enum Outbound {
    /// A relayed envelope, forwarded verbatim. The ack fires once the frame
    /// has been written to the destination's stream.
    Relay(Bytes, oneshot::Sender<()>),
    /// A server control message, sealed by the owning task with its own
    /// channel state.
    Control(ControlMessage),
    /// Terminate the connection with the given reason.
    Close(DisconnectReason),
}

/// Routing handle for one registered connection.
#[derive(Clone)]
pub struct ConnectionHandle {
    /// Unique per accepted stream; guards removal after eviction.
    pub serial: Uuid,
    pub tx: mpsc::UnboundedSender<Outbound>,
}

impl ConnectionHandle {
    /// Enqueue a control message, ignoring a closed queue (the target is
    /// already shutting down).
    pub fn notify(&self, message: ControlMessage) {
        let _ = self.tx.send(Outbound::Control(message));
    }

    /// Ask the target to close, ignoring a closed queue.
    pub fn close(&self, reason: DisconnectReason) {
        let _ = self.tx.send(Outbound::Close(reason));
    }
}

/// Result of registering an initiator, snapshotted atomically.
pub struct InitiatorRegistration {
    /// The evicted previous initiator, if the slot was taken.
    pub previous: Option<ConnectionHandle>,
    /// Responders present at registration time.
    pub responders: Vec<(u8, ConnectionHandle)>,
}

/// Result of registering a responder, snapshotted atomically.
pub struct ResponderRegistration {
    pub client_id: u8,
    /// The initiator present at registration time.
    pub initiator: Option<ConnectionHandle>,
}

enum RegisterError {
    /// The path was garbage-collected between lookup and registration;
    /// retry against a fresh entry.
    Retired,
    Full,
}

#[derive(Default)]
struct Slots {
    initiator: Option<ConnectionHandle>,
    responders: HashMap<u8, ConnectionHandle>,
    retired: bool,
}

impl Slots {
    fn is_empty(&self) -> bool {
        self.initiator.is_none() && self.responders.is_empty()
    }
}

/// One pairing namespace.
pub struct Path {
    key: PathKey,
    slots: Mutex<Slots>,
}

impl Path {
    fn new(key: PathKey) -> Self {
        Self {
            key,
            slots: Mutex::new(Slots::default()),
        }
    }

    pub fn key(&self) -> &PathKey {
        &self.key
    }

    async fn try_register_initiator(
        &self,
        handle: ConnectionHandle,
    ) -> Result<InitiatorRegistration, RegisterError> {
        let mut slots = self.slots.lock().await;
        if slots.retired {
            return Err(RegisterError::Retired);
        }

        let previous = slots.initiator.replace(handle);
        let mut responders: Vec<(u8, ConnectionHandle)> = slots
            .responders
            .iter()
            .map(|(id, handle)| (*id, handle.clone()))
            .collect();
        responders.sort_by_key(|(id, _)| *id);

        Ok(InitiatorRegistration {
            previous,
            responders,
        })
    }

    async fn try_register_responder(
        &self,
        handle: ConnectionHandle,
    ) -> Result<ResponderRegistration, RegisterError> {
        let mut slots = self.slots.lock().await;
        if slots.retired {
            return Err(RegisterError::Retired);
        }

        let client_id = (ClientId::FIRST_RESPONDER.0..=ClientId::LAST_RESPONDER.0)
            .find(|id| !slots.responders.contains_key(id))
            .ok_or(RegisterError::Full)?;
        slots.responders.insert(client_id, handle);

        Ok(ResponderRegistration {
            client_id,
            initiator: slots.initiator.clone(),
        })
    }

    /// Look up the routing handle for a client-id on this path.
    pub async fn lookup(&self, id: ClientId) -> Option<ConnectionHandle> {
        let slots = self.slots.lock().await;
        if id.is_initiator() {
            slots.initiator.clone()
        } else if id.is_responder() {
            slots.responders.get(&id.0).cloned()
        } else {
            None
        }
    }

    /// Remove a connection from its slot. The serial must match: an evicted
    /// initiator must not remove its successor. On success, returns the
    /// peers to notify of the departure.
    async fn remove(&self, id: ClientId, serial: Uuid) -> Option<Vec<ConnectionHandle>> {
        let mut slots = self.slots.lock().await;

        if id.is_initiator() {
            match &slots.initiator {
                Some(current) if current.serial == serial => {
                    slots.initiator = None;
                    Some(slots.responders.values().cloned().collect())
                }
                _ => None,
            }
        } else if id.is_responder() {
            match slots.responders.get(&id.0) {
                Some(current) if current.serial == serial => {
                    slots.responders.remove(&id.0);
                    Some(slots.initiator.iter().cloned().collect())
                }
                _ => None,
            }
        } else {
            None
        }
    }
}

/// All live paths, keyed by initiator public key.
pub struct PathRegistry {
    paths: RwLock<HashMap<PathKey, Arc<Path>>>,
}

impl Default for PathRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl PathRegistry {
    pub fn new() -> Self {
        Self {
            paths: RwLock::new(HashMap::new()),
        }
    }

    async fn get_or_create(&self, key: PathKey) -> Arc<Path> {
        let mut paths = self.paths.write().await;
        paths
            .entry(key)
            .or_insert_with(|| {
                debug!(path = %hex::encode(key), "created new path");
                Arc::new(Path::new(key))
            })
            .clone()
    }

    /// Register an initiator; last writer wins, the previous holder is
    /// returned for eviction.
    pub async fn register_initiator(
        &self,
        key: PathKey,
        handle: ConnectionHandle,
    ) -> (Arc<Path>, InitiatorRegistration) {
        loop {
            let path = self.get_or_create(key).await;
            match path.try_register_initiator(handle.clone()).await {
                Ok(registration) => return (path, registration),
                Err(RegisterError::Retired) => continue,
                Err(RegisterError::Full) => unreachable!("initiator slot is never full"),
            }
        }
    }

    /// Register a responder on the lowest free slot.
    pub async fn register_responder(
        &self,
        key: PathKey,
        handle: ConnectionHandle,
    ) -> Result<(Arc<Path>, ResponderRegistration), SignalingError> {
        loop {
            let path = self.get_or_create(key).await;
            match path.try_register_responder(handle.clone()).await {
                Ok(registration) => return Ok((path, registration)),
                Err(RegisterError::Retired) => continue,
                Err(RegisterError::Full) => return Err(SignalingError::PathFull),
            }
        }
    }

    /// Deregister a connection and garbage-collect the path if it became
    /// empty. Returns the peers to notify, or `None` if the slot was
    /// already held by a successor.
    pub async fn remove(
        &self,
        key: &PathKey,
        id: ClientId,
        serial: Uuid,
    ) -> Option<Vec<ConnectionHandle>> {
        let path = self.paths.read().await.get(key).cloned()?;
        let peers = path.remove(id, serial).await;

        // A path with no clients is garbage; retire it under the map lock
        // so a concurrent registration restarts against a fresh entry.
        let mut paths = self.paths.write().await;
        if let Some(current) = paths.get(key) {
            if Arc::ptr_eq(current, &path) {
                let mut slots = path.slots.lock().await;
                if slots.is_empty() {
                    slots.retired = true;
                    drop(slots);
                    paths.remove(key);
                    debug!(path = %hex::encode(key), "removed empty path");
                }
            }
        }

        peers
    }

    /// Number of live paths.
    pub async fn path_count(&self) -> usize {
        self.paths.read().await.len()
    }
}
