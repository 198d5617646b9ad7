use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use justice_core::collab::{CaseAccess, CaseDirectory};
use justice_core::errors::{AdmissionError, DeliveryError};
use justice_core::ids::{CaseId, ConnectionId, ParticipantId};
use justice_core::messages::Message;

/// Sending half of one live connection.
#[derive(Clone, Debug)]
pub struct ConnectionHandle {
    pub id: ConnectionId,
    pub identity: ParticipantId,
    tx: mpsc::Sender<Message>,
}

impl ConnectionHandle {
    /// Queue a message without waiting. Never blocks a fan-out.
    pub fn deliver(&self, message: Message) -> Result<(), DeliveryError> {
        self.tx.try_send(message).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => DeliveryError::QueueFull,
            mpsc::error::TrySendError::Closed(_) => DeliveryError::Closed,
        })
    }
}

/// Public view of a room member.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Member {
    pub connection_id: ConnectionId,
    pub identity: ParticipantId,
}

/// A successfully admitted connection.
pub struct Admission {
    pub case_id: CaseId,
    pub access: CaseAccess,
    pub handle: ConnectionHandle,
    pub receiver: mpsc::Receiver<Message>,
}

impl Admission {
    pub fn connection_id(&self) -> &ConnectionId {
        &self.handle.id
    }

    pub fn identity(&self) -> &ParticipantId {
        &self.handle.identity
    }
}

#[derive(Default)]
struct Room {
    connections: Mutex<HashMap<ConnectionId, ConnectionHandle>>,
}

/// Live rooms keyed by case id. A room exists only while it has at least one
/// connection; membership changes lock only the affected room.
pub struct RoomRegistry {
    rooms: DashMap<CaseId, Arc<Room>>,
    directory: Arc<dyn CaseDirectory>,
    max_send_queue: usize,
}

impl RoomRegistry {
    pub fn new(directory: Arc<dyn CaseDirectory>, max_send_queue: usize) -> Self {
        Self {
            rooms: DashMap::new(),
            directory,
            max_send_queue,
        }
    }

    pub fn directory(&self) -> &Arc<dyn CaseDirectory> {
        &self.directory
    }

    /// Check that the case exists and `identity` is one of its participants.
    pub async fn authorize(
        &self,
        case_id: &CaseId,
        identity: &ParticipantId,
    ) -> Result<CaseAccess, AdmissionError> {
        let access = self
            .directory
            .lookup(case_id)
            .await?
            .ok_or_else(|| AdmissionError::NotFound(case_id.clone()))?;
        if !access.is_authorized(identity) {
            warn!(
                case_id = %case_id,
                identity = %identity,
                "admission rejected: not a participant"
            );
            return Err(AdmissionError::Forbidden {
                case_id: case_id.clone(),
                identity: identity.clone(),
            });
        }
        Ok(access)
    }

    /// Authorize and register a new connection, creating the room if needed.
    pub async fn admit(
        &self,
        case_id: &CaseId,
        identity: &ParticipantId,
    ) -> Result<Admission, AdmissionError> {
        let access = self.authorize(case_id, identity).await?;
        Ok(self.register(case_id, identity, access))
    }

    /// Register a connection for an already-authorized identity.
    pub fn register(
        &self,
        case_id: &CaseId,
        identity: &ParticipantId,
        access: CaseAccess,
    ) -> Admission {
        let (tx, receiver) = mpsc::channel(self.max_send_queue);
        let handle = ConnectionHandle {
            id: ConnectionId::new(),
            identity: identity.clone(),
            tx,
        };

        // The shard stays locked until the insert lands, so a concurrent
        // removal cannot reclaim the room in between.
        let room = self.rooms.entry(case_id.clone()).or_insert_with(|| {
            info!(case_id = %case_id, "room created");
            Arc::new(Room::default())
        });
        room.connections
            .lock()
            .insert(handle.id.clone(), handle.clone());
        drop(room);

        info!(
            case_id = %case_id,
            connection_id = %handle.id,
            identity = %identity,
            "connection admitted"
        );
        Admission {
            case_id: case_id.clone(),
            access,
            handle,
            receiver,
        }
    }

    /// Unregister a connection; an emptied room is reclaimed.
    /// Returns whether the connection was present.
    pub fn remove(&self, case_id: &CaseId, connection_id: &ConnectionId) -> bool {
        let mut removed = false;
        let reclaimed = self
            .rooms
            .remove_if(case_id, |_, room| {
                let mut connections = room.connections.lock();
                removed = connections.remove(connection_id).is_some();
                connections.is_empty()
            })
            .is_some();

        if removed {
            debug!(case_id = %case_id, connection_id = %connection_id, "connection removed");
        }
        if reclaimed {
            info!(case_id = %case_id, "room reclaimed");
        }
        removed
    }

    /// Snapshot of the room's connections at call time.
    pub fn list_connections(&self, case_id: &CaseId) -> Vec<ConnectionHandle> {
        self.rooms
            .get(case_id)
            .map(|room| room.connections.lock().values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn members(&self, case_id: &CaseId) -> Vec<Member> {
        let mut members: Vec<Member> = self
            .list_connections(case_id)
            .into_iter()
            .map(|h| Member {
                connection_id: h.id,
                identity: h.identity,
            })
            .collect();
        members.sort_by(|a, b| a.connection_id.as_str().cmp(b.connection_id.as_str()));
        members
    }

    pub fn contains_room(&self, case_id: &CaseId) -> bool {
        self.rooms.contains_key(case_id)
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }
}
