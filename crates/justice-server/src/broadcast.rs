use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{info, warn};

use justice_core::collab::MessageLedger;
use justice_core::errors::{AdmissionError, DeliveryError, LedgerError};
use justice_core::ids::{CaseId, ParticipantId};
use justice_core::messages::Message;

use crate::rooms::{Admission, RoomRegistry};

/// Persists room messages and fans them out to the room's connections.
///
/// Publishes to the same room are serialized, so every connection observes
/// the ledger's order. Joins take the same lock, which makes history replay
/// and live delivery meet without gaps or duplicates. A room's lock lives
/// only while someone holds or waits for it.
pub struct Broadcaster {
    ledger: Arc<dyn MessageLedger>,
    rooms: Arc<RoomRegistry>,
    publish_locks: DashMap<CaseId, Arc<Mutex<()>>>,
}

impl Broadcaster {
    pub fn new(ledger: Arc<dyn MessageLedger>, rooms: Arc<RoomRegistry>) -> Self {
        Self {
            ledger,
            rooms,
            publish_locks: DashMap::new(),
        }
    }

    pub fn rooms(&self) -> &Arc<RoomRegistry> {
        &self.rooms
    }

    async fn lock_room(&self, case_id: &CaseId) -> RoomGuard<'_> {
        let lock = self
            .publish_locks
            .entry(case_id.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        RoomGuard {
            locks: &self.publish_locks,
            case_id: case_id.clone(),
            guard: Some(lock.lock_owned().await),
        }
    }

    /// Rooms with a live publish lock.
    pub fn locked_rooms(&self) -> usize {
        self.publish_locks.len()
    }

    /// Append `message` to the ledger, then deliver it to every connection in
    /// the room at that moment. Returns the persisted message.
    pub async fn publish(
        &self,
        case_id: &CaseId,
        message: Message,
    ) -> Result<Message, LedgerError> {
        let _guard = self.lock_room(case_id).await;

        let stored = self.ledger.append(case_id, message).await?;
        self.fan_out(case_id, &stored);
        Ok(stored)
    }

    /// Deliver to each connection; failures are isolated per connection.
    /// Connections whose queue has closed are removed afterwards.
    fn fan_out(&self, case_id: &CaseId, message: &Message) -> usize {
        let mut delivered = 0;
        let mut dead = Vec::new();
        for conn in self.rooms.list_connections(case_id) {
            match conn.deliver(message.clone()) {
                Ok(()) => delivered += 1,
                Err(DeliveryError::QueueFull) => {
                    warn!(
                        case_id = %case_id,
                        connection_id = %conn.id,
                        sequence = message.sequence,
                        error = %DeliveryError::QueueFull,
                        "delivery failed, message dropped for this connection"
                    );
                }
                Err(DeliveryError::Closed) => {
                    warn!(
                        case_id = %case_id,
                        connection_id = %conn.id,
                        error = %DeliveryError::Closed,
                        "delivery failed, connection is gone"
                    );
                    dead.push(conn.id);
                }
            }
        }
        for id in dead {
            self.rooms.remove(case_id, &id);
        }
        delivered
    }

    /// Admit a connection and read the room's history as one step relative
    /// to publishes: every message is either in the returned history or
    /// will arrive on the admission's receiver, never both.
    pub async fn join(
        &self,
        case_id: &CaseId,
        identity: &ParticipantId,
    ) -> Result<(Admission, Vec<Message>), AdmissionError> {
        let access = self.rooms.authorize(case_id, identity).await?;

        let _guard = self.lock_room(case_id).await;
        let admission = self.rooms.register(case_id, identity, access);
        match self.ledger.read_all(case_id).await {
            Ok(history) => {
                info!(
                    case_id = %case_id,
                    connection_id = %admission.connection_id(),
                    replayed = history.len(),
                    "history loaded for joiner"
                );
                Ok((admission, history))
            }
            Err(e) => {
                self.rooms.remove(case_id, admission.connection_id());
                Err(e.into())
            }
        }
    }
}

/// Holds a room's publish lock and drops the map entry on release when no
/// other task holds or awaits it.
struct RoomGuard<'a> {
    locks: &'a DashMap<CaseId, Arc<Mutex<()>>>,
    case_id: CaseId,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for RoomGuard<'_> {
    fn drop(&mut self) {
        self.guard.take();
        self.locks
            .remove_if(&self.case_id, |_, lock| Arc::strong_count(lock) == 1);
    }
}
