use async_trait::async_trait;
use chrono::Utc;
use tracing::instrument;

use justice_core::collab::MessageLedger;
use justice_core::errors::LedgerError;
use justice_core::ids::{CaseId, MessageId, ParticipantId};
use justice_core::messages::{Message, MessageKind};

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

/// SQLite-backed room history.
pub struct MessageRepo {
    db: Database,
}

impl MessageRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Persist a message at the end of the room's log.
    ///
    /// Sequences start at 1 and are dense within a room. The stored message
    /// takes the ledger's clock as its append timestamp. The connection lock
    /// spans the sequence lookup and the insert, and `UNIQUE(case_id,
    /// sequence)` rejects any duplicate that slips past it.
    #[instrument(skip(self, message), fields(case_id = %room_id, kind = %message.kind))]
    pub fn append(&self, room_id: &CaseId, message: Message) -> Result<Message, LedgerError> {
        if let Some(seq) = message.sequence {
            return Err(LedgerError::AlreadyPersisted(seq));
        }

        let data = message
            .data
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(StoreError::from)?;

        let stored = self.db.with_conn(|conn| {
            let next: i64 = conn.query_row(
                "SELECT COALESCE(MAX(sequence), 0) + 1 FROM messages WHERE case_id = ?1",
                [room_id.as_str()],
                |row| row.get(0),
            )?;
            let now = Utc::now().to_rfc3339();
            conn.execute(
                "INSERT INTO messages
                     (id, case_id, sequence, kind, content, sender, data, timestamp)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                rusqlite::params![
                    message.id.as_str(),
                    room_id.as_str(),
                    next,
                    message.kind.as_str(),
                    message.content,
                    message.sender_identity.as_str(),
                    data,
                    now,
                ],
            )?;
            Ok((next, now))
        })?;

        let (sequence, timestamp) = stored;
        let mut message = message.persisted(sequence, timestamp);
        message.room_id = room_id.clone();
        Ok(message)
    }

    /// Messages with a sequence strictly greater than `after`, oldest first.
    #[instrument(skip(self), fields(case_id = %room_id))]
    pub fn read_since(
        &self,
        room_id: &CaseId,
        after: i64,
        limit: Option<i64>,
    ) -> Result<Vec<Message>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, case_id, sequence, kind, content, sender, data, timestamp
                 FROM messages WHERE case_id = ?1 AND sequence > ?2
                 ORDER BY sequence ASC LIMIT ?3",
            )?;
            let mut rows =
                stmt.query(rusqlite::params![room_id.as_str(), after, limit.unwrap_or(-1)])?;
            let mut messages = Vec::new();
            while let Some(row) = rows.next()? {
                messages.push(row_to_message(row)?);
            }
            Ok(messages)
        })
    }

    pub fn read_all(&self, room_id: &CaseId) -> Result<Vec<Message>, StoreError> {
        self.read_since(room_id, 0, None)
    }

    pub fn count(&self, room_id: &CaseId) -> Result<i64, StoreError> {
        self.db.with_conn(|conn| {
            Ok(conn.query_row(
                "SELECT COUNT(*) FROM messages WHERE case_id = ?1",
                [room_id.as_str()],
                |row| row.get(0),
            )?)
        })
    }
}

#[async_trait]
impl MessageLedger for MessageRepo {
    async fn append(&self, room_id: &CaseId, message: Message) -> Result<Message, LedgerError> {
        MessageRepo::append(self, room_id, message)
    }

    async fn read_all(&self, room_id: &CaseId) -> Result<Vec<Message>, LedgerError> {
        Ok(MessageRepo::read_all(self, room_id)?)
    }
}

fn row_to_message(row: &rusqlite::Row<'_>) -> Result<Message, StoreError> {
    let kind: String = row_helpers::get(row, 3, "messages", "kind")?;
    let data: Option<String> = row_helpers::get(row, 6, "messages", "data")?;
    Ok(Message {
        id: MessageId::from_raw(row_helpers::get::<String>(row, 0, "messages", "id")?),
        room_id: CaseId::from_raw(row_helpers::get::<String>(row, 1, "messages", "case_id")?),
        sequence: Some(row_helpers::get(row, 2, "messages", "sequence")?),
        kind: row_helpers::parse_enum::<MessageKind>(&kind, "messages", "kind")?,
        content: row_helpers::get(row, 4, "messages", "content")?,
        sender_identity: ParticipantId::from_raw(row_helpers::get::<String>(
            row, 5, "messages", "sender",
        )?),
        data: row_helpers::parse_json_opt(data, "messages", "data")?,
        append_timestamp: row_helpers::get(row, 7, "messages", "timestamp")?,
    })
}
