use std::fmt;
use std::str::FromStr;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::ids::{CaseId, MessageId, ParticipantId};

/// Message variants carried over a room.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MessageKind {
    Chat,
    System,
    Error,
    TurnUpdate,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Chat => "chat",
            Self::System => "system",
            Self::Error => "error",
            Self::TurnUpdate => "turn-update",
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "chat" => Ok(Self::Chat),
            "system" => Ok(Self::System),
            "error" => Ok(Self::Error),
            "turn-update" => Ok(Self::TurnUpdate),
            other => Err(format!("unknown message kind: {other}")),
        }
    }
}

/// A room message as it travels over the wire.
///
/// `sequence` is assigned by the ledger on append; messages that are never
/// persisted (error replies) carry `None`. `append_timestamp` is overwritten
/// with the ledger's clock when the message is persisted.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: MessageId,
    pub kind: MessageKind,
    pub content: String,
    pub sender_identity: ParticipantId,
    pub room_id: CaseId,
    pub append_timestamp: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sequence: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl Message {
    fn build(kind: MessageKind, room_id: &CaseId, sender: ParticipantId, content: String) -> Self {
        Self {
            id: MessageId::new(),
            kind,
            content,
            sender_identity: sender,
            room_id: room_id.clone(),
            append_timestamp: Utc::now().to_rfc3339(),
            sequence: None,
            data: None,
        }
    }

    pub fn chat(room_id: &CaseId, sender: &ParticipantId, content: impl Into<String>) -> Self {
        Self::build(MessageKind::Chat, room_id, sender.clone(), content.into())
    }

    pub fn system(room_id: &CaseId, content: impl Into<String>) -> Self {
        Self::build(MessageKind::System, room_id, ParticipantId::system(), content.into())
    }

    pub fn error(room_id: &CaseId, content: impl Into<String>) -> Self {
        Self::build(MessageKind::Error, room_id, ParticipantId::system(), content.into())
    }

    pub fn turn_update(
        room_id: &CaseId,
        content: impl Into<String>,
        data: serde_json::Value,
    ) -> Self {
        let mut msg = Self::build(
            MessageKind::TurnUpdate,
            room_id,
            ParticipantId::system(),
            content.into(),
        );
        msg.data = Some(data);
        msg
    }

    pub fn joined(room_id: &CaseId, identity: &ParticipantId) -> Self {
        Self::system(room_id, format!("User {identity} joined the chat"))
    }

    pub fn left(room_id: &CaseId, identity: &ParticipantId) -> Self {
        Self::system(room_id, format!("User {identity} left the chat"))
    }

    /// Stamp the message with its ledger position.
    pub fn persisted(mut self, sequence: i64, append_timestamp: String) -> Self {
        self.sequence = Some(sequence);
        self.append_timestamp = append_timestamp;
        self
    }

    pub fn is_persisted(&self) -> bool {
        self.sequence.is_some()
    }
}
