//! Contracts for the external collaborators the server composes: the case
//! directory, the message ledger, and the natural-language Reasoner and
//! Evaluator.

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::errors::{CollaboratorError, DirectoryError, LedgerError};
use crate::ids::{CaseId, ParticipantId};
use crate::messages::Message;
use crate::turns::{Party, PartyKind, TranscriptEntry};

/// How a case is argued.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaseMode {
    /// Two registered human participants.
    HumanHuman,
    /// One human participant against an automated opponent.
    HumanAi,
}

impl CaseMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::HumanHuman => "human_human",
            Self::HumanAi => "human_ai",
        }
    }
}

impl fmt::Display for CaseMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CaseMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "human_human" | "human-human" => Ok(Self::HumanHuman),
            "human_ai" | "human-ai" => Ok(Self::HumanAi),
            other => Err(format!("unknown case mode: {other}")),
        }
    }
}

/// A registered participant of a case, in seat order.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Seat {
    pub address: ParticipantId,
    pub kind: PartyKind,
}

/// What the directory knows about a case's membership.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CaseAccess {
    pub case_id: CaseId,
    pub mode: CaseMode,
    pub seats: Vec<Seat>,
}

impl CaseAccess {
    /// Every registered participant may join the case's rooms.
    pub fn is_authorized(&self, identity: &ParticipantId) -> bool {
        self.seats.iter().any(|s| &s.address == identity)
    }

    /// Seat order decides the party: first seat argues as `A`, second as `B`.
    pub fn party_of(&self, identity: &ParticipantId) -> Option<Party> {
        match self.seats.iter().position(|s| &s.address == identity) {
            Some(0) => Some(Party::A),
            Some(1) => Some(Party::B),
            _ => None,
        }
    }

    pub fn seat(&self, party: Party) -> Option<&Seat> {
        match party {
            Party::A => self.seats.first(),
            Party::B => self.seats.get(1),
        }
    }
}

#[async_trait]
pub trait CaseDirectory: Send + Sync {
    /// `Ok(None)` when the case does not exist.
    async fn lookup(&self, case_id: &CaseId) -> Result<Option<CaseAccess>, DirectoryError>;
}

/// Append-only per-room history.
#[async_trait]
pub trait MessageLedger: Send + Sync {
    /// Persist `message` at the end of the room's log and return it stamped
    /// with its sequence and append timestamp.
    async fn append(&self, room_id: &CaseId, message: Message) -> Result<Message, LedgerError>;

    /// Every persisted message of the room, in append order.
    async fn read_all(&self, room_id: &CaseId) -> Result<Vec<Message>, LedgerError>;
}

/// An answer together with the supporting material it was derived from.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Grounded {
    pub answer: String,
    pub context: String,
}

/// Natural-language generation and retrieval.
#[async_trait]
pub trait Reasoner: Send + Sync {
    async fn ask_with_context(&self, text: &str) -> Result<Grounded, CollaboratorError>;
    async fn generate_argument(&self, query: &str) -> Result<String, CollaboratorError>;
    async fn generate_commentary(
        &self,
        last_turn: &TranscriptEntry,
    ) -> Result<String, CollaboratorError>;
    async fn generate_closing(
        &self,
        winner: Party,
        score_difference: f64,
    ) -> Result<String, CollaboratorError>;
}

/// Content scoring. Scores are non-negative reals.
#[async_trait]
pub trait Evaluator: Send + Sync {
    async fn score(&self, text: &str, prior: Option<&str>) -> Result<f64, CollaboratorError>;
}
