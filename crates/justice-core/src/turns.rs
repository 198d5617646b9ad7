//! Adversarial session model: the two parties, their scores, and the
//! transcript of scored turns.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// One side of an adversarial session.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Party {
    A,
    B,
}

impl Party {
    pub fn opponent(self) -> Self {
        match self {
            Self::A => Self::B,
            Self::B => Self::A,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::A => "Party A",
            Self::B => "Party B",
        }
    }
}

impl fmt::Display for Party {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::A => "a",
            Self::B => "b",
        })
    }
}

impl FromStr for Party {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "a" => Ok(Self::A),
            "b" => Ok(Self::B),
            other => Err(format!("unknown party: {other}")),
        }
    }
}

/// Who speaks for a party.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PartyKind {
    Human,
    Automated,
}

impl PartyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Human => "human",
            Self::Automated => "automated",
        }
    }
}

impl FromStr for PartyKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "human" => Ok(Self::Human),
            "automated" | "ai" => Ok(Self::Automated),
            other => Err(format!("unknown party kind: {other}")),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnStatus {
    #[default]
    NotStarted,
    Open,
    Closed,
}

/// Cumulative per-party scores.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Scores {
    pub a: f64,
    pub b: f64,
}

impl Scores {
    pub fn new(a: f64, b: f64) -> Self {
        Self { a, b }
    }

    pub fn get(&self, party: Party) -> f64 {
        match party {
            Party::A => self.a,
            Party::B => self.b,
        }
    }

    pub fn add(&mut self, party: Party, delta: f64) {
        match party {
            Party::A => self.a += delta,
            Party::B => self.b += delta,
        }
    }

    pub fn difference(&self) -> f64 {
        (self.a - self.b).abs()
    }

    /// The higher-scoring party. Ties go to `A`.
    pub fn leader(&self) -> Party {
        if self.b > self.a {
            Party::B
        } else {
            Party::A
        }
    }
}

/// One recorded, scored contribution.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TranscriptEntry {
    pub turn: u32,
    pub speaker: Party,
    pub input: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
    pub score: f64,
}

/// Snapshot of an adversarial session.
///
/// `current_speaker` is `Some` exactly while `status` is `Open`, and
/// `winner` is `Some` exactly when `status` is `Closed`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TurnState {
    pub status: TurnStatus,
    pub current_speaker: Option<Party>,
    pub scores: Scores,
    pub transcript: Vec<TranscriptEntry>,
    pub winner: Option<Party>,
}

impl TurnState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn turn_count(&self) -> u32 {
        self.transcript.len() as u32
    }

    pub fn score_difference(&self) -> f64 {
        self.scores.difference()
    }

    pub fn last_entry(&self) -> Option<&TranscriptEntry> {
        self.transcript.last()
    }

    /// Most recent contribution made by `party`, if any.
    pub fn last_from(&self, party: Party) -> Option<&TranscriptEntry> {
        self.transcript.iter().rev().find(|e| e.speaker == party)
    }

    pub fn may_act(&self, party: Party) -> bool {
        self.status == TurnStatus::Open && self.current_speaker == Some(party)
    }

    pub fn is_closed(&self) -> bool {
        self.status == TurnStatus::Closed
    }

    /// Whether the snapshot satisfies the status/speaker/winner invariants.
    pub fn is_consistent(&self) -> bool {
        match self.status {
            TurnStatus::NotStarted => self.current_speaker.is_none() && self.winner.is_none(),
            TurnStatus::Open => self.current_speaker.is_some() && self.winner.is_none(),
            TurnStatus::Closed => self.current_speaker.is_none() && self.winner.is_some(),
        }
    }
}
