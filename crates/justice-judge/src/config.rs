use std::time::Duration;

use serde::{Deserialize, Serialize};

use justice_core::turns::{Party, PartyKind};

/// Score gap at which a session concludes.
pub const DEFAULT_TERMINATION_THRESHOLD: f64 = 25.0;
const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Clone, Debug)]
pub struct JudgeConfig {
    pub termination_threshold: f64,
    /// Upper bound on each Reasoner/Evaluator call.
    pub call_timeout: Duration,
}

impl Default for JudgeConfig {
    fn default() -> Self {
        Self {
            termination_threshold: DEFAULT_TERMINATION_THRESHOLD,
            call_timeout: DEFAULT_CALL_TIMEOUT,
        }
    }
}

/// Who speaks for each side of a session.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartyKinds {
    pub a: PartyKind,
    pub b: PartyKind,
}

impl PartyKinds {
    pub fn new(a: PartyKind, b: PartyKind) -> Self {
        Self { a, b }
    }

    /// A human against an automated opponent.
    pub fn human_vs_automated() -> Self {
        Self::new(PartyKind::Human, PartyKind::Automated)
    }

    pub fn of(&self, party: Party) -> PartyKind {
        match party {
            Party::A => self.a,
            Party::B => self.b,
        }
    }
}

impl Default for PartyKinds {
    fn default() -> Self {
        Self::new(PartyKind::Human, PartyKind::Human)
    }
}
