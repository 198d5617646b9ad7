//! Shared fixtures for server tests.

use std::sync::Arc;

use justice_core::ids::{CaseId, ParticipantId};
use justice_core::turns::Party;
use justice_judge::{FixedCoin, JudgeConfig};
use justice_llm::mock::{ScriptedEvaluator, ScriptedReasoner};
use justice_store::{CaseMode, CaseRepo, Database, MessageRepo, NewCase};

use crate::broadcast::Broadcaster;
use crate::rooms::RoomRegistry;
use crate::sessions::SessionService;

pub struct Fixture {
    pub db: Database,
    pub cases: Arc<CaseRepo>,
    pub messages: Arc<MessageRepo>,
}

/// Rooms, broadcaster and sessions wired over a fixture's repos.
pub struct Stack {
    pub rooms: Arc<RoomRegistry>,
    pub broadcaster: Arc<Broadcaster>,
    pub sessions: Arc<SessionService>,
}

impl Fixture {
    pub fn new() -> Self {
        let db = Database::in_memory().unwrap();
        Self {
            cases: Arc::new(CaseRepo::new(db.clone())),
            messages: Arc::new(MessageRepo::new(db.clone())),
            db,
        }
    }

    /// A case argued by `0xaaa` and `0xbbb`.
    pub fn two_party_case(&self) -> CaseId {
        let case = self.create(CaseMode::HumanHuman);
        self.cases.add_participant(&case, &bbb()).unwrap();
        case
    }

    /// A two-human case where only `0xaaa` has been seated so far.
    pub fn lone_human_case(&self) -> CaseId {
        self.create(CaseMode::HumanHuman)
    }

    /// A case argued by `0xaaa` against an automated opponent.
    pub fn human_ai_case(&self) -> CaseId {
        self.create(CaseMode::HumanAi)
    }

    /// Scripted collaborators and a fixed first speaker.
    pub fn stack(&self, evaluator: ScriptedEvaluator, first: Party) -> Stack {
        let rooms = Arc::new(RoomRegistry::new(self.cases.clone(), 64));
        let broadcaster = Arc::new(Broadcaster::new(self.messages.clone(), rooms.clone()));
        let sessions = Arc::new(SessionService::new(
            self.cases.clone(),
            broadcaster.clone(),
            Arc::new(ScriptedReasoner::new()),
            Arc::new(evaluator),
            Arc::new(FixedCoin(first)),
            JudgeConfig::default(),
        ));
        Stack {
            rooms,
            broadcaster,
            sessions,
        }
    }

    fn create(&self, mode: CaseMode) -> CaseId {
        self.cases
            .create(&NewCase {
                title: "Breach of contract".into(),
                description: "Goods delivered three weeks late".into(),
                mode,
                owner: aaa(),
            })
            .unwrap()
            .id
    }
}

pub fn aaa() -> ParticipantId {
    ParticipantId::from_raw("0xaaa")
}

pub fn bbb() -> ParticipantId {
    ParticipantId::from_raw("0xbbb")
}

pub fn stranger() -> ParticipantId {
    ParticipantId::from_raw("0xccc")
}
