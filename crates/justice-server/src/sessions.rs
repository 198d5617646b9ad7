//! Adversarial sessions bound to case rooms.
//!
//! One `TurnScheduler` per case, guarded by an async mutex so submissions to
//! the same case run one at a time. Every transition is published to the
//! case's room as `turn-update` messages, and automated parties take their
//! turns here as soon as the floor passes to them.

use std::sync::Arc;

use dashmap::DashMap;
use serde_json::json;
use tokio::sync::Mutex;
use tracing::{info, warn};

use justice_core::collab::{CaseAccess, CaseDirectory, CaseMode, Evaluator, Reasoner};
use justice_core::errors::{DirectoryError, TurnError};
use justice_core::ids::{CaseId, ParticipantId};
use justice_core::messages::Message;
use justice_core::turns::{Party, PartyKind, TurnState, TurnStatus};
use justice_judge::{CoinFlip, JudgeConfig, PartyKinds, TurnOutcome, TurnScheduler};

use crate::broadcast::Broadcaster;

/// Upper bound on consecutive automated turns after one trigger.
const MAX_AUTOMATED_TURNS: usize = 50;

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error(transparent)]
    Turn(#[from] TurnError),
    #[error("case not found: {0}")]
    CaseNotFound(CaseId),
    #[error("{identity} holds no seat in case {case_id}")]
    NotSeated {
        case_id: CaseId,
        identity: ParticipantId,
    },
    #[error("case {0} is waiting for its second participant")]
    OpponentMissing(CaseId),
    #[error(transparent)]
    Directory(#[from] DirectoryError),
}

impl SessionError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::Turn(e) => e.code(),
            Self::CaseNotFound(_) => "NOT_FOUND",
            Self::NotSeated { .. } => "FORBIDDEN",
            Self::OpponentMissing(_) => "OPPONENT_MISSING",
            Self::Directory(_) => "INTERNAL_ERROR",
        }
    }
}

/// Seat kinds for a session. Party B is automated only in human-vs-AI cases;
/// a two-human case cannot open until its second seat is taken.
fn kinds_for(access: &CaseAccess) -> Result<PartyKinds, SessionError> {
    let a = access.seat(Party::A).map_or(PartyKind::Human, |s| s.kind);
    let b = match access.mode {
        CaseMode::HumanAi => PartyKind::Automated,
        CaseMode::HumanHuman => access
            .seat(Party::B)
            .map(|s| s.kind)
            .ok_or_else(|| SessionError::OpponentMissing(access.case_id.clone()))?,
    };
    Ok(PartyKinds::new(a, b))
}

pub struct SessionService {
    sessions: DashMap<CaseId, Arc<Mutex<TurnScheduler>>>,
    directory: Arc<dyn CaseDirectory>,
    broadcaster: Arc<Broadcaster>,
    reasoner: Arc<dyn Reasoner>,
    evaluator: Arc<dyn Evaluator>,
    coin: Arc<dyn CoinFlip>,
    config: JudgeConfig,
}

impl SessionService {
    pub fn new(
        directory: Arc<dyn CaseDirectory>,
        broadcaster: Arc<Broadcaster>,
        reasoner: Arc<dyn Reasoner>,
        evaluator: Arc<dyn Evaluator>,
        coin: Arc<dyn CoinFlip>,
        config: JudgeConfig,
    ) -> Self {
        Self {
            sessions: DashMap::new(),
            directory,
            broadcaster,
            reasoner,
            evaluator,
            coin,
            config,
        }
    }

    async fn access(&self, case_id: &CaseId) -> Result<CaseAccess, SessionError> {
        self.directory
            .lookup(case_id)
            .await?
            .ok_or_else(|| SessionError::CaseNotFound(case_id.clone()))
    }

    fn scheduler(&self, case_id: &CaseId, kinds: PartyKinds) -> TurnScheduler {
        TurnScheduler::new(
            case_id.clone(),
            self.config.clone(),
            kinds,
            self.reasoner.clone(),
            self.evaluator.clone(),
            self.coin.clone(),
        )
    }

    /// Open a session for the case. An open session is left as it is and its
    /// snapshot returned; a missing or concluded one is replaced and started.
    pub async fn start(&self, case_id: &CaseId) -> Result<TurnState, SessionError> {
        let access = self.access(case_id).await?;
        let kinds = kinds_for(&access)?;

        let slot = self
            .sessions
            .entry(case_id.clone())
            .or_insert_with(|| Arc::new(Mutex::new(self.scheduler(case_id, kinds))))
            .clone();
        let mut scheduler = slot.lock().await;

        if scheduler.state().status == TurnStatus::Open {
            return Ok(scheduler.state().clone());
        }
        if scheduler.state().status == TurnStatus::Closed {
            *scheduler = self.scheduler(case_id, kinds);
        }

        let outcome = scheduler.start();
        info!(case_id = %case_id, a = kinds.a.as_str(), b = kinds.b.as_str(), "session opened");
        self.publish_outcome(case_id, &outcome).await;
        self.drive_automated(&mut scheduler).await;
        Ok(scheduler.state().clone())
    }

    /// Submit a turn for `speaker`. On success the room sees the recorded
    /// turn, then any automated replies it triggered.
    pub async fn submit(
        &self,
        case_id: &CaseId,
        speaker: Party,
        input: Option<&str>,
        expected_turn: Option<u32>,
    ) -> Result<TurnState, SessionError> {
        let slot = self
            .sessions
            .get(case_id)
            .map(|s| s.clone())
            .ok_or_else(|| TurnError::UnknownSession(case_id.clone()))?;
        let mut scheduler = slot.lock().await;

        let outcome = scheduler.submit(speaker, input, expected_turn).await?;
        self.publish_outcome(case_id, &outcome).await;
        self.drive_automated(&mut scheduler).await;
        Ok(scheduler.state().clone())
    }

    /// Submit on behalf of whoever holds `identity`'s seat.
    pub async fn submit_as(
        &self,
        case_id: &CaseId,
        identity: &ParticipantId,
        input: Option<&str>,
        expected_turn: Option<u32>,
    ) -> Result<TurnState, SessionError> {
        let access = self.access(case_id).await?;
        let party = access
            .party_of(identity)
            .ok_or_else(|| SessionError::NotSeated {
                case_id: case_id.clone(),
                identity: identity.clone(),
            })?;
        self.submit(case_id, party, input, expected_turn).await
    }

    /// The party `identity` argues for, if seated.
    pub async fn party_of(
        &self,
        case_id: &CaseId,
        identity: &ParticipantId,
    ) -> Result<Option<Party>, SessionError> {
        Ok(self.access(case_id).await?.party_of(identity))
    }

    pub async fn snapshot(&self, case_id: &CaseId) -> Option<TurnState> {
        let slot = self.sessions.get(case_id).map(|s| s.clone())?;
        let scheduler = slot.lock().await;
        Some(scheduler.state().clone())
    }

    async fn drive_automated(&self, scheduler: &mut TurnScheduler) {
        let case_id = scheduler.case_id().clone();
        for _ in 0..MAX_AUTOMATED_TURNS {
            let Some(party) = scheduler.automated_speaker() else {
                return;
            };
            match scheduler.submit(party, None, None).await {
                Ok(outcome) => self.publish_outcome(&case_id, &outcome).await,
                Err(e) => {
                    warn!(case_id = %case_id, party = %party, error = %e, "automated turn failed");
                    let notice = format!("{} could not complete its turn: {e}", party.label());
                    let message = Message::system(&case_id, notice);
                    if let Err(e) = self.broadcaster.publish(&case_id, message).await {
                        warn!(
                            case_id = %case_id,
                            error = %e,
                            "failed to publish turn failure notice"
                        );
                    }
                    return;
                }
            }
        }
        warn!(case_id = %case_id, "automated turn limit reached");
    }

    async fn publish_outcome(&self, case_id: &CaseId, outcome: &TurnOutcome) {
        for event in &outcome.events {
            let data = json!({ "event": event, "state": &outcome.state });
            let message = Message::turn_update(case_id, event.text(), data);
            if let Err(e) = self.broadcaster.publish(case_id, message).await {
                warn!(
                    case_id = %case_id,
                    event = event.name(),
                    error = %e,
                    "failed to publish turn update"
                );
            }
        }
    }
}
