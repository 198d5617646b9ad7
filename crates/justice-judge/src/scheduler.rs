//! Two-party alternating session driven by an external Reasoner and Evaluator.
//!
//! `not_started -> open -> closed`. Only the current speaker may submit. A
//! turn is recorded only after its content has been produced and scored;
//! any failure before that point leaves the state untouched.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use justice_core::collab::{Evaluator, Reasoner};
use justice_core::errors::{CollaboratorError, TurnError};
use justice_core::ids::CaseId;
use justice_core::turns::{Party, PartyKind, Scores, TranscriptEntry, TurnState, TurnStatus};

use crate::coin::CoinFlip;
use crate::config::{JudgeConfig, PartyKinds};

const OPENING: &str = "Court is now in session. Both parties will present their arguments in \
                       turn, and each argument will be weighed on its merits.";
const COMMENTARY_FALLBACK: &str = "The court has noted the argument.";
const DEFAULT_TOPIC: &str = "the matter before the court";

fn directive(speaker: Party) -> String {
    format!("{}, please present your argument.", speaker.label())
}

fn closing_fallback(winner: Party, score_difference: f64) -> String {
    format!(
        "The court has reached its verdict: {} prevails by a margin of {:.1} points.",
        winner.label(),
        score_difference
    )
}

/// One observable step of a session, in emission order.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TurnEvent {
    SessionOpened {
        text: String,
        first_speaker: Party,
    },
    Directive {
        speaker: Party,
        text: String,
    },
    TurnRecorded {
        entry: TranscriptEntry,
        scores: Scores,
        score_difference: f64,
    },
    Commentary {
        text: String,
    },
    SessionClosed {
        winner: Party,
        score_difference: f64,
        text: String,
    },
}

impl TurnEvent {
    /// Human-readable rendering for a room message.
    pub fn text(&self) -> String {
        match self {
            Self::SessionOpened { text, .. }
            | Self::Directive { text, .. }
            | Self::Commentary { text }
            | Self::SessionClosed { text, .. } => text.clone(),
            Self::TurnRecorded { entry, scores, .. } => format!(
                "{}: {} (scored {:.1}; Party A {:.1}, Party B {:.1})",
                entry.speaker.label(),
                entry.input,
                entry.score,
                scores.a,
                scores.b
            ),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::SessionOpened { .. } => "session_opened",
            Self::Directive { .. } => "directive",
            Self::TurnRecorded { .. } => "turn_recorded",
            Self::Commentary { .. } => "commentary",
            Self::SessionClosed { .. } => "session_closed",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum TurnResult {
    Opened {
        first_speaker: Party,
    },
    InProgress {
        next_speaker: Party,
        score_difference: f64,
    },
    Concluded {
        winner: Party,
        score_difference: f64,
    },
}

/// What a transition produced: the result, the snapshot after it, and the
/// events to broadcast.
#[derive(Clone, Debug)]
pub struct TurnOutcome {
    pub result: TurnResult,
    pub state: TurnState,
    pub events: Vec<TurnEvent>,
}

pub struct TurnScheduler {
    case_id: CaseId,
    config: JudgeConfig,
    kinds: PartyKinds,
    reasoner: Arc<dyn Reasoner>,
    evaluator: Arc<dyn Evaluator>,
    coin: Arc<dyn CoinFlip>,
    state: TurnState,
}

impl TurnScheduler {
    pub fn new(
        case_id: CaseId,
        config: JudgeConfig,
        kinds: PartyKinds,
        reasoner: Arc<dyn Reasoner>,
        evaluator: Arc<dyn Evaluator>,
        coin: Arc<dyn CoinFlip>,
    ) -> Self {
        Self {
            case_id,
            config,
            kinds,
            reasoner,
            evaluator,
            coin,
            state: TurnState::new(),
        }
    }

    pub fn case_id(&self) -> &CaseId {
        &self.case_id
    }

    pub fn state(&self) -> &TurnState {
        &self.state
    }

    pub fn kinds(&self) -> PartyKinds {
        self.kinds
    }

    /// The current speaker, if the session is open and that party is automated.
    pub fn automated_speaker(&self) -> Option<Party> {
        if self.state.status != TurnStatus::Open {
            return None;
        }
        self.state
            .current_speaker
            .filter(|p| self.kinds.of(*p) == PartyKind::Automated)
    }

    /// Reset the session, flip for the first speaker and open the floor.
    #[instrument(skip(self), fields(case_id = %self.case_id))]
    pub fn start(&mut self) -> TurnOutcome {
        let first = self.coin.flip();
        self.state = TurnState {
            status: TurnStatus::Open,
            current_speaker: Some(first),
            ..TurnState::new()
        };
        info!(party = %first, "session started");

        TurnOutcome {
            result: TurnResult::Opened {
                first_speaker: first,
            },
            state: self.state.clone(),
            events: vec![
                TurnEvent::SessionOpened {
                    text: OPENING.to_string(),
                    first_speaker: first,
                },
                TurnEvent::Directive {
                    speaker: first,
                    text: directive(first),
                },
            ],
        }
    }

    /// Record one contribution from `speaker`.
    ///
    /// Human parties must supply `input`; it is grounded via the Reasoner and
    /// scored as written. Automated parties get an argument generated in answer
    /// to `input`, or to the opponent's last contribution when `input` is absent.
    /// `expected_turn`, when given, must equal the number of recorded turns.
    #[instrument(skip(self, input), fields(case_id = %self.case_id, party = %speaker))]
    pub async fn submit(
        &mut self,
        speaker: Party,
        input: Option<&str>,
        expected_turn: Option<u32>,
    ) -> Result<TurnOutcome, TurnError> {
        if !self.state.may_act(speaker) {
            return Err(TurnError::OutOfTurn {
                attempted: speaker,
                current: self.state.current_speaker,
            });
        }
        let actual = self.state.turn_count();
        if let Some(expected) = expected_turn {
            if expected != actual {
                return Err(TurnError::StaleTurn { expected, actual });
            }
        }
        let input = input.map(str::trim).filter(|s| !s.is_empty());

        let (content, context) = match self.kinds.of(speaker) {
            PartyKind::Human => {
                let text = input.ok_or(TurnError::MissingInput(speaker))?;
                let grounded = self
                    .bounded(self.reasoner.ask_with_context(text))
                    .await
                    .inspect_err(|e| self.log_failure(speaker, "ask_with_context", e))?;
                let context = Some(grounded.context).filter(|c| !c.is_empty());
                (text.to_string(), context)
            }
            PartyKind::Automated => {
                let query = input
                    .map(str::to_string)
                    .or_else(|| self.state.last_from(speaker.opponent()).map(|e| e.input.clone()))
                    .unwrap_or_else(|| DEFAULT_TOPIC.to_string());
                let argument = self
                    .bounded(self.reasoner.generate_argument(&query))
                    .await
                    .inspect_err(|e| self.log_failure(speaker, "generate_argument", e))?;
                (argument, None)
            }
        };

        let prior = self.state.last_entry().map(|e| e.input.clone());
        let score = self
            .bounded(self.evaluator.score(&content, prior.as_deref()))
            .await
            .and_then(validate_score)
            .inspect_err(|e| self.log_failure(speaker, "score", e))?;

        // Scoring succeeded: the turn is now applied in full.
        let entry = TranscriptEntry {
            turn: actual + 1,
            speaker,
            input: content,
            context,
            score,
        };
        self.state.transcript.push(entry.clone());
        self.state.scores.add(speaker, score);
        let score_difference = self.state.score_difference();
        info!(
            party = %speaker,
            turn = entry.turn,
            score,
            score_difference,
            "turn recorded"
        );

        let mut events = vec![TurnEvent::TurnRecorded {
            entry: entry.clone(),
            scores: self.state.scores,
            score_difference,
        }];

        if score_difference >= self.config.termination_threshold {
            let winner = self.state.scores.leader();
            self.state.status = TurnStatus::Closed;
            self.state.current_speaker = None;
            self.state.winner = Some(winner);
            info!(winner = %winner, score_difference, "session concluded");

            let text = match self
                .bounded(self.reasoner.generate_closing(winner, score_difference))
                .await
            {
                Ok(text) => text,
                Err(e) => {
                    warn!(
                        error = %e,
                        error_kind = e.error_kind(),
                        "closing text unavailable, using fallback"
                    );
                    closing_fallback(winner, score_difference)
                }
            };
            events.push(TurnEvent::SessionClosed {
                winner,
                score_difference,
                text,
            });
            return Ok(TurnOutcome {
                result: TurnResult::Concluded {
                    winner,
                    score_difference,
                },
                state: self.state.clone(),
                events,
            });
        }

        let next = speaker.opponent();
        self.state.current_speaker = Some(next);

        let commentary = match self.bounded(self.reasoner.generate_commentary(&entry)).await {
            Ok(text) => text,
            Err(e) => {
                warn!(
                    error = %e,
                    error_kind = e.error_kind(),
                    "commentary unavailable, using fallback"
                );
                COMMENTARY_FALLBACK.to_string()
            }
        };
        events.push(TurnEvent::Commentary { text: commentary });
        events.push(TurnEvent::Directive {
            speaker: next,
            text: directive(next),
        });

        Ok(TurnOutcome {
            result: TurnResult::InProgress {
                next_speaker: next,
                score_difference,
            },
            state: self.state.clone(),
            events,
        })
    }

    async fn bounded<T>(
        &self,
        call: impl Future<Output = Result<T, CollaboratorError>>,
    ) -> Result<T, CollaboratorError> {
        bounded(self.config.call_timeout, call).await
    }

    fn log_failure(&self, speaker: Party, op: &'static str, e: &CollaboratorError) {
        warn!(
            case_id = %self.case_id,
            party = %speaker,
            op,
            error = %e,
            error_kind = e.error_kind(),
            "evaluation failed, turn not recorded"
        );
    }
}

/// Run `call`, failing with `Timeout` once `limit` has elapsed.
pub async fn bounded<T>(
    limit: Duration,
    call: impl Future<Output = Result<T, CollaboratorError>>,
) -> Result<T, CollaboratorError> {
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(CollaboratorError::Timeout(limit)),
    }
}

fn validate_score(score: f64) -> Result<f64, CollaboratorError> {
    if score.is_finite() && score >= 0.0 {
        Ok(score)
    } else {
        Err(CollaboratorError::InvalidResponse(format!(
            "score must be a non-negative number, got {score}"
        )))
    }
}
