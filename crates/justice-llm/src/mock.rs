use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use justice_core::collab::{Evaluator, Grounded, Reasoner};
use justice_core::errors::CollaboratorError;
use justice_core::turns::{Party, TranscriptEntry};

/// One pre-programmed collaborator result.
pub enum Scripted<T> {
    Ok(T),
    Err(CollaboratorError),
    /// Wait, then yield the inner result.
    Delay(Duration, Box<Scripted<T>>),
}

impl<T> Scripted<T> {
    pub fn delayed(delay: Duration, inner: Scripted<T>) -> Self {
        Self::Delay(delay, Box::new(inner))
    }
}

/// Queue of scripted results for one operation, plus a call counter.
/// When the queue is empty the caller's fallback is used.
struct Script<T> {
    queue: Mutex<VecDeque<Scripted<T>>>,
    calls: AtomicUsize,
}

impl<T> Script<T> {
    fn new() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            calls: AtomicUsize::new(0),
        }
    }

    fn push(&self, item: Scripted<T>) {
        self.queue.lock().push_back(item);
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::Relaxed)
    }

    async fn next(
        &self,
        fallback: impl FnOnce() -> Result<T, CollaboratorError>,
    ) -> Result<T, CollaboratorError> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        let Some(mut current) = self.queue.lock().pop_front() else {
            return fallback();
        };
        // Nested delays unroll iteratively.
        loop {
            match current {
                Scripted::Ok(value) => return Ok(value),
                Scripted::Err(e) => return Err(e),
                Scripted::Delay(duration, inner) => {
                    tokio::time::sleep(duration).await;
                    current = *inner;
                }
            }
        }
    }
}

/// Reasoner with per-operation scripted results for deterministic tests.
///
/// Unscripted calls answer with predictable echo text.
pub struct ScriptedReasoner {
    asks: Script<Grounded>,
    arguments: Script<String>,
    commentaries: Script<String>,
    closings: Script<String>,
    queries: Mutex<Vec<String>>,
}

impl Default for ScriptedReasoner {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedReasoner {
    pub fn new() -> Self {
        Self {
            asks: Script::new(),
            arguments: Script::new(),
            commentaries: Script::new(),
            closings: Script::new(),
            queries: Mutex::new(Vec::new()),
        }
    }

    pub fn push_ask(&self, result: Scripted<Grounded>) -> &Self {
        self.asks.push(result);
        self
    }

    pub fn push_argument(&self, result: Scripted<String>) -> &Self {
        self.arguments.push(result);
        self
    }

    pub fn push_commentary(&self, result: Scripted<String>) -> &Self {
        self.commentaries.push(result);
        self
    }

    pub fn push_closing(&self, result: Scripted<String>) -> &Self {
        self.closings.push(result);
        self
    }

    pub fn ask_calls(&self) -> usize {
        self.asks.calls()
    }

    pub fn argument_calls(&self) -> usize {
        self.arguments.calls()
    }

    pub fn commentary_calls(&self) -> usize {
        self.commentaries.calls()
    }

    pub fn closing_calls(&self) -> usize {
        self.closings.calls()
    }

    /// Every query passed to `generate_argument`, in call order.
    pub fn argument_queries(&self) -> Vec<String> {
        self.queries.lock().clone()
    }
}

#[async_trait]
impl Reasoner for ScriptedReasoner {
    async fn ask_with_context(&self, text: &str) -> Result<Grounded, CollaboratorError> {
        self.asks
            .next(|| {
                Ok(Grounded {
                    answer: format!("answer: {text}"),
                    context: format!("context: {text}"),
                })
            })
            .await
    }

    async fn generate_argument(&self, query: &str) -> Result<String, CollaboratorError> {
        self.queries.lock().push(query.to_string());
        self.arguments
            .next(|| Ok(format!("argument answering: {query}")))
            .await
    }

    async fn generate_commentary(
        &self,
        last_turn: &TranscriptEntry,
    ) -> Result<String, CollaboratorError> {
        let turn = last_turn.turn;
        self.commentaries
            .next(|| Ok(format!("commentary on turn {turn}")))
            .await
    }

    async fn generate_closing(
        &self,
        winner: Party,
        score_difference: f64,
    ) -> Result<String, CollaboratorError> {
        self.closings
            .next(|| Ok(format!("closing: {winner} wins by {score_difference}")))
            .await
    }
}

/// Evaluator returning scripted scores in order.
///
/// Once the script is exhausted it returns `default_score` if set, or an
/// `InvalidResponse` error otherwise.
pub struct ScriptedEvaluator {
    scores: Script<f64>,
    default_score: Option<f64>,
    seen: Mutex<Vec<(String, Option<String>)>>,
}

impl ScriptedEvaluator {
    pub fn new(scores: impl IntoIterator<Item = f64>) -> Self {
        let script = Script::new();
        for score in scores {
            script.push(Scripted::Ok(score));
        }
        Self {
            scores: script,
            default_score: None,
            seen: Mutex::new(Vec::new()),
        }
    }

    /// Always score `score` once the script runs out.
    pub fn with_default(mut self, score: f64) -> Self {
        self.default_score = Some(score);
        self
    }

    pub fn push(&self, result: Scripted<f64>) -> &Self {
        self.scores.push(result);
        self
    }

    pub fn call_count(&self) -> usize {
        self.scores.calls()
    }

    /// `(text, prior)` pairs passed to `score`, in call order.
    pub fn seen(&self) -> Vec<(String, Option<String>)> {
        self.seen.lock().clone()
    }
}

#[async_trait]
impl Evaluator for ScriptedEvaluator {
    async fn score(&self, text: &str, prior: Option<&str>) -> Result<f64, CollaboratorError> {
        self.seen
            .lock()
            .push((text.to_string(), prior.map(str::to_string)));
        let default = self.default_score;
        self.scores
            .next(|| {
                default.ok_or_else(|| {
                    CollaboratorError::InvalidResponse("ScriptedEvaluator: script exhausted".into())
                })
            })
            .await
    }
}
