//! Deterministic collaborators for running without an external service.

use std::collections::HashSet;
use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;

use justice_core::collab::{Evaluator, Grounded, Reasoner};
use justice_core::errors::CollaboratorError;
use justice_core::turns::{Party, TranscriptEntry};

static SENTENCE_END: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[.!?]+(\s+|$)").expect("sentence pattern"));
static WORD: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[A-Za-z0-9][A-Za-z0-9'\-]*").expect("word pattern"));
static PROPER_NOUN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b[A-Z][a-z]{2,}\b").expect("proper noun pattern"));

const KEY_SENTENCES: usize = 2;
const SNIPPET_CHARS: usize = 120;

fn sentences(text: &str) -> Vec<&str> {
    SENTENCE_END
        .split(text)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect()
}

fn words(text: &str) -> Vec<String> {
    WORD.find_iter(text)
        .map(|m| m.as_str().to_ascii_lowercase())
        .collect()
}

fn snippet(text: &str) -> String {
    let trimmed = text.trim();
    match trimmed.char_indices().nth(SNIPPET_CHARS) {
        Some((idx, _)) => format!("{}...", &trimmed[..idx]),
        None => trimmed.to_string(),
    }
}

/// Sentences ranked by how many named entities and figures they carry.
fn key_sentences(text: &str) -> Vec<&str> {
    let mut ranked: Vec<(usize, usize, &str)> = sentences(text)
        .into_iter()
        .enumerate()
        .map(|(idx, s)| {
            let weight = PROPER_NOUN.find_iter(s).count()
                + s.chars().filter(|c| c.is_ascii_digit()).count().min(3);
            (weight, idx, s)
        })
        .collect();
    ranked.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));
    let mut top: Vec<(usize, &str)> = ranked
        .into_iter()
        .take(KEY_SENTENCES)
        .map(|(_, idx, s)| (idx, s))
        .collect();
    top.sort_by_key(|(idx, _)| *idx);
    top.into_iter().map(|(_, s)| s).collect()
}

/// Template-driven reasoner.
#[derive(Clone, Debug, Default)]
pub struct EchoReasoner;

#[async_trait]
impl Reasoner for EchoReasoner {
    async fn ask_with_context(&self, text: &str) -> Result<Grounded, CollaboratorError> {
        let context = key_sentences(text).join(" ");
        Ok(Grounded {
            answer: format!("The submission rests on: {}", snippet(text)),
            context,
        })
    }

    async fn generate_argument(&self, query: &str) -> Result<String, CollaboratorError> {
        let focus = key_sentences(query)
            .first()
            .map(|s| snippet(s))
            .unwrap_or_else(|| "the matter before the court".to_string());
        Ok(format!(
            "In answer to the claim that {focus}, the opposing party submits that the record \
             does not support it and that the burden of proof has not been met."
        ))
    }

    async fn generate_commentary(
        &self,
        last_turn: &TranscriptEntry,
    ) -> Result<String, CollaboratorError> {
        Ok(format!(
            "The court notes the submission of {} on turn {}, assessed at {:.1} points.",
            last_turn.speaker.label(),
            last_turn.turn,
            last_turn.score
        ))
    }

    async fn generate_closing(
        &self,
        winner: Party,
        score_difference: f64,
    ) -> Result<String, CollaboratorError> {
        Ok(format!(
            "Having weighed both sides, the court finds in favour of {} by a margin of {:.1} \
             points. Court is adjourned.",
            winner.label(),
            score_difference
        ))
    }
}

/// Heuristic scorer: coherence (sentence count and vocabulary diversity),
/// named entities, and novelty against the prior text. Never negative.
#[derive(Clone, Debug)]
pub struct LexicalEvaluator {
    pub sentence_weight: f64,
    pub diversity_weight: f64,
    pub entity_weight: f64,
    pub novelty_weight: f64,
}

impl Default for LexicalEvaluator {
    fn default() -> Self {
        Self {
            sentence_weight: 1.0,
            diversity_weight: 4.0,
            entity_weight: 0.8,
            novelty_weight: 3.0,
        }
    }
}

impl LexicalEvaluator {
    pub fn evaluate(&self, text: &str, prior: Option<&str>) -> f64 {
        let tokens = words(text);
        if tokens.is_empty() {
            return 0.0;
        }
        let unique: HashSet<&str> = tokens.iter().map(String::as_str).collect();

        let sentence_count = sentences(text).len().min(5) as f64;
        let diversity = unique.len() as f64 / tokens.len() as f64;
        let entities = PROPER_NOUN
            .find_iter(text)
            .map(|m| m.as_str())
            .collect::<HashSet<_>>()
            .len()
            .min(5) as f64;
        let novelty = match prior {
            Some(prior) => {
                let seen: HashSet<String> = words(prior).into_iter().collect();
                let fresh = unique.iter().filter(|w| !seen.contains(**w)).count();
                fresh as f64 / unique.len() as f64
            }
            None => 1.0,
        };

        let score = self.sentence_weight * sentence_count
            + self.diversity_weight * diversity
            + self.entity_weight * entities
            + self.novelty_weight * novelty;
        score.max(0.0)
    }
}

#[async_trait]
impl Evaluator for LexicalEvaluator {
    async fn score(&self, text: &str, prior: Option<&str>) -> Result<f64, CollaboratorError> {
        Ok(self.evaluate(text, prior))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FILING: &str = "The supplier shipped the goods on March 3. Acme refused delivery. \
                          Payment of 4000 dollars is still outstanding!";

    #[test]
    fn sentences_split_on_terminators() {
        assert_eq!(sentences(FILING).len(), 3);
        assert!(sentences("   ").is_empty());
    }

    #[test]
    fn key_sentences_prefer_entities_and_figures() {
        let keys = key_sentences(FILING);
        assert_eq!(keys.len(), 2);
        assert!(keys.iter().any(|s| s.contains("March 3")));
        assert!(keys.iter().any(|s| s.contains("4000")));
    }

    #[test]
    fn snippet_truncates_long_text() {
        let long = "word ".repeat(100);
        let s = snippet(&long);
        assert!(s.ends_with("..."));
        assert!(s.chars().count() <= SNIPPET_CHARS + 3);
        assert_eq!(snippet("short"), "short");
    }

    #[test]
    fn empty_text_scores_zero() {
        let eval = LexicalEvaluator::default();
        assert_eq!(eval.evaluate("", None), 0.0);
        assert_eq!(eval.evaluate("?!", Some("prior")), 0.0);
    }

    #[test]
    fn richer_text_scores_higher() {
        let eval = LexicalEvaluator::default();
        let thin = eval.evaluate("no no no no", None);
        let rich = eval.evaluate(FILING, None);
        assert!(rich > thin, "rich={rich} thin={thin}");
        assert!(thin >= 0.0);
    }

    #[test]
    fn repeating_prior_text_loses_novelty() {
        let eval = LexicalEvaluator::default();
        let fresh = eval.evaluate(FILING, Some("an unrelated remark"));
        let repeated = eval.evaluate(FILING, Some(FILING));
        assert!(fresh > repeated);
    }

    #[tokio::test]
    async fn echo_reasoner_is_deterministic() {
        let reasoner = EchoReasoner;
        let a = reasoner.ask_with_context(FILING).await.unwrap();
        let b = reasoner.ask_with_context(FILING).await.unwrap();
        assert_eq!(a, b);
        assert!(a.context.contains("4000"));

        let closing = reasoner.generate_closing(Party::B, 27.5).await.unwrap();
        assert!(closing.contains("Party B"));
        assert!(closing.contains("27.5"));
    }

    #[tokio::test]
    async fn argument_without_content_uses_default_focus() {
        let arg = EchoReasoner.generate_argument("").await.unwrap();
        assert!(arg.contains("the matter before the court"));
    }
}
