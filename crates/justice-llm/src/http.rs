use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use justice_core::collab::{Evaluator, Grounded, Reasoner};
use justice_core::errors::CollaboratorError;
use justice_core::turns::{Party, TranscriptEntry};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Connection to a JSON reasoning/scoring service.
///
/// Every operation is a `POST {base_url}/{op}` with a JSON body; an optional
/// bearer key is attached to each request.
#[derive(Clone)]
pub struct HttpBackend {
    client: Client,
    base_url: String,
    api_key: Option<SecretString>,
}

impl std::fmt::Debug for HttpBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpBackend")
            .field("base_url", &self.base_url)
            .field("api_key", &self.api_key.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

impl HttpBackend {
    pub fn new(
        base_url: impl Into<String>,
        api_key: Option<SecretString>,
    ) -> Result<Self, CollaboratorError> {
        let client = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|e| CollaboratorError::Unavailable(format!("http client: {e}")))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn post<B, R>(&self, op: &str, body: &B) -> Result<R, CollaboratorError>
    where
        B: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let url = format!("{}/{op}", self.base_url);
        let mut req = self
            .client
            .post(&url)
            .header("accept", "application/json")
            .json(body);
        if let Some(key) = &self.api_key {
            req = req.header("Authorization", format!("Bearer {}", key.expose_secret()));
        }

        let resp = req.send().await.map_err(|e| {
            if e.is_timeout() {
                CollaboratorError::Unavailable(format!("{op}: request timed out"))
            } else {
                CollaboratorError::Unavailable(format!("{op}: {e}"))
            }
        })?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(CollaboratorError::from_status(status.as_u16(), body));
        }

        let parsed = resp
            .json::<R>()
            .await
            .map_err(|e| CollaboratorError::InvalidResponse(format!("{op}: {e}")))?;
        debug!(op, "collaborator call succeeded");
        Ok(parsed)
    }
}

#[derive(Serialize)]
struct AskRequest<'a> {
    text: &'a str,
}

#[derive(Deserialize)]
struct AskResponse {
    answer: String,
    #[serde(default)]
    context: String,
}

#[derive(Serialize)]
struct ArgumentRequest<'a> {
    query: &'a str,
}

#[derive(Serialize)]
struct CommentaryRequest<'a> {
    turn: &'a TranscriptEntry,
}

#[derive(Serialize)]
struct ClosingRequest {
    winner: Party,
    score_difference: f64,
}

#[derive(Deserialize)]
struct TextResponse {
    text: String,
}

#[derive(Serialize)]
struct ScoreRequest<'a> {
    text: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    prior: Option<&'a str>,
}

#[derive(Deserialize)]
struct ScoreResponse {
    score: f64,
}

/// `Reasoner` backed by the JSON service.
#[derive(Clone, Debug)]
pub struct HttpReasoner {
    backend: HttpBackend,
}

impl HttpReasoner {
    pub fn new(backend: HttpBackend) -> Self {
        Self { backend }
    }
}

#[async_trait]
impl Reasoner for HttpReasoner {
    #[instrument(skip_all, fields(base_url = %self.backend.base_url))]
    async fn ask_with_context(&self, text: &str) -> Result<Grounded, CollaboratorError> {
        let resp: AskResponse = self.backend.post("ask", &AskRequest { text }).await?;
        Ok(Grounded {
            answer: resp.answer,
            context: resp.context,
        })
    }

    #[instrument(skip_all, fields(base_url = %self.backend.base_url))]
    async fn generate_argument(&self, query: &str) -> Result<String, CollaboratorError> {
        let resp: TextResponse = self
            .backend
            .post("argument", &ArgumentRequest { query })
            .await?;
        Ok(resp.text)
    }

    async fn generate_commentary(
        &self,
        last_turn: &TranscriptEntry,
    ) -> Result<String, CollaboratorError> {
        let resp: TextResponse = self
            .backend
            .post("commentary", &CommentaryRequest { turn: last_turn })
            .await?;
        Ok(resp.text)
    }

    async fn generate_closing(
        &self,
        winner: Party,
        score_difference: f64,
    ) -> Result<String, CollaboratorError> {
        let resp: TextResponse = self
            .backend
            .post(
                "closing",
                &ClosingRequest {
                    winner,
                    score_difference,
                },
            )
            .await?;
        Ok(resp.text)
    }
}

/// `Evaluator` backed by the JSON service.
#[derive(Clone, Debug)]
pub struct HttpEvaluator {
    backend: HttpBackend,
}

impl HttpEvaluator {
    pub fn new(backend: HttpBackend) -> Self {
        Self { backend }
    }
}

#[async_trait]
impl Evaluator for HttpEvaluator {
    #[instrument(skip_all, fields(base_url = %self.backend.base_url))]
    async fn score(&self, text: &str, prior: Option<&str>) -> Result<f64, CollaboratorError> {
        let resp: ScoreResponse = self
            .backend
            .post("score", &ScoreRequest { text, prior })
            .await?;
        if !resp.score.is_finite() || resp.score < 0.0 {
            return Err(CollaboratorError::InvalidResponse(format!(
                "score must be a non-negative number, got {}",
                resp.score
            )));
        }
        Ok(resp.score)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::{HeaderMap, StatusCode};
    use axum::routing::post;
    use axum::{Json, Router};
    use serde_json::{json, Value};

    async fn serve(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{addr}")
    }

    fn fake_service() -> Router {
        Router::new()
            .route(
                "/ask",
                post(|Json(body): Json<Value>| async move {
                    Json(json!({
                        "answer": format!("re: {}", body["text"].as_str().unwrap_or("")),
                        "context": "Article 7 of the contract"
                    }))
                }),
            )
            .route(
                "/argument",
                post(|Json(body): Json<Value>| async move {
                    let query = body["query"].as_str().unwrap_or("").to_string();
                    Json(json!({ "text": format!("rebuttal to {query}") }))
                }),
            )
            .route(
                "/commentary",
                post(|Json(body): Json<Value>| async move {
                    Json(json!({ "text": format!("noted turn {}", body["turn"]["turn"]) }))
                }),
            )
            .route(
                "/closing",
                post(|Json(body): Json<Value>| async move {
                    let winner = body["winner"].as_str().unwrap_or("").to_string();
                    Json(json!({ "text": format!("winner {winner}") }))
                }),
            )
            .route(
                "/score",
                post(|headers: HeaderMap, Json(body): Json<Value>| async move {
                    if headers.get("authorization").and_then(|v| v.to_str().ok())
                        != Some("Bearer sk-test")
                    {
                        return (StatusCode::UNAUTHORIZED, Json(json!({"error": "no key"})));
                    }
                    let bonus = if body.get("prior").is_some() { 1.0 } else { 0.0 };
                    (StatusCode::OK, Json(json!({ "score": 4.5 + bonus })))
                }),
            )
    }

    fn backend(base: &str, key: Option<&str>) -> HttpBackend {
        HttpBackend::new(base, key.map(SecretString::from)).unwrap()
    }

    #[tokio::test]
    async fn reasoner_round_trips_each_operation() {
        let base = serve(fake_service()).await;
        let reasoner = HttpReasoner::new(backend(&base, None));

        let grounded = reasoner.ask_with_context("late delivery").await.unwrap();
        assert_eq!(grounded.answer, "re: late delivery");
        assert_eq!(grounded.context, "Article 7 of the contract");

        let arg = reasoner.generate_argument("late delivery").await.unwrap();
        assert_eq!(arg, "rebuttal to late delivery");

        let entry = TranscriptEntry {
            turn: 3,
            speaker: Party::A,
            input: "x".into(),
            context: None,
            score: 2.0,
        };
        assert_eq!(reasoner.generate_commentary(&entry).await.unwrap(), "noted turn 3");
        assert_eq!(reasoner.generate_closing(Party::B, 30.0).await.unwrap(), "winner b");
    }

    #[tokio::test]
    async fn evaluator_sends_bearer_key() {
        let base = serve(fake_service()).await;
        let evaluator = HttpEvaluator::new(backend(&base, Some("sk-test")));
        assert_eq!(evaluator.score("text", None).await.unwrap(), 4.5);
        assert_eq!(evaluator.score("text", Some("before")).await.unwrap(), 5.5);
    }

    #[tokio::test]
    async fn missing_key_is_rejected() {
        let base = serve(fake_service()).await;
        let evaluator = HttpEvaluator::new(backend(&base, None));
        let err = evaluator.score("text", None).await.unwrap_err();
        assert!(matches!(err, CollaboratorError::Rejected(_)));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn server_error_is_retryable() {
        let router = Router::new().route(
            "/score",
            post(|| async { (StatusCode::SERVICE_UNAVAILABLE, "overloaded") }),
        );
        let base = serve(router).await;
        let err = HttpEvaluator::new(backend(&base, None))
            .score("text", None)
            .await
            .unwrap_err();
        assert!(matches!(err, CollaboratorError::ServerError { status: 503, .. }));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn negative_score_is_invalid() {
        let router = Router::new().route("/score", post(|| async { Json(json!({"score": -1.0})) }));
        let base = serve(router).await;
        let err = HttpEvaluator::new(backend(&base, None))
            .score("text", None)
            .await
            .unwrap_err();
        assert!(matches!(err, CollaboratorError::InvalidResponse(_)));
    }

    #[tokio::test]
    async fn malformed_body_is_invalid_response() {
        let router = Router::new().route("/argument", post(|| async { Json(json!({"nope": 1})) }));
        let base = serve(router).await;
        let err = HttpReasoner::new(backend(&base, None))
            .generate_argument("q")
            .await
            .unwrap_err();
        assert!(matches!(err, CollaboratorError::InvalidResponse(_)));
    }

    #[tokio::test]
    async fn unreachable_service_is_unavailable() {
        let err = HttpReasoner::new(backend("http://127.0.0.1:1", None))
            .generate_argument("q")
            .await
            .unwrap_err();
        assert!(matches!(err, CollaboratorError::Unavailable(_)));
    }

    #[test]
    fn trailing_slash_trimmed_and_key_redacted() {
        let backend = backend("http://localhost:9000/", Some("sk-secret"));
        assert_eq!(backend.base_url(), "http://localhost:9000");
        let debug = format!("{backend:?}");
        assert!(!debug.contains("sk-secret"));
        assert!(debug.contains("REDACTED"));
    }
}
