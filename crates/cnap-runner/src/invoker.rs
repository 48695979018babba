//! Model invocation: one-shot chat-completions calls.

use std::time::Duration;

use async_trait::async_trait;
use cnap_core::ChatMessage;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::InvokeError;

/// Default chat-completions endpoint.
pub const DEFAULT_ENDPOINT: &str = "https://opencode.ai/zen/v1/chat/completions";

/// Environment variable holding the endpoint credential.
pub const API_KEY_ENV: &str = "OPEN_CODE_API_KEY";

/// Output reported when the endpoint returns no choices.
pub const EMPTY_RESULT: &str = "(empty result)";

const PREVIEW_LEN: usize = 200;

/// Turns a (model, conversation) pair into generated text.
///
/// One attempt per call; retries are the caller's decision.
#[async_trait]
pub trait ModelInvoker: Send + Sync {
    async fn complete(&self, model: &str, messages: &[ChatMessage]) -> Result<String, InvokeError>;
}

#[derive(Debug, Serialize)]
struct CompletionRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
}

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    #[serde(default)]
    choices: Vec<Choice>,
    #[serde(default)]
    error: Option<ApiErrorBody>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: String,
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    #[serde(rename = "type", default)]
    kind: String,
    #[serde(default)]
    message: String,
}

/// HTTP invoker for an OpenAI-compatible chat-completions endpoint.
#[derive(Debug, Clone)]
pub struct OpenCodeInvoker {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
}

impl OpenCodeInvoker {
    /// Create an invoker. Fails fast when the credential is empty.
    pub fn new(
        endpoint: impl Into<String>,
        api_key: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, InvokeError> {
        let api_key = api_key.into();
        if api_key.trim().is_empty() {
            return Err(InvokeError::MissingCredential(API_KEY_ENV));
        }

        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
            api_key,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl ModelInvoker for OpenCodeInvoker {
    async fn complete(&self, model: &str, messages: &[ChatMessage]) -> Result<String, InvokeError> {
        info!(
            model = %model,
            endpoint = %self.endpoint,
            messages = messages.len(),
            "Sending chat completion request"
        );

        let body = CompletionRequest { model, messages };
        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        let text = response.text().await?;

        debug!(
            status = status.as_u16(),
            content_type = %content_type,
            body_preview = %summarize_body(&text),
            "Response received"
        );

        if !status.is_success() {
            return Err(InvokeError::Upstream {
                status: status.as_u16(),
                message: summarize_body(&text),
            });
        }

        let parsed: CompletionResponse =
            serde_json::from_str(&text).map_err(|e| InvokeError::Parse {
                error: e.to_string(),
                body: summarize_body(&text),
            })?;

        if let Some(err) = parsed.error {
            return Err(InvokeError::Api {
                kind: err.kind,
                message: err.message,
            });
        }

        let output = parsed
            .choices
            .into_iter()
            .next()
            .map(|choice| choice.message.content)
            .unwrap_or_else(|| EMPTY_RESULT.to_string());

        info!(output_preview = %summarize_body(&output), "Chat completion received");
        Ok(output)
    }
}

/// Trimmed preview of a body for logs and error messages.
pub fn summarize_body(body: &str) -> String {
    let trimmed = body.trim();
    if trimmed.is_empty() {
        return "<empty>".to_string();
    }
    if trimmed.chars().count() > PREVIEW_LEN {
        let head: String = trimmed.chars().take(PREVIEW_LEN).collect();
        return format!("{head}...");
    }
    trimmed.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    use axum::http::{HeaderMap, StatusCode};
    use axum::routing::post;
    use axum::{Json, Router};
    use serde_json::{json, Value};
    use tokio::net::TcpListener;

    async fn ok_handler(headers: HeaderMap, Json(body): Json<Value>) -> (StatusCode, String) {
        let auth = headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();
        if auth != "Bearer test-key" {
            return (StatusCode::UNAUTHORIZED, "bad key".to_string());
        }
        let last = body["messages"]
            .as_array()
            .and_then(|m| m.last())
            .map(|m| m["content"].as_str().unwrap_or_default().to_string())
            .unwrap_or_default();
        let reply = json!({
            "id": "cmpl-1",
            "object": "chat.completion",
            "model": body["model"],
            "choices": [{
                "index": 0,
                "message": {"role": "assistant", "content": format!("echo: {last}")},
                "finish_reason": "stop"
            }]
        });
        (StatusCode::OK, reply.to_string())
    }

    async fn serve() -> String {
        let app = Router::new()
            .route("/ok", post(ok_handler))
            .route(
                "/down",
                post(|| async { (StatusCode::BAD_GATEWAY, "upstream unavailable") }),
            )
            .route(
                "/api-error",
                post(|| async {
                    Json(json!({"error": {"type": "rate_limit", "message": "slow down"}}))
                }),
            )
            .route("/garbage", post(|| async { "not json" }))
            .route("/empty", post(|| async { Json(json!({"choices": []})) }));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    fn invoker(base: &str, path: &str) -> OpenCodeInvoker {
        OpenCodeInvoker::new(format!("{base}{path}"), "test-key", Duration::from_secs(5)).unwrap()
    }

    #[tokio::test]
    async fn test_successful_completion() {
        let base = serve().await;
        let output = invoker(&base, "/ok")
            .complete(
                "big-pickle",
                &[ChatMessage::system("be brief"), ChatMessage::user("hello")],
            )
            .await
            .unwrap();
        assert_eq!(output, "echo: hello");
    }

    #[tokio::test]
    async fn test_error_replies() {
        let base = serve().await;
        let messages = [ChatMessage::user("hi")];

        let err = invoker(&base, "/down")
            .complete("m", &messages)
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), Some(502));
        assert!(err.to_string().contains("upstream unavailable"));

        let err = invoker(&base, "/api-error")
            .complete("m", &messages)
            .await
            .unwrap_err();
        assert!(matches!(err, InvokeError::Api { ref kind, .. } if kind == "rate_limit"));

        let err = invoker(&base, "/garbage")
            .complete("m", &messages)
            .await
            .unwrap_err();
        assert!(matches!(err, InvokeError::Parse { ref body, .. } if body == "not json"));

        let wrong_key =
            OpenCodeInvoker::new(format!("{base}/ok"), "other", Duration::from_secs(5)).unwrap();
        let err = wrong_key.complete("m", &messages).await.unwrap_err();
        assert_eq!(err.status_code(), Some(401));
    }

    #[tokio::test]
    async fn test_no_choices_yields_placeholder() {
        let base = serve().await;
        let output = invoker(&base, "/empty")
            .complete("m", &[ChatMessage::user("hi")])
            .await
            .unwrap();
        assert_eq!(output, EMPTY_RESULT);
    }

    #[test]
    fn test_missing_credential() {
        let err = OpenCodeInvoker::new(DEFAULT_ENDPOINT, "  ", Duration::from_secs(1)).unwrap_err();
        assert!(matches!(err, InvokeError::MissingCredential(API_KEY_ENV)));
    }

    #[test]
    fn test_summarize_body() {
        assert_eq!(summarize_body("  \n"), "<empty>");
        assert_eq!(summarize_body(" short "), "short");
        let long = "x".repeat(250);
        let summary = summarize_body(&long);
        assert_eq!(summary.len(), 203);
        assert!(summary.ends_with("..."));
    }
}
