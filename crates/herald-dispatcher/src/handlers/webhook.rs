//! Outbound webhook delivery.

use async_trait::async_trait;
use herald_config::WebhookConfig;
use herald_core::{HandlerOutcome, JobHandler, JobPayload};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::debug;
use url::Url;

/// Header receivers use to drop duplicate deliveries.
pub const IDEMPOTENCY_HEADER: &str = "Idempotency-Key";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookPayload {
    pub url: Url,
    #[serde(default)]
    pub body: serde_json::Value,
    /// Natural key of the event, e.g. `quote-42-sent`.
    pub idempotency_key: String,
}

impl JobPayload for WebhookPayload {
    const JOB_TYPE: &'static str = "webhook";
}

/// POSTs the payload body as JSON.
pub struct WebhookHandler {
    client: reqwest::Client,
}

impl WebhookHandler {
    pub fn new(config: &WebhookConfig) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .user_agent(config.user_agent.clone())
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl JobHandler for WebhookHandler {
    type Payload = WebhookPayload;

    async fn handle(&self, payload: WebhookPayload) -> HandlerOutcome {
        debug!(url = %payload.url, idempotency_key = %payload.idempotency_key, "Delivering webhook");

        let response = self
            .client
            .post(payload.url.clone())
            .header(IDEMPOTENCY_HEADER, &payload.idempotency_key)
            .json(&payload.body)
            .send()
            .await;

        match response {
            Ok(response) => classify_status(response.status()),
            Err(e) => HandlerOutcome::retryable(format!("request to {} failed: {}", payload.url, e)),
        }
    }
}

/// Map a receiver's status code to an outcome.
pub fn classify_status(status: StatusCode) -> HandlerOutcome {
    if status.is_success() {
        return HandlerOutcome::Success;
    }
    let retryable = status.is_server_error()
        || status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS;
    let message = format!("webhook receiver returned {}", status);
    if retryable || !status.is_client_error() {
        HandlerOutcome::Retryable(message)
    } else {
        HandlerOutcome::Permanent(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn handler() -> WebhookHandler {
        WebhookHandler::new(&WebhookConfig {
            timeout: Duration::from_secs(2),
            user_agent: "herald-test".into(),
        })
        .unwrap()
    }

    fn payload(url: &str) -> WebhookPayload {
        WebhookPayload {
            url: Url::parse(url).unwrap(),
            body: json!({"quote_id": "q-42", "event": "quote.sent"}),
            idempotency_key: "quote-q-42-sent".into(),
        }
    }

    /// Accept one request, return its head, answer with `status_line`.
    async fn one_shot_server(status_line: &'static str) -> (String, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}/hooks", listener.local_addr().unwrap());
        let task = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = Vec::new();
            let mut chunk = [0u8; 1024];
            while !buf.windows(4).any(|w| w == b"\r\n\r\n") {
                let n = socket.read(&mut chunk).await.unwrap();
                if n == 0 {
                    break;
                }
                buf.extend_from_slice(&chunk[..n]);
            }
            let response = format!("HTTP/1.1 {status_line}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n");
            socket.write_all(response.as_bytes()).await.unwrap();
            String::from_utf8_lossy(&buf).to_lowercase()
        });
        (url, task)
    }

    #[test]
    fn test_classify_status() {
        assert_eq!(classify_status(StatusCode::OK), HandlerOutcome::Success);
        assert_eq!(classify_status(StatusCode::ACCEPTED), HandlerOutcome::Success);
        for status in [
            StatusCode::INTERNAL_SERVER_ERROR,
            StatusCode::BAD_GATEWAY,
            StatusCode::REQUEST_TIMEOUT,
            StatusCode::TOO_MANY_REQUESTS,
        ] {
            assert!(matches!(classify_status(status), HandlerOutcome::Retryable(_)), "{status}");
        }
        for status in [StatusCode::BAD_REQUEST, StatusCode::NOT_FOUND, StatusCode::GONE] {
            assert!(matches!(classify_status(status), HandlerOutcome::Permanent(_)), "{status}");
        }
    }

    #[test]
    fn test_payload_schema() {
        let value = json!({
            "url": "https://crm.example.com/hooks",
            "idempotency_key": "k1"
        });
        let payload: WebhookPayload = serde_json::from_value(value).unwrap();
        assert_eq!(payload.body, serde_json::Value::Null);

        let missing_key = json!({ "url": "https://crm.example.com/hooks" });
        assert!(serde_json::from_value::<WebhookPayload>(missing_key).is_err());
    }

    #[tokio::test]
    async fn test_delivery_sends_idempotency_key() {
        let (url, server) = one_shot_server("204 No Content").await;
        let outcome = handler().handle(payload(&url)).await;
        assert_eq!(outcome, HandlerOutcome::Success);

        let request = server.await.unwrap();
        assert!(request.starts_with("post /hooks"));
        assert!(request.contains("idempotency-key: quote-q-42-sent"));
    }

    #[tokio::test]
    async fn test_server_error_is_retryable() {
        let (url, server) = one_shot_server("503 Service Unavailable").await;
        let outcome = handler().handle(payload(&url)).await;
        assert!(matches!(outcome, HandlerOutcome::Retryable(_)));
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_connection_refused_is_retryable() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let outcome = handler().handle(payload(&format!("http://{addr}/hooks"))).await;
        assert!(matches!(outcome, HandlerOutcome::Retryable(_)));
    }
}
