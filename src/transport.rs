//! # Outbound Transport
//!
//! The single channel deliveries go out on. [`WebhookTransport`] is the seam the
//! worker depends on; [`ReqwestTransport`] is the production HTTP implementation.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use reqwest::header::{CONTENT_TYPE, HeaderMap, HeaderValue};
use thiserror::Error;
use url::Url;
use uuid::Uuid;

pub const SIGNATURE_HEADER: &str = "X-Webhook-Signature";
pub const EVENT_HEADER: &str = "X-Webhook-Event";
pub const DELIVERY_HEADER: &str = "X-Webhook-Delivery";

/// Cap on response body characters kept for logging.
const RESPONSE_SNIPPET_CHARS: usize = 1024;

/// Everything needed to put one delivery attempt on the wire.
#[derive(Debug, Clone)]
pub struct OutboundWebhook {
    pub delivery_id: Uuid,
    pub target_url: String,
    pub event_type: String,
    pub payload: String,
    pub signature: String,
}

/// A response was received; classification happens in the worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportResponse {
    pub status_code: u16,
    pub body_snippet: String,
}

impl TransportResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status_code)
    }
}

/// No usable response was received.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("Request timeout")]
    Timeout,
    #[error("Connection failed: {0}")]
    Connect(String),
    #[error("Invalid target URL: {0}")]
    InvalidUrl(String),
    #[error("Request error: {0}")]
    Request(String),
}

#[async_trait]
pub trait WebhookTransport: Send + Sync {
    async fn send(&self, webhook: &OutboundWebhook) -> Result<TransportResponse, TransportError>;
}

/// reqwest-backed transport with a hard request timeout and no redirect following.
#[derive(Clone)]
pub struct ReqwestTransport {
    client: Client,
}

impl ReqwestTransport {
    pub fn new(timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(concat!("webhooks/", env!("CARGO_PKG_VERSION")))
            .redirect(reqwest::redirect::Policy::none())
            .build()?;
        Ok(Self { client })
    }

    fn headers(webhook: &OutboundWebhook) -> Result<HeaderMap, TransportError> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        for (name, value) in [
            (SIGNATURE_HEADER, webhook.signature.clone()),
            (EVENT_HEADER, webhook.event_type.clone()),
            (DELIVERY_HEADER, webhook.delivery_id.to_string()),
        ] {
            let value = HeaderValue::from_str(&value)
                .map_err(|e| TransportError::Request(format!("invalid {name} header: {e}")))?;
            headers.insert(name, value);
        }
        Ok(headers)
    }
}

#[async_trait]
impl WebhookTransport for ReqwestTransport {
    async fn send(&self, webhook: &OutboundWebhook) -> Result<TransportResponse, TransportError> {
        let url = Url::parse(&webhook.target_url)
            .map_err(|e| TransportError::InvalidUrl(e.to_string()))?;
        let headers = Self::headers(webhook)?;

        let response = self
            .client
            .post(url)
            .headers(headers)
            .body(webhook.payload.clone())
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    TransportError::Timeout
                } else if e.is_connect() {
                    TransportError::Connect(e.to_string())
                } else {
                    TransportError::Request(e.to_string())
                }
            })?;

        let status_code = response.status().as_u16();
        let body_snippet = response
            .text()
            .await
            .unwrap_or_default()
            .chars()
            .take(RESPONSE_SNIPPET_CHARS)
            .collect();

        Ok(TransportResponse {
            status_code,
            body_snippet,
        })
    }
}

/// Scheme and host only, for log lines.
pub fn redacted_target(target_url: &str) -> String {
    Url::parse(target_url)
        .ok()
        .map(|parsed| {
            let host = parsed.host_str().unwrap_or("unknown");
            format!("{}://{}", parsed.scheme(), host)
        })
        .unwrap_or_else(|| "[invalid-url]".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_string, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn webhook(target_url: String) -> OutboundWebhook {
        OutboundWebhook {
            delivery_id: Uuid::new_v4(),
            target_url,
            event_type: "campaign.completed".to_string(),
            payload: r#"{"event":"campaign.completed","emittedAt":"2026-01-01T00:00:00Z","data":{}}"#
                .to_string(),
            signature: "abc123".to_string(),
        }
    }

    #[tokio::test]
    async fn posts_payload_with_signature_headers() {
        let server = MockServer::start().await;
        let outbound = webhook(format!("{}/hook", server.uri()));

        Mock::given(method("POST"))
            .and(path("/hook"))
            .and(header(SIGNATURE_HEADER, "abc123"))
            .and(header(EVENT_HEADER, "campaign.completed"))
            .and(header(DELIVERY_HEADER, outbound.delivery_id.to_string().as_str()))
            .and(header("content-type", "application/json"))
            .and(body_string(outbound.payload.clone()))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        let transport = ReqwestTransport::new(Duration::from_secs(5)).unwrap();
        let response = transport.send(&outbound).await.unwrap();
        assert_eq!(response.status_code, 204);
        assert!(response.is_success());
    }

    #[tokio::test]
    async fn non_2xx_is_returned_as_response() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503).set_body_string("down"))
            .mount(&server)
            .await;

        let transport = ReqwestTransport::new(Duration::from_secs(5)).unwrap();
        let response = transport.send(&webhook(server.uri())).await.unwrap();
        assert_eq!(response.status_code, 503);
        assert_eq!(response.body_snippet, "down");
        assert!(!response.is_success());
    }

    #[tokio::test]
    async fn redirects_are_not_followed() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(302).insert_header("location", "http://example.invalid/"),
            )
            .mount(&server)
            .await;

        let transport = ReqwestTransport::new(Duration::from_secs(5)).unwrap();
        let response = transport.send(&webhook(server.uri())).await.unwrap();
        assert_eq!(response.status_code, 302);
        assert!(!response.is_success());
    }

    #[tokio::test]
    async fn slow_endpoint_times_out() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(500)))
            .mount(&server)
            .await;

        let transport = ReqwestTransport::new(Duration::from_millis(50)).unwrap();
        let err = transport.send(&webhook(server.uri())).await.unwrap_err();
        assert_eq!(err, TransportError::Timeout);
    }

    #[tokio::test]
    async fn unreachable_host_is_an_error() {
        let transport = ReqwestTransport::new(Duration::from_secs(2)).unwrap();
        let result = transport
            .send(&webhook("http://127.0.0.1:1/hook".to_string()))
            .await;
        assert!(result.is_err());
    }

    #[test]
    fn redacts_path_and_query() {
        assert_eq!(
            redacted_target("https://hooks.example.com/secret/path?token=x"),
            "https://hooks.example.com"
        );
        assert_eq!(redacted_target("not a url"), "[invalid-url]");
    }
}
