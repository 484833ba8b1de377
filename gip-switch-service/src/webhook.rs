use async_trait::async_trait;
use std::time::Duration;

const BODY_SNIPPET_LIMIT: usize = 256;

/// Result of one webhook POST that reached the institution at all.
#[derive(Debug, Clone)]
pub struct WebhookDelivery {
    pub http_status: u16,
    pub body_snippet: String,
}

impl WebhookDelivery {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.http_status)
    }
}

/// Delivery seam for the client-callback worker; the error string is a
/// network-level failure with no HTTP status.
#[async_trait]
pub trait WebhookSender {
    async fn deliver(&self, url: &str, payload: &str) -> Result<WebhookDelivery, String>;
}

pub struct HttpWebhookSender {
    client: reqwest::Client,
}

impl HttpWebhookSender {
    pub fn new(request_timeout: Duration) -> Result<Self, String> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| format!("Failed to initialize webhook client: {e}"))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl WebhookSender for HttpWebhookSender {
    async fn deliver(&self, url: &str, payload: &str) -> Result<WebhookDelivery, String> {
        let response = self
            .client
            .post(url)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(payload.to_string())
            .send()
            .await
            .map_err(|e| e.to_string())?;

        let http_status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        let body_snippet = body.chars().take(BODY_SNIPPET_LIMIT).collect();

        Ok(WebhookDelivery {
            http_status,
            body_snippet,
        })
    }
}
