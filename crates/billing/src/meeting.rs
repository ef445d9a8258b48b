//! External video meetings attached to works

use async_trait::async_trait;

use crate::error::{BillingError, BillingResult};

const ZOOM_API_URL: &str = "https://api.zoom.us/v2";

#[async_trait]
pub trait MeetingProvider: Send + Sync {
    async fn cancel_meeting(&self, meeting_id: &str) -> BillingResult<()>;
}

/// Zoom REST client
#[derive(Clone)]
pub struct ZoomClient {
    http: reqwest::Client,
    api_url: String,
    token: Option<String>,
}

impl ZoomClient {
    pub fn new(api_url: &str, token: Option<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            api_url: api_url.trim_end_matches('/').to_string(),
            token,
        }
    }

    /// Reads `ZOOM_API_TOKEN`; without it cancellations are skipped
    pub fn from_env() -> Self {
        let token = std::env::var("ZOOM_API_TOKEN")
            .ok()
            .filter(|t| !t.trim().is_empty());
        Self::new(ZOOM_API_URL, token)
    }
}

#[async_trait]
impl MeetingProvider for ZoomClient {
    async fn cancel_meeting(&self, meeting_id: &str) -> BillingResult<()> {
        let Some(token) = self.token.as_deref() else {
            tracing::info!(meeting_id = meeting_id, "Zoom not configured, skipping meeting cancel");
            return Ok(());
        };

        let response = self
            .http
            .delete(format!("{}/meetings/{}", self.api_url, meeting_id))
            .bearer_auth(token)
            .send()
            .await
            .map_err(|e| BillingError::Config(format!("Zoom request failed: {}", e)))?;

        // Already gone counts as cancelled
        if response.status().is_success() || response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(());
        }

        Err(BillingError::Config(format!(
            "Zoom API returned {} cancelling meeting {}",
            response.status(),
            meeting_id
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_cancel_meeting_deletes() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("DELETE", "/meetings/8123")
            .match_header("authorization", "Bearer zoom_tok")
            .with_status(204)
            .create_async()
            .await;

        let client = ZoomClient::new(&server.url(), Some("zoom_tok".to_string()));
        client.cancel_meeting("8123").await.unwrap();
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_missing_meeting_is_not_an_error() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("DELETE", "/meetings/404")
            .with_status(404)
            .create_async()
            .await;

        let client = ZoomClient::new(&server.url(), Some("zoom_tok".to_string()));
        assert!(client.cancel_meeting("404").await.is_ok());
    }

    #[tokio::test]
    async fn test_server_error_is_reported() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("DELETE", "/meetings/500")
            .with_status(500)
            .create_async()
            .await;

        let client = ZoomClient::new(&server.url(), Some("zoom_tok".to_string()));
        assert!(client.cancel_meeting("500").await.is_err());
    }
}
