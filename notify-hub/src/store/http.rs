//! REST-backed notification store.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response};
use serde::Deserialize;
use tracing::{debug, warn};
use url::Url;

use super::{FetchParams, NotificationStore};
use crate::config::HubConfig;
use crate::notification::model::Notification;
use crate::{Error, Result};

/// Fetch responses come either as a bare array or wrapped in `data`.
#[derive(Deserialize)]
#[serde(untagged)]
enum FetchResponse {
    List(Vec<Notification>),
    Wrapped { data: Vec<Notification> },
}

impl FetchResponse {
    fn into_inner(self) -> Vec<Notification> {
        match self {
            Self::List(items) | Self::Wrapped { data: items } => items,
        }
    }
}

/// Notification store speaking the dashboard's REST API.
pub struct HttpNotificationStore {
    base: Url,
    token: Option<String>,
    client: Client,
}

impl HttpNotificationStore {
    pub fn new(base_url: &str, token: Option<String>, timeout: Duration) -> Result<Self> {
        let base = Url::parse(base_url)
            .map_err(|e| Error::config(format!("Invalid store URL {}: {}", base_url, e)))?;
        if !matches!(base.scheme(), "http" | "https") {
            return Err(Error::config(format!(
                "Unsupported store URL scheme: {}",
                base.scheme()
            )));
        }

        let client = Client::builder().timeout(timeout).build()?;

        Ok(Self {
            base,
            token: token.filter(|t| !t.trim().is_empty()),
            client,
        })
    }

    /// Build from configuration, or `None` when no store URL is configured.
    pub fn from_config(config: &HubConfig) -> Result<Option<Self>> {
        config
            .store_url
            .as_deref()
            .map(|url| {
                Self::new(
                    url,
                    config.store_token.clone(),
                    Duration::from_secs(config.store_timeout_secs),
                )
            })
            .transpose()
    }

    /// `{base}/notifications/{segments...}`, with each segment percent-encoded.
    fn endpoint(&self, segments: &[&str]) -> Result<Url> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| Error::config(format!("Store URL cannot be a base: {}", self.base)))?
            .pop_if_empty()
            .push("notifications")
            .extend(segments);
        Ok(url)
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn check(operation: &str, response: Response) -> Result<Response> {
        if response.status().is_success() {
            return Ok(response);
        }

        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        warn!("Notification store {} failed: {} - {}", operation, status, body);
        Err(Error::remote_sync(operation, format!("{} - {}", status, body)))
    }
}

#[async_trait]
impl NotificationStore for HttpNotificationStore {
    async fn fetch(&self, params: &FetchParams) -> Result<Vec<Notification>> {
        let mut url = self.endpoint(&[])?;
        url.query_pairs_mut().extend_pairs(params.query_pairs());

        let response = self.authorize(self.client.get(url)).send().await?;
        let response = Self::check("fetch", response).await?;
        let items = response.json::<FetchResponse>().await?.into_inner();

        debug!(user_id = %params.user_id, count = items.len(), "Fetched notifications");
        Ok(items)
    }

    async fn mark_as_read(&self, id: &str) -> Result<()> {
        let url = self.endpoint(&[id, "read"])?;
        let response = self.authorize(self.client.patch(url)).send().await?;
        Self::check("mark_read", response).await?;
        Ok(())
    }

    async fn mark_all_as_read(&self, user_id: &str) -> Result<()> {
        let url = self.endpoint(&["read-all"])?;
        let body = serde_json::json!({ "user": user_id });
        let response = self
            .authorize(self.client.patch(url))
            .json(&body)
            .send()
            .await?;
        Self::check("mark_all_read", response).await?;
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        let url = self.endpoint(&[])?;
        let response = self.authorize(self.client.delete(url)).send().await?;
        Self::check("clear", response).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn http_store(base: &str) -> HttpNotificationStore {
        HttpNotificationStore::new(base, None, Duration::from_secs(5)).unwrap()
    }

    #[test]
    fn test_endpoints() {
        let store = http_store("https://api.example.com/api/");
        assert_eq!(
            store.endpoint(&[]).unwrap().as_str(),
            "https://api.example.com/api/notifications"
        );
        assert_eq!(
            store.endpoint(&["abc", "read"]).unwrap().as_str(),
            "https://api.example.com/api/notifications/abc/read"
        );

        let store = http_store("http://localhost:5000");
        assert_eq!(
            store.endpoint(&["read-all"]).unwrap().as_str(),
            "http://localhost:5000/notifications/read-all"
        );
    }

    #[test]
    fn test_invalid_url_is_configuration_error() {
        let err = HttpNotificationStore::new("not a url", None, Duration::from_secs(5))
            .err()
            .unwrap();
        assert!(!err.is_recoverable());

        assert!(HttpNotificationStore::new("ftp://example.com", None, Duration::from_secs(5)).is_err());
    }

    #[test]
    fn test_blank_token_is_ignored() {
        let store =
            HttpNotificationStore::new("https://api.example.com", Some("  ".into()), Duration::from_secs(5))
                .unwrap();
        assert!(store.token.is_none());
    }

    #[test]
    fn test_fetch_response_shapes() {
        let record = json!({ "_id": "65a1b2c3d4e5f60718293a4b", "message": "hi" });

        let bare: FetchResponse = serde_json::from_value(json!([record.clone()])).unwrap();
        assert_eq!(bare.into_inner().len(), 1);

        let wrapped: FetchResponse =
            serde_json::from_value(json!({ "success": true, "data": [record] })).unwrap();
        assert_eq!(wrapped.into_inner()[0].id, "65a1b2c3d4e5f60718293a4b");
    }
}
