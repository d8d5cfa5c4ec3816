use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use reqwest::{Client, Url};
use tracing::debug;

use super::BlockUserCall;
use super::error::ForumError;
use super::types::NotificationLevelRequest;
use crate::config::BlockerConfig;
use crate::state_machine::CallFailure;

/// Upper bound for a server-supplied `Retry-After` wait.
pub const MAX_RETRY_AFTER_MS: u64 = 10 * 60 * 1000;

/// HTTP client for a Discourse-style forum API.
pub struct ForumClient {
    client: Client,
    base_url: Url,
    api_key: String,
    api_username: String,
    ignore_for: chrono::Duration,
}

impl ForumClient {
    pub fn new(
        base_url: &str,
        api_key: String,
        api_username: String,
        ignore_for: chrono::Duration,
        timeout: Duration,
    ) -> Result<Self, ForumError> {
        let base_url =
            Url::parse(base_url).map_err(|e| ForumError::InvalidUrl(format!("{base_url}: {e}")))?;
        if base_url.cannot_be_a_base() {
            return Err(ForumError::InvalidUrl(base_url.to_string()));
        }
        if Utc::now().checked_add_signed(ignore_for).is_none() {
            return Err(ForumError::InvalidIgnoreDuration(format!(
                "{} days",
                ignore_for.num_days()
            )));
        }
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(timeout)
            .build()?;
        Ok(Self {
            client,
            base_url,
            api_key,
            api_username,
            ignore_for,
        })
    }

    pub fn from_config(config: &BlockerConfig) -> Result<Self, ForumError> {
        let days = config.ignore_duration_days;
        let ignore_for = chrono::Duration::try_days(i64::from(days))
            .ok_or_else(|| ForumError::InvalidIgnoreDuration(format!("{days} days")))?;
        Self::new(
            &config.base_url,
            config.api_key.clone(),
            config.api_username.clone(),
            ignore_for,
            Duration::from_secs(config.request_timeout_secs),
        )
    }

    fn user_url(&self, username: &str) -> Result<Url, ForumError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| ForumError::InvalidUrl(self.base_url.to_string()))?
            .pop_if_empty()
            .extend(["u", username, "notification_level.json"]);
        Ok(url)
    }

    /// Ignore `username` for the configured duration.
    pub async fn ignore_user(&self, username: &str) -> Result<(), ForumError> {
        let url = self.user_url(username)?;
        let expiring_at = Utc::now()
            .checked_add_signed(self.ignore_for)
            .ok_or_else(|| {
                ForumError::InvalidIgnoreDuration(format!("{} days", self.ignore_for.num_days()))
            })?;
        let body = NotificationLevelRequest::ignore_until(expiring_at);

        let response = self
            .client
            .put(url)
            .header("Api-Key", &self.api_key)
            .header("Api-Username", &self.api_username)
            .json(&body)
            .send()
            .await?;

        let status = response.status();

        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            let retry_after = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .map(|secs| secs.saturating_mul(1000).min(MAX_RETRY_AFTER_MS))
                .unwrap_or(1000);
            return Err(ForumError::RateLimited {
                retry_after_ms: retry_after,
            });
        }

        if !status.is_success() {
            let message = response
                .text()
                .await
                .unwrap_or_else(|_| "unknown error".to_string());
            return Err(ForumError::ApiError {
                status: status.as_u16(),
                message,
            });
        }

        debug!(username, "user ignored");
        Ok(())
    }
}

#[async_trait]
impl BlockUserCall for ForumClient {
    async fn block_user(&self, username: &str) -> Result<(), CallFailure> {
        self.ignore_user(username).await.map_err(CallFailure::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client_for(server: &MockServer) -> ForumClient {
        ForumClient::new(
            &server.uri(),
            "key-123".into(),
            "moderator".into(),
            chrono::Duration::days(30),
            Duration::from_secs(5),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn block_user_sends_ignore_request() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/u/spammer/notification_level.json"))
            .and(header("Api-Key", "key-123"))
            .and(header("Api-Username", "moderator"))
            .and(body_partial_json(serde_json::json!({"notification_level": "ignore"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"success": "OK"})))
            .expect(1)
            .mount(&server)
            .await;

        let client = client_for(&server);
        assert_eq!(client.block_user("spammer").await, Ok(()));
    }

    #[tokio::test]
    async fn rate_limit_maps_to_transient_with_retry_after() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .respond_with(ResponseTemplate::new(429).insert_header("retry-after", "7"))
            .mount(&server)
            .await;

        let client = client_for(&server);
        let err = client.block_user("spammer").await.unwrap_err();
        assert_eq!(
            err,
            CallFailure::Transient {
                reason: "rate limited by server".into(),
                retry_after_ms: Some(7000),
            }
        );
    }

    #[tokio::test]
    async fn oversized_retry_after_is_capped() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .respond_with(
                ResponseTemplate::new(429).insert_header("retry-after", "18446744073709551615"),
            )
            .mount(&server)
            .await;

        let client = client_for(&server);
        let err = client.ignore_user("spammer").await.unwrap_err();
        assert!(matches!(
            err,
            ForumError::RateLimited { retry_after_ms } if retry_after_ms == MAX_RETRY_AFTER_MS
        ));
    }

    #[tokio::test]
    async fn unknown_user_is_terminal() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .respond_with(ResponseTemplate::new(404).set_body_string("not found"))
            .mount(&server)
            .await;

        let client = client_for(&server);
        let err = client.block_user("ghost").await.unwrap_err();
        assert_eq!(err, CallFailure::terminal("user not found"));
    }

    #[tokio::test]
    async fn server_error_is_transient() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .respond_with(ResponseTemplate::new(502).set_body_string("bad gateway"))
            .mount(&server)
            .await;

        let client = client_for(&server);
        let err = client.block_user("spammer").await.unwrap_err();
        assert!(err.is_transient());
        assert_eq!(err.reason(), "server error 502: bad gateway");
    }

    #[tokio::test]
    async fn base_url_with_path_prefix_is_respected() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/forum/u/someone/notification_level.json"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let client = ForumClient::new(
            &format!("{}/forum/", server.uri()),
            String::new(),
            String::new(),
            chrono::Duration::days(1),
            Duration::from_secs(5),
        )
        .unwrap();
        assert_eq!(client.block_user("someone").await, Ok(()));
    }

    #[test]
    fn invalid_base_url_is_rejected() {
        let result = ForumClient::new(
            "not a url",
            String::new(),
            String::new(),
            chrono::Duration::days(1),
            Duration::from_secs(5),
        );
        assert!(matches!(result, Err(ForumError::InvalidUrl(_))));
    }

    #[test]
    fn ignore_duration_past_calendar_range_is_rejected() {
        let result = ForumClient::new(
            "http://localhost:3000",
            String::new(),
            String::new(),
            chrono::Duration::days(200_000_000),
            Duration::from_secs(5),
        );
        assert!(matches!(result, Err(ForumError::InvalidIgnoreDuration(_))));

        let config = BlockerConfig {
            ignore_duration_days: u32::MAX,
            ..BlockerConfig::default()
        };
        assert!(matches!(
            ForumClient::from_config(&config),
            Err(ForumError::InvalidIgnoreDuration(_))
        ));
    }
}
