use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use url::Url;

use crate::error::JobError;
use crate::worker::Job;

const MESSAGE: &str = "Running in sandbox";

/// Notification body posted by [`WebhookJob`].
#[derive(Debug, Serialize)]
struct Notification<'a> {
    message: &'a str,
}

/// POSTs a JSON notification to a fixed URL.
#[derive(Debug, Clone)]
pub struct WebhookJob {
    client: reqwest::Client,
    url: Url,
}

impl WebhookJob {
    pub fn new(url: Url) -> Self {
        Self {
            client: reqwest::Client::new(),
            url,
        }
    }
}

#[async_trait]
impl Job for WebhookJob {
    fn name(&self) -> &str {
        "webhook"
    }

    async fn run(&self) -> Result<(), JobError> {
        let resp = self
            .client
            .post(self.url.clone())
            .timeout(Duration::from_secs(30))
            .json(&Notification { message: MESSAGE })
            .send()
            .await
            .map_err(|e| JobError::Failed {
                reason: format!("webhook request failed: {}", e),
            })?;

        let status = resp.status();
        if !status.is_success() {
            return Err(JobError::Failed {
                reason: format!("webhook returned HTTP {}", status),
            });
        }
        tracing::info!(url = %self.url, status = status.as_u16(), "Webhook delivered");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::spawn_capture_server;

    #[tokio::test]
    async fn posts_json_notification() {
        let (url, log) = spawn_capture_server().await;
        let job = WebhookJob::new(url.join("/hook").unwrap());
        job.run().await.unwrap();

        let requests = log.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].uri, "/hook");
        let body: serde_json::Value = serde_json::from_slice(&requests[0].body).unwrap();
        assert_eq!(body, serde_json::json!({ "message": "Running in sandbox" }));
    }

    #[tokio::test]
    async fn error_status_fails_the_job() {
        let (url, _) = spawn_capture_server().await;
        let job = WebhookJob::new(url.join("/status/500").unwrap());
        let err = job.run().await.unwrap_err();
        assert!(err.to_string().contains("500"));
    }
}
