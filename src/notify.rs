//! Optional webhook notifier
//!
//! Posts keyword-prefixed text messages to a chat webhook on session events
//! (start, pause, resume, shutdown). Failures are logged and swallowed; the
//! trading loop never depends on the notifier.

use log::warn;
use serde_json::json;
use std::time::Duration;

use crate::config::NotifySettings;

pub struct Notifier {
    client: reqwest::Client,
    webhook_url: String,
    keyword: String,
}

impl Notifier {
    /// Build a notifier when a webhook is configured.
    pub fn from_settings(settings: &NotifySettings) -> Option<Self> {
        let webhook_url = settings.webhook_url.clone()?;
        if webhook_url.is_empty() {
            return None;
        }
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .ok()?;
        Some(Self {
            client,
            webhook_url,
            keyword: settings.keyword.clone().unwrap_or_default(),
        })
    }

    /// Fire-and-forget text message.
    pub async fn send(&self, text: &str) {
        let content = if self.keyword.is_empty() {
            text.to_string()
        } else {
            format!("{} {}", self.keyword, text)
        };
        let payload = json!({
            "msgtype": "text",
            "text": { "content": content },
        });
        match self.client.post(&self.webhook_url).json(&payload).send().await {
            Ok(response) if !response.status().is_success() => {
                warn!("Notifier webhook returned {}", response.status());
            }
            Ok(_) => {}
            Err(e) => warn!("Notifier webhook failed: {e}"),
        }
    }
}
