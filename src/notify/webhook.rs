use anyhow::{anyhow, Context, Result};
use std::time::Duration;

use super::Notifier;
use crate::alert::Alert;

const WEBHOOK_TIMEOUT: Duration = Duration::from_secs(5);

/// POSTs each alert as JSON to a fixed URL.
pub struct WebhookNotifier {
    url: url::Url,
    agent: ureq::Agent,
}

impl WebhookNotifier {
    pub fn new(raw_url: &str) -> Result<Self> {
        let url = url::Url::parse(raw_url).context("parse webhook url")?;
        match url.scheme() {
            "http" | "https" => {}
            other => return Err(anyhow!("webhook url must be http(s), got {}", other)),
        }
        let agent = ureq::AgentBuilder::new().timeout(WEBHOOK_TIMEOUT).build();
        Ok(Self { url, agent })
    }
}

impl Notifier for WebhookNotifier {
    fn name(&self) -> &'static str {
        "webhook"
    }

    fn notify(&mut self, alert: &Alert) -> Result<()> {
        let body = serde_json::to_value(alert)?;
        self.agent
            .post(self.url.as_str())
            .send_json(body)
            .map_err(|e| anyhow!("webhook POST {}: {}", self.url, e))?;
        Ok(())
    }
}
