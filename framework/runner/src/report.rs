use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::command::Metadata;
use crate::config::RunnerConfig;
use crate::transport::MessageChannel;

/// Terminal outcome of one scenario execution.
///
/// Cancellation is its own outcome, not an error: a cancelled scenario never
/// reports `success` or a partial `error` no matter how far it got.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Error,
    Cancelled,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Success => "success",
            Outcome::Error => "error",
            Outcome::Cancelled => "cancelled",
        }
    }

    fn slack_color(&self) -> &'static str {
        match self {
            Outcome::Success => "good",
            Outcome::Error => "danger",
            Outcome::Cancelled => "warning",
        }
    }
}

/// Everything the reporter needs about one finished scenario.
#[derive(Debug, Clone)]
pub struct ScenarioReport {
    pub scenario: String,
    pub maintainers: Vec<String>,
    pub outcome: Outcome,
    /// Accumulated error list, or a cancellation note, as free text.
    pub detail: String,
    pub run_id: String,
    pub metadata: Metadata,
}

/// Wire shape published to the reporting channel.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReportMessage {
    pub scenario: String,
    pub attributes: std::collections::BTreeMap<String, String>,
    pub status: String,
    pub data: String,
    pub message_id: String,
    pub run_id: String,
}

#[derive(Debug, Serialize)]
struct SlackAttachment {
    fallback: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    color: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    title: Option<String>,
    text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    footer: Option<String>,
    #[serde(rename = "ts", skip_serializing_if = "Option::is_none")]
    timestamp: Option<i64>,
}

#[derive(Debug, Serialize)]
struct SlackMessage {
    attachments: Vec<SlackAttachment>,
}

/// Notification webhook seam; the production implementation posts JSON with
/// reqwest.
#[async_trait]
pub trait Webhook: Send + Sync {
    async fn post(&self, url: &str, payload: Value) -> anyhow::Result<()>;
}

#[derive(Debug, Default, Clone)]
pub struct ReqwestWebhook {
    client: reqwest::Client,
}

impl ReqwestWebhook {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Webhook for ReqwestWebhook {
    async fn post(&self, url: &str, payload: Value) -> anyhow::Result<()> {
        self.client.post(url).json(&payload).send().await?;
        Ok(())
    }
}

/// Emits outcome notifications to the configured sinks.
///
/// Sinks are independent and best-effort: a delivery failure is logged and
/// never escalated, and neither sink blocks the other.
pub struct Reporter {
    slack_webhook: Option<String>,
    webhook: Arc<dyn Webhook>,
    report_subject: Option<String>,
    channel: Arc<dyn MessageChannel>,
    config: RunnerConfig,
}

impl Reporter {
    pub fn new(
        config: RunnerConfig,
        webhook: Arc<dyn Webhook>,
        channel: Arc<dyn MessageChannel>,
    ) -> Self {
        Self {
            slack_webhook: config.slack_webhook.clone(),
            report_subject: config.report_subject.clone(),
            webhook,
            channel,
            config,
        }
    }

    /// Notify every configured sink about one scenario outcome.
    pub async fn notify(&self, report: &ScenarioReport) {
        self.notify_slack(report).await;
        self.notify_channel(report).await;
    }

    /// Announce a batch event (started / complete) to Slack.
    pub async fn notify_batch(&self, title: &str, text: &str) {
        let Some(url) = &self.slack_webhook else {
            return;
        };

        let message = SlackMessage {
            attachments: vec![SlackAttachment {
                fallback: format!("{title}: {text}"),
                color: None,
                title: Some(title.to_string()),
                text: text.to_string(),
                footer: Some("gust".to_string()),
                timestamp: Some(chrono::Utc::now().timestamp()),
            }],
        };

        self.post_slack(url, &message).await;
    }

    async fn notify_slack(&self, report: &ScenarioReport) {
        let Some(url) = &self.slack_webhook else {
            return;
        };

        let name = Path::new(&report.scenario)
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| report.scenario.clone());
        let maintainers = report.maintainers.join(", ");

        let text = match report.outcome {
            Outcome::Success => format!("All tests passed!\nMaintainers: {maintainers}"),
            Outcome::Error => format!("Maintainers: {maintainers}\n{}", report.detail),
            Outcome::Cancelled => {
                format!("Test execution was cancelled\nMaintainers: {maintainers}")
            }
        };

        let message = SlackMessage {
            attachments: vec![SlackAttachment {
                fallback: format!("{name} - {}", report.outcome.as_str()),
                color: Some(report.outcome.slack_color().to_string()),
                title: Some(format!("{name} - {}", report.outcome.as_str())),
                text,
                footer: Some("gust".to_string()),
                timestamp: Some(chrono::Utc::now().timestamp()),
            }],
        };

        self.post_slack(url, &message).await;
    }

    async fn post_slack(&self, url: &str, message: &SlackMessage) {
        let payload = match serde_json::to_value(message) {
            Ok(payload) => payload,
            Err(e) => {
                log::error!("Failed to serialize Slack message: {e}");
                return;
            }
        };

        if let Err(e) = self.webhook.post(url, payload).await {
            log::warn!("Notify (slack) failed: {e:#}");
        }
    }

    async fn notify_channel(&self, report: &ScenarioReport) {
        let Some(subject) = &self.report_subject else {
            return;
        };

        if report.run_id.is_empty() {
            log::warn!(
                "run_id not found in metadata for scenario {}",
                report.scenario
            );
        }

        let message = ReportMessage {
            scenario: report.scenario.clone(),
            attributes: build_attributes(&self.config, &report.metadata),
            status: report.outcome.as_str().to_string(),
            data: report.detail.clone(),
            message_id: nanoid::nanoid!(10),
            run_id: report.run_id.clone(),
        };

        let payload = match serde_json::to_vec(&message) {
            Ok(payload) => payload,
            Err(e) => {
                log::error!("Failed to serialize report message: {e}");
                return;
            }
        };

        if let Err(e) = self.channel.publish(subject, payload).await {
            log::warn!("Publish (report) failed: {e:#}");
        }
    }
}

/// Merge static distribution info with caller metadata.
///
/// String-valued metadata entries are carried as-is. The nested
/// `test_analysis` sub-map is flattened key-by-key instead of being nested.
fn build_attributes(
    config: &RunnerConfig,
    metadata: &Metadata,
) -> std::collections::BTreeMap<String, String> {
    let mut attributes = std::collections::BTreeMap::new();

    for (key, value) in config.distribution_attributes() {
        attributes.insert(key, value);
    }

    for (key, value) in metadata {
        if key == "test_analysis" {
            continue;
        }
        if let Value::String(s) = value {
            if !s.is_empty() {
                attributes.insert(key.clone(), s.clone());
            }
        }
    }

    if let Some(Value::Object(analysis)) = metadata.get("test_analysis") {
        for (key, value) in analysis {
            let rendered = match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            attributes.insert(key.clone(), rendered);
        }
    }

    attributes
}
