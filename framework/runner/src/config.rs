use std::path::PathBuf;

/// Errors that abort startup. Everything else in the runner is collected and
/// reported rather than escalated.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("no scenario files found after discovery and filtering")]
    EmptyScenarioSet,

    #[error("conflicting distribution channels configured: {0} and {1}")]
    ConflictingChannels(String, String),
}

/// Configuration for one worker process.
#[derive(Debug, Clone, Default)]
pub struct RunnerConfig {
    /// Explicit scenario files to run. Combined with discovery under
    /// [RunnerConfig::scenario_dir] and deduplicated.
    pub scenario_files: Vec<PathBuf>,

    /// Root directory to discover scenario files under.
    pub scenario_dir: Option<PathBuf>,

    /// `key=value` tag requirements applied to every resolved scenario.
    pub tags: Vec<String>,

    /// Slack webhook URL for outcome notifications.
    pub slack_webhook: Option<String>,

    /// Subject `process` commands are published to during fan-out.
    pub command_subject: String,

    /// Subject outcome reports are published to. Reporting to the channel is
    /// disabled when unset.
    pub report_subject: Option<String>,

    /// Name of the SNS/SQS distribution channel, when that transport carries
    /// the commands.
    pub sns_sqs: Option<String>,

    /// Name of the Pub/Sub distribution channel, when that transport carries
    /// the commands.
    pub pubsub: Option<String>,
}

impl RunnerConfig {
    /// The two distribution transports are mutually exclusive. Both being set
    /// is a wiring mistake that would split the fleet across two channels, so
    /// it aborts startup.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if let (Some(sns), Some(ps)) = (&self.sns_sqs, &self.pubsub) {
            return Err(ConfigError::ConflictingChannels(sns.clone(), ps.clone()));
        }

        Ok(())
    }

    /// Static distribution info merged into report attributes.
    pub fn distribution_attributes(&self) -> Vec<(String, String)> {
        let mut attrs = Vec::new();
        if let Some(sns) = &self.sns_sqs {
            attrs.push(("snssqs".to_string(), sns.clone()));
        }
        if let Some(ps) = &self.pubsub {
            attrs.push(("pubsub".to_string(), ps.clone()));
        }
        attrs
    }
}
