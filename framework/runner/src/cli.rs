use std::path::PathBuf;

use clap::Parser;

use crate::config::RunnerConfig;

/// Run declarative test scenarios against live services.
#[derive(Parser, Debug)]
#[command(name = "gust", about, long_about = None)]
pub struct GustCli {
    /// Scenario file(s) to run. Repeat the flag for multiple files.
    #[clap(short, long)]
    pub scenarios: Vec<PathBuf>,

    /// Root directory to discover scenario files under.
    #[clap(short, long)]
    pub dir: Option<PathBuf>,

    /// Tag requirement in `key=value` form. Repeat for multiple requirements;
    /// all of them must match.
    #[clap(short, long)]
    pub tags: Vec<String>,

    /// Slack webhook URL for outcome notifications.
    #[clap(long)]
    pub slack_url: Option<String>,

    /// Run id to report under. Generated when not provided.
    #[clap(long)]
    pub run_id: Option<String>,
}

impl GustCli {
    pub fn into_config(self) -> RunnerConfig {
        RunnerConfig {
            scenario_files: self.scenarios,
            scenario_dir: self.dir,
            tags: self.tags,
            slack_webhook: self.slack_url,
            command_subject: "gust-commands".to_string(),
            report_subject: None,
            sns_sqs: None,
            pubsub: None,
        }
    }
}
