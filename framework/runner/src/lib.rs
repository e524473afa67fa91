mod cli;
mod command;
mod config;
mod coordinator;
mod executor;
mod http;
mod loader;
mod report;
mod scenario;
mod script;
mod tracker;
mod transport;

pub mod prelude {
    pub use crate::cli::GustCli;
    pub use crate::command::{Command, Metadata};
    pub use crate::config::{ConfigError, RunnerConfig};
    pub use crate::coordinator::{cancellation_key, resolve_run_id, Coordinator};
    pub use crate::executor::{ErrorLog, ExecutionReport, Executor};
    pub use crate::http::{HttpClient, HttpRequestSpec, HttpResponse, ReqwestClient};
    pub use crate::loader::{AffectedServiceFilter, ScenarioLoader, TagFilter};
    pub use crate::report::{Outcome, Reporter, ReqwestWebhook, ScenarioReport, Webhook};
    pub use crate::scenario::{Asserts, HttpStep, RunStep, ScenarioSpec};
    pub use crate::tracker::{CounterStore, MemoryCounterStore, Remaining, RunTracker};
    pub use crate::transport::{LocalChannel, MessageChannel, MessageHandler};
}
