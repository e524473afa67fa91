use std::sync::Arc;

use clap::Parser;
use gust_core::prelude::{CancelHandle, CancelRegistry};
use gust_runner::prelude::*;

/// One-shot local mode: resolve the scenario set and execute it in this
/// process. Distributed workers are wired up by their deployment with a real
/// message channel; this binary covers running a batch from a shell or CI.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();

    let cli = GustCli::parse();
    let run_id = resolve_run_id(cli.run_id.clone().unwrap_or_default().as_str());
    let config = cli.into_config();
    config.validate()?;

    let channel = Arc::new(LocalChannel::new());
    let tracker = RunTracker::select(None).await;
    let executor = Executor::new(Arc::new(ReqwestClient::new()));
    let reporter = Reporter::new(config.clone(), Arc::new(ReqwestWebhook::new()), channel.clone());

    let coordinator = Coordinator::new(
        config,
        channel,
        tracker,
        CancelRegistry::new(),
        executor,
        reporter,
    );

    // Ctrl-C cancels the batch cooperatively: in-flight scenarios finish as
    // `cancelled` at their next checkpoint.
    let cancel = CancelHandle::new();
    let listener = cancel.new_listener();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::info!("Received interrupt, cancelling batch");
            cancel.cancel();
        }
    });

    log::info!("Starting run {run_id}");
    coordinator
        .run_local(&run_id, serde_json::Map::new(), listener)
        .await
}
