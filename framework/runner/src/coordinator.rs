use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use gust_core::prelude::{CancelHandle, CancelListener, CancelRegistry, RegistrationGuard};
use serde_json::Value;
use tokio::sync::Mutex;

use crate::command::{Command, Metadata};
use crate::config::RunnerConfig;
use crate::executor::Executor;
use crate::loader::{AffectedServiceFilter, ScenarioLoader, TagFilter};
use crate::report::{Reporter, ScenarioReport};
use crate::tracker::{Remaining, RunTracker};
use crate::transport::{MessageChannel, MessageHandler};

/// Derive the stable logical cancellation key for a run from its metadata.
///
/// A PR number is preferred over a branch name, since a PR keeps its key
/// across retries that a branch push would also match.
pub fn cancellation_key(metadata: &Metadata) -> Option<String> {
    if let Some(Value::String(pr)) = metadata.get("pr_number") {
        if !pr.is_empty() {
            return Some(format!("pr_{pr}"));
        }
    }

    if let Some(Value::String(branch)) = metadata.get("branch") {
        if !branch.is_empty() {
            return Some(format!("branch_{branch}"));
        }
    }

    None
}

/// Interprets inbound commands for one worker process.
///
/// A single mutex serializes message handling: it guards the shared tracker
/// and cancellation state, not throughput. Each unit of work is independent
/// and the real concurrency lives across process replicas.
pub struct Coordinator {
    config: RunnerConfig,
    channel: Arc<dyn MessageChannel>,
    tracker: RunTracker,
    registry: CancelRegistry,
    executor: Executor,
    reporter: Reporter,
    serialize: Mutex<()>,
}

impl Coordinator {
    pub fn new(
        config: RunnerConfig,
        channel: Arc<dyn MessageChannel>,
        tracker: RunTracker,
        registry: CancelRegistry,
        executor: Executor,
        reporter: Reporter,
    ) -> Self {
        Self {
            config,
            channel,
            tracker,
            registry,
            executor,
            reporter,
            serialize: Mutex::new(()),
        }
    }

    pub fn registry(&self) -> &CancelRegistry {
        &self.registry
    }

    async fn handle_start(&self, id: String, tags: Vec<String>, metadata: Metadata) {
        let loader = ScenarioLoader::new(
            self.config.scenario_files.clone(),
            self.config.scenario_dir.clone(),
        );

        let mut requirements = self.config.tags.clone();
        requirements.extend(tags);
        let tag_filter = TagFilter::new(&requirements);
        let affected = AffectedServiceFilter::from_metadata(&metadata);

        let files = match loader.resolve(&tag_filter, &affected) {
            Ok(files) => files,
            Err(e) => {
                log::error!("Start command for run {id} resolved no scenarios: {e}");
                return;
            }
        };

        if let Err(e) = self.tracker.set(&id, files.len() as i64).await {
            log::warn!("Failed to initialize run tracker for {id}: {e:#}");
        }

        for file in &files {
            let command = Command::Process {
                id: id.clone(),
                scenario: file.to_string_lossy().to_string(),
                metadata: metadata.clone(),
            };

            let payload = match command.encode() {
                Ok(payload) => payload,
                Err(e) => {
                    log::warn!("Failed to encode process command for {}: {e}", file.display());
                    continue;
                }
            };

            // Best-effort fan-out: a failed publish is logged and skipped,
            // the rest of the batch still goes out.
            if let Err(e) = self
                .channel
                .publish(&self.config.command_subject, payload)
                .await
            {
                log::warn!("Publish failed for {}: {e:#}", file.display());
            }
        }

        self.reporter
            .notify_batch(
                &format!("run {id} started"),
                &format!("{} scenario(s) dispatched", files.len()),
            )
            .await;
    }

    async fn handle_process(&self, id: String, scenario: String, metadata: Metadata) {
        log::info!("process: run={id} scenario={scenario}");

        // The handle must outlive the execution so its listener keeps reading
        // a live channel; the guard deregisters on drop, covering every exit
        // path below.
        let (handle, _registration) = self.register_cancellation(&metadata);

        let report = self
            .execute_one(Path::new(&scenario), &id, &metadata, handle.new_listener())
            .await;
        self.reporter.notify(&report).await;

        match self.tracker.decrement(&id).await {
            Ok(Remaining::Count(0)) => {
                if let Err(e) = self.tracker.delete(&id).await {
                    log::warn!("Failed to delete tracker entry for {id}: {e:#}");
                }
                log::info!("run {id} complete");
                self.reporter
                    .notify_batch(&format!("run {id} complete"), "all scenarios processed")
                    .await;
            }
            Ok(Remaining::Count(remaining)) => {
                log::info!("run {id}: {remaining} scenario(s) remaining");
            }
            // Unknown is not zero: completion state cannot be decided here.
            Ok(Remaining::Unknown) => {
                log::info!("run {id}: remaining count unknown");
            }
            Err(e) => {
                log::warn!("Failed to decrement tracker for {id}: {e:#}");
            }
        }
    }

    async fn execute_one(
        &self,
        file: &Path,
        run_id: &str,
        metadata: &Metadata,
        cancel: CancelListener,
    ) -> ScenarioReport {
        let execution = self.executor.execute(file, cancel).await;

        ScenarioReport {
            scenario: file.to_string_lossy().to_string(),
            maintainers: execution.maintainers,
            outcome: execution.outcome,
            detail: execution.detail,
            run_id: run_id.to_string(),
            metadata: metadata.clone(),
        }
    }

    /// Create the cancellation handle for one execution, registered under the
    /// run's logical key when one can be derived from the metadata.
    fn register_cancellation(
        &self,
        metadata: &Metadata,
    ) -> (CancelHandle, Option<RegistrationGuard>) {
        let handle = CancelHandle::new();

        let guard = cancellation_key(metadata).map(|key| {
            log::info!("Registered execution for cancellation under {key}");
            self.registry.register(&key, handle.clone())
        });

        (handle, guard)
    }

    fn handle_cancel(&self, key: &str) {
        if self.registry.cancel(key) {
            log::info!("Cancelled in-flight run for {key}");
        } else {
            // Not an error: the run may have finished, or it belongs to a
            // different replica.
            log::info!("No in-flight run registered for {key}");
        }
    }

    /// Run a batch locally without the message channel: every resolved file
    /// is executed in this process, in order. Used by the CLI's one-shot
    /// mode.
    pub async fn run_local(
        &self,
        run_id: &str,
        metadata: Metadata,
        cancel: CancelListener,
    ) -> anyhow::Result<()> {
        let loader = ScenarioLoader::new(
            self.config.scenario_files.clone(),
            self.config.scenario_dir.clone(),
        );
        let tag_filter = TagFilter::new(&self.config.tags);
        let affected = AffectedServiceFilter::from_metadata(&metadata);
        let files = loader.resolve(&tag_filter, &affected)?;

        for file in files {
            // A cancelled listener makes the executor bail at its first
            // checkpoint, so every remaining file reports `cancelled`.
            let report = self
                .execute_one(&file, run_id, &metadata, cancel.clone())
                .await;
            self.reporter.notify(&report).await;
        }

        Ok(())
    }
}

#[async_trait]
impl MessageHandler for Coordinator {
    async fn handle(&self, payload: &[u8]) -> anyhow::Result<()> {
        // Malformed payloads are logged and dropped, never retried.
        let command = match Command::decode(payload) {
            Ok(command) => command,
            Err(e) => {
                log::warn!("Dropping malformed command payload: {e}");
                return Ok(());
            }
        };

        match command {
            // Cancellation bypasses the serialization mutex. The registry has
            // its own lock, and a cancel must be able to reach an execution
            // that is currently holding the mutex.
            Command::Cancel { key } => self.handle_cancel(&key),
            Command::Start { id, tags, metadata } => {
                let _serialized = self.serialize.lock().await;
                self.handle_start(id, tags, metadata).await;
            }
            Command::Process {
                id,
                scenario,
                metadata,
            } => {
                let _serialized = self.serialize.lock().await;
                self.handle_process(id, scenario, metadata).await;
            }
        }

        Ok(())
    }
}

/// Resolve the run id for a start command issued locally: the caller's id
/// when present, otherwise a fresh one.
pub fn resolve_run_id(id: &str) -> String {
    if id.is_empty() {
        nanoid::nanoid!(10)
    } else {
        id.to_string()
    }
}
