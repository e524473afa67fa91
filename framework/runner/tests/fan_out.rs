use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use gust_core::prelude::{CancelHandle, CancelRegistry};
use gust_runner::prelude::*;
use parking_lot::Mutex;

struct StubHttp {
    status: u16,
}

#[async_trait]
impl HttpClient for StubHttp {
    async fn execute(&self, _spec: HttpRequestSpec) -> anyhow::Result<HttpResponse> {
        Ok(HttpResponse {
            status: self.status,
            body: b"{}".to_vec(),
        })
    }
}

struct NoopWebhook;

#[async_trait]
impl Webhook for NoopWebhook {
    async fn post(&self, _url: &str, _payload: serde_json::Value) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Stops the subscriber once `expected` messages have been handled by the
/// wrapped coordinator.
struct CountingHandler {
    inner: Arc<Coordinator>,
    handled: Mutex<usize>,
    expected: usize,
    stop: CancelHandle,
}

#[async_trait]
impl MessageHandler for CountingHandler {
    async fn handle(&self, payload: &[u8]) -> anyhow::Result<()> {
        let result = self.inner.handle(payload).await;

        let mut handled = self.handled.lock();
        *handled += 1;
        if *handled >= self.expected {
            self.stop.cancel();
        }

        result
    }
}

struct CaptureHandler {
    seen: Mutex<Vec<serde_json::Value>>,
    expected: usize,
    stop: CancelHandle,
}

#[async_trait]
impl MessageHandler for CaptureHandler {
    async fn handle(&self, payload: &[u8]) -> anyhow::Result<()> {
        let mut seen = self.seen.lock();
        seen.push(serde_json::from_slice(payload)?);
        if seen.len() >= self.expected {
            self.stop.cancel();
        }
        Ok(())
    }
}

fn write_scenario(root: &Path, relative: &str) {
    let path = root.join(relative);
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(
        &path,
        "run:\n  - http:\n      method: GET\n      url: http://x/y\n      asserts:\n        status_code: 200\n",
    )
    .unwrap();
}

fn coordinator(
    config: RunnerConfig,
    channel: Arc<LocalChannel>,
    status: u16,
) -> Arc<Coordinator> {
    let reporter = Reporter::new(config.clone(), Arc::new(NoopWebhook), channel.clone());
    Arc::new(Coordinator::new(
        config,
        channel,
        RunTracker::new(Arc::new(MemoryCounterStore::new())),
        CancelRegistry::new(),
        Executor::new(Arc::new(StubHttp { status })),
        reporter,
    ))
}

#[tokio::test]
async fn start_fans_out_and_reports_every_scenario() {
    let dir = tempfile::tempdir().unwrap();
    write_scenario(dir.path(), "services/foo/scenarios/a.yaml");
    write_scenario(dir.path(), "cmd/bar/scenarios/b.yaml");

    let config = RunnerConfig {
        scenario_dir: Some(dir.path().to_path_buf()),
        command_subject: "commands".to_string(),
        report_subject: Some("reports".to_string()),
        ..Default::default()
    };

    let channel = Arc::new(LocalChannel::new());
    let coordinator = coordinator(config, channel.clone(), 200);

    channel
        .publish(
            "commands",
            br#"{"code": "start", "id": "run-1"}"#.to_vec(),
        )
        .await
        .unwrap();

    // One start command plus the two process commands it fans out.
    let stop = CancelHandle::new();
    let handler = Arc::new(CountingHandler {
        inner: coordinator,
        handled: Mutex::new(0),
        expected: 3,
        stop: stop.clone(),
    });
    channel
        .subscribe("commands", handler, stop.new_listener())
        .await
        .unwrap();

    // Both outcome reports were published, correlated to the start's run id.
    let stop = CancelHandle::new();
    let reports = Arc::new(CaptureHandler {
        seen: Mutex::new(Vec::new()),
        expected: 2,
        stop: stop.clone(),
    });
    channel
        .subscribe("reports", reports.clone(), stop.new_listener())
        .await
        .unwrap();

    let seen = reports.seen.lock();
    assert_eq!(seen.len(), 2);
    for report in seen.iter() {
        assert_eq!(report["status"], "success");
        assert_eq!(report["run_id"], "run-1");
        assert_eq!(report["message_id"].as_str().unwrap().len(), 10);
    }

    let mut scenarios = seen
        .iter()
        .map(|r| r["scenario"].as_str().unwrap().to_string())
        .collect::<Vec<_>>();
    scenarios.sort();
    assert!(scenarios[0].ends_with("cmd/bar/scenarios/b.yaml"));
    assert!(scenarios[1].ends_with("services/foo/scenarios/a.yaml"));
}

#[tokio::test]
async fn failing_scenarios_report_error_status() {
    let dir = tempfile::tempdir().unwrap();
    write_scenario(dir.path(), "services/foo/scenarios/a.yaml");

    let config = RunnerConfig {
        scenario_dir: Some(dir.path().to_path_buf()),
        command_subject: "commands".to_string(),
        report_subject: Some("reports".to_string()),
        ..Default::default()
    };

    let channel = Arc::new(LocalChannel::new());
    let coordinator = coordinator(config, channel.clone(), 404);

    channel
        .publish(
            "commands",
            br#"{"code": "start", "id": "run-2"}"#.to_vec(),
        )
        .await
        .unwrap();

    let stop = CancelHandle::new();
    let handler = Arc::new(CountingHandler {
        inner: coordinator,
        handled: Mutex::new(0),
        expected: 2,
        stop: stop.clone(),
    });
    channel
        .subscribe("commands", handler, stop.new_listener())
        .await
        .unwrap();

    let stop = CancelHandle::new();
    let reports = Arc::new(CaptureHandler {
        seen: Mutex::new(Vec::new()),
        expected: 1,
        stop: stop.clone(),
    });
    channel
        .subscribe("reports", reports.clone(), stop.new_listener())
        .await
        .unwrap();

    let seen = reports.seen.lock();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0]["status"], "error");
    assert!(seen[0]["data"]
        .as_str()
        .unwrap()
        .contains("expected 200, got 404"));
}

#[tokio::test]
async fn malformed_payloads_are_dropped_not_fatal() {
    let dir = tempfile::tempdir().unwrap();
    write_scenario(dir.path(), "services/foo/scenarios/a.yaml");

    let config = RunnerConfig {
        scenario_dir: Some(dir.path().to_path_buf()),
        command_subject: "commands".to_string(),
        report_subject: Some("reports".to_string()),
        ..Default::default()
    };

    let channel = Arc::new(LocalChannel::new());
    let coordinator = coordinator(config, channel.clone(), 200);

    channel
        .publish("commands", b"not json at all".to_vec())
        .await
        .unwrap();
    channel
        .publish(
            "commands",
            br#"{"code": "start", "id": "run-3"}"#.to_vec(),
        )
        .await
        .unwrap();

    // Garbage + start + one fanned-out process.
    let stop = CancelHandle::new();
    let handler = Arc::new(CountingHandler {
        inner: coordinator,
        handled: Mutex::new(0),
        expected: 3,
        stop: stop.clone(),
    });
    channel
        .subscribe("commands", handler, stop.new_listener())
        .await
        .unwrap();

    let stop = CancelHandle::new();
    let reports = Arc::new(CaptureHandler {
        seen: Mutex::new(Vec::new()),
        expected: 1,
        stop: stop.clone(),
    });
    channel
        .subscribe("reports", reports.clone(), stop.new_listener())
        .await
        .unwrap();

    assert_eq!(reports.seen.lock().len(), 1);
}

#[tokio::test]
async fn cancel_command_for_unknown_key_is_handled() {
    let config = RunnerConfig {
        command_subject: "commands".to_string(),
        ..Default::default()
    };
    let channel = Arc::new(LocalChannel::new());
    let coordinator = coordinator(config, channel.clone(), 200);

    // No registration exists for this key; the command is still handled.
    coordinator
        .handle(br#"{"code": "cancel", "key": "pr_404"}"#)
        .await
        .unwrap();
}

#[tokio::test]
async fn cancel_reaches_an_in_flight_execution() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("slow.yaml");
    // The prepare script gives the cancel time to land; the checkpoint before
    // the first step must then observe it, even though the step would pass.
    std::fs::write(
        &path,
        "prepare: \"#!/bin/sh\\nsleep 1\"\nrun:\n  - http:\n      method: GET\n      url: http://x/y\n      asserts:\n        status_code: 200\n",
    )
    .unwrap();

    let config = RunnerConfig {
        command_subject: "commands".to_string(),
        report_subject: Some("reports".to_string()),
        ..Default::default()
    };
    let channel = Arc::new(LocalChannel::new());
    let coordinator = coordinator(config, channel.clone(), 200);

    let process = format!(
        r#"{{"code": "process", "id": "run-4", "scenario": "{}", "metadata": {{"pr_number": "7"}}}}"#,
        path.display()
    );

    let executing = coordinator.clone();
    let execution = tokio::spawn(async move { executing.handle(process.as_bytes()).await });

    // Wait for the execution to register itself, then cancel its key.
    let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
    while !coordinator.registry().is_registered("pr_7") {
        assert!(std::time::Instant::now() < deadline, "never registered");
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    coordinator
        .handle(br#"{"code": "cancel", "key": "pr_7"}"#)
        .await
        .unwrap();

    execution.await.unwrap().unwrap();

    let stop = CancelHandle::new();
    let reports = Arc::new(CaptureHandler {
        seen: Mutex::new(Vec::new()),
        expected: 1,
        stop: stop.clone(),
    });
    channel
        .subscribe("reports", reports.clone(), stop.new_listener())
        .await
        .unwrap();

    let seen = reports.seen.lock();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0]["status"], "cancelled");

    // Deregistration happened on the way out.
    assert!(!coordinator.registry().is_registered("pr_7"));
}
