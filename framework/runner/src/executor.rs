use std::fmt::Display;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use gust_core::prelude::CancelListener;
use url::Url;

use crate::http::{validate_json_schema, HttpClient, HttpRequestSpec};
use crate::report::Outcome;
use crate::scenario::{HttpStep, ScenarioSpec};
use crate::script;

/// Ordered, per-scenario error collection.
///
/// Passed explicitly into the executor as its logging/recording capability.
/// Every error is wrapped with step and field context and appended; the list
/// itself, not early abort, is the unit of failure reporting. Lists are never
/// merged across scenarios.
#[derive(Debug, Default)]
pub struct ErrorLog {
    errors: Vec<String>,
}

impl ErrorLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, context: impl Display, err: impl Display) {
        let entry = format!("{context}: {err}");
        log::warn!("{entry}");
        self.errors.push(entry);
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn entries(&self) -> &[String] {
        &self.errors
    }

    pub fn into_detail(self) -> String {
        self.errors.join("\n")
    }
}

/// What one scenario execution produced.
#[derive(Debug)]
pub struct ExecutionReport {
    pub outcome: Outcome,
    pub maintainers: Vec<String>,
    /// The accumulated error list as free text, one entry per line.
    pub detail: String,
}

/// Runs one scenario file through its prepare/run/check state machine.
///
/// Cancellation is cooperative: the listener is polled before prepare, before
/// each run step and before the check. Once observed, remaining work is
/// skipped and the scenario reports `cancelled` regardless of how far it got.
/// No failure inside a scenario ever aborts the batch; everything is
/// collected into the error log and folded into the outcome.
pub struct Executor {
    http: Arc<dyn HttpClient>,
}

impl Executor {
    pub fn new(http: Arc<dyn HttpClient>) -> Self {
        Self { http }
    }

    pub async fn execute(&self, file: &Path, mut cancel: CancelListener) -> ExecutionReport {
        let mut errors = ErrorLog::new();

        let spec = match ScenarioSpec::load(file) {
            Ok(spec) => spec,
            Err(e) => {
                errors.record(format_args!("scenario {}", file.display()), format!("{e:#}"));
                return ExecutionReport {
                    outcome: Outcome::Error,
                    maintainers: Vec::new(),
                    detail: errors.into_detail(),
                };
            }
        };

        log::info!("scenario: {}", file.display());
        let cancelled = self
            .run_state_machine(file, &spec, &mut errors, &mut cancel)
            .await;

        let outcome = if cancelled {
            Outcome::Cancelled
        } else if errors.is_empty() {
            Outcome::Success
        } else {
            Outcome::Error
        };

        ExecutionReport {
            outcome,
            maintainers: spec.maintainers.clone(),
            detail: errors.into_detail(),
        }
    }

    /// Returns whether cancellation was observed.
    async fn run_state_machine(
        &self,
        file: &Path,
        spec: &ScenarioSpec,
        errors: &mut ErrorLog,
        cancel: &mut CancelListener,
    ) -> bool {
        let workdir = match tempfile::tempdir() {
            Ok(dir) => dir,
            Err(e) => {
                errors.record("workdir", e);
                return false;
            }
        };
        let stem = file
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "scenario".to_string());

        if cancel.is_cancelled() {
            log::info!("Execution cancelled before prepare: {}", file.display());
            return true;
        }

        if let Some(prepare) = &spec.prepare {
            self.run_hook_script(
                "prepare",
                prepare,
                workdir.path().join(format!("{stem}_prepare")),
                spec,
                errors,
            )
            .await;
        }

        for (index, step) in spec.run.iter().enumerate() {
            if cancel.is_cancelled() {
                log::info!(
                    "Execution cancelled before run step {index}: {}",
                    file.display()
                );
                return true;
            }

            let prefix = workdir.path().join(format!("{stem}_run{index}"));
            self.run_step(index, &step.http, &prefix, spec, errors).await;
        }

        if cancel.is_cancelled() {
            log::info!("Execution cancelled before check: {}", file.display());
            return true;
        }

        if let Some(check) = &spec.check {
            self.run_hook_script(
                "check",
                check,
                workdir.path().join(format!("{stem}_check")),
                spec,
                errors,
            )
            .await;
        }

        false
    }

    /// Run a prepare/check hook script. Failures are recorded, never fatal.
    async fn run_hook_script(
        &self,
        name: &str,
        contents: &str,
        path: PathBuf,
        spec: &ScenarioSpec,
        errors: &mut ErrorLog,
    ) {
        if let Err(e) = script::materialize(&path, contents) {
            errors.record(name, format!("{e:#}"));
            return;
        }

        match script::run_capture(&path, &spec.env).await {
            Ok(output) => {
                if !output.is_empty() {
                    log::info!("{name}:\n{output}");
                }
            }
            Err(e) => errors.record(name, format!("{e:#}")),
        }
    }

    /// Execute one run step. Any failure aborts only this step.
    async fn run_step(
        &self,
        index: usize,
        step: &HttpStep,
        prefix: &Path,
        spec: &ScenarioSpec,
        errors: &mut ErrorLog,
    ) {
        let url = match self
            .parse_field(&step.url, prefix, "url", spec, index, errors)
            .await
        {
            Some(url) => url,
            None => return,
        };

        let url = match Url::parse(&url) {
            Ok(url) => url,
            Err(e) => {
                errors.record(format_args!("url.parse[{index}]"), e);
                return;
            }
        };

        let mut request = HttpRequestSpec::new(&step.method, url);

        for (name, value) in &step.headers {
            let field = format!("hdr.{name}");
            if let Some(value) = self
                .parse_field(value, prefix, &field, spec, index, errors)
                .await
            {
                log::info!("[header] {name}: {value}");
                request.headers.push((name.clone(), value));
            }
        }

        for (name, value) in &step.query_params {
            let field = format!("qparams.{name}");
            if let Some(value) = self
                .parse_field(value, prefix, &field, spec, index, errors)
                .await
            {
                request.query.push((name.clone(), value));
            }
        }

        for (name, value) in &step.files {
            let field = format!("files.{name}");
            if let Some(value) = self
                .parse_field(value, prefix, &field, spec, index, errors)
                .await
            {
                request.files.push((name.clone(), PathBuf::from(value)));
            }
        }

        for (name, value) in &step.forms {
            let field = format!("forms.{name}");
            if let Some(value) = self
                .parse_field(value, prefix, &field, spec, index, errors)
                .await
            {
                request.forms.push((name.clone(), value));
            }
        }

        if let Some(payload) = &step.payload {
            if let Some(value) = self
                .parse_field(payload, prefix, "payload", spec, index, errors)
                .await
            {
                request.payload = Some(value.into_bytes());
            }
        }

        let response = match self.http.execute(request).await {
            Ok(response) => response,
            Err(e) => {
                errors.record(format_args!("request[{index}]"), format!("{e:#}"));
                return;
            }
        };

        if let Some(out) = &step.response_out {
            let body = response.body_text();
            log::info!("[response] {body}");
            if let Err(e) = std::fs::write(out, &response.body) {
                errors.record(format_args!("response_out[{index}]"), e);
            }
        }

        let Some(asserts) = &step.asserts else {
            return;
        };

        if response.status != asserts.status_code {
            errors.record(
                format_args!("asserts.status_code[{index}]"),
                format_args!("expected {}, got {}", asserts.status_code, response.status),
            );
        }

        if let Some(schema) = &asserts.validate_json {
            match validate_json_schema(schema, &response.body) {
                Ok(failures) => {
                    for failure in failures {
                        errors.record(format_args!("asserts.validate_json[{index}]"), failure);
                    }
                }
                Err(e) => {
                    errors.record(format_args!("asserts.validate_json[{index}]"), format!("{e:#}"))
                }
            }
        }

        if let Some(assert_script) = &asserts.script {
            let path = prefix_path(prefix, "assertscript");
            if let Err(e) = script::materialize(&path, assert_script) {
                errors.record(format_args!("asserts.script[{index}]"), format!("{e:#}"));
                return;
            }
            match script::run_capture(&path, &spec.env).await {
                Ok(output) => {
                    if !output.is_empty() {
                        log::info!("asserts.script[{index}]:\n{output}");
                    }
                }
                Err(e) => errors.record(format_args!("asserts.script[{index}]"), format!("{e:#}")),
            }
        }
    }

    /// Resolve one field value, materializing and running it when it is in
    /// script form. `None` means the failure was recorded and the field (or
    /// step, for the URL) should be skipped.
    async fn parse_field(
        &self,
        contents: &str,
        prefix: &Path,
        field: &str,
        spec: &ScenarioSpec,
        index: usize,
        errors: &mut ErrorLog,
    ) -> Option<String> {
        match script::parse_value(contents, prefix_path(prefix, field), &spec.env).await {
            Ok(value) => Some(value),
            Err(e) => {
                errors.record(format_args!("parse_value[{index}].{field}"), format!("{e:#}"));
                None
            }
        }
    }
}

/// Collision-free materialization path for one field of one step: the prefix
/// already carries the scenario file name and step index.
fn prefix_path(prefix: &Path, field: &str) -> PathBuf {
    let mut name = prefix
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    name.push('_');
    name.push_str(field);
    prefix.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::HttpResponse;
    use async_trait::async_trait;
    use gust_core::prelude::CancelHandle;
    use parking_lot::Mutex;
    use pretty_assertions::assert_eq;

    struct StubHttp {
        status: u16,
        body: Vec<u8>,
        requests: Mutex<Vec<HttpRequestSpec>>,
    }

    impl StubHttp {
        fn returning(status: u16) -> Self {
            Self {
                status,
                body: b"{}".to_vec(),
                requests: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl HttpClient for StubHttp {
        async fn execute(&self, spec: HttpRequestSpec) -> anyhow::Result<HttpResponse> {
            self.requests.lock().push(spec);
            Ok(HttpResponse {
                status: self.status,
                body: self.body.clone(),
            })
        }
    }

    fn write_scenario(contents: &str) -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scenario.yaml");
        std::fs::write(&path, contents).unwrap();
        (dir, path)
    }

    fn listener() -> CancelListener {
        CancelHandle::new().new_listener()
    }

    #[tokio::test]
    async fn status_mismatch_yields_exactly_one_error() {
        let (_dir, path) = write_scenario(
            r#"
run:
  - http:
      method: GET
      url: http://x/y
      asserts:
        status_code: 200
"#,
        );

        let http = Arc::new(StubHttp::returning(404));
        let report = Executor::new(http.clone()).execute(&path, listener()).await;

        assert_eq!(report.outcome, Outcome::Error);
        let lines = report.detail.lines().collect::<Vec<_>>();
        assert_eq!(lines.len(), 1);
        assert!(lines[0].contains("expected 200, got 404"), "{}", lines[0]);
    }

    #[tokio::test]
    async fn matching_assertions_succeed() {
        let (_dir, path) = write_scenario(
            r#"
maintainers:
  - alice
run:
  - http:
      method: GET
      url: http://x/y
      asserts:
        status_code: 200
        validate_json: '{"type": "object"}'
"#,
        );

        let report = Executor::new(Arc::new(StubHttp::returning(200)))
            .execute(&path, listener())
            .await;

        assert_eq!(report.outcome, Outcome::Success);
        assert_eq!(report.maintainers, vec!["alice".to_string()]);
        assert_eq!(report.detail, "");
    }

    #[tokio::test]
    async fn header_scripts_are_substituted_before_the_request() {
        let (_dir, path) = write_scenario(
            "run:\n  - http:\n      method: GET\n      url: http://x/y\n      headers:\n        x-token: \"#!/bin/sh\\necho hello\"\n",
        );

        let http = Arc::new(StubHttp::returning(200));
        let report = Executor::new(http.clone()).execute(&path, listener()).await;

        assert_eq!(report.outcome, Outcome::Success);
        let requests = http.requests.lock();
        assert_eq!(requests.len(), 1);
        assert_eq!(
            requests[0].headers,
            vec![("x-token".to_string(), "hello".to_string())]
        );
    }

    #[tokio::test]
    async fn cancelled_before_start_reports_cancelled_without_requests() {
        let (_dir, path) = write_scenario(
            r#"
run:
  - http:
      method: GET
      url: http://x/y
      asserts:
        status_code: 200
"#,
        );

        let handle = CancelHandle::new();
        let cancel = handle.new_listener();
        handle.cancel();

        let http = Arc::new(StubHttp::returning(200));
        let report = Executor::new(http.clone()).execute(&path, cancel).await;

        assert_eq!(report.outcome, Outcome::Cancelled);
        assert!(http.requests.lock().is_empty());
    }

    #[tokio::test]
    async fn listener_without_a_live_handle_does_not_cancel() {
        let (_dir, path) = write_scenario(
            r#"
run:
  - http:
      method: GET
      url: http://x/y
      asserts:
        status_code: 200
"#,
        );

        // listener() drops its handle immediately; that must read as "can
        // never be cancelled", not as a cancellation.
        let http = Arc::new(StubHttp::returning(200));
        let report = Executor::new(http.clone()).execute(&path, listener()).await;

        assert_eq!(report.outcome, Outcome::Success);
        assert_eq!(http.requests.lock().len(), 1);
    }

    #[tokio::test]
    async fn cancel_covers_every_file_in_a_batch() {
        let (_dir, first) = write_scenario(
            r#"
run:
  - http:
      method: GET
      url: http://x/y
      asserts:
        status_code: 200
"#,
        );
        let (_dir2, second) = write_scenario(
            r#"
run:
  - http:
      method: GET
      url: http://x/z
      asserts:
        status_code: 200
"#,
        );

        let handle = CancelHandle::new();
        let cancel = handle.new_listener();
        handle.cancel();

        let http = Arc::new(StubHttp::returning(200));
        let executor = Executor::new(http.clone());

        // A local batch shares the listener by clone; cancellation must stick
        // for every remaining file, not just the one that consumes the
        // signal.
        let first = executor.execute(&first, cancel.clone()).await;
        let second = executor.execute(&second, cancel.clone()).await;

        assert_eq!(first.outcome, Outcome::Cancelled);
        assert_eq!(second.outcome, Outcome::Cancelled);
        assert!(http.requests.lock().is_empty());
    }

    #[tokio::test]
    async fn prepare_failure_does_not_stop_the_steps() {
        let (_dir, path) = write_scenario(
            "prepare: \"#!/bin/sh\\nexit 1\"\nrun:\n  - http:\n      method: GET\n      url: http://x/y\n      asserts:\n        status_code: 200\n",
        );

        let http = Arc::new(StubHttp::returning(200));
        let report = Executor::new(http.clone()).execute(&path, listener()).await;

        // The step itself passed but the prepare failure is on the record.
        assert_eq!(report.outcome, Outcome::Error);
        assert_eq!(http.requests.lock().len(), 1);
        assert!(report.detail.starts_with("prepare:"));
    }

    #[tokio::test]
    async fn check_runs_even_after_step_errors() {
        let marker = tempfile::tempdir().unwrap();
        let marker_file = marker.path().join("check_ran");
        let (_dir, path) = write_scenario(&format!(
            "run:\n  - http:\n      method: GET\n      url: http://x/y\n      asserts:\n        status_code: 200\ncheck: \"#!/bin/sh\\ntouch {}\"\n",
            marker_file.display()
        ));

        let report = Executor::new(Arc::new(StubHttp::returning(500)))
            .execute(&path, listener())
            .await;

        assert_eq!(report.outcome, Outcome::Error);
        assert!(marker_file.exists());
    }

    #[tokio::test]
    async fn invalid_url_aborts_only_that_step() {
        let (_dir, path) = write_scenario(
            r#"
run:
  - http:
      method: GET
      url: "::not a url::"
  - http:
      method: GET
      url: http://x/y
      asserts:
        status_code: 200
"#,
        );

        let http = Arc::new(StubHttp::returning(200));
        let report = Executor::new(http.clone()).execute(&path, listener()).await;

        assert_eq!(report.outcome, Outcome::Error);
        // The second step still ran.
        assert_eq!(http.requests.lock().len(), 1);
        assert!(report.detail.contains("url.parse[0]"));
    }

    #[tokio::test]
    async fn unparsable_scenario_reports_error() {
        let (_dir, path) = write_scenario("run: [this is: not, valid yaml");

        let report = Executor::new(Arc::new(StubHttp::returning(200)))
            .execute(&path, listener())
            .await;

        assert_eq!(report.outcome, Outcome::Error);
        assert!(!report.detail.is_empty());
    }
}
