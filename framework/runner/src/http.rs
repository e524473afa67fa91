use std::path::PathBuf;

use anyhow::Context;
use async_trait::async_trait;
use url::Url;

/// A fully substituted HTTP request, ready to execute. Script fields have
/// already been resolved by the executor before this is built.
#[derive(Debug, Clone)]
pub struct HttpRequestSpec {
    pub method: String,
    pub url: Url,
    pub headers: Vec<(String, String)>,
    pub query: Vec<(String, String)>,
    /// Multipart file parts, field name to file path.
    pub files: Vec<(String, PathBuf)>,
    /// Multipart form fields.
    pub forms: Vec<(String, String)>,
    pub payload: Option<Vec<u8>>,
}

impl HttpRequestSpec {
    pub fn new(method: &str, url: Url) -> Self {
        Self {
            method: method.to_string(),
            url,
            headers: Vec::new(),
            query: Vec::new(),
            files: Vec::new(),
            forms: Vec::new(),
            payload: None,
        }
    }

    fn is_multipart(&self) -> bool {
        !self.files.is_empty() || !self.forms.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).to_string()
    }
}

/// Seam between the executor and the HTTP stack, so scenario execution can be
/// tested without a live endpoint.
#[async_trait]
pub trait HttpClient: Send + Sync {
    async fn execute(&self, spec: HttpRequestSpec) -> anyhow::Result<HttpResponse>;
}

/// The production client.
#[derive(Debug, Default, Clone)]
pub struct ReqwestClient {
    client: reqwest::Client,
}

impl ReqwestClient {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl HttpClient for ReqwestClient {
    async fn execute(&self, spec: HttpRequestSpec) -> anyhow::Result<HttpResponse> {
        let method = reqwest::Method::from_bytes(spec.method.to_uppercase().as_bytes())
            .with_context(|| format!("Invalid HTTP method {:?}", spec.method))?;

        let mut request = self.client.request(method, spec.url.clone());

        for (name, value) in &spec.headers {
            request = request.header(name, value);
        }
        if !spec.query.is_empty() {
            request = request.query(&spec.query);
        }

        if spec.is_multipart() {
            let mut form = reqwest::multipart::Form::new();
            for (name, value) in &spec.forms {
                form = form.text(name.clone(), value.clone());
            }
            for (name, path) in &spec.files {
                let bytes = tokio::fs::read(path)
                    .await
                    .with_context(|| format!("Failed to read upload file {}", path.display()))?;
                let file_name = path
                    .file_name()
                    .map(|n| n.to_string_lossy().to_string())
                    .unwrap_or_default();
                form = form.part(
                    name.clone(),
                    reqwest::multipart::Part::bytes(bytes).file_name(file_name),
                );
            }
            request = request.multipart(form);
        } else if let Some(payload) = spec.payload.clone() {
            request = request.body(payload);
        }

        let response = request
            .send()
            .await
            .with_context(|| format!("Request to {} failed", spec.url))?;

        let status = response.status().as_u16();
        let body = response
            .bytes()
            .await
            .with_context(|| format!("Failed to read response body from {}", spec.url))?
            .to_vec();

        Ok(HttpResponse { status, body })
    }
}

/// Validate `body` against a JSON schema reference: inline JSON, or a path to
/// a schema file. Returns the list of validation failures.
pub fn validate_json_schema(reference: &str, body: &[u8]) -> anyhow::Result<Vec<String>> {
    let schema: serde_json::Value = if reference.trim_start().starts_with(['{', '[']) {
        serde_json::from_str(reference).context("Failed to parse inline JSON schema")?
    } else {
        let raw = std::fs::read_to_string(reference)
            .with_context(|| format!("Failed to read JSON schema {reference}"))?;
        serde_json::from_str(&raw)
            .with_context(|| format!("Failed to parse JSON schema {reference}"))?
    };

    let compiled = jsonschema::JSONSchema::compile(&schema)
        .map_err(|e| anyhow::anyhow!("Invalid JSON schema: {e}"))?;

    let instance: serde_json::Value =
        serde_json::from_slice(body).context("Response body is not valid JSON")?;

    let failures = match compiled.validate(&instance) {
        Ok(()) => Vec::new(),
        Err(errors) => errors.map(|e| e.to_string()).collect(),
    };

    Ok(failures)
}
