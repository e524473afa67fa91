use std::collections::BTreeMap;
use std::path::Path;

use anyhow::Context;
use serde::Deserialize;

/// One declared scenario file: optional setup and teardown scripts around an
/// ordered list of HTTP-driven steps.
///
/// Parsed fresh for every invocation and immutable once parsed.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct ScenarioSpec {
    #[serde(default)]
    pub maintainers: Vec<String>,

    /// Declared tags, matched against the `key=value` requirements of a
    /// start command.
    #[serde(default)]
    pub tags: BTreeMap<String, String>,

    /// Environment overrides applied to every script this scenario runs, on
    /// top of the ambient process environment.
    #[serde(default)]
    pub env: BTreeMap<String, String>,

    /// Setup script, run once before the steps.
    #[serde(default)]
    pub prepare: Option<String>,

    #[serde(default)]
    pub run: Vec<RunStep>,

    /// Teardown script, run once after all steps regardless of prior errors.
    #[serde(default)]
    pub check: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RunStep {
    pub http: HttpStep,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct HttpStep {
    pub method: String,
    pub url: String,

    #[serde(default)]
    pub headers: BTreeMap<String, String>,

    #[serde(default)]
    pub query_params: BTreeMap<String, String>,

    /// Multipart file fields, name to path.
    #[serde(default)]
    pub files: BTreeMap<String, String>,

    /// Multipart form fields.
    #[serde(default)]
    pub forms: BTreeMap<String, String>,

    #[serde(default)]
    pub payload: Option<String>,

    /// Path the response body is written to, when set.
    #[serde(default)]
    pub response_out: Option<String>,

    #[serde(default)]
    pub asserts: Option<Asserts>,
}

/// Acceptance criteria for one step.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Asserts {
    pub status_code: u16,

    /// JSON schema the response body must validate against. Either inline
    /// JSON or a path to a schema file.
    #[serde(default)]
    pub validate_json: Option<String>,

    /// Assert script; a non-zero exit records an error.
    #[serde(default)]
    pub script: Option<String>,
}

impl ScenarioSpec {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read scenario file {}", path.display()))?;
        serde_yaml::from_str(&raw)
            .with_context(|| format!("Failed to parse scenario file {}", path.display()))
    }

    /// Parse only the tags of a scenario file, for filtering without a full
    /// validation pass.
    pub fn load_tags(path: &Path) -> anyhow::Result<BTreeMap<String, String>> {
        #[derive(Deserialize)]
        struct TagsOnly {
            #[serde(default)]
            tags: BTreeMap<String, String>,
        }

        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read scenario file {}", path.display()))?;
        let parsed: TagsOnly = serde_yaml::from_str(&raw)
            .with_context(|| format!("Failed to parse scenario file {}", path.display()))?;
        Ok(parsed.tags)
    }
}
