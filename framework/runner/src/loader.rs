use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use serde_json::Value;
use walkdir::WalkDir;

use crate::command::Metadata;
use crate::config::ConfigError;
use crate::scenario::ScenarioSpec;

/// Categories whose `<category>/<component>/scenarios/` subdirectories are
/// searched for scenario files during discovery.
const SCENARIO_CATEGORIES: &[&str] = &[
    "services",
    "cloudrun",
    "cronjobs",
    "serverless",
    "microapps",
    "cmd",
    "pkg",
];

/// Resolves the scenario file set for a run: explicit files plus discovery
/// under a root directory, deduplicated, then pruned by the tag and
/// affected-service filters.
#[derive(Debug, Clone, Default)]
pub struct ScenarioLoader {
    files: Vec<PathBuf>,
    dir: Option<PathBuf>,
}

impl ScenarioLoader {
    pub fn new(files: Vec<PathBuf>, dir: Option<PathBuf>) -> Self {
        Self { files, dir }
    }

    /// Produce the deduplicated, absolute-path scenario set.
    ///
    /// Non-existent explicit files are dropped with a warning. An empty final
    /// set is a configuration error, not an empty run.
    pub fn resolve(
        &self,
        tag_filter: &TagFilter,
        affected: &AffectedServiceFilter,
    ) -> Result<Vec<PathBuf>, ConfigError> {
        let mut set = BTreeSet::new();

        for file in &self.files {
            if !file.is_file() {
                log::warn!("Scenario file {} does not exist, skipping", file.display());
                continue;
            }
            set.insert(absolutize(file));
        }

        if let Some(dir) = &self.dir {
            for path in discover(dir) {
                set.insert(path);
            }
        }

        let resolved = set
            .into_iter()
            .filter(|path| affected.keeps(path))
            .filter(|path| tag_filter.keeps(path))
            .collect::<Vec<_>>();

        if resolved.is_empty() {
            return Err(ConfigError::EmptyScenarioSet);
        }

        log::info!("Resolved {} scenario file(s)", resolved.len());
        Ok(resolved)
    }
}

/// Walk `dir` and collect scenario files under the fixed category patterns,
/// i.e. paths of the shape `<category>/<component>/scenarios/<file>.yaml`.
fn discover(dir: &Path) -> Vec<PathBuf> {
    let mut found = Vec::new();

    for entry in WalkDir::new(dir).into_iter().filter_map(|e| e.ok()) {
        if !entry.file_type().is_file() {
            continue;
        }

        let path = entry.path();
        let is_yaml = path
            .extension()
            .is_some_and(|ext| ext == "yaml" || ext == "yml");
        if !is_yaml {
            continue;
        }

        let Ok(relative) = path.strip_prefix(dir) else {
            continue;
        };
        let components = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy().to_string())
            .collect::<Vec<_>>();

        // <category>/<component>/scenarios/<file>
        if components.len() == 4
            && SCENARIO_CATEGORIES.contains(&components[0].as_str())
            && components[2] == "scenarios"
        {
            log::info!("Discovered scenario {}", path.display());
            found.push(absolutize(path));
        }
    }

    found
}

fn absolutize(path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .map(|cwd| cwd.join(path))
            .unwrap_or_else(|_| path.to_path_buf())
    }
}

/// AND-combined `key=value` requirements a scenario's declared tags must
/// satisfy to be selected. An empty filter keeps everything.
#[derive(Debug, Clone, Default)]
pub struct TagFilter {
    required: BTreeMap<String, String>,
}

impl TagFilter {
    /// Build from raw `key=value` strings. Entries without a `=` are ignored
    /// with a warning.
    pub fn new(raw: &[String]) -> Self {
        let mut required = BTreeMap::new();
        for entry in raw {
            match entry.split_once('=') {
                Some((key, value)) => {
                    required.insert(key.to_string(), value.to_string());
                }
                None => log::warn!("Ignoring malformed tag requirement {entry:?}"),
            }
        }
        Self { required }
    }

    pub fn matches(&self, tags: &BTreeMap<String, String>) -> bool {
        self.required
            .iter()
            .all(|(key, value)| tags.get(key) == Some(value))
    }

    /// Whether the scenario at `path` satisfies every tag requirement. A file
    /// whose tags cannot be read is kept; the executor will surface the parse
    /// failure with proper context.
    fn keeps(&self, path: &Path) -> bool {
        if self.required.is_empty() {
            return true;
        }

        match ScenarioSpec::load_tags(path) {
            Ok(tags) => {
                let keep = self.matches(&tags);
                if !keep {
                    log::info!("{} is not allowed by tags", path.display());
                }
                keep
            }
            Err(e) => {
                log::warn!("Failed to read tags from {}: {e:#}", path.display());
                true
            }
        }
    }
}

/// Heuristic narrowing of scenario files to those whose path names a
/// component implicated by caller-supplied change metadata.
///
/// Component names are derived from the `affected_services` and `services`
/// metadata fields and from the same fields of the nested `test_analysis`
/// sub-map, accepting either a JSON array of strings or one comma-separated
/// string. A filter with no derivable names keeps everything.
#[derive(Debug, Clone, Default)]
pub struct AffectedServiceFilter {
    services: BTreeSet<String>,
}

impl AffectedServiceFilter {
    pub fn from_metadata(metadata: &Metadata) -> Self {
        let mut services = BTreeSet::new();

        for field in ["affected_services", "services"] {
            collect_names(metadata.get(field), &mut services);

            if let Some(Value::Object(analysis)) = metadata.get("test_analysis") {
                collect_names(analysis.get(field), &mut services);
            }
        }

        if !services.is_empty() {
            log::info!("Affected services: {services:?}");
        }

        Self { services }
    }

    /// Whether `path` contains one of the derived names as a full path
    /// segment.
    pub fn keeps(&self, path: &Path) -> bool {
        if self.services.is_empty() {
            return true;
        }

        let keep = path.components().any(|component| {
            let segment = component.as_os_str().to_string_lossy().to_lowercase();
            self.services.contains(&segment)
        });

        if !keep {
            log::info!(
                "{} does not belong to an affected service, skipping",
                path.display()
            );
        }
        keep
    }
}

fn collect_names(value: Option<&Value>, into: &mut BTreeSet<String>) {
    match value {
        Some(Value::String(raw)) => {
            for name in raw.split(',') {
                let name = name.trim().to_lowercase();
                if !name.is_empty() {
                    into.insert(name);
                }
            }
        }
        Some(Value::Array(items)) => {
            for item in items {
                if let Value::String(name) = item {
                    let name = name.trim().to_lowercase();
                    if !name.is_empty() {
                        into.insert(name);
                    }
                }
            }
        }
        _ => {}
    }
}
