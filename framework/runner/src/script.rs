use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Output;

use anyhow::Context;

/// Script handling for scenario fields.
///
/// Any scenario field whose text begins with an interpreter marker (`#!`) is
/// materialized to a temporary executable, run, and its captured output used
/// in place of the original text. The same mechanism runs the prepare, check
/// and assert scripts.

/// Whether `contents` is a script rather than a literal value.
pub fn is_script(contents: &str) -> bool {
    contents.starts_with("#!")
}

/// Extract the interpreter name from a shebang line.
///
/// Only a direct interpreter path is supported, not `/usr/bin/env xx`.
pub fn interpreter(first_line: &str) -> anyhow::Result<String> {
    let rest = first_line
        .strip_prefix("#!")
        .context("Script does not start with an interpreter marker")?;

    let path = rest.split_whitespace().next().unwrap_or_default();
    let name = Path::new(path)
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .filter(|n| !n.is_empty())
        .context("Interpreter marker names no interpreter")?;

    Ok(name)
}

/// Write `contents` to `path` as an executable script.
pub fn materialize(path: &Path, contents: &str) -> anyhow::Result<()> {
    std::fs::write(path, contents)
        .with_context(|| format!("Failed to write script to {}", path.display()))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755))
            .with_context(|| format!("Failed to mark {} executable", path.display()))?;
    }

    Ok(())
}

/// Run the script at `path` and return the process output.
///
/// The interpreter is sniffed from the first line of the file. A
/// python-family interpreter is invoked as `interpreter file`; anything else
/// is assumed to be a shell and invoked as `interpreter -c file`. The child
/// inherits the ambient environment plus `env`.
pub async fn run(path: &Path, env: &BTreeMap<String, String>) -> anyhow::Result<Output> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read script {}", path.display()))?;
    let first_line = contents.lines().next().unwrap_or_default();
    let interpreter = interpreter(first_line)?;

    let mut command = tokio::process::Command::new(&interpreter);
    if interpreter.contains("python") {
        command.arg(path);
    } else {
        command.arg("-c").arg(path);
    }
    command.envs(env);

    command
        .output()
        .await
        .with_context(|| format!("Failed to run script {} with {interpreter}", path.display()))
}

/// Run the script at `path` and return its combined stdout and stderr.
///
/// A non-zero exit status is an error carrying the captured output, so the
/// caller can record it without aborting anything else.
pub async fn run_capture(path: &Path, env: &BTreeMap<String, String>) -> anyhow::Result<String> {
    let output = run(path, env).await?;
    let combined = combine_output(&output);

    if !output.status.success() {
        anyhow::bail!(
            "Script {} exited with {}: {}",
            path.display(),
            output.status,
            combined.trim_end()
        );
    }

    Ok(combined)
}

/// Materialize-and-run for a scenario field value.
///
/// When `contents` starts with an interpreter marker it is written to `path`,
/// executed, and the captured output (trailing newline trimmed) is returned
/// as the substituted value. Otherwise `contents` is returned unchanged.
pub async fn parse_value(
    contents: &str,
    path: PathBuf,
    env: &BTreeMap<String, String>,
) -> anyhow::Result<String> {
    if !is_script(contents) {
        return Ok(contents.to_string());
    }

    materialize(&path, contents)?;
    let output = run_capture(&path, env).await?;
    Ok(output.trim_end_matches(['\n', '\r']).to_string())
}

fn combine_output(output: &Output) -> String {
    let mut combined = String::from_utf8_lossy(&output.stdout).to_string();
    combined.push_str(&String::from_utf8_lossy(&output.stderr));
    combined
}
