//! Output directory for a project's generated files.

use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};

use anyhow::{Context, Result};

const SUMMARY_FILE: &str = "devcrew-summary.json";

/// Isolated directory for one project's files.
pub struct Workspace {
    pub root: PathBuf,
    pub project_name: String,
}

impl Workspace {
    /// Create `base/<slug>` where the slug comes from the description.
    pub async fn create(base: &Path, description: &str) -> Result<Self> {
        let project_name = slug(description);
        let root = base.join(&project_name);
        tokio::fs::create_dir_all(&root)
            .await
            .with_context(|| format!("Failed to create {}", root.display()))?;
        Ok(Self { root, project_name })
    }

    /// Write a file relative to the workspace root. Paths that would escape
    /// the root are refused.
    pub async fn write_file(&self, path: &str, content: &str) -> Result<PathBuf> {
        let Some(relative) = contained(path) else {
            anyhow::bail!("Refusing to write outside the workspace: {path}");
        };
        let full = self.root.join(relative);
        if let Some(parent) = full.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&full, content)
            .await
            .with_context(|| format!("Failed to write {}", full.display()))?;
        Ok(full)
    }

    /// Write every file in the manifest. Unsafe paths are logged and
    /// skipped; I/O failures abort.
    pub async fn write_manifest(&self, files: &BTreeMap<String, String>) -> Result<Vec<PathBuf>> {
        let mut written = Vec::with_capacity(files.len());
        for (path, content) in files {
            if contained(path).is_none() {
                tracing::warn!(path = %path, "Skipped file outside the workspace");
                continue;
            }
            let full = self.write_file(path, content).await?;
            tracing::debug!(path = %full.display(), bytes = content.len(), "Wrote file");
            written.push(full);
        }
        Ok(written)
    }

    /// Write a JSON summary of the run next to the generated files.
    pub async fn write_summary(&self, summary: &serde_json::Value) -> Result<PathBuf> {
        let text = serde_json::to_string_pretty(summary)?;
        self.write_file(SUMMARY_FILE, &text).await
    }

    /// List files recursively, relative to the root, sorted.
    pub async fn list_files(&self) -> Result<Vec<String>> {
        let root = self.root.clone();
        let mut files = tokio::task::spawn_blocking(move || list_files_sync(&root)).await?;
        files.sort();
        Ok(files)
    }
}

/// `path` as a relative path that stays under the root.
fn contained(path: &str) -> Option<&Path> {
    let relative = Path::new(path);
    let safe = !path.is_empty()
        && relative
            .components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir));
    safe.then_some(relative)
}

fn list_files_sync(root: &Path) -> Vec<String> {
    fn walk(dir: &Path, root: &Path, result: &mut Vec<String>) {
        let Ok(entries) = std::fs::read_dir(dir) else {
            return;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                walk(&path, root, result);
            } else if let Ok(rel) = path.strip_prefix(root) {
                result.push(rel.to_string_lossy().replace('\\', "/"));
            }
        }
    }
    let mut result = Vec::new();
    walk(root, root, &mut result);
    result
}

/// Lowercase, dash-separated, at most six words of the description.
fn slug(description: &str) -> String {
    let words: Vec<String> = description
        .split_whitespace()
        .map(|w| {
            w.chars()
                .filter(|c| c.is_alphanumeric() || *c == '-')
                .collect::<String>()
                .to_lowercase()
        })
        .filter(|w| !w.is_empty())
        .take(6)
        .collect();
    if words.is_empty() {
        "project".to_string()
    } else {
        words.join("-")
    }
}
