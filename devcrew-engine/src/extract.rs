//! Pulls generated files out of free-form model output.

use std::sync::LazyLock;

use regex::Regex;

/// A file found in an agent's output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractedFile {
    pub path: String,
    pub content: String,
}

/// Shorter blocks are treated as illustrative snippets, not files.
const MIN_CONTENT_LEN: usize = 10;

const EXTENSIONLESS: &[&str] = &["Dockerfile", "Makefile", "Procfile", "LICENSE"];

// ```python filename: src/app.py
static FENCE_HEADER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)```[\w+.-]*[ \t]*filename:[ \t]*([^\n`]+)\n(.*?)```").expect("valid regex")
});

// filename: src/app.py  (or File: / Create file:) followed by a fence
static LABEL_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?ms)^[ \t]*(?:filename|File|Create file):[ \t]*([^\n`]+)\n```[\w+.-]*[ \t]*\n(.*?)```")
        .expect("valid regex")
});

// ```src/app.py
static FENCE_PATH: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?s)```([^\s`]+\.(?:py|js|jsx|ts|tsx|css|scss|html|json|yml|yaml|md|txt|sh|sql|xml|toml|rs|go|java|env|ini|cfg)|[^\s`]*(?:Dockerfile|Makefile|Procfile|\.gitignore|\.dockerignore))[ \t]*\n(.*?)```",
    )
    .expect("valid regex")
});

/// Extract every file block from `output`, in order of appearance.
///
/// When the same path appears twice the later block wins but keeps the
/// earlier position.
pub fn extract_files(output: &str) -> Vec<ExtractedFile> {
    let text = output.replace("\r\n", "\n");
    let mut found: Vec<(usize, String, String)> = Vec::new();

    for re in [&*FENCE_HEADER, &*LABEL_LINE, &*FENCE_PATH] {
        for cap in re.captures_iter(&text) {
            let (Some(whole), Some(raw_path), Some(body)) = (cap.get(0), cap.get(1), cap.get(2))
            else {
                continue;
            };
            let Some(path) = sanitize_path(raw_path.as_str()) else {
                tracing::debug!(path = raw_path.as_str(), "Skipping unusable file path");
                continue;
            };
            let content = body.as_str().trim_end().to_string();
            if content.trim().len() < MIN_CONTENT_LEN {
                continue;
            }
            // Ranges already claimed by an earlier pattern are skipped.
            if found.iter().any(|(start, _, _)| *start == whole.start()) {
                continue;
            }
            found.push((whole.start(), path, content));
        }
    }

    found.sort_by_key(|(start, _, _)| *start);

    let mut files: Vec<ExtractedFile> = Vec::new();
    for (_, path, content) in found {
        if let Some(existing) = files.iter_mut().find(|f| f.path == path) {
            existing.content = content;
        } else {
            files.push(ExtractedFile { path, content });
        }
    }
    files
}

/// Normalise a model-supplied path into a safe relative path.
///
/// Returns `None` for absolute paths, parent traversal, or names without an
/// extension (other than a few well-known extensionless files).
pub fn sanitize_path(raw: &str) -> Option<String> {
    let cleaned = raw
        .trim()
        .trim_matches(|c| c == '`' || c == '"' || c == '\'' || c == '*')
        .replace('\\', "/");

    if cleaned.is_empty() || cleaned.starts_with('/') {
        return None;
    }
    // Windows drive letters.
    if cleaned.len() >= 2 && cleaned.as_bytes()[1] == b':' {
        return None;
    }

    let mut parts = Vec::new();
    for part in cleaned.split('/') {
        match part {
            "" | "." => continue,
            ".." => return None,
            p if p.chars().any(|c| "<>:\"|?*".contains(c) || c.is_control()) => return None,
            p if p.chars().any(char::is_whitespace) => return None,
            p => parts.push(p),
        }
    }

    let name = parts.last()?;
    let has_extension = name.contains('.') && !name.ends_with('.');
    if !has_extension && !EXTENSIONLESS.contains(name) {
        return None;
    }
    Some(parts.join("/"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finds_filename_header_blocks() {
        let out = "Here you go:\n```python filename: app/main.py\nprint('hello world')\n```\n\
                   and\n```filename: README.md\n# Notes app readme\n```";
        let files = extract_files(out);
        assert_eq!(files.len(), 2);
        assert_eq!(files[0].path, "app/main.py");
        assert_eq!(files[0].content, "print('hello world')");
        assert_eq!(files[1].path, "README.md");
    }

    #[test]
    fn finds_label_lines_and_path_fences() {
        let out = "File: web/index.html\n```html\n<html><body>hi</body></html>\n```\n\
                   ```Dockerfile\nFROM python:3.12-slim\n```";
        let files = extract_files(out);
        let paths: Vec<_> = files.iter().map(|f| f.path.as_str()).collect();
        assert_eq!(paths, vec!["web/index.html", "Dockerfile"]);
    }

    #[test]
    fn ignores_plain_code_and_short_blocks() {
        let out = "```python\nprint('no name given here')\n```\n```filename: a.py\nx=1\n```";
        assert!(extract_files(out).is_empty());
    }

    #[test]
    fn later_block_for_same_path_wins() {
        let out = "```filename: app.py\nprint('first version')\n```\n\
                   ```filename: ./app.py\nprint('second version')\n```";
        let files = extract_files(out);
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].content, "print('second version')");
    }

    #[test]
    fn sanitize_rejects_escapes() {
        assert_eq!(sanitize_path("../etc/passwd.txt"), None);
        assert_eq!(sanitize_path("/abs/path.py"), None);
        assert_eq!(sanitize_path("C:\\win\\x.py"), None);
        assert_eq!(sanitize_path("noext"), None);
        assert_eq!(sanitize_path(" `src\\lib.rs` "), Some("src/lib.rs".to_string()));
        assert_eq!(sanitize_path("./a//b.py"), Some("a/b.py".to_string()));
        assert_eq!(sanitize_path("Makefile"), Some("Makefile".to_string()));
    }
}
