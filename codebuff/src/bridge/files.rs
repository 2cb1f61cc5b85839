//! Local filesystem tools: reads, edits, listings, and glob matching.

use std::path::{Component, Path, PathBuf};

use serde_json::json;
use tracing::debug;

use crate::message::ToolResultPart;
use crate::tools::{
    GlobInput, ListDirectoryInput, ReadFilesInput, StrReplaceInput, WriteFileInput,
};

/// Resolve a project-relative path, rejecting escapes from the root.
fn resolve(root: &Path, relative: &str) -> Result<PathBuf, String> {
    let candidate = Path::new(relative);
    if candidate.is_absolute() {
        return Err(format!("path must be relative to the project root: {relative}"));
    }
    for component in candidate.components() {
        if matches!(component, Component::ParentDir) {
            return Err(format!("path may not traverse outside the project: {relative}"));
        }
    }
    Ok(root.join(candidate))
}

/// Read files, returning `null` for entries that cannot be read.
///
/// Readable contents always end with a trailing newline.
pub async fn read_files(root: &Path, input: &ReadFilesInput) -> Vec<ToolResultPart> {
    let mut files = serde_json::Map::new();
    for path in &input.paths {
        let contents = match resolve(root, path) {
            Ok(resolved) => tokio::fs::read_to_string(&resolved).await.ok(),
            Err(_) => None,
        };
        let contents = contents.map(|mut text| {
            if !text.ends_with('\n') {
                text.push('\n');
            }
            text
        });
        files.insert(path.clone(), contents.map_or(serde_json::Value::Null, Into::into));
    }
    vec![ToolResultPart::json(json!({ "files": files }))]
}

/// Create or overwrite a file, creating parent directories as needed.
pub async fn write_file(root: &Path, input: &WriteFileInput) -> Vec<ToolResultPart> {
    let resolved = match resolve(root, &input.path) {
        Ok(resolved) => resolved,
        Err(reason) => return vec![ToolResultPart::error(reason)],
    };
    let existed = resolved.exists();
    if let Some(parent) = resolved.parent() {
        if let Err(e) = tokio::fs::create_dir_all(parent).await {
            return vec![ToolResultPart::error(format!(
                "could not create parent directories for {}: {e}",
                input.path
            ))];
        }
    }
    match tokio::fs::write(&resolved, &input.content).await {
        Ok(()) => {
            debug!(path = %input.path, created = !existed, "wrote file");
            vec![ToolResultPart::json(json!({
                "path": input.path,
                "created": !existed,
                "bytes": input.content.len(),
            }))]
        }
        Err(e) => vec![ToolResultPart::error(format!(
            "could not write {}: {e}",
            input.path
        ))],
    }
}

/// Replace an exact text span inside a file.
///
/// The span must match exactly once unless `replace_all` is set; zero
/// matches and ambiguous matches are errors so edits never land in the
/// wrong place.
pub async fn str_replace(root: &Path, input: &StrReplaceInput) -> Vec<ToolResultPart> {
    let resolved = match resolve(root, &input.path) {
        Ok(resolved) => resolved,
        Err(reason) => return vec![ToolResultPart::error(reason)],
    };
    let contents = match tokio::fs::read_to_string(&resolved).await {
        Ok(contents) => contents,
        Err(e) => {
            return vec![ToolResultPart::error(format!(
                "could not read {}: {e}",
                input.path
            ))];
        }
    };

    let occurrences = contents.matches(&input.old).count();
    if occurrences == 0 {
        return vec![ToolResultPart::error(format!(
            "text to replace not found in {}",
            input.path
        ))];
    }
    if occurrences > 1 && !input.replace_all {
        return vec![ToolResultPart::error(format!(
            "text to replace matches {occurrences} times in {}; pass replace_all to replace \
             every occurrence",
            input.path
        ))];
    }

    let updated = if input.replace_all {
        contents.replace(&input.old, &input.new)
    } else {
        contents.replacen(&input.old, &input.new, 1)
    };
    match tokio::fs::write(&resolved, updated).await {
        Ok(()) => vec![ToolResultPart::json(json!({
            "path": input.path,
            "replacements": if input.replace_all { occurrences } else { 1 },
        }))],
        Err(e) => vec![ToolResultPart::error(format!(
            "could not write {}: {e}",
            input.path
        ))],
    }
}

/// List a directory's entries, directories first.
pub async fn list_directory(root: &Path, input: &ListDirectoryInput) -> Vec<ToolResultPart> {
    let resolved = match resolve(root, &input.path) {
        Ok(resolved) => resolved,
        Err(reason) => return vec![ToolResultPart::error(reason)],
    };
    let mut reader = match tokio::fs::read_dir(&resolved).await {
        Ok(reader) => reader,
        Err(e) => {
            return vec![ToolResultPart::error(format!(
                "could not list {}: {e}",
                input.path
            ))];
        }
    };

    let mut directories = Vec::new();
    let mut files = Vec::new();
    while let Ok(Some(entry)) = reader.next_entry().await {
        let name = entry.file_name().to_string_lossy().into_owned();
        match entry.file_type().await {
            Ok(kind) if kind.is_dir() => directories.push(name),
            _ => files.push(name),
        }
    }
    directories.sort();
    files.sort();
    vec![ToolResultPart::json(json!({
        "path": input.path,
        "directories": directories,
        "files": files,
    }))]
}

/// Match a glob pattern against the project tree.
pub async fn glob_files(root: &Path, input: &GlobInput) -> Vec<ToolResultPart> {
    let pattern = match resolve(root, &input.pattern) {
        Ok(resolved) => resolved.to_string_lossy().into_owned(),
        Err(reason) => return vec![ToolResultPart::error(reason)],
    };
    let root = root.to_path_buf();
    let matches = tokio::task::spawn_blocking(move || {
        glob::glob(&pattern).map(|paths| {
            paths
                .filter_map(std::result::Result::ok)
                .filter_map(|path| {
                    path.strip_prefix(&root)
                        .map(|p| p.to_string_lossy().into_owned())
                        .ok()
                })
                .collect::<Vec<String>>()
        })
    })
    .await;

    match matches {
        Ok(Ok(mut files)) => {
            files.sort();
            vec![ToolResultPart::json(json!({
                "pattern": input.pattern,
                "files": files,
            }))]
        }
        Ok(Err(e)) => vec![ToolResultPart::error(format!(
            "invalid glob pattern {}: {e}",
            input.pattern
        ))],
        Err(e) => vec![ToolResultPart::error(format!("glob task failed: {e}"))],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input_paths(paths: &[&str]) -> ReadFilesInput {
        ReadFilesInput {
            paths: paths.iter().map(|p| (*p).to_owned()).collect(),
        }
    }

    #[tokio::test]
    async fn read_files_appends_trailing_newline() {
        let dir = tempfile::tempdir().expect("tempdir");
        tokio::fs::write(dir.path().join("a.txt"), "no newline")
            .await
            .expect("write");

        let parts = read_files(dir.path(), &input_paths(&["a.txt", "missing.txt"])).await;
        let ToolResultPart::Json { value } = &parts[0] else {
            panic!("expected json part");
        };
        assert_eq!(value["files"]["a.txt"], "no newline\n");
        assert_eq!(value["files"]["missing.txt"], serde_json::Value::Null);
    }

    #[tokio::test]
    async fn write_then_replace_round_trips() {
        let dir = tempfile::tempdir().expect("tempdir");
        let write = WriteFileInput {
            path: "src/main.rs".into(),
            content: "fn main() { old(); }".into(),
        };
        let parts = write_file(dir.path(), &write).await;
        assert!(!parts[0].is_error());

        let replace = StrReplaceInput {
            path: "src/main.rs".into(),
            old: "old()".into(),
            new: "new()".into(),
            replace_all: false,
        };
        let parts = str_replace(dir.path(), &replace).await;
        assert!(!parts[0].is_error());

        let contents = tokio::fs::read_to_string(dir.path().join("src/main.rs"))
            .await
            .expect("read");
        assert_eq!(contents, "fn main() { new(); }");
    }

    #[tokio::test]
    async fn ambiguous_replace_is_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        tokio::fs::write(dir.path().join("a.txt"), "x x")
            .await
            .expect("write");
        let replace = StrReplaceInput {
            path: "a.txt".into(),
            old: "x".into(),
            new: "y".into(),
            replace_all: false,
        };
        let parts = str_replace(dir.path(), &replace).await;
        assert!(parts[0].is_error());

        let replace_all = StrReplaceInput {
            replace_all: true,
            ..replace
        };
        let parts = str_replace(dir.path(), &replace_all).await;
        assert!(!parts[0].is_error());
    }

    #[tokio::test]
    async fn path_traversal_is_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let write = WriteFileInput {
            path: "../escape.txt".into(),
            content: String::new(),
        };
        let parts = write_file(dir.path(), &write).await;
        assert!(parts[0].is_error());

        let absolute = WriteFileInput {
            path: "/etc/shadow".into(),
            content: String::new(),
        };
        let parts = write_file(dir.path(), &absolute).await;
        assert!(parts[0].is_error());
    }

    #[tokio::test]
    async fn glob_matches_relative_paths() {
        let dir = tempfile::tempdir().expect("tempdir");
        tokio::fs::create_dir_all(dir.path().join("src")).await.expect("mkdir");
        tokio::fs::write(dir.path().join("src/lib.rs"), "").await.expect("write");
        tokio::fs::write(dir.path().join("README.md"), "").await.expect("write");

        let parts = glob_files(
            dir.path(),
            &GlobInput {
                pattern: "src/*.rs".into(),
            },
        )
        .await;
        let ToolResultPart::Json { value } = &parts[0] else {
            panic!("expected json part");
        };
        assert_eq!(value["files"], serde_json::json!(["src/lib.rs"]));
    }
}
