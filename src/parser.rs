//! File-path validation and text extraction. Spec.md §4.3.

use crate::errors::{AppError, AppResult};
use std::path::{Component, Path, PathBuf};

/// Characters the store's filter language could misinterpret if they leaked
/// unescaped into a query predicate. Rejected outright at validation time
/// rather than escaped, mirroring the whitelist approach in
/// `other_examples/...codex-rs-retrieval-src-storage-lancedb.rs.rs`.
const DANGEROUS_CHARS: [char; 5] = ['\'', '"', '\\', '`', ';'];

/// Validate a `filePath`. Accepts either an absolute on-disk path rooted
/// inside `root`, or a `memory://<label>` synthetic path whose label matches
/// `[A-Za-z0-9_.-]+`.
pub fn validate_file_path(file_path: &str, root: &Path) -> AppResult<()> {
    if let Some(label) = file_path.strip_prefix("memory://") {
        return validate_label(label);
    }

    if file_path.chars().any(|c| DANGEROUS_CHARS.contains(&c) || c.is_control()) {
        return Err(AppError::validation(format!(
            "filePath '{file_path}' contains characters that are not permitted"
        )));
    }

    let path = Path::new(file_path);
    if !path.is_absolute() {
        return Err(AppError::validation(format!(
            "filePath '{file_path}' must be an absolute path"
        )));
    }

    let root = normalize(root);
    let candidate = normalize(path);
    if !candidate.starts_with(&root) {
        return Err(AppError::validation(format!(
            "filePath '{file_path}' escapes the configured root directory"
        )));
    }

    Ok(())
}

/// Validate a `memory://` label in isolation.
pub fn validate_label(label: &str) -> AppResult<()> {
    let ok = !label.is_empty()
        && label
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'));
    if ok {
        Ok(())
    } else {
        Err(AppError::validation(format!(
            "memory label '{label}' must match [A-Za-z0-9_.-]+"
        )))
    }
}

/// Lexically normalize `..`/`.` components without touching the filesystem
/// (the path need not exist yet for validation purposes).
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::ParentDir => {
                out.pop();
            }
            Component::CurDir => {}
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// Result of parsing a file: its extracted text and an optional language hint.
pub struct ParsedFile {
    pub text: String,
    pub language: Option<String>,
}

/// Extensions this crate can extract plain text from. PDF/DOCX extraction is
/// explicitly out of scope (spec.md §1) — the caller should surface a
/// `ParseError` for those.
fn language_for_extension(ext: &str) -> Option<&'static str> {
    Some(match ext {
        "rs" => "rust",
        "py" => "python",
        "js" | "jsx" => "javascript",
        "ts" | "tsx" => "typescript",
        "go" => "go",
        "java" => "java",
        "c" | "h" => "c",
        "cpp" | "cc" | "hpp" => "cpp",
        "md" => "markdown",
        "json" => "json",
        "toml" => "toml",
        "yaml" | "yml" => "yaml",
        "html" | "htm" => "html",
        "css" => "css",
        "txt" => return None,
        _ => return None,
    })
}

const UNSUPPORTED_EXTENSIONS: &[&str] = &["pdf", "docx", "doc", "odt"];

/// Parse a file on disk: validate, size-check, read, and text-extract by
/// extension. Binary extraction errors propagate as `ParseError`.
pub fn parse_file(path: &Path, root: &Path, max_file_bytes: u64) -> AppResult<ParsedFile> {
    validate_file_path(&path.to_string_lossy(), root)?;

    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_ascii_lowercase();

    if UNSUPPORTED_EXTENSIONS.contains(&ext.as_str()) {
        return Err(AppError::Parse(format!(
            "unsupported extension '.{ext}' for {}",
            path.display()
        )));
    }

    let metadata = std::fs::metadata(path)
        .map_err(|e| AppError::Parse(format!("cannot stat {}: {e}", path.display())))?;
    if metadata.len() > max_file_bytes {
        return Err(AppError::Parse(format!(
            "{} ({} bytes) exceeds the configured max file size ({} bytes)",
            path.display(),
            metadata.len(),
            max_file_bytes
        )));
    }

    let bytes = std::fs::read(path)
        .map_err(|e| AppError::Parse(format!("cannot read {}: {e}", path.display())))?;
    let text = String::from_utf8(bytes)
        .map_err(|_| AppError::Parse(format!("{} is not valid UTF-8 text", path.display())))?;

    Ok(ParsedFile {
        text,
        language: language_for_extension(&ext).map(str::to_string),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_path_escaping_root() {
        let root = Path::new("/workspace/project");
        let err = validate_file_path("/workspace/other/file.txt", root).unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
    }

    #[test]
    fn accepts_path_inside_root() {
        let root = Path::new("/workspace/project");
        assert!(validate_file_path("/workspace/project/src/main.rs", root).is_ok());
    }

    #[test]
    fn rejects_dangerous_characters() {
        let root = Path::new("/workspace/project");
        assert!(validate_file_path("/workspace/project/f'ile.txt", root).is_err());
    }

    #[test]
    fn accepts_valid_memory_label() {
        assert!(validate_file_path("memory://snippet-123", Path::new("/x")).is_ok());
    }

    #[test]
    fn rejects_invalid_memory_label() {
        assert!(validate_file_path("memory://bad label!", Path::new("/x")).is_err());
    }

    #[test]
    fn rejects_relative_paths() {
        let root = Path::new("/workspace/project");
        assert!(validate_file_path("relative/file.txt", root).is_err());
    }

    #[test]
    fn rejects_traversal_back_out_of_root() {
        let root = Path::new("/workspace/project");
        assert!(validate_file_path("/workspace/project/../../etc/passwd", root).is_err());
    }
}
