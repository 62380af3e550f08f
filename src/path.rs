//! Small path-formatting helpers shared across the engine.

use std::path::{Path, PathBuf};

use dunce::canonicalize as dunce_canonicalize;
use normalize_path::NormalizePath;

/// Canonicalize a path, avoiding Windows verbatim (`\\?\`) prefixes that
/// external tools like `git` choke on.
pub fn canonicalize(path: &Path) -> std::io::Result<PathBuf> {
    dunce_canonicalize(path)
}

/// Get a short display name for a path, used in logging context.
///
/// Falls back to the full path if it has no file name component (e.g. `.`
/// or `/`).
pub fn display_name(path: &Path) -> String {
    if path.as_os_str() == "." {
        return ".".to_string();
    }
    path.file_name()
        .and_then(|n| n.to_str())
        .map(str::to_string)
        .unwrap_or_else(|| path.display().to_string())
}

/// Sanitize a task id for use as a filesystem directory component.
pub fn sanitize_component(name: &str) -> String {
    sanitize_filename::sanitize(name)
}

/// Lexically normalize a task-declared path (collapse `./`, `a/../b`, and
/// redundant separators) so `./src/a.rs` and `src/a.rs` compare equal when
/// checking for write conflicts between tasks.
pub fn normalize_task_path(path: &str) -> String {
    Path::new(path).normalize().to_string_lossy().into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_task_path_collapses_current_dir_prefix() {
        assert_eq!(normalize_task_path("./src/a.rs"), normalize_task_path("src/a.rs"));
    }

    #[test]
    fn normalize_task_path_collapses_parent_segments() {
        assert_eq!(normalize_task_path("src/../src/a.rs"), normalize_task_path("src/a.rs"));
    }
}
