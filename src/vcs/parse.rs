//! Parsers for `git` subprocess output.

use std::path::PathBuf;

use crate::error::VcsError;

use super::Worktree;

impl Worktree {
    /// Parse the blank-line-separated record format of
    /// `git worktree list --porcelain`.
    pub(crate) fn parse_porcelain_list(output: &str) -> Result<Vec<Self>, VcsError> {
        let mut worktrees = Vec::new();
        let mut current: Option<Worktree> = None;

        for line in output.lines() {
            if line.is_empty() {
                if let Some(wt) = current.take() {
                    worktrees.push(wt);
                }
                continue;
            }

            let (key, value) = match line.split_once(' ') {
                Some((k, v)) => (k, Some(v)),
                None => (line, None),
            };

            match key {
                "worktree" => {
                    let path = value.ok_or_else(|| VcsError::ParseError {
                        what: "worktree list".to_string(),
                        detail: "worktree line missing path".to_string(),
                    })?;
                    current = Some(Worktree {
                        path: PathBuf::from(path),
                        head: String::new(),
                        branch: None,
                        bare: false,
                        detached: false,
                    });
                }
                key => match (key, current.as_mut()) {
                    ("HEAD", Some(wt)) => {
                        wt.head = value.unwrap_or_default().to_string();
                    }
                    ("branch", Some(wt)) => {
                        let branch_ref = value.unwrap_or_default();
                        wt.branch = Some(
                            branch_ref
                                .strip_prefix("refs/heads/")
                                .unwrap_or(branch_ref)
                                .to_string(),
                        );
                    }
                    ("bare", Some(wt)) => wt.bare = true,
                    ("detached", Some(wt)) => wt.detached = true,
                    _ => {}
                },
            }
        }

        if let Some(wt) = current {
            worktrees.push(wt);
        }

        Ok(worktrees)
    }
}

/// Parse a single `git diff --numstat` line into `(added, deleted)`.
///
/// Returns `None` for binary entries (`-\t-\tpath`).
pub(crate) fn parse_numstat_line(line: &str) -> Option<(usize, usize)> {
    let mut parts = line.splitn(3, '\t');
    let added_str = parts.next()?;
    let deleted_str = parts.next()?;

    if added_str == "-" || deleted_str == "-" {
        return None;
    }

    Some((added_str.parse().ok()?, deleted_str.parse().ok()?))
}

/// Parse `git diff --name-status -z` output (paired with `-z`, NUL-separated
/// records). For renames/copies both the new and old paths are returned so
/// callers can check overlap under either name.
pub(crate) fn parse_name_status_z(output: &str) -> Result<Vec<String>, VcsError> {
    let mut files = Vec::new();
    let mut parts = output.split('\0').filter(|s| !s.is_empty());

    while let Some(status) = parts.next() {
        let path = parts.next().ok_or_else(|| VcsError::ParseError {
            what: "diff --name-status -z".to_string(),
            detail: "status without path".to_string(),
        })?;
        files.push(path.to_string());

        if status.starts_with('R') || status.starts_with('C') {
            let old_path = parts.next().ok_or_else(|| VcsError::ParseError {
                what: "diff --name-status -z".to_string(),
                detail: "rename/copy without old path".to_string(),
            })?;
            files.push(old_path.to_string());
        }
    }

    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_single_worktree() {
        let output = "worktree /repo\nHEAD abc123\nbranch refs/heads/main\n\n";
        let worktrees = Worktree::parse_porcelain_list(output).unwrap();
        assert_eq!(worktrees.len(), 1);
        assert_eq!(worktrees[0].path, PathBuf::from("/repo"));
        assert_eq!(worktrees[0].branch.as_deref(), Some("main"));
        assert!(!worktrees[0].bare);
    }

    #[test]
    fn parses_detached_and_bare() {
        let output = "worktree /repo\nHEAD abc\nbare\n\nworktree /repo/.chopstack/shadows/t1\nHEAD def\ndetached\n\n";
        let worktrees = Worktree::parse_porcelain_list(output).unwrap();
        assert_eq!(worktrees.len(), 2);
        assert!(worktrees[0].bare);
        assert!(worktrees[1].detached);
        assert!(worktrees[1].branch.is_none());
    }

    #[test]
    fn parses_without_trailing_blank_line() {
        let output = "worktree /repo\nHEAD abc123\nbranch refs/heads/main";
        let worktrees = Worktree::parse_porcelain_list(output).unwrap();
        assert_eq!(worktrees.len(), 1);
    }

    #[test]
    fn numstat_skips_binary_entries() {
        assert_eq!(parse_numstat_line("3\t1\tsrc/lib.rs"), Some((3, 1)));
        assert_eq!(parse_numstat_line("-\t-\tassets/logo.png"), None);
    }

    #[test]
    fn name_status_handles_renames() {
        let output = "M\0src/a.rs\0R100\0src/b.rs\0src/old_b.rs\0";
        let files = parse_name_status_z(output).unwrap();
        assert_eq!(files, vec!["src/a.rs", "src/b.rs", "src/old_b.rs"]);
    }
}
