//! Path resolution confined to a sandbox root.

use std::path::{Component, Path, PathBuf};

use thiserror::Error;

/// A path resolved outside the sandbox root.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Path '{path}' escapes sandbox root '{root}'")]
pub struct SandboxViolation {
    pub root: PathBuf,
    pub path: String,
}

/// Resolve `path` against `root`, rejecting anything that escapes it.
///
/// Resolution is lexical: `.` and `..` are folded without touching the file
/// system. Absolute paths are accepted only if they already lie inside `root`.
///
/// # Errors
/// Returns `SandboxViolation` if the resolved path is outside `root`.
pub fn resolve_in_sandbox(root: &Path, path: &str) -> Result<PathBuf, SandboxViolation> {
    let violation = || SandboxViolation {
        root: root.to_path_buf(),
        path: path.to_string(),
    };

    let candidate = Path::new(path);
    let relative = if candidate.is_absolute() {
        candidate.strip_prefix(root).map_err(|_| violation())?
    } else {
        candidate
    };

    let mut resolved = root.to_path_buf();
    let mut depth = 0usize;
    for component in relative.components() {
        match component {
            Component::CurDir => {}
            Component::Normal(part) => {
                resolved.push(part);
                depth += 1;
            }
            Component::ParentDir => {
                if depth == 0 {
                    return Err(violation());
                }
                resolved.pop();
                depth -= 1;
            }
            Component::RootDir | Component::Prefix(_) => return Err(violation()),
        }
    }
    Ok(resolved)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_relative_paths_resolve_under_root() {
        let root = Path::new("/sandbox");
        assert_eq!(
            resolve_in_sandbox(root, "a/./b/../c").unwrap(),
            PathBuf::from("/sandbox/a/c")
        );
        assert_eq!(resolve_in_sandbox(root, "").unwrap(), PathBuf::from("/sandbox"));
    }

    #[test]
    fn test_escapes_are_rejected() {
        let root = Path::new("/sandbox");
        assert!(resolve_in_sandbox(root, "../etc").is_err());
        assert!(resolve_in_sandbox(root, "a/../../etc").is_err());
        assert!(resolve_in_sandbox(root, "/etc/passwd").is_err());
    }

    #[test]
    fn test_absolute_inside_root_is_accepted() {
        let root = Path::new("/sandbox");
        assert_eq!(
            resolve_in_sandbox(root, "/sandbox/bin/tool").unwrap(),
            PathBuf::from("/sandbox/bin/tool")
        );
    }
}
