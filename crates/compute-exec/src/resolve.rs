//! Executable resolution for sandboxed launches.

use std::{
    collections::HashSet,
    env::{join_paths, split_paths},
    ffi::{OsStr, OsString},
    path::{Path, PathBuf},
};

use compute_core::{LaunchError, resolve_in_sandbox};

/// Resolve an executable for a launch rooted at `sandbox`.
///
/// The search order is:
/// 1. Absolute paths, used as-is when they name a file.
/// 2. Relative paths containing a separator, resolved inside the sandbox.
/// 3. Bare names, searched in the sandbox root and then `search_path`
///    (or the agent's own `PATH` when `None`).
///
/// # Errors
/// Returns `ExecutableNotFound` if nothing matches, including relative paths
/// that escape the sandbox.
pub async fn resolve_executable(
    sandbox: &Path,
    executable: &str,
    search_path: Option<OsString>,
) -> Result<PathBuf, LaunchError> {
    let not_found = || LaunchError::ExecutableNotFound(executable.to_string());
    if executable.trim().is_empty() {
        return Err(not_found());
    }

    let path = Path::new(executable);
    if path.is_absolute() {
        return if is_file(path).await {
            Ok(path.to_path_buf())
        } else {
            Err(not_found())
        };
    }

    if path.components().count() > 1 {
        let resolved = resolve_in_sandbox(sandbox, executable).map_err(|_| not_found())?;
        return if is_file(&resolved).await {
            Ok(resolved)
        } else {
            Err(not_found())
        };
    }

    let system = search_path
        .or_else(|| std::env::var_os("PATH"))
        .unwrap_or_default();
    let paths = merge_paths(sandbox.as_os_str(), system);
    which_async(executable, paths, sandbox.to_path_buf())
        .await
        .ok_or_else(not_found)
}

/// Merge two PATH strings into a single, de-duplicated PATH.
#[must_use]
pub fn merge_paths(primary: impl AsRef<OsStr>, secondary: impl AsRef<OsStr>) -> OsString {
    let mut seen = HashSet::<PathBuf>::new();
    let mut merged = Vec::<PathBuf>::new();

    for p in split_paths(primary.as_ref()).chain(split_paths(secondary.as_ref())) {
        if !p.as_os_str().is_empty() && seen.insert(p.clone()) {
            merged.push(p);
        }
    }

    join_paths(merged).unwrap_or_default()
}

async fn is_file(path: &Path) -> bool {
    tokio::fs::metadata(path)
        .await
        .is_ok_and(|metadata| metadata.is_file())
}

async fn which_async(executable: &str, paths: OsString, cwd: PathBuf) -> Option<PathBuf> {
    let executable = executable.to_string();
    tokio::task::spawn_blocking(move || which::which_in(executable, Some(paths), cwd))
        .await
        .ok()
        .and_then(Result::ok)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_paths_dedupes_in_order() {
        let a = join_paths(["/a", "/b"]).unwrap();
        let b = join_paths(["/b", "/c"]).unwrap();
        let merged: Vec<PathBuf> = split_paths(&merge_paths(a, b)).collect();
        assert_eq!(
            merged,
            vec![PathBuf::from("/a"), PathBuf::from("/b"), PathBuf::from("/c")]
        );
    }

    #[tokio::test]
    async fn test_empty_name_is_not_found() {
        let sandbox = tempfile::tempdir().unwrap();
        assert!(matches!(
            resolve_executable(sandbox.path(), "  ", None).await,
            Err(LaunchError::ExecutableNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_relative_escape_is_not_found() {
        let sandbox = tempfile::tempdir().unwrap();
        assert!(matches!(
            resolve_executable(sandbox.path(), "../bin/sh", None).await,
            Err(LaunchError::ExecutableNotFound(_))
        ));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_sandbox_wins_over_path() {
        use std::os::unix::fs::PermissionsExt;

        let sandbox = tempfile::tempdir().unwrap();
        let tool = sandbox.path().join("sh");
        std::fs::write(&tool, "#!/bin/sh\n").unwrap();
        std::fs::set_permissions(&tool, std::fs::Permissions::from_mode(0o755)).unwrap();

        let resolved = resolve_executable(sandbox.path(), "sh", None).await.unwrap();
        assert_eq!(resolved, tool);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_falls_back_to_search_path() {
        let sandbox = tempfile::tempdir().unwrap();
        let resolved = resolve_executable(sandbox.path(), "sh", None).await.unwrap();
        assert!(resolved.is_absolute());
        assert!(resolved.ends_with("sh"));
    }
}
