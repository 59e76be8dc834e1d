//! `WriteFiles` and `DeleteFiles`.

use std::{
    io,
    path::{Path, PathBuf},
};

use compute_core::resolve_in_sandbox;
use compute_storage::materialize_tree;
use glob::Pattern;

use super::ComputeHandler;
use crate::{
    catalog::{DeleteFiles, WriteFiles, WriteFilesResponse},
    channel::MessageChannel,
    error::{ProtocolError, ProtocolResult},
};

impl ComputeHandler {
    pub(super) async fn write_files(
        &self,
        channel: &MessageChannel,
        request: WriteFiles,
    ) -> ProtocolResult<()> {
        let written = materialize_tree(
            self.storage.as_ref(),
            &request.tree,
            &self.config.sandbox,
            &request.target_dir,
        )
        .await?;
        tracing::debug!(
            channel_id = channel.id(),
            target_dir = %request.target_dir,
            tree = %request.tree,
            written,
            "Wrote files"
        );
        channel.send(&WriteFilesResponse).await
    }

    pub(super) async fn delete_files(&self, request: DeleteFiles) -> ProtocolResult<()> {
        let sandbox = self.config.sandbox.clone();
        let patterns = request
            .filters
            .iter()
            .map(|filter| sandbox_pattern(&sandbox, filter))
            .collect::<ProtocolResult<Vec<_>>>()?;

        let deleted = tokio::task::spawn_blocking(move || delete_matches(&sandbox, &patterns))
            .await
            .map_err(|err| ProtocolError::Io(io::Error::other(err)))??;
        tracing::debug!(filters = ?request.filters, deleted, "Deleted files");
        Ok(())
    }
}

/// Anchor `filter` at the sandbox root. The literal root is escaped so only
/// the filter's own wildcards take effect.
fn sandbox_pattern(sandbox: &Path, filter: &str) -> ProtocolResult<String> {
    let resolved = resolve_in_sandbox(sandbox, filter)?;
    let relative = resolved
        .strip_prefix(sandbox)
        .map_err(|_| ProtocolError::InvalidRequest(format!("filter {filter:?}")))?;
    let relative = relative.to_string_lossy();
    if relative.is_empty() {
        return Err(ProtocolError::InvalidRequest(format!(
            "filter {filter:?} matches the sandbox root"
        )));
    }

    let pattern = format!(
        "{}/{relative}",
        Pattern::escape(&sandbox.to_string_lossy()).trim_end_matches('/')
    );
    Pattern::new(&pattern)
        .map_err(|err| ProtocolError::InvalidRequest(format!("filter {filter:?}: {err}")))?;
    Ok(pattern)
}

fn delete_matches(sandbox: &Path, patterns: &[String]) -> ProtocolResult<usize> {
    let mut matches = Vec::<PathBuf>::new();
    for pattern in patterns {
        let paths = glob::glob(pattern)
            .map_err(|err| ProtocolError::InvalidRequest(format!("filter {pattern:?}: {err}")))?;
        for path in paths {
            let path = path.map_err(glob::GlobError::into_error)?;
            if path != sandbox && path.starts_with(sandbox) {
                matches.push(path);
            }
        }
    }
    // Parents sort first; their matched children are then already gone.
    matches.sort();
    matches.dedup();

    let mut deleted = 0;
    for path in &matches {
        let removed = match std::fs::symlink_metadata(path) {
            Ok(meta) if meta.is_dir() => std::fs::remove_dir_all(path),
            Ok(_) => std::fs::remove_file(path),
            Err(err) => Err(err),
        };
        match removed {
            Ok(()) => deleted += 1,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => {
                return Err(ProtocolError::Io(io::Error::new(
                    err.kind(),
                    format!("{}: {err}", path.display()),
                )));
            }
        }
    }
    Ok(deleted)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filters_are_anchored_and_confined() {
        let sandbox = Path::new("/work/box[1]");
        assert_eq!(
            sandbox_pattern(sandbox, "out/*.log").unwrap(),
            "/work/box[[]1[]]/out/*.log"
        );
        assert!(matches!(
            sandbox_pattern(sandbox, "../other/*"),
            Err(ProtocolError::SandboxViolation(_))
        ));
        assert!(matches!(
            sandbox_pattern(sandbox, "."),
            Err(ProtocolError::InvalidRequest(_))
        ));
    }

    #[test]
    fn test_delete_matches_files_and_directories() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        std::fs::write(root.join("a.log"), b"a").unwrap();
        std::fs::write(root.join("b.txt"), b"b").unwrap();
        std::fs::create_dir_all(root.join("build/nested")).unwrap();
        std::fs::write(root.join("build/nested/c.o"), b"c").unwrap();

        let patterns = vec![
            sandbox_pattern(root, "*.log").unwrap(),
            sandbox_pattern(root, "build").unwrap(),
            sandbox_pattern(root, "build/nested/*.o").unwrap(),
            sandbox_pattern(root, "missing").unwrap(),
        ];
        let deleted = delete_matches(root, &patterns).unwrap();

        assert_eq!(deleted, 2);
        assert!(!root.join("a.log").exists());
        assert!(!root.join("build").exists());
        assert!(root.join("b.txt").exists());
    }
}
