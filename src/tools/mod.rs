//! Built-in local tools.
//!
//! These are registered between the subprocess tools and the gateway tools:
//! the workspace upload action first, then the optional code interpreter.

pub mod code_interpreter;
#[cfg(feature = "aws")]
pub mod storage_upload;

use std::path::{Component, Path};

use crate::error::{Result, RuntimeError};

/// Reject paths that escape the workspace root.
///
/// The path must be rooted under `workspace` and free of `..` components;
/// violations are invalid input, never silently rewritten, and are checked
/// before any network call.
pub fn validate_workspace_path(path: &Path, workspace: &Path) -> Result<()> {
    if path
        .components()
        .any(|component| matches!(component, Component::ParentDir))
    {
        return Err(RuntimeError::InvalidInput(format!(
            "{} contains parent-directory traversal",
            path.display()
        )));
    }
    if !path.starts_with(workspace) {
        return Err(RuntimeError::InvalidInput(format!(
            "{} is not a file under the {} workspace directory; files must live under it",
            path.display(),
            workspace.display()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn accepts_workspace_paths() {
        let workspace = PathBuf::from("/tmp/ws");
        assert!(validate_workspace_path(Path::new("/tmp/ws/report.csv"), &workspace).is_ok());
        assert!(
            validate_workspace_path(Path::new("/tmp/ws/nested/chart.png"), &workspace).is_ok()
        );
    }

    #[test]
    fn rejects_paths_outside_the_workspace() {
        let workspace = PathBuf::from("/tmp/ws");
        for path in ["/etc/passwd", "/tmp/other/file", "relative/file"] {
            assert!(matches!(
                validate_workspace_path(Path::new(path), &workspace),
                Err(RuntimeError::InvalidInput(_))
            ));
        }
    }

    #[test]
    fn rejects_traversal() {
        let workspace = PathBuf::from("/tmp/ws");
        assert!(matches!(
            validate_workspace_path(Path::new("/tmp/ws/../etc/passwd"), &workspace),
            Err(RuntimeError::InvalidInput(_))
        ));
    }
}
