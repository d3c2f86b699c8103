use std::path::{Path, PathBuf};
use thiserror::Error;

/// Containment check so a patch never writes outside its declared tree.
///
/// Catalog paths are fixed relative constants, but the roots they are
/// joined to come from flags, the environment, or a subprocess; a symlink
/// inside either tree could otherwise redirect a write elsewhere.
#[derive(Debug, Clone)]
pub struct RootGuard {
    /// Canonicalized root directory.
    root: PathBuf,
}

#[derive(Error, Debug)]
pub enum SafetyError {
    #[error("{} resolves outside {}", .path.display(), .root.display())]
    OutsideRoot { path: PathBuf, root: PathBuf },

    #[error("failed to resolve {}: {source}", .path.display())]
    Canonicalize {
        path: PathBuf,
        source: std::io::Error,
    },
}

impl RootGuard {
    /// Create a guard for `root`, canonicalizing it so symlinked roots
    /// compare correctly.
    pub fn new(root: impl AsRef<Path>) -> Result<Self, SafetyError> {
        let root = root.as_ref();
        let root = root.canonicalize().map_err(|source| SafetyError::Canonicalize {
            path: root.to_path_buf(),
            source,
        })?;
        Ok(Self { root })
    }

    /// Check that `relative` resolves inside the root. Returns the
    /// canonical absolute path.
    pub fn validate(&self, relative: &str) -> Result<PathBuf, SafetyError> {
        let joined = self.root.join(relative);
        let canonical = joined
            .canonicalize()
            .map_err(|source| SafetyError::Canonicalize {
                path: joined.clone(),
                source,
            })?;

        if !canonical.starts_with(&self.root) {
            return Err(SafetyError::OutsideRoot {
                path: canonical,
                root: self.root.clone(),
            });
        }

        Ok(canonical)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn path_inside_root_is_accepted() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("src/runtime")).unwrap();
        fs::write(dir.path().join("src/runtime/netpoll_epoll.go"), b"").unwrap();

        let guard = RootGuard::new(dir.path()).unwrap();
        assert!(guard.validate("src/runtime/netpoll_epoll.go").is_ok());
    }

    #[test]
    fn missing_path_is_a_canonicalize_error() {
        let dir = tempfile::tempdir().unwrap();
        let guard = RootGuard::new(dir.path()).unwrap();
        let err = guard.validate("src/absent.go").unwrap_err();
        assert!(matches!(err, SafetyError::Canonicalize { .. }));
    }

    #[test]
    #[cfg(unix)]
    fn symlink_escape_is_rejected() {
        use std::os::unix::fs::symlink;

        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("root");
        fs::create_dir_all(&root).unwrap();

        let outside = dir.path().join("outside.go");
        fs::write(&outside, b"").unwrap();
        symlink(&outside, root.join("escape.go")).unwrap();

        let guard = RootGuard::new(&root).unwrap();
        let err = guard.validate("escape.go").unwrap_err();
        assert!(matches!(err, SafetyError::OutsideRoot { .. }));
    }
}
