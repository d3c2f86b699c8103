//! Orchestration: resolve the toolchain root, apply the catalog in order,
//! and validate the repository end state.
//!
//! All configuration arrives through [`RunOptions`]; nothing here reads the
//! process environment or arguments, so runs are reproducible under test
//! with injected roots.

use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;

use crate::catalog;
use crate::patch::{apply_patch, check_patch, AnchorPatch, PatchError, PatchOutcome, PatchStatus};
use crate::resolve::{resolve_goroot, ResolveError, DEFAULT_INTROSPECT_TIMEOUT};
use crate::safety::{RootGuard, SafetyError};
use crate::validate::{validate_repo, ValidationError};

/// Explicit configuration for one run.
#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Explicit toolchain root; wins over everything else.
    pub goroot: Option<PathBuf>,
    /// Repository root; when absent only toolchain patches run.
    pub repo: Option<PathBuf>,
    /// The `GOROOT` environment value, read once by the caller.
    pub goroot_env: Option<String>,
    /// Binary to invoke for `go env GOROOT`.
    pub go_binary: PathBuf,
    /// Deadline for the introspection subprocess.
    pub introspect_timeout: Duration,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            goroot: None,
            repo: None,
            goroot_env: None,
            go_binary: PathBuf::from("go"),
            introspect_timeout: DEFAULT_INTROSPECT_TIMEOUT,
        }
    }
}

/// Per-patch outcome of an apply run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatchReport {
    pub id: &'static str,
    pub path: PathBuf,
    pub outcome: PatchOutcome,
}

/// Per-patch result of a read-only status check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatchCheck {
    pub id: &'static str,
    pub path: PathBuf,
    pub status: PatchStatus,
}

/// Everything an apply run did, grouped for reporting.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub goroot: PathBuf,
    pub toolchain: Vec<PatchReport>,
    /// Present only when repository patching was requested.
    pub repository: Option<Vec<PatchReport>>,
}

impl RunReport {
    /// Paths actually modified in `group`, in application order.
    pub fn modified(group: &[PatchReport]) -> Vec<&Path> {
        group
            .iter()
            .filter(|report| report.outcome.modified())
            .map(|report| report.path.as_path())
            .collect()
    }
}

/// Read-only counterpart of [`RunReport`].
#[derive(Debug, Clone)]
pub struct CheckReport {
    pub goroot: PathBuf,
    pub toolchain: Vec<PatchCheck>,
    pub repository: Option<Vec<PatchCheck>>,
}

#[derive(Error, Debug)]
pub enum RunError {
    #[error(transparent)]
    Resolve(#[from] ResolveError),

    #[error(transparent)]
    Safety(#[from] SafetyError),

    #[error("{} does not exist", .0.display())]
    MissingFile(PathBuf),

    #[error(transparent)]
    Patch(#[from] PatchError),

    #[error(transparent)]
    Validation(#[from] ValidationError),
}

/// Apply the full catalog: toolchain patches, then repository patches and
/// validation when a repository root was given.
pub fn run(options: &RunOptions) -> Result<RunReport, RunError> {
    let goroot = resolve_goroot(
        options.goroot.as_deref(),
        options.goroot_env.as_deref(),
        &options.go_binary,
        options.introspect_timeout,
    )?;

    let toolchain = apply_group(&goroot, catalog::toolchain_patches())?;

    let repository = match &options.repo {
        Some(repo_root) => {
            let reports = apply_group(repo_root, catalog::repo_patches())?;
            // End-state check, deliberately unconditional: a repo left
            // half-patched by some other tool must fail even when this run
            // modified nothing.
            validate_repo(repo_root)?;
            Some(reports)
        }
        None => None,
    };

    Ok(RunReport {
        goroot,
        toolchain,
        repository,
    })
}

/// Evaluate the full catalog without writing anything.
pub fn check(options: &RunOptions) -> Result<CheckReport, RunError> {
    let goroot = resolve_goroot(
        options.goroot.as_deref(),
        options.goroot_env.as_deref(),
        &options.go_binary,
        options.introspect_timeout,
    )?;

    let toolchain = check_group(&goroot, catalog::toolchain_patches())?;

    let repository = match &options.repo {
        Some(repo_root) => Some(check_group(repo_root, catalog::repo_patches())?),
        None => None,
    };

    Ok(CheckReport {
        goroot,
        toolchain,
        repository,
    })
}

/// Verify every target exists (failing fast on the first missing path) and
/// stays inside the root, then apply the group's patches in order.
fn apply_group(root: &Path, patches: &[AnchorPatch]) -> Result<Vec<PatchReport>, RunError> {
    verify_targets(root, patches)?;

    let mut reports = Vec::with_capacity(patches.len());
    for patch in patches {
        let outcome = apply_patch(patch, root)?;
        reports.push(PatchReport {
            id: patch.id,
            path: patch.target(root),
            outcome,
        });
    }
    Ok(reports)
}

fn check_group(root: &Path, patches: &[AnchorPatch]) -> Result<Vec<PatchCheck>, RunError> {
    verify_targets(root, patches)?;

    let mut checks = Vec::with_capacity(patches.len());
    for patch in patches {
        let status = check_patch(patch, root)?;
        checks.push(PatchCheck {
            id: patch.id,
            path: patch.target(root),
            status,
        });
    }
    Ok(checks)
}

fn verify_targets(root: &Path, patches: &[AnchorPatch]) -> Result<(), RunError> {
    let guard = RootGuard::new(root)?;
    for patch in patches {
        let path = patch.target(root);
        if !path.exists() {
            return Err(RunError::MissingFile(path));
        }
        guard.validate(patch.relative_path)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::toolchain;
    use std::fs;

    const DEFS_FIXTURE: &str = concat!(
        "package syscall\n",
        "\n",
        "const (\n",
        "\tSYS_EPOLL_CTL     = 233\n",
        "\tSYS_EPOLL_PWAIT   = 281\n",
        ")\n",
    );

    const SYSCALL_FIXTURE: &str = concat!(
        "package syscall\n",
        "\n",
        "func EpollWait(epfd int32, ev *EpollEvent, maxev, waitms int32) (int32, uintptr) {\n",
        "\tr1, _, e := Syscall6(SYS_EPOLL_PWAIT, uintptr(epfd), uintptr(ev), ",
        "uintptr(maxev), uintptr(waitms), 0, 0)\n",
        "\treturn int32(r1), e\n",
        "}\n",
    );

    const NETPOLL_FIXTURE: &str = concat!(
        "package runtime\n",
        "\n",
        "func netpollopen(fd uintptr, pd *pollDesc) uintptr {\n",
        "\treturn syscall.EpollCtl(epfd, syscall.EPOLL_CTL_ADD, int32(fd), &ev)\n",
        "}\n",
    );

    fn fixture_goroot() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        for (relative, content) in [
            (toolchain::DEFS_FILE, DEFS_FIXTURE),
            (toolchain::SYSCALL_FILE, SYSCALL_FIXTURE),
            (toolchain::NETPOLL_FILE, NETPOLL_FIXTURE),
        ] {
            let path = dir.path().join(relative);
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(path, content).unwrap();
        }
        dir
    }

    fn options_for(goroot: &Path) -> RunOptions {
        RunOptions {
            goroot: Some(goroot.to_path_buf()),
            ..RunOptions::default()
        }
    }

    #[test]
    fn toolchain_run_applies_then_reports_idempotent() {
        let goroot = fixture_goroot();
        let options = options_for(goroot.path());

        let report = run(&options).unwrap();
        assert!(report.repository.is_none());
        assert_eq!(report.toolchain.len(), 3);
        assert!(report
            .toolchain
            .iter()
            .all(|patch| patch.outcome == PatchOutcome::Applied));

        let modified = RunReport::modified(&report.toolchain);
        assert_eq!(modified.len(), 3);

        let report = run(&options).unwrap();
        assert!(report
            .toolchain
            .iter()
            .all(|patch| patch.outcome == PatchOutcome::AlreadyApplied));
        assert!(RunReport::modified(&report.toolchain).is_empty());
    }

    #[test]
    fn missing_target_fails_fast_naming_the_path() {
        let goroot = fixture_goroot();
        fs::remove_file(goroot.path().join(toolchain::NETPOLL_FILE)).unwrap();

        let err = run(&options_for(goroot.path())).unwrap_err();
        match err {
            RunError::MissingFile(path) => assert!(path.ends_with(toolchain::NETPOLL_FILE)),
            other => panic!("expected MissingFile, got {other:?}"),
        }

        // Fail-fast: the files before the missing one were not touched.
        let defs = fs::read_to_string(goroot.path().join(toolchain::DEFS_FILE)).unwrap();
        assert_eq!(defs, DEFS_FIXTURE);
    }

    #[test]
    fn unresolvable_goroot_surfaces_the_resolution_error() {
        let options = RunOptions {
            go_binary: PathBuf::from("go-binary-that-does-not-exist"),
            ..RunOptions::default()
        };

        let err = run(&options).unwrap_err();
        assert!(matches!(err, RunError::Resolve(ResolveError::BinaryMissing)));
    }

    #[test]
    fn check_is_read_only() {
        let goroot = fixture_goroot();
        let options = options_for(goroot.path());

        let report = check(&options).unwrap();
        assert!(report
            .toolchain
            .iter()
            .all(|patch| patch.status == PatchStatus::Pending));

        // Nothing was written.
        let defs = fs::read_to_string(goroot.path().join(toolchain::DEFS_FILE)).unwrap();
        assert_eq!(defs, DEFS_FIXTURE);

        let _ = run(&options).unwrap();
        let report = check(&options).unwrap();
        assert!(report
            .toolchain
            .iter()
            .all(|patch| patch.status == PatchStatus::Applied));
    }
}
