//! Post-apply validation of the repository patches.
//!
//! Validation checks end state, not this run's delta: every expected marker
//! must be present in its file regardless of whether the current run
//! modified anything. All findings are aggregated into a single report so
//! one pass shows the complete picture.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use crate::catalog::repo;

/// One expected (file, marker) pair.
#[derive(Debug, Clone, Copy)]
pub struct MarkerCheck {
    pub relative_path: &'static str,
    pub marker: &'static str,
}

/// Every marker the repository patches must leave behind.
pub const REPO_CHECKS: [MarkerCheck; 8] = [
    MarkerCheck {
        relative_path: repo::CLIENT_FILE,
        marker: "SelfPath",
    },
    MarkerCheck {
        relative_path: repo::MAIN_FILE,
        marker: "--self-path",
    },
    MarkerCheck {
        relative_path: repo::DETACH_FILE,
        marker: "selfExecCandidates",
    },
    MarkerCheck {
        relative_path: repo::DETACH_FILE,
        marker: "normalizeSelfPath",
    },
    MarkerCheck {
        relative_path: repo::DETACH_FILE,
        marker: "isProcPath",
    },
    MarkerCheck {
        relative_path: repo::LINK_FILE,
        marker: "self-path",
    },
    MarkerCheck {
        relative_path: repo::BUILDMANAGER_FILE,
        marker: "main.selfPath",
    },
    MarkerCheck {
        relative_path: repo::BUILDMANAGER_FILE,
        marker: "SelfPath",
    },
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationIssue {
    MissingFile { path: PathBuf },
    MissingMarker { path: PathBuf, marker: &'static str },
}

impl fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValidationIssue::MissingFile { path } => {
                write!(f, "{} does not exist", path.display())
            }
            ValidationIssue::MissingMarker { path, marker } => {
                write!(f, "{} missing {}", path.display(), marker)
            }
        }
    }
}

/// Aggregated validation failure: every missing file or marker, not just
/// the first.
#[derive(Debug, Clone)]
pub struct ValidationError {
    pub issues: Vec<ValidationIssue>,
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "repo missing self-path/forking patch:")?;
        for issue in &self.issues {
            write!(f, "\n- {issue}")?;
        }
        Ok(())
    }
}

impl std::error::Error for ValidationError {}

/// Re-read the five repository files and assert every expected marker.
pub fn validate_repo(repo_root: &Path) -> Result<(), ValidationError> {
    let mut issues = Vec::new();

    for check in REPO_CHECKS {
        let path = repo_root.join(check.relative_path);
        let content = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(_) => {
                issues.push(ValidationIssue::MissingFile { path });
                continue;
            }
        };

        if !content.contains(check.marker) {
            issues.push(ValidationIssue::MissingMarker {
                path,
                marker: check.marker,
            });
        }
    }

    if issues.is_empty() {
        Ok(())
    } else {
        Err(ValidationError { issues })
    }
}
