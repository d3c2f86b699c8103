//! The anchor-patch primitive every catalog entry compiles down to.
//!
//! A patch is a pure transform over a file's text, gated by idempotency
//! markers and anchored to literal text known to exist in the target file
//! version. The engine reads the file, short-circuits when the markers are
//! already present, runs the transform, and writes the result back
//! atomically. A missing anchor is fatal: it means the target no longer
//! matches the file versions the patch was written against.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// A single named patch against one file, relative to a root directory.
///
/// `markers` is the idempotency gate: when every marker substring is present
/// the patch reports [`PatchOutcome::AlreadyApplied`] without evaluating any
/// anchor. `transform` owns the anchor matching and produces the complete
/// new file content; it never touches the file system.
#[derive(Clone)]
pub struct AnchorPatch {
    pub id: &'static str,
    pub description: &'static str,
    /// Path of the target file, relative to the toolchain or repository root.
    pub relative_path: &'static str,
    /// All of these must be present for the patch to count as applied.
    pub markers: &'static [&'static str],
    pub transform: fn(&str) -> Result<String, TransformError>,
}

impl AnchorPatch {
    /// True when every idempotency marker is present in `content`.
    pub fn is_applied(&self, content: &str) -> bool {
        self.markers.iter().all(|marker| content.contains(marker))
    }

    /// Resolve the target path against `root`.
    pub fn target(&self, root: &Path) -> PathBuf {
        root.join(self.relative_path)
    }
}

impl std::fmt::Debug for AnchorPatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnchorPatch")
            .field("id", &self.id)
            .field("relative_path", &self.relative_path)
            .field("markers", &self.markers)
            .finish()
    }
}

/// Anchor failures raised by transforms. Carries the human-readable anchor
/// label; the engine attaches the file path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransformError {
    Missing { anchor: &'static str },
    Ambiguous { anchor: &'static str, count: usize },
}

#[derive(Error, Debug)]
pub enum PatchError {
    #[error("{}: anchor not found ({anchor})", .path.display())]
    AnchorNotFound { path: PathBuf, anchor: &'static str },

    #[error("{}: anchor matched {count} times, expected 1 ({anchor})", .path.display())]
    AnchorAmbiguous {
        path: PathBuf,
        anchor: &'static str,
        count: usize,
    },

    #[error("failed to read {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to write {}: {source}", .path.display())]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
}

impl PatchError {
    fn from_transform(err: TransformError, path: PathBuf) -> Self {
        match err {
            TransformError::Missing { anchor } => PatchError::AnchorNotFound { path, anchor },
            TransformError::Ambiguous { anchor, count } => PatchError::AnchorAmbiguous {
                path,
                anchor,
                count,
            },
        }
    }
}

/// Result of applying one patch.
#[derive(Debug, Clone, PartialEq, Eq)]
#[must_use = "PatchOutcome should be checked for applied/already-applied"]
pub enum PatchOutcome {
    /// The file was rewritten.
    Applied,
    /// Markers were present, or every conditional sub-edit was already in
    /// place; nothing was written.
    AlreadyApplied,
}

impl PatchOutcome {
    pub fn modified(&self) -> bool {
        matches!(self, PatchOutcome::Applied)
    }
}

/// Read-only status of one patch, as reported by `status`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PatchStatus {
    /// Markers present (or transform is a no-op).
    Applied,
    /// Anchors present; applying would modify the file.
    Pending,
    /// Neither markers nor anchors match the file content.
    Drifted { reason: String },
}

/// Apply `patch` to its target under `root`.
///
/// The new content is computed fully in memory and written atomically
/// (tempfile in the target's directory, fsync, rename), then the mtime is
/// bumped so the Go build cache rebuilds the patched package.
pub fn apply_patch(patch: &AnchorPatch, root: &Path) -> Result<PatchOutcome, PatchError> {
    let path = patch.target(root);
    let content = fs::read_to_string(&path).map_err(|source| PatchError::Read {
        path: path.clone(),
        source,
    })?;

    if patch.is_applied(&content) {
        return Ok(PatchOutcome::AlreadyApplied);
    }

    let new_content = (patch.transform)(&content)
        .map_err(|err| PatchError::from_transform(err, path.clone()))?;

    // Conditional sub-edits can all be present without every marker being
    // checked for; a no-op transform is the other face of idempotency.
    if new_content == content {
        return Ok(PatchOutcome::AlreadyApplied);
    }

    atomic_write(&path, new_content.as_bytes()).map_err(|source| PatchError::Write {
        path: path.clone(),
        source,
    })?;

    let now = filetime::FileTime::now();
    filetime::set_file_mtime(&path, now).map_err(|source| PatchError::Write { path, source })?;

    Ok(PatchOutcome::Applied)
}

/// Evaluate `patch` without writing anything.
pub fn check_patch(patch: &AnchorPatch, root: &Path) -> Result<PatchStatus, PatchError> {
    let path = patch.target(root);
    let content = fs::read_to_string(&path).map_err(|source| PatchError::Read {
        path: path.clone(),
        source,
    })?;

    if patch.is_applied(&content) {
        return Ok(PatchStatus::Applied);
    }

    match (patch.transform)(&content) {
        Ok(new_content) if new_content == content => Ok(PatchStatus::Applied),
        Ok(_) => Ok(PatchStatus::Pending),
        Err(err) => {
            let err = PatchError::from_transform(err, path);
            Ok(PatchStatus::Drifted {
                reason: err.to_string(),
            })
        }
    }
}

/// Atomic file write: tempfile + fsync + rename.
///
/// The tempfile lives in the target's directory so the rename never crosses
/// a filesystem boundary.
fn atomic_write(path: &Path, content: &[u8]) -> Result<(), std::io::Error> {
    let parent = path.parent().ok_or_else(|| {
        std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            "path has no parent directory",
        )
    })?;

    let mut temp = tempfile::NamedTempFile::new_in(parent)?;
    temp.write_all(content)?;
    temp.as_file().sync_all()?;
    temp.persist(path).map_err(|e| e.error)?;

    Ok(())
}

/// Replace the unique occurrence of `needle` with `replacement`.
///
/// Errors if the needle is absent (version drift) or matches more than once
/// (the anchor was chosen to be unique; ambiguity is drift too).
pub fn replace_once(
    content: &str,
    needle: &str,
    replacement: &str,
    anchor: &'static str,
) -> Result<String, TransformError> {
    let mut occurrences = content.match_indices(needle);
    let Some((start, _)) = occurrences.next() else {
        return Err(TransformError::Missing { anchor });
    };
    if occurrences.next().is_some() {
        return Err(TransformError::Ambiguous {
            anchor,
            count: content.matches(needle).count(),
        });
    }

    let mut out = String::with_capacity(content.len() + replacement.len() - needle.len());
    out.push_str(&content[..start]);
    out.push_str(replacement);
    out.push_str(&content[start + needle.len()..]);
    Ok(out)
}

/// Insert `insertion` immediately after the unique occurrence of `needle`.
pub fn insert_after(
    content: &str,
    needle: &str,
    insertion: &str,
    anchor: &'static str,
) -> Result<String, TransformError> {
    let combined = format!("{needle}{insertion}");
    replace_once(content, needle, &combined, anchor)
}

/// Conditional sub-edit: replace the first occurrence of `needle`, or leave
/// the content untouched when the needle is absent. Used by patches whose
/// sub-edits are individually optional and backstopped by the validator.
pub fn replace_if_present(content: &str, needle: &str, replacement: &str) -> Option<String> {
    let start = content.find(needle)?;
    let mut out = String::with_capacity(content.len() + replacement.len() - needle.len());
    out.push_str(&content[..start]);
    out.push_str(replacement);
    out.push_str(&content[start + needle.len()..]);
    Some(out)
}

/// Conditional sub-edit: insert a full line after the line containing
/// `marker`. Returns `None` when no line contains the marker.
pub fn insert_line_after(content: &str, marker: &str, new_line: &str) -> Option<String> {
    let marker_pos = content.find(marker)?;
    let (line_end, newline_missing) = match content[marker_pos..].find('\n') {
        Some(offset) => (marker_pos + offset + 1, false),
        None => (content.len(), true),
    };

    let mut out = String::with_capacity(content.len() + new_line.len() + 2);
    out.push_str(&content[..line_end]);
    if newline_missing {
        out.push('\n');
    }
    out.push_str(new_line);
    out.push('\n');
    out.push_str(&content[line_end..]);
    Some(out)
}
