//! ESXi Patcher: idempotent source patching for Go-on-ESXi deployments
//!
//! ESXi's Linux personality ships an incomplete epoll implementation, and
//! restricted process namespaces break the client's `/proc/self/exe`
//! re-exec. This crate applies a fixed, ordered catalog of textual patches
//! to a Go toolchain checkout (epoll workarounds) and optionally to the
//! client repository (explicit self-path resolution), then validates the
//! repository end state.
//!
//! # Architecture
//!
//! Every catalog entry is an [`AnchorPatch`]: idempotency markers checked
//! first, then literal/regex anchor matching, then a full-content rewrite
//! written atomically. Intelligence lives in the catalog's anchor and
//! replacement payloads, not in the application logic.
//!
//! # Safety
//!
//! - Idempotency markers gate every transform; re-runs are no-ops
//! - A missing anchor aborts the whole run (toolchain-version drift)
//! - Atomic file writes (tempfile + fsync + rename)
//! - Root containment checks on every target path
//!
//! # Example
//!
//! ```no_run
//! use esxi_patcher::runner::{run, RunOptions};
//! use std::path::PathBuf;
//!
//! let options = RunOptions {
//!     goroot: Some(PathBuf::from("/usr/local/go")),
//!     ..RunOptions::default()
//! };
//!
//! match run(&options) {
//!     Ok(report) => println!("patched {} toolchain files", report.toolchain.len()),
//!     Err(e) => eprintln!("patching failed: {e}"),
//! }
//! ```

pub mod catalog;
pub mod patch;
pub mod resolve;
pub mod runner;
pub mod safety;
pub mod selfpath;
pub mod validate;

// Re-exports
pub use patch::{
    apply_patch, check_patch, AnchorPatch, PatchError, PatchOutcome, PatchStatus, TransformError,
};
pub use resolve::{resolve_goroot, ResolveError};
pub use runner::{
    check, run, CheckReport, PatchCheck, PatchReport, RunError, RunOptions, RunReport,
};
pub use safety::{RootGuard, SafetyError};
pub use validate::{validate_repo, MarkerCheck, ValidationError, ValidationIssue};
