//! The ordered catalog of patch operations.
//!
//! Each entry embeds the literal anchor and replacement text it must
//! produce, targeting one file under the toolchain or repository root. The
//! entries are plain [`AnchorPatch`](crate::patch::AnchorPatch) values so
//! every patch is unit-testable on its own.

pub mod repo;
pub mod toolchain;

use crate::patch::AnchorPatch;

/// The three toolchain patches, in application order.
pub fn toolchain_patches() -> &'static [AnchorPatch] {
    &toolchain::PATCHES
}

/// The five repository patches, in application order.
pub fn repo_patches() -> &'static [AnchorPatch] {
    &repo::PATCHES
}
