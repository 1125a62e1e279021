//! Shared types and storage-backend traits for LLFS.
//!
//! This crate has no I/O of its own: it defines the data model
//! ([`PageId`], offsets) and the two capability-set traits ([`LogBackend`],
//! [`PageBackend`]) that `llfs-log` and `llfs-page` drive. Concrete backends
//! (in-memory, plain file) live in the crates that use them, keeping this
//! crate dependency-free beyond error/serde/checksum plumbing.

pub mod backend;
pub mod checksum;
pub mod manifest;
pub mod page_id;

pub use backend::{LogBackend, PageBackend};
pub use manifest::{ManifestPath, TrimManifest};
pub use page_id::PageId;

/// A byte offset into a log's unbounded virtual address space.
pub type Offset = u64;

/// A 0-based physical slot index within a [`PageBackend`].
pub type PhysicalIndex = u32;

/// Per-physical-index rewrite counter, packed into the low 24 bits of a
/// [`PageId`].
pub type Generation = u32;

/// Smallest page size this system will address (spec.md §3).
pub const MIN_PAGE_SIZE: usize = 512;
