//! Capability-set traits for storage backends (spec.md §9 Design Notes).
//!
//! LLFS never hard-codes a backend into `LogDevice`/`PageDevice`. Instead it
//! expresses the minimal capability each needs and lets `llfs-log`/
//! `llfs-page` provide in-memory and plain-file implementations; a future
//! kernel-bypass-async backend could implement the same trait without
//! touching the core.

use async_trait::async_trait;

/// Byte-granular durable-write primitive with a flush barrier, matching the
/// "byte-granular durable-write storage primitive with a flush barrier"
/// assumption in spec.md §1.
#[async_trait]
pub trait LogBackend: Send + Sync {
    /// Read `len` bytes starting at `offset`. The backend is not required to
    /// track any notion of "valid" data past what has been written; callers
    /// are responsible for bounding reads to a durability-appropriate
    /// position.
    async fn read(&self, offset: u64, len: usize) -> std::io::Result<Vec<u8>>;

    /// Write `bytes` starting at `offset`, extending the backend if needed.
    async fn write(&self, offset: u64, bytes: &[u8]) -> std::io::Result<()>;

    /// Request that all writes issued so far be durable before returning.
    async fn flush(&self) -> std::io::Result<()>;

    /// Current physical size in bytes (the high-water mark of bytes ever
    /// written, not the logical log size).
    async fn size(&self) -> std::io::Result<u64>;
}

/// Fixed-size random-access page store capability (spec.md §4.3).
#[async_trait]
pub trait PageBackend: Send + Sync {
    /// Read the full `page_size` bytes at physical slot `index`.
    async fn read(&self, index: u32, page_size: usize) -> std::io::Result<Vec<u8>>;

    /// Overwrite the full contents of physical slot `index`.
    async fn write(&self, index: u32, bytes: &[u8]) -> std::io::Result<()>;

    /// Release any backing storage associated with slot `index`. Idempotent.
    async fn drop_page(&self, index: u32) -> std::io::Result<()>;

    /// Request that all writes issued so far be durable before returning
    /// (spec.md §4.7 commit step 2: "write every new page ... await
    /// Durable flush of all pages").
    async fn flush(&self) -> std::io::Result<()>;

    fn page_size(&self) -> usize;

    fn page_count(&self) -> u32;
}
