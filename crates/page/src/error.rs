/// Errors surfaced by [`crate::device::PageDevice`], [`crate::allocator::PageAllocator`]
/// and [`crate::recycler::PageRecycler`] (spec.md §7).
#[derive(Debug, thiserror::Error)]
pub enum PageError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Log(#[from] llfs_log::LogError),

    #[error("page {0} not found (stale generation or never written)")]
    NotFound(llfs_common::PageId),

    #[error("page corruption: {0}")]
    Corruption(String),

    #[error("allocator exhausted: no free physical pages among {page_count} slots")]
    Exhausted { page_count: u32 },

    #[error("attachment table is full ({capacity} slots in use)")]
    AttachmentTableFull { capacity: usize },

    #[error("unknown client uuid {0}")]
    UnknownClient(uuid::Uuid),

    #[error("applying delta would overflow refcount for {page_id}")]
    Overflow { page_id: llfs_common::PageId },

    #[error("recycler traversal exceeded max depth {max_depth}")]
    DepthExceeded { max_depth: u32 },

    #[error("recycler frame exceeded max branching factor {max_branching_factor}")]
    FanoutExceeded { max_branching_factor: u32 },

    #[error("operation cancelled")]
    Cancelled,

    #[error("component is in a failed state after prior corruption")]
    Poisoned,
}
