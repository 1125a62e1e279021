/// Errors a [`crate::LogDevice`] can return (spec.md §7).
#[derive(Debug, thiserror::Error)]
pub enum LogError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("log corruption: {0}")]
    Corruption(String),

    #[error("append of {requested} bytes exceeds free space ({free} of {capacity} bytes)")]
    NoSpace {
        requested: u64,
        free: u64,
        capacity: u64,
    },

    #[error("trim to {requested} would cross a held SlotReadLock covering [{lo}, {hi})")]
    TrimBlocked { requested: u64, lo: u64, hi: u64 },

    #[error("trim target {requested} exceeds flush_pos {flush_pos}")]
    TrimBeyondFlush { requested: u64, flush_pos: u64 },

    #[error("commit range [{lo}, {hi}) is not the next in-order reservation (expected start {expected})")]
    OutOfOrderCommit { lo: u64, hi: u64, expected: u64 },

    #[error("operation cancelled")]
    Cancelled,

    #[error("log device is in a failed state after prior corruption")]
    Poisoned,
}
