/// Errors surfaced by [`crate::Volume`] and [`crate::Job`] (spec.md §7).
#[derive(Debug, thiserror::Error)]
pub enum VolumeError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Log(#[from] llfs_log::LogError),

    #[error(transparent)]
    Page(#[from] llfs_page::PageError),

    #[error("unknown device index {0}")]
    UnknownDevice(u8),

    #[error("volume log corruption: {0}")]
    Corruption(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("job already committed")]
    AlreadyCommitted,
}
