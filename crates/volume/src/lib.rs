//! Atomic multi-page, multi-device transactions over a volume log
//! (spec.md §4.7: "PageCacheJob / Volume").

mod error;
mod job;
mod record;
mod volume;

pub use error::VolumeError;
pub use job::Job;
pub use volume::{Volume, VolumeConfig};
