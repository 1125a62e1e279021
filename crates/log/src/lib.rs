//! Bounded sliding-window append log: [`LogDevice`], its readers, and the
//! on-disk slot format. Generalizes the teacher's `wal` crate from a
//! single-purpose redo log into the reusable building block every LLFS
//! component layers its own durability on top of.

mod backend;
mod device;
mod error;
mod reader;
mod slot;

pub use backend::{FileLogBackend, InMemoryLogBackend};
pub use device::{LogDevice, LogDeviceConfig, LogReadMode, PositionKind, SlotReadLock, SlotRange};
pub use error::LogError;
pub use reader::{LogReader, ReadResult};
pub use slot::{padded_slot_len, SLOT_HEADER_SIZE};
