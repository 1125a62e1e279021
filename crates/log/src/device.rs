use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use llfs_common::{LogBackend, Offset};
use tokio::sync::{watch, Mutex};
use tracing::{debug, instrument, trace};

use crate::error::LogError;
use crate::slot::{self, padded_slot_len, SLOT_HEADER_SIZE};

/// Configuration for a [`LogDevice`] (spec.md §3: "created via a config
/// struct with fixed capacity").
#[derive(Debug, Clone, Copy)]
pub struct LogDeviceConfig {
    /// Maximum active-window size `C`: `commit_pos - trim_pos <= C` always.
    pub capacity: u64,
}

/// A `[lo, hi)` byte range within a log's active window, naming exactly one
/// slot or a contiguous run reserved for one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotRange {
    pub lo: Offset,
    pub hi: Offset,
}

impl SlotRange {
    pub fn len(&self) -> u64 {
        self.hi - self.lo
    }

    pub fn is_empty(&self) -> bool {
        self.hi == self.lo
    }
}

/// Durability level a [`crate::reader::LogReader`] observes (spec.md §4.1),
/// ordered weak → strong.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogReadMode {
    /// May or may not see committed data — bounded only by physically
    /// written bytes.
    Inconsistent,
    /// Sees everything up to `commit_pos`.
    Speculative,
    /// Sees everything up to `flush_pos`.
    Durable,
}

/// Which monotone pointer [`LogDevice::await_position`] waits on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PositionKind {
    Trim,
    Commit,
    Flush,
}

struct HeldLock {
    id: u64,
    lo: Offset,
    hi: Offset,
}

struct LogState {
    trim_pos: Offset,
    /// End of the committed (readable-at-Speculative) region.
    commit_pos: Offset,
    /// End of the durable (readable-at-Durable) region.
    flush_pos: Offset,
    /// End of the physically-written-but-maybe-uncommitted region; always
    /// `>= commit_pos`.
    reserved_pos: Offset,
    held_locks: Vec<HeldLock>,
    /// Set on a detected [`LogError::Corruption`]; once poisoned the device
    /// refuses further operations (spec.md §7: "Corruption is fatal to the
    /// affected component").
    poisoned: bool,
}

struct Shared {
    backend: Box<dyn LogBackend>,
    capacity: u64,
    state: Mutex<LogState>,
    /// Serializes the reserve+write+commit sequence inside [`LogDevice::append`].
    /// `reserve` alone is totally ordered by `state`'s lock, but two
    /// concurrent appends can reserve disjoint ranges and then race to
    /// `commit` them out of order (`commit` requires `range.lo ==
    /// commit_pos`). Holding this across one append's full reserve/write/
    /// commit makes appends atomic with respect to each other, matching
    /// spec.md's "appends are totally ordered" contract.
    append_lock: Mutex<()>,
    next_lock_id: AtomicU64,
    trim_tx: watch::Sender<Offset>,
    commit_tx: watch::Sender<Offset>,
    flush_tx: watch::Sender<Offset>,
}

/// Bounded sliding-window append log (spec.md §4.1).
///
/// Cloning a `LogDevice` clones a cheap `Arc` handle; the clones share the
/// same underlying state and backend, matching the spec's "LogDevice object
/// is safe for concurrent use" contract.
#[derive(Clone)]
pub struct LogDevice(Arc<Shared>);

impl LogDevice {
    /// Create a fresh, empty log device over `backend`.
    pub fn create(backend: Box<dyn LogBackend>, config: LogDeviceConfig) -> Self {
        let (trim_tx, _) = watch::channel(0);
        let (commit_tx, _) = watch::channel(0);
        let (flush_tx, _) = watch::channel(0);
        LogDevice(Arc::new(Shared {
            backend,
            capacity: config.capacity,
            state: Mutex::new(LogState {
                trim_pos: 0,
                commit_pos: 0,
                flush_pos: 0,
                reserved_pos: 0,
                held_locks: Vec::new(),
                poisoned: false,
            }),
            append_lock: Mutex::new(()),
            next_lock_id: AtomicU64::new(1),
            trim_tx,
            commit_tx,
            flush_tx,
        }))
    }

    /// Recover a log device by scanning from `trim_hint` (the last durably
    /// recorded trim position, owned by this log's client — see
    /// SPEC_FULL.md §4.1) forward, validating slots until the first
    /// incomplete or corrupt one. `commit_pos` regresses to the recovered
    /// `flush_pos`, matching the spec's crash-recovery invariant.
    #[instrument(skip(backend))]
    pub async fn recover(
        backend: Box<dyn LogBackend>,
        config: LogDeviceConfig,
        trim_hint: Offset,
    ) -> Result<Self, LogError> {
        let size = backend.size().await?;
        let mut pos = trim_hint;
        while pos + SLOT_HEADER_SIZE as u64 <= size {
            let header_bytes = backend.read(pos, SLOT_HEADER_SIZE).await?;
            let header_arr: [u8; SLOT_HEADER_SIZE] = header_bytes.as_slice().try_into().unwrap();
            let header = slot::decode_header(&header_arr);
            let slot_len = padded_slot_len(header.payload_len as usize) as u64;
            if pos + slot_len > size {
                break; // truncated tail: last write never completed
            }
            let payload = backend
                .read(pos + SLOT_HEADER_SIZE as u64, header.payload_len as usize)
                .await?;
            if !slot::verify_checksum(&header, &payload) {
                break; // torn/corrupt tail write
            }
            pos += slot_len;
        }
        debug!(trim_hint, recovered_flush_pos = pos, "log device recovered");

        let (trim_tx, _) = watch::channel(trim_hint);
        let (commit_tx, _) = watch::channel(pos);
        let (flush_tx, _) = watch::channel(pos);
        Ok(LogDevice(Arc::new(Shared {
            backend,
            capacity: config.capacity,
            state: Mutex::new(LogState {
                trim_pos: trim_hint,
                commit_pos: pos,
                flush_pos: pos,
                reserved_pos: pos,
                held_locks: Vec::new(),
                poisoned: false,
            }),
            append_lock: Mutex::new(()),
            next_lock_id: AtomicU64::new(1),
            trim_tx,
            commit_tx,
            flush_tx,
        })))
    }

    async fn check_poisoned(&self) -> Result<(), LogError> {
        if self.0.state.lock().await.poisoned {
            Err(LogError::Poisoned)
        } else {
            Ok(())
        }
    }

    /// Reserve `len` physical bytes past the current reservation high-water
    /// mark without writing or committing. Returns the reserved range.
    pub async fn reserve(&self, len: u64) -> Result<SlotRange, LogError> {
        self.check_poisoned().await?;
        let mut state = self.0.state.lock().await;
        let used = state.reserved_pos - state.trim_pos;
        let free = self.0.capacity.saturating_sub(used);
        if len > free {
            return Err(LogError::NoSpace {
                requested: len,
                free,
                capacity: self.0.capacity,
            });
        }
        let lo = state.reserved_pos;
        let hi = lo + len;
        state.reserved_pos = hi;
        Ok(SlotRange { lo, hi })
    }

    /// Write bytes into a range previously returned by [`Self::reserve`].
    pub async fn write_reserved(&self, range: SlotRange, bytes: &[u8]) -> Result<(), LogError> {
        self.check_poisoned().await?;
        debug_assert_eq!(bytes.len() as u64, range.len());
        self.0.backend.write(range.lo, bytes).await?;
        Ok(())
    }

    /// Promote a previously reserved-but-uncommitted range, advancing
    /// `commit_pos`. Ranges must be committed in order.
    pub async fn commit(&self, range: SlotRange) -> Result<(), LogError> {
        self.check_poisoned().await?;
        let mut state = self.0.state.lock().await;
        if range.lo != state.commit_pos {
            return Err(LogError::OutOfOrderCommit {
                lo: range.lo,
                hi: range.hi,
                expected: state.commit_pos,
            });
        }
        state.commit_pos = range.hi;
        let _ = self.0.commit_tx.send(state.commit_pos);
        Ok(())
    }

    /// Encode `payload` as a slot, reserve space for it, write it, and
    /// commit — the fused reserve+write+commit path spec.md §4.1 allows.
    /// Readers never observe a partial record: the commit only advances
    /// `commit_pos` after the full encoded slot is written to the backend.
    /// Holds `append_lock` for the whole sequence so concurrent callers
    /// commit in the same order they reserved, rather than racing to commit
    /// out of order and spuriously failing each other.
    #[instrument(skip(self, payload), fields(len = payload.len()))]
    pub async fn append(&self, payload: &[u8]) -> Result<SlotRange, LogError> {
        let _append_guard = self.0.append_lock.lock().await;
        let encoded = slot::encode_slot(payload);
        let range = self.reserve(encoded.len() as u64).await?;
        self.write_reserved(range, &encoded).await?;
        self.commit(range).await?;
        trace!(lo = range.lo, hi = range.hi, "appended slot");
        Ok(range)
    }

    /// Request that `flush_pos` catch up to the `commit_pos` observed at
    /// call time. Returns once the backend acknowledges the flush.
    pub async fn flush_barrier(&self) -> Result<(), LogError> {
        self.check_poisoned().await?;
        let target = { self.0.state.lock().await.commit_pos };
        self.0.backend.flush().await?;
        let mut state = self.0.state.lock().await;
        if target > state.flush_pos {
            state.flush_pos = target;
            let _ = self.0.flush_tx.send(state.flush_pos);
        }
        Ok(())
    }

    /// Advance `trim_pos`. O(1); no I/O. Requires `new_trim_pos <=
    /// flush_pos` and that no held [`SlotReadLock`] covers a range that
    /// would fall below the new trim point.
    pub async fn trim(&self, new_trim_pos: Offset) -> Result<(), LogError> {
        self.check_poisoned().await?;
        let mut state = self.0.state.lock().await;
        if new_trim_pos > state.flush_pos {
            return Err(LogError::TrimBeyondFlush {
                requested: new_trim_pos,
                flush_pos: state.flush_pos,
            });
        }
        if let Some(blocker) = state.held_locks.iter().find(|l| l.lo < new_trim_pos) {
            return Err(LogError::TrimBlocked {
                requested: new_trim_pos,
                lo: blocker.lo,
                hi: blocker.hi,
            });
        }
        state.trim_pos = new_trim_pos;
        let _ = self.0.trim_tx.send(new_trim_pos);
        Ok(())
    }

    /// Resolve once the named pointer reaches (or has already reached)
    /// `offset`.
    pub async fn await_position(&self, kind: PositionKind, offset: Offset) -> Result<(), LogError> {
        let mut rx = match kind {
            PositionKind::Trim => self.0.trim_tx.subscribe(),
            PositionKind::Commit => self.0.commit_tx.subscribe(),
            PositionKind::Flush => self.0.flush_tx.subscribe(),
        };
        if *rx.borrow() >= offset {
            return Ok(());
        }
        loop {
            rx.changed()
                .await
                .map_err(|_| LogError::Cancelled)?;
            if *rx.borrow() >= offset {
                return Ok(());
            }
        }
    }

    /// Construct a [`crate::reader::LogReader`] bound to `mode`, starting at
    /// the current `trim_pos`.
    pub async fn new_reader(&self, mode: LogReadMode) -> crate::reader::LogReader {
        let start = self.0.state.lock().await.trim_pos;
        crate::reader::LogReader::new(self.clone(), mode, start)
    }

    /// Pin `[lo, hi)` against trim, returning a guard that un-pins on drop.
    pub async fn pin_slot(&self, lo: Offset, hi: Offset) -> SlotReadLock {
        let id = self.0.next_lock_id.fetch_add(1, Ordering::Relaxed);
        let mut state = self.0.state.lock().await;
        state.held_locks.push(HeldLock { id, lo, hi });
        SlotReadLock {
            shared: self.0.clone(),
            id,
            lo,
            hi,
        }
    }

    /// Snapshot of `(trim_pos, commit_pos, flush_pos)`.
    pub async fn positions(&self) -> (Offset, Offset, Offset) {
        let state = self.0.state.lock().await;
        (state.trim_pos, state.commit_pos, state.flush_pos)
    }

    pub fn capacity(&self) -> u64 {
        self.0.capacity
    }

    /// Mark this device as failed after detected corruption; all further
    /// operations return [`LogError::Poisoned`] until the process restarts
    /// and a fresh device is recovered (spec.md §7).
    pub async fn poison(&self) {
        self.0.state.lock().await.poisoned = true;
    }

    pub(crate) async fn visible_bound(&self, mode: LogReadMode) -> Offset {
        let state = self.0.state.lock().await;
        match mode {
            LogReadMode::Inconsistent => state.reserved_pos,
            LogReadMode::Speculative => state.commit_pos,
            LogReadMode::Durable => state.flush_pos,
        }
    }

    pub(crate) async fn read_raw(&self, offset: Offset, len: usize) -> Result<Vec<u8>, LogError> {
        Ok(self.0.backend.read(offset, len).await?)
    }
}

/// Reference-counted handle pinning `[lo, hi)` against trim (spec.md §4.2).
/// Release happens on drop, guaranteeing cleanup on every exit path
/// including panics and cancellation (spec.md §9).
pub struct SlotReadLock {
    shared: Arc<Shared>,
    id: u64,
    lo: Offset,
    hi: Offset,
}

impl SlotReadLock {
    pub fn range(&self) -> (Offset, Offset) {
        (self.lo, self.hi)
    }
}

impl Drop for SlotReadLock {
    fn drop(&mut self) {
        let shared = self.shared.clone();
        let id = self.id;
        // `state` is a tokio::sync::Mutex; try_lock is sufficient here since
        // drop cannot be async. A lock held across a drop would imply a
        // concurrent trim/pin racing this exact instant, which under the
        // single-logical-serialization-point model resolves by spinning the
        // blocking lock on a short-lived background task instead of
        // panicking in drop.
        if let Ok(mut state) = shared.state.try_lock() {
            state.held_locks.retain(|l| l.id != id);
        } else {
            tokio::spawn(async move {
                shared.state.lock().await.held_locks.retain(|l| l.id != id);
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::InMemoryLogBackend;

    fn device(capacity: u64) -> LogDevice {
        LogDevice::create(Box::new(InMemoryLogBackend::new()), LogDeviceConfig { capacity })
    }

    #[tokio::test]
    async fn append_commit_flush_order() {
        let log = device(4096);
        let r1 = log.append(b"abc").await.unwrap();
        let r2 = log.append(b"de").await.unwrap();
        assert_eq!(r1.hi, r2.lo);

        let (trim, commit, flush) = log.positions().await;
        assert_eq!(trim, 0);
        assert_eq!(commit, r2.hi);
        assert_eq!(flush, 0);

        log.flush_barrier().await.unwrap();
        let (_, _, flush) = log.positions().await;
        assert_eq!(flush, commit);
    }

    #[tokio::test]
    async fn no_space_when_capacity_exceeded() {
        let log = device(16);
        let err = log.append(&[0u8; 64]).await.unwrap_err();
        assert!(matches!(err, LogError::NoSpace { .. }));
    }

    #[tokio::test]
    async fn trim_rejects_crossing_held_lock() {
        let log = device(4096);
        let r1 = log.append(b"first").await.unwrap();
        let r2 = log.append(b"second").await.unwrap();
        log.flush_barrier().await.unwrap();

        let lock = log.pin_slot(r1.lo, r1.hi).await;
        let err = log.trim(r2.lo).await.unwrap_err();
        assert!(matches!(err, LogError::TrimBlocked { .. }));

        drop(lock);
        // give the (non-blocking-path) drop a moment if it had to spawn
        tokio::task::yield_now().await;
        log.trim(r2.lo).await.unwrap();
    }

    #[tokio::test]
    async fn trim_rejects_beyond_flush() {
        let log = device(4096);
        log.append(b"unflushed").await.unwrap();
        let err = log.trim(1).await.unwrap_err();
        assert!(matches!(err, LogError::TrimBeyondFlush { .. }));
    }

    #[tokio::test]
    async fn await_position_resolves_immediately_if_already_reached() {
        let log = device(4096);
        log.append(b"x").await.unwrap();
        log.await_position(PositionKind::Commit, 0).await.unwrap();
    }

    #[tokio::test]
    async fn read_mode_ordering() {
        assert!(LogReadMode::Inconsistent < LogReadMode::Speculative);
        assert!(LogReadMode::Speculative < LogReadMode::Durable);
    }

    /// Concurrent appends must never fail each other with `OutOfOrderCommit`
    /// even when the runtime genuinely interleaves their reserve/write/commit
    /// steps across threads.
    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_appends_all_succeed() {
        let log = device(1 << 20);
        let mut handles = Vec::new();
        for i in 0..32u8 {
            let log = log.clone();
            handles.push(tokio::spawn(async move { log.append(&[i; 16]).await }));
        }
        let mut total_len = 0u64;
        for h in handles {
            let range = h.await.unwrap().unwrap();
            total_len += range.len();
        }
        let (_, commit, _) = log.positions().await;
        assert_eq!(commit, total_len);
    }
}
