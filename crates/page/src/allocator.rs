//! Crash-safe refcount + generation state per page, with an exactly-once
//! client-attachment protocol layered over an [`llfs_log::LogDevice`]
//! (spec.md §4.4). Grounded on the teacher's `StorageEngine` recovery flow
//! (replay a log to rebuild an index) and `SegmentManager`'s
//! manifest-checkpoint-then-trim pattern, generalized from "rebuild a
//! page→LSN index" to "rebuild refcount/generation/attachment tables."

use std::collections::HashMap;
use std::sync::Arc;

use llfs_common::{Generation, ManifestPath, PageId, PhysicalIndex};
use llfs_log::{LogDevice, LogDeviceConfig, LogReadMode, LogReader, ReadResult};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, Notify};
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use crate::error::PageError;

/// Configuration for a [`PageAllocator`] (spec.md §3: "created via a
/// config struct with fixed capacity").
#[derive(Debug, Clone)]
pub struct AllocatorConfig {
    pub device_index: u8,
    pub page_count: u32,
    /// Maximum number of distinct attached client uuids.
    pub max_attachments: usize,
    /// Append tail length (bytes) at which a fresh checkpoint is written
    /// and the log trimmed.
    pub checkpoint_watermark: u64,
    pub log_capacity: u64,
    pub manifest: ManifestPath,
}

#[derive(Debug, Clone, Copy, Default)]
struct Entry {
    refcount: u32,
    generation: Generation,
    /// Set by [`PageAllocator::allocate`] between generation-bump and the
    /// Update that confirms it; cleared the moment any delta references
    /// this index. A page that crashes mid-reservation simply reverts to
    /// free on recovery, since the reservation itself was never logged.
    reserved: bool,
}

#[derive(Debug, Serialize, Deserialize)]
struct CheckpointSnapshot {
    entries: Vec<(u32, Generation)>,
    attachments: HashMap<Uuid, u64>,
}

struct State {
    entries: Vec<Entry>,
    attachments: HashMap<Uuid, u64>,
    bytes_since_checkpoint: u64,
}

/// Per-device crash-safe page allocator (spec.md §4.4).
pub struct PageAllocator {
    config: AllocatorConfig,
    log: LogDevice,
    state: Mutex<State>,
    refcount_notify: Notify,
}

const TAG_UPDATE: u8 = 0;
const TAG_CHECKPOINT: u8 = 1;

fn encode_update(uuid: Uuid, slot: u64, deltas: &[(PageId, i32)]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(1 + 16 + 8 + 2 + deltas.len() * 12);
    buf.push(TAG_UPDATE);
    buf.extend_from_slice(uuid.as_bytes());
    buf.extend_from_slice(&slot.to_le_bytes());
    buf.extend_from_slice(&(deltas.len() as u16).to_le_bytes());
    for (page_id, delta) in deltas {
        buf.extend_from_slice(&page_id.as_u64().to_le_bytes());
        buf.extend_from_slice(&delta.to_le_bytes());
    }
    buf
}

struct DecodedUpdate {
    uuid: Uuid,
    slot: u64,
    deltas: Vec<(PageId, i32)>,
}

fn decode_update(bytes: &[u8]) -> Option<DecodedUpdate> {
    if bytes.len() < 1 + 16 + 8 + 2 {
        return None;
    }
    let uuid = Uuid::from_slice(&bytes[1..17]).ok()?;
    let slot = u64::from_le_bytes(bytes[17..25].try_into().ok()?);
    let n = u16::from_le_bytes(bytes[25..27].try_into().ok()?) as usize;
    let mut deltas = Vec::with_capacity(n);
    let mut off = 27;
    for _ in 0..n {
        if off + 12 > bytes.len() {
            return None;
        }
        let page_id = PageId::from_u64(u64::from_le_bytes(bytes[off..off + 8].try_into().ok()?));
        let delta = i32::from_le_bytes(bytes[off + 8..off + 12].try_into().ok()?);
        deltas.push((page_id, delta));
        off += 12;
    }
    Some(DecodedUpdate { uuid, slot, deltas })
}

impl PageAllocator {
    /// Create a fresh allocator: every physical index starts at refcount
    /// 0, generation 0.
    pub fn create(log: LogDevice, config: AllocatorConfig) -> Self {
        let entries = vec![Entry::default(); config.page_count as usize];
        PageAllocator {
            config,
            log,
            state: Mutex::new(State {
                entries,
                attachments: HashMap::new(),
                bytes_since_checkpoint: 0,
            }),
            refcount_notify: Notify::new(),
        }
    }

    /// Recover an allocator from its backend: find the latest checkpoint,
    /// apply it, then replay tail Updates in order, applying each only if
    /// its slot exceeds that uuid's recovered `last_slot` (spec.md §4.4:
    /// exactly-once replay).
    #[instrument(skip(backend, config))]
    pub async fn recover(
        backend: Box<dyn llfs_common::LogBackend>,
        config: AllocatorConfig,
    ) -> Result<Self, PageError> {
        let trim_hint = config.manifest.load_trim_pos()?;
        let log = LogDevice::recover(
            backend,
            LogDeviceConfig { capacity: config.log_capacity },
            trim_hint,
        )
        .await?;

        let mut entries = vec![Entry::default(); config.page_count as usize];
        let mut attachments: HashMap<Uuid, u64> = HashMap::new();

        let mut reader: LogReader = log.new_reader(LogReadMode::Durable).await;
        loop {
            match reader.read_entry().await? {
                ReadResult::Entry { payload, .. } => {
                    if payload.is_empty() {
                        continue;
                    }
                    match payload[0] {
                        TAG_CHECKPOINT => {
                            let snap: CheckpointSnapshot = serde_json::from_slice(&payload[1..])
                                .map_err(|e| PageError::Corruption(e.to_string()))?;
                            entries = snap
                                .entries
                                .into_iter()
                                .map(|(refcount, generation)| Entry {
                                    refcount,
                                    generation,
                                    reserved: false,
                                })
                                .collect();
                            entries.resize(config.page_count as usize, Entry::default());
                            attachments = snap.attachments;
                        }
                        TAG_UPDATE => {
                            let update = decode_update(&payload)
                                .ok_or_else(|| PageError::Corruption("malformed update record".into()))?;
                            let last_slot = attachments.get(&update.uuid).copied();
                            let should_apply = match last_slot {
                                Some(last) => update.slot > last,
                                None => true,
                            };
                            if should_apply {
                                apply_deltas(&mut entries, &update.deltas)?;
                                attachments.insert(update.uuid, update.slot);
                            }
                        }
                        other => {
                            return Err(PageError::Corruption(format!("unknown allocator record tag {other}")));
                        }
                    }
                }
                ReadResult::Eof => break,
                ReadResult::Corrupted { offset } => {
                    warn!(offset, "allocator log corrupted past this point, stopping replay");
                    break;
                }
            }
        }

        debug!(pages = config.page_count, attachments = attachments.len(), "allocator recovered");

        Ok(PageAllocator {
            config,
            log,
            state: Mutex::new(State {
                entries,
                attachments,
                bytes_since_checkpoint: 0,
            }),
            refcount_notify: Notify::new(),
        })
    }

    pub fn device_index(&self) -> u8 {
        self.config.device_index
    }

    /// Add `uuid` to the attachments table with `last_slot = initial_slot
    /// - 1`. Idempotent when already attached.
    pub async fn attach(&self, uuid: Uuid, initial_slot: u64) -> Result<(), PageError> {
        let mut state = self.state.lock().await;
        if state.attachments.contains_key(&uuid) {
            return Ok(());
        }
        if state.attachments.len() >= self.config.max_attachments {
            return Err(PageError::AttachmentTableFull {
                capacity: self.config.max_attachments,
            });
        }
        state.attachments.insert(uuid, initial_slot.saturating_sub(1));
        Ok(())
    }

    /// Remove `uuid` from the attachments table. Safe only when the
    /// client has no pending updates in flight (caller's responsibility).
    pub async fn detach(&self, uuid: Uuid) {
        self.state.lock().await.attachments.remove(&uuid);
    }

    /// Pick `count` free (refcount 0, not reserved) physical indices,
    /// bump each generation, and return fresh `PageId`s born at refcount
    /// 2 once a confirming `update` is applied (spec.md §4.4: "does not
    /// persist until a subsequent update references them").
    pub async fn allocate(&self, count: usize) -> Result<Vec<PageId>, PageError> {
        let mut state = self.state.lock().await;
        let mut picked = Vec::with_capacity(count);
        for (idx, entry) in state.entries.iter_mut().enumerate() {
            if picked.len() == count {
                break;
            }
            if entry.refcount == 0 && !entry.reserved {
                entry.generation += 1;
                entry.reserved = true;
                picked.push(PageId::new(
                    self.config.device_index,
                    idx as PhysicalIndex,
                    entry.generation,
                ));
            }
        }
        if picked.len() < count {
            // Roll back the reservations we did make; allocate is all-or-nothing.
            for page_id in &picked {
                let entry = &mut state.entries[page_id.physical_index() as usize];
                entry.reserved = false;
                entry.generation -= 1;
            }
            return Err(PageError::Exhausted {
                page_count: self.config.page_count,
            });
        }
        Ok(picked)
    }

    /// Release a reservation made by [`Self::allocate`] without ever
    /// submitting a confirming update — used by an aborting `Job` so the
    /// physical index becomes allocatable again within this process's
    /// lifetime (spec.md leaves aborted-job cleanup to the caller; no
    /// update was ever logged for this page, so there is nothing to undo
    /// durably).
    pub async fn cancel_reservation(&self, page_id: PageId) {
        let mut state = self.state.lock().await;
        if let Some(entry) = state.entries.get_mut(page_id.physical_index() as usize) {
            if entry.generation == page_id.generation() && entry.reserved {
                entry.reserved = false;
            }
        }
    }

    /// Apply `deltas` on behalf of `uuid` at `slot`, exactly once. Returns
    /// `Ok(())` as a no-op if `slot` is not newer than the client's
    /// recorded `last_slot` (spec.md: "SlotRegression ... not an error to
    /// the caller — returns ok no-op").
    #[instrument(skip(self, deltas), fields(uuid = %uuid, slot, n = deltas.len()))]
    pub async fn update(&self, uuid: Uuid, slot: u64, deltas: &[(PageId, i32)]) -> Result<(), PageError> {
        {
            let state = self.state.lock().await;
            let last_slot = state
                .attachments
                .get(&uuid)
                .copied()
                .ok_or(PageError::UnknownClient(uuid))?;
            if slot <= last_slot {
                return Ok(()); // SlotRegression: idempotent no-op, not an error.
            }
        }

        let record = encode_update(uuid, slot, deltas);
        let record_len = record.len() as u64;
        let range = self.log.append(&record).await?;
        self.log.flush_barrier().await?;
        self.log
            .await_position(llfs_log::PositionKind::Flush, range.hi)
            .await?;

        let mut state = self.state.lock().await;
        apply_deltas(&mut state.entries, deltas)?;
        state.attachments.insert(uuid, slot);
        state.bytes_since_checkpoint += record_len;
        let should_checkpoint = state.bytes_since_checkpoint >= self.config.checkpoint_watermark;
        drop(state);

        self.refcount_notify.notify_waiters();

        if should_checkpoint {
            self.checkpoint().await?;
        }
        Ok(())
    }

    /// The highest slot durably applied on behalf of `uuid`, if attached.
    /// Used by a volume's crash recovery to tell whether a job's allocator
    /// deltas were already applied before an unmatched `Prepare`.
    pub async fn last_slot(&self, uuid: Uuid) -> Option<u64> {
        self.state.lock().await.attachments.get(&uuid).copied()
    }

    /// Read the current `(refcount, generation)` for a physical index.
    pub async fn entry(&self, idx: PhysicalIndex) -> Option<(u32, Generation)> {
        let state = self.state.lock().await;
        state.entries.get(idx as usize).map(|e| (e.refcount, e.generation))
    }

    /// Await until `pred(refcount)` holds for `page_id`'s physical index.
    pub async fn await_refcount(&self, page_id: PageId, pred: impl Fn(u32) -> bool) -> Result<(), PageError> {
        loop {
            let current = {
                let state = self.state.lock().await;
                state
                    .entries
                    .get(page_id.physical_index() as usize)
                    .map(|e| e.refcount)
                    .unwrap_or(0)
            };
            if pred(current) {
                return Ok(());
            }
            self.refcount_notify.notified().await;
        }
    }

    /// Write a fresh checkpoint of the current tables and trim the log up
    /// to it, discarding the superseded tail of Update records (spec.md
    /// §4.4: "whenever the tail exceeds a watermark, the allocator writes
    /// a new checkpoint and trims its log").
    #[instrument(skip(self))]
    pub async fn checkpoint(&self) -> Result<(), PageError> {
        let snapshot = {
            let state = self.state.lock().await;
            CheckpointSnapshot {
                entries: state.entries.iter().map(|e| (e.refcount, e.generation)).collect(),
                attachments: state.attachments.clone(),
            }
        };
        let mut payload = vec![TAG_CHECKPOINT];
        payload.extend_from_slice(
            &serde_json::to_vec(&snapshot).map_err(|e| PageError::Corruption(e.to_string()))?,
        );
        let range = self.log.append(&payload).await?;
        self.log.flush_barrier().await?;
        self.log.await_position(llfs_log::PositionKind::Flush, range.hi).await?;
        self.log.trim(range.lo).await?;
        self.config.manifest.store_trim_pos(range.lo)?;

        let mut state = self.state.lock().await;
        state.bytes_since_checkpoint = 0;
        debug!(checkpoint_at = range.lo, "allocator checkpointed and trimmed");
        Ok(())
    }
}

fn apply_deltas(entries: &mut [Entry], deltas: &[(PageId, i32)]) -> Result<(), PageError> {
    for (page_id, delta) in deltas {
        let idx = page_id.physical_index() as usize;
        let entry = entries
            .get_mut(idx)
            .ok_or(PageError::NotFound(*page_id))?;
        if page_id.generation() >= entry.generation {
            entry.generation = page_id.generation();
        }
        entry.reserved = false;
        let new_refcount = entry.refcount as i64 + *delta as i64;
        assert!(
            new_refcount >= 0,
            "refcount underflow for {page_id}: {} + {delta} < 0 (double-free bug)",
            entry.refcount
        );
        entry.refcount = new_refcount as u32;
    }
    Ok(())
}

/// Shared-ownership handle convenient for wiring multiple allocators into
/// a [`crate::recycler::PageRecycler`] or a volume's device table.
pub type SharedAllocator = Arc<PageAllocator>;

#[cfg(test)]
mod tests {
    use super::*;
    use llfs_log::InMemoryLogBackend;

    fn config() -> AllocatorConfig {
        AllocatorConfig {
            device_index: 0,
            page_count: 8,
            max_attachments: 4,
            checkpoint_watermark: 1 << 20,
            log_capacity: 1 << 20,
            manifest: ManifestPath::none(),
        }
    }

    fn allocator() -> PageAllocator {
        let log = LogDevice::create(
            Box::new(llfs_log::InMemoryLogBackend::new()),
            LogDeviceConfig { capacity: 1 << 20 },
        );
        PageAllocator::create(log, config())
    }

    #[tokio::test]
    async fn allocate_returns_fresh_generation_and_ids() {
        let alloc = allocator();
        let ids = alloc.allocate(2).await.unwrap();
        assert_eq!(ids.len(), 2);
        assert_ne!(ids[0].physical_index(), ids[1].physical_index());
    }

    #[tokio::test]
    async fn exactly_once_update_idempotent_resubmit() {
        let alloc = allocator();
        let uuid = Uuid::from_u128(1);
        alloc.attach(uuid, 10).await.unwrap();
        let page = PageId::new(0, 0, 1);

        alloc.update(uuid, 11, &[(page, 2)]).await.unwrap();
        alloc.update(uuid, 12, &[(page, -1)]).await.unwrap();
        // Resubmit the first update: must be a no-op.
        alloc.update(uuid, 11, &[(page, 2)]).await.unwrap();

        assert_eq!(alloc.entry(0).await.unwrap().0, 1);
    }

    #[tokio::test]
    async fn unattached_client_is_rejected() {
        let alloc = allocator();
        let uuid = Uuid::from_u128(99);
        let page = PageId::new(0, 0, 1);
        let err = alloc.update(uuid, 1, &[(page, 1)]).await.unwrap_err();
        assert!(matches!(err, PageError::UnknownClient(_)));
    }

    #[tokio::test]
    async fn attachment_table_full() {
        let alloc = allocator();
        for i in 0..4 {
            alloc.attach(Uuid::from_u128(i), 0).await.unwrap();
        }
        let err = alloc.attach(Uuid::from_u128(100), 0).await.unwrap_err();
        assert!(matches!(err, PageError::AttachmentTableFull { .. }));
    }

    #[tokio::test]
    async fn exhausted_when_no_free_pages() {
        let alloc = allocator();
        alloc.allocate(8).await.unwrap();
        let err = alloc.allocate(1).await.unwrap_err();
        assert!(matches!(err, PageError::Exhausted { .. }));
    }

    #[tokio::test]
    #[should_panic(expected = "double-free")]
    async fn refcount_underflow_panics() {
        let alloc = allocator();
        let uuid = Uuid::from_u128(1);
        alloc.attach(uuid, 0).await.unwrap();
        let page = PageId::new(0, 0, 1);
        let _ = alloc.update(uuid, 1, &[(page, -1)]).await;
    }

    #[tokio::test]
    async fn checkpoint_then_recover_preserves_state() {
        let backend = Arc::new(llfs_log::InMemoryLogBackend::new());
        let log = LogDevice::create(Box::new(SharedBackend(backend.clone())), LogDeviceConfig { capacity: 1 << 20 });
        let alloc = PageAllocator::create(log, config());
        let uuid = Uuid::from_u128(7);
        alloc.attach(uuid, 0).await.unwrap();
        let page = PageId::new(0, 2, 1);
        alloc.update(uuid, 1, &[(page, 2)]).await.unwrap();
        alloc.checkpoint().await.unwrap();
        alloc.update(uuid, 2, &[(page, -1)]).await.unwrap();

        let recovered = PageAllocator::recover(Box::new(SharedBackend(backend)), config())
            .await
            .unwrap();
        assert_eq!(recovered.entry(2).await.unwrap().0, 1);
    }

    /// Test-only adapter letting two `LogDevice`s share one
    /// `InMemoryLogBackend`'s bytes across a simulated restart.
    struct SharedBackend(Arc<llfs_log::InMemoryLogBackend>);

    #[async_trait::async_trait]
    impl llfs_common::LogBackend for SharedBackend {
        async fn read(&self, offset: u64, len: usize) -> std::io::Result<Vec<u8>> {
            self.0.read(offset, len).await
        }
        async fn write(&self, offset: u64, bytes: &[u8]) -> std::io::Result<()> {
            self.0.write(offset, bytes).await
        }
        async fn flush(&self) -> std::io::Result<()> {
            self.0.flush().await
        }
        async fn size(&self) -> std::io::Result<u64> {
            self.0.size().await
        }
    }
}
