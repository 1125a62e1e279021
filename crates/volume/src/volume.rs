//! Atomic multi-page + log-record transaction primitive (spec.md §4.7).
//! Grounded on the teacher's `compute::transaction::MiniTransaction`
//! (build-then-`finish()` staging) and `storage::engine::StorageEngine::
//! append_redo` (assign-then-durably-record pattern), generalized from "one
//! flat redo batch into one WAL" to "staged page writes + allocator deltas
//! + one volume log record, lineearized by a single `Commit` record."

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use llfs_common::{LogBackend, ManifestPath, PageId};
use llfs_log::{LogDevice, LogDeviceConfig, LogReadMode, PositionKind, ReadResult};
use llfs_page::{PageAllocator, PageCache, PageCacheConfig, PageDevice, PageRecycler};
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use crate::error::VolumeError;
use crate::job::Job;
use crate::record::{decode_commit, decode_prepare, PrepareRecord, TAG_COMMIT, TAG_PREPARE};

/// Configuration for a [`Volume`] (spec.md §3: "created via a config
/// struct with fixed capacity").
#[derive(Clone)]
pub struct VolumeConfig {
    pub log_capacity: u64,
    pub manifest: ManifestPath,
    pub cache: PageCacheConfig,
}

pub(crate) struct Shared {
    pub(crate) log: LogDevice,
    pub(crate) devices: HashMap<u8, (Arc<PageDevice>, Arc<PageAllocator>)>,
    pub(crate) cache: PageCache,
    pub(crate) recycler: Option<Arc<PageRecycler>>,
    /// Stable identity a dangling prepare's compensating negation is
    /// submitted under. Must be persisted across restarts (like the
    /// recycler's `client_uuid`) so a replayed negation lands on the same
    /// attachment and rides the allocator's exactly-once `update` path as a
    /// true no-op rather than generating a fresh, unattached identity every
    /// recovery.
    rollback_uuid: Uuid,
}

/// A LogDevice plus a set of attached `(PageDevice, PageAllocator)` pairs,
/// tied together into one atomic-commit domain (spec.md §3 Volume state).
/// Cloning shares the same underlying state, matching `LogDevice`'s own
/// cheap-`Arc`-clone contract.
#[derive(Clone)]
pub struct Volume(pub(crate) Arc<Shared>);

impl Volume {
    /// Create a fresh volume over an empty log. `rollback_uuid` identifies
    /// this volume's compensating-negation client to the allocator; the
    /// caller generates and persists it once, the same way the recycler's
    /// `client_uuid` is persisted (see `DESIGN.md`).
    pub fn create(
        log: LogDevice,
        devices: HashMap<u8, (Arc<PageDevice>, Arc<PageAllocator>)>,
        recycler: Option<Arc<PageRecycler>>,
        cache_config: PageCacheConfig,
        rollback_uuid: Uuid,
    ) -> Self {
        Volume(Arc::new(Shared {
            log,
            devices,
            cache: PageCache::new(cache_config),
            recycler,
            rollback_uuid,
        }))
    }

    /// Recover a volume: replay the volume log to find `Prepare` records
    /// with no matching `Commit` and resolve each per spec.md's recovery
    /// policy (see crate-level docs and DESIGN.md for the full rationale).
    #[instrument(skip(backend, config, devices, recycler))]
    pub async fn recover(
        backend: Box<dyn LogBackend>,
        config: VolumeConfig,
        devices: HashMap<u8, (Arc<PageDevice>, Arc<PageAllocator>)>,
        recycler: Option<Arc<PageRecycler>>,
        rollback_uuid: Uuid,
    ) -> Result<Self, VolumeError> {
        let trim_hint = config.manifest.load_trim_pos()?;
        let log = LogDevice::recover(backend, LogDeviceConfig { capacity: config.log_capacity }, trim_hint).await?;

        let mut prepares: HashMap<u64, PrepareRecord> = HashMap::new();
        let mut committed: HashSet<u64> = HashSet::new();

        let mut reader = log.new_reader(LogReadMode::Durable).await;
        loop {
            match reader.read_entry().await? {
                ReadResult::Entry { offset, payload } => {
                    if payload.is_empty() {
                        continue;
                    }
                    match payload[0] {
                        TAG_PREPARE => {
                            let record = decode_prepare(&payload)?;
                            prepares.insert(offset, record);
                        }
                        TAG_COMMIT => {
                            let prepare_slot = decode_commit(&payload)?;
                            committed.insert(prepare_slot);
                        }
                        other => {
                            return Err(VolumeError::Corruption(format!("unknown volume record tag {other}")));
                        }
                    }
                }
                ReadResult::Eof => break,
                ReadResult::Corrupted { offset } => {
                    warn!(offset, "volume log corrupted past this point, stopping replay");
                    break;
                }
            }
        }

        let dangling: Vec<(u64, PrepareRecord)> = prepares
            .into_iter()
            .filter(|(slot, _)| !committed.contains(slot))
            .collect();
        debug!(dangling = dangling.len(), "volume recovery found uncommitted prepares");

        let volume = Volume(Arc::new(Shared {
            log,
            devices,
            cache: PageCache::new(config.cache),
            recycler,
            rollback_uuid,
        }));

        for (prepare_slot, record) in dangling {
            volume.resolve_dangling_prepare(prepare_slot, &record).await?;
        }

        Ok(volume)
    }

    /// A job's allocator deltas are applied under `(job_uuid, prepare_slot)`
    /// exactly-once. On recovery, a `Prepare` with no matching `Commit` may
    /// still have had its deltas durably applied (crash landed between
    /// step 3 and step 4). The job is always treated as aborted; if its
    /// deltas were applied, a compensating negation is submitted under the
    /// volume's own rollback identity to undo them (spec.md §4.7 recovery
    /// matrix, scenario 5).
    ///
    /// The negation's slot is `prepare_slot` itself rather than a counter
    /// that advances on every recovery run: `prepare_slot` uniquely and
    /// durably identifies this dangling prepare, so resubmitting the same
    /// `(rollback_uuid, prepare_slot)` update on a second crash mid-rollback
    /// (or a re-run of recovery) lands on the allocator's own
    /// exactly-once/no-op path instead of negating twice and underflowing
    /// the refcount.
    async fn resolve_dangling_prepare(&self, prepare_slot: u64, record: &PrepareRecord) -> Result<(), VolumeError> {
        let mut by_device: HashMap<u8, Vec<(PageId, i32)>> = HashMap::new();
        for (id, delta) in &record.deltas {
            by_device.entry(id.device_index()).or_default().push((*id, *delta));
        }
        for (idx, deltas) in by_device {
            let (_, allocator) = self.device(idx)?;
            let applied = allocator
                .last_slot(record.job_uuid)
                .await
                .map(|last| last >= prepare_slot)
                .unwrap_or(false);
            if !applied {
                continue;
            }
            let negated: Vec<(PageId, i32)> = deltas.iter().map(|(id, d)| (*id, -d)).collect();
            allocator.attach(self.0.rollback_uuid, prepare_slot).await.ok();
            allocator.update(self.0.rollback_uuid, prepare_slot, &negated).await?;
            debug!(prepare_slot, device = idx, "rolled back dangling prepare's allocator deltas");
        }
        Ok(())
    }

    pub(crate) fn device(&self, idx: u8) -> Result<&(Arc<PageDevice>, Arc<PageAllocator>), VolumeError> {
        self.0.devices.get(&idx).ok_or(VolumeError::UnknownDevice(idx))
    }

    pub fn cache(&self) -> &PageCache {
        &self.0.cache
    }

    pub fn recycler(&self) -> Option<&Arc<PageRecycler>> {
        self.0.recycler.as_ref()
    }

    pub(crate) fn log(&self) -> &LogDevice {
        &self.0.log
    }

    /// Begin a new atomic update against this volume.
    pub fn begin_job(&self) -> Job {
        Job::new(self.clone())
    }

    pub async fn positions(&self) -> (u64, u64, u64) {
        self.0.log.positions().await
    }

    pub async fn await_flush(&self, offset: u64) -> Result<(), VolumeError> {
        self.0.log.flush_barrier().await?;
        self.0.log.await_position(PositionKind::Flush, offset).await?;
        Ok(())
    }
}
