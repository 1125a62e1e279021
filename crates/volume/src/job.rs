//! In-memory staging buffer for one atomic [`crate::Volume`] update, and
//! its five-step commit protocol (spec.md §4.7). Grounded on the teacher's
//! `compute::transaction::MiniTransaction` build-then-`finish()` shape.

use std::collections::{HashMap, HashSet};

use llfs_common::PageId;
use llfs_page::PagePin;
use tokio_util::sync::CancellationToken;
use tracing::{instrument, warn};
use uuid::Uuid;

use crate::error::VolumeError;
use crate::record::{encode_commit, encode_prepare, PrepareRecord};
use crate::volume::Volume;

/// A staged atomic update: new pages, ref-count deltas on existing pages,
/// and one opaque user-defined log record, all applied together or not at
/// all (spec.md §4.7).
pub struct Job {
    volume: Volume,
    job_uuid: Uuid,
    new_pages: Vec<PageId>,
    staged: HashMap<PageId, Vec<u8>>,
    read_pins: Vec<PagePin>,
    read_page_ids: Vec<PageId>,
    deltas: Vec<(PageId, i32)>,
    user_payload: Vec<u8>,
    cancel: CancellationToken,
    finished: bool,
}

impl Job {
    pub(crate) fn new(volume: Volume) -> Self {
        Job {
            volume,
            job_uuid: Uuid::new_v4(),
            new_pages: Vec::new(),
            staged: HashMap::new(),
            read_pins: Vec::new(),
            read_page_ids: Vec::new(),
            deltas: Vec::new(),
            user_payload: Vec::new(),
            cancel: CancellationToken::new(),
            finished: false,
        }
    }

    pub fn id(&self) -> Uuid {
        self.job_uuid
    }

    /// Cancellation handle. Cancelling is only meaningful before
    /// [`Self::commit`] has appended its `Commit` record; a job observed as
    /// committed ignores cancellation (spec.md §5).
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Allocate a fresh page from `device_index`'s allocator and stage it
    /// for this job, born at refcount 2 once the job commits (spec.md
    /// §4.4: "a newly allocated page is born at refcount 2" — the job must
    /// include a `+2` in its own deltas for each new page, see
    /// [`Self::ref_delta`]).
    pub async fn new_page(&mut self, device_index: u8) -> Result<PageId, VolumeError> {
        let (_, allocator) = self.volume.device(device_index)?;
        let ids = allocator.allocate(1).await?;
        let id = ids[0];
        self.new_pages.push(id);
        self.staged.insert(id, Vec::new());
        Ok(id)
    }

    /// Overwrite the staged content for a page returned by [`Self::new_page`].
    pub fn write_page(&mut self, page_id: PageId, bytes: Vec<u8>) -> Result<(), VolumeError> {
        let slot = self
            .staged
            .get_mut(&page_id)
            .ok_or_else(|| VolumeError::Corruption(format!("{page_id} was not staged by this job")))?;
        *slot = bytes;
        Ok(())
    }

    /// Load (if needed) and pin an existing page for the duration of this
    /// job, preventing its eviction while the job reasons about it
    /// (spec.md §4.6/§5: pinning during `PageCacheJob` lifetimes).
    pub async fn pin_existing(&mut self, page_id: PageId) -> Result<(), VolumeError> {
        let (device, _) = self.volume.device(page_id.device_index())?;
        let device = device.clone();
        self.volume
            .cache()
            .get_or_load(page_id, async move { device.read(page_id).await })
            .await?;
        if let Some(pin) = self.volume.cache().pin(page_id) {
            self.read_pins.push(pin);
            self.read_page_ids.push(page_id);
        }
        Ok(())
    }

    /// Stage a ref-count delta against an existing (or newly allocated in
    /// this same job) page.
    pub fn ref_delta(&mut self, page_id: PageId, delta: i32) {
        self.deltas.push((page_id, delta));
    }

    /// Append bytes to this job's own volume log record.
    pub fn append(&mut self, bytes: &[u8]) {
        self.user_payload.extend_from_slice(bytes);
    }

    /// Run the five-step commit protocol (spec.md §4.7):
    /// 1. Prepare — append a `Prepare` record describing the job.
    /// 2. Write every new page, then flush every touched device.
    /// 3. Apply allocator deltas per device, exactly-once.
    /// 4. Commit — append `Commit{prepare_slot}`, await Durable flush.
    /// 5. Release — drop read pins held on referenced pages.
    ///
    /// Returns the job's `prepare_slot`, the volume log offset that now
    /// durably linearises this job.
    #[instrument(skip(self), fields(job_uuid = %self.job_uuid))]
    pub async fn commit(mut self) -> Result<u64, VolumeError> {
        if self.cancel.is_cancelled() {
            return Err(VolumeError::Cancelled);
        }

        let prepare = PrepareRecord {
            job_uuid: self.job_uuid,
            new_pages: self.new_pages.clone(),
            read_pages: self.read_page_ids.clone(),
            deltas: self.deltas.clone(),
            user_payload: std::mem::take(&mut self.user_payload),
        };
        let encoded = encode_prepare(&prepare);
        let range = self.volume.log().append(&encoded).await?;
        let prepare_slot = range.lo;

        // Step 2: write every new page, then flush every touched device.
        // Past this append, cancellation no longer aborts the job — the
        // Prepare record already exists, and recovery resolves dangling
        // prepares deterministically regardless of what this process does
        // next (spec.md §5: cancellation after the point of no return is a
        // no-op).
        let mut touched_devices = HashSet::new();
        for page_id in &self.new_pages {
            let (device, _) = self.volume.device(page_id.device_index())?;
            let bytes = self.staged.get(page_id).cloned().unwrap_or_default();
            device.write(*page_id, &bytes).await?;
            touched_devices.insert(page_id.device_index());
        }
        for idx in &touched_devices {
            let (device, _) = self.volume.device(*idx)?;
            device.flush().await?;
        }

        // Step 3: apply allocator deltas per device, exactly-once keyed by
        // (job_uuid, prepare_slot).
        self.apply_allocator_deltas(prepare_slot).await?;

        // Step 4: commit.
        let commit_bytes = encode_commit(prepare_slot);
        let commit_range = self.volume.log().append(&commit_bytes).await?;
        self.volume.await_flush(commit_range.hi).await?;

        // Step 5: release read pins; seed the cache with the pages this
        // job just wrote so the next reader doesn't re-fetch them.
        self.read_pins.clear();
        for page_id in &self.new_pages {
            if let Some(bytes) = self.staged.get(page_id) {
                self.volume.cache().seed(*page_id, bytes.clone());
            }
        }

        self.finished = true;
        Ok(prepare_slot)
    }

    async fn apply_allocator_deltas(&self, prepare_slot: u64) -> Result<(), VolumeError> {
        let mut by_device: HashMap<u8, Vec<(PageId, i32)>> = HashMap::new();
        for (id, delta) in &self.deltas {
            by_device.entry(id.device_index()).or_default().push((*id, *delta));
        }
        for (idx, deltas) in by_device {
            let (_, allocator) = self.volume.device(idx)?;
            allocator.attach(self.job_uuid, prepare_slot).await.ok();
            allocator.update(self.job_uuid, prepare_slot, &deltas).await?;

            for (id, _) in &deltas {
                let Some((refcount, _)) = allocator.entry(id.physical_index()).await else {
                    continue;
                };
                if refcount == 1 {
                    if let Some(recycler) = self.volume.recycler() {
                        recycler.enqueue(*id).await?;
                    }
                }
            }
        }
        Ok(())
    }

    /// Abandon the job before commit: release any physical-index
    /// reservations made by [`Self::new_page`] so they become allocatable
    /// again within this process's lifetime, and drop read pins. No
    /// durable state was ever written (the `Prepare` record is only
    /// appended in [`Self::commit`]), so there is nothing to roll back
    /// durably.
    pub async fn abort(mut self) {
        self.cancel.cancel();
        for page_id in &self.new_pages {
            if let Ok((_, allocator)) = self.volume.device(page_id.device_index()) {
                allocator.cancel_reservation(*page_id).await;
            }
        }
        self.read_pins.clear();
        self.finished = true;
    }
}

impl Drop for Job {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        warn!(job_uuid = %self.job_uuid, "job dropped without commit or abort; releasing reservations");
        let volume = self.volume.clone();
        let new_pages = std::mem::take(&mut self.new_pages);
        tokio::spawn(async move {
            for page_id in new_pages {
                if let Ok((_, allocator)) = volume.device(page_id.device_index()) {
                    allocator.cancel_reservation(page_id).await;
                }
            }
        });
    }
}
