//! One cleanup sweep over the shared volume and the manifest.
//!
//! Phases run in order, each bounded by `max_items` and interruptible
//! between items:
//! 1. files under `tmp/` and `objects/` are reconciled against the manifest
//! 2. stored entries past retention are tombstoned
//! 3. stored entries are verified against their files (optional)
//! 4. tombstoned entries have their file deleted and their row removed
//!
//! Nothing is deleted without either a tombstone plus a lease, or the
//! absence of any entry plus an age past the grace period.

use crate::error::{SweepError, SweepResult};
use crate::retention::{RetentionPolicy, file_age};
use futures::StreamExt;
use hoard_core::config::{SweeperAppConfig, SweeperConfig};
use hoard_core::{ContentHash, ContentId, EntryStatus, ManifestEntry};
use hoard_manifest::{ManifestScanExt, ManifestStore, MetadataError, RunKind, RunState};
use hoard_storage::{
    KeyKind, ListedObject, ListingOptions, ObjectStore, ObjectStoreListStreamExt, StagedObject,
    classify, object_key,
};
use hoard_storage::keys::{OBJECTS_PREFIX, STAGING_PREFIX};
use serde::{Deserialize, Serialize};
use std::pin::pin;
use std::sync::Arc;
use time::{Duration, OffsetDateTime};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Counters for one sweep, stored with its run record.
///
/// In a dry run the mutation counters hold what would have happened.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepStats {
    pub dry_run: bool,
    pub files_listed: u64,
    /// Files left alone because they are younger than the grace period.
    pub within_grace: u64,
    pub staged_deleted: u64,
    pub orphans_deleted: u64,
    pub orphans_tombstoned: u64,
    /// Files outside the known key layout.
    pub foreign_skipped: u64,
    pub expired_tombstoned: u64,
    pub capacity_tombstoned: u64,
    /// Tombstones refused because the entry was leased or downloading.
    pub tombstone_refused: u64,
    pub verified: u64,
    pub missing_failed: u64,
    pub corrupt_quarantined: u64,
    pub reclaimed: u64,
    pub files_deleted: u64,
    pub bytes_reclaimed: u64,
    /// Entries skipped because another holder had them leased.
    pub busy_skipped: u64,
    pub errors: u64,
}

/// Why a stored entry is being retired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Retire {
    Expired,
    OverCapacity,
}

/// Result of checking a stored file.
enum Verdict {
    Intact,
    Missing,
    Corrupt(ContentHash),
}

/// Per-run state shared by the phases.
struct Pass<'a> {
    holder: String,
    now: OffsetDateTime,
    cancel: &'a CancellationToken,
    stats: SweepStats,
}

/// The cleanup sweeper.
pub struct Sweeper {
    manifest: Arc<dyn ManifestStore>,
    storage: Arc<dyn ObjectStore>,
    config: SweeperConfig,
    retention: RetentionPolicy,
    lease_ttl: Duration,
}

impl Sweeper {
    pub fn new(
        manifest: Arc<dyn ManifestStore>,
        storage: Arc<dyn ObjectStore>,
        config: &SweeperAppConfig,
    ) -> Self {
        Self {
            manifest,
            storage,
            retention: RetentionPolicy::from_config(&config.sweeper.retention),
            config: config.sweeper.clone(),
            lease_ttl: config.lease.ttl(),
        }
    }

    /// Override the configured dry-run mode.
    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.config.dry_run = dry_run;
        self
    }

    fn grace(&self) -> Duration {
        self.config.grace_period()
    }

    fn limit(&self) -> usize {
        self.config
            .max_items
            .map_or(usize::MAX, |n| usize::try_from(n).unwrap_or(usize::MAX))
    }

    fn listing_options(&self) -> ListingOptions {
        ListingOptions::new(self.config.batch_size as usize)
    }

    /// Run one sweep and record it in the run history.
    ///
    /// A phase that fails part-way is logged and counted; the remaining
    /// phases still run.
    pub async fn run(&self, cancel: &CancellationToken) -> SweepResult<SweepStats> {
        let run = self.manifest.create_run(RunKind::Sweep).await?;
        let mut pass = Pass {
            holder: format!("sweeper:{}", Uuid::new_v4()),
            now: OffsetDateTime::now_utc(),
            cancel,
            stats: SweepStats {
                dry_run: self.config.dry_run,
                ..SweepStats::default()
            },
        };
        info!(
            run_id = %run.run_id,
            dry_run = self.config.dry_run,
            grace_secs = self.config.grace_period_secs,
            "sweep started"
        );

        for phase in [Phase::Staged, Phase::Objects, Phase::Retention, Phase::Verify, Phase::Reclaim] {
            if cancel.is_cancelled() {
                break;
            }
            let result = match phase {
                Phase::Staged => self.sweep_files(STAGING_PREFIX, &mut pass).await,
                Phase::Objects => self.sweep_files(OBJECTS_PREFIX, &mut pass).await,
                Phase::Retention => self.apply_retention(&mut pass).await,
                Phase::Verify if self.config.verify_stored => self.verify(&mut pass).await,
                Phase::Verify => Ok(()),
                Phase::Reclaim => self.reclaim(&mut pass).await,
            };
            if let Err(e) = result {
                warn!(phase = ?phase, error = %e, "sweep phase stopped early, deferring to next run");
                pass.stats.errors += 1;
            }
        }

        let state = if cancel.is_cancelled() {
            RunState::Interrupted
        } else {
            RunState::Finished
        };
        let stats = pass.stats;
        let stats_json = serde_json::to_string(&stats).ok();
        if let Err(e) = self
            .manifest
            .finish_run(run.run_id, state, stats_json.as_deref())
            .await
        {
            error!(run_id = %run.run_id, error = %e, "failed to record sweep run");
        }

        info!(
            run_id = %run.run_id,
            state = state.as_str(),
            files = stats.files_listed,
            staged_deleted = stats.staged_deleted,
            orphans_deleted = stats.orphans_deleted,
            tombstoned = stats.orphans_tombstoned + stats.expired_tombstoned + stats.capacity_tombstoned,
            reclaimed = stats.reclaimed,
            bytes = stats.bytes_reclaimed,
            errors = stats.errors,
            "sweep finished"
        );
        Ok(stats)
    }

    /// Reconcile every file under `prefix` against the manifest.
    async fn sweep_files(&self, prefix: &str, pass: &mut Pass<'_>) -> SweepResult<()> {
        let cancel = pass.cancel;
        let mut files = pin!(
            self.storage
                .list_objects(prefix, Some(self.listing_options()))
                .take_until(cancel.cancelled())
                .take(self.limit())
        );

        while let Some(file) = files.next().await {
            let file = file?;
            pass.stats.files_listed += 1;
            if let Err(e) = self.sweep_file(&file, pass).await {
                warn!(key = %file.key, error = %e, "failed to process file, will retry next run");
                pass.stats.errors += 1;
            }
        }
        Ok(())
    }

    async fn sweep_file(&self, file: &ListedObject, pass: &mut Pass<'_>) -> SweepResult<()> {
        let grace = self.grace();
        if file.last_modified.is_none() {
            warn!(
                key = %file.key,
                "no modification time for file, assuming it is 7 grace periods old"
            );
        }
        let age = file_age(file.last_modified, pass.now, grace);
        if age < grace {
            debug!(key = %file.key, age_secs = age.whole_seconds(), "within grace period, keeping");
            pass.stats.within_grace += 1;
            return Ok(());
        }

        match classify(&file.key) {
            KeyKind::Staged => {
                if self.config.dry_run {
                    info!(key = %file.key, age_secs = age.whole_seconds(), "DRY-RUN: would delete stale staged file");
                } else {
                    self.delete_file(&file.key).await?;
                    debug!(key = %file.key, age_secs = age.whole_seconds(), "deleted stale staged file");
                }
                pass.stats.staged_deleted += 1;
                Ok(())
            }
            KeyKind::Object(hash) => self.sweep_object(file, hash, pass).await,
            KeyKind::Quarantined | KeyKind::Foreign => {
                debug!(key = %file.key, "not a canonical object key, leaving for operators");
                pass.stats.foreign_skipped += 1;
                Ok(())
            }
        }
    }

    async fn sweep_object(
        &self,
        file: &ListedObject,
        hash: ContentHash,
        pass: &mut Pass<'_>,
    ) -> SweepResult<()> {
        let id = ContentId::from_hash(hash);
        match self.manifest.get_entry(&id).await? {
            Some(entry) if entry.status == EntryStatus::Stored => {
                if entry.storage_path.as_deref() != Some(file.key.as_str()) {
                    warn!(
                        content_id = %id,
                        key = %file.key,
                        storage_path = ?entry.storage_path,
                        "stored entry records a different path, keeping file"
                    );
                }
                Ok(())
            }
            // Reclaim deletes the file under the entry's lease.
            Some(entry) if entry.status == EntryStatus::Tombstoned => Ok(()),
            Some(entry) => {
                if self.config.dry_run {
                    info!(content_id = %id, status = %entry.status, "DRY-RUN: would tombstone unreferenced entry");
                    pass.stats.orphans_tombstoned += 1;
                    return Ok(());
                }
                if self.try_tombstone(&id, pass).await? {
                    info!(content_id = %id, status = %entry.status, key = %file.key, "tombstoned entry of orphaned file");
                    pass.stats.orphans_tombstoned += 1;
                }
                Ok(())
            }
            None => self.delete_orphan(file, hash, pass).await,
        }
    }

    /// Delete a file no entry refers to, re-checking its age and the
    /// manifest right before the delete.
    ///
    /// The file is withdrawn from its key before the final manifest check.
    /// A download finalizing after that lands its own copy, and an entry
    /// that appeared before it gets the withdrawn file back.
    async fn delete_orphan(
        &self,
        file: &ListedObject,
        hash: ContentHash,
        pass: &mut Pass<'_>,
    ) -> SweepResult<()> {
        let id = ContentId::from_hash(hash);
        let meta = match self.storage.head(&file.key).await {
            Ok(meta) => meta,
            Err(e) if e.is_not_found() => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        let age = file_age(meta.last_modified, OffsetDateTime::now_utc(), self.grace());
        if age < self.grace() {
            debug!(key = %file.key, "orphan was rewritten during the sweep, keeping");
            pass.stats.within_grace += 1;
            return Ok(());
        }
        if self.manifest.get_entry(&id).await?.is_some() {
            debug!(key = %file.key, content_id = %id, "entry appeared for orphan, keeping");
            return Ok(());
        }

        if self.config.dry_run {
            info!(key = %file.key, age_secs = age.whole_seconds(), "DRY-RUN: would delete orphaned file");
            pass.stats.orphans_deleted += 1;
            return Ok(());
        }

        let withdrawn = match self.storage.withdraw(&file.key).await {
            Ok(key) => key,
            Err(e) if e.is_not_found() => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        if self.manifest.get_entry(&id).await?.is_some() {
            self.restore_orphan(&file.key, withdrawn, hash, meta.size).await?;
            return Ok(());
        }

        self.delete_file(&withdrawn).await?;
        info!(key = %file.key, age_secs = age.whole_seconds(), size = meta.size, "deleted orphaned file");
        pass.stats.orphans_deleted += 1;
        Ok(())
    }

    /// Put a withdrawn orphan back for the entry that claimed it, unless a
    /// download already finalized its own copy.
    async fn restore_orphan(
        &self,
        key: &str,
        withdrawn: String,
        hash: ContentHash,
        size: u64,
    ) -> SweepResult<()> {
        if self.storage.exists(key).await? {
            debug!(key = %key, "entry appeared for orphan and its file was rewritten, dropping old copy");
            return self.delete_file(&withdrawn).await;
        }
        let staged = StagedObject {
            key: withdrawn,
            size,
            hash,
        };
        self.storage.finalize(&staged).await?;
        debug!(key = %key, "entry appeared for orphan, file restored");
        Ok(())
    }

    /// Tombstone stored entries past `max_age`, then the oldest stored
    /// entries while the stored total exceeds `max_total_bytes`.
    async fn apply_retention(&self, pass: &mut Pass<'_>) -> SweepResult<()> {
        let mut expired_bytes = 0u64;

        if let Some(cutoff) = self.retention.age_cutoff(pass.now) {
            let cancel = pass.cancel;
            let mut entries = pin!(
                self.manifest
                    .scan(&[EntryStatus::Stored], self.config.batch_size)
                    .take_until(cancel.cancelled())
                    .take(self.limit())
            );

            while let Some(entry) = entries.next().await {
                let entry = entry?;
                if entry.created_at >= cutoff {
                    continue;
                }
                match self.retire(&entry, Retire::Expired, pass).await {
                    Ok(true) => expired_bytes += entry.size_bytes.unwrap_or(0),
                    Ok(false) => {}
                    Err(e) => {
                        warn!(content_id = %entry.content_id, error = %e, "retention check failed");
                        pass.stats.errors += 1;
                    }
                }
            }
        }

        if self.retention.max_total_bytes.is_none() || pass.cancel.is_cancelled() {
            return Ok(());
        }

        let (_, mut stored_bytes) = self.manifest.stored_totals().await?;
        if self.config.dry_run {
            stored_bytes = stored_bytes.saturating_sub(expired_bytes);
        }
        let mut excess = self.retention.excess_bytes(stored_bytes);
        if excess == 0 {
            return Ok(());
        }
        info!(stored_bytes, excess, "stored total over capacity");

        let limit = self.limit();
        let mut visited = 0usize;
        let mut after: Option<(OffsetDateTime, ContentId)> = None;
        'pages: while excess > 0 && visited < limit && !pass.cancel.is_cancelled() {
            let page = self
                .manifest
                .oldest_stored(after, self.config.batch_size)
                .await?;
            if page.is_empty() {
                break;
            }
            for entry in page {
                after = Some((entry.created_at, entry.content_id));
                visited += 1;
                // Already counted by the age pass of this dry run.
                let counted = self.config.dry_run && self.retention.is_expired(&entry, pass.now);
                if !counted {
                    match self.retire(&entry, Retire::OverCapacity, pass).await {
                        Ok(true) => excess = excess.saturating_sub(entry.size_bytes.unwrap_or(0)),
                        Ok(false) => {}
                        Err(e) => {
                            warn!(content_id = %entry.content_id, error = %e, "capacity check failed");
                            pass.stats.errors += 1;
                        }
                    }
                }
                if excess == 0 || visited >= limit || pass.cancel.is_cancelled() {
                    break 'pages;
                }
            }
        }
        if excess > 0 {
            warn!(excess, "stored total still over capacity after this sweep");
        }
        Ok(())
    }

    /// Tombstone a stored entry. Returns whether it was (or in a dry run,
    /// would be) tombstoned.
    async fn retire(
        &self,
        entry: &ManifestEntry,
        reason: Retire,
        pass: &mut Pass<'_>,
    ) -> SweepResult<bool> {
        if entry.has_active_lease(OffsetDateTime::now_utc()) {
            debug!(content_id = %entry.content_id, "leased, not retiring this run");
            pass.stats.tombstone_refused += 1;
            return Ok(false);
        }

        let retired = if self.config.dry_run {
            info!(content_id = %entry.content_id, reason = ?reason, size = ?entry.size_bytes, "DRY-RUN: would tombstone");
            true
        } else {
            let done = self.try_tombstone(&entry.content_id, pass).await?;
            if done {
                info!(content_id = %entry.content_id, reason = ?reason, size = ?entry.size_bytes, "tombstoned");
            }
            done
        };

        if retired {
            match reason {
                Retire::Expired => pass.stats.expired_tombstoned += 1,
                Retire::OverCapacity => pass.stats.capacity_tombstoned += 1,
            }
        }
        Ok(retired)
    }

    /// Tombstone, treating a refusal as "try again next run".
    async fn try_tombstone(&self, id: &ContentId, pass: &mut Pass<'_>) -> SweepResult<bool> {
        match self.manifest.tombstone(id).await {
            Ok(()) => Ok(true),
            Err(e) if e.is_contention() || matches!(e, MetadataError::NotFound(_)) => {
                debug!(content_id = %id, error = %e, "tombstone refused");
                pass.stats.tombstone_refused += 1;
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Check every stored entry against its file.
    async fn verify(&self, pass: &mut Pass<'_>) -> SweepResult<()> {
        let cancel = pass.cancel;
        let mut entries = pin!(
            self.manifest
                .scan(&[EntryStatus::Stored], self.config.batch_size)
                .take_until(cancel.cancelled())
                .take(self.limit())
        );

        while let Some(entry) = entries.next().await {
            let entry = entry?;
            if let Err(e) = self.verify_entry(&entry, pass).await {
                warn!(content_id = %entry.content_id, error = %e, "verification failed, will retry next run");
                pass.stats.errors += 1;
            }
        }
        Ok(())
    }

    async fn verify_entry(&self, entry: &ManifestEntry, pass: &mut Pass<'_>) -> SweepResult<()> {
        let id = entry.content_id;
        if entry.has_active_lease(OffsetDateTime::now_utc()) {
            pass.stats.busy_skipped += 1;
            return Ok(());
        }
        let Some(key) = entry
            .storage_path
            .clone()
            .or_else(|| id.content_hash().map(|h| object_key(&h)))
        else {
            return Ok(());
        };

        let present = self.storage.exists(&key).await?;
        if present && !self.config.verify_hashes {
            if !self.config.dry_run {
                self.manifest.touch_verified(&id, OffsetDateTime::now_utc()).await?;
            }
            pass.stats.verified += 1;
            return Ok(());
        }

        // Everything from here may change the entry's state.
        if !self.config.dry_run {
            match self
                .manifest
                .acquire_lease_if(&id, &pass.holder, self.lease_ttl, EntryStatus::Stored)
                .await
            {
                Ok(_) => {}
                Err(e) if e.is_contention() || matches!(e, MetadataError::NotFound(_)) => {
                    pass.stats.busy_skipped += 1;
                    return Ok(());
                }
                Err(e) => return Err(e.into()),
            }
        }

        let result = self.judge_and_apply(entry, &key, present, pass).await;
        if result.is_err() && !self.config.dry_run {
            self.release(&id, &pass.holder).await;
        }
        result
    }

    async fn judge_and_apply(
        &self,
        entry: &ManifestEntry,
        key: &str,
        present: bool,
        pass: &mut Pass<'_>,
    ) -> SweepResult<()> {
        let id = entry.content_id;
        let verdict = match (present, id.content_hash()) {
            (false, _) => Verdict::Missing,
            (true, Some(expected)) => match self.hash_file(key).await {
                Ok(actual) if actual == expected => Verdict::Intact,
                Ok(actual) => Verdict::Corrupt(actual),
                Err(SweepError::Storage(e)) if e.is_not_found() => Verdict::Missing,
                Err(e) => return Err(e),
            },
            (true, None) => Verdict::Intact,
        };

        let dry_run = self.config.dry_run;
        match verdict {
            Verdict::Intact => {
                if !dry_run {
                    self.manifest.touch_verified(&id, OffsetDateTime::now_utc()).await?;
                    self.release(&id, &pass.holder).await;
                }
                pass.stats.verified += 1;
            }
            Verdict::Missing => {
                if dry_run {
                    info!(content_id = %id, key, "DRY-RUN: would mark entry with missing file failed");
                } else {
                    warn!(content_id = %id, key, "stored file missing, marking failed for re-fetch");
                    self.manifest
                        .mark_failed(&id, &pass.holder, "stored file missing")
                        .await?;
                }
                pass.stats.missing_failed += 1;
            }
            Verdict::Corrupt(actual) => {
                if dry_run {
                    info!(content_id = %id, key, actual = %actual, "DRY-RUN: would quarantine corrupt file");
                } else {
                    let quarantined = self.storage.quarantine(key).await?;
                    warn!(
                        content_id = %id,
                        key,
                        quarantine = %quarantined,
                        actual = %actual,
                        "stored file does not match its hash, quarantined"
                    );
                    self.manifest
                        .mark_failed(&id, &pass.holder, &format!("stored file hash mismatch: got {actual}"))
                        .await?;
                }
                pass.stats.corrupt_quarantined += 1;
            }
        }
        Ok(())
    }

    async fn hash_file(&self, key: &str) -> SweepResult<ContentHash> {
        let mut body = self.storage.get_stream(key).await?;
        let mut hasher = ContentHash::hasher();
        while let Some(chunk) = body.next().await {
            hasher.update(&chunk?);
        }
        Ok(hasher.finalize())
    }

    /// Delete the files of tombstoned entries and remove their rows.
    async fn reclaim(&self, pass: &mut Pass<'_>) -> SweepResult<()> {
        let cancel = pass.cancel;
        let mut entries = pin!(
            self.manifest
                .scan(&[EntryStatus::Tombstoned], self.config.batch_size)
                .take_until(cancel.cancelled())
                .take(self.limit())
        );

        while let Some(entry) = entries.next().await {
            let entry = entry?;
            if let Err(e) = self.reclaim_entry(&entry, pass).await {
                warn!(content_id = %entry.content_id, error = %e, "reclaim failed, will retry next run");
                pass.stats.errors += 1;
            }
        }
        Ok(())
    }

    async fn reclaim_entry(&self, entry: &ManifestEntry, pass: &mut Pass<'_>) -> SweepResult<()> {
        let id = entry.content_id;
        let key = id.content_hash().map(|h| object_key(&h));

        if self.config.dry_run {
            info!(content_id = %id, key = ?key, "DRY-RUN: would delete tombstoned entry");
            pass.stats.reclaimed += 1;
            return Ok(());
        }

        // The scanned row may be stale: only a lease taken while the entry is
        // still tombstoned allows the delete.
        match self
            .manifest
            .acquire_lease_if(&id, &pass.holder, self.lease_ttl, EntryStatus::Tombstoned)
            .await
        {
            Ok(_) => {}
            Err(e) if e.is_contention() || matches!(e, MetadataError::NotFound(_)) => {
                debug!(content_id = %id, error = %e, "tombstoned entry busy or changed, skipping");
                pass.stats.busy_skipped += 1;
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        }

        if let Some(key) = &key {
            match self.storage.delete(key).await {
                Ok(()) => {
                    pass.stats.files_deleted += 1;
                    pass.stats.bytes_reclaimed += entry.size_bytes.unwrap_or(0);
                }
                Err(e) if e.is_not_found() => {
                    debug!(content_id = %id, key = %key, "file already gone");
                }
                Err(e) => {
                    self.release(&id, &pass.holder).await;
                    return Err(e.into());
                }
            }
        }

        if self.manifest.remove_tombstoned(&id, &pass.holder).await? {
            info!(content_id = %id, key = ?key, "reclaimed");
            pass.stats.reclaimed += 1;
        } else {
            debug!(content_id = %id, "entry changed during reclaim, keeping row");
            self.release(&id, &pass.holder).await;
        }
        Ok(())
    }

    async fn delete_file(&self, key: &str) -> SweepResult<()> {
        match self.storage.delete(key).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn release(&self, id: &ContentId, holder: &str) {
        if let Err(e) = self.manifest.release_lease(id, holder).await {
            warn!(content_id = %id, error = %e, "failed to release lease, it will expire");
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Phase {
    Staged,
    Objects,
    Retention,
    Verify,
    Reclaim,
}
