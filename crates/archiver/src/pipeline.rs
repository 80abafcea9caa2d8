//! Archive pass: discover origin items, then fetch, verify and store them.

use crate::error::{ArchiveError, ArchiveResult, ErrorClass};
use crate::gate::RateGate;
use crate::origin::Origin;
use crate::retry::RetryPolicy;
use futures::StreamExt;
use hoard_core::config::{ArchiverAppConfig, ArchiverConfig};
use hoard_core::{ContentId, EntryStatus, ManifestEntry};
use hoard_manifest::{
    ManifestScanExt, ManifestStore, MetadataError, Resolution, RunKind, RunState,
};
use hoard_storage::{ObjectStore, StagedObject};
use serde::{Deserialize, Serialize};
use std::pin::pin;
use std::sync::Arc;
use time::OffsetDateTime;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// How often a download in progress renews its lease: three times per TTL.
fn lease_refresh_interval(ttl: time::Duration) -> std::time::Duration {
    std::time::Duration::try_from(ttl / 3).unwrap_or_default()
}

/// Statuses picked up by the work phase.
const WORK_STATUSES: &[EntryStatus] = &[EntryStatus::Pending, EntryStatus::Downloading];

/// Counters for one archive pass, stored with its run record.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveStats {
    pub pages_listed: u64,
    pub items_discovered: u64,
    pub entries_created: u64,
    pub entries_requeued: u64,
    pub stored: u64,
    pub bytes_written: u64,
    /// Payloads that turned out to be already stored under another entry.
    pub deduplicated: u64,
    pub failed: u64,
    pub quarantined: u64,
    /// Items owned by someone else, or no longer eligible.
    pub skipped: u64,
    pub abandoned: u64,
    pub retries: u64,
    pub errors: u64,
}

impl ArchiveStats {
    fn record(&mut self, result: ArchiveResult<ItemReport>) {
        let report = match result {
            Ok(report) => report,
            Err(e) => {
                error!(error = %e, "item processing failed");
                self.errors += 1;
                return;
            }
        };
        self.retries += u64::from(report.attempts.saturating_sub(1));
        match report.outcome {
            Outcome::Stored { bytes } => {
                self.stored += 1;
                self.bytes_written += bytes;
            }
            Outcome::Deduplicated => self.deduplicated += 1,
            Outcome::Failed { quarantined } => {
                self.failed += 1;
                if quarantined {
                    self.quarantined += 1;
                }
            }
            Outcome::Skipped => self.skipped += 1,
            Outcome::Abandoned => self.abandoned += 1,
        }
    }
}

#[derive(Debug)]
enum Outcome {
    Stored { bytes: u64 },
    Deduplicated,
    Failed { quarantined: bool },
    Skipped,
    Abandoned,
}

#[derive(Debug)]
struct ItemReport {
    outcome: Outcome,
    attempts: u32,
}

impl ItemReport {
    fn new(outcome: Outcome, attempts: u32) -> Self {
        Self { outcome, attempts }
    }
}

/// The archiver. Cheap to share; one instance runs passes in a loop.
pub struct Archiver {
    manifest: Arc<dyn ManifestStore>,
    storage: Arc<dyn ObjectStore>,
    origin: Arc<dyn Origin>,
    gate: RateGate,
    retry: RetryPolicy,
    lease_ttl: time::Duration,
    config: ArchiverConfig,
}

impl Archiver {
    pub fn new(
        manifest: Arc<dyn ManifestStore>,
        storage: Arc<dyn ObjectStore>,
        origin: Arc<dyn Origin>,
        config: &ArchiverAppConfig,
    ) -> Self {
        Self {
            manifest,
            storage,
            origin,
            gate: RateGate::new(&config.rate_limit),
            retry: RetryPolicy::from_config(&config.retry),
            lease_ttl: config.lease.ttl(),
            config: config.archiver.clone(),
        }
    }

    pub fn manifest(&self) -> &Arc<dyn ManifestStore> {
        &self.manifest
    }

    /// Run one pass and record it in the run history.
    pub async fn run_pass(&self, cancel: &CancellationToken) -> ArchiveResult<ArchiveStats> {
        let run = self.manifest.create_run(RunKind::Archive).await?;
        info!(run_id = %run.run_id, "archive pass started");

        let mut stats = ArchiveStats::default();
        let result = self.execute(&mut stats, cancel).await;

        let state = match &result {
            Ok(()) if cancel.is_cancelled() => RunState::Interrupted,
            Ok(()) => RunState::Finished,
            Err(_) => RunState::Failed,
        };
        let stats_json = serde_json::to_string(&stats).ok();
        if let Err(e) = self
            .manifest
            .finish_run(run.run_id, state, stats_json.as_deref())
            .await
        {
            error!(run_id = %run.run_id, error = %e, "failed to record archive run");
        }

        match &result {
            Ok(()) => info!(
                run_id = %run.run_id,
                state = state.as_str(),
                discovered = stats.items_discovered,
                created = stats.entries_created,
                stored = stats.stored,
                deduplicated = stats.deduplicated,
                failed = stats.failed,
                skipped = stats.skipped,
                bytes = stats.bytes_written,
                "archive pass finished"
            ),
            Err(e) => error!(run_id = %run.run_id, error = %e, "archive pass failed"),
        }
        result.map(|()| stats)
    }

    async fn execute(
        &self,
        stats: &mut ArchiveStats,
        cancel: &CancellationToken,
    ) -> ArchiveResult<()> {
        // A cooldown reaching back past the earliest date never elapses.
        let cutoff = OffsetDateTime::now_utc().checked_sub(self.config.failure_cooldown());
        if let Some(cutoff) = cutoff {
            let requeued = self.manifest.requeue_failed(cutoff).await?;
            if requeued > 0 {
                info!(count = requeued, "re-queued failed entries past their cooldown");
            }
            stats.entries_requeued += requeued;
        }

        if let Err(e) = self.discover(stats, cancel).await {
            // Entries already in the manifest are still worth working on.
            warn!(error = %e, "discovery stopped early");
            stats.errors += 1;
        }
        if cancel.is_cancelled() {
            return Ok(());
        }

        self.work(stats, cancel).await;
        Ok(())
    }

    /// Walk the origin listing and register every item.
    pub async fn discover(
        &self,
        stats: &mut ArchiveStats,
        cancel: &CancellationToken,
    ) -> ArchiveResult<()> {
        let cooldown = self.config.failure_cooldown();
        let mut cursor: Option<String> = None;

        for _ in 0..self.config.max_pages {
            if cancel.is_cancelled() {
                break;
            }

            let page = {
                let (origin, gate, cursor) = (&self.origin, &self.gate, cursor.as_deref());
                self.retry
                    .retry(|_| async move {
                        let _permit = gate.acquire().await?;
                        Ok(origin.list_page(cursor).await?)
                    })
                    .await?
            };
            stats.pages_listed += 1;

            for item in &page.items {
                stats.items_discovered += 1;
                match self
                    .manifest
                    .upsert_pending(&item.to_source_ref(), cooldown)
                    .await
                {
                    Ok(upserted) => {
                        if upserted.created {
                            stats.entries_created += 1;
                        }
                        if upserted.requeued {
                            stats.entries_requeued += 1;
                        }
                        debug!(
                            source_ref = %item.locator(),
                            content_id = %upserted.content_id,
                            created = upserted.created,
                            "discovered"
                        );
                    }
                    Err(e) => {
                        warn!(source_ref = %item.locator(), error = %e, "failed to register item");
                        stats.errors += 1;
                    }
                }
            }

            match page.next_cursor {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }

        Ok(())
    }

    /// Process `pending` and `downloading` entries with bounded concurrency.
    ///
    /// Stops taking new entries once `cancel` fires.
    pub async fn work(&self, stats: &mut ArchiveStats, cancel: &CancellationToken) {
        let entries = self
            .manifest
            .scan(WORK_STATUSES, self.config.scan_batch_size)
            .take_until(cancel.cancelled());

        let mut results = pin!(
            entries
                .map(|entry| async move {
                    match entry {
                        Ok(entry) => self.process_entry(entry, cancel).await,
                        Err(e) => Err(ArchiveError::from(e)),
                    }
                })
                .buffer_unordered(self.config.workers.max(1))
        );

        while let Some(result) = results.next().await {
            stats.record(result);
        }
    }

    async fn process_entry(
        &self,
        entry: ManifestEntry,
        cancel: &CancellationToken,
    ) -> ArchiveResult<ItemReport> {
        if cancel.is_cancelled() {
            return Ok(ItemReport::new(Outcome::Skipped, 0));
        }

        let id = entry.content_id;
        // A fresh holder per attempt: a pass never inherits a stale lease.
        let holder = format!("archiver:{}", Uuid::new_v4());

        match self.manifest.acquire_lease(&id, &holder, self.lease_ttl).await {
            Ok(_) => {}
            Err(e) if e.is_contention() || matches!(e, MetadataError::NotFound(_)) => {
                debug!(content_id = %id, error = %e, "entry owned elsewhere, skipping");
                return Ok(ItemReport::new(Outcome::Skipped, 0));
            }
            Err(e) => return Err(e.into()),
        }

        if !self.manifest.begin_download(&id, &holder).await? {
            self.manifest.release_lease(&id, &holder).await?;
            return Ok(ItemReport::new(Outcome::Skipped, 0));
        }

        let (fetched, attempts) = tokio::select! {
            biased;
            _ = cancel.cancelled() => (Err(ArchiveError::Cancelled), 0),
            res = self.fetch_with_retry(&entry, &holder) => res,
        };

        let staged = match fetched {
            Ok(staged) => staged,
            Err(ArchiveError::Cancelled) => {
                self.manifest.abandon(&id, &holder).await?;
                info!(content_id = %id, "fetch interrupted by shutdown, entry returned to pending");
                return Ok(ItemReport::new(Outcome::Abandoned, attempts));
            }
            Err(e) if e.class() == ErrorClass::Conflict => {
                debug!(content_id = %id, error = %e, "lease lost during fetch");
                return Ok(ItemReport::new(Outcome::Skipped, attempts));
            }
            Err(e) => {
                warn!(
                    content_id = %id,
                    source_ref = %entry.source_ref,
                    attempts,
                    error = %e,
                    "fetch failed"
                );
                self.fail(&id, &holder, &e.to_string()).await?;
                return Ok(ItemReport::new(Outcome::Failed { quarantined: false }, attempts));
            }
        };

        let outcome = self.store(&entry, &holder, staged).await?;
        Ok(ItemReport::new(outcome, attempts))
    }

    /// Fetch into a staged file, retrying transient failures. Returns the
    /// number of attempts made alongside the result.
    async fn fetch_with_retry(
        &self,
        entry: &ManifestEntry,
        holder: &str,
    ) -> (ArchiveResult<StagedObject>, u32) {
        let mut attempts = 0;
        let result = self
            .retry
            .retry(|attempt| {
                attempts = attempt;
                self.fetch_once(entry, holder, attempt)
            })
            .await;
        (result, attempts)
    }

    async fn fetch_once(
        &self,
        entry: &ManifestEntry,
        holder: &str,
        attempt: u32,
    ) -> ArchiveResult<StagedObject> {
        if attempt > 1 {
            // Keep the lease alive across backoff delays.
            self.manifest
                .acquire_lease(&entry.content_id, holder, self.lease_ttl)
                .await?;
        }

        let _permit = self.gate.acquire().await?;
        let mut body = self.origin.fetch(&entry.source_ref).await?;
        let mut write = self.storage.stage().await?;

        // Long downloads outlive a single lease grant.
        let refresh_every = lease_refresh_interval(self.lease_ttl);
        let copied = async {
            let mut refreshed = Instant::now();
            while let Some(chunk) = body.next().await {
                write.write(chunk?).await?;
                if refreshed.elapsed() >= refresh_every {
                    self.manifest
                        .acquire_lease(&entry.content_id, holder, self.lease_ttl)
                        .await?;
                    refreshed = Instant::now();
                }
            }
            Ok::<_, ArchiveError>(())
        }
        .await;

        if let Err(e) = copied {
            let key = write.key().to_string();
            if let Err(abort_err) = write.abort().await {
                warn!(key = %key, error = %abort_err, "failed to discard partial staged file");
            }
            return Err(e);
        }

        let staged = write.finish().await?;
        debug!(
            content_id = %entry.content_id,
            key = %staged.key,
            size = staged.size,
            hash = %staged.hash,
            attempt,
            "payload staged"
        );
        Ok(staged)
    }

    /// Bind the staged payload to its content identity and make it visible.
    async fn store(
        &self,
        entry: &ManifestEntry,
        holder: &str,
        staged: StagedObject,
    ) -> ArchiveResult<Outcome> {
        let id = entry.content_id;
        let resolution = self
            .manifest
            .resolve_content(&id, holder, self.lease_ttl, staged.hash)
            .await;

        let (target, already_stored) = match resolution {
            Ok(Resolution::Claimed(target)) => (target, false),
            Ok(Resolution::Merged {
                into,
                already_stored,
            }) => {
                debug!(from = %id, into = %into, "merged into existing entry");
                (into, already_stored)
            }
            Err(e) => {
                let err = ArchiveError::from(e);
                return match err.class() {
                    ErrorClass::Integrity => {
                        let quarantined = self.quarantine(&staged).await;
                        warn!(
                            content_id = %id,
                            source_ref = %entry.source_ref,
                            hash = %staged.hash,
                            error = %err,
                            "content hash mismatch"
                        );
                        self.fail(&id, holder, &err.to_string()).await?;
                        Ok(Outcome::Failed { quarantined })
                    }
                    ErrorClass::Conflict => {
                        // The same content is being written by someone else;
                        // the entry merges into it on a later pass.
                        debug!(content_id = %id, error = %err, "content owned elsewhere");
                        self.discard(&staged).await;
                        self.manifest.abandon(&id, holder).await?;
                        Ok(Outcome::Skipped)
                    }
                    _ => {
                        self.discard(&staged).await;
                        Err(err)
                    }
                };
            }
        };

        if already_stored && self.existing_file(&target).await? {
            self.discard(&staged).await;
            self.manifest.release_lease(&target, holder).await?;
            info!(content_id = %target, source_ref = %entry.source_ref, "already stored");
            return Ok(Outcome::Deduplicated);
        }

        let key = match self.storage.finalize(&staged).await {
            Ok(key) => key,
            Err(e) => {
                let err = ArchiveError::from(e);
                warn!(content_id = %target, error = %err, "finalize failed");
                self.discard(&staged).await;
                self.fail(&target, holder, &err.to_string()).await?;
                return Ok(Outcome::Failed { quarantined: false });
            }
        };

        match self
            .manifest
            .commit_stored(&target, holder, &key, staged.size, staged.hash)
            .await
        {
            Ok(()) => {
                info!(
                    content_id = %target,
                    source_ref = %entry.source_ref,
                    key = %key,
                    size = staged.size,
                    "stored"
                );
                Ok(Outcome::Stored { bytes: staged.size })
            }
            Err(e) if e.is_contention() => {
                // The file stays; content-addressed keys are shared and
                // unreferenced files age out through the sweeper.
                warn!(content_id = %target, error = %e, "lease lost before commit");
                Ok(Outcome::Skipped)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// True if the target entry's recorded file is present.
    async fn existing_file(&self, target: &ContentId) -> ArchiveResult<bool> {
        let path = self
            .manifest
            .get_entry(target)
            .await?
            .and_then(|entry| entry.storage_path);
        match path {
            Some(path) => Ok(self.storage.exists(&path).await?),
            None => Ok(false),
        }
    }

    async fn fail(&self, id: &ContentId, holder: &str, reason: &str) -> ArchiveResult<()> {
        match self.manifest.mark_failed(id, holder, reason).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_contention() => {
                debug!(content_id = %id, error = %e, "lease lost before marking failed");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn quarantine(&self, staged: &StagedObject) -> bool {
        match self.storage.quarantine(&staged.key).await {
            Ok(key) => {
                warn!(staged = %staged.key, quarantine = %key, "payload quarantined");
                true
            }
            Err(e) => {
                error!(staged = %staged.key, error = %e, "failed to quarantine payload");
                false
            }
        }
    }

    async fn discard(&self, staged: &StagedObject) {
        match self.storage.delete(&staged.key).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => warn!(key = %staged.key, error = %e, "failed to discard staged file"),
        }
    }
}
