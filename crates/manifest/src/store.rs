//! Manifest store trait and SQLite implementation.

use crate::error::{ConflictReason, MetadataError, MetadataResult};
use crate::repos::{EntryRepo, LeaseRepo, RunRepo};
use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Pool, Sqlite};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

/// Combined manifest store trait.
#[async_trait]
pub trait ManifestStore: EntryRepo + LeaseRepo + RunRepo + Send + Sync {
    /// Create tables and indexes if missing.
    async fn migrate(&self) -> MetadataResult<()>;

    /// Check database connectivity.
    async fn health_check(&self) -> MetadataResult<()>;
}

/// SQLite-based manifest store.
///
/// Several processes may open the same database file. WAL mode lets readers
/// proceed during writes and the busy timeout serializes writers.
///
/// Lease-guarded transitions and point lookups use the single writer
/// connection. Scans and reports go through a separate read-only pool.
pub struct SqliteStore {
    pool: Pool<Sqlite>,
    reader: Pool<Sqlite>,
}

impl SqliteStore {
    /// Open (creating if needed) the database at `path` and migrate it.
    pub async fn new(path: impl AsRef<Path>, busy_timeout: Duration) -> MetadataResult<Self> {
        Self::open(path.as_ref(), None, busy_timeout).await
    }

    /// Like `new`, with read-only sessions opened on `readonly_path`.
    ///
    /// `readonly_path` must name the same database, e.g. through a read-only
    /// mount. It is opened after the writer has migrated the schema.
    pub async fn open(
        path: &Path,
        readonly_path: Option<&Path>,
        busy_timeout: Duration,
    ) -> MetadataResult<Self> {

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }

        let opts = SqliteConnectOptions::from_str(&format!("sqlite:{}?mode=rwc", path.display()))?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
            .foreign_keys(true)
            .busy_timeout(busy_timeout);

        let pool = SqlitePoolOptions::new()
            // One writer per process; cross-process writers wait on busy_timeout.
            .max_connections(1)
            .connect_with(opts)
            .await?;

        sqlx::query(SCHEMA_SQL).execute(&pool).await?;

        let readonly_path = readonly_path.unwrap_or(path);
        let reader_opts =
            SqliteConnectOptions::from_str(&format!("sqlite:{}?mode=ro", readonly_path.display()))?
                .read_only(true)
                .busy_timeout(busy_timeout);
        let reader = SqlitePoolOptions::new()
            .max_connections(READER_CONNECTIONS)
            .connect_with(reader_opts)
            .await?;

        tracing::debug!(
            path = %path.display(),
            readonly_path = %readonly_path.display(),
            "opened sqlite manifest"
        );
        Ok(Self { pool, reader })
    }

    /// Get a reference to the writer connection pool.
    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    /// Get a reference to the read-only connection pool.
    pub fn reader(&self) -> &Pool<Sqlite> {
        &self.reader
    }
}

const READER_CONNECTIONS: u32 = 4;

#[async_trait]
impl ManifestStore for SqliteStore {
    async fn migrate(&self) -> MetadataResult<()> {
        sqlx::query(SCHEMA_SQL).execute(&self.pool).await?;
        Ok(())
    }

    async fn health_check(&self) -> MetadataResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        sqlx::query("SELECT 1").execute(&self.reader).await?;
        Ok(())
    }
}

// Implement all the repository traits for SqliteStore
mod sqlite_impl {
    use super::*;
    use crate::models::*;
    use crate::repos::entries::{ManifestStats, StatusCount, Upserted};
    use crate::repos::leases::Resolution;
    use crate::repos::runs::{RunKind, RunState};
    use crate::scan::{ScanCursor, ScanPage};
    use hoard_core::{ContentHash, ContentId, EntryStatus, Lease, ManifestEntry, SourceRef};
    use sqlx::{QueryBuilder, SqliteConnection};
    use time::OffsetDateTime;
    use uuid::Uuid;

    async fn fetch_entry(
        conn: &mut SqliteConnection,
        content_id: &ContentId,
    ) -> MetadataResult<Option<ManifestEntry>> {
        let row = sqlx::query_as::<_, EntryRow>("SELECT * FROM entries WHERE content_id = ?")
            .bind(content_id.to_string())
            .fetch_optional(&mut *conn)
            .await?;
        row.map(ManifestEntry::try_from).transpose()
    }

    /// Explain why a holder-guarded update matched no row.
    fn guard_violation(
        content_id: &ContentId,
        holder: &str,
        entry: Option<ManifestEntry>,
    ) -> MetadataError {
        match entry {
            None => MetadataError::NotFound(format!("entry {content_id} not found")),
            Some(e) if !e.lease.as_ref().is_some_and(|l| l.is_held_by(holder)) => {
                MetadataError::conflict(*content_id, ConflictReason::LeaseLost)
            }
            Some(e) => MetadataError::conflict(
                *content_id,
                ConflictReason::StateChanged {
                    status: e.status.to_string(),
                },
            ),
        }
    }

    fn rows_to_entries(rows: Vec<EntryRow>) -> MetadataResult<Vec<ManifestEntry>> {
        rows.into_iter().map(ManifestEntry::try_from).collect()
    }

    #[async_trait]
    impl EntryRepo for SqliteStore {
        async fn upsert_pending(
            &self,
            source: &SourceRef,
            failure_cooldown: time::Duration,
        ) -> MetadataResult<Upserted> {
            let now = OffsetDateTime::now_utc();
            let now_ms = to_millis(now);
            let advertised = source.advertised.map(|h| h.to_hex());

            let mut tx = self.pool.begin().await?;

            // A write first so the transaction takes the write lock up front.
            let known: Option<String> = sqlx::query_scalar(
                "UPDATE sources SET advertised_hash = COALESCE(?, advertised_hash) \
                 WHERE source_ref = ? RETURNING content_id",
            )
            .bind(&advertised)
            .bind(&source.source_ref)
            .fetch_optional(&mut *tx)
            .await?;

            let content_id = match known {
                Some(id) => id.parse::<ContentId>()?,
                None => source
                    .advertised
                    .map(ContentId::from_hash)
                    .unwrap_or_else(|| ContentId::provisional_for(&source.source_ref)),
            };

            let created = sqlx::query(
                "INSERT INTO entries (content_id, source_ref, status, attempts, created_at, updated_at) \
                 VALUES (?, ?, 'pending', 0, ?, ?) ON CONFLICT(content_id) DO NOTHING",
            )
            .bind(content_id.to_string())
            .bind(&source.source_ref)
            .bind(now_ms)
            .bind(now_ms)
            .execute(&mut *tx)
            .await?
            .rows_affected()
                == 1;

            let requeued = if created {
                false
            } else {
                sqlx::query(
                    "UPDATE entries SET status = 'pending', updated_at = ? \
                     WHERE content_id = ? AND status = 'failed' AND updated_at <= ? \
                       AND (lease_holder IS NULL OR lease_expires_at <= ?)",
                )
                .bind(now_ms)
                .bind(content_id.to_string())
                .bind(shifted_millis(now, -failure_cooldown))
                .bind(now_ms)
                .execute(&mut *tx)
                .await?
                .rows_affected()
                    == 1
            };

            sqlx::query(
                "INSERT INTO sources (source_ref, content_id, advertised_hash, discovered_at) \
                 VALUES (?, ?, ?, ?) ON CONFLICT(source_ref) DO NOTHING",
            )
            .bind(&source.source_ref)
            .bind(content_id.to_string())
            .bind(&advertised)
            .bind(now_ms)
            .execute(&mut *tx)
            .await?;

            tx.commit().await?;

            tracing::debug!(
                source_ref = %source.source_ref,
                content_id = %content_id,
                created,
                requeued,
                "upserted discovery"
            );
            Ok(Upserted {
                content_id,
                created,
                requeued,
            })
        }

        async fn get_entry(&self, content_id: &ContentId) -> MetadataResult<Option<ManifestEntry>> {
            let mut conn = self.pool.acquire().await?;
            fetch_entry(&mut conn, content_id).await
        }

        async fn get_entry_by_source(
            &self,
            source_ref: &str,
        ) -> MetadataResult<Option<ManifestEntry>> {
            let row = sqlx::query_as::<_, EntryRow>(
                "SELECT e.* FROM entries e JOIN sources s ON s.content_id = e.content_id \
                 WHERE s.source_ref = ?",
            )
            .bind(source_ref)
            .fetch_optional(&self.pool)
            .await?;
            row.map(ManifestEntry::try_from).transpose()
        }

        async fn list_sources(&self, content_id: &ContentId) -> MetadataResult<Vec<SourceRow>> {
            let rows = sqlx::query_as::<_, SourceRow>(
                "SELECT * FROM sources WHERE content_id = ? ORDER BY discovered_at, source_ref",
            )
            .bind(content_id.to_string())
            .fetch_all(&self.reader)
            .await?;
            Ok(rows)
        }

        async fn scan_page(
            &self,
            statuses: &[EntryStatus],
            cursor: &ScanCursor,
            limit: u32,
        ) -> MetadataResult<ScanPage> {
            let mut qb = QueryBuilder::<Sqlite>::new("SELECT * FROM entries WHERE created_at <= ");
            qb.push_bind(to_millis(cursor.snapshot_at));
            if !statuses.is_empty() {
                qb.push(" AND status IN (");
                let mut list = qb.separated(", ");
                for status in statuses {
                    list.push_bind(status.as_str());
                }
                list.push_unseparated(")");
            }
            if let Some(after) = &cursor.after {
                let created_ms = to_millis(after.created_at);
                qb.push(" AND (created_at > ");
                qb.push_bind(created_ms);
                qb.push(" OR (created_at = ");
                qb.push_bind(created_ms);
                qb.push(" AND content_id > ");
                qb.push_bind(after.content_id.to_string());
                qb.push("))");
            }
            qb.push(" ORDER BY created_at, content_id LIMIT ");
            qb.push_bind(i64::from(limit));

            let rows: Vec<EntryRow> = qb.build_query_as().fetch_all(&self.reader).await?;
            let entries = rows_to_entries(rows)?;
            let next = if entries.len() as u32 == limit {
                entries.last().map(|last| cursor.advance(last))
            } else {
                None
            };
            Ok(ScanPage { entries, next })
        }

        async fn oldest_stored(
            &self,
            after: Option<(OffsetDateTime, ContentId)>,
            limit: u32,
        ) -> MetadataResult<Vec<ManifestEntry>> {
            let (created_ms, after_id) = match after {
                Some((created_at, id)) => (to_millis(created_at), id.to_string()),
                None => (i64::MIN, String::new()),
            };
            let rows = sqlx::query_as::<_, EntryRow>(
                "SELECT * FROM entries WHERE status = 'stored' \
                   AND (created_at > ? OR (created_at = ? AND content_id > ?)) \
                 ORDER BY created_at, content_id LIMIT ?",
            )
            .bind(created_ms)
            .bind(created_ms)
            .bind(after_id)
            .bind(i64::from(limit))
            .fetch_all(&self.reader)
            .await?;
            rows_to_entries(rows)
        }

        async fn stored_totals(&self) -> MetadataResult<(u64, u64)> {
            let (count, bytes): (i64, i64) = sqlx::query_as(
                "SELECT COUNT(*), COALESCE(SUM(size_bytes), 0) FROM entries WHERE status = 'stored'",
            )
            .fetch_one(&self.reader)
            .await?;
            Ok((count as u64, bytes as u64))
        }

        async fn stats(&self) -> MetadataResult<ManifestStats> {
            let rows: Vec<(String, i64, i64)> = sqlx::query_as(
                "SELECT status, COUNT(*), COALESCE(SUM(size_bytes), 0) FROM entries \
                 GROUP BY status ORDER BY status",
            )
            .fetch_all(&self.reader)
            .await?;
            let sources: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM sources")
                .fetch_one(&self.reader)
                .await?;

            let by_status = rows
                .into_iter()
                .map(|(status, count, bytes)| -> MetadataResult<StatusCount> {
                    Ok(StatusCount {
                        status: status.parse::<EntryStatus>()?,
                        count: count as u64,
                        bytes: bytes as u64,
                    })
                })
                .collect::<MetadataResult<Vec<_>>>()?;
            Ok(ManifestStats {
                by_status,
                sources: sources as u64,
            })
        }

        async fn touch_verified(
            &self,
            content_id: &ContentId,
            at: OffsetDateTime,
        ) -> MetadataResult<bool> {
            let result = sqlx::query(
                "UPDATE entries SET last_verified_at = ? WHERE content_id = ? AND status = 'stored'",
            )
            .bind(to_millis(at))
            .bind(content_id.to_string())
            .execute(&self.pool)
            .await?;
            Ok(result.rows_affected() == 1)
        }

        async fn requeue_failed(&self, older_than: OffsetDateTime) -> MetadataResult<u64> {
            let now_ms = to_millis(OffsetDateTime::now_utc());
            let result = sqlx::query(
                "UPDATE entries SET status = 'pending', updated_at = ? \
                 WHERE status = 'failed' AND updated_at <= ? \
                   AND (lease_holder IS NULL OR lease_expires_at <= ?)",
            )
            .bind(now_ms)
            .bind(to_millis(older_than))
            .bind(now_ms)
            .execute(&self.pool)
            .await?;
            Ok(result.rows_affected())
        }
    }

    impl SqliteStore {
        async fn grant_lease(
            &self,
            content_id: &ContentId,
            holder: &str,
            ttl: time::Duration,
            status: Option<EntryStatus>,
        ) -> MetadataResult<Lease> {
            let guard = if status.is_some() { " AND status = ?" } else { "" };
            let sql = format!(
                "UPDATE entries SET lease_holder = ?, lease_expires_at = ? \
                 WHERE content_id = ? \
                   AND (lease_holder IS NULL OR lease_holder = ? OR lease_expires_at <= ?){guard}"
            );

            // The diagnosis read can observe a lease released right after the
            // update missed; one retry covers that window.
            for _ in 0..2 {
                let now = OffsetDateTime::now_utc();
                let now_ms = to_millis(now);
                let expires_ms = shifted_millis(now, ttl);
                let mut query = sqlx::query(&sql)
                    .bind(holder)
                    .bind(expires_ms)
                    .bind(content_id.to_string())
                    .bind(holder)
                    .bind(now_ms);
                if let Some(status) = status {
                    query = query.bind(status.as_str());
                }
                let result = query.execute(&self.pool).await?;

                if result.rows_affected() == 1 {
                    return Ok(Lease {
                        holder: holder.to_string(),
                        expires_at: from_millis(expires_ms)?,
                    });
                }

                let current: Option<(Option<String>, Option<i64>, String)> = sqlx::query_as(
                    "SELECT lease_holder, lease_expires_at, status FROM entries WHERE content_id = ?",
                )
                .bind(content_id.to_string())
                .fetch_optional(&self.pool)
                .await?;
                match current {
                    None => {
                        return Err(MetadataError::NotFound(format!(
                            "entry {content_id} not found"
                        )));
                    }
                    Some((Some(other), Some(expires_at), _))
                        if other != holder
                            && expires_at > to_millis(OffsetDateTime::now_utc()) =>
                    {
                        return Err(MetadataError::Busy {
                            content_id: *content_id,
                            holder: other,
                            expires_at: from_millis(expires_at)?,
                        });
                    }
                    Some((_, _, current))
                        if status.is_some_and(|wanted| wanted.as_str() != current) =>
                    {
                        return Err(MetadataError::conflict(
                            *content_id,
                            ConflictReason::StateChanged { status: current },
                        ));
                    }
                    Some(_) => continue,
                }
            }
            Err(MetadataError::Internal(format!(
                "lease on {content_id} kept changing during acquisition"
            )))
        }
    }

    #[async_trait]
    impl LeaseRepo for SqliteStore {
        async fn acquire_lease(
            &self,
            content_id: &ContentId,
            holder: &str,
            ttl: time::Duration,
        ) -> MetadataResult<Lease> {
            self.grant_lease(content_id, holder, ttl, None).await
        }

        async fn acquire_lease_if(
            &self,
            content_id: &ContentId,
            holder: &str,
            ttl: time::Duration,
            status: EntryStatus,
        ) -> MetadataResult<Lease> {
            self.grant_lease(content_id, holder, ttl, Some(status)).await
        }

        async fn release_lease(&self, content_id: &ContentId, holder: &str) -> MetadataResult<bool> {
            let result = sqlx::query(
                "UPDATE entries SET lease_holder = NULL, lease_expires_at = NULL \
                 WHERE content_id = ? AND lease_holder = ?",
            )
            .bind(content_id.to_string())
            .bind(holder)
            .execute(&self.pool)
            .await?;
            Ok(result.rows_affected() == 1)
        }

        async fn begin_download(&self, content_id: &ContentId, holder: &str) -> MetadataResult<bool> {
            let result = sqlx::query(
                "UPDATE entries SET status = 'downloading', attempts = attempts + 1, updated_at = ? \
                 WHERE content_id = ? AND lease_holder = ? AND status IN ('pending', 'downloading')",
            )
            .bind(to_millis(OffsetDateTime::now_utc()))
            .bind(content_id.to_string())
            .bind(holder)
            .execute(&self.pool)
            .await?;
            if result.rows_affected() == 1 {
                return Ok(true);
            }

            let mut conn = self.pool.acquire().await?;
            match fetch_entry(&mut conn, content_id).await? {
                Some(e) if e.lease.as_ref().is_some_and(|l| l.is_held_by(holder)) => Ok(false),
                other => Err(guard_violation(content_id, holder, other)),
            }
        }

        async fn resolve_content(
            &self,
            content_id: &ContentId,
            holder: &str,
            ttl: time::Duration,
            hash: ContentHash,
        ) -> MetadataResult<Resolution> {
            let now = OffsetDateTime::now_utc();
            let now_ms = to_millis(now);
            let expires_ms = shifted_millis(now, ttl);

            let mut tx = self.pool.begin().await?;

            // Refresh the caller's lease; this is also the ownership check.
            let status: Option<String> = sqlx::query_scalar(
                "UPDATE entries SET lease_expires_at = ? \
                 WHERE content_id = ? AND lease_holder = ? RETURNING status",
            )
            .bind(expires_ms)
            .bind(content_id.to_string())
            .bind(holder)
            .fetch_optional(&mut *tx)
            .await?;

            let Some(status) = status else {
                let entry = fetch_entry(&mut tx, content_id).await?;
                return Err(guard_violation(content_id, holder, entry));
            };
            let status = status.parse::<EntryStatus>()?;
            if !matches!(status, EntryStatus::Pending | EntryStatus::Downloading) {
                return Err(MetadataError::conflict(
                    *content_id,
                    ConflictReason::StateChanged {
                        status: status.to_string(),
                    },
                ));
            }

            if let Some(expected) = content_id.content_hash() {
                if expected != hash {
                    return Err(MetadataError::conflict(
                        *content_id,
                        ConflictReason::HashMismatch {
                            expected,
                            actual: hash,
                        },
                    ));
                }
                tx.commit().await?;
                return Ok(Resolution::Claimed(*content_id));
            }

            // Any source that advertised a different hash makes the payload suspect.
            let advertised: Option<String> = sqlx::query_scalar(
                "SELECT advertised_hash FROM sources \
                 WHERE content_id = ? AND advertised_hash IS NOT NULL AND advertised_hash != ? \
                 LIMIT 1",
            )
            .bind(content_id.to_string())
            .bind(hash.to_hex())
            .fetch_optional(&mut *tx)
            .await?;
            if let Some(advertised) = advertised {
                return Err(MetadataError::conflict(
                    *content_id,
                    ConflictReason::HashMismatch {
                        expected: ContentHash::from_hex(&advertised)?,
                        actual: hash,
                    },
                ));
            }

            let target = ContentId::from_hash(hash);
            let resolution = match fetch_entry(&mut tx, &target).await? {
                None => {
                    // Provenance follows through ON UPDATE CASCADE.
                    sqlx::query(
                        "UPDATE entries SET content_id = ?, updated_at = ? WHERE content_id = ?",
                    )
                    .bind(target.to_string())
                    .bind(now_ms)
                    .bind(content_id.to_string())
                    .execute(&mut *tx)
                    .await?;
                    Resolution::Claimed(target)
                }
                Some(existing) => {
                    if let Some(lease) = existing.lease.as_ref()
                        && lease.is_active_at(now)
                        && !lease.is_held_by(holder)
                    {
                        return Err(MetadataError::Busy {
                            content_id: target,
                            holder: lease.holder.clone(),
                            expires_at: lease.expires_at,
                        });
                    }
                    if existing.status == EntryStatus::Tombstoned {
                        // The sweeper may be deleting the file right now.
                        return Err(MetadataError::conflict(
                            target,
                            ConflictReason::StateChanged {
                                status: existing.status.to_string(),
                            },
                        ));
                    }
                    let already_stored = existing.status == EntryStatus::Stored;

                    sqlx::query(
                        "UPDATE entries SET lease_holder = ?, lease_expires_at = ?, updated_at = ?, \
                           status = CASE WHEN status = 'stored' THEN status ELSE 'downloading' END \
                         WHERE content_id = ?",
                    )
                    .bind(holder)
                    .bind(expires_ms)
                    .bind(now_ms)
                    .bind(target.to_string())
                    .execute(&mut *tx)
                    .await?;

                    sqlx::query("UPDATE sources SET content_id = ? WHERE content_id = ?")
                        .bind(target.to_string())
                        .bind(content_id.to_string())
                        .execute(&mut *tx)
                        .await?;

                    sqlx::query("DELETE FROM entries WHERE content_id = ?")
                        .bind(content_id.to_string())
                        .execute(&mut *tx)
                        .await?;

                    Resolution::Merged {
                        into: target,
                        already_stored,
                    }
                }
            };

            tx.commit().await?;
            tracing::debug!(
                from = %content_id,
                into = %resolution.content_id(),
                merged = matches!(resolution, Resolution::Merged { .. }),
                "resolved content identity"
            );
            Ok(resolution)
        }

        async fn commit_stored(
            &self,
            content_id: &ContentId,
            holder: &str,
            storage_path: &str,
            size_bytes: u64,
            hash: ContentHash,
        ) -> MetadataResult<()> {
            let Some(expected) = content_id.content_hash() else {
                return Err(MetadataError::conflict(
                    *content_id,
                    ConflictReason::NotContentAddressed,
                ));
            };
            if expected != hash {
                return Err(MetadataError::conflict(
                    *content_id,
                    ConflictReason::HashMismatch {
                        expected,
                        actual: hash,
                    },
                ));
            }

            let now_ms = to_millis(OffsetDateTime::now_utc());
            let result = sqlx::query(
                "UPDATE entries SET status = 'stored', storage_path = ?, size_bytes = ?, \
                   failure_reason = NULL, last_verified_at = ?, updated_at = ?, \
                   lease_holder = NULL, lease_expires_at = NULL \
                 WHERE content_id = ? AND lease_holder = ? AND status IN ('downloading', 'stored')",
            )
            .bind(storage_path)
            .bind(size_bytes as i64)
            .bind(now_ms)
            .bind(now_ms)
            .bind(content_id.to_string())
            .bind(holder)
            .execute(&self.pool)
            .await?;

            if result.rows_affected() == 0 {
                let mut conn = self.pool.acquire().await?;
                let entry = fetch_entry(&mut conn, content_id).await?;
                return Err(guard_violation(content_id, holder, entry));
            }
            Ok(())
        }

        async fn mark_failed(
            &self,
            content_id: &ContentId,
            holder: &str,
            reason: &str,
        ) -> MetadataResult<()> {
            let result = sqlx::query(
                "UPDATE entries SET status = 'failed', storage_path = NULL, failure_reason = ?, \
                   updated_at = ?, lease_holder = NULL, lease_expires_at = NULL \
                 WHERE content_id = ? AND lease_holder = ? AND status != 'tombstoned'",
            )
            .bind(reason)
            .bind(to_millis(OffsetDateTime::now_utc()))
            .bind(content_id.to_string())
            .bind(holder)
            .execute(&self.pool)
            .await?;

            if result.rows_affected() == 0 {
                let mut conn = self.pool.acquire().await?;
                let entry = fetch_entry(&mut conn, content_id).await?;
                return Err(guard_violation(content_id, holder, entry));
            }
            Ok(())
        }

        async fn abandon(&self, content_id: &ContentId, holder: &str) -> MetadataResult<bool> {
            let result = sqlx::query(
                "UPDATE entries SET lease_holder = NULL, lease_expires_at = NULL, updated_at = ?, \
                   status = CASE WHEN status = 'downloading' THEN 'pending' ELSE status END \
                 WHERE content_id = ? AND lease_holder = ?",
            )
            .bind(to_millis(OffsetDateTime::now_utc()))
            .bind(content_id.to_string())
            .bind(holder)
            .execute(&self.pool)
            .await?;
            Ok(result.rows_affected() == 1)
        }

        async fn tombstone(&self, content_id: &ContentId) -> MetadataResult<()> {
            let now = OffsetDateTime::now_utc();
            let now_ms = to_millis(now);
            let result = sqlx::query(
                "UPDATE entries SET status = 'tombstoned', storage_path = NULL, updated_at = ?, \
                   lease_holder = NULL, lease_expires_at = NULL \
                 WHERE content_id = ? AND status != 'downloading' \
                   AND (lease_expires_at IS NULL OR lease_expires_at <= ?)",
            )
            .bind(now_ms)
            .bind(content_id.to_string())
            .bind(now_ms)
            .execute(&self.pool)
            .await?;
            if result.rows_affected() == 1 {
                return Ok(());
            }

            let mut conn = self.pool.acquire().await?;
            match fetch_entry(&mut conn, content_id).await? {
                None => Err(MetadataError::NotFound(format!(
                    "entry {content_id} not found"
                ))),
                Some(ManifestEntry {
                    lease: Some(lease), ..
                }) if lease.is_active_at(now) => Err(MetadataError::Busy {
                    content_id: *content_id,
                    holder: lease.holder,
                    expires_at: lease.expires_at,
                }),
                Some(e) => Err(MetadataError::conflict(
                    *content_id,
                    ConflictReason::StateChanged {
                        status: e.status.to_string(),
                    },
                )),
            }
        }

        async fn remove_tombstoned(
            &self,
            content_id: &ContentId,
            holder: &str,
        ) -> MetadataResult<bool> {
            let result = sqlx::query(
                "DELETE FROM entries \
                 WHERE content_id = ? AND status = 'tombstoned' AND lease_holder = ?",
            )
            .bind(content_id.to_string())
            .bind(holder)
            .execute(&self.pool)
            .await?;
            Ok(result.rows_affected() == 1)
        }
    }

    #[async_trait]
    impl RunRepo for SqliteStore {
        async fn create_run(&self, kind: RunKind) -> MetadataResult<RunRow> {
            let row = RunRow {
                run_id: Uuid::new_v4(),
                kind: kind.as_str().to_string(),
                state: RunState::Running.as_str().to_string(),
                started_at: to_millis(OffsetDateTime::now_utc()),
                finished_at: None,
                stats_json: None,
            };
            sqlx::query(
                "INSERT INTO runs (run_id, kind, state, started_at) VALUES (?, ?, ?, ?)",
            )
            .bind(row.run_id)
            .bind(&row.kind)
            .bind(&row.state)
            .bind(row.started_at)
            .execute(&self.pool)
            .await?;
            Ok(row)
        }

        async fn finish_run(
            &self,
            run_id: Uuid,
            state: RunState,
            stats_json: Option<&str>,
        ) -> MetadataResult<()> {
            let result = sqlx::query(
                "UPDATE runs SET state = ?, finished_at = ?, stats_json = ? WHERE run_id = ?",
            )
            .bind(state.as_str())
            .bind(to_millis(OffsetDateTime::now_utc()))
            .bind(stats_json)
            .bind(run_id)
            .execute(&self.pool)
            .await?;
            if result.rows_affected() == 0 {
                return Err(MetadataError::NotFound(format!("run {run_id} not found")));
            }
            Ok(())
        }

        async fn recent_runs(&self, kind: RunKind, limit: u32) -> MetadataResult<Vec<RunRow>> {
            let rows = sqlx::query_as::<_, RunRow>(
                "SELECT * FROM runs WHERE kind = ? ORDER BY started_at DESC, rowid DESC LIMIT ?",
            )
            .bind(kind.as_str())
            .bind(i64::from(limit))
            .fetch_all(&self.reader)
            .await?;
            Ok(rows)
        }
    }
}

const SCHEMA_SQL: &str = r#"
-- One row per distinct content item
CREATE TABLE IF NOT EXISTS entries (
    content_id TEXT PRIMARY KEY,
    source_ref TEXT NOT NULL,
    storage_path TEXT,
    status TEXT NOT NULL
        CHECK (status IN ('pending', 'downloading', 'stored', 'failed', 'tombstoned')),
    size_bytes INTEGER,
    attempts INTEGER NOT NULL DEFAULT 0,
    failure_reason TEXT,
    lease_holder TEXT,
    lease_expires_at INTEGER,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL,
    last_verified_at INTEGER,
    CHECK ((status = 'stored') = (storage_path IS NOT NULL))
);

CREATE INDEX IF NOT EXISTS idx_entries_status_created
    ON entries (status, created_at, content_id);
CREATE INDEX IF NOT EXISTS idx_entries_created
    ON entries (created_at, content_id);

-- Provenance: every source reference an entry was discovered under
CREATE TABLE IF NOT EXISTS sources (
    source_ref TEXT PRIMARY KEY,
    content_id TEXT NOT NULL
        REFERENCES entries (content_id) ON DELETE CASCADE ON UPDATE CASCADE,
    advertised_hash TEXT,
    discovered_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_sources_content ON sources (content_id);

-- Archiver pass and sweep history
CREATE TABLE IF NOT EXISTS runs (
    run_id BLOB PRIMARY KEY,
    kind TEXT NOT NULL,
    state TEXT NOT NULL,
    started_at INTEGER NOT NULL,
    finished_at INTEGER,
    stats_json TEXT
);

CREATE INDEX IF NOT EXISTS idx_runs_kind_started ON runs (kind, started_at);
"#;
