mod common;

use bytes::Bytes;
use common::{Reply, StaticOrigin, TestEnv};
use hoard_archiver::ArchiveStats;
use hoard_core::{ContentHash, ContentId, EntryStatus};
use hoard_manifest::{RunKind, RunState};
use hoard_storage::keys::{OBJECTS_PREFIX, QUARANTINE_PREFIX, STAGING_PREFIX};
use hoard_storage::object_key;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[tokio::test]
async fn test_colliding_sources_store_one_entry_per_content() {
    let env = TestEnv::new().await;
    let origin = StaticOrigin::with_items(&[
        ("refs/a", b"shared payload"),
        ("refs/b", b"distinct payload"),
        ("refs/c", b"shared payload"),
    ]);
    let archiver = env.archiver(origin.clone());

    let stats = archiver.run_pass(&CancellationToken::new()).await.unwrap();
    assert_eq!(stats.items_discovered, 3);
    assert_eq!(stats.entries_created, 3);
    assert_eq!(stats.stored, 2);
    assert_eq!(stats.deduplicated, 1);
    assert_eq!(stats.failed, 0);

    let manifest_stats = env.manifest.stats().await.unwrap();
    assert_eq!(manifest_stats.count(EntryStatus::Stored), 2);
    assert_eq!(manifest_stats.count(EntryStatus::Pending), 0);

    let shared = ContentId::from_hash(ContentHash::compute(b"shared payload"));
    let entry = env.manifest.get_entry(&shared).await.unwrap().unwrap();
    assert_eq!(entry.status, EntryStatus::Stored);
    assert_eq!(entry.size_bytes, Some(14));
    assert!(entry.lease.is_none());
    assert!(entry.last_verified_at.is_some());

    let mut sources: Vec<String> = env
        .manifest
        .list_sources(&shared)
        .await
        .unwrap()
        .into_iter()
        .map(|s| s.source_ref)
        .collect();
    sources.sort();
    assert_eq!(sources, vec!["refs/a", "refs/c"]);

    let objects = env.files(OBJECTS_PREFIX).await;
    assert_eq!(objects.len(), 2);
    let key = object_key(&ContentHash::compute(b"shared payload"));
    assert_eq!(entry.storage_path.as_deref(), Some(key.as_str()));
    assert_eq!(env.read(&key).await, b"shared payload");
    assert!(env.files(STAGING_PREFIX).await.is_empty());
}

#[tokio::test]
async fn test_second_pass_fetches_nothing() {
    let env = TestEnv::new().await;
    let origin = StaticOrigin::with_items(&[("a", b"one"), ("b", b"two")]);
    let archiver = env.archiver(origin.clone());
    let cancel = CancellationToken::new();

    archiver.run_pass(&cancel).await.unwrap();
    assert_eq!(origin.total_fetches(), 2);

    let stats = archiver.run_pass(&cancel).await.unwrap();
    assert_eq!(stats.items_discovered, 2);
    assert_eq!(stats.entries_created, 0);
    assert_eq!(stats.stored, 0);
    assert_eq!(origin.total_fetches(), 2);
    assert_eq!(env.files(OBJECTS_PREFIX).await.len(), 2);
}

#[tokio::test]
async fn test_listing_is_walked_page_by_page() {
    let env = TestEnv::with_config("http://127.0.0.1:9", |c| c.archiver.max_pages = 2).await;
    let origin = std::sync::Arc::new(StaticOrigin::new(2));
    for i in 0..5 {
        origin.add(&format!("item-{i}"), format!("body {i}").as_bytes());
    }
    let archiver = env.archiver(origin.clone());

    let stats = archiver.run_pass(&CancellationToken::new()).await.unwrap();
    assert_eq!(stats.pages_listed, 2);
    assert_eq!(stats.items_discovered, 4);
    assert_eq!(stats.stored, 4);
    assert_eq!(origin.list_calls(), 2);
}

#[tokio::test]
async fn test_advertised_hash_mismatch_is_quarantined() {
    let env = TestEnv::new().await;
    let origin = StaticOrigin::with_items(&[("tampered", b"what we got")]);
    let advertised = ContentHash::compute(b"what was promised");
    origin.advertise("tampered", advertised);
    let archiver = env.archiver(origin.clone());

    let stats = archiver.run_pass(&CancellationToken::new()).await.unwrap();
    assert_eq!(stats.failed, 1);
    assert_eq!(stats.quarantined, 1);
    assert_eq!(stats.stored, 0);

    let entry = env
        .manifest
        .get_entry(&ContentId::from_hash(advertised))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(entry.status, EntryStatus::Failed);
    assert!(entry.storage_path.is_none());
    assert!(entry.lease.is_none());
    assert!(entry.failure_reason.unwrap().contains("mismatch"));

    assert!(env.files(OBJECTS_PREFIX).await.is_empty());
    assert!(env.files(STAGING_PREFIX).await.is_empty());
    let quarantined = env.files(QUARANTINE_PREFIX).await;
    assert_eq!(quarantined.len(), 1);
    assert_eq!(env.read(&quarantined[0].key).await, b"what we got");
}

#[tokio::test]
async fn test_transient_errors_are_retried() {
    let env = TestEnv::new().await;
    let origin = StaticOrigin::with_items(&[("flaky", b"eventually")]);
    origin.script(
        "flaky",
        [Reply::Transient, Reply::RetryAfter(Duration::from_millis(5))],
    );
    let archiver = env.archiver(origin.clone());

    let stats = archiver.run_pass(&CancellationToken::new()).await.unwrap();
    assert_eq!(stats.stored, 1);
    assert_eq!(stats.retries, 2);
    assert_eq!(origin.fetch_count("flaky"), 3);

    let entry = env
        .manifest
        .get_entry_by_source("flaky")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(entry.status, EntryStatus::Stored);
    assert_eq!(entry.attempts, 1);
}

#[tokio::test]
async fn test_permanent_error_fails_immediately() {
    let env = TestEnv::new().await;
    let origin = StaticOrigin::with_items(&[("gone", b"unused")]);
    origin.set_reply("gone", Reply::Permanent);
    let archiver = env.archiver(origin.clone());

    let stats = archiver.run_pass(&CancellationToken::new()).await.unwrap();
    assert_eq!(stats.failed, 1);
    assert_eq!(stats.retries, 0);
    assert_eq!(origin.fetch_count("gone"), 1);

    let entry = env
        .manifest
        .get_entry_by_source("gone")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(entry.status, EntryStatus::Failed);
    assert!(entry.failure_reason.unwrap().contains("404"));
    assert!(env.files(STAGING_PREFIX).await.is_empty());
}

#[tokio::test]
async fn test_exhausted_retries_mark_failed() {
    let env = TestEnv::new().await;
    let origin = StaticOrigin::with_items(&[("down", b"unused")]);
    origin.set_reply("down", Reply::Transient);
    let archiver = env.archiver(origin.clone());

    let stats = archiver.run_pass(&CancellationToken::new()).await.unwrap();
    assert_eq!(stats.failed, 1);
    assert_eq!(origin.fetch_count("down"), env.config.retry.max_attempts);

    let entry = env
        .manifest
        .get_entry_by_source("down")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(entry.status, EntryStatus::Failed);
    assert!(entry.lease.is_none());
}

#[tokio::test]
async fn test_failed_entries_wait_for_cooldown() {
    let env = TestEnv::new().await;
    let origin = StaticOrigin::with_items(&[("later", b"recovered")]);
    origin.script("later", [Reply::Permanent]);
    let archiver = env.archiver(origin.clone());
    let cancel = CancellationToken::new();

    archiver.run_pass(&cancel).await.unwrap();
    let stats = archiver.run_pass(&cancel).await.unwrap();
    assert_eq!(stats.entries_requeued, 0);
    assert_eq!(origin.fetch_count("later"), 1);

    let entry = env
        .manifest
        .get_entry_by_source("later")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(entry.status, EntryStatus::Failed);
}

#[tokio::test]
async fn test_failed_entries_requeue_after_cooldown() {
    let env = TestEnv::with_config("http://127.0.0.1:9", |c| {
        c.archiver.failure_cooldown_secs = 0;
    })
    .await;
    let origin = StaticOrigin::with_items(&[("later", b"recovered")]);
    origin.script("later", [Reply::Permanent]);
    let archiver = env.archiver(origin.clone());
    let cancel = CancellationToken::new();

    let first = archiver.run_pass(&cancel).await.unwrap();
    assert_eq!(first.failed, 1);

    let second = archiver.run_pass(&cancel).await.unwrap();
    assert!(second.entries_requeued >= 1);
    assert_eq!(second.stored, 1);

    let entry = env
        .manifest
        .get_entry_by_source("later")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(entry.status, EntryStatus::Stored);
    assert_eq!(entry.attempts, 2);
    assert!(entry.failure_reason.is_none());
}

#[tokio::test]
async fn test_cooldown_beyond_date_range_never_requeues() {
    let env = TestEnv::with_config("http://127.0.0.1:9", |c| {
        c.archiver.failure_cooldown_secs = i64::MAX as u64;
    })
    .await;
    let origin = StaticOrigin::with_items(&[("later", b"recovered")]);
    origin.script("later", [Reply::Permanent]);
    let archiver = env.archiver(origin.clone());
    let cancel = CancellationToken::new();

    let first = archiver.run_pass(&cancel).await.unwrap();
    assert_eq!(first.failed, 1);

    let second = archiver.run_pass(&cancel).await.unwrap();
    assert_eq!(second.entries_requeued, 0);
    assert_eq!(origin.fetch_count("later"), 1);
}

#[tokio::test]
async fn test_long_download_keeps_its_lease() {
    let env = TestEnv::with_config("http://127.0.0.1:9", |c| c.lease.ttl_secs = 1).await;
    let body = Bytes::from(vec![b'x'; 70]);
    let origin = StaticOrigin::with_items(&[("slow", b"unused")]);
    origin.set_reply("slow", Reply::Trickle(body, Duration::from_millis(200)));
    let archiver = env.archiver(origin.clone());
    let cancel = CancellationToken::new();

    let (stats, midway) = tokio::join!(archiver.run_pass(&cancel), async {
        tokio::time::sleep(Duration::from_millis(1300)).await;
        env.manifest
            .get_entry_by_source("slow")
            .await
            .unwrap()
            .unwrap()
    });

    // Past the first grant's expiry, yet still leased.
    assert_eq!(midway.status, EntryStatus::Downloading);
    let lease = midway.lease.unwrap();
    assert!(lease.holder.starts_with("archiver:"));
    assert!(lease.is_active_at(time::OffsetDateTime::now_utc()));

    let stats = stats.unwrap();
    assert_eq!(stats.stored, 1);
    assert_eq!(origin.fetch_count("slow"), 1);
}

#[tokio::test]
async fn test_leased_entries_are_skipped() {
    let env = TestEnv::new().await;
    let origin = StaticOrigin::with_items(&[("busy", b"payload")]);
    let archiver = env.archiver(origin.clone());

    let upserted = env
        .manifest
        .upsert_pending(
            &hoard_core::SourceRef::new("busy"),
            time::Duration::hours(1),
        )
        .await
        .unwrap();
    env.manifest
        .acquire_lease(&upserted.content_id, "other-worker", time::Duration::minutes(5))
        .await
        .unwrap();

    let stats = archiver.run_pass(&CancellationToken::new()).await.unwrap();
    assert_eq!(stats.skipped, 1);
    assert_eq!(stats.stored, 0);
    assert_eq!(stats.errors, 0);
    assert_eq!(origin.fetch_count("busy"), 0);

    let entry = env.manifest.get_entry(&upserted.content_id).await.unwrap().unwrap();
    assert_eq!(entry.status, EntryStatus::Pending);
    assert_eq!(entry.lease.unwrap().holder, "other-worker");
}

#[tokio::test]
async fn test_shutdown_abandons_in_flight_fetch() {
    let env = TestEnv::new().await;
    let origin = StaticOrigin::with_items(&[("slow", b"never used")]);
    origin.set_reply("slow", Reply::Hang);
    let archiver = env.archiver(origin.clone());
    let cancel = CancellationToken::new();

    let (stats, ()) = tokio::join!(archiver.run_pass(&cancel), async {
        tokio::time::sleep(Duration::from_millis(200)).await;
        cancel.cancel();
    });
    let stats = stats.unwrap();
    assert_eq!(stats.abandoned, 1);

    let entry = env
        .manifest
        .get_entry_by_source("slow")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(entry.status, EntryStatus::Pending);
    assert!(entry.lease.is_none());
    assert!(env.files(OBJECTS_PREFIX).await.is_empty());

    let runs = env.manifest.recent_runs(RunKind::Archive, 1).await.unwrap();
    assert_eq!(runs[0].state, RunState::Interrupted.as_str());
}

#[tokio::test]
async fn test_pass_is_recorded_in_run_history() {
    let env = TestEnv::new().await;
    let origin = StaticOrigin::with_items(&[("a", b"alpha")]);
    let archiver = env.archiver(origin);

    let stats = archiver.run_pass(&CancellationToken::new()).await.unwrap();

    let runs = env.manifest.recent_runs(RunKind::Archive, 5).await.unwrap();
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].state, RunState::Finished.as_str());
    assert!(runs[0].finished_at.is_some());
    let recorded: ArchiveStats =
        serde_json::from_str(runs[0].stats_json.as_deref().unwrap()).unwrap();
    assert_eq!(recorded, stats);
}
