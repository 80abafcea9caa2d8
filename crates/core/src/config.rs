//! Configuration types shared across crates.
//!
//! Both binaries read the same file; each only deserializes the sections it
//! needs and ignores the rest.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use time::Duration;

/// Upper bound for any configured duration: one hundred years.
///
/// Instants derived from the clock stay well inside the supported date range.
pub const MAX_DURATION_SECS: u64 = 100 * 31_557_600;

fn check_duration(name: &str, secs: u64) -> Result<(), String> {
    if secs > MAX_DURATION_SECS {
        return Err(format!("{name} {secs} exceeds maximum value {MAX_DURATION_SECS}"));
    }
    Ok(())
}

/// Shared storage volume configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StorageConfig {
    /// Local or network-mounted filesystem.
    Filesystem {
        /// Root directory of the shared volume.
        path: PathBuf,
    },
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self::Filesystem {
            path: PathBuf::from("./data/storage"),
        }
    }
}

impl StorageConfig {
    pub fn validate(&self) -> Result<(), String> {
        match self {
            StorageConfig::Filesystem { path } if path.as_os_str().is_empty() => {
                Err("storage.path cannot be empty".to_string())
            }
            StorageConfig::Filesystem { .. } => Ok(()),
        }
    }
}

/// Manifest store configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ManifestConfig {
    /// SQLite database file, opened in WAL mode.
    Sqlite {
        /// Database file path.
        path: PathBuf,
        /// How long a writer waits on a locked database before giving up.
        #[serde(default = "default_busy_timeout_secs")]
        busy_timeout_secs: u64,
        /// The same database as seen by read-only sessions, e.g. through a
        /// read-only mount. Scans and reports go through it. Defaults to
        /// `path`.
        #[serde(default)]
        readonly_path: Option<PathBuf>,
    },
}

fn default_busy_timeout_secs() -> u64 {
    5
}

impl Default for ManifestConfig {
    fn default() -> Self {
        Self::Sqlite {
            path: PathBuf::from("./data/manifest.db"),
            busy_timeout_secs: default_busy_timeout_secs(),
            readonly_path: None,
        }
    }
}

impl ManifestConfig {
    pub fn validate(&self) -> Result<(), String> {
        match self {
            ManifestConfig::Sqlite { path, .. } if path.as_os_str().is_empty() => {
                Err("manifest.path cannot be empty".to_string())
            }
            ManifestConfig::Sqlite {
                readonly_path: Some(readonly),
                ..
            } if readonly.as_os_str().is_empty() => {
                Err("manifest.readonly_path cannot be empty".to_string())
            }
            ManifestConfig::Sqlite { .. } => Ok(()),
        }
    }
}

/// Advisory lease configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LeaseConfig {
    /// Lease lifetime in seconds. A crashed holder blocks its entry for at
    /// most this long.
    #[serde(default = "default_lease_ttl_secs")]
    pub ttl_secs: u64,
}

fn default_lease_ttl_secs() -> u64 {
    300
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_lease_ttl_secs(),
        }
    }
}

impl LeaseConfig {
    pub fn ttl(&self) -> Duration {
        Duration::seconds(self.ttl_secs as i64)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.ttl_secs == 0 {
            return Err("lease.ttl_secs cannot be 0".to_string());
        }
        check_duration("lease.ttl_secs", self.ttl_secs)
    }
}

/// Remote origin configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OriginConfig {
    /// Base URL of the origin (e.g., "https://origin.example.com").
    #[serde(default = "default_origin_base_url")]
    pub base_url: String,
    /// Path of the paged listing endpoint, relative to `base_url`.
    #[serde(default = "default_listing_path")]
    pub listing_path: String,
    /// Optional bearer token.
    /// WARNING: Prefer HOARD_ORIGIN__TOKEN over storing it in the config file.
    pub token: Option<String>,
    /// Connect timeout and idle read timeout in seconds. A download may run
    /// longer as long as data keeps arriving.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

fn default_origin_base_url() -> String {
    "http://127.0.0.1:8000".to_string()
}

fn default_listing_path() -> String {
    "listing".to_string()
}

fn default_request_timeout_secs() -> u64 {
    60
}

fn default_user_agent() -> String {
    concat!("hoard/", env!("CARGO_PKG_VERSION")).to_string()
}

impl Default for OriginConfig {
    fn default() -> Self {
        Self {
            base_url: default_origin_base_url(),
            listing_path: default_listing_path(),
            token: None,
            request_timeout_secs: default_request_timeout_secs(),
            user_agent: default_user_agent(),
        }
    }
}

impl OriginConfig {
    pub fn request_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.request_timeout_secs)
    }

    pub fn validate(&self) -> Result<(), String> {
        if !(self.base_url.starts_with("http://") || self.base_url.starts_with("https://")) {
            return Err(format!(
                "origin.base_url must be an http(s) URL, got {:?}",
                self.base_url
            ));
        }
        if self.request_timeout_secs == 0 {
            return Err("origin.request_timeout_secs cannot be 0".to_string());
        }
        Ok(())
    }
}

/// Origin rate gate configuration.
///
/// One token bucket and one concurrency limit are shared by every fetch
/// worker in the process. Requests over the limit wait for capacity.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Requests allowed per interval (also the burst size).
    #[serde(default = "default_requests_per_interval")]
    pub requests_per_interval: u32,
    /// Interval length in seconds.
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    /// Maximum requests in flight at once.
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
}

fn default_requests_per_interval() -> u32 {
    10
}

fn default_interval_secs() -> u64 {
    1
}

fn default_max_concurrency() -> usize {
    4
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_interval: default_requests_per_interval(),
            interval_secs: default_interval_secs(),
            max_concurrency: default_max_concurrency(),
        }
    }
}

impl RateLimitConfig {
    pub fn interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.interval_secs)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.requests_per_interval == 0 {
            return Err("rate_limit.requests_per_interval cannot be 0".to_string());
        }
        if self.interval_secs == 0 {
            return Err("rate_limit.interval_secs cannot be 0".to_string());
        }
        if self.max_concurrency == 0 {
            return Err("rate_limit.max_concurrency cannot be 0".to_string());
        }
        Ok(())
    }
}

/// Fetch retry policy.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Total attempts including the first one.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Delay before the first retry, doubled on each subsequent one.
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    /// Upper bound for a single backoff delay.
    #[serde(default = "default_max_delay_secs")]
    pub max_delay_secs: u64,
    /// Randomize each delay.
    #[serde(default = "default_jitter")]
    pub jitter: bool,
}

fn default_max_attempts() -> u32 {
    5
}

fn default_base_delay_ms() -> u64 {
    500
}

fn default_max_delay_secs() -> u64 {
    60
}

fn default_jitter() -> bool {
    true
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_secs: default_max_delay_secs(),
            jitter: default_jitter(),
        }
    }
}

impl RetryConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.max_attempts == 0 {
            return Err("retry.max_attempts must be at least 1".to_string());
        }
        if self.base_delay_ms == 0 {
            return Err("retry.base_delay_ms cannot be 0".to_string());
        }
        if self.base_delay_ms > self.max_delay_secs.saturating_mul(1000) {
            return Err(format!(
                "retry.base_delay_ms {} exceeds retry.max_delay_secs {}",
                self.base_delay_ms, self.max_delay_secs
            ));
        }
        Ok(())
    }
}

/// Archiver pass configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ArchiverConfig {
    /// Items processed concurrently per pass.
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Seconds between passes when running as a service.
    #[serde(default = "default_pass_interval_secs")]
    pub pass_interval_secs: u64,
    /// Listing pages walked per pass.
    #[serde(default = "default_max_pages")]
    pub max_pages: u32,
    /// Seconds a failed entry waits before it is re-queued.
    #[serde(default = "default_failure_cooldown_secs")]
    pub failure_cooldown_secs: u64,
    /// Entries fetched from the manifest per scan page.
    #[serde(default = "default_scan_batch_size")]
    pub scan_batch_size: u32,
}

fn default_workers() -> usize {
    4
}

fn default_pass_interval_secs() -> u64 {
    300
}

fn default_max_pages() -> u32 {
    100
}

fn default_failure_cooldown_secs() -> u64 {
    3600
}

fn default_scan_batch_size() -> u32 {
    200
}

impl Default for ArchiverConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            pass_interval_secs: default_pass_interval_secs(),
            max_pages: default_max_pages(),
            failure_cooldown_secs: default_failure_cooldown_secs(),
            scan_batch_size: default_scan_batch_size(),
        }
    }
}

impl ArchiverConfig {
    pub fn pass_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.pass_interval_secs)
    }

    pub fn failure_cooldown(&self) -> Duration {
        Duration::seconds(self.failure_cooldown_secs as i64)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.workers == 0 {
            return Err("archiver.workers cannot be 0".to_string());
        }
        if self.pass_interval_secs == 0 {
            return Err("archiver.pass_interval_secs cannot be 0".to_string());
        }
        if self.scan_batch_size == 0 {
            return Err("archiver.scan_batch_size cannot be 0".to_string());
        }
        check_duration("archiver.failure_cooldown_secs", self.failure_cooldown_secs)
    }
}

/// Retention policy for stored content.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct RetentionConfig {
    /// Stored entries older than this are tombstoned. Unset keeps forever.
    pub max_age_secs: Option<u64>,
    /// Oldest stored entries are tombstoned while the stored total exceeds
    /// this many bytes. Unset means no capacity limit.
    pub max_total_bytes: Option<u64>,
}

impl RetentionConfig {
    pub fn max_age(&self) -> Option<Duration> {
        self.max_age_secs.map(|s| Duration::seconds(s as i64))
    }

    pub fn is_enabled(&self) -> bool {
        self.max_age_secs.is_some() || self.max_total_bytes.is_some()
    }
}

/// Cleanup sweep configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SweeperConfig {
    /// Minimum file age in seconds before an orphan may be removed.
    #[serde(default = "default_grace_period_secs")]
    pub grace_period_secs: u64,
    #[serde(default)]
    pub retention: RetentionConfig,
    /// Files or entries handled per page.
    #[serde(default = "default_sweep_batch_size")]
    pub batch_size: u32,
    /// Report what would happen without mutating anything.
    #[serde(default)]
    pub dry_run: bool,
    /// Seconds between sweeps when running as a service.
    #[serde(default = "default_sweep_interval_secs")]
    pub interval_secs: u64,
    /// Upper bound on items visited per phase in one sweep.
    pub max_items: Option<u64>,
    /// Check that every stored entry still has its file.
    #[serde(default)]
    pub verify_stored: bool,
    /// Re-hash stored files during verification. Requires `verify_stored`.
    #[serde(default)]
    pub verify_hashes: bool,
}

fn default_grace_period_secs() -> u64 {
    3600
}

fn default_sweep_batch_size() -> u32 {
    500
}

fn default_sweep_interval_secs() -> u64 {
    3600
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            grace_period_secs: default_grace_period_secs(),
            retention: RetentionConfig::default(),
            batch_size: default_sweep_batch_size(),
            dry_run: false,
            interval_secs: default_sweep_interval_secs(),
            max_items: None,
            verify_stored: false,
            verify_hashes: false,
        }
    }
}

impl SweeperConfig {
    pub fn grace_period(&self) -> Duration {
        Duration::seconds(self.grace_period_secs as i64)
    }

    pub fn interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.interval_secs)
    }

    pub fn validate(&self) -> Result<(), String> {
        check_duration("sweeper.grace_period_secs", self.grace_period_secs)?;
        if let Some(max_age) = self.retention.max_age_secs {
            check_duration("sweeper.retention.max_age_secs", max_age)?;
        }
        if self.batch_size == 0 {
            return Err("sweeper.batch_size cannot be 0".to_string());
        }
        if self.interval_secs == 0 {
            return Err("sweeper.interval_secs cannot be 0".to_string());
        }
        if self.verify_hashes && !self.verify_stored {
            return Err("sweeper.verify_hashes requires sweeper.verify_stored".to_string());
        }
        Ok(())
    }
}

/// Configuration of the archiver process.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ArchiverAppConfig {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub manifest: ManifestConfig,
    #[serde(default)]
    pub lease: LeaseConfig,
    #[serde(default)]
    pub origin: OriginConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub archiver: ArchiverConfig,
}

impl ArchiverAppConfig {
    /// Validate every section, returning the first problem found.
    pub fn validate(&self) -> Result<(), String> {
        self.storage.validate()?;
        self.manifest.validate()?;
        self.lease.validate()?;
        self.origin.validate()?;
        self.rate_limit.validate()?;
        self.retry.validate()?;
        self.archiver.validate()?;
        Ok(())
    }

    /// Configuration rooted in `root` with fast retries and short leases.
    ///
    /// **For testing only.**
    pub fn for_testing(root: &std::path::Path, base_url: &str) -> Self {
        Self {
            storage: StorageConfig::Filesystem {
                path: root.join("storage"),
            },
            manifest: ManifestConfig::Sqlite {
                path: root.join("manifest.db"),
                busy_timeout_secs: default_busy_timeout_secs(),
                readonly_path: None,
            },
            lease: LeaseConfig { ttl_secs: 30 },
            origin: OriginConfig {
                base_url: base_url.to_string(),
                request_timeout_secs: 5,
                ..OriginConfig::default()
            },
            rate_limit: RateLimitConfig {
                requests_per_interval: 1000,
                interval_secs: 1,
                max_concurrency: 8,
            },
            retry: RetryConfig {
                max_attempts: 3,
                base_delay_ms: 1,
                max_delay_secs: 1,
                jitter: false,
            },
            archiver: ArchiverConfig {
                workers: 1,
                ..ArchiverConfig::default()
            },
        }
    }
}

/// Configuration of the sweeper process.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct SweeperAppConfig {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub manifest: ManifestConfig,
    #[serde(default)]
    pub lease: LeaseConfig,
    #[serde(default)]
    pub sweeper: SweeperConfig,
}

impl SweeperAppConfig {
    /// Validate every section, returning the first problem found.
    pub fn validate(&self) -> Result<(), String> {
        self.storage.validate()?;
        self.manifest.validate()?;
        self.lease.validate()?;
        self.sweeper.validate()?;
        // A staged file is written under a lease; the grace period must
        // outlive it or an in-flight write could be swept.
        if self.sweeper.grace_period_secs < self.lease.ttl_secs {
            return Err(format!(
                "sweeper.grace_period_secs {} must be at least lease.ttl_secs {}",
                self.sweeper.grace_period_secs, self.lease.ttl_secs
            ));
        }
        Ok(())
    }

    /// **For testing only.**
    pub fn for_testing(root: &std::path::Path) -> Self {
        Self {
            storage: StorageConfig::Filesystem {
                path: root.join("storage"),
            },
            manifest: ManifestConfig::Sqlite {
                path: root.join("manifest.db"),
                busy_timeout_secs: default_busy_timeout_secs(),
                readonly_path: None,
            },
            lease: LeaseConfig { ttl_secs: 30 },
            sweeper: SweeperConfig {
                grace_period_secs: 60,
                batch_size: 2,
                ..SweeperConfig::default()
            },
        }
    }
}
