//! Cleanup sweeper for hoard.
//!
//! Reconciles the shared volume against the manifest and reclaims space held
//! by orphaned files, stale staged writes and retention-expired content. It
//! coordinates with running archivers only through manifest state, leases and
//! the grace period.

pub mod error;
pub mod retention;
pub mod sweep;

pub use error::{SweepError, SweepResult};
pub use retention::RetentionPolicy;
pub use sweep::{SweepStats, Sweeper};
