//! Repository traits for manifest operations.

pub mod entries;
pub mod leases;
pub mod runs;

pub use entries::{EntryRepo, ManifestStats, StatusCount, Upserted};
pub use leases::{LeaseRepo, Resolution};
pub use runs::{RunKind, RunRepo, RunState};
