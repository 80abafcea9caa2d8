//! Core domain types and shared configuration for hoard.
//!
//! This crate defines the data model shared by the archiver and the sweeper:
//! - Content hashes and content-addressed identities
//! - Manifest entries, their lifecycle states and advisory leases
//! - Source references discovered at the origin
//! - Configuration sections for both binaries

pub mod config;
pub mod content;
pub mod entry;
pub mod error;
pub mod hash;

pub use content::ContentId;
pub use entry::{EntryStatus, Lease, ManifestEntry, SourceRef};
pub use error::{CoreError, Result};
pub use hash::{ContentHash, ContentHasher};
