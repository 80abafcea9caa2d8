//! Content archiver for hoard.
//!
//! Discovers items at a remote origin, fetches them through a shared rate
//! gate with bounded retries, and stores each distinct payload once on the
//! shared volume under its content hash.

pub mod error;
pub mod gate;
pub mod origin;
pub mod pipeline;
pub mod retry;

pub use error::{ArchiveError, ArchiveResult, ErrorClass, OriginError, OriginResult};
pub use gate::{GatePermit, RateGate};
pub use origin::{HttpOrigin, Origin, OriginItem, OriginPage, PayloadStream};
pub use pipeline::{ArchiveStats, Archiver};
pub use retry::RetryPolicy;
