//! Run history repository.

use crate::error::MetadataResult;
use crate::models::RunRow;
use async_trait::async_trait;
use uuid::Uuid;

/// Repository for archiver pass and sweep history.
#[async_trait]
pub trait RunRepo: Send + Sync {
    /// Record the start of a run.
    async fn create_run(&self, kind: RunKind) -> MetadataResult<RunRow>;

    /// Record the end of a run.
    async fn finish_run(
        &self,
        run_id: Uuid,
        state: RunState,
        stats_json: Option<&str>,
    ) -> MetadataResult<()>;

    /// Most recent runs of a kind, newest first.
    async fn recent_runs(&self, kind: RunKind, limit: u32) -> MetadataResult<Vec<RunRow>>;
}

/// Run kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunKind {
    /// One archiver discovery and fetch pass.
    Archive,
    /// One cleanup sweep.
    Sweep,
}

impl RunKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Archive => "archive",
            Self::Sweep => "sweep",
        }
    }
}

/// Run state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Running,
    Finished,
    /// Stopped by a shutdown signal before completing.
    Interrupted,
    Failed,
}

impl RunState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Finished => "finished",
            Self::Interrupted => "interrupted",
            Self::Failed => "failed",
        }
    }
}
