//! Content identity.
//!
//! Every stored entry is keyed by the SHA-256 of its payload. Entries that
//! have been discovered but not yet fetched carry a provisional identity
//! derived from their source reference until the payload hash is known.

use crate::error::{CoreError, Result};
use crate::hash::ContentHash;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

const CONTENT_PREFIX: &str = "sha256:";
const PROVISIONAL_PREFIX: &str = "src:";

/// Manifest identity of a content item.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum ContentId {
    /// Content-addressed identity (`sha256:<hex>`).
    Content(ContentHash),
    /// Pre-hash identity (`src:<hex of sha256(source_ref)>`).
    Provisional(ContentHash),
}

impl ContentId {
    pub fn from_hash(hash: ContentHash) -> Self {
        Self::Content(hash)
    }

    /// Provisional identity for a source reference whose payload hash is not
    /// known yet.
    pub fn provisional_for(source_ref: &str) -> Self {
        Self::Provisional(ContentHash::compute(source_ref.as_bytes()))
    }

    pub fn is_provisional(&self) -> bool {
        matches!(self, Self::Provisional(_))
    }

    /// The payload hash, if this identity is content-addressed.
    pub fn content_hash(&self) -> Option<ContentHash> {
        match self {
            Self::Content(h) => Some(*h),
            Self::Provisional(_) => None,
        }
    }
}

impl fmt::Display for ContentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Content(h) => write!(f, "{CONTENT_PREFIX}{}", h.to_hex()),
            Self::Provisional(h) => write!(f, "{PROVISIONAL_PREFIX}{}", h.to_hex()),
        }
    }
}

impl fmt::Debug for ContentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentId({self})")
    }
}

impl FromStr for ContentId {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        if let Some(hex) = s.strip_prefix(CONTENT_PREFIX) {
            let hash = ContentHash::from_hex(hex)
                .map_err(|e| CoreError::InvalidContentId(format!("{s}: {e}")))?;
            return Ok(Self::Content(hash));
        }
        if let Some(hex) = s.strip_prefix(PROVISIONAL_PREFIX) {
            let hash = ContentHash::from_hex(hex)
                .map_err(|e| CoreError::InvalidContentId(format!("{s}: {e}")))?;
            return Ok(Self::Provisional(hash));
        }
        Err(CoreError::InvalidContentId(format!(
            "unknown content id scheme: {s}"
        )))
    }
}

impl TryFrom<String> for ContentId {
    type Error = CoreError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<ContentId> for String {
    fn from(id: ContentId) -> Self {
        id.to_string()
    }
}
