//! Key layout of the shared volume.
//!
//! ```text
//! objects/ab/cd/abcd...    finalized payloads, keyed by SHA-256 hex
//! tmp/<uuid>.part          staged writes not yet finalized
//! quarantine/<uuid>-<name> payloads that failed verification
//! ```

use hoard_core::ContentHash;
use uuid::Uuid;

pub const OBJECTS_PREFIX: &str = "objects/";
pub const STAGING_PREFIX: &str = "tmp/";
pub const QUARANTINE_PREFIX: &str = "quarantine/";

const STAGING_SUFFIX: &str = ".part";

/// Canonical key for a payload with the given hash.
pub fn object_key(hash: &ContentHash) -> String {
    let hex = hash.to_hex();
    format!("{OBJECTS_PREFIX}{}/{}/{}", &hex[0..2], &hex[2..4], hex)
}

/// A fresh, unique staging key.
pub fn staging_key() -> String {
    format!("{STAGING_PREFIX}{}{STAGING_SUFFIX}", Uuid::new_v4())
}

/// Destination for quarantining `key`.
pub fn quarantine_key(key: &str) -> String {
    let name = key.rsplit('/').next().unwrap_or(key);
    format!("{QUARANTINE_PREFIX}{}-{name}", Uuid::new_v4())
}

/// What a listed key is, by its place in the layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyKind {
    /// A finalized payload at its canonical key.
    Object(ContentHash),
    /// A staged write.
    Staged,
    /// A quarantined payload.
    Quarantined,
    /// Anything else, including malformed object keys.
    Foreign,
}

/// Classify a key.
pub fn classify(key: &str) -> KeyKind {
    if let Some(hash) = parse_object_key(key) {
        return KeyKind::Object(hash);
    }
    if let Some(name) = key.strip_prefix(STAGING_PREFIX)
        && !name.contains('/')
        && name.ends_with(STAGING_SUFFIX)
    {
        return KeyKind::Staged;
    }
    if key.starts_with(QUARANTINE_PREFIX) {
        return KeyKind::Quarantined;
    }
    KeyKind::Foreign
}

/// Parse a canonical object key back into its hash.
///
/// Returns None unless the key is exactly `objects/<h0h1>/<h2h3>/<hex>`
/// with a lowercase hex hash.
pub fn parse_object_key(key: &str) -> Option<ContentHash> {
    let rest = key.strip_prefix(OBJECTS_PREFIX)?;
    let mut parts = rest.split('/');
    let (a, b, hex) = (parts.next()?, parts.next()?, parts.next()?);
    if parts.next().is_some() {
        return None;
    }
    let hash = ContentHash::from_hex(hex).ok()?;
    let canonical = hash.to_hex();
    (canonical == hex && a == &canonical[0..2] && b == &canonical[2..4]).then_some(hash)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_object_key_layout() {
        let hash = ContentHash::compute(b"hello world");
        let key = object_key(&hash);
        assert_eq!(
            key,
            "objects/b9/4d/b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
        assert_eq!(parse_object_key(&key), Some(hash));
        assert_eq!(classify(&key), KeyKind::Object(hash));
    }

    #[test]
    fn test_parse_rejects_misplaced_objects() {
        let hex = ContentHash::compute(b"x").to_hex();
        assert!(parse_object_key(&format!("objects/00/00/{hex}")).is_none());
        assert!(parse_object_key(&format!("objects/{hex}")).is_none());
        let upper = hex.to_uppercase();
        let (a, b) = (&hex[0..2], &hex[2..4]);
        assert!(parse_object_key(&format!("objects/{a}/{b}/{upper}")).is_none());
        assert!(parse_object_key(&format!("objects/{a}/{b}/{hex}/extra")).is_none());
        assert_eq!(classify(&format!("objects/00/00/{hex}")), KeyKind::Foreign);
    }

    #[test]
    fn test_staging_and_quarantine_keys() {
        let staged = staging_key();
        assert!(staged.starts_with("tmp/"));
        assert_eq!(classify(&staged), KeyKind::Staged);
        assert_ne!(staged, staging_key());

        let quarantined = quarantine_key(&staged);
        assert!(quarantined.starts_with("quarantine/"));
        assert!(quarantined.ends_with(".part"));
        assert_eq!(classify(&quarantined), KeyKind::Quarantined);

        assert_eq!(classify("tmp/nested/x.part"), KeyKind::Foreign);
        assert_eq!(classify("tmp/notes.txt"), KeyKind::Foreign);
    }
}
