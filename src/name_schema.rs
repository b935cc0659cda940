//! Naming conventions for tablet snapshots.
//!
//! A local snapshot directory ends in `.../<tablet_id>/<schema_hash>`, and
//! contains a header file (`<tablet_id>.hdr`) plus segment data and index
//! files (`<rowset>.dat` / `<rowset>.idx`).  A catalog-mode remote
//! directory's last path component encodes the peer's tablet id after a
//! final underscore (e.g., `.../__idx_10004/__10005`).
//!
//! Everything in this module is a pure string transformation; the
//! filesystem is never consulted.
use crate::fresh_warn;
use crate::result::ErrorKind;
use crate::result::Result;

/// Header files are tablet-scoped: exactly one per tablet, named after it.
pub const HEADER_SUFFIX: &str = ".hdr";

/// Segment data files; their names are content-scoped.
pub const DATA_SUFFIX: &str = ".dat";

/// Segment index files; their names are content-scoped.
pub const INDEX_SUFFIX: &str = ".idx";

/// Extracts `(tablet_id, schema_hash)` from the canonical
/// `.../<tablet_id>/<schema_hash>` suffix of a local snapshot path.
///
/// A trailing separator is rejected: the last segment must be the schema
/// hash itself.
pub fn tablet_id_and_schema_hash_from_path(path: &str) -> Result<(i64, i32)> {
    let invalid = || {
        fresh_warn!("failed to get tablet id from path", %path)
            .with_kind(ErrorKind::InvalidPath)
    };

    let (prefix, schema_hash_str) = path.rsplit_once('/').ok_or_else(|| invalid())?;
    if schema_hash_str.is_empty() {
        return Err(invalid());
    }

    let (_, tablet_id_str) = prefix.rsplit_once('/').ok_or_else(|| invalid())?;

    let tablet_id = tablet_id_str.parse::<i64>().map_err(|_| invalid())?;
    let schema_hash = schema_hash_str.parse::<i32>().map_err(|_| invalid())?;

    tracing::debug!(tablet_id, schema_hash, %path, "parsed tablet path");
    Ok((tablet_id, schema_hash))
}

/// Extracts the peer tablet id encoded after the last `_` of a
/// catalog-mode remote path.
///
/// Segment-internal underscores make this split fragile; the convention
/// guarantees the id is the final underscore-delimited token.
pub fn tablet_id_from_remote_path(remote_path: &str) -> Result<i64> {
    let invalid = || {
        fresh_warn!("invalid remote snapshot path", %remote_path)
            .with_kind(ErrorKind::InvalidPath)
    };

    let (_, tablet_id_str) = remote_path.rsplit_once('_').ok_or_else(|| invalid())?;
    tablet_id_str.parse::<i64>().map_err(|_| invalid())
}

/// Renames `file_name` for the tablet `tablet_id`.
///
/// Header files are tablet-scoped, so `<anything>.hdr` becomes
/// `<tablet_id>.hdr`.  Segment names already carry their rowset identity
/// and pass through unchanged.  Any other suffix is not a legal snapshot
/// file.
pub fn replace_tablet_id(file_name: &str, tablet_id: i64) -> Result<String> {
    if file_name.ends_with(HEADER_SUFFIX) {
        Ok(format!("{}{}", tablet_id, HEADER_SUFFIX))
    } else if file_name.ends_with(DATA_SUFFIX) || file_name.ends_with(INDEX_SUFFIX) {
        Ok(file_name.to_owned())
    } else {
        Err(fresh_warn!("invalid tablet file name", %file_name)
            .with_kind(ErrorKind::InvalidFilename))
    }
}

#[test]
fn test_parse_local_path() {
    assert_eq!(
        tablet_id_and_schema_hash_from_path("/data/snapshot/20230410/10007/123")
            .expect("canonical path should parse"),
        (10007, 123)
    );

    assert_eq!(
        tablet_id_and_schema_hash_from_path("/10007/123").expect("short path should parse"),
        (10007, 123)
    );
}

#[test]
fn test_parse_local_path_rejects_malformed() {
    // Trailing separator.
    assert!(tablet_id_and_schema_hash_from_path("/data/10007/123/").is_err());
    // No separator at all.
    assert!(tablet_id_and_schema_hash_from_path("123").is_err());
    // Only one segment before the schema hash.
    assert!(tablet_id_and_schema_hash_from_path("10007/123").is_err());
    // Non-numeric components.
    assert!(tablet_id_and_schema_hash_from_path("/data/tablet/schema").is_err());

    let err = tablet_id_and_schema_hash_from_path("/data/10007/123/").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidPath);
}

#[test]
fn test_parse_remote_path() {
    assert_eq!(
        tablet_id_from_remote_path("bos://bucket/path/__tbl_10004/__part_10003/__idx_10004/__10005")
            .expect("remote path should parse"),
        10005
    );
    assert_eq!(
        tablet_id_from_remote_path("src_99935").expect("remote path should parse"),
        99935
    );

    assert!(tablet_id_from_remote_path("no-underscore-here").is_err());
    assert!(tablet_id_from_remote_path("trailing_").is_err());
}

#[test]
fn test_replace_tablet_id() {
    assert_eq!(
        replace_tablet_id("30002.hdr", 20015).expect(".hdr should rewrite"),
        "20015.hdr"
    );
    assert_eq!(
        replace_tablet_id("10007_2_2_0_0.dat", 20015).expect(".dat should pass through"),
        "10007_2_2_0_0.dat"
    );
    assert_eq!(
        replace_tablet_id("10007_2_2_0_0.idx", 20015).expect(".idx should pass through"),
        "10007_2_2_0_0.idx"
    );

    let err = replace_tablet_id("stale.tmp", 20015).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidFilename);
}

/// Rewriting is idempotent: a second application with the same tablet id
/// is a fixed point for all three legal suffixes.
#[test]
fn test_replace_tablet_id_idempotent() {
    for name in ["30002.hdr", "30002_9_9_0_0.dat", "30002_9_9_0_0.idx"] {
        let once = replace_tablet_id(name, 20015).expect("legal name should rewrite");
        let twice = replace_tablet_id(&once, 20015).expect("rewritten name should rewrite");
        assert_eq!(once, twice);
    }
}
