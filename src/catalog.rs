//! Decodes a remote directory listing into a checksum catalog.
//!
//! Remote objects are content-addressed by name: `<basename>.<hex_md5>`.
//! Recovering the catalog is thus a pure listing, with no per-object
//! metadata round-trips.
use std::collections::BTreeMap;
use std::path::Path;

use crate::chain_error;
use crate::remote_fs::RemoteFileSystem;
use crate::result::Result;

/// One remote snapshot file, as recovered from its object name.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct FileStat {
    /// The local basename the object mirrors.
    pub name: String,
    /// Lowercase hex md5 of the contents, per the commit protocol.
    pub md5: String,
    pub size: u64,
}

/// Lists `dir` and decodes each entry's `<basename>.<checksum>` name.
///
/// Entries without a `.` separator (or ending in one) are skipped, not
/// errors: foreign files may coexist in the directory.  The ordered map
/// fixes the processing order of downstream transfers.
pub fn list_with_checksum(
    fs: &dyn RemoteFileSystem,
    dir: &str,
) -> Result<BTreeMap<String, FileStat>> {
    let mut catalog = BTreeMap::new();

    let entries = fs
        .list(dir)
        .map_err(|e| chain_error!(e, "failed to list remote directory", %dir))?;
    for entry in entries {
        // Backends may list full paths; the catalog is keyed on basenames.
        let file_name = match Path::new(&entry.name).file_name().and_then(|n| n.to_str()) {
            Some(name) => name,
            None => continue,
        };

        let (name, md5) = match file_name.rsplit_once('.') {
            Some((name, md5)) if !md5.is_empty() => (name, md5),
            _ => continue,
        };

        catalog.insert(
            name.to_owned(),
            FileStat {
                name: name.to_owned(),
                md5: md5.to_owned(),
                size: entry.size,
            },
        );
    }

    Ok(catalog)
}
