//! Thin helpers over the local filesystem: directory listings, streamed
//! md5 hashing, and the permission tweaks the transfer protocol calls for.
use std::io::Read;
use std::path::Path;

use md5::Digest;
use md5::Md5;

use crate::chain_error;
use crate::result::Result;

/// Buffer size for streamed hashing.
const MD5_CHUNK_SIZE: usize = 1 << 16;

/// Returns the basenames of the regular files directly inside `dir`.
///
/// Subdirectories are skipped; snapshot directories are flat.  The result
/// is sorted so callers iterate deterministically.
pub fn list_existing_files(dir: &Path) -> Result<Vec<String>> {
    let mut files = Vec::new();

    let entries = std::fs::read_dir(dir)
        .map_err(|e| chain_error!(e, "failed to list local directory", ?dir))?;
    for entry in entries {
        let entry = entry.map_err(|e| chain_error!(e, "failed to read directory entry", ?dir))?;
        let file_type = entry
            .file_type()
            .map_err(|e| chain_error!(e, "failed to stat directory entry", ?entry))?;
        if !file_type.is_file() {
            continue;
        }

        match entry.file_name().into_string() {
            Ok(name) => files.push(name),
            Err(name) => {
                tracing::warn!(?name, ?dir, "skipping non-utf8 file name");
            }
        }
    }

    files.sort();
    tracing::debug!(?dir, count = files.len(), "listed local snapshot files");
    Ok(files)
}

/// Computes the lowercase hex md5 of the file at `path`, streaming so
/// segment files of any size hash in constant memory.
pub fn md5sum(path: &Path) -> Result<String> {
    let mut file = std::fs::File::open(path)
        .map_err(|e| chain_error!(e, "failed to open file for hashing", ?path))?;
    let mut hasher = Md5::new();
    let mut buf = [0u8; MD5_CHUNK_SIZE];

    loop {
        let n = file
            .read(&mut buf)
            .map_err(|e| chain_error!(e, "failed to read file for hashing", ?path))?;
        if n == 0 {
            break;
        }

        hasher.update(&buf[..n]);
    }

    Ok(hex::encode(hasher.finalize()))
}

/// Whether `path` names an existing directory.
pub fn is_directory(path: &Path) -> bool {
    path.is_dir()
}

/// Returns the size of the file at `path`, in bytes.
pub fn file_size(path: &Path) -> Result<u64> {
    let meta =
        std::fs::metadata(path).map_err(|e| chain_error!(e, "failed to stat file", ?path))?;
    Ok(meta.len())
}

/// Restricts `path` to owner read/write, the resting permission for
/// freshly downloaded snapshot files.
pub fn set_owner_rw(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;

    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
        .map_err(|e| chain_error!(e, "failed to update permissions", ?path))
}
