//! The narrow surface the engine needs from a remote storage backend, and
//! the backend-aware commit protocol for content-addressed uploads.
//!
//! Drivers (object store, distributed filesystem, file broker) live
//! outside this crate; the engine owns one `RemoteFileSystem` handle per
//! job and releases it when the job is dropped.
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use crate::chain_error;
use crate::result::Result;

/// The closed set of remote backend families.  Their data paths are
/// interchangeable; only the commit semantics of `upload_with_checksum`
/// differ.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RemoteBackendKind {
    /// S3-compatible object storage: a PUT is atomic to readers.
    ObjectStore,
    /// HDFS-like distributed filesystems: readers may observe partial
    /// writes, but rename is atomic.
    DistributedFs,
    /// Broker-fronted filesystems: same contract as `DistributedFs`.
    BrokerFs,
}

/// One entry of a remote directory listing.  `name` may be a full path or
/// a basename, at the driver's discretion; consumers take the basename.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RemoteFileInfo {
    pub name: String,
    pub size: u64,
}

/// A `host:port` pair for a broker or peer node.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct NetworkAddress {
    pub hostname: String,
    pub port: u16,
}

impl std::fmt::Display for NetworkAddress {
    fn fmt(&self, fmt: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(fmt, "{}:{}", self.hostname, self.port)
    }
}

/// Blocking operations on one remote storage backend.
///
/// All paths are backend-native strings; local paths are real filesystem
/// paths.  Every call may block for a full network round-trip.
pub trait RemoteFileSystem: Send + Sync + std::fmt::Debug {
    fn kind(&self) -> RemoteBackendKind;

    /// Copies the local file at `local` to the remote object `remote`.
    fn upload(&self, local: &Path, remote: &str) -> Result<()>;

    /// Copies the remote object `remote` to the local file `local`,
    /// creating or truncating it.
    fn download(&self, remote: &str, local: &Path) -> Result<()>;

    /// Atomically renames `from` to `to` on the backend.  Only called for
    /// backends whose kind uses the rename commit (see
    /// `upload_with_checksum`).
    fn rename(&self, from: &str, to: &str) -> Result<()>;

    /// Lists the immediate children of `dir` (non-recursive, files only).
    fn list(&self, dir: &str) -> Result<Vec<RemoteFileInfo>>;
}

/// Builds `RemoteFileSystem` handles from a backend kind and a location.
///
/// The factory is how driver crates plug in: `SnapshotLoader::init` passes
/// the job's connection properties (and broker address, for `BrokerFs`)
/// through verbatim.
pub trait RemoteFsFactory: Send + Sync {
    fn create(
        &self,
        kind: RemoteBackendKind,
        location: &str,
        broker_addr: Option<&NetworkAddress>,
        props: &HashMap<String, String>,
    ) -> Result<Arc<dyn RemoteFileSystem>>;
}

/// Uploads `local_path` to `<remote_path>.<checksum>` so that the final
/// name never refers to a partial object.
///
/// Object stores PUT atomically, so the object is written under its final
/// name directly.  Distributed and broker filesystems expose partial
/// writes to readers, so the file goes to `<remote_path>.part` first and
/// is renamed into place.
pub fn upload_with_checksum(
    fs: &dyn RemoteFileSystem,
    local_path: &Path,
    remote_path: &str,
    checksum: &str,
) -> Result<()> {
    let full_remote_path = format!("{}.{}", remote_path, checksum);

    match fs.kind() {
        RemoteBackendKind::DistributedFs | RemoteBackendKind::BrokerFs => {
            let temp = format!("{}.part", remote_path);
            fs.upload(local_path, &temp)
                .map_err(|e| chain_error!(e, "failed to upload to part file", %temp))?;
            fs.rename(&temp, &full_remote_path).map_err(
                |e| chain_error!(e, "failed to commit part file", %temp, %full_remote_path),
            )?;
        }
        RemoteBackendKind::ObjectStore => {
            fs.upload(local_path, &full_remote_path)
                .map_err(|e| chain_error!(e, "failed to upload object", %full_remote_path))?;
        }
    }

    Ok(())
}
