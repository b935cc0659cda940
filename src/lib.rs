//! Tabletsync moves tablet snapshots (a directory of immutable segment
//! files plus a header file) between a local storage node and either a
//! pluggable remote backend (object store, distributed filesystem, file
//! broker) or a peer node's HTTP download API, and installs a downloaded
//! snapshot into the live tablet directory.
//!
//! Remote snapshots are content-addressed: every object is named
//! `<basename>.<hex_md5>`, so a directory listing doubles as a checksum
//! catalog, presence implies content, and re-running an interrupted
//! transfer only moves what is missing or mismatched.
//!
//! The engine is deliberately synchronous: one job blocks one thread, and
//! cancellation is polled at progress-report boundaries rather than
//! pushed.  Remote drivers, the tablet manager, the snapshot manager, and
//! the coordinator RPC are all consumed through the narrow traits in
//! `remote_fs`, `tablet`, and `progress`.
pub mod catalog;
pub mod config;
pub mod http_client;
pub mod loader;
pub mod local_fs;
pub mod name_schema;
pub mod progress;
pub mod remote_fs;
pub mod result;
pub mod snapshot_lock;
pub mod tablet;

pub use crate::config::TransferConfig;
pub use crate::loader::RemoteTabletSnapshot;
pub use crate::loader::SnapshotLoader;
pub use crate::loader::StorageEnv;
pub use crate::result::Error;
pub use crate::result::ErrorKind;
pub use crate::result::Result;
pub use crate::snapshot_lock::LocalSnapshotLock;
