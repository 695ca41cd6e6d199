//! File synchronization between a leased pod's working area and external storage.
//!
//! The fleet manager only sees the [`FileSync`] hook and the [`SyncTask`] it returns.
//! [`DirectoryMirror`] is the default hook: it mirrors the pod's data directory into a
//! target directory on the host.

pub mod directory_mirror;
pub mod file_sync_trait;

pub use directory_mirror::DirectoryMirror;
pub use file_sync_trait::{BindSpec, FileSync, SyncTask};
