//! Offline-verifiable export archives.
//!
//! [`ExportBuilder`] resolves a scope, packages every artifact with its
//! inclusion proof against one signed checkpoint, and signs the index.
//! [`verify_archive`] checks such an archive with nothing but public keys.

pub mod archive;
mod builder;
mod download;
#[cfg(test)]
mod fixture;
mod index;
pub mod verify;

pub use builder::{
    EvidenceRef, ExportBuilder, ExportCreated, ExportScope, ExportState, ExportStatus,
    DEFAULT_MAX_RECORDS,
};
pub use download::{DownloadLink, DownloadLinks};
pub use index::{names, ExportIndex, IndexedFile, IndexedRecord, LeafProof, INDEX_FORMAT};
pub use verify::{verify_archive, verify_files, Check, VerificationReport};
