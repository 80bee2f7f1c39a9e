//! WORM evidence storage.

pub mod evidence;
pub mod object;
#[cfg(feature = "s3")]
pub mod s3;
pub mod validation;

pub use evidence::{
    EvidenceContent, EvidenceKey, EvidenceRecord, EvidenceStore, EvidenceStoreConfig,
    EvidenceSubmission, MirrorReport, PurgeReport, StoreOptions, StoreReceipt,
};
pub use object::{MemoryObjectStore, ObjectMeta, ObjectStore, ObjectStoreError, PutOptions};
#[cfg(feature = "s3")]
pub use s3::S3ObjectStore;
