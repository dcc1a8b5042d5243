//! Domain entities and value types

pub mod checksum;
pub mod errors;
pub mod newtypes;
pub mod records;
pub mod sync_item;

pub use checksum::{Checksum, ChecksumAlgorithm};
pub use errors::DomainError;
pub use newtypes::{ETag, FileId, SyncPath};
pub use records::{
    BlacklistCategory, BlacklistEntry, ConflictRecord, FileRecord, FileType, SelectiveSyncKind,
    UploadInfo,
};
pub use sync_item::{Direction, Instruction, ItemStatus, SyncItem};
