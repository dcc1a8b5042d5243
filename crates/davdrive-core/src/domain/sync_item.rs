//! Sync items
//!
//! Discovery emits one [`SyncItem`] per path that needs attention; the
//! propagator executes them and fills in the final [`ItemStatus`].

use std::fmt;

use serde::{Deserialize, Serialize};

use super::newtypes::{ETag, FileId, SyncPath};
use super::records::FileType;

/// What discovery decided should happen to a path
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Instruction {
    /// Nothing to do.
    #[default]
    None,
    /// Decision deferred; only used transiently inside discovery.
    Eval,
    /// Remove the path on the side given by the direction.
    Remove,
    /// Move `path` to `rename_target`.
    Rename,
    /// Create a path that exists on only one side.
    New,
    /// Transfer changed content.
    Sync,
    /// Both sides changed; keep a conflict copy, then download.
    Conflict,
    /// Skip the path, with a reason in `error_string`.
    Ignore,
    /// The entry cannot be processed (missing metadata, etc).
    Error,
    /// Only bookkeeping changes; no data transfer.
    UpdateMetadata,
    /// The entry changed kind (file <-> directory).
    TypeChange,
}

impl Instruction {
    /// Instructions that move file content over the network.
    #[must_use]
    pub fn is_data_transfer(&self) -> bool {
        matches!(
            self,
            Instruction::New | Instruction::Sync | Instruction::Conflict | Instruction::TypeChange
        )
    }
}

/// Which side an instruction applies to
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    /// No transfer direction (conflicts, metadata updates).
    #[default]
    None,
    /// Local change propagates to the server.
    Up,
    /// Remote change propagates to the local tree.
    Down,
}

/// Outcome of propagating one item
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    /// Not propagated yet.
    #[default]
    NoStatus,
    Success,
    /// Transient failure; retried next run without blacklisting.
    SoftError,
    /// Failure recorded in the error blacklist with backoff.
    NormalError,
    /// Failure that aborts the whole run.
    FatalError,
    /// Resolved by creating a conflict copy.
    Conflict,
    /// Deliberately skipped (blacklist, quota guess, invalid name).
    FileIgnored,
    /// A file the server restored for us (e.g. undeleted).
    Restoration,
}

impl ItemStatus {
    /// Statuses that leave the run's success flag intact.
    #[must_use]
    pub fn is_benign(&self) -> bool {
        matches!(
            self,
            ItemStatus::NoStatus
                | ItemStatus::Success
                | ItemStatus::Conflict
                | ItemStatus::FileIgnored
                | ItemStatus::Restoration
        )
    }
}

impl fmt::Display for ItemStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ItemStatus::NoStatus => "pending",
            ItemStatus::Success => "success",
            ItemStatus::SoftError => "soft error",
            ItemStatus::NormalError => "error",
            ItemStatus::FatalError => "fatal error",
            ItemStatus::Conflict => "conflict",
            ItemStatus::FileIgnored => "ignored",
            ItemStatus::Restoration => "restoration",
        };
        write!(f, "{s}")
    }
}

/// One unit of work produced by discovery
///
/// Size and modtime describe the side the data will come from (the remote
/// entry for downloads and conflicts, the local entry for uploads); the
/// `previous_*` fields carry the journal's last-synced values.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncItem {
    pub path: SyncPath,
    /// Destination path for `Rename` instructions.
    pub rename_target: Option<SyncPath>,
    pub instruction: Instruction,
    pub direction: Direction,
    pub file_type: FileType,
    pub size: u64,
    pub modtime: i64,
    pub previous_size: u64,
    pub previous_modtime: i64,
    pub etag: Option<ETag>,
    pub file_id: Option<FileId>,
    /// Server permission string, when known.
    pub remote_perm: Option<String>,
    /// Raw `OC-Checksum`-style header advertised for the remote entry.
    pub checksum_header: Option<String>,
    /// Local inode hint for move detection.
    pub inode: u64,
    pub error_string: Option<String>,
    pub status: ItemStatus,
}

impl SyncItem {
    /// A no-op item for a path.
    pub fn none(path: SyncPath) -> Self {
        Self {
            path,
            ..Default::default()
        }
    }

    pub fn is_directory(&self) -> bool {
        self.file_type.is_directory()
    }

    /// True when propagating this item will touch the network.
    pub fn needs_network(&self) -> bool {
        match self.instruction {
            Instruction::None
            | Instruction::Eval
            | Instruction::Ignore
            | Instruction::Error
            | Instruction::UpdateMetadata => false,
            Instruction::Remove => matches!(self.direction, Direction::Up),
            _ => true,
        }
    }

    /// Marks the item failed with a message.
    pub fn set_error(&mut self, status: ItemStatus, message: impl Into<String>) {
        self.status = status;
        self.error_string = Some(message.into());
    }
}
