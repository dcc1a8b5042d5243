//! davdrive core - domain model and port definitions
//!
//! This crate contains the hexagonal architecture core with:
//! - Domain entities (SyncItem, FileRecord, ConflictRecord, UploadInfo)
//! - Port definitions (traits for the remote storage, local filesystem,
//!   journal and placeholder adapters)
//! - Sync options and server capability negotiation

pub mod capabilities;
pub mod config;
pub mod domain;
pub mod ports;
