//! davdrive engine - the synchronization core
//!
//! One sync run flows through three stages:
//!
//! ```text
//! SyncEngine ──► Discovery ──► ordered SyncItems ──► Propagator
//!                  │  reads                            │  writes
//!                  ▼                                   ▼
//!         Journal + Remote + Local fs        Remote + Local fs + Journal
//! ```
//!
//! Discovery joins the local tree, the remote tree and the journal into a
//! set of instructions; the propagator executes them with bounded
//! parallelism and keeps the journal consistent through partial failures.

pub mod conflicts;
pub mod discovery;
pub mod engine;
pub mod filesystem;
pub mod propagator;
pub mod vfs;

pub use engine::{ErrorCategory, SyncEngine, SyncEvent, SyncResult};
pub use filesystem::LocalFileSystem;
pub use vfs::{NoopPlaceholders, SuffixPlaceholders};
