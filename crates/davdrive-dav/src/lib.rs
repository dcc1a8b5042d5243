//! davdrive dav - WebDAV remote storage adapter
//!
//! Implements the `IRemoteStorage` port against a WebDAV server with the
//! OC extension headers: PROPFIND enumeration, content transfer with
//! checksum headers, the chunked upload namespace and capability discovery.

pub mod client;
pub mod propfind;

pub use client::{DavClient, DavCredentials};
