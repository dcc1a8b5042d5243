//! HTTP-level integration tests for the DAV client

mod common;
mod test_capabilities;
mod test_chunked;
mod test_propfind;
mod test_transfers;
