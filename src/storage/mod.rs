//! Page blob storage.
//!
//! The [`backend::PageBlobStore`] trait abstracts over where pages land.
//! The Azure Blob REST client is the only shipped implementation; an
//! in-memory store backs the tests.

pub mod azure;
pub mod backend;
#[cfg(test)]
pub(crate) mod memory;
