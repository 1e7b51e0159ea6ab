//! vhdpush library -- VHD upload to Azure page blobs.
//!
//! The binary wires these modules into a single pipeline:
//! credentials, management authentication, local image validation,
//! metadata extraction, range planning, parallel upload and MD5 tagging.

pub mod auth;
pub mod config;
pub mod credentials;
pub mod errors;
pub mod finalize;
pub mod image_metadata;
pub mod plan;
pub mod push;
pub mod range;
pub mod retry;
pub mod storage;
pub mod upload;
pub mod vhd;
