//! Matrix end-to-end encryption wire types.
//!
//! Field names follow the Matrix client-server specification verbatim so the
//! documents interoperate with other clients. Nothing in this crate performs
//! cryptography; signing relies on [`codec::signable_json`] to produce the
//! canonical byte string.

pub mod codec;
pub mod error;
pub mod keys;
pub mod messages;
pub mod types;

pub use error::ProtocolError;
