//! Encrypted, chunked file transfer over a fixed binary TCP protocol.
//!
//! Clients register a name, trade an RSA public key for an AES session key,
//! upload a file in encrypted chunks and confirm the server's checksum.

pub mod client;
pub mod config;
pub mod crypto;
pub mod error;
pub mod files;
pub mod protocol;
pub mod server;
pub mod store;

pub use error::{Result, TransferError};
