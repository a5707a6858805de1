//! Per-connection state.
//!
//! Owned by exactly one `ConnectionHandler`; never shared.

use crate::crypto::SymmetricKey;
use crate::error::{Result, TransferError};
use crate::protocol::{ClientId, RequestCode};
use std::path::PathBuf;
use std::time::Instant;
use tokio::fs::File;

/// Where a connection is in the enroll / authenticate / upload / verify workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Nothing known about the peer yet
    Idle,
    /// Registered on this connection, no key yet
    Registered,
    /// Holds a symmetric key; may start an upload or report on an earlier one
    Keyed,
    /// Chunks 1..=received have been written
    Uploading { received: u16 },
    /// File reassembled and checksummed, waiting for the client's verdict
    Verifying,
    Completed,
    Aborted,
}

impl Phase {
    /// Transition table: which requests are valid in this phase.
    pub fn accepts(self, code: RequestCode) -> bool {
        use RequestCode::*;
        match self {
            Phase::Idle => matches!(code, Register | PublicKey | Reconnect),
            Phase::Registered => matches!(code, Register | PublicKey | Reconnect),
            Phase::Keyed => true,
            Phase::Uploading { .. } => code == SendFile,
            Phase::Verifying => matches!(
                code,
                ChecksumValid | ChecksumInvalidRetry | ChecksumInvalidAbort
            ),
            Phase::Completed | Phase::Aborted => false,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Phase::Completed | Phase::Aborted)
    }
}

/// The file currently being received.
#[derive(Debug)]
pub struct Upload {
    pub file_name: String,
    pub path: PathBuf,
    /// Open only while chunks are being written
    pub file: Option<File>,
    pub total_chunks: u16,
    pub content_size: u32,
    pub original_size: u32,
    pub bytes_written: u64,
    pub symmetric_key: SymmetricKey,
    pub started: Instant,
}

#[derive(Debug)]
pub struct Session {
    pub client_id: ClientId,
    pub name: Option<String>,
    pub symmetric_key: Option<SymmetricKey>,
    pub phase: Phase,
    pub upload: Option<Upload>,
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

impl Session {
    pub fn new() -> Self {
        Self {
            client_id: ClientId::NIL,
            name: None,
            symmetric_key: None,
            phase: Phase::Idle,
            upload: None,
        }
    }

    /// Reject requests that are out of place for the current phase.
    ///
    /// Once an identity is established every header must carry it.
    pub fn check(&self, header_id: ClientId, code: RequestCode) -> Result<()> {
        if !self.phase.accepts(code) {
            return Err(TransferError::protocol(format!(
                "{:?} not allowed while {:?}",
                code, self.phase
            )));
        }
        // a registration names a new client, so the header id is not checked
        let identified = self.phase != Phase::Idle && code != RequestCode::Register;
        if identified && header_id != self.client_id {
            return Err(TransferError::UnregisteredClient(header_id.to_string()));
        }
        Ok(())
    }

    pub fn registered(&mut self, id: ClientId, name: &str) {
        self.client_id = id;
        self.name = Some(name.to_string());
        self.symmetric_key = None;
        self.phase = Phase::Registered;
    }

    pub fn keyed(&mut self, id: ClientId, name: &str, key: SymmetricKey) {
        self.client_id = id;
        self.name = Some(name.to_string());
        self.symmetric_key = Some(key);
        self.phase = Phase::Keyed;
    }

    /// Forget the upload and go back to waiting for a new one.
    pub fn reset_upload(&mut self) -> Option<Upload> {
        self.phase = Phase::Keyed;
        self.upload.take()
    }
}
