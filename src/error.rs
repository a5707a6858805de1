use std::io;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, TransferError>;

/// Everything a request can fail with.
///
/// The first four variants are domain failures with a dedicated wire response.
/// `ConnectionClosed` and `Transport` end the connection. Everything else is
/// reported to the client as a general failure.
#[derive(Error, Debug)]
pub enum TransferError {
    #[error("Client name already registered: {0}")]
    DuplicateClient(String),

    #[error("Client {0} is not registered")]
    UnregisteredClient(String),

    #[error("File {file_name} already exists for client {client_id}")]
    DuplicateFile { client_id: String, file_name: String },

    #[error("File {file_name} does not exist for client {client_id}")]
    InexistentFile { client_id: String, file_name: String },

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Connection closed by peer")]
    ConnectionClosed,

    #[error("Socket error: {0}")]
    Transport(#[source] io::Error),

    #[error("Crypto error: {0}")]
    Crypto(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Store error: {0}")]
    Store(#[from] fjall::Error),

    #[error("Record encoding error: {0}")]
    Encoding(#[from] bincode::Error),
}

impl TransferError {
    pub fn protocol(msg: impl Into<String>) -> Self {
        TransferError::Protocol(msg.into())
    }

    /// Map an I/O error on the client socket.
    ///
    /// A peer that goes away mid-read surfaces as `UnexpectedEof` and is
    /// reported as `ConnectionClosed`.
    pub fn from_socket(e: io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::UnexpectedEof => TransferError::ConnectionClosed,
            _ => TransferError::Transport(e),
        }
    }

    /// True when the connection can no longer be used.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            TransferError::ConnectionClosed | TransferError::Transport(_)
        )
    }

    /// True for the failures that have a specific response and never roll back state.
    pub fn is_domain(&self) -> bool {
        matches!(
            self,
            TransferError::DuplicateClient(_)
                | TransferError::UnregisteredClient(_)
                | TransferError::DuplicateFile { .. }
                | TransferError::InexistentFile { .. }
        )
    }
}
