//! Reference client for the transfer protocol.
//!
//! Drives the same request sequence as the desktop client: register or
//! reconnect, exchange keys, upload, then report on the checksum.

use crate::crypto::{self, SymmetricKey};
use crate::error::{Result, TransferError};
use crate::protocol::{
    self, ChecksumReport, ClientId, FileChunk, PublicKeyExchange, Reconnection, Registration,
    Request, Response,
};
use bytes::Bytes;
use rsa::pkcs8::EncodePublicKey;
use rsa::{RsaPrivateKey, RsaPublicKey};
use tokio::io::{AsyncRead, AsyncWrite};

/// Ciphertext bytes per file chunk.
pub const CHUNK_SIZE: usize = 1024;

/// Upload attempts before the client gives up and aborts.
pub const MAX_ATTEMPTS: usize = 4;

/// What the server reported after reassembling a file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadReceipt {
    pub file_name: String,
    pub content_size: u32,
    pub checksum: u32,
}

/// Outcome of `Client::send_file`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Verified { attempts: usize },
    Aborted,
}

pub struct Client<S> {
    stream: S,
    name: String,
    client_id: ClientId,
    symmetric_key: Option<SymmetricKey>,
}

impl<S> Client<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: S, name: impl Into<String>) -> Self {
        Self::with_id(stream, name, ClientId::NIL)
    }

    /// A client that registered in an earlier session.
    pub fn with_id(stream: S, name: impl Into<String>, client_id: ClientId) -> Self {
        Self {
            stream,
            name: name.into(),
            client_id,
            symmetric_key: None,
        }
    }

    pub fn id(&self) -> ClientId {
        self.client_id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn symmetric_key(&self) -> Option<&SymmetricKey> {
        self.symmetric_key.as_ref()
    }

    /// Send one request and read one response.
    pub async fn request(&mut self, request: &Request) -> Result<Response> {
        self.send(request).await?;
        protocol::read_response(&mut self.stream).await
    }

    async fn send(&mut self, request: &Request) -> Result<()> {
        let frame = request.encode(self.client_id);
        protocol::write_frame(&mut self.stream, &frame).await
    }

    pub async fn register(&mut self) -> Result<ClientId> {
        let request = Request::Register(Registration {
            name: self.name.clone(),
        });
        match self.request(&request).await? {
            Response::RegistrationSucceeded { client_id } => {
                self.client_id = client_id;
                Ok(client_id)
            }
            Response::RegistrationFailed => Err(TransferError::DuplicateClient(self.name.clone())),
            other => Err(unexpected("registration", &other)),
        }
    }

    /// Send our public key and unwrap the symmetric key that comes back.
    pub async fn exchange_public_key(&mut self, private_key: &RsaPrivateKey) -> Result<()> {
        let public_key = RsaPublicKey::from(private_key)
            .to_public_key_der()
            .map_err(|e| TransferError::Crypto(format!("cannot encode public key: {}", e)))?;
        let request = Request::PublicKey(PublicKeyExchange {
            name: self.name.clone(),
            public_key: Bytes::copy_from_slice(public_key.as_bytes()),
        });
        match self.request(&request).await? {
            Response::PublicKeyAccepted { encrypted_key, .. } => {
                self.symmetric_key = Some(crypto::unwrap_key(private_key, &encrypted_key)?);
                Ok(())
            }
            Response::ReconnectionFailed { client_id } => {
                Err(TransferError::UnregisteredClient(client_id.to_string()))
            }
            other => Err(unexpected("key exchange", &other)),
        }
    }

    pub async fn reconnect(&mut self, private_key: &RsaPrivateKey) -> Result<()> {
        let request = Request::Reconnect(Reconnection {
            name: self.name.clone(),
        });
        match self.request(&request).await? {
            Response::ReconnectSucceeded { encrypted_key, .. } => {
                self.symmetric_key = Some(crypto::unwrap_key(private_key, &encrypted_key)?);
                Ok(())
            }
            Response::ReconnectionFailed { client_id } => {
                Err(TransferError::UnregisteredClient(client_id.to_string()))
            }
            other => Err(unexpected("reconnect", &other)),
        }
    }

    /// Encrypt `plaintext` and send it in `CHUNK_SIZE` pieces.
    pub async fn upload(&mut self, file_name: &str, plaintext: &[u8]) -> Result<UploadReceipt> {
        let key = self
            .symmetric_key
            .as_ref()
            .ok_or_else(|| TransferError::protocol("no symmetric key, exchange keys first"))?;
        let ciphertext = crypto::encrypt_file(key, plaintext)?;
        let chunks = split_into_chunks(file_name, plaintext.len(), &ciphertext)?;

        for chunk in chunks {
            match self.request(&Request::SendFile(chunk)).await? {
                Response::ReceivedMessage { .. } => {}
                other => return Err(unexpected("file chunk", &other)),
            }
        }

        match protocol::read_response(&mut self.stream).await? {
            Response::FileReceived {
                content_size,
                file_name,
                checksum,
                ..
            } => Ok(UploadReceipt {
                file_name,
                content_size,
                checksum,
            }),
            other => Err(unexpected("file upload", &other)),
        }
    }

    pub async fn confirm(&mut self, file_name: &str) -> Result<()> {
        let request = Request::ChecksumValid(report(file_name));
        self.expect_ack(&request, "checksum confirmation").await
    }

    /// Ask to upload again. The server does not answer this one.
    pub async fn report_retry(&mut self, file_name: &str) -> Result<()> {
        self.send(&Request::ChecksumInvalidRetry(report(file_name))).await
    }

    pub async fn report_abort(&mut self, file_name: &str) -> Result<()> {
        let request = Request::ChecksumInvalidAbort(report(file_name));
        self.expect_ack(&request, "abort").await
    }

    /// Upload and verify, retrying on checksum mismatch.
    pub async fn send_file(&mut self, file_name: &str, plaintext: &[u8]) -> Result<Delivery> {
        let expected = crypto::cksum(plaintext);

        for attempt in 1..=MAX_ATTEMPTS {
            let receipt = self.upload(file_name, plaintext).await?;
            if receipt.checksum == expected {
                self.confirm(file_name).await?;
                tracing::info!("{} verified after {} attempt(s)", file_name, attempt);
                return Ok(Delivery::Verified { attempts: attempt });
            }

            tracing::warn!(
                "Checksum mismatch for {} (attempt {}): server {} local {}",
                file_name,
                attempt,
                receipt.checksum,
                expected
            );
            if attempt < MAX_ATTEMPTS {
                self.report_retry(file_name).await?;
            }
        }

        self.report_abort(file_name).await?;
        Ok(Delivery::Aborted)
    }

    async fn expect_ack(&mut self, request: &Request, what: &str) -> Result<()> {
        match self.request(request).await? {
            Response::ReceivedMessage { .. } => Ok(()),
            other => Err(unexpected(what, &other)),
        }
    }
}

fn report(file_name: &str) -> ChecksumReport {
    ChecksumReport {
        file_name: file_name.to_string(),
    }
}

fn unexpected(what: &str, response: &Response) -> TransferError {
    TransferError::protocol(format!("{} answered with {:?}", what, response.code()))
}

/// Cut ciphertext into numbered chunks that all carry the file's sizes.
fn split_into_chunks(
    file_name: &str,
    original_size: usize,
    ciphertext: &[u8],
) -> Result<Vec<FileChunk>> {
    let total = ciphertext.len().div_ceil(CHUNK_SIZE);
    let total_chunks = u16::try_from(total)
        .map_err(|_| TransferError::protocol(format!("{} needs too many chunks", file_name)))?;
    let content_size = u32::try_from(ciphertext.len())
        .map_err(|_| TransferError::protocol(format!("{} is too large", file_name)))?;
    let original_size = u32::try_from(original_size)
        .map_err(|_| TransferError::protocol(format!("{} is too large", file_name)))?;

    Ok(ciphertext
        .chunks(CHUNK_SIZE)
        .zip(1..=total_chunks)
        .map(|(part, chunk_number)| FileChunk {
            content_size,
            original_size,
            total_chunks,
            chunk_number,
            file_name: file_name.to_string(),
            content: Bytes::copy_from_slice(part),
        })
        .collect())
}
