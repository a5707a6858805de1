//! Wire codec for the file-transfer protocol.
//!
//! One request, one response per turn (the last file chunk gets two).
//! Wire format: all multi-byte integers are little-endian.
//! Fixed-width strings are NUL-padded on encode and cut at the first NUL on decode.
//!
//! Request frame:  client_id:[u8;16] | version:u8 | code:u16 | len:u32 | payload
//! Response frame: version:u8 | code:u16 | len:u32 | payload

use crate::error::{Result, TransferError};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::fmt;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// The only protocol version this server speaks
pub const PROTOCOL_VERSION: u8 = 3;

pub const CLIENT_ID_SIZE: usize = 16;
pub const REQUEST_HEADER_SIZE: usize = CLIENT_ID_SIZE + 1 + 2 + 4;
pub const RESPONSE_HEADER_SIZE: usize = 1 + 2 + 4;

/// Width of the client name field
pub const NAME_SIZE: usize = 255;

/// Width of the file name field
pub const FILE_NAME_SIZE: usize = 255;

/// content_size:u32 | original_size:u32 | total_chunks:u16 | chunk_number:u16 | file_name
pub const FILE_CHUNK_PREFIX_SIZE: usize = 4 + 4 + 2 + 2 + FILE_NAME_SIZE;

pub const CHECKSUM_SIZE: usize = 4;

/// Maximum payload size (64MB) - larger payloads are drained and rejected
pub const MAX_PAYLOAD_SIZE: u32 = 64 * 1024 * 1024;

// =============================================================================
// Client Id
// =============================================================================

/// 16-byte client identifier assigned at registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ClientId(pub [u8; CLIENT_ID_SIZE]);

impl ClientId {
    pub const NIL: ClientId = ClientId([0; CLIENT_ID_SIZE]);

    pub fn random() -> Self {
        ClientId(*uuid::Uuid::new_v4().as_bytes())
    }

    pub fn as_bytes(&self) -> &[u8; CLIENT_ID_SIZE] {
        &self.0
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let arr: [u8; CLIENT_ID_SIZE] = bytes
            .try_into()
            .map_err(|_| TransferError::protocol(format!("client id must be {} bytes", CLIENT_ID_SIZE)))?;
        Ok(ClientId(arr))
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

// =============================================================================
// Codes
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum RequestCode {
    Register = 825,
    PublicKey = 826,
    Reconnect = 827,
    SendFile = 828,
    ChecksumValid = 900,
    ChecksumInvalidRetry = 901,
    ChecksumInvalidAbort = 902,
}

impl RequestCode {
    pub fn from_u16(v: u16) -> Option<Self> {
        match v {
            825 => Some(Self::Register),
            826 => Some(Self::PublicKey),
            827 => Some(Self::Reconnect),
            828 => Some(Self::SendFile),
            900 => Some(Self::ChecksumValid),
            901 => Some(Self::ChecksumInvalidRetry),
            902 => Some(Self::ChecksumInvalidAbort),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum ResponseCode {
    RegistrationSucceeded = 1600,
    RegistrationFailed = 1601,
    PublicKeyAccepted = 1602,
    FileReceived = 1603,
    ReceivedMessage = 1604,
    ReconnectSucceeded = 1605,
    ReconnectionFailed = 1606,
    GeneralFailure = 1607,
}

impl ResponseCode {
    pub fn from_u16(v: u16) -> Option<Self> {
        match v {
            1600 => Some(Self::RegistrationSucceeded),
            1601 => Some(Self::RegistrationFailed),
            1602 => Some(Self::PublicKeyAccepted),
            1603 => Some(Self::FileReceived),
            1604 => Some(Self::ReceivedMessage),
            1605 => Some(Self::ReconnectSucceeded),
            1606 => Some(Self::ReconnectionFailed),
            1607 => Some(Self::GeneralFailure),
            _ => None,
        }
    }
}

// =============================================================================
// Fixed-width strings
// =============================================================================

/// Write `s` NUL-padded to `width`, cutting only at a char boundary.
fn put_fixed_str(buf: &mut BytesMut, s: &str, width: usize) {
    let mut n = s.len().min(width);
    while !s.is_char_boundary(n) {
        n -= 1;
    }
    buf.put_slice(&s.as_bytes()[..n]);
    buf.put_bytes(0, width - n);
}

fn get_fixed_str(payload: &mut Bytes, width: usize, what: &str) -> Result<String> {
    if payload.remaining() < width {
        return Err(TransferError::protocol(format!("{} field truncated", what)));
    }
    let raw = payload.copy_to_bytes(width);
    let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
    String::from_utf8(raw[..end].to_vec())
        .map_err(|_| TransferError::protocol(format!("Invalid UTF-8 in {}", what)))
}

// =============================================================================
// Headers
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestHeader {
    pub client_id: ClientId,
    pub version: u8,
    pub code: u16,
    pub payload_len: u32,
}

impl RequestHeader {
    /// Parse the fixed header without checking the version.
    fn parse(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < REQUEST_HEADER_SIZE {
            return Err(TransferError::protocol(format!(
                "request header needs {} bytes, got {}",
                REQUEST_HEADER_SIZE,
                bytes.len()
            )));
        }
        let mut buf = &bytes[..REQUEST_HEADER_SIZE];
        let client_id = ClientId::from_slice(&buf[..CLIENT_ID_SIZE])?;
        buf.advance(CLIENT_ID_SIZE);
        Ok(Self {
            client_id,
            version: buf.get_u8(),
            code: buf.get_u16_le(),
            payload_len: buf.get_u32_le(),
        })
    }

    fn check_version(&self) -> Result<()> {
        if self.version != PROTOCOL_VERSION {
            return Err(TransferError::protocol(format!(
                "unsupported protocol version {} (server speaks {})",
                self.version, PROTOCOL_VERSION
            )));
        }
        Ok(())
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(REQUEST_HEADER_SIZE);
        buf.put_slice(self.client_id.as_bytes());
        buf.put_u8(self.version);
        buf.put_u16_le(self.code);
        buf.put_u32_le(self.payload_len);
        buf.freeze()
    }
}

/// Decode and validate a request header.
pub fn decode_header(bytes: &[u8]) -> Result<RequestHeader> {
    let header = RequestHeader::parse(bytes)?;
    header.check_version()?;
    Ok(header)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResponseHeader {
    pub version: u8,
    pub code: u16,
    pub payload_len: u32,
}

pub fn decode_response_header(bytes: &[u8]) -> Result<ResponseHeader> {
    if bytes.len() < RESPONSE_HEADER_SIZE {
        return Err(TransferError::protocol("response header truncated"));
    }
    let mut buf = &bytes[..RESPONSE_HEADER_SIZE];
    let header = ResponseHeader {
        version: buf.get_u8(),
        code: buf.get_u16_le(),
        payload_len: buf.get_u32_le(),
    };
    if header.version != PROTOCOL_VERSION {
        return Err(TransferError::protocol(format!(
            "unsupported server version {}",
            header.version
        )));
    }
    Ok(header)
}

/// Pack a response header followed by the payload verbatim.
pub fn encode_frame(code: ResponseCode, payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(RESPONSE_HEADER_SIZE + payload.len());
    buf.put_u8(PROTOCOL_VERSION);
    buf.put_u16_le(code as u16);
    buf.put_u32_le(payload.len() as u32);
    buf.put_slice(payload);
    buf.freeze()
}

// =============================================================================
// Request payloads
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registration {
    pub name: String,
}

impl Registration {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(NAME_SIZE);
        put_fixed_str(&mut buf, &self.name, NAME_SIZE);
        buf.freeze()
    }

    /// Shorter payloads are accepted; the name ends at the first NUL.
    pub fn decode(mut payload: Bytes) -> Result<Self> {
        let width = payload.remaining().min(NAME_SIZE);
        Ok(Self {
            name: get_fixed_str(&mut payload, width, "name")?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublicKeyExchange {
    pub name: String,
    pub public_key: Bytes,
}

impl PublicKeyExchange {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(NAME_SIZE + self.public_key.len());
        put_fixed_str(&mut buf, &self.name, NAME_SIZE);
        buf.put_slice(&self.public_key);
        buf.freeze()
    }

    /// The key is everything after the name field.
    pub fn decode(mut payload: Bytes) -> Result<Self> {
        let name = get_fixed_str(&mut payload, NAME_SIZE, "name")?;
        if !payload.has_remaining() {
            return Err(TransferError::protocol("public key missing"));
        }
        Ok(Self {
            name,
            public_key: payload,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reconnection {
    pub name: String,
}

impl Reconnection {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(NAME_SIZE);
        put_fixed_str(&mut buf, &self.name, NAME_SIZE);
        buf.freeze()
    }

    pub fn decode(mut payload: Bytes) -> Result<Self> {
        let width = payload.remaining().min(NAME_SIZE);
        Ok(Self {
            name: get_fixed_str(&mut payload, width, "name")?,
        })
    }
}

/// One encrypted piece of a file upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileChunk {
    /// Total ciphertext size of the whole file
    pub content_size: u32,
    /// Plaintext size of the whole file
    pub original_size: u32,
    pub total_chunks: u16,
    /// 1-based
    pub chunk_number: u16,
    pub file_name: String,
    pub content: Bytes,
}

impl FileChunk {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(FILE_CHUNK_PREFIX_SIZE + self.content.len());
        buf.put_u32_le(self.content_size);
        buf.put_u32_le(self.original_size);
        buf.put_u16_le(self.total_chunks);
        buf.put_u16_le(self.chunk_number);
        put_fixed_str(&mut buf, &self.file_name, FILE_NAME_SIZE);
        buf.put_slice(&self.content);
        buf.freeze()
    }

    pub fn decode(mut payload: Bytes) -> Result<Self> {
        if payload.remaining() < FILE_CHUNK_PREFIX_SIZE {
            return Err(TransferError::protocol(format!(
                "file chunk payload too short: {} bytes",
                payload.remaining()
            )));
        }
        let content_size = payload.get_u32_le();
        let original_size = payload.get_u32_le();
        let total_chunks = payload.get_u16_le();
        let chunk_number = payload.get_u16_le();
        let file_name = get_fixed_str(&mut payload, FILE_NAME_SIZE, "file name")?;

        Ok(Self {
            content_size,
            original_size,
            total_chunks,
            chunk_number,
            file_name,
            content: payload,
        })
    }

    pub fn is_last(&self) -> bool {
        self.chunk_number == self.total_chunks
    }
}

/// Payload of the three checksum verdict requests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChecksumReport {
    pub file_name: String,
}

impl ChecksumReport {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(FILE_NAME_SIZE);
        put_fixed_str(&mut buf, &self.file_name, FILE_NAME_SIZE);
        buf.freeze()
    }

    pub fn decode(mut payload: Bytes) -> Result<Self> {
        let width = payload.remaining().min(FILE_NAME_SIZE);
        Ok(Self {
            file_name: get_fixed_str(&mut payload, width, "file name")?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Register(Registration),
    PublicKey(PublicKeyExchange),
    Reconnect(Reconnection),
    SendFile(FileChunk),
    ChecksumValid(ChecksumReport),
    ChecksumInvalidRetry(ChecksumReport),
    ChecksumInvalidAbort(ChecksumReport),
}

impl Request {
    pub fn code(&self) -> RequestCode {
        match self {
            Request::Register(_) => RequestCode::Register,
            Request::PublicKey(_) => RequestCode::PublicKey,
            Request::Reconnect(_) => RequestCode::Reconnect,
            Request::SendFile(_) => RequestCode::SendFile,
            Request::ChecksumValid(_) => RequestCode::ChecksumValid,
            Request::ChecksumInvalidRetry(_) => RequestCode::ChecksumInvalidRetry,
            Request::ChecksumInvalidAbort(_) => RequestCode::ChecksumInvalidAbort,
        }
    }

    pub fn decode(code: u16, payload: Bytes) -> Result<Self> {
        let code = RequestCode::from_u16(code)
            .ok_or_else(|| TransferError::protocol(format!("unknown request code {}", code)))?;
        Ok(match code {
            RequestCode::Register => Request::Register(Registration::decode(payload)?),
            RequestCode::PublicKey => Request::PublicKey(PublicKeyExchange::decode(payload)?),
            RequestCode::Reconnect => Request::Reconnect(Reconnection::decode(payload)?),
            RequestCode::SendFile => Request::SendFile(FileChunk::decode(payload)?),
            RequestCode::ChecksumValid => Request::ChecksumValid(ChecksumReport::decode(payload)?),
            RequestCode::ChecksumInvalidRetry => {
                Request::ChecksumInvalidRetry(ChecksumReport::decode(payload)?)
            }
            RequestCode::ChecksumInvalidAbort => {
                Request::ChecksumInvalidAbort(ChecksumReport::decode(payload)?)
            }
        })
    }

    /// Encode a complete request frame.
    pub fn encode(&self, client_id: ClientId) -> Bytes {
        let payload = match self {
            Request::Register(r) => r.encode(),
            Request::PublicKey(r) => r.encode(),
            Request::Reconnect(r) => r.encode(),
            Request::SendFile(r) => r.encode(),
            Request::ChecksumValid(r)
            | Request::ChecksumInvalidRetry(r)
            | Request::ChecksumInvalidAbort(r) => r.encode(),
        };
        let header = RequestHeader {
            client_id,
            version: PROTOCOL_VERSION,
            code: self.code() as u16,
            payload_len: payload.len() as u32,
        };
        let mut buf = BytesMut::with_capacity(REQUEST_HEADER_SIZE + payload.len());
        buf.put(header.encode());
        buf.put(payload);
        buf.freeze()
    }
}

// =============================================================================
// Responses
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    RegistrationSucceeded {
        client_id: ClientId,
    },
    RegistrationFailed,
    PublicKeyAccepted {
        client_id: ClientId,
        encrypted_key: Bytes,
    },
    FileReceived {
        client_id: ClientId,
        content_size: u32,
        file_name: String,
        checksum: u32,
    },
    ReceivedMessage {
        client_id: ClientId,
    },
    ReconnectSucceeded {
        client_id: ClientId,
        encrypted_key: Bytes,
    },
    ReconnectionFailed {
        client_id: ClientId,
    },
    GeneralFailure,
}

impl Response {
    pub fn code(&self) -> ResponseCode {
        match self {
            Response::RegistrationSucceeded { .. } => ResponseCode::RegistrationSucceeded,
            Response::RegistrationFailed => ResponseCode::RegistrationFailed,
            Response::PublicKeyAccepted { .. } => ResponseCode::PublicKeyAccepted,
            Response::FileReceived { .. } => ResponseCode::FileReceived,
            Response::ReceivedMessage { .. } => ResponseCode::ReceivedMessage,
            Response::ReconnectSucceeded { .. } => ResponseCode::ReconnectSucceeded,
            Response::ReconnectionFailed { .. } => ResponseCode::ReconnectionFailed,
            Response::GeneralFailure => ResponseCode::GeneralFailure,
        }
    }

    fn payload(&self) -> Bytes {
        match self {
            Response::RegistrationFailed | Response::GeneralFailure => Bytes::new(),
            Response::RegistrationSucceeded { client_id }
            | Response::ReceivedMessage { client_id }
            | Response::ReconnectionFailed { client_id } => {
                Bytes::copy_from_slice(client_id.as_bytes())
            }
            Response::PublicKeyAccepted {
                client_id,
                encrypted_key,
            }
            | Response::ReconnectSucceeded {
                client_id,
                encrypted_key,
            } => {
                let mut buf = BytesMut::with_capacity(CLIENT_ID_SIZE + encrypted_key.len());
                buf.put_slice(client_id.as_bytes());
                buf.put_slice(encrypted_key);
                buf.freeze()
            }
            Response::FileReceived {
                client_id,
                content_size,
                file_name,
                checksum,
            } => {
                let mut buf =
                    BytesMut::with_capacity(CLIENT_ID_SIZE + 4 + FILE_NAME_SIZE + CHECKSUM_SIZE);
                buf.put_slice(client_id.as_bytes());
                buf.put_u32_le(*content_size);
                put_fixed_str(&mut buf, file_name, FILE_NAME_SIZE);
                buf.put_u32_le(*checksum);
                buf.freeze()
            }
        }
    }

    /// Encode a complete response frame.
    pub fn encode(&self) -> Bytes {
        encode_frame(self.code(), &self.payload())
    }

    pub fn decode(code: u16, mut payload: Bytes) -> Result<Self> {
        let code = ResponseCode::from_u16(code)
            .ok_or_else(|| TransferError::protocol(format!("unknown response code {}", code)))?;

        let take_id = |payload: &mut Bytes| -> Result<ClientId> {
            if payload.remaining() < CLIENT_ID_SIZE {
                return Err(TransferError::protocol("response client id truncated"));
            }
            ClientId::from_slice(&payload.split_to(CLIENT_ID_SIZE))
        };

        Ok(match code {
            ResponseCode::RegistrationSucceeded => Response::RegistrationSucceeded {
                client_id: take_id(&mut payload)?,
            },
            ResponseCode::RegistrationFailed => Response::RegistrationFailed,
            ResponseCode::PublicKeyAccepted => Response::PublicKeyAccepted {
                client_id: take_id(&mut payload)?,
                encrypted_key: payload,
            },
            ResponseCode::ReconnectSucceeded => Response::ReconnectSucceeded {
                client_id: take_id(&mut payload)?,
                encrypted_key: payload,
            },
            ResponseCode::FileReceived => {
                let client_id = take_id(&mut payload)?;
                if payload.remaining() < 4 + FILE_NAME_SIZE + CHECKSUM_SIZE {
                    return Err(TransferError::protocol("FileReceived payload truncated"));
                }
                let content_size = payload.get_u32_le();
                let file_name = get_fixed_str(&mut payload, FILE_NAME_SIZE, "file name")?;
                let checksum = payload.get_u32_le();
                Response::FileReceived {
                    client_id,
                    content_size,
                    file_name,
                    checksum,
                }
            }
            ResponseCode::ReceivedMessage => Response::ReceivedMessage {
                client_id: take_id(&mut payload)?,
            },
            ResponseCode::ReconnectionFailed => Response::ReconnectionFailed {
                client_id: take_id(&mut payload)?,
            },
            ResponseCode::GeneralFailure => Response::GeneralFailure,
        })
    }
}

// =============================================================================
// Frame reading/writing
// =============================================================================

/// Read exactly `payload_len` bytes from the connection.
pub async fn read_payload<R: AsyncRead + Unpin>(r: &mut R, payload_len: u32) -> Result<Bytes> {
    let mut payload = vec![0u8; payload_len as usize];
    r.read_exact(&mut payload)
        .await
        .map_err(TransferError::from_socket)?;
    Ok(Bytes::from(payload))
}

/// Read one request frame.
///
/// The payload is always consumed, even when the header is rejected, so the
/// next read starts on a frame boundary.
pub async fn read_request<R: AsyncRead + Unpin>(r: &mut R) -> Result<(RequestHeader, Bytes)> {
    let mut raw = [0u8; REQUEST_HEADER_SIZE];
    r.read_exact(&mut raw)
        .await
        .map_err(TransferError::from_socket)?;
    let header = RequestHeader::parse(&raw)?;

    if header.payload_len > MAX_PAYLOAD_SIZE {
        let want = header.payload_len as u64;
        let drained = tokio::io::copy(&mut (&mut *r).take(want), &mut tokio::io::sink())
            .await
            .map_err(TransferError::from_socket)?;
        if drained < want {
            return Err(TransferError::ConnectionClosed);
        }
        return Err(TransferError::protocol(format!(
            "payload size {} exceeds maximum allowed size {}",
            header.payload_len, MAX_PAYLOAD_SIZE
        )));
    }

    let payload = read_payload(r, header.payload_len).await?;
    header.check_version()?;
    Ok((header, payload))
}

/// Read one response frame (client side).
pub async fn read_response<R: AsyncRead + Unpin>(r: &mut R) -> Result<Response> {
    let mut raw = [0u8; RESPONSE_HEADER_SIZE];
    r.read_exact(&mut raw)
        .await
        .map_err(TransferError::from_socket)?;
    let header = decode_response_header(&raw)?;
    if header.payload_len > MAX_PAYLOAD_SIZE {
        return Err(TransferError::protocol("response payload too large"));
    }
    let payload = read_payload(r, header.payload_len).await?;
    Response::decode(header.code, payload)
}

/// Write a pre-encoded frame to the connection.
pub async fn write_frame<W: AsyncWrite + Unpin>(w: &mut W, frame: &Bytes) -> Result<()> {
    w.write_all(frame).await.map_err(TransferError::from_socket)?;
    w.flush().await.map_err(TransferError::from_socket)?;
    Ok(())
}

pub async fn write_response<W: AsyncWrite + Unpin>(w: &mut W, response: &Response) -> Result<()> {
    write_frame(w, &response.encode()).await
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn id() -> ClientId {
        ClientId([7u8; CLIENT_ID_SIZE])
    }

    fn decode_frame(frame: &Bytes) -> Response {
        let header = decode_response_header(frame).unwrap();
        assert_eq!(header.payload_len as usize, frame.len() - RESPONSE_HEADER_SIZE);
        Response::decode(header.code, frame.slice(RESPONSE_HEADER_SIZE..)).unwrap()
    }

    #[test]
    fn test_header_layout_is_little_endian() {
        let header = RequestHeader {
            client_id: id(),
            version: PROTOCOL_VERSION,
            code: RequestCode::SendFile as u16,
            payload_len: 0x0102_0304,
        };
        let raw = header.encode();
        assert_eq!(raw.len(), REQUEST_HEADER_SIZE);
        assert_eq!(raw[16], PROTOCOL_VERSION);
        assert_eq!(&raw[17..19], &828u16.to_le_bytes());
        assert_eq!(&raw[19..23], &[0x04, 0x03, 0x02, 0x01]);
        assert_eq!(decode_header(&raw).unwrap(), header);
    }

    #[test]
    fn test_decode_header_rejects_wrong_version() {
        let header = RequestHeader {
            client_id: id(),
            version: PROTOCOL_VERSION + 1,
            code: 825,
            payload_len: 0,
        };
        let err = decode_header(&header.encode()).unwrap_err();
        assert!(matches!(err, TransferError::Protocol(_)));
    }

    #[test]
    fn test_every_response_survives_the_wire() {
        let responses = vec![
            Response::RegistrationSucceeded { client_id: id() },
            Response::RegistrationFailed,
            Response::PublicKeyAccepted {
                client_id: id(),
                encrypted_key: Bytes::from(vec![9u8; 128]),
            },
            Response::FileReceived {
                client_id: id(),
                content_size: 2048,
                file_name: "report.txt".to_string(),
                checksum: 0xDEADBEEF,
            },
            Response::ReceivedMessage { client_id: id() },
            Response::ReconnectSucceeded {
                client_id: id(),
                encrypted_key: Bytes::from(vec![1u8; 128]),
            },
            Response::ReconnectionFailed { client_id: id() },
            Response::GeneralFailure,
        ];
        for response in responses {
            let frame = response.encode();
            assert_eq!(u16::from_le_bytes([frame[1], frame[2]]), response.code() as u16);
            assert_eq!(decode_frame(&frame), response);
        }
    }

    #[test]
    fn test_file_received_layout() {
        let frame = Response::FileReceived {
            client_id: id(),
            content_size: 32,
            file_name: "a.bin".to_string(),
            checksum: 1,
        }
        .encode();
        assert_eq!(
            frame.len(),
            RESPONSE_HEADER_SIZE + CLIENT_ID_SIZE + 4 + FILE_NAME_SIZE + CHECKSUM_SIZE
        );
        // name is NUL padded
        assert_eq!(frame[RESPONSE_HEADER_SIZE + 20 + 5], 0);
    }

    #[test]
    fn test_file_chunk_decode() {
        let chunk = FileChunk {
            content_size: 48,
            original_size: 40,
            total_chunks: 3,
            chunk_number: 2,
            file_name: "report.txt".to_string(),
            content: Bytes::from_static(b"0123456789abcdef"),
        };
        let decoded = FileChunk::decode(chunk.encode()).unwrap();
        assert_eq!(decoded, chunk);
        assert!(!decoded.is_last());
    }

    #[test]
    fn test_file_chunk_too_short() {
        let err = FileChunk::decode(Bytes::from_static(&[0u8; 12])).unwrap_err();
        assert!(matches!(err, TransferError::Protocol(_)));
    }

    #[test]
    fn test_public_key_takes_rest_of_payload() {
        let req = PublicKeyExchange {
            name: "alice".to_string(),
            public_key: Bytes::from(vec![0x30u8; 162]),
        };
        let decoded = PublicKeyExchange::decode(req.encode()).unwrap();
        assert_eq!(decoded.name, "alice");
        assert_eq!(decoded.public_key.len(), 162);
    }

    #[test]
    fn test_long_name_is_truncated() {
        let long = "x".repeat(NAME_SIZE + 20);
        let encoded = Registration { name: long }.encode();
        assert_eq!(encoded.len(), NAME_SIZE);
        assert_eq!(Registration::decode(encoded).unwrap().name.len(), NAME_SIZE);
    }

    #[test]
    fn test_truncation_keeps_multibyte_chars_whole() {
        // 254 ASCII bytes leave one byte for a two-byte char
        let name = format!("{}é", "a".repeat(NAME_SIZE - 1));
        let encoded = Registration { name }.encode();
        assert_eq!(encoded.len(), NAME_SIZE);
        let decoded = Registration::decode(encoded).unwrap();
        assert_eq!(decoded.name, "a".repeat(NAME_SIZE - 1));

        let file_name = "ü".repeat(200);
        let encoded = ChecksumReport { file_name }.encode();
        let decoded = ChecksumReport::decode(encoded).unwrap();
        assert_eq!(decoded.file_name, "ü".repeat(127));
    }

    #[test]
    fn test_unknown_request_code() {
        let err = Request::decode(1234, Bytes::new()).unwrap_err();
        assert!(matches!(err, TransferError::Protocol(_)));
    }

    #[tokio::test]
    async fn test_read_request_roundtrip() {
        let frame = Request::Register(Registration {
            name: "alice".to_string(),
        })
        .encode(ClientId::NIL);
        let mut reader: &[u8] = &frame;
        let (header, payload) = read_request(&mut reader).await.unwrap();
        assert_eq!(header.code, RequestCode::Register as u16);
        assert_eq!(payload.len(), NAME_SIZE);
        match Request::decode(header.code, payload).unwrap() {
            Request::Register(r) => assert_eq!(r.name, "alice"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_read_request_drains_payload_on_bad_version() {
        let mut stream = Vec::new();
        let bad = RequestHeader {
            client_id: id(),
            version: 1,
            code: RequestCode::Reconnect as u16,
            payload_len: 4,
        };
        stream.extend_from_slice(&bad.encode());
        stream.extend_from_slice(b"junk");
        stream.extend_from_slice(
            &Request::Reconnect(Reconnection {
                name: "bob".to_string(),
            })
            .encode(id()),
        );

        let mut reader: &[u8] = &stream;
        assert!(matches!(
            read_request(&mut reader).await,
            Err(TransferError::Protocol(_))
        ));
        let (header, _) = read_request(&mut reader).await.unwrap();
        assert_eq!(header.code, RequestCode::Reconnect as u16);
    }

    #[tokio::test]
    async fn test_read_request_peer_closed_mid_payload() {
        let frame = Request::Register(Registration {
            name: "alice".to_string(),
        })
        .encode(ClientId::NIL);
        let mut reader: &[u8] = &frame[..REQUEST_HEADER_SIZE + 10];
        assert!(matches!(
            read_request(&mut reader).await,
            Err(TransferError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn test_read_request_clean_eof() {
        let mut reader: &[u8] = &[];
        assert!(matches!(
            read_request(&mut reader).await,
            Err(TransferError::ConnectionClosed)
        ));
    }

    proptest! {
        #[test]
        fn prop_short_header_is_rejected(bytes in proptest::collection::vec(any::<u8>(), 0..REQUEST_HEADER_SIZE)) {
            prop_assert!(matches!(decode_header(&bytes), Err(TransferError::Protocol(_))));
        }

        #[test]
        fn prop_fixed_names_trim_padding(name in "[a-zA-Z0-9_.]{1,255}") {
            let decoded = ChecksumReport::decode(ChecksumReport { file_name: name.clone() }.encode()).unwrap();
            prop_assert_eq!(decoded.file_name, name);
        }
    }
}
