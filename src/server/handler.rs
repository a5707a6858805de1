//! One connection: read a request, run it, answer, repeat.
//!
//! Domain failures map to their own response codes. Any other failure
//! rolls back a half-finished upload and answers `GeneralFailure`. Transport
//! failures end the connection without a response.

use super::session::{Phase, Session};
use super::Resources;
use crate::error::{Result, TransferError};
use crate::protocol::{self, ClientId, Request, RequestHeader, Response};
use crate::store::Persistence;
use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite};

/// What to do after a request has been answered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Close,
}

pub struct ConnectionHandler<S, P> {
    stream: S,
    session: Session,
    resources: Resources<P>,
}

impl<S, P> ConnectionHandler<S, P>
where
    S: AsyncRead + AsyncWrite + Unpin,
    P: Persistence,
{
    pub fn new(stream: S, resources: Resources<P>) -> Self {
        Self {
            stream,
            session: Session::new(),
            resources,
        }
    }

    /// Serve requests until the peer disconnects or the session ends.
    pub async fn run(mut self) -> Result<()> {
        loop {
            let (header, payload) = match protocol::read_request(&mut self.stream).await {
                Ok(frame) => frame,
                Err(e) if e.is_transport() => {
                    if !matches!(e, TransferError::ConnectionClosed) {
                        tracing::warn!("Connection error: {}", e);
                    }
                    break;
                }
                Err(e) => {
                    let response = self.failure_response(ClientId::NIL, &e).await;
                    if let Err(e) = self.send(&response).await {
                        tracing::warn!("Connection lost while answering: {}", e);
                        break;
                    }
                    continue;
                }
            };

            match self.handle(header, payload).await {
                Ok(Flow::Continue) if !self.session.phase.is_terminal() => {}
                Ok(_) => break,
                Err(e) if e.is_transport() => {
                    tracing::warn!("Connection lost while answering: {}", e);
                    break;
                }
                Err(e) => return Err(e),
            }
        }

        self.release().await;
        tracing::debug!("Session ended in {:?}", self.session.phase);
        Ok(())
    }

    /// Run one request and write its response(s).
    ///
    /// Only transport errors escape; everything else becomes a response.
    async fn handle(&mut self, header: RequestHeader, payload: Bytes) -> Result<Flow> {
        let outcome = match Request::decode(header.code, payload) {
            Ok(request) => {
                tracing::debug!("Request {:?} from {}", request.code(), header.client_id);
                match self.session.check(header.client_id, request.code()) {
                    Ok(()) => self.dispatch(header.client_id, request).await,
                    Err(e) => Err(e),
                }
            }
            Err(e) => Err(e),
        };

        match outcome {
            Ok(flow) => Ok(flow),
            Err(e) if e.is_transport() => Err(e),
            Err(e) => {
                let response = self.failure_response(header.client_id, &e).await;
                self.send(&response).await?;
                Ok(Flow::Continue)
            }
        }
    }

    async fn dispatch(&mut self, header_id: ClientId, request: Request) -> Result<Flow> {
        match request {
            Request::Register(reg) => {
                let client_id = self.resources.register(&reg.name).await?;
                self.session.registered(client_id, &reg.name);
                self.send(&Response::RegistrationSucceeded { client_id }).await?;
            }
            Request::PublicKey(exchange) => {
                let wrapped = self
                    .resources
                    .exchange_public_key(header_id, &exchange.name, &exchange.public_key)
                    .await?;
                let encrypted_key = Bytes::from(wrapped.encrypted_key);
                self.session.keyed(header_id, &exchange.name, wrapped.symmetric_key);
                self.send(&Response::PublicKeyAccepted {
                    client_id: header_id,
                    encrypted_key,
                })
                .await?;
            }
            Request::Reconnect(reconnect) => {
                let wrapped = self
                    .resources
                    .reconnect(header_id, &reconnect.name)
                    .await?;
                let encrypted_key = Bytes::from(wrapped.encrypted_key);
                self.session.keyed(header_id, &reconnect.name, wrapped.symmetric_key);
                self.send(&Response::ReconnectSucceeded {
                    client_id: header_id,
                    encrypted_key,
                })
                .await?;
            }
            Request::SendFile(chunk) => {
                self.resources.receive_chunk(&mut self.session, &chunk).await?;
                self.send(&Response::ReceivedMessage {
                    client_id: header_id,
                })
                .await?;
                if chunk.is_last() {
                    let received = self.resources.finish_upload(&mut self.session).await?;
                    self.send(&received).await?;
                }
            }
            Request::ChecksumValid(report) => {
                self.resources
                    .confirm_checksum(&mut self.session, &report.file_name)
                    .await?;
                self.send(&Response::ReceivedMessage {
                    client_id: header_id,
                })
                .await?;
                return Ok(Flow::Close);
            }
            Request::ChecksumInvalidRetry(report) => {
                // the client follows up with a fresh upload, no answer
                self.resources
                    .discard_file(&mut self.session, &report.file_name, false)
                    .await?;
            }
            Request::ChecksumInvalidAbort(report) => {
                self.resources
                    .discard_file(&mut self.session, &report.file_name, true)
                    .await?;
                self.send(&Response::ReceivedMessage {
                    client_id: header_id,
                })
                .await?;
                return Ok(Flow::Close);
            }
        }
        Ok(Flow::Continue)
    }

    /// Pick the response for a failed request, rolling back an upload if needed.
    async fn failure_response(&mut self, header_id: ClientId, e: &TransferError) -> Response {
        if !e.is_domain() {
            tracing::error!("Request failed: {}", e);
            if matches!(self.session.phase, Phase::Uploading { .. }) {
                self.resources.abandon_upload(&mut self.session).await;
            }
            return Response::GeneralFailure;
        }

        tracing::warn!("{}", e);
        match e {
            TransferError::DuplicateClient(_) => Response::RegistrationFailed,
            TransferError::UnregisteredClient(_) => Response::ReconnectionFailed {
                client_id: header_id,
            },
            _ => Response::GeneralFailure,
        }
    }

    /// Drop anything a vanished client left half done.
    async fn release(&mut self) {
        if matches!(self.session.phase, Phase::Uploading { .. }) {
            self.resources.abandon_upload(&mut self.session).await;
        }
    }

    async fn send(&mut self, response: &Response) -> Result<()> {
        tracing::debug!("Response {:?}", response.code());
        protocol::write_response(&mut self.stream, response).await
    }
}
