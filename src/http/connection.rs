use std::io;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::http::parser::{MAX_HEAD_SIZE, ParseError, parse_request_head};
use crate::http::request::{Method, Request};
use crate::http::response::Response;
use crate::http::writer::ResponseWriter;
use crate::relay::Relay;

/// Read size for request bodies.
const BUFFER_SIZE: usize = 8192;

/// Request body chunks in flight between the socket and the upstream client.
const BODY_CHANNEL_DEPTH: usize = 4;

pub struct Connection {
    stream: TcpStream,
    buffer: BytesMut,
    relay: Arc<Relay>,
    state: ConnectionState,
}

pub enum ConnectionState {
    Reading,
    Processing(Request),
    Writing(ResponseWriter, bool), // bool = keep_alive?
    Closed,
}

/// What came off the socket in the Reading state.
enum Incoming {
    Request(Request),
    Malformed(ParseError),
    Eof,
}

impl Connection {
    pub fn new(stream: TcpStream, relay: Arc<Relay>) -> Self {
        Self {
            stream,
            buffer: BytesMut::with_capacity(4096),
            relay,
            state: ConnectionState::Reading,
        }
    }

    pub async fn run(&mut self) -> anyhow::Result<()> {
        loop {
            let state = std::mem::replace(&mut self.state, ConnectionState::Closed);

            self.state = match state {
                ConnectionState::Reading => match self.read_request().await? {
                    Incoming::Request(req) => ConnectionState::Processing(req),
                    Incoming::Malformed(e) => {
                        tracing::debug!(error = ?e, "Malformed request");
                        let response = match e {
                            ParseError::UnsupportedTransferEncoding => Response::length_required(),
                            _ => Response::bad_request("400 Bad Request\n"),
                        };
                        ConnectionState::Writing(ResponseWriter::new(response, false, false), false)
                    }
                    Incoming::Eof => ConnectionState::Closed,
                },

                ConnectionState::Processing(req) => match self.dispatch(&req).await? {
                    Some((response, reusable)) => {
                        let keep_alive = reusable && req.keep_alive();
                        let head_only = req.method == Method::HEAD;
                        let writer = ResponseWriter::new(response, keep_alive, head_only);
                        ConnectionState::Writing(writer, keep_alive)
                    }
                    // Client went away before the response was ready
                    None => ConnectionState::Closed,
                },

                ConnectionState::Writing(mut writer, keep_alive) => {
                    writer.write_to_stream(&mut self.stream).await?;

                    if keep_alive {
                        ConnectionState::Reading // go back for next request
                    } else {
                        ConnectionState::Closed
                    }
                }

                ConnectionState::Closed => break,
            };
        }

        Ok(())
    }

    async fn read_request(&mut self) -> anyhow::Result<Incoming> {
        loop {
            // Try parsing whatever we already have
            match parse_request_head(&self.buffer) {
                Ok((request, consumed)) => {
                    // Remove consumed bytes
                    let _ = self.buffer.split_to(consumed);
                    return Ok(Incoming::Request(request));
                }

                Err(ParseError::Incomplete) => {
                    // Need more data → fall through to read
                }

                Err(e) => return Ok(Incoming::Malformed(e)),
            }

            let n = self.stream.read_buf(&mut self.buffer).await?;

            if n == 0 {
                // Client closed connection
                return Ok(Incoming::Eof);
            }
        }
    }

    /// Produces the response for `req`, consuming its body from the socket.
    ///
    /// Returns `None` if the client disconnected while waiting. The flag
    /// says whether the body was fully read, which is required before the
    /// connection can carry another request.
    async fn dispatch(&mut self, req: &Request) -> anyhow::Result<Option<(Response, bool)>> {
        let length = req.content_length();
        let Self {
            stream,
            buffer,
            relay,
            ..
        } = self;

        if !Relay::accepts(req.path()) {
            let drained = discard_body(stream, buffer, length).await?;
            return Ok(Some((Response::not_found(), drained)));
        }

        if length == 0 {
            let response = unless_client_gone(relay.handle(req, None), stream, buffer).await;
            return Ok(response.map(|response| (response, true)));
        }

        let (tx, rx) = mpsc::channel(BODY_CHANNEL_DEPTH);
        let body = reqwest::Body::wrap_stream(ReceiverStream::new(rx));
        let handle = relay.handle(req, Some(body));
        tokio::pin!(handle);

        let pumped = tokio::select! {
            pumped = pump_body(stream, buffer, length, tx) => pumped?,
            // Upstream answered before taking the whole body
            response = &mut handle => return Ok(Some((response, false))),
        };

        let response = unless_client_gone(handle, stream, buffer).await;
        Ok(response.map(|response| (response, pumped)))
    }
}

/// Awaits `response` unless the client disconnects first.
///
/// Returning `None` drops the pending future, which aborts the upstream
/// exchange.
async fn unless_client_gone(
    response: impl Future<Output = Response>,
    stream: &mut TcpStream,
    buffer: &mut BytesMut,
) -> Option<Response> {
    tokio::select! {
        response = response => Some(response),
        _ = client_gone(stream, buffer) => {
            tracing::debug!("Client disconnected, dropping upstream request");
            None
        }
    }
}

/// Streams `length` body bytes from the client into `tx`.
///
/// Sending waits for the upstream side to take each chunk. Returns whether
/// the full body was read off the socket; it is not when the receiver was
/// dropped early.
async fn pump_body(
    stream: &mut TcpStream,
    buffer: &mut BytesMut,
    length: usize,
    tx: mpsc::Sender<io::Result<Bytes>>,
) -> io::Result<bool> {
    let mut remaining = length;

    if !buffer.is_empty() {
        let chunk = buffer.split_to(buffer.len().min(remaining)).freeze();
        remaining -= chunk.len();
        if tx.send(Ok(chunk)).await.is_err() {
            return Ok(remaining == 0);
        }
    }

    while remaining > 0 {
        let mut chunk = vec![0u8; remaining.min(BUFFER_SIZE)];
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            let _ = tx
                .send(Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "client closed connection mid-body",
                )))
                .await;
            return Err(io::ErrorKind::UnexpectedEof.into());
        }

        chunk.truncate(n);
        remaining -= n;
        if tx.send(Ok(Bytes::from(chunk))).await.is_err() {
            return Ok(remaining == 0);
        }
    }

    Ok(true)
}

/// Reads and drops `length` body bytes.
async fn discard_body(
    stream: &mut TcpStream,
    buffer: &mut BytesMut,
    length: usize,
) -> io::Result<bool> {
    let from_buffer = buffer.len().min(length);
    let _ = buffer.split_to(from_buffer);

    let mut remaining = length - from_buffer;
    let mut scratch = [0u8; BUFFER_SIZE];
    while remaining > 0 {
        let n = stream.read(&mut scratch[..remaining.min(BUFFER_SIZE)]).await?;
        if n == 0 {
            return Ok(false);
        }
        remaining -= n;
    }

    Ok(true)
}

/// Resolves once the client closes or resets the connection.
///
/// Bytes that arrive meanwhile (a pipelined request) are kept in `buffer`.
async fn client_gone(stream: &mut TcpStream, buffer: &mut BytesMut) {
    loop {
        if buffer.len() > MAX_HEAD_SIZE {
            return std::future::pending().await;
        }
        match stream.read_buf(buffer).await {
            Ok(0) | Err(_) => return,
            Ok(_) => {}
        }
    }
}
