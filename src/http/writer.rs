use futures::StreamExt;
use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::http::response::{Body, BodyStream, Response};

const HTTP_VERSION: &str = "HTTP/1.1";

/// How the body follows the head on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Framing {
    /// No body bytes at all (HEAD, 1xx, 204, 304).
    Omitted,
    /// Content-Length is known; bytes are written as-is.
    Sized,
    /// Length unknown; chunked transfer coding.
    Chunked,
}

fn serialize_head(resp: &Response, framing: Framing, keep_alive: bool) -> Vec<u8> {
    let mut buf = Vec::new();

    // Status line
    let status_line = format!(
        "{} {} {}\r\n",
        HTTP_VERSION,
        resp.status.as_u16(),
        resp.status.reason_phrase()
    );
    buf.extend_from_slice(status_line.as_bytes());

    // Headers
    for (k, v) in resp.headers.iter() {
        if k.eq_ignore_ascii_case("Connection") || k.eq_ignore_ascii_case("Transfer-Encoding") {
            continue;
        }
        buf.extend_from_slice(k.as_bytes());
        buf.extend_from_slice(b": ");
        buf.extend_from_slice(v.as_bytes());
        buf.extend_from_slice(b"\r\n");
    }

    if framing == Framing::Chunked {
        buf.extend_from_slice(b"Transfer-Encoding: chunked\r\n");
    }
    let connection = if keep_alive { "keep-alive" } else { "close" };
    buf.extend_from_slice(format!("Connection: {connection}\r\n").as_bytes());

    // Header/body separator
    buf.extend_from_slice(b"\r\n");

    buf
}

/// Serializes a response and writes it to a client stream.
///
/// The head is rendered up front; the body is written afterwards, chunk by
/// chunk for streamed bodies, so a slow client slows the upstream read.
pub struct ResponseWriter {
    head: Vec<u8>,
    body: Option<Body>,
    framing: Framing,
}

impl ResponseWriter {
    /// Prepares `response` for writing.
    ///
    /// `omit_body` is set for responses to HEAD requests.
    pub fn new(response: Response, keep_alive: bool, omit_body: bool) -> Self {
        let framing = if omit_body || response.status.forbids_body() {
            Framing::Omitted
        } else {
            match &response.body {
                Body::Stream(_) if !response.headers.contains_key("Content-Length") => {
                    Framing::Chunked
                }
                _ => Framing::Sized,
            }
        };

        Self {
            head: serialize_head(&response, framing, keep_alive),
            body: Some(response.body),
            framing,
        }
    }

    pub async fn write_to_stream<W>(&mut self, stream: &mut W) -> anyhow::Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        stream.write_all(&self.head).await?;

        match (self.framing, self.body.take()) {
            (Framing::Omitted, _) | (_, None) => {}
            (_, Some(Body::Full(bytes))) => {
                stream.write_all(&bytes).await?;
            }
            (Framing::Sized, Some(Body::Stream(body))) => {
                write_sized(stream, body).await?;
            }
            (Framing::Chunked, Some(Body::Stream(body))) => {
                write_chunked(stream, body).await?;
            }
        }

        stream.flush().await?;
        Ok(())
    }
}

async fn write_sized<W>(stream: &mut W, mut body: BodyStream) -> anyhow::Result<()>
where
    W: AsyncWrite + Unpin,
{
    while let Some(chunk) = body.next().await {
        stream.write_all(&chunk?).await?;
    }
    Ok(())
}

async fn write_chunked<W>(stream: &mut W, mut body: BodyStream) -> anyhow::Result<()>
where
    W: AsyncWrite + Unpin,
{
    while let Some(chunk) = body.next().await {
        let chunk = chunk?;
        // A zero-size chunk would terminate the body early
        if chunk.is_empty() {
            continue;
        }
        stream.write_all(format!("{:x}\r\n", chunk.len()).as_bytes()).await?;
        stream.write_all(&chunk).await?;
        stream.write_all(b"\r\n").await?;
    }
    stream.write_all(b"0\r\n\r\n").await?;
    Ok(())
}
