//! HTTP/1.x framing for one request and its response over a work stream
//!
//! Each request on an inbound connection gets its own work stream, so the
//! relay has to know where a request body ends and where the response ends
//! before it can route the next request.

use std::io;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::Instant;
use tracing::debug;

const MAX_HEADERS: usize = 64;
const MAX_RESPONSE_HEAD: usize = 64 * 1024;
const MAX_CHUNK_LINE: usize = 8 * 1024;
const READ_CHUNK: usize = 16 * 1024;

/// Hop-by-hop headers replaced on every forwarded head
const HOP_BY_HOP: &[&str] = &["connection", "keep-alive", "proxy-connection"];

#[derive(Debug, Error)]
pub(crate) enum HeadError {
    #[error("connection closed before a request")]
    Closed,

    #[error("timed out reading the request head")]
    TimedOut,

    #[error("request head exceeds {0} bytes")]
    TooLarge(usize),

    #[error("malformed request: {0}")]
    Malformed(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// How the end of a message body is found
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BodyLength {
    Empty,
    Fixed(u64),
    Chunked,
    /// Runs until the sender closes; responses only
    UntilClose,
}

type Headers = Vec<(String, Vec<u8>)>;

#[derive(Debug)]
pub(crate) struct RequestHead {
    pub method: String,
    pub path: String,
    pub host: Option<String>,
    pub authorization: Option<String>,
    /// The client may send another request after this one
    pub keep_alive: bool,
    /// Protocol switch (e.g. WebSocket); the connection is spliced afterwards
    pub upgrade: bool,
    pub body: BodyLength,
    /// The head exactly as received
    pub raw: Vec<u8>,
    minor_version: u8,
    headers: Headers,
}

impl RequestHead {
    /// Head sent to the agent; the service closes after one response
    pub fn forwarded(&self) -> Vec<u8> {
        let mut out = format!(
            "{} {} HTTP/1.{}\r\n",
            self.method, self.path, self.minor_version
        )
        .into_bytes();
        write_headers(&mut out, &self.headers);
        out.extend_from_slice(b"Connection: close\r\n\r\n");
        out
    }
}

#[derive(Debug)]
pub(crate) struct ResponseHead {
    pub status: u16,
    pub body: BodyLength,
    pub raw: Vec<u8>,
    minor_version: u8,
    reason: String,
    headers: Headers,
}

impl ResponseHead {
    /// `100 Continue` and friends; a final response follows
    fn is_interim(&self) -> bool {
        (100..200).contains(&self.status) && self.status != 101
    }

    fn forwarded(&self, keep_alive: bool) -> Vec<u8> {
        let mut out = format!(
            "HTTP/1.{} {} {}\r\n",
            self.minor_version, self.status, self.reason
        )
        .into_bytes();
        write_headers(&mut out, &self.headers);
        if !keep_alive {
            out.extend_from_slice(b"Connection: close\r\n");
        }
        out.extend_from_slice(b"\r\n");
        out
    }
}

/// How an exchange left the inbound connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ResponseEnd {
    KeepAlive,
    Close,
}

#[derive(Debug, Error)]
pub(crate) enum ExchangeError {
    /// Nothing reached the client yet; it can still get an error response
    #[error("no response from the service: {0}")]
    NoResponse(String),

    #[error("exchange aborted: {0}")]
    Aborted(String),
}

#[derive(Debug, Error)]
pub(crate) enum BodyError {
    #[error("reading body: {0}")]
    Source(io::Error),

    #[error("forwarding body: {0}")]
    Sink(io::Error),
}

/// Read the next request head, leaving any bytes after it in `buf`
pub(crate) async fn read_request_head<R>(
    reader: &mut R,
    buf: &mut Vec<u8>,
    max_bytes: usize,
    timeout: Duration,
) -> Result<RequestHead, HeadError>
where
    R: AsyncRead + Unpin,
{
    let deadline = Instant::now() + timeout;

    loop {
        if !buf.is_empty() {
            if let Some(head) = parse_request(buf)? {
                if head.raw.len() > max_bytes {
                    return Err(HeadError::TooLarge(max_bytes));
                }
                buf.drain(..head.raw.len());
                return Ok(head);
            }
            if buf.len() >= max_bytes {
                return Err(HeadError::TooLarge(max_bytes));
            }
        }

        buf.reserve(READ_CHUNK);
        let n = tokio::time::timeout_at(deadline, reader.read_buf(buf))
            .await
            .map_err(|_| HeadError::TimedOut)??;
        if n == 0 {
            return Err(if buf.is_empty() {
                HeadError::Closed
            } else {
                HeadError::Malformed("connection closed inside the request head".to_string())
            });
        }
    }
}

fn parse_request(buf: &[u8]) -> Result<Option<RequestHead>, HeadError> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut req = httparse::Request::new(&mut headers);

    let len = match req.parse(buf) {
        Ok(httparse::Status::Complete(len)) => len,
        Ok(httparse::Status::Partial) => return Ok(None),
        Err(e) => return Err(HeadError::Malformed(e.to_string())),
    };

    let headers = collect_headers(req.headers);
    let minor_version = req.version.unwrap_or(1);
    let connection = header_tokens(&headers, "connection");
    let body = match transfer_chunked(&headers) {
        Some(true) => BodyLength::Chunked,
        Some(false) => {
            return Err(HeadError::Malformed(
                "unsupported transfer-encoding".to_string(),
            ))
        }
        None => match content_length(&headers).map_err(HeadError::Malformed)? {
            None | Some(0) => BodyLength::Empty,
            Some(n) => BodyLength::Fixed(n),
        },
    };

    Ok(Some(RequestHead {
        method: req.method.unwrap_or("GET").to_string(),
        path: req.path.unwrap_or("/").to_string(),
        host: header_str(&headers, "host").filter(|h| !h.is_empty()),
        authorization: header_str(&headers, "authorization"),
        keep_alive: minor_version >= 1 && !connection.iter().any(|t| t == "close"),
        upgrade: connection.iter().any(|t| t == "upgrade")
            && header_str(&headers, "upgrade").is_some(),
        body,
        raw: buf[..len].to_vec(),
        minor_version,
        headers,
    }))
}

fn parse_response(buf: &[u8], head_request: bool) -> Result<Option<ResponseHead>, String> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut resp = httparse::Response::new(&mut headers);

    let len = match resp.parse(buf) {
        Ok(httparse::Status::Complete(len)) => len,
        Ok(httparse::Status::Partial) => return Ok(None),
        Err(e) => return Err(format!("malformed response: {}", e)),
    };

    let status = resp.code.unwrap_or(502);
    let headers = collect_headers(resp.headers);
    let informational = (100..200).contains(&status) && status != 101;
    let body = if head_request || informational || status == 204 || status == 304 {
        BodyLength::Empty
    } else {
        match transfer_chunked(&headers) {
            Some(true) => BodyLength::Chunked,
            Some(false) => BodyLength::UntilClose,
            None => match content_length(&headers)? {
                Some(0) => BodyLength::Empty,
                Some(n) => BodyLength::Fixed(n),
                None => BodyLength::UntilClose,
            },
        }
    };

    Ok(Some(ResponseHead {
        status,
        body,
        raw: buf[..len].to_vec(),
        minor_version: resp.version.unwrap_or(1),
        reason: resp.reason.unwrap_or("").to_string(),
        headers,
    }))
}

fn collect_headers(headers: &[httparse::Header<'_>]) -> Headers {
    headers
        .iter()
        .map(|h| (h.name.to_string(), h.value.to_vec()))
        .collect()
}

fn header_str(headers: &Headers, name: &str) -> Option<String> {
    headers
        .iter()
        .find(|(n, _)| n.eq_ignore_ascii_case(name))
        .and_then(|(_, v)| std::str::from_utf8(v).ok())
        .map(|v| v.trim().to_string())
}

/// Lowercased comma-separated tokens of every `name` header
fn header_tokens(headers: &Headers, name: &str) -> Vec<String> {
    headers
        .iter()
        .filter(|(n, _)| n.eq_ignore_ascii_case(name))
        .filter_map(|(_, v)| std::str::from_utf8(v).ok())
        .flat_map(|v| v.split(','))
        .map(|t| t.trim().to_ascii_lowercase())
        .filter(|t| !t.is_empty())
        .collect()
}

/// `Some(true)` when the final transfer coding is chunked
fn transfer_chunked(headers: &Headers) -> Option<bool> {
    let codings = header_tokens(headers, "transfer-encoding");
    codings.last().map(|last| last == "chunked")
}

fn content_length(headers: &Headers) -> Result<Option<u64>, String> {
    let mut length = None;
    for (_, value) in headers
        .iter()
        .filter(|(n, _)| n.eq_ignore_ascii_case("content-length"))
    {
        let parsed = std::str::from_utf8(value)
            .ok()
            .and_then(|v| v.trim().parse::<u64>().ok())
            .ok_or_else(|| "invalid content-length".to_string())?;
        if length.is_some_and(|l| l != parsed) {
            return Err("conflicting content-length".to_string());
        }
        length = Some(parsed);
    }
    Ok(length)
}

fn write_headers(out: &mut Vec<u8>, headers: &Headers) {
    let forwarded = headers
        .iter()
        .filter(|(n, _)| !HOP_BY_HOP.iter().any(|h| n.eq_ignore_ascii_case(h)));
    for (name, value) in forwarded {
        out.extend_from_slice(name.as_bytes());
        out.extend_from_slice(b": ");
        out.extend_from_slice(value);
        out.extend_from_slice(b"\r\n");
    }
}

/// Append more bytes from `reader`; EOF here means a truncated message
async fn fill<R>(reader: &mut R, buf: &mut Vec<u8>) -> io::Result<()>
where
    R: AsyncRead + Unpin,
{
    buf.reserve(READ_CHUNK);
    if reader.read_buf(buf).await? == 0 {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "connection closed inside a message body",
        ));
    }
    Ok(())
}

/// Forward one message body, starting with the bytes already in `buf`
///
/// Bytes past the end of the body stay in `buf`.
pub(crate) async fn forward_body<R, W>(
    reader: &mut R,
    buf: &mut Vec<u8>,
    writer: &mut W,
    body: BodyLength,
) -> Result<(), BodyError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    match body {
        BodyLength::Empty => Ok(()),
        BodyLength::Fixed(len) => forward_exact(reader, buf, writer, len).await,
        BodyLength::Chunked => forward_chunked(reader, buf, writer).await,
        BodyLength::UntilClose => loop {
            if !buf.is_empty() {
                writer.write_all(buf).await.map_err(BodyError::Sink)?;
                buf.clear();
            }
            buf.reserve(READ_CHUNK);
            if reader.read_buf(buf).await.map_err(BodyError::Source)? == 0 {
                return Ok(());
            }
        },
    }
}

async fn forward_exact<R, W>(
    reader: &mut R,
    buf: &mut Vec<u8>,
    writer: &mut W,
    len: u64,
) -> Result<(), BodyError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut remaining = len;
    while remaining > 0 {
        if buf.is_empty() {
            fill(reader, buf).await.map_err(BodyError::Source)?;
        }
        let take = (buf.len() as u64).min(remaining) as usize;
        writer
            .write_all(&buf[..take])
            .await
            .map_err(BodyError::Sink)?;
        buf.drain(..take);
        remaining -= take as u64;
    }
    Ok(())
}

async fn forward_chunked<R, W>(
    reader: &mut R,
    buf: &mut Vec<u8>,
    writer: &mut W,
) -> Result<(), BodyError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    loop {
        let (line_len, size) = loop {
            match httparse::parse_chunk_size(buf) {
                Ok(httparse::Status::Complete(parsed)) => break parsed,
                Ok(httparse::Status::Partial) if buf.len() < MAX_CHUNK_LINE => {
                    fill(reader, buf).await.map_err(BodyError::Source)?
                }
                _ => return Err(BodyError::Source(invalid_data("malformed chunk size"))),
            }
        };
        writer
            .write_all(&buf[..line_len])
            .await
            .map_err(BodyError::Sink)?;
        buf.drain(..line_len);

        if size == 0 {
            return forward_trailers(reader, buf, writer).await;
        }
        // Chunk data and its CRLF
        forward_exact(reader, buf, writer, size.saturating_add(2)).await?;
    }
}

/// Trailer lines after the last chunk, up to the empty line
async fn forward_trailers<R, W>(
    reader: &mut R,
    buf: &mut Vec<u8>,
    writer: &mut W,
) -> Result<(), BodyError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    loop {
        let line_end = loop {
            if let Some(pos) = buf.windows(2).position(|w| w == b"\r\n") {
                break pos + 2;
            }
            if buf.len() >= MAX_CHUNK_LINE {
                return Err(BodyError::Source(invalid_data("trailer line too long")));
            }
            fill(reader, buf).await.map_err(BodyError::Source)?;
        };
        writer
            .write_all(&buf[..line_end])
            .await
            .map_err(BodyError::Sink)?;
        buf.drain(..line_end);
        if line_end == 2 {
            return Ok(());
        }
    }
}

fn invalid_data(msg: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg.to_string())
}

/// Read the service's response from `stream` and pass it to `client`
async fn relay_response<R, W>(
    stream: &mut R,
    client: &mut W,
    head_request: bool,
    keep_alive: bool,
) -> Result<ResponseEnd, ExchangeError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = Vec::new();
    let mut started = false;
    let fail = |started: bool, reason: String| {
        if started {
            ExchangeError::Aborted(reason)
        } else {
            ExchangeError::NoResponse(reason)
        }
    };

    loop {
        let head = loop {
            if let Some(head) =
                parse_response(&buf, head_request).map_err(|e| fail(started, e))?
            {
                break head;
            }
            if buf.len() >= MAX_RESPONSE_HEAD {
                return Err(fail(started, "response head too large".to_string()));
            }
            buf.reserve(READ_CHUNK);
            match stream.read_buf(&mut buf).await {
                Ok(0) => {
                    return Err(fail(
                        started,
                        "service closed before responding".to_string(),
                    ))
                }
                Ok(_) => {}
                Err(e) => return Err(fail(started, e.to_string())),
            }
        };
        buf.drain(..head.raw.len());

        if head.is_interim() {
            client
                .write_all(&head.raw)
                .await
                .map_err(|e| ExchangeError::Aborted(e.to_string()))?;
            started = true;
            continue;
        }

        let keep_alive = keep_alive && head.body != BodyLength::UntilClose;
        client
            .write_all(&head.forwarded(keep_alive))
            .await
            .map_err(|e| ExchangeError::Aborted(e.to_string()))?;
        forward_body(stream, &mut buf, client, head.body)
            .await
            .map_err(|e| ExchangeError::Aborted(e.to_string()))?;
        client
            .flush()
            .await
            .map_err(|e| ExchangeError::Aborted(e.to_string()))?;

        return Ok(if keep_alive {
            ResponseEnd::KeepAlive
        } else {
            ResponseEnd::Close
        });
    }
}

/// Carry one request over `stream` and its response back to `client`
///
/// The request body is uploaded while the response is read, so a service
/// answering early (`100 Continue`, `413`) is relayed without waiting.
pub(crate) async fn exchange<C, S>(
    client: &mut C,
    buf: &mut Vec<u8>,
    stream: S,
    head: &RequestHead,
) -> Result<ResponseEnd, ExchangeError>
where
    C: AsyncRead + AsyncWrite + Unpin,
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (mut client_read, mut client_write) = tokio::io::split(client);
    let (mut stream_read, mut stream_write) = tokio::io::split(stream);

    stream_write
        .write_all(&head.forwarded())
        .await
        .map_err(|e| ExchangeError::NoResponse(e.to_string()))?;

    let upload = forward_body(&mut client_read, buf, &mut stream_write, head.body);
    let response = relay_response(
        &mut stream_read,
        &mut client_write,
        head.method.eq_ignore_ascii_case("HEAD"),
        head.keep_alive,
    );
    tokio::pin!(upload, response);

    let mut uploading = head.body != BodyLength::Empty;
    let mut uploaded = !uploading;
    loop {
        tokio::select! {
            result = &mut upload, if uploading => {
                uploading = false;
                match result {
                    Ok(()) => uploaded = true,
                    Err(BodyError::Source(e)) => {
                        return Err(ExchangeError::Aborted(format!("client: {}", e)))
                    }
                    // The service may still answer, e.g. with an early error
                    Err(e @ BodyError::Sink(_)) => debug!("Request body not delivered: {}", e),
                }
            }
            end = &mut response => {
                let end = end?;
                // A half-sent body leaves the connection out of sync
                return Ok(if uploaded { end } else { ResponseEnd::Close });
            }
        }
    }
}
