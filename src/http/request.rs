use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use percent_encoding::percent_decode_str;
use url::Url;

use crate::config::Timeouts;
use crate::error::{Error, Result};
use crate::http::message::{Headers, HttpVersion, RecvMode, RecvUnit};
use crate::http::parser::{self, BodyLength};
use crate::http::response::ServerResponse;
use crate::sync::{Pipe, SyncEvent};

/// Where an incoming request is in its receive cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RecvState {
    RequestLine,
    Headers,
    ChunkSize,
    Data,
    ChunkEnd,
    Trailer,
    Done,
}

/// What a response needs to know about the request it answers.
#[derive(Debug, Clone)]
pub struct RequestInfo {
    pub method: Option<String>,
    pub version: HttpVersion,
    pub keep_alive: bool,
    pub expect_continue: bool,
    /// The request line, for log messages.
    pub start_line: String,
    pub aborted: Arc<SyncEvent>,
    /// Set once the reader is done with the request, whether or not it
    /// arrived in full.
    pub received: Arc<SyncEvent>,
}

/// An incoming request, fed by the connection's reader thread.
///
/// The connection asks [`recv_mode`](Self::recv_mode) what is needed next,
/// reads that from the socket and passes it to [`recv`](Self::recv). Body
/// data (after transfer codings are removed) goes into
/// [`recv_pipe`](Self::recv_pipe), where the application reads it.
#[derive(Debug)]
pub struct ServerRequest {
    state: RecvState,
    method: Option<String>,
    target: String,
    version: HttpVersion,
    headers: Headers,
    start_line: String,
    keep_alive: bool,
    expect_continue: bool,
    chunked: bool,
    remaining: u64,
    /// Body data the pipe refused while full.
    pending: Option<Bytes>,
    recv_pipe: Arc<Pipe>,
    aborted: Arc<SyncEvent>,
    received: Arc<SyncEvent>,
    response: Option<Arc<ServerResponse>>,
}

impl ServerRequest {
    pub fn new(conn_id: u64, timeouts: &Timeouts) -> Self {
        // never blocks the socket reader; the application waits on it
        // longer than the reader waits on the client, so a stalled client
        // always fails the reader first
        let recv_pipe = Pipe::builder()
            .name(format!("ServerRequest[{}].recv_pipe", conn_id))
            .write_blocking(false)
            .timeout(timeouts.connection + timeouts.app)
            .build();
        Self {
            state: RecvState::RequestLine,
            method: None,
            target: String::new(),
            version: HttpVersion::HTTP_1_1,
            headers: Headers::new(),
            start_line: String::new(),
            keep_alive: true,
            expect_continue: false,
            chunked: false,
            remaining: 0,
            pending: None,
            recv_pipe: Arc::new(recv_pipe),
            aborted: Arc::new(SyncEvent::new()),
            received: Arc::new(SyncEvent::new()),
            response: None,
        }
    }

    pub fn method(&self) -> Option<&str> {
        self.method.as_deref()
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn version(&self) -> HttpVersion {
        self.version
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn start_line(&self) -> &str {
        &self.start_line
    }

    pub fn keep_alive(&self) -> bool {
        self.keep_alive
    }

    pub fn clear_keep_alive(&mut self) {
        self.keep_alive = false;
    }

    pub fn expect_continue(&self) -> bool {
        self.expect_continue
    }

    pub fn recv_pipe(&self) -> &Arc<Pipe> {
        &self.recv_pipe
    }

    pub fn aborted(&self) -> &SyncEvent {
        &self.aborted
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted.is_set()
    }

    pub fn received(&self) -> &SyncEvent {
        &self.received
    }

    /// True once the request line and headers have been received.
    pub fn has_headers(&self) -> bool {
        !matches!(self.state, RecvState::RequestLine | RecvState::Headers)
    }

    pub fn response(&self) -> Option<&Arc<ServerResponse>> {
        self.response.as_ref()
    }

    pub fn set_response(&mut self, response: Arc<ServerResponse>) {
        self.response = Some(response);
    }

    pub fn info(&self) -> RequestInfo {
        RequestInfo {
            method: self.method.clone(),
            version: self.version,
            keep_alive: self.keep_alive,
            expect_continue: self.expect_continue,
            start_line: self.start_line.clone(),
            aborted: self.aborted.clone(),
            received: self.received.clone(),
        }
    }

    pub fn recv_mode(&self) -> RecvMode {
        if self.pending.is_some() {
            return RecvMode::Wait;
        }
        match self.state {
            // the last of the body is still in the pipe
            RecvState::Done if !self.recv_pipe.is_empty() => RecvMode::Wait,
            RecvState::RequestLine | RecvState::ChunkSize | RecvState::ChunkEnd => RecvMode::Line,
            RecvState::Headers | RecvState::Trailer => RecvMode::Headers,
            RecvState::Data => RecvMode::Exact(self.remaining),
            RecvState::Done => RecvMode::Done,
        }
    }

    /// Consumes one unit of input of the kind [`recv_mode`](Self::recv_mode)
    /// asked for.
    pub fn recv(&mut self, unit: RecvUnit) -> Result<()> {
        match (self.state, unit) {
            (_, RecvUnit::Nothing) => self.flush_pending(),
            (RecvState::RequestLine, RecvUnit::Line(line)) => self.recv_request_line(&line),
            (RecvState::Headers, RecvUnit::Headers(block)) => self.recv_headers(&block),
            (RecvState::ChunkSize, RecvUnit::Line(line)) => {
                match parser::parse_chunk_size(&line)? {
                    0 => self.state = RecvState::Trailer,
                    size => {
                        self.remaining = size;
                        self.state = RecvState::Data;
                    }
                }
                Ok(())
            }
            (RecvState::Data, RecvUnit::Data(data)) => self.recv_data(data),
            (RecvState::ChunkEnd, RecvUnit::Line(line)) => {
                if &line[..] != b"\r\n" && &line[..] != b"\n" {
                    return Err(Error::Protocol("expected CRLF after chunk".to_string()));
                }
                self.state = RecvState::ChunkSize;
                Ok(())
            }
            (RecvState::Trailer, RecvUnit::Headers(block)) => {
                parser::parse_header_block(&block, &mut self.headers)?;
                self.state = RecvState::Done;
                Ok(())
            }
            (state, unit) => Err(Error::Protocol(format!(
                "unexpected {:?} while in state {:?}",
                unit, state
            ))),
        }
    }

    fn recv_request_line(&mut self, line: &[u8]) -> Result<()> {
        // blank lines before a request are tolerated
        if line == b"\r\n" || line == b"\n" {
            return Ok(());
        }
        let request_line = parser::parse_request_line(line)?;
        self.start_line = String::from_utf8_lossy(line).trim_end().to_string();
        self.method = Some(request_line.method);
        self.target = request_line.target;
        self.version = request_line.version;
        self.state = RecvState::Headers;
        Ok(())
    }

    fn recv_headers(&mut self, block: &[u8]) -> Result<()> {
        parser::parse_header_block(block, &mut self.headers)?;
        self.extract_authority()?;

        if self.version.is_legacy() || self.headers.has_token("Connection", "close") {
            self.keep_alive = false;
        }
        self.expect_continue = self.headers.has_token("Expect", "100-continue");

        self.state = match parser::request_body_length(&self.headers)? {
            BodyLength::Empty => RecvState::Done,
            BodyLength::Length(length) => {
                self.remaining = length;
                RecvState::Data
            }
            BodyLength::Chunked => {
                self.chunked = true;
                RecvState::ChunkSize
            }
        };
        Ok(())
    }

    /// Moves the authority of an absolute request target into the Host
    /// header, leaving the target as path and query only.
    fn extract_authority(&mut self) -> Result<()> {
        if self.target.starts_with('/') || self.target == "*" {
            return Ok(());
        }
        let url = Url::parse(&self.target)
            .map_err(|e| Error::Protocol(format!("bad request target: {}", e)))?;
        if url.scheme() != "http" && url.scheme() != "https" {
            return Err(Error::Protocol(format!(
                "unsupported scheme in request target: {}",
                url.scheme()
            )));
        }
        if !url.username().is_empty() || url.password().is_some() {
            return Err(Error::Unimplemented(
                "authentication information in request target".to_string(),
            ));
        }
        let host = url
            .host_str()
            .ok_or_else(|| Error::Protocol("request target has no host".to_string()))?;
        // url drops the port when it is the scheme's default
        let authority = match url.port() {
            Some(port) => format!("{}:{}", host, port),
            None => host.to_string(),
        };
        self.headers.set("Host", authority);
        self.target = match url.query() {
            Some(query) => format!("{}?{}", url.path(), query),
            None => url.path().to_string(),
        };
        Ok(())
    }

    fn recv_data(&mut self, mut data: Bytes) -> Result<()> {
        if data.len() as u64 > self.remaining {
            data.truncate(self.remaining as usize);
        }
        self.remaining -= data.len() as u64;
        if self.remaining == 0 {
            self.state = if self.chunked {
                RecvState::ChunkEnd
            } else {
                RecvState::Done
            };
        }
        self.pending = Some(data);
        self.flush_pending()
    }

    /// Offers any refused body data to the pipe again.
    fn flush_pending(&mut self) -> Result<()> {
        if let Some(data) = self.pending.take() {
            if data.is_empty() {
                return Ok(());
            }
            if self.recv_pipe.write(data.clone())?.is_none() {
                self.pending = Some(data);
            }
        }
        Ok(())
    }

    /// Builds the context handed to the application for this request.
    pub fn context(
        &self,
        server_name: &str,
        server_port: u16,
        remote_addr: Option<SocketAddr>,
    ) -> RequestContext {
        let (raw_path, query) = match self.target.split_once('?') {
            Some((path, query)) => (path, Some(query.to_string())),
            None => (self.target.as_str(), None),
        };
        RequestContext {
            method: self.method.clone().unwrap_or_default(),
            path: percent_decode_str(raw_path).decode_utf8_lossy().into_owned(),
            raw_path: raw_path.to_string(),
            query,
            version: self.version,
            headers: self.headers.clone(),
            host: self.headers.get("Host").map(|host| host.to_ascii_lowercase()),
            server_name: server_name.to_string(),
            server_port,
            remote_addr,
            url_scheme: "http",
            input: BodyReader {
                pipe: self.recv_pipe.clone(),
                aborted: self.aborted.clone(),
            },
        }
    }
}

/// Everything an application is told about one request.
#[derive(Debug)]
pub struct RequestContext {
    pub method: String,
    /// The path of the request target, percent-decoded.
    pub path: String,
    /// The path exactly as it appeared in the request target.
    pub raw_path: String,
    /// The query string, still encoded.
    pub query: Option<String>,
    pub version: HttpVersion,
    pub headers: Headers,
    /// The authority from the Host header or absolute request target,
    /// lowercased.
    pub host: Option<String>,
    pub server_name: String,
    pub server_port: u16,
    pub remote_addr: Option<SocketAddr>,
    pub url_scheme: &'static str,
    /// The request body.
    pub input: BodyReader,
}

/// Blocking reader over a request body.
///
/// Reads end (return 0) once the body is complete. If the connection
/// abandons the request first, because the client went away or stalled,
/// reading past the data received fails with `UnexpectedEof`.
#[derive(Debug, Clone)]
pub struct BodyReader {
    pipe: Arc<Pipe>,
    aborted: Arc<SyncEvent>,
}

impl BodyReader {
    /// Reads the next chunk of the body; empty at the end.
    pub fn read_chunk(&mut self) -> Result<Bytes> {
        loop {
            if let Some(chunk) = self.pipe.read(crate::sync::DEFAULT_BUFFER_SIZE)? {
                if chunk.is_empty() {
                    self.check_complete()?;
                }
                return Ok(chunk);
            }
        }
    }

    /// Reads the rest of the body.
    pub fn read_all(&mut self) -> Result<Bytes> {
        let body = self.pipe.read_all()?;
        self.check_complete()?;
        Ok(body)
    }

    fn check_complete(&self) -> Result<()> {
        if self.aborted.is_set() {
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "request body incomplete",
            )));
        }
        Ok(())
    }
}

impl io::Read for BodyReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        match self.pipe.read(buf.len()).map_err(io::Error::from)? {
            Some(chunk) if chunk.is_empty() => {
                self.check_complete()?;
                Ok(0)
            }
            Some(chunk) => {
                buf[..chunk.len()].copy_from_slice(&chunk);
                Ok(chunk.len())
            }
            None => Err(io::ErrorKind::WouldBlock.into()),
        }
    }
}
