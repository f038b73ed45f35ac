use std::fmt::{Display, Formatter};
use std::sync::{Mutex, MutexGuard};

use bytes::{BufMut, Bytes, BytesMut};
use tracing::warn;

use crate::config::Timeouts;
use crate::error::{Error, Result};
use crate::http::message::{Headers, HttpVersion};
use crate::http::request::RequestInfo;
use crate::sync::{DEFAULT_BUFFER_SIZE, Pipe, SyncEvent};

/// An HTTP status code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StatusCode(pub u16);

impl StatusCode {
    pub const CONTINUE: StatusCode = StatusCode(100);
    pub const OK: StatusCode = StatusCode(200);
    pub const NO_CONTENT: StatusCode = StatusCode(204);
    pub const NOT_MODIFIED: StatusCode = StatusCode(304);
    pub const BAD_REQUEST: StatusCode = StatusCode(400);
    pub const NOT_FOUND: StatusCode = StatusCode(404);
    pub const INTERNAL_SERVER_ERROR: StatusCode = StatusCode(500);
    pub const NOT_IMPLEMENTED: StatusCode = StatusCode(501);
    pub const SERVICE_UNAVAILABLE: StatusCode = StatusCode(503);

    /// Returns the numeric HTTP status code.
    ///
    /// # Example
    ///
    /// ```
    /// # use tandem::http::response::StatusCode;
    /// assert_eq!(StatusCode::OK.as_u16(), 200);
    /// assert_eq!(StatusCode::NOT_FOUND.as_u16(), 404);
    /// ```
    pub fn as_u16(&self) -> u16 {
        self.0
    }

    /// Returns the standard HTTP reason phrase for this status code, or
    /// an empty string for codes without one.
    ///
    /// # Example
    ///
    /// ```
    /// # use tandem::http::response::StatusCode;
    /// assert_eq!(StatusCode::OK.reason_phrase(), "OK");
    /// assert_eq!(StatusCode(418).reason_phrase(), "");
    /// ```
    pub fn reason_phrase(&self) -> &'static str {
        match self.0 {
            100 => "Continue",
            101 => "Switching Protocols",
            200 => "OK",
            201 => "Created",
            202 => "Accepted",
            203 => "Non-Authoritative Information",
            204 => "No Content",
            205 => "Reset Content",
            206 => "Partial Content",
            300 => "Multiple Choices",
            301 => "Moved Permanently",
            302 => "Found",
            303 => "See Other",
            304 => "Not Modified",
            305 => "Use Proxy",
            307 => "Temporary Redirect",
            400 => "Bad Request",
            401 => "Unauthorized",
            402 => "Payment Required",
            403 => "Forbidden",
            404 => "Not Found",
            405 => "Method Not Allowed",
            406 => "Not Acceptable",
            407 => "Proxy Authentication Required",
            408 => "Request Timeout",
            409 => "Conflict",
            410 => "Gone",
            411 => "Length Required",
            412 => "Precondition Failed",
            413 => "Request Entity Too Large",
            414 => "Request-URI Too Long",
            415 => "Unsupported Media Type",
            416 => "Requested Range Not Satisfiable",
            417 => "Expectation Failed",
            500 => "Internal Server Error",
            501 => "Not Implemented",
            502 => "Bad Gateway",
            503 => "Service Unavailable",
            504 => "Gateway Timeout",
            505 => "HTTP Version Not Supported",
            _ => "",
        }
    }

    /// True for codes whose responses never carry a body.
    pub fn forbids_body(&self) -> bool {
        (100..200).contains(&self.0) || self.0 == 204 || self.0 == 304
    }
}

impl Display for StatusCode {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.0, self.reason_phrase())
    }
}

/// How the body of a response is delimited on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    /// No body at all.
    Empty,
    /// Content-Length; holds the bytes still to send.
    Length(u64),
    Chunked,
    /// Body ends when the connection closes.
    UntilClose,
}

#[derive(Debug)]
struct ResponseState {
    status: Option<u16>,
    reason: String,
    headers: Headers,
    keep_alive: bool,
    body_len: Option<u64>,
    framing: Framing,
    /// Headers are final; set together with `ready_to_send`.
    started: bool,
    /// The application's body is being thrown away.
    discard: bool,
    /// The body was cut short; the connection must close.
    truncated: bool,
    body_done: bool,
    /// The request failed before the writer committed to this response.
    withdrawn: bool,
    /// The writer has committed; the response can no longer be withdrawn.
    sending: bool,
}

/// An outgoing response, filled in by the application thread and sent by
/// the connection's writer thread.
///
/// The application side calls [`start_response`](Self::start_response)
/// and [`write_body`](Self::write_body); the writer calls
/// [`send_start`](Self::send_start), [`send_header`](Self::send_header)
/// and then [`send_body`](Self::send_body) until it returns an empty chunk.
#[derive(Debug)]
pub struct ServerResponse {
    request: RequestInfo,
    protocol: HttpVersion,
    state: Mutex<ResponseState>,
    send_pipe: Pipe,
    ready_to_send: SyncEvent,
    send_continue: SyncEvent,
}

impl ServerResponse {
    pub fn new(request: RequestInfo, protocol: HttpVersion, timeouts: &Timeouts, conn_id: u64) -> Self {
        // the writer polls the body, the application waits for the client
        let send_pipe = Pipe::builder()
            .name(format!("ServerResponse[{}].send_pipe", conn_id))
            .read_blocking(false)
            .timeout(timeouts.connection)
            .build();
        let keep_alive = request.keep_alive && !protocol.is_legacy();
        Self {
            request,
            protocol,
            state: Mutex::new(ResponseState {
                status: None,
                reason: String::new(),
                headers: Headers::new(),
                keep_alive,
                body_len: None,
                framing: Framing::Empty,
                started: false,
                discard: false,
                truncated: false,
                body_done: false,
                withdrawn: false,
                sending: false,
            }),
            send_pipe,
            ready_to_send: SyncEvent::new(),
            send_continue: SyncEvent::new(),
        }
    }

    /// A complete plain-text response that closes the connection.
    pub fn error(
        request: RequestInfo,
        protocol: HttpVersion,
        timeouts: &Timeouts,
        conn_id: u64,
        status: StatusCode,
        text: &str,
    ) -> Result<Self> {
        let response = Self::new(request, protocol, timeouts, conn_id);
        {
            let mut state = response.lock();
            state.status = Some(status.as_u16());
            state.reason = status.reason_phrase().to_string();
            state.keep_alive = false;
            state.body_len = Some(text.len() as u64);
            state
                .headers
                .set("Content-Type", "text/plain; charset=utf-8");
        }
        response.write_body(Bytes::copy_from_slice(text.as_bytes()))?;
        response.send_pipe.write_eof();
        Ok(response)
    }

    fn lock(&self) -> MutexGuard<'_, ResponseState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn request(&self) -> &RequestInfo {
        &self.request
    }

    pub fn start_line(&self) -> &str {
        &self.request.start_line
    }

    pub fn protocol(&self) -> HttpVersion {
        self.protocol
    }

    pub fn status(&self) -> Option<u16> {
        self.lock().status
    }

    pub fn keep_alive(&self) -> bool {
        self.lock().keep_alive
    }

    pub fn framing(&self) -> Framing {
        self.lock().framing
    }

    pub fn send_pipe(&self) -> &Pipe {
        &self.send_pipe
    }

    /// Set once the headers are final and the writer may start sending.
    pub fn ready_to_send(&self) -> &SyncEvent {
        &self.ready_to_send
    }

    /// Set by the reader when the application wants the request body of
    /// an `Expect: 100-continue` request.
    pub fn send_continue(&self) -> &SyncEvent {
        &self.send_continue
    }

    pub fn is_ready(&self) -> bool {
        self.ready_to_send.is_set()
    }

    /// Records the status line and headers chosen by the application.
    ///
    /// `status` is the code and reason phrase, e.g. `"404 Not Found"`.
    pub fn start_response(&self, status: &str, headers: Vec<(String, String)>) -> Result<()> {
        let (code, reason) = status.trim().split_once(' ').unwrap_or((status.trim(), ""));
        let code: u16 = code
            .parse()
            .ok()
            .filter(|code| (100..1000).contains(code))
            .ok_or_else(|| Error::Application(format!("bad status line: {:?}", status)))?;

        let mut state = self.lock();
        if state.started {
            return Err(Error::Application(
                "start_response called after headers were sent".to_string(),
            ));
        }
        state.status = Some(code);
        state.reason = if reason.is_empty() {
            StatusCode(code).reason_phrase().to_string()
        } else {
            reason.to_string()
        };
        for (name, value) in headers {
            state.headers.set(name, value);
        }
        Ok(())
    }

    /// Fixes the length of the body before sending starts.
    pub fn set_body_len(&self, len: u64) {
        let mut state = self.lock();
        if !state.started {
            state.body_len = Some(len);
        }
    }

    /// Finalises the headers and releases the writer.
    ///
    /// Fails if no status has been set. Calling it again is a no-op.
    pub fn start_sending(&self) -> Result<()> {
        {
            let mut state = self.lock();
            if state.started {
                return Ok(());
            }
            let status = state.status.ok_or_else(|| {
                Error::Application("response started without a status".to_string())
            })?;
            self.frame(&mut state, StatusCode(status));
            state.started = true;
        }
        self.ready_to_send.set();
        Ok(())
    }

    /// Chooses the framing and adds the headers that go with it.
    fn frame(&self, state: &mut ResponseState, status: StatusCode) {
        let legacy = self.protocol.is_legacy() || self.request.version.is_legacy();
        if state.headers.has_token("Connection", "close") {
            state.keep_alive = false;
        }

        let declared = state
            .headers
            .get("Content-Length")
            .and_then(|value| value.trim().parse::<u64>().ok());
        let head = self.request.method.as_deref() == Some("HEAD");

        state.framing = if status.forbids_body() {
            state.headers.remove("Content-Length");
            state.headers.remove("Transfer-Encoding");
            Framing::Empty
        } else if head {
            if let (None, Some(len)) = (declared, state.body_len) {
                state.headers.set("Content-Length", len.to_string());
            }
            Framing::Empty
        } else if let Some(len) = declared.or(state.body_len) {
            state.headers.remove("Transfer-Encoding");
            state.headers.set("Content-Length", len.to_string());
            Framing::Length(len)
        } else if legacy {
            state.keep_alive = false;
            Framing::UntilClose
        } else {
            state.headers.set("Transfer-Encoding", "chunked");
            Framing::Chunked
        };
        state.discard = state.framing == Framing::Empty;

        if !state.keep_alive {
            state.headers.set("Connection", "close");
        }
    }

    /// Queues body data, starting the response if necessary.
    pub fn write_body(&self, data: Bytes) -> Result<()> {
        self.start_sending()?;
        if self.lock().discard || data.is_empty() {
            return Ok(());
        }
        self.send_pipe.write(data)?;
        Ok(())
    }

    /// Tells the writer the application has no more body data.
    pub fn finish_body(&self) {
        self.send_pipe.write_eof();
    }

    /// Makes this response end the connection, if headers are not yet
    /// on the wire.
    pub fn force_close(&self) {
        let mut state = self.lock();
        state.keep_alive = false;
        state.headers.set("Connection", "close");
    }

    /// Abandons the request body this response answers.
    pub fn abort_request(&self) {
        self.request.aborted.set();
    }

    /// Takes this response back after the request it answers failed.
    ///
    /// Whatever the application produces from now on is discarded and the
    /// writer is woken so it can skip the response. Returns false if the
    /// writer already committed to sending it; the connection then closes
    /// once the response is out.
    pub fn withdraw(&self) -> bool {
        {
            let mut state = self.lock();
            state.keep_alive = false;
            if state.sending {
                return false;
            }
            state.withdrawn = true;
            state.discard = true;
        }
        self.ready_to_send.set();
        true
    }

    /// Called by the writer before the status line goes out.
    ///
    /// Fails if the response was withdrawn first.
    pub fn commit(&self) -> bool {
        let mut state = self.lock();
        if state.withdrawn {
            return false;
        }
        state.sending = true;
        true
    }

    pub fn is_withdrawn(&self) -> bool {
        self.lock().withdrawn
    }

    /// Handles a failed application.
    ///
    /// Before headers are final the response becomes a 500 carrying
    /// `text`. Afterwards the body is cut short and the connection closed,
    /// so the client can tell the response is incomplete.
    pub fn fail(&self, text: &str) -> Result<()> {
        {
            let mut state = self.lock();
            if state.started {
                state.truncated = true;
                state.keep_alive = false;
                return Ok(());
            }
            state.status = Some(500);
            state.reason = StatusCode::INTERNAL_SERVER_ERROR.reason_phrase().to_string();
            state.headers = Headers::new();
            state
                .headers
                .set("Content-Type", "text/plain; charset=utf-8");
            state.keep_alive = false;
            state.body_len = Some(text.len() as u64);
        }
        self.write_body(Bytes::copy_from_slice(text.as_bytes()))
    }

    /// Turns a response the application never started into an empty 500.
    ///
    /// Anything the application writes afterwards is discarded.
    pub fn fail_unready(&self) {
        {
            let mut state = self.lock();
            state.status = Some(500);
            state.reason = StatusCode::INTERNAL_SERVER_ERROR.reason_phrase().to_string();
            state.headers = Headers::new();
            state.headers.set("Content-Length", "0");
            state.headers.set("Connection", "close");
            state.keep_alive = false;
            state.framing = Framing::Length(0);
            state.discard = true;
            state.started = true;
        }
        self.ready_to_send.set();
    }

    /// The `100 Continue` interim response.
    pub fn send_continue_line(&self) -> Bytes {
        Bytes::from(format!("{} {}\r\n\r\n", self.protocol, StatusCode::CONTINUE))
    }

    /// The status line. A response with no status is sent as a 500.
    pub fn send_start(&self) -> Bytes {
        let state = self.lock();
        let (status, reason) = match state.status {
            Some(status) => (status, state.reason.as_str()),
            None => (500, StatusCode::INTERNAL_SERVER_ERROR.reason_phrase()),
        };
        Bytes::from(format!("{} {} {}\r\n", self.protocol, status, reason))
    }

    /// The header block, including the blank line ending it.
    pub fn send_header(&self) -> Bytes {
        let state = self.lock();
        let mut buf = BytesMut::new();
        for (name, value) in state.headers.iter() {
            buf.put_slice(name.as_bytes());
            buf.put_slice(b": ");
            buf.put_slice(value.as_bytes());
            buf.put_slice(b"\r\n");
        }
        buf.put_slice(b"\r\n");
        buf.freeze()
    }

    /// The next piece of body to write.
    ///
    /// `None` means the application has not produced more data yet: wait
    /// on the send pipe. An empty chunk means the body is complete.
    pub fn send_body(&self) -> Result<Option<Bytes>> {
        let mut state = self.lock();
        if state.body_done || matches!(state.framing, Framing::Empty | Framing::Length(0)) {
            return Ok(Some(Bytes::new()));
        }
        let Some(mut chunk) = self.send_pipe.read(DEFAULT_BUFFER_SIZE)? else {
            return Ok(None);
        };

        let framing = state.framing;
        match framing {
            Framing::Length(remaining) => {
                if chunk.is_empty() {
                    warn!(
                        request = %self.request.start_line,
                        missing = remaining,
                        "response body shorter than Content-Length"
                    );
                    state.keep_alive = false;
                    state.body_done = true;
                } else if chunk.len() as u64 > remaining {
                    warn!(
                        request = %self.request.start_line,
                        discarded = chunk.len() as u64 - remaining,
                        "response body longer than Content-Length"
                    );
                    chunk.truncate(remaining as usize);
                }
                state.framing = Framing::Length(remaining - chunk.len() as u64);
                Ok(Some(chunk))
            }
            Framing::Chunked if chunk.is_empty() => {
                state.body_done = true;
                if state.truncated {
                    state.keep_alive = false;
                    Ok(Some(Bytes::new()))
                } else {
                    Ok(Some(Bytes::from_static(b"0\r\n\r\n")))
                }
            }
            Framing::Chunked => {
                let mut buf = BytesMut::with_capacity(chunk.len() + 12);
                buf.put_slice(format!("{:x}\r\n", chunk.len()).as_bytes());
                buf.put_slice(&chunk);
                buf.put_slice(b"\r\n");
                Ok(Some(buf.freeze()))
            }
            _ => {
                if chunk.is_empty() {
                    state.body_done = true;
                }
                Ok(Some(chunk))
            }
        }
    }

    /// Releases the body pipe once sending is over.
    pub fn close(&self) {
        self.send_pipe.close();
    }
}
