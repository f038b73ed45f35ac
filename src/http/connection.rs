use std::net::SocketAddr;
use std::sync::mpsc::{self, Sender};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, error, warn};

use crate::config::Timeouts;
use crate::error::{Error, Result};
use crate::http::message::{RecvMode, RecvUnit};
use crate::http::request::ServerRequest;
use crate::http::response::{ServerResponse, StatusCode};
use crate::http::socket::{SocketReader, Transport};
use crate::http::writer::ResponseWriter;
use crate::server::core::ServerCore;
use crate::sync::{DEFAULT_BUFFER_SIZE, SyncEvent, wait_any};

/// Queue of responses from the reader to the writer; `None` ends it.
pub type ResponseQueue = Sender<Option<Arc<ServerResponse>>>;

/// One client connection.
///
/// The thread calling [`run`](Self::run) reads requests; a second thread
/// runs the [`ResponseWriter`]. Responses are queued in request order, so
/// a pipelined request can be read (and its application started) while
/// earlier responses are still being sent.
pub struct Connection {
    id: u64,
    core: Arc<ServerCore>,
    reader: SocketReader,
    writer: Option<ResponseWriter>,
    peer: Option<SocketAddr>,
    timeouts: Timeouts,
    finished: Arc<SyncEvent>,
}

impl Connection {
    pub fn new(id: u64, core: Arc<ServerCore>, stream: Box<dyn Transport>) -> Result<Self> {
        let timeouts = *core.timeouts();
        let finished = Arc::new(SyncEvent::new());
        let writer = ResponseWriter::new(id, stream.try_clone_box()?, timeouts, finished.clone());
        Ok(Self {
            id,
            peer: stream.peer_addr().ok(),
            core,
            reader: SocketReader::new(stream),
            writer: Some(writer),
            timeouts,
            finished,
        })
    }

    /// Serves requests until the connection ends, then closes the socket.
    pub fn run(mut self) {
        let Some(writer) = self.writer.take() else {
            return;
        };
        let (tx, rx) = mpsc::channel();
        let spawned = thread::Builder::new()
            .name(format!("tandem-writer-{}", self.id))
            .spawn(move || writer.run(rx));
        match spawned {
            Ok(handle) => {
                self.handle_requests(&tx);
                drop(tx);
                if handle.join().is_err() {
                    error!(conn = self.id, "response writer panicked");
                }
            }
            Err(err) => warn!(conn = self.id, error = %err, "could not start response writer"),
        }
        self.reader.linger_close(self.timeouts.connection);
    }

    fn handle_requests(&mut self, tx: &ResponseQueue) {
        while !self.finished.is_set() {
            debug!(conn = self.id, "reading request");
            let mut request = ServerRequest::new(self.id, &self.timeouts);
            let rflag = Arc::new(SyncEvent::new());
            request.recv_pipe().set_read_flag(rflag.clone());

            if let Err(err) = self.read_request(&mut request, &rflag, tx) {
                self.fail_request(&mut request, err, tx);
            }
            request.recv_pipe().close();
            request.received().set();

            if self.finished.is_set() || !request.keep_alive() {
                break;
            }
            let Some(response) = request.response() else {
                break;
            };
            // a response that hangs up must not be raced by the next request
            response.ready_to_send().wait(self.timeouts.app);
            if !response.keep_alive() {
                break;
            }
        }
        debug!(conn = self.id, "no more requests");
        let _ = tx.send(None);
    }

    fn read_request(
        &mut self,
        request: &mut ServerRequest,
        rflag: &Arc<SyncEvent>,
        tx: &ResponseQueue,
    ) -> Result<()> {
        let mut timeout = self.timeouts.idle;
        let mut continue_since: Option<Instant> = None;
        loop {
            let mode = request.recv_mode();
            if mode == RecvMode::Done || request.is_aborted() {
                // the application must see the end of the body, not hang
                debug!(conn = self.id, request = %request.start_line(), "request complete");
                request.recv_pipe().write_eof();
                return Ok(());
            }

            if let Some(since) = continue_since {
                if !rflag.is_set() {
                    let waited = since.elapsed();
                    if waited >= self.timeouts.app {
                        return Err(Error::UnresponsiveApplication);
                    }
                    wait_any(self.timeouts.app - waited, &[&**rflag, request.aborted()]);
                    continue;
                }
                // the application is reading: ask the client for the body
                if let Some(response) = request.response() {
                    response.send_continue().set();
                }
                continue_since = None;
            }

            match mode {
                RecvMode::Done => {}
                RecvMode::Wait => {
                    // the body pipe is full, or holds the end of the body:
                    // give the application time to read from it
                    if rflag.is_set() {
                        rflag.clear();
                    } else {
                        debug!(conn = self.id, "recv_pipe blocked, waiting for app");
                        wait_any(self.timeouts.app, &[&**rflag, request.aborted()]);
                        if !rflag.is_set() && !request.is_aborted() {
                            return Err(Error::UnresponsiveApplication);
                        }
                    }
                    request.recv(RecvUnit::Nothing)?;
                }
                mode => match read_unit(&mut self.reader, mode, timeout)? {
                    Some(unit) => {
                        let hang_up = matches!(&unit, RecvUnit::Data(data) if data.is_empty());
                        request.recv(unit)?;
                        if hang_up {
                            self.finished.set();
                        }
                        if request.has_headers() && request.response().is_none() {
                            self.dispatch(request, tx)?;
                            if request.expect_continue() {
                                continue_since = Some(Instant::now());
                            }
                        }
                    }
                    None if request.method().is_none() => {
                        debug!(conn = self.id, "client hang up detected");
                        self.finished.set();
                        return Ok(());
                    }
                    None => return Err(unexpected_eom()),
                },
            }
            // a request has started, so from now on the client should be
            // sending steadily
            timeout = self.timeouts.connection;
        }
    }

    /// Queues a response for a request whose headers are in and starts
    /// the application.
    fn dispatch(&self, request: &mut ServerRequest, tx: &ResponseQueue) -> Result<()> {
        let response = Arc::new(ServerResponse::new(
            request.info(),
            self.core.protocol(),
            &self.timeouts,
            self.id,
        ));
        request.set_response(response.clone());
        tx.send(Some(response.clone())).map_err(|_| Error::BrokenPipe)?;
        let ctx = request.context(self.core.server_name(), self.core.port(), self.peer);
        self.core.launch_app(ctx, response)
    }

    fn fail_request(&self, request: &mut ServerRequest, err: Error, tx: &ResponseQueue) {
        self.finished.set();
        request.clear_keep_alive();
        if let Some(response) = request.response() {
            // the application only has part of the request: whatever it
            // answers must not go out as if it had all of it
            request.aborted().set();
            if !response.withdraw() {
                debug!(conn = self.id, request = %request.start_line(), "response already sending");
            }
        }
        if err.is_io() {
            if request.method().is_some() {
                warn!(
                    conn = self.id,
                    request = %request.start_line(),
                    error = %err,
                    "Unexpected EOM"
                );
            } else {
                debug!(conn = self.id, error = %err, "timed out waiting for request");
            }
            return;
        }

        let status = err.status().unwrap_or(500);
        if status >= 500 {
            error!(conn = self.id, request = %request.start_line(), error = %err, "request failed");
        } else {
            warn!(conn = self.id, request = %request.start_line(), error = %err, "bad request");
        }
        let response = ServerResponse::error(
            request.info(),
            self.core.protocol(),
            &self.timeouts,
            self.id,
            StatusCode(status),
            &err.to_string(),
        );
        match response {
            Ok(response) => {
                let _ = tx.send(Some(Arc::new(response)));
            }
            Err(err) => debug!(conn = self.id, error = %err, "could not queue error response"),
        }
    }
}

/// Reads the unit of input `mode` asks for from the socket.
///
/// `None` means the client closed the connection first, except in
/// [`RecvMode::All`], where the close is the end of the data and is
/// reported as an empty [`RecvUnit::Data`]. `Wait` and `Done` read
/// nothing.
fn read_unit(reader: &mut SocketReader, mode: RecvMode, timeout: Duration) -> Result<Option<RecvUnit>> {
    let unit = match mode {
        RecvMode::Headers => reader.read_headers(timeout)?.map(RecvUnit::Headers),
        RecvMode::Line => reader.read_line(timeout)?.map(RecvUnit::Line),
        RecvMode::Exact(remaining) => {
            let max = remaining.min(DEFAULT_BUFFER_SIZE as u64) as usize;
            reader.read_data(max, timeout)?.map(RecvUnit::Data)
        }
        // requests always know where they end; this is for messages
        // delimited by the connection closing
        RecvMode::All => Some(RecvUnit::Data(
            reader
                .read_data(DEFAULT_BUFFER_SIZE, timeout)?
                .unwrap_or_default(),
        )),
        RecvMode::Wait | RecvMode::Done => Some(RecvUnit::Nothing),
    };
    Ok(unit)
}

fn unexpected_eom() -> Error {
    Error::Io(std::io::Error::new(
        std::io::ErrorKind::UnexpectedEof,
        "unexpected end of message",
    ))
}
