use std::net::Shutdown;
use std::sync::Arc;
use std::sync::mpsc::{Receiver, RecvTimeoutError};

use tracing::{debug, error, info};

use crate::config::Timeouts;
use crate::error::Result;
use crate::http::response::ServerResponse;
use crate::http::socket::{self, Transport};
use crate::sync::{SyncEvent, wait_any};

/// Sends a connection's responses, in order, from its own thread.
pub struct ResponseWriter {
    conn: u64,
    stream: Box<dyn Transport>,
    timeouts: Timeouts,
    finished: Arc<SyncEvent>,
}

impl ResponseWriter {
    pub fn new(conn: u64, stream: Box<dyn Transport>, timeouts: Timeouts, finished: Arc<SyncEvent>) -> Self {
        Self {
            conn,
            stream,
            timeouts,
            finished,
        }
    }

    /// Writes queued responses until the queue ends or a response closes
    /// the connection.
    pub fn run(mut self, queue: Receiver<Option<Arc<ServerResponse>>>) {
        let outcome = self.handle_responses(&queue);
        self.finished.set();
        let how = match &outcome {
            Ok(()) => Shutdown::Write,
            // the reader may be blocked on the socket: release it
            Err(err) => {
                debug!(conn = self.conn, error = %err, "response writer failed");
                Shutdown::Both
            }
        };
        let _ = self.stream.shutdown(how);

        // anything still queued will never be sent
        while let Ok(Some(response)) = queue.try_recv() {
            response.close();
        }
        debug!(conn = self.conn, "response writer done");
    }

    fn handle_responses(&mut self, queue: &Receiver<Option<Arc<ServerResponse>>>) -> Result<()> {
        let wait = self.timeouts.connection + self.timeouts.app;
        let mut keep_alive = true;
        while keep_alive {
            debug!(conn = self.conn, "waiting for response");
            let response = match queue.recv_timeout(wait) {
                Ok(Some(response)) => response,
                Ok(None) | Err(RecvTimeoutError::Disconnected) => break,
                Err(RecvTimeoutError::Timeout) => {
                    error!(
                        conn = self.conn,
                        "response queue timeout (may indicate a stuck connection)"
                    );
                    break;
                }
            };
            keep_alive = self.send_response(&response)?;
        }
        Ok(())
    }

    fn write(&mut self, data: &[u8]) -> Result<()> {
        socket::write_all(&mut *self.stream, data, self.timeouts.connection)
    }

    /// Sends one response. Returns whether the connection stays open.
    fn send_response(&mut self, response: &ServerResponse) -> Result<bool> {
        let app = self.timeouts.app;
        let request = response.request();
        // while the client is still sending the request, a slow
        // application is not to blame
        let events = [response.ready_to_send(), response.send_continue(), &*request.received];
        while !events.iter().any(|event| event.is_set()) {
            wait_any(app, &events);
        }
        wait_any(app, &[response.ready_to_send(), response.send_continue()]);
        if response.is_withdrawn() {
            return Ok(self.skip(response));
        }

        if request.expect_continue {
            let hopeful = match response.status() {
                Some(status) if response.is_ready() => (200..400).contains(&status),
                _ => true,
            };
            if hopeful {
                info!(conn = self.conn, "Sending response: {} 100 Continue", response.protocol());
                self.write(&response.send_continue_line())?;
                response.ready_to_send().wait(app);
            } else {
                // a final answer is already known: don't make the client
                // send a body nobody will read
                response.force_close();
                response.abort_request();
            }
        }

        if !response.is_ready() {
            error!(
                conn = self.conn,
                request = %response.start_line(),
                "Application timeout"
            );
            response.fail_unready();
        }

        if !response.commit() {
            return Ok(self.skip(response));
        }
        debug!(conn = self.conn, request = %response.start_line(), "sending response");
        self.write(&response.send_start())?;
        self.write(&response.send_header())?;
        loop {
            match response.send_body()? {
                None => response.send_pipe().read_wait(Some(app))?,
                Some(data) if data.is_empty() => {
                    response.close();
                    break;
                }
                Some(data) => self.write(&data)?,
            }
        }
        Ok(response.keep_alive())
    }

    /// Drops a response withdrawn because its request failed. Whatever
    /// explains the failure is queued after it.
    fn skip(&self, response: &ServerResponse) -> bool {
        debug!(conn = self.conn, request = %response.start_line(), "response withdrawn");
        response.close();
        true
    }
}
