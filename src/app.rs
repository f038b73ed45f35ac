//! The application interface.
//!
//! An [`Application`] is called once per request, on a thread of its own,
//! with the request's [`RequestContext`] and a [`Responder`]. It chooses a
//! status and headers with [`Responder::start_response`], and then either
//! writes the body through the returned [`BodyWriter`], returns it as a
//! [`Body`], or both (written data goes first).
//!
//! ```no_run
//! use tandem::app::{app_fn, Body};
//!
//! let hello = app_fn(|_ctx, responder| {
//!     responder.start_response("200 OK", vec![("Content-Type".into(), "text/plain".into())])?;
//!     Ok(Body::from("hello\n"))
//! });
//! # let _ = hello;
//! ```

use std::io;
use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, error, warn};

use crate::error::Result;
use crate::http::request::RequestContext;
use crate::http::response::ServerResponse;

/// Handles requests for one or more authorities.
pub trait Application: Send + Sync + 'static {
    fn call(&self, ctx: &mut RequestContext, responder: &Responder) -> anyhow::Result<Body>;
}

impl<F> Application for F
where
    F: Fn(&mut RequestContext, &Responder) -> anyhow::Result<Body> + Send + Sync + 'static,
{
    fn call(&self, ctx: &mut RequestContext, responder: &Responder) -> anyhow::Result<Body> {
        self(ctx, responder)
    }
}

/// Wraps a closure as a shareable [`Application`].
pub fn app_fn<F>(f: F) -> Arc<dyn Application>
where
    F: Fn(&mut RequestContext, &Responder) -> anyhow::Result<Body> + Send + Sync + 'static,
{
    Arc::new(f)
}

/// The rest of a response body, returned by an application.
pub enum Body {
    Empty,
    /// The whole body; its length is sent as Content-Length when nothing
    /// has been written yet.
    Bytes(Bytes),
    /// Chunks produced on demand.
    Stream(Box<dyn Iterator<Item = Bytes> + Send>),
}

impl From<&'static str> for Body {
    fn from(s: &'static str) -> Self {
        Body::Bytes(Bytes::from_static(s.as_bytes()))
    }
}

impl From<String> for Body {
    fn from(s: String) -> Self {
        Body::Bytes(Bytes::from(s))
    }
}

impl From<Vec<u8>> for Body {
    fn from(v: Vec<u8>) -> Self {
        Body::Bytes(Bytes::from(v))
    }
}

impl From<Bytes> for Body {
    fn from(b: Bytes) -> Self {
        Body::Bytes(b)
    }
}

/// Lets an application start its response.
pub struct Responder {
    response: Arc<ServerResponse>,
}

impl Responder {
    pub(crate) fn new(response: Arc<ServerResponse>) -> Self {
        Self { response }
    }

    /// Sets the status line (e.g. `"200 OK"`) and headers.
    ///
    /// Nothing is sent until the first body data is written or the
    /// application returns, so this may be called again until then.
    pub fn start_response(&self, status: &str, headers: Vec<(String, String)>) -> Result<BodyWriter> {
        self.response.start_response(status, headers)?;
        Ok(BodyWriter {
            response: self.response.clone(),
        })
    }
}

/// Writes response body data as the application produces it.
pub struct BodyWriter {
    response: Arc<ServerResponse>,
}

impl BodyWriter {
    /// Sends `data`, committing the status and headers first if needed.
    pub fn send(&self, data: impl Into<Bytes>) -> Result<()> {
        self.response.write_body(data.into())
    }
}

impl io::Write for BodyWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.send(Bytes::copy_from_slice(buf))?;
        Ok(buf.len())
    }

    /// Blocks until the connection has taken everything written so far.
    fn flush(&mut self) -> io::Result<()> {
        self.response.send_pipe().flush()?;
        Ok(())
    }
}

/// Hands what the application returned to the writer.
fn deliver(response: &ServerResponse, body: Body) -> Result<()> {
    match body {
        Body::Empty => {}
        Body::Bytes(data) => {
            response.set_body_len(data.len() as u64);
            response.write_body(data)?;
        }
        Body::Stream(chunks) => {
            for chunk in chunks {
                response.write_body(chunk)?;
            }
        }
    }
    if !response.is_ready() {
        response.set_body_len(0);
        response.start_sending()?;
    }
    Ok(())
}

/// Runs one request through `call` on the current thread.
///
/// Whatever happens, the body pipe is ended afterwards, and any request
/// data the application left unread is consumed so the connection can
/// move on to the next request.
pub(crate) fn serve<F>(mut ctx: RequestContext, response: Arc<ServerResponse>, call: F)
where
    F: FnOnce(&mut RequestContext, &Responder) -> anyhow::Result<Body>,
{
    debug!(request = %response.start_line(), "calling application");
    let responder = Responder::new(response.clone());
    let outcome = call(&mut ctx, &responder).and_then(|body| Ok(deliver(&response, body)?));
    if let Err(err) = outcome {
        error!(request = %response.start_line(), error = %err, "application failed");
        if let Err(err) = response.fail(&err.to_string()) {
            debug!(request = %response.start_line(), error = %err, "could not report failure");
        }
    }
    response.finish_body();

    let mut discarded = 0usize;
    while !response.request().aborted.is_set() {
        match ctx.input.read_chunk() {
            Ok(data) if data.is_empty() => break,
            Ok(data) => {
                if discarded == 0 {
                    warn!(
                        request = %response.start_line(),
                        "application discarded unread request data"
                    );
                }
                discarded += data.len();
            }
            Err(_) => break,
        }
    }
    if discarded > 0 {
        debug!(request = %response.start_line(), discarded, "request data discarded");
    }
}
