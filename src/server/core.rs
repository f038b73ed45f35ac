//! Admission control, virtual hosting and connection supervision.

use std::collections::{HashMap, HashSet};
use std::io;
use std::net::{SocketAddr, TcpStream};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;

use tracing::{debug, info, warn};

use crate::app::{self, Application, Body, Responder};
use crate::config::{Config, Timeouts};
use crate::error::Result;
use crate::http::connection::Connection;
use crate::http::message::HttpVersion;
use crate::http::request::RequestContext;
use crate::http::response::{ServerResponse, StatusCode};
use crate::http::socket::{self, SocketReader, Transport};

const SERVICE_UNAVAILABLE: &[u8] =
    b"HTTP/1.1 503 Service Unavailable\r\nConnection: close\r\n\r\n";

#[derive(Debug, Default)]
struct Admission {
    next_id: u64,
    live: HashSet<u64>,
}

/// Shared state of a running server.
///
/// Built once, wrapped in an `Arc` and handed to every connection.
pub struct ServerCore {
    /// Lowercased authority to application; `None` answers 404.
    authorities: HashMap<String, Option<Arc<dyn Application>>>,
    default_authority: String,
    server_name: String,
    port: u16,
    protocol: HttpVersion,
    timeouts: Timeouts,
    max_connections: Option<usize>,
    admission: Mutex<Admission>,
}

impl ServerCore {
    /// Serves `app` for every configured authority.
    pub fn new(cfg: &Config, app: Option<Arc<dyn Application>>) -> Self {
        let default_authority = cfg.default_authority();
        let mut authorities = HashMap::new();
        if cfg.authorities.is_empty() {
            authorities.insert(default_authority.clone(), app);
        } else {
            for authority in &cfg.authorities {
                authorities.insert(authority.to_ascii_lowercase(), app.clone());
            }
        }
        let server_name = default_authority
            .rsplit_once(':')
            .map(|(host, _)| host.to_string())
            .unwrap_or_else(|| default_authority.clone());
        Self {
            authorities,
            default_authority,
            server_name,
            port: cfg.port(),
            protocol: cfg.protocol,
            timeouts: cfg.timeouts(),
            max_connections: cfg.max_connections,
            admission: Mutex::new(Admission::default()),
        }
    }

    /// Adds (or replaces) an authority served by `app`.
    pub fn with_authority(mut self, authority: &str, app: Option<Arc<dyn Application>>) -> Self {
        self.authorities.insert(authority.to_ascii_lowercase(), app);
        self
    }

    pub fn timeouts(&self) -> &Timeouts {
        &self.timeouts
    }

    pub fn protocol(&self) -> HttpVersion {
        self.protocol
    }

    pub fn server_name(&self) -> &str {
        &self.server_name
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn default_authority(&self) -> &str {
        &self.default_authority
    }

    fn admission(&self) -> MutexGuard<'_, Admission> {
        self.admission
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Number of connections currently being served.
    pub fn active_connections(&self) -> usize {
        self.admission().live.len()
    }

    /// Assigns a connection id, or 0 if the server is full.
    fn admit(&self) -> u64 {
        let mut admission = self.admission();
        if let Some(max) = self.max_connections {
            if admission.live.len() >= max {
                return 0;
            }
        }
        admission.next_id += 1;
        let id = admission.next_id;
        admission.live.insert(id);
        id
    }

    fn release(&self, id: u64) {
        self.admission().live.remove(&id);
    }

    /// Serves an accepted socket on a thread of its own.
    pub fn spawn_connection(self: &Arc<Self>, stream: TcpStream, peer: SocketAddr) -> io::Result<()> {
        let core = self.clone();
        thread::Builder::new()
            .name(format!("tandem-conn-{}", peer))
            .spawn(move || core.handle_connection(Box::new(stream)))?;
        Ok(())
    }

    /// Serves one connection on the calling thread until it closes.
    pub fn handle_connection(self: &Arc<Self>, stream: Box<dyn Transport>) {
        let id = self.admit();
        if id == 0 {
            self.refuse(stream);
            return;
        }
        info!(conn = id, peer = ?stream.peer_addr().ok(), "connection opened");
        match Connection::new(id, self.clone(), stream) {
            Ok(connection) => connection.run(),
            Err(err) => warn!(conn = id, error = %err, "could not start connection"),
        }
        self.release(id);
        debug!(conn = id, "connection closed");
    }

    fn refuse(&self, mut stream: Box<dyn Transport>) {
        warn!(peer = ?stream.peer_addr().ok(), "too many connections, refusing");
        if let Err(err) = socket::write_all(&mut *stream, SERVICE_UNAVAILABLE, self.timeouts.connection) {
            debug!(error = %err, "could not send 503");
        }
        SocketReader::new(stream).linger_close(self.timeouts.connection);
    }

    /// Starts the application for a request on a new thread.
    pub(crate) fn launch_app(self: &Arc<Self>, ctx: RequestContext, response: Arc<ServerResponse>) -> Result<()> {
        let core = self.clone();
        thread::Builder::new()
            .name("tandem-app".to_string())
            .spawn(move || app::serve(ctx, response, |ctx, responder| core.call_app(ctx, responder)))?;
        Ok(())
    }

    /// Routes a request to the application for its authority.
    fn call_app(&self, ctx: &mut RequestContext, responder: &Responder) -> anyhow::Result<Body> {
        let authority = ctx
            .host
            .clone()
            .unwrap_or_else(|| self.default_authority.clone());
        match self.authorities.get(&authority) {
            Some(Some(app)) => app.call(ctx, responder),
            Some(None) => {
                responder.start_response(&StatusCode::NOT_FOUND.to_string(), Vec::new())?;
                Ok(Body::Empty)
            }
            None => {
                debug!(authority = %authority, "unknown authority");
                responder.start_response(&StatusCode::BAD_REQUEST.to_string(), Vec::new())?;
                Ok(Body::Empty)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_authority_follows_port() {
        let cfg = Config {
            listen_addr: "0.0.0.0:80".to_string(),
            ..Config::default()
        };
        assert_eq!(ServerCore::new(&cfg, None).default_authority(), "localhost");

        let cfg = Config {
            listen_addr: "0.0.0.0:8081".to_string(),
            ..Config::default()
        };
        let core = ServerCore::new(&cfg, None);
        assert_eq!(core.default_authority(), "localhost:8081");
        assert_eq!(core.server_name(), "localhost");
        assert_eq!(core.port(), 8081);
    }

    #[test]
    fn admission_refuses_past_maximum() {
        let cfg = Config {
            max_connections: Some(2),
            ..Config::default()
        };
        let core = ServerCore::new(&cfg, None);
        let first = core.admit();
        let second = core.admit();
        assert!(first > 0 && second > first);
        assert_eq!(core.admit(), 0);
        assert_eq!(core.active_connections(), 2);

        core.release(first);
        assert!(core.admit() > second);
    }
}
