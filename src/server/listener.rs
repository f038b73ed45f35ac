use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::{debug, info, warn};

use crate::server::core::ServerCore;

pub async fn run(core: Arc<ServerCore>, listen_addr: &str) -> anyhow::Result<()> {
    let listener = TcpListener::bind(listen_addr).await?;
    info!("Listening on {}", listen_addr);
    serve(core, listener).await
}

/// Accepts connections forever, serving each on its own OS thread.
pub async fn serve(core: Arc<ServerCore>, listener: TcpListener) -> anyhow::Result<()> {
    loop {
        let (socket, peer) = listener.accept().await?;
        debug!("Accepted connection from {}", peer);

        // connections use blocking I/O with per-call timeouts
        let stream = socket.into_std()?;
        stream.set_nonblocking(false)?;
        if let Err(e) = core.spawn_connection(stream, peer) {
            warn!(peer = %peer, error = %e, "could not start connection thread");
        }
    }
}
