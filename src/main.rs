use std::sync::Arc;

use tandem::app::{Body, app_fn};
use tandem::config::Config;
use tandem::server::{self, core::ServerCore};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_level(true)
        .init();

    let cfg = Config::load()?;

    let hello = app_fn(|ctx, responder| {
        responder.start_response(
            "200 OK",
            vec![("Content-Type".to_string(), "text/plain".to_string())],
        )?;
        Ok(Body::from(format!("Hello from tandem: {} {}\n", ctx.method, ctx.path)))
    });
    let core = Arc::new(ServerCore::new(&cfg, Some(hello)));

    tokio::select! {
        res = server::listener::run(core, &cfg.listen_addr) => {
            res?;
        }

        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Shutdown signal received");
        }
    }

    Ok(())
}
