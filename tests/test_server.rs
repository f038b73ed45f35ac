mod common;

use std::io::Write;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tandem::app::{Application, Body, app_fn};
use tandem::server::core::ServerCore;
use tandem::server::listener;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use common::{connect, exchange, read_until, start, test_config};

fn named_app(name: &'static str) -> Arc<dyn Application> {
    app_fn(move |_ctx, responder| {
        responder.start_response("200 OK", Vec::new())?;
        Ok(Body::from(name))
    })
}

fn virtual_hosts() -> std::net::SocketAddr {
    let core = ServerCore::new(&test_config(), Some(named_app("default")))
        .with_authority("example.com", Some(named_app("example")))
        .with_authority("empty.test", None);
    start(core)
}

#[test]
fn test_connection_past_maximum_gets_503() {
    let mut cfg = test_config();
    cfg.max_connections = Some(1);
    let addr = start(ServerCore::new(&cfg, Some(named_app("default"))));

    let mut first = connect(addr);
    first
        .write_all(b"GET / HTTP/1.1\r\nHost: localhost\r\n\r\n")
        .unwrap();
    let response = read_until(&mut first, "default");
    assert!(response.starts_with("HTTP/1.1 200 OK\r\n"));

    let refused = exchange(addr, b"");
    assert_eq!(
        refused,
        "HTTP/1.1 503 Service Unavailable\r\nConnection: close\r\n\r\n"
    );

    // once the first client leaves its slot is free again
    drop(first);
    let mut admitted = false;
    for _ in 0..50 {
        let response = exchange(
            addr,
            b"GET / HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n",
        );
        if response.starts_with("HTTP/1.1 200 OK\r\n") {
            admitted = true;
            break;
        }
        thread::sleep(Duration::from_millis(50));
    }
    assert!(admitted, "slot was never released");
}

#[test]
fn test_host_header_selects_application() {
    let addr = virtual_hosts();
    let response = exchange(
        addr,
        b"GET / HTTP/1.1\r\nHost: EXAMPLE.com\r\nConnection: close\r\n\r\n",
    );

    assert!(response.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(response.ends_with("\r\n\r\nexample"));
}

#[test]
fn test_authority_without_application_gets_404() {
    let addr = virtual_hosts();
    let response = exchange(
        addr,
        b"GET / HTTP/1.1\r\nHost: empty.test\r\nConnection: close\r\n\r\n",
    );

    assert!(response.starts_with("HTTP/1.1 404 Not Found\r\n"));
}

#[test]
fn test_unknown_authority_gets_400() {
    let addr = virtual_hosts();
    let response = exchange(
        addr,
        b"GET / HTTP/1.1\r\nHost: unknown.test\r\nConnection: close\r\n\r\n",
    );

    assert!(response.starts_with("HTTP/1.1 400 Bad Request\r\n"));
}

#[test]
fn test_absolute_target_overrides_host_header() {
    let addr = virtual_hosts();
    let response = exchange(
        addr,
        b"GET http://example.com/page HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n",
    );

    assert!(response.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(response.ends_with("\r\n\r\nexample"));
}

#[test]
fn test_missing_host_uses_default_authority() {
    let addr = virtual_hosts();
    let response = exchange(addr, b"GET / HTTP/1.0\r\n\r\n");

    assert!(response.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(response.ends_with("\r\n\r\ndefault"));
}

#[tokio::test]
async fn test_listener_serves_accepted_connections() {
    let core = Arc::new(ServerCore::new(&test_config(), Some(named_app("default"))));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(listener::serve(core, listener));

    let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
    stream
        .write_all(b"GET / HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
        .await
        .unwrap();
    let mut buf = Vec::new();
    tokio::time::timeout(Duration::from_secs(10), stream.read_to_end(&mut buf))
        .await
        .unwrap()
        .unwrap();

    let response = String::from_utf8_lossy(&buf);
    assert!(response.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(response.ends_with("default"));
}
