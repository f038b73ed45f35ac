#![allow(dead_code)]

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tandem::config::{Config, TimeoutConfig};
use tandem::server::core::ServerCore;

/// Short timeouts so failing paths finish quickly.
pub fn test_config() -> Config {
    Config {
        listen_addr: "127.0.0.1:0".to_string(),
        authorities: vec!["localhost".to_string()],
        timeouts: TimeoutConfig {
            idle_secs: 1.0,
            connection_secs: 2.0,
            app_secs: 2.0,
        },
        ..Config::default()
    }
}

/// Serves `core` on a loopback port from a plain accept thread.
pub fn start(core: ServerCore) -> SocketAddr {
    let core = Arc::new(core);
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    thread::spawn(move || {
        for stream in listener.incoming() {
            let Ok(stream) = stream else { continue };
            let peer = stream.peer_addr().unwrap();
            core.spawn_connection(stream, peer).unwrap();
        }
    });
    addr
}

pub fn connect(addr: SocketAddr) -> TcpStream {
    let stream = TcpStream::connect(addr).unwrap();
    stream
        .set_read_timeout(Some(Duration::from_secs(10)))
        .unwrap();
    stream
}

/// Sends raw request bytes and reads until the server closes.
pub fn exchange(addr: SocketAddr, request: &[u8]) -> String {
    let mut stream = connect(addr);
    stream.write_all(request).unwrap();
    read_to_close(&mut stream)
}

pub fn read_to_close(stream: &mut TcpStream) -> String {
    let mut buf = Vec::new();
    stream.read_to_end(&mut buf).unwrap();
    String::from_utf8_lossy(&buf).into_owned()
}

/// Reads until the data received so far ends with `suffix`.
pub fn read_until(stream: &mut TcpStream, suffix: &str) -> String {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 1024];
    while !buf.ends_with(suffix.as_bytes()) {
        let n = stream.read(&mut chunk).unwrap();
        assert!(n > 0, "connection closed early: {:?}", String::from_utf8_lossy(&buf));
        buf.extend_from_slice(&chunk[..n]);
    }
    String::from_utf8_lossy(&buf).into_owned()
}
