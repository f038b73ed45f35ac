use std::time::Duration;

use tandem::config::{Config, TimeoutConfig, Timeouts};
use tandem::http::message::HttpVersion;

#[test]
fn test_config_defaults() {
    let cfg = Config::default();
    assert_eq!(cfg.listen_addr, "127.0.0.1:8080");
    assert_eq!(cfg.max_connections, None);
    assert!(cfg.authorities.is_empty());
    assert_eq!(cfg.protocol, HttpVersion::HTTP_1_1);
    assert_eq!(cfg.timeouts(), Timeouts::default());
}

#[test]
fn test_config_from_yaml() {
    let cfg = Config::from_yaml(
        r#"
listen_addr: "0.0.0.0:9000"
max_connections: 20
authorities: ["WWW.Example.com", "example.com"]
protocol: "HTTP/1.0"
timeouts:
  idle_secs: 2
  connection_secs: 4.5
  app_secs: 30
"#,
    )
    .unwrap();

    assert_eq!(cfg.listen_addr, "0.0.0.0:9000");
    assert_eq!(cfg.max_connections, Some(20));
    assert_eq!(cfg.protocol, HttpVersion::HTTP_1_0);
    assert_eq!(cfg.port(), 9000);
    assert_eq!(cfg.default_authority(), "www.example.com");

    let timeouts = cfg.timeouts();
    assert_eq!(timeouts.idle, Duration::from_secs(2));
    assert_eq!(timeouts.connection, Duration::from_millis(4500));
    assert_eq!(timeouts.app, Duration::from_secs(30));
}

#[test]
fn test_config_partial_yaml_keeps_defaults() {
    let cfg = Config::from_yaml("protocol: \"1.0\"\ntimeouts:\n  app_secs: 1\n").unwrap();

    assert_eq!(cfg.listen_addr, "127.0.0.1:8080");
    assert_eq!(cfg.protocol, HttpVersion::HTTP_1_0);
    assert_eq!(cfg.timeouts.idle_secs, 5.0);
    assert_eq!(cfg.timeouts().app, Duration::from_secs(1));
}

#[test]
fn test_config_rejects_bad_protocol() {
    assert!(Config::from_yaml("protocol: \"1\"\n").is_err());
    assert!(Config::from_yaml("protocol: \"banana\"\n").is_err());
}

#[test]
fn test_default_authority_without_authorities() {
    let mut cfg = Config {
        listen_addr: "0.0.0.0:80".to_string(),
        ..Config::default()
    };
    assert_eq!(cfg.default_authority(), "localhost");

    cfg.listen_addr = "[::1]:8443".to_string();
    assert_eq!(cfg.port(), 8443);
    assert_eq!(cfg.default_authority(), "localhost:8443");

    cfg.listen_addr = "no-port".to_string();
    assert_eq!(cfg.port(), 80);
}

#[test]
fn test_unusable_timeouts_fall_back_to_defaults() {
    let timeouts: Timeouts = TimeoutConfig {
        idle_secs: 0.0,
        connection_secs: -3.0,
        app_secs: 0.25,
    }
    .into();

    assert_eq!(timeouts.idle, Duration::from_secs(5));
    assert_eq!(timeouts.connection, Duration::from_secs(10));
    assert_eq!(timeouts.app, Duration::from_millis(250));
}

#[test]
fn test_config_listen_address_from_env() {
    unsafe {
        std::env::remove_var("TANDEM_CONFIG");
        std::env::set_var("LISTEN", "0.0.0.0:3000");
    }
    let cfg = Config::load().unwrap();
    assert_eq!(cfg.listen_addr, "0.0.0.0:3000");
    assert_eq!(cfg.port(), 3000);
    unsafe {
        std::env::remove_var("LISTEN");
    }
}
