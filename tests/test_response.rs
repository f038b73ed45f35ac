use bytes::Bytes;
use tandem::config::Timeouts;
use tandem::http::message::{HttpVersion, RecvUnit};
use tandem::http::request::ServerRequest;
use tandem::http::response::{Framing, ServerResponse, StatusCode};

fn response_to(start: &str, block: &str, protocol: HttpVersion) -> ServerResponse {
    let mut request = ServerRequest::new(1, &Timeouts::default());
    request
        .recv(RecvUnit::Line(Bytes::copy_from_slice(start.as_bytes())))
        .unwrap();
    request
        .recv(RecvUnit::Headers(Bytes::copy_from_slice(block.as_bytes())))
        .unwrap();
    ServerResponse::new(request.info(), protocol, &Timeouts::default(), 1)
}

fn body(response: &ServerResponse) -> Vec<u8> {
    let mut out = Vec::new();
    loop {
        match response.send_body().unwrap() {
            Some(chunk) if chunk.is_empty() => return out,
            Some(chunk) => out.extend_from_slice(&chunk),
            None => panic!("body incomplete"),
        }
    }
}

#[test]
fn test_status_code_as_u16() {
    assert_eq!(StatusCode::CONTINUE.as_u16(), 100);
    assert_eq!(StatusCode::OK.as_u16(), 200);
    assert_eq!(StatusCode::BAD_REQUEST.as_u16(), 400);
    assert_eq!(StatusCode::NOT_IMPLEMENTED.as_u16(), 501);
    assert_eq!(StatusCode::SERVICE_UNAVAILABLE.as_u16(), 503);
}

#[test]
fn test_status_code_reason_phrase() {
    assert_eq!(StatusCode::OK.reason_phrase(), "OK");
    assert_eq!(StatusCode::NOT_MODIFIED.reason_phrase(), "Not Modified");
    assert_eq!(StatusCode(413).reason_phrase(), "Request Entity Too Large");
    assert_eq!(
        StatusCode::SERVICE_UNAVAILABLE.reason_phrase(),
        "Service Unavailable"
    );
    assert_eq!(StatusCode(299).reason_phrase(), "");
}

#[test]
fn test_status_code_display() {
    assert_eq!(StatusCode::CONTINUE.to_string(), "100 Continue");
    assert_eq!(
        StatusCode::INTERNAL_SERVER_ERROR.to_string(),
        "500 Internal Server Error"
    );
}

#[test]
fn test_statuses_without_body() {
    assert!(StatusCode::CONTINUE.forbids_body());
    assert!(StatusCode::NO_CONTENT.forbids_body());
    assert!(StatusCode::NOT_MODIFIED.forbids_body());
    assert!(!StatusCode::NOT_FOUND.forbids_body());
}

#[test]
fn test_custom_reason_phrase_is_kept() {
    let response = response_to("GET / HTTP/1.1\r\n", "\r\n", HttpVersion::HTTP_1_1);
    response
        .start_response("200 Everything Fine", Vec::new())
        .unwrap();
    response.start_sending().unwrap();

    assert_eq!(response.send_start(), "HTTP/1.1 200 Everything Fine\r\n");
}

#[test]
fn test_declared_content_length_is_honoured() {
    let response = response_to("GET / HTTP/1.1\r\n", "\r\n", HttpVersion::HTTP_1_1);
    response
        .start_response(
            "200 OK",
            vec![("Content-Length".to_string(), "4".to_string())],
        )
        .unwrap();
    response.write_body(Bytes::from("abcdef")).unwrap();
    response.finish_body();

    assert_eq!(response.framing(), Framing::Length(4));
    assert_eq!(body(&response), b"abcd");
}

#[test]
fn test_short_body_closes_connection() {
    let response = response_to("GET / HTTP/1.1\r\n", "\r\n", HttpVersion::HTTP_1_1);
    response
        .start_response(
            "200 OK",
            vec![("Content-Length".to_string(), "10".to_string())],
        )
        .unwrap();
    response.write_body(Bytes::from("abc")).unwrap();
    response.finish_body();

    assert_eq!(body(&response), b"abc");
    assert!(!response.keep_alive());
}

#[test]
fn test_close_request_gets_close_response() {
    let response = response_to(
        "GET / HTTP/1.1\r\n",
        "Connection: close\r\n\r\n",
        HttpVersion::HTTP_1_1,
    );
    response.start_response("200 OK", Vec::new()).unwrap();
    response.set_body_len(0);
    response.start_sending().unwrap();

    assert!(!response.keep_alive());
    assert_eq!(
        response.send_header(),
        "Content-Length: 0\r\nConnection: close\r\n\r\n"
    );
}

#[test]
fn test_http10_server_never_chunks() {
    let response = response_to("GET / HTTP/1.1\r\n", "\r\n", HttpVersion::HTTP_1_0);
    response.start_response("200 OK", Vec::new()).unwrap();
    response.write_body(Bytes::from("data")).unwrap();
    response.finish_body();

    assert_eq!(response.send_start(), "HTTP/1.0 200 OK\r\n");
    assert_eq!(response.framing(), Framing::UntilClose);
    assert!(!response.keep_alive());
    assert_eq!(body(&response), b"data");
}
