use std::fmt::{Display, Formatter};

use crate::error::Error;
use crate::http::message::{Headers, HttpVersion};

/// Most headers accepted in one header block or trailer.
pub const MAX_HEADERS: usize = 100;

#[derive(Debug, PartialEq, Eq)]
pub enum ParseError {
    InvalidRequest,
    InvalidMethod,
    InvalidVersion,
    InvalidHeader,
    TooManyHeaders,
    InvalidContentLength,
    InvalidChunk,
    UnsupportedCoding(String),
    NotChunked,
}

impl Display for ParseError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidRequest => write!(f, "badly formed request line"),
            Self::InvalidMethod => write!(f, "invalid method"),
            Self::InvalidVersion => write!(f, "invalid HTTP version"),
            Self::InvalidHeader => write!(f, "badly formed header line"),
            Self::TooManyHeaders => write!(f, "too many headers"),
            Self::InvalidContentLength => write!(f, "invalid Content-Length"),
            Self::InvalidChunk => write!(f, "invalid chunk size line"),
            Self::UnsupportedCoding(coding) => {
                write!(f, "unsupported transfer encoding {}", coding)
            }
            Self::NotChunked => write!(f, "transfer encoding must end with chunked"),
        }
    }
}

impl std::error::Error for ParseError {}

impl From<ParseError> for Error {
    fn from(err: ParseError) -> Self {
        match err {
            ParseError::UnsupportedCoding(_) => Error::Unimplemented(err.to_string()),
            other => Error::Protocol(other.to_string()),
        }
    }
}

/// The parts of a request line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestLine {
    pub method: String,
    pub target: String,
    pub version: HttpVersion,
}

/// How the body of a request is delimited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyLength {
    /// The request has no body.
    Empty,
    Length(u64),
    Chunked,
}

fn trim_crlf(line: &[u8]) -> &[u8] {
    line.strip_suffix(b"\r\n")
        .or_else(|| line.strip_suffix(b"\n"))
        .unwrap_or(line)
}

fn is_token(s: &str) -> bool {
    !s.is_empty()
        && s.bytes().all(|b| {
            b.is_ascii_alphanumeric() || b"!#$%&'*+-.^_`|~".contains(&b)
        })
}

/// Parses `METHOD target HTTP/x.y`, with or without the trailing CRLF.
pub fn parse_request_line(line: &[u8]) -> Result<RequestLine, ParseError> {
    let line = std::str::from_utf8(trim_crlf(line)).map_err(|_| ParseError::InvalidRequest)?;
    let parts: Vec<&str> = line.split_whitespace().collect();
    if parts.len() != 3 {
        return Err(ParseError::InvalidRequest);
    }

    let method = parts[0].to_ascii_uppercase();
    if !is_token(&method) {
        return Err(ParseError::InvalidMethod);
    }
    let version = HttpVersion::parse(parts[2]).ok_or(ParseError::InvalidVersion)?;

    Ok(RequestLine {
        method,
        target: parts[1].to_string(),
        version,
    })
}

/// Parses a header block (ending in a blank line) into `headers`.
pub fn parse_header_block(block: &[u8], headers: &mut Headers) -> Result<(), ParseError> {
    let mut parsed = [httparse::EMPTY_HEADER; MAX_HEADERS];
    match httparse::parse_headers(block, &mut parsed) {
        Ok(httparse::Status::Complete((_, found))) => {
            for header in found {
                headers.append(header.name, String::from_utf8_lossy(header.value).trim());
            }
            Ok(())
        }
        Ok(httparse::Status::Partial) => Err(ParseError::InvalidHeader),
        Err(httparse::Error::TooManyHeaders) => Err(ParseError::TooManyHeaders),
        Err(_) => Err(ParseError::InvalidHeader),
    }
}

/// Parses a chunk-size line, ignoring chunk extensions.
pub fn parse_chunk_size(line: &[u8]) -> Result<u64, ParseError> {
    match httparse::parse_chunk_size(line) {
        Ok(httparse::Status::Complete((_, size))) => Ok(size),
        _ => Err(ParseError::InvalidChunk),
    }
}

pub fn parse_content_length(value: &str) -> Result<u64, ParseError> {
    value
        .trim()
        .parse::<u64>()
        .map_err(|_| ParseError::InvalidContentLength)
}

/// Works out how a request body is delimited.
///
/// A transfer coding other than `identity` wins over Content-Length and
/// must end in `chunked`. Without either header a request has no body.
pub fn request_body_length(headers: &Headers) -> Result<BodyLength, ParseError> {
    let codings = headers.tokens("Transfer-Encoding");
    if codings.iter().any(|coding| coding != "identity") {
        for coding in &codings {
            if coding != "identity" && coding != "chunked" {
                return Err(ParseError::UnsupportedCoding(coding.clone()));
            }
        }
        return match codings.last().map(String::as_str) {
            Some("chunked") => Ok(BodyLength::Chunked),
            _ => Err(ParseError::NotChunked),
        };
    }

    match headers.get("Content-Length") {
        Some(value) => match parse_content_length(value)? {
            0 => Ok(BodyLength::Empty),
            length => Ok(BodyLength::Length(length)),
        },
        None => Ok(BodyLength::Empty),
    }
}
