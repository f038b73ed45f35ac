//! Types shared by incoming requests and outgoing responses.

use std::fmt::{Display, Formatter};

use bytes::Bytes;
use serde::Deserialize;

/// An HTTP protocol version such as `HTTP/1.1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize)]
#[serde(try_from = "String")]
pub struct HttpVersion {
    pub major: u8,
    pub minor: u8,
}

impl HttpVersion {
    pub const HTTP_1_0: HttpVersion = HttpVersion { major: 1, minor: 0 };
    pub const HTTP_1_1: HttpVersion = HttpVersion { major: 1, minor: 1 };

    /// Parses the wire form, e.g. `HTTP/1.0`.
    ///
    /// # Example
    ///
    /// ```
    /// # use tandem::http::message::HttpVersion;
    /// assert_eq!(HttpVersion::parse("HTTP/1.0"), Some(HttpVersion::HTTP_1_0));
    /// assert_eq!(HttpVersion::parse("HTTP/one"), None);
    /// ```
    pub fn parse(s: &str) -> Option<Self> {
        Self::parse_number(s.strip_prefix("HTTP/")?)
    }

    fn parse_number(s: &str) -> Option<Self> {
        let (major, minor) = s.split_once('.')?;
        Some(Self {
            major: major.parse().ok()?,
            minor: minor.parse().ok()?,
        })
    }

    /// True for HTTP/1.0 and earlier: no chunked coding, no persistence.
    pub fn is_legacy(&self) -> bool {
        *self <= Self::HTTP_1_0
    }
}

impl Default for HttpVersion {
    fn default() -> Self {
        Self::HTTP_1_1
    }
}

impl Display for HttpVersion {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "HTTP/{}.{}", self.major, self.minor)
    }
}

impl TryFrom<String> for HttpVersion {
    type Error = String;

    /// Accepts `1.1` as well as `HTTP/1.1`.
    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::parse(&s)
            .or_else(|| Self::parse_number(&s))
            .ok_or_else(|| format!("invalid HTTP version: {}", s))
    }
}

/// Message headers in arrival order.
///
/// Names compare case-insensitively. Repeated headers are folded into one
/// comma-separated value, keeping the case of the first occurrence.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers {
    entries: Vec<(String, String)>,
}

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    fn position(&self, name: &str) -> Option<usize> {
        self.entries
            .iter()
            .position(|(key, _)| key.eq_ignore_ascii_case(name))
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.position(name).map(|i| self.entries[i].1.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.position(name).is_some()
    }

    /// Replaces any existing value.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        match self.position(&name) {
            Some(i) => self.entries[i].1 = value,
            None => self.entries.push((name, value)),
        }
    }

    /// Adds a value, folding it into an existing header of the same name.
    pub fn append(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        match self.position(&name) {
            Some(i) => {
                let existing = &mut self.entries[i].1;
                existing.push_str(", ");
                existing.push_str(&value);
            }
            None => self.entries.push((name, value)),
        }
    }

    pub fn remove(&mut self, name: &str) -> Option<String> {
        self.position(name).map(|i| self.entries.remove(i).1)
    }

    /// The comma-separated tokens of a list header, trimmed and lowercased.
    pub fn tokens(&self, name: &str) -> Vec<String> {
        self.get(name)
            .map(|value| {
                value
                    .split(',')
                    .map(|token| token.trim().to_ascii_lowercase())
                    .filter(|token| !token.is_empty())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// True if the list header `name` contains `token` (case-insensitive).
    pub fn has_token(&self, name: &str, token: &str) -> bool {
        self.tokens(name)
            .iter()
            .any(|t| t.eq_ignore_ascii_case(token))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries
            .iter()
            .map(|(name, value)| (name.as_str(), value.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// What an incoming message needs next from the socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecvMode {
    /// A block of header lines ending with a blank line.
    Headers,
    /// A single CRLF-terminated line.
    Line,
    /// Up to this many body bytes.
    Exact(u64),
    /// Body bytes until the peer closes the connection.
    ///
    /// Requests never ask for this; it is for messages whose length is
    /// only known when the connection closes.
    All,
    /// No input; the message is write-blocked, or holds body data the
    /// application has yet to read.
    Wait,
    /// The message is complete.
    Done,
}

/// One unit of input for [`RecvMode`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecvUnit {
    /// A header block including the terminating blank line.
    Headers(Bytes),
    /// One line including its CRLF.
    Line(Bytes),
    /// Body data; empty only at end of stream in [`RecvMode::All`].
    Data(Bytes),
    /// Given in [`RecvMode::Wait`].
    Nothing,
}
