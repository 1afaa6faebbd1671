//! Request/response metadata and queue entries
//!
//! The session converts a stream's request head into HTTP/1.1 request text so
//! the processing pipeline can read an ordinary request, and receives the
//! response back as metadata followed by body chunks.

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Stream identifier, unique within one session while its task lives
pub type StreamId = u32;

/// Ordered header list; names compare case-insensitively
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Headers(Vec<(String, String)>);

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a header, keeping any existing entries with the same name
    pub fn append(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.0.push((name.into(), value.into()));
    }

    /// First value for `name`
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Headers {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(
            iter.into_iter()
                .map(|(n, v)| (n.into(), v.into()))
                .collect(),
        )
    }
}

/// Request metadata of one multiplexed stream
///
/// # Examples
/// ```
/// use streamtask::protocol::RequestHead;
///
/// let head = RequestHead::new("GET", "/x").with_authority("example.org");
/// assert_eq!(
///     &head.to_http1().unwrap()[..],
///     b"GET /x HTTP/1.1\r\nHost: example.org\r\n\r\n"
/// );
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestHead {
    pub method: String,
    pub path: String,
    pub authority: Option<String>,
    #[serde(default)]
    pub headers: Headers,
}

impl RequestHead {
    pub fn new(method: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            path: path.into(),
            authority: None,
            headers: Headers::new(),
        }
    }

    pub fn with_authority(mut self, authority: impl Into<String>) -> Self {
        self.authority = Some(authority.into());
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.append(name, value);
        self
    }

    /// Serialize as an HTTP/1.1 request head, terminated by the empty line.
    ///
    /// The authority becomes the `Host` header unless one is already present.
    /// Fields that would change the framing of the request text (line breaks
    /// or NUL anywhere, a method or header name that is not a token) are
    /// rejected.
    pub fn to_http1(&self) -> Result<Bytes, InvalidRequestHead> {
        self.check()?;

        let mut buf = BytesMut::with_capacity(64 + self.path.len());
        buf.put_slice(self.method.as_bytes());
        buf.put_u8(b' ');
        buf.put_slice(self.path.as_bytes());
        buf.put_slice(b" HTTP/1.1\r\n");

        if let Some(authority) = &self.authority {
            if !self.headers.contains("host") {
                buf.put_slice(b"Host: ");
                buf.put_slice(authority.as_bytes());
                buf.put_slice(b"\r\n");
            }
        }
        for (name, value) in self.headers.iter() {
            buf.put_slice(name.as_bytes());
            buf.put_slice(b": ");
            buf.put_slice(value.as_bytes());
            buf.put_slice(b"\r\n");
        }
        buf.put_slice(b"\r\n");
        Ok(buf.freeze())
    }

    fn check(&self) -> Result<(), InvalidRequestHead> {
        if !is_token(&self.method) {
            return Err(InvalidRequestHead::Method(self.method.clone()));
        }
        if self.path.is_empty() || has_line_break(&self.path) {
            return Err(InvalidRequestHead::Path(self.path.clone()));
        }
        if let Some(authority) = &self.authority {
            if has_line_break(authority) {
                return Err(InvalidRequestHead::HeaderValue("host".to_string()));
            }
        }
        for (name, value) in self.headers.iter() {
            if !is_token(name) {
                return Err(InvalidRequestHead::HeaderName(name.to_string()));
            }
            if has_line_break(value) {
                return Err(InvalidRequestHead::HeaderValue(name.to_string()));
            }
        }
        Ok(())
    }
}

/// A request head that cannot be written as HTTP/1.1 text unchanged
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InvalidRequestHead {
    #[error("invalid method {0:?}")]
    Method(String),
    #[error("invalid path {0:?}")]
    Path(String),
    #[error("invalid header name {0:?}")]
    HeaderName(String),
    #[error("invalid value for header {0:?}")]
    HeaderValue(String),
}

fn has_line_break(s: &str) -> bool {
    s.bytes().any(|b| matches!(b, b'\r' | b'\n' | 0))
}

/// RFC 9110 token
fn is_token(s: &str) -> bool {
    !s.is_empty()
        && s.bytes().all(|b| {
            b.is_ascii_alphanumeric()
                || matches!(
                    b,
                    b'!' | b'#'
                        | b'$'
                        | b'%'
                        | b'&'
                        | b'\''
                        | b'*'
                        | b'+'
                        | b'-'
                        | b'.'
                        | b'^'
                        | b'_'
                        | b'`'
                        | b'|'
                        | b'~'
                )
        })
}

/// Response metadata, produced at most once per task
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseHead {
    pub status: u16,
    #[serde(default)]
    pub headers: Headers,
}

impl ResponseHead {
    pub fn new(status: u16) -> Self {
        Self {
            status,
            headers: Headers::new(),
        }
    }

    pub fn ok() -> Self {
        Self::new(200)
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.append(name, value);
        self
    }
}

/// Entry on a stream's inbound queue (session -> task)
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundItem {
    Data(Bytes),
    /// No more input for this stream
    End,
}

/// Entry on a stream's outbound queue (task -> session)
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundItem {
    Response(ResponseHead),
    Data(Bytes),
    /// Normal end of the response, with optional trailers
    End { trailers: Option<Headers> },
    /// The task ended without completing its response
    Reset { reason: String },
}

impl OutboundItem {
    /// True for entries after which nothing else is queued for the stream
    pub fn is_terminal(&self) -> bool {
        matches!(self, OutboundItem::End { .. } | OutboundItem::Reset { .. })
    }
}
