//! HTTP/1.1 pipeline
//!
//! Reads the synthetic HTTP/1.1 request the session serialized onto the
//! stream's input, hands it to a handler and writes the handler's reply
//! back through the task output. Malformed requests get a 400 (or 431 for an
//! oversized head) instead of failing the task.

use crate::error::{TaskError, TaskResult};
use crate::pipeline::RequestPipeline;
use crate::protocol::{Headers, ResponseHead};
use crate::task::{RequestContext, TaskInput, TaskOutput};
use bytes::Bytes;
use once_cell::sync::Lazy;
use regex::Regex;
use std::io::{BufRead, BufReader, Read};
use tracing::{debug, warn};

const MAX_HEAD_BYTES: usize = 64 * 1024;
const BODY_SLICE: usize = 16 * 1024;

static REQUEST_LINE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^([A-Z]+) (\S+) (HTTP/1\.[01])$").expect("request line pattern is valid")
});

/// A parsed HTTP/1.1 request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Http1Request {
    pub method: String,
    pub path: String,
    pub version: String,
    pub headers: Headers,
    pub body: Bytes,
}

/// What a handler answers with
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Http1Reply {
    pub status: u16,
    pub headers: Headers,
    pub body: Bytes,
}

impl Http1Reply {
    pub fn new(status: u16) -> Self {
        Self {
            status,
            headers: Headers::new(),
            body: Bytes::new(),
        }
    }

    pub fn text(status: u16, body: impl Into<String>) -> Self {
        Self::new(status)
            .with_header("content-type", "text/plain")
            .with_body(body.into())
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.append(name, value);
        self
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }
}

enum Parsed {
    Request(Http1Request),
    Rejected(Http1Reply),
}

type Handler = dyn Fn(&Http1Request, &RequestContext) -> Http1Reply + Send + Sync;

pub struct Http1Pipeline {
    handler: Box<Handler>,
}

impl Http1Pipeline {
    pub fn new<H>(handler: H) -> Self
    where
        H: Fn(&Http1Request, &RequestContext) -> Http1Reply + Send + Sync + 'static,
    {
        Self {
            handler: Box::new(handler),
        }
    }

    /// Echoes method, path and body back as plain text
    pub fn echo() -> Self {
        Self::new(|request, _context| {
            let mut text = format!("{} {}\n", request.method, request.path);
            text.push_str(&String::from_utf8_lossy(&request.body));
            Http1Reply::text(200, text)
        })
    }

    fn read_request(&self, input: &mut TaskInput) -> TaskResult<Parsed> {
        let stream_id = input.stream_id();
        let mut reader = BufReader::new(input);

        let mut head_bytes = 0usize;
        let mut line = String::new();
        let request_line = match read_line(&mut reader, &mut line, MAX_HEAD_BYTES, stream_id)? {
            HeadLine::Line(n) => {
                head_bytes += n;
                line.trim_end().to_string()
            }
            HeadLine::TooLong => return Ok(Parsed::Rejected(head_too_large())),
            HeadLine::Eof => return Ok(Parsed::Rejected(Http1Reply::text(400, "empty request"))),
        };
        let Some(captures) = REQUEST_LINE.captures(&request_line) else {
            debug!(stream_id, line = %request_line, "Malformed request line");
            return Ok(Parsed::Rejected(Http1Reply::text(400, "malformed request line")));
        };
        let method = captures[1].to_string();
        let path = captures[2].to_string();
        let version = captures[3].to_string();

        let mut headers = Headers::new();
        loop {
            line.clear();
            match read_line(&mut reader, &mut line, MAX_HEAD_BYTES - head_bytes, stream_id)? {
                HeadLine::Line(n) => head_bytes += n,
                HeadLine::TooLong => return Ok(Parsed::Rejected(head_too_large())),
                HeadLine::Eof => {
                    return Ok(Parsed::Rejected(Http1Reply::text(400, "truncated header block")))
                }
            }
            let field = line.trim_end();
            if field.is_empty() {
                break;
            }
            match field.split_once(':') {
                Some((name, value)) if !name.trim().is_empty() => {
                    headers.append(name.trim(), value.trim());
                }
                _ => return Ok(Parsed::Rejected(Http1Reply::text(400, "malformed header field"))),
            }
        }

        let body = match headers.get("content-length") {
            Some(value) => {
                let Ok(len) = value.parse::<u64>() else {
                    return Ok(Parsed::Rejected(Http1Reply::text(400, "bad content-length")));
                };
                let mut body = Vec::new();
                reader
                    .by_ref()
                    .take(len)
                    .read_to_end(&mut body)
                    .map_err(|e| TaskError::from_io(stream_id, e))?;
                body
            }
            None => {
                let mut body = Vec::new();
                reader
                    .read_to_end(&mut body)
                    .map_err(|e| TaskError::from_io(stream_id, e))?;
                body
            }
        };

        Ok(Parsed::Request(Http1Request {
            method,
            path,
            version,
            headers,
            body: Bytes::from(body),
        }))
    }

    fn write_reply(output: &mut TaskOutput, reply: Http1Reply) -> TaskResult<()> {
        let mut head = ResponseHead::new(reply.status);
        for (name, value) in reply.headers.iter() {
            head.headers.append(name, value);
        }
        if !head.headers.contains("content-length") {
            head.headers
                .append("content-length", reply.body.len().to_string());
        }

        output.set_response(head)?;
        let mut body = reply.body;
        while !body.is_empty() {
            let slice = body.split_to(BODY_SLICE.min(body.len()));
            output.write(slice)?;
        }
        output.close(None)
    }
}

enum HeadLine {
    Line(usize),
    Eof,
    TooLong,
}

fn head_too_large() -> Http1Reply {
    Http1Reply::text(431, "request head too large")
}

/// Read one head line, buffering at most `limit` bytes of it
fn read_line<R: BufRead>(
    reader: &mut R,
    line: &mut String,
    limit: usize,
    stream_id: crate::protocol::StreamId,
) -> TaskResult<HeadLine> {
    if limit == 0 {
        return Ok(HeadLine::TooLong);
    }
    match reader.by_ref().take(limit as u64).read_line(line) {
        Ok(0) => Ok(HeadLine::Eof),
        Ok(n) if n >= limit && !line.ends_with('\n') => Ok(HeadLine::TooLong),
        Ok(n) => Ok(HeadLine::Line(n)),
        Err(e) if e.kind() == std::io::ErrorKind::InvalidData => {
            Err(TaskError::pipeline(stream_id, "request head is not valid UTF-8"))
        }
        Err(e) => Err(TaskError::from_io(stream_id, e)),
    }
}

impl RequestPipeline for Http1Pipeline {
    fn name(&self) -> &str {
        "http1"
    }

    fn process(
        &self,
        context: &mut RequestContext,
        input: &mut TaskInput,
        output: &mut TaskOutput,
    ) -> TaskResult<()> {
        let reply = match self.read_request(input)? {
            Parsed::Request(request) => {
                context.set_note("request_line", format!("{} {}", request.method, request.path));
                debug!(
                    stream_id = context.stream_id(),
                    method = %request.method,
                    path = %request.path,
                    body_len = request.body.len(),
                    "Request parsed"
                );
                (self.handler)(&request, context)
            }
            Parsed::Rejected(reply) => {
                warn!(
                    stream_id = context.stream_id(),
                    status = reply.status,
                    "Rejecting malformed request"
                );
                reply
            }
        };
        Self::write_reply(output, reply)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_request_line_pattern() {
        let captures = REQUEST_LINE.captures("POST /upload HTTP/1.1").unwrap();
        assert_eq!(&captures[1], "POST");
        assert_eq!(&captures[2], "/upload");
        assert_eq!(&captures[3], "HTTP/1.1");

        assert!(REQUEST_LINE.captures("GET /x").is_none());
        assert!(REQUEST_LINE.captures("get /x HTTP/1.1").is_none());
        assert!(REQUEST_LINE.captures("GET /x HTTP/2").is_none());
    }

    #[test]
    fn test_head_line_buffering_is_bounded() {
        let mut reader = Cursor::new(vec![b'a'; 2 * 1024 * 1024]);
        let mut line = String::new();

        let result = read_line(&mut reader, &mut line, 1024, 1).unwrap();
        assert!(matches!(result, HeadLine::TooLong));
        assert_eq!(line.len(), 1024);
        assert_eq!(reader.position(), 1024);
    }

    #[test]
    fn test_head_line_within_limit() {
        let mut reader = Cursor::new(b"Host: a\r\n\r\n".to_vec());
        let mut line = String::new();

        assert!(matches!(
            read_line(&mut reader, &mut line, 64, 1).unwrap(),
            HeadLine::Line(9)
        ));
        assert_eq!(line, "Host: a\r\n");

        // A line exactly filling the limit still counts as a line
        line.clear();
        assert!(matches!(
            read_line(&mut reader, &mut line, 2, 1).unwrap(),
            HeadLine::Line(2)
        ));
        line.clear();
        assert!(matches!(
            read_line(&mut reader, &mut line, 0, 1).unwrap(),
            HeadLine::TooLong
        ));
        assert!(matches!(
            read_line(&mut reader, &mut line, 8, 1).unwrap(),
            HeadLine::Eof
        ));
    }

    #[test]
    fn test_reply_builders() {
        let reply = Http1Reply::text(404, "missing");
        assert_eq!(reply.status, 404);
        assert_eq!(reply.headers.get("Content-Type"), Some("text/plain"));
        assert_eq!(&reply.body[..], b"missing");

        let reply = Http1Reply::new(204).with_header("x-trace", "1");
        assert!(reply.body.is_empty());
        assert!(reply.headers.contains("x-trace"));
    }
}
