//! Minimal HTTP/1.1 framing for the daemon's listener.
//!
//! One request per connection: read the head, read `Content-Length` bytes of
//! body, write one JSON response, close. Anything fancier (keep-alive,
//! chunked bodies) is rejected up front.

use posture_daemon_protocol::{ErrorBody, MAX_REQUEST_BYTES};
use serde::Serialize;
use std::io::{ErrorKind, Read, Write};

use crate::error::HttpError;

const MAX_HEAD_BYTES: usize = 64 * 1024;
const READ_CHUNK_SIZE: usize = 8192;
const HEAD_TERMINATOR: &[u8] = b"\r\n\r\n";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequest {
    pub method: String,
    pub path: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl HttpRequest {
    /// Case-insensitive header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

pub fn read_request<R: Read>(stream: &mut R) -> Result<HttpRequest, HttpError> {
    let mut buffer = Vec::new();
    let mut chunk = [0u8; READ_CHUNK_SIZE];

    let head_end = loop {
        if let Some(index) = find_subslice(&buffer, HEAD_TERMINATOR) {
            break index;
        }
        if buffer.len() > MAX_HEAD_BYTES {
            return Err(HttpError::TooLarge);
        }
        let n = read_chunk(stream, &mut chunk)?;
        if n == 0 {
            if buffer.is_empty() {
                return Err(HttpError::Malformed("request was empty".to_string()));
            }
            return Err(HttpError::Malformed("connection closed mid-headers".to_string()));
        }
        buffer.extend_from_slice(&chunk[..n]);
    };

    let head = std::str::from_utf8(&buffer[..head_end])
        .map_err(|_| HttpError::Malformed("headers are not valid UTF-8".to_string()))?;
    let mut request = parse_head(head)?;

    if request
        .header("Transfer-Encoding")
        .is_some_and(|value| !value.eq_ignore_ascii_case("identity"))
    {
        return Err(HttpError::Malformed(
            "chunked request bodies are not supported".to_string(),
        ));
    }

    let content_length = match request.header("Content-Length") {
        Some(value) => value
            .trim()
            .parse::<usize>()
            .map_err(|_| HttpError::Malformed(format!("invalid Content-Length: {}", value)))?,
        None => 0,
    };
    if content_length > MAX_REQUEST_BYTES {
        return Err(HttpError::TooLarge);
    }

    let mut body = buffer.split_off(head_end + HEAD_TERMINATOR.len());
    while body.len() < content_length {
        let n = read_chunk(stream, &mut chunk)?;
        if n == 0 {
            return Err(HttpError::Malformed("request body was truncated".to_string()));
        }
        body.extend_from_slice(&chunk[..n]);
    }
    body.truncate(content_length);
    request.body = body;

    Ok(request)
}

fn read_chunk<R: Read>(stream: &mut R, chunk: &mut [u8]) -> Result<usize, HttpError> {
    loop {
        match stream.read(chunk) {
            Ok(n) => return Ok(n),
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) if matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                return Err(HttpError::Timeout)
            }
            Err(err) => return Err(HttpError::Io(err)),
        }
    }
}

fn parse_head(head: &str) -> Result<HttpRequest, HttpError> {
    let mut lines = head.split("\r\n");
    let request_line = lines
        .next()
        .filter(|line| !line.trim().is_empty())
        .ok_or_else(|| HttpError::Malformed("missing request line".to_string()))?;

    let mut parts = request_line.split_whitespace();
    let (method, target, version) = match (parts.next(), parts.next(), parts.next()) {
        (Some(method), Some(target), Some(version)) => (method, target, version),
        _ => {
            return Err(HttpError::Malformed(format!(
                "invalid request line: {}",
                request_line
            )))
        }
    };
    if !version.starts_with("HTTP/1.") {
        return Err(HttpError::Malformed(format!(
            "unsupported HTTP version: {}",
            version
        )));
    }

    // Query strings are accepted and ignored; no route takes parameters.
    let path = target
        .split_once('?')
        .map_or(target, |(path, _)| path)
        .to_string();

    let mut headers = Vec::new();
    for line in lines {
        if line.is_empty() {
            continue;
        }
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| HttpError::Malformed(format!("invalid header line: {}", line)))?;
        headers.push((name.trim().to_string(), value.trim().to_string()));
    }

    Ok(HttpRequest {
        method: method.to_ascii_uppercase(),
        path,
        headers,
        body: Vec::new(),
    })
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn json<T: Serialize>(status: u16, value: &T) -> Self {
        match serde_json::to_vec(value) {
            Ok(body) => Self { status, body },
            Err(err) => Self::error(500, format!("Failed to serialize response: {}", err)),
        }
    }

    pub fn error(status: u16, message: impl Into<String>) -> Self {
        let body = serde_json::to_vec(&ErrorBody::new(message))
            .unwrap_or_else(|_| br#"{"error":"internal error"}"#.to_vec());
        Self { status, body }
    }

    pub fn no_content() -> Self {
        Self {
            status: 204,
            body: Vec::new(),
        }
    }

    pub fn write_to<W: Write>(&self, stream: &mut W) -> std::io::Result<()> {
        let mut head = format!(
            "HTTP/1.1 {} {}\r\n\
             Content-Length: {}\r\n\
             Connection: close\r\n\
             Access-Control-Allow-Origin: *\r\n\
             Access-Control-Allow-Methods: GET, POST, OPTIONS\r\n\
             Access-Control-Allow-Headers: Content-Type, User-ID\r\n",
            self.status,
            reason_phrase(self.status),
            self.body.len()
        );
        if !self.body.is_empty() {
            head.push_str("Content-Type: application/json\r\n");
        }
        head.push_str("\r\n");

        stream.write_all(head.as_bytes())?;
        stream.write_all(&self.body)?;
        stream.flush()
    }
}

fn reason_phrase(status: u16) -> &'static str {
    match status {
        200 => "OK",
        204 => "No Content",
        400 => "Bad Request",
        404 => "Not Found",
        405 => "Method Not Allowed",
        408 => "Request Timeout",
        413 => "Payload Too Large",
        500 => "Internal Server Error",
        _ => "Unknown",
    }
}
