//! The slice of HTTP/1.0 this server speaks.
//!
//! Requests are recognised by their first line only,
//! `GET /<path>[?<query>] HTTP/1.<minor>`; everything else is ignored.
//! Responses always carry exactly two headers, `Content-length` and
//! `Content-Type: text/html`.

use std::io::{self, Write};

/// Served when the request path is empty.
pub const DEFAULT_RESOURCE: &str = "index.html";

/// Returns `true` once `buffer` holds a terminated request line. Headers
/// that follow it are never looked at.
pub fn is_complete(buffer: &[u8]) -> bool {
    buffer.contains(&b'\n')
}

/// Extracts the requested resource from the first line of `request`.
///
/// The query string is dropped and an empty path maps to
/// [`DEFAULT_RESOURCE`]. Returns `None` if the line does not have the
/// expected shape.
pub fn resource_path(request: &[u8]) -> Option<&str> {
    let line = match request.iter().position(|&b| b == b'\n') {
        Some(end) => &request[..end],
        None => request,
    };
    let line = line.strip_suffix(b"\r").unwrap_or(line);
    let line = std::str::from_utf8(line).ok()?;

    let target = line.strip_prefix("GET /")?;
    let (path, version) = target.split_once(" HTTP/1.")?;
    if version.is_empty() || !version.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }

    let path = match path.split_once('?') {
        Some((path, _query)) => path,
        None => path,
    };

    if path.is_empty() {
        Some(DEFAULT_RESOURCE)
    } else {
        Some(path)
    }
}

/// A response the server can send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    /// `200 OK` with the raw file contents as the body.
    Found(Vec<u8>),
    /// `404 NOT FOUND` with an empty body.
    NotFound,
    /// `400 BAD REQUEST` with an empty body, sent when a request grows past
    /// the configured size limit.
    BadRequest,
}

impl Response {
    pub fn status(&self) -> u16 {
        match self {
            Response::Found(_) => 200,
            Response::NotFound => 404,
            Response::BadRequest => 400,
        }
    }

    fn status_line(&self) -> &'static str {
        match self {
            Response::Found(_) => "HTTP/1.0 200 OK",
            Response::NotFound => "HTTP/1.0 404 NOT FOUND",
            Response::BadRequest => "HTTP/1.0 400 BAD REQUEST",
        }
    }

    pub fn body(&self) -> &[u8] {
        match self {
            Response::Found(body) => body,
            Response::NotFound | Response::BadRequest => &[],
        }
    }

    /// The status line and headers, including the blank line that ends them.
    pub fn head(&self) -> String {
        format!(
            "{}\r\nContent-length: {}\r\nContent-Type: text/html\r\n\r\n",
            self.status_line(),
            self.body().len()
        )
    }

    #[cfg(test)]
    pub fn to_bytes(&self) -> Vec<u8> {
        let head = self.head();
        let mut bytes = Vec::with_capacity(head.len() + self.body().len());
        bytes.extend_from_slice(head.as_bytes());
        bytes.extend_from_slice(self.body());
        bytes
    }

    /// Writes the whole response, head first.
    pub fn write_to<W: Write>(&self, mut writer: W) -> io::Result<()> {
        writer.write_all(self.head().as_bytes())?;
        writer.write_all(self.body())?;
        writer.flush()
    }
}
