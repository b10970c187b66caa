//! Server IPC – raw HTTP/1.1 client
//! ================================
//!
//! A tiny hand-rolled HTTP client that talks over any [`ControlAddr`]
//! transport. It exists because test traffic needs things a real client
//! refuses to do:
//!
//! * send **malformed or partial** byte sequences verbatim,
//! * keep the connection open after a first exchange (`start`) and send the
//!   rest of a request later on the same socket,
//! * skip reading altogether (`send_only`),
//! * enforce a **per-call read deadline** through the blocking socket.
//!
//! There is no retry: a read that times out or hits a reset returns whatever
//! arrived as a partial [`HttpResponse`] (`complete == false`).

use std::{
    borrow::Cow,
    io::{self, Read, Write},
    net::{Ipv4Addr, SocketAddr},
    time::Duration,
};

use bon::Builder;

use super::{ControlAddr, IpcStream, error::*};

/// Default read deadline per request.
pub const READ_TIMEOUT: Duration = Duration::from_secs(60);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const CRLF: &str = "\r\n";
const MAX_BYTES: usize = 16 * 1024 * 1024;

/// One request. Either formatted from its parts or sent verbatim via `raw`.
#[derive(Debug, Clone, Builder)]
#[builder(on(String, into))]
pub struct HttpRequest {
    #[builder(default = "GET".to_string())]
    pub method: String,
    #[builder(default = "/".to_string())]
    pub url: String,
    #[builder(default = "HTTP/1.1".to_string())]
    pub version: String,
    /// Defaults to `Host: localhost` and `Connection: close`.
    #[builder(default = default_headers())]
    pub headers: Vec<(String, String)>,
    #[builder(default, into)]
    pub body: Vec<u8>,
    /// Bytes written as-is; every other field except `read_timeout` is ignored.
    #[builder(into)]
    pub raw: Option<Vec<u8>>,
    #[builder(default = READ_TIMEOUT)]
    pub read_timeout: Duration,
}

fn default_headers() -> Vec<(String, String)> {
    vec![
        ("Host".into(), "localhost".into()),
        ("Connection".into(), "close".into()),
    ]
}

impl HttpRequest {
    pub fn get(url: &str) -> Self {
        HttpRequest::builder().url(url).build()
    }

    /// Bytes sent verbatim, e.g. half a request line.
    pub fn raw(bytes: impl Into<Vec<u8>>) -> Self {
        HttpRequest::builder().raw(bytes).build()
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        if let Some(raw) = &self.raw {
            return raw.clone();
        }
        debug_assert!(!self.url.contains('\r') && !self.url.contains('\n'));

        let mut head = format!("{} {} {}{CRLF}", self.method, self.url, self.version);
        for (name, value) in &self.headers {
            head.push_str(&format!("{name}: {value}{CRLF}"));
        }
        let has_length = self
            .headers
            .iter()
            .any(|(n, _)| n.eq_ignore_ascii_case("content-length"));
        if !self.body.is_empty() && !has_length {
            head.push_str(&format!("Content-Length: {}{CRLF}", self.body.len()));
        }
        head.push_str(CRLF);

        let mut out = head.into_bytes();
        out.extend_from_slice(&self.body);
        out
    }
}

/// Parsed (possibly partial) response.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HttpResponse {
    /// `None` when not even the status line arrived.
    pub status: Option<u16>,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
    /// The full message was framed and received.
    pub complete: bool,
}

impl HttpResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.body)
    }

    pub fn json<T: serde::de::DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_slice(&self.body)?)
    }

    pub fn is_empty(&self) -> bool {
        self.status.is_none() && self.body.is_empty()
    }

    /// Parses whatever is in `buf`. `eof` marks the peer having closed,
    /// which completes bodies delimited by connection close.
    pub fn parse(buf: &[u8], eof: bool) -> Self {
        let mut resp = HttpResponse::default();

        let Some(head_end) = find(buf, b"\r\n\r\n").map(|i| i + 4) else {
            // headers incomplete: keep the status if its line arrived
            if let Some(line_end) = find(buf, b"\r\n") {
                resp.status = parse_status(&buf[..line_end]);
            }
            return resp;
        };

        let head = String::from_utf8_lossy(&buf[..head_end]);
        let mut lines = head.split(CRLF);
        resp.status = lines.next().and_then(|l| parse_status(l.as_bytes()));
        resp.headers = lines
            .filter_map(|l| l.split_once(':'))
            .map(|(n, v)| (n.trim().to_owned(), v.trim().to_owned()))
            .collect();

        let raw_body = &buf[head_end..];
        let bodiless = matches!(resp.status, Some(100..=199 | 204 | 304));
        let chunked = resp
            .header("transfer-encoding")
            .is_some_and(|v| v.eq_ignore_ascii_case("chunked"));
        let length = resp
            .header("content-length")
            .and_then(|v| v.parse::<usize>().ok());

        if bodiless {
            resp.complete = true;
        } else if chunked {
            let (body, done) = decode_chunked(raw_body);
            resp.body = body;
            resp.complete = done;
        } else if let Some(len) = length {
            resp.body = raw_body[..len.min(raw_body.len())].to_vec();
            resp.complete = raw_body.len() >= len;
        } else {
            resp.body = raw_body.to_vec();
            resp.complete = eof;
        }
        resp
    }
}

fn parse_status(line: &[u8]) -> Option<u16> {
    let line = std::str::from_utf8(line).ok()?;
    if !line.starts_with("HTTP/") {
        return None;
    }
    line.split_whitespace().nth(1)?.parse().ok()
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Decodes as many chunks as are fully present. Returns the body so far and
/// whether the terminating zero-size chunk was seen.
fn decode_chunked(mut raw: &[u8]) -> (Vec<u8>, bool) {
    let mut body = Vec::new();
    loop {
        let Some(line_end) = find(raw, b"\r\n") else {
            return (body, false);
        };
        let size_field = String::from_utf8_lossy(&raw[..line_end]);
        // chunk extensions follow a ';'
        let size_hex = size_field.split(';').next().unwrap_or_default().trim();
        let Ok(size) = usize::from_str_radix(size_hex, 16) else {
            return (body, false);
        };
        raw = &raw[line_end + 2..];
        if size == 0 {
            return (body, true);
        }
        // a size past what we would ever buffer cannot be framed
        if size > MAX_BYTES {
            return (body, false);
        }
        if raw.len().saturating_sub(2) < size {
            body.extend_from_slice(&raw[..size.min(raw.len())]);
            return (body, false);
        }
        body.extend_from_slice(&raw[..size]);
        raw = &raw[size + 2..];
    }
}

/// An open connection that outlives a single exchange.
#[derive(Debug)]
pub struct HttpConnection {
    stream: IpcStream,
    addr: ControlAddr,
}

impl HttpConnection {
    pub fn addr(&self) -> &ControlAddr {
        &self.addr
    }

    pub fn send(&mut self, bytes: &[u8]) -> Result<()> {
        self.stream.write_all(bytes)?;
        self.stream.flush()?;
        Ok(())
    }

    /// Reads until the response is framed, the peer closes, or `timeout`
    /// passes without data. Never fails: transport trouble yields a partial
    /// response.
    pub fn recv(&mut self, timeout: Duration) -> HttpResponse {
        if let Err(e) = self.stream.set_read_timeout(timeout) {
            crate::debug!("could not set read timeout on {}: {e}", self.addr);
        }
        let mut buf = Vec::new();
        let mut chunk = [0u8; 8192];
        let mut eof = false;
        loop {
            match self.stream.read(&mut chunk) {
                Ok(0) => {
                    eof = true;
                    break;
                }
                Ok(n) => {
                    buf.extend_from_slice(&chunk[..n]);
                    if buf.len() >= MAX_BYTES || HttpResponse::parse(&buf, false).complete {
                        break;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
                    ) =>
                {
                    crate::trace!("read from {} timed out after {timeout:?}", self.addr);
                    break;
                }
                Err(e) => {
                    crate::debug!("read from {} failed: {e}", self.addr);
                    break;
                }
            }
        }
        HttpResponse::parse(&buf, eof)
    }

    /// Sends `req` on this connection and reads the reply. A peer that has
    /// already closed may still have a response queued, so write failures
    /// fall through to the read.
    pub fn request(&mut self, req: &HttpRequest) -> HttpResponse {
        if let Err(e) = self.send(&req.to_bytes()) {
            crate::debug!("write to {} failed: {e}", self.addr);
        }
        self.recv(req.read_timeout)
    }
}

/// Connection factory bound to one address.
#[derive(Debug, Clone)]
pub struct HttpClient {
    addr: ControlAddr,
    connect_timeout: Duration,
}

impl HttpClient {
    pub fn new(addr: ControlAddr) -> Self {
        Self {
            addr,
            connect_timeout: CONNECT_TIMEOUT,
        }
    }

    /// Client for `127.0.0.1:<port>`.
    pub fn local(port: u16) -> Self {
        Self::new(ControlAddr::Tcp(SocketAddr::from((Ipv4Addr::LOCALHOST, port))))
    }

    pub fn addr(&self) -> &ControlAddr {
        &self.addr
    }

    pub fn connect(&self) -> Result<HttpConnection> {
        let stream = self.addr.connect(self.connect_timeout)?;
        Ok(HttpConnection {
            stream,
            addr: self.addr.clone(),
        })
    }

    /// One-shot exchange on a fresh connection.
    pub fn request(&self, req: &HttpRequest) -> Result<HttpResponse> {
        let mut conn = self.connect()?;
        conn.send(&req.to_bytes())?;
        Ok(conn.recv(req.read_timeout))
    }

    /// Like [`request`](Self::request) but hands the connection back for
    /// further raw writes.
    pub fn start(&self, req: &HttpRequest) -> Result<(HttpResponse, HttpConnection)> {
        let mut conn = self.connect()?;
        conn.send(&req.to_bytes())?;
        let resp = conn.recv(req.read_timeout);
        Ok((resp, conn))
    }

    /// Writes `req` without reading anything back.
    pub fn send_only(&self, req: &HttpRequest) -> Result<HttpConnection> {
        let mut conn = self.connect()?;
        conn.send(&req.to_bytes())?;
        Ok(conn)
    }

    pub fn get(&self, url: &str) -> Result<HttpResponse> {
        self.request(&HttpRequest::get(url))
    }

    pub fn put(&self, url: &str, body: impl Into<Vec<u8>>) -> Result<HttpResponse> {
        self.request(&HttpRequest::builder().method("PUT").url(url).body(body).build())
    }

    pub fn delete(&self, url: &str) -> Result<HttpResponse> {
        self.request(&HttpRequest::builder().method("DELETE").url(url).build())
    }
}

impl std::fmt::Display for HttpClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "HttpClient({})", self.addr)
    }
}
