//! HTTP/1.1 wire framing for both listeners.
//!
//! Heads are parsed for routing and cacheability decisions; bodies are
//! captured as the exact bytes that arrived (including chunked framing), so a
//! message can be replayed verbatim from the cache.

use std::io;

use tokio::io::{AsyncRead, AsyncReadExt};

const READ_CHUNK: usize = 8 * 1024;
const CHUNK_SIZE_LINE_LIMIT: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpVersion {
    Http10,
    Http11,
}

impl HttpVersion {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Http10 => "HTTP/1.0",
            Self::Http11 => "HTTP/1.1",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpBodyMode {
    None,
    ContentLength(u64),
    Chunked,
    CloseDelimited,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpHeader {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestHead {
    pub raw: Vec<u8>,
    pub method: String,
    pub target: String,
    pub version: HttpVersion,
    pub headers: Vec<HttpHeader>,
    pub body_mode: HttpBodyMode,
}

impl RequestHead {
    pub fn header(&self, name: &str) -> Option<&str> {
        header_value(&self.headers, name)
    }

    pub fn host(&self) -> Option<&str> {
        self.header("host")
    }

    /// Raw query portion of the target, without the `?`. Empty when absent.
    pub fn raw_query(&self) -> &str {
        match self.target.split_once('?') {
            Some((_, query)) => query,
            None => "",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseHead {
    pub raw: Vec<u8>,
    pub version: HttpVersion,
    pub status_code: u16,
    pub headers: Vec<HttpHeader>,
    pub body_mode: HttpBodyMode,
}

impl ResponseHead {
    pub fn header(&self, name: &str) -> Option<&str> {
        header_value(&self.headers, name)
    }
}

fn header_value<'a>(headers: &'a [HttpHeader], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|header| header.name.eq_ignore_ascii_case(name))
        .map(|header| header.value.as_str())
}

fn values_of<'a>(headers: &'a [HttpHeader], name: &'a str) -> impl Iterator<Item = &'a str> {
    headers
        .iter()
        .filter(move |header| header.name.eq_ignore_ascii_case(name))
        .map(|header| header.value.as_str())
}

fn framing_error(detail: impl Into<String>) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, detail.into())
}

fn truncated(detail: &str) -> io::Error {
    io::Error::new(io::ErrorKind::UnexpectedEof, detail.to_string())
}

/// A stream plus whatever bytes were read past the last message boundary.
pub struct BufferedConn<S> {
    pub stream: S,
    pub read_buf: Vec<u8>,
}

impl<S> BufferedConn<S> {
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            read_buf: Vec::new(),
        }
    }
}

impl<S: AsyncRead + Unpin> BufferedConn<S> {
    /// Pulls one chunk off the stream into the buffer; 0 means EOF.
    async fn fill(&mut self) -> io::Result<usize> {
        let mut scratch = [0_u8; READ_CHUNK];
        let pulled = self.stream.read(&mut scratch).await?;
        self.read_buf.extend_from_slice(&scratch[..pulled]);
        Ok(pulled)
    }

    /// Consumes and returns everything up to and including `delim`, or `None`
    /// on a clean EOF with nothing buffered.
    async fn take_through(&mut self, delim: &[u8], limit: usize) -> io::Result<Option<Vec<u8>>> {
        let mut scan_from = 0;
        loop {
            if let Some(at) = seek(&self.read_buf, delim, scan_from) {
                let rest = self.read_buf.split_off(at + delim.len());
                return Ok(Some(std::mem::replace(&mut self.read_buf, rest)));
            }
            if self.read_buf.len() > limit {
                return Err(framing_error(format!(
                    "frame head grew past the {limit} byte limit"
                )));
            }
            // Only the buffered tail can still complete the delimiter.
            scan_from = self.read_buf.len().saturating_sub(delim.len() - 1);
            if self.fill().await? == 0 {
                if self.read_buf.is_empty() {
                    return Ok(None);
                }
                return Err(truncated("peer closed before the frame was complete"));
            }
        }
    }

    async fn take_exact(&mut self, want: u64) -> io::Result<Vec<u8>> {
        while (self.read_buf.len() as u64) < want {
            if self.fill().await? == 0 {
                return Err(truncated("peer closed mid-body"));
            }
        }
        let rest = self.read_buf.split_off(want as usize);
        Ok(std::mem::replace(&mut self.read_buf, rest))
    }

    async fn take_until_eof(&mut self) -> io::Result<Vec<u8>> {
        while self.fill().await? > 0 {}
        Ok(std::mem::take(&mut self.read_buf))
    }
}

fn seek(buf: &[u8], delim: &[u8], from: usize) -> Option<usize> {
    let last = buf.len().checked_sub(delim.len())?;
    (from..=last).find(|&at| &buf[at..at + delim.len()] == delim)
}

/// Reads up to and including the `\r\n\r\n` head terminator. Returns `None`
/// on clean EOF before any bytes arrive.
pub async fn read_head<S: AsyncRead + Unpin>(
    conn: &mut BufferedConn<S>,
    max_bytes: usize,
) -> io::Result<Option<Vec<u8>>> {
    conn.take_through(b"\r\n\r\n", max_bytes).await
}

pub fn parse_request_head(raw: &[u8]) -> io::Result<RequestHead> {
    let (start_line, header_block) = split_head(raw)?;

    let fields = start_line.split_ascii_whitespace().collect::<Vec<_>>();
    let (method, target, version_text) = match fields[..] {
        [method, target, version_text] => (method, target, version_text),
        _ => {
            return Err(framing_error(
                "request line must be `METHOD target HTTP-version`",
            ))
        }
    };
    let version = parse_version(version_text)?;

    let headers = collect_headers(header_block)?;
    let body_mode = body_mode(&headers, None)?;

    Ok(RequestHead {
        raw: raw.to_vec(),
        method: method.to_string(),
        target: target.to_string(),
        version,
        headers,
        body_mode,
    })
}

pub fn parse_response_head(raw: &[u8], request_method: &str) -> io::Result<ResponseHead> {
    let (status_line, header_block) = split_head(raw)?;

    // `HTTP-version SP status-code SP reason`; the reason phrase is not kept.
    let mut fields = status_line.splitn(3, ' ');
    let version = parse_version(fields.next().unwrap_or_default())?;
    let status_code = fields
        .next()
        .unwrap_or_default()
        .parse::<u16>()
        .map_err(|_| framing_error("status code is not a number"))?;

    let headers = collect_headers(header_block)?;
    let body_mode = body_mode(&headers, Some((request_method, status_code)))?;

    Ok(ResponseHead {
        raw: raw.to_vec(),
        version,
        status_code,
        headers,
        body_mode,
    })
}

fn split_head(raw: &[u8]) -> io::Result<(&str, &str)> {
    let text =
        std::str::from_utf8(raw).map_err(|_| framing_error("head bytes were not valid UTF-8"))?;
    text.split_once("\r\n")
        .ok_or_else(|| framing_error("head is missing its start line"))
}

fn parse_version(text: &str) -> io::Result<HttpVersion> {
    match text.strip_prefix("HTTP/1.") {
        Some("0") => Ok(HttpVersion::Http10),
        Some("1") => Ok(HttpVersion::Http11),
        _ => Err(framing_error("expected an HTTP/1.x version")),
    }
}

fn collect_headers(block: &str) -> io::Result<Vec<HttpHeader>> {
    block
        .split("\r\n")
        .take_while(|line| !line.is_empty())
        .map(|line| {
            let (name, value) = line
                .split_once(':')
                .ok_or_else(|| framing_error("header line missing ':' separator"))?;
            Ok(HttpHeader {
                name: name.trim().to_string(),
                value: value.trim().to_string(),
            })
        })
        .collect()
}

/// Body framing for one message. `reply` carries the request method and
/// status code when the message is a response; requests pass `None` and
/// default to no body rather than read-to-close.
fn body_mode(
    headers: &[HttpHeader],
    reply: Option<(&str, u16)>,
) -> io::Result<HttpBodyMode> {
    if let Some((request_method, status_code)) = reply {
        let bodyless = request_method.eq_ignore_ascii_case("HEAD")
            || matches!(status_code, 100..=199 | 204 | 304);
        if bodyless {
            return Ok(HttpBodyMode::None);
        }
    }

    if is_chunked(headers) {
        return Ok(HttpBodyMode::Chunked);
    }

    match declared_length(headers)? {
        Some(0) => Ok(HttpBodyMode::None),
        Some(length) => Ok(HttpBodyMode::ContentLength(length)),
        None if reply.is_some() => Ok(HttpBodyMode::CloseDelimited),
        None => Ok(HttpBodyMode::None),
    }
}

fn is_chunked(headers: &[HttpHeader]) -> bool {
    values_of(headers, "transfer-encoding")
        .flat_map(|value| value.split(','))
        .any(|token| token.trim().eq_ignore_ascii_case("chunked"))
}

// Repeated Content-Length headers must agree; a disagreement is a framing
// attack, not a message.
fn declared_length(headers: &[HttpHeader]) -> io::Result<Option<u64>> {
    let mut declared = None;
    for value in values_of(headers, "content-length") {
        let length = value
            .parse::<u64>()
            .map_err(|_| framing_error("Content-Length is not a number"))?;
        if declared.is_some_and(|seen| seen != length) {
            return Err(framing_error("conflicting Content-Length headers"));
        }
        declared = Some(length);
    }
    Ok(declared)
}

/// Captures the body following an already-parsed head, byte for byte.
/// Chunked bodies keep their size lines, terminators, and trailers.
pub async fn read_body_raw<S: AsyncRead + Unpin>(
    conn: &mut BufferedConn<S>,
    mode: HttpBodyMode,
    trailer_limit: usize,
) -> io::Result<Vec<u8>> {
    match mode {
        HttpBodyMode::None => Ok(Vec::new()),
        HttpBodyMode::ContentLength(length) => conn.take_exact(length).await,
        HttpBodyMode::Chunked => read_chunked_raw(conn, trailer_limit).await,
        HttpBodyMode::CloseDelimited => conn.take_until_eof().await,
    }
}

async fn read_chunked_raw<S: AsyncRead + Unpin>(
    conn: &mut BufferedConn<S>,
    trailer_limit: usize,
) -> io::Result<Vec<u8>> {
    let mut wire = Vec::new();
    loop {
        let size_line = conn
            .take_through(b"\r\n", CHUNK_SIZE_LINE_LIMIT)
            .await?
            .ok_or_else(|| truncated("peer closed before a chunk size line"))?;
        let size = decode_chunk_size(&size_line)?;
        wire.extend_from_slice(&size_line);

        if size == 0 {
            // Trailer lines, if any, end with an empty line.
            loop {
                let trailer = conn
                    .take_through(b"\r\n", trailer_limit)
                    .await?
                    .ok_or_else(|| truncated("peer closed inside the trailer section"))?;
                let done = trailer.as_slice() == b"\r\n";
                wire.extend_from_slice(&trailer);
                if done {
                    return Ok(wire);
                }
            }
        }

        let data = conn.take_exact(size).await?;
        wire.extend_from_slice(&data);

        let boundary = conn.take_exact(2).await?;
        if boundary[..] != b"\r\n"[..] {
            return Err(framing_error("chunk data not followed by CRLF"));
        }
        wire.extend_from_slice(&boundary);
    }
}

fn decode_chunk_size(line: &[u8]) -> io::Result<u64> {
    let text =
        std::str::from_utf8(line).map_err(|_| framing_error("chunk size line is not ASCII"))?;
    // Chunk extensions after `;` are ignored.
    let size_field = text
        .trim_end_matches("\r\n")
        .split(';')
        .next()
        .unwrap_or("")
        .trim();
    u64::from_str_radix(size_field, 16).map_err(|_| framing_error("chunk size is not hex"))
}

#[cfg(test)]
mod tests {
    use super::{
        parse_request_head, parse_response_head, read_body_raw, read_head, BufferedConn,
        HttpBodyMode, HttpVersion,
    };

    #[test]
    fn parses_origin_form_get() {
        let head = parse_request_head(
            b"GET /x?q=1 HTTP/1.1\r\nHost: example.test\r\nAccept: */*\r\n\r\n",
        )
        .expect("parse request");
        assert_eq!(head.method, "GET");
        assert_eq!(head.target, "/x?q=1");
        assert_eq!(head.version, HttpVersion::Http11);
        assert_eq!(head.host(), Some("example.test"));
        assert_eq!(head.raw_query(), "q=1");
        assert_eq!(head.body_mode, HttpBodyMode::None);
    }

    #[test]
    fn query_is_empty_without_question_mark() {
        let head = parse_request_head(b"POST /submit HTTP/1.1\r\nHost: a\r\n\r\n")
            .expect("parse request");
        assert_eq!(head.raw_query(), "");
    }

    #[test]
    fn request_with_content_length_has_sized_body() {
        let head =
            parse_request_head(b"POST /x HTTP/1.1\r\nHost: a\r\nContent-Length: 5\r\n\r\n")
                .expect("parse request");
        assert_eq!(head.body_mode, HttpBodyMode::ContentLength(5));
    }

    #[test]
    fn rejects_unsupported_version() {
        assert!(parse_request_head(b"GET / HTTP/2\r\n\r\n").is_err());
    }

    #[test]
    fn rejects_garbage_request_line() {
        assert!(parse_request_head(b"garbage\r\n\r\n").is_err());
    }

    #[test]
    fn rejects_conflicting_content_lengths() {
        let raw =
            b"POST /x HTTP/1.1\r\nHost: a\r\nContent-Length: 5\r\nContent-Length: 6\r\n\r\n";
        assert!(parse_request_head(raw).is_err());
    }

    #[test]
    fn response_body_mode_follows_headers_and_method() {
        let sized = parse_response_head(
            b"HTTP/1.1 200 OK\r\nContent-Length: 3\r\n\r\n",
            "GET",
        )
        .expect("parse response");
        assert_eq!(sized.status_code, 200);
        assert_eq!(sized.body_mode, HttpBodyMode::ContentLength(3));

        let chunked = parse_response_head(
            b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n",
            "GET",
        )
        .expect("parse response");
        assert_eq!(chunked.body_mode, HttpBodyMode::Chunked);

        let head_request = parse_response_head(
            b"HTTP/1.1 200 OK\r\nContent-Length: 3\r\n\r\n",
            "HEAD",
        )
        .expect("parse response");
        assert_eq!(head_request.body_mode, HttpBodyMode::None);

        let no_content =
            parse_response_head(b"HTTP/1.1 204 No Content\r\n\r\n", "GET").expect("parse");
        assert_eq!(no_content.body_mode, HttpBodyMode::None);

        let unframed = parse_response_head(b"HTTP/1.1 200 OK\r\n\r\n", "GET").expect("parse");
        assert_eq!(unframed.body_mode, HttpBodyMode::CloseDelimited);
    }

    #[test]
    fn response_exposes_cache_control_header() {
        let head = parse_response_head(
            b"HTTP/1.1 200 OK\r\nCache-Control: private, no-cache\r\nContent-Length: 0\r\n\r\n",
            "GET",
        )
        .expect("parse response");
        assert_eq!(head.header("cache-control"), Some("private, no-cache"));
    }

    #[tokio::test]
    async fn reads_head_and_sized_body_from_stream() {
        let (client, server) = tokio::io::duplex(1024);
        let mut conn = BufferedConn::new(server);

        tokio::spawn(async move {
            use tokio::io::AsyncWriteExt;
            let mut client = client;
            client
                .write_all(b"POST /x HTTP/1.1\r\nHost: a\r\nContent-Length: 5\r\n\r\nhello")
                .await
                .expect("write request");
        });

        let raw = read_head(&mut conn, 64 * 1024)
            .await
            .expect("read head")
            .expect("head present");
        let head = parse_request_head(&raw).expect("parse head");
        let body = read_body_raw(&mut conn, head.body_mode, 64 * 1024)
            .await
            .expect("read body");
        assert_eq!(body, b"hello");
    }

    #[tokio::test]
    async fn captures_chunked_body_verbatim() {
        let (client, server) = tokio::io::duplex(1024);
        let mut conn = BufferedConn::new(server);
        let wire = b"5\r\nhello\r\n0\r\n\r\n";

        tokio::spawn(async move {
            use tokio::io::AsyncWriteExt;
            let mut client = client;
            client
                .write_all(b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n")
                .await
                .expect("write head");
            client.write_all(wire).await.expect("write body");
        });

        let raw = read_head(&mut conn, 64 * 1024)
            .await
            .expect("read head")
            .expect("head present");
        let head = parse_response_head(&raw, "GET").expect("parse head");
        let body = read_body_raw(&mut conn, head.body_mode, 64 * 1024)
            .await
            .expect("read body");
        assert_eq!(body, wire);
    }

    #[tokio::test]
    async fn captures_chunked_trailers_verbatim() {
        let (client, server) = tokio::io::duplex(1024);
        let mut conn = BufferedConn::new(server);
        let wire = b"5\r\nhello\r\n0\r\nExpires: 0\r\n\r\n";

        tokio::spawn(async move {
            use tokio::io::AsyncWriteExt;
            let mut client = client;
            client
                .write_all(b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n")
                .await
                .expect("write head");
            client.write_all(wire).await.expect("write body");
        });

        let raw = read_head(&mut conn, 64 * 1024)
            .await
            .expect("read head")
            .expect("head present");
        let head = parse_response_head(&raw, "GET").expect("parse head");
        let body = read_body_raw(&mut conn, head.body_mode, 64 * 1024)
            .await
            .expect("read body");
        assert_eq!(body, wire);
    }

    #[tokio::test]
    async fn close_delimited_body_reads_to_eof() {
        let (client, server) = tokio::io::duplex(1024);
        let mut conn = BufferedConn::new(server);

        tokio::spawn(async move {
            use tokio::io::AsyncWriteExt;
            let mut client = client;
            client
                .write_all(b"HTTP/1.1 200 OK\r\n\r\nstream until close")
                .await
                .expect("write response");
            client.shutdown().await.expect("shutdown");
        });

        let raw = read_head(&mut conn, 64 * 1024)
            .await
            .expect("read head")
            .expect("head present");
        let head = parse_response_head(&raw, "GET").expect("parse head");
        let body = read_body_raw(&mut conn, head.body_mode, 64 * 1024)
            .await
            .expect("read body");
        assert_eq!(body, b"stream until close");
    }

    #[tokio::test]
    async fn head_over_the_limit_is_rejected_before_it_completes() {
        let (client, server) = tokio::io::duplex(4096);
        let mut conn = BufferedConn::new(server);

        // An endless header line: the terminator never arrives, so the limit
        // has to stop the read.
        tokio::spawn(async move {
            use tokio::io::AsyncWriteExt;
            let mut client = client;
            let padding = "x".repeat(512);
            let _ = client
                .write_all(format!("GET /big HTTP/1.1\r\nPadding: {padding}").as_bytes())
                .await;
            tokio::time::sleep(std::time::Duration::from_secs(5)).await;
        });

        let error = read_head(&mut conn, 64)
            .await
            .expect_err("oversized head must fail");
        assert_eq!(error.kind(), std::io::ErrorKind::InvalidData);
    }
}
