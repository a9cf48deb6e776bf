/// Byte-stream framing for the Stratum socket.
///
/// Inbound bytes accumulate in an append-only buffer; complete
/// newline-terminated lines drain out with carriage returns stripped. The
/// unconsumed remainder is capped so a peer that never sends a newline
/// cannot grow the buffer without bound, and an HTTP request line seen
/// before any protocol line flags the peer as a browser/proxy probe.
use bytes::BytesMut;
use thiserror::Error;

/// Largest number of unconsumed bytes a peer may accumulate before the
/// connection is cut.
pub const MAX_BUFFER: usize = 100_000;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("unconsumed buffer exceeded {0} bytes")]
    Overflow(usize),
    #[error("http request line on stratum socket")]
    HttpRequest,
}

#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: BytesMut,
    saw_line: bool,
}

/// "GET / HTTP/1.1"-shaped: an all-uppercase first token and an HTTP/
/// version as the last.
fn is_http_request_line(line: &str) -> bool {
    let mut tokens = line.split_whitespace();
    let Some(method) = tokens.next() else {
        return false;
    };
    let Some(last) = tokens.last() else {
        return false;
    };
    !method.is_empty()
        && method.bytes().all(|b| b.is_ascii_uppercase())
        && last.starts_with("HTTP/")
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Unconsumed (partial-line) bytes currently buffered.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }

    /// Append bytes and drain every complete line.
    ///
    /// Empty lines (runs of newlines) are skipped. Errors are terminal: the
    /// caller must stop feeding this decoder and close the connection.
    pub fn push(&mut self, data: &[u8]) -> Result<Vec<String>, FrameError> {
        self.buf.extend_from_slice(data);

        let mut lines = Vec::new();
        while let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
            let raw = self.buf.split_to(pos + 1);
            let line = String::from_utf8_lossy(&raw[..pos]);
            let line = line.trim_end_matches('\r');
            if line.is_empty() {
                continue;
            }
            if !self.saw_line && is_http_request_line(line) {
                return Err(FrameError::HttpRequest);
            }
            self.saw_line = true;
            lines.push(line.to_string());
        }

        if self.buf.len() > MAX_BUFFER {
            return Err(FrameError::Overflow(MAX_BUFFER));
        }
        Ok(lines)
    }
}

/// One-shot reply for browsers probing the Stratum port: a fixed 200 whose
/// `X-Stratum` header points at the public endpoint, after which the
/// connection is closed.
pub fn http_redirect(public_host: &str, public_port: u16) -> String {
    let body = r#"{"error":null,"result":false,"id":0}"#;
    format!(
        "HTTP/1.1 200 OK\r\n\
         X-Stratum: stratum+tcp://{public_host}:{public_port}\r\n\
         Connection: Close\r\n\
         Content-Type: application/json; charset=utf-8\r\n\
         Content-Length: {}\r\n\
         \r\n\
         {body}",
        body.len()
    )
}
