//! Request-head sniffing for the hybrid router.
//!
//! Reads an inbound connection up to end-of-headers while preserving the
//! exact bytes, so the raw path can replay them verbatim onto a tunnel
//! connection.

use std::io::ErrorKind;

use bytes::Bytes;
use tokio::io::AsyncReadExt;

/// Cap on a request head.
pub const MAX_HEAD: usize = 64 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum SniffError {
    #[error("request head exceeds {MAX_HEAD} bytes")]
    HeadTooLarge,
    #[error("malformed request head")]
    Malformed,
    #[error("connection closed before request head")]
    Closed,
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

/// A parsed request head plus the bytes behind it.
#[derive(Debug)]
pub struct SniffedRequest {
    /// Exact head bytes, up to and including the blank line.
    pub head: Bytes,
    /// Body bytes read past the head, if any.
    pub leftover: Bytes,
    pub method: String,
    pub path: String,
    pub headers: Vec<(String, String)>,
}

impl SniffedRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Host header with any port stripped.
    pub fn domain(&self) -> Option<String> {
        self.header("host")
            .map(|h| h.split(':').next().unwrap_or(h).to_ascii_lowercase())
    }

    pub fn content_length(&self) -> Option<u64> {
        self.header("content-length")
            .and_then(|v| v.trim().parse().ok())
    }

    /// `Upgrade: websocket` or `Connection: upgrade`.
    pub fn is_upgrade(&self) -> bool {
        let upgrade = self
            .header("upgrade")
            .map(|v| v.eq_ignore_ascii_case("websocket"))
            .unwrap_or(false);
        let connection = self
            .header("connection")
            .map(|v| v.to_ascii_lowercase().contains("upgrade"))
            .unwrap_or(false);
        upgrade || connection
    }

    /// Head + leftover, for replay onto a raw connection.
    pub fn replay_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.head.len() + self.leftover.len());
        out.extend_from_slice(&self.head);
        out.extend_from_slice(&self.leftover);
        out
    }
}

/// Read until end-of-headers and parse. The buffer comes from the caller's
/// pool and is returned through it.
pub async fn sniff<R>(reader: &mut R, mut buf: Vec<u8>) -> (Vec<u8>, Result<SniffedRequest, SniffError>)
where
    R: tokio::io::AsyncRead + Unpin,
{
    buf.clear();
    let result = sniff_inner(reader, &mut buf).await;
    (buf, result)
}

async fn sniff_inner<R>(
    reader: &mut R,
    buf: &mut Vec<u8>,
) -> Result<SniffedRequest, SniffError>
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut chunk = [0u8; 4096];
    let head_end = loop {
        if let Some(pos) = find_head_end(buf) {
            break pos;
        }
        if buf.len() > MAX_HEAD {
            return Err(SniffError::HeadTooLarge);
        }
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            if buf.is_empty() {
                return Err(SniffError::Closed);
            }
            return Err(SniffError::Malformed);
        }
        buf.extend_from_slice(&chunk[..n]);
    };

    let head = Bytes::copy_from_slice(&buf[..head_end]);
    let leftover = Bytes::copy_from_slice(&buf[head_end..]);

    let mut headers = [httparse::EMPTY_HEADER; 96];
    let mut req = httparse::Request::new(&mut headers);
    match req.parse(&head) {
        Ok(httparse::Status::Complete(_)) => {}
        _ => return Err(SniffError::Malformed),
    }

    let method = req.method.ok_or(SniffError::Malformed)?.to_string();
    let path = req.path.ok_or(SniffError::Malformed)?.to_string();
    let parsed_headers = req
        .headers
        .iter()
        .map(|h| {
            (
                h.name.to_string(),
                String::from_utf8_lossy(h.value).into_owned(),
            )
        })
        .collect();

    Ok(SniffedRequest {
        head,
        leftover,
        method,
        path,
        headers: parsed_headers,
    })
}

fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|p| p + 4)
}
