//! Chunked-transfer decisions and body splitting.
//!
//! A response goes down the chunked path when its size (or its path shape)
//! says the body will not fit a single frame. The lists mirror what the
//! edge router uses to route requests, so both sides agree on transport.

use bytes::Bytes;

/// Wire chunk size for chunked responses.
pub const CHUNK_SIZE: usize = 4 * 1024 * 1024;

const BULK_PREFIXES: &[&str] = &["/video/", "/download/", "/file/", "/raw/", "/backup/", "/export/"];

const BULK_EXTENSIONS: &[&str] = &[
    "mp4", "mkv", "mov", "avi", "webm", "zip", "tar", "gz", "iso", "dmg", "img", "bin",
];

/// Decide whether a response must be streamed in chunks.
pub fn should_chunk(path: &str, content_length: Option<u64>, threshold: u64) -> bool {
    if let Some(len) = content_length {
        if len > threshold {
            return true;
        }
    }
    let path = path.split('?').next().unwrap_or(path).to_ascii_lowercase();
    if let Some(ext) = path.rsplit('.').next() {
        if path.contains('.') && BULK_EXTENSIONS.contains(&ext) {
            return true;
        }
    }
    BULK_PREFIXES.iter().any(|p| path.starts_with(p))
}

/// Split an in-memory body into wire-sized chunks, preserving order.
/// Slices share the original allocation.
pub fn split_chunks(body: &Bytes, chunk_size: usize) -> Vec<Bytes> {
    if body.is_empty() {
        return Vec::new();
    }
    let mut chunks = Vec::with_capacity(body.len() / chunk_size + 1);
    let mut offset = 0;
    while offset < body.len() {
        let end = (offset + chunk_size).min(body.len());
        chunks.push(body.slice(offset..end));
        offset = end;
    }
    chunks
}

#[cfg(test)]
mod tests {
    use super::*;

    const MIB: u64 = 1024 * 1024;

    #[test]
    fn test_threshold_boundary() {
        // exactly at the threshold stays single-frame; one byte over chunks
        assert!(!should_chunk("/api/data", Some(16 * MIB), 16 * MIB));
        assert!(should_chunk("/api/data", Some(16 * MIB + 1), 16 * MIB));
    }

    #[test]
    fn test_extension_heuristic() {
        assert!(should_chunk("/media/clip.mp4", None, 16 * MIB));
        assert!(should_chunk("/archive.tar", Some(10), 16 * MIB));
        assert!(!should_chunk("/index.html", None, 16 * MIB));
    }

    #[test]
    fn test_bulk_prefix_heuristic() {
        assert!(should_chunk("/video/live", None, 16 * MIB));
        assert!(should_chunk("/download/report.pdf?x=1", None, 16 * MIB));
        assert!(!should_chunk("/videos-list", None, 16 * MIB));
    }

    #[test]
    fn test_split_preserves_order_and_sizes() {
        let body = Bytes::from((0..10u8).collect::<Vec<_>>());
        let chunks = split_chunks(&body, 3);
        assert_eq!(chunks.len(), 4);
        assert_eq!(&chunks[0][..], &[0, 1, 2]);
        assert_eq!(&chunks[3][..], &[9]);
        let total: usize = chunks.iter().map(|c| c.len()).sum();
        assert_eq!(total, 10);
    }

    #[test]
    fn test_split_empty_body() {
        assert!(split_chunks(&Bytes::new(), 4).is_empty());
    }

    #[test]
    fn test_120_mib_body_chunk_count() {
        // a 120 MiB download must arrive as at least 30 ordered chunks
        let len: u64 = 120 * MIB;
        let chunks = len.div_ceil(CHUNK_SIZE as u64);
        assert!(chunks >= 30);
    }
}
