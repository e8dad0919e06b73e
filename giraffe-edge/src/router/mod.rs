//! Hybrid router: classifies inbound edge connections and dispatches them
//! to the streaming RPC transport or the raw-byte pool.

pub mod ingress;
pub mod sniff;

use sniff::SniffedRequest;

/// Paths always carried on the raw transport.
const FORCE_RAW_PATHS: &[&str] = &["/ws/", "/websocket/", "/socket.io/"];

/// Paths always carried on the plain RPC transport.
const FORCE_RPC_PATHS: &[&str] = &["/assets/", "/media/", "/static/"];

/// Bulk-transfer path prefixes that select the chunked RPC path.
const BULK_PREFIXES: &[&str] = &["/video/", "/download/", "/file/", "/raw/", "/backup/", "/export/"];

/// Extensions that mark a large binary transfer.
const BULK_EXTENSIONS: &[&str] = &[
    "mp4", "mkv", "mov", "avi", "webm", "zip", "tar", "gz", "iso", "dmg", "img", "bin",
];

/// Body size above which the chunked path is chosen.
pub const LARGE_BODY_THRESHOLD: u64 = 16 * 1024 * 1024;

/// Where a sniffed request is dispatched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    /// Raw-byte pool: WebSocket upgrades and forced streaming paths.
    Raw,
    /// RPC transport, client answers in chunks.
    RpcChunked,
    /// RPC transport, single-frame bodies.
    Rpc,
}

/// Classify a request. Overrides apply in order: force-raw, large-file
/// heuristic, force-RPC.
pub fn classify(req: &SniffedRequest) -> Transport {
    let path = normalized_path(&req.path);

    if req.is_upgrade() || is_force_raw(&path, &req.path) {
        return Transport::Raw;
    }
    if is_large_transfer(req, &path) {
        return Transport::RpcChunked;
    }
    // force-RPC paths only confirm the default; kept for the ordering
    // contract with the overrides above
    if FORCE_RPC_PATHS.iter().any(|p| path.contains(p)) {
        return Transport::Rpc;
    }
    Transport::Rpc
}

fn normalized_path(path: &str) -> String {
    path.split('?').next().unwrap_or(path).to_ascii_lowercase()
}

fn is_force_raw(path: &str, full_path: &str) -> bool {
    if FORCE_RAW_PATHS.iter().any(|p| path.contains(p)) {
        return true;
    }
    // socket.io style query hint
    full_path.to_ascii_lowercase().contains("transport=websocket")
}

fn is_large_transfer(req: &SniffedRequest, path: &str) -> bool {
    if req.content_length().map(|l| l > LARGE_BODY_THRESHOLD) == Some(true) {
        return true;
    }
    if let Some(ext) = path.rsplit('.').next() {
        if path.contains('.') && BULK_EXTENSIONS.contains(&ext) {
            return true;
        }
    }
    BULK_PREFIXES.iter().any(|p| path.starts_with(p))
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn request(method: &str, path: &str, headers: &[(&str, &str)]) -> SniffedRequest {
        SniffedRequest {
            head: Bytes::new(),
            leftover: Bytes::new(),
            method: method.into(),
            path: path.into(),
            headers: headers
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }

    #[test]
    fn test_plain_get_is_rpc() {
        let req = request("GET", "/hello", &[("Host", "a.example")]);
        assert_eq!(classify(&req), Transport::Rpc);
    }

    #[test]
    fn test_upgrade_is_raw() {
        let req = request(
            "GET",
            "/anything",
            &[("Host", "a.example"), ("Upgrade", "websocket")],
        );
        assert_eq!(classify(&req), Transport::Raw);
    }

    #[test]
    fn test_force_raw_paths() {
        for path in ["/ws/feed", "/websocket/v2", "/socket.io/?EIO=4", "/poll?transport=websocket"] {
            let req = request("GET", path, &[("Host", "a.example")]);
            assert_eq!(classify(&req), Transport::Raw, "path {path}");
        }
    }

    #[test]
    fn test_video_path_is_chunked() {
        let req = request("GET", "/video/clip.mp4", &[("Host", "a.example")]);
        assert_eq!(classify(&req), Transport::RpcChunked);
    }

    #[test]
    fn test_extension_heuristic() {
        let req = request("GET", "/downloads/archive.zip", &[("Host", "a.example")]);
        assert_eq!(classify(&req), Transport::RpcChunked);
    }

    #[test]
    fn test_content_length_boundary() {
        let at = request(
            "PUT",
            "/api/upload",
            &[("Content-Length", &LARGE_BODY_THRESHOLD.to_string())],
        );
        assert_eq!(classify(&at), Transport::Rpc);

        let over = request(
            "PUT",
            "/api/upload",
            &[("Content-Length", &(LARGE_BODY_THRESHOLD + 1).to_string())],
        );
        assert_eq!(classify(&over), Transport::RpcChunked);
    }

    #[test]
    fn test_force_rpc_wins_over_extension() {
        // /static/ is an override below the large-file heuristic, so an
        // mp4 under /static/ still goes chunked
        let req = request("GET", "/static/promo.mp4", &[("Host", "a.example")]);
        assert_eq!(classify(&req), Transport::RpcChunked);

        let req = request("GET", "/static/app.css", &[("Host", "a.example")]);
        assert_eq!(classify(&req), Transport::Rpc);
    }

    #[test]
    fn test_raw_wins_over_large_file() {
        let req = request(
            "GET",
            "/ws/video.mp4",
            &[("Host", "a.example"), ("Connection", "Upgrade")],
        );
        assert_eq!(classify(&req), Transport::Raw);
    }
}
