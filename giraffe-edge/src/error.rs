//! Failure taxonomy for the proxied-request path.

use giraffe_wire::{ErrorCode, ErrorPayload, ProtocolError};

/// Why a proxied request could not be completed.
///
/// Each variant maps to the HTTP status the ingress writes back to the
/// public side.
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("no tunnel connected for {0}")]
    NoTunnel(String),
    #[error("rate limit exceeded for {0}")]
    RateLimited(String),
    #[error("quota exhausted: {used} of {limit} bytes")]
    QuotaBlocked { used: u64, limit: u64 },
    #[error("request deadline exceeded")]
    Timeout,
    #[error("tunnel disconnected mid-request")]
    TunnelDisconnected,
    #[error("client reported: {0:?}")]
    Remote(ErrorPayload),
    #[error("protocol: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("upgrade wait timed out for {0}")]
    UpgradeTimeout(String),
}

impl ProxyError {
    /// HTTP status surfaced to the public caller.
    pub fn status(&self) -> u16 {
        match self {
            Self::NoTunnel(_) => 503,
            Self::RateLimited(_) => 429,
            Self::QuotaBlocked { .. } => 402,
            Self::Timeout => 504,
            Self::TunnelDisconnected => 502,
            Self::Remote(payload) => match payload.code {
                ErrorCode::RequestTimeout => 504,
                ErrorCode::QuotaExceeded => 402,
                ErrorCode::RateLimited => 429,
                _ => 502,
            },
            Self::Protocol(_) | Self::Io(_) => 502,
            Self::UpgradeTimeout(_) => 502,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(ProxyError::NoTunnel("a.example".into()).status(), 503);
        assert_eq!(ProxyError::RateLimited("a.example".into()).status(), 429);
        assert_eq!(ProxyError::QuotaBlocked { used: 1, limit: 1 }.status(), 402);
        assert_eq!(ProxyError::Timeout.status(), 504);
        assert_eq!(
            ProxyError::Remote(ErrorPayload::new(ErrorCode::Upstream, "boom", true)).status(),
            502
        );
        assert_eq!(
            ProxyError::Remote(ErrorPayload::new(
                ErrorCode::RequestTimeout,
                "deadline",
                true
            ))
            .status(),
            504
        );
    }
}
