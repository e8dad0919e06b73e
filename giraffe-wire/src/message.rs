//! Typed payloads carried inside frames.
//!
//! Heads and control messages travel as JSON. Header lists are ordered
//! `(name, value)` pairs so duplicates (e.g. multiple Set-Cookie) survive
//! the trip.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::frame::ProtocolError;

/// Head of a proxied HTTP request (edge → client).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestHead {
    pub method: String,
    pub path: String,
    pub headers: Vec<(String, String)>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_length: Option<u64>,
    /// End-user IP as seen by the upstream proxy.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_ip: Option<String>,
}

impl RequestHead {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Head of a proxied HTTP response (client → edge).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseHead {
    pub status: u16,
    pub headers: Vec<(String, String)>,
}

impl ResponseHead {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Session lifecycle states reported in Status frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TunnelState {
    New,
    Handshaking,
    Connected,
    Closing,
    Closed,
}

/// Control sub-union. The tag space is open-ended; receivers ignore
/// variants they do not understand at the frame layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlMessage {
    /// First frame on every stream.
    Handshake {
        token: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        domain: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target_port: Option<u16>,
        #[serde(default)]
        capabilities: Vec<String>,
        client_version: String,
    },
    Status {
        state: TunnelState,
        domain: String,
        target_port: u16,
        connected_at_ms: u64,
        last_activity_ms: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error_message: Option<String>,
    },
    /// Edge asks the client to open a transport on demand.
    EstablishRequest {
        proto: EstablishProto,
        domain: String,
        request_id: u64,
        timeout_ms: u64,
    },
    /// Runtime-adjustable client settings.
    Config {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target_port: Option<u16>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        chunk_threshold: Option<u64>,
    },
    /// Periodic client-side counters.
    Metrics {
        active_streams: u64,
        total_requests: u64,
        bytes_in: u64,
        bytes_out: u64,
        reconnects: u64,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EstablishProto {
    Tcp,
}

impl ControlMessage {
    pub fn to_payload(&self) -> Result<Bytes, ProtocolError> {
        serde_json::to_vec(self)
            .map(Bytes::from)
            .map_err(ProtocolError::BadHead)
    }

    pub fn from_payload(payload: &[u8]) -> Result<Self, ProtocolError> {
        serde_json::from_slice(payload).map_err(ProtocolError::BadHead)
    }
}

/// Error codes carried in Error frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    HandshakeRequired,
    AuthFailed,
    RequestTimeout,
    RateLimited,
    QuotaExceeded,
    TunnelDisconnected,
    TunnelIdle,
    FrameTooLarge,
    Upstream,
    Internal,
}

/// Failure encoded on the stream instead of raised across it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub code: ErrorCode,
    pub message: String,
    pub retryable: bool,
}

impl ErrorPayload {
    pub fn new(code: ErrorCode, message: impl Into<String>, retryable: bool) -> Self {
        Self {
            code,
            message: message.into(),
            retryable,
        }
    }

    pub fn to_payload(&self) -> Result<Bytes, ProtocolError> {
        serde_json::to_vec(self)
            .map(Bytes::from)
            .map_err(ProtocolError::BadHead)
    }

    pub fn from_payload(payload: &[u8]) -> Result<Self, ProtocolError> {
        serde_json::from_slice(payload).map_err(ProtocolError::BadHead)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_control_roundtrip() {
        let msg = ControlMessage::Handshake {
            token: "tok_123".into(),
            domain: Some("a.example".into()),
            target_port: Some(8080),
            capabilities: vec!["chunked".into(), "raw".into()],
            client_version: "0.3.0".into(),
        };
        let payload = msg.to_payload().unwrap();
        assert_eq!(ControlMessage::from_payload(&payload).unwrap(), msg);
    }

    #[test]
    fn test_establish_request_tag() {
        let msg = ControlMessage::EstablishRequest {
            proto: EstablishProto::Tcp,
            domain: "a.example".into(),
            request_id: 17,
            timeout_ms: 30_000,
        };
        let json = String::from_utf8(msg.to_payload().unwrap().to_vec()).unwrap();
        assert!(json.contains("\"type\":\"establish_request\""));
        assert!(json.contains("\"proto\":\"tcp\""));
    }

    #[test]
    fn test_error_payload_roundtrip() {
        let err = ErrorPayload::new(ErrorCode::RateLimited, "slow down", true);
        let payload = err.to_payload().unwrap();
        let parsed = ErrorPayload::from_payload(&payload).unwrap();
        assert_eq!(parsed, err);
        assert!(parsed.retryable);
    }

    #[test]
    fn test_header_lookup_case_insensitive() {
        let head = RequestHead {
            method: "GET".into(),
            path: "/hello".into(),
            headers: vec![
                ("Host".into(), "a.example".into()),
                ("Set-Cookie".into(), "a=1".into()),
                ("Set-Cookie".into(), "b=2".into()),
            ],
            content_length: None,
            client_ip: None,
        };
        assert_eq!(head.header("host"), Some("a.example"));
        // duplicates preserved in order; lookup returns the first
        assert_eq!(head.header("set-cookie"), Some("a=1"));
    }

    #[test]
    fn test_unknown_control_variant_rejected() {
        let err = ControlMessage::from_payload(br#"{"type":"future_thing"}"#).unwrap_err();
        assert!(!err.is_recoverable());
    }
}
