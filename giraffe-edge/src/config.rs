use clap::Parser;

/// GiraffeCloud edge: terminates tunnel transports and routes public
/// HTTP/WebSocket traffic to connected client agents.
///
/// Listens on three ports: the ingress port (fed by the public reverse
/// proxy), the RPC tunnel port (mutual TLS, client agents dial in), and the
/// raw-byte tunnel port (server TLS, WebSocket forwarding).
#[derive(Parser, Debug, Clone)]
#[command(version, about)]
pub struct EdgeConfig {
    /// Port receiving proxied public traffic from the reverse proxy
    #[arg(long, env = "GIRAFFE_EDGE_INGRESS_PORT", default_value_t = 8070)]
    pub ingress_port: u16,

    /// RPC tunnel port (mutual TLS)
    #[arg(long, env = "GIRAFFE_EDGE_RPC_PORT", default_value_t = 4443)]
    pub rpc_port: u16,

    /// Raw-byte tunnel port (server TLS)
    #[arg(long, env = "GIRAFFE_EDGE_RAW_PORT", default_value_t = 4444)]
    pub raw_port: u16,

    /// Path to the edge TLS certificate PEM file
    #[arg(long, env = "GIRAFFE_EDGE_TLS_CERT", default_value = "edge-cert.pem")]
    pub tls_cert: String,

    /// Path to the edge TLS private key PEM file
    #[arg(long, env = "GIRAFFE_EDGE_TLS_KEY", default_value = "edge-key.pem")]
    pub tls_key: String,

    /// Path to the CA bundle that signs client certificates
    #[arg(long, env = "GIRAFFE_EDGE_CLIENT_CA", default_value = "tunnel-ca.pem")]
    pub client_ca: String,

    /// Generate a self-signed certificate pair if the files are absent
    #[arg(long, env = "GIRAFFE_EDGE_DEV_TLS", default_value_t = false)]
    pub dev_tls: bool,

    /// Reverse proxy admin API base URL
    #[arg(
        long,
        env = "GIRAFFE_EDGE_PROXY_ADMIN_URL",
        default_value = "http://127.0.0.1:2019"
    )]
    pub proxy_admin_url: String,

    /// Name of the reverse proxy server block routes are installed under
    #[arg(long, env = "GIRAFFE_EDGE_PROXY_SERVER", default_value = "srv0")]
    pub proxy_server: String,

    /// Upstream address published to the reverse proxy for tunneled domains
    /// (defaults to 127.0.0.1:<ingress_port>)
    #[arg(long, env = "GIRAFFE_EDGE_ADVERTISE_ADDR")]
    pub advertise_addr: Option<String>,

    /// Publish routes pointing straight at the client IP and target port
    /// instead of the edge ingress
    #[arg(long, env = "GIRAFFE_EDGE_ROUTE_DIRECT", default_value_t = false)]
    pub route_direct: bool,

    /// Tunnel API base URL (token lookups, quota, usage)
    #[arg(
        long,
        env = "GIRAFFE_EDGE_API_URL",
        default_value = "http://127.0.0.1:8081"
    )]
    pub api_url: String,

    /// Bearer token for the tunnel API
    #[arg(long, env = "GIRAFFE_EDGE_API_TOKEN", default_value = "")]
    pub api_token: String,

    /// Per-request deadline in seconds
    #[arg(long, env = "GIRAFFE_EDGE_REQUEST_TIMEOUT", default_value_t = 30)]
    pub request_timeout_secs: u64,

    /// How long a WebSocket upgrade waits for an on-demand raw connection
    #[arg(long, env = "GIRAFFE_EDGE_UPGRADE_WAIT", default_value_t = 30)]
    pub upgrade_wait_secs: u64,

    /// Close sessions with no client frames for this long
    #[arg(long, env = "GIRAFFE_EDGE_IDLE_TIMEOUT", default_value_t = 600)]
    pub idle_timeout_secs: u64,

    /// Cadence of server Status frames
    #[arg(long, env = "GIRAFFE_EDGE_STATUS_INTERVAL", default_value_t = 30)]
    pub status_interval_secs: u64,

    /// Per-domain request rate limit per minute
    #[arg(long, env = "GIRAFFE_EDGE_RATE_LIMIT_PER_MIN", default_value_t = 5000)]
    pub rate_limit_per_min: u64,

    /// Per-domain rate limit burst
    #[arg(long, env = "GIRAFFE_EDGE_RATE_BURST", default_value_t = 500)]
    pub rate_burst: u64,

    /// Frame cap in MiB; bodies beyond this go down the chunked path
    #[arg(long, env = "GIRAFFE_EDGE_MAX_FRAME_MIB", default_value_t = 16)]
    pub max_frame_mib: usize,

    /// Retire raw connections older than this many seconds
    #[arg(long, env = "GIRAFFE_EDGE_RAW_MAX_AGE", default_value_t = 600)]
    pub raw_max_age_secs: u64,

    /// Retire raw connections after this many served requests
    #[arg(long, env = "GIRAFFE_EDGE_RAW_MAX_REQUESTS", default_value_t = 50)]
    pub raw_max_requests: u32,

    /// Cadence of the raw pool liveness sweep
    #[arg(long, env = "GIRAFFE_EDGE_SWEEP_INTERVAL", default_value_t = 60)]
    pub sweep_interval_secs: u64,

    /// TLS handshake timeout in seconds
    #[arg(long, env = "GIRAFFE_EDGE_TLS_HANDSHAKE_TIMEOUT", default_value_t = 10)]
    pub tls_handshake_timeout_secs: u64,

    /// TCP keepalive on tunnel sockets in seconds (0 disables)
    #[arg(long, env = "GIRAFFE_EDGE_TCP_KEEPALIVE", default_value_t = 60)]
    pub tcp_keepalive_secs: u64,

    /// Cap on graceful shutdown before hard stop
    #[arg(long, env = "GIRAFFE_EDGE_SHUTDOWN_GRACE", default_value_t = 30)]
    pub shutdown_grace_secs: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "GIRAFFE_EDGE_LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "GIRAFFE_EDGE_LOG_JSON", default_value_t = false)]
    pub log_json: bool,
}

impl EdgeConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.request_timeout_secs == 0 {
            anyhow::bail!("request timeout must be greater than zero");
        }
        if self.ingress_port == 0 || self.rpc_port == 0 || self.raw_port == 0 {
            anyhow::bail!("listen ports must be non-zero");
        }
        if self.max_frame_mib == 0 {
            anyhow::bail!("frame cap must be at least 1 MiB");
        }
        if self.rate_limit_per_min == 0 {
            anyhow::bail!("rate limit must be greater than zero");
        }
        Ok(())
    }

    pub fn max_frame_bytes(&self) -> usize {
        self.max_frame_mib * 1024 * 1024
    }

    /// Codec cap: a full-threshold body plus head JSON must still fit one
    /// frame, so the codec gets head room above the body threshold.
    pub fn codec_frame_cap(&self) -> usize {
        self.max_frame_bytes() + 128 * 1024
    }

    /// Body-size threshold above which transfers use the chunked path.
    pub fn chunk_threshold(&self) -> u64 {
        self.max_frame_bytes() as u64
    }

    /// Upstream dial address published for a connected tunnel.
    pub fn route_upstream(&self, client_ip: &str, target_port: u16) -> String {
        if self.route_direct {
            return format!("{}:{}", client_ip, target_port);
        }
        match &self.advertise_addr {
            Some(addr) => addr.clone(),
            None => format!("127.0.0.1:{}", self.ingress_port),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> EdgeConfig {
        EdgeConfig::parse_from(["giraffe-edge"])
    }

    #[test]
    fn test_defaults_are_valid() {
        base().validate().unwrap();
    }

    #[test]
    fn test_zero_deadline_rejected() {
        let mut cfg = base();
        cfg.request_timeout_secs = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_zero_port_rejected() {
        let mut cfg = base();
        cfg.ingress_port = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_route_upstream_modes() {
        let mut cfg = base();
        assert_eq!(cfg.route_upstream("203.0.113.9", 8080), "127.0.0.1:8070");
        cfg.advertise_addr = Some("10.0.0.5:8070".into());
        assert_eq!(cfg.route_upstream("203.0.113.9", 8080), "10.0.0.5:8070");
        cfg.route_direct = true;
        assert_eq!(cfg.route_upstream("203.0.113.9", 8080), "203.0.113.9:8080");
    }
}
