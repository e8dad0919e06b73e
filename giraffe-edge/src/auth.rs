//! Token → tunnel resolution against the external tunnel repository.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

/// A tunnel row as the external repository stores it.
///
/// `is_enabled` is accepted as a legacy alias of `is_active`.
#[derive(Debug, Clone, Deserialize)]
pub struct TunnelRecord {
    pub id: i64,
    pub domain: String,
    pub target_port: u16,
    pub user_id: i64,
    #[serde(alias = "is_enabled")]
    pub is_active: bool,
    #[serde(default)]
    pub client_ip: Option<String>,
}

/// Result of resolving a token: the owning user and their tunnels.
#[derive(Debug, Clone, Deserialize)]
pub struct TokenLookup {
    pub user_id: i64,
    pub tunnels: Vec<TunnelRecord>,
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("tunnel store unreachable: {0}")]
    Unreachable(String),
    #[error("tunnel store returned HTTP {0}")]
    Status(u16),
    #[error("tunnel store response malformed: {0}")]
    Malformed(String),
}

/// External repository contract consumed by the edge.
#[async_trait]
pub trait TunnelStore: Send + Sync {
    /// Resolve a token to its owner and tunnels. `None` means the token is
    /// unknown.
    async fn find_by_token(&self, token: &str) -> Result<Option<TokenLookup>, StoreError>;

    /// Record the client IP currently serving a tunnel.
    async fn update_client_ip(&self, tunnel_id: i64, client_ip: &str) -> Result<(), StoreError>;
}

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("invalid token")]
    InvalidToken,
    #[error("no tunnels configured for this account")]
    NoTunnels,
    #[error("no enabled tunnels for this account")]
    NoEnabledTunnels,
    #[error("domain {0} is not owned by this token")]
    DomainNotOwned(String),
    #[error("domain {0} is disabled")]
    DomainDisabled(String),
    #[error("multiple enabled tunnels, specify one of: {}", .0.join(", "))]
    AmbiguousSelection(Vec<String>),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Resolves handshakes to tunnel records, enforcing the enabled flag and
/// ownership.
pub struct Authenticator {
    store: Arc<dyn TunnelStore>,
}

impl Authenticator {
    pub fn new(store: Arc<dyn TunnelStore>) -> Self {
        Self { store }
    }

    pub async fn authenticate(
        &self,
        token: &str,
        requested_domain: Option<&str>,
    ) -> Result<TunnelRecord, AuthError> {
        if token.is_empty() {
            return Err(AuthError::InvalidToken);
        }

        let lookup = self
            .store
            .find_by_token(token)
            .await?
            .ok_or(AuthError::InvalidToken)?;

        if lookup.tunnels.is_empty() {
            return Err(AuthError::NoTunnels);
        }

        if let Some(domain) = requested_domain {
            let record = lookup
                .tunnels
                .iter()
                .find(|t| t.domain == domain)
                .ok_or_else(|| AuthError::DomainNotOwned(domain.to_string()))?;
            if record.user_id != lookup.user_id {
                return Err(AuthError::DomainNotOwned(domain.to_string()));
            }
            if !record.is_active {
                return Err(AuthError::DomainDisabled(domain.to_string()));
            }
            return Ok(record.clone());
        }

        let enabled: Vec<&TunnelRecord> =
            lookup.tunnels.iter().filter(|t| t.is_active).collect();
        match enabled.as_slice() {
            [] => Err(AuthError::NoEnabledTunnels),
            [only] => {
                debug!(domain = %only.domain, "single enabled tunnel selected");
                Ok((*only).clone())
            }
            many => Err(AuthError::AmbiguousSelection(
                many.iter().map(|t| t.domain.clone()).collect(),
            )),
        }
    }

    pub async fn record_client_ip(
        &self,
        tunnel_id: i64,
        client_ip: &str,
    ) -> Result<(), StoreError> {
        self.store.update_client_ip(tunnel_id, client_ip).await
    }
}

/// HTTP-backed store against the tunnel API service.
pub struct HttpTunnelStore {
    http: reqwest::Client,
    base_url: String,
    token: String,
}

impl HttpTunnelStore {
    pub fn new(base_url: &str, api_token: &str, timeout: Duration) -> Self {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .build()
            .expect("failed to build tunnel store client");
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            token: api_token.to_string(),
        }
    }
}

#[async_trait]
impl TunnelStore for HttpTunnelStore {
    async fn find_by_token(&self, token: &str) -> Result<Option<TokenLookup>, StoreError> {
        let url = format!("{}/v1/tunnels/by-token", self.base_url);
        let resp = self
            .http
            .get(&url)
            .bearer_auth(&self.token)
            .query(&[("token", token)])
            .send()
            .await
            .map_err(|e| StoreError::Unreachable(e.to_string()))?;

        match resp.status().as_u16() {
            200 => resp
                .json::<TokenLookup>()
                .await
                .map(Some)
                .map_err(|e| StoreError::Malformed(e.to_string())),
            404 => Ok(None),
            code => Err(StoreError::Status(code)),
        }
    }

    async fn update_client_ip(&self, tunnel_id: i64, client_ip: &str) -> Result<(), StoreError> {
        let url = format!("{}/v1/tunnels/{}/client-ip", self.base_url, tunnel_id);
        let resp = self
            .http
            .put(&url)
            .bearer_auth(&self.token)
            .json(&serde_json::json!({ "client_ip": client_ip }))
            .send()
            .await
            .map_err(|e| StoreError::Unreachable(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(StoreError::Status(resp.status().as_u16()));
        }
        Ok(())
    }
}

/// In-memory store used by tests and local development.
#[derive(Default)]
pub struct MemoryTunnelStore {
    tokens: parking_lot::RwLock<std::collections::HashMap<String, TokenLookup>>,
}

impl MemoryTunnelStore {
    pub fn with_tunnel(token: &str, record: TunnelRecord) -> Self {
        let store = Self::default();
        store.insert(token, record);
        store
    }

    pub fn insert(&self, token: &str, record: TunnelRecord) {
        let mut tokens = self.tokens.write();
        let entry = tokens.entry(token.to_string()).or_insert(TokenLookup {
            user_id: record.user_id,
            tunnels: Vec::new(),
        });
        entry.tunnels.push(record);
    }
}

#[async_trait]
impl TunnelStore for MemoryTunnelStore {
    async fn find_by_token(&self, token: &str) -> Result<Option<TokenLookup>, StoreError> {
        Ok(self.tokens.read().get(token).cloned())
    }

    async fn update_client_ip(&self, tunnel_id: i64, client_ip: &str) -> Result<(), StoreError> {
        let mut tokens = self.tokens.write();
        for lookup in tokens.values_mut() {
            for tunnel in &mut lookup.tunnels {
                if tunnel.id == tunnel_id {
                    tunnel.client_ip = Some(client_ip.to_string());
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: i64, domain: &str, active: bool) -> TunnelRecord {
        TunnelRecord {
            id,
            domain: domain.into(),
            target_port: 8080,
            user_id: 1,
            is_active: active,
            client_ip: None,
        }
    }

    fn auth_with(records: Vec<TunnelRecord>) -> Authenticator {
        let store = MemoryTunnelStore::default();
        for r in records {
            store.insert("tok", r);
        }
        Authenticator::new(Arc::new(store))
    }

    #[tokio::test]
    async fn test_unknown_token() {
        let auth = auth_with(vec![record(1, "a.example", true)]);
        assert!(matches!(
            auth.authenticate("nope", None).await,
            Err(AuthError::InvalidToken)
        ));
    }

    #[tokio::test]
    async fn test_empty_token() {
        let auth = auth_with(vec![record(1, "a.example", true)]);
        assert!(matches!(
            auth.authenticate("", Some("a.example")).await,
            Err(AuthError::InvalidToken)
        ));
    }

    #[tokio::test]
    async fn test_single_enabled_tiebreak() {
        let auth = auth_with(vec![record(1, "a.example", true), record(2, "b.example", false)]);
        let rec = auth.authenticate("tok", None).await.unwrap();
        assert_eq!(rec.domain, "a.example");
    }

    #[tokio::test]
    async fn test_ambiguous_selection_lists_candidates() {
        let auth = auth_with(vec![record(1, "a.example", true), record(2, "b.example", true)]);
        match auth.authenticate("tok", None).await {
            Err(AuthError::AmbiguousSelection(domains)) => {
                assert_eq!(domains, vec!["a.example", "b.example"]);
            }
            other => panic!("expected ambiguous selection, got {:?}", other.map(|r| r.domain)),
        }
    }

    #[tokio::test]
    async fn test_no_enabled_tunnels() {
        let auth = auth_with(vec![record(1, "a.example", false)]);
        assert!(matches!(
            auth.authenticate("tok", None).await,
            Err(AuthError::NoEnabledTunnels)
        ));
    }

    #[tokio::test]
    async fn test_domain_not_owned() {
        let auth = auth_with(vec![record(1, "a.example", true)]);
        assert!(matches!(
            auth.authenticate("tok", Some("other.example")).await,
            Err(AuthError::DomainNotOwned(_))
        ));
    }

    #[tokio::test]
    async fn test_domain_disabled() {
        let auth = auth_with(vec![record(1, "a.example", false)]);
        assert!(matches!(
            auth.authenticate("tok", Some("a.example")).await,
            Err(AuthError::DomainDisabled(_))
        ));
    }

    #[test]
    fn test_is_enabled_alias() {
        let rec: TunnelRecord = serde_json::from_str(
            r#"{"id":1,"domain":"a.example","target_port":80,"user_id":1,"is_enabled":true}"#,
        )
        .unwrap();
        assert!(rec.is_active);
    }
}
