//! Route publishing against the external reverse proxy's admin API.
//!
//! Routes are installed under a stable `@id` per domain so publish is an
//! idempotent upsert and withdraw is a single DELETE. Calls for the same
//! domain are serialized; the proxy admin endpoint is effectively
//! single-writer from the edge.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde_json::json;
use tokio::sync::Mutex;
use tokio::time::sleep;
use tracing::{debug, info, warn};

#[derive(Debug, thiserror::Error)]
pub enum RouteError {
    #[error("proxy admin unreachable: {0}")]
    Unreachable(String),
    #[error("proxy admin returned HTTP {status}: {body}")]
    Status { status: u16, body: String },
}

/// Installs and removes `domain → upstream` routes in the reverse proxy.
pub struct RoutePublisher {
    http: reqwest::Client,
    admin_url: String,
    server_name: String,
    locks: DashMap<String, Arc<Mutex<()>>>,
    retry_max_attempts: u32,
    retry_base_delay: Duration,
    retry_max_delay: Duration,
}

impl RoutePublisher {
    pub fn new(admin_url: &str, server_name: &str) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .connect_timeout(Duration::from_secs(10))
            .build()
            .expect("failed to build route publisher client");
        Self {
            http,
            admin_url: admin_url.trim_end_matches('/').to_string(),
            server_name: server_name.to_string(),
            locks: DashMap::new(),
            retry_max_attempts: 3,
            retry_base_delay: Duration::from_millis(200),
            retry_max_delay: Duration::from_secs(2),
        }
    }

    fn domain_lock(&self, domain: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(domain.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn route_id(domain: &str) -> String {
        format!("giraffecloud-{}", domain)
    }

    /// Stable route document installed for a domain.
    pub fn route_body(domain: &str, upstream: &str) -> serde_json::Value {
        json!({
            "@id": Self::route_id(domain),
            "match": [{ "host": [domain] }],
            "handle": [{
                "handler": "reverse_proxy",
                "upstreams": [{ "dial": upstream }],
            }],
        })
    }

    /// Install the route for a domain. Publishing twice for the same
    /// `(domain, upstream)` leaves exactly one route installed.
    pub async fn publish(&self, domain: &str, upstream: &str) -> Result<(), RouteError> {
        let lock = self.domain_lock(domain);
        let _guard = lock.lock().await;

        // drop any previous copy, then add; net effect is an upsert
        self.delete_by_id(domain).await?;

        let url = format!(
            "{}/config/apps/http/servers/{}/routes",
            self.admin_url, self.server_name
        );
        let body = Self::route_body(domain, upstream);
        let resp = self
            .send_with_retry(|| self.http.post(&url).json(&body), "route publish")
            .await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(RouteError::Status {
                status: status.as_u16(),
                body: resp.text().await.unwrap_or_default(),
            });
        }
        info!(domain, upstream, "route published");
        Ok(())
    }

    /// Remove the route for a domain. Absent routes count as success.
    pub async fn withdraw(&self, domain: &str) -> Result<(), RouteError> {
        let lock = self.domain_lock(domain);
        let _guard = lock.lock().await;
        self.delete_by_id(domain).await?;
        info!(domain, "route withdrawn");
        Ok(())
    }

    async fn delete_by_id(&self, domain: &str) -> Result<(), RouteError> {
        let url = format!("{}/id/{}", self.admin_url, Self::route_id(domain));
        let resp = self
            .send_with_retry(|| self.http.delete(&url), "route delete")
            .await?;
        let status = resp.status();
        if status.is_success() || status.as_u16() == 404 {
            debug!(domain, status = status.as_u16(), "route delete");
            return Ok(());
        }
        Err(RouteError::Status {
            status: status.as_u16(),
            body: resp.text().await.unwrap_or_default(),
        })
    }

    async fn send_with_retry<F>(
        &self,
        build: F,
        what: &str,
    ) -> Result<reqwest::Response, RouteError>
    where
        F: Fn() -> reqwest::RequestBuilder,
    {
        let mut delay = self.retry_base_delay;
        let mut attempt = 0;
        loop {
            attempt += 1;
            match build().send().await {
                Ok(resp) => return Ok(resp),
                Err(e) if attempt < self.retry_max_attempts => {
                    warn!(what, attempt, error = %e, "proxy admin call failed, retrying");
                    sleep(delay).await;
                    delay = (delay * 2).min(self.retry_max_delay);
                }
                Err(e) => return Err(RouteError::Unreachable(e.to_string())),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_route_id_is_stable() {
        assert_eq!(RoutePublisher::route_id("a.example"), "giraffecloud-a.example");
    }

    #[test]
    fn test_route_body_shape() {
        let body = RoutePublisher::route_body("a.example", "127.0.0.1:8070");
        assert_eq!(body["@id"], "giraffecloud-a.example");
        assert_eq!(body["match"][0]["host"][0], "a.example");
        assert_eq!(
            body["handle"][0]["upstreams"][0]["dial"],
            "127.0.0.1:8070"
        );
    }
}
