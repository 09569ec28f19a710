use std::{collections::HashMap, sync::Arc, time::Duration};

use anyhow::Context;
use async_trait::async_trait;
use serde::Deserialize;

pub const TYPE_APISIX: &str = "apisix";
pub const TYPE_NGINX: &str = "nginx";
pub const TYPE_CADDY: &str = "caddy";

/// External HTTP router programmed over REST. The gateway only ever needs
/// these two operations; everything else about the router is opaque.
#[async_trait]
pub trait HttpRoute: Send + Sync {
    /// Install or update one HTTP route rule; `params` is passed through
    /// verbatim to the router's admin API.
    async fn update_route(&self, params: &serde_json::Value) -> anyhow::Result<()>;

    /// Install TLS material for a set of SNIs.
    async fn update_ssl(
        &self,
        id: &str,
        cert: &str,
        key: &str,
        snis: &[String],
    ) -> anyhow::Result<()>;
}

/// Type tag -> adapter, built once at config load, read-only afterwards.
/// Must exist before any http/https listener starts serving.
pub struct RouteRegistry {
    routes: HashMap<String, Arc<dyn HttpRoute>>,
}

impl std::fmt::Debug for RouteRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RouteRegistry")
            .field("routes", &self.routes.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl RouteRegistry {
    pub fn empty() -> Self {
        Self {
            routes: HashMap::new(),
        }
    }

    /// `configs` maps a type tag to that adapter's raw JSON config string.
    pub fn from_config(configs: &HashMap<String, String>) -> anyhow::Result<Self> {
        let mut routes: HashMap<String, Arc<dyn HttpRoute>> = HashMap::new();
        for (tag, raw) in configs {
            let route: Arc<dyn HttpRoute> = match tag.as_str() {
                TYPE_APISIX => Arc::new(
                    ApisixRoute::new(raw)
                        .with_context(|| format!("init {tag} route adapter"))?,
                ),
                TYPE_NGINX | TYPE_CADDY => {
                    anyhow::bail!("route type {tag} not supported")
                }
                other => anyhow::bail!("route type {other} not supported"),
            };
            routes.insert(tag.clone(), route);
        }
        Ok(Self { routes })
    }

    pub fn get(&self, tag: &str) -> Option<Arc<dyn HttpRoute>> {
        self.routes.get(tag).cloned()
    }
}

#[derive(Debug, Clone, Deserialize)]
struct ApisixConfig {
    api: String,
    key: String,
}

/// APISIX admin-API adapter.
pub struct ApisixRoute {
    conf: ApisixConfig,
    http: reqwest::Client,
}

impl ApisixRoute {
    pub fn new(raw: &str) -> anyhow::Result<Self> {
        let conf: ApisixConfig =
            serde_json::from_str(raw).context("parse apisix config")?;
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .context("build apisix http client")?;
        Ok(Self { conf, http })
    }

    async fn put(&self, url: String, body: &serde_json::Value) -> anyhow::Result<()> {
        let resp = self
            .http
            .put(&url)
            .header("X-API-KEY", &self.conf.key)
            .json(body)
            .send()
            .await
            .with_context(|| format!("PUT {url}"))?;

        let status = resp.status();
        if status != reqwest::StatusCode::OK && status != reqwest::StatusCode::CREATED {
            let msg = resp.text().await.unwrap_or_default();
            anyhow::bail!("invalid http code {status} msg {msg}");
        }
        Ok(())
    }
}

#[async_trait]
impl HttpRoute for ApisixRoute {
    async fn update_route(&self, params: &serde_json::Value) -> anyhow::Result<()> {
        let url = format!("{}/apisix/admin/routes", self.conf.api);
        self.put(url, params).await
    }

    async fn update_ssl(
        &self,
        id: &str,
        cert: &str,
        key: &str,
        snis: &[String],
    ) -> anyhow::Result<()> {
        let url = format!("{}/apisix/admin/ssls/{id}", self.conf.api);
        let body = serde_json::json!({
            "cert": cert,
            "key": key,
            "snis": snis,
        });
        self.put(url, &body)
            .await
            .context("create ssl fail")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[test]
    fn unsupported_route_types_fail_at_init() {
        for tag in [TYPE_NGINX, TYPE_CADDY, "traefik"] {
            let mut configs = HashMap::new();
            configs.insert(tag.to_string(), "{}".to_string());
            let err = RouteRegistry::from_config(&configs).unwrap_err();
            assert!(err.to_string().contains("not supported"), "{err}");
        }
    }

    #[test]
    fn bad_apisix_config_fails_at_init() {
        let mut configs = HashMap::new();
        configs.insert(TYPE_APISIX.to_string(), "not json".to_string());
        assert!(RouteRegistry::from_config(&configs).is_err());
    }

    // Minimal canned admin API: answers every request with `status` and
    // records the request head + body.
    async fn spawn_admin_stub(
        status: &'static str,
    ) -> (std::net::SocketAddr, tokio::sync::mpsc::Receiver<String>) {
        let ln = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = ln.local_addr().unwrap();
        let (tx, rx) = tokio::sync::mpsc::channel(4);

        tokio::spawn(async move {
            loop {
                let Ok((mut conn, _)) = ln.accept().await else {
                    break;
                };
                let tx = tx.clone();
                tokio::spawn(async move {
                    let mut buf = vec![0u8; 64 * 1024];
                    let mut got = Vec::new();
                    // Read until the JSON body is complete (no keep-alive
                    // pipelining in this stub).
                    loop {
                        let n = conn.read(&mut buf).await.unwrap_or(0);
                        if n == 0 {
                            break;
                        }
                        got.extend_from_slice(&buf[..n]);
                        let text = String::from_utf8_lossy(&got);
                        if let Some(idx) = text.find("\r\n\r\n") {
                            let body = &text[idx + 4..];
                            if let Some(cl) = text
                                .lines()
                                .find_map(|l| l.strip_prefix("content-length: "))
                                .or_else(|| {
                                    text.lines()
                                        .find_map(|l| l.strip_prefix("Content-Length: "))
                                })
                            {
                                if body.len() >= cl.trim().parse::<usize>().unwrap_or(0) {
                                    break;
                                }
                            }
                        }
                    }
                    let _ = tx.send(String::from_utf8_lossy(&got).into_owned()).await;
                    let resp = format!(
                        "HTTP/1.1 {status}\r\ncontent-length: 2\r\nconnection: close\r\n\r\n{{}}"
                    );
                    let _ = conn.write_all(resp.as_bytes()).await;
                });
            }
        });

        (addr, rx)
    }

    #[tokio::test]
    async fn update_route_puts_to_admin_api_with_key() {
        let (addr, mut rx) = spawn_admin_stub("201 Created").await;

        let raw = format!(r#"{{"api":"http://{addr}","key":"secret-key"}}"#);
        let apisix = ApisixRoute::new(&raw).unwrap();
        apisix
            .update_route(&serde_json::json!({"uri": "/*", "id": "r1"}))
            .await
            .unwrap();

        let req = rx.recv().await.unwrap();
        assert!(req.starts_with("PUT /apisix/admin/routes"), "{req}");
        assert!(req.to_lowercase().contains("x-api-key: secret-key"), "{req}");
        assert!(req.contains(r#""uri":"/*""#), "{req}");
    }

    #[tokio::test]
    async fn update_ssl_targets_the_ssl_endpoint() {
        let (addr, mut rx) = spawn_admin_stub("200 OK").await;

        let raw = format!(r#"{{"api":"http://{addr}","key":"k"}}"#);
        let apisix = ApisixRoute::new(&raw).unwrap();
        apisix
            .update_ssl("s1", "CERT", "KEY", &["example.com".into()])
            .await
            .unwrap();

        let req = rx.recv().await.unwrap();
        assert!(req.starts_with("PUT /apisix/admin/ssls/s1"), "{req}");
        assert!(req.contains(r#""snis":["example.com"]"#), "{req}");
    }

    #[tokio::test]
    async fn non_2xx_is_an_error() {
        let (addr, _rx) = spawn_admin_stub("500 Internal Server Error").await;

        let raw = format!(r#"{{"api":"http://{addr}","key":"k"}}"#);
        let apisix = ApisixRoute::new(&raw).unwrap();
        let err = apisix
            .update_route(&serde_json::json!({"uri": "/*"}))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("invalid http code"), "{err}");
    }
}
