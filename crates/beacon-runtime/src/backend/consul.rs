//! Consul agent HTTP API backend.

use std::collections::BTreeMap;
use std::time::Duration;

use beacon_core::cluster::{
    BackendFuture, BlockingQuery, CheckDescriptor, DiscoveryBackend, HealthStatus, QueryResponse,
    ServiceEntry, ServiceIdentity,
};
use beacon_core::config::DiscoveryConfig;
use beacon_core::BackendError;
use reqwest::{Client, RequestBuilder, Response, Url};
use serde::Serialize;

const INDEX_HEADER: &str = "X-Consul-Index";
const TOKEN_HEADER: &str = "X-Consul-Token";

/// Connection settings for a Consul agent.
#[derive(Debug, Clone)]
pub struct ConsulConfig {
    /// Agent base URL, e.g. `http://127.0.0.1:8500`.
    pub address: String,
    /// ACL token.
    pub token: Option<String>,
    /// Datacenter for health queries.
    pub datacenter: Option<String>,
    /// Timeout for non-blocking calls.
    pub request_timeout: Duration,
}

impl Default for ConsulConfig {
    fn default() -> Self {
        Self::from(&DiscoveryConfig::default())
    }
}

impl From<&DiscoveryConfig> for ConsulConfig {
    fn from(config: &DiscoveryConfig) -> Self {
        Self {
            address: config.address.clone(),
            token: config.token().map(str::to_string),
            datacenter: config.datacenter.clone(),
            request_timeout: config.request_timeout(),
        }
    }
}

/// Discovery backend talking to a local Consul agent.
pub struct ConsulBackend {
    http_client: Client,
    base: Url,
    config: ConsulConfig,
}

impl ConsulBackend {
    /// Create a backend for the agent at `config.address`.
    pub fn new(config: ConsulConfig) -> beacon_core::Result<Self> {
        Self::with_client(config, Client::new())
    }

    /// Create a backend reusing an existing HTTP client.
    pub fn with_client(config: ConsulConfig, http_client: Client) -> beacon_core::Result<Self> {
        let address = if config.address.starts_with("http://")
            || config.address.starts_with("https://")
        {
            config.address.clone()
        } else {
            format!("http://{}", config.address)
        };

        let base = Url::parse(&address).map_err(|e| {
            beacon_core::BeaconError::Config(format!(
                "invalid discovery address '{}': {}",
                config.address, e
            ))
        })?;
        if base.cannot_be_a_base() {
            return Err(beacon_core::BeaconError::Config(format!(
                "invalid discovery address '{}'",
                config.address
            )));
        }

        Ok(Self {
            http_client,
            base,
            config,
        })
    }

    /// Build an API URL from path segments, percent-encoding each one.
    fn endpoint(&self, segments: &[&str]) -> Url {
        let mut url = self.base.clone();
        // Base URLs are checked in the constructor, so segments are always available.
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().push("v1").extend(segments);
        }
        url
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.config.token {
            Some(token) => request.header(TOKEN_HEADER, token),
            None => request,
        }
    }

    async fn send(&self, request: RequestBuilder) -> Result<Response, BackendError> {
        let response = self
            .authorize(request)
            .send()
            .await
            .map_err(|e| BackendError::Unreachable(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let message = response
            .text()
            .await
            .unwrap_or_default()
            .trim()
            .to_string();
        Err(BackendError::Rejected {
            status: status.as_u16(),
            message,
        })
    }

    async fn register_service(
        &self,
        identity: &ServiceIdentity,
        check: &CheckDescriptor,
    ) -> Result<(), BackendError> {
        let url = self.endpoint(&["agent", "service", "register"]);
        let payload = RegisterPayload::new(identity, check);

        tracing::debug!(%url, service_id = %identity.service_id(), "Registering service");
        self.send(
            self.http_client
                .put(url)
                .timeout(self.config.request_timeout)
                .json(&payload),
        )
        .await?;
        Ok(())
    }

    async fn deregister_service(&self, service_id: &str) -> Result<(), BackendError> {
        let url = self.endpoint(&["agent", "service", "deregister", service_id]);
        self.send(self.http_client.put(url).timeout(self.config.request_timeout))
            .await?;
        Ok(())
    }

    async fn update_ttl(
        &self,
        check_id: &str,
        status: HealthStatus,
        output: &str,
    ) -> Result<(), BackendError> {
        let url = self.endpoint(&["agent", "check", "update", check_id]);
        let payload = CheckUpdatePayload {
            status: status.as_str(),
            output,
        };
        self.send(
            self.http_client
                .put(url)
                .timeout(self.config.request_timeout)
                .json(&payload),
        )
        .await?;
        Ok(())
    }

    async fn query_health(&self, query: &BlockingQuery) -> Result<QueryResponse, BackendError> {
        let url = self.endpoint(&["health", "service", query.service.as_str()]);
        let mut request = self
            .http_client
            .get(url)
            .timeout(query_timeout(query.wait, self.config.request_timeout));

        let mut params: Vec<(&str, String)> = vec![("wait", go_duration(query.wait))];
        if query.passing_only {
            params.push(("passing", "true".to_string()));
        }
        if query.index > 0 {
            params.push(("index", query.index.to_string()));
        }
        if let Some(tag) = &query.tag {
            params.push(("tag", tag.clone()));
        }
        if let Some(dc) = &self.config.datacenter {
            params.push(("dc", dc.clone()));
        }
        request = request.query(&params);

        let response = self.send(request).await?;
        let index = parse_index(response.headers().get(INDEX_HEADER))?;
        let body = response
            .bytes()
            .await
            .map_err(|e| BackendError::Unreachable(e.to_string()))?;
        let entries = decode_entries(&body)?;

        Ok(QueryResponse { index, entries })
    }
}

impl DiscoveryBackend for ConsulBackend {
    fn register<'a>(
        &'a self,
        identity: &'a ServiceIdentity,
        check: &'a CheckDescriptor,
    ) -> BackendFuture<'a, ()> {
        Box::pin(self.register_service(identity, check))
    }

    fn deregister<'a>(&'a self, service_id: &'a str) -> BackendFuture<'a, ()> {
        Box::pin(self.deregister_service(service_id))
    }

    fn update_check<'a>(
        &'a self,
        check_id: &'a str,
        status: HealthStatus,
        output: &'a str,
    ) -> BackendFuture<'a, ()> {
        Box::pin(self.update_ttl(check_id, status, output))
    }

    fn blocking_query<'a>(&'a self, query: &'a BlockingQuery) -> BackendFuture<'a, QueryResponse> {
        Box::pin(self.query_health(query))
    }

    fn name(&self) -> &'static str {
        "consul"
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct RegisterPayload<'a> {
    #[serde(rename = "ID")]
    id: &'a str,
    name: &'a str,
    tags: Vec<&'a str>,
    address: &'a str,
    port: u16,
    meta: &'a BTreeMap<String, String>,
    check: CheckPayload<'a>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct CheckPayload<'a> {
    #[serde(rename = "CheckID")]
    check_id: &'a str,
    name: String,
    #[serde(rename = "TTL")]
    ttl: String,
    deregister_critical_service_after: String,
}

impl<'a> RegisterPayload<'a> {
    fn new(identity: &'a ServiceIdentity, check: &'a CheckDescriptor) -> Self {
        Self {
            id: identity.service_id(),
            name: identity.service_name(),
            tags: identity.tags().iter().map(String::as_str).collect(),
            address: identity.address(),
            port: identity.port(),
            meta: identity.metadata(),
            check: CheckPayload {
                check_id: check.check_id(),
                name: format!("{} TTL", identity.service_name()),
                ttl: go_duration(check.ttl()),
                deregister_critical_service_after: go_duration(check.deregister_after()),
            },
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct CheckUpdatePayload<'a> {
    status: &'a str,
    output: &'a str,
}

/// Format a duration the way the agent parses it (`10s`, `1500ms`).
fn go_duration(duration: Duration) -> String {
    if duration.subsec_nanos() == 0 {
        format!("{}s", duration.as_secs())
    } else {
        format!("{}ms", duration.as_millis())
    }
}

/// HTTP timeout for a blocking query. The agent adds up to `wait / 16` of
/// jitter to the requested wait.
fn query_timeout(wait: Duration, request_timeout: Duration) -> Duration {
    wait + wait / 16 + request_timeout
}

fn parse_index(header: Option<&reqwest::header::HeaderValue>) -> Result<u64, BackendError> {
    let value = header
        .ok_or_else(|| BackendError::Decode(format!("missing {} header", INDEX_HEADER)))?;
    value
        .to_str()
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
        .ok_or_else(|| BackendError::Decode(format!("invalid {} header: {:?}", INDEX_HEADER, value)))
}

/// Decode a health endpoint body.
fn decode_entries(body: &[u8]) -> Result<Vec<ServiceEntry>, BackendError> {
    serde_json::from_slice(body).map_err(|e| BackendError::Decode(e.to_string()))
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    use super::*;

    fn backend(address: &str) -> ConsulBackend {
        ConsulBackend::new(ConsulConfig {
            address: address.to_string(),
            token: Some("secret".into()),
            datacenter: Some("dc1".into()),
            request_timeout: Duration::from_secs(2),
        })
        .unwrap()
    }

    #[test]
    fn test_endpoint_encodes_segments() {
        let backend = backend("127.0.0.1:8500");
        let url = backend.endpoint(&["agent", "service", "deregister", "login service"]);
        assert_eq!(
            url.as_str(),
            "http://127.0.0.1:8500/v1/agent/service/deregister/login%20service"
        );

        let backend = backend_with_path("http://consul.local:8500/");
        let url = backend.endpoint(&["health", "service", "mycluster"]);
        assert_eq!(url.as_str(), "http://consul.local:8500/v1/health/service/mycluster");
    }

    fn backend_with_path(address: &str) -> ConsulBackend {
        ConsulBackend::new(ConsulConfig {
            address: address.to_string(),
            ..Default::default()
        })
        .unwrap()
    }

    #[test]
    fn test_go_duration() {
        assert_eq!(go_duration(Duration::from_secs(10)), "10s");
        assert_eq!(go_duration(Duration::from_secs(300)), "300s");
        assert_eq!(go_duration(Duration::from_millis(1500)), "1500ms");
    }

    #[test]
    fn test_query_timeout_covers_jitter() {
        let timeout = query_timeout(Duration::from_secs(320), Duration::from_secs(10));
        assert_eq!(timeout, Duration::from_secs(350));
    }

    #[test]
    fn test_register_payload_shape() {
        let identity = ServiceIdentity::new("login_service", "mycluster", "127.0.0.1", 3000)
            .unwrap()
            .with_tags(["login"])
            .with_meta("version", "1.2.0");
        let check = CheckDescriptor::new(
            "checkalive",
            Duration::from_secs(10),
            Duration::from_secs(30),
        )
        .unwrap();

        let payload = serde_json::to_value(RegisterPayload::new(&identity, &check)).unwrap();
        assert_eq!(
            payload,
            serde_json::json!({
                "ID": "login_service",
                "Name": "mycluster",
                "Tags": ["login"],
                "Address": "127.0.0.1",
                "Port": 3000,
                "Meta": {"version": "1.2.0"},
                "Check": {
                    "CheckID": "checkalive",
                    "Name": "mycluster TTL",
                    "TTL": "10s",
                    "DeregisterCriticalServiceAfter": "30s"
                }
            })
        );
    }

    #[test]
    fn test_parse_index() {
        let value = reqwest::header::HeaderValue::from_static("42");
        assert_eq!(parse_index(Some(&value)).unwrap(), 42);

        let value = reqwest::header::HeaderValue::from_static("forty-two");
        assert!(matches!(parse_index(Some(&value)), Err(BackendError::Decode(_))));
        assert!(matches!(parse_index(None), Err(BackendError::Decode(_))));
    }

    #[test]
    fn test_decode_entries_rejects_unexpected_shape() {
        assert!(decode_entries(b"[]").unwrap().is_empty());
        assert!(matches!(
            decode_entries(br#"{"Node": {}}"#),
            Err(BackendError::Decode(_))
        ));
    }

    #[test]
    fn test_invalid_address() {
        let result = ConsulBackend::new(ConsulConfig {
            address: "http://[::1".into(),
            ..Default::default()
        });
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_unreachable_agent() {
        let backend = backend("http://127.0.0.1:1");
        let result = backend.deregister("login_service").await;
        assert!(matches!(result, Err(BackendError::Unreachable(_))));
    }

    /// Serve a single canned HTTP response and hand back the raw request.
    async fn serve_once(
        status_line: &'static str,
        headers: &'static str,
        body: &'static str,
    ) -> (String, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = format!("http://{}", listener.local_addr().unwrap());

        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = Vec::new();
            let mut buf = [0u8; 4096];
            loop {
                let n = socket.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                request.extend_from_slice(&buf[..n]);
                if request_complete(&request) {
                    break;
                }
            }

            let response = format!(
                "{}\r\n{}Content-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                status_line,
                headers,
                body.len(),
                body
            );
            socket.write_all(response.as_bytes()).await.unwrap();
            socket.shutdown().await.ok();
            String::from_utf8_lossy(&request).into_owned()
        });

        (address, server)
    }

    /// Headers received and, if announced, the whole body.
    fn request_complete(request: &[u8]) -> bool {
        let Some(end) = request.windows(4).position(|w| w == b"\r\n\r\n") else {
            return false;
        };
        let head = String::from_utf8_lossy(&request[..end]).to_ascii_lowercase();
        let length = head
            .lines()
            .find_map(|line| line.strip_prefix("content-length:"))
            .and_then(|v| v.trim().parse::<usize>().ok())
            .unwrap_or(0);
        request.len() >= end + 4 + length
    }

    #[tokio::test]
    async fn test_blocking_query_over_http() {
        let body = r#"[{
            "Node": {"Node": "node-a", "Address": "10.0.0.1"},
            "Service": {"ID": "login_service", "Service": "mycluster", "Tags": ["login"],
                        "Address": "10.0.0.1", "Port": 3000, "Meta": null},
            "Checks": [{"CheckID": "checkalive", "Status": "passing",
                        "ServiceID": "login_service", "Output": "online"}]
        }]"#;
        let (address, server) = serve_once("HTTP/1.1 200 OK", "X-Consul-Index: 12\r\n", body).await;

        let backend = backend(&address);
        let mut query = BlockingQuery::passing("mycluster", 7, Duration::from_secs(5));
        query.tag = Some("login".into());
        let response = backend.blocking_query(&query).await.unwrap();

        assert_eq!(response.index, 12);
        assert_eq!(response.entries.len(), 1);
        assert_eq!(response.entries[0].service.id, "login_service");

        let request = server.await.unwrap();
        let request_line = request.lines().next().unwrap();
        assert!(request_line.starts_with("GET /v1/health/service/mycluster?"));
        assert!(request_line.contains("passing=true"));
        assert!(request_line.contains("index=7"));
        assert!(request_line.contains("wait=5s"));
        assert!(request_line.contains("tag=login"));
        assert!(request_line.contains("dc=dc1"));
        assert!(request.to_ascii_lowercase().contains("x-consul-token: secret"));
    }

    #[tokio::test]
    async fn test_rejection_carries_status_and_body() {
        let (address, server) = serve_once(
            "HTTP/1.1 400 Bad Request",
            "",
            "Invalid check: TTL must be > 0",
        )
        .await;

        let backend = backend(&address);
        let identity = ServiceIdentity::new("a", "mycluster", "127.0.0.1", 3000).unwrap();
        let check =
            CheckDescriptor::new("checkalive", Duration::from_secs(10), Duration::from_secs(30))
                .unwrap();
        let result = backend.register(&identity, &check).await;

        assert_eq!(
            result,
            Err(BackendError::Rejected {
                status: 400,
                message: "Invalid check: TTL must be > 0".into(),
            })
        );
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_missing_index_header_is_decode_failure() {
        let (address, server) = serve_once("HTTP/1.1 200 OK", "", "[]").await;

        let backend = backend(&address);
        let query = BlockingQuery::passing("mycluster", 0, Duration::from_secs(1));
        let result = backend.blocking_query(&query).await;

        assert!(matches!(result, Err(BackendError::Decode(_))));
        server.await.unwrap();
    }
}
