//! Reverse-proxy fallback for guard-approved requests no stub answered.
//!
//! Forwards method, path, query, headers, and body to the resolved origin
//! and relays the upstream response verbatim apart from hop-by-hop
//! headers. No retries; connection failures and the mandatory deadline
//! turn into synthesized 502/504 responses so the caller always gets an
//! answer and the exchange is still capturable.

use std::collections::HashMap;
use std::time::Duration;

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::header::HeaderValue;
use hyper::{Method, Request, Uri};
use hyper_rustls::HttpsConnector;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use serde_json::json;
use tracing::{debug, warn};

use crate::config::UpstreamConfig;
use crate::gateway::InboundRequest;

type UpstreamClient = Client<HttpsConnector<HttpConnector>, Full<Bytes>>;

const HOP_BY_HOP: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailers",
    "transfer-encoding",
    "upgrade",
];

fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP.contains(&name.to_ascii_lowercase().as_str())
}

/// A fully buffered upstream answer, synthesized or real.
#[derive(Debug)]
pub struct UpstreamResponse {
    pub status: u16,
    pub headers: HashMap<String, String>,
    pub body: Bytes,
}

impl UpstreamResponse {
    fn synthesized(status: u16, error: &str, message: String) -> Self {
        let body = json!({"error": error, "message": message});
        UpstreamResponse {
            status,
            headers: HashMap::from([(
                "content-type".to_string(),
                "application/json".to_string(),
            )]),
            body: Bytes::from(body.to_string()),
        }
    }
}

pub struct ReverseProxyFallback {
    client: UpstreamClient,
    timeout: Duration,
}

impl ReverseProxyFallback {
    pub fn new(config: &UpstreamConfig) -> anyhow::Result<Self> {
        let mut http = HttpConnector::new();
        http.enforce_http(false);
        http.set_connect_timeout(Some(Duration::from_secs(config.connect_timeout_secs)));
        http.set_keepalive(Some(Duration::from_secs(config.keepalive_secs)));
        let https = hyper_rustls::HttpsConnectorBuilder::new()
            .with_native_roots()?
            .https_or_http()
            .enable_http1()
            .wrap_connector(http);
        let client = Client::builder(TokioExecutor::new())
            .pool_idle_timeout(Duration::from_secs(config.idle_timeout_secs))
            .pool_max_idle_per_host(config.max_idle_per_host)
            .build(https);
        Ok(ReverseProxyFallback {
            client,
            timeout: Duration::from_secs(config.timeout_secs),
        })
    }

    /// Forwards the request to `origin`. Infallible by design: failures
    /// come back as synthesized gateway responses.
    pub async fn forward(&self, origin: &Uri, request: &InboundRequest) -> UpstreamResponse {
        let uri = match target_uri(origin, request) {
            Ok(uri) => uri,
            Err(message) => {
                warn!(origin = %origin, message, "cannot build upstream uri");
                return UpstreamResponse::synthesized(502, "bad-gateway", message);
            }
        };
        let outbound = match build_outbound(&uri, request) {
            Ok(outbound) => outbound,
            Err(message) => {
                warn!(uri = %uri, message, "cannot build upstream request");
                return UpstreamResponse::synthesized(502, "bad-gateway", message);
            }
        };

        debug!(method = %request.method, uri = %uri, "proxying to upstream");
        let exchange = async {
            let response = self
                .client
                .request(outbound)
                .await
                .map_err(|err| format!("upstream request failed: {err}"))?;
            let status = response.status().as_u16();
            let mut headers = HashMap::new();
            for (name, value) in response.headers() {
                let name = name.as_str().to_ascii_lowercase();
                if is_hop_by_hop(&name) || name == "content-length" {
                    continue;
                }
                let value = String::from_utf8_lossy(value.as_bytes()).into_owned();
                headers
                    .entry(name)
                    .and_modify(|existing: &mut String| {
                        existing.push_str(", ");
                        existing.push_str(&value);
                    })
                    .or_insert(value);
            }
            let body = response
                .into_body()
                .collect()
                .await
                .map_err(|err| format!("failed to read upstream body: {err}"))?
                .to_bytes();
            Ok::<UpstreamResponse, String>(UpstreamResponse {
                status,
                headers,
                body,
            })
        };

        match tokio::time::timeout(self.timeout, exchange).await {
            Ok(Ok(response)) => response,
            Ok(Err(message)) => {
                warn!(uri = %uri, message, "upstream exchange failed");
                UpstreamResponse::synthesized(502, "bad-gateway", message)
            }
            Err(_) => {
                warn!(uri = %uri, timeout_secs = self.timeout.as_secs(), "upstream deadline exceeded");
                UpstreamResponse::synthesized(
                    504,
                    "upstream-timeout",
                    format!("no response from upstream within {}s", self.timeout.as_secs()),
                )
            }
        }
    }
}

fn target_uri(origin: &Uri, request: &InboundRequest) -> Result<Uri, String> {
    let scheme = origin
        .scheme()
        .cloned()
        .ok_or_else(|| format!("origin '{origin}' has no scheme"))?;
    let authority = origin
        .authority()
        .cloned()
        .ok_or_else(|| format!("origin '{origin}' has no authority"))?;
    Uri::builder()
        .scheme(scheme)
        .authority(authority)
        .path_and_query(request.path_and_query())
        .build()
        .map_err(|err| format!("invalid upstream uri: {err}"))
}

fn build_outbound(uri: &Uri, request: &InboundRequest) -> Result<Request<Full<Bytes>>, String> {
    let method = Method::from_bytes(request.method.as_bytes())
        .map_err(|err| format!("invalid method '{}': {err}", request.method))?;
    let mut builder = Request::builder().method(method).uri(uri.clone());
    for (name, value) in &request.headers {
        let lowered = name.to_ascii_lowercase();
        if is_hop_by_hop(&lowered) || lowered == "host" || lowered == "content-length" {
            continue;
        }
        let value = HeaderValue::from_str(value)
            .map_err(|err| format!("invalid value for header '{name}': {err}"))?;
        builder = builder.header(name.as_str(), value);
    }
    let body = request.body.clone().unwrap_or_default();
    builder
        .body(Full::new(body))
        .map_err(|err| format!("failed to build upstream request: {err}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(path: &str, query: Option<&str>) -> InboundRequest {
        InboundRequest {
            method: "GET".to_string(),
            path: path.to_string(),
            query: query.map(str::to_string),
            headers: HashMap::from([
                ("host".to_string(), "gateway.local".to_string()),
                ("connection".to_string(), "keep-alive".to_string()),
                ("accept".to_string(), "application/json".to_string()),
            ]),
            body: None,
        }
    }

    #[test]
    fn target_uri_keeps_path_and_query() {
        let origin: Uri = "http://localhost:8080".parse().unwrap();
        let uri = target_uri(&origin, &request("/orders", Some("limit=5"))).unwrap();
        assert_eq!(uri.to_string(), "http://localhost:8080/orders?limit=5");
    }

    #[test]
    fn outbound_request_drops_host_and_hop_by_hop_headers() {
        let origin: Uri = "http://localhost:8080".parse().unwrap();
        let uri = target_uri(&origin, &request("/orders", None)).unwrap();
        let outbound = build_outbound(&uri, &request("/orders", None)).unwrap();
        assert!(outbound.headers().get("host").is_none());
        assert!(outbound.headers().get("connection").is_none());
        assert_eq!(outbound.headers().get("accept").unwrap(), "application/json");
    }

    #[tokio::test]
    async fn binary_bodies_are_forwarded_byte_exact() {
        let origin: Uri = "http://localhost:8080".parse().unwrap();
        let mut inbound = request("/upload", None);
        inbound.method = "POST".to_string();
        // Not valid UTF-8; must survive forwarding untouched.
        let payload = Bytes::from_static(&[0x89, 0x50, 0x4e, 0x47, 0xff, 0x00, 0xfe]);
        inbound.body = Some(payload.clone());

        let uri = target_uri(&origin, &inbound).unwrap();
        let outbound = build_outbound(&uri, &inbound).unwrap();
        let forwarded = outbound.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(forwarded, payload);
    }

    #[tokio::test]
    async fn connection_failure_synthesizes_a_502() {
        let fallback = ReverseProxyFallback::new(&UpstreamConfig {
            timeout_secs: 2,
            connect_timeout_secs: 1,
            ..UpstreamConfig::default()
        })
        .unwrap();
        // Reserved port, nothing listens there.
        let origin: Uri = "http://127.0.0.1:9".parse().unwrap();
        let response = fallback.forward(&origin, &request("/x", None)).await;
        assert_eq!(response.status, 502);
        let body: serde_json::Value = serde_json::from_slice(&response.body).unwrap();
        assert_eq!(body["error"], "bad-gateway");
    }
}
