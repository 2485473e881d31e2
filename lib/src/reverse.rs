//! Per-host reverse proxy routes. Each route owns its own outbound client,
//! built once at configuration time and bound to a specific source address so
//! traffic leaves the box from the interface the route belongs to.

use std::collections::HashSet;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, Response, StatusCode};
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::TokioExecutor;
use tracing::warn;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const KEEPALIVE: Duration = Duration::from_secs(30);
const POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(90);
const MAX_IDLE_PER_HOST: usize = 100;
// The source transport also carries a tls_handshake_timeout and an
// expect_continue_timeout, but this connector never speaks TLS (every route
// targets a literal `http://` backend) and hyper_util's legacy client has no
// Expect: 100-continue negotiation to bound, so neither has anything to
// configure here. See DESIGN.md.

/// A single configured `host -> backend` mapping, with its own pinned-source
/// outbound client.
#[derive(Clone)]
pub struct ReverseRoute {
    peer_ip: IpAddr,
    peer_port: u16,
    allowed_methods: HashSet<String>,
    client: Client<HttpConnector, Body>,
}

impl std::fmt::Debug for ReverseRoute {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReverseRoute")
            .field("peer_ip", &self.peer_ip)
            .field("peer_port", &self.peer_port)
            .field("allowed_methods", &self.allowed_methods)
            .finish()
    }
}

impl ReverseRoute {
    /// `source_ip` pins the outbound connector's local address, per the
    /// owning interface (or an explicit `source_interface` override).
    pub fn new(
        peer_ip: IpAddr,
        peer_port: u16,
        source_ip: IpAddr,
        allowed_methods: HashSet<String>,
    ) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_connect_timeout(Some(CONNECT_TIMEOUT));
        connector.set_keepalive(Some(KEEPALIVE));
        connector.set_local_address(Some(source_ip));
        connector.enforce_http(true);

        let client = Client::builder(TokioExecutor::new())
            .pool_idle_timeout(POOL_IDLE_TIMEOUT)
            .pool_timer(hyper_util::rt::TokioTimer::new())
            .pool_max_idle_per_host(MAX_IDLE_PER_HOST)
            .build(connector);

        Self {
            peer_ip,
            peer_port,
            allowed_methods,
            client,
        }
    }

    fn method_allowed(&self, method: &str) -> bool {
        self.allowed_methods.contains(method)
    }

    /// Proxies one request to this route's backend, rewriting the request
    /// target and `Host` header. Returns the backend's response untouched on
    /// success, a `403` with the literal `Method {METHOD} blocked by policy`
    /// body when the method isn't allowed, and a `502` on transport failure.
    pub async fn forward(&self, mut request: Request<Body>) -> Response<Body> {
        let method = request.method().as_str().to_ascii_uppercase();
        if !self.method_allowed(&method) {
            return Response::builder()
                .status(StatusCode::FORBIDDEN)
                .body(Body::from(format!("Method {method} blocked by policy")))
                .expect("static response is well-formed");
        }

        let backend_addr = SocketAddr::new(self.peer_ip, self.peer_port);
        let path_and_query = request
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        let new_uri = format!("http://{backend_addr}{path_and_query}");
        *request.uri_mut() = match new_uri.parse() {
            Ok(uri) => uri,
            Err(err) => {
                warn!(error = %err, "failed to build backend URI");
                return bad_gateway();
            }
        };
        request.headers_mut().insert(
            axum::http::header::HOST,
            axum::http::HeaderValue::from_str(&backend_addr.to_string())
                .expect("socket address is a valid header value"),
        );

        match self.client.request(request).await {
            Ok(response) => response.map(Body::new),
            Err(err) => {
                warn!(error = %err, peer = %backend_addr, "reverse proxy backend unreachable");
                bad_gateway()
            }
        }
    }
}

fn bad_gateway() -> Response<Body> {
    Response::builder()
        .status(StatusCode::BAD_GATEWAY)
        .body(Body::from("bad gateway"))
        .expect("static response is well-formed")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_method_outside_allow_list() {
        let route = ReverseRoute::new(
            "10.0.0.5".parse().unwrap(),
            8080,
            "10.0.0.1".parse().unwrap(),
            ["GET".to_string()].into(),
        );
        assert!(route.method_allowed("GET"));
        assert!(!route.method_allowed("DELETE"));
    }
}
