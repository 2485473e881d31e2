//! The explicit HTTP/CONNECT forward proxy: accepts a TCP connection, applies
//! the filter chain from [`crate::policy`] to every request and CONNECT, then
//! either tunnels (CONNECT) or forwards (HTTP) the traffic. Three hook lists
//! give callers extension points around the fixed pipeline without having to
//! fork it.

use std::net::SocketAddr;
use std::sync::Arc;

use http_body_util::{BodyExt, Empty, Full};
use hyper::body::{Bytes, Incoming};
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::{TokioExecutor, TokioIo};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::arp::ArpResolver;
use crate::logging::{Action, LogRecord, log_access};
use crate::policy::{self, Destination, PolicyConfig, PortSpecHandle};

type BoxBody = http_body_util::combinators::BoxBody<Bytes, hyper::Error>;

fn empty_body() -> BoxBody {
    Empty::new().map_err(|never| match never {}).boxed()
}

fn text_body(text: impl Into<Bytes>) -> BoxBody {
    Full::new(text.into()).map_err(|never| match never {}).boxed()
}

/// Snapshot of one request, handed to hooks so they can inspect what the
/// filter chain is about to decide on.
pub struct RequestContext<'a> {
    pub method: &'a str,
    pub host: &'a str,
    pub port: u16,
}

pub enum HookOutcome {
    Continue,
    Reject(String),
}

pub type Hook = Box<dyn Fn(&RequestContext) -> HookOutcome + Send + Sync>;

/// One interface's forward proxy listener.
pub struct ForwardProxy {
    interface: String,
    policy: Arc<PolicyConfig>,
    arp: Arc<dyn ArpResolver>,
    client: Client<HttpConnector, BoxBody>,
    on_request: Vec<Hook>,
    on_connect: Vec<Hook>,
    on_response: Vec<Box<dyn Fn(&Response<BoxBody>) + Send + Sync>>,
}

impl ForwardProxy {
    pub fn new(
        interface: impl Into<String>,
        policy: Arc<PolicyConfig>,
        arp: Arc<dyn ArpResolver>,
    ) -> Self {
        let mut connector = HttpConnector::new();
        connector.enforce_http(true);
        let client = Client::builder(TokioExecutor::new()).build(connector);
        Self {
            interface: interface.into(),
            policy,
            arp,
            client,
            on_request: Vec::new(),
            on_connect: Vec::new(),
            on_response: Vec::new(),
        }
    }

    pub fn push_request_hook(&mut self, hook: Hook) {
        self.on_request.push(hook);
    }

    pub fn push_connect_hook(&mut self, hook: Hook) {
        self.on_connect.push(hook);
    }

    /// Resolves a peer's MAC address through this proxy's ARP table, for
    /// callers (e.g. [`crate::transparent_tls::TransparentTls`]) that build
    /// their own [`LogRecord`] but don't hold an ARP resolver of their own.
    pub fn resolve_mac(&self, ip: std::net::IpAddr) -> Option<String> {
        self.arp.resolve(ip)
    }

    /// Runs the `on_connect` hook list then the policy filter chain for a
    /// CONNECT destination, logging the outcome under `component`. Shared by
    /// the explicit-proxy CONNECT handler and [`crate::transparent_tls::TransparentTls`]
    /// so both paths run the same hooks and filters instead of each
    /// maintaining its own copy.
    pub async fn evaluate_connect(
        &self,
        component: &'static str,
        destination: &Destination,
        port_spec: PortSpecHandle,
        mut record: LogRecord,
    ) -> Result<(), String> {
        let host = destination.host.clone();
        record.dest = Some(host.clone());

        for hook in &self.on_connect {
            let ctx = RequestContext { method: "CONNECT", host: &host, port: 443 };
            if let HookOutcome::Reject(reason) = hook(&ctx) {
                log_access(component, Action::Block, &record);
                return Err(reason);
            }
        }

        if let Err(reason) = policy::evaluate(destination, port_spec, "CONNECT", 443, &self.policy) {
            log_access(component, Action::Block, &record);
            return Err(reason.to_string());
        }

        log_access(component, Action::Tunnel, &record);
        Ok(())
    }

    pub async fn serve(self: Arc<Self>, listener: TcpListener, shutdown: CancellationToken) {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    debug!(interface = %self.interface, "forward proxy listener stopping");
                    return;
                }
                accepted = listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(pair) => pair,
                        Err(err) => {
                            warn!(interface = %self.interface, error = %err, "accept failed");
                            continue;
                        }
                    };
                    let this = self.clone();
                    tokio::spawn(async move {
                        this.handle_connection(stream, peer).await;
                    });
                }
            }
        }
    }

    async fn handle_connection(self: Arc<Self>, stream: TcpStream, peer: SocketAddr) {
        let io = TokioIo::new(stream);
        let this = self.clone();
        let service = service_fn(move |request| {
            let this = this.clone();
            async move { Ok::<_, std::convert::Infallible>(this.handle_request(request, peer).await) }
        });
        if let Err(err) = hyper::server::conn::http1::Builder::new()
            .serve_connection(io, service)
            .with_upgrades()
            .await
        {
            debug!(interface = %self.interface, peer = %peer, error = %err, "connection ended");
        }
    }

    async fn handle_request(
        &self,
        request: Request<Incoming>,
        peer: SocketAddr,
    ) -> Response<BoxBody> {
        if request.method() == Method::CONNECT {
            self.handle_connect(request, peer).await
        } else {
            self.handle_http(request, peer).await
        }
    }

    fn base_record(&self, peer: SocketAddr, method: &str, url: String) -> LogRecord {
        LogRecord {
            src: Some(peer.ip()),
            src_port: Some(peer.port()),
            src_mac: self.arp.resolve(peer.ip()),
            method: Some(method.to_string()),
            url: Some(url),
            ..Default::default()
        }
    }

    async fn handle_connect(
        &self,
        request: Request<Incoming>,
        peer: SocketAddr,
    ) -> Response<BoxBody> {
        let authority = request
            .uri()
            .authority()
            .map(|a| a.to_string())
            .unwrap_or_default();
        let record = self.base_record(peer, "CONNECT", authority.clone());

        let (destination, port_spec) = Destination::parse(&authority).await;

        if let Err(reason) = self.evaluate_connect("proxy", &destination, port_spec, record).await {
            return reject(StatusCode::FORBIDDEN, reason);
        }

        tokio::spawn(async move {
            match hyper::upgrade::on(request).await {
                Ok(upgraded) => {
                    let mut client_io = TokioIo::new(upgraded);
                    match TcpStream::connect(authority.as_str()).await {
                        Ok(mut target) => {
                            if let Err(err) =
                                tokio::io::copy_bidirectional(&mut client_io, &mut target).await
                            {
                                debug!(error = %err, "tunnel closed");
                            }
                        }
                        Err(err) => {
                            warn!(authority = %authority, error = %err, "CONNECT target unreachable");
                        }
                    }
                }
                Err(err) => error!(error = %err, "CONNECT upgrade failed"),
            }
        });

        Response::builder()
            .status(StatusCode::OK)
            .body(empty_body())
            .expect("static response is well-formed")
    }

    async fn handle_http(
        &self,
        request: Request<Incoming>,
        peer: SocketAddr,
    ) -> Response<BoxBody> {
        let method = request.method().as_str().to_ascii_uppercase();
        let url = request.uri().to_string();
        let mut record = self.base_record(peer, &method, url);

        let (host, port) = match request.uri().host() {
            Some(host) => (host.to_string(), request.uri().port_u16()),
            None if self.policy.http_transparent => {
                let Some(authority) = request
                    .headers()
                    .get(hyper::header::HOST)
                    .and_then(|v| v.to_str().ok())
                else {
                    log_access("proxy", Action::Error, &record);
                    return reject(
                        StatusCode::BAD_REQUEST,
                        "transparent HTTP request missing Host header".to_string(),
                    );
                };
                match authority.rsplit_once(':') {
                    Some((host, port_str)) => (host.to_string(), port_str.parse().ok()),
                    None => (authority.to_string(), None),
                }
            }
            None => {
                log_access("proxy", Action::Error, &record);
                return reject(StatusCode::BAD_REQUEST, "missing request target host".to_string());
            }
        };
        let authority = match port {
            Some(port) => format!("{host}:{port}"),
            None => host.clone(),
        };

        for hook in &self.on_request {
            let ctx = RequestContext {
                method: &method,
                host: &host,
                port: port.unwrap_or(80),
            };
            if let HookOutcome::Reject(reason) = hook(&ctx) {
                record.dest = Some(host.clone());
                log_access("proxy", Action::Block, &record);
                return reject(StatusCode::FORBIDDEN, reason);
            }
        }

        let (destination, port_spec) = Destination::parse(&authority).await;
        if let Err(reason) = policy::evaluate(&destination, port_spec, &method, 80, &self.policy) {
            record.dest = Some(host);
            log_access("proxy", Action::Block, &record);
            return reject(StatusCode::FORBIDDEN, reason.to_string());
        }

        record.dest = Some(host);
        record.content_type = request
            .headers()
            .get(hyper::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        record.user_agent = request
            .headers()
            .get(hyper::header::USER_AGENT)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        let (mut parts, body) = request.into_parts();
        if parts.uri.host().is_none() {
            let path = parts
                .uri
                .path_and_query()
                .map(|pq| pq.as_str())
                .unwrap_or("/");
            let rewritten = format!("http://{authority}{path}");
            let fallback = parts.uri.clone();
            parts.uri = rewritten.parse().unwrap_or(fallback);
        }
        let forwarded = Request::from_parts(parts, body.boxed());

        match self.client.request(forwarded).await {
            Ok(response) => {
                record.status = Some(response.status().as_u16());
                log_access("proxy", Action::Pass, &record);
                let response = response.map(BodyExt::boxed);
                for hook in &self.on_response {
                    hook(&response);
                }
                response
            }
            Err(err) => {
                warn!(error = %err, "forward proxy upstream error");
                record.status = Some(StatusCode::BAD_GATEWAY.as_u16());
                log_access("proxy", Action::Error, &record);
                reject(StatusCode::BAD_GATEWAY, "upstream unreachable".to_string())
            }
        }
    }
}

fn reject(status: StatusCode, reason: String) -> Response<BoxBody> {
    Response::builder()
        .status(status)
        .body(text_body(reason))
        .expect("static response is well-formed")
}
