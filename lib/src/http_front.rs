//! The plain-HTTP front axum serves on an interface: per-host reverse proxy
//! routes first, then WPAD auto-discovery at the fixed paths, with anything
//! else rejected. Dispatch order follows spec §4.4: a reverse-route host
//! always wins over a WPAD path of the same name.

use std::collections::HashMap;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Host, State};
use axum::http::{Request, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Router;
use tracing::info;

use crate::reverse::ReverseRoute;
use crate::wpad::{WPAD_CONTENT_TYPE, WPAD_PATHS, WpadRenderer};

#[derive(Clone)]
struct FrontState {
    reverse_proxies: Arc<HashMap<String, ReverseRoute>>,
    wpad: Option<Arc<WpadRenderer>>,
}

fn strip_port(host: &str) -> &str {
    if let Some(rest) = host.strip_prefix('[') {
        return rest.split(']').next().unwrap_or(rest);
    }
    host.split_once(':').map(|(h, _)| h).unwrap_or(host)
}

async fn dispatch(
    State(state): State<FrontState>,
    Host(host): Host,
    request: Request<Body>,
) -> Response {
    let route_host = strip_port(&host);
    if let Some(route) = state.reverse_proxies.get(route_host) {
        return route.forward(request).await;
    }

    let Some(wpad) = &state.wpad else {
        return (StatusCode::NOT_FOUND, "no route for this host").into_response();
    };

    if request.method() != axum::http::Method::GET {
        return (StatusCode::BAD_REQUEST, "WPAD only serves GET").into_response();
    }
    if !WPAD_PATHS.contains(&request.uri().path()) {
        return (StatusCode::NOT_FOUND, "no route for this host").into_response();
    }
    (
        StatusCode::OK,
        [(axum::http::header::CONTENT_TYPE, WPAD_CONTENT_TYPE)],
        wpad.document().to_string(),
    )
        .into_response()
}

/// Builds the axum router for one interface's plain-HTTP front.
pub fn router(reverse_proxies: HashMap<String, ReverseRoute>, wpad: Option<WpadRenderer>) -> Router {
    let state = FrontState {
        reverse_proxies: Arc::new(reverse_proxies),
        wpad: wpad.map(Arc::new),
    };
    Router::new().fallback(dispatch).with_state(state)
}

/// Serves the front on an already-bound listener, shutting down gracefully
/// when `shutdown` is cancelled.
pub async fn serve_on(
    listener: tokio::net::TcpListener,
    reverse_proxies: HashMap<String, ReverseRoute>,
    wpad: Option<WpadRenderer>,
    shutdown: tokio_util::sync::CancellationToken,
) -> anyhow::Result<()> {
    let app = router(reverse_proxies, wpad);
    info!(local_addr = ?listener.local_addr(), "http front listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_port_and_brackets() {
        assert_eq!(strip_port("example.com:8080"), "example.com");
        assert_eq!(strip_port("example.com"), "example.com");
        assert_eq!(strip_port("[::1]:8080"), "::1");
    }
}
