//! End-to-end scenario tests (S1/S4/S5/S6 plus a CONNECT tunnel/reject pair)
//! from the spec's testable-properties section. Each spins up the real
//! listener-owning type on an ephemeral loopback port, drives it with a raw
//! `tokio::net::TcpStream`, and reads the response bytes off the wire —
//! nothing here goes through a mock transport.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use ipnet::IpNet;
use lanproxy_core::arp::NullArpResolver;
use lanproxy_core::forward_proxy::ForwardProxy;
use lanproxy_core::http_front;
use lanproxy_core::methods;
use lanproxy_core::policy::PolicyConfig;
use lanproxy_core::reverse::ReverseRoute;
use lanproxy_core::transparent_tls::TransparentTls;
use lanproxy_core::trie::DomainTrie;
use lanproxy_core::wpad::WpadRenderer;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

fn base_policy() -> PolicyConfig {
    PolicyConfig {
        port: 3128,
        allow_high_ports: true,
        allow_low_ports: true,
        block_ips: false,
        block_local_services: false,
        local_ips: HashSet::new(),
        direct_networks: Vec::new(),
        allowed_methods: methods::default_allowed_methods(),
        block_list: DomainTrie::new(false),
        block_by_idn: false,
        http_transparent: false,
        https_transparent_port: 3129,
        global_block_list: None,
    }
}

/// Reads whatever the peer sends until 300ms pass with nothing new, then
/// returns it as a lossy string. Works for both keep-alive and
/// connection-closing responses.
async fn read_response(stream: &mut TcpStream) -> String {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        match tokio::time::timeout(Duration::from_millis(300), stream.read(&mut chunk)).await {
            Ok(Ok(0)) | Err(_) => break,
            Ok(Ok(n)) => buf.extend_from_slice(&chunk[..n]),
            Ok(Err(_)) => break,
        }
    }
    String::from_utf8_lossy(&buf).to_string()
}

async fn bind_ephemeral() -> (TcpListener, SocketAddr) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    (listener, addr)
}

#[tokio::test]
async fn s1_block_by_interface_policy() {
    let mut policy = base_policy();
    policy.block_list = DomainTrie::from_patterns(["ads.example"], false);
    let (listener, addr) = bind_ephemeral().await;
    let proxy = Arc::new(ForwardProxy::new(
        "eth0",
        Arc::new(policy),
        Arc::new(NullArpResolver),
    ));
    let shutdown = CancellationToken::new();
    let server_shutdown = shutdown.clone();
    tokio::spawn(async move { proxy.serve(listener, server_shutdown).await });

    let mut client = TcpStream::connect(addr).await.unwrap();
    client
        .write_all(b"GET http://ads.example/ HTTP/1.1\r\nHost: ads.example\r\nConnection: close\r\n\r\n")
        .await
        .unwrap();
    let response = read_response(&mut client).await;

    assert!(response.starts_with("HTTP/1.1 403"), "got: {response}");
    assert!(response.contains("Blocked by interface policy"));
    shutdown.cancel();
}

#[tokio::test]
async fn connect_to_disallowed_high_port_is_rejected() {
    let mut policy = base_policy();
    policy.allow_high_ports = false;
    policy.allow_low_ports = false;
    let (listener, addr) = bind_ephemeral().await;
    let proxy = Arc::new(ForwardProxy::new(
        "eth0",
        Arc::new(policy),
        Arc::new(NullArpResolver),
    ));
    let shutdown = CancellationToken::new();
    let server_shutdown = shutdown.clone();
    tokio::spawn(async move { proxy.serve(listener, server_shutdown).await });

    let mut client = TcpStream::connect(addr).await.unwrap();
    client
        .write_all(b"CONNECT 203.0.113.5:8443 HTTP/1.1\r\nHost: 203.0.113.5:8443\r\n\r\n")
        .await
        .unwrap();
    let response = read_response(&mut client).await;

    assert!(response.starts_with("HTTP/1.1 403"), "got: {response}");
}

#[tokio::test]
async fn connect_accepted_tunnels_bytes_both_ways() {
    let (upstream, upstream_addr) = bind_ephemeral().await;
    tokio::spawn(async move {
        if let Ok((mut sock, _)) = upstream.accept().await {
            let mut buf = [0u8; 64];
            if let Ok(n) = sock.read(&mut buf).await {
                let _ = sock.write_all(&buf[..n]).await;
            }
        }
    });

    let policy = base_policy();
    let (listener, addr) = bind_ephemeral().await;
    let proxy = Arc::new(ForwardProxy::new(
        "eth0",
        Arc::new(policy),
        Arc::new(NullArpResolver),
    ));
    let shutdown = CancellationToken::new();
    let server_shutdown = shutdown.clone();
    tokio::spawn(async move { proxy.serve(listener, server_shutdown).await });

    let mut client = TcpStream::connect(addr).await.unwrap();
    let connect_req = format!(
        "CONNECT 127.0.0.1:{port} HTTP/1.1\r\nHost: 127.0.0.1:{port}\r\n\r\n",
        port = upstream_addr.port()
    );
    client.write_all(connect_req.as_bytes()).await.unwrap();

    let mut status_buf = [0u8; 256];
    let n = tokio::time::timeout(Duration::from_millis(500), client.read(&mut status_buf))
        .await
        .unwrap()
        .unwrap();
    let status_line = String::from_utf8_lossy(&status_buf[..n]);
    assert!(status_line.starts_with("HTTP/1.1 200"), "got: {status_line}");

    client.write_all(b"ping").await.unwrap();
    let mut echoed = [0u8; 64];
    let n = tokio::time::timeout(Duration::from_millis(500), client.read(&mut echoed))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&echoed[..n], b"ping");

    shutdown.cancel();
}

#[tokio::test]
async fn s4_wpad_served() {
    let net: IpNet = "192.168.1.0/24".parse().unwrap();
    let wpad = WpadRenderer::new(&[net], "10.0.0.1:3128");
    let (listener, addr) = bind_ephemeral().await;
    let shutdown = CancellationToken::new();
    let server_shutdown = shutdown.clone();
    tokio::spawn(async move {
        http_front::serve_on(listener, HashMap::new(), Some(wpad), server_shutdown)
            .await
            .unwrap();
    });

    let mut client = TcpStream::connect(addr).await.unwrap();
    client
        .write_all(b"GET /wpad.dat HTTP/1.1\r\nHost: 10.0.0.1\r\nConnection: close\r\n\r\n")
        .await
        .unwrap();
    let response = read_response(&mut client).await;

    assert!(response.contains("200 OK"), "got: {response}");
    assert!(response.contains("application/x-ns-proxy-autoconfig"));
    assert!(response.contains(r#"isInNet(dnsResolve(host), "192.168.1.0", "255.255.255.0")"#));
    assert!(response.contains("PROXY 10.0.0.1:3128"));
    shutdown.cancel();
}

#[tokio::test]
async fn wpad_path_dispatch_rejects_non_get_and_unknown_path() {
    let wpad = WpadRenderer::new(&[], "10.0.0.1:3128");
    let (listener, addr) = bind_ephemeral().await;
    let shutdown = CancellationToken::new();
    let server_shutdown = shutdown.clone();
    tokio::spawn(async move {
        http_front::serve_on(listener, HashMap::new(), Some(wpad), server_shutdown)
            .await
            .unwrap();
    });

    let mut post_client = TcpStream::connect(addr).await.unwrap();
    post_client
        .write_all(b"POST /proxy.pac HTTP/1.1\r\nHost: 10.0.0.1\r\nContent-Length: 0\r\nConnection: close\r\n\r\n")
        .await
        .unwrap();
    let post_response = read_response(&mut post_client).await;
    assert!(post_response.starts_with("HTTP/1.1 400"), "got: {post_response}");

    let mut unknown_client = TcpStream::connect(addr).await.unwrap();
    unknown_client
        .write_all(b"GET /other HTTP/1.1\r\nHost: 10.0.0.1\r\nConnection: close\r\n\r\n")
        .await
        .unwrap();
    let unknown_response = read_response(&mut unknown_client).await;
    assert!(unknown_response.starts_with("HTTP/1.1 404"), "got: {unknown_response}");

    shutdown.cancel();
}

#[tokio::test]
async fn s5_reverse_proxy_method_filter() {
    let mut routes = HashMap::new();
    routes.insert(
        "app.local".to_string(),
        ReverseRoute::new(
            "10.1.0.5".parse().unwrap(),
            8080,
            "127.0.0.1".parse().unwrap(),
            ["GET".to_string(), "HEAD".to_string()].into(),
        ),
    );
    let (listener, addr) = bind_ephemeral().await;
    let shutdown = CancellationToken::new();
    let server_shutdown = shutdown.clone();
    tokio::spawn(async move {
        http_front::serve_on(listener, routes, None, server_shutdown)
            .await
            .unwrap();
    });

    let mut client = TcpStream::connect(addr).await.unwrap();
    client
        .write_all(b"POST / HTTP/1.1\r\nHost: app.local\r\nContent-Length: 0\r\nConnection: close\r\n\r\n")
        .await
        .unwrap();
    let response = read_response(&mut client).await;

    assert!(response.starts_with("HTTP/1.1 403"), "got: {response}");
    assert!(response.contains("Method POST blocked by policy"));
    shutdown.cancel();
}

fn client_hello_with_sni(hostname: &str) -> Vec<u8> {
    let host_bytes = hostname.as_bytes();
    let mut server_name_list = Vec::new();
    server_name_list.push(0u8);
    server_name_list.extend_from_slice(&(host_bytes.len() as u16).to_be_bytes());
    server_name_list.extend_from_slice(host_bytes);

    let mut sni_ext_data = Vec::new();
    sni_ext_data.extend_from_slice(&(server_name_list.len() as u16).to_be_bytes());
    sni_ext_data.extend_from_slice(&server_name_list);

    let mut extension = Vec::new();
    extension.extend_from_slice(&0u16.to_be_bytes());
    extension.extend_from_slice(&(sni_ext_data.len() as u16).to_be_bytes());
    extension.extend_from_slice(&sni_ext_data);

    let mut body = Vec::new();
    body.extend_from_slice(&[3, 3]);
    body.extend_from_slice(&[0u8; 32]);
    body.push(0);
    body.extend_from_slice(&2u16.to_be_bytes());
    body.extend_from_slice(&[0, 0]);
    body.push(1);
    body.push(0);
    body.extend_from_slice(&(extension.len() as u16).to_be_bytes());
    body.extend_from_slice(&extension);

    let mut handshake = Vec::new();
    handshake.push(0x01);
    let len = body.len() as u32;
    handshake.extend_from_slice(&len.to_be_bytes()[1..]);
    handshake.extend_from_slice(&body);

    let mut record = Vec::new();
    record.push(0x16);
    record.extend_from_slice(&[3, 3]);
    record.extend_from_slice(&(handshake.len() as u16).to_be_bytes());
    record.extend_from_slice(&handshake);
    record
}

#[tokio::test]
async fn s6_transparent_tls_rejected_closes_silently() {
    let mut policy = base_policy();
    policy.block_list = DomainTrie::from_patterns(["blocked.example"], false);
    let (listener, addr) = bind_ephemeral().await;
    let proxy = Arc::new(ForwardProxy::new("eth0", Arc::new(policy), Arc::new(NullArpResolver)));
    let tls = Arc::new(TransparentTls::new("eth0", proxy));
    let shutdown = CancellationToken::new();
    let server_shutdown = shutdown.clone();
    tokio::spawn(async move { tls.serve(listener, server_shutdown).await });

    let mut client = TcpStream::connect(addr).await.unwrap();
    let hello = client_hello_with_sni("blocked.example");
    client.write_all(&hello).await.unwrap();

    let response = read_response(&mut client).await;
    assert!(
        response.is_empty(),
        "expected no bytes written back to a rejected TLS peer, got: {response:?}"
    );
    shutdown.cancel();
}
