//! Transparent TLS interception (spec §4.6): a raw TCP listener that peeks a
//! ClientHello's SNI, synthesizes a CONNECT against it, and runs it through
//! the same filter chain as the explicit proxy's CONNECT handler — but,
//! unlike that handler, never writes a single byte back to the TLS peer
//! either way. A proxy client expects a "200 Connection Established" line; a
//! TLS peer expects the first bytes of a handshake, so any ack at all would
//! corrupt the stream.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::forward_proxy::ForwardProxy;
use crate::logging::LogRecord;
use crate::policy::Destination;

const MAX_PEEK: usize = 16 * 1024;
const TLS_HANDSHAKE_CONTENT_TYPE: u8 = 0x16;
const CLIENT_HELLO_HANDSHAKE_TYPE: u8 = 0x01;
const SERVER_NAME_EXTENSION: u16 = 0;

pub struct TransparentTls {
    interface: String,
    proxy: Arc<ForwardProxy>,
}

impl TransparentTls {
    /// `proxy` is the same [`ForwardProxy`] the interface's explicit-proxy
    /// listener uses, so CONNECT hooks and policy run identically for both
    /// entry points.
    pub fn new(interface: impl Into<String>, proxy: Arc<ForwardProxy>) -> Self {
        Self {
            interface: interface.into(),
            proxy,
        }
    }

    pub async fn serve(self: Arc<Self>, listener: TcpListener, shutdown: CancellationToken) {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    debug!(interface = %self.interface, "transparent TLS listener stopping");
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

    async fn handle_connection(&self, mut client: TcpStream, peer: SocketAddr) {
        let mut buf = Vec::new();
        let sni = match peek_sni(&mut client, &mut buf).await {
            Ok(Some(sni)) => sni,
            Ok(None) => {
                debug!(interface = %self.interface, %peer, "no SNI in ClientHello, closing");
                return;
            }
            Err(err) => {
                debug!(interface = %self.interface, %peer, error = %err, "SNI peek failed, closing");
                return;
            }
        };

        let authority = format!("{sni}:443");
        let record = LogRecord {
            src: Some(peer.ip()),
            src_port: Some(peer.port()),
            src_mac: self.proxy.resolve_mac(peer.ip()),
            method: Some("CONNECT".to_string()),
            url: Some(authority.clone()),
            dest_port: Some(443),
            ..Default::default()
        };

        let (destination, port_spec) = Destination::parse(&authority).await;
        if let Err(reason) = self
            .proxy
            .evaluate_connect("https_transparent", &destination, port_spec, record)
            .await
        {
            debug!(interface = %self.interface, %peer, sni, reason = %reason, "transparent CONNECT rejected");
            return;
        }

        let mut target = match TcpStream::connect((sni.as_str(), 443u16)).await {
            Ok(target) => target,
            Err(err) => {
                warn!(interface = %self.interface, sni, error = %err, "transparent target unreachable");
                return;
            }
        };

        if let Err(err) = target.write_all(&buf).await {
            debug!(interface = %self.interface, sni, error = %err, "failed relaying peeked ClientHello bytes");
            return;
        }

        if let Err(err) = tokio::io::copy_bidirectional(&mut client, &mut target).await {
            debug!(interface = %self.interface, sni, error = %err, "transparent tunnel closed");
        }
    }
}

/// Reads from `client` until a complete ClientHello is buffered (or the
/// connection closes, or `MAX_PEEK` is exceeded), and extracts its SNI.
/// Every byte read is appended to `buf`, since it still needs to be
/// forwarded to the real backend.
async fn peek_sni(client: &mut TcpStream, buf: &mut Vec<u8>) -> std::io::Result<Option<String>> {
    let mut chunk = [0u8; 512];
    loop {
        match try_parse_sni(buf) {
            ParseOutcome::Sni(sni) => return Ok(Some(sni)),
            ParseOutcome::NotTls => return Ok(None),
            ParseOutcome::NeedMore => {}
        }
        if buf.len() >= MAX_PEEK {
            return Ok(None);
        }
        let n = client.read(&mut chunk).await?;
        if n == 0 {
            return Ok(None);
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}

enum ParseOutcome {
    Sni(String),
    NotTls,
    NeedMore,
}

fn try_parse_sni(buf: &[u8]) -> ParseOutcome {
    if buf.is_empty() {
        return ParseOutcome::NeedMore;
    }
    if buf[0] != TLS_HANDSHAKE_CONTENT_TYPE {
        return ParseOutcome::NotTls;
    }
    if buf.len() < 5 {
        return ParseOutcome::NeedMore;
    }
    let record_len = u16::from_be_bytes([buf[3], buf[4]]) as usize;
    let record_end = 5 + record_len;
    if buf.len() < record_end {
        return ParseOutcome::NeedMore;
    }
    let handshake = &buf[5..record_end];
    if handshake.is_empty() || handshake[0] != CLIENT_HELLO_HANDSHAKE_TYPE {
        return ParseOutcome::NotTls;
    }
    if handshake.len() < 4 {
        return ParseOutcome::NeedMore;
    }
    let hs_len = u32::from_be_bytes([0, handshake[1], handshake[2], handshake[3]]) as usize;
    if handshake.len() < 4 + hs_len {
        return ParseOutcome::NeedMore;
    }
    let body = &handshake[4..4 + hs_len];

    match parse_client_hello_body(body) {
        Some(sni) => ParseOutcome::Sni(sni),
        None => ParseOutcome::NotTls,
    }
}

fn parse_client_hello_body(body: &[u8]) -> Option<String> {
    let mut pos = 0usize;
    // client_version(2) + random(32)
    pos = pos.checked_add(34)?;
    if body.len() < pos + 1 {
        return None;
    }
    let session_id_len = body[pos] as usize;
    pos += 1 + session_id_len;

    if body.len() < pos + 2 {
        return None;
    }
    let cipher_suites_len = u16::from_be_bytes([body[pos], body[pos + 1]]) as usize;
    pos += 2 + cipher_suites_len;

    if body.len() < pos + 1 {
        return None;
    }
    let compression_len = body[pos] as usize;
    pos += 1 + compression_len;

    if body.len() < pos + 2 {
        return None;
    }
    let extensions_len = u16::from_be_bytes([body[pos], body[pos + 1]]) as usize;
    pos += 2;
    if body.len() < pos + extensions_len {
        return None;
    }
    let extensions = &body[pos..pos + extensions_len];

    let mut epos = 0usize;
    while epos + 4 <= extensions.len() {
        let ext_type = u16::from_be_bytes([extensions[epos], extensions[epos + 1]]);
        let ext_len = u16::from_be_bytes([extensions[epos + 2], extensions[epos + 3]]) as usize;
        let ext_start = epos + 4;
        if ext_start + ext_len > extensions.len() {
            return None;
        }
        if ext_type == SERVER_NAME_EXTENSION {
            return parse_server_name_extension(&extensions[ext_start..ext_start + ext_len]);
        }
        epos = ext_start + ext_len;
    }
    None
}

fn parse_server_name_extension(data: &[u8]) -> Option<String> {
    if data.len() < 2 {
        return None;
    }
    let list_len = u16::from_be_bytes([data[0], data[1]]) as usize;
    let list = data.get(2..2 + list_len)?;
    let mut pos = 0usize;
    while pos + 3 <= list.len() {
        let name_type = list[pos];
        let name_len = u16::from_be_bytes([list[pos + 1], list[pos + 2]]) as usize;
        let name_start = pos + 3;
        let name = list.get(name_start..name_start + name_len)?;
        if name_type == 0 {
            return std::str::from_utf8(name).ok().map(str::to_string);
        }
        pos = name_start + name_len;
    }
    None
}
