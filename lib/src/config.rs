//! Configuration loading and validation. The on-disk form is the native YAML
//! document described in `SPEC_FULL.md` §3; `MainConfig` is its direct serde
//! mirror, `Configuration::check` turns it into the frozen runtime form
//! (`PolicyConfig`, `DomainTrie`, `WpadRenderer`, reverse-proxy routes) that
//! the rest of the crate consumes.
//!
//! The pfSense XML alternate form is out of scope (spec §1); a caller that
//! already translated one into a `MainConfig` value can still call `check`
//! directly.

use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use ipnet::IpNet;
use serde::Deserialize;
use tracing::{error, warn};

use crate::methods;
use crate::policy::PolicyConfig;
use crate::reverse::ReverseRoute;
use crate::trie::DomainTrie;
use crate::wpad::WpadRenderer;

pub const DEFAULT_PROXY_PORT: u16 = 3128;
/// Conventional transparent-TLS port for deployments that want one without
/// picking their own; `https_transparent_port` stays unset (disabled) unless
/// a configuration opts in explicitly, so this is left for callers to use.
pub const DEFAULT_TLS_PORT: u16 = 3129;
pub const DEFAULT_BIND_PORT: u16 = 80;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("reading configuration file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing configuration file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yml::Error,
    },
    #[error("configuration has no usable interfaces after validation")]
    NoValidInterfaces,
}

fn default_log_level() -> String {
    "info".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub file: Option<PathBuf>,
    #[serde(default)]
    pub log_mac_address: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file: None,
            log_mac_address: false,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DirectConfig {
    #[serde(default)]
    pub networks: Vec<String>,
    #[serde(default)]
    pub interface_network_direct: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProxyConfig {
    pub port: Option<u16>,
    pub allow_high_ports: Option<bool>,
    pub allow_low_ports: Option<bool>,
    pub block_ips: Option<bool>,
    pub block_local_services: Option<bool>,
    pub block_by_idn: Option<bool>,
    #[serde(default)]
    pub block_list: Vec<String>,
    pub http_transparent: Option<bool>,
    pub https_transparent_port: Option<u16>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct WpadConfig {
    pub enable: Option<bool>,
    pub external_proxy: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct HttpConfig {
    pub allowed_methods: Option<Vec<String>>,
    #[serde(default)]
    pub wpad: WpadConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DefaultConfig {
    #[serde(default)]
    pub direct: DirectConfig,
    #[serde(default)]
    pub proxy: ProxyConfig,
    #[serde(default)]
    pub http: HttpConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReverseProxyConfigRaw {
    pub peer_ip: IpAddr,
    pub peer_port: Option<u16>,
    /// Overrides the owning interface's address as the outbound `LocalAddr`;
    /// names another configured interface.
    pub source_interface: Option<String>,
    pub allowed_methods: Option<Vec<String>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct InterfaceConfigRaw {
    pub ip: Option<IpAddr>,
    #[serde(default)]
    pub enable_proxy: bool,
    #[serde(default)]
    pub enable_wpad: bool,
    pub direct: Option<DirectConfig>,
    pub proxy: Option<ProxyConfig>,
    pub http: Option<HttpConfig>,
    #[serde(default)]
    pub reverse_proxies: HashMap<String, ReverseProxyConfigRaw>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct MainConfig {
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub defaults: DefaultConfig,
    #[serde(default)]
    pub interfaces: HashMap<String, InterfaceConfigRaw>,
}

impl MainConfig {
    pub async fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text =
            tokio::fs::read_to_string(path)
                .await
                .map_err(|source| ConfigError::Read {
                    path: path.to_path_buf(),
                    source,
                })?;
        serde_yml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }
}

/// One fully validated, runtime-ready interface.
#[derive(Debug, Clone)]
pub struct InterfaceConfig {
    pub name: String,
    pub ip: IpAddr,
    pub enable_proxy: bool,
    pub enable_wpad: bool,
    pub policy: PolicyConfig,
    pub direct_networks: Vec<IpNet>,
    pub reverse_proxies: HashMap<String, ReverseRoute>,
    pub wpad: Option<WpadRenderer>,
}

impl InterfaceConfig {
    pub fn has_http_front(&self) -> bool {
        !self.reverse_proxies.is_empty() || self.wpad.is_some()
    }
}

/// The validated, frozen configuration the daemon is built from.
#[derive(Debug, Clone)]
pub struct Configuration {
    pub logging: LoggingConfig,
    pub interfaces: Vec<InterfaceConfig>,
}

impl Configuration {
    pub async fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = MainConfig::load(path).await?;
        Self::check(raw)
    }

    pub fn check(raw: MainConfig) -> Result<Self, ConfigError> {
        let defaults = &raw.defaults;

        let global_idn = defaults.proxy.block_by_idn.unwrap_or(false);
        let global_block_list = if defaults.proxy.block_list.is_empty() {
            None
        } else {
            Some(Arc::new(DomainTrie::from_patterns(
                &defaults.proxy.block_list,
                global_idn,
            )))
        };

        let interface_ips: HashMap<String, IpAddr> = raw
            .interfaces
            .iter()
            .filter_map(|(name, iface)| iface.ip.map(|ip| (name.clone(), ip)))
            .collect();

        let mut interfaces = Vec::new();
        for (name, raw_iface) in &raw.interfaces {
            match build_interface(name, raw_iface, defaults, &global_block_list, &interface_ips) {
                Ok(iface) => interfaces.push(iface),
                Err(err) => error!(interface = %name, error = %err, "skipping interface: invalid configuration"),
            }
        }

        if interfaces.is_empty() {
            return Err(ConfigError::NoValidInterfaces);
        }

        Ok(Self {
            logging: raw.logging.clone(),
            interfaces,
        })
    }
}

fn merge_direct(base: &DirectConfig, over: &Option<DirectConfig>) -> DirectConfig {
    match over {
        Some(over) => DirectConfig {
            networks: if over.networks.is_empty() {
                base.networks.clone()
            } else {
                over.networks.clone()
            },
            interface_network_direct: over.interface_network_direct,
        },
        None => base.clone(),
    }
}

fn merge_proxy(base: &ProxyConfig, over: &Option<ProxyConfig>) -> ProxyConfig {
    let over = over.clone().unwrap_or_default();
    ProxyConfig {
        port: over.port.or(base.port),
        allow_high_ports: over.allow_high_ports.or(base.allow_high_ports),
        allow_low_ports: over.allow_low_ports.or(base.allow_low_ports),
        block_ips: over.block_ips.or(base.block_ips),
        block_local_services: over.block_local_services.or(base.block_local_services),
        block_by_idn: over.block_by_idn.or(base.block_by_idn),
        block_list: if over.block_list.is_empty() {
            base.block_list.clone()
        } else {
            over.block_list
        },
        http_transparent: over.http_transparent.or(base.http_transparent),
        https_transparent_port: over.https_transparent_port.or(base.https_transparent_port),
    }
}

fn merge_http(base: &HttpConfig, over: &Option<HttpConfig>) -> HttpConfig {
    match over {
        Some(over) => HttpConfig {
            allowed_methods: over
                .allowed_methods
                .clone()
                .or_else(|| base.allowed_methods.clone()),
            wpad: WpadConfig {
                enable: over.wpad.enable.or(base.wpad.enable),
                external_proxy: over
                    .wpad
                    .external_proxy
                    .clone()
                    .or_else(|| base.wpad.external_proxy.clone()),
            },
        },
        None => base.clone(),
    }
}

fn validated_methods(raw: &Option<Vec<String>>, interface: &str) -> HashSet<String> {
    let Some(tokens) = raw else {
        return methods::default_allowed_methods();
    };
    let mut set = HashSet::new();
    for token in tokens {
        let upper = token.to_ascii_uppercase();
        if methods::is_known(&upper) {
            set.insert(upper);
        } else {
            warn!(interface, method = %token, "Unknown HTTP method, skipping");
        }
    }
    if set.is_empty() {
        methods::default_allowed_methods()
    } else {
        set
    }
}

fn parse_direct_networks(direct: &DirectConfig, interface: &str, own_ip: IpAddr) -> Vec<IpNet> {
    let mut networks = Vec::new();
    for entry in &direct.networks {
        match entry.parse::<IpNet>() {
            Ok(net) => {
                if !networks.contains(&net) {
                    networks.push(net);
                }
            }
            Err(err) => {
                error!(interface, network = %entry, error = %err, "invalid CIDR, skipping")
            }
        }
    }
    if direct.interface_network_direct {
        let own = match own_ip {
            IpAddr::V4(v4) => IpNet::new(IpAddr::V4(v4), 32),
            IpAddr::V6(v6) => IpNet::new(IpAddr::V6(v6), 128),
        }
        .expect("host prefix length is always valid");
        if !networks.contains(&own) {
            networks.push(own);
        }
    }
    networks
}

fn resolve_proxy_endpoint(
    enable_proxy: bool,
    own_ip: IpAddr,
    port: u16,
    wpad: &WpadConfig,
) -> Option<String> {
    if enable_proxy {
        return Some(format!("{own_ip}:{port}"));
    }
    match wpad.external_proxy.as_deref() {
        Some("self") => None,
        Some(other) => Some(other.to_string()),
        None => None,
    }
}

fn build_interface(
    name: &str,
    raw: &InterfaceConfigRaw,
    defaults: &DefaultConfig,
    global_block_list: &Option<Arc<DomainTrie>>,
    interface_ips: &HashMap<String, IpAddr>,
) -> Result<InterfaceConfig, String> {
    let ip = raw
        .ip
        .ok_or_else(|| format!("interface {name} has no bind IP"))?;

    let direct = merge_direct(&defaults.direct, &raw.direct);
    let proxy = merge_proxy(&defaults.proxy, &raw.proxy);
    let http = merge_http(&defaults.http, &raw.http);

    let direct_networks = parse_direct_networks(&direct, name, ip);

    let port = proxy.port.unwrap_or(DEFAULT_PROXY_PORT);
    let block_by_idn = proxy.block_by_idn.unwrap_or(false);
    let https_transparent_port = if raw.enable_proxy {
        proxy.https_transparent_port.unwrap_or(0)
    } else {
        0
    };

    let policy = PolicyConfig {
        port,
        allow_high_ports: proxy.allow_high_ports.unwrap_or(true),
        allow_low_ports: proxy.allow_low_ports.unwrap_or(false),
        block_ips: proxy.block_ips.unwrap_or(false),
        block_local_services: proxy.block_local_services.unwrap_or(true),
        local_ips: HashSet::from([ip]),
        direct_networks: direct_networks.clone(),
        allowed_methods: validated_methods(&http.allowed_methods, name),
        block_list: DomainTrie::from_patterns(&proxy.block_list, block_by_idn),
        block_by_idn,
        http_transparent: proxy.http_transparent.unwrap_or(false),
        https_transparent_port,
        global_block_list: global_block_list.clone(),
    };

    let mut reverse_proxies = HashMap::new();
    for (host, route) in &raw.reverse_proxies {
        let source_ip = match &route.source_interface {
            Some(other) => match interface_ips.get(other) {
                Some(ip) => *ip,
                None => {
                    error!(
                        interface = name,
                        host, source_interface = %other,
                        "unknown source_interface for reverse proxy route, using interface IP"
                    );
                    ip
                }
            },
            None => ip,
        };
        let allowed = route
            .allowed_methods
            .clone()
            .unwrap_or_else(|| {
                ["GET", "HEAD", "POST", "PUT", "PATCH", "DELETE", "OPTIONS"]
                    .map(String::from)
                    .to_vec()
            })
            .into_iter()
            .map(|m| m.to_ascii_uppercase())
            .collect();
        reverse_proxies.insert(
            host.clone(),
            ReverseRoute::new(route.peer_ip, route.peer_port.unwrap_or(80), source_ip, allowed),
        );
    }

    let wpad_enabled = raw.enable_wpad && http.wpad.enable.unwrap_or(true);
    let wpad = if wpad_enabled {
        resolve_proxy_endpoint(raw.enable_proxy, ip, port, &http.wpad)
            .map(|endpoint| WpadRenderer::new(&direct_networks, &endpoint))
    } else {
        None
    };
    if raw.enable_wpad && wpad.is_none() {
        warn!(interface = name, "WPAD enabled but no proxy endpoint available, disabling it");
    }

    Ok(InterfaceConfig {
        name: name.to_string(),
        ip,
        enable_proxy: raw.enable_proxy,
        enable_wpad: wpad.is_some(),
        policy,
        direct_networks,
        reverse_proxies,
        wpad,
    })
}
