//! Renders the fixed PAC (`FindProxyForURL`) document served at the WPAD
//! paths. The document is static for a given interface's configuration, so
//! it is rendered once at construction and served verbatim thereafter.

use askama::Template;
use ipnet::IpNet;

pub const WPAD_PATHS: &[&str] = &["/proxy.pac", "/wpad.dat", "/wpad.da"];
pub const WPAD_CONTENT_TYPE: &str = "application/x-ns-proxy-autoconfig";

struct NetworkClause {
    ip: String,
    mask: String,
}

#[derive(Template)]
#[template(path = "wpad.pac.txt")]
struct WpadTemplate<'a> {
    networks: &'a [NetworkClause],
    proxy: &'a str,
}

#[derive(Debug, Clone)]
pub struct WpadRenderer {
    document: String,
}

impl WpadRenderer {
    /// `proxy_endpoint` is the already-resolved `ip:port` string (or a
    /// deployment-supplied literal), with the `"self"` sentinel already
    /// expanded by the caller per Open Question 3.
    pub fn new(direct_networks: &[IpNet], proxy_endpoint: &str) -> Self {
        let networks: Vec<NetworkClause> = direct_networks
            .iter()
            .map(|net| NetworkClause {
                ip: net.network().to_string(),
                mask: net.netmask().to_string(),
            })
            .collect();
        let template = WpadTemplate {
            networks: &networks,
            proxy: proxy_endpoint,
        };
        let document = template.render().expect("wpad template is static and always renders");
        Self { document }
    }

    pub fn document(&self) -> &str {
        &self.document
    }
}
