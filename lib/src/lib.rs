pub mod arp;
pub mod config;
pub mod daemon;
pub mod forward_proxy;
pub mod http_front;
pub mod interface_server;
pub mod logging;
pub mod methods;
pub mod policy;
pub mod reverse;
pub mod transparent_tls;
pub mod trie;
pub mod wpad;

pub use config::{Configuration, ConfigError, MainConfig};
pub use daemon::Daemon;
pub use interface_server::InterfaceServer;
