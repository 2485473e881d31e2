//! The fixed structured-log field schema emitted by every component that
//! handles a connection: `src`, `src_port`, an optional `src_mac`, `method`,
//! `url`, an optional `dest`/`dest_port`, an optional `status`, transferred
//! byte counts, and the terminal `action` the request took.

use std::net::IpAddr;

use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Pass,
    Block,
    Tunnel,
    Error,
}

impl Action {
    fn as_str(self) -> &'static str {
        match self {
            Action::Pass => "pass",
            Action::Block => "block",
            Action::Tunnel => "tunnel",
            Action::Error => "error",
        }
    }
}

/// One connection/request's worth of loggable facts. Fields left `None` are
/// omitted from the emitted record rather than logged as empty strings.
#[derive(Debug, Clone, Default)]
pub struct LogRecord {
    pub src: Option<IpAddr>,
    pub src_port: Option<u16>,
    pub src_mac: Option<String>,
    pub method: Option<String>,
    pub url: Option<String>,
    pub dest: Option<String>,
    pub dest_port: Option<u16>,
    pub status: Option<u16>,
    pub bytes_in: Option<u64>,
    pub bytes_out: Option<u64>,
    pub user_agent: Option<String>,
    pub referrer: Option<String>,
    pub content_type: Option<String>,
}

/// Emits one `LogRecord` at `info` level, tagged with the component that
/// produced it (`proxy`, `reverse`, `wpad`, `https_transparent`,
/// `config_loader`, `server`) and the terminal action taken.
pub fn log_access(component: &'static str, action: Action, record: &LogRecord) {
    let src = record.src.map(|ip| ip.to_string());
    info!(
        component,
        action = action.as_str(),
        src = src.as_deref(),
        src_port = record.src_port,
        src_mac = record.src_mac.as_deref(),
        method = record.method.as_deref(),
        url = record.url.as_deref(),
        dest = record.dest.as_deref(),
        dest_port = record.dest_port,
        status = record.status,
        bytes_in = record.bytes_in,
        bytes_out = record.bytes_out,
        user_agent = record.user_agent.as_deref(),
        referrer = record.referrer.as_deref(),
        content_type = record.content_type.as_deref(),
        "access",
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn action_strings_match_schema() {
        assert_eq!(Action::Pass.as_str(), "pass");
        assert_eq!(Action::Block.as_str(), "block");
        assert_eq!(Action::Tunnel.as_str(), "tunnel");
        assert_eq!(Action::Error.as_str(), "error");
    }
}
