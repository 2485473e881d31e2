//! The fixed table of HTTP verbs the proxy understands, and which of them are
//! permitted by default when a policy does not list `allowed_methods` explicitly.

use std::collections::HashSet;

/// One entry of the method table: an upper-case verb and whether it is part of
/// the default `allowed_methods` set for a freshly-defaulted `PolicyConfig`.
pub struct MethodEntry {
    pub name: &'static str,
    pub default_for_proxy: bool,
}

/// GET/HEAD/POST/PUT/PATCH/DELETE/CONNECT/OPTIONS plus the WebDAV/CalDAV/DeltaV
/// verbs; TRACE is recognized but off by default.
pub const METHOD_TABLE: &[MethodEntry] = &[
    entry("GET", true),
    entry("HEAD", true),
    entry("POST", true),
    entry("PUT", true),
    entry("PATCH", true),
    entry("DELETE", true),
    entry("CONNECT", true),
    entry("OPTIONS", true),
    entry("TRACE", false),
    // WebDAV methods
    entry("COPY", true),
    entry("LOCK", true),
    entry("MKCOL", true),
    entry("MOVE", true),
    entry("PROPFIND", true),
    entry("PROPPATCH", true),
    entry("UNLOCK", true),
    // WebDAV ACL methods
    entry("ACL", true),
    // WebDAV versioning (DeltaV)
    entry("REPORT", true),
    entry("VERSION-CONTROL", true),
    entry("CHECKOUT", true),
    entry("CHECKIN", true),
    entry("UNCHECKOUT", true),
    entry("MKWORKSPACE", true),
    entry("UPDATE", true),
    entry("LABEL", true),
    entry("MERGE", true),
    entry("BASELINE-CONTROL", true),
    entry("MKACTIVITY", true),
    entry("SEARCH", true),
    // WebDAV collection ordering
    entry("ORDERPATCH", true),
    // CalDAV methods
    entry("MKCALENDAR", true),
];

const fn entry(name: &'static str, default_for_proxy: bool) -> MethodEntry {
    MethodEntry {
        name,
        default_for_proxy,
    }
}

/// Looks up a method token (expected already upper-cased) in the table.
pub fn lookup(method: &str) -> Option<&'static MethodEntry> {
    METHOD_TABLE.iter().find(|m| m.name == method)
}

/// True if `method` is a known verb. Configuration validation uses this to drop
/// unrecognized tokens (with a warning) rather than rejecting the whole config.
pub fn is_known(method: &str) -> bool {
    lookup(method).is_some()
}

/// The set of methods allowed by a `PolicyConfig` that did not override
/// `allowed_methods` in configuration.
pub fn default_allowed_methods() -> HashSet<String> {
    METHOD_TABLE
        .iter()
        .filter(|m| m.default_for_proxy)
        .map(|m| m.name.to_string())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trace_is_known_but_not_default() {
        let entry = lookup("TRACE").expect("TRACE is in the table");
        assert!(!entry.default_for_proxy);
    }

    #[test]
    fn unknown_verb_is_rejected() {
        assert!(!is_known("FROB"));
    }

    #[test]
    fn default_set_excludes_trace() {
        let defaults = default_allowed_methods();
        assert!(defaults.contains("GET"));
        assert!(defaults.contains("CONNECT"));
        assert!(!defaults.contains("TRACE"));
    }
}
