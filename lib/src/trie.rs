//! Reverse-labeled domain trie used by block-lists. Labels are matched
//! right-to-left (`com` before `example` before `www`), and a node marked
//! `wildcard` subsumes every name below it.

use std::collections::HashMap;

#[derive(Debug, Default, Clone)]
struct Node {
    children: HashMap<String, Node>,
    wildcard: bool,
}

impl Node {
    fn is_terminal_leaf(&self) -> bool {
        self.children.is_empty() && !self.wildcard
    }
}

/// A read-after-build domain trie. Not `Sync`-safe for concurrent writers;
/// once construction is done it is immutable and safe to share behind an
/// `Arc`.
#[derive(Debug, Default, Clone)]
pub struct DomainTrie {
    root: Node,
    idn: bool,
}

impl DomainTrie {
    pub fn new(idn: bool) -> Self {
        Self {
            root: Node::default(),
            idn,
        }
    }

    /// Builds a trie from a flat pattern list, e.g. configuration's
    /// `block_list` entries. Patterns may use a leading `*.` wildcard label.
    pub fn from_patterns(patterns: impl IntoIterator<Item = impl AsRef<str>>, idn: bool) -> Self {
        let mut trie = Self::new(idn);
        for pattern in patterns {
            trie.put(pattern.as_ref());
        }
        trie
    }

    pub fn is_empty(&self) -> bool {
        self.root.children.is_empty() && !self.root.wildcard
    }

    pub fn put(&mut self, name: &str) {
        let normalized = normalize_name(name, self.idn);
        let labels: Vec<&str> = normalized.split('.').rev().collect();
        let mut node = &mut self.root;
        for label in labels {
            if node.wildcard {
                return;
            }
            if label == "*" {
                node.wildcard = true;
                node.children.clear();
                return;
            }
            node = node.children.entry(label.to_string()).or_default();
        }
    }

    pub fn get(&self, name: &str) -> bool {
        let normalized = normalize_name(name, self.idn);
        let labels: Vec<&str> = normalized.split('.').rev().collect();
        let mut node = &self.root;
        for label in &labels {
            if node.wildcard {
                return true;
            }
            match node.children.get(*label) {
                Some(child) => node = child,
                None => return false,
            }
        }
        node.is_terminal_leaf()
    }
}

fn normalize_name(name: &str, idn: bool) -> String {
    let trimmed = name.trim_matches('.');
    if trimmed.is_ascii() {
        if trimmed.bytes().any(|b| b.is_ascii_uppercase()) {
            trimmed.to_ascii_lowercase()
        } else {
            trimmed.to_string()
        }
    } else if idn {
        let (prefix, rest) = match trimmed.strip_prefix("*.") {
            Some(rest) => ("*.", rest),
            None => ("", trimmed),
        };
        match idna::domain_to_ascii(rest) {
            Ok(ascii) => format!("{prefix}{ascii}"),
            Err(_) => trimmed.to_lowercase(),
        }
    } else {
        trimmed.to_lowercase()
    }
}
