use crate::repo::Meta;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Host names that always refer to this node
const LOOPBACK: [&str; 4] = ["", "localhost", "127.0.0.1", "::1"];

/// The set of names under which this node recognises itself
#[derive(Debug, Clone)]
pub struct LocalHosts {
    names: Vec<String>,
}

impl LocalHosts {
    /// Loopback names plus the machine hostname and any configured aliases
    pub fn detect<'a>(aliases: impl IntoIterator<Item = &'a str>) -> Self {
        let hostname = gethostname::gethostname().to_string_lossy().into_owned();
        let mut hosts = Self::with_names(aliases);
        hosts.add(&hostname);
        hosts
    }

    pub fn with_names<'a>(extra: impl IntoIterator<Item = &'a str>) -> Self {
        let mut hosts = Self {
            names: LOOPBACK.iter().map(|s| s.to_string()).collect(),
        };
        for name in extra {
            hosts.add(name);
        }
        hosts
    }

    fn add(&mut self, name: &str) {
        let name = name.trim().to_ascii_lowercase();
        if !self.names.contains(&name) {
            self.names.push(name);
        }
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn is_local(&self, host: &str) -> bool {
        let host = host.trim();
        self.names.iter().any(|n| n.eq_ignore_ascii_case(host))
    }
}

/// Address of a peer node's RPC server
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Endpoint named by repo metadata (`host`, `port.rpc`)
    pub fn from_meta(meta: &Meta, default_port: u16) -> Self {
        Self::new(meta.host(), meta.rpc_port().unwrap_or(default_port))
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') && !self.host.starts_with('[') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_loopback_is_local() {
        let hosts = LocalHosts::with_names([]);
        for name in ["", "localhost", "LOCALHOST", "127.0.0.1", "::1"] {
            assert!(hosts.is_local(name), "{name} should be local");
        }
        assert!(!hosts.is_local("elsewhere"));
    }

    #[test]
    fn test_detect_includes_hostname() {
        let hostname = gethostname::gethostname().to_string_lossy().into_owned();
        let hosts = LocalHosts::detect(["alias"]);
        assert!(hosts.is_local(&hostname));
        assert!(hosts.is_local("ALIAS"));
    }

    #[test]
    fn test_alias_is_local() {
        let hosts = LocalHosts::with_names(["Node-A"]);
        assert!(hosts.is_local("node-a"));
        assert!(!hosts.is_local("node-b"));
    }

    #[test]
    fn test_endpoint_from_meta() {
        let meta = Meta::new().with("host", "h1").with("port.rpc", "9000");
        assert_eq!(Endpoint::from_meta(&meta, 7820).to_string(), "h1:9000");

        let meta = Meta::new().with("host", "h2");
        assert_eq!(Endpoint::from_meta(&meta, 7820).to_string(), "h2:7820");
    }

    #[test]
    fn test_ipv6_endpoint_display() {
        assert_eq!(Endpoint::new("::1", 7820).to_string(), "[::1]:7820");
    }
}
