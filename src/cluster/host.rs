//! Server endpoint descriptors.

use crate::error::{Error, Result};
use std::fmt;

/// An immutable server endpoint: hostname or IP, optional TLS name, port.
///
/// Hosts key the cluster's alias table: every address a node is reachable
/// under maps to the same [`Node`](crate::cluster::Node).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Host {
    /// Hostname or IP address.
    pub name: String,

    /// TLS server name, when it differs from `name`.
    pub tls_name: Option<String>,

    /// TCP port.
    pub port: u16,
}

impl Host {
    /// Create a host from a name and port.
    pub fn new(name: impl Into<String>, port: u16) -> Self {
        Self {
            name: name.into(),
            tls_name: None,
            port,
        }
    }

    /// Create a host with a TLS server name.
    pub fn with_tls_name(name: impl Into<String>, tls_name: impl Into<String>, port: u16) -> Self {
        Self {
            name: name.into(),
            tls_name: Some(tls_name.into()),
            port,
        }
    }

    /// Parse a single `host:port` pair. The port may be omitted, in which
    /// case `default_port` is used.
    pub fn parse(s: &str, default_port: u16) -> Result<Self> {
        let s = s.trim();
        if s.is_empty() {
            return Err(Error::Config("empty host entry".into()));
        }

        match s.rsplit_once(':') {
            Some((name, port)) if !name.is_empty() => {
                let port = port
                    .parse::<u16>()
                    .map_err(|_| Error::Config(format!("invalid port in host entry '{s}'")))?;
                Ok(Host::new(name, port))
            }
            _ => Ok(Host::new(s, default_port)),
        }
    }

    /// Parse a comma-separated seed list such as `"a:3000,b,c:3100"`.
    /// Entries without a port default to 3000.
    pub fn parse_list(s: &str) -> Result<Vec<Host>> {
        let hosts = s
            .split(',')
            .filter(|entry| !entry.trim().is_empty())
            .map(|entry| Host::parse(entry, 3000))
            .collect::<Result<Vec<_>>>()?;

        if hosts.is_empty() {
            return Err(Error::Config(format!("no hosts in seed list '{s}'")));
        }
        Ok(hosts)
    }

    /// `host:port` form used for DNS resolution.
    pub fn address(&self) -> String {
        format!("{}:{}", self.name, self.port)
    }
}

impl fmt::Display for Host {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.name, self.port)
    }
}
