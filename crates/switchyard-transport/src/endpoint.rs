//! Endpoint strings: `tcp://host:port`, `tls://host:port`, `inproc://name`.

use std::fmt;
use std::str::FromStr;

use crate::error::TransportError;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Endpoint {
    Tcp { host: String, port: u16 },
    Tls { host: String, port: u16 },
    Inproc(String),
}

impl Endpoint {
    pub fn is_tls(&self) -> bool {
        matches!(self, Endpoint::Tls { .. })
    }

    /// Host for name resolution and certificate checks, without IPv6 brackets.
    pub fn host(&self) -> Option<&str> {
        match self {
            Endpoint::Tcp { host, .. } | Endpoint::Tls { host, .. } => {
                Some(host.trim_start_matches('[').trim_end_matches(']'))
            }
            Endpoint::Inproc(_) => None,
        }
    }

    /// Address string handed to the OS when binding. `*` means all interfaces.
    pub(crate) fn bind_addr(&self) -> Option<String> {
        match self {
            Endpoint::Tcp { host, port } | Endpoint::Tls { host, port } => {
                let host = if host == "*" { "0.0.0.0" } else { host.as_str() };
                Some(format!("{host}:{port}"))
            }
            Endpoint::Inproc(_) => None,
        }
    }

    pub(crate) fn connect_addr(&self) -> Option<(String, u16)> {
        match self {
            Endpoint::Tcp { port, .. } | Endpoint::Tls { port, .. } => {
                Some((self.host()?.to_string(), *port))
            }
            Endpoint::Inproc(_) => None,
        }
    }

    /// Same endpoint with a different port. Inproc endpoints are unchanged.
    pub fn with_port(&self, port: u16) -> Endpoint {
        match self {
            Endpoint::Tcp { host, .. } => Endpoint::Tcp {
                host: host.clone(),
                port,
            },
            Endpoint::Tls { host, .. } => Endpoint::Tls {
                host: host.clone(),
                port,
            },
            Endpoint::Inproc(name) => Endpoint::Inproc(name.clone()),
        }
    }

    /// Endpoint a remote client can dial. Wildcard hosts become 127.0.0.1.
    pub fn advertised(&self) -> Endpoint {
        match self {
            Endpoint::Tcp { host, port } if is_wildcard(host) => Endpoint::Tcp {
                host: "127.0.0.1".into(),
                port: *port,
            },
            Endpoint::Tls { host, port } if is_wildcard(host) => Endpoint::Tls {
                host: "127.0.0.1".into(),
                port: *port,
            },
            other => other.clone(),
        }
    }
}

fn is_wildcard(host: &str) -> bool {
    host == "*" || host == "0.0.0.0"
}

impl FromStr for Endpoint {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |why| TransportError::InvalidEndpoint(s.to_string(), why);

        let (scheme, rest) = s.split_once("://").ok_or_else(|| invalid("missing scheme"))?;
        match scheme {
            "inproc" => {
                if rest.is_empty() {
                    return Err(invalid("empty inproc name"));
                }
                Ok(Endpoint::Inproc(rest.to_string()))
            }
            "tcp" | "tls" => {
                let (host, port) = rest.rsplit_once(':').ok_or_else(|| invalid("missing port"))?;
                if host.is_empty() {
                    return Err(invalid("empty host"));
                }
                if host.starts_with('[') != host.ends_with(']') {
                    return Err(invalid("unbalanced brackets"));
                }
                let port: u16 = port.parse().map_err(|_| invalid("bad port"))?;
                let host = host.to_string();
                Ok(if scheme == "tcp" {
                    Endpoint::Tcp { host, port }
                } else {
                    Endpoint::Tls { host, port }
                })
            }
            _ => Err(invalid("unknown scheme")),
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Tcp { host, port } => write!(f, "tcp://{host}:{port}"),
            Endpoint::Tls { host, port } => write!(f, "tls://{host}:{port}"),
            Endpoint::Inproc(name) => write!(f, "inproc://{name}"),
        }
    }
}
