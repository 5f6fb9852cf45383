//! Listen addresses.
//!
//! Accepted forms:
//!
//! - `host:port` or `http://host:port` for TCP
//! - `http://unix:/path/to/socket` or `unix:/path/to/socket` for local sockets

use std::fmt;
use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::PathBuf;
use std::str::FromStr;

use thiserror::Error;
use url::{Host, Url};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AddressError {
    #[error("invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),
    #[error("unsupported scheme {0:?}")]
    UnsupportedScheme(String),
    #[error("missing host")]
    MissingHost,
    #[error("empty socket path")]
    EmptyPath,
}

/// Where a listener binds.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ServerAddress {
    Tcp { host: String, port: u16 },
    Unix(PathBuf),
}

impl ServerAddress {
    pub fn parse(input: &str) -> Result<Self, AddressError> {
        let input = input.trim();

        let lower = input.to_ascii_lowercase();
        for prefix in ["http://unix:", "unix:"] {
            if lower.starts_with(prefix) {
                let path = &input[prefix.len()..];
                if path.is_empty() {
                    return Err(AddressError::EmptyPath);
                }
                return Ok(ServerAddress::Unix(PathBuf::from(path)));
            }
        }

        let url = if input.contains("://") {
            Url::parse(input)?
        } else {
            Url::parse(&format!("http://{input}"))?
        };

        if url.scheme() != "http" {
            return Err(AddressError::UnsupportedScheme(url.scheme().to_string()));
        }

        let host = match url.host() {
            Some(Host::Domain(domain)) => domain.to_string(),
            Some(Host::Ipv4(addr)) => addr.to_string(),
            Some(Host::Ipv6(addr)) => addr.to_string(),
            None => return Err(AddressError::MissingHost),
        };
        let port = url.port().unwrap_or(80);

        Ok(ServerAddress::Tcp { host, port })
    }

    pub fn is_unix(&self) -> bool {
        matches!(self, ServerAddress::Unix(_))
    }

    /// Resolve a TCP address to the socket addresses it names.
    pub fn socket_addrs(&self) -> io::Result<Vec<SocketAddr>> {
        match self {
            ServerAddress::Tcp { host, port } => Ok((host.as_str(), *port).to_socket_addrs()?.collect()),
            ServerAddress::Unix(path) => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{} is a local socket path", path.display()),
            )),
        }
    }
}

impl FromStr for ServerAddress {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ServerAddress::parse(s)
    }
}

impl fmt::Display for ServerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServerAddress::Tcp { host, port } if host.contains(':') => {
                write!(f, "http://[{host}]:{port}")
            }
            ServerAddress::Tcp { host, port } => write!(f, "http://{host}:{port}"),
            ServerAddress::Unix(path) => write!(f, "http://unix:{}", path.display()),
        }
    }
}
