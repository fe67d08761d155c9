//! The address a [`crate::Link`] connects to.

use std::{fmt, str::FromStr};

use crate::error::{Error, Result};

/// A `host[:port]` pair identifying one server in a deployment.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct ServerAddress {
    pub host: String,
    pub port: u16,
}

impl ServerAddress {
    pub const DEFAULT_PORT: u16 = 27017;

    pub fn new(host: impl Into<String>, port: Option<u16>) -> Self {
        Self {
            host: host.into().to_lowercase(),
            port: port.unwrap_or(Self::DEFAULT_PORT),
        }
    }

    pub fn parse(s: impl AsRef<str>) -> Result<Self> {
        let s = s.as_ref();
        match s.rsplit_once(':') {
            Some((host, port)) => {
                let port = port
                    .parse::<u16>()
                    .map_err(|_| Error::invalid_argument(format!("invalid port in address `{s}`")))?;
                Ok(Self::new(host, Some(port)))
            }
            None => Ok(Self::new(s, None)),
        }
    }
}

impl FromStr for ServerAddress {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for ServerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn host_is_lowercased_so_addresses_compare_case_insensitively() {
        assert_eq!(ServerAddress::new("Host.Example.Com", None).host, "host.example.com");
    }

    #[test]
    fn parse_defaults_to_the_standard_port_when_none_is_given() {
        let addr = ServerAddress::parse("db.example.com").unwrap();
        assert_eq!(addr.port, ServerAddress::DEFAULT_PORT);
    }

    #[test]
    fn parse_splits_on_the_last_colon_for_a_bare_ipv4_host() {
        let addr = ServerAddress::parse("127.0.0.1:27018").unwrap();
        assert_eq!(addr.host, "127.0.0.1");
        assert_eq!(addr.port, 27018);
    }

    #[test]
    fn parse_rejects_a_non_numeric_port() {
        assert!(ServerAddress::parse("h1:notaport").is_err());
    }
}
