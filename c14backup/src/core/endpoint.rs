//! SSH endpoint of an archive's mountable storage.

use std::fmt;

use crate::error::ConfigError;

/// `user@host:port` triple parsed from a provider credential URI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshEndpoint {
    pub user: String,
    pub host: String,
    pub port: u16,
}

impl SshEndpoint {
    /// Parse `scheme://user@host:port[/path]`.
    ///
    /// All three fields are required; anything else is a configuration error.
    pub fn parse(uri: &str) -> Result<Self, ConfigError> {
        let malformed =
            || ConfigError::new(format!("URI is wrong or does not contain user, host and port: {uri}"));

        let rest = match uri.split_once("://") {
            Some((scheme, rest)) if !scheme.is_empty() => rest,
            _ => return Err(malformed()),
        };
        let authority = rest.split('/').next().unwrap_or_default();
        let (user, host_port) = authority.rsplit_once('@').ok_or_else(malformed)?;
        let (host, port) = host_port.rsplit_once(':').ok_or_else(malformed)?;
        if user.is_empty() || host.is_empty() {
            return Err(malformed());
        }
        let port: u16 = port.parse().map_err(|_| malformed())?;

        Ok(Self {
            user: user.to_string(),
            host: host.to_string(),
            port,
        })
    }

    /// `user@host`, the form ssh-based tools take as destination.
    pub fn destination(&self) -> String {
        format!("{}@{}", self.user, self.host)
    }
}

impl fmt::Display for SshEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}:{}", self.user, self.host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_full_uri() {
        let endpoint = SshEndpoint::parse("ssh://c14ssh@abc.buffer.c14.io:51234").expect("parse");
        assert_eq!(endpoint.user, "c14ssh");
        assert_eq!(endpoint.host, "abc.buffer.c14.io");
        assert_eq!(endpoint.port, 51234);
        assert_eq!(endpoint.destination(), "c14ssh@abc.buffer.c14.io");
    }

    #[test]
    fn ignores_trailing_path() {
        let endpoint = SshEndpoint::parse("ssh://u@h:22/buffer").expect("parse");
        assert_eq!(endpoint.to_string(), "u@h:22");
    }

    #[test]
    fn rejects_missing_parts() {
        for uri in ["ssh://h:22", "ssh://u@h", "u@h:22", "ssh://u@h:notaport", "ssh://@h:22"] {
            let err = SshEndpoint::parse(uri).unwrap_err();
            assert!(err.message.contains(uri), "{uri}: {err}");
        }
    }
}
