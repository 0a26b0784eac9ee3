//! Service URIs: `BIN://host[:port][#ID]` and `JSON://host[:port][#ID]`.

#![allow(missing_docs)]

use std::fmt;

use plc_runtime::config::DEFAULT_PORT;

use crate::error::ConnectorError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    Binary,
    Json,
}

impl Scheme {
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Binary => "BIN",
            Self::Json => "JSON",
        }
    }

    #[must_use]
    pub fn default_port(self) -> u16 {
        match self {
            Self::Binary => DEFAULT_PORT,
            Self::Json => DEFAULT_PORT + 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceUri {
    pub scheme: Scheme,
    pub host: String,
    pub port: u16,
    /// Identity whose pre-shared secret authenticates the connection.
    pub id: Option<String>,
}

impl ServiceUri {
    pub fn parse(text: &str) -> Result<Self, ConnectorError> {
        let invalid = || ConnectorError::InvalidUri(text.into());
        let (scheme, rest) = text.split_once("://").ok_or_else(invalid)?;
        let scheme = match scheme.to_ascii_uppercase().as_str() {
            "BIN" | "PSK" => Scheme::Binary,
            "JSON" => Scheme::Json,
            _ => return Err(invalid()),
        };
        let (location, id) = match rest.split_once('#') {
            Some((location, id)) if !id.is_empty() => (location, Some(id.to_string())),
            Some((location, _)) => (location, None),
            None => (rest, None),
        };
        let (host, port) = split_host_port(location).ok_or_else(invalid)?;
        if host.is_empty() {
            return Err(invalid());
        }
        Ok(Self {
            scheme,
            host: host.to_string(),
            port: port.unwrap_or_else(|| scheme.default_port()),
            id,
        })
    }

    /// `host:port` suitable for `TcpStream::connect`.
    #[must_use]
    pub fn address(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    #[must_use]
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }
}

fn split_host_port(location: &str) -> Option<(&str, Option<u16>)> {
    if let Some(rest) = location.strip_prefix('[') {
        let (host, tail) = rest.split_once(']')?;
        return match tail.strip_prefix(':') {
            Some(port) => Some((host, Some(port.parse().ok()?))),
            None if tail.is_empty() => Some((host, None)),
            None => None,
        };
    }
    match location.rsplit_once(':') {
        Some((host, port)) => Some((host, Some(port.parse().ok()?))),
        None => Some((location, None)),
    }
}

impl fmt::Display for ServiceUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.scheme.name(), self.address())?;
        if let Some(id) = &self.id {
            write!(f, "#{id}")?;
        }
        Ok(())
    }
}
