use std::fmt;
use std::time::Duration;

use url::{Host, Url};

use crate::error::ConfigError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    Http,
    Https,
}

impl Scheme {
    pub fn default_port(self) -> u16 {
        match self {
            Scheme::Http => 80,
            Scheme::Https => 443,
        }
    }
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scheme::Http => f.write_str("http"),
            Scheme::Https => f.write_str("https"),
        }
    }
}

/// Where the readiness prober knocks. Derived once from the configured target URL.
///
/// Invariants: `host` is non-empty and `port` is in `1..=65535`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeTarget {
    pub host: String,
    pub port: u16,
    pub scheme: Scheme,
    /// Upper bound for a single check.
    pub timeout: Duration,
    url: Url,
}

impl ProbeTarget {
    /// Parse a target URL such as `http://app:8000/login`.
    ///
    /// - only `http` and `https` are accepted
    /// - a missing port falls back to the scheme default (80/443)
    /// - port 0 and empty hosts are rejected
    pub fn from_url(raw: &str, timeout: Duration) -> Result<Self, ConfigError> {
        let url = Url::parse(raw.trim()).map_err(|e| ConfigError::InvalidUrl {
            url: raw.to_string(),
            reason: e.to_string(),
        })?;

        let scheme = match url.scheme() {
            "http" => Scheme::Http,
            "https" => Scheme::Https,
            other => return Err(ConfigError::UnsupportedScheme(other.to_string())),
        };

        let host = match url.host() {
            Some(Host::Domain(d)) if !d.is_empty() => d.to_string(),
            Some(Host::Ipv4(ip)) => ip.to_string(),
            Some(Host::Ipv6(ip)) => ip.to_string(),
            _ => return Err(ConfigError::MissingHost(raw.to_string())),
        };

        let port = url.port().unwrap_or_else(|| scheme.default_port());
        if port == 0 {
            return Err(ConfigError::PortOutOfRange(0));
        }

        Ok(Self {
            host,
            port,
            scheme,
            timeout,
            url,
        })
    }

    /// `host:port`, with IPv6 literals bracketed.
    pub fn endpoint(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    /// Value for the HTTP `Host` header.
    pub fn host_header(&self) -> String {
        if self.port == self.scheme.default_port() {
            self.url.host_str().unwrap_or(&self.host).to_string()
        } else {
            format!("{}:{}", self.url.host_str().unwrap_or(&self.host), self.port)
        }
    }

    /// Root of the target, which is what the HTTP check requests.
    pub fn root_url(&self) -> String {
        format!("{}://{}/", self.scheme, self.host_header())
    }
}

impl fmt::Display for ProbeTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.scheme, self.endpoint())
    }
}
