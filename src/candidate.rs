//! STUN/TURN server URI parsing and candidate classification.
//!
//! Parses the `scheme:host[:port][?transport=...]` grammar of RFC 7064 and
//! RFC 7065 into a [`CandidateDescriptor`], and decides which test policy a
//! descriptor gets (relay-only vs. unrestricted gathering, throughput or
//! connectivity-only) and which discovered candidate types are timed.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

const DEFAULT_PORT: u16 = 3478;
const DEFAULT_TLS_PORT: u16 = 5349;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("missing scheme in server URI '{0}'")]
    MissingScheme(String),

    #[error("unknown scheme '{0}' (expected stun, stuns, turn or turns)")]
    UnknownScheme(String),

    #[error("missing host in server URI '{0}'")]
    MissingHost(String),

    #[error("invalid host '{0}'")]
    InvalidHost(String),

    #[error("invalid port '{0}'")]
    InvalidPort(String),

    #[error("unknown transport '{0}' (expected udp or tcp)")]
    UnknownTransport(String),

    #[error("unsupported query '{0}' (only transport= is allowed)")]
    UnsupportedQuery(String),
}

// ---------------------------------------------------------------------------
// Scheme / Protocol
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scheme {
    Stun,
    Stuns,
    Turn,
    Turns,
}

impl Scheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scheme::Stun => "stun",
            Scheme::Stuns => "stuns",
            Scheme::Turn => "turn",
            Scheme::Turns => "turns",
        }
    }

    /// TURN and TURNS allocate a relay; STUN/STUNS only reflect.
    pub fn is_relay(&self) -> bool {
        matches!(self, Scheme::Turn | Scheme::Turns)
    }

    pub fn is_secure(&self) -> bool {
        matches!(self, Scheme::Stuns | Scheme::Turns)
    }

    /// Protocol implied when the URI carries no `transport=` parameter.
    pub fn default_protocol(&self) -> Protocol {
        if self.is_secure() {
            Protocol::Tls
        } else {
            Protocol::Udp
        }
    }
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Scheme {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "stun" => Ok(Scheme::Stun),
            "stuns" => Ok(Scheme::Stuns),
            "turn" => Ok(Scheme::Turn),
            "turns" => Ok(Scheme::Turns),
            other => Err(ParseError::UnknownScheme(other.to_string())),
        }
    }
}

/// Transport used to reach the server.
///
/// `Tls` is TLS over TCP (`turns:`/`stuns:` default); `Dtls` is the
/// `turns:...?transport=udp` form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Udp,
    Tcp,
    Tls,
    Dtls,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Udp => "udp",
            Protocol::Tcp => "tcp",
            Protocol::Tls => "tls",
            Protocol::Dtls => "dtls",
        }
    }

    /// Value of the `transport=` query parameter for this protocol.
    fn transport_param(&self) -> &'static str {
        match self {
            Protocol::Udp | Protocol::Dtls => "udp",
            Protocol::Tcp | Protocol::Tls => "tcp",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Policy
// ---------------------------------------------------------------------------

/// ICE transport policy handed to the offerer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportPolicy {
    All,
    Relay,
}

/// Type of a locally gathered ICE candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CandidateType {
    Host,
    Srflx,
    Prflx,
    Relay,
}

impl CandidateType {
    /// Only server-reflexive and relay candidates prove the server answered,
    /// so only they feed the time-to-candidate metric.
    pub fn is_timed(&self) -> bool {
        matches!(self, CandidateType::Srflx | CandidateType::Relay)
    }
}

impl fmt::Display for CandidateType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CandidateType::Host => "host",
            CandidateType::Srflx => "srflx",
            CandidateType::Prflx => "prflx",
            CandidateType::Relay => "relay",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// CandidateDescriptor
// ---------------------------------------------------------------------------

/// One STUN/TURN server under test, parsed from its URI.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidateDescriptor {
    pub scheme: Scheme,
    pub protocol: Protocol,
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub credential: Option<String>,
}

impl CandidateDescriptor {
    /// Parse a server URI such as `turn:host:3478?transport=udp`.
    pub fn parse(uri: &str) -> Result<Self, ParseError> {
        let uri = uri.trim();
        let (scheme_str, rest) = uri
            .split_once(':')
            .ok_or_else(|| ParseError::MissingScheme(uri.to_string()))?;
        if scheme_str.is_empty() {
            return Err(ParseError::MissingScheme(uri.to_string()));
        }
        let scheme: Scheme = scheme_str.parse()?;

        let (authority, query) = match rest.split_once('?') {
            Some((a, q)) => (a, Some(q)),
            None => (rest, None),
        };

        let (host, port_str) = split_host_port(authority, uri)?;
        validate_host(host, authority.starts_with('['))?;

        let port = match port_str {
            Some(p) => match p.parse::<u16>() {
                Ok(0) | Err(_) => return Err(ParseError::InvalidPort(p.to_string())),
                Ok(port) => port,
            },
            None if scheme.is_secure() => DEFAULT_TLS_PORT,
            None => DEFAULT_PORT,
        };

        let transport = match query {
            Some(q) => Some(parse_transport_query(q)?),
            None => None,
        };

        let protocol = match (scheme.is_secure(), transport) {
            (false, None) => scheme.default_protocol(),
            (false, Some(t)) => t,
            (true, None) | (true, Some(Protocol::Tcp)) => Protocol::Tls,
            (true, Some(_)) => Protocol::Dtls,
        };

        Ok(Self {
            scheme,
            protocol,
            host: host.to_string(),
            port,
            username: None,
            credential: None,
        })
    }

    /// Attach long-term credentials, ignoring empty strings.
    pub fn with_credentials(mut self, username: Option<String>, credential: Option<String>) -> Self {
        self.username = username.filter(|u| !u.is_empty());
        self.credential = credential.filter(|c| !c.is_empty());
        self
    }

    /// Canonical URI for the engine's ICE server list.
    pub fn uri(&self) -> String {
        let host = if self.host.contains(':') {
            format!("[{}]", self.host)
        } else {
            self.host.clone()
        };
        match self.scheme {
            Scheme::Stun | Scheme::Stuns if self.protocol == self.scheme.default_protocol() => {
                format!("{}:{}:{}", self.scheme, host, self.port)
            }
            _ => format!(
                "{}:{}:{}?transport={}",
                self.scheme,
                host,
                self.port,
                self.protocol.transport_param()
            ),
        }
    }

    /// Relay-only for TURN/TURNS so the offerer is forced through the
    /// server under test; unrestricted for STUN/STUNS.
    pub fn transport_policy(&self) -> TransportPolicy {
        if self.scheme.is_relay() {
            TransportPolicy::Relay
        } else {
            TransportPolicy::All
        }
    }

    /// Whether the throughput driver may run against this candidate.
    pub fn supports_throughput(&self) -> bool {
        self.scheme.is_relay()
    }
}

impl FromStr for CandidateDescriptor {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for CandidateDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}:{}", self.scheme, self.protocol, self.port)
    }
}

fn split_host_port<'a>(authority: &'a str, uri: &str) -> Result<(&'a str, Option<&'a str>), ParseError> {
    if authority.is_empty() {
        return Err(ParseError::MissingHost(uri.to_string()));
    }

    // [v6-literal]:port
    if let Some(stripped) = authority.strip_prefix('[') {
        let (host, after) = stripped
            .split_once(']')
            .ok_or_else(|| ParseError::InvalidHost(authority.to_string()))?;
        if host.is_empty() {
            return Err(ParseError::MissingHost(uri.to_string()));
        }
        return match after {
            "" => Ok((host, None)),
            a => match a.strip_prefix(':') {
                Some(port) => Ok((host, Some(port))),
                None => Err(ParseError::InvalidHost(authority.to_string())),
            },
        };
    }

    // Unbracketed hosts never contain ':'; IPv6 literals need brackets.
    match authority.split_once(':') {
        Some((host, _)) if host.is_empty() => Err(ParseError::MissingHost(uri.to_string())),
        Some((_, port)) if port.contains(':') => Err(ParseError::InvalidHost(authority.to_string())),
        Some((host, port)) => Ok((host, Some(port))),
        None => Ok((authority, None)),
    }
}

fn validate_host(host: &str, bracketed: bool) -> Result<(), ParseError> {
    let valid = host.chars().all(|c| {
        c.is_ascii_alphanumeric() || c == '.' || c == '-' || c == '_' || (bracketed && c == ':')
    });
    if !valid || host.starts_with('-') || host.starts_with('.') {
        return Err(ParseError::InvalidHost(host.to_string()));
    }
    Ok(())
}

fn parse_transport_query(query: &str) -> Result<Protocol, ParseError> {
    let (key, value) = query
        .split_once('=')
        .ok_or_else(|| ParseError::UnsupportedQuery(query.to_string()))?;
    if !key.eq_ignore_ascii_case("transport") {
        return Err(ParseError::UnsupportedQuery(query.to_string()));
    }
    match value.to_ascii_lowercase().as_str() {
        "udp" => Ok(Protocol::Udp),
        "tcp" => Ok(Protocol::Tcp),
        other => Err(ParseError::UnknownTransport(other.to_string())),
    }
}
