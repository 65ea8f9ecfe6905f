use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// One entry of `forwardPorts`: a bare container port or a `host:port` service address.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "RawForwardPort", into = "RawForwardPort")]
pub enum ForwardPort {
    Local(u16),
    Service { host: String, port: u16 },
}

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum RawForwardPort {
    Number(u64),
    Text(String),
}

impl TryFrom<RawForwardPort> for ForwardPort {
    type Error = String;

    fn try_from(raw: RawForwardPort) -> Result<Self, Self::Error> {
        match raw {
            RawForwardPort::Number(n) => u16::try_from(n)
                .map(ForwardPort::Local)
                .map_err(|_| format!("port {} is out of range", n)),
            RawForwardPort::Text(text) => {
                let (host, port) = text
                    .rsplit_once(':')
                    .ok_or_else(|| format!("forwarded port '{}' must be a number or host:port", text))?;
                let port = port
                    .parse::<u16>()
                    .map_err(|_| format!("invalid port in '{}'", text))?;
                Ok(ForwardPort::Service {
                    host: host.to_string(),
                    port,
                })
            }
        }
    }
}

impl From<ForwardPort> for RawForwardPort {
    fn from(port: ForwardPort) -> Self {
        match port {
            ForwardPort::Local(p) => RawForwardPort::Number(u64::from(p)),
            service => RawForwardPort::Text(service.to_string()),
        }
    }
}

impl ForwardPort {
    pub fn port(&self) -> u16 {
        match self {
            ForwardPort::Local(port) => *port,
            ForwardPort::Service { port, .. } => *port,
        }
    }

    pub fn host(&self) -> Option<&str> {
        match self {
            ForwardPort::Local(_) => None,
            ForwardPort::Service { host, .. } => Some(host),
        }
    }
}

impl fmt::Display for ForwardPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ForwardPort::Local(port) => write!(f, "{}", port),
            ForwardPort::Service { host, port } => write!(f, "{}:{}", host, port),
        }
    }
}

/// A parsed `portsAttributes` key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PortKey {
    Port(u16),
    Service { host: String, port: u16 },
    /// Inclusive on both ends.
    Range(u16, u16),
}

impl FromStr for PortKey {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        // Host names may contain '-', so service keys are recognized before ranges.
        if let Some((host, port)) = s.rsplit_once(':') {
            let port = port
                .parse::<u16>()
                .map_err(|_| format!("invalid port in '{}'", s))?;
            return Ok(PortKey::Service {
                host: host.to_string(),
                port,
            });
        }

        if let Some((low, high)) = s.split_once('-') {
            let (low, high) = match (low.parse::<u16>(), high.parse::<u16>()) {
                (Ok(low), Ok(high)) => (low, high),
                _ => return Err(format!("invalid port range '{}'", s)),
            };
            if low > high {
                return Err(format!("port range '{}' is reversed", s));
            }
            return Ok(PortKey::Range(low, high));
        }

        s.parse::<u16>()
            .map(PortKey::Port)
            .map_err(|_| format!("unrecognized port key '{}'", s))
    }
}

impl PortKey {
    pub fn matches(&self, forward: &ForwardPort) -> bool {
        match (self, forward) {
            (PortKey::Port(key), ForwardPort::Local(port)) => key == port,
            (
                PortKey::Service { host, port },
                ForwardPort::Service {
                    host: fhost,
                    port: fport,
                },
            ) => host == fhost && port == fport,
            (PortKey::Range(low, high), forward) => (*low..=*high).contains(&forward.port()),
            _ => false,
        }
    }

    /// Exact keys beat ranges; narrower ranges beat wider ones.
    pub fn specificity(&self) -> u32 {
        match self {
            PortKey::Port(_) | PortKey::Service { .. } => u32::MAX,
            PortKey::Range(low, high) => u32::from(u16::MAX - (high - low)),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum OnAutoForward {
    #[default]
    Notify,
    OpenBrowser,
    OpenBrowserOnce,
    OpenPreview,
    Silent,
    Ignore,
}

impl fmt::Display for OnAutoForward {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OnAutoForward::Notify => "notify",
            OnAutoForward::OpenBrowser => "openBrowser",
            OnAutoForward::OpenBrowserOnce => "openBrowserOnce",
            OnAutoForward::OpenPreview => "openPreview",
            OnAutoForward::Silent => "silent",
            OnAutoForward::Ignore => "ignore",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PortProtocol {
    Http,
    Https,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortAttributes {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub on_auto_forward: Option<OnAutoForward>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub protocol: Option<PortProtocol>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub require_local_port: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub elevate_if_needed: Option<bool>,

    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}
