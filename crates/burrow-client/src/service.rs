//! Local service descriptors, keyed by session id.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Mutex;

use thiserror::Error;

/// Protocol the tunneled local service speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Http,
    Https,
    Tcp,
    Tcps,
}

impl Protocol {
    /// Whether the local hop needs a client TLS wrap.
    pub fn is_tls(self) -> bool {
        matches!(self, Protocol::Https | Protocol::Tcps)
    }

    /// Whether the splice should feed the HTTP sniffer.
    pub fn is_http(self) -> bool {
        matches!(self, Protocol::Http | Protocol::Https)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Protocol::Http => "http",
            Protocol::Https => "https",
            Protocol::Tcp => "tcp",
            Protocol::Tcps => "tcps",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Error)]
#[error("invalid protocol {0:?}: expected http, https, tcp or tcps")]
pub struct InvalidProtocol(String);

impl FromStr for Protocol {
    type Err = InvalidProtocol;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "http" => Ok(Protocol::Http),
            "https" => Ok(Protocol::Https),
            "tcp" => Ok(Protocol::Tcp),
            "tcps" => Ok(Protocol::Tcps),
            other => Err(InvalidProtocol(other.to_string())),
        }
    }
}

/// One tunneled local service.
#[derive(Debug, Clone, Copy)]
pub struct Service {
    pub protocol: Protocol,
    pub local_port: u16,
}

/// In-process map from session id to its service descriptor. A worker
/// looks its session up here before dialing the local side.
#[derive(Debug, Default)]
pub struct ServiceMap {
    inner: Mutex<HashMap<String, Service>>,
}

impl ServiceMap {
    pub fn insert(&self, session_id: impl Into<String>, service: Service) {
        self.inner
            .lock()
            .expect("service map lock poisoned")
            .insert(session_id.into(), service);
    }

    pub fn get(&self, session_id: &str) -> Option<Service> {
        self.inner
            .lock()
            .expect("service map lock poisoned")
            .get(session_id)
            .copied()
    }

    pub fn remove(&self, session_id: &str) {
        self.inner
            .lock()
            .expect("service map lock poisoned")
            .remove(session_id);
    }
}
