//! Resolution targets.
//!
//! A target names exactly one Kubernetes `Endpoints` resource, plus an optional
//! port selector. The textual form is
//! `<service>.<namespace>[.<suffix>][:<port-or-port-name>]`, e.g.
//! `greeter.default.svc.cluster.local:grpc` or `greeter.default:50051`.

use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};

/// Port selector for a target.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Port {
    /// A numeric port number.
    Number(u16),
    /// A named port (matched against the `name` of the endpoint ports).
    Name(String),
}

impl Port {
    /// Returns `true` if an endpoint port with the given number and name is selected.
    #[must_use]
    pub fn matches(&self, number: i32, name: Option<&str>) -> bool {
        match self {
            Self::Number(n) => i32::from(*n) == number,
            Self::Name(wanted) => name == Some(wanted.as_str()),
        }
    }
}

impl From<u16> for Port {
    fn from(port: u16) -> Self {
        Self::Number(port)
    }
}

impl From<&str> for Port {
    fn from(name: &str) -> Self {
        Self::Name(name.to_string())
    }
}

impl From<String> for Port {
    fn from(name: String) -> Self {
        Self::Name(name)
    }
}

impl fmt::Display for Port {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{n}"),
            Self::Name(name) => f.write_str(name),
        }
    }
}

/// Identity of the service to resolve.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Target {
    service: String,
    namespace: String,
    port: Option<Port>,
}

impl Target {
    /// Creates a target that selects every port of the service.
    #[must_use]
    pub fn new(service: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            namespace: namespace.into(),
            port: None,
        }
    }

    /// Restricts the target to a single port, by number (`50051`) or name (`"grpc"`).
    #[must_use]
    pub fn port(mut self, port: impl Into<Port>) -> Self {
        self.port = Some(port.into());
        self
    }

    /// The service (and `Endpoints` resource) name.
    #[must_use]
    pub fn service(&self) -> &str {
        &self.service
    }

    /// The namespace of the service.
    #[must_use]
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// The port selector, if any.
    #[must_use]
    pub fn port_selector(&self) -> Option<&Port> {
        self.port.as_ref()
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.service, self.namespace)?;
        if let Some(port) = &self.port {
            write!(f, ":{port}")?;
        }

        Ok(())
    }
}

impl FromStr for Target {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = |reason| Error::InvalidTarget {
            target: s.to_string(),
            reason,
        };

        let (host, port) = match s.split_once(':') {
            Some((host, port)) => (host, Some(port)),
            None => (s, None),
        };

        let mut labels = host.split('.');
        let service = labels.next().unwrap_or_default();
        if service.is_empty() {
            return Err(invalid("missing service name"));
        }

        let namespace = labels.next().unwrap_or_default();
        if namespace.is_empty() {
            return Err(invalid("missing namespace"));
        }

        // The cluster suffix is accepted but carries no information.
        if labels.any(str::is_empty) {
            return Err(invalid("empty domain label"));
        }

        let port = match port {
            None => None,
            Some("") => return Err(invalid("empty port")),
            Some(p) if p.bytes().all(|b| b.is_ascii_digit()) => Some(Port::Number(
                p.parse().map_err(|_| invalid("port out of range"))?,
            )),
            Some(p) if p.contains(':') => return Err(invalid("unexpected ':' in port")),
            Some(name) => Some(Port::Name(name.to_string())),
        };

        Ok(Self {
            service: service.to_string(),
            namespace: namespace.to_string(),
            port,
        })
    }
}
