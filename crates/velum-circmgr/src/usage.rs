//! Code related to tracking what activities a circuit can be used for.

use serde::{Deserialize, Serialize};
use std::fmt::{self, Display};
use std::net::Ipv4Addr;

/// A port that we want to connect to as a client.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Hash, PartialOrd, Ord, Serialize)]
pub struct TargetPort(u16);

impl TargetPort {
    /// Create a request to make sure that a circuit supports a given
    /// exit port.
    pub fn new(port: u16) -> TargetPort {
        TargetPort(port)
    }

    /// Return the port number of this target.
    pub fn port(&self) -> u16 {
        self.0
    }
}

impl Display for TargetPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Set of requested target ports, mostly for use in error reporting.
///
/// Displays nicely.
#[derive(Debug, Clone, Default)]
pub struct TargetPorts(Vec<TargetPort>);

impl From<&'_ [TargetPort]> for TargetPorts {
    fn from(ports: &'_ [TargetPort]) -> Self {
        TargetPorts(ports.into())
    }
}

impl Display for TargetPorts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let brackets = self.0.len() != 1;
        if brackets {
            write!(f, "[")?;
        }
        for (i, port) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, "{}", port)?;
        }
        if brackets {
            write!(f, "]")?;
        }
        Ok(())
    }
}

/// The destination of a pending exit request: either a hostname to be
/// resolved by the exit, or a literal IPv4 address, plus a port.
///
/// This is also the unit of the per-circuit failed-exit memo: a circuit
/// that failed a target once is not retried for the same target.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct ExitTarget {
    /// The address part of the target.
    addr: TargetAddr,
    /// The port to connect to.
    port: u16,
}

/// The address half of an [`ExitTarget`].
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub(crate) enum TargetAddr {
    /// A hostname, to be resolved by the exit relay.
    Hostname(String),
    /// A literal IPv4 address.
    Ip(Ipv4Addr),
}

impl ExitTarget {
    /// Construct a target from a hostname and port.
    ///
    /// Hostnames are compared case-insensitively, so we lowercase here.
    pub fn from_hostname(hostname: &str, port: u16) -> Self {
        ExitTarget {
            addr: TargetAddr::Hostname(hostname.to_ascii_lowercase()),
            port,
        }
    }

    /// Construct a target from a literal IPv4 address and port.
    pub fn from_address(addr: Ipv4Addr, port: u16) -> Self {
        ExitTarget {
            addr: TargetAddr::Ip(addr),
            port,
        }
    }

    /// Return the port of this target.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Return the literal address of this target, if it has one.
    pub fn address(&self) -> Option<Ipv4Addr> {
        match self.addr {
            TargetAddr::Ip(a) => Some(a),
            TargetAddr::Hostname(_) => None,
        }
    }

    /// Return the string form of this target's address, suitable for a
    /// BEGIN message.
    pub fn addr_string(&self) -> String {
        match &self.addr {
            TargetAddr::Hostname(h) => h.clone(),
            TargetAddr::Ip(a) => a.to_string(),
        }
    }
}

impl Display for ExitTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.addr_string(), self.port)
    }
}

/// A single rule in an exit policy: accept or reject a network/port
/// range.
#[derive(Clone, Debug, Eq, PartialEq)]
struct PolicyRule {
    /// True if this rule accepts the matched targets.
    accept: bool,
    /// The network address this rule matches, if any.  `None` matches
    /// every address.
    network: Option<(Ipv4Addr, u8)>,
    /// The low end of the matched port range.
    port_low: u16,
    /// The high end (inclusive) of the matched port range.
    port_high: u16,
}

impl PolicyRule {
    /// Return true if this rule matches the given address and port.
    fn matches(&self, addr: Option<Ipv4Addr>, port: u16) -> bool {
        if !(self.port_low..=self.port_high).contains(&port) {
            return false;
        }
        match (self.network, addr) {
            (None, _) => true,
            (Some(_), None) => false,
            (Some((net, bits)), Some(addr)) => {
                let mask = if bits == 0 {
                    0
                } else {
                    u32::MAX << (32 - u32::from(bits))
                };
                (u32::from(net) & mask) == (u32::from(addr) & mask)
            }
        }
    }
}

/// An exit policy, as supported by the last hop of a circuit.
///
/// A policy is an ordered list of accept/reject rules; the first rule
/// that matches a target decides it.  A target that matches no rule is
/// rejected.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ExitPolicy {
    /// The rules in this policy, in order of precedence.
    rules: Vec<PolicyRule>,
}

impl ExitPolicy {
    /// Return a policy that accepts every target.
    pub fn accept_all() -> Self {
        ExitPolicy {
            rules: vec![PolicyRule {
                accept: true,
                network: None,
                port_low: 1,
                port_high: 65535,
            }],
        }
    }

    /// Return a policy that rejects every target.
    pub fn reject_all() -> Self {
        ExitPolicy::default()
    }

    /// Return a policy that accepts exactly the given ports, for every
    /// address.
    pub fn accept_ports(ports: &[u16]) -> Self {
        let rules = ports
            .iter()
            .map(|p| PolicyRule {
                accept: true,
                network: None,
                port_low: *p,
                port_high: *p,
            })
            .collect();
        ExitPolicy { rules }
    }

    /// Add an accept rule for a network prefix and port range.
    pub fn push_accept(&mut self, network: Option<(Ipv4Addr, u8)>, low: u16, high: u16) {
        self.rules.push(PolicyRule {
            accept: true,
            network,
            port_low: low,
            port_high: high,
        });
    }

    /// Add a reject rule for a network prefix and port range.
    pub fn push_reject(&mut self, network: Option<(Ipv4Addr, u8)>, low: u16, high: u16) {
        self.rules.push(PolicyRule {
            accept: false,
            network,
            port_low: low,
            port_high: high,
        });
    }

    /// Return true if this policy admits connecting to `addr` (when
    /// known) on `port`.
    ///
    /// When the address is unknown (a hostname target), a rule
    /// restricted to a particular network neither accepts nor rejects;
    /// the decision falls through to the next rule.
    pub fn allows_target(&self, addr: Option<Ipv4Addr>, port: u16) -> bool {
        for rule in &self.rules {
            if rule.network.is_some() && addr.is_none() {
                continue;
            }
            if rule.matches(addr, port) {
                return rule.accept;
            }
        }
        false
    }

    /// Return true if a given port is admitted for at least some
    /// address.
    pub fn allows_port(&self, port: u16) -> bool {
        self.allows_target(None, port)
            || self
                .rules
                .iter()
                .any(|r| r.accept && (r.port_low..=r.port_high).contains(&port))
    }

    /// Returns true if this policy allows any port at all.
    pub fn allows_some_port(&self) -> bool {
        self.rules.iter().any(|r| r.accept)
    }
}
