//! The circuit manager's view of the relay directory.
//!
//! The real directory subsystem (consensus fetching, descriptor
//! parsing, freshness) lives elsewhere; this module defines the narrow
//! interface the circuit manager needs from it: list the usable relays,
//! with their exit policies and family relations.

use crate::usage::ExitPolicy;
use velum_cell::relaycell::msg::EncodedLinkSpec;

/// The length of a relay identity fingerprint.
pub const RELAY_ID_LEN: usize = 20;

/// The link specifier type for a legacy relay identity.
const LSTYPE_RSA_ID: u8 = 2;

/// A relay as seen in the directory: enough information to pick it for
/// a path, connect to it, and evaluate its exit policy.
#[derive(Clone, Debug)]
pub struct Relay {
    /// The relay's nickname, for logs.
    nickname: String,
    /// The relay's identity fingerprint.
    identity: [u8; RELAY_ID_LEN],
    /// The address of the relay's OR port, as "host:port".
    or_addr: String,
    /// The relay's directory port, or 0 if it is not a directory cache.
    dir_port: u16,
    /// The relay's exit policy.
    policy: ExitPolicy,
    /// Nicknames of the relays this relay declares as family.
    family: Vec<String>,
}

impl Relay {
    /// Construct a new relay record.
    pub fn new(
        nickname: &str,
        identity: [u8; RELAY_ID_LEN],
        or_addr: &str,
        dir_port: u16,
        policy: ExitPolicy,
    ) -> Self {
        Relay {
            nickname: nickname.to_string(),
            identity,
            or_addr: or_addr.to_string(),
            dir_port,
            policy,
            family: Vec::new(),
        }
    }

    /// Declare this relay's family members, by nickname.
    pub fn set_family<I: IntoIterator<Item = String>>(&mut self, family: I) {
        self.family = family.into_iter().collect();
    }

    /// Return this relay's nickname.
    pub fn nickname(&self) -> &str {
        &self.nickname
    }

    /// Return this relay's identity fingerprint.
    pub fn identity(&self) -> &[u8; RELAY_ID_LEN] {
        &self.identity
    }

    /// Return the address of this relay's OR port.
    pub fn or_addr(&self) -> &str {
        &self.or_addr
    }

    /// Return true if this relay is a directory cache.
    pub fn is_dir_cache(&self) -> bool {
        self.dir_port != 0
    }

    /// Return this relay's exit policy.
    pub fn policy(&self) -> &ExitPolicy {
        &self.policy
    }

    /// Return true if `other` is this same relay, by identity.
    pub fn same_relay_as(&self, other: &Relay) -> bool {
        self.identity == other.identity
    }

    /// Return true if this relay shares a declared family with `other`.
    ///
    /// Family declarations keep us from putting two relays run by the
    /// same operator on one circuit.
    pub fn in_same_family_as(&self, other: &Relay) -> bool {
        self.family.iter().any(|f| f == &other.nickname)
            || other.family.iter().any(|f| f == &self.nickname)
    }

    /// Return the link specifiers to use when asking another relay to
    /// extend a circuit to this one.
    pub fn linkspecs(&self) -> Vec<EncodedLinkSpec> {
        vec![EncodedLinkSpec::new(LSTYPE_RSA_ID, &self.identity[..])]
    }
}

/// A source of directory information: the set of relays that are
/// usable for building circuits right now.
pub trait Directory: Send + Sync {
    /// Return all the relays we are currently willing to use.
    fn usable_relays(&self) -> Vec<Relay>;
}
