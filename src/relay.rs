//! Relay descriptors and exit policies
//!
//! Defines relay metadata as published by the directory, the consensus
//! flag set, family relations, and the exit-policy predicate used to
//! decide whether a relay admits a given target.

use std::fmt;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::str::FromStr;

use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD};
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use x25519_dalek::PublicKey;

use crate::error::{Result, TorError};

/// A Tor relay from the consensus
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Relay {
    /// Relay nickname
    pub nickname: String,

    /// Fingerprint (hex-encoded identity key hash)
    pub fingerprint: String,

    /// IPv4 address
    pub address: Ipv4Addr,

    /// OR (Onion Router) port
    pub or_port: u16,

    /// Directory port (optional)
    pub dir_port: Option<u16>,

    /// Relay flags
    pub flags: RelayFlags,

    /// Bandwidth (bytes/sec)
    pub bandwidth: u64,

    /// ntor onion key (base64)
    pub ntor_onion_key: Option<String>,

    /// Declared family members, as fingerprints without the `$` prefix
    #[serde(default)]
    pub family: Vec<String>,

    /// Exit policy
    #[serde(default)]
    pub exit_policy: ExitPolicy,
}

impl Relay {
    /// Get the SocketAddr for connecting to this relay
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(self.address, self.or_port))
    }

    /// Decode the identity fingerprint to its 20 raw bytes
    pub fn identity(&self) -> Result<[u8; 20]> {
        let bytes = hex::decode(&self.fingerprint)
            .map_err(|e| TorError::InvalidTarget(format!("Bad fingerprint: {}", e)))?;
        if bytes.len() != 20 {
            return Err(TorError::InvalidTarget(format!(
                "Fingerprint is {} bytes, expected 20",
                bytes.len()
            )));
        }
        let mut id = [0u8; 20];
        id.copy_from_slice(&bytes);
        Ok(id)
    }

    /// Decode the ntor onion key
    pub fn ntor_public_key(&self) -> Result<PublicKey> {
        let encoded = self
            .ntor_onion_key
            .as_deref()
            .ok_or_else(|| TorError::HandshakeFailed("Relay has no ntor key".into()))?;
        let bytes = STANDARD
            .decode(encoded)
            .or_else(|_| STANDARD_NO_PAD.decode(encoded.trim_end_matches('=')))
            .map_err(|e| TorError::HandshakeFailed(format!("Bad ntor key: {}", e)))?;
        if bytes.len() != 32 {
            return Err(TorError::HandshakeFailed(format!(
                "ntor key is {} bytes, expected 32",
                bytes.len()
            )));
        }
        let mut key = [0u8; 32];
        key.copy_from_slice(&bytes);
        Ok(PublicKey::from(key))
    }

    /// Check if this relay can be used as a guard
    pub fn is_guard(&self) -> bool {
        self.flags.guard && self.flags.stable && self.flags.fast
    }

    /// Check if this relay can be used as an exit
    pub fn is_exit(&self) -> bool {
        self.flags.exit && !self.flags.bad_exit
    }

    /// Check if this relay is suitable as a middle relay
    pub fn is_middle(&self) -> bool {
        self.flags.fast && self.flags.stable && self.flags.running
    }

    /// Whether this relay and `other` belong to the same declared family.
    ///
    /// A single declaration in either direction excludes the pair.
    pub fn in_same_family(&self, other: &Relay) -> bool {
        self.family
            .iter()
            .any(|fp| fp.eq_ignore_ascii_case(&other.fingerprint))
            || other
                .family
                .iter()
                .any(|fp| fp.eq_ignore_ascii_case(&self.fingerprint))
    }

    /// Whether this relay's exit policy admits the given target.
    pub fn accepts_exit_target(&self, target: &ExitTarget) -> bool {
        match &target.host {
            TargetHost::Ipv4(addr) => self.exit_policy.accepts_target(*addr, target.port),
            TargetHost::Hostname(_) => self.exit_policy.accepts_port(target.port),
        }
    }
}

/// Relay flags from consensus
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RelayFlags {
    /// Authority - directory authority
    pub authority: bool,

    /// BadExit - should not be used as exit
    pub bad_exit: bool,

    /// Exit - allows exit traffic
    pub exit: bool,

    /// Fast - fast relay
    pub fast: bool,

    /// Guard - suitable as entry guard
    pub guard: bool,

    /// Running - currently running
    pub running: bool,

    /// Stable - stable relay
    pub stable: bool,

    /// Valid - valid relay descriptor
    pub valid: bool,
}

impl RelayFlags {
    /// Parse flags from a consensus flag string
    pub fn from_string(flags: &str) -> Self {
        let mut relay_flags = RelayFlags::default();

        for flag in flags.split_whitespace() {
            match flag {
                "Authority" => relay_flags.authority = true,
                "BadExit" => relay_flags.bad_exit = true,
                "Exit" => relay_flags.exit = true,
                "Fast" => relay_flags.fast = true,
                "Guard" => relay_flags.guard = true,
                "Running" => relay_flags.running = true,
                "Stable" => relay_flags.stable = true,
                "Valid" => relay_flags.valid = true,
                _ => {} // Ignore unknown flags
            }
        }

        relay_flags
    }
}

/// The host half of an exit target
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TargetHost {
    /// A literal IPv4 address
    Ipv4(Ipv4Addr),
    /// A hostname to be resolved by the exit
    Hostname(String),
}

/// An exit target: host plus port
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ExitTarget {
    /// Target host
    pub host: TargetHost,
    /// Target port
    pub port: u16,
}

impl ExitTarget {
    /// Target a hostname
    pub fn to_host(hostname: impl Into<String>, port: u16) -> Self {
        Self {
            host: TargetHost::Hostname(hostname.into()),
            port,
        }
    }

    /// Target a literal IPv4 address
    pub fn to_addr(addr: Ipv4Addr, port: u16) -> Self {
        Self {
            host: TargetHost::Ipv4(addr),
            port,
        }
    }
}

impl fmt::Display for ExitTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.host {
            TargetHost::Ipv4(addr) => write!(f, "{}:{}", addr, self.port),
            TargetHost::Hostname(name) => write!(f, "{}:{}", name, self.port),
        }
    }
}

/// One exit-policy rule: accept or reject an address mask and port range
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyRule {
    /// Accept (true) or reject (false)
    pub accept: bool,
    /// Address the rule applies to; `None` matches every address
    pub addr: Option<Ipv4Addr>,
    /// Prefix length of the address mask
    pub prefix: u8,
    /// Lowest matched port
    pub port_low: u16,
    /// Highest matched port
    pub port_high: u16,
}

impl PolicyRule {
    fn matches_addr(&self, addr: Ipv4Addr) -> bool {
        match self.addr {
            None => true,
            Some(net) => {
                if self.prefix == 0 {
                    true
                } else {
                    let shift = 32 - u32::from(self.prefix.min(32));
                    (u32::from(addr) ^ u32::from(net)) >> shift == 0
                }
            }
        }
    }

    fn matches_port(&self, port: u16) -> bool {
        port >= self.port_low && port <= self.port_high
    }
}

impl FromStr for PolicyRule {
    type Err = TorError;

    /// Parse a rule like `accept *:80`, `reject 18.0.0.0/8:*` or
    /// `accept *:6660-6669`.
    fn from_str(s: &str) -> Result<Self> {
        let mut parts = s.split_whitespace();
        let keyword = parts
            .next()
            .ok_or_else(|| TorError::InvalidTarget("Empty policy rule".into()))?;
        let accept = match keyword {
            "accept" => true,
            "reject" => false,
            other => {
                return Err(TorError::InvalidTarget(format!(
                    "Bad policy keyword: {}",
                    other
                )))
            }
        };
        let pattern = parts
            .next()
            .ok_or_else(|| TorError::InvalidTarget("Policy rule has no pattern".into()))?;

        let (addr_part, port_part) = pattern
            .rsplit_once(':')
            .ok_or_else(|| TorError::InvalidTarget(format!("Bad policy pattern: {}", pattern)))?;

        let (addr, prefix) = if addr_part == "*" {
            (None, 0)
        } else if let Some((base, plen)) = addr_part.split_once('/') {
            let addr: Ipv4Addr = base
                .parse()
                .map_err(|_| TorError::InvalidTarget(format!("Bad address: {}", base)))?;
            let plen: u8 = plen
                .parse()
                .map_err(|_| TorError::InvalidTarget(format!("Bad prefix: {}", plen)))?;
            if plen > 32 {
                return Err(TorError::InvalidTarget(format!("Bad prefix: {}", plen)));
            }
            (Some(addr), plen)
        } else {
            let addr: Ipv4Addr = addr_part
                .parse()
                .map_err(|_| TorError::InvalidTarget(format!("Bad address: {}", addr_part)))?;
            (Some(addr), 32)
        };

        let (port_low, port_high) = if port_part == "*" {
            (1, u16::MAX)
        } else if let Some((low, high)) = port_part.split_once('-') {
            let low: u16 = low
                .parse()
                .map_err(|_| TorError::InvalidTarget(format!("Bad port: {}", low)))?;
            let high: u16 = high
                .parse()
                .map_err(|_| TorError::InvalidTarget(format!("Bad port: {}", high)))?;
            (low, high)
        } else {
            let port: u16 = port_part
                .parse()
                .map_err(|_| TorError::InvalidTarget(format!("Bad port: {}", port_part)))?;
            (port, port)
        };

        Ok(PolicyRule {
            accept,
            addr,
            prefix,
            port_low,
            port_high,
        })
    }
}

/// An exit policy: ordered rules, first match wins, default reject
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExitPolicy {
    rules: Vec<PolicyRule>,
}

impl ExitPolicy {
    /// Parse a policy from rule lines
    pub fn parse(lines: &[&str]) -> Result<Self> {
        let rules = lines
            .iter()
            .map(|line| line.parse())
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { rules })
    }

    /// A policy admitting every target
    pub fn accept_all() -> Self {
        Self {
            rules: vec![PolicyRule {
                accept: true,
                addr: None,
                prefix: 0,
                port_low: 1,
                port_high: u16::MAX,
            }],
        }
    }

    /// A policy rejecting every target
    pub fn reject_all() -> Self {
        Self { rules: Vec::new() }
    }

    /// Whether the policy admits `(addr, port)`.
    pub fn accepts_target(&self, addr: Ipv4Addr, port: u16) -> bool {
        for rule in &self.rules {
            if rule.matches_addr(addr) && rule.matches_port(port) {
                return rule.accept;
            }
        }
        false
    }

    /// Whether the policy may admit `port` for some address.
    ///
    /// Used for hostname targets where the address is unknown until the
    /// exit resolves it: only wildcard-address rules decide; rules bound
    /// to specific addresses are skipped.
    pub fn accepts_port(&self, port: u16) -> bool {
        for rule in &self.rules {
            if rule.addr.is_none() && rule.matches_port(port) {
                return rule.accept;
            }
        }
        false
    }
}
