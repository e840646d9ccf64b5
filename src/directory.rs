//! Directory interface
//!
//! The circuit core does not fetch or verify the consensus; it consults
//! a [`Directory`] supplied by the embedding application for router
//! lookup and family relations. Exit-policy evaluation lives on the
//! [`Relay`] descriptors themselves.

use std::sync::Arc;

use crate::relay::Relay;

/// Router database consulted for path selection.
pub trait Directory: Send + Sync {
    /// A snapshot of the usable relays in the current consensus.
    fn usable_relays(&self) -> Vec<Arc<Relay>>;

    /// Look up a relay by fingerprint.
    fn relay_by_fingerprint(&self, fingerprint: &str) -> Option<Arc<Relay>> {
        self.usable_relays()
            .into_iter()
            .find(|r| r.fingerprint.eq_ignore_ascii_case(fingerprint))
    }
}

/// A fixed in-memory directory.
///
/// Useful for tests and for applications that manage consensus data
/// themselves.
pub struct StaticDirectory {
    relays: Vec<Arc<Relay>>,
}

impl StaticDirectory {
    /// Build a directory over a fixed relay list
    pub fn new(relays: Vec<Relay>) -> Self {
        Self {
            relays: relays.into_iter().map(Arc::new).collect(),
        }
    }
}

impl Directory for StaticDirectory {
    fn usable_relays(&self) -> Vec<Arc<Relay>> {
        self.relays.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::test_support::relay_with_ntor_key;

    #[test]
    fn test_lookup_by_fingerprint() {
        let (a, _) = relay_with_ntor_key("alpha", "10.0.0.1", 9001);
        let (b, _) = relay_with_ntor_key("beta", "10.0.0.2", 9001);
        let fp = b.fingerprint.clone();

        let dir = StaticDirectory::new(vec![a, b]);
        assert_eq!(dir.usable_relays().len(), 2);
        let found = dir.relay_by_fingerprint(&fp.to_lowercase()).unwrap();
        assert_eq!(found.nickname, "beta");
        assert!(dir.relay_by_fingerprint("00").is_none());
    }
}
