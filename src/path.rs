//! Path selection
//!
//! Chooses exit, entry and middle hops for a new circuit from the
//! directory, excluding repeats and declared families. Selection within
//! a candidate set is uniformly random; spreading load beyond that is a
//! policy hook left to the directory (which decides what is "usable").

use std::sync::Arc;

use crate::directory::Directory;
use crate::error::{Result, TorError};
use crate::relay::Relay;
use crate::rng::SecureRandom;

/// Choose a three-hop path whose exit can serve `port_hint`, or any
/// pending port, or any port at all when nothing is pending.
pub(crate) fn choose_path(
    directory: &dyn Directory,
    rng: &SecureRandom,
    port_hint: Option<u16>,
    pending_ports: &[u16],
) -> Result<Vec<Arc<Relay>>> {
    let relays = directory.usable_relays();

    let exit = choose_exit(&relays, rng, port_hint, pending_ports)?;
    let entry = choose_entry(&relays, rng, &exit)?;
    let middle = choose_middle(&relays, rng, &exit, &entry)?;

    log::debug!(
        "Chose path {} -> {} -> {}",
        entry.nickname,
        middle.nickname,
        exit.nickname
    );
    Ok(vec![entry, middle, exit])
}

fn choose_exit(
    relays: &[Arc<Relay>],
    rng: &SecureRandom,
    port_hint: Option<u16>,
    pending_ports: &[u16],
) -> Result<Arc<Relay>> {
    let admits = |relay: &Relay| -> bool {
        match port_hint {
            Some(port) => relay.exit_policy.accepts_port(port),
            None if pending_ports.is_empty() => true,
            None => pending_ports
                .iter()
                .any(|port| relay.exit_policy.accepts_port(*port)),
        }
    };

    let candidates: Vec<&Arc<Relay>> = relays
        .iter()
        .filter(|r| r.is_exit() && r.ntor_onion_key.is_some() && admits(r))
        .collect();

    rng.choose(&candidates)
        .map(|r| Arc::clone(*r))
        .ok_or_else(|| {
            TorError::NoRelaysAvailable(match port_hint {
                Some(port) => format!("no exit admits port {}", port),
                None => "no usable exit relay".into(),
            })
        })
}

fn choose_entry(
    relays: &[Arc<Relay>],
    rng: &SecureRandom,
    exit: &Arc<Relay>,
) -> Result<Arc<Relay>> {
    let candidates: Vec<&Arc<Relay>> = relays
        .iter()
        .filter(|r| {
            r.is_guard()
                && r.ntor_onion_key.is_some()
                && r.fingerprint != exit.fingerprint
                && !r.in_same_family(exit)
        })
        .collect();

    rng.choose(&candidates)
        .map(|r| Arc::clone(*r))
        .ok_or_else(|| TorError::NoRelaysAvailable("no usable entry relay".into()))
}

fn choose_middle(
    relays: &[Arc<Relay>],
    rng: &SecureRandom,
    exit: &Arc<Relay>,
    entry: &Arc<Relay>,
) -> Result<Arc<Relay>> {
    let candidates: Vec<&Arc<Relay>> = relays
        .iter()
        .filter(|r| {
            r.is_middle()
                && r.ntor_onion_key.is_some()
                && r.fingerprint != exit.fingerprint
                && r.fingerprint != entry.fingerprint
                && !r.in_same_family(exit)
                && !r.in_same_family(entry)
        })
        .collect();

    rng.choose(&candidates)
        .map(|r| Arc::clone(*r))
        .ok_or_else(|| TorError::NoRelaysAvailable("no usable middle relay".into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::StaticDirectory;
    use crate::relay::test_support::relay_with_ntor_key;
    use crate::relay::{ExitPolicy, RelayFlags};

    fn directory() -> StaticDirectory {
        let (mut guard, _) = relay_with_ntor_key("guard", "10.0.0.1", 9001);
        guard.flags = RelayFlags::from_string("Fast Guard Running Stable Valid");
        guard.exit_policy = ExitPolicy::reject_all();

        let (mut middle, _) = relay_with_ntor_key("middle", "10.0.0.2", 9001);
        middle.flags = RelayFlags::from_string("Fast Running Stable Valid");
        middle.exit_policy = ExitPolicy::reject_all();

        let (mut exit, _) = relay_with_ntor_key("exit", "10.0.0.3", 9001);
        exit.flags = RelayFlags::from_string("Exit Fast Running Stable Valid");
        exit.exit_policy = ExitPolicy::parse(&["accept *:80", "reject *:*"]).unwrap();

        StaticDirectory::new(vec![guard, middle, exit])
    }

    #[test]
    fn test_three_distinct_hops() {
        let dir = directory();
        let rng = SecureRandom::new().unwrap();
        let path = choose_path(&dir, &rng, Some(80), &[]).unwrap();
        assert_eq!(path.len(), 3);
        assert_eq!(path[0].nickname, "guard");
        assert_eq!(path[1].nickname, "middle");
        assert_eq!(path[2].nickname, "exit");
    }

    #[test]
    fn test_no_exit_for_port() {
        let dir = directory();
        let rng = SecureRandom::new().unwrap();
        let err = choose_path(&dir, &rng, Some(25), &[]).unwrap_err();
        assert!(matches!(err, TorError::NoRelaysAvailable(_)));
    }

    #[test]
    fn test_pending_ports_steer_exit() {
        let dir = directory();
        let rng = SecureRandom::new().unwrap();
        // No hint: any pending port must be admitted.
        assert!(choose_path(&dir, &rng, None, &[80]).is_ok());
        assert!(choose_path(&dir, &rng, None, &[25]).is_err());
    }

    #[test]
    fn test_family_excluded() {
        let (mut guard, _) = relay_with_ntor_key("guard", "10.0.0.1", 9001);
        guard.flags = RelayFlags::from_string("Fast Guard Running Stable Valid");
        let (mut middle, _) = relay_with_ntor_key("middle", "10.0.0.2", 9001);
        middle.flags = RelayFlags::from_string("Fast Running Stable Valid");
        let (mut exit, _) = relay_with_ntor_key("exit", "10.0.0.3", 9001);
        exit.flags = RelayFlags::from_string("Exit Fast Running Stable Valid");
        exit.exit_policy = ExitPolicy::accept_all();

        // Guard declares the exit as family: no usable entry remains.
        guard.family = vec![exit.fingerprint.clone()];
        let dir = StaticDirectory::new(vec![guard, middle, exit]);
        let rng = SecureRandom::new().unwrap();
        let err = choose_path(&dir, &rng, Some(80), &[]).unwrap_err();
        assert!(matches!(err, TorError::NoRelaysAvailable(_)));
    }
}
