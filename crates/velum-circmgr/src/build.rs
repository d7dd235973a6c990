//! Choosing paths for new circuits.

use crate::directory::Relay;
use crate::usage::TargetPort;
use crate::{Error, Result};

use rand::seq::SliceRandom;
use rand::Rng;

/// Number of hops in a general-purpose circuit.
const GENERAL_PATH_LEN: usize = 3;

/// Plan a general-purpose exit path.
///
/// The exit is chosen uniformly among relays whose policy admits at
/// least one of `pending_ports` (or any port at all, if no ports are
/// pending); then the middle and entry hops are chosen among the
/// remaining relays, excluding repeats and declared family members of
/// relays already on the path.
pub(crate) fn plan_exit_path<R: Rng>(
    rng: &mut R,
    relays: &[Relay],
    pending_ports: &[TargetPort],
) -> Result<Vec<Relay>> {
    if relays.len() < GENERAL_PATH_LEN {
        return Err(Error::NoPath(format!(
            "only {} relays in directory",
            relays.len()
        )));
    }
    let exits: Vec<&Relay> = relays
        .iter()
        .filter(|r| {
            if pending_ports.is_empty() {
                r.policy().allows_some_port()
            } else {
                pending_ports.iter().any(|p| r.policy().allows_port(p.port()))
            }
        })
        .collect();
    let exit = (*exits
        .choose(rng)
        .ok_or_else(|| Error::NoExit("no relay admits the requested ports".into()))?)
    .clone();

    let mut path = plan_rest_of_path(rng, relays, vec![exit])?;
    path.reverse();
    Ok(path)
}

/// Plan a one-hop path to a directory cache.
pub(crate) fn plan_directory_path(relay: &Relay) -> Result<Vec<Relay>> {
    if !relay.is_dir_cache() {
        return Err(Error::NoPath(format!(
            "relay {} is not a directory cache",
            relay.nickname()
        )));
    }
    Ok(vec![relay.clone()])
}

/// Extend a partial path (built exit-first) with middle and entry hops,
/// subject to the no-repeat and no-shared-family rules.
fn plan_rest_of_path<R: Rng>(
    rng: &mut R,
    relays: &[Relay],
    mut path_rev: Vec<Relay>,
) -> Result<Vec<Relay>> {
    while path_rev.len() < GENERAL_PATH_LEN {
        let candidates: Vec<&Relay> = relays
            .iter()
            .filter(|r| {
                !path_rev
                    .iter()
                    .any(|p| p.same_relay_as(r) || p.in_same_family_as(r))
            })
            .collect();
        let next = (*candidates.choose(rng).ok_or_else(|| {
            Error::NoPath("not enough distinct relays for a full path".into())
        })?)
        .clone();
        path_rev.push(next);
    }
    Ok(path_rev)
}

#[cfg(test)]
mod test {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use crate::usage::ExitPolicy;

    fn relay(nickname: &str, b: u8, policy: ExitPolicy) -> Relay {
        Relay::new(nickname, [b; 20], "192.0.2.1:9001", 0, policy)
    }

    fn small_net() -> Vec<Relay> {
        vec![
            relay("entry", 1, ExitPolicy::reject_all()),
            relay("middle", 2, ExitPolicy::reject_all()),
            relay("exit80", 3, ExitPolicy::accept_ports(&[80])),
            relay("exit443", 4, ExitPolicy::accept_ports(&[443])),
        ]
    }

    #[test]
    fn picks_exit_that_admits_port() {
        let relays = small_net();
        let mut rng = rand::thread_rng();
        for _ in 0..16 {
            let path =
                plan_exit_path(&mut rng, &relays, &[TargetPort::new(80)]).unwrap();
            assert_eq!(path.len(), 3);
            assert_eq!(path[2].nickname(), "exit80");
            // no repeats
            assert!(!path[0].same_relay_as(&path[1]));
            assert!(!path[0].same_relay_as(&path[2]));
            assert!(!path[1].same_relay_as(&path[2]));
        }
    }

    #[test]
    fn no_exit_for_port() {
        let relays = small_net();
        let mut rng = rand::thread_rng();
        assert!(matches!(
            plan_exit_path(&mut rng, &relays, &[TargetPort::new(25)]),
            Err(Error::NoExit(_))
        ));
    }

    #[test]
    fn family_exclusion() {
        let mut relays = small_net();
        // Everyone except the exit is family with the exit: no path.
        let exit_name = "exit80".to_string();
        for r in relays.iter_mut() {
            if r.nickname() != "exit80" && r.nickname() != "exit443" {
                r.set_family(vec![exit_name.clone()]);
            }
        }
        // Only exit443 remains as a candidate for *both* middle and
        // entry, and it can't be used twice.
        let mut rng = rand::thread_rng();
        assert!(matches!(
            plan_exit_path(&mut rng, &relays, &[TargetPort::new(80)]),
            Err(Error::NoPath(_))
        ));
    }

    #[test]
    fn directory_path_wants_dir_cache() {
        let r = relay("nodir", 9, ExitPolicy::reject_all());
        assert!(plan_directory_path(&r).is_err());
        let d = Relay::new("dir", [8; 20], "192.0.2.8:9001", 80, ExitPolicy::reject_all());
        let path = plan_directory_path(&d).unwrap();
        assert_eq!(path.len(), 1);
        assert_eq!(path[0].nickname(), "dir");
    }
}
