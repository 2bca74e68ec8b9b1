//! Path selection
//!
//! Produces relay paths for new circuits: a persisted guard, a
//! bandwidth-weighted middle, and a last hop chosen by purpose (exit
//! policy for general traffic, V2Dir / HSDir / plain middle for
//! directory, intro and rendezvous circuits). Relays in one family or
//! one /16 never share a path.
//!
//! Selection is weighted random over consensus bandwidth, scaled by the
//! consensus position weights. Candidates are considered in fingerprint
//! order, so a seeded RNG makes every choice reproducible.

use crate::error::{Result, TorError};
use crate::guards::GuardManager;
use crate::protocol::{Circuit, CircuitPurpose, Consensus, Relay};
use rand::Rng;

/// Select a full path for a new circuit
///
/// `pinned_last` fixes the final hop (intro points, rendezvous points
/// and HSDirs are chosen by the onion client, not by weight); when it
/// is set, guard and middle are chosen to be independent of it.
/// `target_port` is consulted only for general-purpose exits.
pub fn select_path<R: Rng>(
    consensus: &Consensus,
    guards: &GuardManager,
    purpose: CircuitPurpose,
    target_port: Option<u16>,
    pinned_last: Option<&Relay>,
    rng: &mut R,
) -> Result<Vec<Relay>> {
    let guard = select_guard(consensus, guards, pinned_last, rng)?;
    let middle = select_middle(consensus, &guard, pinned_last, rng)?;

    let last = match pinned_last {
        Some(relay) => relay.clone(),
        None => select_last(consensus, purpose, target_port, &guard, &middle, rng)?,
    };

    Ok(vec![guard, middle, last])
}

/// Pick the entry guard: persisted first, freshly sampled otherwise
fn select_guard<R: Rng>(
    consensus: &Consensus,
    guards: &GuardManager,
    pinned_last: Option<&Relay>,
    rng: &mut R,
) -> Result<Relay> {
    // A persisted guard is reused as long as the consensus still lists
    // it as guard-eligible and it does not collide with the pinned hop.
    let usable = |fp: &str| {
        consensus
            .relay(fp)
            .map(|r| {
                r.guard_eligible()
                    && pinned_last.map_or(true, |last| r.path_independent_of(last))
            })
            .unwrap_or(false)
    };
    if let Some((fingerprint, _)) = guards.pick(usable) {
        if let Some(relay) = consensus.relay(&fingerprint) {
            return Ok(relay.clone());
        }
    }

    // Sample a new candidate. HSDir-flagged guards use Wgg, the rest Wgd.
    let weights = consensus.weights;
    let candidates: Vec<&Relay> = consensus
        .usable_relays()
        .filter(|r| r.guard_eligible())
        .filter(|r| pinned_last.map_or(true, |last| r.path_independent_of(last)))
        .collect();

    let guard = weighted_pick(candidates, rng, |r| {
        let w = if r.flags.hs_dir { weights.wgg } else { weights.wgd };
        position_weight(r.bandwidth_weight, w)
    })
    .ok_or(TorError::PathInsufficient { position: "guard" })?
    .clone();

    guards.add_unconfirmed(&guard.fingerprint, &guard.or_addr().to_string())?;
    Ok(guard)
}

/// Pick the middle relay
fn select_middle<R: Rng>(
    consensus: &Consensus,
    guard: &Relay,
    pinned_last: Option<&Relay>,
    rng: &mut R,
) -> Result<Relay> {
    let weights = consensus.weights;
    let candidates: Vec<&Relay> = consensus
        .usable_relays()
        .filter(|r| r.middle_eligible())
        .filter(|r| r.path_independent_of(guard))
        .filter(|r| pinned_last.map_or(true, |last| r.path_independent_of(last)))
        .collect();

    weighted_pick(candidates, rng, |r| {
        position_weight(r.bandwidth_weight, weights.wmm)
    })
    .cloned()
    .ok_or(TorError::PathInsufficient { position: "middle" })
}

/// Pick the last hop by purpose
fn select_last<R: Rng>(
    consensus: &Consensus,
    purpose: CircuitPurpose,
    target_port: Option<u16>,
    guard: &Relay,
    middle: &Relay,
    rng: &mut R,
) -> Result<Relay> {
    let weights = consensus.weights;
    let independent =
        |r: &&Relay| r.path_independent_of(guard) && r.path_independent_of(middle);

    let picked = match purpose {
        CircuitPurpose::General | CircuitPurpose::HsClient => {
            let port = target_port.unwrap_or(443);
            let candidates: Vec<&Relay> = consensus
                .usable_relays()
                .filter(|r| r.exit_eligible(port))
                .filter(independent)
                .collect();
            weighted_pick(candidates, rng, |r| {
                position_weight(r.bandwidth_weight, weights.wee)
            })
        }
        CircuitPurpose::Directory => {
            let candidates: Vec<&Relay> = consensus
                .usable_relays()
                .filter(|r| r.flags.v2_dir)
                .filter(independent)
                .collect();
            weighted_pick(candidates, rng, |r| {
                position_weight(r.bandwidth_weight, weights.wmm)
            })
        }
        CircuitPurpose::Intro => {
            let candidates: Vec<&Relay> = consensus
                .usable_relays()
                .filter(|r| r.flags.hs_dir)
                .filter(independent)
                .collect();
            weighted_pick(candidates, rng, |r| {
                position_weight(r.bandwidth_weight, weights.wmm)
            })
        }
        CircuitPurpose::Rendezvous => {
            let candidates: Vec<&Relay> = consensus
                .usable_relays()
                .filter(|r| r.middle_eligible())
                .filter(independent)
                .collect();
            weighted_pick(candidates, rng, |r| {
                position_weight(r.bandwidth_weight, weights.wmm)
            })
        }
    };

    picked
        .cloned()
        .ok_or(TorError::PathInsufficient { position: "exit" })
}

/// Scale a consensus bandwidth by a position weight (1/10000 units)
fn position_weight(bandwidth: u64, weight: u64) -> u128 {
    u128::from(bandwidth) * u128::from(weight)
}

/// Weighted random choice
///
/// Candidates are sorted by fingerprint before the roll, so equal
/// weights resolve identically under a seeded RNG. Zero-weight
/// candidate sets fall back to uniform choice.
fn weighted_pick<'a, R: Rng, F>(
    mut candidates: Vec<&'a Relay>,
    rng: &mut R,
    weight_fn: F,
) -> Option<&'a Relay>
where
    F: Fn(&Relay) -> u128,
{
    if candidates.is_empty() {
        return None;
    }
    candidates.sort_by(|a, b| a.fingerprint.cmp(&b.fingerprint));

    let total: u128 = candidates.iter().map(|r| weight_fn(r)).sum();
    if total == 0 {
        let idx = rng.gen_range(0..candidates.len());
        return Some(candidates[idx]);
    }

    let mut roll = rng.gen_range(0..total);
    for relay in &candidates {
        let w = weight_fn(relay);
        if roll < w {
            return Some(*relay);
        }
        roll -= w;
    }
    candidates.last().copied()
}

/// Validate a finished path for a general circuit
///
/// Used by tests and the manager's debug assertions: three distinct
/// relays, pairwise family/subnet independent.
pub fn path_is_diverse(path: &[Relay]) -> bool {
    for (i, a) in path.iter().enumerate() {
        for b in &path[i + 1..] {
            if !a.path_independent_of(b) {
                return false;
            }
        }
    }
    true
}

/// Convenience for logging a path
pub fn describe_path(circuit: &Circuit) -> String {
    circuit
        .path
        .iter()
        .map(|fp| fp.get(..8).unwrap_or(fp).to_string())
        .collect::<Vec<_>>()
        .join(" -> ")
}
