//! The server selection algorithm (spec §4.3.1).

use std::time::Duration;

use rand::Rng;

use super::{
    server::{ServerDescription, ServerType},
    topology::{TopologyDescription, TopologyType},
};
use crate::{
    error::{Error, Result},
    selection_criteria::{ReadPreference, SelectionCriteria},
};

/// Tunables the selection algorithm needs beyond the topology snapshot itself: the monitor's
/// heartbeat cadence (used both for the max-staleness lower bound and the staleness lag formula)
/// and the latency window width.
#[derive(Debug, Clone, Copy)]
pub struct SelectionConfig {
    pub heartbeat_frequency: Duration,
    pub local_threshold: Duration,
}

/// Computes the set of servers eligible for `criteria` against `topology` (spec §4.3.1 steps
/// 1-6). Returns an empty vec, not an error, when nothing currently qualifies — the caller (the
/// waiting loop in spec §4.3.2) is responsible for retrying until the deadline.
pub fn eligible_servers<'a>(
    topology: &'a TopologyDescription,
    criteria: &SelectionCriteria,
    config: SelectionConfig,
) -> Result<Vec<&'a ServerDescription>> {
    // Step 1: Single/Direct topologies always select their sole server, read preference
    // notwithstanding.
    if matches!(topology.topology_type, TopologyType::Single | TopologyType::Direct) {
        return Ok(topology.servers.values().filter(|s| s.is_available()).collect());
    }

    let read_pref = match criteria {
        SelectionCriteria::Predicate(predicate) => {
            let available: Vec<&ServerDescription> =
                topology.servers.values().filter(|s| s.is_available()).collect();
            let matched: Vec<&ServerDescription> = available
                .into_iter()
                .filter(|s| predicate(&crate::sdam::ServerInfo::new(s)))
                .collect();
            return Ok(window_by_latency(matched, config.local_threshold));
        }
        SelectionCriteria::ReadPreference(rp) => rp,
    };

    // Step 7: `primary` mode is incompatible with tags/staleness. `ReadPreference::Primary` is a
    // fieldless variant and `ReadPreference::with_tags` (selection_criteria.rs) already rejects
    // attaching tags to it, so the combination this step guards against can't reach here; the
    // constraint is enforced at construction time instead of re-checked on every selection.

    // Non-replica-set deployments (sharded, or not yet resolved) ignore most of the read
    // preference machinery: any mongos is suitable for any mode except bare `secondary`/`primary`
    // mismatches don't apply because routing decisions are made by the mongos itself.
    if !topology.topology_type.is_replica_set() {
        let candidates: Vec<&ServerDescription> = topology
            .servers
            .values()
            .filter(|s| s.server_type == ServerType::Mongos)
            .collect();
        return Ok(window_by_latency(candidates, config.local_threshold));
    }

    let mut candidates = type_candidates(topology, read_pref);

    if let Some(max_staleness) = read_pref.max_staleness() {
        let min_required = config.heartbeat_frequency + Duration::from_secs(10);
        if max_staleness < min_required {
            return Err(Error::configuration(format!(
                "maxStalenessSeconds must be at least heartbeatFrequencyMS + 10s ({:?}), got {:?}",
                min_required, max_staleness
            )));
        }
        candidates = apply_max_staleness(topology, candidates, max_staleness, config.heartbeat_frequency);
    }

    candidates = apply_tag_sets(candidates, read_pref);

    Ok(window_by_latency(candidates, config.local_threshold))
}

fn type_candidates<'a>(
    topology: &'a TopologyDescription,
    read_pref: &ReadPreference,
) -> Vec<&'a ServerDescription> {
    let has_primary = topology.servers.values().any(|s| s.server_type == ServerType::RsPrimary);
    let wanted: &[ServerType] = match read_pref {
        ReadPreference::Primary => &[ServerType::RsPrimary],
        ReadPreference::Secondary { .. } => &[ServerType::RsSecondary],
        ReadPreference::PrimaryPreferred { .. } => {
            if has_primary {
                &[ServerType::RsPrimary]
            } else {
                &[ServerType::RsSecondary]
            }
        }
        ReadPreference::SecondaryPreferred { .. } => {
            // Resolved after collecting below: prefer secondary, fall back to primary.
            &[ServerType::RsSecondary, ServerType::RsPrimary]
        }
        ReadPreference::Nearest { .. } => &[ServerType::RsPrimary, ServerType::RsSecondary],
    };

    if matches!(read_pref, ReadPreference::SecondaryPreferred { .. }) {
        let secondaries: Vec<&ServerDescription> = topology
            .servers
            .values()
            .filter(|s| s.server_type == ServerType::RsSecondary)
            .collect();
        if !secondaries.is_empty() {
            return secondaries;
        }
        return topology
            .servers
            .values()
            .filter(|s| s.server_type == ServerType::RsPrimary)
            .collect();
    }

    topology.servers.values().filter(|s| wanted.contains(&s.server_type)).collect()
}

/// Spec §4.3.1 step 3: a secondary's lag is `(primary.lastWriteDate - secondary.lastWriteDate) +
/// heartbeatFrequency`; without a primary, the most recently written secondary stands in for it.
fn apply_max_staleness<'a>(
    topology: &'a TopologyDescription,
    candidates: Vec<&'a ServerDescription>,
    max_staleness: Duration,
    heartbeat_frequency: Duration,
) -> Vec<&'a ServerDescription> {
    let reference_write = topology
        .servers
        .values()
        .find(|s| s.server_type == ServerType::RsPrimary)
        .and_then(|p| p.last_write_date)
        .or_else(|| {
            candidates
                .iter()
                .filter_map(|s| s.last_write_date)
                .max()
        });

    let Some(reference_write) = reference_write else {
        return candidates;
    };

    candidates
        .into_iter()
        .filter(|s| {
            if s.server_type != ServerType::RsSecondary {
                return true;
            }
            let Some(secondary_write) = s.last_write_date else {
                return false;
            };
            let lag_ms = (reference_write.timestamp_millis() - secondary_write.timestamp_millis()).max(0) as u64;
            let lag = Duration::from_millis(lag_ms) + heartbeat_frequency;
            lag <= max_staleness
        })
        .collect()
}

/// Spec §4.3.1 step 4: evaluate tag sets in order, using the first one that matches at least one
/// candidate.
fn apply_tag_sets<'a>(candidates: Vec<&'a ServerDescription>, read_pref: &ReadPreference) -> Vec<&'a ServerDescription> {
    let tag_sets = read_pref.tag_sets();
    if tag_sets.is_empty() {
        return candidates;
    }
    for tag_set in tag_sets {
        let matched: Vec<&ServerDescription> =
            candidates.iter().copied().filter(|s| s.matches_tag_set(tag_set)).collect();
        if !matched.is_empty() {
            return matched;
        }
    }
    Vec::new()
}

/// Spec §4.3.1 step 6: retain every candidate within `localThreshold` of the fastest one.
fn window_by_latency<'a>(candidates: Vec<&'a ServerDescription>, local_threshold: Duration) -> Vec<&'a ServerDescription> {
    let Some(min_rtt) = candidates.iter().filter_map(|s| s.average_round_trip_time).min() else {
        return candidates;
    };
    candidates
        .into_iter()
        .filter(|s| match s.average_round_trip_time {
            Some(rtt) => rtt <= min_rtt + local_threshold,
            None => false,
        })
        .collect()
}

/// Picks uniformly at random among the latency window (spec §8 property 1).
pub fn pick_random<'a>(candidates: &[&'a ServerDescription]) -> Option<&'a ServerDescription> {
    if candidates.is_empty() {
        return None;
    }
    let idx = rand::rng().random_range(0..candidates.len());
    Some(candidates[idx])
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::address::ServerAddress;
    use std::collections::HashMap;

    fn server(host: &str, ty: ServerType, rtt_ms: u64) -> ServerDescription {
        ServerDescription {
            average_round_trip_time: Some(Duration::from_millis(rtt_ms)),
            server_type: ty,
            set_name: Some("rs0".into()),
            ..ServerDescription::unknown(ServerAddress::new(host, Some(27017)))
        }
    }

    fn topo(servers: Vec<ServerDescription>) -> TopologyDescription {
        let mut map = HashMap::new();
        for s in servers {
            map.insert(s.address.clone(), s);
        }
        TopologyDescription {
            topology_type: TopologyType::ReplicaSetWithPrimary,
            servers: map,
            set_name: Some("rs0".into()),
            max_set_version: None,
            max_election_id: None,
            compatible: true,
            incompatibility_message: None,
            stale_generation: 0,
        }
    }

    #[test]
    fn nearest_excludes_servers_outside_latency_window() {
        let t = topo(vec![
            server("h1", ServerType::RsPrimary, 5),
            server("h2", ServerType::RsSecondary, 20),
            server("h3", ServerType::RsSecondary, 200),
        ]);
        let config = SelectionConfig {
            heartbeat_frequency: Duration::from_secs(10),
            local_threshold: Duration::from_millis(15),
        };
        let criteria: SelectionCriteria = ReadPreference::nearest(vec![], None).into();
        let eligible = eligible_servers(&t, &criteria, config).unwrap();
        let hosts: std::collections::HashSet<_> = eligible.iter().map(|s| s.address.host.clone()).collect();
        assert_eq!(hosts, ["h1", "h2"].into_iter().map(String::from).collect());
    }

    #[test]
    fn max_staleness_below_minimum_is_a_configuration_error() {
        let t = topo(vec![server("h1", ServerType::RsPrimary, 5)]);
        let config = SelectionConfig {
            heartbeat_frequency: Duration::from_secs(10),
            local_threshold: Duration::from_millis(15),
        };
        let criteria: SelectionCriteria =
            ReadPreference::secondary(vec![], Some(Duration::from_secs(5))).into();
        assert!(eligible_servers(&t, &criteria, config).is_err());
    }

    #[test]
    fn primary_mode_selects_the_primary_regardless_of_secondaries() {
        let t = topo(vec![
            server("h1", ServerType::RsPrimary, 5),
            server("h2", ServerType::RsSecondary, 1),
        ]);
        let config = SelectionConfig {
            heartbeat_frequency: Duration::from_secs(10),
            local_threshold: Duration::from_millis(15),
        };
        let criteria: SelectionCriteria = ReadPreference::Primary.into();
        let eligible = eligible_servers(&t, &criteria, config).unwrap();
        assert_eq!(eligible.len(), 1);
        assert_eq!(eligible[0].address.host, "h1");
    }
}
