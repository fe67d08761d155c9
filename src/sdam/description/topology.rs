//! The deployment-wide topology snapshot and the SDAM update rules that produce new ones
//! (spec §3 "TopologyDescription", §4.3.3).

use std::collections::HashMap;

use bson::oid::ObjectId;

use super::server::{ServerDescription, ServerType};
use crate::address::ServerAddress;

/// How the dispatcher should interpret the set of servers it knows about (spec §3).
#[derive(Debug, Clone, Copy, Eq, PartialEq, derive_more::Display)]
pub enum TopologyType {
    /// A single seed given with no `replicaSet` option; the sole server is used regardless of its
    /// reported type.
    Single,
    /// A single seed given with `directConnection=true`; behaves like `Single` for selection.
    Direct,
    ReplicaSetNoPrimary,
    ReplicaSetWithPrimary,
    Sharded,
    /// Not yet determined: multiple seeds with no `replicaSet` option, before any of them has
    /// reported whether it's a mongos.
    Unknown,
}

impl TopologyType {
    pub(crate) fn is_replica_set(self) -> bool {
        matches!(self, Self::ReplicaSetNoPrimary | Self::ReplicaSetWithPrimary)
    }

    fn selects_sole_server(self) -> bool {
        matches!(self, Self::Single | Self::Direct)
    }
}

/// An immutable snapshot of the whole deployment as the dispatcher currently understands it.
#[derive(Debug, Clone)]
pub struct TopologyDescription {
    pub topology_type: TopologyType,
    pub servers: HashMap<ServerAddress, ServerDescription>,
    pub set_name: Option<String>,
    pub max_set_version: Option<i32>,
    pub max_election_id: Option<ObjectId>,
    pub compatible: bool,
    pub incompatibility_message: Option<String>,
    /// Bumped every time [`crate::sdam::Topology::mark_stale`] is called; monitors compare this
    /// against their last-observed value to decide whether to skip their sleep (spec §4.3,
    /// "markStale").
    pub stale_generation: u64,
}

impl TopologyDescription {
    pub fn new(topology_type: TopologyType, seeds: &[ServerAddress], set_name: Option<String>) -> Self {
        let servers = seeds
            .iter()
            .map(|addr| (addr.clone(), ServerDescription::unknown(addr.clone())))
            .collect();
        Self {
            topology_type,
            servers,
            set_name,
            max_set_version: None,
            max_election_id: None,
            compatible: true,
            incompatibility_message: None,
            stale_generation: 0,
        }
    }

    /// The minimum `logicalSessionTimeoutMinutes` across all data-bearing members, or `None` if
    /// any data-bearing member hasn't reported one (spec §3).
    pub fn logical_session_timeout_minutes(&self) -> Option<i64> {
        let mut min: Option<i64> = None;
        for server in self.servers.values() {
            if !server.server_type.is_data_bearing() {
                continue;
            }
            match server.logical_session_timeout_minutes {
                None => return None,
                Some(v) => min = Some(min.map_or(v, |m: i64| m.min(v))),
            }
        }
        min
    }

    pub fn has_readable_server(&self) -> bool {
        self.servers.values().any(|s| s.is_available())
    }

    /// Applies one monitor's new `ServerDescription` to this topology, returning the resulting
    /// topology and whether anything actually changed. This function is pure: it never mutates
    /// `self`, matching the "immutable descriptions + locked pointer swap" design in spec §9.
    pub fn apply_update(&self, new: ServerDescription) -> (TopologyDescription, bool) {
        // Rule: updates for servers the topology doesn't already track are ignored (spec §4.3.3).
        if !self.servers.contains_key(&new.address) {
            return (self.clone(), false);
        }
        if self.topology_type.selects_sole_server() {
            let mut next = self.clone();
            next.servers.insert(new.address.clone(), new);
            return (next, true);
        }

        let mut next = self.clone();

        // Sharded topologies only keep mongoses (spec §4.3.3).
        if next.topology_type == TopologyType::Sharded
            && new.server_type != ServerType::Mongos
            && new.server_type != ServerType::Unknown
        {
            next.servers.remove(&new.address);
            next.recompute_type();
            return (next, true);
        }

        // A configured replica set name rejects members reporting a different one (invariant b).
        if let (Some(expected), Some(ref reported)) = (&next.set_name, &new.set_name) {
            if expected != reported {
                next.servers.remove(&new.address);
                next.recompute_type();
                return (next, true);
            }
        }

        if new.server_type == ServerType::Mongos {
            next.topology_type = TopologyType::Sharded;
            next.servers.insert(new.address.clone(), new);
            next.recompute_type();
            return (next, true);
        }

        if new.server_type == ServerType::RsPrimary {
            return next.apply_primary_update(new);
        }

        if next.topology_type.is_replica_set() {
            if next.set_name.is_none() {
                next.set_name = new.set_name.clone();
            }
            next.servers.insert(new.address.clone(), new);
            next.recompute_type();
            return (next, true);
        }

        // Still `Unknown`: an ordinary (non-mongos, non-primary) reply doesn't resolve the
        // topology type by itself.
        next.servers.insert(new.address.clone(), new);
        (next, true)
    }

    fn apply_primary_update(mut self, new: ServerDescription) -> (TopologyDescription, bool) {
        // Stale primary: an older (setVersion, electionId) tuple than the max ever seen is
        // demoted to Unknown instead of being accepted (spec §4.3.3).
        if let (Some(new_version), Some(new_election)) = (new.set_version, new.election_id) {
            let is_stale = match (self.max_set_version, self.max_election_id) {
                (Some(max_version), Some(max_election)) => {
                    new_version < max_version || (new_version == max_version && new_election != max_election && max_election > new_election)
                }
                _ => false,
            };
            if is_stale {
                let unknown = ServerDescription::unknown(new.address.clone());
                self.servers.insert(new.address, unknown);
                self.recompute_type();
                return (self, true);
            }
            self.max_set_version = Some(self.max_set_version.map_or(new_version, |v| v.max(new_version)));
            self.max_election_id = Some(new_election);
        }

        if self.set_name.is_none() {
            self.set_name = new.set_name.clone();
        }

        // Demote any previously-known primary (invariant a: at most one RSPrimary).
        for server in self.servers.values_mut() {
            if server.address != new.address && server.server_type == ServerType::RsPrimary {
                *server = ServerDescription::unknown(server.address.clone());
            }
        }

        let known_hosts: Vec<ServerAddress> = new.known_hosts().cloned().collect();
        self.servers.insert(new.address.clone(), new);

        // Membership follows the new primary's host list (spec invariant: add/remove per
        // hosts∪passives∪arbiters).
        for addr in &known_hosts {
            self.servers
                .entry(addr.clone())
                .or_insert_with(|| ServerDescription::unknown(addr.clone()));
        }
        let keep: std::collections::HashSet<_> = known_hosts.iter().cloned().collect();
        self.servers.retain(|addr, desc| keep.contains(addr) || desc.server_type == ServerType::RsPrimary);

        self.topology_type = TopologyType::ReplicaSetWithPrimary;
        (self, true)
    }

    /// Recomputes `topology_type` from the current server set without touching membership
    /// (invariant c: losing the primary demotes to `ReplicaSetNoPrimary`).
    fn recompute_type(&mut self) {
        if self.topology_type.selects_sole_server() {
            return;
        }
        if self.servers.values().any(|s| s.server_type == ServerType::Mongos) {
            self.topology_type = TopologyType::Sharded;
            return;
        }
        if self.topology_type.is_replica_set() || self.set_name.is_some() {
            let has_primary = self.servers.values().any(|s| s.server_type == ServerType::RsPrimary);
            self.topology_type = if has_primary {
                TopologyType::ReplicaSetWithPrimary
            } else {
                TopologyType::ReplicaSetNoPrimary
            };
        }
    }

    /// Replaces a server's description with `Unknown` due to a dispatch-observed error, and
    /// applies the same SDAM rules as a monitor update (spec §4.3 "markServerUnknown").
    pub fn mark_server_unknown(&self, address: &ServerAddress, error: crate::error::Error) -> (TopologyDescription, bool) {
        if !self.servers.contains_key(address) {
            return (self.clone(), false);
        }
        let desc = ServerDescription::from_error(address.clone(), error);
        self.apply_update(desc)
    }

    /// Recomputes `compatible`/`incompatibility_message` from the currently known servers' wire
    /// version ranges against [`super::server::SUPPORTED_WIRE_VERSION_RANGE`]. Called by
    /// [`crate::sdam::Topology`] after every description swap rather than inline in
    /// [`Self::apply_update`], since it needs no access to the triggering update itself.
    pub(crate) fn recompute_compatibility(&mut self) {
        use super::server::SUPPORTED_WIRE_VERSION_RANGE;
        let (supported_min, supported_max) = SUPPORTED_WIRE_VERSION_RANGE;
        for server in self.servers.values() {
            if !server.is_available() {
                continue;
            }
            if server.min_wire_version > supported_max {
                self.compatible = false;
                self.incompatibility_message = Some(format!(
                    "server at {} requires wire version >= {}, but this crate only supports up to {}",
                    server.address, server.min_wire_version, supported_max
                ));
                return;
            }
            if server.max_wire_version < supported_min {
                self.compatible = false;
                self.incompatibility_message = Some(format!(
                    "server at {} only supports wire version <= {}, but this crate requires at least {}",
                    server.address, server.max_wire_version, supported_min
                ));
                return;
            }
        }
        self.compatible = true;
        self.incompatibility_message = None;
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::time::Duration;

    fn addr(h: &str) -> ServerAddress {
        ServerAddress::new(h, Some(27017))
    }

    fn primary_desc(address: ServerAddress, set_version: i32, hosts: Vec<ServerAddress>) -> ServerDescription {
        ServerDescription {
            server_type: ServerType::RsPrimary,
            set_name: Some("rs0".into()),
            set_version: Some(set_version),
            election_id: Some(ObjectId::new()),
            hosts,
            average_round_trip_time: Some(Duration::from_millis(5)),
            ..ServerDescription::unknown(address)
        }
    }

    #[test]
    fn at_most_one_primary_and_type_follows() {
        let seeds = vec![addr("h1"), addr("h2"), addr("h3")];
        let topo = TopologyDescription::new(TopologyType::ReplicaSetNoPrimary, &seeds, Some("rs0".into()));

        let (topo, changed) = topo.apply_update(primary_desc(addr("h1"), 1, seeds.clone()));
        assert!(changed);
        assert_eq!(topo.topology_type, TopologyType::ReplicaSetWithPrimary);
        assert_eq!(topo.servers.get(&addr("h1")).unwrap().server_type, ServerType::RsPrimary);

        // A second primary claim demotes the first.
        let (topo, _) = topo.apply_update(primary_desc(addr("h2"), 2, seeds.clone()));
        let primaries: Vec<_> = topo
            .servers
            .values()
            .filter(|s| s.server_type == ServerType::RsPrimary)
            .collect();
        assert_eq!(primaries.len(), 1);
        assert_eq!(primaries[0].address, addr("h2"));
    }

    #[test]
    fn losing_primary_demotes_topology_type() {
        let seeds = vec![addr("h1"), addr("h2")];
        let topo = TopologyDescription::new(TopologyType::ReplicaSetNoPrimary, &seeds, Some("rs0".into()));
        let (topo, _) = topo.apply_update(primary_desc(addr("h1"), 1, seeds.clone()));
        assert_eq!(topo.topology_type, TopologyType::ReplicaSetWithPrimary);

        let (topo, _) = topo.mark_server_unknown(
            &addr("h1"),
            crate::error::Error::internal("simulated network failure"),
        );
        assert_eq!(topo.topology_type, TopologyType::ReplicaSetNoPrimary);
    }

    #[test]
    fn stale_primary_is_rejected() {
        let seeds = vec![addr("h1"), addr("h2")];
        let topo = TopologyDescription::new(TopologyType::ReplicaSetNoPrimary, &seeds, Some("rs0".into()));
        let (topo, _) = topo.apply_update(primary_desc(addr("h1"), 5, seeds.clone()));

        // An older setVersion claiming primary is demoted to Unknown instead of accepted.
        let mut stale = primary_desc(addr("h2"), 4, seeds.clone());
        stale.election_id = Some(ObjectId::new());
        let (topo, _) = topo.apply_update(stale);
        assert_eq!(topo.servers.get(&addr("h2")).unwrap().server_type, ServerType::Unknown);
    }

    #[test]
    fn differing_set_name_removes_server() {
        let seeds = vec![addr("h1"), addr("h2")];
        let topo = TopologyDescription::new(TopologyType::ReplicaSetNoPrimary, &seeds, Some("rs0".into()));
        let mut desc = ServerDescription::unknown(addr("h2"));
        desc.server_type = ServerType::RsSecondary;
        desc.set_name = Some("other".into());
        let (topo, changed) = topo.apply_update(desc);
        assert!(changed);
        assert!(!topo.servers.contains_key(&addr("h2")));
    }
}
