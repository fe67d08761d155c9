//! A single server's observed state (spec §3 "ServerDescription").

use std::{collections::HashMap, time::Duration};

use bson::oid::ObjectId;
use serde::{Deserialize, Serialize};

use crate::{
    address::ServerAddress,
    client::ClusterTime,
    error::Error,
    selection_criteria::TagSet,
};

/// The highest wire version this crate's dispatch logic understands. A server advertising a
/// narrower range than this is still usable; one requiring a newer minimum is not (spec §4.3.3
/// compatibility, tracked by [`crate::sdam::TopologyDescription::compatible`]).
pub(crate) const SUPPORTED_WIRE_VERSION_RANGE: (i32, i32) = (0, 25);

/// The type of a server, as determined from its `hello`/`isMaster` reply (spec §3).
#[derive(Debug, Deserialize, Serialize, Clone, Copy, Eq, PartialEq, Default, derive_more::Display)]
#[non_exhaustive]
pub enum ServerType {
    Standalone,
    Mongos,
    /// Reported a primary identity that has not yet been confirmed by a full heartbeat.
    PossiblePrimary,
    #[serde(rename = "RSPrimary")]
    RsPrimary,
    #[serde(rename = "RSSecondary")]
    RsSecondary,
    #[serde(rename = "RSArbiter")]
    RsArbiter,
    #[serde(rename = "RSOther")]
    RsOther,
    #[serde(rename = "RSGhost")]
    RsGhost,
    #[default]
    Unknown,
}

impl ServerType {
    pub(crate) fn is_data_bearing(self) -> bool {
        matches!(
            self,
            ServerType::Standalone | ServerType::RsPrimary | ServerType::RsSecondary | ServerType::Mongos
        )
    }

    pub(crate) fn is_available(self) -> bool {
        !matches!(self, ServerType::Unknown)
    }
}

/// The deserialized body of a server's `hello`/`isMaster` reply, as produced by the (out-of-scope)
/// BSON codec from the bytes a [`crate::Link`] returns.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HelloCommandResponse {
    pub is_writable_primary: Option<bool>,
    #[serde(rename = "ismaster")]
    pub is_master: Option<bool>,
    pub secondary: Option<bool>,
    pub arbiter_only: Option<bool>,
    pub hidden: Option<bool>,
    pub msg: Option<String>,
    pub min_wire_version: Option<i32>,
    pub max_wire_version: Option<i32>,
    pub me: Option<String>,
    pub hosts: Option<Vec<String>>,
    pub passives: Option<Vec<String>>,
    pub arbiters: Option<Vec<String>>,
    pub tags: Option<TagSet>,
    pub set_name: Option<String>,
    pub set_version: Option<i32>,
    pub election_id: Option<ObjectId>,
    pub primary: Option<String>,
    pub logical_session_timeout_minutes: Option<i64>,
    pub last_write: Option<LastWrite>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LastWrite {
    pub last_write_date: bson::DateTime,
}

impl HelloCommandResponse {
    pub(crate) fn server_type(&self, is_replica_set: bool) -> ServerType {
        if self.set_name.is_some() {
            if self.is_writable_primary.or(self.is_master).unwrap_or(false) {
                return ServerType::RsPrimary;
            }
            if self.secondary.unwrap_or(false) {
                return ServerType::RsSecondary;
            }
            if self.arbiter_only.unwrap_or(false) {
                return ServerType::RsArbiter;
            }
            if self.hidden.unwrap_or(false) {
                return ServerType::RsOther;
            }
            return ServerType::RsOther;
        }
        if self.msg.as_deref() == Some("isdbgrid") {
            return ServerType::Mongos;
        }
        if is_replica_set {
            return ServerType::RsGhost;
        }
        ServerType::Standalone
    }
}

/// An immutable snapshot of what the monitor most recently learned about one server.
#[derive(Debug, Clone)]
pub struct ServerDescription {
    pub address: ServerAddress,
    pub server_type: ServerType,
    pub last_update_time: Option<std::time::SystemTime>,
    /// The server's round-trip latency, smoothed with an exponentially-weighted moving average
    /// (spec §4.2, α=0.2).
    pub average_round_trip_time: Option<Duration>,
    pub min_wire_version: i32,
    pub max_wire_version: i32,
    pub tags: TagSet,
    pub set_name: Option<String>,
    pub set_version: Option<i32>,
    pub election_id: Option<ObjectId>,
    pub logical_session_timeout_minutes: Option<i64>,
    pub last_write_date: Option<bson::DateTime>,
    pub cluster_time: Option<ClusterTime>,
    pub hosts: Vec<ServerAddress>,
    pub passives: Vec<ServerAddress>,
    pub arbiters: Vec<ServerAddress>,
    pub me: Option<ServerAddress>,
    pub error: Option<Error>,
}

impl ServerDescription {
    /// A fresh, `Unknown` description, as every server starts out (spec §4.2).
    pub fn unknown(address: ServerAddress) -> Self {
        Self {
            address,
            server_type: ServerType::Unknown,
            last_update_time: None,
            average_round_trip_time: None,
            min_wire_version: 0,
            max_wire_version: 0,
            tags: TagSet::new(),
            set_name: None,
            set_version: None,
            election_id: None,
            logical_session_timeout_minutes: None,
            last_write_date: None,
            cluster_time: None,
            hosts: Vec::new(),
            passives: Vec::new(),
            arbiters: Vec::new(),
            me: None,
            error: None,
        }
    }

    pub(crate) fn from_hello_reply(
        address: ServerAddress,
        reply: HelloCommandResponse,
        cluster_time: Option<ClusterTime>,
        is_replica_set: bool,
        rtt: Duration,
        previous_rtt: Option<Duration>,
    ) -> Self {
        let parse_hosts = |hosts: Option<Vec<String>>| -> Vec<ServerAddress> {
            hosts
                .unwrap_or_default()
                .into_iter()
                .filter_map(|h| ServerAddress::parse(h).ok())
                .collect()
        };
        Self {
            server_type: reply.server_type(is_replica_set),
            last_update_time: Some(std::time::SystemTime::now()),
            average_round_trip_time: Some(ewma_rtt(previous_rtt, rtt)),
            min_wire_version: reply.min_wire_version.unwrap_or(0),
            max_wire_version: reply.max_wire_version.unwrap_or(0),
            tags: reply.tags.unwrap_or_default(),
            set_name: reply.set_name,
            set_version: reply.set_version,
            election_id: reply.election_id,
            logical_session_timeout_minutes: reply.logical_session_timeout_minutes,
            last_write_date: reply.last_write.map(|w| w.last_write_date),
            cluster_time,
            hosts: parse_hosts(reply.hosts),
            passives: parse_hosts(reply.passives),
            arbiters: parse_hosts(reply.arbiters),
            me: reply.me.and_then(|m| ServerAddress::parse(m).ok()),
            error: None,
            address,
        }
    }

    pub(crate) fn from_error(address: ServerAddress, error: Error) -> Self {
        Self {
            error: Some(error),
            last_update_time: Some(std::time::SystemTime::now()),
            ..Self::unknown(address)
        }
    }

    pub fn is_available(&self) -> bool {
        self.server_type.is_available()
    }

    /// Whether this server matches the given tag set: every key/value pair in `tag_set` must be
    /// present in this server's tags (spec §4.3.1 step 4).
    pub(crate) fn matches_tag_set(&self, tag_set: &TagSet) -> bool {
        tag_set.iter().all(|(k, v)| self.tags.get(k) == Some(v))
    }

    pub(crate) fn known_hosts(&self) -> impl Iterator<Item = &ServerAddress> {
        self.hosts.iter().chain(self.passives.iter()).chain(self.arbiters.iter())
    }
}

/// `newRtt = α * x + (1 - α) * oldRtt`, α = 0.2, per spec §4.2.
fn ewma_rtt(previous: Option<Duration>, sample: Duration) -> Duration {
    const ALPHA: f64 = 0.2;
    match previous {
        None => sample,
        Some(prev) => {
            let prev_micros = prev.as_secs_f64() * 1_000_000.0;
            let sample_micros = sample.as_secs_f64() * 1_000_000.0;
            let new_micros = ALPHA * sample_micros + (1.0 - ALPHA) * prev_micros;
            Duration::from_micros(new_micros.max(0.0) as u64)
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn ewma_converges_toward_new_samples() {
        let mut rtt = Duration::from_millis(100);
        for _ in 0..50 {
            rtt = ewma_rtt(Some(rtt), Duration::from_millis(10));
        }
        assert!(rtt.as_millis() < 15, "rtt should converge near 10ms, got {rtt:?}");
    }

    #[test]
    fn first_sample_is_used_directly() {
        assert_eq!(ewma_rtt(None, Duration::from_millis(42)), Duration::from_millis(42));
    }
}
