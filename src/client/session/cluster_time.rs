//! Gossiped `$clusterTime` tracking (spec §4.5 "ClusterTime gossip").

use serde::{Deserialize, Serialize};

/// An opaque, monotonically-comparable cluster time token gossiped between servers and this
/// dispatcher on every command reply.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct ClusterTime {
    #[serde(rename = "clusterTime")]
    pub cluster_time: bson::Timestamp,
    pub signature: bson::Document,
}

impl ClusterTime {
    /// Keeps `self` unless `other` is strictly greater, per the gossip protocol's "always advance,
    /// never regress" rule.
    pub(crate) fn max(self, other: Self) -> Self {
        if other.cluster_time > self.cluster_time {
            other
        } else {
            self
        }
    }
}

/// Merges a newly observed cluster time into `current`, advancing it only if `new` is later.
pub(crate) fn advance(current: &mut Option<ClusterTime>, new: Option<ClusterTime>) {
    let Some(new) = new else { return };
    *current = Some(match current.take() {
        Some(existing) => existing.max(new),
        None => new,
    });
}

#[cfg(test)]
mod test {
    use super::*;

    fn ct(t: u32) -> ClusterTime {
        ClusterTime {
            cluster_time: bson::Timestamp { time: t, increment: 0 },
            signature: bson::doc! {},
        }
    }

    #[test]
    fn advance_never_regresses() {
        let mut current = Some(ct(10));
        advance(&mut current, Some(ct(5)));
        assert_eq!(current, Some(ct(10)));

        advance(&mut current, Some(ct(20)));
        assert_eq!(current, Some(ct(20)));
    }
}
