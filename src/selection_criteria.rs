//! Read preferences and the predicate-based server selection escape hatch.

use std::{collections::HashMap, fmt, sync::Arc, time::Duration};

use crate::{
    error::{Error, Result},
    sdam::ServerInfo,
};

/// A read preference tag set. A secondary is eligible under a tag set if it has every key/value
/// pair the tag set names (spec §4.3.1 step 4).
pub type TagSet = HashMap<String, String>;

/// A user-supplied predicate used to further narrow server selection (spec §4.3.1 step 5). Its
/// output, when present, entirely replaces the candidate set computed so far.
pub type Predicate = Arc<dyn Send + Sync + Fn(&ServerInfo<'_>) -> bool>;

/// Describes which servers are suitable for a given operation.
#[derive(Clone)]
pub enum SelectionCriteria {
    /// Select based on server type, max staleness, and tag sets.
    ReadPreference(ReadPreference),
    /// Select using an arbitrary predicate over the candidate set produced by the read
    /// preference filter.
    Predicate(Predicate),
}

impl fmt::Debug for SelectionCriteria {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ReadPreference(rp) => f.debug_tuple("ReadPreference").field(rp).finish(),
            Self::Predicate(_) => f.write_str("Predicate(..)"),
        }
    }
}

impl From<ReadPreference> for SelectionCriteria {
    fn from(rp: ReadPreference) -> Self {
        Self::ReadPreference(rp)
    }
}

impl SelectionCriteria {
    pub(crate) fn as_read_pref(&self) -> Option<&ReadPreference> {
        match self {
            Self::ReadPreference(rp) => Some(rp),
            Self::Predicate(_) => None,
        }
    }

    pub(crate) fn is_read_pref_primary(&self) -> bool {
        matches!(self.as_read_pref(), Some(ReadPreference::Primary))
    }
}

/// Specifies how the dispatcher should route an operation among the members of a replica set or
/// the mongoses of a sharded cluster.
///
/// See spec §4.3.1 for the exact filtering algorithm each mode drives.
#[derive(Clone, Debug, PartialEq)]
pub enum ReadPreference {
    /// Only route to the primary (or, in a sharded cluster, any mongos).
    Primary,
    /// Only route to a secondary.
    Secondary {
        tag_sets: Vec<TagSet>,
        max_staleness: Option<Duration>,
    },
    /// Prefer the primary; fall back to secondaries if none is available.
    PrimaryPreferred {
        tag_sets: Vec<TagSet>,
        max_staleness: Option<Duration>,
    },
    /// Prefer a secondary; fall back to the primary if none is available.
    SecondaryPreferred {
        tag_sets: Vec<TagSet>,
        max_staleness: Option<Duration>,
    },
    /// Route to whichever eligible member has the lowest latency, primary or secondary.
    Nearest {
        tag_sets: Vec<TagSet>,
        max_staleness: Option<Duration>,
    },
}

impl Default for ReadPreference {
    fn default() -> Self {
        ReadPreference::Primary
    }
}

impl ReadPreference {
    pub fn secondary(tag_sets: Vec<TagSet>, max_staleness: Option<Duration>) -> Self {
        Self::Secondary { tag_sets, max_staleness }
    }

    pub fn primary_preferred(tag_sets: Vec<TagSet>, max_staleness: Option<Duration>) -> Self {
        Self::PrimaryPreferred { tag_sets, max_staleness }
    }

    pub fn secondary_preferred(tag_sets: Vec<TagSet>, max_staleness: Option<Duration>) -> Self {
        Self::SecondaryPreferred { tag_sets, max_staleness }
    }

    pub fn nearest(tag_sets: Vec<TagSet>, max_staleness: Option<Duration>) -> Self {
        Self::Nearest { tag_sets, max_staleness }
    }

    pub(crate) fn mode_name(&self) -> &'static str {
        match self {
            Self::Primary => "primary",
            Self::Secondary { .. } => "secondary",
            Self::PrimaryPreferred { .. } => "primaryPreferred",
            Self::SecondaryPreferred { .. } => "secondaryPreferred",
            Self::Nearest { .. } => "nearest",
        }
    }

    pub(crate) fn tag_sets(&self) -> &[TagSet] {
        match self {
            Self::Primary => &[],
            Self::Secondary { tag_sets, .. }
            | Self::PrimaryPreferred { tag_sets, .. }
            | Self::SecondaryPreferred { tag_sets, .. }
            | Self::Nearest { tag_sets, .. } => tag_sets,
        }
    }

    pub(crate) fn max_staleness(&self) -> Option<Duration> {
        match self {
            Self::Primary => None,
            Self::Secondary { max_staleness, .. }
            | Self::PrimaryPreferred { max_staleness, .. }
            | Self::SecondaryPreferred { max_staleness, .. }
            | Self::Nearest { max_staleness, .. } => *max_staleness,
        }
    }

    pub(crate) fn with_tags(self, tag_sets: Vec<TagSet>) -> Result<Self> {
        match self {
            Self::Primary => Err(Error::invalid_argument(
                "read preference tags can only be specified for a non-primary mode",
            )),
            Self::Secondary { max_staleness, .. } => Ok(Self::Secondary { tag_sets, max_staleness }),
            Self::PrimaryPreferred { max_staleness, .. } => {
                Ok(Self::PrimaryPreferred { tag_sets, max_staleness })
            }
            Self::SecondaryPreferred { max_staleness, .. } => {
                Ok(Self::SecondaryPreferred { tag_sets, max_staleness })
            }
            Self::Nearest { max_staleness, .. } => Ok(Self::Nearest { tag_sets, max_staleness }),
        }
    }
}

impl fmt::Display for ReadPreference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.mode_name())?;
        if let Some(staleness) = self.max_staleness() {
            write!(f, ", maxStalenessSeconds={}", staleness.as_secs())?;
        }
        Ok(())
    }
}

#[macro_export]
macro_rules! tag_set {
    ($($k:expr => $v:expr),* $(,)?) => {{
        #[allow(unused_mut)]
        let mut ts = ::std::collections::HashMap::new();
        $(ts.insert($k.to_string(), $v.to_string());)*
        ts
    }};
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn with_tags_rejects_primary_mode() {
        // Spec §4.3.1 step 7: `primary` mode can't carry tag sets. Enforced here, at construction
        // time, rather than re-checked on every selection.
        let err = ReadPreference::Primary.with_tags(vec![tag_set! {"dc" => "east"}]).unwrap_err();
        assert!(err.to_string().contains("non-primary"));
    }

    #[test]
    fn with_tags_attaches_to_a_non_primary_mode() {
        let rp = ReadPreference::secondary(vec![], None)
            .with_tags(vec![tag_set! {"dc" => "east"}])
            .unwrap();
        assert_eq!(rp.tag_sets(), &[tag_set! {"dc" => "east"}]);
    }
}
