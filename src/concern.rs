//! Read and write concern types attached to operations and sessions.

use std::time::Duration;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_with::skip_serializing_none;
use typed_builder::TypedBuilder;

use crate::error::{Error, Result};

/// Specifies the consistency and isolation properties of read operations.
///
/// See the [MongoDB docs](https://docs.mongodb.com/manual/reference/read-concern/) for details.
#[derive(Clone, Debug, PartialEq)]
pub enum ReadConcern {
    Local,
    Majority,
    Linearizable,
    Available,
    /// Forward-compatible escape hatch for levels this crate doesn't name explicitly.
    Custom(String),
}

impl ReadConcern {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Local => "local",
            Self::Majority => "majority",
            Self::Linearizable => "linearizable",
            Self::Available => "available",
            Self::Custom(s) => s,
        }
    }
}

impl Serialize for ReadConcern {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        bson::doc! { "level": self.as_str() }.serialize(serializer)
    }
}

/// Specifies the level of acknowledgement requested from the deployment for write operations.
///
/// See the [MongoDB docs](https://docs.mongodb.com/manual/reference/write-concern/) for details.
#[skip_serializing_none]
#[derive(Clone, Debug, Default, PartialEq, TypedBuilder, Serialize)]
pub struct WriteConcern {
    /// Requests acknowledgement from a specific number, or a tagged majority, of members.
    #[builder(default)]
    pub w: Option<Acknowledgment>,

    /// Time limit for write propagation; if it elapses, the server returns a write concern
    /// error without rolling back the write.
    #[builder(default)]
    #[serde(rename = "wtimeout", serialize_with = "serialize_duration_as_millis")]
    pub w_timeout: Option<Duration>,

    /// Requests acknowledgement that the write has been written to the on-disk journal.
    #[builder(default)]
    #[serde(rename = "j")]
    pub journal: Option<bool>,
}

impl WriteConcern {
    pub fn majority() -> Self {
        Self {
            w: Some(Acknowledgment::Majority),
            ..Default::default()
        }
    }

    /// Whether this write concern requests any acknowledgement at all. An explicit `w: 0` is the
    /// only unacknowledged form; this crate does not execute unacknowledged writes (spec §1 scopes
    /// the CRUD surface out, and an unacknowledged write has no result for the dispatcher to
    /// return).
    pub(crate) fn is_acknowledged(&self) -> bool {
        !matches!(self.w, Some(Acknowledgment::Nodes(0)))
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if let Some(Acknowledgment::Nodes(0)) = self.w {
            if self.journal == Some(true) {
                return Err(Error::invalid_argument(
                    "journal: true is incompatible with w: 0",
                ));
            }
        }
        Ok(())
    }
}

fn serialize_duration_as_millis<S: Serializer>(
    val: &Option<Duration>,
    serializer: S,
) -> std::result::Result<S::Ok, S::Error> {
    match val {
        Some(d) => serializer.serialize_i64(d.as_millis() as i64),
        None => serializer.serialize_none(),
    }
}

/// The "w" field of a [`WriteConcern`]: a number of nodes, the special `majority` tag, or a
/// user-defined tag set name.
#[derive(Clone, Debug, PartialEq)]
pub enum Acknowledgment {
    Nodes(u32),
    Majority,
    Custom(String),
}

impl Serialize for Acknowledgment {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            Self::Nodes(n) => serializer.serialize_u32(*n),
            Self::Majority => serializer.serialize_str("majority"),
            Self::Custom(s) => serializer.serialize_str(s),
        }
    }
}

impl<'de> Deserialize<'de> for Acknowledgment {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Int(u32),
            Str(String),
        }
        Ok(match Repr::deserialize(deserializer)? {
            Repr::Int(n) => Acknowledgment::Nodes(n),
            Repr::Str(s) if s == "majority" => Acknowledgment::Majority,
            Repr::Str(s) => Acknowledgment::Custom(s),
        })
    }
}

impl From<u32> for Acknowledgment {
    fn from(n: u32) -> Self {
        Acknowledgment::Nodes(n)
    }
}

impl From<String> for Acknowledgment {
    fn from(s: String) -> Self {
        if s == "majority" {
            Acknowledgment::Majority
        } else {
            Acknowledgment::Custom(s)
        }
    }
}

impl From<&str> for Acknowledgment {
    fn from(s: &str) -> Self {
        Acknowledgment::from(s.to_string())
    }
}
