//! The read-only view of a server's state handed to a user-supplied selector predicate.

use std::time::Duration;

use crate::{address::ServerAddress, selection_criteria::TagSet, sdam::description::server::{ServerDescription, ServerType}};

/// A read-only projection of a [`ServerDescription`], exposed to
/// [`crate::selection_criteria::Predicate`] callbacks so they can't observe or depend on fields
/// this crate doesn't consider part of its public surface (spec §4.3.1 step 5).
#[derive(Debug, Clone, Copy)]
pub struct ServerInfo<'a> {
    description: &'a ServerDescription,
}

impl<'a> ServerInfo<'a> {
    pub(crate) fn new(description: &'a ServerDescription) -> Self {
        Self { description }
    }

    pub fn address(&self) -> &ServerAddress {
        &self.description.address
    }

    pub fn server_type(&self) -> ServerType {
        self.description.server_type
    }

    pub fn tags(&self) -> &TagSet {
        &self.description.tags
    }

    pub fn average_round_trip_time(&self) -> Option<Duration> {
        self.description.average_round_trip_time
    }
}
