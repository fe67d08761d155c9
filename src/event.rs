//! Monitoring callbacks (spec §6 "Observability"): structured events for command execution and
//! SDAM transitions, handed to user-supplied handler trait objects rather than published through
//! a fixed wire format.
//!
//! By default these events are also mirrored through the `log` crate; enabling the
//! `tracing-unstable` feature additionally emits `tracing` events at the same call sites, mirroring
//! the teacher driver's `#[cfg(feature = "tracing-unstable")] mod trace;` dual log/tracing shim
//! without requiring every caller to pick one ahead of time.

use std::time::Duration;

use bson::Document;

use crate::{address::ServerAddress, error::Error, sdam::TopologyType};

/// Emits a `log` record, and, when compiled with `tracing-unstable`, a `tracing` event at the
/// same severity and with the same fields.
macro_rules! sdam_log {
    ($($arg:tt)*) => {
        log::debug!($($arg)*);
        #[cfg(feature = "tracing-unstable")]
        tracing::debug!($($arg)*);
    };
}
pub(crate) use sdam_log;

/// A command started on some [`crate::Link`].
#[derive(Debug, Clone)]
pub struct CommandStartedEvent {
    pub db_name: String,
    pub command_name: String,
    pub command: Document,
    pub address: ServerAddress,
}

/// A command completed successfully.
#[derive(Debug, Clone)]
pub struct CommandSucceededEvent {
    pub command_name: String,
    pub reply: Document,
    pub address: ServerAddress,
    pub duration: Duration,
}

/// A command failed, either with a network error or a server-reported one.
#[derive(Debug, Clone)]
pub struct CommandFailedEvent {
    pub command_name: String,
    pub failure: Error,
    pub address: ServerAddress,
    pub duration: Duration,
}

/// Receives command lifecycle events. Implemented by applications that want command-level
/// observability (APM integrations, structured logging sinks, ...).
pub trait CommandEventHandler: Send + Sync {
    fn handle_command_started_event(&self, _event: CommandStartedEvent) {}
    fn handle_command_succeeded_event(&self, _event: CommandSucceededEvent) {}
    fn handle_command_failed_event(&self, _event: CommandFailedEvent) {}
}

/// A monitor is about to issue a `hello`/`isMaster` heartbeat.
#[derive(Debug, Clone)]
pub struct ServerHeartbeatStartedEvent {
    pub address: ServerAddress,
}

/// A heartbeat completed successfully.
#[derive(Debug, Clone)]
pub struct ServerHeartbeatSucceededEvent {
    pub address: ServerAddress,
    pub duration: Duration,
}

/// A heartbeat failed; the server's description will be replaced with an `Unknown` one.
#[derive(Debug, Clone)]
pub struct ServerHeartbeatFailedEvent {
    pub address: ServerAddress,
    pub duration: Duration,
    pub failure: Error,
}

/// The topology's description changed, whether because of a heartbeat or dispatch feedback
/// (`markServerUnknown`).
#[derive(Debug, Clone)]
pub struct TopologyDescriptionChangedEvent {
    pub previous_type: TopologyType,
    pub new_type: TopologyType,
}

/// Receives SDAM lifecycle events.
pub trait SdamEventHandler: Send + Sync {
    fn handle_server_heartbeat_started_event(&self, _event: ServerHeartbeatStartedEvent) {}
    fn handle_server_heartbeat_succeeded_event(&self, _event: ServerHeartbeatSucceededEvent) {}
    fn handle_server_heartbeat_failed_event(&self, _event: ServerHeartbeatFailedEvent) {}
    fn handle_topology_description_changed_event(&self, _event: TopologyDescriptionChangedEvent) {}
}
