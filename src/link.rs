//! One physical connection to one server (spec §4.1 "Link").
//!
//! Wire-protocol framing and the authentication handshake are out of this crate's scope (spec
//! §1); [`Transport`] is the seam a real driver would fill with an `OP_MSG`/`OP_QUERY` codec and
//! SCRAM/X.509 handshake, the way [`crate::address::ServerAddress`] already stands in for a
//! resolved DNS name. This crate only needs the contract: send a command, get a reply, know when
//! the link has gone bad.

use std::{
    future::Future,
    pin::Pin,
    time::{Duration, Instant},
};

use bson::Document;

use crate::{address::ServerAddress, error::Result, sdam::HelloCommandResponse};

/// A boxed, `Send` future, used in place of `async fn` in traits since this crate (following the
/// teacher) does not depend on `async-trait`.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// The wire-level capabilities a [`Link`] learned about its server during the handshake (spec §3
/// "Link ... supports flags derived from the server's handshake").
#[derive(Debug, Clone, Copy, Default)]
pub struct LinkCapabilities {
    pub min_wire_version: i32,
    pub max_wire_version: i32,
    pub supports_retry_writes: bool,
    pub supports_sessions: bool,
}

impl LinkCapabilities {
    pub(crate) fn from_hello(reply: &HelloCommandResponse) -> Self {
        Self {
            min_wire_version: reply.min_wire_version.unwrap_or(0),
            max_wire_version: reply.max_wire_version.unwrap_or(0),
            // Retryable writes require a data-bearing member with a logical session timeout, per
            // the retryable writes spec; a standalone mongod never advertises one, so this also
            // naturally excludes the single-node-no-replication case (spec §4.4.1).
            supports_retry_writes: reply.logical_session_timeout_minutes.is_some() && reply.set_name.is_some()
                || reply.msg.as_deref() == Some("isdbgrid"),
            supports_sessions: reply.logical_session_timeout_minutes.is_some(),
        }
    }
}

/// A transport able to carry one command round-trip to a server. Implemented by the (out-of-scope)
/// wire-protocol layer in a real deployment, and by an in-memory stub in this crate's tests.
pub trait Transport: Send + Sync {
    fn send_command<'a>(&'a mut self, db_name: &'a str, command: Document) -> BoxFuture<'a, Result<Document>>;
}

/// Opens new [`Link`]s. The only collaborator this crate needs from the connection-establishment
/// layer (spec §1's "wire-protocol framing and authentication handshakes" are the out-of-scope
/// part; this trait is the in-scope seam).
pub trait LinkFactory: Send + Sync {
    fn connect<'a>(&'a self, address: &'a ServerAddress, connect_timeout: Duration) -> BoxFuture<'a, Result<Link>>;
}

/// One validated, authenticated socket to one server (spec §3, §4.1).
///
/// Owned exclusively by the [`crate::sdam::Topology`]'s per-address link slot, and borrowed by at
/// most one in-flight operation at a time.
pub struct Link {
    address: ServerAddress,
    transport: Box<dyn Transport>,
    capabilities: LinkCapabilities,
    last_used: Instant,
}

impl Link {
    pub fn new(address: ServerAddress, transport: Box<dyn Transport>, capabilities: LinkCapabilities) -> Self {
        Self {
            address,
            transport,
            capabilities,
            last_used: Instant::now(),
        }
    }

    pub fn address(&self) -> &ServerAddress {
        &self.address
    }

    pub fn capabilities(&self) -> LinkCapabilities {
        self.capabilities
    }

    /// Whether this link has been idle longer than `socket_check_interval` and must be validated
    /// with a lightweight `isMaster` before reuse (spec §4.1).
    pub(crate) fn needs_revalidation(&self, socket_check_interval: Duration) -> bool {
        self.last_used.elapsed() >= socket_check_interval
    }

    /// Sends one command and returns its raw reply. Fails with a network error on socket
    /// errors/timeouts (spec §4.1); the caller (the [`crate::dispatcher::Dispatcher`]) interprets
    /// the result against the SDAM and retry rules.
    pub async fn send_command(&mut self, db_name: &str, command: Document) -> Result<Document> {
        let reply = self.transport.send_command(db_name, command).await?;
        self.last_used = Instant::now();
        Ok(reply)
    }

    /// A cheap `isMaster` used both by monitors (spec §4.2) and to revalidate an idle link before
    /// handing it to an operation (spec §4.1).
    pub(crate) async fn ping(&mut self) -> Result<Document> {
        self.send_command("admin", bson::doc! { "isMaster": 1 }).await
    }
}

impl std::fmt::Debug for Link {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Link")
            .field("address", &self.address)
            .field("capabilities", &self.capabilities)
            .finish()
    }
}


#[cfg(test)]
mod test {
    use super::*;
    use bson::doc;

    #[tokio::test]
    async fn send_command_refreshes_last_used() {
        let mut link = test_support::link_with_replies(
            ServerAddress::new("h1", None),
            vec![Ok(doc! { "ok": 1.0 })],
            LinkCapabilities::default(),
        );
        assert!(!link.needs_revalidation(Duration::from_secs(3600)));
        let reply = link.send_command("test", doc! { "ping": 1 }).await.unwrap();
        assert_eq!(reply.get_f64("ok"), Ok(1.0));
    }

    #[test]
    fn idle_past_check_interval_needs_revalidation() {
        let mut link = test_support::link_with_replies(ServerAddress::new("h1", None), vec![], LinkCapabilities::default());
        link.last_used = Instant::now() - Duration::from_secs(60);
        assert!(link.needs_revalidation(Duration::from_secs(1)));
    }
}
