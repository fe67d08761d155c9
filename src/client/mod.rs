//! The user-facing entry point: ties a [`crate::sdam::Topology`], a
//! [`crate::dispatcher::Dispatcher`], and a session pool together behind one cloneable handle
//! (spec §6 "Public core entry points").

pub mod options;
pub(crate) mod session;

use std::sync::Arc;

pub use session::ClusterTime;
pub use session::{ClientSession, TransactionOptions};
use session::pool::ServerSessionPool;
use session::TransactionCompletion;
use options::ClientOptions;

use bson::doc;

use crate::{
    address::ServerAddress,
    dispatcher::Dispatcher,
    error::{Error, Result},
    event::{CommandEventHandler, SdamEventHandler},
    link::LinkFactory,
    operation::{CommandResult, Operation},
    sdam::{Topology, TopologyStatus},
    selection_criteria::SelectionCriteria,
};

struct ClientInner {
    topology: Topology,
    dispatcher: Dispatcher,
    session_pool: Arc<ServerSessionPool>,
    command_event_handler: Option<Arc<dyn CommandEventHandler>>,
}

/// The driver's main entry point (spec §6). Cheaply `Clone`-able: every clone shares the same
/// topology, dispatcher, and session pool.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl Client {
    /// Spec §6 `connect(hostOrUri, options)`. `link_factory` is this crate's one unavoidable seam
    /// into the out-of-scope wire-protocol/authentication layer (spec §1) — a real deployment
    /// supplies one backed by an `OP_MSG` codec and SCRAM/X.509 handshake.
    pub fn connect(uri: impl AsRef<str>, link_factory: Arc<dyn LinkFactory>) -> Result<Self> {
        let options = ClientOptions::parse(uri)?;
        Self::with_options(options, link_factory, None, None)
    }

    /// Like [`Self::connect`], but takes an already-built [`ClientOptions`] and optional event
    /// handlers (spec §6 "Observability") instead of parsing a URI.
    pub fn with_options(
        options: ClientOptions,
        link_factory: Arc<dyn LinkFactory>,
        sdam_event_handler: Option<Arc<dyn SdamEventHandler>>,
        command_event_handler: Option<Arc<dyn CommandEventHandler>>,
    ) -> Result<Self> {
        let retry_reads = options.retry_reads;
        let retry_writes = options.retry_writes;
        let default_max_time = options.default_max_time;
        let default_write_concern = options.write_concern.clone();
        let topology = Topology::new(options, link_factory, sdam_event_handler);
        let dispatcher = Dispatcher::with_defaults(
            topology.clone(),
            retry_reads,
            retry_writes,
            default_max_time,
            default_write_concern,
            command_event_handler.clone(),
        );
        Ok(Self {
            inner: Arc::new(ClientInner {
                topology,
                dispatcher,
                session_pool: Arc::new(ServerSessionPool::new()),
                command_event_handler,
            }),
        })
    }

    /// Spec §6 `Client.startSession(opts)`. Fails with [`crate::error::ErrorKind::SessionsNotSupported`]
    /// if no currently-known server advertises `logicalSessionTimeoutMinutes`.
    pub fn start_session(&self) -> Result<ClientSession> {
        let timeout = self.inner.topology.logical_session_timeout_minutes();
        if timeout.is_none() && self.inner.topology.description().has_readable_server() {
            return Err(Error::from(crate::error::ErrorKind::SessionsNotSupported));
        }
        Ok(ClientSession::new(self.inner.session_pool.clone(), timeout))
    }

    /// Spec §6 `Client.topologyStatus(refresh?)`.
    pub async fn topology_status(&self, refresh: bool) -> TopologyStatus {
        if refresh {
            self.inner.topology.scan_all_servers(false).await;
        }
        self.inner.topology.status()
    }

    /// Spec §6 `Client.disconnect()`.
    pub async fn disconnect(&self) {
        self.inner.topology.close().await;
    }

    /// Spec §6 `Client.reconnect()`: reopens monitoring and resets the session pool so a
    /// post-fork child process never reuses a parent's session ids or sockets (spec §5
    /// "Fork/thread safety").
    pub fn reconnect(&self) {
        self.inner.topology.reconnect();
        self.inner.session_pool.reset();
    }

    /// Spec §6 `Client.startTransaction(session, opts?)`, spec §6 scenario S6. The session must be
    /// passed into every operation meant to run inside the transaction; this crate has no implicit
    /// session-to-operation association (spec §1 Non-goals scope out a CRUD surface that could
    /// infer it).
    pub fn start_transaction(&self, session: &ClientSession, options: Option<TransactionOptions>) -> Result<()> {
        session.begin_transaction(options)
    }

    /// Spec §6 `Client.commitTransaction(session)`. A transaction that never issued a statement
    /// commits as a no-op; otherwise sends `commitTransaction` against the `admin` database,
    /// reusing the transaction's own transaction number rather than allocating a new one.
    pub async fn commit_transaction(&self, session: &ClientSession) -> Result<()> {
        // Captured before the outcome resolves so a sharded transaction's mongos pin (spec §3
        // `pinnedAddress`) is honored even though committing is the operation that releases it.
        let pinned = session.pinned_address();
        match session.commit_transaction_outcome()? {
            TransactionCompletion::NoOp => Ok(()),
            TransactionCompletion::Send(write_concern) => {
                let mut op = Operation::write("admin", doc! { "commitTransaction": 1 });
                op.retryable_write = true;
                op.write_concern = write_concern;
                match pinned {
                    Some(address) => self.inner.dispatcher.send_direct_op(&op, &address, Some(session)).await.map(|_| ()),
                    None => self.inner.dispatcher.send_write_op(&op, Some(session)).await.map(|_| ()),
                }
            }
        }
    }

    /// Spec §6 `Client.abortTransaction(session)`. Errors from the `abortTransaction` command
    /// itself are swallowed — aborting is best-effort cleanup, and the session is unpinned and
    /// reset regardless of whether the server round-trip succeeds.
    pub async fn abort_transaction(&self, session: &ClientSession) -> Result<()> {
        let pinned = session.pinned_address();
        match session.abort_transaction_outcome()? {
            TransactionCompletion::NoOp => Ok(()),
            TransactionCompletion::Send(write_concern) => {
                let mut op = Operation::write("admin", doc! { "abortTransaction": 1 });
                op.retryable_write = true;
                op.write_concern = write_concern;
                let _ = match pinned {
                    Some(address) => self.inner.dispatcher.send_direct_op(&op, &address, Some(session)).await,
                    None => self.inner.dispatcher.send_write_op(&op, Some(session)).await,
                };
                Ok(())
            }
        }
    }

    pub async fn send_direct_op(
        &self,
        op: &Operation,
        address: &ServerAddress,
        session: Option<&ClientSession>,
    ) -> Result<CommandResult> {
        self.inner.dispatcher.send_direct_op(op, address, session).await
    }

    pub async fn send_write_op(&self, op: &Operation, session: Option<&ClientSession>) -> Result<CommandResult> {
        self.inner.dispatcher.send_write_op(op, session).await
    }

    /// Spec §6 `sendPrimaryOp`: identical to [`Self::send_write_op`] (spec §4.4 notes they share
    /// one implementation).
    pub async fn send_primary_op(&self, op: &Operation, session: Option<&ClientSession>) -> Result<CommandResult> {
        self.inner.dispatcher.send_write_op(op, session).await
    }

    pub async fn send_read_op(&self, op: &Operation, session: Option<&ClientSession>) -> Result<CommandResult> {
        self.inner.dispatcher.send_read_op(op, session).await
    }

    pub async fn send_retryable_write_op(
        &self,
        op: &mut Operation,
        force: bool,
        session: Option<&ClientSession>,
    ) -> Result<CommandResult> {
        self.inner.dispatcher.send_retryable_write_op(op, force, session).await
    }

    pub async fn send_retryable_read_op(
        &self,
        op: &Operation,
        criteria: &SelectionCriteria,
        session: Option<&ClientSession>,
    ) -> Result<CommandResult> {
        self.inner.dispatcher.send_retryable_read_op(op, criteria, session).await
    }

    /// The handler every dispatched command's started/succeeded/failed events are sent to, if one
    /// was supplied (spec §6 "Observability"). Exposed so an out-of-scope CRUD surface can inspect
    /// which handler is wired up without holding its own copy.
    pub fn command_event_handler(&self) -> Option<&Arc<dyn CommandEventHandler>> {
        self.inner.command_event_handler.as_ref()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::link::test_support::NeverConnects;
    use std::time::Duration;

    fn client() -> Client {
        let options = ClientOptions::builder()
            .hosts(vec![ServerAddress::new("h1", None)])
            .server_selection_timeout(Duration::from_millis(200))
            .build();
        Client::with_options(options, Arc::new(NeverConnects), None, None).unwrap()
    }

    #[test]
    fn start_session_fails_before_any_server_is_known_to_support_sessions() {
        // With no server descriptions yet (Unknown topology), `has_readable_server` is false, so
        // the absent logical session timeout isn't yet treated as authoritative.
        let c = client();
        assert!(c.start_session().is_ok());
    }

    #[tokio::test]
    async fn committing_a_transaction_with_no_statements_is_a_no_op() {
        let c = client();
        let session = c.start_session().unwrap();
        c.start_transaction(&session, None).unwrap();
        // No statement was ever run against the session, so commit must not touch the network.
        c.commit_transaction(&session).await.unwrap();
    }

    #[tokio::test]
    async fn aborting_a_transaction_with_no_statements_is_a_no_op() {
        let c = client();
        let session = c.start_session().unwrap();
        c.start_transaction(&session, None).unwrap();
        c.abort_transaction(&session).await.unwrap();
    }
}
