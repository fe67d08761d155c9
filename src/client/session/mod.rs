//! Client sessions: the handle applications use to get causal consistency, retryable writes,
//! and transaction state out of a sequence of operations (spec §5).

pub(crate) mod cluster_time;
pub(crate) mod pool;

use std::sync::{
    atomic::{AtomicBool, AtomicI64, Ordering},
    Arc, Mutex,
};

use bson::Document;

pub use cluster_time::ClusterTime;
use pool::{ServerSession, ServerSessionPool};

use crate::{
    address::ServerAddress,
    concern::WriteConcern,
    error::{ErrorKind, Result},
    selection_criteria::SelectionCriteria,
};

/// Options for a multi-statement transaction, set on [`crate::client::Client::start_transaction`]
/// and consulted by every operation attached to the session until it commits or aborts (spec §3
/// `Session`, spec §6 scenario S6).
#[derive(Clone, Debug, Default)]
pub struct TransactionOptions {
    pub read_concern: Option<crate::concern::ReadConcern>,
    pub write_concern: Option<WriteConcern>,
    /// Overrides the session's read preference for the lifetime of the transaction; the
    /// dispatcher substitutes this for `op.read_preference` on every `sendReadOp` call (spec §4.4).
    pub selection_criteria: Option<SelectionCriteria>,
    pub max_commit_time: Option<std::time::Duration>,
}

/// What, if anything, committing or aborting a transaction should send to the server.
pub(crate) enum TransactionCompletion {
    /// No statement was ever sent under this transaction; nothing to tell the server.
    NoOp,
    Send(Option<WriteConcern>),
}

/// Where a [`ClientSession`] stands with respect to a multi-statement transaction (spec §3
/// `Session.txnState`).
#[derive(Debug, Clone, Copy, Eq, PartialEq, Default)]
pub enum TransactionState {
    #[default]
    None,
    Starting,
    InProgress,
    Committed,
    Aborted,
}

impl TransactionState {
    fn is_active(self) -> bool {
        matches!(self, Self::Starting | Self::InProgress)
    }
}

/// A logical session, scoping a sequence of operations so they share causal-consistency,
/// retryable-write, and transaction guarantees (spec §5.1).
///
/// Dropping a `ClientSession` returns its underlying server session to the pool it came from
/// (spec §5.2), unless the session was marked dirty by a network or "not master" error.
///
/// Mutable session state lives behind atomics/mutexes rather than `&mut self` because the
/// [`crate::dispatcher::Dispatcher`] only ever borrows a session immutably — a single session must
/// not be used concurrently by the caller (spec §5 "Ordering guarantees"), but the dispatcher's own
/// bookkeeping (advancing cluster time, bumping the transaction number) happens through a shared
/// reference alongside the user's.
pub struct ClientSession {
    server_session: Option<ServerSession>,
    pool: Arc<ServerSessionPool>,
    cluster_time: Mutex<Option<ClusterTime>>,
    operation_time: Mutex<Option<bson::Timestamp>>,
    txn_number: AtomicI64,
    txn_state: Mutex<TransactionState>,
    has_txn_ops: AtomicBool,
    pinned_address: Mutex<Option<ServerAddress>>,
    transaction_read_preference: Mutex<Option<crate::selection_criteria::SelectionCriteria>>,
    transaction_options: Mutex<Option<TransactionOptions>>,
    dirty: AtomicBool,
}

impl ClientSession {
    pub(crate) fn new(pool: Arc<ServerSessionPool>, logical_session_timeout_minutes: Option<i64>) -> Self {
        Self {
            server_session: Some(pool.check_out(logical_session_timeout_minutes)),
            pool,
            cluster_time: Mutex::new(None),
            operation_time: Mutex::new(None),
            txn_number: AtomicI64::new(0),
            txn_state: Mutex::new(TransactionState::None),
            has_txn_ops: AtomicBool::new(false),
            pinned_address: Mutex::new(None),
            transaction_read_preference: Mutex::new(None),
            transaction_options: Mutex::new(None),
            dirty: AtomicBool::new(false),
        }
    }

    /// The `lsid` document to attach to outgoing commands (spec §4.5).
    pub(crate) fn id(&self) -> &Document {
        &self.server_session.as_ref().expect("session not yet dropped").id
    }

    /// Allocates the next transaction number for a retryable write (spec §4.4.1): each logical
    /// write gets its own, monotonically increasing, and a retry reuses the same number so the
    /// server can recognize and dedupe it.
    pub(crate) fn next_txn_number(&self) -> i64 {
        self.txn_number.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// The transaction number an in-flight operation should attach, without allocating a new one
    /// (spec §4.6 step 2).
    pub(crate) fn current_txn_number(&self) -> i64 {
        self.txn_number.load(Ordering::SeqCst)
    }

    pub fn cluster_time(&self) -> Option<ClusterTime> {
        self.cluster_time.lock().unwrap().clone()
    }

    pub(crate) fn advance_cluster_time(&self, new: Option<ClusterTime>) {
        cluster_time::advance(&mut self.cluster_time.lock().unwrap(), new);
    }

    pub(crate) fn advance_operation_time(&self, new: bson::Timestamp) {
        let mut current = self.operation_time.lock().unwrap();
        *current = Some(current.map_or(new, |cur| cur.max(new)));
    }

    pub fn operation_time(&self) -> Option<bson::Timestamp> {
        *self.operation_time.lock().unwrap()
    }

    /// Marks this session's underlying server session dirty: it was last used on a connection
    /// that ended uncleanly, so it must be discarded rather than pooled (spec §5.2, §7
    /// "Propagation policy").
    pub(crate) fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::SeqCst);
    }

    pub(crate) fn txn_state(&self) -> TransactionState {
        *self.txn_state.lock().unwrap()
    }

    pub(crate) fn set_txn_state(&self, state: TransactionState) {
        *self.txn_state.lock().unwrap() = state;
    }

    pub(crate) fn in_active_transaction(&self) -> bool {
        self.txn_state().is_active()
    }

    pub(crate) fn mark_has_txn_ops(&self) {
        self.has_txn_ops.store(true, Ordering::SeqCst);
    }

    pub fn has_txn_ops(&self) -> bool {
        self.has_txn_ops.load(Ordering::SeqCst)
    }

    pub(crate) fn pinned_address(&self) -> Option<ServerAddress> {
        self.pinned_address.lock().unwrap().clone()
    }

    pub(crate) fn pin_to(&self, address: ServerAddress) {
        *self.pinned_address.lock().unwrap() = Some(address);
    }

    pub(crate) fn unpin(&self) {
        *self.pinned_address.lock().unwrap() = None;
    }

    /// The read preference a transaction pins reads to for its duration (spec §4.4 "sendReadOp"
    /// overrides `op.readPreference` while in an active transaction).
    pub(crate) fn transaction_read_preference(&self) -> Option<crate::selection_criteria::SelectionCriteria> {
        self.transaction_read_preference.lock().unwrap().clone()
    }

    pub(crate) fn set_transaction_read_preference(&self, criteria: Option<crate::selection_criteria::SelectionCriteria>) {
        *self.transaction_read_preference.lock().unwrap() = criteria;
    }

    pub(crate) fn transaction_options(&self) -> Option<TransactionOptions> {
        self.transaction_options.lock().unwrap().clone()
    }

    fn set_transaction_options(&self, options: Option<TransactionOptions>) {
        *self.transaction_options.lock().unwrap() = options;
    }

    /// Spec §6 `Client.startTransaction`: validates no transaction is already active, bumps the
    /// transaction number, and moves the session into `Starting`. Unpinning on a previous
    /// `Committed` transaction mirrors the rule that a mongos pin only outlives one transaction
    /// (spec §3 `pinnedAddress`).
    pub(crate) fn begin_transaction(&self, options: Option<TransactionOptions>) -> Result<()> {
        match self.txn_state() {
            TransactionState::Starting | TransactionState::InProgress => {
                return Err(ErrorKind::Transaction {
                    message: "transaction already in progress".to_string(),
                }
                .into());
            }
            TransactionState::Committed => self.unpin(),
            _ => {}
        }
        if let Some(write_concern) = options.as_ref().and_then(|o| o.write_concern.as_ref()) {
            if !write_concern.is_acknowledged() {
                return Err(ErrorKind::Transaction {
                    message: "transactions do not support unacknowledged write concerns".to_string(),
                }
                .into());
            }
        }
        self.next_txn_number();
        self.set_transaction_read_preference(options.as_ref().and_then(|o| o.selection_criteria.clone()));
        self.set_transaction_options(options);
        self.set_txn_state(TransactionState::Starting);
        Ok(())
    }

    /// Moves a `Starting` transaction to `InProgress` the moment its first statement is actually
    /// sent (spec §4.6); a transaction that never issues a statement stays `Starting` until
    /// committed or aborted, matching [`Self::commit_transaction_outcome`]'s no-op branch.
    pub(crate) fn mark_transaction_in_progress_if_starting(&self) {
        let mut state = self.txn_state.lock().unwrap();
        if *state == TransactionState::Starting {
            *state = TransactionState::InProgress;
        }
    }

    /// Resolves what, if anything, `Client::commit_transaction` must send to the server, and
    /// advances the transaction state accordingly (spec §6 `Client.commitTransaction`). A
    /// transaction that never issued a statement commits as a no-op; calling commit again after
    /// a failed attempt resends with the same transaction number, which is the documented way to
    /// retry a commit whose outcome is unknown.
    pub(crate) fn commit_transaction_outcome(&self) -> Result<TransactionCompletion> {
        match self.txn_state() {
            TransactionState::None => Err(ErrorKind::Transaction {
                message: "no transaction started".to_string(),
            }
            .into()),
            TransactionState::Aborted => Err(ErrorKind::Transaction {
                message: "cannot call commitTransaction after calling abortTransaction".to_string(),
            }
            .into()),
            TransactionState::Starting => {
                self.set_txn_state(TransactionState::Committed);
                Ok(TransactionCompletion::NoOp)
            }
            TransactionState::InProgress | TransactionState::Committed => {
                let write_concern = self.transaction_options().and_then(|o| o.write_concern);
                self.set_txn_state(TransactionState::Committed);
                Ok(TransactionCompletion::Send(write_concern))
            }
        }
    }

    /// Resolves what `Client::abort_transaction` must send, if anything (spec §6
    /// `Client.abortTransaction`). The result of the `abortTransaction` command itself is always
    /// ignored by the caller — aborting is a best-effort cleanup, not a fallible operation.
    pub(crate) fn abort_transaction_outcome(&self) -> Result<TransactionCompletion> {
        match self.txn_state() {
            TransactionState::None => Err(ErrorKind::Transaction {
                message: "no transaction started".to_string(),
            }
            .into()),
            TransactionState::Committed => Err(ErrorKind::Transaction {
                message: "cannot call abortTransaction after calling commitTransaction".to_string(),
            }
            .into()),
            TransactionState::Aborted => Err(ErrorKind::Transaction {
                message: "cannot call abortTransaction twice".to_string(),
            }
            .into()),
            TransactionState::Starting => {
                self.abort_and_reset();
                Ok(TransactionCompletion::NoOp)
            }
            TransactionState::InProgress => {
                let write_concern = self.transaction_options().and_then(|o| o.write_concern);
                self.abort_and_reset();
                Ok(TransactionCompletion::Send(write_concern))
            }
        }
    }

    fn abort_and_reset(&self) {
        self.set_txn_state(TransactionState::Aborted);
        self.set_transaction_options(None);
        self.set_transaction_read_preference(None);
        self.unpin();
    }

    /// Spec §4.4.3 `_maybeUpdateSessionState`: called by the dispatcher before every dispatch
    /// entry point.
    pub(crate) fn maybe_update_session_state(&self) {
        if self.in_active_transaction() {
            self.mark_has_txn_ops();
        } else {
            self.set_txn_state(TransactionState::None);
            // A transaction's mongos pin (spec §3 `pinnedAddress`) only outlives the
            // transaction itself; once we're no longer in one, release it.
            self.unpin();
        }
    }
}

impl Drop for ClientSession {
    fn drop(&mut self) {
        if let Some(session) = self.server_session.take() {
            self.pool.check_in(session, self.dirty.load(Ordering::SeqCst));
        }
    }
}

impl std::fmt::Debug for ClientSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientSession")
            .field("id", &self.id())
            .field("txn_number", &self.txn_number.load(Ordering::SeqCst))
            .field("txn_state", &self.txn_state())
            .finish()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn maybe_update_session_state_resets_outside_a_transaction() {
        let pool = Arc::new(ServerSessionPool::new());
        let session = ClientSession::new(pool, None);
        session.set_txn_state(TransactionState::Committed);
        session.maybe_update_session_state();
        assert_eq!(session.txn_state(), TransactionState::None);
    }

    #[test]
    fn maybe_update_session_state_marks_txn_ops_inside_a_transaction() {
        let pool = Arc::new(ServerSessionPool::new());
        let session = ClientSession::new(pool, None);
        session.set_txn_state(TransactionState::InProgress);
        session.maybe_update_session_state();
        assert!(session.has_txn_ops());
    }

    #[test]
    fn txn_number_increases_monotonically() {
        let pool = Arc::new(ServerSessionPool::new());
        let session = ClientSession::new(pool, None);
        assert_eq!(session.next_txn_number(), 1);
        assert_eq!(session.next_txn_number(), 2);
        assert_eq!(session.current_txn_number(), 2);
    }

    #[test]
    fn begin_transaction_bumps_txn_number_and_enters_starting() {
        let pool = Arc::new(ServerSessionPool::new());
        let session = ClientSession::new(pool, None);
        session.begin_transaction(None).unwrap();
        assert_eq!(session.txn_state(), TransactionState::Starting);
        assert_eq!(session.current_txn_number(), 1);
    }

    #[test]
    fn begin_transaction_rejects_a_second_start() {
        let pool = Arc::new(ServerSessionPool::new());
        let session = ClientSession::new(pool, None);
        session.begin_transaction(None).unwrap();
        assert!(session.begin_transaction(None).is_err());
    }

    #[test]
    fn begin_transaction_unpins_a_previously_committed_transaction() {
        let pool = Arc::new(ServerSessionPool::new());
        let session = ClientSession::new(pool, None);
        session.pin_to(ServerAddress::new("mongos1", None));
        session.set_txn_state(TransactionState::Committed);
        session.begin_transaction(None).unwrap();
        assert!(session.pinned_address().is_none());
    }

    #[test]
    fn begin_transaction_rejects_unacknowledged_write_concern() {
        let pool = Arc::new(ServerSessionPool::new());
        let session = ClientSession::new(pool, None);
        let options = TransactionOptions {
            write_concern: Some(WriteConcern {
                w: Some(crate::concern::Acknowledgment::Nodes(0)),
                ..Default::default()
            }),
            ..Default::default()
        };
        assert!(session.begin_transaction(Some(options)).is_err());
    }

    #[test]
    fn commit_outcome_on_starting_transaction_is_a_no_op() {
        let pool = Arc::new(ServerSessionPool::new());
        let session = ClientSession::new(pool, None);
        session.begin_transaction(None).unwrap();
        assert!(matches!(
            session.commit_transaction_outcome().unwrap(),
            TransactionCompletion::NoOp
        ));
        assert_eq!(session.txn_state(), TransactionState::Committed);
    }

    #[test]
    fn commit_outcome_without_a_transaction_is_an_error() {
        let pool = Arc::new(ServerSessionPool::new());
        let session = ClientSession::new(pool, None);
        assert!(session.commit_transaction_outcome().is_err());
    }

    #[test]
    fn abort_outcome_in_progress_sends_and_clears_the_pin() {
        let pool = Arc::new(ServerSessionPool::new());
        let session = ClientSession::new(pool, None);
        session.begin_transaction(None).unwrap();
        session.set_txn_state(TransactionState::InProgress);
        session.pin_to(ServerAddress::new("mongos1", None));
        assert!(matches!(
            session.abort_transaction_outcome().unwrap(),
            TransactionCompletion::Send(_)
        ));
        assert_eq!(session.txn_state(), TransactionState::Aborted);
        assert!(session.pinned_address().is_none());
    }

    #[test]
    fn abort_after_commit_is_an_error() {
        let pool = Arc::new(ServerSessionPool::new());
        let session = ClientSession::new(pool, None);
        session.begin_transaction(None).unwrap();
        session.commit_transaction_outcome().unwrap();
        assert!(session.abort_transaction_outcome().is_err());
    }
}
