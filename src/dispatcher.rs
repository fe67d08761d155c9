//! Dispatch policy (spec §4.4): link acquisition, error-driven topology cleanup, and the
//! retryable-read/retryable-write retry-once rules.

use std::{sync::Arc, time::Instant};

use crate::{
    address::ServerAddress,
    client::session::{ClientSession, TransactionState},
    concern::WriteConcern,
    error::{Error, Result},
    event::{CommandEventHandler, CommandFailedEvent, CommandStartedEvent, CommandSucceededEvent},
    operation::{CommandResult, Operation},
    sdam::Topology,
    selection_criteria::SelectionCriteria,
};

/// Applies the dispatch policy on top of a [`Topology`]: every public method here corresponds to
/// one of spec §4.4's entry points.
pub struct Dispatcher {
    topology: Topology,
    retry_reads: bool,
    retry_writes: bool,
    default_max_time: Option<std::time::Duration>,
    default_write_concern: Option<WriteConcern>,
    command_event_handler: Option<Arc<dyn CommandEventHandler>>,
}

impl Dispatcher {
    pub fn new(topology: Topology, retry_reads: bool, retry_writes: bool) -> Self {
        Self::with_defaults(topology, retry_reads, retry_writes, None, None, None)
    }

    pub fn with_default_max_time(
        topology: Topology,
        retry_reads: bool,
        retry_writes: bool,
        default_max_time: Option<std::time::Duration>,
    ) -> Self {
        Self::with_defaults(topology, retry_reads, retry_writes, default_max_time, None, None)
    }

    pub fn with_defaults(
        topology: Topology,
        retry_reads: bool,
        retry_writes: bool,
        default_max_time: Option<std::time::Duration>,
        default_write_concern: Option<WriteConcern>,
        command_event_handler: Option<Arc<dyn CommandEventHandler>>,
    ) -> Self {
        Self {
            topology,
            retry_reads,
            retry_writes,
            default_max_time,
            default_write_concern,
            command_event_handler,
        }
    }

    fn maybe_update_session_state(session: Option<&ClientSession>) {
        if let Some(session) = session {
            session.maybe_update_session_state();
        }
    }

    /// Seeds the session's `$clusterTime` with whatever this client has already gossiped from
    /// other operations/sessions before attaching it to an outgoing command (spec §4.3
    /// "updateClusterTime/clusterTime", spec §5 "`$clusterTime` is gossiped monotonically — the
    /// topology always keeps the maximum observed").
    fn ingest_cluster_time_from_topology(&self, session: Option<&ClientSession>) {
        if let Some(session) = session {
            session.advance_cluster_time(self.topology.cluster_time());
        }
    }

    /// Folds a successful reply's `$clusterTime` back into the topology-wide gossip value so
    /// later operations, even on other sessions, observe it (spec §4.3, §7 property 7 "cluster
    /// time monotonicity").
    fn publish_cluster_time(&self, result: &Result<CommandResult>) {
        if let Ok(result) = result {
            self.topology.update_cluster_time(result.cluster_time.clone());
        }
    }

    /// Replaces the failed server's description with `Unknown`, and for any error in the "not
    /// master"/"node is recovering" family also marks the whole topology stale so every monitor
    /// rechecks immediately (spec §7 "NotMasterError ... always invalidates the target's
    /// ServerDescription and marks topology stale", spec §4.4 "same error cleanup as direct").
    /// Also dirties the session, if any, so its record is discarded rather than pooled.
    fn clean_up_after_error(&self, address: &ServerAddress, error: &Error, session: Option<&ClientSession>) {
        if error.is_state_change_error() {
            self.topology.mark_server_unknown(address, error.clone());
        }
        if error.is_not_master() || error.is_node_is_recovering() {
            self.topology.mark_stale();
        }
        if let Some(session) = session {
            if error.is_state_change_error() {
                session.mark_dirty();
            }
        }
    }

    /// Runs `op` on `link`, emitting command-monitoring events around the attempt (spec §6
    /// "Observability" — `monitoringCallback` receives "command started/succeeded/failed").
    async fn execute_on(
        &self,
        op: &Operation,
        link: &mut crate::link::Link,
        session: Option<&ClientSession>,
    ) -> Result<CommandResult> {
        let address = link.address().clone();
        let command_name = op.command_name();
        if let Some(handler) = &self.command_event_handler {
            handler.handle_command_started_event(CommandStartedEvent {
                db_name: op.db_name.clone(),
                command_name: command_name.clone(),
                command: op.command_doc.clone(),
                address: address.clone(),
            });
        }

        let start = Instant::now();
        let result = op
            .execute(link, session, self.topology.topology_type(), self.default_max_time, self.default_write_concern.as_ref())
            .await;
        let duration = start.elapsed();

        if let Some(handler) = &self.command_event_handler {
            match &result {
                Ok(ok) => handler.handle_command_succeeded_event(CommandSucceededEvent {
                    command_name,
                    reply: ok.reply.clone(),
                    address,
                    duration,
                }),
                Err(err) => handler.handle_command_failed_event(CommandFailedEvent {
                    command_name,
                    failure: err.clone(),
                    address,
                    duration,
                }),
            }
        }

        result
    }

    /// Spec §4.4 `sendDirectOp`: no server selection, no retries.
    pub async fn send_direct_op(
        &self,
        op: &Operation,
        address: &ServerAddress,
        session: Option<&ClientSession>,
    ) -> Result<CommandResult> {
        Self::maybe_update_session_state(session);
        self.ingest_cluster_time_from_topology(session);
        let mut link = self.topology.get_specific_link(address).await?;
        let result = self.execute_on(op, &mut link, session).await;
        match &result {
            Ok(_) => self.topology.checkin_link(link).await,
            Err(e) => self.clean_up_after_error(address, e, session),
        }
        self.publish_cluster_time(&result);
        result
    }

    /// Spec §4.4 `sendWriteOp`/`sendPrimaryOp`: identical, non-retrying, selects a writable link.
    /// A session pinned to a mongos for the duration of a sharded transaction (spec §3
    /// `pinnedAddress`) reuses that same link rather than reselecting.
    pub async fn send_write_op(&self, op: &Operation, session: Option<&ClientSession>) -> Result<CommandResult> {
        Self::maybe_update_session_state(session);
        self.ingest_cluster_time_from_topology(session);
        let link = match session.and_then(|s| s.pinned_address()) {
            Some(pinned) => self.topology.get_specific_link(&pinned).await?,
            None => {
                let link = self.topology.get_writable_link().await?;
                self.maybe_pin_to_mongos(session, link.address());
                link
            }
        };
        self.execute_once_on(op, link, session).await
    }

    /// Spec §4.4 `sendReadOp`: a session mid-transaction pins the read preference used for
    /// selection, overriding whatever the caller set on `op` (spec §6 scenario S6), and — on a
    /// sharded deployment — pins the link itself so every statement in the transaction lands on
    /// the same mongos.
    pub async fn send_read_op(&self, op: &Operation, session: Option<&ClientSession>) -> Result<CommandResult> {
        Self::maybe_update_session_state(session);
        self.ingest_cluster_time_from_topology(session);
        let link = match session.and_then(|s| s.pinned_address()) {
            Some(pinned) => self.topology.get_specific_link(&pinned).await?,
            None => {
                let criteria = match session.and_then(|s| s.transaction_read_preference()) {
                    Some(pinned) => pinned,
                    None => op.read_preference.clone(),
                };
                let link = self.topology.get_readable_link(&criteria).await?;
                self.maybe_pin_to_mongos(session, link.address());
                link
            }
        };
        self.execute_once_on(op, link, session).await
    }

    /// Spec §3 `pinnedAddress`: once a transaction's first statement lands on a mongos, every
    /// later statement in that transaction must reuse it (a sharded cluster routes transaction
    /// statements to the shard coordinator chosen for the first one).
    fn maybe_pin_to_mongos(&self, session: Option<&ClientSession>, address: &ServerAddress) {
        if let Some(session) = session {
            if self.topology.topology_type() == crate::sdam::TopologyType::Sharded && session.in_active_transaction() {
                session.pin_to(address.clone());
            }
        }
    }

    async fn execute_once_on(
        &self,
        op: &Operation,
        mut link: crate::link::Link,
        session: Option<&ClientSession>,
    ) -> Result<CommandResult> {
        let address = link.address().clone();
        let result = self.execute_on(op, &mut link, session).await;
        self.publish_cluster_time(&result);
        match &result {
            Ok(_) => self.topology.checkin_link(link).await,
            Err(e) => self.clean_up_after_error(&address, e, session),
        }
        result
    }

    /// Spec §4.4.1 retryable write policy.
    pub async fn send_retryable_write_op(
        &self,
        op: &mut Operation,
        force: bool,
        session: Option<&ClientSession>,
    ) -> Result<CommandResult> {
        Self::maybe_update_session_state(session);
        self.ingest_cluster_time_from_topology(session);

        let link = self.topology.get_writable_link().await?;
        let caps = link.capabilities();

        let eligible_session_state = session
            .map(|s| !matches!(s.txn_state(), TransactionState::Starting | TransactionState::InProgress))
            .unwrap_or(true);
        let retry_eligible =
            (force || self.retry_writes) && caps.supports_retry_writes && session.is_some() && eligible_session_state;

        if !retry_eligible {
            return self.execute_once_on(op, link, session).await;
        }

        // Steps 1-3: bump the transaction number, mark the op retryable, attempt on the already
        // selected link.
        let session_ref = session.expect("retry_eligible implies session.is_some()");
        session_ref.next_txn_number();
        op.retryable_write = true;

        let address = link.address().clone();
        let mut link = link;
        let first_result = self.execute_on(op, &mut link, session).await;
        self.publish_cluster_time(&first_result);
        let first_error = match first_result {
            Ok(ok) => {
                self.topology.checkin_link(link).await;
                return Ok(ok);
            }
            Err(e) => e,
        };
        self.clean_up_after_error(&address, &first_error, session);

        // Step 4: only the retryable-writes label makes a first error eligible for retry.
        if !first_error.is_retryable_write() {
            return Err(first_error);
        }

        // Step 5: a fresh writable link may land on a different (now-primary) server.
        let retry_link = match self.topology.get_writable_link().await {
            Ok(link) => link,
            Err(_) => return Err(first_error),
        };
        if !retry_link.capabilities().supports_retry_writes {
            return Err(first_error);
        }

        // Step 6: exactly one more attempt; its own network/not-master error wins, anything else
        // loses to the original.
        let retry_address = retry_link.address().clone();
        let mut retry_link = retry_link;
        let second_result = self.execute_on(op, &mut retry_link, session).await;
        self.publish_cluster_time(&second_result);
        match second_result {
            Ok(ok) => {
                self.topology.checkin_link(retry_link).await;
                Ok(ok)
            }
            Err(second_error) => {
                self.clean_up_after_error(&retry_address, &second_error, session);
                if second_error.is_network_error() || second_error.is_not_master() {
                    Err(second_error)
                } else {
                    Err(first_error)
                }
            }
        }
    }

    /// Spec §4.4.2 retryable read policy: like the write path but without a transaction-number
    /// increment, and driven by `retry_reads` rather than a per-call `force` flag.
    pub async fn send_retryable_read_op(
        &self,
        op: &Operation,
        criteria: &SelectionCriteria,
        session: Option<&ClientSession>,
    ) -> Result<CommandResult> {
        Self::maybe_update_session_state(session);
        self.ingest_cluster_time_from_topology(session);

        let link = self.topology.get_readable_link(criteria).await?;
        if !self.retry_reads {
            return self.execute_once_on(op, link, session).await;
        }

        let address = link.address().clone();
        let mut link = link;
        let first_result = self.execute_on(op, &mut link, session).await;
        self.publish_cluster_time(&first_result);
        let first_error = match first_result {
            Ok(ok) => {
                self.topology.checkin_link(link).await;
                return Ok(ok);
            }
            Err(e) => e,
        };
        self.clean_up_after_error(&address, &first_error, session);

        if !first_error.is_read_retryable() {
            return Err(first_error);
        }

        let retry_link = match self.topology.get_readable_link(criteria).await {
            Ok(link) => link,
            Err(_) => return Err(first_error),
        };
        let retry_address = retry_link.address().clone();
        let mut retry_link = retry_link;
        let second_result = self.execute_on(op, &mut retry_link, session).await;
        self.publish_cluster_time(&second_result);
        match second_result {
            Ok(ok) => {
                self.topology.checkin_link(retry_link).await;
                Ok(ok)
            }
            Err(second_error) => {
                self.clean_up_after_error(&retry_address, &second_error, session);
                Err(second_error)
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        client::session::{pool::ServerSessionPool, ClientSession},
        link::{
            test_support::{link_with_replies, NeverConnects},
            LinkCapabilities,
        },
        sdam::{ServerDescription, ServerType, Topology},
        client::options::ClientOptions,
    };
    use bson::doc;
    use std::{sync::Arc, time::Duration};

    /// A two-mongos topology where `h1` is always the latency-window winner until it's marked
    /// `Unknown`, at which point `h2` becomes the sole eligible candidate. This lets the retry
    /// path's "reselect after marking the first server unknown" behavior (spec §4.4.1 step 5) be
    /// exercised without needing to interleave a real monitor update mid-dispatch.
    fn two_mongos_topology() -> (Topology, ServerAddress, ServerAddress) {
        let h1 = ServerAddress::new("h1", None);
        let h2 = ServerAddress::new("h2", None);
        let options = ClientOptions::builder()
            .hosts(vec![h1.clone(), h2.clone()])
            .server_selection_timeout(Duration::from_millis(200))
            .build();
        let topology = Topology::new(options, Arc::new(NeverConnects), None);

        topology.apply_server_update(ServerDescription {
            server_type: ServerType::Mongos,
            average_round_trip_time: Some(Duration::from_millis(1)),
            ..ServerDescription::unknown(h1.clone())
        });
        topology.apply_server_update(ServerDescription {
            server_type: ServerType::Mongos,
            average_round_trip_time: Some(Duration::from_secs(1)),
            ..ServerDescription::unknown(h2.clone())
        });

        (topology, h1, h2)
    }

    fn not_master_reply() -> bson::Document {
        doc! { "ok": 0.0, "code": 10107, "codeName": "NotWritablePrimary", "errmsg": "not master" }
    }

    fn retryable_caps() -> LinkCapabilities {
        LinkCapabilities {
            max_wire_version: 6,
            supports_retry_writes: true,
            supports_sessions: true,
            ..LinkCapabilities::default()
        }
    }

    #[tokio::test]
    async fn retryable_write_retries_once_on_not_master_and_succeeds() {
        let (topology, h1, h2) = two_mongos_topology();
        topology
            .checkin_link(link_with_replies(h1.clone(), vec![Ok(not_master_reply())], retryable_caps()))
            .await;
        topology
            .checkin_link(link_with_replies(h2.clone(), vec![Ok(doc! { "ok": 1.0, "n": 1 })], retryable_caps()))
            .await;

        let dispatcher = Dispatcher::new(topology, true, true);
        let pool = Arc::new(ServerSessionPool::new());
        let session = ClientSession::new(pool, Some(30));

        let mut op = Operation::write("test", doc! { "insert": "coll", "documents": [{}] });
        let result = dispatcher.send_retryable_write_op(&mut op, false, Some(&session)).await;

        assert!(result.is_ok(), "retry on the new primary should succeed: {result:?}");
        // Exactly one retry: the transaction number is bumped once per logical write, never per
        // attempt (spec §7 property 6 "transaction-number monotonicity").
        assert_eq!(session.current_txn_number(), 1);
    }

    #[tokio::test]
    async fn retryable_write_gives_up_after_exactly_two_attempts() {
        // Both links fail with NotMaster; a third attempt would panic on an empty reply script,
        // so a passing test proves the at-most-two-attempts property (spec §8 property 5).
        let (topology, h1, h2) = two_mongos_topology();
        topology
            .checkin_link(link_with_replies(h1.clone(), vec![Ok(not_master_reply())], retryable_caps()))
            .await;
        topology
            .checkin_link(link_with_replies(h2.clone(), vec![Ok(not_master_reply())], retryable_caps()))
            .await;

        let dispatcher = Dispatcher::new(topology, true, true);
        let pool = Arc::new(ServerSessionPool::new());
        let session = ClientSession::new(pool, Some(30));

        let mut op = Operation::write("test", doc! { "insert": "coll", "documents": [{}] });
        let err = dispatcher
            .send_retryable_write_op(&mut op, false, Some(&session))
            .await
            .unwrap_err();
        assert!(err.is_not_master());
    }

    #[tokio::test]
    async fn non_retryable_error_on_first_attempt_propagates_without_a_second_attempt() {
        let (topology, h1, _h2) = two_mongos_topology();
        // A plain command error (no retryable code) should propagate without ever touching h2's
        // scripted transport, which is left empty and would panic if consulted.
        topology
            .checkin_link(
                link_with_replies(
                    h1.clone(),
                    vec![Ok(doc! { "ok": 0.0, "code": 121, "codeName": "DocumentValidationFailure", "errmsg": "bad doc" })],
                    retryable_caps(),
                ),
            )
            .await;
        topology.checkin_link(link_with_replies(ServerAddress::new("h2", None), vec![], retryable_caps())).await;

        let dispatcher = Dispatcher::new(topology, true, true);
        let pool = Arc::new(ServerSessionPool::new());
        let session = ClientSession::new(pool, Some(30));

        let mut op = Operation::write("test", doc! { "insert": "coll", "documents": [{}] });
        let err = dispatcher
            .send_retryable_write_op(&mut op, false, Some(&session))
            .await
            .unwrap_err();
        assert_eq!(err.code(), Some(121));
    }

    #[tokio::test]
    async fn retryable_read_retries_once_then_succeeds_on_the_new_server() {
        let (topology, h1, h2) = two_mongos_topology();
        topology
            .checkin_link(link_with_replies(h1.clone(), vec![Ok(not_master_reply())], retryable_caps()))
            .await;
        topology
            .checkin_link(link_with_replies(h2.clone(), vec![Ok(doc! { "ok": 1.0 })], retryable_caps()))
            .await;

        let dispatcher = Dispatcher::new(topology, true, true);
        let op = Operation::new("test", doc! { "find": "coll" });
        let criteria = SelectionCriteria::ReadPreference(crate::selection_criteria::ReadPreference::Primary);
        let result = dispatcher.send_retryable_read_op(&op, &criteria, None).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn send_direct_op_never_retries_and_marks_the_server_unknown_on_not_master() {
        let (topology, h1, _h2) = two_mongos_topology();
        topology
            .checkin_link(link_with_replies(h1.clone(), vec![Ok(not_master_reply())], retryable_caps()))
            .await;

        let dispatcher = Dispatcher::new(topology.clone(), true, true);
        let op = Operation::new("test", doc! { "ping": 1 });
        let err = dispatcher.send_direct_op(&op, &h1, None).await.unwrap_err();
        assert!(err.is_not_master());
        assert!(!topology.description().servers.get(&h1).unwrap().is_available());
    }

    struct RecordingHandler(std::sync::Mutex<Vec<&'static str>>);

    impl crate::event::CommandEventHandler for RecordingHandler {
        fn handle_command_started_event(&self, _event: crate::event::CommandStartedEvent) {
            self.0.lock().unwrap().push("started");
        }
        fn handle_command_succeeded_event(&self, _event: crate::event::CommandSucceededEvent) {
            self.0.lock().unwrap().push("succeeded");
        }
        fn handle_command_failed_event(&self, _event: crate::event::CommandFailedEvent) {
            self.0.lock().unwrap().push("failed");
        }
    }

    #[tokio::test]
    async fn successful_command_emits_started_then_succeeded() {
        let (topology, h1, _h2) = two_mongos_topology();
        topology
            .checkin_link(link_with_replies(h1.clone(), vec![Ok(doc! { "ok": 1.0 })], retryable_caps()))
            .await;

        let handler = Arc::new(RecordingHandler(std::sync::Mutex::new(Vec::new())));
        let dispatcher = Dispatcher::with_defaults(topology, true, true, None, None, Some(handler.clone()));
        let op = Operation::new("test", doc! { "ping": 1 });
        dispatcher.send_direct_op(&op, &h1, None).await.unwrap();

        assert_eq!(*handler.0.lock().unwrap(), vec!["started", "succeeded"]);
    }

    #[tokio::test]
    async fn failed_command_emits_started_then_failed() {
        let (topology, h1, _h2) = two_mongos_topology();
        topology
            .checkin_link(link_with_replies(h1.clone(), vec![Ok(not_master_reply())], retryable_caps()))
            .await;

        let handler = Arc::new(RecordingHandler(std::sync::Mutex::new(Vec::new())));
        let dispatcher = Dispatcher::with_defaults(topology, true, true, None, None, Some(handler.clone()));
        let op = Operation::new("test", doc! { "ping": 1 });
        let err = dispatcher.send_direct_op(&op, &h1, None).await.unwrap_err();

        assert!(err.is_not_master());
        assert_eq!(*handler.0.lock().unwrap(), vec!["started", "failed"]);
    }
}
