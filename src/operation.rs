//! A single server round-trip, independent of any particular command shape (spec §3 "Operation",
//! §4.6). BSON encoding of the command body and decoding of the reply are the caller's
//! responsibility (spec §1 Non-goals); this crate only attaches the dispatch-level envelope
//! fields (`lsid`, `$clusterTime`, `txnNumber`) and interprets the reply's `ok`/error shape.

use bson::{doc, Document};

use crate::{
    client::{
        session::{ClientSession, TransactionState},
        ClusterTime,
    },
    concern::WriteConcern,
    error::{CommandError, Error, ErrorKind, Result},
    link::Link,
    sdam::TopologyType,
    selection_criteria::SelectionCriteria,
};

/// The result of one successful command round-trip, with the dispatch-relevant envelope fields
/// already pulled out of the raw reply (spec §4.6 step 4).
#[derive(Debug, Clone)]
pub struct CommandResult {
    pub reply: Document,
    pub cluster_time: Option<ClusterTime>,
    pub operation_time: Option<bson::Timestamp>,
}

/// A value describing one command round-trip (spec §3). Built by a higher-level CRUD surface
/// (out of this crate's scope) and handed to a [`crate::dispatcher::Dispatcher`] entry point,
/// which mutates only the fields this type documents as dispatcher-owned.
#[derive(Debug, Clone)]
pub struct Operation {
    pub db_name: String,
    pub command_doc: Document,
    pub read_preference: SelectionCriteria,
    pub is_write: bool,
    /// Set by the dispatcher once it has decided to attempt a retryable write (spec §4.4.1 step
    /// 2); never set true by the caller directly.
    pub retryable_write: bool,
    pub max_time: Option<std::time::Duration>,
    pub write_concern: Option<WriteConcern>,
}

impl Operation {
    pub fn new(db_name: impl Into<String>, command_doc: Document) -> Self {
        Self {
            db_name: db_name.into(),
            command_doc,
            read_preference: SelectionCriteria::ReadPreference(Default::default()),
            is_write: false,
            retryable_write: false,
            max_time: None,
            write_concern: None,
        }
    }

    pub fn write(db_name: impl Into<String>, command_doc: Document) -> Self {
        Self {
            is_write: true,
            ..Self::new(db_name, command_doc)
        }
    }

    /// The command name for monitoring events (spec §6 "Observability"): a MongoDB command
    /// document's first key is always its name (`{insert: "coll", ...}`, `{find: "coll", ...}`).
    pub(crate) fn command_name(&self) -> String {
        self.command_doc
            .keys()
            .next()
            .cloned()
            .unwrap_or_else(|| "unknown".to_string())
    }

    /// Sends the command on `link`, attaching session/cluster-time envelope fields and
    /// interpreting the reply (spec §4.6). `topology_type` decides whether `lsid`/`txnNumber` are
    /// meaningful to attach (a standalone ignores them, but attaching them is harmless there too;
    /// callers pass it through mainly so a future divergence has a seam).
    ///
    /// `default_max_time` is the connection string's `maxTimeMS`, if any (spec §6); it applies
    /// only when the operation itself didn't set one. `default_write_concern` is likewise the
    /// connection string's `w`/`wTimeoutMS`/`journal` (spec §6), applied only to writes that
    /// didn't request their own.
    pub async fn execute(
        &self,
        link: &mut Link,
        session: Option<&ClientSession>,
        _topology_type: TopologyType,
        default_max_time: Option<std::time::Duration>,
        default_write_concern: Option<&WriteConcern>,
    ) -> Result<CommandResult> {
        let mut command = self.command_doc.clone();

        if let Some(session) = session {
            command.insert("lsid", doc! { "id": session.id().clone() });
            if let Some(cluster_time) = session.cluster_time() {
                command.insert("$clusterTime", bson::to_document(&cluster_time)?);
            }
            if self.retryable_write || session.in_active_transaction() {
                command.insert("txnNumber", session.current_txn_number());
            }
            // A transaction's first statement announces itself to the server and carries the
            // transaction's own read concern; every later statement just marks non-autocommit
            // (spec §6 scenario S6).
            let starting = session.txn_state() == TransactionState::Starting;
            if starting || session.in_active_transaction() {
                command.insert("autocommit", false);
            }
            if starting {
                command.insert("startTransaction", true);
                if let Some(read_concern) = session.transaction_options().and_then(|o| o.read_concern) {
                    command.insert("readConcern", bson::to_document(&read_concern)?);
                }
                session.mark_transaction_in_progress_if_starting();
            }
        }

        if let Some(max_time) = self.max_time.or(default_max_time) {
            command.insert("maxTimeMS", max_time.as_millis() as i64);
        }

        if self.is_write {
            if let Some(write_concern) = self.write_concern.as_ref().or(default_write_concern) {
                write_concern.validate()?;
                if write_concern.is_acknowledged() {
                    command.insert("writeConcern", bson::to_document(write_concern)?);
                }
            }
        }

        let reply = link.send_command(&self.db_name, command).await?;
        let result = interpret_reply(reply, link.capabilities().max_wire_version)?;

        if let Some(session) = session {
            session.advance_cluster_time(result.cluster_time.clone());
            if let Some(operation_time) = result.operation_time {
                session.advance_operation_time(operation_time);
            }
        }

        Ok(result)
    }
}

/// Parses `{ok, ...}` into either a [`CommandResult`] or a typed [`Error`] (spec §4.6 step 5,
/// spec §7).
fn interpret_reply(reply: Document, max_wire_version: i32) -> Result<CommandResult> {
    let cluster_time = reply
        .get_document("$clusterTime")
        .ok()
        .and_then(|doc| bson::from_document::<ClusterTime>(doc.clone()).ok());
    let operation_time = reply.get_timestamp("operationTime").ok();

    let ok = reply
        .get_f64("ok")
        .ok()
        .or_else(|| reply.get_i32("ok").ok().map(f64::from))
        .unwrap_or(0.0);

    if ok != 1.0 {
        let mut command_error: CommandError = bson::from_document(reply.clone())
            .unwrap_or_else(|_| CommandError {
                code: -1,
                code_name: String::new(),
                message: "command failed without a recognizable error document".to_string(),
            });
        if command_error.message.is_empty() {
            if let Ok(errmsg) = reply.get_str("errmsg") {
                command_error.message = errmsg.to_string();
            }
        }
        let mut error: Error = ErrorKind::Command(command_error).into();
        if error.should_add_retryable_write_label(max_wire_version) {
            error.add_label(crate::error::RETRYABLE_WRITE_ERROR);
        }
        return Err(error);
    }

    if let Ok(write_concern_error) = reply.get_document("writeConcernError") {
        let wc_error: CommandError = bson::from_document(write_concern_error.clone())?;
        return Err(ErrorKind::WriteConcern(wc_error).into());
    }

    Ok(CommandResult {
        reply,
        cluster_time,
        operation_time,
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        address::ServerAddress,
        client::session::pool::ServerSessionPool,
        link::{test_support::link_with_replies, LinkCapabilities},
    };
    use std::sync::Arc;

    #[tokio::test]
    async fn successful_reply_is_parsed_into_a_command_result() {
        let mut link = link_with_replies(
            ServerAddress::new("h1", None),
            vec![Ok(doc! { "ok": 1.0, "n": 1 })],
            LinkCapabilities::default(),
        );
        let op = Operation::write("test", doc! { "insert": "coll", "documents": [] });
        let result = op.execute(&mut link, None, TopologyType::Single, None, None).await.unwrap();
        assert_eq!(result.reply.get_i32("n"), Ok(1));
    }

    #[tokio::test]
    async fn command_error_reply_becomes_a_typed_error() {
        let mut link = link_with_replies(
            ServerAddress::new("h1", None),
            vec![Ok(doc! { "ok": 0.0, "code": 10107, "codeName": "NotWritablePrimary", "errmsg": "not master" })],
            LinkCapabilities::default(),
        );
        let op = Operation::write("test", doc! { "insert": "coll", "documents": [] });
        let err = op.execute(&mut link, None, TopologyType::Single, None, None).await.unwrap_err();
        assert!(err.is_not_master());
    }

    #[tokio::test]
    async fn starting_transaction_announces_itself_and_flips_to_in_progress() {
        let mut link = link_with_replies(
            ServerAddress::new("h1", None),
            vec![Ok(doc! { "ok": 1.0 })],
            LinkCapabilities::default(),
        );
        let pool = Arc::new(ServerSessionPool::new());
        let session = crate::client::session::ClientSession::new(pool, None);
        session.begin_transaction(None).unwrap();

        let op = Operation::write("test", doc! { "insert": "coll", "documents": [] });
        op.execute(&mut link, Some(&session), TopologyType::ReplicaSetWithPrimary, None, None)
            .await
            .unwrap();

        assert_eq!(session.txn_state(), crate::client::session::TransactionState::InProgress);
    }

    #[tokio::test]
    async fn write_concern_error_is_surfaced_even_though_the_write_applied() {
        let mut link = link_with_replies(
            ServerAddress::new("h1", None),
            vec![Ok(doc! {
                "ok": 1.0,
                "writeConcernError": { "code": 64, "codeName": "WriteConcernFailed", "errmsg": "timed out" },
            })],
            LinkCapabilities::default(),
        );
        let op = Operation::write("test", doc! { "insert": "coll", "documents": [] });
        let err = op.execute(&mut link, None, TopologyType::Single, None, None).await.unwrap_err();
        assert!(matches!(err.kind.as_ref(), ErrorKind::WriteConcern(_)));
    }
}
