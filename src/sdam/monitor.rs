//! The per-server heartbeat loop (spec §4.2).

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use bson::{doc, Document};

use super::{
    description::server::{HelloCommandResponse, ServerDescription},
    message_manager::MessageSubscriber,
    topology::Topology,
};
use crate::{
    address::ServerAddress,
    client::{options::ClientOptions, ClusterTime},
    error::{Error, Result},
    event::{ServerHeartbeatFailedEvent, ServerHeartbeatStartedEvent, ServerHeartbeatSucceededEvent, SdamEventHandler},
    link::{Link, LinkFactory},
};

/// A floor under `heartbeatFrequencyMS` so a misconfigured or test-tuned value can't turn the
/// monitor loop into a busy spin (spec §4.2 step 1's sleep/wake race needs a sane lower bound).
pub(crate) const MIN_HEARTBEAT_FREQUENCY: Duration = Duration::from_millis(500);

fn timeout_error(what: &str) -> Error {
    std::io::Error::new(std::io::ErrorKind::TimedOut, what.to_string()).into()
}

fn hello_command() -> Document {
    doc! { "isMaster": 1, "helloOk": true }
}

/// Pulls `$clusterTime` off a raw reply, if present, for gossip merging (spec §4.3
/// "updateClusterTime").
fn extract_cluster_time(reply: &Document) -> Option<ClusterTime> {
    reply
        .get_document("$clusterTime")
        .ok()
        .and_then(|doc| bson::from_document::<ClusterTime>(doc.clone()).ok())
}

/// Per-address cooperative task that probes with `isMaster`/`hello` on a heartbeat cadence and
/// publishes a new [`ServerDescription`] to the owning [`Topology`] after each probe (spec §4.2).
pub(crate) struct Monitor {
    address: ServerAddress,
    topology: Topology,
    link_factory: Arc<dyn LinkFactory>,
    options: ClientOptions,
    event_handler: Option<Arc<dyn SdamEventHandler>>,
    check_requests: MessageSubscriber,
    link: Option<Link>,
}

impl Monitor {
    /// Spawns the monitor loop as an independent task; it runs until `topology` reports it is no
    /// longer alive (spec §4.2 "Monitors are independent; there is no cross-server coordination").
    pub(crate) fn spawn(
        address: ServerAddress,
        topology: Topology,
        link_factory: Arc<dyn LinkFactory>,
        options: ClientOptions,
        event_handler: Option<Arc<dyn SdamEventHandler>>,
    ) {
        let check_requests = topology.subscribe_to_checks();
        let monitor = Self {
            address,
            topology,
            link_factory,
            options,
            event_handler,
            check_requests,
            link: None,
        };
        tokio::spawn(monitor.run());
    }

    async fn run(mut self) {
        while self.topology.is_alive() {
            self.check_once().await;

            let heartbeat_frequency = self.options.heartbeat_frequency.max(MIN_HEARTBEAT_FREQUENCY);
            tokio::select! {
                _ = tokio::time::sleep(heartbeat_frequency) => {}
                _ = self.check_requests.wait_for_check_request() => {}
            }
        }
    }

    /// Step (1)-(6) of spec §4.2: probe, compute a description (success or error), EWMA the RTT,
    /// and publish.
    async fn check_once(&mut self) {
        crate::event::sdam_log!("starting heartbeat for {}", self.address);
        self.emit(|h| {
            h.handle_server_heartbeat_started_event(ServerHeartbeatStartedEvent {
                address: self.address.clone(),
            })
        });

        let previous_rtt = self
            .topology
            .description()
            .servers
            .get(&self.address)
            .and_then(|s| s.average_round_trip_time);
        let start = Instant::now();

        match self.perform_hello().await {
            Ok((reply, cluster_time)) => {
                let rtt = start.elapsed();
                crate::event::sdam_log!("heartbeat for {} succeeded in {:?}", self.address, rtt);
                self.emit(|h| {
                    h.handle_server_heartbeat_succeeded_event(ServerHeartbeatSucceededEvent {
                        address: self.address.clone(),
                        duration: rtt,
                    })
                });
                let is_replica_set =
                    self.topology.description().topology_type.is_replica_set() || self.options.repl_set_name.is_some();
                let description = ServerDescription::from_hello_reply(
                    self.address.clone(),
                    reply,
                    cluster_time,
                    is_replica_set,
                    rtt,
                    previous_rtt,
                );
                self.topology.apply_server_update(description);
            }
            Err(e) => {
                // Any protocol error drops the dedicated monitoring link (spec §4.2 step 6: "set
                // type=Unknown and clear capability flags").
                self.link = None;
                crate::event::sdam_log!("heartbeat for {} failed: {}", self.address, e);
                self.emit(|h| {
                    h.handle_server_heartbeat_failed_event(ServerHeartbeatFailedEvent {
                        address: self.address.clone(),
                        duration: start.elapsed(),
                        failure: e.clone(),
                    })
                });
                self.topology
                    .apply_server_update(ServerDescription::from_error(self.address.clone(), e));
            }
        }
    }

    async fn perform_hello(&mut self) -> Result<(HelloCommandResponse, Option<ClusterTime>)> {
        if self.link.is_none() {
            let link = tokio::time::timeout(
                self.options.connect_timeout,
                self.link_factory.connect(&self.address, self.options.connect_timeout),
            )
            .await
            .map_err(|_| timeout_error("connecting a monitoring link timed out"))??;
            self.link = Some(link);
        }

        let link = self.link.as_mut().expect("just ensured link is present");
        let reply = tokio::time::timeout(self.options.connect_timeout, link.send_command("admin", hello_command()))
            .await
            .map_err(|_| timeout_error("isMaster/hello timed out"))?;
        let reply = match reply {
            Ok(reply) => reply,
            Err(e) => {
                self.link = None;
                return Err(e);
            }
        };

        let cluster_time = extract_cluster_time(&reply);
        let parsed: HelloCommandResponse = bson::from_document(reply)?;
        Ok((parsed, cluster_time))
    }

    fn emit(&self, event: impl FnOnce(&dyn SdamEventHandler)) {
        if let Some(handler) = &self.event_handler {
            event(handler.as_ref());
        }
    }
}
