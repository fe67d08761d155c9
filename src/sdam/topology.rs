//! The live, mutable topology coordinator (spec §4.3 "Topology").
//!
//! Owns the current [`TopologyDescription`] behind a [`tokio::sync::watch`] channel — the
//! "immutable descriptions + locked pointer swap" design from spec §9: writers (monitors, and the
//! dispatcher's error-driven `mark_server_unknown`) publish a whole new `Arc<TopologyDescription>`;
//! readers clone the `Arc` and proceed lock-free. The same channel doubles as the wake-up signal
//! server selection waits on (spec §4.3.2).

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    time::{Duration, Instant},
};

use tokio::sync::Mutex as AsyncMutex;

use super::{
    description::{
        server::ServerDescription,
        server_selection::{self, SelectionConfig},
        topology::{TopologyDescription, TopologyType},
    },
    message_manager::{MessageSubscriber, TopologyMessageManager},
};
use crate::{
    address::ServerAddress,
    client::{options::ClientOptions, ClusterTime},
    error::{Error, Result},
    event::{SdamEventHandler, TopologyDescriptionChangedEvent},
    link::{Link, LinkFactory},
    selection_criteria::{ReadPreference, SelectionCriteria},
};

/// A point-in-time, caller-visible view of the deployment (spec §6 "`Client.topologyStatus`").
#[derive(Debug, Clone)]
pub struct TopologyStatus {
    pub topology_type: TopologyType,
    pub servers: Vec<ServerDescription>,
    pub compatible: bool,
}

struct LinkSlot {
    link: AsyncMutex<Option<Link>>,
}

struct Inner {
    description: tokio::sync::watch::Sender<Arc<TopologyDescription>>,
    cluster_time: Mutex<Option<ClusterTime>>,
    links: Mutex<HashMap<ServerAddress, Arc<LinkSlot>>>,
    link_factory: Arc<dyn LinkFactory>,
    message_manager: TopologyMessageManager,
    options: ClientOptions,
    event_handler: Option<Arc<dyn SdamEventHandler>>,
    alive: AtomicBool,
}

/// The live coordinator a [`crate::dispatcher::Dispatcher`] asks for links and a set of
/// [`super::monitor::Monitor`] tasks keep fresh. Cheaply `Clone`-able; every clone shares the same
/// underlying state (spec §5 "topology description is shared between monitors and dispatchers").
#[derive(Clone)]
pub struct Topology(Arc<Inner>);

impl Topology {
    /// Builds the initial topology from `options` and spawns one monitor per seed (spec §4.2,
    /// §4.3). `link_factory` is the out-of-scope wire/auth layer this crate depends on through a
    /// trait object (spec §1).
    pub fn new(
        options: ClientOptions,
        link_factory: Arc<dyn LinkFactory>,
        event_handler: Option<Arc<dyn SdamEventHandler>>,
    ) -> Self {
        let topology_type = initial_topology_type(&options);
        let description = TopologyDescription::new(topology_type, &options.hosts, options.repl_set_name.clone());
        let (sender, _) = tokio::sync::watch::channel(Arc::new(description));

        let inner = Arc::new(Inner {
            description: sender,
            cluster_time: Mutex::new(None),
            links: Mutex::new(HashMap::new()),
            link_factory,
            message_manager: TopologyMessageManager::new(),
            options: options.clone(),
            event_handler,
            alive: AtomicBool::new(true),
        });
        let topology = Self(inner);

        for address in &options.hosts {
            super::monitor::Monitor::spawn(
                address.clone(),
                topology.clone(),
                topology.0.link_factory.clone(),
                topology.0.options.clone(),
                topology.0.event_handler.clone(),
            );
        }

        topology
    }

    pub fn description(&self) -> Arc<TopologyDescription> {
        self.0.description.borrow().clone()
    }

    pub fn topology_type(&self) -> TopologyType {
        self.description().topology_type
    }

    pub(crate) fn is_alive(&self) -> bool {
        self.0.alive.load(Ordering::SeqCst)
    }

    pub(crate) fn subscribe_to_checks(&self) -> MessageSubscriber {
        self.0.message_manager.subscribe()
    }

    /// Applies one monitor's freshly observed [`ServerDescription`] (spec §4.2 step 6, §4.3.3).
    pub(crate) fn apply_server_update(&self, new: ServerDescription) {
        let gossiped_cluster_time = new.cluster_time.clone();
        let current = self.description();
        let (mut next, changed) = current.apply_update(new);
        self.update_cluster_time(gossiped_cluster_time);
        if !changed {
            return;
        }
        next.recompute_compatibility();
        self.publish(current.topology_type, next);
    }

    /// Replaces a server's description with `Unknown` because of a dispatch-observed error, and
    /// wakes that server's monitor for an immediate recheck (spec §4.3 "markServerUnknown").
    pub(crate) fn mark_server_unknown(&self, address: &ServerAddress, error: Error) {
        let current = self.description();
        let (mut next, changed) = current.mark_server_unknown(address, error);
        if changed {
            next.recompute_compatibility();
            self.publish(current.topology_type, next);
        }
        self.0.message_manager.request_immediate_check();
    }

    /// Bumps the topology's staleness generation and wakes every monitor to recheck now (spec §4.3
    /// "markStale").
    pub(crate) fn mark_stale(&self) {
        let current = self.description();
        let mut next = (*current).clone();
        next.stale_generation = next.stale_generation.wrapping_add(1);
        self.publish(current.topology_type, next);
        self.0.message_manager.request_immediate_check();
    }

    fn publish(&self, previous_type: TopologyType, next: TopologyDescription) {
        let new_type = next.topology_type;
        let _ = self.0.description.send(Arc::new(next));
        if previous_type != new_type {
            if let Some(handler) = &self.0.event_handler {
                handler.handle_topology_description_changed_event(TopologyDescriptionChangedEvent {
                    previous_type,
                    new_type,
                });
            }
        }
    }

    /// Waits for at least one round of checks to complete across the deployment (spec §4.3
    /// "scanAllServers"), optionally forcing every monitor to skip its sleep first.
    pub async fn scan_all_servers(&self, force: bool) {
        let mut rx = self.0.description.subscribe();
        if force {
            self.mark_stale();
        } else {
            self.0.message_manager.request_immediate_check();
        }
        let _ = tokio::time::timeout(self.0.options.connect_timeout, rx.changed()).await;
    }

    pub fn update_cluster_time(&self, new: Option<ClusterTime>) {
        let Some(new) = new else { return };
        let mut guard = self.0.cluster_time.lock().unwrap();
        *guard = Some(match guard.take() {
            Some(current) => current.max(new),
            None => new,
        });
    }

    pub fn cluster_time(&self) -> Option<ClusterTime> {
        self.0.cluster_time.lock().unwrap().clone()
    }

    pub fn logical_session_timeout_minutes(&self) -> Option<i64> {
        self.description().logical_session_timeout_minutes()
    }

    pub fn status(&self) -> TopologyStatus {
        let description = self.description();
        TopologyStatus {
            topology_type: description.topology_type,
            servers: description.servers.values().cloned().collect(),
            compatible: description.compatible,
        }
    }

    /// Server selection (spec §4.3.1) plus the bounded-waiting behavior around it (spec §4.3.2).
    async fn select_server(&self, criteria: &SelectionCriteria) -> Result<ServerAddress> {
        let start = Instant::now();
        let config = SelectionConfig {
            heartbeat_frequency: self.0.options.heartbeat_frequency,
            local_threshold: self.0.options.local_threshold,
        };

        loop {
            let description = self.description();
            let mut rx = self.0.description.subscribe();
            let eligible = server_selection::eligible_servers(&description, criteria, config)?;
            if let Some(chosen) = server_selection::pick_random(&eligible) {
                return Ok(chosen.address.clone());
            }

            let elapsed = start.elapsed();
            if elapsed >= self.0.options.server_selection_timeout {
                return Err(Error::server_selection_timeout(format!(
                    "no server available matching {criteria:?} after {elapsed:?}"
                )));
            }
            self.0.message_manager.request_immediate_check();

            if self.0.options.server_selection_try_once {
                let remaining = (self.0.options.server_selection_timeout - elapsed).min(self.0.options.connect_timeout);
                let _ = tokio::time::timeout(remaining, rx.changed()).await;
                let description = self.description();
                let eligible = server_selection::eligible_servers(&description, criteria, config)?;
                return server_selection::pick_random(&eligible).map(|s| s.address.clone()).ok_or_else(|| {
                    Error::server_selection_timeout(format!(
                        "no server available matching {criteria:?} after one rescan (serverSelectionTryOnce)"
                    ))
                });
            }

            let remaining = self.0.options.server_selection_timeout - elapsed;
            let granularity = (self.0.options.heartbeat_frequency / 2).min(remaining).max(Duration::from_millis(1));
            let _ = tokio::time::timeout(granularity, rx.changed()).await;
        }
    }

    /// Spec §4.3 "getReadableLink": selects per `read_pref`, waiting as needed, then checks out a
    /// link to the chosen server.
    pub async fn get_readable_link(&self, criteria: &SelectionCriteria) -> Result<Link> {
        let address = self.select_server(criteria).await?;
        self.checkout_link(&address).await
    }

    /// Spec §4.3 "getWritableLink": shorthand for `mode=primary` selection.
    pub async fn get_writable_link(&self) -> Result<Link> {
        let criteria = SelectionCriteria::ReadPreference(ReadPreference::Primary);
        self.get_readable_link(&criteria).await
    }

    /// Spec §4.3 "getSpecificLink": bypasses selection for commands that must go to a known host.
    pub async fn get_specific_link(&self, address: &ServerAddress) -> Result<Link> {
        self.checkout_link(address).await
    }

    fn slot_for(&self, address: &ServerAddress) -> Arc<LinkSlot> {
        self.0
            .links
            .lock()
            .unwrap()
            .entry(address.clone())
            .or_insert_with(|| {
                Arc::new(LinkSlot {
                    link: AsyncMutex::new(None),
                })
            })
            .clone()
    }

    pub(crate) async fn checkout_link(&self, address: &ServerAddress) -> Result<Link> {
        let slot = self.slot_for(address);
        let mut guard = slot.link.lock().await;
        if let Some(mut link) = guard.take() {
            if !link.needs_revalidation(self.0.options.socket_check_interval) {
                return Ok(link);
            }
            if link.ping().await.is_ok() {
                return Ok(link);
            }
            // Idle link failed revalidation; fall through and open a fresh one.
        }
        drop(guard);
        self.0
            .link_factory
            .connect(address, self.0.options.connect_timeout)
            .await
    }

    /// Returns a still-healthy link to its per-address slot for reuse (spec §4.1). Dropped
    /// silently if the address has since left the topology.
    pub(crate) async fn checkin_link(&self, link: Link) {
        let slot = self.slot_for(link.address());
        *slot.link.lock().await = Some(link);
    }

    /// Closes every open link and stops all monitors (spec §6 "`Client.disconnect`").
    pub async fn close(&self) {
        self.0.alive.store(false, Ordering::SeqCst);
        self.0.links.lock().unwrap().clear();
    }

    /// Reopens monitoring after [`Self::close`], discarding any pooled links so a post-fork child
    /// never reuses a parent's sockets (spec §5 "Fork/thread safety").
    pub fn reconnect(&self) {
        self.0.alive.store(true, Ordering::SeqCst);
        self.0.links.lock().unwrap().clear();
        for address in self.description().servers.keys().cloned().collect::<Vec<_>>() {
            super::monitor::Monitor::spawn(
                address,
                self.clone(),
                self.0.link_factory.clone(),
                self.0.options.clone(),
                self.0.event_handler.clone(),
            );
        }
    }
}

fn initial_topology_type(options: &ClientOptions) -> TopologyType {
    if options.direct_connection == Some(true) {
        return TopologyType::Direct;
    }
    if options.repl_set_name.is_some() {
        return TopologyType::ReplicaSetNoPrimary;
    }
    if options.hosts.len() == 1 {
        return TopologyType::Single;
    }
    TopologyType::Unknown
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::link::test_support::{NeverConnects, ScriptedTransport};
    use crate::link::LinkCapabilities;

    #[tokio::test]
    async fn single_topology_selects_its_sole_server_even_while_unknown() {
        let options = ClientOptions::builder()
            .hosts(vec![ServerAddress::new("h1", None)])
            .server_selection_timeout(Duration::from_millis(50))
            .server_selection_try_once(true)
            .build();
        let topology = Topology::new(options, Arc::new(NeverConnects), None);
        // A fresh Unknown server is not "available", so even Direct/Single selection (which
        // ignores read preference) must still fail fast via serverSelectionTryOnce rather than
        // hang for the full timeout.
        let criteria = SelectionCriteria::ReadPreference(ReadPreference::Primary);
        let err = topology.select_server(&criteria).await.unwrap_err();
        assert!(err.is_server_selection_error());
        topology.close().await;
    }

    #[tokio::test]
    async fn checkin_then_checkout_reuses_the_same_link_without_revalidation() {
        let address = ServerAddress::new("h1", None);
        let options = ClientOptions::builder().hosts(vec![address.clone()]).build();
        let topology = Topology::new(options, Arc::new(NeverConnects), None);

        let link = Link::new(
            address.clone(),
            Box::new(ScriptedTransport::new(vec![])),
            LinkCapabilities::default(),
        );
        topology.checkin_link(link).await;
        let link = topology.checkout_link(&address).await.unwrap();
        assert_eq!(link.address(), &address);
        topology.close().await;
    }

    #[tokio::test]
    async fn mark_server_unknown_demotes_a_primary() {
        let h1 = ServerAddress::new("h1", None);
        let h2 = ServerAddress::new("h2", None);
        let options = ClientOptions::builder()
            .hosts(vec![h1.clone(), h2.clone()])
            .repl_set_name(Some("rs0".to_string()))
            .build();
        let topology = Topology::new(options, Arc::new(NeverConnects), None);

        let primary = ServerDescription {
            server_type: super::super::description::server::ServerType::RsPrimary,
            set_name: Some("rs0".into()),
            set_version: Some(1),
            election_id: Some(bson::oid::ObjectId::new()),
            hosts: vec![h1.clone(), h2.clone()],
            average_round_trip_time: Some(Duration::from_millis(1)),
            ..ServerDescription::unknown(h1.clone())
        };
        topology.apply_server_update(primary);
        assert_eq!(topology.topology_type(), TopologyType::ReplicaSetWithPrimary);

        topology.mark_server_unknown(&h1, Error::internal("simulated"));
        assert_eq!(topology.topology_type(), TopologyType::ReplicaSetNoPrimary);
        topology.close().await;
    }
}
