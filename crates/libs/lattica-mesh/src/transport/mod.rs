pub mod announce_queue;
pub mod config;
pub mod hashlist;
pub mod link_table;
pub mod path_requests;
pub mod path_table;
pub mod receipts;
pub mod storage;
pub mod tunnels;

mod handler;
mod jobs;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use rand_core::OsRng;
use tokio::sync::{broadcast, Mutex};
use tokio_util::sync::CancellationToken;

use crate::destination::link::{Link, LinkEventData, LinkId};
use crate::destination::SingleInputDestination;
use crate::error::MeshError;
use crate::hash::{AddressHash, NAME_HASH_SIZE};
use crate::identity::{Identity, KnownDestinations, PrivateIdentity};
use crate::iface::{
    InterfaceChannel, InterfaceManager, InterfaceProperties, RxReceiver,
};
use crate::packet::{Packet, PacketContext};
use crate::ratchets::RatchetStore;
use crate::time::epoch_secs;

use announce_queue::{AnnounceQueue, AnnounceRateLimits};
use hashlist::HashList;
use link_table::LinkTable;
use path_requests::PathRequests;
use path_table::PathTable;
use receipts::ReceiptTable;
use storage::{InstanceStorage, PersistedPathEntry};
use tunnels::TunnelStore;

pub use config::{PowerState, TransportConfig};

/// Seven days without a fresh announce and a remembered endpoint is culled.
const KNOWN_DESTINATION_MAX_AGE_SECS: u64 = 7 * 24 * 60 * 60;
const MAX_PENDING_PATH_REQUESTS: usize = 64;
const EVENT_CHANNEL_CAPACITY: usize = 64;
/// How long detached interface read tasks get to finish before being
/// abandoned during shutdown.
const INTERFACE_JOIN_BUDGET: Duration = Duration::from_secs(2);

/// A validated announce accepted into the path table.
#[derive(Clone)]
pub struct AnnounceEvent {
    pub destination: AddressHash,
    pub identity: Identity,
    pub name_hash: [u8; NAME_HASH_SIZE],
    pub app_data: Vec<u8>,
    pub ratchet: Option<[u8; 32]>,
    pub hops: u8,
    pub iface: AddressHash,
    pub timestamp: u64,
}

/// Decrypted payload delivered to a registered destination.
#[derive(Clone)]
pub struct ReceivedData {
    pub destination: AddressHash,
    pub data: Vec<u8>,
    pub context: PacketContext,
    pub ratchet_used: bool,
    pub iface: AddressHash,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DeliveryEvent {
    Delivered { packet_hash: AddressHash, destination: AddressHash, rtt: Duration },
    TimedOut { packet_hash: AddressHash, destination: AddressHash },
}

#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub enum SendOutcome {
    SentDirect,
    SentBroadcast,
    NoRoute,
}

/// Counters for silently dropped traffic. Nothing here is peer-visible.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DropCounters {
    pub malformed: u64,
    pub hop_limit: u64,
    pub replays: u64,
    pub auth_failures: u64,
    pub no_route: u64,
}

pub(crate) struct TransportHandler {
    pub(crate) config: TransportConfig,
    pub(crate) identity: PrivateIdentity,
    pub(crate) iface_manager: Arc<Mutex<InterfaceManager>>,
    pub(crate) hashlist: HashList,
    pub(crate) path_table: PathTable,
    pub(crate) link_table: LinkTable,
    pub(crate) announce_queue: AnnounceQueue,
    pub(crate) announce_limits: AnnounceRateLimits,
    pub(crate) path_requests: PathRequests,
    pub(crate) receipts: ReceiptTable,
    pub(crate) known_destinations: KnownDestinations,
    pub(crate) ratchet_store: Option<RatchetStore>,
    pub(crate) tunnels: TunnelStore,
    pub(crate) in_destinations: HashMap<AddressHash, Arc<Mutex<SingleInputDestination>>>,
    pub(crate) in_links: HashMap<LinkId, Arc<Mutex<Link>>>,
    pub(crate) out_links: HashMap<LinkId, Arc<Mutex<Link>>>,
    pub(crate) restored_paths: Vec<PersistedPathEntry>,
    pub(crate) storage: Option<InstanceStorage>,
    pub(crate) announce_tx: broadcast::Sender<AnnounceEvent>,
    pub(crate) link_event_tx: broadcast::Sender<LinkEventData>,
    pub(crate) data_tx: broadcast::Sender<ReceivedData>,
    pub(crate) delivery_tx: broadcast::Sender<DeliveryEvent>,
    pub(crate) counters: DropCounters,
    pub(crate) job_clock: jobs::JobClock,
    pub(crate) started: bool,
}

/// The routing engine. One instance per stack; several instances coexist in
/// a process, which the integration tests rely on.
pub struct Transport {
    name: String,
    handler: Arc<Mutex<TransportHandler>>,
    iface_manager: Arc<Mutex<InterfaceManager>>,
    power: Arc<PowerState>,
    cancel: CancellationToken,
    announce_tx: broadcast::Sender<AnnounceEvent>,
    link_event_tx: broadcast::Sender<LinkEventData>,
    data_tx: broadcast::Sender<ReceivedData>,
    delivery_tx: broadcast::Sender<DeliveryEvent>,
}

impl Transport {
    /// Brings the stack up: loads persisted identity and tables, then
    /// spawns the inbound pump and the maintenance tick loop.
    pub async fn start(config: TransportConfig) -> Result<Self, MeshError> {
        let storage = match &config.storage_dir {
            Some(dir) => Some(InstanceStorage::new(dir.clone())?),
            None => None,
        };

        let identity = match (&config.identity, &storage) {
            (Some(identity), _) => identity.clone(),
            (None, Some(storage)) => storage.load_or_create_identity()?,
            (None, None) => PrivateIdentity::generate(OsRng),
        };

        let ratchet_store = storage.as_ref().map(|storage| {
            let mut store = RatchetStore::new(storage.ratchets_dir());
            store.clean_expired();
            store
        });
        let restored_paths =
            storage.as_ref().map(|s| s.load_path_table()).transpose()?.unwrap_or_default();
        let tunnels =
            storage.as_ref().map(|s| s.load_tunnels()).transpose()?.unwrap_or_default();

        let iface_manager = Arc::new(Mutex::new(InterfaceManager::new(128)));
        let rx_receiver = iface_manager.lock().await.receiver();

        let (announce_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (link_event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (data_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (delivery_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        let transport_id =
            if config.enable_transport { Some(*identity.address_hash()) } else { None };
        let path_requests = PathRequests::new(
            &config.name,
            transport_id,
            MAX_PENDING_PATH_REQUESTS,
            Duration::from_secs(30),
        );

        let name = config.name.clone();
        let handler = Arc::new(Mutex::new(TransportHandler {
            hashlist: HashList::new(config.hashlist_capacity),
            path_table: PathTable::new(),
            link_table: LinkTable::new(config.link_proof_timeout, config.link_idle_timeout),
            announce_queue: AnnounceQueue::new(config.max_queued_announces),
            announce_limits: AnnounceRateLimits::new(),
            path_requests,
            receipts: ReceiptTable::new(config.max_receipts, config.receipt_timeout),
            known_destinations: KnownDestinations::new(),
            ratchet_store,
            tunnels,
            in_destinations: HashMap::new(),
            in_links: HashMap::new(),
            out_links: HashMap::new(),
            restored_paths,
            storage,
            announce_tx: announce_tx.clone(),
            link_event_tx: link_event_tx.clone(),
            data_tx: data_tx.clone(),
            delivery_tx: delivery_tx.clone(),
            counters: DropCounters::default(),
            job_clock: jobs::JobClock::new(),
            started: true,
            identity,
            iface_manager: iface_manager.clone(),
            config,
        }));

        let power = Arc::new(PowerState::new());
        let cancel = CancellationToken::new();

        tokio::spawn(inbound_pump(handler.clone(), rx_receiver, cancel.clone()));
        tokio::spawn(jobs::maintenance_loop(handler.clone(), power.clone(), cancel.clone()));

        log::info!("tp({}): started", name);

        Ok(Self {
            name,
            handler,
            iface_manager,
            power,
            cancel,
            announce_tx,
            link_event_tx,
            data_tx,
            delivery_tx,
        })
    }

    /// Shuts the stack down: cancels the tick loop and inbound pump, asks
    /// every interface to detach and joins its driver task within the
    /// shutdown budget, then persists state.
    pub async fn stop(&self) {
        self.handler.lock().await.started = false;
        self.cancel.cancel();

        // Detach interfaces, keeping the name bindings the persisted path
        // table needs after the registry has emptied.
        let (names, drivers) = {
            let mut manager = self.iface_manager.lock().await;
            let names: HashMap<AddressHash, String> = manager
                .snapshot()
                .into_iter()
                .map(|info| (info.address, info.name))
                .collect();
            let mut drivers = Vec::new();
            for address in names.keys() {
                if let Some(driver) = manager.deregister(address) {
                    drivers.push(driver);
                }
            }
            (names, drivers)
        };

        // Read tasks share one join budget; whatever has not finished when
        // it runs out is abandoned.
        let deadline = std::time::Instant::now() + INTERFACE_JOIN_BUDGET;
        for driver in drivers {
            let remaining = deadline
                .checked_duration_since(std::time::Instant::now())
                .unwrap_or_default();
            if tokio::time::timeout(remaining, driver).await.is_err() {
                log::warn!(
                    "tp({}): interface task abandoned after {}s join budget",
                    self.name,
                    INTERFACE_JOIN_BUDGET.as_secs()
                );
            }
        }

        self.handler.lock().await.persist_state_with(&names).await;
        log::info!("tp({}): stopped", self.name);
    }

    /// Records the spawned task driving an interface so `stop()` can give
    /// it a bounded join instead of abandoning it outright.
    pub async fn attach_driver(
        &self,
        address: &AddressHash,
        handle: tokio::task::JoinHandle<()>,
    ) {
        self.iface_manager.lock().await.attach_driver(address, handle);
    }

    /// External network-type change signal: reconnecting drivers drop back
    /// to their shortest retry interval and try again immediately.
    pub async fn notify_network_change(&self) {
        self.iface_manager.lock().await.notify_network_change();
    }

    /// Registers an interface and returns the driver-side channel. Restored
    /// paths and tunnel announces bound to the interface's name come back
    /// to life here.
    pub async fn register_interface(
        &self,
        properties: InterfaceProperties,
    ) -> InterfaceChannel {
        let mut handler = self.handler.lock().await;
        let channel = self.iface_manager.lock().await.register(properties.clone());
        handler.adopt_interface(&properties, channel.address).await;
        channel
    }

    pub async fn deregister_interface(&self, address: &AddressHash) {
        let mut handler = self.handler.lock().await;
        self.iface_manager.lock().await.deregister(address);
        handler.announce_queue.remove_iface(address);
        let now = epoch_secs();
        handler.path_table.cull(now, |iface| iface != address);
    }

    pub async fn register_destination(
        &self,
        destination: SingleInputDestination,
    ) -> Arc<Mutex<SingleInputDestination>> {
        let address = destination.address_hash;
        let destination = Arc::new(Mutex::new(destination));
        self.handler.lock().await.in_destinations.insert(address, destination.clone());
        destination
    }

    pub async fn deregister_destination(&self, address: &AddressHash) {
        self.handler.lock().await.in_destinations.remove(address);
    }

    /// Builds and transmits an announce for a registered destination.
    pub async fn announce(
        &self,
        destination: &Arc<Mutex<SingleInputDestination>>,
        app_data: Option<&[u8]>,
    ) -> Result<SendOutcome, MeshError> {
        let packet = destination.lock().await.announce(OsRng, app_data)?;
        self.outbound(packet).await
    }

    /// Entry point for every received frame.
    pub async fn inbound(&self, raw: &[u8], iface: AddressHash) -> Result<(), MeshError> {
        let mut handler = self.handler.lock().await;
        if !handler.started {
            return Err(MeshError::TransportNotStarted);
        }
        handler.process_inbound(raw, iface).await;
        Ok(())
    }

    /// Entry point for every locally produced packet.
    pub async fn outbound(&self, packet: Packet) -> Result<SendOutcome, MeshError> {
        let mut handler = self.handler.lock().await;
        if !handler.started {
            return Err(MeshError::TransportNotStarted);
        }
        Ok(handler.dispatch_outbound(packet, false).await)
    }

    /// Like `outbound`, but tracks a delivery receipt for the packet.
    /// Resolution arrives on the delivery event stream.
    pub async fn send_with_receipt(
        &self,
        packet: Packet,
    ) -> Result<(AddressHash, SendOutcome), MeshError> {
        let mut handler = self.handler.lock().await;
        if !handler.started {
            return Err(MeshError::TransportNotStarted);
        }
        let hash = packet.hash();
        let outcome = handler.dispatch_outbound(packet, true).await;
        Ok((hash, outcome))
    }

    /// Broadcasts a path request for an unknown destination.
    pub async fn request_path(&self, destination: &AddressHash) -> Result<(), MeshError> {
        let mut handler = self.handler.lock().await;
        if !handler.started {
            return Err(MeshError::TransportNotStarted);
        }
        let packet = handler.path_requests.generate(destination, None);
        handler.dispatch_outbound(packet, false).await;
        Ok(())
    }

    pub async fn has_path(&self, destination: &AddressHash) -> bool {
        self.handler.lock().await.path_table.has_path(destination, epoch_secs())
    }

    pub async fn hops_to(&self, destination: &AddressHash) -> Option<u8> {
        self.handler.lock().await.path_table.hops_to(destination)
    }

    /// Initiates a link to a remote destination known from an announce.
    /// Progress arrives on the link event stream.
    pub async fn establish_link(
        &self,
        destination: crate::destination::DestinationDesc,
    ) -> Result<Arc<Mutex<Link>>, MeshError> {
        let mut handler = self.handler.lock().await;
        if !handler.started {
            return Err(MeshError::TransportNotStarted);
        }

        let mut link = Link::new(destination, handler.link_event_tx.clone());
        if handler.config.link_mtu_discovery {
            link.set_mtu_discovery(true, crate::packet::PACKET_MDU);
        }
        if let Some(hops) = handler.path_table.hops_to(&destination.address_hash) {
            link.set_expected_hops(hops);
        }
        let packet = link.establishment_packet()?;
        let link_id = *link.id();

        let link = Arc::new(Mutex::new(link));
        handler.out_links.insert(link_id, link.clone());
        handler.dispatch_outbound(packet, false).await;
        Ok(link)
    }

    /// Runs one round of the periodic maintenance jobs. Exposed for
    /// platform timers that replace the internal tick loop while the
    /// process is backgrounded.
    pub async fn run_maintenance_jobs(&self) {
        jobs::run_jobs(&self.handler, &self.power, true).await;
    }

    pub fn recv_announces(&self) -> broadcast::Receiver<AnnounceEvent> {
        self.announce_tx.subscribe()
    }

    pub fn link_events(&self) -> broadcast::Receiver<LinkEventData> {
        self.link_event_tx.subscribe()
    }

    pub fn received_data(&self) -> broadcast::Receiver<ReceivedData> {
        self.data_tx.subscribe()
    }

    pub fn delivery_events(&self) -> broadcast::Receiver<DeliveryEvent> {
        self.delivery_tx.subscribe()
    }

    pub fn power_state(&self) -> Arc<PowerState> {
        self.power.clone()
    }

    pub async fn drop_counters(&self) -> DropCounters {
        self.handler.lock().await.counters
    }

    pub async fn known_identity(&self, destination: &AddressHash) -> Option<Identity> {
        self.handler.lock().await.known_destinations.recall_identity(destination)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Hash of the daemon identity; transport-rewritten packets carry it as
    /// their transport id.
    pub async fn address_hash(&self) -> AddressHash {
        *self.handler.lock().await.identity.address_hash()
    }

    /// Shared interface registry, needed by drivers that register further
    /// interfaces themselves (one per accepted connection).
    pub fn interface_manager(&self) -> Arc<Mutex<InterfaceManager>> {
        self.iface_manager.clone()
    }

    /// Low-memory response: halves the hashlist and sheds receipts past
    /// half their timeout. Wired to platform memory-pressure signals by the
    /// embedder.
    pub async fn handle_low_memory(&self) {
        let mut handler = self.handler.lock().await;
        let capacity = handler.config.hashlist_capacity / 2;
        handler.hashlist.shrink_to(capacity.max(1));
        handler.receipts.shed(std::time::Instant::now());
        log::info!("tp({}): low-memory shed complete", self.name);
    }
}

/// Pumps frames from the interface channels into the inbound pipeline.
async fn inbound_pump(
    handler: Arc<Mutex<TransportHandler>>,
    rx_receiver: Arc<Mutex<RxReceiver>>,
    cancel: CancellationToken,
) {
    let mut rx_receiver = rx_receiver.lock().await;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            message = rx_receiver.recv() => {
                let Some(message) = message else {
                    break;
                };
                let mut handler = handler.lock().await;
                if handler.started {
                    handler.process_inbound(&message.raw, message.iface).await;
                }
            }
        }
    }
}
