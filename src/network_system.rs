//! Assembles transport, routing, replication and connection management into one system that is
//!  driven by a tick: [NetworkSystem::update] drains the transport's events, [NetworkSystem::flush]
//!  sends everything that was queued while handling them.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::bail;
use tokio::select;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, trace, warn};

use crate::config::NetworkConfig;
use crate::messaging::basic_messages::{CreateObject, DeleteObject, HostInfoResponse, NatPunchSuccessful, Ping, Pong, ReplicatePreExistingObject, RequestHostInfo, ToObject};
use crate::messaging::group_router::{ConnectionEvent, HasTransportGroups, TransportGroupId, TransportGroupRouter, TransportGroups};
use crate::messaging::message_router::MessageRouter;
use crate::messaging::message_sender::MessageSenderExt;
use crate::messaging::message_types::{MessageTypes, ObjectMessage};
use crate::messaging::queue::QueueingMessageSender;
use crate::replication::object::{ObjectId, ObjectRole};
use crate::replication::replication::{create_from_message, remove_all, remove_player, replicate_everything, replicate_pre_existing_from_message};
use crate::replication::replicator::Replicator;
use crate::replication::store::ReplicatedObjectStore;
use crate::transport::connection_id::ConnectionId;
use crate::transport::connection_manager::{ConnectionCallbacks, ConnectionManager};
use crate::transport::{LatencyTable, Transport, TransportEvent};
use crate::util::buffer_pool::BufferPool;
use crate::util::clock::{Clock, MonotonicClock};

/// Everything message and connection handlers work with
pub struct NetworkContext {
    pub groups: TransportGroups,
    pub sender: QueueingMessageSender,
    pub replicator: Replicator,
    pub latency: Arc<LatencyTable>,
    pub clock: Arc<dyn Clock>,
    pub fixed_clock: Arc<dyn Clock>,
    pub object_message_group: TransportGroupId,
}

impl NetworkContext {
    pub fn store(&self) -> &ReplicatedObjectStore {
        self.replicator.store()
    }

    pub fn store_mut(&mut self) -> &mut ReplicatedObjectStore {
        self.replicator.store_mut()
    }

    pub fn send_object_message<M: ObjectMessage>(&mut self, object_id: ObjectId, message: M, recipients: ObjectRole) -> anyhow::Result<()> {
        let object = self.replicator.store_mut().find_mut(object_id)?;
        object.send(message, recipients, &self.groups, &mut self.sender)
    }

    fn pong_for(&self, ping: &Ping) -> Pong {
        Pong {
            sender_timestamp: ping.timestamp,
            sender_fixed_timestamp: ping.fixed_timestamp,
            timestamp: self.clock.current_time(),
            fixed_timestamp: self.fixed_clock.current_time(),
        }
    }
}

impl HasTransportGroups for NetworkContext {
    fn transport_groups(&self) -> &TransportGroups {
        &self.groups
    }

    fn transport_groups_mut(&mut self) -> &mut TransportGroups {
        &mut self.groups
    }
}


pub struct NetworkSystem<T: Transport> {
    transport: T,
    message_types: Arc<MessageTypes>,
    context: NetworkContext,
    group_router: TransportGroupRouter<NetworkContext>,
    unconnected_router: MessageRouter<NetworkContext>,
    connection_manager: Box<dyn ConnectionManager>,
    connection_manager_router: MessageRouter<dyn ConnectionManager>,
    tick_interval: Duration,
}

impl <T: Transport> NetworkSystem<T> {
    pub fn new(config: NetworkConfig, transport: T, message_types: Arc<MessageTypes>, connection_manager: Box<dyn ConnectionManager>) -> anyhow::Result<NetworkSystem<T>> {
        config.validate()?;
        if transport.max_connections() < config.max_connections() {
            bail!("transport supports {} connections, but the transport groups need {}", transport.max_connections(), config.max_connections());
        }

        let latency = Arc::new(LatencyTable::new(transport.max_connections()));
        let pool = Arc::new(BufferPool::new(config.buffer_size, config.max_pooled_buffers));
        let mut store = ReplicatedObjectStore::new(message_types.clone(), latency.clone(), pool, config.object_message_group, config.initial_object_capacity);
        store.set_max_object_id(ObjectId(config.max_object_id));

        let mut connection_manager_router = MessageRouter::<dyn ConnectionManager>::new(message_types.clone());
        connection_manager_router.register_handler(|manager, _, _, message: NatPunchSuccessful, _| {
            manager.on_nat_punch_successful(message.token, message.endpoint);
            Ok(())
        })?;

        info!(max_connections = config.max_connections(), tick_interval = ?config.tick_interval, "initializing network system");

        Ok(NetworkSystem {
            transport,
            message_types: message_types.clone(),
            context: NetworkContext {
                groups: TransportGroups::new(config.transport_groups.iter().cloned()),
                sender: QueueingMessageSender::new(message_types.clone(), config.max_packet_size),
                replicator: Replicator::new(store, config.object_id_growth),
                latency,
                clock: Arc::new(MonotonicClock::new()),
                fixed_clock: Arc::new(MonotonicClock::new()),
                object_message_group: config.object_message_group,
            },
            group_router: TransportGroupRouter::new(),
            unconnected_router: MessageRouter::new(message_types),
            connection_manager,
            connection_manager_router,
            tick_interval: config.tick_interval,
        })
    }

    pub fn context(&self) -> &NetworkContext {
        &self.context
    }

    pub fn context_mut(&mut self) -> &mut NetworkContext {
        &mut self.context
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn group_router_mut(&mut self) -> &mut TransportGroupRouter<NetworkContext> {
        &mut self.group_router
    }

    /// handlers for datagrams that arrive outside of any connection
    pub fn unconnected_router_mut(&mut self) -> &mut MessageRouter<NetworkContext> {
        &mut self.unconnected_router
    }

    /// An empty router for this system's message types, to be installed as a group's data handler
    pub fn new_message_router(&self) -> MessageRouter<NetworkContext> {
        MessageRouter::new(self.message_types.clone())
    }

    pub fn connect(&mut self, endpoint: SocketAddr, callbacks: ConnectionCallbacks) {
        debug!(?endpoint, "connecting");
        self.connection_manager.connect(&mut self.transport, endpoint, callbacks);
    }

    /// Closes a connection and notifies the local handlers right away, without waiting for the
    ///  transport to report it
    pub fn disconnect(&mut self, connection_id: ConnectionId) {
        debug!(?connection_id, "disconnecting");
        self.connection_manager.disconnect(&mut self.transport, connection_id);
        self.on_connection_closed(connection_id);
    }

    /// Drains all pending transport events and advances the connection manager
    pub fn update(&mut self) {
        while let Some(event) = self.transport.poll_event() {
            self.on_transport_event(event);
        }
        self.connection_manager.update(&mut self.transport);
    }

    pub fn flush(&mut self) {
        self.context.sender.flush(&mut self.transport);
    }

    pub fn tick(&mut self) {
        self.update();
        self.flush();
    }

    /// Ticks at the configured interval until `shutdown` completes, then sends whatever is still
    ///  queued
    pub async fn run(&mut self, shutdown: impl Future<Output=()>) {
        let mut ticks = interval(self.tick_interval);
        ticks.set_missed_tick_behavior(MissedTickBehavior::Skip);
        tokio::pin!(shutdown);

        info!("starting network loop");
        loop {
            select! {
                _ = ticks.tick() => self.tick(),
                _ = &mut shutdown => break,
            }
        }
        info!("shutting down network loop");
        self.flush();
    }

    fn on_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::ConnectionOpened { connection_id, endpoint } => {
                self.group_router.on_connection_opened(&mut self.context, connection_id, endpoint);
                self.connection_manager.on_connection_opened(connection_id, endpoint);
            }
            TransportEvent::ConnectionClosed { connection_id } => {
                self.on_connection_closed(connection_id);
            }
            TransportEvent::DataReceived { connection_id, endpoint, data } => {
                if let Err(e) = self.group_router.on_data(&mut self.context, connection_id, endpoint, &data) {
                    error!(?connection_id, ?endpoint, "protocol violation, disconnecting: {}", e);
                    self.disconnect(connection_id);
                }
            }
            TransportEvent::UnconnectedDataReceived { endpoint, data } => {
                if let Err(e) = self.connection_manager_router.dispatch(&mut *self.connection_manager, ConnectionId::NO_CONNECTION, endpoint, &data) {
                    warn!(?endpoint, "invalid unconnected datagram: {}", e);
                    return;
                }
                if let Err(e) = self.unconnected_router.dispatch(&mut self.context, ConnectionId::NO_CONNECTION, endpoint, &data) {
                    warn!(?endpoint, "invalid unconnected datagram: {}", e);
                }
            }
            TransportEvent::RoundTripTimeSampled { connection_id, round_trip_time } => {
                trace!(?connection_id, ?round_trip_time, "round trip time sample");
                self.context.latency.on_round_trip_time(connection_id, round_trip_time);
            }
        }
    }

    fn on_connection_closed(&mut self, connection_id: ConnectionId) {
        self.context.latency.clear(connection_id);
        self.connection_manager.on_connection_closed(connection_id);
        self.group_router.on_connection_closed(&mut self.context, connection_id);
    }
}


fn to_object(ctx: &mut NetworkContext, connection_id: ConnectionId, _endpoint: SocketAddr, message: ToObject, buf: &mut &[u8]) -> anyhow::Result<()> {
    ctx.store_mut().dispatch_message_from_buf(connection_id, message.receiver, buf)
}

/// Answers pings and forwards object messages to their objects
pub fn install_basic_server_handlers(router: &mut MessageRouter<NetworkContext>) -> anyhow::Result<()> {
    router
        .register_handler(|ctx: &mut NetworkContext, connection_id, _, ping: Ping, _| {
            let pong = ctx.pong_for(&ping);
            ctx.sender.send_message(connection_id, pong)
        })?
        .register_handler(to_object)?;
    Ok(())
}

/// Mirrors the objects the host announces, forwards object messages and tracks latency from pongs
pub fn install_basic_client_handlers(router: &mut MessageRouter<NetworkContext>) -> anyhow::Result<()> {
    router
        .register_handler(|ctx: &mut NetworkContext, connection_id, _, message: CreateObject, _| {
            create_from_message(ctx.store_mut(), connection_id, &message)
        })?
        .register_handler(|ctx: &mut NetworkContext, connection_id, _, message: ReplicatePreExistingObject, _| {
            replicate_pre_existing_from_message(ctx.store_mut(), connection_id, &message)
        })?
        .register_handler(|ctx: &mut NetworkContext, connection_id, _, message: DeleteObject, _| {
            ctx.store_mut().remove_replicated_instance(connection_id, message.object_id);
            Ok(())
        })?
        .register_handler(to_object)?
        .register_handler(|ctx: &mut NetworkContext, connection_id, _, pong: Pong, _| {
            let round_trip = ctx.clock.current_time() - pong.sender_timestamp;
            if round_trip.is_finite() && round_trip >= 0.0 {
                ctx.latency.on_round_trip_time(connection_id, Duration::from_secs_f64(round_trip));
            }
            else {
                debug!(?connection_id, round_trip, "ignoring pong with implausible timestamp");
            }
            Ok(())
        })?;
    Ok(())
}

/// Answers pings and host info requests from peers that are not connected
pub fn install_unconnected_handlers(
    router: &mut MessageRouter<NetworkContext>,
    player_count: impl Fn(&NetworkContext) -> u16 + Send + 'static,
) -> anyhow::Result<()> {
    router
        .register_handler(|ctx: &mut NetworkContext, _, endpoint, ping: Ping, _| {
            let pong = ctx.pong_for(&ping);
            ctx.sender.send_message_unconnected(endpoint, pong)
        })?
        .register_handler(move |ctx: &mut NetworkContext, _, endpoint, request: RequestHostInfo, _| {
            let response = HostInfoResponse {
                sender_timestamp: request.timestamp,
                player_count: player_count(ctx),
            };
            ctx.sender.send_message_unconnected(endpoint, response)
        })?;
    Ok(())
}

/// Brings new peers up to date with all objects, and cleans up after departed ones
pub fn server_connection_handler() -> impl FnMut(&mut NetworkContext, ConnectionEvent) + Send {
    |ctx: &mut NetworkContext, event: ConnectionEvent| match event {
        ConnectionEvent::Established { connection_id, endpoint } => {
            info!(?connection_id, ?endpoint, "peer connected");
            if let Err(e) = replicate_everything(&mut ctx.sender, connection_id, ctx.replicator.store()) {
                error!(?connection_id, "error replicating objects to new peer: {}", e);
            }
        }
        ConnectionEvent::Disconnected { connection_id } => {
            info!(?connection_id, "peer disconnected");
            let others = ctx.groups.active_connections(ctx.object_message_group).to_vec();
            if let Err(e) = remove_player(&mut ctx.sender, connection_id, &others, &mut ctx.replicator) {
                error!(?connection_id, "error removing the objects of a departed peer: {}", e);
            }
        }
    }
}

/// Drops the objects of the host when the connection to it goes away
pub fn client_connection_handler() -> impl FnMut(&mut NetworkContext, ConnectionEvent) + Send {
    |ctx: &mut NetworkContext, event: ConnectionEvent| match event {
        ConnectionEvent::Established { connection_id, endpoint } => {
            info!(?connection_id, ?endpoint, "connected to host");
        }
        ConnectionEvent::Disconnected { connection_id } => {
            info!(?connection_id, "disconnected from host");
            remove_all(ctx.store_mut(), connection_id);
        }
    }
}
