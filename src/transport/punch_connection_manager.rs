use std::net::SocketAddr;
use std::time::Duration;

use rustc_hash::FxHashMap;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::config::NetworkConfig;
use crate::transport::connection_id::ConnectionId;
use crate::transport::connection_manager::{ConnectionCallbacks, ConnectionFailure, ConnectionManager, ConnectionRegistry};
use crate::transport::nat_punch::{NatFacilitator, NatPunchClient, NatPunchId};
use crate::transport::Transport;

#[derive(Debug)]
enum PunchOutcome {
    Succeeded(NatPunchId, SocketAddr),
    Failed(NatPunchId),
}

struct PunchRequest {
    public_endpoint: SocketAddr,
    callbacks: ConnectionCallbacks,
}

/// Connects to peers behind NATs: first a punch-through is requested from the facilitator, and
///  only when that succeeds is a transport connection opened, to the endpoint the facilitator
///  reported.
///
/// Punch outcomes are reported by the punch client's callbacks through a channel and are acted
///  upon in [ConnectionManager::update], so the transport is only touched from there.
pub struct PunchThroughConnectionManager<F: NatFacilitator> {
    punch_client: NatPunchClient<F>,
    punch_requests: FxHashMap<NatPunchId, PunchRequest>,
    registry: ConnectionRegistry,
    outcome_send: mpsc::UnboundedSender<PunchOutcome>,
    outcome_recv: mpsc::UnboundedReceiver<PunchOutcome>,
}

impl <F: NatFacilitator> PunchThroughConnectionManager<F> {
    pub fn new(punch_client: NatPunchClient<F>, connection_attempt_timeout: Duration) -> PunchThroughConnectionManager<F> {
        let (outcome_send, outcome_recv) = mpsc::unbounded_channel();
        PunchThroughConnectionManager {
            punch_client,
            punch_requests: FxHashMap::default(),
            registry: ConnectionRegistry::new(connection_attempt_timeout),
            outcome_send,
            outcome_recv,
        }
    }

    pub fn from_config(facilitator: F, config: &NetworkConfig) -> PunchThroughConnectionManager<F> {
        PunchThroughConnectionManager::new(
            NatPunchClient::from_config(facilitator, config),
            config.connection_attempt_timeout,
        )
    }

    pub fn punch_client(&mut self) -> &mut NatPunchClient<F> {
        &mut self.punch_client
    }

    pub fn num_punch_requests(&self) -> usize {
        self.punch_requests.len()
    }

    pub fn num_connecting(&self) -> usize {
        self.registry.num_attempts()
    }

    pub fn num_connected(&self) -> usize {
        self.registry.num_connections()
    }

    fn on_punch_outcome(&mut self, transport: &mut dyn Transport, outcome: PunchOutcome) {
        match outcome {
            PunchOutcome::Succeeded(id, endpoint) => {
                if let Some(request) = self.punch_requests.remove(&id) {
                    debug!(%id, ?endpoint, "NAT introduction succeeded, connecting");
                    self.registry.start_connecting(transport, request.public_endpoint, endpoint, request.callbacks);
                }
            }
            PunchOutcome::Failed(id) => {
                if let Some(request) = self.punch_requests.remove(&id) {
                    info!(%id, endpoint = ?request.public_endpoint, "could not connect: NAT punch-through failed");
                    (request.callbacks.on_failure)(request.public_endpoint, ConnectionFailure::PunchFailed);
                }
            }
        }
    }

    pub fn dispose(&mut self) {
        self.punch_client.dispose();
    }
}

impl <F: NatFacilitator> ConnectionManager for PunchThroughConnectionManager<F> {
    fn connect(&mut self, _transport: &mut dyn Transport, endpoint: SocketAddr, callbacks: ConnectionCallbacks) {
        let on_success_send = self.outcome_send.clone();
        let on_failure_send = self.outcome_send.clone();

        let id = self.punch_client.punch(
            endpoint,
            Box::new(move |id, actual| {
                if on_success_send.send(PunchOutcome::Succeeded(id, actual)).is_err() {
                    debug!("punch {:?} succeeded after its connection manager was dropped", id);
                }
            }),
            Box::new(move |id| {
                if on_failure_send.send(PunchOutcome::Failed(id)).is_err() {
                    debug!("punch {:?} failed after its connection manager was dropped", id);
                }
            }),
        );
        self.punch_requests.insert(id, PunchRequest {
            public_endpoint: endpoint,
            callbacks,
        });
    }

    fn disconnect(&mut self, transport: &mut dyn Transport, connection_id: ConnectionId) {
        transport.disconnect(connection_id);
    }

    fn on_connection_opened(&mut self, connection_id: ConnectionId, endpoint: SocketAddr) {
        self.registry.on_connection_opened(connection_id, endpoint);
    }

    fn on_connection_closed(&mut self, connection_id: ConnectionId) {
        self.registry.on_connection_closed(connection_id);
    }

    fn on_nat_punch_successful(&mut self, token: NatPunchId, endpoint: SocketAddr) {
        self.punch_client.on_punch_success(token, endpoint);
    }

    fn update(&mut self, transport: &mut dyn Transport) {
        self.punch_client.update();

        while let Ok(outcome) = self.outcome_recv.try_recv() {
            self.on_punch_outcome(transport, outcome);
        }

        self.registry.expire_attempts(transport);
        self.punch_client.flush(transport);
    }
}
