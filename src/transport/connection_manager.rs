use std::net::SocketAddr;
use std::time::Duration;

use rustc_hash::FxHashMap;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::NetworkConfig;
use crate::transport::connection_id::ConnectionId;
use crate::transport::nat_punch::NatPunchId;
use crate::transport::Transport;

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum ConnectionFailure {
    PunchFailed,
    TimedOut,
    Refused,
    Transport(String),
}

/// Outcome notifications of a single connection request. Exactly one of `on_established` and
///  `on_failure` is called; `on_disconnected` follows an established connection when it closes.
pub struct ConnectionCallbacks {
    pub on_established: Box<dyn FnOnce(ConnectionId, SocketAddr) + Send>,
    pub on_failure: Box<dyn FnOnce(SocketAddr, ConnectionFailure) + Send>,
    pub on_disconnected: Box<dyn FnOnce(ConnectionId) + Send>,
}

impl ConnectionCallbacks {
    pub fn new(
        on_established: impl FnOnce(ConnectionId, SocketAddr) + Send + 'static,
        on_failure: impl FnOnce(SocketAddr, ConnectionFailure) + Send + 'static,
    ) -> ConnectionCallbacks {
        ConnectionCallbacks {
            on_established: Box::new(on_established),
            on_failure: Box::new(on_failure),
            on_disconnected: Box::new(|_| {}),
        }
    }

    pub fn with_on_disconnected(mut self, on_disconnected: impl FnOnce(ConnectionId) + Send + 'static) -> ConnectionCallbacks {
        self.on_disconnected = Box::new(on_disconnected);
        self
    }
}

/// Establishes outgoing connections. Implementations are driven by the network system: transport
///  connection events are forwarded to them, and `update` is called once per tick.
pub trait ConnectionManager: Send {
    fn connect(&mut self, transport: &mut dyn Transport, endpoint: SocketAddr, callbacks: ConnectionCallbacks);

    fn disconnect(&mut self, transport: &mut dyn Transport, connection_id: ConnectionId);

    fn on_connection_opened(&mut self, connection_id: ConnectionId, endpoint: SocketAddr);

    fn on_connection_closed(&mut self, connection_id: ConnectionId);

    /// The facilitator reports that a punch-through attempt succeeded. Managers that do not
    ///  punch ignore this.
    fn on_nat_punch_successful(&mut self, _token: NatPunchId, _endpoint: SocketAddr) {}

    fn update(&mut self, transport: &mut dyn Transport);
}


struct Registration {
    started: Instant,
    public_endpoint: SocketAddr,
    callbacks: ConnectionCallbacks,
}

/// Pending and established connections, shared by the connection manager implementations
pub(crate) struct ConnectionRegistry {
    connection_attempt_timeout: Duration,
    attempts: FxHashMap<ConnectionId, Registration>,
    connections: FxHashMap<ConnectionId, Box<dyn FnOnce(ConnectionId) + Send>>,
}

impl ConnectionRegistry {
    pub(crate) fn new(connection_attempt_timeout: Duration) -> ConnectionRegistry {
        ConnectionRegistry {
            connection_attempt_timeout,
            attempts: FxHashMap::default(),
            connections: FxHashMap::default(),
        }
    }

    /// Asks the transport for a connection and tracks it until it is opened, closed or times out
    pub(crate) fn start_connecting(&mut self, transport: &mut dyn Transport, public_endpoint: SocketAddr, connect_to: SocketAddr, callbacks: ConnectionCallbacks) {
        match transport.connect(connect_to) {
            Ok(connection_id) => {
                debug!(?connection_id, ?connect_to, "connecting");
                self.attempts.insert(connection_id, Registration {
                    started: Instant::now(),
                    public_endpoint,
                    callbacks,
                });
            }
            Err(e) => {
                warn!(?connect_to, "transport refused to connect: {}", e);
                (callbacks.on_failure)(public_endpoint, ConnectionFailure::Transport(e.to_string()));
            }
        }
    }

    pub(crate) fn on_connection_opened(&mut self, connection_id: ConnectionId, endpoint: SocketAddr) {
        if let Some(registration) = self.attempts.remove(&connection_id) {
            info!(?connection_id, ?endpoint, "connection established");
            (registration.callbacks.on_established)(connection_id, endpoint);
            self.connections.insert(connection_id, registration.callbacks.on_disconnected);
        }
    }

    pub(crate) fn on_connection_closed(&mut self, connection_id: ConnectionId) {
        if let Some(on_disconnected) = self.connections.remove(&connection_id) {
            info!(?connection_id, "disconnected");
            on_disconnected(connection_id);
        }
        else if let Some(registration) = self.attempts.remove(&connection_id) {
            info!(?connection_id, "connection attempt was refused");
            (registration.callbacks.on_failure)(registration.public_endpoint, ConnectionFailure::Refused);
        }
    }

    pub(crate) fn expire_attempts(&mut self, transport: &mut dyn Transport) {
        let now = Instant::now();
        let expired = self.attempts.iter()
            .filter(|(_, r)| now.duration_since(r.started) > self.connection_attempt_timeout)
            .map(|(id, _)| *id)
            .collect::<Vec<_>>();

        for connection_id in expired {
            if let Some(registration) = self.attempts.remove(&connection_id) {
                info!(?connection_id, endpoint = ?registration.public_endpoint, "connection attempt timed out");
                transport.disconnect(connection_id);
                (registration.callbacks.on_failure)(registration.public_endpoint, ConnectionFailure::TimedOut);
            }
        }
    }

    pub(crate) fn num_attempts(&self) -> usize {
        self.attempts.len()
    }

    pub(crate) fn num_connections(&self) -> usize {
        self.connections.len()
    }
}


/// Connects straight to the given endpoint, for peers that are reachable without NAT traversal
pub struct DirectConnectionManager {
    registry: ConnectionRegistry,
}

impl DirectConnectionManager {
    pub fn new(connection_attempt_timeout: Duration) -> DirectConnectionManager {
        DirectConnectionManager {
            registry: ConnectionRegistry::new(connection_attempt_timeout),
        }
    }

    pub fn from_config(config: &NetworkConfig) -> DirectConnectionManager {
        DirectConnectionManager::new(config.connection_attempt_timeout)
    }

    pub fn num_pending(&self) -> usize {
        self.registry.num_attempts()
    }

    pub fn num_connected(&self) -> usize {
        self.registry.num_connections()
    }
}

impl ConnectionManager for DirectConnectionManager {
    fn connect(&mut self, transport: &mut dyn Transport, endpoint: SocketAddr, callbacks: ConnectionCallbacks) {
        self.registry.start_connecting(transport, endpoint, endpoint, callbacks);
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

    fn update(&mut self, transport: &mut dyn Transport) {
        self.registry.expire_attempts(transport);
    }
}


#[cfg(test)]
pub(crate) mod tests {
    use std::sync::{Arc, Mutex};

    use tokio::time::advance;

    use crate::test_util::transport::TrackingTransport;
    use super::*;

    #[derive(Debug, Clone, Eq, PartialEq)]
    pub(crate) enum Outcome {
        Established(ConnectionId, SocketAddr),
        Failed(SocketAddr, ConnectionFailure),
        Disconnected(ConnectionId),
    }

    #[derive(Default, Clone)]
    pub(crate) struct OutcomeLog(Arc<Mutex<Vec<Outcome>>>);

    impl OutcomeLog {
        pub(crate) fn callbacks(&self) -> ConnectionCallbacks {
            let established = self.0.clone();
            let failed = self.0.clone();
            let disconnected = self.0.clone();
            ConnectionCallbacks::new(
                move |id, endpoint| established.lock().unwrap().push(Outcome::Established(id, endpoint)),
                move |endpoint, failure| failed.lock().unwrap().push(Outcome::Failed(endpoint, failure)),
            )
                .with_on_disconnected(move |id| disconnected.lock().unwrap().push(Outcome::Disconnected(id)))
        }

        pub(crate) fn get(&self) -> Vec<Outcome> {
            self.0.lock().unwrap().clone()
        }
    }

    pub(crate) fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([10, 0, 0, 2], port))
    }

    #[test]
    fn test_connect_and_disconnect() {
        let mut transport = TrackingTransport::new(4);
        let mut manager = DirectConnectionManager::new(Duration::from_secs(10));
        let log = OutcomeLog::default();

        manager.connect(&mut transport, addr(1), log.callbacks());
        assert_eq!(transport.connects(), vec![addr(1)]);
        assert_eq!(manager.num_pending(), 1);

        manager.on_connection_opened(ConnectionId(0), addr(1));
        assert_eq!(log.get(), vec![Outcome::Established(ConnectionId(0), addr(1))]);
        assert_eq!(manager.num_pending(), 0);
        assert_eq!(manager.num_connected(), 1);

        manager.on_connection_closed(ConnectionId(0));
        manager.on_connection_closed(ConnectionId(0));
        assert_eq!(log.get(), vec![
            Outcome::Established(ConnectionId(0), addr(1)),
            Outcome::Disconnected(ConnectionId(0)),
        ]);
    }

    #[test]
    fn test_unrelated_connections_are_ignored() {
        let mut manager = DirectConnectionManager::new(Duration::from_secs(10));
        manager.on_connection_opened(ConnectionId(3), addr(1));
        manager.on_connection_closed(ConnectionId(3));
        assert_eq!(manager.num_connected(), 0);
    }

    #[test]
    fn test_closed_while_connecting_is_failure() {
        let mut transport = TrackingTransport::new(4);
        let mut manager = DirectConnectionManager::new(Duration::from_secs(10));
        let log = OutcomeLog::default();

        manager.connect(&mut transport, addr(1), log.callbacks());
        manager.on_connection_closed(ConnectionId(0));
        assert_eq!(log.get(), vec![Outcome::Failed(addr(1), ConnectionFailure::Refused)]);
    }

    #[test]
    fn test_transport_error_is_failure() {
        let mut transport = TrackingTransport::new(0);
        let mut manager = DirectConnectionManager::new(Duration::from_secs(10));
        let log = OutcomeLog::default();

        manager.connect(&mut transport, addr(1), log.callbacks());
        assert!(matches!(log.get().as_slice(), [Outcome::Failed(_, ConnectionFailure::Transport(_))]));
        assert_eq!(manager.num_pending(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_attempt_times_out_once() {
        let mut transport = TrackingTransport::new(4);
        let mut manager = DirectConnectionManager::new(Duration::from_secs(10));
        let log = OutcomeLog::default();

        manager.connect(&mut transport, addr(1), log.callbacks());

        advance(Duration::from_secs(10)).await;
        manager.update(&mut transport);
        assert!(log.get().is_empty());

        advance(Duration::from_millis(1)).await;
        manager.update(&mut transport);
        manager.update(&mut transport);
        assert_eq!(log.get(), vec![Outcome::Failed(addr(1), ConnectionFailure::TimedOut)]);
        assert_eq!(transport.disconnects(), vec![ConnectionId(0)]);

        // a late open for the expired attempt does not resurrect it
        manager.on_connection_opened(ConnectionId(0), addr(1));
        assert_eq!(log.get().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_attempt_timeout_from_config() {
        let mut config = NetworkConfig::new();
        config.connection_attempt_timeout = Duration::from_secs(3);

        let mut transport = TrackingTransport::new(4);
        let mut manager = DirectConnectionManager::from_config(&config);
        let log = OutcomeLog::default();

        manager.connect(&mut transport, addr(1), log.callbacks());

        advance(Duration::from_secs(3)).await;
        manager.update(&mut transport);
        assert!(log.get().is_empty());

        advance(Duration::from_millis(1)).await;
        manager.update(&mut transport);
        assert_eq!(log.get(), vec![Outcome::Failed(addr(1), ConnectionFailure::TimedOut)]);
    }
}
