//! The boundary to the datagram transport. Everything in this crate talks to the network through
//!  the [Transport] trait; connection handling, packet delivery guarantees and socket I/O are the
//!  implementation's business.

pub mod connection_id;
pub mod connection_manager;
pub mod nat_punch;
pub mod punch_connection_manager;

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use bytes::Bytes;
#[cfg(test)] use mockall::automock;
use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::transport::connection_id::ConnectionId;

/// Delivery guarantees of a transport channel. Sequenced modes drop packets that arrive after a
///  newer one, ordered modes deliver in send order, reliable modes guarantee eventual delivery.
///
/// The numeric order is used to group outgoing packets, it carries no other meaning.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum DeliveryMode {
    Unreliable = 0,
    UnreliableSequenced = 1,
    ReliableUnordered = 2,
    ReliableSequenced = 3,
    ReliableOrdered = 4,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum TransportEvent {
    ConnectionOpened {
        connection_id: ConnectionId,
        endpoint: SocketAddr,
    },
    ConnectionClosed {
        connection_id: ConnectionId,
    },
    DataReceived {
        connection_id: ConnectionId,
        endpoint: SocketAddr,
        data: Bytes,
    },
    UnconnectedDataReceived {
        endpoint: SocketAddr,
        data: Bytes,
    },
    RoundTripTimeSampled {
        connection_id: ConnectionId,
        round_trip_time: Duration,
    },
}

/// A transport may run its own I/O thread, but it hands events to the core only through
///  [Transport::poll_event] which is called from the tick loop.
///
/// Connection ids must come from a fixed range `0..max_connections()`.
#[cfg_attr(test, automock)]
pub trait Transport: Send {
    fn max_connections(&self) -> usize;

    fn connect(&mut self, endpoint: SocketAddr) -> anyhow::Result<ConnectionId>;

    fn disconnect(&mut self, connection_id: ConnectionId);

    fn send(&mut self, connection_id: ConnectionId, delivery_mode: DeliveryMode, buf: &[u8]) -> anyhow::Result<()>;

    fn send_unconnected(&mut self, to: SocketAddr, buf: &[u8]) -> anyhow::Result<()>;

    fn flush(&mut self);

    fn poll_event(&mut self) -> Option<TransportEvent>;
}


#[cfg_attr(test, automock)]
pub trait LatencyInfo: Send + Sync {
    /// one-way latency estimate, zero for unknown connections and for [ConnectionId::NO_CONNECTION]
    fn latency(&self, connection_id: ConnectionId) -> Duration;
}

/// Latest latency per connection, written by the tick loop when the transport reports a round
///  trip sample and read by object message handlers
pub struct LatencyTable {
    latency_micros: Vec<AtomicU32>,
}

impl LatencyTable {
    pub fn new(max_connections: usize) -> LatencyTable {
        LatencyTable {
            latency_micros: (0..max_connections)
                .map(|_| AtomicU32::new(0))
                .collect(),
        }
    }

    pub fn on_round_trip_time(&self, connection_id: ConnectionId, round_trip_time: Duration) {
        if let Some(slot) = self.latency_micros.get(connection_id.index()) {
            let latency = (round_trip_time / 2).as_micros()
                .min(u32::MAX as u128) as u32;
            slot.store(latency, Ordering::Relaxed);
        }
    }

    pub fn clear(&self, connection_id: ConnectionId) {
        if let Some(slot) = self.latency_micros.get(connection_id.index()) {
            slot.store(0, Ordering::Relaxed);
        }
    }
}

impl LatencyInfo for LatencyTable {
    fn latency(&self, connection_id: ConnectionId) -> Duration {
        self.latency_micros.get(connection_id.index())
            .map(|l| Duration::from_micros(l.load(Ordering::Relaxed) as u64))
            .unwrap_or_default()
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_latency_is_half_round_trip() {
        let table = LatencyTable::new(4);
        table.on_round_trip_time(ConnectionId(2), Duration::from_millis(80));

        assert_eq!(table.latency(ConnectionId(2)), Duration::from_millis(40));
        assert_eq!(table.latency(ConnectionId(1)), Duration::ZERO);
        assert_eq!(table.latency(ConnectionId::NO_CONNECTION), Duration::ZERO);

        table.clear(ConnectionId(2));
        assert_eq!(table.latency(ConnectionId(2)), Duration::ZERO);
    }

    #[test]
    fn test_out_of_range_sample_is_ignored() {
        let table = LatencyTable::new(1);
        table.on_round_trip_time(ConnectionId(7), Duration::from_millis(80));
        assert_eq!(table.latency(ConnectionId(7)), Duration::ZERO);
    }

    #[test]
    fn test_delivery_mode_from_primitive() {
        assert_eq!(DeliveryMode::try_from(3u8).unwrap(), DeliveryMode::ReliableSequenced);
        assert!(DeliveryMode::try_from(5u8).is_err());
        assert_eq!(u8::from(DeliveryMode::ReliableOrdered), 4);
    }
}
