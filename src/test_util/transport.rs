use std::collections::VecDeque;
use std::net::SocketAddr;

use anyhow::anyhow;
use bytes::Bytes;

use crate::transport::connection_id::{ConnectionId, ConnectionIdPool};
use crate::transport::{DeliveryMode, Transport, TransportEvent};

/// A [Transport] that records everything sent through it and replays events pushed by the test
pub struct TrackingTransport {
    ids: ConnectionIdPool,
    sent: Vec<(ConnectionId, DeliveryMode, Bytes)>,
    unconnected_sent: Vec<(SocketAddr, Bytes)>,
    connects: Vec<SocketAddr>,
    disconnects: Vec<ConnectionId>,
    flush_count: usize,
    events: VecDeque<TransportEvent>,
}

impl TrackingTransport {
    pub fn new(max_connections: usize) -> TrackingTransport {
        TrackingTransport {
            ids: ConnectionIdPool::new(max_connections),
            sent: Vec::new(),
            unconnected_sent: Vec::new(),
            connects: Vec::new(),
            disconnects: Vec::new(),
            flush_count: 0,
            events: VecDeque::new(),
        }
    }

    pub fn sent(&self) -> Vec<(ConnectionId, DeliveryMode, Bytes)> {
        self.sent.clone()
    }

    pub fn unconnected_sent(&self) -> Vec<(SocketAddr, Bytes)> {
        self.unconnected_sent.clone()
    }

    pub fn connects(&self) -> Vec<SocketAddr> {
        self.connects.clone()
    }

    pub fn disconnects(&self) -> Vec<ConnectionId> {
        self.disconnects.clone()
    }

    pub fn flush_count(&self) -> usize {
        self.flush_count
    }

    pub fn clear_sent(&mut self) {
        self.sent.clear();
        self.unconnected_sent.clear();
    }

    pub fn push_event(&mut self, event: TransportEvent) {
        self.events.push_back(event);
    }

    /// Simulates an incoming connection: an id is taken from the pool and an opened event queued
    pub fn accept(&mut self, endpoint: SocketAddr) -> Option<ConnectionId> {
        let connection_id = self.ids.take(endpoint)?;
        self.push_event(TransportEvent::ConnectionOpened { connection_id, endpoint });
        Some(connection_id)
    }

    /// Simulates the remote side closing a connection
    pub fn close(&mut self, connection_id: ConnectionId) {
        if self.ids.release(connection_id).is_some() {
            self.push_event(TransportEvent::ConnectionClosed { connection_id });
        }
    }
}

impl Transport for TrackingTransport {
    fn max_connections(&self) -> usize {
        self.ids.max_connections()
    }

    fn connect(&mut self, endpoint: SocketAddr) -> anyhow::Result<ConnectionId> {
        let connection_id = self.ids.take(endpoint)
            .ok_or_else(|| anyhow!("no free connection id"))?;
        self.connects.push(endpoint);
        Ok(connection_id)
    }

    fn disconnect(&mut self, connection_id: ConnectionId) {
        self.ids.release(connection_id);
        self.disconnects.push(connection_id);
    }

    fn send(&mut self, connection_id: ConnectionId, delivery_mode: DeliveryMode, buf: &[u8]) -> anyhow::Result<()> {
        self.sent.push((connection_id, delivery_mode, Bytes::copy_from_slice(buf)));
        Ok(())
    }

    fn send_unconnected(&mut self, to: SocketAddr, buf: &[u8]) -> anyhow::Result<()> {
        self.unconnected_sent.push((to, Bytes::copy_from_slice(buf)));
        Ok(())
    }

    fn flush(&mut self) {
        self.flush_count += 1;
    }

    fn poll_event(&mut self) -> Option<TransportEvent> {
        self.events.pop_front()
    }
}
