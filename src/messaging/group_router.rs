use std::net::SocketAddr;

use anyhow::anyhow;
use rustc_hash::FxHashMap;
use tracing::{debug, warn};

use crate::transport::connection_id::ConnectionId;

#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct TransportGroupId(pub u8);

impl TransportGroupId {
    /// every new connection starts out in this group
    pub const DEFAULT: TransportGroupId = TransportGroupId(0);
}


#[derive(Debug)]
pub struct TransportGroup {
    max_connections: usize,
    connections: Vec<ConnectionId>,
}

impl TransportGroup {
    pub fn max_connections(&self) -> usize {
        self.max_connections
    }

    pub fn connections(&self) -> &[ConnectionId] {
        &self.connections
    }

    pub fn is_full(&self) -> bool {
        self.connections.len() >= self.max_connections
    }
}

/// Partition of connections into groups of limited size. A connection is in at most one group.
#[derive(Debug)]
pub struct TransportGroups {
    groups: FxHashMap<TransportGroupId, TransportGroup>,
}

impl TransportGroups {
    pub fn new(capacities: impl IntoIterator<Item=(TransportGroupId, usize)>) -> TransportGroups {
        TransportGroups {
            groups: capacities.into_iter()
                .map(|(id, max_connections)| (id, TransportGroup {
                    max_connections,
                    connections: Vec::with_capacity(max_connections),
                }))
                .collect(),
        }
    }

    /// the sum of all groups' capacities
    pub fn max_connections(&self) -> usize {
        self.groups.values()
            .map(|g| g.max_connections)
            .sum()
    }

    pub fn get_group(&self, group: TransportGroupId) -> Option<&TransportGroup> {
        self.groups.get(&group)
    }

    pub fn get_assigned_group(&self, connection_id: ConnectionId) -> Option<TransportGroupId> {
        self.groups.iter()
            .find(|(_, g)| g.connections.contains(&connection_id))
            .map(|(id, _)| *id)
    }

    pub fn active_connections(&self, group: TransportGroupId) -> &[ConnectionId] {
        self.groups.get(&group)
            .map(|g| g.connections.as_slice())
            .unwrap_or_default()
    }

    /// Moves a connection into a group. The connection is removed from its previous group even if
    ///  the new group turns out to be full, in which case it ends up unassigned.
    pub fn assign_to_group(&mut self, group: TransportGroupId, connection_id: ConnectionId) -> bool {
        self.remove(connection_id);

        match self.groups.get_mut(&group) {
            Some(g) if !g.is_full() => {
                debug!(?connection_id, ?group, "assigning connection to group");
                g.connections.push(connection_id);
                true
            }
            Some(_) => {
                warn!(?connection_id, ?group, "no more room in group");
                false
            }
            None => {
                warn!(?connection_id, ?group, "assigning connection to unknown group");
                false
            }
        }
    }

    pub fn remove(&mut self, connection_id: ConnectionId) -> Option<TransportGroupId> {
        for (id, g) in self.groups.iter_mut() {
            if let Some(pos) = g.connections.iter().position(|c| *c == connection_id) {
                g.connections.remove(pos);
                return Some(*id);
            }
        }
        None
    }
}


/// Access to the groups for handlers and for the router. The groups live in the handler context
///  so that handlers can regroup connections and object messages can find their recipients.
pub trait HasTransportGroups {
    fn transport_groups(&self) -> &TransportGroups;

    fn transport_groups_mut(&mut self) -> &mut TransportGroups;
}

pub trait TransportDataHandler<C: ?Sized>: Send {
    fn on_data(&mut self, ctx: &mut C, connection_id: ConnectionId, endpoint: SocketAddr, data: &[u8]) -> anyhow::Result<()>;
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ConnectionEvent {
    Established {
        connection_id: ConnectionId,
        endpoint: SocketAddr,
    },
    Disconnected {
        connection_id: ConnectionId,
    },
}

pub trait TransportConnectionHandler<C: ?Sized>: Send {
    fn on_connection_event(&mut self, ctx: &mut C, event: ConnectionEvent);
}

impl <C: ?Sized, F: FnMut(&mut C, ConnectionEvent) + Send> TransportConnectionHandler<C> for F {
    fn on_connection_event(&mut self, ctx: &mut C, event: ConnectionEvent) {
        self(ctx, event)
    }
}


/// Routes transport events to per-group handlers, based on the group a connection is currently
///  assigned to
pub struct TransportGroupRouter<C: HasTransportGroups> {
    connection_handlers: FxHashMap<TransportGroupId, Box<dyn TransportConnectionHandler<C>>>,
    data_handlers: FxHashMap<TransportGroupId, Box<dyn TransportDataHandler<C>>>,
}

impl <C: HasTransportGroups> Default for TransportGroupRouter<C> {
    fn default() -> Self {
        TransportGroupRouter {
            connection_handlers: FxHashMap::default(),
            data_handlers: FxHashMap::default(),
        }
    }
}

impl <C: HasTransportGroups> TransportGroupRouter<C> {
    pub fn new() -> TransportGroupRouter<C> {
        Self::default()
    }

    pub fn set_data_handler(&mut self, group: TransportGroupId, handler: impl TransportDataHandler<C> + 'static) {
        self.data_handlers.insert(group, Box::new(handler));
    }

    pub fn set_connection_handler(&mut self, group: TransportGroupId, handler: impl TransportConnectionHandler<C> + 'static) {
        self.connection_handlers.insert(group, Box::new(handler));
    }

    pub fn clear_data_handlers(&mut self) {
        self.data_handlers.clear();
    }

    pub fn clear_connection_handlers(&mut self) {
        self.connection_handlers.clear();
    }

    pub fn on_connection_opened(&mut self, ctx: &mut C, connection_id: ConnectionId, endpoint: SocketAddr) {
        if ctx.transport_groups().get_assigned_group(connection_id).is_none() {
            ctx.transport_groups_mut().assign_to_group(TransportGroupId::DEFAULT, connection_id);
        }

        if let Some(handler) = self.connection_handlers.get_mut(&TransportGroupId::DEFAULT) {
            handler.on_connection_event(ctx, ConnectionEvent::Established { connection_id, endpoint });
        }
    }

    pub fn on_connection_closed(&mut self, ctx: &mut C, connection_id: ConnectionId) {
        match ctx.transport_groups_mut().remove(connection_id) {
            Some(group) => {
                if let Some(handler) = self.connection_handlers.get_mut(&group) {
                    handler.on_connection_event(ctx, ConnectionEvent::Disconnected { connection_id });
                }
            }
            None => debug!(?connection_id, "closed connection was not in any group"),
        }
    }

    pub fn on_data(&mut self, ctx: &mut C, connection_id: ConnectionId, endpoint: SocketAddr, data: &[u8]) -> anyhow::Result<()> {
        let group = ctx.transport_groups().get_assigned_group(connection_id)
            .ok_or_else(|| anyhow!("data from connection {:?} that is not in any group", connection_id))?;

        match self.data_handlers.get_mut(&group) {
            Some(handler) => handler.on_data(ctx, connection_id, endpoint, data),
            None => {
                warn!(?connection_id, ?group, "data for group without a data handler - ignoring");
                Ok(())
            }
        }
    }
}
