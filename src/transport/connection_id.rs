use std::fmt::{Debug, Formatter};
use std::net::SocketAddr;

use tracing::{debug, warn};

/// Handle of a connection, valid from the transport's connection-opened event until its
///  connection-closed event. Ids are small integers so that per-connection data can live in
///  arrays sized to the transport's maximum number of connections.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ConnectionId(pub u32);

impl ConnectionId {
    /// Stands for 'this process': a role that is held locally rather than by a remote peer
    pub const NO_CONNECTION: ConnectionId = ConnectionId(u32::MAX);

    pub fn is_connection(&self) -> bool {
        *self != Self::NO_CONNECTION
    }

    pub fn index(&self) -> usize {
        self.0 as usize
    }
}

impl Debug for ConnectionId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        if self.is_connection() {
            write!(f, "ConnectionId({})", self.0)
        }
        else {
            write!(f, "NoConnection")
        }
    }
}


/// Fixed-capacity free list of connection ids for transport implementations, keeping track of
///  each live connection's remote endpoint.
pub struct ConnectionIdPool {
    unused: Vec<ConnectionId>,
    endpoints: Vec<Option<SocketAddr>>,
}

impl ConnectionIdPool {
    pub fn new(max_connections: usize) -> ConnectionIdPool {
        ConnectionIdPool {
            unused: (0..max_connections as u32).rev()
                .map(ConnectionId)
                .collect(),
            endpoints: vec![None; max_connections],
        }
    }

    pub fn max_connections(&self) -> usize {
        self.endpoints.len()
    }

    pub fn num_in_use(&self) -> usize {
        self.endpoints.len() - self.unused.len()
    }

    /// returns `None` if all ids are in use
    pub fn take(&mut self, endpoint: SocketAddr) -> Option<ConnectionId> {
        match self.unused.pop() {
            Some(id) => {
                debug!(?id, ?endpoint, "assigning connection id");
                self.endpoints[id.index()] = Some(endpoint);
                Some(id)
            }
            None => {
                warn!(?endpoint, "no more connection ids available, max connections is {}", self.max_connections());
                None
            }
        }
    }

    pub fn release(&mut self, id: ConnectionId) -> Option<SocketAddr> {
        let endpoint = self.endpoints.get_mut(id.index())
            .and_then(|e| e.take());

        match endpoint {
            Some(endpoint) => {
                debug!(?id, ?endpoint, "releasing connection id");
                self.unused.push(id);
                Some(endpoint)
            }
            None => {
                warn!(?id, "releasing a connection id that is not in use - ignoring");
                None
            }
        }
    }

    pub fn endpoint(&self, id: ConnectionId) -> Option<SocketAddr> {
        self.endpoints.get(id.index())
            .copied()
            .flatten()
    }

    pub fn find(&self, endpoint: SocketAddr) -> Option<ConnectionId> {
        self.endpoints.iter()
            .position(|e| *e == Some(endpoint))
            .map(|idx| ConnectionId(idx as u32))
    }
}


#[cfg(test)]
mod tests {
    use rstest::rstest;
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    #[rstest]
    #[case::regular(ConnectionId(3), "ConnectionId(3)")]
    #[case::no_connection(ConnectionId::NO_CONNECTION, "NoConnection")]
    fn test_debug(#[case] id: ConnectionId, #[case] expected: &str) {
        assert_eq!(format!("{:?}", id), expected);
    }

    #[test]
    fn test_take_and_release() {
        let mut pool = ConnectionIdPool::new(2);

        let a = pool.take(addr(1)).unwrap();
        let b = pool.take(addr(2)).unwrap();
        assert_eq!(a, ConnectionId(0));
        assert_eq!(b, ConnectionId(1));
        assert_eq!(pool.num_in_use(), 2);
        assert!(pool.take(addr(3)).is_none());

        assert_eq!(pool.endpoint(b), Some(addr(2)));
        assert_eq!(pool.find(addr(1)), Some(a));

        assert_eq!(pool.release(a), Some(addr(1)));
        assert_eq!(pool.endpoint(a), None);
        assert_eq!(pool.take(addr(4)), Some(a));
    }

    #[test]
    fn test_release_twice_is_ignored() {
        let mut pool = ConnectionIdPool::new(1);
        let a = pool.take(addr(1)).unwrap();
        assert!(pool.release(a).is_some());
        assert!(pool.release(a).is_none());
        assert!(pool.release(ConnectionId::NO_CONNECTION).is_none());
        assert_eq!(pool.num_in_use(), 0);
        assert!(pool.take(addr(2)).is_some());
        assert!(pool.take(addr(3)).is_none());
    }
}
