use tokio::sync::broadcast;
use tracing::trace;

use crate::replication::object::{ObjectId, ObjectRole, ObjectType};
use crate::transport::connection_id::ConnectionId;

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ReplicationEvent {
    ObjectAdded(ObjectAddedData),
    ObjectRemoved(ObjectRemovedData),
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ObjectAddedData {
    pub object_id: ObjectId,
    pub object_type: Option<ObjectType>,
    pub role: ObjectRole,
    pub is_pre_existing: bool,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ObjectRemovedData {
    pub object_id: ObjectId,
    pub object_type: Option<ObjectType>,
    /// the connection that requested the removal
    pub removed_by: ConnectionId,
}


pub struct ReplicationEventNotifier {
    sender: broadcast::Sender<ReplicationEvent>,
}
impl ReplicationEventNotifier {
    pub fn new() -> ReplicationEventNotifier {
        let (sender, _) = broadcast::channel(128);

        ReplicationEventNotifier {
            sender
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ReplicationEvent> {
        self.sender.subscribe()
    }

    pub fn send_event(&self, event: ReplicationEvent) {
        trace!("event: {:?}", event);
        let _ = self.sender.send(event);
    }
}

impl Default for ReplicationEventNotifier {
    fn default() -> Self {
        ReplicationEventNotifier::new()
    }
}
