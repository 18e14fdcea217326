use anyhow::bail;
use tracing::debug;

use crate::replication::object::{GlobalObjectId, ObjectId, ObjectInstance, ObjectRole, ObjectType, ReplicatedObject};
use crate::replication::store::ReplicatedObjectStore;
use crate::transport::connection_id::ConnectionId;

/// Creates objects on the side that assigns object ids, i.e. usually the server. Ids come from a
///  free list that is grown in fixed steps when it runs dry.
pub struct Replicator {
    store: ReplicatedObjectStore,
    unused_object_ids: Vec<ObjectId>,
    growth: usize,
    num_generated: usize,
}

impl Replicator {
    pub fn new(store: ReplicatedObjectStore, growth: usize) -> Replicator {
        let initial_capacity = store.capacity();
        let mut result = Replicator {
            store,
            unused_object_ids: Vec::with_capacity(initial_capacity),
            growth: growth.max(1),
            num_generated: 0,
        };
        result.generate_object_ids(initial_capacity);
        result
    }

    pub fn store(&self) -> &ReplicatedObjectStore {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut ReplicatedObjectStore {
        &mut self.store
    }

    pub fn num_unused_ids(&self) -> usize {
        self.unused_object_ids.len()
    }

    pub fn create_replicated_instance(&mut self, object_type: ObjectType, role: ObjectRole, connection_id: ConnectionId) -> anyhow::Result<&mut ReplicatedObject> {
        let object_id = self.request_object_id()?;
        if let Err(e) = self.store.add_replicated_instance(object_type, role, object_id, connection_id) {
            self.unused_object_ids.push(object_id);
            return Err(e);
        }
        self.store.find_mut(object_id)
    }

    pub fn add_pre_existing_instance(&mut self, role: ObjectRole, host_connection_id: ConnectionId, instance: ObjectInstance, global_object_id: GlobalObjectId) -> anyhow::Result<&mut ReplicatedObject> {
        let object_id = self.request_object_id()?;
        if let Err(e) = self.store.replicate_existing_instance(role, host_connection_id, instance, object_id, global_object_id) {
            self.unused_object_ids.push(object_id);
            return Err(e);
        }
        self.store.find_mut(object_id)
    }

    /// Removes an object this process is the authority of. The id is recycled only if the object
    ///  was actually removed.
    pub fn remove_replicated_instance(&mut self, object_id: ObjectId) -> Option<ReplicatedObject> {
        self.remove_on_behalf_of(ConnectionId::NO_CONNECTION, object_id)
    }

    /// Removes an object whose authority is `connection_id`, recycling its id
    pub fn remove_on_behalf_of(&mut self, connection_id: ConnectionId, object_id: ObjectId) -> Option<ReplicatedObject> {
        let removed = self.store.remove_replicated_instance(connection_id, object_id);
        if removed.is_some() {
            self.unused_object_ids.push(object_id);
        }
        removed
    }

    pub fn activate(&mut self, object_id: ObjectId) -> anyhow::Result<()> {
        self.store.activate(object_id)
    }

    fn request_object_id(&mut self) -> anyhow::Result<ObjectId> {
        loop {
            if let Some(id) = self.unused_object_ids.pop() {
                return Ok(id);
            }
            if !self.generate_object_ids(self.growth) {
                bail!("all object ids up to {:?} are in use", self.store.max_object_id());
            }
        }
    }

    /// returns `false` if no more ids are available
    fn generate_object_ids(&mut self, growth: usize) -> bool {
        let new_capacity = (self.num_generated + growth).min(self.store.max_object_id().index() + 1);
        if new_capacity <= self.num_generated {
            return false;
        }
        debug!("growing object ids from {} to {}", self.num_generated, new_capacity);

        // pushed in reverse so that ids are handed out in ascending order
        self.unused_object_ids.extend((self.num_generated..new_capacity).rev()
            .map(|id| ObjectId(id as u32)));
        self.num_generated = new_capacity;
        self.store.set_capacity(new_capacity);
        true
    }
}
