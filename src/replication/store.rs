use std::any::Any;
use std::sync::Arc;

use anyhow::{anyhow, bail};
use bytes::BytesMut;
use rustc_hash::FxHashMap;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, error, trace};

use crate::messaging::group_router::TransportGroupId;
use crate::messaging::message_types::{MessageType, MessageTypes};
use crate::replication::events::{ObjectAddedData, ObjectRemovedData, ReplicationEvent, ReplicationEventNotifier};
use crate::replication::object::{GlobalObjectId, ObjectBuilder, ObjectId, ObjectInstance, ObjectRole, ObjectType, ReplicatedObject};
use crate::replication::object_router::MessageMetadata;
use crate::replication::object_sender::ObjectMessageSender;
use crate::transport::connection_id::ConnectionId;
use crate::transport::LatencyInfo;
use crate::util::buf_ext::BufExt;
use crate::util::buffer_pool::BufferPool;

/// Builds the components and handlers of a freshly created object of one [ObjectType]
pub trait ObjectFactory: Send {
    fn create(&self, builder: &mut ObjectBuilder) -> anyhow::Result<()>;
}

impl <F: Fn(&mut ObjectBuilder) -> anyhow::Result<()> + Send> ObjectFactory for F {
    fn create(&self, builder: &mut ObjectBuilder) -> anyhow::Result<()> {
        self(builder)
    }
}


pub const DEFAULT_MAX_OBJECT_ID: ObjectId = ObjectId(u16::MAX as u32);

/// All replicated objects known to this process, addressed by [ObjectId].
///
/// Ids are handed out by the [crate::replication::replicator::Replicator] on the authority side
///  and taken from `CreateObject` messages on the receiving side, so the store accepts any id
///  up to its maximum and grows its slot table to fit.
pub struct ReplicatedObjectStore {
    message_types: Arc<MessageTypes>,
    factories: FxHashMap<ObjectType, Box<dyn ObjectFactory>>,
    pre_existing_factories: FxHashMap<GlobalObjectId, Box<dyn ObjectFactory>>,
    slots: Vec<Option<ReplicatedObject>>,
    max_object_id: ObjectId,
    object_ids: Vec<ObjectId>,
    latency: Arc<dyn LatencyInfo>,
    pool: Arc<BufferPool>,
    object_group: TransportGroupId,
    events: ReplicationEventNotifier,
}

impl ReplicatedObjectStore {
    pub fn new(message_types: Arc<MessageTypes>, latency: Arc<dyn LatencyInfo>, pool: Arc<BufferPool>, object_group: TransportGroupId, initial_capacity: usize) -> ReplicatedObjectStore {
        let mut slots = Vec::new();
        slots.resize_with(initial_capacity, || None);

        ReplicatedObjectStore {
            message_types,
            factories: FxHashMap::default(),
            pre_existing_factories: FxHashMap::default(),
            slots,
            max_object_id: DEFAULT_MAX_OBJECT_ID,
            object_ids: Vec::with_capacity(initial_capacity),
            latency,
            pool,
            object_group,
            events: ReplicationEventNotifier::new(),
        }
    }

    pub fn register_factory(&mut self, object_type: ObjectType, factory: impl ObjectFactory + 'static) {
        if self.factories.insert(object_type, Box::new(factory)).is_some() {
            debug!(?object_type, "replaced object factory");
        }
    }

    /// Registers how the local copy of a pre-existing object is built when a peer announces it
    pub fn register_pre_existing(&mut self, global_object_id: GlobalObjectId, factory: impl ObjectFactory + 'static) {
        self.pre_existing_factories.insert(global_object_id, Box::new(factory));
    }

    pub fn message_types(&self) -> &Arc<MessageTypes> {
        &self.message_types
    }

    /// A builder for an object that exists outside of any factory, e.g. a pre-existing object
    pub fn new_builder(&self) -> ObjectBuilder {
        ObjectBuilder::new(self.message_types.clone())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ReplicationEvent> {
        self.events.subscribe()
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Grows the slot table. Shrinking below the highest id in use is not possible and leaves the
    ///  capacity unchanged.
    pub fn set_capacity(&mut self, capacity: usize) {
        if capacity > self.slots.len() {
            self.slots.resize_with(capacity, || None);
        }
    }

    pub fn max_object_id(&self) -> ObjectId {
        self.max_object_id
    }

    /// Objects with higher ids are rejected, so a peer can not make the slot table grow at will
    pub fn set_max_object_id(&mut self, max_object_id: ObjectId) {
        self.max_object_id = max_object_id;
    }

    /// Ids of all objects in the store, in the order they were added
    pub fn object_ids(&self) -> &[ObjectId] {
        &self.object_ids
    }

    pub fn len(&self) -> usize {
        self.object_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.object_ids.is_empty()
    }

    pub fn get(&self, object_id: ObjectId) -> Option<&ReplicatedObject> {
        self.slots.get(object_id.index())
            .and_then(|o| o.as_ref())
    }

    pub fn get_mut(&mut self, object_id: ObjectId) -> Option<&mut ReplicatedObject> {
        self.slots.get_mut(object_id.index())
            .and_then(|o| o.as_mut())
    }

    pub fn find(&self, object_id: ObjectId) -> anyhow::Result<&ReplicatedObject> {
        self.get(object_id)
            .ok_or_else(|| anyhow!("no replicated object with id {:?}", object_id))
    }

    pub fn find_mut(&mut self, object_id: ObjectId) -> anyhow::Result<&mut ReplicatedObject> {
        self.get_mut(object_id)
            .ok_or_else(|| anyhow!("no replicated object with id {:?}", object_id))
    }

    /// The first object of the given type whose role intersects `role`
    pub fn find_object(&self, object_type: ObjectType, role: ObjectRole) -> Option<&ReplicatedObject> {
        self.object_ids.iter()
            .filter_map(|id| self.get(*id))
            .find(|o| o.object_type == Some(object_type) && o.role.intersects(role))
    }

    /// Appends the ids of all objects of the given type whose role intersects `role`
    pub fn find_objects(&self, object_type: ObjectType, role: ObjectRole, results: &mut Vec<ObjectId>) {
        results.extend(self.object_ids.iter()
            .filter_map(|id| self.get(*id))
            .filter(|o| o.object_type == Some(object_type) && o.role.intersects(role))
            .map(|o| o.id));
    }

    /// Creates an object through the factory registered for its type. Roles the local process
    ///  holds map to [ConnectionId::NO_CONNECTION], the others to `connection_id`.
    pub fn add_replicated_instance(&mut self, object_type: ObjectType, role: ObjectRole, object_id: ObjectId, connection_id: ConnectionId) -> anyhow::Result<&mut ReplicatedObject> {
        let factory = self.factories.get(&object_type)
            .ok_or_else(|| anyhow!("no factory for object type {:?}", object_type))?;

        let mut builder = ObjectBuilder::new(self.message_types.clone());
        factory.create(&mut builder)?;
        self.insert(builder.build(), Some(object_type), role, object_id, connection_id, None)
    }

    /// Registers an object that both peers already had before replication started
    pub fn replicate_existing_instance(&mut self, role: ObjectRole, host_connection_id: ConnectionId, instance: ObjectInstance, object_id: ObjectId, global_object_id: GlobalObjectId) -> anyhow::Result<&mut ReplicatedObject> {
        self.insert(instance, None, role, object_id, host_connection_id, Some(global_object_id))
    }

    /// Builds the registered local copy of a pre-existing object and adds it under the id the
    ///  host assigned
    pub fn replicate_pre_existing(&mut self, role: ObjectRole, host_connection_id: ConnectionId, object_id: ObjectId, global_object_id: GlobalObjectId) -> anyhow::Result<&mut ReplicatedObject> {
        let factory = self.pre_existing_factories.get(&global_object_id)
            .ok_or_else(|| anyhow!("no pre-existing object with global id {:?}", global_object_id))?;

        let mut builder = ObjectBuilder::new(self.message_types.clone());
        factory.create(&mut builder)?;
        self.replicate_existing_instance(role, host_connection_id, builder.build(), object_id, global_object_id)
    }

    fn insert(&mut self, mut instance: ObjectInstance, object_type: Option<ObjectType>, role: ObjectRole, object_id: ObjectId, connection_id: ConnectionId, global_object_id: Option<GlobalObjectId>) -> anyhow::Result<&mut ReplicatedObject> {
        if object_id > self.max_object_id {
            bail!("cannot add object of type {:?} with {:?}: the maximum object id is {:?}", object_type, object_id, self.max_object_id);
        }
        if self.get(object_id).is_some() {
            bail!("cannot add object of type {:?} with {:?}: the object id is already assigned", object_type, object_id);
        }

        instance.components.apply_role(role);
        let object = ReplicatedObject {
            id: object_id,
            object_type,
            role,
            owner_connection_id: if role.is_owner() { ConnectionId::NO_CONNECTION } else { connection_id },
            authority_connection_id: if role.is_authority() { ConnectionId::NO_CONNECTION } else { connection_id },
            global_object_id: global_object_id.unwrap_or(GlobalObjectId::NIL),
            is_pre_existing: global_object_id.is_some(),
            is_active: false,
            last_received_message: None,
            instance,
            sender: ObjectMessageSender::new(self.message_types.clone(), self.pool.clone(), self.object_group),
        };
        debug!(?object, "adding replicated object");

        self.set_capacity(object_id.index() + 1);
        self.events.send_event(ReplicationEvent::ObjectAdded(ObjectAddedData {
            object_id,
            object_type,
            role,
            is_pre_existing: object.is_pre_existing,
        }));
        self.object_ids.push(object_id);

        let slot = &mut self.slots[object_id.index()];
        Ok(slot.insert(object))
    }

    /// Removes an object on behalf of a connection. Only the object's authority may do that, other
    ///  requests are logged and ignored.
    pub fn remove_replicated_instance(&mut self, connection_id: ConnectionId, object_id: ObjectId) -> Option<ReplicatedObject> {
        let Some(object) = self.get(object_id) else {
            debug!(?object_id, ?connection_id, "removal of unknown object - ignoring");
            return None;
        };
        if object.authority_connection_id != connection_id {
            error!(?connection_id, ?object, "connection is not allowed to delete the object because it is not the authority");
            return None;
        }

        self.events.send_event(ReplicationEvent::ObjectRemoved(ObjectRemovedData {
            object_id,
            object_type: object.object_type,
            removed_by: connection_id,
        }));
        self.object_ids.retain(|id| *id != object_id);
        self.slots[object_id.index()].take()
    }

    /// Runs the object's initial state through its own handlers and marks it live
    pub fn activate(&mut self, object_id: ObjectId) -> anyhow::Result<()> {
        let object = self.find_mut(object_id)?;

        let mut buf = BytesMut::new();
        object.instance.serialize_initial_state(&mut buf)?;
        self.dispatch_messages(ConnectionId::NO_CONNECTION, object_id, &buf)?;

        self.find_mut(object_id)?.is_active = true;
        Ok(())
    }

    /// Dispatches an already parsed object message. Messages for unknown objects are dropped.
    pub fn dispatch_message(&mut self, connection_id: ConnectionId, object_id: ObjectId, message_type: MessageType, message: &dyn Any) -> anyhow::Result<()> {
        let latency = self.latency.latency(connection_id);
        let Some(object) = self.get_mut(object_id) else {
            trace!(?object_id, ?message_type, "message for unknown object - ignoring");
            return Ok(());
        };

        let sender_role = object.role_of(connection_id);
        let metadata = MessageMetadata {
            connection_id,
            latency,
        };
        object.last_received_message = Some(Instant::now());
        object.instance.dispatch(message_type, message, &metadata, sender_role)
    }

    /// Parses one `[varint type][payload]` object message from the buffer and dispatches it
    pub fn dispatch_message_from_buf(&mut self, connection_id: ConnectionId, object_id: ObjectId, buf: &mut &[u8]) -> anyhow::Result<()> {
        let message_type = MessageType(buf.try_read_u32_varint()?);
        let message = self.message_types.object_messages().parse(message_type, buf)?;
        self.dispatch_message(connection_id, object_id, message_type, message.as_ref())
    }

    /// Dispatches a sequence of unframed object messages, e.g. an object's initial state
    pub fn dispatch_messages(&mut self, connection_id: ConnectionId, object_id: ObjectId, data: &[u8]) -> anyhow::Result<()> {
        let mut buf = data;
        while !buf.is_empty() {
            self.dispatch_message_from_buf(connection_id, object_id, &mut buf)?;
        }
        Ok(())
    }
}
