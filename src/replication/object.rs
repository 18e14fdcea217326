use std::any::{type_name, Any};
use std::fmt::Debug;
use std::sync::Arc;

use anyhow::anyhow;
use bitflags::bitflags;
use bytes::BytesMut;
use bytes_varint::VarIntSupportMut;
use tokio::time::Instant;
use uuid::Uuid;

use crate::messaging::group_router::TransportGroups;
use crate::messaging::message_sender::MessageSender;
use crate::messaging::message_types::{MessageType, MessageTypes, ObjectMessage};
use crate::replication::object_router::{MessageMetadata, ObjectMessageRouter};
use crate::replication::object_sender::ObjectMessageSender;
use crate::transport::connection_id::ConnectionId;

#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct ObjectId(pub u32);

impl ObjectId {
    pub fn index(&self) -> usize {
        self.0 as usize
    }
}

/// Category of an object, selecting the factory that builds it
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct ObjectType(pub u32);

/// Identifies a pre-existing object across peers, independent of the object id it is given
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub struct GlobalObjectId(pub Uuid);

impl GlobalObjectId {
    pub const NIL: GlobalObjectId = GlobalObjectId(Uuid::nil());

    pub fn random() -> GlobalObjectId {
        GlobalObjectId(Uuid::new_v4())
    }

    pub fn from_bytes(bytes: [u8; 16]) -> GlobalObjectId {
        GlobalObjectId(Uuid::from_bytes(bytes))
    }
}

bitflags! {
    /// The relation of a peer to an object. A peer can be owner and authority at the same time;
    ///  a peer that is neither is one of the 'others'.
    #[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
    pub struct ObjectRole: u8 {
        const OWNER     = 0b001;
        const AUTHORITY = 0b010;
        const OTHERS    = 0b100;
    }
}

impl ObjectRole {
    pub const NOBODY: ObjectRole = ObjectRole::empty();
    pub const EVERYONE: ObjectRole = ObjectRole::all();

    pub fn is_owner(&self) -> bool {
        self.contains(ObjectRole::OWNER)
    }

    pub fn is_authority(&self) -> bool {
        self.contains(ObjectRole::AUTHORITY)
    }

    /// The role of a connection relative to an object with the given owner and authority
    pub fn of_connection(connection_id: ConnectionId, owner: ConnectionId, authority: ConnectionId) -> ObjectRole {
        let mut role = ObjectRole::NOBODY;
        if connection_id == owner {
            role |= ObjectRole::OWNER;
        }
        if connection_id == authority {
            role |= ObjectRole::AUTHORITY;
        }
        if role.is_empty() {
            role = ObjectRole::OTHERS;
        }
        role
    }
}

/// The roles for which a component is active.
///
/// A component declared for 'others' but not for the authority is switched off on the authority
///  even if the authority also happens to be the owner.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct NetworkRole {
    included: ObjectRole,
    excluded: ObjectRole,
}

impl NetworkRole {
    pub fn new(included: ObjectRole) -> NetworkRole {
        let excluded = if included.contains(ObjectRole::OTHERS) && !included.contains(ObjectRole::AUTHORITY) {
            ObjectRole::AUTHORITY
        }
        else {
            ObjectRole::NOBODY
        };

        NetworkRole {
            included,
            excluded,
        }
    }

    pub fn is_allowed(&self, role: ObjectRole) -> bool {
        self.included.intersects(role) && !self.excluded.intersects(role)
    }
}


#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub struct ComponentId(pub usize);

struct Component {
    role: Option<NetworkRole>,
    enabled: bool,
    state: Box<dyn Any + Send>,
}

/// The per-object state that message handlers operate on
#[derive(Default)]
pub struct Components {
    components: Vec<Component>,
}

impl Components {
    pub fn len(&self) -> usize {
        self.components.len()
    }

    pub fn is_empty(&self) -> bool {
        self.components.is_empty()
    }

    fn component(&self, id: ComponentId) -> anyhow::Result<&Component> {
        self.components.get(id.0)
            .ok_or_else(|| anyhow!("no component {:?}", id))
    }

    pub fn get<S: 'static>(&self, id: ComponentId) -> anyhow::Result<&S> {
        self.component(id)?
            .state
            .downcast_ref::<S>()
            .ok_or_else(|| anyhow!("component {:?} is not a {}", id, type_name::<S>()))
    }

    pub fn get_mut<S: 'static>(&mut self, id: ComponentId) -> anyhow::Result<&mut S> {
        self.components.get_mut(id.0)
            .ok_or_else(|| anyhow!("no component {:?}", id))?
            .state
            .downcast_mut::<S>()
            .ok_or_else(|| anyhow!("component {:?} is not a {}", id, type_name::<S>()))
    }

    pub fn is_enabled(&self, id: ComponentId) -> bool {
        self.components.get(id.0)
            .map(|c| c.enabled)
            .unwrap_or(false)
    }

    /// Enables exactly those components whose network role allows `role`. Components without a
    ///  network role are always enabled.
    pub fn apply_role(&mut self, role: ObjectRole) {
        for c in &mut self.components {
            c.enabled = c.role
                .map(|r| r.is_allowed(role))
                .unwrap_or(true);
        }
    }
}


type InitialStateWriter = Box<dyn Fn(&Components, &mut BytesMut) -> anyhow::Result<()> + Send>;

/// Assembles the components, message handlers and initial state of one object. Factories get a
///  fresh builder for every object they create.
pub struct ObjectBuilder {
    message_types: Arc<MessageTypes>,
    components: Components,
    router: ObjectMessageRouter,
    initial_state: Vec<InitialStateWriter>,
}

impl ObjectBuilder {
    pub fn new(message_types: Arc<MessageTypes>) -> ObjectBuilder {
        ObjectBuilder {
            message_types,
            components: Components::default(),
            router: ObjectMessageRouter::default(),
            initial_state: Vec::new(),
        }
    }

    pub fn add_component<S: Send + 'static>(&mut self, state: S) -> ComponentId {
        self.push_component(None, state)
    }

    /// Adds a component that is only enabled for peers whose role matches `role`
    pub fn add_role_component<S: Send + 'static>(&mut self, role: ObjectRole, state: S) -> ComponentId {
        self.push_component(Some(NetworkRole::new(role)), state)
    }

    fn push_component<S: Send + 'static>(&mut self, role: Option<NetworkRole>, state: S) -> ComponentId {
        let id = ComponentId(self.components.components.len());
        self.components.components.push(Component {
            role,
            enabled: true,
            state: Box::new(state),
        });
        id
    }

    /// Registers a handler for messages of type `M` sent by peers in `allowed_senders`, operating
    ///  on a component's state
    pub fn on_message<M, S, F>(&mut self, component: ComponentId, allowed_senders: ObjectRole, handler: F) -> anyhow::Result<&mut Self>
    where
        M: ObjectMessage,
        S: 'static,
        F: Fn(&mut S, &M, &MessageMetadata) -> anyhow::Result<()> + Send + 'static,
    {
        let message_type = self.message_types.object_message_type::<M>()?;
        self.router.register_handler(message_type, Some(component), allowed_senders, Box::new(move |components, message, metadata| {
            let message = message.downcast_ref::<M>()
                .ok_or_else(|| anyhow!("object message is not a {}", type_name::<M>()))?;
            handler(components.get_mut::<S>(component)?, message, metadata)
        }));
        Ok(self)
    }

    /// Registers a message constructed from a component's state that brings a fresh copy of the
    ///  object up to date. It is dispatched locally on activation and sent along when the object
    ///  is replicated.
    pub fn initial_state<M, S, F>(&mut self, component: ComponentId, constructor: F) -> anyhow::Result<&mut Self>
    where
        M: ObjectMessage,
        S: 'static,
        F: Fn(&S) -> M + Send + 'static,
    {
        let message_type = self.message_types.object_message_type::<M>()?;
        self.initial_state.push(Box::new(move |components, buf| {
            let message = constructor(components.get::<S>(component)?);
            buf.put_u32_varint(message_type.0);
            message.ser(buf);
            Ok(())
        }));
        Ok(self)
    }

    pub fn build(self) -> ObjectInstance {
        ObjectInstance {
            components: self.components,
            router: self.router,
            initial_state: self.initial_state,
        }
    }
}

/// The behavior part of a replicated object
pub struct ObjectInstance {
    pub components: Components,
    router: ObjectMessageRouter,
    initial_state: Vec<InitialStateWriter>,
}

impl ObjectInstance {
    /// Appends the initial state messages to `buf`, each as message type id followed by payload
    pub fn serialize_initial_state(&self, buf: &mut BytesMut) -> anyhow::Result<()> {
        for writer in &self.initial_state {
            writer(&self.components, buf)?;
        }
        Ok(())
    }

    pub fn dispatch(&mut self, message_type: MessageType, message: &dyn Any, metadata: &MessageMetadata, sender_role: ObjectRole) -> anyhow::Result<()> {
        self.router.dispatch(&mut self.components, message_type, message, metadata, sender_role)
    }
}


/// An object that exists on several peers, with its replication metadata
pub struct ReplicatedObject {
    pub id: ObjectId,
    pub object_type: Option<ObjectType>,
    pub role: ObjectRole,
    pub owner_connection_id: ConnectionId,
    pub authority_connection_id: ConnectionId,
    pub global_object_id: GlobalObjectId,
    pub is_pre_existing: bool,
    pub(crate) is_active: bool,
    pub(crate) last_received_message: Option<Instant>,
    pub instance: ObjectInstance,
    pub(crate) sender: ObjectMessageSender,
}

impl Debug for ReplicatedObject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplicatedObject")
            .field("id", &self.id)
            .field("object_type", &self.object_type)
            .field("role", &self.role)
            .field("owner", &self.owner_connection_id)
            .field("authority", &self.authority_connection_id)
            .field("is_pre_existing", &self.is_pre_existing)
            .field("is_active", &self.is_active)
            .finish()
    }
}

impl ReplicatedObject {
    pub fn is_active(&self) -> bool {
        self.is_active
    }

    pub fn last_received_message(&self) -> Option<Instant> {
        self.last_received_message
    }

    /// The role the given connection has relative to this object
    pub fn role_of(&self, connection_id: ConnectionId) -> ObjectRole {
        ObjectRole::of_connection(connection_id, self.owner_connection_id, self.authority_connection_id)
    }

    pub fn components(&self) -> &Components {
        &self.instance.components
    }

    pub fn components_mut(&mut self) -> &mut Components {
        &mut self.instance.components
    }

    /// Sends an object message to the peers in `recipients`. Recipients that are this process
    ///  get the message dispatched right away.
    pub fn send<M: ObjectMessage>(&mut self, message: M, recipients: ObjectRole, groups: &TransportGroups, out: &mut dyn MessageSender) -> anyhow::Result<()> {
        let connection_ids = self.sender.recipients(recipients, self.owner_connection_id, self.authority_connection_id, groups);
        if connection_ids.is_empty() {
            return Ok(());
        }

        let message_type = self.sender.object_message_type::<M>()?;
        let mut send_locally = false;
        let mut remote = Vec::with_capacity(connection_ids.len());
        for connection_id in connection_ids {
            if connection_id.is_connection() {
                remote.push(connection_id);
            }
            else {
                send_locally = true;
            }
        }

        if !remote.is_empty() {
            self.sender.send_to_connections(self.id, message_type, &message, &remote, out)?;
        }
        if send_locally {
            let metadata = MessageMetadata {
                connection_id: ConnectionId::NO_CONNECTION,
                latency: Default::default(),
            };
            self.instance.dispatch(message_type, &message, &metadata, self.role)?;
        }
        Ok(())
    }
}
