use std::any::{type_name, Any, TypeId};
use std::fmt::Debug;

use anyhow::{anyhow, bail};
use bytes::BytesMut;
use rustc_hash::FxHashMap;
use tracing::debug;

use crate::messaging::message_sender::NetworkMessage;
use crate::transport::DeliveryMode;


/// Numeric id of a message type on the wire. Ids are assigned per process run and are only
///  meaningful within one message family.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct MessageType(pub u32);

/// A message that can be sent over a connection. Implementations serialize only their own
///  payload; framing and the type id are added by the sending side.
pub trait Message: Debug + Send + Sync + 'static {
    fn delivery_mode(&self) -> DeliveryMode;

    fn ser(&self, buf: &mut BytesMut);

    fn deser(buf: &mut &[u8]) -> anyhow::Result<Self> where Self: Sized;
}

/// Marker for messages addressed to a single replicated object rather than to the connection.
///  They travel inside a `ToObject` envelope and have their own id space.
pub trait ObjectMessage: Message {}


pub type MessageParser = fn(&mut &[u8]) -> anyhow::Result<Box<dyn Any + Send>>;

fn parse_boxed<M: Message>(buf: &mut &[u8]) -> anyhow::Result<Box<dyn Any + Send>> {
    Ok(Box::new(M::deser(buf)?))
}

#[derive(Clone)]
struct Registration {
    type_id: TypeId,
    name: &'static str,
    parser: MessageParser,
}

impl Registration {
    fn of<M: Message>() -> Registration {
        Registration {
            type_id: TypeId::of::<M>(),
            name: type_name::<M>(),
            parser: parse_boxed::<M>,
        }
    }
}


/// The ids of one message family, numbered from zero in the order of the types' fully qualified
///  names.
pub struct MessageFamily {
    family_name: &'static str,
    ids: FxHashMap<TypeId, MessageType>,
    names: Vec<&'static str>,
    parsers: Vec<MessageParser>,
}

impl MessageFamily {
    fn new(family_name: &'static str, mut registrations: Vec<Registration>) -> MessageFamily {
        registrations.sort_by(|a, b| a.name.cmp(b.name));

        let mut ids = FxHashMap::default();
        let mut names = Vec::with_capacity(registrations.len());
        let mut parsers = Vec::with_capacity(registrations.len());
        for (idx, r) in registrations.into_iter().enumerate() {
            let message_type = MessageType(idx as u32);
            debug!("{} message {} has id {:?}", family_name, r.name, message_type);
            ids.insert(r.type_id, message_type);
            names.push(r.name);
            parsers.push(r.parser);
        }

        MessageFamily {
            family_name,
            ids,
            names,
            parsers,
        }
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn id_of<M: Message>(&self) -> anyhow::Result<MessageType> {
        self.ids.get(&TypeId::of::<M>())
            .copied()
            .ok_or_else(|| anyhow!("{} is not a registered {} message", type_name::<M>(), self.family_name))
    }

    pub fn name(&self, message_type: MessageType) -> Option<&'static str> {
        self.names.get(message_type.0 as usize)
            .copied()
    }

    pub fn parse(&self, message_type: MessageType, buf: &mut &[u8]) -> anyhow::Result<Box<dyn Any + Send>> {
        match self.parsers.get(message_type.0 as usize) {
            Some(parser) => parser(buf),
            None => Err(anyhow!("unknown {} message type {:?}", self.family_name, message_type)),
        }
    }

    pub fn mapping(&self) -> impl Iterator<Item=(&'static str, MessageType)> + '_ {
        self.names.iter()
            .enumerate()
            .map(|(idx, name)| (*name, MessageType(idx as u32)))
    }
}


/// Registry of all message types known to this process, split into connection-level messages and
///  object messages. It is built once at startup and shared read-only afterwards.
pub struct MessageTypes {
    connection: MessageFamily,
    object: MessageFamily,
}

impl MessageTypes {
    pub fn builder() -> MessageTypesBuilder {
        MessageTypesBuilder::default()
    }

    pub fn connection_messages(&self) -> &MessageFamily {
        &self.connection
    }

    pub fn object_messages(&self) -> &MessageFamily {
        &self.object
    }

    pub fn connection_message_type<M: Message>(&self) -> anyhow::Result<MessageType> {
        self.connection.id_of::<M>()
    }

    pub fn object_message_type<M: ObjectMessage>(&self) -> anyhow::Result<MessageType> {
        self.object.id_of::<M>()
    }

    pub fn network_message<M: Message>(&self, content: M) -> anyhow::Result<NetworkMessage<M>> {
        Ok(NetworkMessage::new(self.connection_message_type::<M>()?, content))
    }
}


#[derive(Default)]
pub struct MessageTypesBuilder {
    connection: Vec<Registration>,
    object: Vec<Registration>,
}

impl MessageTypesBuilder {
    /// Registering a type more than once has no additional effect
    pub fn add_message<M: Message>(&mut self) -> &mut Self {
        Self::add(&mut self.connection, Registration::of::<M>());
        self
    }

    pub fn add_object_message<M: ObjectMessage>(&mut self) -> &mut Self {
        Self::add(&mut self.object, Registration::of::<M>());
        self
    }

    fn add(family: &mut Vec<Registration>, registration: Registration) {
        if !family.iter().any(|r| r.type_id == registration.type_id) {
            family.push(registration);
        }
    }

    pub fn with_basic_messages(&mut self) -> &mut Self {
        crate::messaging::basic_messages::register_basic_messages(self);
        self
    }

    pub fn build(&self) -> anyhow::Result<MessageTypes> {
        for r in &self.object {
            if self.connection.iter().any(|c| c.type_id == r.type_id) {
                bail!("{} is registered both as a connection message and as an object message", r.name);
            }
        }

        Ok(MessageTypes {
            connection: MessageFamily::new("connection", self.connection.clone()),
            object: MessageFamily::new("object", self.object.clone()),
        })
    }
}


#[cfg(test)]
mod tests {
    use crate::test_util::message::{TestChat, TestMove, TestShout, TestWave};
    use super::*;

    fn registry(reverse: bool) -> MessageTypes {
        let mut builder = MessageTypes::builder();
        if reverse {
            builder
                .add_object_message::<TestWave>()
                .add_object_message::<TestMove>()
                .add_message::<TestShout>()
                .add_message::<TestChat>();
        }
        else {
            builder
                .add_message::<TestChat>()
                .add_message::<TestShout>()
                .add_object_message::<TestMove>()
                .add_object_message::<TestWave>();
        }
        builder.build().unwrap()
    }

    #[test]
    fn test_ids_are_sorted_by_name_and_start_at_zero() {
        let types = registry(false);
        assert_eq!(types.connection_message_type::<TestChat>().unwrap(), MessageType(0));
        assert_eq!(types.connection_message_type::<TestShout>().unwrap(), MessageType(1));
        assert_eq!(types.object_message_type::<TestMove>().unwrap(), MessageType(0));
        assert_eq!(types.object_message_type::<TestWave>().unwrap(), MessageType(1));
    }

    #[test]
    fn test_assignment_is_deterministic() {
        let a = registry(false);
        let b = registry(true);
        assert_eq!(
            a.connection_messages().mapping().collect::<Vec<_>>(),
            b.connection_messages().mapping().collect::<Vec<_>>(),
        );
        assert_eq!(
            a.object_messages().mapping().collect::<Vec<_>>(),
            b.object_messages().mapping().collect::<Vec<_>>(),
        );
    }

    #[test]
    fn test_duplicate_registration_is_idempotent() {
        let types = MessageTypes::builder()
            .add_message::<TestChat>()
            .add_message::<TestChat>()
            .build()
            .unwrap();
        assert_eq!(types.connection_messages().len(), 1);
    }

    #[test]
    fn test_families_are_disjoint() {
        let types = registry(false);
        assert!(types.connection_messages().id_of::<TestMove>().is_err());
        assert!(types.object_messages().id_of::<TestChat>().is_err());
    }

    #[test]
    fn test_same_type_in_both_families_is_rejected() {
        let result = MessageTypes::builder()
            .add_message::<TestMove>()
            .add_object_message::<TestMove>()
            .build();
        assert!(result.is_err());
    }

    #[test]
    fn test_parse() {
        let types = registry(false);
        let mut buf = BytesMut::new();
        TestChat { text: "hi".to_string() }.ser(&mut buf);

        let mut b: &[u8] = &buf;
        let parsed = types.connection_messages().parse(MessageType(0), &mut b).unwrap();
        let parsed = parsed.downcast::<TestChat>().unwrap();
        assert_eq!(parsed.text, "hi");
        assert!(b.is_empty());

        let mut b: &[u8] = &buf;
        assert!(types.connection_messages().parse(MessageType(9), &mut b).is_err());
    }

    #[test]
    fn test_names() {
        let types = registry(false);
        assert!(types.connection_messages().name(MessageType(0)).unwrap().ends_with("TestChat"));
        assert!(types.connection_messages().name(MessageType(2)).is_none());
    }
}
