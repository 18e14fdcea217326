use std::fmt::{Debug, Formatter};
use std::sync::Arc;

use bytes::{BufMut, BytesMut};
use bytes_varint::VarIntSupportMut;
use tracing::trace;

use crate::messaging::basic_messages::ToObject;
use crate::messaging::group_router::{TransportGroupId, TransportGroups};
use crate::messaging::message_sender::{MessageSender, OutgoingMessage};
use crate::messaging::message_types::{Message, MessageType, MessageTypes, ObjectMessage};
use crate::replication::object::{ObjectId, ObjectRole};
use crate::transport::connection_id::ConnectionId;
use crate::transport::DeliveryMode;
use crate::util::buffer_pool::BufferPool;

/// A serialized object message shared by all recipients of one send. The buffer goes back to the
///  pool when the last recipient's queue entry is dropped.
pub struct MulticastPayload {
    buf: BytesMut,
    pool: Arc<BufferPool>,
}

impl Drop for MulticastPayload {
    fn drop(&mut self) {
        trace!("returning multicast payload buffer to the pool");
        self.pool.return_to_pool(std::mem::take(&mut self.buf));
    }
}

pub struct MulticastMessage {
    delivery_mode: DeliveryMode,
    payload: Arc<MulticastPayload>,
}

impl Debug for MulticastMessage {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "MulticastMessage({:?}, {} bytes)", self.delivery_mode, self.payload.buf.len())
    }
}

impl OutgoingMessage for MulticastMessage {
    fn delivery_mode(&self) -> DeliveryMode {
        self.delivery_mode
    }

    fn ser(&self, buf: &mut BytesMut) {
        buf.put_slice(&self.payload.buf);
    }
}


/// Sends an object's messages, wrapped in a [ToObject] envelope, to the connections of the
///  object's transport group
pub struct ObjectMessageSender {
    message_types: Arc<MessageTypes>,
    pool: Arc<BufferPool>,
    group: TransportGroupId,
}

impl ObjectMessageSender {
    pub fn new(message_types: Arc<MessageTypes>, pool: Arc<BufferPool>, group: TransportGroupId) -> ObjectMessageSender {
        ObjectMessageSender {
            message_types,
            pool,
            group,
        }
    }

    pub fn object_message_type<M: ObjectMessage>(&self) -> anyhow::Result<MessageType> {
        self.message_types.object_message_type::<M>()
    }

    /// Resolves recipient roles to connections. [ConnectionId::NO_CONNECTION] in the result
    ///  stands for this process.
    pub fn recipients(&self, recipients: ObjectRole, owner: ConnectionId, authority: ConnectionId, groups: &TransportGroups) -> Vec<ConnectionId> {
        let mut result = Vec::new();

        let to_owner = recipients.contains(ObjectRole::OWNER);
        let to_authority = recipients.contains(ObjectRole::AUTHORITY);
        if to_owner && to_authority {
            result.push(authority);
            if owner != authority {
                result.push(owner);
            }
        }
        else if to_authority {
            result.push(authority);
        }
        else if to_owner {
            result.push(owner);
        }

        if recipients.contains(ObjectRole::OTHERS) {
            result.extend(groups.active_connections(self.group)
                .iter()
                .filter(|c| **c != owner && **c != authority));
        }
        result
    }

    /// Serializes the message once and queues it for each of the connections
    pub fn send_to_connections<M: ObjectMessage>(&self, receiver: ObjectId, message_type: MessageType, message: &M, connections: &[ConnectionId], out: &mut dyn MessageSender) -> anyhow::Result<()> {
        let to_object_type = self.message_types.connection_message_type::<ToObject>()?;
        let envelope = ToObject {
            receiver,
            delivery_mode: message.delivery_mode(),
        };

        let mut buf = self.pool.get_from_pool();
        buf.put_u32_varint(to_object_type.0);
        envelope.ser(&mut buf);
        buf.put_u32_varint(message_type.0);
        message.ser(&mut buf);

        let payload = Arc::new(MulticastPayload {
            buf,
            pool: self.pool.clone(),
        });
        for connection_id in connections {
            out.send(*connection_id, Box::new(MulticastMessage {
                delivery_mode: envelope.delivery_mode,
                payload: payload.clone(),
            }));
        }
        Ok(())
    }
}
