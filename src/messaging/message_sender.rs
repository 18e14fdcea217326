use std::fmt::Debug;
use std::net::SocketAddr;

use bytes::BytesMut;
use bytes_varint::VarIntSupportMut;

use crate::messaging::message_types::{Message, MessageType, MessageTypes};
use crate::transport::connection_id::ConnectionId;
use crate::transport::DeliveryMode;

/// A message queued for sending. `ser` writes the message type id followed by the payload; the
///  frame length is added when the message is packed into a packet.
pub trait OutgoingMessage: Debug + Send {
    fn delivery_mode(&self) -> DeliveryMode;

    fn ser(&self, buf: &mut BytesMut);
}

#[derive(Debug)]
pub struct NetworkMessage<M: Message> {
    pub message_type: MessageType,
    pub content: M,
}

impl <M: Message> NetworkMessage<M> {
    pub fn new(message_type: MessageType, content: M) -> NetworkMessage<M> {
        NetworkMessage {
            message_type,
            content,
        }
    }
}

impl <M: Message> OutgoingMessage for NetworkMessage<M> {
    fn delivery_mode(&self) -> DeliveryMode {
        self.content.delivery_mode()
    }

    fn ser(&self, buf: &mut BytesMut) {
        buf.put_u32_varint(self.message_type.0);
        self.content.ser(buf);
    }
}


pub trait MessageSender {
    fn message_types(&self) -> &MessageTypes;

    fn send(&mut self, to: ConnectionId, message: Box<dyn OutgoingMessage>);

    fn send_unconnected(&mut self, to: SocketAddr, message: Box<dyn OutgoingMessage>);
}

pub trait MessageSenderExt: MessageSender {
    fn send_message<M: Message>(&mut self, to: ConnectionId, message: M) -> anyhow::Result<()> {
        let message = self.message_types().network_message(message)?;
        self.send(to, Box::new(message));
        Ok(())
    }

    fn send_message_unconnected<M: Message>(&mut self, to: SocketAddr, message: M) -> anyhow::Result<()> {
        let message = self.message_types().network_message(message)?;
        self.send_unconnected(to, Box::new(message));
        Ok(())
    }
}

impl <T: MessageSender + ?Sized> MessageSenderExt for T {}
