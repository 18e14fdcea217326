//! Fakes for this crate's tests: a transport and a message sender that record what goes through
//!  them, plus a set of test messages.

pub mod message;
pub mod transport;

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::BytesMut;

use crate::messaging::message_sender::{MessageSender, OutgoingMessage};
use crate::messaging::message_types::{Message, MessageType, MessageTypes};
use crate::transport::connection_id::ConnectionId;
use crate::util::buf_ext::BufExt;

/// A [MessageSender] that keeps messages instead of sending them
pub struct TrackingMessageSender {
    message_types: Arc<MessageTypes>,
    sent: Vec<(ConnectionId, Box<dyn OutgoingMessage>)>,
    unconnected_sent: Vec<(SocketAddr, Box<dyn OutgoingMessage>)>,
}

impl TrackingMessageSender {
    pub fn new(message_types: Arc<MessageTypes>) -> TrackingMessageSender {
        TrackingMessageSender {
            message_types,
            sent: Vec::new(),
            unconnected_sent: Vec::new(),
        }
    }

    pub fn num_sent(&self) -> usize {
        self.sent.len()
    }

    pub fn take_sent(&mut self) -> Vec<(ConnectionId, Box<dyn OutgoingMessage>)> {
        std::mem::take(&mut self.sent)
    }

    pub fn take_unconnected_sent(&mut self) -> Vec<(SocketAddr, Box<dyn OutgoingMessage>)> {
        std::mem::take(&mut self.unconnected_sent)
    }

    /// Removes and decodes the messages of type `M`, leaving all others in place
    pub fn take_messages<M: Message>(&mut self) -> Vec<(ConnectionId, M)> {
        let message_type = self.message_types.connection_message_type::<M>()
            .expect("message type is registered");
        take_decoded(&mut self.sent, message_type)
    }

    pub fn take_unconnected_messages<M: Message>(&mut self) -> Vec<(SocketAddr, M)> {
        let message_type = self.message_types.connection_message_type::<M>()
            .expect("message type is registered");
        take_decoded(&mut self.unconnected_sent, message_type)
    }
}

fn take_decoded<K, M: Message>(messages: &mut Vec<(K, Box<dyn OutgoingMessage>)>, message_type: MessageType) -> Vec<(K, M)> {
    let mut result = Vec::new();
    let mut remaining = Vec::new();
    for (to, message) in messages.drain(..) {
        let mut buf = BytesMut::new();
        message.ser(&mut buf);
        let mut b: &[u8] = &buf;
        let actual_type = MessageType(b.try_read_u32_varint().expect("message starts with its type"));
        if actual_type == message_type {
            result.push((to, M::deser(&mut b).expect("message can be decoded")));
        }
        else {
            remaining.push((to, message));
        }
    }
    *messages = remaining;
    result
}

impl MessageSender for TrackingMessageSender {
    fn message_types(&self) -> &MessageTypes {
        &self.message_types
    }

    fn send(&mut self, to: ConnectionId, message: Box<dyn OutgoingMessage>) {
        self.sent.push((to, message));
    }

    fn send_unconnected(&mut self, to: SocketAddr, message: Box<dyn OutgoingMessage>) {
        self.unconnected_sent.push((to, message));
    }
}
