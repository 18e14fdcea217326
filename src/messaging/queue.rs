use std::fmt::Debug;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::{BufMut, BytesMut};
use bytes_varint::VarIntSupportMut;
use tracing::{error, trace, warn};

use crate::messaging::message_sender::{MessageSender, OutgoingMessage};
use crate::messaging::message_types::MessageTypes;
use crate::transport::connection_id::ConnectionId;
use crate::transport::{DeliveryMode, Transport};

fn varint_len(value: usize) -> usize {
    let mut value = value;
    let mut len = 1;
    while value >= 0x80 {
        value >>= 7;
        len += 1;
    }
    len
}

/// Packs frames into packets. A packet is closed when the destination changes or when the next
///  frame would not fit.
struct PacketAssembler {
    max_packet_size: usize,
    frame: BytesMut,
    packet: BytesMut,
}

impl PacketAssembler {
    fn new(max_packet_size: usize) -> PacketAssembler {
        PacketAssembler {
            max_packet_size,
            frame: BytesMut::with_capacity(max_packet_size),
            packet: BytesMut::with_capacity(max_packet_size),
        }
    }

    fn assemble<K: Copy + Eq + Debug>(
        &mut self,
        messages: impl Iterator<Item=(K, Box<dyn OutgoingMessage>)>,
        mut send_packet: impl FnMut(K, &[u8]),
    ) {
        let mut current_key = None;

        for (key, message) in messages {
            self.frame.clear();
            message.ser(&mut self.frame);
            drop(message);

            let frame_size = varint_len(self.frame.len()) + self.frame.len();
            if frame_size > self.max_packet_size {
                error!(?key, "message of {} bytes exceeds the maximum packet size of {} - dropping it", frame_size, self.max_packet_size);
                continue;
            }

            if let Some(prev) = current_key {
                if prev != key || self.packet.len() + frame_size > self.max_packet_size {
                    send_packet(prev, &self.packet);
                    self.packet.clear();
                }
            }
            current_key = Some(key);

            self.packet.put_usize_varint(self.frame.len());
            self.packet.put_slice(&self.frame);
        }

        if let Some(key) = current_key {
            if !self.packet.is_empty() {
                send_packet(key, &self.packet);
            }
        }
        self.packet.clear();
    }
}


/// Collects all outgoing messages of a tick and sends them in as few packets as possible when
///  the tick ends. Messages are grouped by delivery mode and then by connection; the order of
///  messages with the same delivery mode and connection is preserved.
pub struct QueueingMessageSender {
    message_types: Arc<MessageTypes>,
    queue: Vec<(ConnectionId, Box<dyn OutgoingMessage>)>,
    unconnected_queue: Vec<(SocketAddr, Box<dyn OutgoingMessage>)>,
    assembler: PacketAssembler,
}

impl QueueingMessageSender {
    pub fn new(message_types: Arc<MessageTypes>, max_packet_size: usize) -> QueueingMessageSender {
        QueueingMessageSender {
            message_types,
            queue: Vec::new(),
            unconnected_queue: Vec::new(),
            assembler: PacketAssembler::new(max_packet_size),
        }
    }

    pub fn len(&self) -> usize {
        self.queue.len() + self.unconnected_queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn flush(&mut self, transport: &mut dyn Transport) {
        trace!("flushing {} queued messages", self.len());

        // stable, so the send order within a (delivery mode, connection) pair is kept
        self.queue.sort_by_key(|(to, message)| (message.delivery_mode(), *to));

        let connected = self.queue.drain(..)
            .map(|(to, message)| ((message.delivery_mode(), to), message));
        self.assembler.assemble(connected, |(delivery_mode, to): (DeliveryMode, ConnectionId), packet| {
            if let Err(e) = transport.send(to, delivery_mode, packet) {
                warn!(?to, ?delivery_mode, "error sending packet: {}", e);
            }
        });

        self.unconnected_queue.sort_by_key(|(to, _)| *to);
        self.assembler.assemble(self.unconnected_queue.drain(..), |to, packet| {
            if let Err(e) = transport.send_unconnected(to, packet) {
                warn!(?to, "error sending unconnected packet: {}", e);
            }
        });

        transport.flush();
    }
}

impl MessageSender for QueueingMessageSender {
    fn message_types(&self) -> &MessageTypes {
        &self.message_types
    }

    fn send(&mut self, to: ConnectionId, message: Box<dyn OutgoingMessage>) {
        self.queue.push((to, message));
    }

    fn send_unconnected(&mut self, to: SocketAddr, message: Box<dyn OutgoingMessage>) {
        self.unconnected_queue.push((to, message));
    }
}


#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use rstest::rstest;

    use crate::messaging::message_sender::MessageSenderExt;
    use crate::test_util::message::{test_message_types, TestBlob, TestChat, TestShout};
    use crate::test_util::transport::TrackingTransport;
    use super::*;

    fn frames(mut packet: &[u8]) -> usize {
        use crate::util::buf_ext::BufExt;
        let mut n = 0;
        while !packet.is_empty() {
            let len = packet.try_read_usize_varint().unwrap();
            packet = &packet[len..];
            n += 1;
        }
        n
    }

    #[rstest]
    #[case::zero(0, 1)]
    #[case::one_byte(127, 1)]
    #[case::two_bytes(128, 2)]
    #[case::three_bytes(16384, 3)]
    fn test_varint_len(#[case] value: usize, #[case] expected: usize) {
        assert_eq!(varint_len(value), expected);
    }

    #[test]
    fn test_batches_by_delivery_mode_and_connection() {
        let mut sender = QueueingMessageSender::new(test_message_types(), 1472);
        let mut transport = TrackingTransport::new(4);

        sender.send_message(ConnectionId(1), TestChat { text: "a".to_string() }).unwrap();
        sender.send_message(ConnectionId(0), TestShout { volume: 1 }).unwrap();
        sender.send_message(ConnectionId(1), TestChat { text: "b".to_string() }).unwrap();
        sender.send_message(ConnectionId(0), TestChat { text: "c".to_string() }).unwrap();
        sender.send_message(ConnectionId(1), TestShout { volume: 2 }).unwrap();
        assert_eq!(sender.len(), 5);

        sender.flush(&mut transport);

        let sent = transport.sent();
        let summary = sent.iter()
            .map(|(to, mode, packet)| (*to, *mode, frames(packet)))
            .collect::<Vec<_>>();
        assert_eq!(summary, vec![
            (ConnectionId(0), DeliveryMode::Unreliable, 1),
            (ConnectionId(1), DeliveryMode::Unreliable, 1),
            (ConnectionId(0), DeliveryMode::ReliableOrdered, 1),
            (ConnectionId(1), DeliveryMode::ReliableOrdered, 2),
        ]);
        assert_eq!(transport.flush_count(), 1);
        assert!(sender.is_empty());
    }

    #[test]
    fn test_order_within_connection_is_kept() {
        let types = test_message_types();
        let chat_type = types.connection_message_type::<TestChat>().unwrap();
        let mut sender = QueueingMessageSender::new(types, 1472);
        let mut transport = TrackingTransport::new(4);

        sender.send_message(ConnectionId(1), TestChat { text: "first".to_string() }).unwrap();
        sender.send_message(ConnectionId(1), TestChat { text: "second".to_string() }).unwrap();
        sender.flush(&mut transport);

        let mut expected = BytesMut::new();
        for text in ["first", "second"] {
            let mut frame = BytesMut::new();
            frame.put_u32_varint(chat_type.0);
            crate::messaging::message_types::Message::ser(&TestChat { text: text.to_string() }, &mut frame);
            expected.put_usize_varint(frame.len());
            expected.put_slice(&frame);
        }
        assert_eq!(transport.sent()[0].2, expected.freeze());
    }

    #[test]
    fn test_splits_at_frame_boundaries() {
        let mut sender = QueueingMessageSender::new(test_message_types(), 100);
        let mut transport = TrackingTransport::new(4);

        for _ in 0..3 {
            sender.send_message(ConnectionId(0), TestBlob { data: Bytes::from(vec![7u8; 40]) }).unwrap();
        }
        sender.flush(&mut transport);

        let sent = transport.sent();
        assert_eq!(sent.len(), 2);
        assert_eq!(frames(&sent[0].2), 2);
        assert_eq!(frames(&sent[1].2), 1);
        assert!(sent.iter().all(|(_, _, p)| p.len() <= 100));
    }

    #[test]
    fn test_oversize_frame_is_dropped() {
        let mut sender = QueueingMessageSender::new(test_message_types(), 100);
        let mut transport = TrackingTransport::new(4);

        sender.send_message(ConnectionId(0), TestBlob { data: Bytes::from(vec![7u8; 200]) }).unwrap();
        sender.send_message(ConnectionId(0), TestBlob { data: Bytes::from(vec![7u8; 10]) }).unwrap();
        sender.flush(&mut transport);

        let sent = transport.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(frames(&sent[0].2), 1);
    }

    #[test]
    fn test_unconnected_messages() {
        let mut sender = QueueingMessageSender::new(test_message_types(), 1472);
        let mut transport = TrackingTransport::new(4);
        let a = SocketAddr::from(([1, 2, 3, 4], 5));
        let b = SocketAddr::from(([1, 2, 3, 4], 6));

        sender.send_message_unconnected(b, TestShout { volume: 1 }).unwrap();
        sender.send_message_unconnected(a, TestShout { volume: 2 }).unwrap();
        sender.send_message_unconnected(b, TestShout { volume: 3 }).unwrap();
        sender.flush(&mut transport);

        let sent = transport.unconnected_sent();
        assert_eq!(sent.iter().map(|(to, p)| (*to, frames(p))).collect::<Vec<_>>(), vec![(a, 1), (b, 2)]);
        assert!(transport.sent().is_empty());
    }

    #[test]
    fn test_empty_flush_only_flushes_transport() {
        let mut sender = QueueingMessageSender::new(test_message_types(), 1472);
        let mut transport = TrackingTransport::new(4);
        sender.flush(&mut transport);
        assert!(transport.sent().is_empty());
        assert_eq!(transport.flush_count(), 1);
    }

    #[test]
    fn test_unregistered_message_is_rejected() {
        use crate::test_util::message::TestMove;
        let mut sender = QueueingMessageSender::new(test_message_types(), 1472);
        assert!(sender.send_message(ConnectionId(0), TestMove { x: 1, y: 2 }).is_err());
        assert!(sender.is_empty());
    }
}
