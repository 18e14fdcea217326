use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::bail;
use tracing::{debug, trace};

use crate::messaging::group_router::TransportDataHandler;
use crate::messaging::message_types::{Message, MessageType, MessageTypes};
use crate::transport::connection_id::ConnectionId;
use crate::util::buf_ext::BufExt;

type RawHandler<C> = Box<dyn FnMut(&mut C, ConnectionId, SocketAddr, &mut &[u8]) -> anyhow::Result<()> + Send>;

/// Dispatches the frames of a received packet to handlers by message type.
///
/// Each handler sees only its own frame, starting after the message type id. Whatever it leaves
///  unread is skipped, and reading past the end of the frame is an error.
pub struct MessageRouter<C: ?Sized> {
    message_types: Arc<MessageTypes>,
    handlers: Vec<Option<RawHandler<C>>>,
}

impl <C: ?Sized> MessageRouter<C> {
    pub fn new(message_types: Arc<MessageTypes>) -> MessageRouter<C> {
        let num_types = message_types.connection_messages().len();
        MessageRouter {
            message_types,
            handlers: (0..num_types).map(|_| None).collect(),
        }
    }

    /// Replaces a previously registered handler for the same message type. The handler receives
    ///  the parsed message and the unread rest of its frame.
    pub fn register_handler<M: Message>(
        &mut self,
        mut handler: impl FnMut(&mut C, ConnectionId, SocketAddr, M, &mut &[u8]) -> anyhow::Result<()> + Send + 'static,
    ) -> anyhow::Result<&mut Self> {
        let message_type = self.message_types.connection_message_type::<M>()?;
        self.handlers[message_type.0 as usize] = Some(Box::new(move |ctx, connection_id, endpoint, buf| {
            let message = M::deser(buf)?;
            handler(ctx, connection_id, endpoint, message, buf)
        }));
        Ok(self)
    }

    pub fn clear_handlers(&mut self) {
        for handler in &mut self.handlers {
            *handler = None;
        }
    }

    pub fn dispatch(&mut self, ctx: &mut C, connection_id: ConnectionId, endpoint: SocketAddr, data: &[u8]) -> anyhow::Result<()> {
        let mut buf = data;
        while !buf.is_empty() {
            let frame_len = buf.try_read_usize_varint()?;
            if frame_len > buf.len() {
                bail!("frame length {} exceeds the {} remaining bytes of the packet", frame_len, buf.len());
            }
            let (mut frame, rest) = buf.split_at(frame_len);
            buf = rest;

            let message_type = MessageType(frame.try_read_u32_varint()?);
            match self.handlers.get_mut(message_type.0 as usize) {
                Some(Some(handler)) => {
                    trace!(?connection_id, "dispatching {:?}", self.message_types.connection_messages().name(message_type));
                    handler(ctx, connection_id, endpoint, &mut frame)?;
                }
                _ => debug!(?connection_id, ?message_type, "no handler registered - skipping message"),
            }
        }
        Ok(())
    }
}

impl <C: ?Sized> TransportDataHandler<C> for MessageRouter<C> {
    fn on_data(&mut self, ctx: &mut C, connection_id: ConnectionId, endpoint: SocketAddr, data: &[u8]) -> anyhow::Result<()> {
        self.dispatch(ctx, connection_id, endpoint, data)
    }
}


#[cfg(test)]
mod tests {
    use bytes::{BufMut, BytesMut};
    use bytes_varint::VarIntSupportMut;

    use crate::test_util::message::{test_message_types, TestChat, TestShout};
    use super::*;

    #[derive(Default)]
    struct Received {
        chats: Vec<(ConnectionId, String, usize)>,
        shouts: Vec<u8>,
    }

    fn endpoint() -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], 9000))
    }

    fn frame(message_type: MessageType, payload: &[u8], buf: &mut BytesMut) {
        let mut frame = BytesMut::new();
        frame.put_u32_varint(message_type.0);
        frame.put_slice(payload);
        buf.put_usize_varint(frame.len());
        buf.put_slice(&frame);
    }

    fn chat_payload(text: &str, trailing: &[u8]) -> BytesMut {
        let mut payload = BytesMut::new();
        TestChat { text: text.to_string() }.ser(&mut payload);
        payload.put_slice(trailing);
        payload
    }

    fn router() -> MessageRouter<Received> {
        let mut router = MessageRouter::new(test_message_types());
        router
            .register_handler(|ctx: &mut Received, connection_id, _, msg: TestChat, rest| {
                ctx.chats.push((connection_id, msg.text, rest.len()));
                Ok(())
            }).unwrap()
            .register_handler(|ctx: &mut Received, _, _, msg: TestShout, _| {
                ctx.shouts.push(msg.volume);
                Ok(())
            }).unwrap();
        router
    }

    #[test]
    fn test_handler_leftovers_are_skipped() {
        let types = test_message_types();
        let chat = types.connection_message_type::<TestChat>().unwrap();
        let shout = types.connection_message_type::<TestShout>().unwrap();

        let mut packet = BytesMut::new();
        frame(chat, &chat_payload("hello", &[1, 2, 3]), &mut packet);
        let mut shout_payload = BytesMut::new();
        TestShout { volume: 11 }.ser(&mut shout_payload);
        frame(shout, &shout_payload, &mut packet);

        let mut received = Received::default();
        router().dispatch(&mut received, ConnectionId(2), endpoint(), &packet).unwrap();

        assert_eq!(received.chats, vec![(ConnectionId(2), "hello".to_string(), 3)]);
        assert_eq!(received.shouts, vec![11]);
    }

    #[test]
    fn test_unregistered_type_is_skipped() {
        let types = test_message_types();
        let shout = types.connection_message_type::<TestShout>().unwrap();

        let mut packet = BytesMut::new();
        frame(MessageType(77), &[9, 9, 9], &mut packet);
        let mut shout_payload = BytesMut::new();
        TestShout { volume: 4 }.ser(&mut shout_payload);
        frame(shout, &shout_payload, &mut packet);

        let mut received = Received::default();
        router().dispatch(&mut received, ConnectionId(0), endpoint(), &packet).unwrap();
        assert_eq!(received.shouts, vec![4]);
    }

    #[test]
    fn test_handler_over_read_is_an_error() {
        let types = test_message_types();
        let chat = types.connection_message_type::<TestChat>().unwrap();

        // the string claims 10 bytes but the frame ends after 2
        let mut packet = BytesMut::new();
        frame(chat, &[10, b'h', b'i'], &mut packet);
        packet.put_slice(&[0; 16]);

        let mut received = Received::default();
        assert!(router().dispatch(&mut received, ConnectionId(0), endpoint(), &packet).is_err());
        assert!(received.chats.is_empty());
    }

    #[test]
    fn test_frame_length_beyond_packet_is_an_error() {
        let mut packet = BytesMut::new();
        packet.put_usize_varint(50);
        packet.put_slice(&[0; 10]);

        let mut received = Received::default();
        assert!(router().dispatch(&mut received, ConnectionId(0), endpoint(), &packet).is_err());
    }

    #[test]
    fn test_register_replaces_and_clear_removes() {
        let types = test_message_types();
        let shout = types.connection_message_type::<TestShout>().unwrap();
        let mut shout_payload = BytesMut::new();
        TestShout { volume: 5 }.ser(&mut shout_payload);
        let mut packet = BytesMut::new();
        frame(shout, &shout_payload, &mut packet);

        let mut router = router();
        router.register_handler(|ctx: &mut Received, _, _, msg: TestShout, _| {
            ctx.shouts.push(msg.volume * 2);
            Ok(())
        }).unwrap();

        let mut received = Received::default();
        router.dispatch(&mut received, ConnectionId(0), endpoint(), &packet).unwrap();
        assert_eq!(received.shouts, vec![10]);

        router.clear_handlers();
        router.dispatch(&mut received, ConnectionId(0), endpoint(), &packet).unwrap();
        assert_eq!(received.shouts, vec![10]);
    }

    #[test]
    fn test_register_unknown_type_fails() {
        use crate::test_util::message::TestMove;
        let mut router = MessageRouter::<Received>::new(test_message_types());
        assert!(router.register_handler(|_, _, _, _: TestMove, _| Ok(())).is_err());
    }
}
