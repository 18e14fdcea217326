use std::sync::Arc;

use bytes::{BufMut, Bytes, BytesMut};

use crate::messaging::message_types::{Message, MessageTypes, ObjectMessage};
use crate::transport::DeliveryMode;
use crate::util::buf_ext::{BufExt, BufMutExt};

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct TestChat {
    pub text: String,
}

impl Message for TestChat {
    fn delivery_mode(&self) -> DeliveryMode {
        DeliveryMode::ReliableOrdered
    }

    fn ser(&self, buf: &mut BytesMut) {
        buf.put_string(&self.text);
    }

    fn deser(buf: &mut &[u8]) -> anyhow::Result<Self> {
        Ok(TestChat {
            text: buf.try_read_string()?,
        })
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct TestShout {
    pub volume: u8,
}

impl Message for TestShout {
    fn delivery_mode(&self) -> DeliveryMode {
        DeliveryMode::Unreliable
    }

    fn ser(&self, buf: &mut BytesMut) {
        buf.put_u8(self.volume);
    }

    fn deser(buf: &mut &[u8]) -> anyhow::Result<Self> {
        Ok(TestShout {
            volume: buf.try_read_u8()?,
        })
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct TestBlob {
    pub data: Bytes,
}

impl Message for TestBlob {
    fn delivery_mode(&self) -> DeliveryMode {
        DeliveryMode::ReliableUnordered
    }

    fn ser(&self, buf: &mut BytesMut) {
        buf.put_nested(&self.data);
    }

    fn deser(buf: &mut &[u8]) -> anyhow::Result<Self> {
        Ok(TestBlob {
            data: buf.try_read_nested()?,
        })
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct TestMove {
    pub x: i32,
    pub y: i32,
}

impl Message for TestMove {
    fn delivery_mode(&self) -> DeliveryMode {
        DeliveryMode::UnreliableSequenced
    }

    fn ser(&self, buf: &mut BytesMut) {
        buf.put_i32_le(self.x);
        buf.put_i32_le(self.y);
    }

    fn deser(buf: &mut &[u8]) -> anyhow::Result<Self> {
        Ok(TestMove {
            x: buf.try_read_i32()?,
            y: buf.try_read_i32()?,
        })
    }
}
impl ObjectMessage for TestMove {}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct TestWave;

impl Message for TestWave {
    fn delivery_mode(&self) -> DeliveryMode {
        DeliveryMode::ReliableUnordered
    }

    fn ser(&self, _buf: &mut BytesMut) {}

    fn deser(_buf: &mut &[u8]) -> anyhow::Result<Self> {
        Ok(TestWave)
    }
}
impl ObjectMessage for TestWave {}


/// The basic messages plus all test messages
pub fn test_message_types() -> Arc<MessageTypes> {
    let types = MessageTypes::builder()
        .with_basic_messages()
        .add_message::<TestChat>()
        .add_message::<TestShout>()
        .add_message::<TestBlob>()
        .add_object_message::<TestMove>()
        .add_object_message::<TestWave>()
        .build()
        .expect("test message types are consistent");
    Arc::new(types)
}
