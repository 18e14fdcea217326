//! The messages the replication layer itself exchanges, plus `SetTransform` as the one built-in
//!  object message.

use std::net::SocketAddr;

use anyhow::anyhow;
use bytes::{BufMut, Bytes, BytesMut};
use bytes_varint::VarIntSupportMut;
use glam::{Quat, Vec3};

use crate::messaging::message_types::{Message, MessageTypesBuilder, ObjectMessage};
use crate::replication::object::{GlobalObjectId, ObjectId, ObjectRole, ObjectType};
use crate::transport::nat_punch::NatPunchId;
use crate::transport::DeliveryMode;
use crate::util::buf_ext::{BufExt, BufMutExt};

pub fn register_basic_messages(builder: &mut MessageTypesBuilder) {
    builder
        .add_message::<CreateObject>()
        .add_message::<ReplicatePreExistingObject>()
        .add_message::<DeleteObject>()
        .add_message::<Ping>()
        .add_message::<Pong>()
        .add_message::<ToObject>()
        .add_message::<RequestHostInfo>()
        .add_message::<HostInfoResponse>()
        .add_message::<NatPunchSuccessful>()
        .add_object_message::<SetTransform>();
}

fn try_read_role(buf: &mut &[u8]) -> anyhow::Result<ObjectRole> {
    let raw = buf.try_read_u8()?;
    ObjectRole::from_bits(raw)
        .ok_or_else(|| anyhow!("invalid object role {:#04x}", raw))
}


/// Announces a new object to a peer. `additional_data` holds the object's initial state as a
///  sequence of unframed `[varint type][payload]` object messages.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct CreateObject {
    pub object_type: ObjectType,
    pub object_id: ObjectId,
    pub role: ObjectRole,
    pub additional_data: Bytes,
}

impl Message for CreateObject {
    fn delivery_mode(&self) -> DeliveryMode {
        DeliveryMode::ReliableSequenced
    }

    fn ser(&self, buf: &mut BytesMut) {
        buf.put_u32_varint(self.object_type.0);
        buf.put_u32_varint(self.object_id.0);
        buf.put_u8(self.role.bits());
        buf.put_nested(&self.additional_data);
    }

    fn deser(buf: &mut &[u8]) -> anyhow::Result<Self> {
        Ok(CreateObject {
            object_type: ObjectType(buf.try_read_u32_varint()?),
            object_id: ObjectId(buf.try_read_u32_varint()?),
            role: try_read_role(buf)?,
            additional_data: buf.try_read_nested()?,
        })
    }
}

/// Binds an object that both peers already have to an object id
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct ReplicatePreExistingObject {
    pub global_object_id: GlobalObjectId,
    pub object_id: ObjectId,
    pub role: ObjectRole,
}

impl Message for ReplicatePreExistingObject {
    fn delivery_mode(&self) -> DeliveryMode {
        DeliveryMode::ReliableOrdered
    }

    fn ser(&self, buf: &mut BytesMut) {
        buf.put_slice(self.global_object_id.0.as_bytes());
        buf.put_u32_varint(self.object_id.0);
        buf.put_u8(self.role.bits());
    }

    fn deser(buf: &mut &[u8]) -> anyhow::Result<Self> {
        Ok(ReplicatePreExistingObject {
            global_object_id: GlobalObjectId::from_bytes(buf.try_read_array::<16>()?),
            object_id: ObjectId(buf.try_read_u32_varint()?),
            role: try_read_role(buf)?,
        })
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct DeleteObject {
    pub object_id: ObjectId,
}

impl Message for DeleteObject {
    fn delivery_mode(&self) -> DeliveryMode {
        DeliveryMode::ReliableSequenced
    }

    fn ser(&self, buf: &mut BytesMut) {
        buf.put_u32_varint(self.object_id.0);
    }

    fn deser(buf: &mut &[u8]) -> anyhow::Result<Self> {
        Ok(DeleteObject {
            object_id: ObjectId(buf.try_read_u32_varint()?),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Ping {
    pub timestamp: f64,
    pub fixed_timestamp: f64,
}

impl Message for Ping {
    fn delivery_mode(&self) -> DeliveryMode {
        DeliveryMode::Unreliable
    }

    fn ser(&self, buf: &mut BytesMut) {
        buf.put_f64_le(self.timestamp);
        buf.put_f64_le(self.fixed_timestamp);
    }

    fn deser(buf: &mut &[u8]) -> anyhow::Result<Self> {
        Ok(Ping {
            timestamp: buf.try_read_f64()?,
            fixed_timestamp: buf.try_read_f64()?,
        })
    }
}

/// Reply to a [Ping], echoing the ping's timestamps next to the replying side's own
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Pong {
    pub sender_timestamp: f64,
    pub sender_fixed_timestamp: f64,
    pub timestamp: f64,
    pub fixed_timestamp: f64,
}

impl Message for Pong {
    fn delivery_mode(&self) -> DeliveryMode {
        DeliveryMode::Unreliable
    }

    fn ser(&self, buf: &mut BytesMut) {
        buf.put_f64_le(self.sender_timestamp);
        buf.put_f64_le(self.sender_fixed_timestamp);
        buf.put_f64_le(self.timestamp);
        buf.put_f64_le(self.fixed_timestamp);
    }

    fn deser(buf: &mut &[u8]) -> anyhow::Result<Self> {
        Ok(Pong {
            sender_timestamp: buf.try_read_f64()?,
            sender_fixed_timestamp: buf.try_read_f64()?,
            timestamp: buf.try_read_f64()?,
            fixed_timestamp: buf.try_read_f64()?,
        })
    }
}

/// Envelope of an object message. Only the receiver is part of this message; the inner message
///  type and payload follow it in the same frame.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct ToObject {
    pub receiver: ObjectId,
    pub delivery_mode: DeliveryMode,
}

impl Message for ToObject {
    fn delivery_mode(&self) -> DeliveryMode {
        self.delivery_mode
    }

    fn ser(&self, buf: &mut BytesMut) {
        buf.put_u32_varint(self.receiver.0);
    }

    /// the delivery mode is not transmitted; received envelopes report the default
    fn deser(buf: &mut &[u8]) -> anyhow::Result<Self> {
        Ok(ToObject {
            receiver: ObjectId(buf.try_read_u32_varint()?),
            delivery_mode: DeliveryMode::ReliableUnordered,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RequestHostInfo {
    pub timestamp: f64,
}

impl Message for RequestHostInfo {
    fn delivery_mode(&self) -> DeliveryMode {
        DeliveryMode::ReliableUnordered
    }

    fn ser(&self, buf: &mut BytesMut) {
        buf.put_f64_le(self.timestamp);
    }

    fn deser(buf: &mut &[u8]) -> anyhow::Result<Self> {
        Ok(RequestHostInfo {
            timestamp: buf.try_read_f64()?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HostInfoResponse {
    pub sender_timestamp: f64,
    pub player_count: u16,
}

impl Message for HostInfoResponse {
    fn delivery_mode(&self) -> DeliveryMode {
        DeliveryMode::ReliableUnordered
    }

    fn ser(&self, buf: &mut BytesMut) {
        buf.put_f64_le(self.sender_timestamp);
        buf.put_u16_le(self.player_count);
    }

    fn deser(buf: &mut &[u8]) -> anyhow::Result<Self> {
        Ok(HostInfoResponse {
            sender_timestamp: buf.try_read_f64()?,
            player_count: buf.try_read_u16()?,
        })
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct NatPunchSuccessful {
    pub token: NatPunchId,
    pub endpoint: SocketAddr,
}

impl Message for NatPunchSuccessful {
    fn delivery_mode(&self) -> DeliveryMode {
        DeliveryMode::ReliableUnordered
    }

    fn ser(&self, buf: &mut BytesMut) {
        buf.put_string(&self.token.to_string());
        buf.put_socket_addr(&self.endpoint);
    }

    fn deser(buf: &mut &[u8]) -> anyhow::Result<Self> {
        Ok(NatPunchSuccessful {
            token: NatPunchId::parse(&buf.try_read_string()?)?,
            endpoint: buf.try_read_socket_addr()?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SetTransform {
    pub position: Vec3,
    pub rotation: Quat,
}

impl Message for SetTransform {
    fn delivery_mode(&self) -> DeliveryMode {
        DeliveryMode::ReliableUnordered
    }

    fn ser(&self, buf: &mut BytesMut) {
        buf.put_vec3(self.position);
        buf.put_rotation(self.rotation);
    }

    fn deser(buf: &mut &[u8]) -> anyhow::Result<Self> {
        Ok(SetTransform {
            position: buf.try_read_vec3()?,
            rotation: buf.try_read_rotation()?,
        })
    }
}

impl ObjectMessage for SetTransform {}
