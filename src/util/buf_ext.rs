use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use anyhow::{anyhow, bail};
use bytes::{Buf, BufMut, Bytes};
use bytes_varint::{VarIntSupport, VarIntSupportMut};
use glam::{Quat, Vec2, Vec3};

use crate::util::compression;

/// Checked reads: every getter returns an error instead of panicking when the buffer is exhausted.
///  Received data is untrusted, so all decoding goes through these.
macro_rules! try_read_impl {
    ($try_getter: ident, $ty:ty, $getter: ident) => {
        fn $try_getter(&mut self) -> anyhow::Result<$ty> {
            if self.remaining() < std::mem::size_of::<$ty>() {
                bail!("buffer underflow reading {}: {} bytes remaining", stringify!($ty), self.remaining());
            }
            Ok(self.$getter())
        }
    }
}

pub trait BufExt: Buf + VarIntSupport {
    try_read_impl!(try_read_u8, u8, get_u8);
    try_read_impl!(try_read_u16, u16, get_u16_le);
    try_read_impl!(try_read_u32, u32, get_u32_le);
    try_read_impl!(try_read_u64, u64, get_u64_le);
    try_read_impl!(try_read_i32, i32, get_i32_le);
    try_read_impl!(try_read_f32, f32, get_f32_le);
    try_read_impl!(try_read_f64, f64, get_f64_le);

    fn try_read_bool(&mut self) -> anyhow::Result<bool> {
        Ok(self.try_read_u8()? != 0)
    }

    fn try_read_u32_varint(&mut self) -> anyhow::Result<u32> {
        self.try_get_u32_varint()
            .map_err(|e| anyhow!("invalid varint: {:?}", e))
    }

    fn try_read_i32_varint(&mut self) -> anyhow::Result<i32> {
        self.try_get_i32_varint()
            .map_err(|e| anyhow!("invalid varint: {:?}", e))
    }

    fn try_read_usize_varint(&mut self) -> anyhow::Result<usize> {
        self.try_get_usize_varint()
            .map_err(|e| anyhow!("invalid varint: {:?}", e))
    }

    fn try_read_bytes(&mut self, len: usize) -> anyhow::Result<Bytes> {
        if self.remaining() < len {
            bail!("buffer underflow: {} bytes requested, {} remaining", len, self.remaining());
        }
        Ok(self.copy_to_bytes(len))
    }

    fn try_read_array<const N: usize>(&mut self) -> anyhow::Result<[u8; N]> {
        if self.remaining() < N {
            bail!("buffer underflow: {} bytes requested, {} remaining", N, self.remaining());
        }
        let mut result = [0u8; N];
        self.copy_to_slice(&mut result);
        Ok(result)
    }

    fn try_read_string(&mut self) -> anyhow::Result<String> {
        let len = self.try_read_usize_varint()?;
        let raw = self.try_read_bytes(len)?;
        Ok(String::from_utf8(raw.to_vec())?)
    }

    /// A length-prefixed region that can be parsed independently of the surrounding buffer
    fn try_read_nested(&mut self) -> anyhow::Result<Bytes> {
        let len = self.try_read_usize_varint()?;
        self.try_read_bytes(len)
    }

    fn try_read_list<T>(&mut self, mut read_element: impl FnMut(&mut Self) -> anyhow::Result<T>) -> anyhow::Result<Vec<T>> {
        let len = self.try_read_i32_varint()?;
        if len < 0 {
            bail!("negative list length {}", len);
        }

        // every element takes at least one byte, so this bounds the allocation by the buffer size
        let mut result = Vec::with_capacity((len as usize).min(self.remaining()));
        for _ in 0..len {
            result.push(read_element(self)?);
        }
        Ok(result)
    }

    fn try_read_vec2(&mut self) -> anyhow::Result<Vec2> {
        let x = self.try_read_f32()?;
        let y = self.try_read_f32()?;
        Ok(Vec2::new(x, y))
    }

    fn try_read_vec3(&mut self) -> anyhow::Result<Vec3> {
        let x = self.try_read_f32()?;
        let y = self.try_read_f32()?;
        let z = self.try_read_f32()?;
        Ok(Vec3::new(x, y, z))
    }

    fn try_read_rotation(&mut self) -> anyhow::Result<Quat> {
        Ok(compression::decompress_rotation(self.try_read_u32()?))
    }

    fn try_read_rgb(&mut self) -> anyhow::Result<[u8; 4]> {
        let [r, g, b] = self.try_read_array::<3>()?;
        Ok([r, g, b, u8::MAX])
    }

    fn try_read_rgba(&mut self) -> anyhow::Result<[u8; 4]> {
        self.try_read_array::<4>()
    }

    fn try_read_socket_addr(&mut self) -> anyhow::Result<SocketAddr> {
        let ip: IpAddr = match self.try_read_u8()? {
            4 => Ipv4Addr::from(self.try_read_array::<4>()?).into(),
            6 => Ipv6Addr::from(self.try_read_array::<16>()?).into(),
            other => bail!("invalid address family {}", other),
        };
        let port = self.try_read_u16()?;
        Ok(SocketAddr::new(ip, port))
    }

    fn try_read_peer_endpoint(&mut self) -> anyhow::Result<PeerEndpoint> {
        let internal = if self.try_read_bool()? {
            Some(self.try_read_socket_addr()?)
        }
        else {
            None
        };
        let external = self.try_read_socket_addr()?;
        Ok(PeerEndpoint { internal, external })
    }
}

pub trait BufMutExt: BufMut + VarIntSupportMut {
    fn put_bool(&mut self, v: bool) {
        self.put_u8(if v { 1 } else { 0 });
    }

    fn put_string(&mut self, s: &str) {
        self.put_usize_varint(s.len());
        self.put_slice(s.as_bytes());
    }

    fn put_nested(&mut self, data: &[u8]) {
        self.put_usize_varint(data.len());
        self.put_slice(data);
    }

    fn put_list<T>(&mut self, elements: &[T], mut write_element: impl FnMut(&mut Self, &T)) {
        self.put_i32_varint(elements.len() as i32);
        for element in elements {
            write_element(self, element);
        }
    }

    fn put_vec2(&mut self, v: Vec2) {
        self.put_f32_le(v.x);
        self.put_f32_le(v.y);
    }

    fn put_vec3(&mut self, v: Vec3) {
        self.put_f32_le(v.x);
        self.put_f32_le(v.y);
        self.put_f32_le(v.z);
    }

    fn put_rotation(&mut self, rotation: Quat) {
        self.put_u32_le(compression::compress_rotation(rotation));
    }

    fn put_rgb(&mut self, color: [u8; 4]) {
        self.put_slice(&color[..3]);
    }

    fn put_rgba(&mut self, color: [u8; 4]) {
        self.put_slice(&color);
    }

    fn put_socket_addr(&mut self, addr: &SocketAddr) {
        match addr.ip() {
            IpAddr::V4(ip) => {
                self.put_u8(4);
                self.put_slice(&ip.octets());
            }
            IpAddr::V6(ip) => {
                self.put_u8(6);
                self.put_slice(&ip.octets());
            }
        }
        self.put_u16_le(addr.port());
    }

    fn put_peer_endpoint(&mut self, endpoint: &PeerEndpoint) {
        self.put_bool(endpoint.internal.is_some());
        if let Some(internal) = &endpoint.internal {
            self.put_socket_addr(internal);
        }
        self.put_socket_addr(&endpoint.external);
    }
}

impl <T: Buf> BufExt for T {
}

impl <T: BufMut> BufMutExt for T {
}


/// A peer's publicly visible endpoint, optionally with the endpoint inside its own LAN
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub struct PeerEndpoint {
    pub internal: Option<SocketAddr>,
    pub external: SocketAddr,
}
