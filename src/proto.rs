//! Wire protocol: opcode catalogue, envelope header, payload codecs.
//!
//! Every message crossing a channel is an envelope:
//!
//! ```text
//! +--------+--------+----------------+----------------+=========+
//! | opcode | len    | tag            | seq            | payload |
//! | u32 LE | u32 LE | u64 LE         | u64 LE         | len B   |
//! +--------+--------+----------------+----------------+=========+
//! ```
//!
//! The tag is the client-side handle key, opaque to the host. Requests
//! (`T*`) expect exactly one reply (`R*`) with the same tag; events (`E*`)
//! and notifications (`N*`) are one-way.

use std::net::{Ipv4Addr, SocketAddrV4};

use crate::error::{Error, Result};

/// Envelope header size in bytes.
pub const HEADER_SIZE: usize = 24;

/// Envelope opcodes.
///
/// Requests are numbered from 1, replies carry the response bit, events
/// and notifications live in their own ranges.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Opcode {
    TSocket = 1,
    TBind = 2,
    TConnect = 3,
    TListen = 4,
    TSetsockopt = 5,
    TGetsockopt = 6,
    TSendmsg = 7,
    TSenddata = 8,
    TShutdown = 9,
    TClose = 10,

    RSocket = RESPONSE_BIT | 1,
    RBind = RESPONSE_BIT | 2,
    RConnect = RESPONSE_BIT | 3,
    RListen = RESPONSE_BIT | 4,
    RSetsockopt = RESPONSE_BIT | 5,
    RGetsockopt = RESPONSE_BIT | 6,
    RSendmsg = RESPONSE_BIT | 7,
    RSenddata = RESPONSE_BIT | 8,
    RShutdown = RESPONSE_BIT | 9,
    RClose = RESPONSE_BIT | 10,

    NSocket = 0x4000_0001,

    EAccept = 0x2000_0001,
    ERecvdata = 0x2000_0002,
}

/// High bit marking a reply to a `T*` request.
pub const RESPONSE_BIT: u32 = 0x8000_0000;
const EVENT_BIT: u32 = 0x2000_0000;
const NOTIFY_BIT: u32 = 0x4000_0000;

impl Opcode {
    pub fn from_u32(raw: u32) -> Result<Self> {
        let op = match raw {
            x if x == Opcode::TSocket as u32 => Opcode::TSocket,
            x if x == Opcode::TBind as u32 => Opcode::TBind,
            x if x == Opcode::TConnect as u32 => Opcode::TConnect,
            x if x == Opcode::TListen as u32 => Opcode::TListen,
            x if x == Opcode::TSetsockopt as u32 => Opcode::TSetsockopt,
            x if x == Opcode::TGetsockopt as u32 => Opcode::TGetsockopt,
            x if x == Opcode::TSendmsg as u32 => Opcode::TSendmsg,
            x if x == Opcode::TSenddata as u32 => Opcode::TSenddata,
            x if x == Opcode::TShutdown as u32 => Opcode::TShutdown,
            x if x == Opcode::TClose as u32 => Opcode::TClose,
            x if x == Opcode::RSocket as u32 => Opcode::RSocket,
            x if x == Opcode::RBind as u32 => Opcode::RBind,
            x if x == Opcode::RConnect as u32 => Opcode::RConnect,
            x if x == Opcode::RListen as u32 => Opcode::RListen,
            x if x == Opcode::RSetsockopt as u32 => Opcode::RSetsockopt,
            x if x == Opcode::RGetsockopt as u32 => Opcode::RGetsockopt,
            x if x == Opcode::RSendmsg as u32 => Opcode::RSendmsg,
            x if x == Opcode::RSenddata as u32 => Opcode::RSenddata,
            x if x == Opcode::RShutdown as u32 => Opcode::RShutdown,
            x if x == Opcode::RClose as u32 => Opcode::RClose,
            x if x == Opcode::NSocket as u32 => Opcode::NSocket,
            x if x == Opcode::EAccept as u32 => Opcode::EAccept,
            x if x == Opcode::ERecvdata as u32 => Opcode::ERecvdata,
            _ => return Err(Error::InvalidEnvelope),
        };
        Ok(op)
    }

    /// True for `R*` opcodes: routed to the reply queue.
    #[inline]
    pub fn is_reply(self) -> bool {
        (self as u32) & RESPONSE_BIT != 0
    }

    /// True for `E*` opcodes: routed to the event queue.
    #[inline]
    pub fn is_event(self) -> bool {
        (self as u32) & EVENT_BIT != 0
    }

    /// True for one-way notifications handled inline by the host.
    #[inline]
    pub fn is_notify(self) -> bool {
        (self as u32) & NOTIFY_BIT != 0 && (self as u32) & RESPONSE_BIT == 0
    }
}

/// Decoded envelope header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub opcode: Opcode,
    pub len: u32,
    pub tag: u64,
    pub seq: u64,
}

impl Header {
    #[inline]
    pub fn encode(&self, buf: &mut [u8]) {
        buf[0..4].copy_from_slice(&(self.opcode as u32).to_le_bytes());
        buf[4..8].copy_from_slice(&self.len.to_le_bytes());
        buf[8..16].copy_from_slice(&self.tag.to_le_bytes());
        buf[16..24].copy_from_slice(&self.seq.to_le_bytes());
    }

    #[inline]
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < HEADER_SIZE {
            return Err(Error::InvalidEnvelope);
        }
        Ok(Header {
            opcode: Opcode::from_u32(read_u32(buf, 0))?,
            len: read_u32(buf, 4),
            tag: read_u64(buf, 8),
            seq: read_u64(buf, 16),
        })
    }
}

#[inline]
fn read_u32(buf: &[u8], off: usize) -> u32 {
    u32::from_le_bytes(buf[off..off + 4].try_into().unwrap())
}

#[inline]
fn read_u64(buf: &[u8], off: usize) -> u64 {
    u64::from_le_bytes(buf[off..off + 8].try_into().unwrap())
}

#[inline]
fn read_i32(buf: &[u8], off: usize) -> i32 {
    i32::from_le_bytes(buf[off..off + 4].try_into().unwrap())
}

/// Marshalled request payload. The engine pairs it with its reply type.
pub trait Request {
    const OPCODE: Opcode;
    type Reply: Reply;
    fn encoded_len(&self) -> usize;
    fn encode(&self, buf: &mut [u8]);
}

/// Reply payload decoding.
pub trait Reply: Sized {
    const OPCODE: Opcode;
    fn decode(buf: &[u8]) -> Result<Self>;
}

/// Lifecycle states of a virtual or host-side socket.
///
/// `Epoll` is a client-only pseudo-state and never crosses the channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SockState {
    New,
    Listen,
    In,
    Out,
    Epoll,
}

/// IPv4 address crossing the channel as `{ip: u32 BE, port: u16 BE, pad}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WireAddr {
    pub ip: Ipv4Addr,
    pub port: u16,
}

impl WireAddr {
    pub const LEN: usize = 8;

    pub fn encode(&self, buf: &mut [u8]) {
        buf[0..4].copy_from_slice(&self.ip.octets());
        buf[4..6].copy_from_slice(&self.port.to_be_bytes());
        buf[6..8].fill(0);
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < Self::LEN {
            return Err(Error::InvalidEnvelope);
        }
        let octets: [u8; 4] = buf[0..4].try_into().unwrap();
        let port = u16::from_be_bytes(buf[4..6].try_into().unwrap());
        Ok(WireAddr {
            ip: Ipv4Addr::from(octets),
            port,
        })
    }
}

impl From<SocketAddrV4> for WireAddr {
    fn from(a: SocketAddrV4) -> Self {
        WireAddr {
            ip: *a.ip(),
            port: a.port(),
        }
    }
}

impl From<WireAddr> for SocketAddrV4 {
    fn from(a: WireAddr) -> Self {
        SocketAddrV4::new(a.ip, a.port)
    }
}

macro_rules! rc_reply {
    ($name:ident, $op:expr) => {
        /// Reply carrying only a return code (0 or negative errno).
        #[derive(Debug, Clone, Copy)]
        pub struct $name {
            pub rc: i32,
        }

        impl $name {
            pub fn encode_to(rc: i32, buf: &mut [u8]) {
                buf[0..4].copy_from_slice(&rc.to_le_bytes());
            }

            pub const LEN: usize = 4;
        }

        impl Reply for $name {
            const OPCODE: Opcode = $op;

            fn decode(buf: &[u8]) -> Result<Self> {
                if buf.len() < 4 {
                    return Err(Error::InvalidEnvelope);
                }
                Ok($name { rc: read_i32(buf, 0) })
            }
        }
    };
}

rc_reply!(RBind, Opcode::RBind);
rc_reply!(RConnect, Opcode::RConnect);
rc_reply!(RListen, Opcode::RListen);
rc_reply!(RSetsockopt, Opcode::RSetsockopt);
rc_reply!(RSendmsg, Opcode::RSendmsg);
rc_reply!(RSenddata, Opcode::RSenddata);
rc_reply!(RShutdown, Opcode::RShutdown);
rc_reply!(RClose, Opcode::RClose);

/// Create a real socket on the host.
#[derive(Debug, Clone, Copy)]
pub struct TSocket {
    pub domain: i32,
    pub ty: i32,
    pub protocol: i32,
}

impl TSocket {
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < 12 {
            return Err(Error::InvalidEnvelope);
        }
        Ok(TSocket {
            domain: read_i32(buf, 0),
            ty: read_i32(buf, 4),
            protocol: read_i32(buf, 8),
        })
    }
}

impl Request for TSocket {
    const OPCODE: Opcode = Opcode::TSocket;
    type Reply = RSocket;

    fn encoded_len(&self) -> usize {
        12
    }

    fn encode(&self, buf: &mut [u8]) {
        buf[0..4].copy_from_slice(&self.domain.to_le_bytes());
        buf[4..8].copy_from_slice(&self.ty.to_le_bytes());
        buf[8..12].copy_from_slice(&self.protocol.to_le_bytes());
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RSocket {
    pub rc: i32,
    pub sockid: u64,
}

impl RSocket {
    pub const LEN: usize = 12;

    pub fn encode_to(rc: i32, sockid: u64, buf: &mut [u8]) {
        buf[0..4].copy_from_slice(&rc.to_le_bytes());
        buf[4..12].copy_from_slice(&sockid.to_le_bytes());
    }
}

impl Reply for RSocket {
    const OPCODE: Opcode = Opcode::RSocket;

    fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < Self::LEN {
            return Err(Error::InvalidEnvelope);
        }
        Ok(RSocket {
            rc: read_i32(buf, 0),
            sockid: read_u64(buf, 4),
        })
    }
}

/// Tag registration for a host-accepted socket. One-way, no reply; the
/// envelope tag is the newly allocated client handle.
#[derive(Debug, Clone, Copy)]
pub struct NSocket {
    pub sockid: u64,
}

impl NSocket {
    pub const LEN: usize = 8;

    pub fn encode(&self, buf: &mut [u8]) {
        buf[0..8].copy_from_slice(&self.sockid.to_le_bytes());
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < Self::LEN {
            return Err(Error::InvalidEnvelope);
        }
        Ok(NSocket { sockid: read_u64(buf, 0) })
    }
}

macro_rules! addr_request {
    ($name:ident, $op:expr, $reply:ty) => {
        #[derive(Debug, Clone, Copy)]
        pub struct $name {
            pub sockid: u64,
            pub addr: WireAddr,
        }

        impl $name {
            pub fn decode(buf: &[u8]) -> Result<Self> {
                if buf.len() < 8 + WireAddr::LEN {
                    return Err(Error::InvalidEnvelope);
                }
                Ok($name {
                    sockid: read_u64(buf, 0),
                    addr: WireAddr::decode(&buf[8..])?,
                })
            }
        }

        impl Request for $name {
            const OPCODE: Opcode = $op;
            type Reply = $reply;

            fn encoded_len(&self) -> usize {
                8 + WireAddr::LEN
            }

            fn encode(&self, buf: &mut [u8]) {
                buf[0..8].copy_from_slice(&self.sockid.to_le_bytes());
                self.addr.encode(&mut buf[8..]);
            }
        }
    };
}

addr_request!(TBind, Opcode::TBind, RBind);
addr_request!(TConnect, Opcode::TConnect, RConnect);

#[derive(Debug, Clone, Copy)]
pub struct TListen {
    pub sockid: u64,
    pub backlog: i32,
}

impl TListen {
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < 12 {
            return Err(Error::InvalidEnvelope);
        }
        Ok(TListen {
            sockid: read_u64(buf, 0),
            backlog: read_i32(buf, 8),
        })
    }
}

impl Request for TListen {
    const OPCODE: Opcode = Opcode::TListen;
    type Reply = RListen;

    fn encoded_len(&self) -> usize {
        12
    }

    fn encode(&self, buf: &mut [u8]) {
        buf[0..8].copy_from_slice(&self.sockid.to_le_bytes());
        buf[8..12].copy_from_slice(&self.backlog.to_le_bytes());
    }
}

/// Option write. `optval` is the raw option bytes.
#[derive(Debug, Clone)]
pub struct TSetsockopt<'a> {
    pub sockid: u64,
    pub level: i32,
    pub optname: i32,
    pub optval: &'a [u8],
}

impl<'a> TSetsockopt<'a> {
    pub fn decode(buf: &'a [u8]) -> Result<Self> {
        if buf.len() < 16 {
            return Err(Error::InvalidEnvelope);
        }
        Ok(TSetsockopt {
            sockid: read_u64(buf, 0),
            level: read_i32(buf, 8),
            optname: read_i32(buf, 12),
            optval: &buf[16..],
        })
    }
}

impl<'a> Request for TSetsockopt<'a> {
    const OPCODE: Opcode = Opcode::TSetsockopt;
    type Reply = RSetsockopt;

    fn encoded_len(&self) -> usize {
        16 + self.optval.len()
    }

    fn encode(&self, buf: &mut [u8]) {
        buf[0..8].copy_from_slice(&self.sockid.to_le_bytes());
        buf[8..12].copy_from_slice(&self.level.to_le_bytes());
        buf[12..16].copy_from_slice(&self.optname.to_le_bytes());
        buf[16..16 + self.optval.len()].copy_from_slice(self.optval);
    }
}

/// Option read. `optlen` bounds the value the host returns.
#[derive(Debug, Clone, Copy)]
pub struct TGetsockopt {
    pub sockid: u64,
    pub level: i32,
    pub optname: i32,
    pub optlen: u32,
}

impl TGetsockopt {
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < 20 {
            return Err(Error::InvalidEnvelope);
        }
        Ok(TGetsockopt {
            sockid: read_u64(buf, 0),
            level: read_i32(buf, 8),
            optname: read_i32(buf, 12),
            optlen: read_u32(buf, 16),
        })
    }
}

impl Request for TGetsockopt {
    const OPCODE: Opcode = Opcode::TGetsockopt;
    type Reply = RGetsockopt;

    fn encoded_len(&self) -> usize {
        20
    }

    fn encode(&self, buf: &mut [u8]) {
        buf[0..8].copy_from_slice(&self.sockid.to_le_bytes());
        buf[8..12].copy_from_slice(&self.level.to_le_bytes());
        buf[12..16].copy_from_slice(&self.optname.to_le_bytes());
        buf[16..20].copy_from_slice(&self.optlen.to_le_bytes());
    }
}

#[derive(Debug, Clone)]
pub struct RGetsockopt {
    pub rc: i32,
    pub optval: Vec<u8>,
}

impl RGetsockopt {
    pub fn encode_to(rc: i32, optval: &[u8], buf: &mut [u8]) {
        buf[0..4].copy_from_slice(&rc.to_le_bytes());
        buf[4..4 + optval.len()].copy_from_slice(optval);
    }

    pub fn encoded_len(optval_len: usize) -> usize {
        4 + optval_len
    }
}

impl Reply for RGetsockopt {
    const OPCODE: Opcode = Opcode::RGetsockopt;

    fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < 4 {
            return Err(Error::InvalidEnvelope);
        }
        Ok(RGetsockopt {
            rc: read_i32(buf, 0),
            optval: buf[4..].to_vec(),
        })
    }
}

macro_rules! data_request {
    ($name:ident, $op:expr, $reply:ty) => {
        /// Outbound stream bytes for the host to write to the real socket.
        #[derive(Debug, Clone)]
        pub struct $name<'a> {
            pub sockid: u64,
            pub data: &'a [u8],
        }

        impl<'a> $name<'a> {
            pub fn decode(buf: &'a [u8]) -> Result<Self> {
                if buf.len() < 8 {
                    return Err(Error::InvalidEnvelope);
                }
                Ok($name {
                    sockid: read_u64(buf, 0),
                    data: &buf[8..],
                })
            }
        }

        impl<'a> Request for $name<'a> {
            const OPCODE: Opcode = $op;
            type Reply = $reply;

            fn encoded_len(&self) -> usize {
                8 + self.data.len()
            }

            fn encode(&self, buf: &mut [u8]) {
                buf[0..8].copy_from_slice(&self.sockid.to_le_bytes());
                buf[8..8 + self.data.len()].copy_from_slice(self.data);
            }
        }
    };
}

data_request!(TSenddata, Opcode::TSenddata, RSenddata);
data_request!(TSendmsg, Opcode::TSendmsg, RSendmsg);

#[derive(Debug, Clone, Copy)]
pub struct TShutdown {
    pub sockid: u64,
    pub how: i32,
}

impl TShutdown {
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < 12 {
            return Err(Error::InvalidEnvelope);
        }
        Ok(TShutdown {
            sockid: read_u64(buf, 0),
            how: read_i32(buf, 8),
        })
    }
}

impl Request for TShutdown {
    const OPCODE: Opcode = Opcode::TShutdown;
    type Reply = RShutdown;

    fn encoded_len(&self) -> usize {
        12
    }

    fn encode(&self, buf: &mut [u8]) {
        buf[0..8].copy_from_slice(&self.sockid.to_le_bytes());
        buf[8..12].copy_from_slice(&self.how.to_le_bytes());
    }
}

#[derive(Debug, Clone, Copy)]
pub struct TClose {
    pub sockid: u64,
}

impl TClose {
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < 8 {
            return Err(Error::InvalidEnvelope);
        }
        Ok(TClose { sockid: read_u64(buf, 0) })
    }
}

impl Request for TClose {
    const OPCODE: Opcode = Opcode::TClose;
    type Reply = RClose;

    fn encoded_len(&self) -> usize {
        8
    }

    fn encode(&self, buf: &mut [u8]) {
        buf[0..8].copy_from_slice(&self.sockid.to_le_bytes());
    }
}

/// Connection accepted on a listening socket. Sent to the listener's tag;
/// the client answers with [`NSocket`] carrying the new handle's tag.
#[derive(Debug, Clone, Copy)]
pub struct EAccept {
    pub sockid: u64,
    pub peer: WireAddr,
}

impl EAccept {
    pub const LEN: usize = 8 + WireAddr::LEN;

    pub fn encode(&self, buf: &mut [u8]) {
        buf[0..8].copy_from_slice(&self.sockid.to_le_bytes());
        self.peer.encode(&mut buf[8..]);
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < Self::LEN {
            return Err(Error::InvalidEnvelope);
        }
        Ok(EAccept {
            sockid: read_u64(buf, 0),
            peer: WireAddr::decode(&buf[8..])?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_roundtrip() {
        let hdr = Header {
            opcode: Opcode::TConnect,
            len: 16,
            tag: 7,
            seq: 0x0102_0304_0506_0708,
        };
        let mut buf = [0u8; HEADER_SIZE];
        hdr.encode(&mut buf);
        assert_eq!(Header::decode(&buf).unwrap(), hdr);
    }

    #[test]
    fn test_opcode_classes() {
        assert!(!Opcode::TSenddata.is_reply());
        assert!(Opcode::RSenddata.is_reply());
        assert!(Opcode::EAccept.is_event());
        assert!(Opcode::ERecvdata.is_event());
        assert!(!Opcode::RSocket.is_event());
        assert!(Opcode::NSocket.is_notify());
        assert!(!Opcode::RSocket.is_notify());
    }

    #[test]
    fn test_unknown_opcode_rejected() {
        let hdr = Header {
            opcode: Opcode::TSocket,
            len: 0,
            tag: 0,
            seq: 0,
        };
        let mut buf = [0u8; HEADER_SIZE];
        hdr.encode(&mut buf);
        buf[0..4].copy_from_slice(&0xdead_0000u32.to_le_bytes());
        assert!(Header::decode(&buf).is_err());
    }

    #[test]
    fn test_addr_request() {
        let req = TConnect {
            sockid: 42,
            addr: WireAddr {
                ip: Ipv4Addr::new(127, 0, 0, 1),
                port: 8080,
            },
        };
        let mut buf = vec![0u8; req.encoded_len()];
        req.encode(&mut buf);
        let back = TConnect::decode(&buf).unwrap();
        assert_eq!(back.sockid, 42);
        assert_eq!(back.addr, req.addr);
    }

    #[test]
    fn test_negative_rc_crosses_wire() {
        let mut buf = [0u8; 4];
        RConnect::encode_to(-libc::ECONNREFUSED, &mut buf);
        let r = RConnect::decode(&buf).unwrap();
        assert_eq!(r.rc, -libc::ECONNREFUSED);
    }
}
