//! Host-side socket bookkeeping: the real-socket wrapper, the per-worker
//! socket table with state buckets, the shared-listen registry, and the
//! send backlog.

use std::collections::HashMap;
use std::io;
use std::mem;
use std::net::SocketAddrV4;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::sync::Mutex;

use log::debug;
use slab::Slab;

use crate::proto::{SockState, WireAddr};

/// Thin wrapper over a real TCP socket fd. All sockets are IPv4 stream
/// sockets, non-blocking from creation; the event loop never issues a
/// call that can stall the worker.
pub(crate) struct RealSocket {
    fd: OwnedFd,
}

impl AsFd for RealSocket {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

impl std::fmt::Debug for RealSocket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "RealSocket({})", self.fd.as_raw_fd())
    }
}

fn last_errno() -> i32 {
    io::Error::last_os_error().raw_os_error().unwrap_or(libc::EIO)
}

fn sockaddr_in(addr: SocketAddrV4) -> libc::sockaddr_in {
    let mut sin: libc::sockaddr_in = unsafe { mem::zeroed() };
    sin.sin_family = libc::AF_INET as libc::sa_family_t;
    sin.sin_port = addr.port().to_be();
    sin.sin_addr.s_addr = u32::from(*addr.ip()).to_be();
    sin
}

fn addr_from_sockaddr(sin: &libc::sockaddr_in) -> SocketAddrV4 {
    SocketAddrV4::new(
        u32::from_be(sin.sin_addr.s_addr).into(),
        u16::from_be(sin.sin_port),
    )
}

impl RealSocket {
    pub fn new_tcp() -> io::Result<RealSocket> {
        let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_STREAM | libc::SOCK_NONBLOCK, 0) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        let sock = RealSocket {
            fd: unsafe { OwnedFd::from_raw_fd(fd) },
        };
        Ok(sock)
    }

    pub fn raw(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    pub fn dup(&self) -> io::Result<RealSocket> {
        let fd = unsafe { libc::dup(self.raw()) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(RealSocket {
            fd: unsafe { OwnedFd::from_raw_fd(fd) },
        })
    }

    pub fn set_reuseaddr(&self) {
        let one: i32 = 1;
        let rc = self.setsockopt_raw(
            libc::SOL_SOCKET,
            libc::SO_REUSEADDR,
            &one.to_ne_bytes(),
        );
        if rc != 0 {
            debug!("fd {}: SO_REUSEADDR failed with {}", self.raw(), rc);
        }
    }

    /// Returns 0 or a negative errno, the convention replies use.
    pub fn bind(&self, addr: SocketAddrV4) -> i32 {
        let sin = sockaddr_in(addr);
        let rc = unsafe {
            libc::bind(
                self.raw(),
                &sin as *const libc::sockaddr_in as *const libc::sockaddr,
                mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
            )
        };
        if rc < 0 {
            -last_errno()
        } else {
            0
        }
    }

    pub fn listen(&self, backlog: i32) -> i32 {
        let rc = unsafe { libc::listen(self.raw(), backlog.max(1)) };
        if rc < 0 {
            -last_errno()
        } else {
            0
        }
    }

    /// Start a connect. The socket is non-blocking, so -EINPROGRESS is
    /// the common outcome; completion is observed as writability and the
    /// verdict read with [`RealSocket::take_error`].
    pub fn connect(&self, addr: SocketAddrV4) -> i32 {
        let sin = sockaddr_in(addr);
        let rc = unsafe {
            libc::connect(
                self.raw(),
                &sin as *const libc::sockaddr_in as *const libc::sockaddr,
                mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
            )
        };
        if rc < 0 {
            -last_errno()
        } else {
            0
        }
    }

    /// Consume the pending socket error (SO_ERROR). Returns 0 when the
    /// socket is healthy, a positive errno otherwise.
    pub fn take_error(&self) -> i32 {
        let (rc, val) = self.getsockopt_raw(libc::SOL_SOCKET, libc::SO_ERROR, 4);
        if rc < 0 {
            return -rc;
        }
        if val.len() < 4 {
            return libc::EIO;
        }
        i32::from_ne_bytes([val[0], val[1], val[2], val[3]])
    }

    pub fn shutdown(&self, how: i32) -> i32 {
        let rc = unsafe { libc::shutdown(self.raw(), how) };
        if rc < 0 {
            -last_errno()
        } else {
            0
        }
    }

    /// Accept one pending connection, already non-blocking. `Ok(None)`
    /// means the accept queue is drained.
    pub fn accept(&self) -> io::Result<Option<(RealSocket, SocketAddrV4)>> {
        let mut sin: libc::sockaddr_in = unsafe { mem::zeroed() };
        let mut len = mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
        let fd = unsafe {
            libc::accept4(
                self.raw(),
                &mut sin as *mut libc::sockaddr_in as *mut libc::sockaddr,
                &mut len,
                libc::SOCK_NONBLOCK,
            )
        };
        if fd < 0 {
            let e = io::Error::last_os_error();
            return match e.kind() {
                io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted => Ok(None),
                _ => Err(e),
            };
        }
        Ok(Some((
            RealSocket {
                fd: unsafe { OwnedFd::from_raw_fd(fd) },
            },
            addr_from_sockaddr(&sin),
        )))
    }

    pub fn send(&self, buf: &[u8]) -> io::Result<usize> {
        let rc = unsafe {
            libc::send(
                self.raw(),
                buf.as_ptr() as *const libc::c_void,
                buf.len(),
                libc::MSG_NOSIGNAL,
            )
        };
        if rc < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(rc as usize)
        }
    }

    pub fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        let rc = unsafe {
            libc::recv(
                self.raw(),
                buf.as_mut_ptr() as *mut libc::c_void,
                buf.len(),
                0,
            )
        };
        if rc < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(rc as usize)
        }
    }

    pub fn setsockopt_raw(&self, level: i32, optname: i32, optval: &[u8]) -> i32 {
        let rc = unsafe {
            libc::setsockopt(
                self.raw(),
                level,
                optname,
                optval.as_ptr() as *const libc::c_void,
                optval.len() as libc::socklen_t,
            )
        };
        if rc < 0 {
            -last_errno()
        } else {
            0
        }
    }

    pub fn getsockopt_raw(&self, level: i32, optname: i32, optlen: u32) -> (i32, Vec<u8>) {
        let mut buf = vec![0u8; optlen as usize];
        let mut len = optlen as libc::socklen_t;
        let rc = unsafe {
            libc::getsockopt(
                self.raw(),
                level,
                optname,
                buf.as_mut_ptr() as *mut libc::c_void,
                &mut len,
            )
        };
        if rc < 0 {
            (-last_errno(), Vec::new())
        } else {
            buf.truncate(len as usize);
            (0, buf)
        }
    }
}

/// Fixed-capacity staging buffer for bytes the real socket would not take.
///
/// Bytes only leave from the front, so between any two observations the
/// buffered length never grows except through `stage`.
pub(crate) struct SendBacklog {
    buf: Vec<u8>,
    start: usize,
    cap: usize,
}

impl SendBacklog {
    pub fn new(cap: usize) -> Self {
        SendBacklog {
            buf: Vec::new(),
            start: 0,
            cap,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.buf.len() - self.start
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Append bytes if the capacity allows it. No partial staging.
    pub fn stage(&mut self, data: &[u8]) -> bool {
        if self.len() + data.len() > self.cap {
            return false;
        }
        if self.start > 0 && self.buf.len() + data.len() > self.cap {
            self.buf.drain(..self.start);
            self.start = 0;
        }
        self.buf.extend_from_slice(data);
        true
    }

    #[inline]
    pub fn pending(&self) -> &[u8] {
        &self.buf[self.start..]
    }

    /// Drop `n` bytes from the front after a successful partial send.
    pub fn consume(&mut self, n: usize) {
        debug_assert!(n <= self.len());
        self.start += n;
        if self.start == self.buf.len() {
            self.buf.clear();
            self.start = 0;
        }
    }
}

const BUCKETS: usize = 4;

fn bucket_of(state: SockState) -> usize {
    match state {
        SockState::New => 0,
        SockState::Listen => 1,
        SockState::In => 2,
        SockState::Out => 3,
        // Epoll pseudo-sockets never reach the host.
        SockState::Epoll => unreachable!("epoll handle crossed the channel"),
    }
}

/// One real socket owned by a worker.
pub(crate) struct ProxySocket {
    pub link: usize,
    pub tag: u64,
    /// Accepted sockets start without a tag; reads wait for the client's
    /// registration notify.
    pub tag_available: bool,
    pub state: SockState,
    pub sock: RealSocket,
    pub backlog: SendBacklog,
    pub want_write: bool,
    /// Connect issued but not yet resolved; the reply is deferred until
    /// the event loop sees writability.
    pub connecting: bool,
    /// Local address a listener registered under, for unregistration.
    pub bound_addr: Option<WireAddr>,
    /// End of stream already pushed; stop reading.
    pub eof_sent: bool,
    bucket_pos: usize,
}

impl ProxySocket {
    pub fn new(
        link: usize,
        tag: u64,
        state: SockState,
        sock: RealSocket,
        backlog_cap: usize,
    ) -> Self {
        ProxySocket {
            link,
            tag,
            tag_available: state != SockState::In,
            state,
            sock,
            backlog: SendBacklog::new(backlog_cap),
            want_write: false,
            connecting: false,
            bound_addr: None,
            eof_sent: false,
            bucket_pos: 0,
        }
    }
}

/// Per-worker socket table, bucketed by state. Bucket membership is
/// tracked positionally so add, move and remove are O(1).
pub(crate) struct SockTable {
    slab: Slab<ProxySocket>,
    buckets: [Vec<usize>; BUCKETS],
}

impl SockTable {
    pub fn new() -> Self {
        SockTable {
            slab: Slab::new(),
            buckets: Default::default(),
        }
    }

    pub fn insert(&mut self, mut sock: ProxySocket) -> usize {
        let entry = self.slab.vacant_entry();
        let key = entry.key();
        let b = bucket_of(sock.state);
        sock.bucket_pos = self.buckets[b].len();
        self.buckets[b].push(key);
        entry.insert(sock);
        key
    }

    pub fn get(&self, key: usize) -> Option<&ProxySocket> {
        self.slab.get(key)
    }

    pub fn get_mut(&mut self, key: usize) -> Option<&mut ProxySocket> {
        self.slab.get_mut(key)
    }

    pub fn set_state(&mut self, key: usize, state: SockState) {
        let (old, pos) = match self.slab.get(key) {
            Some(s) => (s.state, s.bucket_pos),
            None => return,
        };
        if old == state {
            return;
        }
        self.bucket_remove(bucket_of(old), pos);
        let b = bucket_of(state);
        let sock = &mut self.slab[key];
        sock.state = state;
        sock.bucket_pos = self.buckets[b].len();
        self.buckets[b].push(key);
    }

    pub fn remove(&mut self, key: usize) -> Option<ProxySocket> {
        if !self.slab.contains(key) {
            return None;
        }
        let sock = self.slab.remove(key);
        self.bucket_remove(bucket_of(sock.state), sock.bucket_pos);
        Some(sock)
    }

    fn bucket_remove(&mut self, b: usize, pos: usize) {
        let bucket = &mut self.buckets[b];
        bucket.swap_remove(pos);
        if let Some(&moved) = bucket.get(pos) {
            self.slab[moved].bucket_pos = pos;
        }
    }

    /// Sockets registered with the event loop.
    pub fn watched_count(&self) -> usize {
        self.buckets[1].len() + self.buckets[2].len() + self.buckets[3].len()
    }

    pub fn listening_count(&self) -> usize {
        self.buckets[1].len()
    }
}

struct LinkSlot {
    link: usize,
    tag: u64,
}

struct SharedListen {
    /// Our own dup of the first binder's socket, kept so the group
    /// outlives any one worker's table entry.
    sock: RealSocket,
    slots: Vec<LinkSlot>,
    rr: usize,
}

/// Accept target chosen by the load balancer.
#[derive(Debug, Clone, Copy)]
pub(crate) struct AcceptTarget {
    pub link: usize,
    pub tag: u64,
}

/// Global registry of listening addresses, shared by all workers.
///
/// The first bind of an address performs the real bind; later binds of
/// the same address receive a dup of the existing socket and join the
/// group. Accepts rotate over the registered links.
pub(crate) struct ListenerRegistry {
    inner: Mutex<HashMap<(u32, u16), SharedListen>>,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        ListenerRegistry {
            inner: Mutex::new(HashMap::new()),
        }
    }

    fn key(addr: WireAddr) -> (u32, u16) {
        (u32::from(addr.ip), addr.port)
    }

    /// Bind `sock` to `addr`, or join an existing group. On the join path
    /// the returned socket replaces the caller's fd. Returns a negative
    /// errno on bind failure.
    pub fn bind(
        &self,
        addr: WireAddr,
        link: usize,
        tag: u64,
        sock: &RealSocket,
    ) -> std::result::Result<Option<RealSocket>, i32> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(group) = inner.get_mut(&Self::key(addr)) {
            let dup = group.sock.dup().map_err(|e| {
                -e.raw_os_error().unwrap_or(libc::EIO)
            })?;
            group.slots.push(LinkSlot { link, tag });
            debug!(
                "listener {}:{} shared, {} links registered",
                addr.ip,
                addr.port,
                group.slots.len()
            );
            return Ok(Some(dup));
        }
        let rc = sock.bind(SocketAddrV4::new(addr.ip, addr.port));
        if rc < 0 {
            return Err(rc);
        }
        let own = sock.dup().map_err(|e| -e.raw_os_error().unwrap_or(libc::EIO))?;
        inner.insert(
            Self::key(addr),
            SharedListen {
                sock: own,
                slots: vec![LinkSlot { link, tag }],
                rr: 0,
            },
        );
        Ok(None)
    }

    /// Pick the link receiving the next accepted connection, rotating
    /// round-robin through the group.
    pub fn next_accept_target(&self, addr: WireAddr) -> Option<AcceptTarget> {
        let mut inner = self.inner.lock().unwrap();
        let group = inner.get_mut(&Self::key(addr))?;
        if group.slots.is_empty() {
            return None;
        }
        let slot = &group.slots[group.rr % group.slots.len()];
        let target = AcceptTarget {
            link: slot.link,
            tag: slot.tag,
        };
        group.rr = (group.rr + 1) % group.slots.len();
        Some(target)
    }

    /// Drop one link's membership; the group goes away with its last
    /// member.
    pub fn unregister(&self, addr: WireAddr, link: usize, tag: u64) {
        let mut inner = self.inner.lock().unwrap();
        let Some(group) = inner.get_mut(&Self::key(addr)) else {
            return;
        };
        group.slots.retain(|s| !(s.link == link && s.tag == tag));
        if group.rr >= group.slots.len() {
            group.rr = 0;
        }
        if group.slots.is_empty() {
            inner.remove(&Self::key(addr));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backlog_monotonic_flush() {
        let mut b = SendBacklog::new(64);
        assert!(b.stage(&[1u8; 40]));
        assert!(b.stage(&[2u8; 20]));
        assert!(!b.stage(&[3u8; 10]));
        assert_eq!(b.len(), 60);

        let mut last = b.len();
        while !b.is_empty() {
            let n = b.pending().len().min(7);
            b.consume(n);
            assert!(b.len() < last);
            last = b.len();
        }
        // Space reclaimed by the flush is usable again.
        assert!(b.stage(&[3u8; 64]));
    }

    #[test]
    fn test_backlog_front_order() {
        let mut b = SendBacklog::new(16);
        assert!(b.stage(&[1, 2, 3]));
        assert!(b.stage(&[4, 5]));
        assert_eq!(b.pending(), &[1, 2, 3, 4, 5]);
        b.consume(2);
        assert_eq!(b.pending(), &[3, 4, 5]);
        assert!(b.stage(&[6]));
        assert_eq!(b.pending(), &[3, 4, 5, 6]);
    }

    #[test]
    fn test_sock_table_buckets() {
        let mut t = SockTable::new();
        let a = t.insert(ProxySocket::new(
            0,
            0,
            SockState::New,
            RealSocket::new_tcp().unwrap(),
            64,
        ));
        let b = t.insert(ProxySocket::new(
            0,
            1,
            SockState::New,
            RealSocket::new_tcp().unwrap(),
            64,
        ));
        assert_eq!(t.watched_count(), 0);

        t.set_state(a, SockState::Listen);
        assert_eq!(t.listening_count(), 1);
        assert_eq!(t.watched_count(), 1);

        t.set_state(b, SockState::Out);
        assert_eq!(t.watched_count(), 2);

        t.remove(a);
        assert_eq!(t.listening_count(), 0);
        assert_eq!(t.watched_count(), 1);
        assert_eq!(t.get(b).unwrap().tag, 1);
    }

    #[test]
    fn test_round_robin_rotation() {
        let reg = ListenerRegistry::new();
        let addr = WireAddr {
            ip: std::net::Ipv4Addr::new(127, 0, 0, 1),
            port: 0,
        };
        let s0 = RealSocket::new_tcp().unwrap();
        s0.set_reuseaddr();
        // Port 0 binds to an ephemeral port; the registry keys on the
        // requested address, which is all the rotation logic needs.
        assert!(reg.bind(addr, 0, 10, &s0).unwrap().is_none());
        let s1 = RealSocket::new_tcp().unwrap();
        assert!(reg.bind(addr, 1, 20, &s1).unwrap().is_some());

        let picks: Vec<usize> = (0..6)
            .map(|_| reg.next_accept_target(addr).unwrap().link)
            .collect();
        assert_eq!(picks, vec![0, 1, 0, 1, 0, 1]);

        reg.unregister(addr, 0, 10);
        assert_eq!(reg.next_accept_target(addr).unwrap().link, 1);
        reg.unregister(addr, 1, 20);
        assert!(reg.next_accept_target(addr).is_none());
    }
}
