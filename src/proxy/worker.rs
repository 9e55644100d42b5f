//! Proxy worker: one pinned thread owning channel `w` of every link and
//! every real socket those channels created.
//!
//! The loop alternates two sweeps and never blocks:
//!
//! 1. channel sweep: drain a bounded batch of requests per channel,
//!    releasing each request slot right after copy-out so the client is
//!    not throttled by syscall latency,
//! 2. socket sweep: a zero-timeout `epoll_wait` over the real sockets;
//!    accepts, reads and backlog flushes are all serviced here.

use std::io;
use std::mem;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::{debug, error};
use nix::sys::epoll::{Epoll, EpollCreateFlags, EpollEvent, EpollFlags, EpollTimeout};

use crate::backoff::Backoff;
use crate::channel::Channel;
use crate::error::{PutError, Result};
use crate::proto::{
    EAccept, Header, NSocket, Opcode, RClose, RGetsockopt, RSocket, SockState, TBind, TClose,
    TConnect, TGetsockopt, TListen, TSenddata, TSetsockopt, TShutdown, TSocket, WireAddr,
    HEADER_SIZE,
};
use crate::FabricConfig;

use super::socket::{AcceptTarget, ListenerRegistry, ProxySocket, RealSocket, SockTable};

/// Requests handled per channel per sweep.
const DISPATCH_BATCH: usize = 32;

const MAX_EPOLL_EVENTS: usize = 64;

const STREAM_FLAGS: EpollFlags = EpollFlags::EPOLLIN.union(EpollFlags::EPOLLRDHUP);

pub(crate) struct Worker {
    id: usize,
    /// Indexed by link id.
    channels: Vec<Channel>,
    table: SockTable,
    epoll: Epoll,
    registry: Arc<ListenerRegistry>,
    cfg: FabricConfig,
    scratch: Vec<u8>,
    stop: Arc<AtomicBool>,
    core: Option<core_affinity::CoreId>,
}

/// Enqueue an outbound envelope, absorbing transient fullness. A dead
/// peer just drops the message.
fn push_out(ch: &Channel, opcode: Opcode, tag: u64, payload: &[u8]) {
    let mut backoff = Backoff::new();
    loop {
        match ch.tx().put(opcode, tag, payload) {
            Ok(_) => return,
            Err(PutError::Full) => backoff.wait(),
            Err(PutError::TooBig) => {
                debug!("channel {}: oversized {:?} dropped", ch.id, opcode);
                return;
            }
            Err(PutError::Closed) => {
                debug!("channel {}: peer gone, dropping {:?}", ch.id, opcode);
                return;
            }
        }
    }
}

impl Worker {
    pub fn new(
        id: usize,
        channels: Vec<Channel>,
        registry: Arc<ListenerRegistry>,
        cfg: FabricConfig,
        stop: Arc<AtomicBool>,
        core: Option<core_affinity::CoreId>,
    ) -> Result<Worker> {
        let epoll = Epoll::new(EpollCreateFlags::empty()).map_err(io::Error::from)?;
        Ok(Worker {
            id,
            channels,
            table: SockTable::new(),
            epoll,
            registry,
            scratch: Vec::with_capacity(cfg.slot_size),
            cfg,
            stop,
            core,
        })
    }

    pub fn run(mut self) {
        if let Some(core) = self.core {
            if !core_affinity::set_for_current(core) {
                debug!("worker {}: failed to pin to core {}", self.id, core.id);
            }
        }
        debug!("worker {}: serving {} links", self.id, self.channels.len());
        let mut backoff = Backoff::new();
        let mut read_buf = vec![0u8; self.cfg.slot_size];
        loop {
            if self.stop.load(Ordering::Acquire) {
                break;
            }
            let mut progressed = self.sweep_channels();
            if self.table.watched_count() > 0 {
                progressed |= self.sweep_sockets(&mut read_buf);
            }
            if progressed {
                backoff.reset();
            } else {
                backoff.wait();
            }
        }
        for ch in &self.channels {
            ch.close();
        }
        debug!("worker {}: stopped", self.id);
    }

    fn sweep_channels(&mut self) -> bool {
        let mut scratch = mem::take(&mut self.scratch);
        let mut progressed = false;
        for link in 0..self.channels.len() {
            for _ in 0..DISPATCH_BATCH {
                let rx = self.channels[link].rx();
                let Some(idx) = rx.get() else { break };
                progressed = true;
                let hdr = match rx.slot_header(idx) {
                    Ok(h) => h,
                    Err(_) => {
                        debug!("worker {}: malformed envelope on link {}", self.id, link);
                        rx.mark_done(idx);
                        continue;
                    }
                };
                scratch.clear();
                scratch.extend_from_slice(&rx.slot_bytes(idx)[HEADER_SIZE..]);
                // Free the request slot before any syscall.
                rx.mark_done(idx);
                self.handle_envelope(link, hdr, &scratch);
            }
        }
        self.scratch = scratch;
        progressed
    }

    fn handle_envelope(&mut self, link: usize, hdr: Header, payload: &[u8]) {
        match hdr.opcode {
            Opcode::TSocket => self.op_socket(link, hdr.tag, payload),
            Opcode::NSocket => self.op_notify(link, hdr.tag, payload),
            Opcode::TBind => self.op_bind(link, hdr.tag, payload),
            Opcode::TConnect => self.op_connect(link, hdr.tag, payload),
            Opcode::TListen => self.op_listen(link, hdr.tag, payload),
            Opcode::TSetsockopt => self.op_setsockopt(link, hdr.tag, payload),
            Opcode::TGetsockopt => self.op_getsockopt(link, hdr.tag, payload),
            Opcode::TSenddata => self.op_send(link, hdr.tag, payload, Opcode::RSenddata),
            Opcode::TSendmsg => self.op_send(link, hdr.tag, payload, Opcode::RSendmsg),
            Opcode::TShutdown => self.op_shutdown(link, hdr.tag, payload),
            Opcode::TClose => self.op_close(link, hdr.tag, payload),
            other => {
                debug!("worker {}: unexpected opcode {:?}, dropping", self.id, other);
            }
        }
    }

    /// Look up a request's socket. A stale sockid, or one owned by a
    /// different link, is a protocol race; the caller answers EBADF.
    fn sock_mut(&mut self, key: usize, link: usize) -> Option<&mut ProxySocket> {
        self.table.get_mut(key).filter(|s| s.link == link)
    }

    fn op_socket(&mut self, link: usize, tag: u64, payload: &[u8]) {
        let Ok(req) = TSocket::decode(payload) else { return };
        let mut out = [0u8; RSocket::LEN];
        if req.domain != libc::AF_INET || req.ty != libc::SOCK_STREAM {
            RSocket::encode_to(-libc::EAFNOSUPPORT, 0, &mut out);
            push_out(&self.channels[link], Opcode::RSocket, tag, &out);
            return;
        }
        match RealSocket::new_tcp() {
            Ok(sock) => {
                sock.set_reuseaddr();
                let cap = self.cfg.backlog_capacity;
                let key = self
                    .table
                    .insert(ProxySocket::new(link, tag, SockState::New, sock, cap));
                debug!("worker {}: socket {} created for link {}", self.id, key, link);
                RSocket::encode_to(0, key as u64, &mut out);
            }
            Err(e) => {
                RSocket::encode_to(-e.raw_os_error().unwrap_or(libc::EIO), 0, &mut out);
            }
        }
        push_out(&self.channels[link], Opcode::RSocket, tag, &out);
    }

    /// Client-side tag registration for an accepted socket. One way.
    fn op_notify(&mut self, link: usize, tag: u64, payload: &[u8]) {
        let Ok(req) = NSocket::decode(payload) else { return };
        let key = req.sockid as usize;
        match self.sock_mut(key, link) {
            Some(sock) => {
                sock.tag = tag;
                sock.tag_available = true;
                debug!("worker {}: socket {} tagged {}", self.id, key, tag);
            }
            None => {
                debug!("worker {}: notify for unknown socket {}", self.id, key);
            }
        }
    }

    fn op_bind(&mut self, link: usize, tag: u64, payload: &[u8]) {
        let Ok(req) = TBind::decode(payload) else { return };
        let key = req.sockid as usize;
        let rc = if self.sock_mut(key, link).is_none() {
            -libc::EBADF
        } else {
            let result = {
                let sock = self.table.get(key).unwrap();
                self.registry.bind(req.addr, link, tag, &sock.sock)
            };
            match result {
                Ok(None) => {
                    self.table.get_mut(key).unwrap().bound_addr = Some(req.addr);
                    0
                }
                Ok(Some(dup)) => {
                    // Joined an existing group: adopt its socket.
                    let sock = self.table.get_mut(key).unwrap();
                    sock.sock = dup;
                    sock.bound_addr = Some(req.addr);
                    0
                }
                Err(rc) => rc,
            }
        };
        let mut out = [0u8; 4];
        crate::proto::RBind::encode_to(rc, &mut out);
        push_out(&self.channels[link], Opcode::RBind, tag, &out);
    }

    fn op_listen(&mut self, link: usize, tag: u64, payload: &[u8]) {
        let Ok(req) = TListen::decode(payload) else { return };
        let key = req.sockid as usize;
        let mut rc = match self.sock_mut(key, link) {
            Some(sock) => sock.sock.listen(req.backlog),
            None => -libc::EBADF,
        };
        if rc == 0 {
            let sock = self.table.get(key).unwrap();
            if let Err(e) = self.epoll.add(
                &sock.sock,
                EpollEvent::new(EpollFlags::EPOLLIN, key as u64),
            ) {
                rc = -(e as i32);
            } else {
                self.table.set_state(key, SockState::Listen);
                debug!(
                    "worker {}: socket {} listening ({} listeners)",
                    self.id,
                    key,
                    self.table.listening_count()
                );
            }
        }
        let mut out = [0u8; 4];
        crate::proto::RListen::encode_to(rc, &mut out);
        push_out(&self.channels[link], Opcode::RListen, tag, &out);
    }

    /// Connects are asynchronous on the host: the socket is non-blocking,
    /// so the syscall returns EINPROGRESS and the reply is deferred until
    /// the event loop reports writability. The worker keeps serving other
    /// sockets while the handshake is in flight.
    fn op_connect(&mut self, link: usize, tag: u64, payload: &[u8]) {
        let Ok(req) = TConnect::decode(payload) else { return };
        let key = req.sockid as usize;
        let addr: std::net::SocketAddrV4 = req.addr.into();
        let mut rc = match self.sock_mut(key, link) {
            Some(sock) => sock.sock.connect(addr),
            None => -libc::EBADF,
        };
        if rc == -libc::EINPROGRESS || rc == -libc::EINTR {
            if self.arm_connect(key) {
                return;
            }
            rc = -libc::EIO;
        } else if rc == 0 {
            let sock = self.table.get(key).unwrap();
            if let Err(e) = self
                .epoll
                .add(&sock.sock, EpollEvent::new(STREAM_FLAGS, key as u64))
            {
                rc = -(e as i32);
            } else {
                self.table.set_state(key, SockState::Out);
                debug!("worker {}: socket {} connected to {}", self.id, key, addr);
            }
        }
        let mut out = [0u8; 4];
        crate::proto::RConnect::encode_to(rc, &mut out);
        push_out(&self.channels[link], Opcode::RConnect, tag, &out);
    }

    /// Watch an in-flight connect for writability. Returns false if the
    /// registration failed, in which case the caller replies immediately.
    fn arm_connect(&mut self, key: usize) -> bool {
        let Some(sock) = self.table.get_mut(key) else { return false };
        if self
            .epoll
            .add(
                &sock.sock,
                EpollEvent::new(STREAM_FLAGS | EpollFlags::EPOLLOUT, key as u64),
            )
            .is_err()
        {
            return false;
        }
        sock.connecting = true;
        self.table.set_state(key, SockState::Out);
        true
    }

    /// Resolve a deferred connect once the socket turned writable and send
    /// the reply the client has been waiting on.
    fn finish_connect(&mut self, key: usize) {
        let (link, tag, err) = match self.table.get_mut(key) {
            Some(sock) => {
                sock.connecting = false;
                (sock.link, sock.tag, sock.sock.take_error())
            }
            None => return,
        };
        let rc = if err == 0 {
            let mut ev = EpollEvent::new(STREAM_FLAGS, key as u64);
            match self.table.get(key) {
                Some(sock) => match self.epoll.modify(&sock.sock, &mut ev) {
                    Ok(()) => 0,
                    Err(e) => -(e as i32),
                },
                None => return,
            }
        } else {
            -err
        };
        if rc == 0 {
            debug!("worker {}: socket {} connected", self.id, key);
        } else {
            if let Some(sock) = self.table.get(key) {
                let _ = self.epoll.delete(&sock.sock);
            }
            self.table.set_state(key, SockState::New);
            debug!("worker {}: connect on {} failed with {}", self.id, key, -rc);
        }
        let mut out = [0u8; 4];
        crate::proto::RConnect::encode_to(rc, &mut out);
        push_out(&self.channels[link], Opcode::RConnect, tag, &out);
    }

    fn op_setsockopt(&mut self, link: usize, tag: u64, payload: &[u8]) {
        let Ok(req) = TSetsockopt::decode(payload) else { return };
        let rc = match self.sock_mut(req.sockid as usize, link) {
            Some(sock) => sock.sock.setsockopt_raw(req.level, req.optname, req.optval),
            None => -libc::EBADF,
        };
        let mut out = [0u8; 4];
        crate::proto::RSetsockopt::encode_to(rc, &mut out);
        push_out(&self.channels[link], Opcode::RSetsockopt, tag, &out);
    }

    fn op_getsockopt(&mut self, link: usize, tag: u64, payload: &[u8]) {
        let Ok(req) = TGetsockopt::decode(payload) else { return };
        // The option value must fit in the reply envelope alongside the
        // rc word; a larger optlen cannot be answered.
        let cap = self.channels[link].tx().max_payload() - 4;
        let (rc, optval) = if req.optlen as usize > cap {
            (-libc::EINVAL, Vec::new())
        } else {
            match self.sock_mut(req.sockid as usize, link) {
                Some(sock) => sock.sock.getsockopt_raw(req.level, req.optname, req.optlen),
                None => (-libc::EBADF, Vec::new()),
            }
        };
        let mut out = vec![0u8; RGetsockopt::encoded_len(optval.len())];
        RGetsockopt::encode_to(rc, &optval, &mut out);
        push_out(&self.channels[link], Opcode::RGetsockopt, tag, &out);
    }

    fn op_send(&mut self, link: usize, tag: u64, payload: &[u8], reply_op: Opcode) {
        let Ok(req) = TSenddata::decode(payload) else { return };
        let rc = self.send_or_stage(req.sockid as usize, link, req.data);
        let mut out = [0u8; 4];
        crate::proto::RSenddata::encode_to(rc, &mut out);
        push_out(&self.channels[link], reply_op, tag, &out);
    }

    /// Write as much as the real socket takes; the remainder goes to the
    /// backlog. The reply carries the full length once everything is
    /// either sent or staged, so the client never sees a short count for
    /// a transient stall.
    fn send_or_stage(&mut self, key: usize, link: usize, data: &[u8]) -> i32 {
        let Some(sock) = self.sock_mut(key, link) else {
            return -libc::EBADF;
        };
        match sock.state {
            SockState::In | SockState::Out => {}
            _ => return -libc::ENOTCONN,
        }
        if !sock.backlog.is_empty() {
            // Staged bytes go first; appending keeps the stream ordered.
            return if sock.backlog.stage(data) {
                data.len() as i32
            } else {
                -libc::ENOBUFS
            };
        }
        let mut off = 0;
        while off < data.len() {
            match sock.sock.send(&data[off..]) {
                Ok(0) => break,
                Ok(n) => off += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return -e.raw_os_error().unwrap_or(libc::EIO),
            }
        }
        if off == data.len() {
            return data.len() as i32;
        }
        if !sock.backlog.stage(&data[off..]) {
            return -libc::ENOBUFS;
        }
        sock.want_write = true;
        let mut ev = EpollEvent::new(STREAM_FLAGS | EpollFlags::EPOLLOUT, key as u64);
        if let Err(e) = self.epoll.modify(&self.table.get(key).unwrap().sock, &mut ev) {
            debug!("worker {}: arming write on {} failed: {}", self.id, key, e);
        }
        data.len() as i32
    }

    fn op_shutdown(&mut self, link: usize, tag: u64, payload: &[u8]) {
        let Ok(req) = TShutdown::decode(payload) else { return };
        let rc = match self.sock_mut(req.sockid as usize, link) {
            Some(sock) => sock.sock.shutdown(req.how),
            None => -libc::EBADF,
        };
        let mut out = [0u8; 4];
        crate::proto::RShutdown::encode_to(rc, &mut out);
        push_out(&self.channels[link], Opcode::RShutdown, tag, &out);
    }

    /// Remove the socket from the event loop and the table, reply, then
    /// let the fd close.
    fn op_close(&mut self, link: usize, tag: u64, payload: &[u8]) {
        let Ok(req) = TClose::decode(payload) else { return };
        let key = req.sockid as usize;
        let owned = self.table.get(key).map(|s| s.link == link).unwrap_or(false);
        let rc = if owned {
            let sock = self.table.remove(key).unwrap();
            let _ = self.epoll.delete(&sock.sock);
            if let Some(addr) = sock.bound_addr {
                self.registry.unregister(addr, sock.link, sock.tag);
            }
            debug!("worker {}: socket {} closed", self.id, key);
            0
        } else {
            -libc::EBADF
        };
        let mut out = [0u8; RClose::LEN];
        RClose::encode_to(rc, &mut out);
        push_out(&self.channels[link], Opcode::RClose, tag, &out);
    }

    fn sweep_sockets(&mut self, read_buf: &mut [u8]) -> bool {
        let mut events = [EpollEvent::empty(); MAX_EPOLL_EVENTS];
        let n = match self.epoll.wait(&mut events, EpollTimeout::ZERO) {
            Ok(n) => n,
            Err(e) => {
                debug!("worker {}: epoll_wait failed: {}", self.id, e);
                0
            }
        };
        for ev in &events[..n] {
            let key = ev.data() as usize;
            let flags = ev.events();
            if self.table.get(key).is_none() {
                continue;
            }
            if self.table.get(key).map(|s| s.connecting).unwrap_or(false) {
                self.finish_connect(key);
                continue;
            }
            if flags.contains(EpollFlags::EPOLLOUT) {
                self.flush_backlog(key);
            }
            let read_bits = EpollFlags::EPOLLIN
                | EpollFlags::EPOLLERR
                | EpollFlags::EPOLLHUP
                | EpollFlags::EPOLLRDHUP;
            if flags.intersects(read_bits) {
                match self.table.get(key).map(|s| s.state) {
                    Some(SockState::Listen) => self.drain_accepts(key),
                    Some(SockState::In) | Some(SockState::Out) => {
                        self.drain_socket(key, read_buf)
                    }
                    _ => {}
                }
            }
        }
        n > 0
    }

    fn drain_accepts(&mut self, key: usize) {
        loop {
            let accepted = {
                let Some(sock) = self.table.get(key) else { return };
                sock.sock.accept()
            };
            let (conn, peer) = match accepted {
                Ok(Some(pair)) => pair,
                Ok(None) => return,
                Err(e) => {
                    debug!("worker {}: accept on {} failed: {}", self.id, key, e);
                    return;
                }
            };
            let (bound, own_link, own_tag) = {
                let s = self.table.get(key).unwrap();
                (s.bound_addr, s.link, s.tag)
            };
            let target = bound
                .and_then(|a| self.registry.next_accept_target(a))
                .unwrap_or(AcceptTarget {
                    link: own_link,
                    tag: own_tag,
                });
            let cap = self.cfg.backlog_capacity;
            let newkey = self
                .table
                .insert(ProxySocket::new(target.link, 0, SockState::In, conn, cap));
            if let Err(e) = self.epoll.add(
                &self.table.get(newkey).unwrap().sock,
                EpollEvent::new(STREAM_FLAGS, newkey as u64),
            ) {
                debug!("worker {}: watch accepted {} failed: {}", self.id, newkey, e);
                self.table.remove(newkey);
                continue;
            }
            debug!(
                "worker {}: accepted {} from {} for link {}",
                self.id, newkey, peer, target.link
            );
            let mut out = [0u8; EAccept::LEN];
            EAccept {
                sockid: newkey as u64,
                peer: WireAddr::from(peer),
            }
            .encode(&mut out);
            push_out(&self.channels[target.link], Opcode::EAccept, target.tag, &out);
        }
    }

    /// Read until the socket runs dry, one event per read. Accepted
    /// sockets without a registered tag are left alone; the level
    /// triggered watch fires again once the notify lands.
    fn drain_socket(&mut self, key: usize, buf: &mut [u8]) {
        loop {
            let Some(sock) = self.table.get_mut(key) else { return };
            if sock.eof_sent {
                return;
            }
            if sock.state == SockState::In && !sock.tag_available {
                return;
            }
            let (link, tag) = (sock.link, sock.tag);
            let max = self.channels[link].tx().max_payload().min(buf.len());
            match sock.sock.recv(&mut buf[..max]) {
                Ok(0) => {
                    self.push_eof(key);
                    return;
                }
                Ok(n) => {
                    push_out(&self.channels[link], Opcode::ERecvdata, tag, &buf[..n]);
                    if n < max {
                        return;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    debug!("worker {}: read on {} failed: {}", self.id, key, e);
                    self.push_eof(key);
                    return;
                }
            }
        }
    }

    /// Flush staged bytes on write readiness. The backlog only shrinks
    /// here; once empty the write interest is dropped.
    fn flush_backlog(&mut self, key: usize) {
        loop {
            let Some(sock) = self.table.get_mut(key) else { return };
            if sock.backlog.is_empty() {
                break;
            }
            match sock.sock.send(sock.backlog.pending()) {
                Ok(0) => break,
                Ok(n) => sock.backlog.consume(n),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    // The connection died with bytes still staged. Tell
                    // the client the stream is over.
                    debug!("worker {}: flush on {} failed: {}", self.id, key, e);
                    self.push_eof(key);
                    return;
                }
            }
        }
        let Some(sock) = self.table.get_mut(key) else { return };
        if sock.want_write {
            sock.want_write = false;
            let mut ev = EpollEvent::new(STREAM_FLAGS, key as u64);
            if let Err(e) = self.epoll.modify(&self.table.get(key).unwrap().sock, &mut ev) {
                debug!("worker {}: disarming write on {} failed: {}", self.id, key, e);
            }
        }
    }

    /// Push the zero-length data event marking end of stream and stop
    /// watching the socket. The table entry stays until the client closes
    /// its handle.
    fn push_eof(&mut self, key: usize) {
        let Some(sock) = self.table.get_mut(key) else { return };
        if sock.eof_sent {
            return;
        }
        sock.eof_sent = true;
        let _ = self.epoll.delete(&sock.sock);
        if !sock.tag_available {
            debug!("worker {}: eof on untagged socket {}, dropped", self.id, key);
            return;
        }
        let (link, tag) = (sock.link, sock.tag);
        push_out(&self.channels[link], Opcode::ERecvdata, tag, &[]);
    }
}

pub(crate) fn spawn_worker(
    id: usize,
    channels: Vec<Channel>,
    registry: Arc<ListenerRegistry>,
    cfg: FabricConfig,
    stop: Arc<AtomicBool>,
    core: Option<core_affinity::CoreId>,
) -> io::Result<std::thread::JoinHandle<()>> {
    std::thread::Builder::new()
        .name(format!("shunt-proxy-{}", id))
        .spawn(move || match Worker::new(id, channels, registry, cfg, stop, core) {
            Ok(worker) => worker.run(),
            Err(e) => error!("worker {}: failed to start: {}", id, e),
        })
}
