//! Virtual sockets: the POSIX-style client surface.
//!
//! A `VirtualSocket` owns no file descriptor. Every operation is an RPC to
//! the host worker owning the real socket, except `recv`/`accept`, which
//! consume events the host pushed ahead of time.

use std::collections::VecDeque;
use std::net::SocketAddrV4;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};

use log::debug;

use crate::backoff::Backoff;
use crate::error::{Error, Result};
use crate::proto::{
    EAccept, NSocket, Opcode, SockState, TBind, TClose, TConnect, TGetsockopt, TListen,
    TSenddata, TSendmsg, TSetsockopt, TShutdown, WireAddr,
};

use super::epoll::{EpollInstance, EvMask};
use super::LinkInner;

/// Position of an undisposed envelope in a channel's inbound queue. The
/// payload stays in the slot until the consumer (or the reaper) copies it
/// out.
#[derive(Debug, Clone, Copy)]
pub(crate) struct RxCursor {
    pub channel: usize,
    pub slot: usize,
    pub seq: u64,
    pub opcode: Opcode,
}

/// Payload evicted from a queue slot by the reaper, parked on its
/// destination socket until the matching cursor is consumed.
pub(crate) struct OobEntry {
    pub seq: u64,
    pub payload: Vec<u8>,
}

#[derive(Default)]
pub(crate) struct SocketQueues {
    pub replies: VecDeque<RxCursor>,
    pub events: VecDeque<RxCursor>,
    /// Sorted by seq: the reaper evicts in sequence order and the socket
    /// is pinned to one channel.
    pub oob: VecDeque<OobEntry>,
}

/// Partial-consume cursor: an `ERecvdata` payload not fully drained by the
/// last `recv` call.
pub(crate) struct LastRecv {
    payload: Vec<u8>,
    off: usize,
}

pub(crate) struct EpollReg {
    pub instance: Weak<EpollInstance>,
    pub mask: EvMask,
    pub data: u64,
}

const SHUT_BIT_RD: u32 = 1;
const SHUT_BIT_WR: u32 = 2;

pub struct VirtualSocket {
    weak_self: Weak<VirtualSocket>,
    pub(crate) link: Weak<LinkInner>,
    pub(crate) tag: u64,
    pub(crate) channel: usize,
    pub(crate) sockid: AtomicU64,
    pub(crate) state: Mutex<SockState>,
    nonblocking: AtomicBool,
    eof: AtomicBool,
    shutdown_bits: AtomicU32,
    /// Serializes RPCs: at most one request in flight per socket, so the
    /// reply queue never holds more than one cursor.
    pub(crate) op_lock: Mutex<()>,
    /// `None` once `close` ran; the dispatcher drops deliveries then.
    pub(crate) queues: Mutex<Option<SocketQueues>>,
    lastrcv: Mutex<Option<LastRecv>>,
    pub(crate) epoll: Mutex<Option<EpollReg>>,
    /// Pending readiness bits, shared by `poll_mask` and epoll.
    pub(crate) events: AtomicU32,
    /// Threads currently consuming events (`recv`/`accept`). The reaper
    /// leaves this socket's slots alone while one is present; the consumer
    /// takes the payload straight from the slot.
    waiters: AtomicUsize,
}

pub(crate) struct ConsumeGuard<'a>(&'a AtomicUsize);

impl Drop for ConsumeGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Release);
    }
}

impl VirtualSocket {
    /// Built with `Arc::new_cyclic` so readiness entries can carry a weak
    /// self reference.
    pub(crate) fn new_cyclic(link: Weak<LinkInner>, tag: u64, channel: usize) -> Arc<Self> {
        Arc::new_cyclic(|weak_self| VirtualSocket {
            weak_self: weak_self.clone(),
            link,
            tag,
            channel,
            sockid: AtomicU64::new(0),
            state: Mutex::new(SockState::New),
            nonblocking: AtomicBool::new(false),
            eof: AtomicBool::new(false),
            shutdown_bits: AtomicU32::new(0),
            op_lock: Mutex::new(()),
            queues: Mutex::new(Some(SocketQueues::default())),
            lastrcv: Mutex::new(None),
            epoll: Mutex::new(None),
            events: AtomicU32::new(0),
            waiters: AtomicUsize::new(0),
        })
    }

    fn mark_consuming(&self) -> ConsumeGuard<'_> {
        self.waiters.fetch_add(1, Ordering::AcqRel);
        ConsumeGuard(&self.waiters)
    }

    pub(crate) fn has_consumer(&self) -> bool {
        self.waiters.load(Ordering::Acquire) > 0
    }

    #[inline]
    pub fn tag(&self) -> u64 {
        self.tag
    }

    pub fn state(&self) -> SockState {
        *self.state.lock().unwrap()
    }

    pub fn set_nonblocking(&self, nb: bool) {
        self.nonblocking.store(nb, Ordering::Release);
    }

    fn link(&self) -> Result<Arc<LinkInner>> {
        self.link.upgrade().ok_or(Error::LinkDown)
    }

    #[inline]
    fn sockid_now(&self) -> u64 {
        self.sockid.load(Ordering::Acquire)
    }

    pub fn bind(&self, addr: SocketAddrV4) -> Result<()> {
        let link = self.link()?;
        let _op = self.op_lock.lock().unwrap();
        let reply = link.rpc(
            self,
            &TBind {
                sockid: self.sockid_now(),
                addr: WireAddr::from(addr),
            },
        )?;
        if reply.rc < 0 {
            return Err(Error::from_errno(-reply.rc));
        }
        Ok(())
    }

    pub fn connect(&self, addr: SocketAddrV4) -> Result<()> {
        let link = self.link()?;
        let _op = self.op_lock.lock().unwrap();
        let reply = link.rpc(
            self,
            &TConnect {
                sockid: self.sockid_now(),
                addr: WireAddr::from(addr),
            },
        )?;
        if reply.rc < 0 {
            return Err(Error::from_errno(-reply.rc));
        }
        *self.state.lock().unwrap() = SockState::Out;
        Ok(())
    }

    pub fn listen(&self, backlog: i32) -> Result<()> {
        let link = self.link()?;
        let _op = self.op_lock.lock().unwrap();
        let reply = link.rpc(
            self,
            &TListen {
                sockid: self.sockid_now(),
                backlog,
            },
        )?;
        if reply.rc < 0 {
            return Err(Error::from_errno(-reply.rc));
        }
        *self.state.lock().unwrap() = SockState::Listen;
        Ok(())
    }

    pub fn setsockopt(&self, level: i32, optname: i32, optval: &[u8]) -> Result<()> {
        let link = self.link()?;
        let _op = self.op_lock.lock().unwrap();
        let reply = link.rpc(
            self,
            &TSetsockopt {
                sockid: self.sockid_now(),
                level,
                optname,
                optval,
            },
        )?;
        if reply.rc < 0 {
            return Err(Error::from_errno(-reply.rc));
        }
        Ok(())
    }

    pub fn getsockopt(&self, level: i32, optname: i32, optlen: u32) -> Result<Vec<u8>> {
        let link = self.link()?;
        let _op = self.op_lock.lock().unwrap();
        let reply = link.rpc(
            self,
            &TGetsockopt {
                sockid: self.sockid_now(),
                level,
                optname,
                optlen,
            },
        )?;
        if reply.rc < 0 {
            return Err(Error::from_errno(-reply.rc));
        }
        Ok(reply.optval)
    }

    pub fn shutdown(&self, how: i32) -> Result<()> {
        let link = self.link()?;
        let _op = self.op_lock.lock().unwrap();
        let reply = link.rpc(
            self,
            &TShutdown {
                sockid: self.sockid_now(),
                how,
            },
        )?;
        if reply.rc < 0 {
            return Err(Error::from_errno(-reply.rc));
        }
        let bits = match how {
            libc::SHUT_RD => SHUT_BIT_RD,
            libc::SHUT_WR => SHUT_BIT_WR,
            _ => SHUT_BIT_RD | SHUT_BIT_WR,
        };
        self.shutdown_bits.fetch_or(bits, Ordering::AcqRel);
        self.raise_and_signal(EvMask::HUP);
        Ok(())
    }

    /// Stream send. Chunked to the channel's payload limit; the host
    /// reports the full chunk length once any remainder is staged in its
    /// backlog, so a short count only appears on error paths.
    pub fn send(&self, data: &[u8]) -> Result<usize> {
        self.send_with(data, false)
    }

    /// `sendmsg`-style gather send.
    pub fn sendmsg(&self, bufs: &[&[u8]]) -> Result<usize> {
        let mut total = 0;
        for (i, buf) in bufs.iter().enumerate() {
            match self.send_with(buf, true) {
                Ok(n) => total += n,
                Err(e) if i == 0 => return Err(e),
                Err(_) => break,
            }
        }
        Ok(total)
    }

    fn send_with(&self, data: &[u8], msg: bool) -> Result<usize> {
        let link = self.link()?;
        match self.state() {
            SockState::In | SockState::Out => {}
            _ => return Err(Error::InvalidState),
        }
        if self.shutdown_bits.load(Ordering::Acquire) & SHUT_BIT_WR != 0 {
            return Err(Error::Disconnected);
        }
        let _op = self.op_lock.lock().unwrap();
        let max = link.channels[self.channel].tx().max_payload() - 8;
        let sockid = self.sockid_now();
        let mut sent = 0usize;
        for chunk in data.chunks(max) {
            let rc = if msg {
                link.rpc(self, &TSendmsg { sockid, data: chunk })?.rc
            } else {
                link.rpc(self, &TSenddata { sockid, data: chunk })?.rc
            };
            if rc < 0 {
                if sent > 0 {
                    break;
                }
                return Err(Error::from_errno(-rc));
            }
            sent += rc as usize;
            if (rc as usize) < chunk.len() {
                break;
            }
        }
        self.raise_and_signal(EvMask::OUT);
        Ok(sent)
    }

    /// Stream receive. Returns 0 at end of stream; a zero-length inbound
    /// data event is the host's end-of-stream marker.
    pub fn recv(&self, buf: &mut [u8]) -> Result<usize> {
        self.recv_with(buf, true)
    }

    /// `recvmsg`-style scatter receive. Blocks for the first byte only;
    /// later buffers are filled from data already queued.
    pub fn recvmsg(&self, bufs: &mut [&mut [u8]]) -> Result<usize> {
        let mut total = 0;
        for (i, buf) in bufs.iter_mut().enumerate() {
            match self.recv_with(buf, i == 0) {
                Ok(0) => break,
                Ok(n) => {
                    total += n;
                    if n < buf.len() {
                        break;
                    }
                }
                Err(Error::WouldBlock) if total > 0 => break,
                Err(e) => return Err(e),
            }
        }
        Ok(total)
    }

    fn recv_with(&self, buf: &mut [u8], allow_block: bool) -> Result<usize> {
        let link = self.link()?;
        match self.state() {
            SockState::In | SockState::Out => {}
            _ => return Err(Error::InvalidState),
        }
        if buf.is_empty() {
            return Ok(0);
        }
        let _consume = self.mark_consuming();
        let mut copied = 0usize;
        let mut backoff = Backoff::new();
        loop {
            copied += self.drain_lastrcv(&mut buf[copied..]);
            if copied == buf.len() {
                return Ok(copied);
            }
            match self.pop_event()? {
                Some(cur) => {
                    backoff.reset();
                    if cur.opcode != Opcode::ERecvdata {
                        debug!("tag {}: unexpected event {:?} on data socket", self.tag, cur.opcode);
                        let _ = self.resolve_cursor(&link, &cur);
                        continue;
                    }
                    let payload = match self.resolve_cursor(&link, &cur) {
                        Some(p) => p,
                        None => continue,
                    };
                    if payload.is_empty() {
                        // End of stream.
                        self.eof.store(true, Ordering::Release);
                        self.raise_and_signal(EvMask::HUP | EvMask::RDHUP);
                        return Ok(copied);
                    }
                    *self.lastrcv.lock().unwrap() = Some(LastRecv { payload, off: 0 });
                }
                None => {
                    if copied > 0 {
                        return Ok(copied);
                    }
                    if self.eof.load(Ordering::Acquire)
                        || self.shutdown_bits.load(Ordering::Acquire) & SHUT_BIT_RD != 0
                    {
                        return Ok(0);
                    }
                    if !allow_block || self.nonblocking.load(Ordering::Acquire) {
                        return Err(Error::WouldBlock);
                    }
                    if link.down.load(Ordering::Acquire) {
                        return Err(Error::LinkDown);
                    }
                    backoff.wait();
                }
            }
        }
    }

    fn drain_lastrcv(&self, buf: &mut [u8]) -> usize {
        if buf.is_empty() {
            return 0;
        }
        let mut guard = self.lastrcv.lock().unwrap();
        let Some(lr) = guard.as_mut() else { return 0 };
        let n = (lr.payload.len() - lr.off).min(buf.len());
        buf[..n].copy_from_slice(&lr.payload[lr.off..lr.off + n]);
        lr.off += n;
        if lr.off == lr.payload.len() {
            *guard = None;
        }
        n
    }

    /// Accept one host-established connection. The new socket rides the
    /// same channel; its tag is announced to the host with a one-way
    /// notification before the host will read from it.
    pub fn accept(&self) -> Result<(Arc<VirtualSocket>, SocketAddrV4)> {
        let link = self.link()?;
        if self.state() != SockState::Listen {
            return Err(Error::InvalidState);
        }
        let _consume = self.mark_consuming();
        let mut backoff = Backoff::new();
        loop {
            match self.pop_event()? {
                Some(cur) => {
                    if cur.opcode != Opcode::EAccept {
                        debug!("tag {}: unexpected event {:?} on listener", self.tag, cur.opcode);
                        let _ = self.resolve_cursor(&link, &cur);
                        continue;
                    }
                    let payload = match self.resolve_cursor(&link, &cur) {
                        Some(p) => p,
                        None => continue,
                    };
                    let ev = EAccept::decode(&payload)?;
                    // The accepted socket lives on the worker that serviced
                    // the accept, which for a shared listener is not always
                    // the listener's own worker. Pin it to the channel the
                    // event arrived on so the notify and every later RPC
                    // reach the owner.
                    let sock = link.adopt_socket(cur.channel, ev.sockid);
                    let mut nbuf = [0u8; NSocket::LEN];
                    NSocket { sockid: ev.sockid }.encode(&mut nbuf);
                    link.send_envelope(cur.channel, Opcode::NSocket, sock.tag, &nbuf)?;
                    return Ok((sock, ev.peer.into()));
                }
                None => {
                    if self.nonblocking.load(Ordering::Acquire) {
                        return Err(Error::WouldBlock);
                    }
                    if link.down.load(Ordering::Acquire) {
                        return Err(Error::LinkDown);
                    }
                    backoff.wait();
                }
            }
        }
    }

    /// Tear the socket down. The close request goes out first so its
    /// reply can still be routed; only then are the queues detached, which
    /// makes the dispatcher drop any in-flight delivery for this tag.
    pub fn close(&self) -> Result<()> {
        let link = self.link.upgrade();
        let _op = self.op_lock.lock().unwrap();
        let mut res = Ok(());
        if let Some(link) = link.as_ref() {
            if !link.down.load(Ordering::Acquire) {
                match link.rpc(
                    self,
                    &TClose {
                        sockid: self.sockid_now(),
                    },
                ) {
                    Ok(reply) if reply.rc < 0 => res = Err(Error::from_errno(-reply.rc)),
                    Ok(_) => {}
                    Err(e) => res = Err(e),
                }
            }
        }
        *self.epoll.lock().unwrap() = None;
        let taken = self.queues.lock().unwrap().take();
        if let (Some(link), Some(qs)) = (link.as_ref(), taken) {
            let rx = link.channels[self.channel].rx();
            for cur in qs.replies.into_iter().chain(qs.events) {
                // Release the slot if the payload is still in it.
                let _ = rx.take_payload(cur.slot, cur.seq);
            }
            for e in qs.oob {
                rx.refund_oob(e.payload.len());
            }
        }
        *self.lastrcv.lock().unwrap() = None;
        if let Some(link) = link {
            link.remove_handle(self.tag);
        }
        res
    }

    /// Current readiness, computed the way `poll` would report it.
    pub fn poll_mask(&self) -> EvMask {
        let mut mask = EvMask::empty();
        let readable = self.lastrcv.lock().unwrap().is_some()
            || self
                .queues
                .lock()
                .unwrap()
                .as_ref()
                .map(|qs| !qs.events.is_empty())
                .unwrap_or(false)
            || self.eof.load(Ordering::Acquire);
        if readable {
            mask |= EvMask::IN;
        }
        let shut = self.shutdown_bits.load(Ordering::Acquire);
        if self.eof.load(Ordering::Acquire) || shut & SHUT_BIT_RD != 0 {
            mask |= EvMask::RDHUP;
        }
        if shut == SHUT_BIT_RD | SHUT_BIT_WR {
            mask |= EvMask::HUP;
        }
        if let (SockState::In | SockState::Out, Some(link)) = (self.state(), self.link.upgrade()) {
            if !link.down.load(Ordering::Acquire)
                && shut & SHUT_BIT_WR == 0
                && link.channels[self.channel].tx().free_slots() > 0
            {
                mask |= EvMask::OUT;
            }
        }
        mask
    }

    /// Pop the next pending event cursor, clearing the readiness bit when
    /// the queue drains.
    pub(crate) fn pop_event(&self) -> Result<Option<RxCursor>> {
        let mut guard = self.queues.lock().unwrap();
        match guard.as_mut() {
            Some(qs) => {
                let cur = qs.events.pop_front();
                if qs.events.is_empty() {
                    self.events
                        .fetch_and(!EvMask::IN.bits(), Ordering::AcqRel);
                }
                Ok(cur)
            }
            None => Err(Error::Disconnected),
        }
    }

    /// Copy out the payload a cursor points at. If the reaper already
    /// evicted the slot, the payload is adopted from the out-of-band list:
    /// stale entries below the awaited sequence are freed on the way, and
    /// an in-order entry is never skipped.
    pub(crate) fn resolve_cursor(&self, link: &LinkInner, cur: &RxCursor) -> Option<Vec<u8>> {
        let rx = link.channels[cur.channel].rx();
        if let Some(payload) = rx.take_payload(cur.slot, cur.seq) {
            return Some(payload);
        }
        let mut guard = self.queues.lock().unwrap();
        let qs = guard.as_mut()?;
        while let Some(front) = qs.oob.front() {
            if front.seq < cur.seq {
                let stale = qs.oob.pop_front().unwrap();
                debug!("tag {}: freeing stale oob entry seq {}", self.tag, stale.seq);
                rx.refund_oob(stale.payload.len());
            } else if front.seq == cur.seq {
                let entry = qs.oob.pop_front().unwrap();
                rx.refund_oob(entry.payload.len());
                return Some(entry.payload);
            } else {
                break;
            }
        }
        debug!("tag {}: cursor seq {} resolved to nothing", self.tag, cur.seq);
        None
    }

    /// Drop a cursor's payload, wherever it lives.
    pub(crate) fn discard_cursor(&self, link: &LinkInner, cur: RxCursor) {
        let _ = self.resolve_cursor(link, &cur);
    }

    /// Record pending readiness. Returns the epoll instance to signal if
    /// the bits were fresh and registered; the dispatcher batches those
    /// signals per sweep.
    pub(crate) fn raise(&self, bits: EvMask) -> Option<Arc<EpollInstance>> {
        let old = EvMask::from_bits_truncate(self.events.fetch_or(bits.bits(), Ordering::AcqRel));
        let fresh = bits - old;
        if fresh.is_empty() {
            return None;
        }
        let reg = self.epoll.lock().unwrap();
        let r = reg.as_ref()?;
        if !r.mask.intersects(fresh) {
            return None;
        }
        let inst = r.instance.upgrade()?;
        inst.publish(self.weak_self.clone(), fresh);
        Some(inst)
    }

    pub(crate) fn raise_and_signal(&self, bits: EvMask) {
        if let Some(inst) = self.raise(bits) {
            inst.signal();
        }
    }
}

impl std::fmt::Debug for VirtualSocket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VirtualSocket")
            .field("tag", &self.tag)
            .field("channel", &self.channel)
            .field("state", &self.state())
            .finish()
    }
}
