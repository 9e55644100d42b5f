//! Client-side link: handle table, RPC engine, socket and epoll surface.
//!
//! A [`Link`] owns the client endpoints of the channels to the host and a
//! slab handle table mapping tags to virtual sockets or epoll instances.
//! The tag is the slab key; it crosses the channel in every envelope and
//! stays stable for the socket's lifetime.
//!
//! One RPC flow:
//!
//! ```text
//! app thread            channel               dispatcher thread
//! ----------            -------               -----------------
//! encode request
//! put + mark ready ---> outbound
//! spin on reply queue   inbound  <---reply--- (host)
//!        ^                                    get, decode header,
//!        +----------------------------------- route by tag, push cursor
//! copy out payload, mark slot done
//! ```

mod dispatch;
pub mod epoll;
pub mod socket;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use log::debug;
use rand::Rng;
use slab::Slab;

use crate::backoff::Backoff;
use crate::channel::Channel;
use crate::error::{Error, PutError, Result};
use crate::proto::{Opcode, Reply, Request, SockState, TSocket};
use crate::FabricConfig;

use epoll::EpollInstance;
use socket::VirtualSocket;

/// Handle table entry. Epoll instances share the table so their handles
/// come from the same key space, but their tags never cross the channel.
pub(crate) enum Handle {
    Socket(Arc<VirtualSocket>),
    Epoll(Arc<EpollInstance>),
}

pub(crate) struct LinkInner {
    pub(crate) channels: Vec<Channel>,
    pub(crate) handles: Mutex<Slab<Handle>>,
    pub(crate) cfg: FabricConfig,
    /// Set on any transport failure; every later call fails fast.
    pub(crate) down: AtomicBool,
    pub(crate) stop: AtomicBool,
}

/// Client endpoint of the fabric.
pub struct Link {
    inner: Arc<LinkInner>,
    dispatcher: Option<JoinHandle<()>>,
}

impl Link {
    pub(crate) fn new(channels: Vec<Channel>, cfg: FabricConfig) -> Result<Link> {
        let inner = Arc::new(LinkInner {
            channels,
            handles: Mutex::new(Slab::new()),
            cfg,
            down: AtomicBool::new(false),
            stop: AtomicBool::new(false),
        });
        let worker = inner.clone();
        let dispatcher = std::thread::Builder::new()
            .name("shunt-dispatch".into())
            .spawn(move || dispatch::run(worker))?;
        Ok(Link {
            inner,
            dispatcher: Some(dispatcher),
        })
    }

    /// Create a virtual socket backed by a real socket on the host.
    pub fn socket(&self, domain: i32, ty: i32, protocol: i32) -> Result<Arc<VirtualSocket>> {
        let inner = &self.inner;
        if inner.down.load(Ordering::Acquire) {
            return Err(Error::LinkDown);
        }
        let channel = rand::thread_rng().gen_range(0..inner.channels.len());
        let sock = {
            let mut handles = inner.handles.lock().unwrap();
            let entry = handles.vacant_entry();
            let sock = VirtualSocket::new_cyclic(Arc::downgrade(inner), entry.key() as u64, channel);
            entry.insert(Handle::Socket(sock.clone()));
            sock
        };
        let reply = match inner.rpc(
            &sock,
            &TSocket {
                domain,
                ty,
                protocol,
            },
        ) {
            Ok(r) => r,
            Err(e) => {
                inner.remove_handle(sock.tag);
                return Err(e);
            }
        };
        if reply.rc < 0 {
            inner.remove_handle(sock.tag);
            return Err(Error::from_errno(-reply.rc));
        }
        sock.sockid.store(reply.sockid, Ordering::Release);
        Ok(sock)
    }

    /// Create an epoll emulation instance.
    pub fn epoll_create(&self) -> Result<Arc<EpollInstance>> {
        if self.inner.down.load(Ordering::Acquire) {
            return Err(Error::LinkDown);
        }
        let mut handles = self.inner.handles.lock().unwrap();
        let entry = handles.vacant_entry();
        let inst = Arc::new(EpollInstance::new(
            entry.key() as u64,
            self.inner.cfg.epoll_queue_depth,
        ));
        entry.insert(Handle::Epoll(inst.clone()));
        Ok(inst)
    }

    /// Remove an epoll instance from the handle table.
    pub fn epoll_close(&self, inst: &EpollInstance) {
        self.inner.remove_handle(inst.handle());
    }

    pub fn is_down(&self) -> bool {
        self.inner.down.load(Ordering::Acquire)
    }
}

impl Drop for Link {
    fn drop(&mut self) {
        self.inner.stop.store(true, Ordering::Release);
        for ch in &self.inner.channels {
            ch.close();
        }
        if let Some(h) = self.dispatcher.take() {
            let _ = h.join();
        }
    }
}

impl LinkInner {
    pub(crate) fn mark_down(&self) {
        self.down.store(true, Ordering::Release);
    }

    pub(crate) fn remove_handle(&self, tag: u64) {
        let mut handles = self.handles.lock().unwrap();
        if handles.contains(tag as usize) {
            handles.remove(tag as usize);
        }
    }

    pub(crate) fn lookup_socket(&self, tag: u64) -> Option<Arc<VirtualSocket>> {
        let handles = self.handles.lock().unwrap();
        match handles.get(tag as usize) {
            Some(Handle::Socket(s)) => Some(s.clone()),
            _ => None,
        }
    }

    /// Allocate a handle for a host-accepted socket on the given channel.
    pub(crate) fn adopt_socket(
        self: &Arc<Self>,
        channel: usize,
        sockid: u64,
    ) -> Arc<VirtualSocket> {
        let mut handles = self.handles.lock().unwrap();
        let entry = handles.vacant_entry();
        let sock = VirtualSocket::new_cyclic(Arc::downgrade(self), entry.key() as u64, channel);
        sock.sockid.store(sockid, Ordering::Release);
        *sock.state.lock().unwrap() = SockState::In;
        entry.insert(Handle::Socket(sock.clone()));
        sock
    }

    /// Send a request and block until its reply arrives. At most one RPC
    /// is in flight per socket; `op_lock` is held by the caller.
    pub(crate) fn rpc<R: Request>(&self, sock: &VirtualSocket, req: &R) -> Result<R::Reply> {
        let mut buf = vec![0u8; req.encoded_len()];
        req.encode(&mut buf);
        self.send_envelope(sock.channel, R::OPCODE, sock.tag, &buf)?;
        let payload = self.wait_reply(sock, <R::Reply as Reply>::OPCODE)?;
        R::Reply::decode(&payload)
    }

    /// Enqueue one envelope, absorbing transient fullness with backoff.
    pub(crate) fn send_envelope(
        &self,
        channel: usize,
        opcode: Opcode,
        tag: u64,
        payload: &[u8],
    ) -> Result<()> {
        let ch = &self.channels[channel];
        let mut backoff = Backoff::new();
        loop {
            if self.down.load(Ordering::Acquire) {
                return Err(Error::LinkDown);
            }
            match ch.tx().put(opcode, tag, payload) {
                Ok(_) => return Ok(()),
                Err(PutError::Full) => backoff.wait(),
                Err(PutError::TooBig) => return Err(Error::Remote(libc::EMSGSIZE)),
                Err(PutError::Closed) => {
                    self.mark_down();
                    return Err(Error::LinkDown);
                }
            }
        }
    }

    fn wait_reply(&self, sock: &VirtualSocket, expect: Opcode) -> Result<Vec<u8>> {
        let mut backoff = Backoff::new();
        loop {
            let cursor = {
                let mut guard = sock.queues.lock().unwrap();
                match guard.as_mut() {
                    Some(qs) => qs.replies.pop_front(),
                    None => return Err(Error::Disconnected),
                }
            };
            if let Some(cur) = cursor {
                if cur.opcode != expect {
                    // A reply this socket never asked for. Drop it.
                    debug!(
                        "tag {}: dropping unexpected reply {:?} (want {:?})",
                        sock.tag, cur.opcode, expect
                    );
                    sock.discard_cursor(self, cur);
                    continue;
                }
                match sock.resolve_cursor(self, &cur) {
                    Some(payload) => return Ok(payload),
                    None => {
                        debug!("tag {}: reply seq {} lost to teardown", sock.tag, cur.seq);
                        continue;
                    }
                }
            }
            if self.down.load(Ordering::Acquire) {
                return Err(Error::LinkDown);
            }
            backoff.wait();
        }
    }
}
