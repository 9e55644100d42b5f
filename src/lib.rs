//! shunt: a socket virtualization fabric.
//!
//! POSIX-style socket calls on the client side operate over shared-memory
//! message channels instead of file descriptors. A host-side proxy owns
//! the real sockets and services the channels with a pool of pinned
//! workers.
//!
//! ```text
//! client                                  host
//! ------                                  ----
//! app ----> VirtualSocket                 Worker 0 <---> real sockets
//!             | rpc                          ^
//!             v                              |
//!           Link ----[channel 0]-------------+
//!             |  \---[channel 1]---------> Worker 1 <---> real sockets
//!             v
//!        dispatcher thread
//!        (replies, events, epoll wakeups)
//! ```
//!
//! Each link owns one channel per worker. A socket is pinned to one
//! channel for life, so everything about it stays on one worker and one
//! receive path.

pub mod backoff;
pub mod channel;
pub mod client;
pub mod error;
pub mod proto;
pub mod proxy;

pub use client::epoll::{CtlOp, EpollEvent, EpollInstance, EvMask};
pub use client::socket::VirtualSocket;
pub use client::Link;
pub use error::{Error, Result};
pub use proto::SockState;
pub use proxy::Proxy;

use channel::Channel;

/// Fabric parameters, shared by links and workers.
#[derive(Debug, Clone)]
pub struct FabricConfig {
    /// Host worker threads; each owns one channel of every link.
    pub workers: usize,
    /// Client links to establish.
    pub links: usize,
    /// Slots per queue direction. Rounded up to a power of two.
    pub channel_slots: usize,
    /// Envelope slot size in bytes, header included.
    pub slot_size: usize,
    /// Out-of-band byte quota per inbound queue.
    pub oob_quota: usize,
    /// Host-side send backlog capacity per socket.
    pub backlog_capacity: usize,
    /// Depth of each epoll emulation ring.
    pub epoll_queue_depth: usize,
    /// Reap kicks in when free slots drop to this level.
    pub reap_watermark: usize,
    /// Pin workers to cores.
    pub pin_workers: bool,
}

impl Default for FabricConfig {
    fn default() -> Self {
        FabricConfig {
            workers: 1,
            links: 1,
            channel_slots: 64,
            slot_size: 4096,
            oob_quota: 64 * 4096,
            backlog_capacity: 1 << 20,
            epoll_queue_depth: 256,
            reap_watermark: 8,
            pin_workers: false,
        }
    }
}

impl FabricConfig {
    pub fn builder() -> FabricBuilder {
        FabricBuilder {
            cfg: FabricConfig::default(),
        }
    }
}

/// Builder for [`FabricConfig`].
pub struct FabricBuilder {
    cfg: FabricConfig,
}

impl FabricBuilder {
    pub fn workers(mut self, n: usize) -> Self {
        self.cfg.workers = n;
        self
    }

    pub fn links(mut self, n: usize) -> Self {
        self.cfg.links = n;
        self
    }

    pub fn channel_slots(mut self, n: usize) -> Self {
        self.cfg.channel_slots = n;
        self
    }

    pub fn slot_size(mut self, n: usize) -> Self {
        self.cfg.slot_size = n;
        self
    }

    pub fn oob_quota(mut self, n: usize) -> Self {
        self.cfg.oob_quota = n;
        self
    }

    pub fn backlog_capacity(mut self, n: usize) -> Self {
        self.cfg.backlog_capacity = n;
        self
    }

    pub fn epoll_queue_depth(mut self, n: usize) -> Self {
        self.cfg.epoll_queue_depth = n;
        self
    }

    pub fn reap_watermark(mut self, n: usize) -> Self {
        self.cfg.reap_watermark = n;
        self
    }

    pub fn pin_workers(mut self, pin: bool) -> Self {
        self.cfg.pin_workers = pin;
        self
    }

    pub fn build(self) -> FabricConfig {
        self.cfg
    }
}

/// Wire up `links` client links and one proxy over in-process channels.
///
/// Channel establishment between real processes is outside this crate;
/// this constructor stands in for that handshake and is what the tests
/// and the demo binary use.
pub fn establish(cfg: FabricConfig) -> Result<(Vec<Link>, Proxy)> {
    if cfg.workers == 0 || cfg.links == 0 {
        return Err(Error::InvalidState);
    }
    if cfg.slot_size <= proto::HEADER_SIZE {
        return Err(Error::InvalidState);
    }
    let mut link_sides: Vec<Vec<Channel>> = (0..cfg.links).map(|_| Vec::new()).collect();
    let mut worker_sides: Vec<Vec<Channel>> = (0..cfg.workers).map(|_| Vec::new()).collect();
    for (w, worker_side) in worker_sides.iter_mut().enumerate() {
        for link_side in link_sides.iter_mut() {
            let (client_end, host_end) =
                Channel::pair(w, cfg.channel_slots, cfg.slot_size, cfg.oob_quota);
            link_side.push(client_end);
            worker_side.push(host_end);
        }
    }
    let proxy = Proxy::spawn(worker_sides, cfg.clone())?;
    let links = link_sides
        .into_iter()
        .map(|chans| Link::new(chans, cfg.clone()))
        .collect::<Result<Vec<_>>>()?;
    Ok((links, proxy))
}
