//! Epoll emulation over dispatcher-raised readiness.
//!
//! An instance keeps three bounded rings:
//!
//! - `primary`: readiness the dispatcher raised while nobody was draining,
//! - `shadow`: readiness replayed at `ctl` time, so an edge that fired
//!   before registration is not lost,
//! - `feed`: the dispatcher's staging ring, behind its own lock so a
//!   publishing sweep never contends with a waiter holding the main lock.
//!
//! A queued entry is a hint, not the truth: on drain, an entry counts only
//! if its bits are still in the socket's registration mask and still
//! pending on the socket. Consuming an entry clears the pending bits, so a
//! level is reported once per edge.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::time::{Duration, Instant};

use bitflags::bitflags;
use log::warn;

use crate::error::{Error, Result};

use super::socket::{EpollReg, VirtualSocket};

bitflags! {
    /// Readiness bits, numerically matching the kernel's epoll flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct EvMask: u32 {
        const IN = 0x001;
        const OUT = 0x004;
        const ERR = 0x008;
        const HUP = 0x010;
        const RDHUP = 0x2000;
    }
}

#[derive(Debug, Clone, Copy)]
pub enum CtlOp {
    Add,
    Mod,
    Del,
}

/// One reported event: the registration's user data plus the valid bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EpollEvent {
    pub data: u64,
    pub events: EvMask,
}

struct Entry {
    sock: Weak<VirtualSocket>,
    bits: EvMask,
}

struct Rings {
    primary: VecDeque<Entry>,
    shadow: VecDeque<Entry>,
}

pub struct EpollInstance {
    handle: u64,
    cap: usize,
    rings: Mutex<Rings>,
    feed: Mutex<VecDeque<Entry>>,
    cond: Condvar,
    waiting: AtomicBool,
}

impl EpollInstance {
    pub(crate) fn new(handle: u64, cap: usize) -> Self {
        EpollInstance {
            handle,
            cap,
            rings: Mutex::new(Rings {
                primary: VecDeque::new(),
                shadow: VecDeque::new(),
            }),
            feed: Mutex::new(VecDeque::new()),
            cond: Condvar::new(),
            waiting: AtomicBool::new(false),
        }
    }

    pub(crate) fn handle(&self) -> u64 {
        self.handle
    }

    /// Register, re-register or deregister a socket.
    ///
    /// ADD replays readiness that is already pending onto the shadow ring:
    /// the edge fired before the registration existed and would otherwise
    /// never be reported.
    pub fn ctl(
        self: &Arc<Self>,
        op: CtlOp,
        sock: &Arc<VirtualSocket>,
        mask: EvMask,
        data: u64,
    ) -> Result<()> {
        {
            let mut reg = sock.epoll.lock().unwrap();
            match op {
                CtlOp::Add => {
                    if reg.is_some() {
                        return Err(Error::InvalidState);
                    }
                    *reg = Some(EpollReg {
                        instance: Arc::downgrade(self),
                        mask,
                        data,
                    });
                }
                CtlOp::Mod => match reg.as_mut() {
                    Some(r) if std::ptr::eq(r.instance.as_ptr(), Arc::as_ptr(self)) => {
                        r.mask = mask;
                        r.data = data;
                    }
                    _ => return Err(Error::InvalidState),
                },
                CtlOp::Del => {
                    match reg.as_ref() {
                        Some(r) if std::ptr::eq(r.instance.as_ptr(), Arc::as_ptr(self)) => {
                            *reg = None;
                        }
                        _ => return Err(Error::InvalidState),
                    }
                    return Ok(());
                }
            }
        }
        let pending = EvMask::from_bits_truncate(sock.events.load(Ordering::Acquire)) & mask;
        if !pending.is_empty() {
            let mut rings = self.rings.lock().unwrap();
            push_bounded(
                &mut rings.shadow,
                self.cap,
                Entry {
                    sock: Arc::downgrade(sock),
                    bits: pending,
                },
            );
            drop(rings);
            self.signal();
        }
        Ok(())
    }

    /// Stage an entry from the dispatcher. No wakeup here; the dispatcher
    /// signals once per sweep.
    pub(crate) fn publish(&self, sock: Weak<VirtualSocket>, bits: EvMask) {
        let mut feed = self.feed.lock().unwrap();
        push_bounded(&mut feed, self.cap, Entry { sock, bits });
    }

    /// Wake the waiter, if one is parked. The rings lock is taken so the
    /// notification cannot slip between a waiter's last feed check and its
    /// park.
    pub(crate) fn signal(&self) {
        if self.waiting.load(Ordering::Acquire) {
            let _guard = self.rings.lock().unwrap();
            self.cond.notify_all();
        }
    }

    /// Wait for events. `timeout_ms` follows epoll_wait: 0 polls, a
    /// negative value waits indefinitely, a positive value is a deadline
    /// in milliseconds.
    pub fn wait(&self, maxevents: usize, timeout_ms: i64) -> Vec<EpollEvent> {
        let deadline = if timeout_ms > 0 {
            Some(Instant::now() + Duration::from_millis(timeout_ms as u64))
        } else {
            None
        };
        // Becomes 0 once the deadline passes, which ends the wait loop.
        let mut timeout_left = timeout_ms;
        let mut out = Vec::new();
        let mut rings = self.rings.lock().unwrap();
        loop {
            self.fold_feed(&mut rings);
            while rings.primary.is_empty() && rings.shadow.is_empty() && timeout_left != 0 {
                self.waiting.store(true, Ordering::Release);
                // Entries staged after the last fold would otherwise be
                // missed until the next signal.
                self.fold_feed(&mut rings);
                if !rings.primary.is_empty() || !rings.shadow.is_empty() {
                    self.waiting.store(false, Ordering::Release);
                    break;
                }
                if let Some(dl) = deadline {
                    let now = Instant::now();
                    if now >= dl {
                        timeout_left = 0;
                    } else {
                        let (guard, _) = self.cond.wait_timeout(rings, dl - now).unwrap();
                        rings = guard;
                        if Instant::now() >= dl {
                            timeout_left = 0;
                        }
                    }
                } else {
                    rings = self.cond.wait(rings).unwrap();
                }
                self.waiting.store(false, Ordering::Release);
                self.fold_feed(&mut rings);
            }
            while out.len() < maxevents {
                let entry = match rings.shadow.pop_front() {
                    Some(e) => e,
                    None => match rings.primary.pop_front() {
                        Some(e) => e,
                        None => break,
                    },
                };
                let Some(sock) = entry.sock.upgrade() else { continue };
                let valid = {
                    let reg = sock.epoll.lock().unwrap();
                    let Some(r) = reg.as_ref() else { continue };
                    if !std::ptr::eq(r.instance.as_ptr(), self) {
                        continue;
                    }
                    let pending = EvMask::from_bits_truncate(sock.events.load(Ordering::Acquire));
                    let valid = pending & r.mask & entry.bits;
                    if valid.is_empty() {
                        continue;
                    }
                    sock.events.fetch_and(!valid.bits(), Ordering::AcqRel);
                    EpollEvent {
                        data: r.data,
                        events: valid,
                    }
                };
                out.push(valid);
            }
            // Every drained entry may have been invalidated between the
            // raise and the drain; with time left, wait again.
            if out.is_empty() && timeout_left != 0 {
                continue;
            }
            return out;
        }
    }

    fn fold_feed(&self, rings: &mut Rings) {
        let mut feed = self.feed.lock().unwrap();
        while let Some(entry) = feed.pop_front() {
            push_bounded(&mut rings.primary, self.cap, entry);
        }
    }
}

fn push_bounded(ring: &mut VecDeque<Entry>, cap: usize, entry: Entry) {
    if ring.len() >= cap {
        warn!("epoll ring at capacity {}, dropping readiness entry", cap);
        return;
    }
    ring.push_back(entry);
}
