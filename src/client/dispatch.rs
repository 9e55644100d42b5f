//! Receive dispatcher: one background thread per link.
//!
//! The dispatcher is the single consumer of every inbound queue. It
//! decodes headers only; payloads stay in their slots until the socket
//! that owns the cursor copies them out. When a queue runs low on free
//! slots while nothing new is arriving, the dispatcher reaps the oldest
//! consumed-but-undisposed slots into their sockets' out-of-band lists so
//! the host side is not throttled by a slow consumer.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use log::debug;

use crate::backoff::Backoff;
use crate::channel::Channel;
use crate::proto::{Header, HEADER_SIZE};

use super::epoll::{EpollInstance, EvMask};
use super::socket::{OobEntry, RxCursor};
use super::LinkInner;

/// Envelopes handled per channel per sweep, so one busy channel cannot
/// starve the others.
const DISPATCH_BATCH: usize = 32;

pub(crate) fn run(link: Arc<LinkInner>) {
    let mut backoff = Backoff::new();
    let mut to_signal: Vec<Arc<EpollInstance>> = Vec::new();
    loop {
        if link.stop.load(Ordering::Acquire) {
            break;
        }
        let mut progressed = false;
        for ch in &link.channels {
            for _ in 0..DISPATCH_BATCH {
                let Some(idx) = ch.rx().get() else { break };
                progressed = true;
                dispatch_one(&link, ch, idx, &mut to_signal);
            }
            maybe_reap(&link, ch);
        }
        for inst in to_signal.drain(..) {
            inst.signal();
        }
        if progressed {
            backoff.reset();
        } else {
            if link.channels.iter().any(|ch| !ch.is_alive()) {
                link.mark_down();
            }
            backoff.wait();
        }
    }
}

/// Route one taken slot by tag. Replies and events go to separate queues;
/// anything unroutable is dropped with its slot released.
fn dispatch_one(
    link: &Arc<LinkInner>,
    ch: &Channel,
    idx: usize,
    to_signal: &mut Vec<Arc<EpollInstance>>,
) {
    let hdr = match ch.rx().slot_header(idx) {
        Ok(h) => h,
        Err(_) => {
            debug!("channel {}: dropping malformed envelope", ch.id);
            ch.rx().mark_done(idx);
            return;
        }
    };
    let Some(sock) = link.lookup_socket(hdr.tag) else {
        debug!("channel {}: no socket for tag {}, dropping", ch.id, hdr.tag);
        ch.rx().mark_done(idx);
        return;
    };
    let cur = RxCursor {
        channel: ch.id,
        slot: idx,
        seq: hdr.seq,
        opcode: hdr.opcode,
    };
    let mut guard = sock.queues.lock().unwrap();
    let Some(qs) = guard.as_mut() else {
        // Teardown raced the delivery. Drop, never touch the socket.
        drop(guard);
        debug!("tag {}: closing, dropping {:?}", hdr.tag, hdr.opcode);
        ch.rx().mark_done(idx);
        return;
    };
    if hdr.opcode.is_reply() {
        qs.replies.push_back(cur);
    } else if hdr.opcode.is_event() {
        qs.events.push_back(cur);
        drop(guard);
        if let Some(inst) = sock.raise(EvMask::IN) {
            to_signal.push(inst);
        }
    } else {
        drop(guard);
        debug!("tag {}: unroutable opcode {:?}, dropping", hdr.tag, hdr.opcode);
        ch.rx().mark_done(idx);
    }
}

/// Evict the oldest undisposed slots into their sockets' out-of-band
/// lists when the queue is nearly full. Eviction is charged against the
/// channel's byte quota; exhaustion stops new admissions, nothing else.
fn maybe_reap(link: &Arc<LinkInner>, ch: &Channel) {
    let rx = ch.rx();
    if rx.free_slots() > link.cfg.reap_watermark {
        return;
    }
    let _consume = rx.lock_consume();
    let mut taken: Vec<(usize, Header)> = rx
        .scan_taken()
        .into_iter()
        .filter_map(|idx| rx.slot_header(idx).ok().map(|h| (idx, h)))
        .collect();
    taken.sort_by_key(|(_, h)| h.seq);
    for (idx, hdr) in taken {
        if rx.free_slots() > link.cfg.reap_watermark {
            break;
        }
        let Some(sock) = link.lookup_socket(hdr.tag) else {
            continue;
        };
        // A consumer parked in recv/accept is about to take this payload
        // from the slot itself; evicting it would be a wasted copy.
        if hdr.opcode.is_event() && sock.has_consumer() {
            continue;
        }
        let len = hdr.len as usize;
        if !rx.try_charge_oob(len) {
            debug!("channel {}: oob quota exhausted, reap stops", ch.id);
            break;
        }
        let payload = rx.slot_bytes(idx)[HEADER_SIZE..].to_vec();
        let mut guard = sock.queues.lock().unwrap();
        match guard.as_mut() {
            Some(qs) => {
                qs.oob.push_back(OobEntry {
                    seq: hdr.seq,
                    payload,
                });
                drop(guard);
                rx.mark_done(idx);
                debug!("channel {}: reaped seq {} for tag {}", ch.id, hdr.seq, hdr.tag);
            }
            None => {
                drop(guard);
                rx.refund_oob(len);
                rx.mark_done(idx);
            }
        }
    }
}
