//! Bounded slot-queue message channels.
//!
//! A channel is a pair of fixed-capacity slot queues between one client
//! link and one host worker, one queue per direction. Each slot moves
//! through a two-phase handoff:
//!
//! ```text
//!        put                 mark_ready            get
//! Free -------> Claimed -----------------> Ready ------> Taken
//!   ^                                                      |
//!   +------------------------ mark_done -------------------+
//! ```
//!
//! A producer never reads a slot it has not filled; a consumer never
//! reuses a slot before marking it done. Slots may be marked done out of
//! order, but the producer reclaims them strictly in ring order: `put`
//! fails while the slot at the head position is still in flight, which is
//! what motivates the reap policy in the client dispatcher.
//!
//! Payload copy-out races slot reclamation by the reaper, so every payload
//! read of a `Taken` slot happens under the queue's consume lock.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicBool, AtomicIsize, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::error::PutError;
use crate::proto::{Header, Opcode, HEADER_SIZE};

const FREE: u8 = 0;
const CLAIMED: u8 = 1;
const READY: u8 = 2;
const TAKEN: u8 = 3;

struct Slot {
    state: AtomicU8,
    len: UnsafeCell<usize>,
    buf: UnsafeCell<Box<[u8]>>,
}

// Slot data is only touched by the thread that owns the matching state
// transition, or under the queue consume lock for Taken payloads.
unsafe impl Sync for Slot {}

impl Slot {
    fn new(slot_size: usize) -> Self {
        Slot {
            state: AtomicU8::new(FREE),
            len: UnsafeCell::new(0),
            buf: UnsafeCell::new(vec![0u8; slot_size].into_boxed_slice()),
        }
    }
}

/// One direction of a channel.
pub struct MsgQueue {
    slots: Box<[Slot]>,
    /// Ring mask, `slots.len()` is a power of two.
    mask: u64,
    /// Next slot to claim (virtual, monotonically increasing). Mutated
    /// only under `put_lock`.
    head: AtomicU64,
    /// Next slot to take. Only the single consumer thread advances it.
    tail: AtomicU64,
    /// Per-channel send sequence, assigned under `put_lock`.
    seq: AtomicU64,
    /// Slots currently between `put` and `mark_done`.
    in_flight: AtomicUsize,
    /// Serializes producers (the client surface is multi-threaded).
    put_lock: Mutex<()>,
    /// Serializes payload copy-out against the reaper.
    consume_lock: Mutex<()>,
    /// Remaining out-of-band byte quota for reaped payloads.
    oob_quota: AtomicIsize,
    /// Cleared when either endpoint goes away.
    alive: AtomicBool,
}

unsafe impl Sync for MsgQueue {}

impl MsgQueue {
    pub fn new(slots: usize, slot_size: usize, oob_quota: usize) -> Self {
        let slots = slots.next_power_of_two();
        debug_assert!(slot_size > HEADER_SIZE);
        MsgQueue {
            slots: (0..slots).map(|_| Slot::new(slot_size)).collect(),
            mask: slots as u64 - 1,
            head: AtomicU64::new(0),
            tail: AtomicU64::new(0),
            seq: AtomicU64::new(0),
            in_flight: AtomicUsize::new(0),
            put_lock: Mutex::new(()),
            consume_lock: Mutex::new(()),
            oob_quota: AtomicIsize::new(oob_quota as isize),
            alive: AtomicBool::new(true),
        }
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Largest payload a single envelope can carry.
    #[inline]
    pub fn max_payload(&self) -> usize {
        unsafe { (&(*self.slots[0].buf.get())).len() - HEADER_SIZE }
    }

    /// Slots available to the producer right now.
    #[inline]
    pub fn free_slots(&self) -> usize {
        self.capacity() - self.in_flight.load(Ordering::Acquire)
    }

    #[inline]
    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    pub fn close(&self) {
        self.alive.store(false, Ordering::Release);
    }

    /// Enqueue one envelope. Fills the slot, then flips it ready; the
    /// sequence number is assigned in put order.
    pub fn put(&self, opcode: Opcode, tag: u64, payload: &[u8]) -> Result<u64, PutError> {
        if payload.len() > self.max_payload() {
            // Never Full: no amount of waiting makes the payload fit.
            return Err(PutError::TooBig);
        }
        if !self.is_alive() {
            return Err(PutError::Closed);
        }
        let _guard = self.put_lock.lock().unwrap();
        let head = self.head.load(Ordering::Relaxed);
        let slot = &self.slots[(head & self.mask) as usize];
        if slot
            .state
            .compare_exchange(FREE, CLAIMED, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            return Err(PutError::Full);
        }
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        let hdr = Header {
            opcode,
            len: payload.len() as u32,
            tag,
            seq,
        };
        unsafe {
            let buf = &mut *slot.buf.get();
            hdr.encode(&mut buf[..HEADER_SIZE]);
            buf[HEADER_SIZE..HEADER_SIZE + payload.len()].copy_from_slice(payload);
            *slot.len.get() = HEADER_SIZE + payload.len();
        }
        self.in_flight.fetch_add(1, Ordering::Release);
        slot.state.store(READY, Ordering::Release);
        self.head.store(head + 1, Ordering::Relaxed);
        Ok(seq)
    }

    /// Take the next ready slot. Single-consumer; returns the slot index.
    pub fn get(&self) -> Option<usize> {
        let tail = self.tail.load(Ordering::Relaxed);
        let idx = (tail & self.mask) as usize;
        let slot = &self.slots[idx];
        if slot
            .state
            .compare_exchange(READY, TAKEN, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            return None;
        }
        self.tail.store(tail + 1, Ordering::Relaxed);
        Some(idx)
    }

    /// Envelope bytes of a slot currently held in `Taken` (or just taken
    /// by this thread). Valid until the slot is marked done.
    #[inline]
    pub fn slot_bytes(&self, idx: usize) -> &[u8] {
        debug_assert_eq!(self.slots[idx].state.load(Ordering::Relaxed), TAKEN);
        unsafe {
            let len = *self.slots[idx].len.get();
            &(&(*self.slots[idx].buf.get()))[..len]
        }
    }

    /// Decoded header of a taken slot.
    pub fn slot_header(&self, idx: usize) -> crate::error::Result<Header> {
        Header::decode(self.slot_bytes(idx))
    }

    /// Release a taken slot back to the producer.
    pub fn mark_done(&self, idx: usize) {
        let prev = self.slots[idx].state.swap(FREE, Ordering::Release);
        debug_assert_eq!(prev, TAKEN);
        self.in_flight.fetch_sub(1, Ordering::Release);
    }

    pub fn lock_consume(&self) -> MutexGuard<'_, ()> {
        self.consume_lock.lock().unwrap()
    }

    /// Copy out the payload of slot `idx` and mark it done, but only if
    /// the slot still holds the envelope with sequence `seq`. Returns
    /// `None` when the reaper got there first.
    pub fn take_payload(&self, idx: usize, seq: u64) -> Option<Vec<u8>> {
        let _guard = self.lock_consume();
        let slot = &self.slots[idx];
        if slot.state.load(Ordering::Acquire) != TAKEN {
            return None;
        }
        let bytes = self.slot_bytes(idx);
        let hdr = Header::decode(bytes).ok()?;
        if hdr.seq != seq {
            return None;
        }
        let payload = bytes[HEADER_SIZE..].to_vec();
        self.mark_done(idx);
        Some(payload)
    }

    /// Indices of slots currently in `Taken`, for the reaper's sweep.
    pub fn scan_taken(&self) -> Vec<usize> {
        (0..self.slots.len())
            .filter(|&i| self.slots[i].state.load(Ordering::Acquire) == TAKEN)
            .collect()
    }

    /// Charge `bytes` against the out-of-band quota. Fails without side
    /// effects when the quota is exhausted.
    pub fn try_charge_oob(&self, bytes: usize) -> bool {
        let prev = self.oob_quota.fetch_sub(bytes as isize, Ordering::AcqRel);
        if prev < bytes as isize {
            self.oob_quota.fetch_add(bytes as isize, Ordering::AcqRel);
            return false;
        }
        true
    }

    pub fn refund_oob(&self, bytes: usize) {
        self.oob_quota.fetch_add(bytes as isize, Ordering::AcqRel);
    }
}

/// A bidirectional channel endpoint: envelopes go out on `tx` and arrive
/// on `rx`. The peer endpoint holds the same queues crossed over.
#[derive(Clone)]
pub struct Channel {
    pub id: usize,
    tx: Arc<MsgQueue>,
    rx: Arc<MsgQueue>,
}

impl Channel {
    /// Build a connected endpoint pair.
    pub fn pair(id: usize, slots: usize, slot_size: usize, oob_quota: usize) -> (Channel, Channel) {
        let a = Arc::new(MsgQueue::new(slots, slot_size, oob_quota));
        let b = Arc::new(MsgQueue::new(slots, slot_size, oob_quota));
        (
            Channel {
                id,
                tx: a.clone(),
                rx: b.clone(),
            },
            Channel { id, tx: b, rx: a },
        )
    }

    #[inline]
    pub fn tx(&self) -> &MsgQueue {
        &self.tx
    }

    #[inline]
    pub fn rx(&self) -> &MsgQueue {
        &self.rx
    }

    pub fn close(&self) {
        self.tx.close();
        self.rx.close();
    }

    #[inline]
    pub fn is_alive(&self) -> bool {
        self.tx.is_alive() && self.rx.is_alive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queue() -> MsgQueue {
        MsgQueue::new(4, 256, 1024)
    }

    #[test]
    fn test_put_get_done() {
        let q = queue();
        assert_eq!(q.free_slots(), 4);
        let seq = q.put(Opcode::TClose, 9, &[1, 2, 3]).unwrap();
        assert_eq!(seq, 0);
        assert_eq!(q.free_slots(), 3);

        let idx = q.get().unwrap();
        let hdr = q.slot_header(idx).unwrap();
        assert_eq!(hdr.opcode, Opcode::TClose);
        assert_eq!(hdr.tag, 9);
        assert_eq!(hdr.len, 3);
        assert_eq!(&q.slot_bytes(idx)[HEADER_SIZE..], &[1, 2, 3]);

        // Not reclaimable until done.
        assert_eq!(q.free_slots(), 3);
        q.mark_done(idx);
        assert_eq!(q.free_slots(), 4);
    }

    #[test]
    fn test_full_until_head_slot_freed() {
        let q = queue();
        for i in 0..4 {
            q.put(Opcode::TClose, i, &[]).unwrap();
        }
        assert_eq!(q.put(Opcode::TClose, 99, &[]), Err(PutError::Full));

        let first = q.get().unwrap();
        let second = q.get().unwrap();

        // Freeing out of ring order does not unblock the producer: the
        // head slot is still in flight.
        q.mark_done(second);
        assert_eq!(q.put(Opcode::TClose, 99, &[]), Err(PutError::Full));

        q.mark_done(first);
        q.put(Opcode::TClose, 99, &[]).unwrap();
    }

    #[test]
    fn test_seq_is_put_order() {
        let q = queue();
        for expect in 0..3u64 {
            let seq = q.put(Opcode::TClose, 0, &[]).unwrap();
            assert_eq!(seq, expect);
        }
        for expect in 0..3u64 {
            let idx = q.get().unwrap();
            assert_eq!(q.slot_header(idx).unwrap().seq, expect);
            q.mark_done(idx);
        }
    }

    #[test]
    fn test_take_payload_guards_reuse() {
        let q = queue();
        let seq = q.put(Opcode::ERecvdata, 1, b"abc").unwrap();
        let idx = q.get().unwrap();

        // Reaper-style consumption under the lock.
        assert_eq!(q.take_payload(idx, seq).unwrap(), b"abc");
        // Second taker observes the slot gone.
        assert!(q.take_payload(idx, seq).is_none());
    }

    #[test]
    fn test_oob_quota() {
        let q = MsgQueue::new(4, 256, 100);
        assert!(q.try_charge_oob(60));
        assert!(!q.try_charge_oob(60));
        q.refund_oob(60);
        assert!(q.try_charge_oob(100));
    }

    #[test]
    fn test_oversized_payload_rejected() {
        let q = queue();
        let big = vec![0u8; 512];
        // TooBig, not Full: retrying an oversized put can never succeed.
        assert_eq!(q.put(Opcode::TSenddata, 0, &big), Err(PutError::TooBig));
    }

    #[test]
    fn test_closed_queue_rejects_put() {
        let q = queue();
        q.close();
        assert_eq!(q.put(Opcode::TClose, 0, &[]), Err(PutError::Closed));
    }

    #[test]
    fn test_threaded_handoff() {
        let (a, b) = Channel::pair(0, 8, 256, 0);
        let n = 1000u64;

        let producer = std::thread::spawn(move || {
            for i in 0..n {
                loop {
                    match a.tx().put(Opcode::TSenddata, i, &i.to_le_bytes()) {
                        Ok(_) => break,
                        Err(PutError::Full) => std::hint::spin_loop(),
                        Err(e) => panic!("{}", e),
                    }
                }
            }
        });

        let mut got = 0u64;
        while got < n {
            if let Some(idx) = b.rx().get() {
                let hdr = b.rx().slot_header(idx).unwrap();
                assert_eq!(hdr.tag, got);
                assert_eq!(hdr.seq, got);
                b.rx().mark_done(idx);
                got += 1;
            } else {
                std::hint::spin_loop();
            }
        }
        producer.join().unwrap();
    }
}
