//! Fixed-capacity pool of pending DCC packets.
//!
//! Every packet awaiting translation lives in one of
//! [`PENDING_POOL_SIZE`](crate::consts::PENDING_POOL_SIZE) pre-allocated
//! records, chained by arena index into per-slot FIFOs. A record is either
//! on the free list or on exactly one slot's FIFO, never both; the host
//! command path allocates, the packet manager consumes, and freed records
//! go straight back on the free list.
//!
//! Index links rather than references keep the pool trivially shareable
//! between the cooperative contexts that touch it.

use crate::consts::{MAX_PAYLOAD_BYTES, MAX_WIRE_BYTES, PENDING_POOL_SIZE};
use crate::errors::ErrorCode;
use crate::packet::parity;

use heapless::Vec;

/// A decoder-independent DCC frame awaiting translation.
#[derive(Debug)]
pub struct PendingPacket {
    /// Positive mobile ID, negated accessory external address, or zero for
    /// broadcast and service-mode packets.
    pub target: i16,
    /// Leading 1-bit count.
    pub preamble: u8,
    /// Trailing 1-bit count.
    pub postamble: u8,
    /// Times to transmit; zero means indefinitely.
    pub duration: u8,
    /// Wire bytes, parity included.
    pub bytes: Vec<u8, MAX_WIRE_BYTES>,
    next: Option<u8>,
}

impl PendingPacket {
    fn empty() -> Self {
        Self {
            target: 0,
            preamble: 0,
            postamble: 0,
            duration: 0,
            bytes: Vec::new(),
            next: None,
        }
    }
}

/// The pool itself: an arena of records plus the free-list head.
#[derive(Debug)]
pub struct PendingPool {
    records: [PendingPacket; PENDING_POOL_SIZE],
    free: Option<u8>,
}

impl PendingPool {
    /// Create a pool with every record on the free list.
    pub fn new() -> Self {
        let mut records: [PendingPacket; PENDING_POOL_SIZE] =
            core::array::from_fn(|_| PendingPacket::empty());
        for (i, rec) in records.iter_mut().enumerate() {
            rec.next = if i + 1 < PENDING_POOL_SIZE {
                Some((i + 1) as u8)
            } else {
                None
            };
        }
        Self {
            records,
            free: Some(0),
        }
    }

    /// Number of records currently on the free list.
    pub fn available(&self) -> usize {
        let mut n = 0;
        let mut at = self.free;
        while let Some(i) = at {
            n += 1;
            at = self.records[i as usize].next;
        }
        n
    }

    /// Allocate a record, appending the XOR parity byte to the payload on
    /// copy-in.
    ///
    /// # Errors
    ///
    /// [`ErrorCode::CommandQueueFull`] when the pool is exhausted;
    /// [`ErrorCode::InvalidArgumentCount`] for an empty or oversized
    /// payload.
    pub fn alloc(
        &mut self,
        target: i16,
        duration: u8,
        preamble: u8,
        postamble: u8,
        payload: &[u8],
    ) -> Result<u8, ErrorCode> {
        if payload.is_empty() || payload.len() > MAX_PAYLOAD_BYTES {
            return Err(ErrorCode::InvalidArgumentCount);
        }
        let index = self.free.ok_or(ErrorCode::CommandQueueFull)?;
        let rec = &mut self.records[index as usize];
        self.free = rec.next;

        rec.target = target;
        rec.duration = duration;
        rec.preamble = preamble;
        rec.postamble = postamble;
        rec.bytes.clear();
        let _ = rec.bytes.extend_from_slice(payload);
        let _ = rec.bytes.push(parity(payload));
        rec.next = None;
        Ok(index)
    }

    /// Append an allocated record to the tail of a FIFO.
    pub fn append(&mut self, head: &mut Option<u8>, index: u8) {
        match *head {
            None => *head = Some(index),
            Some(first) => {
                let mut at = first;
                while let Some(next) = self.records[at as usize].next {
                    at = next;
                }
                self.records[at as usize].next = Some(index);
            }
        }
    }

    /// Access a record by index.
    pub fn get(&self, index: u8) -> &PendingPacket {
        &self.records[index as usize]
    }

    /// The record following `index` on its FIFO, for non-destructive
    /// walks of a slot's queue.
    pub fn next_of(&self, index: u8) -> Option<u8> {
        self.records[index as usize].next
    }

    /// Detach the head of a FIFO, return it to the free list, and yield
    /// the new head.
    pub fn free_one(&mut self, head: u8) -> Option<u8> {
        let new_head = self.records[head as usize].next;
        self.release(head);
        new_head
    }

    /// Drain an entire FIFO back onto the free list.
    pub fn free_all(&mut self, head: &mut Option<u8>) {
        let mut at = *head;
        while let Some(i) = at {
            at = self.records[i as usize].next;
            self.release(i);
        }
        *head = None;
    }

    fn release(&mut self, index: u8) {
        let rec = &mut self.records[index as usize];
        rec.bytes.clear();
        rec.next = self.free;
        self.free = Some(index);
    }
}

impl Default for PendingPool {
    fn default() -> Self {
        Self::new()
    }
}
