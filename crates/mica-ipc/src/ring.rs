//! Lock-free bounded ring for variable-length message records.
//!
//! Design:
//! - Lives inside a [`SharedMemory`] region so both processes see the same
//!   control words and data bytes.
//! - Records are length-prefixed and 4-byte aligned; wrap-around uses an
//!   explicit wrap marker, plus implicit padding when fewer than 4 bytes
//!   remain at the end of the data area.
//! - MPSC: producers reserve space with a CAS on `tail_reserve` and commit in
//!   order through `tail_commit`; the single consumer owns `head`.
//!
//! One ring carries traffic in one direction; a channel transport pairs two
//! of them (see [`crate::transport`]).

use std::sync::atomic::Ordering;
use std::sync::Arc;

use crate::layout::{align_up, ring_ctrl, RECORD_ALIGN, WRAP_MARKER};
use crate::shmem::SharedMemory;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushError {
    Full,
    TooLarge,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PopError {
    /// The ring is empty.
    Empty,
    /// Corruption detected (e.g. a bogus length prefix).
    Corrupt,
}

/// One directional message ring inside a shared region.
///
/// `ctrl` and `data` are byte offsets into the region; `init` must have run
/// exactly once (by the allocating side) before either side attaches.
#[derive(Debug)]
pub struct MsgRing {
    mem: Arc<SharedMemory>,
    ctrl: usize,
    data: usize,
    cap: u32,
}

impl MsgRing {
    /// Write the control words for a fresh ring and return a view of it.
    pub fn init(mem: Arc<SharedMemory>, ctrl: usize, data: usize, capacity: u32) -> Self {
        assert!(capacity > 0);
        assert_eq!(capacity as usize % RECORD_ALIGN, 0);
        assert!(data + capacity as usize <= mem.len());
        mem.ctrl_word(ctrl + ring_ctrl::HEAD * 4).store(0, Ordering::Relaxed);
        mem.ctrl_word(ctrl + ring_ctrl::TAIL_RESERVE * 4)
            .store(0, Ordering::Relaxed);
        mem.ctrl_word(ctrl + ring_ctrl::TAIL_COMMIT * 4)
            .store(0, Ordering::Relaxed);
        mem.ctrl_word(ctrl + ring_ctrl::CAPACITY * 4)
            .store(capacity, Ordering::Release);
        Self { mem, ctrl, data, cap: capacity }
    }

    /// Attach to a ring another side already initialized.
    pub fn attach(mem: Arc<SharedMemory>, ctrl: usize, data: usize) -> Self {
        let cap = mem.ctrl_word(ctrl + ring_ctrl::CAPACITY * 4).load(Ordering::Acquire);
        assert!(cap > 0, "attaching to an uninitialized ring");
        assert!(data + cap as usize <= mem.len());
        Self { mem, ctrl, data, cap }
    }

    pub fn capacity_bytes(&self) -> usize {
        self.cap as usize
    }

    fn head(&self) -> &std::sync::atomic::AtomicU32 {
        self.mem.ctrl_word(self.ctrl + ring_ctrl::HEAD * 4)
    }

    fn tail_reserve(&self) -> &std::sync::atomic::AtomicU32 {
        self.mem.ctrl_word(self.ctrl + ring_ctrl::TAIL_RESERVE * 4)
    }

    fn tail_commit(&self) -> &std::sync::atomic::AtomicU32 {
        self.mem.ctrl_word(self.ctrl + ring_ctrl::TAIL_COMMIT * 4)
    }

    pub fn is_empty(&self) -> bool {
        self.head().load(Ordering::Acquire) == self.tail_commit().load(Ordering::Acquire)
    }

    pub fn try_push(&self, payload: &[u8]) -> Result<(), PushError> {
        let payload_len = payload.len();
        if payload_len > (u32::MAX as usize).saturating_sub(4) {
            return Err(PushError::TooLarge);
        }

        let record_size = align_up(4 + payload_len, RECORD_ALIGN);
        if record_size > self.cap as usize {
            return Err(PushError::TooLarge);
        }

        loop {
            let head = self.head().load(Ordering::Acquire);
            let tail = self.tail_reserve().load(Ordering::Acquire);

            let used = tail.wrapping_sub(head);
            if used > self.cap {
                // Raced with the consumer advancing `head` between the two
                // loads; retry.
                continue;
            }
            let free = self.cap - used;

            let tail_index = (tail % self.cap) as usize;
            let remaining = (self.cap as usize) - tail_index;

            let (padding, write_wrap_marker) = if remaining < 4 {
                (remaining, false)
            } else if remaining < record_size {
                (remaining, true)
            } else {
                (0, false)
            };

            let reserve = padding + record_size;
            if reserve as u32 > free {
                return Err(PushError::Full);
            }

            let new_tail = tail.wrapping_add(reserve as u32);
            if self
                .tail_reserve()
                .compare_exchange(tail, new_tail, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                continue;
            }

            if write_wrap_marker {
                self.mem.write_u32(self.data + tail_index, WRAP_MARKER);
            }

            let start = tail.wrapping_add(padding as u32);
            let start_index = (start % self.cap) as usize;

            // The record fits contiguously from `start_index`.
            self.mem.write_u32(self.data + start_index, payload_len as u32);
            self.mem.write_bytes(self.data + start_index + 4, payload);

            // Commit in order behind any producer that reserved earlier.
            loop {
                let committed = self.tail_commit().load(Ordering::Acquire);
                if committed == tail {
                    break;
                }
                std::hint::spin_loop();
            }

            self.tail_commit().store(new_tail, Ordering::Release);
            return Ok(());
        }
    }

    pub fn try_pop(&self) -> Result<Vec<u8>, PopError> {
        loop {
            let head = self.head().load(Ordering::Acquire);
            let tail = self.tail_commit().load(Ordering::Acquire);
            if head == tail {
                return Err(PopError::Empty);
            }

            let head_index = (head % self.cap) as usize;
            let remaining = (self.cap as usize) - head_index;

            if remaining < 4 {
                // Implicit padding.
                self.head()
                    .store(head.wrapping_add(remaining as u32), Ordering::Release);
                continue;
            }

            let len = self.mem.read_u32(self.data + head_index);
            if len == WRAP_MARKER {
                // Explicit wrap marker: skip to the start of the data area.
                self.head()
                    .store(head.wrapping_add(remaining as u32), Ordering::Release);
                continue;
            }

            let len_usize = len as usize;
            let total = align_up(4 + len_usize, RECORD_ALIGN);
            if total > remaining {
                return Err(PopError::Corrupt);
            }
            let committed = tail.wrapping_sub(head);
            if committed < total as u32 {
                // Cannot happen with in-order commits.
                return Err(PopError::Corrupt);
            }

            let mut out = vec![0u8; len_usize];
            self.mem.read_bytes(self.data + head_index + 4, &mut out);

            self.head()
                .store(head.wrapping_add(total as u32), Ordering::Release);
            return Ok(out);
        }
    }
}

/// Conservative upper bound on the payload that fits a ring of `capacity`.
pub fn max_payload_len_for_capacity(capacity_bytes: usize) -> usize {
    capacity_bytes.saturating_sub(4 + (RECORD_ALIGN - 1))
}
