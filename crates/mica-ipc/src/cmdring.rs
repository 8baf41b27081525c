//! Per-endpoint command ring with independent producer/consumer offsets.
//!
//! Unlike the message rings, nothing here is popped on its own schedule: the
//! producer batches command records ahead of its `put` offset and the
//! consumer drains exactly as far as a flush told it to. `put` and `get` are
//! free-running byte counters (reduced modulo the data capacity when
//! indexing) and are the only shared scalars; `put` is written by the
//! producing side alone and `get` by the consuming side alone, which is what
//! makes the ring safe without locks.
//!
//! Records reuse the message-ring framing: a 4-byte length prefix, 4-byte
//! alignment, an explicit wrap marker when a record will not fit before the
//! end of the data area, and implicit padding when fewer than 4 bytes remain.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use thiserror::Error;

use crate::layout::{align_up, cmd_ctrl, record_size, RECORD_ALIGN, WRAP_MARKER};
use crate::shmem::{SharedMemory, ShmemError};

/// Smallest useful command ring: one maximal record plus slack.
pub const MIN_CMD_RING_BYTES: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum CmdRingError {
    #[error("region too small or not initialized as a command ring")]
    BadRegion,
}

/// A consumed-side protocol violation. Terminal for the endpoint that owns
/// the ring; the caller translates it into its own error reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum CmdRingFault {
    #[error("flush offset out of range or unpublished")]
    InvalidOffset,
    #[error("malformed command record")]
    MalformedCommand,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum CmdWriteError {
    #[error("command ring full")]
    Full,
    #[error("command larger than the ring")]
    TooLarge,
}

/// Allocate and initialize a fresh command ring region.
///
/// `capacity_hint` is rounded up to record alignment and clamped to the
/// minimum ring size.
pub fn allocate(capacity_hint: usize) -> Result<Arc<SharedMemory>, ShmemError> {
    let capacity = align_up(capacity_hint.max(MIN_CMD_RING_BYTES), RECORD_ALIGN);
    let mem = SharedMemory::alloc(cmd_ctrl::BYTES + capacity)?;
    mem.ctrl_word(cmd_ctrl::PUT * 4).store(0, Ordering::Relaxed);
    mem.ctrl_word(cmd_ctrl::GET * 4).store(0, Ordering::Relaxed);
    mem.ctrl_word(cmd_ctrl::CAPACITY * 4)
        .store(capacity as u32, Ordering::Release);
    Ok(mem)
}

fn attach_capacity(mem: &SharedMemory) -> Result<u32, CmdRingError> {
    if mem.len() < cmd_ctrl::BYTES + MIN_CMD_RING_BYTES {
        return Err(CmdRingError::BadRegion);
    }
    let cap = mem.ctrl_word(cmd_ctrl::CAPACITY * 4).load(Ordering::Acquire);
    if cap == 0
        || cap as usize % RECORD_ALIGN != 0
        || cmd_ctrl::BYTES + cap as usize > mem.len()
    {
        return Err(CmdRingError::BadRegion);
    }
    Ok(cap)
}

/// Producing (content process) side of a command ring.
#[derive(Debug)]
pub struct CmdRingProducer {
    mem: Arc<SharedMemory>,
    cap: u32,
    put: u32,
}

impl CmdRingProducer {
    pub fn attach(mem: Arc<SharedMemory>) -> Result<Self, CmdRingError> {
        let cap = attach_capacity(&mem)?;
        let put = mem.ctrl_word(cmd_ctrl::PUT * 4).load(Ordering::Acquire);
        Ok(Self { mem, cap, put })
    }

    pub fn capacity_bytes(&self) -> usize {
        self.cap as usize
    }

    /// The producer's current (not necessarily published) put offset.
    pub fn put_offset(&self) -> u32 {
        self.put
    }

    fn shared_get(&self) -> u32 {
        self.mem.ctrl_word(cmd_ctrl::GET * 4).load(Ordering::Acquire)
    }

    /// Bytes available for new records, given the consumer's published get.
    pub fn free_bytes(&self) -> u32 {
        self.cap - self.put.wrapping_sub(self.shared_get())
    }

    /// Append one command record ahead of `put`.
    ///
    /// The record is not visible to the consumer until [`publish`] stores the
    /// new put offset and a flush announces it.
    ///
    /// [`publish`]: Self::publish
    pub fn write(&mut self, payload: &[u8]) -> Result<(), CmdWriteError> {
        if payload.len() > (u32::MAX as usize).saturating_sub(4) {
            return Err(CmdWriteError::TooLarge);
        }
        let total = record_size(payload.len());
        if total > self.cap as usize {
            return Err(CmdWriteError::TooLarge);
        }

        let put_index = (self.put % self.cap) as usize;
        let remaining = (self.cap as usize) - put_index;

        let padding = if remaining < 4 {
            remaining
        } else if remaining < total {
            // Explicit wrap marker, then the record restarts at offset 0.
            remaining
        } else {
            0
        };

        let needed = (padding + total) as u32;
        if needed > self.free_bytes() {
            return Err(CmdWriteError::Full);
        }

        if padding > 0 && remaining >= 4 {
            self.mem.write_u32(cmd_ctrl::BYTES + put_index, WRAP_MARKER);
        }

        let start = self.put.wrapping_add(padding as u32);
        let start_index = (start % self.cap) as usize;
        self.mem
            .write_u32(cmd_ctrl::BYTES + start_index, payload.len() as u32);
        self.mem
            .write_bytes(cmd_ctrl::BYTES + start_index + 4, payload);

        self.put = self.put.wrapping_add(needed);
        Ok(())
    }

    /// Publish the current put offset and return it.
    ///
    /// The returned value is what a flush message carries to the consumer.
    pub fn publish(&mut self) -> u32 {
        self.mem
            .ctrl_word(cmd_ctrl::PUT * 4)
            .store(self.put, Ordering::Release);
        self.put
    }
}

/// Consuming (GPU process) side of a command ring.
pub struct CmdRingConsumer {
    mem: Arc<SharedMemory>,
    cap: u32,
    get: u32,
}

impl CmdRingConsumer {
    pub fn attach(mem: Arc<SharedMemory>) -> Result<Self, CmdRingError> {
        let cap = attach_capacity(&mem)?;
        let get = mem.ctrl_word(cmd_ctrl::GET * 4).load(Ordering::Acquire);
        Ok(Self { mem, cap, get })
    }

    pub fn capacity_bytes(&self) -> usize {
        self.cap as usize
    }

    /// The consumer's current get offset.
    pub fn get_offset(&self) -> u32 {
        self.get
    }

    fn published_put(&self) -> u32 {
        self.mem.ctrl_word(cmd_ctrl::PUT * 4).load(Ordering::Acquire)
    }

    fn store_get(&self) {
        self.mem
            .ctrl_word(cmd_ctrl::GET * 4)
            .store(self.get, Ordering::Release);
    }

    /// Consume every record in `[get, target_put)` and return their payloads.
    ///
    /// `target_put` must be a put offset the producer actually published:
    /// behind or equal to the shared put word, no further than one capacity
    /// ahead of `get`, and record-aligned. Violations fault without consuming
    /// past the point of the fault; `get` never passes `target_put`.
    pub fn drain_to(&mut self, target_put: u32) -> Result<Vec<Vec<u8>>, CmdRingFault> {
        if target_put % RECORD_ALIGN as u32 != 0 {
            return Err(CmdRingFault::InvalidOffset);
        }
        let window = target_put.wrapping_sub(self.get);
        if window > self.cap {
            return Err(CmdRingFault::InvalidOffset);
        }
        let published = self.published_put().wrapping_sub(self.get);
        if window > published {
            return Err(CmdRingFault::InvalidOffset);
        }

        let mut out = Vec::new();
        while self.get != target_put {
            let get_index = (self.get % self.cap) as usize;
            let remaining = (self.cap as usize) - get_index;
            let left = target_put.wrapping_sub(self.get) as usize;

            if remaining < 4 {
                // Implicit padding at the end of the data area.
                if left < remaining {
                    self.store_get();
                    return Err(CmdRingFault::MalformedCommand);
                }
                self.get = self.get.wrapping_add(remaining as u32);
                continue;
            }

            let len = self.mem.read_u32(cmd_ctrl::BYTES + get_index);
            if len == WRAP_MARKER {
                if left < remaining {
                    self.store_get();
                    return Err(CmdRingFault::MalformedCommand);
                }
                self.get = self.get.wrapping_add(remaining as u32);
                continue;
            }

            let total = record_size(len as usize);
            if total > remaining || left < total {
                self.store_get();
                return Err(CmdRingFault::MalformedCommand);
            }

            let mut payload = vec![0u8; len as usize];
            self.mem
                .read_bytes(cmd_ctrl::BYTES + get_index + 4, &mut payload);
            out.push(payload);

            self.get = self.get.wrapping_add(total as u32);
        }

        self.store_get();
        Ok(out)
    }
}
