//! Process-shared memory regions and the transport-level handle table.
//!
//! [`SharedMemory`] stands in for an OS shared-memory mapping: a fixed-size,
//! word-aligned byte region that several threads (standing in for processes)
//! access concurrently. Control words are read and written through real
//! atomics; bulk bytes are copied raw under the single-writer discipline the
//! rings enforce, which is the same soundness argument the ring algorithm
//! itself relies on.
//!
//! [`HandleBroker`] models the transport layer's handle table: regions cross
//! the process boundary as opaque `u32` ids, and the receiver resolves an id
//! to its own mapping. A handle says nothing about the payload.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use thiserror::Error;

/// Largest region a single allocation may map.
///
/// Matches the defensive-limit approach used for message decoding: a bogus
/// size request fails cleanly instead of exhausting the address space.
pub const MAX_REGION_BYTES: usize = 256 << 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ShmemError {
    #[error("zero-length shared memory region")]
    Empty,
    #[error("shared memory region of {0} bytes exceeds the {MAX_REGION_BYTES} byte limit")]
    TooLarge(usize),
}

/// A fixed-size shared byte region.
///
/// Storage is a boxed slice of `AtomicU32` so every 4-byte-aligned offset can
/// be used as a control word; the data areas between control words are
/// accessed as raw bytes.
#[derive(Debug)]
pub struct SharedMemory {
    words: Box<[AtomicU32]>,
    len: usize,
}

// Raw byte windows are only touched by the side the ring discipline names as
// their single writer; offsets published through the atomics order the
// accesses.
unsafe impl Send for SharedMemory {}
unsafe impl Sync for SharedMemory {}

impl SharedMemory {
    /// Allocate a zeroed region of `len_bytes` (rounded up to a whole word).
    pub fn alloc(len_bytes: usize) -> Result<Arc<Self>, ShmemError> {
        if len_bytes == 0 {
            return Err(ShmemError::Empty);
        }
        if len_bytes > MAX_REGION_BYTES {
            return Err(ShmemError::TooLarge(len_bytes));
        }
        let words = len_bytes.div_ceil(4);
        let storage: Vec<AtomicU32> = (0..words).map(|_| AtomicU32::new(0)).collect();
        Ok(Arc::new(Self {
            words: storage.into_boxed_slice(),
            len: words * 4,
        }))
    }

    /// Region length in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Control word at a 4-byte-aligned byte offset.
    ///
    /// Panics on a misaligned or out-of-range offset; layouts are fixed at
    /// allocation time, so that is a caller bug rather than a runtime error.
    pub fn ctrl_word(&self, byte_offset: usize) -> &AtomicU32 {
        assert_eq!(byte_offset % 4, 0, "control word offset must be aligned");
        &self.words[byte_offset / 4]
    }

    fn data_ptr(&self) -> *mut u8 {
        self.words[0].as_ptr() as *mut u8
    }

    /// Copy `src` into the region at `offset`.
    pub fn write_bytes(&self, offset: usize, src: &[u8]) {
        assert!(offset + src.len() <= self.len, "write past end of region");
        unsafe {
            std::ptr::copy_nonoverlapping(src.as_ptr(), self.data_ptr().add(offset), src.len());
        }
    }

    /// Copy bytes from the region at `offset` into `out`.
    pub fn read_bytes(&self, offset: usize, out: &mut [u8]) {
        assert!(offset + out.len() <= self.len, "read past end of region");
        unsafe {
            std::ptr::copy_nonoverlapping(self.data_ptr().add(offset), out.as_mut_ptr(), out.len());
        }
    }

    /// Read a `u32` control value embedded in a data area.
    pub fn read_u32(&self, offset: usize) -> u32 {
        let mut tmp = [0u8; 4];
        self.read_bytes(offset, &mut tmp);
        u32::from_le_bytes(tmp)
    }

    /// Write a `u32` control value embedded in a data area.
    pub fn write_u32(&self, offset: usize, value: u32) {
        self.write_bytes(offset, &value.to_le_bytes());
    }
}

/// Opaque transport-level handle to a shared region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ShmemHandle(u32);

impl ShmemHandle {
    pub fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    pub fn raw(self) -> u32 {
        self.0
    }
}

/// Handle table shared by the two sides of a transport.
///
/// `transmit` registers a region under a fresh id (the "give" across the
/// boundary); `resolve` is the receiving side's lookup; `revoke` withdraws a
/// handle so later resolves fail instead of reviving stale regions.
#[derive(Clone)]
#[derive(Debug)]
pub struct HandleBroker {
    inner: Arc<BrokerInner>,
}

#[derive(Debug)]
struct BrokerInner {
    next: AtomicU32,
    table: Mutex<HashMap<u32, Arc<SharedMemory>>>,
}

impl HandleBroker {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(BrokerInner {
                // 0 is reserved as "no handle" on the wire.
                next: AtomicU32::new(1),
                table: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn transmit(&self, region: Arc<SharedMemory>) -> ShmemHandle {
        let id = self.inner.next.fetch_add(1, Ordering::Relaxed);
        self.inner
            .table
            .lock()
            .unwrap()
            .insert(id, region);
        ShmemHandle(id)
    }

    pub fn resolve(&self, handle: ShmemHandle) -> Option<Arc<SharedMemory>> {
        self.inner
            .table
            .lock()
            .unwrap()
            .get(&handle.0)
            .cloned()
    }

    /// Withdraw a handle. Returns whether it was still registered.
    pub fn revoke(&self, handle: ShmemHandle) -> bool {
        self.inner
            .table
            .lock()
            .unwrap()
            .remove(&handle.0)
            .is_some()
    }
}

impl Default for HandleBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_rounds_up_and_zeroes() {
        let mem = SharedMemory::alloc(10).unwrap();
        assert_eq!(mem.len(), 12);
        let mut out = [0xAAu8; 12];
        mem.read_bytes(0, &mut out);
        assert_eq!(out, [0u8; 12]);
    }

    #[test]
    fn alloc_rejects_degenerate_sizes() {
        assert_eq!(SharedMemory::alloc(0).unwrap_err(), ShmemError::Empty);
        assert_eq!(
            SharedMemory::alloc(MAX_REGION_BYTES + 1).unwrap_err(),
            ShmemError::TooLarge(MAX_REGION_BYTES + 1)
        );
    }

    #[test]
    fn broker_revoke_invalidates_handle() {
        let broker = HandleBroker::new();
        let mem = SharedMemory::alloc(64).unwrap();
        let handle = broker.transmit(mem);
        assert!(broker.resolve(handle).is_some());
        assert!(broker.revoke(handle));
        assert!(broker.resolve(handle).is_none());
        assert!(!broker.revoke(handle));
    }

    #[test]
    fn bytes_round_trip() {
        let mem = SharedMemory::alloc(32).unwrap();
        mem.write_bytes(4, b"mica");
        let mut out = [0u8; 4];
        mem.read_bytes(4, &mut out);
        assert_eq!(&out, b"mica");
        mem.write_u32(8, 0xDEAD_BEEF);
        assert_eq!(mem.read_u32(8), 0xDEAD_BEEF);
    }
}
