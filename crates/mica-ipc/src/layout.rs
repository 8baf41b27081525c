//! Shared memory layout contract for the mica channel transport.
//!
//! A channel is backed by a single shared region that both processes map. The
//! region starts with a small header, followed by two message rings:
//!
//! - `to_gpu`: content process → GPU process (requests)
//! - `to_client`: GPU process → content process (replies, acks, state updates)
//!
//! Command rings for individual endpoints live in their own regions and use
//! the control-word layout in [`cmd_ctrl`].
//!
//! All control words are little-endian `u32` at 4-byte-aligned offsets.

/// `b"MICA"` as a little-endian `u32`.
pub const IPC_MAGIC: u32 = 0x4143_494D;

/// Shared-memory ABI version.
pub const IPC_VERSION: u32 = 1;

/// All ring records are aligned to this many bytes.
///
/// Must stay a power of two; both sides compute padding from it.
pub const RECORD_ALIGN: usize = 4;

/// Stored in a record length field to mean "skip to the start of the buffer".
///
/// `0xFFFF_FFFF` keeps zero-length payloads legal and is easy to spot in a
/// memory dump.
pub const WRAP_MARKER: u32 = 0xFFFF_FFFF;

/// Control word indices for a message ring header.
///
/// Offsets are free-running byte counters (wrapping `u32`), reduced modulo the
/// data capacity when indexing.
pub mod ring_ctrl {
    pub const HEAD: usize = 0;
    pub const TAIL_RESERVE: usize = 1;
    pub const TAIL_COMMIT: usize = 2;
    pub const CAPACITY: usize = 3; // written once at init
    pub const WORDS: usize = 4;
    pub const BYTES: usize = WORDS * 4;
}

/// Control word indices for a command ring header.
///
/// `PUT` is written only by the producing (content) process, `GET` only by the
/// consuming (GPU) process. Both are free-running byte counters.
pub mod cmd_ctrl {
    pub const PUT: usize = 0;
    pub const GET: usize = 1;
    pub const CAPACITY: usize = 2; // written once at init
    pub const RESERVED: usize = 3;
    pub const WORDS: usize = 4;
    pub const BYTES: usize = WORDS * 4;
}

/// Header words at the start of a channel transport region.
///
/// `CLIENT_STATE` / `SERVER_STATE` hold a [`peer_state`] value and are each
/// written only by the side they name.
pub mod transport_hdr {
    pub const MAGIC: usize = 0;
    pub const VERSION: usize = 1;
    pub const TO_GPU_CAPACITY: usize = 2;
    pub const TO_CLIENT_CAPACITY: usize = 3;
    pub const CLIENT_STATE: usize = 4;
    pub const SERVER_STATE: usize = 5;
    pub const WORDS: usize = 6;
    pub const BYTES: usize = WORDS * 4;
}

/// Values for the per-side transport state words.
pub mod peer_state {
    pub const ATTACHED: u32 = 0;
    pub const CLOSED: u32 = 1;
}

/// Byte offset of the `to_gpu` ring control words.
pub const fn to_gpu_ctrl_offset() -> usize {
    transport_hdr::BYTES
}

/// Byte offset of the `to_gpu` ring data region.
pub const fn to_gpu_data_offset() -> usize {
    to_gpu_ctrl_offset() + ring_ctrl::BYTES
}

/// Byte offset of the `to_client` ring control words.
pub const fn to_client_ctrl_offset(to_gpu_capacity: usize) -> usize {
    to_gpu_data_offset() + to_gpu_capacity
}

/// Byte offset of the `to_client` ring data region.
pub const fn to_client_data_offset(to_gpu_capacity: usize) -> usize {
    to_client_ctrl_offset(to_gpu_capacity) + ring_ctrl::BYTES
}

/// Total byte size of a transport region with the given ring capacities.
pub const fn transport_bytes(to_gpu_capacity: usize, to_client_capacity: usize) -> usize {
    to_client_data_offset(to_gpu_capacity) + to_client_capacity
}

/// Total byte size of a command ring region with the given data capacity.
pub const fn cmd_ring_bytes(capacity: usize) -> usize {
    cmd_ctrl::BYTES + capacity
}

pub(crate) const fn align_up(value: usize, align: usize) -> usize {
    debug_assert!(align.is_power_of_two());
    (value + (align - 1)) & !(align - 1)
}

/// Number of bytes a record with the given payload length occupies in a ring.
pub const fn record_size(payload_len: usize) -> usize {
    align_up(4 + payload_len, RECORD_ALIGN)
}
