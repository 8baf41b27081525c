//! Channel transport: one shared region carrying a request ring and a reply
//! ring, plus per-side liveness words.
//!
//! The allocating side (the GPU process for channels, the host bootstrap for
//! the control path) calls [`Transport::allocate`], passes the region handle
//! across the boundary, and each side attaches its own end. Dropping or
//! closing an end flips that side's state word; the peer keeps draining
//! whatever is already in flight and then observes [`TransportError::Disconnected`].

use std::sync::atomic::Ordering;
use std::sync::Arc;

use thiserror::Error;

use crate::layout::{
    self, peer_state, transport_hdr, IPC_MAGIC, IPC_VERSION, RECORD_ALIGN,
};
use crate::ring::{MsgRing, PopError, PushError};
use crate::shmem::{SharedMemory, ShmemError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("transport region is not a mica transport (bad magic or version)")]
    BadRegion,
    #[error("peer disconnected")]
    Disconnected,
    #[error("message too large for the transport ring")]
    TooLarge,
    #[error("transport ring corrupted")]
    Corrupt,
    #[error(transparent)]
    Shmem(#[from] ShmemError),
}

/// Ring capacities for a transport region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransportConfig {
    pub to_gpu_capacity: u32,
    pub to_client_capacity: u32,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            to_gpu_capacity: 64 * 1024,
            to_client_capacity: 64 * 1024,
        }
    }
}

impl TransportConfig {
    fn validate(&self) -> Result<(), TransportError> {
        let ok = |cap: u32| cap > 0 && cap as usize % RECORD_ALIGN == 0;
        if ok(self.to_gpu_capacity) && ok(self.to_client_capacity) {
            Ok(())
        } else {
            Err(TransportError::BadRegion)
        }
    }
}

pub struct Transport;

impl Transport {
    /// Allocate and initialize a transport region.
    pub fn allocate(config: &TransportConfig) -> Result<Arc<SharedMemory>, TransportError> {
        config.validate()?;
        let to_gpu = config.to_gpu_capacity as usize;
        let to_client = config.to_client_capacity as usize;
        let mem = SharedMemory::alloc(layout::transport_bytes(to_gpu, to_client))?;

        MsgRing::init(
            mem.clone(),
            layout::to_gpu_ctrl_offset(),
            layout::to_gpu_data_offset(),
            config.to_gpu_capacity,
        );
        MsgRing::init(
            mem.clone(),
            layout::to_client_ctrl_offset(to_gpu),
            layout::to_client_data_offset(to_gpu),
            config.to_client_capacity,
        );

        hdr(&mem, transport_hdr::TO_GPU_CAPACITY).store(config.to_gpu_capacity, Ordering::Relaxed);
        hdr(&mem, transport_hdr::TO_CLIENT_CAPACITY)
            .store(config.to_client_capacity, Ordering::Relaxed);
        hdr(&mem, transport_hdr::CLIENT_STATE).store(peer_state::ATTACHED, Ordering::Relaxed);
        hdr(&mem, transport_hdr::SERVER_STATE).store(peer_state::ATTACHED, Ordering::Relaxed);
        hdr(&mem, transport_hdr::VERSION).store(IPC_VERSION, Ordering::Relaxed);
        hdr(&mem, transport_hdr::MAGIC).store(IPC_MAGIC, Ordering::Release);
        Ok(mem)
    }

    /// Attach the content-process end.
    pub fn client(mem: Arc<SharedMemory>) -> Result<TransportClient, TransportError> {
        let (send, recv) = attach_rings(&mem)?;
        Ok(TransportClient {
            end: TransportEnd {
                mem,
                send,
                recv,
                local_state: transport_hdr::CLIENT_STATE,
                peer_state: transport_hdr::SERVER_STATE,
            },
        })
    }

    /// Attach the GPU-process end.
    pub fn server(mem: Arc<SharedMemory>) -> Result<TransportServer, TransportError> {
        let (to_gpu, to_client) = attach_rings(&mem)?;
        Ok(TransportServer {
            end: TransportEnd {
                mem,
                send: to_client,
                recv: to_gpu,
                local_state: transport_hdr::SERVER_STATE,
                peer_state: transport_hdr::CLIENT_STATE,
            },
        })
    }
}

fn hdr(mem: &SharedMemory, word: usize) -> &std::sync::atomic::AtomicU32 {
    mem.ctrl_word(word * 4)
}

fn attach_rings(mem: &Arc<SharedMemory>) -> Result<(MsgRing, MsgRing), TransportError> {
    if hdr(mem, transport_hdr::MAGIC).load(Ordering::Acquire) != IPC_MAGIC
        || hdr(mem, transport_hdr::VERSION).load(Ordering::Relaxed) != IPC_VERSION
    {
        return Err(TransportError::BadRegion);
    }
    let to_gpu_cap = hdr(mem, transport_hdr::TO_GPU_CAPACITY).load(Ordering::Relaxed) as usize;
    let to_gpu = MsgRing::attach(
        mem.clone(),
        layout::to_gpu_ctrl_offset(),
        layout::to_gpu_data_offset(),
    );
    let to_client = MsgRing::attach(
        mem.clone(),
        layout::to_client_ctrl_offset(to_gpu_cap),
        layout::to_client_data_offset(to_gpu_cap),
    );
    Ok((to_gpu, to_client))
}

#[derive(Debug)]
struct TransportEnd {
    mem: Arc<SharedMemory>,
    send: MsgRing,
    recv: MsgRing,
    local_state: usize,
    peer_state: usize,
}

impl TransportEnd {
    fn peer_closed(&self) -> bool {
        hdr(&self.mem, self.peer_state).load(Ordering::Acquire) == peer_state::CLOSED
    }

    fn closed(&self) -> bool {
        hdr(&self.mem, self.local_state).load(Ordering::Acquire) == peer_state::CLOSED
    }

    fn close(&self) {
        hdr(&self.mem, self.local_state).store(peer_state::CLOSED, Ordering::Release);
    }

    /// Push one message, waiting for ring space.
    ///
    /// Blocks (yielding) while the ring is full so a slow consumer exerts
    /// backpressure on the producer; a dead peer unblocks with
    /// `Disconnected` instead of wedging the caller forever.
    fn send(&self, payload: &[u8]) -> Result<(), TransportError> {
        loop {
            if self.closed() || self.peer_closed() {
                return Err(TransportError::Disconnected);
            }
            match self.send.try_push(payload) {
                Ok(()) => return Ok(()),
                Err(PushError::TooLarge) => return Err(TransportError::TooLarge),
                Err(PushError::Full) => std::thread::yield_now(),
            }
        }
    }

    /// Pop one message if available.
    ///
    /// Returns `Ok(None)` when the ring is momentarily empty. Once the peer
    /// has closed *and* the ring is drained, returns `Disconnected`.
    fn recv(&self) -> Result<Option<Vec<u8>>, TransportError> {
        match self.recv.try_pop() {
            Ok(msg) => Ok(Some(msg)),
            Err(PopError::Corrupt) => Err(TransportError::Corrupt),
            Err(PopError::Empty) => {
                if self.peer_closed() || self.closed() {
                    Err(TransportError::Disconnected)
                } else {
                    Ok(None)
                }
            }
        }
    }
}

impl Drop for TransportEnd {
    fn drop(&mut self) {
        self.close();
    }
}

/// Content-process end of a channel transport.
#[derive(Debug)]
pub struct TransportClient {
    end: TransportEnd,
}

impl TransportClient {
    /// Send one encoded request to the GPU process.
    pub fn send(&self, payload: &[u8]) -> Result<(), TransportError> {
        self.end.send(payload)
    }

    /// Receive one encoded event, if any is queued.
    pub fn recv(&self) -> Result<Option<Vec<u8>>, TransportError> {
        self.end.recv()
    }

    /// The backing region (for re-transmitting the transport handle).
    pub fn region(&self) -> Arc<SharedMemory> {
        self.end.mem.clone()
    }

    /// Mark this end closed. The peer observes it after draining.
    pub fn close(&self) {
        self.end.close()
    }

    /// Whether the peer has marked its end closed.
    pub fn peer_closed(&self) -> bool {
        self.end.peer_closed()
    }
}

/// GPU-process end of a channel transport.
pub struct TransportServer {
    end: TransportEnd,
}

impl TransportServer {
    /// Send one encoded event to the content process.
    pub fn send(&self, payload: &[u8]) -> Result<(), TransportError> {
        self.end.send(payload)
    }

    /// Receive one encoded request, if any is queued.
    pub fn recv(&self) -> Result<Option<Vec<u8>>, TransportError> {
        self.end.recv()
    }

    /// Mark this end closed. The peer observes it after draining.
    pub fn close(&self) {
        self.end.close()
    }

    /// Whether the peer has marked its end closed.
    pub fn peer_closed(&self) -> bool {
        self.end.peer_closed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_and_reply_cross_the_region() {
        let mem = Transport::allocate(&TransportConfig::default()).unwrap();
        let client = Transport::client(mem.clone()).unwrap();
        let server = Transport::server(mem).unwrap();

        client.send(b"ping").unwrap();
        assert_eq!(server.recv().unwrap().unwrap(), b"ping");
        server.send(b"pong").unwrap();
        assert_eq!(client.recv().unwrap().unwrap(), b"pong");
        assert!(client.recv().unwrap().is_none());
    }

    #[test]
    fn close_drains_before_disconnect() {
        let mem = Transport::allocate(&TransportConfig::default()).unwrap();
        let client = Transport::client(mem.clone()).unwrap();
        let server = Transport::server(mem).unwrap();

        client.send(b"last words").unwrap();
        client.close();

        // The queued message is still delivered, then the loss is reported.
        assert_eq!(server.recv().unwrap().unwrap(), b"last words");
        assert_eq!(server.recv().unwrap_err(), TransportError::Disconnected);
        assert_eq!(server.send(b"too late").unwrap_err(), TransportError::Disconnected);
    }

    #[test]
    fn drop_counts_as_close() {
        let mem = Transport::allocate(&TransportConfig::default()).unwrap();
        let client = Transport::client(mem.clone()).unwrap();
        let server = Transport::server(mem).unwrap();

        drop(client);
        assert_eq!(server.recv().unwrap_err(), TransportError::Disconnected);
    }

    #[test]
    fn attach_rejects_foreign_region() {
        let mem = SharedMemory::alloc(1024).unwrap();
        assert!(matches!(
            Transport::client(mem),
            Err(TransportError::BadRegion)
        ));
    }
}
