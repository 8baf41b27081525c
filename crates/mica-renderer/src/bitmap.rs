//! Shared bitmap transports for paint traffic.
//!
//! After a paint is submitted, the GPU process owns the bitmap's bytes until
//! it acknowledges the paint; rewriting the region earlier would race the
//! blit. [`TransportBitmap`] encodes that ownership hand-off in the API: the
//! in-flight flag is set at submission and cleared by the ACK (or by a
//! terminal failure of the paint call).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use thiserror::Error;

use mica_ipc::shmem::{HandleBroker, SharedMemory, ShmemHandle};
use mica_proto::{CallError, Size};

const BYTES_PER_PIXEL: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum BitmapError {
    /// The GPU process has not acknowledged the last paint using this bitmap.
    #[error("bitmap is in flight until the paint is acked")]
    InFlight,
    /// Pixel data does not fit the allocated region.
    #[error("pixel data exceeds the bitmap region")]
    TooLarge,
}

/// A BGRA bitmap in shared memory whose handle has been given to the GPU
/// process.
pub struct TransportBitmap {
    broker: HandleBroker,
    region: Arc<SharedMemory>,
    handle: ShmemHandle,
    size: Size,
    in_flight: Arc<AtomicBool>,
}

impl TransportBitmap {
    /// Allocate a bitmap region for `size` pixels and register its handle.
    pub fn allocate(broker: &HandleBroker, size: Size) -> Result<Self, CallError> {
        let region = SharedMemory::alloc(size.area() * BYTES_PER_PIXEL)
            .map_err(|_| CallError::ResourceExhausted)?;
        let handle = broker.transmit(region.clone());
        Ok(Self {
            broker: broker.clone(),
            region,
            handle,
            size,
            in_flight: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn size(&self) -> Size {
        self.size
    }

    pub fn handle(&self) -> ShmemHandle {
        self.handle
    }

    pub fn is_in_flight(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Write pixel bytes at `offset`. Refused while the bitmap is in flight.
    pub fn write_pixels(&self, offset: usize, bytes: &[u8]) -> Result<(), BitmapError> {
        if self.is_in_flight() {
            return Err(BitmapError::InFlight);
        }
        if offset + bytes.len() > self.region.len() {
            return Err(BitmapError::TooLarge);
        }
        self.region.write_bytes(offset, bytes);
        Ok(())
    }

    /// Copy pixel bytes out at `offset`; reads are allowed any time.
    pub fn read_pixels(&self, offset: usize, out: &mut [u8]) {
        self.region.read_bytes(offset, out);
    }

    /// Hand ownership to the GPU process for one paint.
    ///
    /// Returns the flag the ACK path clears.
    pub(crate) fn begin_paint(&self) -> Result<Arc<AtomicBool>, BitmapError> {
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(BitmapError::InFlight);
        }
        Ok(self.in_flight.clone())
    }
}

impl Drop for TransportBitmap {
    fn drop(&mut self) {
        // The GPU side resolves its own reference while dispatching a paint,
        // so withdrawing the handle never invalidates an in-progress blit.
        self.broker.revoke(self.handle);
    }
}

/// Submitting a paint can fail before reaching the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PaintError {
    #[error(transparent)]
    Bitmap(#[from] BitmapError),
    #[error(transparent)]
    Call(#[from] CallError),
}
