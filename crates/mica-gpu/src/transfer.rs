//! Transfer buffer bookkeeping for one command buffer endpoint.
//!
//! Pure table management: small integer ids mapped to shared regions the
//! producer uses for bulk payloads. Ids are assigned monotonically and never
//! recycled within an endpoint's lifetime, so a stale id can only ever miss.

use std::collections::HashMap;

use mica_ipc::shmem::{HandleBroker, SharedMemory, ShmemHandle};
use mica_proto::CallFault;

#[derive(Debug, Clone, Copy)]
struct TransferBuffer {
    handle: ShmemHandle,
    size: u32,
}

#[derive(Debug)]
pub(crate) struct TransferBufferRegistry {
    next_id: i32,
    buffers: HashMap<i32, TransferBuffer>,
}

impl TransferBufferRegistry {
    pub(crate) fn new() -> Self {
        Self {
            // 0 is never a valid id on the wire.
            next_id: 1,
            buffers: HashMap::new(),
        }
    }

    /// Map a fresh region and hand out its id.
    pub(crate) fn create(
        &mut self,
        size: u32,
        max_bytes: u32,
        broker: &HandleBroker,
    ) -> Result<i32, CallFault> {
        if size == 0 || size > max_bytes {
            return Err(CallFault::ResourceExhausted);
        }
        let region =
            SharedMemory::alloc(size as usize).map_err(|_| CallFault::ResourceExhausted)?;
        let handle = broker.transmit(region);
        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1).max(1);
        self.buffers.insert(id, TransferBuffer { handle, size });
        Ok(id)
    }

    /// Idempotent, side-effect-free lookup.
    pub(crate) fn get(&self, id: i32) -> Result<(ShmemHandle, u32), CallFault> {
        self.buffers
            .get(&id)
            .map(|b| (b.handle, b.size))
            .ok_or(CallFault::InvalidHandle)
    }

    pub(crate) fn destroy(&mut self, id: i32, broker: &HandleBroker) -> Result<(), CallFault> {
        let buffer = self.buffers.remove(&id).ok_or(CallFault::InvalidHandle)?;
        broker.revoke(buffer.handle);
        Ok(())
    }

    /// Release everything; used when the owning endpoint is destroyed.
    pub(crate) fn destroy_all(&mut self, broker: &HandleBroker) {
        for (_, buffer) in self.buffers.drain() {
            broker.revoke(buffer.handle);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_monotonic_and_never_recycled() {
        let broker = HandleBroker::new();
        let mut registry = TransferBufferRegistry::new();

        let a = registry.create(128, 1 << 20, &broker).unwrap();
        let b = registry.create(128, 1 << 20, &broker).unwrap();
        assert_eq!(a, 1);
        assert_eq!(b, 2);

        registry.destroy(a, &broker).unwrap();
        let c = registry.create(128, 1 << 20, &broker).unwrap();
        assert_eq!(c, 3, "destroyed id must not be reassigned");
    }

    #[test]
    fn destroyed_id_no_longer_resolves() {
        let broker = HandleBroker::new();
        let mut registry = TransferBufferRegistry::new();

        let id = registry.create(256, 1 << 20, &broker).unwrap();
        let (handle, size) = registry.get(id).unwrap();
        assert_eq!(size, 256);
        assert!(broker.resolve(handle).is_some());

        registry.destroy(id, &broker).unwrap();
        assert_eq!(registry.get(id), Err(CallFault::InvalidHandle));
        assert!(broker.resolve(handle).is_none(), "handle must be revoked");
        assert_eq!(registry.destroy(id, &broker), Err(CallFault::InvalidHandle));
    }

    #[test]
    fn oversized_and_zero_requests_are_exhaustion() {
        let broker = HandleBroker::new();
        let mut registry = TransferBufferRegistry::new();
        assert_eq!(
            registry.create(0, 1 << 20, &broker),
            Err(CallFault::ResourceExhausted)
        );
        assert_eq!(
            registry.create(2 << 20, 1 << 20, &broker),
            Err(CallFault::ResourceExhausted)
        );
        assert!(registry.buffers.is_empty());
    }

    #[test]
    fn destroy_all_revokes_every_handle() {
        let broker = HandleBroker::new();
        let mut registry = TransferBufferRegistry::new();
        let ids: Vec<i32> = (0..4)
            .map(|_| registry.create(64, 1 << 20, &broker).unwrap())
            .collect();
        let handles: Vec<_> = ids.iter().map(|&id| registry.get(id).unwrap().0).collect();

        registry.destroy_all(&broker);
        assert!(registry.buffers.is_empty());
        for handle in handles {
            assert!(broker.resolve(handle).is_none());
        }
    }
}
