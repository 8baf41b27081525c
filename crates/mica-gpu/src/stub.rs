//! GPU-process half of one command buffer endpoint.
//!
//! The stub owns the command ring consumer, the endpoint's transfer buffers,
//! and the error latch. Endpoint errors are terminal: once `error` is set the
//! stub keeps reporting it until the endpoint is destroyed, and the owning
//! side decides whether to recreate it.

use mica_ipc::cmdring::{self, CmdRingConsumer, CmdRingFault};
use mica_ipc::shmem::{HandleBroker, ShmemHandle};
use mica_proto::{CallFault, EndpointError, Size, State};

use crate::sink::CommandSink;

/// Non-owning borrow of a parent endpoint's texture namespace.
///
/// The generation pins the exact endpoint that was alive at creation time; a
/// recycled routing id will not match.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ParentLink {
    pub route: u32,
    pub generation: u32,
    pub texture_id: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    /// Created, no ring yet.
    Initialized,
    /// Ring allocated, accepting flushes.
    Running,
    /// Torn down; every operation is an invalid-handle fault.
    Destroyed,
}

pub(crate) enum StubSurface {
    View { view_id: u32 },
    Offscreen { size: Size, parent: Option<ParentLink> },
}

pub(crate) struct CommandBufferStub {
    route: u32,
    surface: StubSurface,
    lifecycle: Lifecycle,
    error: Option<EndpointError>,
    ring: Option<CmdRingConsumer>,
    ring_handle: Option<ShmemHandle>,
    token: u32,
    transfers: crate::transfer::TransferBufferRegistry,
    sink: Box<dyn CommandSink>,
}

impl CommandBufferStub {
    pub(crate) fn new_view(route: u32, view_id: u32, sink: Box<dyn CommandSink>) -> Self {
        Self::new(route, StubSurface::View { view_id }, sink)
    }

    pub(crate) fn new_offscreen(
        route: u32,
        size: Size,
        parent: Option<ParentLink>,
        sink: Box<dyn CommandSink>,
    ) -> Self {
        Self::new(route, StubSurface::Offscreen { size, parent }, sink)
    }

    fn new(route: u32, surface: StubSurface, sink: Box<dyn CommandSink>) -> Self {
        Self {
            route,
            surface,
            lifecycle: Lifecycle::Initialized,
            error: None,
            ring: None,
            ring_handle: None,
            token: 0,
            transfers: crate::transfer::TransferBufferRegistry::new(),
            sink,
        }
    }

    pub(crate) fn view_id(&self) -> Option<u32> {
        match &self.surface {
            StubSurface::View { view_id } => Some(*view_id),
            StubSurface::Offscreen { .. } => None,
        }
    }

    pub(crate) fn is_destroyed(&self) -> bool {
        self.lifecycle == Lifecycle::Destroyed
    }

    pub(crate) fn ring_initialized(&self) -> bool {
        self.ring_handle.is_some()
    }

    pub(crate) fn parent_link(&self) -> Option<ParentLink> {
        match &self.surface {
            StubSurface::Offscreen { parent, .. } => *parent,
            StubSurface::View { .. } => None,
        }
    }

    /// Latch a terminal endpoint error. The first error wins.
    pub(crate) fn mark_error(&mut self, error: EndpointError) {
        if self.error.is_none() {
            self.error = Some(error);
        }
    }

    pub(crate) fn state(&self) -> State {
        State {
            get_offset: self.ring.as_ref().map_or(0, CmdRingConsumer::get_offset),
            token: self.token,
            error: self.error,
        }
    }

    /// Allocate the command ring, or return the existing one.
    pub(crate) fn initialize(
        &mut self,
        size_hint: u32,
        default_bytes: u32,
        broker: &HandleBroker,
    ) -> Result<ShmemHandle, CallFault> {
        if self.is_destroyed() {
            return Err(CallFault::InvalidHandle);
        }
        if let Some(error) = self.error {
            return Err(CallFault::Endpoint(error));
        }
        if let Some(handle) = self.ring_handle {
            return Ok(handle);
        }

        let bytes = if size_hint == 0 { default_bytes } else { size_hint };
        let region =
            cmdring::allocate(bytes as usize).map_err(|_| CallFault::ResourceExhausted)?;
        let consumer = CmdRingConsumer::attach(region.clone())
            .map_err(|_| CallFault::ResourceExhausted)?;
        let handle = broker.transmit(region);

        self.ring = Some(consumer);
        self.ring_handle = Some(handle);
        self.lifecycle = Lifecycle::Running;
        Ok(handle)
    }

    /// Consume commands up to `put_offset` and return the resulting state.
    ///
    /// Never fails at the call level: protocol violations latch an endpoint
    /// error which rides back inside the state, exactly like the synchronous
    /// and asynchronous flush replies expect.
    pub(crate) fn flush(&mut self, put_offset: u32) -> State {
        if self.error.is_some() || self.is_destroyed() {
            return self.state();
        }
        let Some(ring) = self.ring.as_mut() else {
            // Flushing an endpoint that never initialized its ring.
            self.mark_error(EndpointError::InvalidOffset);
            return self.state();
        };

        match ring.drain_to(put_offset) {
            Ok(records) => {
                for record in &records {
                    if let Err(err) = self.sink.consume(record) {
                        tracing::warn!(route = self.route, error = %err, "command rejected");
                        self.mark_error(EndpointError::MalformedCommand);
                        break;
                    }
                }
                if self.error.is_none() {
                    self.token = self.token.wrapping_add(1);
                }
            }
            Err(CmdRingFault::InvalidOffset) => self.mark_error(EndpointError::InvalidOffset),
            Err(CmdRingFault::MalformedCommand) => {
                self.mark_error(EndpointError::MalformedCommand)
            }
        }
        self.state()
    }

    pub(crate) fn create_transfer_buffer(
        &mut self,
        size: u32,
        max_bytes: u32,
        broker: &HandleBroker,
    ) -> Result<i32, CallFault> {
        if self.is_destroyed() {
            return Err(CallFault::InvalidHandle);
        }
        self.transfers.create(size, max_bytes, broker)
    }

    pub(crate) fn get_transfer_buffer(&self, id: i32) -> Result<(ShmemHandle, u32), CallFault> {
        if self.is_destroyed() {
            return Err(CallFault::InvalidHandle);
        }
        self.transfers.get(id)
    }

    pub(crate) fn destroy_transfer_buffer(
        &mut self,
        id: i32,
        broker: &HandleBroker,
    ) -> Result<(), CallFault> {
        if self.is_destroyed() {
            return Err(CallFault::InvalidHandle);
        }
        self.transfers.destroy(id, broker)
    }

    /// Reallocate the offscreen frame buffer; prior paint results are gone.
    pub(crate) fn resize_offscreen(&mut self, new_size: Size) -> Result<(), CallFault> {
        if self.is_destroyed() {
            return Err(CallFault::InvalidHandle);
        }
        match &mut self.surface {
            StubSurface::Offscreen { size, .. } => {
                tracing::debug!(
                    route = self.route,
                    old_width = size.width,
                    old_height = size.height,
                    width = new_size.width,
                    height = new_size.height,
                    "offscreen frame buffer reallocated"
                );
                *size = new_size;
                Ok(())
            }
            StubSurface::View { .. } => Err(CallFault::Unsupported),
        }
    }

    /// Release the ring and every transfer buffer.
    pub(crate) fn destroy(&mut self, broker: &HandleBroker) {
        if let Some(handle) = self.ring_handle.take() {
            broker.revoke(handle);
        }
        self.ring = None;
        self.transfers.destroy_all(broker);
        self.lifecycle = Lifecycle::Destroyed;
    }
}
