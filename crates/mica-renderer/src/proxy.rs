//! Producer half of one command buffer endpoint.
//!
//! The proxy owns the ring producer after `initialize`, tracks the endpoint's
//! last known state, and wraps the sync/async call pairs. Both flavors of
//! flush share one path: publish the put offset, tell the GPU process; the
//! synchronous variant simply waits for the state to come back inline, which
//! keeps the flow control logic in one place.

use std::sync::Arc;

use mica_ipc::cmdring::{CmdRingProducer, CmdWriteError};
use mica_proto::{CallError, Event, Request, Size, State, ROUTE_CONTROL};

use crate::channel_host::{GpuChannelHost, RouteShared};

#[derive(Debug)]
pub struct CommandBufferProxy {
    channel: GpuChannelHost,
    route: u32,
    shared: Arc<RouteShared>,
    ring: Option<CmdRingProducer>,
    last_state: State,
    destroyed: bool,
}

impl CommandBufferProxy {
    pub(crate) fn new(channel: GpuChannelHost, route: u32, shared: Arc<RouteShared>) -> Self {
        Self {
            channel,
            route,
            shared,
            ring: None,
            last_state: State::default(),
            destroyed: false,
        }
    }

    /// The routing id naming this endpoint on its channel.
    pub fn route(&self) -> u32 {
        self.route
    }

    /// Map the endpoint's command ring. `size_bytes == 0` accepts the
    /// service default.
    pub fn initialize(&mut self, size_bytes: u32) -> Result<(), CallError> {
        match self
            .channel
            .call(self.route, &Request::Initialize { size_bytes })?
        {
            Event::Initialized { ring } => {
                let region = self
                    .channel
                    .broker()
                    .resolve(mica_ipc::shmem::ShmemHandle::from_raw(ring))
                    .ok_or(CallError::InvalidHandle)?;
                let producer =
                    CmdRingProducer::attach(region).map_err(|_| CallError::UnexpectedReply)?;
                self.ring = Some(producer);
                Ok(())
            }
            _ => Err(CallError::UnexpectedReply),
        }
    }

    /// Append one command record, flushing for space when the ring is full.
    ///
    /// Blocking here is the producer-side flow control: a producer that
    /// outruns the consumer waits for `get` to advance instead of corrupting
    /// unconsumed records.
    pub fn write_command(&mut self, payload: &[u8]) -> Result<(), CallError> {
        loop {
            let ring = self.ring.as_mut().ok_or(CallError::Unsupported)?;
            match ring.write(payload) {
                Ok(()) => return Ok(()),
                Err(CmdWriteError::TooLarge) => return Err(CallError::ResourceExhausted),
                Err(CmdWriteError::Full) => {
                    let state = self.flush()?;
                    if let Some(error) = state.error {
                        return Err(CallError::Endpoint(error));
                    }
                }
            }
        }
    }

    /// The producer's current put offset.
    pub fn put_offset(&self) -> u32 {
        self.ring.as_ref().map_or(0, CmdRingProducer::put_offset)
    }

    /// Publish and synchronously consume everything up to the put offset.
    ///
    /// An endpoint error rides back inside the state rather than failing the
    /// call; transport loss fails the call.
    pub fn flush(&mut self) -> Result<State, CallError> {
        let ring = self.ring.as_mut().ok_or(CallError::Unsupported)?;
        let put_offset = ring.publish();
        match self
            .channel
            .call(self.route, &Request::Flush { put_offset })?
        {
            Event::StateReply { state } => {
                self.merge(state);
                Ok(state)
            }
            _ => Err(CallError::UnexpectedReply),
        }
    }

    /// Publish and return immediately; the resulting state arrives later as
    /// an `UpdateState` event (see [`state`](Self::state)).
    pub fn async_flush(&mut self) -> Result<(), CallError> {
        let ring = self.ring.as_mut().ok_or(CallError::Unsupported)?;
        let put_offset = ring.publish();
        self.channel
            .send_async(self.route, &Request::AsyncFlush { put_offset })
    }

    /// Synchronously read the endpoint's state without publishing anything.
    pub fn get_state(&mut self) -> Result<State, CallError> {
        match self.channel.call(self.route, &Request::GetState)? {
            Event::StateReply { state } => {
                self.merge(state);
                Ok(state)
            }
            _ => Err(CallError::UnexpectedReply),
        }
    }

    /// Request a state update without blocking.
    pub fn async_get_state(&self) -> Result<(), CallError> {
        self.channel.send_async(self.route, &Request::AsyncGetState)
    }

    /// Latest state known on this side, merging sync replies with whatever
    /// `UpdateState` traffic the channel has pumped.
    pub fn state(&self) -> State {
        let shared = self.shared.latest_state();
        if shared.supersedes(&self.last_state) || shared.error.is_some() {
            shared
        } else {
            self.last_state
        }
    }

    /// Drain pending channel traffic, then report [`state`](Self::state).
    pub fn poll_state(&mut self) -> Result<State, CallError> {
        self.channel.pump()?;
        Ok(self.state())
    }

    /// Whether the GPU process asked for a repaint since the last call.
    pub fn take_repaint_pending(&self) -> bool {
        self.shared.take_repaint()
    }

    pub fn create_transfer_buffer(&self, size: u32) -> Result<i32, CallError> {
        match self
            .channel
            .call(self.route, &Request::CreateTransferBuffer { size })?
        {
            Event::TransferBufferCreated { id } => Ok(id),
            _ => Err(CallError::UnexpectedReply),
        }
    }

    /// Resolve a transfer buffer id to its mapped region and size.
    pub fn get_transfer_buffer(
        &self,
        id: i32,
    ) -> Result<(Arc<mica_ipc::shmem::SharedMemory>, u32), CallError> {
        match self
            .channel
            .call(self.route, &Request::GetTransferBuffer { id })?
        {
            Event::TransferBufferInfo { handle, size } => {
                let region = self
                    .channel
                    .broker()
                    .resolve(mica_ipc::shmem::ShmemHandle::from_raw(handle))
                    .ok_or(CallError::InvalidHandle)?;
                Ok((region, size))
            }
            _ => Err(CallError::UnexpectedReply),
        }
    }

    pub fn destroy_transfer_buffer(&self, id: i32) -> Result<(), CallError> {
        match self
            .channel
            .call(self.route, &Request::DestroyTransferBuffer { id })?
        {
            Event::Done => Ok(()),
            _ => Err(CallError::UnexpectedReply),
        }
    }

    /// Reallocate the offscreen frame buffer, invalidating prior paints.
    pub fn resize_offscreen_frame_buffer(&self, size: Size) -> Result<(), CallError> {
        match self
            .channel
            .call(self.route, &Request::ResizeOffscreenFrameBuffer { size })?
        {
            Event::Done => Ok(()),
            _ => Err(CallError::UnexpectedReply),
        }
    }

    /// Tear the endpoint down synchronously.
    pub fn destroy(mut self) -> Result<(), CallError> {
        self.destroyed = true;
        self.channel.unregister_route(self.route);
        match self.channel.call(
            ROUTE_CONTROL,
            &Request::DestroyCommandBuffer { route: self.route },
        )? {
            Event::Done => Ok(()),
            _ => Err(CallError::UnexpectedReply),
        }
    }

    fn merge(&mut self, state: State) {
        if state.supersedes(&self.last_state) || state.error.is_some() {
            self.last_state = state;
        }
    }
}

impl Drop for CommandBufferProxy {
    fn drop(&mut self) {
        if self.destroyed {
            return;
        }
        self.channel.unregister_route(self.route);
        // Best effort, mirroring the destructor-sends-destroy contract; the
        // channel teardown path covers the rest if this fails.
        let _ = self.channel.send_async(
            ROUTE_CONTROL,
            &Request::DestroyCommandBuffer { route: self.route },
        );
    }
}
