//! Control-path client of the GPU process.
//!
//! Channel establishment, the synchronization barrier, and native view
//! registration travel over the control transport, physically separate from
//! per-channel traffic. That separation is why `synchronize` exists at all: a
//! caller that just established a channel uses the barrier to know the
//! establishment was processed before issuing dependent per-channel calls.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use mica_ipc::poll::Backoff;
use mica_ipc::shmem::{HandleBroker, SharedMemory, ShmemHandle};
use mica_ipc::transport::{Transport, TransportClient};
use mica_proto::{
    decode_event, encode_request, CallError, Event, Request, ROUTE_CONTROL,
};

use crate::channel_host::GpuChannelHost;

pub struct GpuProcessHost {
    client: TransportClient,
    broker: HandleBroker,
    next_seq: AtomicU32,
    lost: AtomicBool,
    // Control calls are strictly request/reply; serialize them so replies
    // cannot cross between callers.
    call_lock: Mutex<()>,
}

impl GpuProcessHost {
    /// Attach to the GPU process's control transport region.
    pub fn connect(region: Arc<SharedMemory>, broker: HandleBroker) -> Result<Self, CallError> {
        let client = Transport::client(region).map_err(|_| CallError::InvalidHandle)?;
        Ok(Self {
            client,
            broker,
            next_seq: AtomicU32::new(1),
            lost: AtomicBool::new(false),
            call_lock: Mutex::new(()),
        })
    }

    pub fn is_lost(&self) -> bool {
        self.lost.load(Ordering::Acquire)
    }

    fn mark_lost(&self) {
        self.lost.store(true, Ordering::Release);
    }

    fn call(&self, request: &Request) -> Result<Event, CallError> {
        if self.is_lost() {
            return Err(CallError::ChannelLost);
        }
        let _guard = self.call_lock.lock().unwrap();
        let seq = loop {
            let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
            if seq != 0 {
                break seq;
            }
        };
        self.client
            .send(&encode_request(seq, ROUTE_CONTROL, request))
            .map_err(|_| {
                self.mark_lost();
                CallError::ChannelLost
            })?;

        let mut backoff = Backoff::new();
        loop {
            match self.client.recv() {
                Ok(Some(bytes)) => {
                    let (evt_seq, _route, event) = decode_event(&bytes).map_err(|err| {
                        self.mark_lost();
                        CallError::Decode(err)
                    })?;
                    if evt_seq != seq {
                        // Control replies are strictly ordered; a stray
                        // sequence number means the two sides disagree.
                        tracing::warn!(evt_seq, seq, "mismatched control reply");
                        continue;
                    }
                    return match event {
                        Event::CallFailed { fault } => Err(fault.into()),
                        other => Ok(other),
                    };
                }
                Ok(None) => backoff.wait(),
                Err(_) => {
                    self.mark_lost();
                    return Err(CallError::ChannelLost);
                }
            }
        }
    }

    /// Get the (new or existing) channel for `renderer_id` and attach to it.
    pub fn establish_channel(&self, renderer_id: u32) -> Result<GpuChannelHost, CallError> {
        match self.call(&Request::EstablishChannel { renderer_id })? {
            Event::ChannelEstablished { channel, info } => {
                let region = self
                    .broker
                    .resolve(ShmemHandle::from_raw(channel))
                    .ok_or(CallError::InvalidHandle)?;
                let client = Transport::client(region).map_err(|_| CallError::InvalidHandle)?;
                tracing::debug!(renderer_id, "attached to gpu channel");
                Ok(GpuChannelHost::new(client, self.broker.clone(), info))
            }
            _ => Err(CallError::UnexpectedReply),
        }
    }

    /// The raw transport handle for `renderer_id`'s channel, without
    /// attaching. Lets a caller verify channel identity or forward the
    /// handle.
    pub fn establish_channel_handle(&self, renderer_id: u32) -> Result<u32, CallError> {
        match self.call(&Request::EstablishChannel { renderer_id })? {
            Event::ChannelEstablished { channel, .. } => Ok(channel),
            _ => Err(CallError::UnexpectedReply),
        }
    }

    /// Barrier: returns once the GPU process has handled every control
    /// message queued before this one.
    pub fn synchronize(&self) -> Result<(), CallError> {
        match self.call(&Request::Synchronize)? {
            Event::SynchronizeDone => Ok(()),
            _ => Err(CallError::UnexpectedReply),
        }
    }

    /// Register a native view; fire-and-forget like the rest of the
    /// host-side window bookkeeping.
    pub fn new_render_widget_host_view(
        &self,
        parent_window: u64,
        view_id: u32,
    ) -> Result<(), CallError> {
        if self.is_lost() {
            return Err(CallError::ChannelLost);
        }
        self.client
            .send(&encode_request(
                0,
                ROUTE_CONTROL,
                &Request::NewRenderWidgetHostView {
                    parent_window,
                    view_id,
                },
            ))
            .map_err(|_| {
                self.mark_lost();
                CallError::ChannelLost
            })
    }

    /// Native window id lookup; fails `Unsupported` when the GPU process
    /// does not expose one.
    pub fn get_view_xid(&self, view_id: u32) -> Result<u64, CallError> {
        match self.call(&Request::GetViewXid { view_id })? {
            Event::ViewXid { xid } => Ok(xid),
            _ => Err(CallError::UnexpectedReply),
        }
    }
}
