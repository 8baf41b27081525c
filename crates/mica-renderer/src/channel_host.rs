//! Content-process end of one GPU channel.
//!
//! All routed traffic for a renderer shares this transport: command buffer
//! calls, backing store paints, and the unsolicited state/repaint events the
//! GPU pushes back. Synchronous calls are correlated by sequence number; the
//! caller pumps the inbound ring while it waits, so traffic for other routes
//! keeps flowing even though the caller itself is blocked. A blocked call
//! therefore stalls its own route only, never the channel.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use mica_ipc::poll::Backoff;
use mica_ipc::shmem::HandleBroker;
use mica_ipc::transport::TransportClient;
use mica_proto::{
    decode_event, encode_request, CallError, Event, GpuInfo, Rect, Request, Size, State,
    PARENT_NONE, ROUTE_CONTROL,
};

use crate::bitmap::{PaintError, TransportBitmap};
use crate::proxy::CommandBufferProxy;

/// Client-side record of one route's unsolicited traffic.
#[derive(Debug)]
pub(crate) struct RouteShared {
    state: Mutex<State>,
    repaint: AtomicBool,
}

impl RouteShared {
    fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
            repaint: AtomicBool::new(false),
        }
    }

    /// Merge an update, discarding anything older than what we have.
    pub(crate) fn merge_state(&self, update: State) {
        let mut state = self.state.lock().unwrap();
        if update.supersedes(&state) || update.error.is_some() {
            *state = update;
        }
    }

    pub(crate) fn latest_state(&self) -> State {
        *self.state.lock().unwrap()
    }

    pub(crate) fn set_repaint(&self) {
        self.repaint.store(true, Ordering::Release);
    }

    pub(crate) fn take_repaint(&self) -> bool {
        self.repaint.swap(false, Ordering::AcqRel)
    }
}

/// Completion cell for an ACKed paint.
#[derive(Debug)]
struct AckCell {
    done: AtomicBool,
    result: Mutex<Option<Result<(), CallError>>>,
    release: Arc<AtomicBool>,
}

impl AckCell {
    fn new(release: Arc<AtomicBool>) -> Self {
        Self {
            done: AtomicBool::new(false),
            result: Mutex::new(None),
            release,
        }
    }

    fn complete(&self, result: Result<(), CallError>) {
        *self.result.lock().unwrap() = Some(result);
        // Either way the GPU process is finished with the bitmap.
        self.release.store(false, Ordering::Release);
        self.done.store(true, Ordering::Release);
    }

    fn result(&self) -> Option<Result<(), CallError>> {
        if self.done.load(Ordering::Acquire) {
            *self.result.lock().unwrap()
        } else {
            None
        }
    }
}

/// An in-flight paint; resolved when the GPU process ACKs (or fails) it.
pub struct PaintPending {
    cell: Arc<AckCell>,
}

impl PaintPending {
    pub fn is_done(&self) -> bool {
        self.cell.done.load(Ordering::Acquire)
    }

    pub fn try_result(&self) -> Option<Result<(), CallError>> {
        self.cell.result()
    }

    /// Block until the ACK arrives, pumping the channel meanwhile.
    pub fn wait(&self, channel: &GpuChannelHost) -> Result<(), CallError> {
        let mut backoff = Backoff::new();
        loop {
            if let Some(result) = self.cell.result() {
                return result;
            }
            channel.pump()?;
            backoff.wait();
        }
    }
}

#[derive(Default, Debug)]
struct PumpState {
    /// Replies received while some other call was pumping.
    parked: HashMap<u32, Event>,
    routes: HashMap<u32, Arc<RouteShared>>,
    acks: HashMap<u32, Arc<AckCell>>,
}

#[derive(Debug)]
struct ChannelHostInner {
    client: TransportClient,
    broker: HandleBroker,
    info: GpuInfo,
    next_seq: AtomicU32,
    lost: AtomicBool,
    pump: Mutex<PumpState>,
}

/// Handle to one established GPU channel. Clones share the connection.
#[derive(Clone, Debug)]
pub struct GpuChannelHost {
    inner: Arc<ChannelHostInner>,
}

impl GpuChannelHost {
    pub(crate) fn new(client: TransportClient, broker: HandleBroker, info: GpuInfo) -> Self {
        Self {
            inner: Arc::new(ChannelHostInner {
                client,
                broker,
                info,
                next_seq: AtomicU32::new(1),
                lost: AtomicBool::new(false),
                pump: Mutex::new(PumpState::default()),
            }),
        }
    }

    pub fn info(&self) -> &GpuInfo {
        &self.inner.info
    }

    pub fn broker(&self) -> &HandleBroker {
        &self.inner.broker
    }

    /// Whether the transport to the GPU process is gone.
    pub fn is_lost(&self) -> bool {
        self.inner.lost.load(Ordering::Acquire)
    }

    /// Explicitly sever the channel (renderer teardown path).
    pub fn close(&self) {
        self.inner.client.close();
        self.mark_lost();
    }

    fn next_seq(&self) -> u32 {
        loop {
            let seq = self.inner.next_seq.fetch_add(1, Ordering::Relaxed);
            if seq != 0 {
                return seq;
            }
        }
    }

    fn mark_lost(&self) {
        self.inner.lost.store(true, Ordering::Release);
        let mut pump = self.inner.pump.lock().unwrap();
        for (_, cell) in pump.acks.drain() {
            cell.complete(Err(CallError::ChannelLost));
        }
        pump.parked.clear();
    }

    pub(crate) fn register_route(&self, route: u32) -> Arc<RouteShared> {
        let shared = Arc::new(RouteShared::new());
        self.inner
            .pump
            .lock()
            .unwrap()
            .routes
            .insert(route, shared.clone());
        shared
    }

    pub(crate) fn unregister_route(&self, route: u32) {
        self.inner.pump.lock().unwrap().routes.remove(&route);
    }

    /// Fire-and-forget send.
    pub(crate) fn send_async(&self, route: u32, request: &Request) -> Result<(), CallError> {
        if self.is_lost() {
            return Err(CallError::ChannelLost);
        }
        self.inner
            .client
            .send(&encode_request(0, route, request))
            .map_err(|_| {
                self.mark_lost();
                CallError::ChannelLost
            })
    }

    /// Synchronous call: send, then pump inbound traffic until the correlated
    /// reply arrives. `CallFailed` replies surface as errors.
    pub(crate) fn call(&self, route: u32, request: &Request) -> Result<Event, CallError> {
        if self.is_lost() {
            return Err(CallError::ChannelLost);
        }
        let seq = self.next_seq();
        self.inner
            .client
            .send(&encode_request(seq, route, request))
            .map_err(|_| {
                self.mark_lost();
                CallError::ChannelLost
            })?;

        let mut backoff = Backoff::new();
        loop {
            {
                let mut pump = self.inner.pump.lock().unwrap();
                if let Some(event) = pump.parked.remove(&seq) {
                    return finish_call(event);
                }
                match self.inner.client.recv() {
                    Ok(Some(bytes)) => {
                        backoff.reset();
                        let (evt_seq, evt_route, event) = match decode_event(&bytes) {
                            Ok(decoded) => decoded,
                            Err(err) => {
                                drop(pump);
                                self.mark_lost();
                                return Err(CallError::Decode(err));
                            }
                        };
                        if evt_seq == seq {
                            return finish_call(event);
                        }
                        dispatch_unsolicited(&mut pump, evt_seq, evt_route, event);
                        continue;
                    }
                    Ok(None) => {}
                    Err(_) => {
                        drop(pump);
                        self.mark_lost();
                        return Err(CallError::ChannelLost);
                    }
                }
            }
            backoff.wait();
        }
    }

    /// Drain whatever inbound traffic is queued, without blocking.
    pub fn pump(&self) -> Result<(), CallError> {
        if self.is_lost() {
            return Err(CallError::ChannelLost);
        }
        loop {
            let mut pump = self.inner.pump.lock().unwrap();
            match self.inner.client.recv() {
                Ok(Some(bytes)) => {
                    let (evt_seq, evt_route, event) = match decode_event(&bytes) {
                        Ok(decoded) => decoded,
                        Err(err) => {
                            drop(pump);
                            self.mark_lost();
                            return Err(CallError::Decode(err));
                        }
                    };
                    dispatch_unsolicited(&mut pump, evt_seq, evt_route, event);
                }
                Ok(None) => return Ok(()),
                Err(_) => {
                    drop(pump);
                    self.mark_lost();
                    return Err(CallError::ChannelLost);
                }
            }
        }
    }

    /// Create a command buffer endpoint rendering into a registered view.
    pub fn create_view_command_buffer(
        &self,
        view_id: u32,
    ) -> Result<CommandBufferProxy, CallError> {
        match self.call(
            ROUTE_CONTROL,
            &Request::CreateViewCommandBuffer { view_id },
        )? {
            Event::CommandBufferCreated { route } => Ok(self.new_proxy(route)),
            _ => Err(CallError::UnexpectedReply),
        }
    }

    /// Create an offscreen endpoint, optionally borrowing a parent's texture
    /// namespace.
    pub fn create_offscreen_command_buffer(
        &self,
        parent_route: Option<u32>,
        size: Size,
        parent_texture_id: u32,
    ) -> Result<CommandBufferProxy, CallError> {
        match self.call(
            ROUTE_CONTROL,
            &Request::CreateOffscreenCommandBuffer {
                parent_route: parent_route.unwrap_or(PARENT_NONE),
                size,
                parent_texture_id,
            },
        )? {
            Event::CommandBufferCreated { route } => Ok(self.new_proxy(route)),
            _ => Err(CallError::UnexpectedReply),
        }
    }

    fn new_proxy(&self, route: u32) -> CommandBufferProxy {
        let shared = self.register_route(route);
        CommandBufferProxy::new(self.clone(), route, shared)
    }

    /// Allocate (or resize, discarding contents) a backing store.
    pub fn new_backing_store(&self, route: u32, size: Size) -> Result<(), CallError> {
        match self.call(route, &Request::NewBackingStore { size })? {
            Event::Done => Ok(()),
            _ => Err(CallError::UnexpectedReply),
        }
    }

    /// Allocate (or resize, discarding contents) a video layer.
    pub fn new_video_layer(&self, route: u32, size: Size) -> Result<(), CallError> {
        match self.call(route, &Request::NewVideoLayer { size })? {
            Event::Done => Ok(()),
            _ => Err(CallError::UnexpectedReply),
        }
    }

    /// Submit a paint. The bitmap stays locked until the ACK.
    pub fn paint_to_backing_store(
        &self,
        route: u32,
        process_id: u32,
        bitmap: &TransportBitmap,
        bitmap_rect: Rect,
        copy_rects: Vec<Rect>,
    ) -> Result<PaintPending, PaintError> {
        let request = Request::PaintToBackingStore {
            process_id,
            bitmap: bitmap.handle().raw(),
            bitmap_rect,
            copy_rects,
        };
        self.submit_paint(route, bitmap, request)
    }

    /// Submit a video frame. Same ACK discipline as backing store paints.
    pub fn paint_to_video_layer(
        &self,
        route: u32,
        process_id: u32,
        bitmap: &TransportBitmap,
        bitmap_rect: Rect,
    ) -> Result<PaintPending, PaintError> {
        let request = Request::PaintToVideoLayer {
            process_id,
            bitmap: bitmap.handle().raw(),
            bitmap_rect,
        };
        self.submit_paint(route, bitmap, request)
    }

    fn submit_paint(
        &self,
        route: u32,
        bitmap: &TransportBitmap,
        request: Request,
    ) -> Result<PaintPending, PaintError> {
        if self.is_lost() {
            return Err(PaintError::Call(CallError::ChannelLost));
        }
        let release = bitmap.begin_paint()?;
        let seq = self.next_seq();
        let cell = Arc::new(AckCell::new(release.clone()));
        self.inner.pump.lock().unwrap().acks.insert(seq, cell.clone());

        if let Err(err) = self.inner.client.send(&encode_request(seq, route, &request)) {
            tracing::warn!(route, error = %err, "paint submission failed");
            self.inner.pump.lock().unwrap().acks.remove(&seq);
            release.store(false, Ordering::Release);
            self.mark_lost();
            return Err(PaintError::Call(CallError::ChannelLost));
        }
        Ok(PaintPending { cell })
    }

    /// In-place scroll; fire-and-forget by design.
    pub fn scroll_backing_store(
        &self,
        route: u32,
        dx: i32,
        dy: i32,
        clip_rect: Rect,
        view_size: Size,
    ) -> Result<(), CallError> {
        self.send_async(
            route,
            &Request::ScrollBackingStore {
                dx,
                dy,
                clip_rect,
                view_size,
            },
        )
    }

    /// Tell the GPU process the host finished painting the window.
    pub fn window_painted(&self, route: u32) -> Result<(), CallError> {
        self.send_async(route, &Request::WindowPainted)
    }
}

fn finish_call(event: Event) -> Result<Event, CallError> {
    match event {
        Event::CallFailed { fault } => Err(fault.into()),
        other => Ok(other),
    }
}

fn dispatch_unsolicited(pump: &mut PumpState, seq: u32, route: u32, event: Event) {
    if seq != 0 {
        if let Some(cell) = pump.acks.remove(&seq) {
            cell.complete(match event {
                Event::PaintToBackingStoreAck | Event::PaintToVideoLayerAck => Ok(()),
                Event::CallFailed { fault } => Err(fault.into()),
                _ => Err(CallError::UnexpectedReply),
            });
        } else {
            // A reply for a sync caller currently parked on the pump lock.
            pump.parked.insert(seq, event);
        }
        return;
    }
    match event {
        Event::UpdateState { state } => {
            if let Some(shared) = pump.routes.get(&route) {
                shared.merge_state(state);
            }
        }
        Event::NotifyRepaint => {
            if let Some(shared) = pump.routes.get(&route) {
                shared.set_repaint();
            }
        }
        other => {
            tracing::debug!(route, event = ?other, "ignoring unsolicited event");
        }
    }
}
