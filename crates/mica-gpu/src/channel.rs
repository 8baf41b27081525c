//! One GPU channel: the per-renderer dispatch loop and its route table.
//!
//! A channel thread drains the transport's request ring, dispatches control
//! and routed messages, and replies on the event ring. Every entity the
//! channel owns lives in the [`RouteTable`]; teardown releases all of it.
//!
//! Routing ids for command buffers are allocated here; backing store and
//! video layer ids are chosen by the host side. Slots carry a channel-wide
//! generation counter so a non-owning parent borrow can detect that the exact
//! endpoint it referenced is gone, even if the routing id was reused.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use mica_ipc::poll::Backoff;
use mica_ipc::shmem::{HandleBroker, ShmemHandle};
use mica_ipc::transport::{TransportError, TransportServer};
use mica_proto::{
    decode_request, encode_event, CallFault, EndpointError, Event, Request, Size, PARENT_NONE,
    ROUTE_CONTROL,
};

use crate::service::{ServiceConfig, ViewRegistry};
use crate::stub::{CommandBufferStub, ParentLink};
use crate::surface::{BackingStore, VideoLayer};

pub(crate) enum RouteEntry {
    CommandBuffer(CommandBufferStub),
    BackingStore(BackingStore),
    VideoLayer(VideoLayer),
}

pub(crate) struct RouteSlot {
    pub generation: u32,
    pub entry: RouteEntry,
}

#[derive(Default)]
pub(crate) struct RouteTable {
    slots: HashMap<u32, RouteSlot>,
    next_generation: u32,
}

impl RouteTable {
    pub(crate) fn insert(&mut self, route: u32, entry: RouteEntry) -> u32 {
        self.next_generation = self.next_generation.wrapping_add(1);
        let generation = self.next_generation;
        self.slots.insert(route, RouteSlot { generation, entry });
        generation
    }

    pub(crate) fn get_mut(&mut self, route: u32) -> Option<&mut RouteSlot> {
        self.slots.get_mut(&route)
    }

    pub(crate) fn remove(&mut self, route: u32) -> Option<RouteSlot> {
        self.slots.remove(&route)
    }

    /// Whether the endpoint a parent link was taken against is still alive.
    pub(crate) fn parent_live(&self, link: &ParentLink) -> bool {
        match self.slots.get(&link.route) {
            Some(RouteSlot {
                generation,
                entry: RouteEntry::CommandBuffer(stub),
            }) => *generation == link.generation && !stub.is_destroyed(),
            _ => false,
        }
    }

    fn take_all(&mut self) -> HashMap<u32, RouteSlot> {
        std::mem::take(&mut self.slots)
    }
}

/// Fatal conditions that end the channel's dispatch loop.
enum ChannelExit {
    Disconnected,
    ShuttingDown,
    /// The request stream no longer decodes; nothing on it can be trusted.
    ProtocolViolation,
}

pub(crate) struct GpuChannel {
    renderer_id: u32,
    server: TransportServer,
    broker: HandleBroker,
    views: ViewRegistry,
    config: ServiceConfig,
    routes: RouteTable,
    next_route: u32,
    shutdown: Arc<AtomicBool>,
    alive: Arc<AtomicBool>,
}

impl GpuChannel {
    pub(crate) fn new(
        renderer_id: u32,
        server: TransportServer,
        broker: HandleBroker,
        views: ViewRegistry,
        config: ServiceConfig,
        shutdown: Arc<AtomicBool>,
        alive: Arc<AtomicBool>,
    ) -> Self {
        Self {
            renderer_id,
            server,
            broker,
            views,
            config,
            routes: RouteTable::default(),
            next_route: 0,
            shutdown,
            alive,
        }
    }

    /// Dispatch until the renderer disconnects or the service shuts down.
    pub(crate) fn run(mut self) {
        tracing::info!(renderer_id = self.renderer_id, "gpu channel up");
        let mut backoff = Backoff::new();
        let exit = loop {
            if self.shutdown.load(Ordering::Acquire) {
                break ChannelExit::ShuttingDown;
            }
            match self.server.recv() {
                Ok(Some(bytes)) => {
                    backoff.reset();
                    match self.dispatch(&bytes) {
                        Ok(()) => {}
                        Err(exit) => break exit,
                    }
                }
                Ok(None) => backoff.wait(),
                Err(_) => break ChannelExit::Disconnected,
            }
        };
        match exit {
            ChannelExit::Disconnected => {
                tracing::info!(renderer_id = self.renderer_id, "renderer disconnected")
            }
            ChannelExit::ShuttingDown => {
                tracing::info!(renderer_id = self.renderer_id, "gpu channel shutting down")
            }
            ChannelExit::ProtocolViolation => tracing::error!(
                renderer_id = self.renderer_id,
                "undecodable request, killing channel"
            ),
        }
        self.teardown();
    }

    fn dispatch(&mut self, bytes: &[u8]) -> Result<(), ChannelExit> {
        let (seq, route, request) = match decode_request(bytes) {
            Ok(decoded) => decoded,
            Err(err) => {
                tracing::error!(renderer_id = self.renderer_id, error = %err, "bad request");
                return Err(ChannelExit::ProtocolViolation);
            }
        };
        if route == ROUTE_CONTROL {
            self.handle_control(seq, request)
        } else {
            self.handle_routed(seq, route, request)
        }
    }

    fn send(&self, seq: u32, route: u32, event: &Event) -> Result<(), ChannelExit> {
        match self.server.send(&encode_event(seq, route, event)) {
            Ok(()) => Ok(()),
            Err(TransportError::Disconnected) => Err(ChannelExit::Disconnected),
            Err(err) => {
                tracing::error!(renderer_id = self.renderer_id, error = %err, "send failed");
                Err(ChannelExit::Disconnected)
            }
        }
    }

    /// Reply with a fault when the caller expects a reply; otherwise log it.
    fn fail(&self, seq: u32, route: u32, fault: CallFault) -> Result<(), ChannelExit> {
        if seq != 0 {
            self.send(seq, route, &Event::CallFailed { fault })
        } else {
            tracing::warn!(
                renderer_id = self.renderer_id,
                route,
                fault = %fault,
                "dropping failed fire-and-forget message"
            );
            Ok(())
        }
    }

    fn allocate_route(&mut self) -> u32 {
        self.next_route = self.next_route.wrapping_add(1).max(1);
        while self.routes.get_mut(self.next_route).is_some() {
            self.next_route = self.next_route.wrapping_add(1).max(1);
        }
        self.next_route
    }

    fn make_sink(&self, route: u32) -> Box<dyn crate::sink::CommandSink> {
        match &self.config.sink_factory {
            Some(factory) => factory(self.renderer_id, route),
            None => Box::new(crate::sink::NullSink),
        }
    }

    fn handle_control(&mut self, seq: u32, request: Request) -> Result<(), ChannelExit> {
        match request {
            Request::CreateViewCommandBuffer { view_id } => {
                if !self.views.contains(view_id) {
                    return self.fail(seq, ROUTE_CONTROL, CallFault::InvalidHandle);
                }
                let route = self.allocate_route();
                let stub = CommandBufferStub::new_view(route, view_id, self.make_sink(route));
                self.routes.insert(route, RouteEntry::CommandBuffer(stub));
                self.send(seq, ROUTE_CONTROL, &Event::CommandBufferCreated { route })
            }
            Request::CreateOffscreenCommandBuffer {
                parent_route,
                size,
                parent_texture_id,
            } => {
                let parent = if parent_route == PARENT_NONE {
                    None
                } else {
                    match self.routes.get_mut(parent_route) {
                        Some(RouteSlot {
                            generation,
                            entry: RouteEntry::CommandBuffer(stub),
                        }) if !stub.is_destroyed() => Some(ParentLink {
                            route: parent_route,
                            generation: *generation,
                            texture_id: parent_texture_id,
                        }),
                        _ => return self.fail(seq, ROUTE_CONTROL, CallFault::InvalidHandle),
                    }
                };
                let route = self.allocate_route();
                let stub =
                    CommandBufferStub::new_offscreen(route, size, parent, self.make_sink(route));
                self.routes.insert(route, RouteEntry::CommandBuffer(stub));
                self.send(seq, ROUTE_CONTROL, &Event::CommandBufferCreated { route })
            }
            Request::DestroyCommandBuffer { route } => {
                match self.routes.remove(route) {
                    Some(RouteSlot {
                        entry: RouteEntry::CommandBuffer(mut stub),
                        ..
                    }) => {
                        stub.destroy(&self.broker);
                        tracing::debug!(
                            renderer_id = self.renderer_id,
                            route,
                            "command buffer destroyed"
                        );
                        if seq != 0 {
                            return self.send(seq, ROUTE_CONTROL, &Event::Done);
                        }
                        Ok(())
                    }
                    Some(slot) => {
                        // Not a command buffer; put it back untouched.
                        self.routes.slots.insert(route, slot);
                        self.fail(seq, ROUTE_CONTROL, CallFault::InvalidHandle)
                    }
                    None => self.fail(seq, ROUTE_CONTROL, CallFault::InvalidHandle),
                }
            }
            // Directory-scope messages belong on the control transport, and
            // routed messages need a route.
            _ => self.fail(seq, ROUTE_CONTROL, CallFault::Unsupported),
        }
    }

    /// Check an endpoint's parent borrow; returns the error to latch if the
    /// parent is gone.
    fn parent_fault(&mut self, route: u32) -> Option<EndpointError> {
        let link = match self.routes.get_mut(route) {
            Some(RouteSlot {
                entry: RouteEntry::CommandBuffer(stub),
                ..
            }) => {
                // Already latched; nothing new to report.
                if stub.state().is_errored() {
                    return None;
                }
                stub.parent_link()?
            }
            _ => return None,
        };
        if self.routes.parent_live(&link) {
            None
        } else {
            tracing::warn!(
                renderer_id = self.renderer_id,
                route,
                parent_route = link.route,
                parent_texture = link.texture_id,
                "borrowed texture namespace is gone"
            );
            Some(EndpointError::ParentLost)
        }
    }

    fn handle_routed(&mut self, seq: u32, route: u32, request: Request) -> Result<(), ChannelExit> {
        match request {
            Request::NewBackingStore { size } => self.new_surface(seq, route, size, false),
            Request::NewVideoLayer { size } => {
                if !self
                    .config
                    .info
                    .supports(mica_proto::GpuCaps::VIDEO_LAYERS)
                {
                    return self.fail(seq, route, CallFault::Unsupported);
                }
                self.new_surface(seq, route, size, true)
            }
            Request::PaintToBackingStore {
                bitmap,
                bitmap_rect,
                copy_rects,
                ..
            } => {
                let Some(region) = self.broker.resolve(ShmemHandle::from_raw(bitmap)) else {
                    return self.fail(seq, route, CallFault::InvalidHandle);
                };
                match self.routes.get_mut(route) {
                    Some(RouteSlot {
                        entry: RouteEntry::BackingStore(store),
                        ..
                    }) => match store.paint(&region, bitmap_rect, &copy_rects) {
                        Ok(()) => self.send(seq, route, &Event::PaintToBackingStoreAck),
                        Err(fault) => self.fail(seq, route, fault),
                    },
                    _ => self.fail(seq, route, CallFault::InvalidHandle),
                }
            }
            Request::PaintToVideoLayer {
                bitmap,
                bitmap_rect,
                ..
            } => {
                let Some(region) = self.broker.resolve(ShmemHandle::from_raw(bitmap)) else {
                    return self.fail(seq, route, CallFault::InvalidHandle);
                };
                match self.routes.get_mut(route) {
                    Some(RouteSlot {
                        entry: RouteEntry::VideoLayer(layer),
                        ..
                    }) => match layer.paint(&region, bitmap_rect) {
                        Ok(()) => self.send(seq, route, &Event::PaintToVideoLayerAck),
                        Err(fault) => self.fail(seq, route, fault),
                    },
                    _ => self.fail(seq, route, CallFault::InvalidHandle),
                }
            }
            Request::ScrollBackingStore {
                dx,
                dy,
                clip_rect,
                view_size,
            } => match self.routes.get_mut(route) {
                Some(RouteSlot {
                    entry: RouteEntry::BackingStore(store),
                    ..
                }) => {
                    store.scroll(dx, dy, clip_rect, view_size);
                    Ok(())
                }
                _ => self.fail(seq, route, CallFault::InvalidHandle),
            },
            Request::WindowPainted => match self.routes.get_mut(route) {
                Some(RouteSlot {
                    entry: RouteEntry::BackingStore(store),
                    ..
                }) => {
                    store.set_window_painted();
                    Ok(())
                }
                _ => self.fail(seq, route, CallFault::InvalidHandle),
            },
            Request::Initialize { size_bytes } => {
                if let Some(error) = self.parent_fault(route) {
                    self.latch_endpoint_error(route, error);
                    return self.fail(seq, route, CallFault::Endpoint(error));
                }
                let default_bytes = self.config.default_cmd_ring_bytes;
                let broker = self.broker.clone();
                match self.routes.get_mut(route) {
                    Some(RouteSlot {
                        entry: RouteEntry::CommandBuffer(stub),
                        ..
                    }) => {
                        let first_view_init = match stub.view_id() {
                            Some(view_id) if !stub.ring_initialized() => {
                                tracing::debug!(
                                    renderer_id = self.renderer_id,
                                    route,
                                    view_id,
                                    "view ring initializing"
                                );
                                true
                            }
                            _ => false,
                        };
                        match stub.initialize(size_bytes, default_bytes, &broker) {
                            Ok(handle) => {
                                self.send(
                                    seq,
                                    route,
                                    &Event::Initialized { ring: handle.raw() },
                                )?;
                                // A view's window has no content yet; ask for
                                // the first paint.
                                if first_view_init {
                                    self.send(0, route, &Event::NotifyRepaint)?;
                                }
                                Ok(())
                            }
                            Err(fault) => self.fail(seq, route, fault),
                        }
                    }
                    _ => self.fail(seq, route, CallFault::InvalidHandle),
                }
            }
            Request::GetState => match self.routes.get_mut(route) {
                Some(RouteSlot {
                    entry: RouteEntry::CommandBuffer(stub),
                    ..
                }) => {
                    let state = stub.state();
                    self.send(seq, route, &Event::StateReply { state })
                }
                _ => self.fail(seq, route, CallFault::InvalidHandle),
            },
            Request::AsyncGetState => match self.routes.get_mut(route) {
                Some(RouteSlot {
                    entry: RouteEntry::CommandBuffer(stub),
                    ..
                }) => {
                    let state = stub.state();
                    self.send(0, route, &Event::UpdateState { state })
                }
                _ => self.fail(seq, route, CallFault::InvalidHandle),
            },
            Request::Flush { put_offset } => {
                let state = match self.flush_route(route, put_offset) {
                    Some(state) => state,
                    None => return self.fail(seq, route, CallFault::InvalidHandle),
                };
                self.send(seq, route, &Event::StateReply { state })
            }
            Request::AsyncFlush { put_offset } => {
                let state = match self.flush_route(route, put_offset) {
                    Some(state) => state,
                    None => return self.fail(seq, route, CallFault::InvalidHandle),
                };
                self.send(0, route, &Event::UpdateState { state })
            }
            Request::CreateTransferBuffer { size } => {
                let max = self.config.max_transfer_buffer_bytes;
                let broker = self.broker.clone();
                match self.routes.get_mut(route) {
                    Some(RouteSlot {
                        entry: RouteEntry::CommandBuffer(stub),
                        ..
                    }) => match stub.create_transfer_buffer(size, max, &broker) {
                        Ok(id) => self.send(seq, route, &Event::TransferBufferCreated { id }),
                        Err(fault) => self.fail(seq, route, fault),
                    },
                    _ => self.fail(seq, route, CallFault::InvalidHandle),
                }
            }
            Request::DestroyTransferBuffer { id } => {
                let broker = self.broker.clone();
                match self.routes.get_mut(route) {
                    Some(RouteSlot {
                        entry: RouteEntry::CommandBuffer(stub),
                        ..
                    }) => match stub.destroy_transfer_buffer(id, &broker) {
                        Ok(()) => self.send(seq, route, &Event::Done),
                        Err(fault) => self.fail(seq, route, fault),
                    },
                    _ => self.fail(seq, route, CallFault::InvalidHandle),
                }
            }
            Request::GetTransferBuffer { id } => match self.routes.get_mut(route) {
                Some(RouteSlot {
                    entry: RouteEntry::CommandBuffer(stub),
                    ..
                }) => match stub.get_transfer_buffer(id) {
                    Ok((handle, size)) => self.send(
                        seq,
                        route,
                        &Event::TransferBufferInfo {
                            handle: handle.raw(),
                            size,
                        },
                    ),
                    Err(fault) => self.fail(seq, route, fault),
                },
                _ => self.fail(seq, route, CallFault::InvalidHandle),
            },
            Request::ResizeOffscreenFrameBuffer { size } => {
                match self.routes.get_mut(route) {
                    Some(RouteSlot {
                        entry: RouteEntry::CommandBuffer(stub),
                        ..
                    }) => match stub.resize_offscreen(size) {
                        Ok(()) => {
                            if seq != 0 {
                                return self.send(seq, route, &Event::Done);
                            }
                            Ok(())
                        }
                        Err(fault) => self.fail(seq, route, fault),
                    },
                    _ => self.fail(seq, route, CallFault::InvalidHandle),
                }
            }
            // Control-scope messages carrying a route id are malformed usage.
            _ => self.fail(seq, route, CallFault::Unsupported),
        }
    }

    /// Create-or-resize a surface at a host-chosen route.
    fn new_surface(
        &mut self,
        seq: u32,
        route: u32,
        size: Size,
        video: bool,
    ) -> Result<(), ChannelExit> {
        match self.routes.get_mut(route) {
            None => {
                let entry = if video {
                    RouteEntry::VideoLayer(VideoLayer::new(size))
                } else {
                    RouteEntry::BackingStore(BackingStore::new(size))
                };
                self.routes.insert(route, entry);
                tracing::debug!(
                    renderer_id = self.renderer_id,
                    route,
                    width = size.width,
                    height = size.height,
                    video,
                    "surface allocated"
                );
                self.send(seq, route, &Event::Done)
            }
            Some(RouteSlot {
                entry: RouteEntry::BackingStore(store),
                ..
            }) if !video => {
                store.resize_discard(size);
                self.send(seq, route, &Event::Done)
            }
            Some(RouteSlot {
                entry: RouteEntry::VideoLayer(layer),
                ..
            }) if video => {
                layer.resize_discard(size);
                self.send(seq, route, &Event::Done)
            }
            // The route names a command buffer or the wrong surface kind.
            Some(_) => self.fail(seq, route, CallFault::InvalidHandle),
        }
    }

    fn latch_endpoint_error(&mut self, route: u32, error: EndpointError) {
        if let Some(RouteSlot {
            entry: RouteEntry::CommandBuffer(stub),
            ..
        }) = self.routes.get_mut(route)
        {
            stub.mark_error(error);
            tracing::warn!(
                renderer_id = self.renderer_id,
                route,
                error = %error,
                "endpoint errored"
            );
        }
    }

    /// Flush one endpoint, latching a parent-lost error first if the borrow
    /// dangles. `None` means the route is not a command buffer.
    fn flush_route(&mut self, route: u32, put_offset: u32) -> Option<mica_proto::State> {
        if let Some(error) = self.parent_fault(route) {
            self.latch_endpoint_error(route, error);
        }
        match self.routes.get_mut(route) {
            Some(RouteSlot {
                entry: RouteEntry::CommandBuffer(stub),
                ..
            }) => Some(stub.flush(put_offset)),
            _ => None,
        }
    }

    fn teardown(mut self) {
        let broker = self.broker.clone();
        for (route, mut slot) in self.routes.take_all() {
            if let RouteEntry::CommandBuffer(stub) = &mut slot.entry {
                stub.destroy(&broker);
            }
            tracing::debug!(renderer_id = self.renderer_id, route, "route released");
        }
        self.alive.store(false, Ordering::Release);
        self.server.close();
        tracing::info!(renderer_id = self.renderer_id, "gpu channel down");
    }
}
