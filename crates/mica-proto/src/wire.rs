//! Binary message catalog for the GPU channel.
//!
//! Little-endian, tag-prefixed, intentionally small and stable. Records are
//! framed by the transport rings; this module defines the payload:
//!
//! - an envelope of `{ seq, route }`,
//! - a [`Request`] (content/host → GPU) or [`Event`] (GPU → content/host).
//!
//! `seq != 0` marks a message that expects a correlated reply (synchronous
//! calls and ACKed paints); `route == 0` is channel-control scope.

use std::fmt;

use crate::geom::{Rect, Size};
use crate::info::{GpuCaps, GpuInfo};
use crate::state::{CallFault, EndpointError, State};

/// Defensive maximum message size (bytes) for decode.
pub const MAX_MESSAGE_BYTES: usize = 1 << 20; // 1 MiB

/// Route id for channel-control messages.
pub const ROUTE_CONTROL: u32 = 0;

/// `parent_route` value meaning "no parent" for offscreen endpoints.
pub const PARENT_NONE: u32 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeError {
    UnexpectedEof,
    InvalidEnum,
    InvalidUtf8,
    UnknownTag,
    OversizedPayload,
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecodeError::UnexpectedEof => write!(f, "unexpected EOF"),
            DecodeError::InvalidEnum => write!(f, "invalid enum value"),
            DecodeError::InvalidUtf8 => write!(f, "invalid UTF-8"),
            DecodeError::UnknownTag => write!(f, "unknown tag"),
            DecodeError::OversizedPayload => write!(f, "payload too large"),
        }
    }
}

impl std::error::Error for DecodeError {}

/// Messages sent to the GPU process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    /// Ask the channel directory for a channel to service `renderer_id`.
    /// Answered with [`Event::ChannelEstablished`].
    EstablishChannel { renderer_id: u32 },

    /// Barrier: answered once every prior control message was processed.
    Synchronize,

    /// Register a native view the GPU process may render into.
    NewRenderWidgetHostView { parent_window: u64, view_id: u32 },

    /// Look up the native window id for a registered view.
    GetViewXid { view_id: u32 },

    /// Create a command buffer endpoint rendering into a registered view.
    CreateViewCommandBuffer { view_id: u32 },

    /// Create an offscreen endpoint. With `parent_route != PARENT_NONE` the
    /// new endpoint's frame buffer texture is mapped into the parent's
    /// namespace under `parent_texture_id`.
    CreateOffscreenCommandBuffer {
        parent_route: u32,
        size: Size,
        parent_texture_id: u32,
    },

    /// Tear down an endpoint and everything it owns.
    DestroyCommandBuffer { route: u32 },

    /// Allocate (or return the existing) command ring for an endpoint.
    Initialize { size_bytes: u32 },

    GetState,
    AsyncGetState,

    /// Publish commands up to `put_offset` and consume them before replying.
    Flush { put_offset: u32 },

    /// As `Flush`, but completion arrives as [`Event::UpdateState`].
    AsyncFlush { put_offset: u32 },

    CreateTransferBuffer { size: u32 },
    DestroyTransferBuffer { id: i32 },
    GetTransferBuffer { id: i32 },

    /// Reallocate an offscreen endpoint's frame buffer.
    ResizeOffscreenFrameBuffer { size: Size },

    /// Allocate (or resize, discarding contents) a backing store surface.
    NewBackingStore { size: Size },

    /// Allocate (or resize, discarding contents) a YUV video layer.
    NewVideoLayer { size: Size },

    /// Composite a shared bitmap into the backing store. ACKed so the sender
    /// knows when the bitmap transport may be reused.
    PaintToBackingStore {
        process_id: u32,
        bitmap: u32,
        bitmap_rect: Rect,
        copy_rects: Vec<Rect>,
    },

    /// Shift backing store pixels in place; no ACK.
    ScrollBackingStore {
        dx: i32,
        dy: i32,
        clip_rect: Rect,
        view_size: Size,
    },

    /// The host finished compositing the window this surface mirrors.
    WindowPainted,

    /// Blit a YUV frame into the video layer. ACKed like backing store
    /// paints.
    PaintToVideoLayer {
        process_id: u32,
        bitmap: u32,
        bitmap_rect: Rect,
    },
}

/// Messages sent by the GPU process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    ChannelEstablished { channel: u32, info: GpuInfo },
    SynchronizeDone,
    ViewXid { xid: u64 },
    CommandBufferCreated { route: u32 },
    Initialized { ring: u32 },
    StateReply { state: State },
    /// Unsolicited state update for `AsyncFlush`/`AsyncGetState`; delivered
    /// in non-decreasing get/token order per endpoint.
    UpdateState { state: State },
    TransferBufferCreated { id: i32 },
    TransferBufferInfo { handle: u32, size: u32 },
    /// Generic completion for calls with no payload to return.
    Done,
    PaintToBackingStoreAck,
    PaintToVideoLayerAck,
    /// The window contents became invalid and should be redrawn. Advisory.
    NotifyRepaint,
    /// Correlated failure of a call that expected a reply.
    CallFailed { fault: CallFault },
}

const REQ_TAG_ESTABLISH_CHANNEL: u16 = 0x0001;
const REQ_TAG_SYNCHRONIZE: u16 = 0x0002;
const REQ_TAG_NEW_VIEW: u16 = 0x0003;
const REQ_TAG_GET_VIEW_XID: u16 = 0x0004;
const REQ_TAG_CREATE_VIEW_CMD_BUFFER: u16 = 0x0010;
const REQ_TAG_CREATE_OFFSCREEN_CMD_BUFFER: u16 = 0x0011;
const REQ_TAG_DESTROY_CMD_BUFFER: u16 = 0x0012;
const REQ_TAG_INITIALIZE: u16 = 0x0100;
const REQ_TAG_GET_STATE: u16 = 0x0101;
const REQ_TAG_ASYNC_GET_STATE: u16 = 0x0102;
const REQ_TAG_FLUSH: u16 = 0x0103;
const REQ_TAG_ASYNC_FLUSH: u16 = 0x0104;
const REQ_TAG_CREATE_TRANSFER_BUFFER: u16 = 0x0105;
const REQ_TAG_DESTROY_TRANSFER_BUFFER: u16 = 0x0106;
const REQ_TAG_GET_TRANSFER_BUFFER: u16 = 0x0107;
const REQ_TAG_RESIZE_OFFSCREEN: u16 = 0x0108;
const REQ_TAG_NEW_BACKING_STORE: u16 = 0x0200;
const REQ_TAG_NEW_VIDEO_LAYER: u16 = 0x0201;
const REQ_TAG_PAINT_TO_BACKING_STORE: u16 = 0x0202;
const REQ_TAG_SCROLL_BACKING_STORE: u16 = 0x0203;
const REQ_TAG_WINDOW_PAINTED: u16 = 0x0204;
const REQ_TAG_PAINT_TO_VIDEO_LAYER: u16 = 0x0205;

const EVT_TAG_CHANNEL_ESTABLISHED: u16 = 0x1000;
const EVT_TAG_SYNCHRONIZE_DONE: u16 = 0x1001;
const EVT_TAG_VIEW_XID: u16 = 0x1002;
const EVT_TAG_CMD_BUFFER_CREATED: u16 = 0x1010;
const EVT_TAG_INITIALIZED: u16 = 0x1100;
const EVT_TAG_STATE_REPLY: u16 = 0x1101;
const EVT_TAG_UPDATE_STATE: u16 = 0x1102;
const EVT_TAG_TRANSFER_BUFFER_CREATED: u16 = 0x1103;
const EVT_TAG_TRANSFER_BUFFER_INFO: u16 = 0x1104;
const EVT_TAG_DONE: u16 = 0x1105;
const EVT_TAG_PAINT_BACKING_ACK: u16 = 0x1200;
const EVT_TAG_PAINT_VIDEO_ACK: u16 = 0x1201;
const EVT_TAG_NOTIFY_REPAINT: u16 = 0x1202;
const EVT_TAG_CALL_FAILED: u16 = 0x1FFF;

pub fn encode_request(seq: u32, route: u32, req: &Request) -> Vec<u8> {
    let mut out = Vec::new();
    push_u32(&mut out, seq);
    push_u32(&mut out, route);
    match req {
        Request::EstablishChannel { renderer_id } => {
            push_u16(&mut out, REQ_TAG_ESTABLISH_CHANNEL);
            push_u32(&mut out, *renderer_id);
        }
        Request::Synchronize => push_u16(&mut out, REQ_TAG_SYNCHRONIZE),
        Request::NewRenderWidgetHostView { parent_window, view_id } => {
            push_u16(&mut out, REQ_TAG_NEW_VIEW);
            push_u64(&mut out, *parent_window);
            push_u32(&mut out, *view_id);
        }
        Request::GetViewXid { view_id } => {
            push_u16(&mut out, REQ_TAG_GET_VIEW_XID);
            push_u32(&mut out, *view_id);
        }
        Request::CreateViewCommandBuffer { view_id } => {
            push_u16(&mut out, REQ_TAG_CREATE_VIEW_CMD_BUFFER);
            push_u32(&mut out, *view_id);
        }
        Request::CreateOffscreenCommandBuffer {
            parent_route,
            size,
            parent_texture_id,
        } => {
            push_u16(&mut out, REQ_TAG_CREATE_OFFSCREEN_CMD_BUFFER);
            push_u32(&mut out, *parent_route);
            push_size(&mut out, size);
            push_u32(&mut out, *parent_texture_id);
        }
        Request::DestroyCommandBuffer { route } => {
            push_u16(&mut out, REQ_TAG_DESTROY_CMD_BUFFER);
            push_u32(&mut out, *route);
        }
        Request::Initialize { size_bytes } => {
            push_u16(&mut out, REQ_TAG_INITIALIZE);
            push_u32(&mut out, *size_bytes);
        }
        Request::GetState => push_u16(&mut out, REQ_TAG_GET_STATE),
        Request::AsyncGetState => push_u16(&mut out, REQ_TAG_ASYNC_GET_STATE),
        Request::Flush { put_offset } => {
            push_u16(&mut out, REQ_TAG_FLUSH);
            push_u32(&mut out, *put_offset);
        }
        Request::AsyncFlush { put_offset } => {
            push_u16(&mut out, REQ_TAG_ASYNC_FLUSH);
            push_u32(&mut out, *put_offset);
        }
        Request::CreateTransferBuffer { size } => {
            push_u16(&mut out, REQ_TAG_CREATE_TRANSFER_BUFFER);
            push_u32(&mut out, *size);
        }
        Request::DestroyTransferBuffer { id } => {
            push_u16(&mut out, REQ_TAG_DESTROY_TRANSFER_BUFFER);
            push_u32(&mut out, *id as u32);
        }
        Request::GetTransferBuffer { id } => {
            push_u16(&mut out, REQ_TAG_GET_TRANSFER_BUFFER);
            push_u32(&mut out, *id as u32);
        }
        Request::ResizeOffscreenFrameBuffer { size } => {
            push_u16(&mut out, REQ_TAG_RESIZE_OFFSCREEN);
            push_size(&mut out, size);
        }
        Request::NewBackingStore { size } => {
            push_u16(&mut out, REQ_TAG_NEW_BACKING_STORE);
            push_size(&mut out, size);
        }
        Request::NewVideoLayer { size } => {
            push_u16(&mut out, REQ_TAG_NEW_VIDEO_LAYER);
            push_size(&mut out, size);
        }
        Request::PaintToBackingStore {
            process_id,
            bitmap,
            bitmap_rect,
            copy_rects,
        } => {
            push_u16(&mut out, REQ_TAG_PAINT_TO_BACKING_STORE);
            push_u32(&mut out, *process_id);
            push_u32(&mut out, *bitmap);
            push_rect(&mut out, bitmap_rect);
            push_u32(&mut out, copy_rects.len() as u32);
            for rect in copy_rects {
                push_rect(&mut out, rect);
            }
        }
        Request::ScrollBackingStore {
            dx,
            dy,
            clip_rect,
            view_size,
        } => {
            push_u16(&mut out, REQ_TAG_SCROLL_BACKING_STORE);
            push_u32(&mut out, *dx as u32);
            push_u32(&mut out, *dy as u32);
            push_rect(&mut out, clip_rect);
            push_size(&mut out, view_size);
        }
        Request::WindowPainted => push_u16(&mut out, REQ_TAG_WINDOW_PAINTED),
        Request::PaintToVideoLayer {
            process_id,
            bitmap,
            bitmap_rect,
        } => {
            push_u16(&mut out, REQ_TAG_PAINT_TO_VIDEO_LAYER);
            push_u32(&mut out, *process_id);
            push_u32(&mut out, *bitmap);
            push_rect(&mut out, bitmap_rect);
        }
    }
    out
}

pub fn decode_request(bytes: &[u8]) -> Result<(u32, u32, Request), DecodeError> {
    if bytes.len() > MAX_MESSAGE_BYTES {
        return Err(DecodeError::OversizedPayload);
    }
    let mut r = Reader::new(bytes);
    let seq = r.read_u32()?;
    let route = r.read_u32()?;
    let tag = r.read_u16()?;
    let req = match tag {
        REQ_TAG_ESTABLISH_CHANNEL => Request::EstablishChannel {
            renderer_id: r.read_u32()?,
        },
        REQ_TAG_SYNCHRONIZE => Request::Synchronize,
        REQ_TAG_NEW_VIEW => Request::NewRenderWidgetHostView {
            parent_window: r.read_u64()?,
            view_id: r.read_u32()?,
        },
        REQ_TAG_GET_VIEW_XID => Request::GetViewXid {
            view_id: r.read_u32()?,
        },
        REQ_TAG_CREATE_VIEW_CMD_BUFFER => Request::CreateViewCommandBuffer {
            view_id: r.read_u32()?,
        },
        REQ_TAG_CREATE_OFFSCREEN_CMD_BUFFER => Request::CreateOffscreenCommandBuffer {
            parent_route: r.read_u32()?,
            size: read_size(&mut r)?,
            parent_texture_id: r.read_u32()?,
        },
        REQ_TAG_DESTROY_CMD_BUFFER => Request::DestroyCommandBuffer {
            route: r.read_u32()?,
        },
        REQ_TAG_INITIALIZE => Request::Initialize {
            size_bytes: r.read_u32()?,
        },
        REQ_TAG_GET_STATE => Request::GetState,
        REQ_TAG_ASYNC_GET_STATE => Request::AsyncGetState,
        REQ_TAG_FLUSH => Request::Flush {
            put_offset: r.read_u32()?,
        },
        REQ_TAG_ASYNC_FLUSH => Request::AsyncFlush {
            put_offset: r.read_u32()?,
        },
        REQ_TAG_CREATE_TRANSFER_BUFFER => Request::CreateTransferBuffer {
            size: r.read_u32()?,
        },
        REQ_TAG_DESTROY_TRANSFER_BUFFER => Request::DestroyTransferBuffer {
            id: r.read_u32()? as i32,
        },
        REQ_TAG_GET_TRANSFER_BUFFER => Request::GetTransferBuffer {
            id: r.read_u32()? as i32,
        },
        REQ_TAG_RESIZE_OFFSCREEN => Request::ResizeOffscreenFrameBuffer {
            size: read_size(&mut r)?,
        },
        REQ_TAG_NEW_BACKING_STORE => Request::NewBackingStore {
            size: read_size(&mut r)?,
        },
        REQ_TAG_NEW_VIDEO_LAYER => Request::NewVideoLayer {
            size: read_size(&mut r)?,
        },
        REQ_TAG_PAINT_TO_BACKING_STORE => {
            let process_id = r.read_u32()?;
            let bitmap = r.read_u32()?;
            let bitmap_rect = read_rect(&mut r)?;
            let count = r.read_u32()? as usize;
            // 16 bytes per rect; a bogus count fails here instead of
            // reserving unbounded memory.
            if count.checked_mul(16).is_none_or(|n| n > r.remaining()) {
                return Err(DecodeError::UnexpectedEof);
            }
            let mut copy_rects = Vec::with_capacity(count);
            for _ in 0..count {
                copy_rects.push(read_rect(&mut r)?);
            }
            Request::PaintToBackingStore {
                process_id,
                bitmap,
                bitmap_rect,
                copy_rects,
            }
        }
        REQ_TAG_SCROLL_BACKING_STORE => Request::ScrollBackingStore {
            dx: r.read_u32()? as i32,
            dy: r.read_u32()? as i32,
            clip_rect: read_rect(&mut r)?,
            view_size: read_size(&mut r)?,
        },
        REQ_TAG_WINDOW_PAINTED => Request::WindowPainted,
        REQ_TAG_PAINT_TO_VIDEO_LAYER => Request::PaintToVideoLayer {
            process_id: r.read_u32()?,
            bitmap: r.read_u32()?,
            bitmap_rect: read_rect(&mut r)?,
        },
        _ => return Err(DecodeError::UnknownTag),
    };
    if r.remaining() != 0 {
        // Extra bytes are a format violation.
        return Err(DecodeError::UnknownTag);
    }
    Ok((seq, route, req))
}

pub fn encode_event(seq: u32, route: u32, evt: &Event) -> Vec<u8> {
    let mut out = Vec::new();
    push_u32(&mut out, seq);
    push_u32(&mut out, route);
    match evt {
        Event::ChannelEstablished { channel, info } => {
            push_u16(&mut out, EVT_TAG_CHANNEL_ESTABLISHED);
            push_u32(&mut out, *channel);
            push_u32(&mut out, info.vendor_id);
            push_u32(&mut out, info.device_id);
            let version = info.driver_version.as_bytes();
            push_u32(&mut out, version.len() as u32);
            out.extend_from_slice(version);
            push_u32(&mut out, info.caps.bits());
        }
        Event::SynchronizeDone => push_u16(&mut out, EVT_TAG_SYNCHRONIZE_DONE),
        Event::ViewXid { xid } => {
            push_u16(&mut out, EVT_TAG_VIEW_XID);
            push_u64(&mut out, *xid);
        }
        Event::CommandBufferCreated { route } => {
            push_u16(&mut out, EVT_TAG_CMD_BUFFER_CREATED);
            push_u32(&mut out, *route);
        }
        Event::Initialized { ring } => {
            push_u16(&mut out, EVT_TAG_INITIALIZED);
            push_u32(&mut out, *ring);
        }
        Event::StateReply { state } => {
            push_u16(&mut out, EVT_TAG_STATE_REPLY);
            push_state(&mut out, state);
        }
        Event::UpdateState { state } => {
            push_u16(&mut out, EVT_TAG_UPDATE_STATE);
            push_state(&mut out, state);
        }
        Event::TransferBufferCreated { id } => {
            push_u16(&mut out, EVT_TAG_TRANSFER_BUFFER_CREATED);
            push_u32(&mut out, *id as u32);
        }
        Event::TransferBufferInfo { handle, size } => {
            push_u16(&mut out, EVT_TAG_TRANSFER_BUFFER_INFO);
            push_u32(&mut out, *handle);
            push_u32(&mut out, *size);
        }
        Event::Done => push_u16(&mut out, EVT_TAG_DONE),
        Event::PaintToBackingStoreAck => push_u16(&mut out, EVT_TAG_PAINT_BACKING_ACK),
        Event::PaintToVideoLayerAck => push_u16(&mut out, EVT_TAG_PAINT_VIDEO_ACK),
        Event::NotifyRepaint => push_u16(&mut out, EVT_TAG_NOTIFY_REPAINT),
        Event::CallFailed { fault } => {
            push_u16(&mut out, EVT_TAG_CALL_FAILED);
            push_fault(&mut out, fault);
        }
    }
    out
}

pub fn decode_event(bytes: &[u8]) -> Result<(u32, u32, Event), DecodeError> {
    if bytes.len() > MAX_MESSAGE_BYTES {
        return Err(DecodeError::OversizedPayload);
    }
    let mut r = Reader::new(bytes);
    let seq = r.read_u32()?;
    let route = r.read_u32()?;
    let tag = r.read_u16()?;
    let evt = match tag {
        EVT_TAG_CHANNEL_ESTABLISHED => {
            let channel = r.read_u32()?;
            let vendor_id = r.read_u32()?;
            let device_id = r.read_u32()?;
            let len = r.read_u32()? as usize;
            let version = r.read_bytes(len)?;
            let driver_version = std::str::from_utf8(version)
                .map_err(|_| DecodeError::InvalidUtf8)?
                .to_string();
            let caps = GpuCaps::from_bits(r.read_u32()?).ok_or(DecodeError::InvalidEnum)?;
            Event::ChannelEstablished {
                channel,
                info: GpuInfo {
                    vendor_id,
                    device_id,
                    driver_version,
                    caps,
                },
            }
        }
        EVT_TAG_SYNCHRONIZE_DONE => Event::SynchronizeDone,
        EVT_TAG_VIEW_XID => Event::ViewXid { xid: r.read_u64()? },
        EVT_TAG_CMD_BUFFER_CREATED => Event::CommandBufferCreated {
            route: r.read_u32()?,
        },
        EVT_TAG_INITIALIZED => Event::Initialized { ring: r.read_u32()? },
        EVT_TAG_STATE_REPLY => Event::StateReply {
            state: read_state(&mut r)?,
        },
        EVT_TAG_UPDATE_STATE => Event::UpdateState {
            state: read_state(&mut r)?,
        },
        EVT_TAG_TRANSFER_BUFFER_CREATED => Event::TransferBufferCreated {
            id: r.read_u32()? as i32,
        },
        EVT_TAG_TRANSFER_BUFFER_INFO => Event::TransferBufferInfo {
            handle: r.read_u32()?,
            size: r.read_u32()?,
        },
        EVT_TAG_DONE => Event::Done,
        EVT_TAG_PAINT_BACKING_ACK => Event::PaintToBackingStoreAck,
        EVT_TAG_PAINT_VIDEO_ACK => Event::PaintToVideoLayerAck,
        EVT_TAG_NOTIFY_REPAINT => Event::NotifyRepaint,
        EVT_TAG_CALL_FAILED => Event::CallFailed {
            fault: read_fault(&mut r)?,
        },
        _ => return Err(DecodeError::UnknownTag),
    };
    if r.remaining() != 0 {
        return Err(DecodeError::UnknownTag);
    }
    Ok((seq, route, evt))
}

fn push_u16(out: &mut Vec<u8>, v: u16) {
    out.extend_from_slice(&v.to_le_bytes());
}

fn push_u32(out: &mut Vec<u8>, v: u32) {
    out.extend_from_slice(&v.to_le_bytes());
}

fn push_u64(out: &mut Vec<u8>, v: u64) {
    out.extend_from_slice(&v.to_le_bytes());
}

fn push_size(out: &mut Vec<u8>, size: &Size) {
    push_u32(out, size.width);
    push_u32(out, size.height);
}

fn push_rect(out: &mut Vec<u8>, rect: &Rect) {
    push_u32(out, rect.x as u32);
    push_u32(out, rect.y as u32);
    push_u32(out, rect.width);
    push_u32(out, rect.height);
}

fn push_state(out: &mut Vec<u8>, state: &State) {
    push_u32(out, state.get_offset);
    push_u32(out, state.token);
    out.push(state.error.map_or(0, EndpointError::to_u8));
}

fn push_fault(out: &mut Vec<u8>, fault: &CallFault) {
    match fault {
        CallFault::InvalidHandle => out.push(1),
        CallFault::ResourceExhausted => out.push(2),
        CallFault::Endpoint(e) => {
            out.push(3);
            out.push(e.to_u8());
        }
        CallFault::Unsupported => out.push(4),
    }
}

fn read_size(r: &mut Reader<'_>) -> Result<Size, DecodeError> {
    Ok(Size {
        width: r.read_u32()?,
        height: r.read_u32()?,
    })
}

fn read_rect(r: &mut Reader<'_>) -> Result<Rect, DecodeError> {
    Ok(Rect {
        x: r.read_u32()? as i32,
        y: r.read_u32()? as i32,
        width: r.read_u32()?,
        height: r.read_u32()?,
    })
}

fn read_state(r: &mut Reader<'_>) -> Result<State, DecodeError> {
    let get_offset = r.read_u32()?;
    let token = r.read_u32()?;
    let error = match r.read_u8()? {
        0 => None,
        code => Some(EndpointError::from_u8(code).ok_or(DecodeError::InvalidEnum)?),
    };
    Ok(State {
        get_offset,
        token,
        error,
    })
}

fn read_fault(r: &mut Reader<'_>) -> Result<CallFault, DecodeError> {
    Ok(match r.read_u8()? {
        1 => CallFault::InvalidHandle,
        2 => CallFault::ResourceExhausted,
        3 => CallFault::Endpoint(
            EndpointError::from_u8(r.read_u8()?).ok_or(DecodeError::InvalidEnum)?,
        ),
        4 => CallFault::Unsupported,
        _ => return Err(DecodeError::InvalidEnum),
    })
}

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.bytes.len().saturating_sub(self.pos)
    }

    fn read_u8(&mut self) -> Result<u8, DecodeError> {
        let b = *self.bytes.get(self.pos).ok_or(DecodeError::UnexpectedEof)?;
        self.pos += 1;
        Ok(b)
    }

    fn read_u16(&mut self) -> Result<u16, DecodeError> {
        let bytes = self.read_bytes(2)?;
        Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
    }

    fn read_u32(&mut self) -> Result<u32, DecodeError> {
        let bytes = self.read_bytes(4)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn read_u64(&mut self) -> Result<u64, DecodeError> {
        let bytes = self.read_bytes(8)?;
        Ok(u64::from_le_bytes([
            bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
        ]))
    }

    fn read_bytes(&mut self, len: usize) -> Result<&'a [u8], DecodeError> {
        if self.remaining() < len {
            return Err(DecodeError::UnexpectedEof);
        }
        let start = self.pos;
        self.pos += len;
        Ok(&self.bytes[start..start + len])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_carries_seq_and_route() {
        let bytes = encode_request(7, 42, &Request::Flush { put_offset: 1024 });
        let (seq, route, req) = decode_request(&bytes).unwrap();
        assert_eq!(seq, 7);
        assert_eq!(route, 42);
        assert_eq!(req, Request::Flush { put_offset: 1024 });
    }

    #[test]
    fn paint_request_with_copy_rects_decodes() {
        let req = Request::PaintToBackingStore {
            process_id: 12,
            bitmap: 5,
            bitmap_rect: Rect::new(0, 0, 64, 32),
            copy_rects: vec![Rect::new(0, 0, 16, 16), Rect::new(-4, 8, 16, 16)],
        };
        let bytes = encode_request(9, 3, &req);
        assert_eq!(decode_request(&bytes).unwrap(), (9, 3, req));
    }

    #[test]
    fn paint_request_with_bogus_rect_count_fails_cleanly() {
        let req = Request::PaintToBackingStore {
            process_id: 1,
            bitmap: 1,
            bitmap_rect: Rect::new(0, 0, 8, 8),
            copy_rects: vec![],
        };
        let mut bytes = encode_request(1, 1, &req);
        // Overwrite the rect count (last 4 bytes) with a huge value.
        let len = bytes.len();
        bytes[len - 4..].copy_from_slice(&u32::MAX.to_le_bytes());
        assert_eq!(decode_request(&bytes), Err(DecodeError::UnexpectedEof));
    }

    #[test]
    fn channel_established_round_trips_info() {
        let evt = Event::ChannelEstablished {
            channel: 88,
            info: GpuInfo {
                vendor_id: 0x10DE,
                device_id: 0x2204,
                driver_version: String::from("535.154.05"),
                caps: GpuCaps::OFFSCREEN_SURFACES | GpuCaps::VIDEO_LAYERS,
            },
        };
        let bytes = encode_event(2, ROUTE_CONTROL, &evt);
        assert_eq!(decode_event(&bytes).unwrap(), (2, ROUTE_CONTROL, evt));
    }

    #[test]
    fn state_error_codes_survive_the_wire() {
        for error in [
            None,
            Some(EndpointError::InvalidOffset),
            Some(EndpointError::MalformedCommand),
            Some(EndpointError::ParentLost),
            Some(EndpointError::ContextLost),
        ] {
            let evt = Event::UpdateState {
                state: State {
                    get_offset: 4096,
                    token: 17,
                    error,
                },
            };
            let bytes = encode_event(0, 42, &evt);
            assert_eq!(decode_event(&bytes).unwrap(), (0, 42, evt));
        }
    }

    #[test]
    fn unknown_tag_and_trailing_bytes_are_rejected() {
        let mut bytes = encode_request(1, 0, &Request::Synchronize);
        bytes.push(0);
        assert_eq!(decode_request(&bytes), Err(DecodeError::UnknownTag));

        let bytes = encode_event(1, 0, &Event::Done);
        assert_eq!(decode_request(&bytes), Err(DecodeError::UnknownTag));
    }

    #[test]
    fn truncated_message_is_eof() {
        let bytes = encode_request(3, 0, &Request::EstablishChannel { renderer_id: 7 });
        assert_eq!(
            decode_request(&bytes[..bytes.len() - 1]),
            Err(DecodeError::UnexpectedEof)
        );
        assert_eq!(decode_request(&[]), Err(DecodeError::UnexpectedEof));
    }

    #[test]
    fn oversized_message_is_rejected_before_parsing() {
        let bytes = vec![0u8; MAX_MESSAGE_BYTES + 1];
        assert_eq!(decode_request(&bytes), Err(DecodeError::OversizedPayload));
        assert_eq!(decode_event(&bytes), Err(DecodeError::OversizedPayload));
    }

    #[test]
    fn call_failed_faults_round_trip() {
        for fault in [
            CallFault::InvalidHandle,
            CallFault::ResourceExhausted,
            CallFault::Endpoint(EndpointError::ParentLost),
            CallFault::Unsupported,
        ] {
            let bytes = encode_event(5, 9, &Event::CallFailed { fault });
            assert_eq!(decode_event(&bytes).unwrap(), (5, 9, Event::CallFailed { fault }));
        }
    }
}
