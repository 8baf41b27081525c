//! Message catalog and shared types for the mica GPU channel.
//!
//! Everything that crosses the process boundary is defined here: the
//! request/event catalog with its wire encoding, endpoint [`State`], the
//! error taxonomy, geometry, and the GPU identification record. The crate has
//! no runtime of its own; both processes depend on it so the contract lives
//! in one place.

pub mod geom;
pub mod info;
pub mod state;
pub mod wire;

pub use geom::{Rect, Size};
pub use info::{GpuCaps, GpuInfo};
pub use state::{CallError, CallFault, EndpointError, State};
pub use wire::{
    decode_event, decode_request, encode_event, encode_request, DecodeError, Event, Request,
    MAX_MESSAGE_BYTES, PARENT_NONE, ROUTE_CONTROL,
};
