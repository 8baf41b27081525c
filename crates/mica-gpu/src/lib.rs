//! GPU-process side of the mica channel: channel directory, per-channel
//! dispatch, command buffer stubs, transfer buffers, and paint surfaces.
//!
//! The crate services the protocol; it does not interpret commands. Drained
//! command records go to a [`CommandSink`] the embedder supplies (the real
//! decoder/GL engine lives behind that trait).

mod channel;
mod directory;
mod service;
mod sink;
mod stub;
mod surface;
mod transfer;

pub use directory::ChannelDirectory;
pub use service::{GpuService, ServiceConfig, SinkFactory};
pub use sink::{CommandSink, NullSink, RecordingSink, SinkError};
pub use surface::{i420_frame_bytes, BackingStore, VideoLayer};
