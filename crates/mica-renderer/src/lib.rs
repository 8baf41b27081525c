//! Content-process side of the mica GPU channel.
//!
//! [`GpuProcessHost`] speaks the control path (channel establishment, the
//! synchronization barrier, native views). [`GpuChannelHost`] is one
//! established channel, multiplexing command buffer proxies and paint
//! traffic over a single transport. [`CommandBufferProxy`] is the producer
//! half of one endpoint, and [`TransportBitmap`] carries paint payloads under
//! the ACK-gated reuse discipline.

mod bitmap;
mod channel_host;
mod host;
mod proxy;

pub use bitmap::{BitmapError, PaintError, TransportBitmap};
pub use channel_host::{GpuChannelHost, PaintPending};
pub use host::GpuProcessHost;
pub use proxy::CommandBufferProxy;
