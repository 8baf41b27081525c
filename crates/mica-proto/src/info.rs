//! GPU process identification returned when a channel is established.

use bitflags::bitflags;

bitflags! {
    /// Capabilities the GPU process advertises to a new channel.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct GpuCaps: u32 {
        /// Offscreen command buffer endpoints (and parent texture borrowing).
        const OFFSCREEN_SURFACES = 1 << 0;
        /// YUV video layers next to backing stores.
        const VIDEO_LAYERS = 1 << 1;
        /// Native view registration (`NewRenderWidgetHostView`).
        const NATIVE_VIEWS = 1 << 2;
        /// Native window id lookup (`GetViewXid`); only meaningful on
        /// windowing systems that expose one.
        const VIEW_XID = 1 << 3;
    }
}

/// Identification and capability record for the GPU process.
///
/// Carried in the `ChannelEstablished` reply so the content side can log it
/// and gate optional calls before issuing them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GpuInfo {
    pub vendor_id: u32,
    pub device_id: u32,
    pub driver_version: String,
    pub caps: GpuCaps,
}

impl Default for GpuInfo {
    fn default() -> Self {
        Self {
            vendor_id: 0,
            device_id: 0,
            driver_version: String::from("0.0"),
            caps: GpuCaps::all(),
        }
    }
}

impl GpuInfo {
    pub fn supports(&self, caps: GpuCaps) -> bool {
        self.caps.contains(caps)
    }
}
