//! GPU-process-side surfaces: backing stores (BGRA) and video layers (YUV).
//!
//! A backing store mirrors one host window region and is updated by bitmap
//! blits out of shared memory; a video layer carries I420 frames. Creating a
//! surface again under the same routing id reallocates it and discards the
//! old contents (documented resolution of the resize ambiguity; the paint
//! protocol repaints everything after a resize anyway).

use mica_ipc::shmem::SharedMemory;
use mica_proto::{CallFault, Rect, Size};

const BYTES_PER_PIXEL: usize = 4;

/// Bytes of an I420 frame for `size` (Y plane plus two quarter chroma
/// planes, odd dimensions rounded up).
pub fn i420_frame_bytes(size: Size) -> usize {
    let luma = size.area();
    let chroma = (size.width as usize).div_ceil(2) * (size.height as usize).div_ceil(2);
    luma + 2 * chroma
}

pub struct BackingStore {
    size: Size,
    pixels: Vec<u8>,
    window_painted: bool,
}

impl BackingStore {
    pub fn new(size: Size) -> Self {
        Self {
            size,
            pixels: vec![0; size.area() * BYTES_PER_PIXEL],
            window_painted: false,
        }
    }

    pub fn size(&self) -> Size {
        self.size
    }

    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }

    /// Reallocate for a new size. Old contents are discarded.
    pub fn resize_discard(&mut self, size: Size) {
        self.size = size;
        self.pixels = vec![0; size.area() * BYTES_PER_PIXEL];
        self.window_painted = false;
    }

    /// Composite a shared BGRA bitmap covering `bitmap_rect` into the surface
    /// at each of `copy_rects` (surface coordinates, clipped to both the
    /// bitmap and the surface).
    pub fn paint(
        &mut self,
        bitmap: &SharedMemory,
        bitmap_rect: Rect,
        copy_rects: &[Rect],
    ) -> Result<(), CallFault> {
        if bitmap_rect.is_empty() {
            return Ok(());
        }
        let stride = bitmap_rect.width as usize * BYTES_PER_PIXEL;
        if bitmap.len() < stride * bitmap_rect.height as usize {
            // The transport handle does not cover the advertised rect.
            return Err(CallFault::InvalidHandle);
        }

        let bounds = Rect::from_size(self.size);
        for copy_rect in copy_rects {
            let dst = copy_rect.intersect(&bounds).intersect(&bitmap_rect);
            if dst.is_empty() {
                continue;
            }
            let mut row = vec![0u8; dst.width as usize * BYTES_PER_PIXEL];
            for y in 0..dst.height as usize {
                let src_x = (dst.x - bitmap_rect.x) as usize;
                let src_y = (dst.y - bitmap_rect.y) as usize + y;
                bitmap.read_bytes(src_y * stride + src_x * BYTES_PER_PIXEL, &mut row);

                let dst_offset = ((dst.y as usize + y) * self.size.width as usize
                    + dst.x as usize)
                    * BYTES_PER_PIXEL;
                self.pixels[dst_offset..dst_offset + row.len()].copy_from_slice(&row);
            }
        }
        Ok(())
    }

    /// Shift pixels inside `clip_rect` by `(dx, dy)`. The exposed strip keeps
    /// its old contents; the host follows up with a paint for it.
    pub fn scroll(&mut self, dx: i32, dy: i32, clip_rect: Rect, view_size: Size) {
        let bounds = Rect::from_size(self.size).intersect(&Rect::from_size(view_size));
        let clip = clip_rect.intersect(&bounds);
        if clip.is_empty() || (dx == 0 && dy == 0) {
            return;
        }

        // Snapshot the clip region, then write it back displaced; simple and
        // correct for overlapping moves in either direction.
        let clip_stride = clip.width as usize * BYTES_PER_PIXEL;
        let mut snapshot = vec![0u8; clip_stride * clip.height as usize];
        for y in 0..clip.height as usize {
            let src = ((clip.y as usize + y) * self.size.width as usize + clip.x as usize)
                * BYTES_PER_PIXEL;
            snapshot[y * clip_stride..(y + 1) * clip_stride]
                .copy_from_slice(&self.pixels[src..src + clip_stride]);
        }

        let dst_rect = clip.translate(dx, dy).intersect(&clip);
        if dst_rect.is_empty() {
            return;
        }
        for y in 0..dst_rect.height as usize {
            let snap_x = (dst_rect.x - dx - clip.x) as usize;
            let snap_y = (dst_rect.y - dy - clip.y) as usize + y;
            let src = snap_y * clip_stride + snap_x * BYTES_PER_PIXEL;
            let len = dst_rect.width as usize * BYTES_PER_PIXEL;

            let dst = ((dst_rect.y as usize + y) * self.size.width as usize
                + dst_rect.x as usize)
                * BYTES_PER_PIXEL;
            self.pixels[dst..dst + len].copy_from_slice(&snapshot[src..src + len]);
        }
    }

    /// The host finished compositing the window this surface mirrors.
    pub fn set_window_painted(&mut self) {
        self.window_painted = true;
    }

    pub fn window_painted(&self) -> bool {
        self.window_painted
    }
}

pub struct VideoLayer {
    size: Size,
    frame: Vec<u8>,
    frames_delivered: u64,
}

impl VideoLayer {
    pub fn new(size: Size) -> Self {
        Self {
            size,
            frame: vec![0; i420_frame_bytes(size)],
            frames_delivered: 0,
        }
    }

    pub fn size(&self) -> Size {
        self.size
    }

    pub fn frame(&self) -> &[u8] {
        &self.frame
    }

    pub fn frames_delivered(&self) -> u64 {
        self.frames_delivered
    }

    /// Reallocate for a new size. Old contents are discarded.
    pub fn resize_discard(&mut self, size: Size) {
        self.size = size;
        self.frame = vec![0; i420_frame_bytes(size)];
        self.frames_delivered = 0;
    }

    /// Replace the frame from a shared I420 buffer. Only whole-layer blits
    /// are supported; video frames arrive full-size.
    pub fn paint(&mut self, bitmap: &SharedMemory, bitmap_rect: Rect) -> Result<(), CallFault> {
        if bitmap_rect != Rect::from_size(self.size) {
            return Err(CallFault::Unsupported);
        }
        let frame_bytes = i420_frame_bytes(self.size);
        if bitmap.len() < frame_bytes {
            return Err(CallFault::InvalidHandle);
        }
        bitmap.read_bytes(0, &mut self.frame[..frame_bytes]);
        self.frames_delivered += 1;
        Ok(())
    }
}
