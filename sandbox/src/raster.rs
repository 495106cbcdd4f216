//! Zero-copy view over a decoded raster in guest memory.

use std::fmt;
use std::ops::Deref;

use crate::error::{BridgeError, Result};
use crate::memory::GuestPtr;
use crate::session::Session;

/// A decoded RGBA raster, borrowed directly from guest memory.
///
/// The view pairs the guest buffer with the capability to free it. It keeps
/// the instance's call guard for its whole lifetime, so no other guest call
/// can grow or reuse the memory it points into. Other threads using the same
/// instance block until the view is released or dropped. On the thread that
/// holds the view, calls on the same instance fail with
/// [`BridgeError::Reentrant`] instead.
///
/// [`RasterView::release`] frees the buffer and reports failure; dropping the
/// view frees it best-effort.
pub struct RasterView<'a> {
    session: Option<Session<'a>>,
    ptr: GuestPtr,
    width: u32,
    height: u32,
}

impl<'a> RasterView<'a> {
    pub(crate) fn new(session: Session<'a>, ptr: GuestPtr, width: u32, height: u32) -> Self {
        Self {
            session: Some(session),
            ptr,
            width,
            height,
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    /// Size of the raster in bytes, four per pixel.
    pub fn byte_len(&self) -> u64 {
        u64::from(self.width) * u64::from(self.height) * 4
    }

    /// RGBA components of the pixel at column `x`, row `y` (top-left origin).
    pub fn pixel(&self, x: u32, y: u32) -> Option<[u8; 4]> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let offset = (u64::from(y) * u64::from(self.width) + u64::from(x)) as usize * 4;
        let bytes = self.as_bytes().get(offset..offset + 4)?;
        Some([bytes[0], bytes[1], bytes[2], bytes[3]])
    }

    /// Guest pointer of the raster. Only meaningful while the view lives.
    pub fn guest_ptr(&self) -> GuestPtr {
        self.ptr
    }

    fn as_bytes(&self) -> &[u8] {
        match &self.session {
            Some(session) => session.view(self.ptr, self.byte_len()).unwrap_or(&[]),
            None => &[],
        }
    }

    /// Copy the raster out of guest memory and free the guest buffer.
    pub fn to_vec(self) -> Result<Vec<u8>> {
        let bytes = self.as_bytes().to_vec();
        self.release()?;
        Ok(bytes)
    }

    /// Free the guest buffer.
    pub fn release(mut self) -> Result<()> {
        let mut session = self.session.take().ok_or(BridgeError::Closed("raster view"))?;
        session.release(self.ptr)
    }
}

impl Deref for RasterView<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.as_bytes()
    }
}

impl fmt::Debug for RasterView<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RasterView")
            .field("ptr", &self.ptr)
            .field("width", &self.width)
            .field("height", &self.height)
            .finish()
    }
}

impl Drop for RasterView<'_> {
    fn drop(&mut self) {
        if let Some(mut session) = self.session.take() {
            if let Err(e) = session.release(self.ptr) {
                tracing::warn!(ptr = self.ptr, error = %e, "releasing raster on drop");
            }
        }
    }
}
