//! Presentation targets.
//!
//! Window creation and event handling live outside this crate. A window is
//! handed in as a [`WindowSource`] and addressed afterwards by [`WindowId`].

use nyx_core::Extent2D;
use parking_lot::{Mutex, RwLock};
use raw_window_handle::{RawDisplayHandle, RawWindowHandle};
use std::sync::Arc;

/// Something a swapchain can present to.
pub trait WindowSource: Send + Sync {
    /// Current drawable size in pixels.
    fn extent(&self) -> Extent2D;

    /// Native handles for surface creation. `None` for targets without a
    /// native window, which only the host backend can present to.
    fn raw_handles(&self) -> Option<(RawDisplayHandle, RawWindowHandle)>;
}

/// Index of a registered window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WindowId(pub(crate) u32);

impl WindowId {
    pub const fn index(self) -> u32 {
        self.0
    }
}

/// Windows known to a context.
#[derive(Default)]
pub struct WindowRegistry {
    windows: RwLock<Vec<Arc<dyn WindowSource>>>,
}

impl WindowRegistry {
    pub fn register(&self, window: Arc<dyn WindowSource>) -> WindowId {
        let mut windows = self.windows.write();
        windows.push(window);
        WindowId((windows.len() - 1) as u32)
    }

    pub fn get(&self, id: WindowId) -> Option<Arc<dyn WindowSource>> {
        self.windows.read().get(id.0 as usize).cloned()
    }

    pub fn len(&self) -> usize {
        self.windows.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A presentation target without a native window.
///
/// Its extent is set by the owner, which makes resize handling testable
/// without a display.
#[derive(Debug)]
pub struct VirtualWindow {
    extent: Mutex<Extent2D>,
}

impl VirtualWindow {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            extent: Mutex::new(Extent2D::new(width, height)),
        }
    }

    pub fn resize(&self, width: u32, height: u32) {
        *self.extent.lock() = Extent2D::new(width, height);
    }
}

impl WindowSource for VirtualWindow {
    fn extent(&self) -> Extent2D {
        *self.extent.lock()
    }

    fn raw_handles(&self) -> Option<(RawDisplayHandle, RawWindowHandle)> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_hands_out_sequential_ids() {
        let registry = WindowRegistry::default();
        let a = registry.register(Arc::new(VirtualWindow::new(4, 4)));
        let b = registry.register(Arc::new(VirtualWindow::new(8, 8)));
        assert_eq!(a.index(), 0);
        assert_eq!(b.index(), 1);
        assert_eq!(registry.get(b).unwrap().extent(), Extent2D::new(8, 8));
        assert!(registry.get(WindowId(5)).is_none());
    }

    #[test]
    fn virtual_window_resizes() {
        let window = VirtualWindow::new(16, 9);
        window.resize(32, 18);
        assert_eq!(window.extent(), Extent2D::new(32, 18));
    }
}
