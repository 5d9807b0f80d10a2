use std::rc::Rc;

use crate::region::Region;

/// A window into a [`Region`]: the unit of buffer composition.
///
/// A page holds one strong share of its region and a `(off, len)` view that
/// always lies inside the region's extent. Pages never travel between
/// buffers; transferring data between buffers creates new pages over the
/// same region. A page created by [`Page::transfer`] is marked, since its
/// storage is assumed shared with the source.
pub struct Page {
    region: Rc<Region>,
    off: usize,
    len: usize,
    is_transfer: bool,
}

impl Page {
    /// Adopt a whole region as the page window.
    pub fn new(region: Rc<Region>) -> Page {
        let len = region.len();
        Page {
            region,
            off: 0,
            len,
            is_transfer: false,
        }
    }

    /// A window of `len` bytes at `off` into the region.
    pub(crate) fn windowed(region: Rc<Region>, off: usize, len: usize) -> Page {
        debug_assert!(off + len <= region.len());
        Page {
            region,
            off,
            len,
            is_transfer: false,
        }
    }

    /// Form a page whose window covers `len` bytes starting `src_off` into
    /// the source page's window, sharing the source's region.
    pub fn transfer(src: &Page, len: usize, src_off: usize) -> Page {
        debug_assert!(src_off + len <= src.len);
        Page {
            region: src.region.clone(),
            off: src.off + src_off,
            len,
            is_transfer: true,
        }
    }

    /// Replace the page's region, resetting the window to the full new
    /// extent and clearing the transfer mark.
    pub(crate) fn set_region(&mut self, region: Rc<Region>) {
        self.off = 0;
        self.len = region.len();
        self.is_transfer = false;
        self.region = region;
    }

    /// Move the window onto another region at an explicit position.
    pub(crate) fn rewindow(&mut self, region: Rc<Region>, off: usize, len: usize) {
        debug_assert!(off + len <= region.len());
        self.off = off;
        self.len = len;
        self.region = region;
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_transfer(&self) -> bool {
        self.is_transfer
    }

    pub(crate) fn region(&self) -> &Rc<Region> {
        &self.region
    }

    pub(crate) fn region_off(&self) -> usize {
        self.off
    }

    pub(crate) fn base_ptr(&self) -> *mut u8 {
        // Window invariant: off + len <= region.len
        unsafe { self.region.base().add(self.off) }
    }

    /// The bytes currently visible through the window.
    pub fn data(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.base_ptr(), self.len) }
    }

    /// Advance the window start, shrinking it from the front.
    pub(crate) fn advance(&mut self, n: usize) {
        debug_assert!(n <= self.len);
        self.off += n;
        self.len -= n;
    }

    /// Shrink the window from the back.
    pub(crate) fn shrink(&mut self, n: usize) {
        debug_assert!(n <= self.len);
        self.len -= n;
    }

    /// Cap the window length.
    pub(crate) fn truncate(&mut self, len: usize) {
        debug_assert!(len <= self.len);
        self.len = len;
    }
}

impl std::fmt::Debug for Page {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Page")
            .field("off", &self.off)
            .field("len", &self.len)
            .field("is_transfer", &self.is_transfer)
            .finish()
    }
}
