use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{IoSlice, Write};
use std::path::{Path, PathBuf};
use std::ptr::NonNull;
use std::rc::{Rc, Weak};

use fs4::fs_std::FileExt;
use log::{debug, trace, warn};
use memmap2::{MmapOptions, MmapRaw};

use crate::buffer::PageBuffer;
use crate::error::Error;
use crate::page::Page;
use crate::region::Region;

/// Granularity of file windows: mapping offsets are aligned down to this.
pub const MMAP_UNIT: u64 = 4096;

// The source buffer of a vectored append is chained into at most this many
// segments per call; anything beyond is reported as unwritten.
const MAX_APPEND_SEGMENTS: usize = 1024;

/// What opening the backing file does to existing content.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OpenAction {
    /// Keep existing file content; it becomes the buffer's initial data.
    Append,
    /// Truncate the file on open.
    Overwrite,
}

/// What happens to the backing file when the buffer fully shuts down.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CloseAction {
    Retain,
    Remove,
}

/// Open a file-backed buffer over `path`.
///
/// The file is opened read-write, create, append-mode (user and group
/// read-write on unix) and locked for exclusive use. Bytes in
/// `[head_offset, file_size)` are the buffer's logical data; the file is
/// otherwise opaque. Pages materialise lazily as windows into mappings of
/// the file, keyed by [`MMAP_UNIT`]-aligned offsets.
pub fn open(
    path: impl AsRef<Path>,
    open_action: OpenAction,
    close_action: CloseAction,
) -> Result<PageBuffer, Error> {
    let page_size = page_size::get();
    if page_size == 0 || MMAP_UNIT % (page_size as u64) != 0 {
        return Err(Error::PageSize {
            page_size,
            unit: MMAP_UNIT,
        });
    }

    let path = path.as_ref().to_path_buf();
    let mut opts = OpenOptions::new();
    opts.read(true).append(true).create(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        opts.mode(0o660);
    }
    let file = opts.open(&path).map_err(Error::Open)?;
    file.try_lock_exclusive().map_err(Error::Lock)?;
    if open_action == OpenAction::Overwrite {
        file.set_len(0).map_err(Error::Truncate)?;
    }
    debug!("opened file-backed buffer over {:?}", path);

    Ok(PageBuffer::file_backed(Rc::new(MmapShared {
        file,
        path,
        head_offset: Cell::new(0),
        table: RefCell::new(BTreeMap::new()),
        close_action,
    })))
}

/// Shared state of a file-backed buffer: the file, the logical head offset,
/// and the table of live mappings keyed by aligned file offset.
///
/// Held by the buffer and by every live mapping region; the file is closed
/// (and for [`CloseAction::Remove`], unlinked) when the last holder drops.
pub(crate) struct MmapShared {
    file: File,
    path: PathBuf,
    head_offset: Cell<u64>,
    table: RefCell<BTreeMap<u64, Weak<Region>>>,
    close_action: CloseAction,
}

impl MmapShared {
    pub(crate) fn file_size(&self) -> u64 {
        match self.file.metadata() {
            Ok(meta) => meta.len(),
            Err(err) => {
                warn!("stat of the backing file failed: {err}");
                0
            }
        }
    }

    pub(crate) fn data_size(&self) -> u64 {
        self.file_size().saturating_sub(self.head_offset.get())
    }

    /// Drop the table entry for a dying mapping. Obsolete mappings were
    /// already replaced and never reach here.
    pub(crate) fn forget_mapping(&self, mmap_offset: u64) {
        trace!("unmapping window at 0x{mmap_offset:x}");
        self.table.borrow_mut().remove(&mmap_offset);
    }

    fn map_region(self: &Rc<Self>, mmap_offset: u64, len: u64) -> Option<Rc<Region>> {
        if len == 0 {
            return None;
        }
        let map = match MmapOptions::new()
            .offset(mmap_offset)
            .len(len as usize)
            .map_raw(&self.file)
        {
            Ok(map) => map,
            Err(err) => {
                warn!("mapping 0x{len:x} bytes at 0x{mmap_offset:x} failed: {err}");
                return None;
            }
        };
        trace!("mapped window at 0x{mmap_offset:x} len 0x{len:x}");
        let region = Region::mapped(MmapExtent {
            map,
            shared: self.clone(),
            file_offset: mmap_offset,
            obsolete: Cell::new(false),
        });
        self.table
            .borrow_mut()
            .insert(mmap_offset, Rc::downgrade(&region));
        Some(region)
    }

    /// The live mapping covering `mmap_offset`, building or rebuilding one
    /// as needed. A mapping shorter than [`MMAP_UNIT`] whose file has since
    /// grown past its end is replaced by a larger one; the old mapping is
    /// marked obsolete and lives on only for its outstanding pages.
    fn lookup_or_map(self: &Rc<Self>, mmap_offset: u64, file_size: u64) -> Option<Rc<Region>> {
        let existing = self
            .table
            .borrow()
            .get(&mmap_offset)
            .and_then(Weak::upgrade);
        if let Some(region) = existing {
            let map_len = region.len() as u64;
            if map_len >= MMAP_UNIT || mmap_offset + map_len >= file_size {
                return Some(region);
            }
            trace!("growing short window at 0x{mmap_offset:x}");
            region.mark_obsolete();
        }
        self.map_region(mmap_offset, MMAP_UNIT.min(file_size - mmap_offset))
    }

    #[cfg(test)]
    fn mapping_count(&self) -> usize {
        self.table.borrow().len()
    }

    #[cfg(test)]
    fn mapping_len(&self, mmap_offset: u64) -> Option<usize> {
        self.table
            .borrow()
            .get(&mmap_offset)
            .and_then(Weak::upgrade)
            .map(|r| r.len())
    }
}

impl Drop for MmapShared {
    fn drop(&mut self) {
        debug_assert!(self.table.borrow().is_empty());
        debug!("closing file-backed buffer over {:?}", self.path);
        if self.close_action == CloseAction::Remove {
            if let Err(err) = fs::remove_file(&self.path) {
                warn!("removing {:?} failed: {err}", self.path);
            }
        }
    }
}

/// One mapped window of the backing file, owned by a [`Region`].
///
/// While live and current it is registered in the shared table under its
/// aligned offset; marked obsolete it is already out of the table and dies
/// with its last page.
pub(crate) struct MmapExtent {
    map: MmapRaw,
    shared: Rc<MmapShared>,
    file_offset: u64,
    obsolete: Cell<bool>,
}

impl MmapExtent {
    pub(crate) fn base(&self) -> NonNull<u8> {
        NonNull::new(self.map.as_mut_ptr()).expect("mapping with a null base")
    }

    pub(crate) fn len(&self) -> usize {
        self.map.len()
    }

    pub(crate) fn file_offset(&self) -> u64 {
        self.file_offset
    }

    pub(crate) fn mark_obsolete(&self) {
        self.obsolete.set(true);
    }

    pub(crate) fn is_obsolete(&self) -> bool {
        self.obsolete.get()
    }
}

impl Drop for MmapExtent {
    fn drop(&mut self) {
        if !self.obsolete.get() {
            self.shared.forget_mapping(self.file_offset);
        }
        // MmapRaw unmaps when it drops.
    }
}

// ---- lazy page materialisation ----

/// Map the next file window past `last` (or the head window when the chain
/// is empty) and wrap it in a page. `None` at end of file.
pub(crate) fn page_map_forward(shared: &Rc<MmapShared>, last: Option<&Page>) -> Option<Page> {
    let file_size = shared.file_size();
    let file_offset = match last {
        Some(page) => {
            let region_offset = page
                .region()
                .file_offset()
                .expect("file-backed chain holds a heap page");
            region_offset + page.region_off() as u64 + page.len() as u64
        }
        None => shared.head_offset.get(),
    };
    if file_offset >= file_size {
        return None;
    }
    let mmap_offset = file_offset - (file_offset % MMAP_UNIT);
    let region = shared.lookup_or_map(mmap_offset, file_size)?;
    let start = (file_offset - mmap_offset) as usize;
    if start >= region.len() {
        return None;
    }
    let len = region.len() - start;
    Some(Page::windowed(region, start, len))
}

/// Map the file window ending where `first` begins (or the tail window when
/// the chain is empty). `None` at the head of the data.
pub(crate) fn page_map_backward(shared: &Rc<MmapShared>, first: Option<&Page>) -> Option<Page> {
    let file_size = shared.file_size();
    let head_offset = shared.head_offset.get();
    let file_current = match first {
        Some(page) => {
            let region_offset = page
                .region()
                .file_offset()
                .expect("file-backed chain holds a heap page");
            region_offset + page.region_off() as u64
        }
        None => file_size,
    };
    if file_current <= head_offset {
        return None;
    }
    let mut mmap_offset = file_current - (file_current % MMAP_UNIT);
    if file_current == mmap_offset {
        mmap_offset -= MMAP_UNIT;
    }
    let file_offset = mmap_offset.max(head_offset);
    let region = shared.lookup_or_map(mmap_offset, file_size)?;
    let start = (file_offset - mmap_offset) as usize;
    let len = (file_current - file_offset) as usize;
    if start + len > region.len() {
        return None;
    }
    Some(Page::windowed(region, start, len))
}

// ---- buffer operation overrides ----

/// Grow the file; the new bytes materialise as pages through iteration.
pub(crate) fn extend(buffer: &mut PageBuffer, len: u64) -> u64 {
    let shared = buffer.mmap_shared().expect("mmap op on a heap buffer").clone();
    let file_size = shared.file_size();
    match shared.file.set_len(file_size + len) {
        Ok(()) => len,
        Err(err) => {
            warn!("extending the backing file failed: {err}");
            0
        }
    }
}

/// Move the head offset back toward the file start, re-exposing bytes that
/// were seeked past. The cached chain is discarded.
pub(crate) fn rewind(buffer: &mut PageBuffer, len: u64) -> u64 {
    let shared = buffer.mmap_shared().expect("mmap op on a heap buffer").clone();
    let head = shared.head_offset.get();
    let moved = len.min(head);
    if moved == 0 {
        return 0;
    }
    shared.head_offset.set(head - moved);
    buffer.discard_cache();
    buffer.bump_revision();
    moved
}

/// Advance the head offset, consuming data from the front. The cached chain
/// is discarded.
pub(crate) fn seek(buffer: &mut PageBuffer, len: u64) -> u64 {
    let shared = buffer.mmap_shared().expect("mmap op on a heap buffer").clone();
    let moved = len.min(shared.data_size());
    if moved == 0 {
        return 0;
    }
    shared.head_offset.set(shared.head_offset.get() + moved);
    buffer.discard_cache();
    buffer.bump_revision();
    moved
}

/// Shorten the file from the tail. Mappings past the new end are removed
/// from the table and marked obsolete; a mapping straddling the new end is
/// rebuilt at the shorter length, and cached pages over a displaced mapping
/// are moved onto its replacement. Pages past the new end are dropped.
pub(crate) fn trim(buffer: &mut PageBuffer, len: u64) -> u64 {
    let shared = buffer.mmap_shared().expect("mmap op on a heap buffer").clone();
    let file_size = shared.file_size();
    let len = len.min(file_size.saturating_sub(shared.head_offset.get()));
    if len == 0 {
        return 0;
    }
    let new_size = file_size - len;

    // Every mapping intersecting the trimmed range sits at or above the
    // aligned new end.
    let cut = new_size - (new_size % MMAP_UNIT);
    let keys: Vec<u64> = shared.table.borrow().range(cut..).map(|(k, _)| *k).collect();
    let mut displaced: Vec<(Rc<Region>, Option<Rc<Region>>)> = Vec::new();
    for key in keys {
        let region = shared.table.borrow().get(&key).and_then(Weak::upgrade);
        let Some(region) = region else { continue };
        let map_end = key + region.len() as u64;
        if map_end <= new_size {
            continue;
        }
        shared.table.borrow_mut().remove(&key);
        region.mark_obsolete();
        let replacement = if key < new_size {
            trace!("splitting window at 0x{key:x} at new end 0x{new_size:x}");
            shared.map_region(key, new_size - key)
        } else {
            None
        };
        displaced.push((region, replacement));
    }

    if let Err(err) = shared.file.set_len(new_size) {
        warn!("trimming the backing file failed: {err}");
        return 0;
    }

    // Fix the cached chain: drop pages past the new end, shrink the one the
    // new end falls into, and move windows off displaced mappings.
    let mut slot = buffer.ring.tail();
    while slot != crate::ring::SENTINEL {
        let prev = buffer.ring.prev(slot);
        let (page_start, page_len, region) = {
            let page = buffer.ring.page(slot).expect("ring slot without a page");
            let region_offset = page
                .region()
                .file_offset()
                .expect("file-backed chain holds a heap page");
            (
                region_offset + page.region_off() as u64,
                page.len() as u64,
                page.region().clone(),
            )
        };
        if page_start >= new_size {
            buffer.ring.unlink(slot);
            slot = prev;
            continue;
        }
        let page = buffer.ring.page_mut(slot).expect("ring slot without a page");
        if page_start + page_len > new_size {
            page.shrink((page_start + page_len - new_size) as usize);
        }
        if let Some((_, Some(replacement))) = displaced
            .iter()
            .find(|(old, _)| Rc::ptr_eq(old, &region))
        {
            let off = (page_start - replacement.file_offset().unwrap()) as usize;
            let window = page.len();
            page.rewindow(replacement.clone(), off, window);
        }
        slot = prev;
    }

    buffer.bump_revision();
    drop(displaced);
    len
}

/// Move the head offset to the end of the file, emptying the buffer without
/// touching file content.
pub(crate) fn clear(buffer: &mut PageBuffer) {
    let shared = buffer.mmap_shared().expect("mmap op on a heap buffer").clone();
    let had_data = shared.data_size() > 0;
    shared.head_offset.set(shared.file_size());
    buffer.discard_cache();
    if had_data {
        buffer.bump_revision();
    }
}

/// Append bytes to the file. The cached chain is discarded and
/// re-materialises lazily through iteration.
pub(crate) fn write_data(buffer: &mut PageBuffer, bytes: &[u8]) -> u64 {
    if bytes.is_empty() {
        return 0;
    }
    let shared = buffer.mmap_shared().expect("mmap op on a heap buffer").clone();
    let was_empty = shared.data_size() == 0;
    let written = match (&shared.file).write(bytes) {
        Ok(n) => n as u64,
        Err(err) => {
            warn!("appending to the backing file failed: {err}");
            return 0;
        }
    };
    if written > 0 {
        let discarded = buffer.discard_cache();
        if was_empty || discarded {
            buffer.bump_revision();
        }
    }
    written
}

/// Append up to `len` bytes of `src` to the file in one vectored write,
/// chained straight out of the source page windows.
pub(crate) fn write_buffer(buffer: &mut PageBuffer, src: &mut PageBuffer, len: u64) -> u64 {
    let shared = buffer.mmap_shared().expect("mmap op on a heap buffer").clone();

    // Gather raw windows first: advancing the source iterator may
    // materialise pages, but region memory never moves.
    let mut parts: Vec<(*const u8, usize)> = Vec::new();
    let mut remaining = len;
    let mut it = src.head();
    while remaining > 0 && !src.is_end(it) && parts.len() < MAX_APPEND_SEGMENTS {
        let (base, take) = {
            let page = src.ring.page(it.slot).expect("ring slot without a page");
            let take = (page.len() as u64).min(remaining) as usize;
            (page.base_ptr() as *const u8, take)
        };
        parts.push((base, take));
        remaining -= take as u64;
        src.next(&mut it);
    }
    if parts.is_empty() {
        return 0;
    }
    let slices: Vec<IoSlice> = parts
        .iter()
        .map(|&(base, len)| IoSlice::new(unsafe { std::slice::from_raw_parts(base, len) }))
        .collect();

    let was_empty = shared.data_size() == 0;
    let written = match (&shared.file).write_vectored(&slices) {
        Ok(n) => n as u64,
        Err(err) => {
            warn!("vectored append to the backing file failed: {err}");
            return 0;
        }
    };
    if written > 0 {
        let discarded = buffer.discard_cache();
        if was_empty || discarded {
            buffer.bump_revision();
        }
    }
    written
}
