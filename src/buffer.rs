use std::ptr;
use std::rc::Rc;

use crate::alloc::{Allocator, HeapAllocator};
use crate::mmap::{self, MmapShared};
use crate::page::Page;
use crate::region::Region;
use crate::ring::{PageRing, SENTINEL};
use crate::strategy::Strategy;

/// Handle to a page position in a buffer.
///
/// Iterators are plain handles: cheap to copy, compared by position, and
/// only meaningful against the buffer that issued them. The end iterator is
/// the buffer's sentinel; it never carries data.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct PageIter {
    pub(crate) slot: u32,
}

/// Handle to a byte position: a page position plus an offset into that page.
///
/// Dereferencing the end byte-iterator yields `b'\0'` rather than touching
/// any storage.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct ByteIter {
    pub(crate) it: PageIter,
    pub(crate) page_offset: usize,
}

pub(crate) enum Backend {
    Heap { allocator: Rc<dyn Allocator> },
    Mmap { shared: Rc<MmapShared> },
}

/// A logically contiguous byte sequence stored as an ordered ring of page
/// fragments over reference-counted regions.
///
/// Producers append with the `write_*` family, consumers read with
/// [`read_data`](PageBuffer::read_data) and discard with
/// [`seek`](PageBuffer::seek). Transfers between buffers share the
/// underlying regions whenever the target's [`Strategy`] allows it.
///
/// Every bulk operation returns the number of bytes it actually processed;
/// a mid-operation allocation failure stops the work and leaves the buffer
/// consistent with the returned prefix. The revision counter increases
/// whenever data already in the buffer changes, letting detached readers
/// detect that their view went stale.
pub struct PageBuffer {
    strategy: Strategy,
    pub(crate) ring: PageRing,
    revision: u64,
    size: u64,
    backend: Backend,
}

fn chunk_len(page_size: usize, len: u64) -> usize {
    if page_size != 0 && (page_size as u64) < len {
        page_size
    } else {
        len as usize
    }
}

impl PageBuffer {
    pub fn new() -> PageBuffer {
        PageBuffer::with_strategy_and_allocator(Strategy::default(), HeapAllocator::shared())
    }

    pub fn with_strategy(strategy: Strategy) -> PageBuffer {
        PageBuffer::with_strategy_and_allocator(strategy, HeapAllocator::shared())
    }

    pub fn with_allocator(allocator: Rc<dyn Allocator>) -> PageBuffer {
        PageBuffer::with_strategy_and_allocator(Strategy::default(), allocator)
    }

    pub fn with_strategy_and_allocator(
        strategy: Strategy,
        allocator: Rc<dyn Allocator>,
    ) -> PageBuffer {
        PageBuffer {
            strategy,
            ring: PageRing::new(),
            revision: 0,
            size: 0,
            backend: Backend::Heap { allocator },
        }
    }

    pub(crate) fn file_backed(shared: Rc<MmapShared>) -> PageBuffer {
        PageBuffer {
            strategy: Strategy::mmap(),
            ring: PageRing::new(),
            revision: 0,
            size: 0,
            backend: Backend::Mmap { shared },
        }
    }

    pub fn strategy(&self) -> &Strategy {
        &self.strategy
    }

    /// Bytes currently in the buffer. File-backed buffers derive this from
    /// the backing file, not from the cached page chain.
    pub fn size(&self) -> u64 {
        match &self.backend {
            Backend::Heap { .. } => self.size,
            Backend::Mmap { shared } => shared.data_size(),
        }
    }

    /// Revision stamp of the data. Increases every time data already inside
    /// the buffer is modified; appending and reading leave it unchanged.
    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub(crate) fn bump_revision(&mut self) {
        self.revision += 1;
    }

    fn is_mmap(&self) -> bool {
        matches!(self.backend, Backend::Mmap { .. })
    }

    pub(crate) fn mmap_shared(&self) -> Option<&Rc<MmapShared>> {
        match &self.backend {
            Backend::Mmap { shared } => Some(shared),
            Backend::Heap { .. } => None,
        }
    }

    /// Drop the cached page chain of a file-backed buffer. Returns whether
    /// there was anything to drop.
    pub(crate) fn discard_cache(&mut self) -> bool {
        if self.ring.is_empty() {
            return false;
        }
        self.ring.clear();
        true
    }

    // ---- iteration ----

    /// Iterator over the first page, or the end iterator when the buffer is
    /// empty. A file-backed buffer materialises the head window on demand.
    pub fn head(&mut self) -> PageIter {
        if self.ring.is_empty() {
            self.materialize_forward();
        }
        PageIter {
            slot: self.ring.head(),
        }
    }

    /// The end iterator.
    pub fn end(&self) -> PageIter {
        PageIter { slot: SENTINEL }
    }

    pub fn is_end(&self, it: PageIter) -> bool {
        it.slot == SENTINEL
    }

    /// Move the iterator to the next page. Walking past the cached tail of a
    /// file-backed buffer maps and splices the next file window.
    pub fn next(&mut self, it: &mut PageIter) {
        let next = self.ring.next(it.slot);
        if next != SENTINEL || !self.is_mmap() || it.slot == SENTINEL {
            it.slot = next;
            return;
        }
        if self.materialize_forward() {
            it.slot = self.ring.next(it.slot);
        } else {
            it.slot = SENTINEL;
        }
    }

    /// Move the iterator to the previous page, mapping backward toward the
    /// file head when a file-backed buffer runs off its cached chain.
    pub fn prev(&mut self, it: &mut PageIter) {
        let prev = self.ring.prev(it.slot);
        if prev != SENTINEL || !self.is_mmap() {
            it.slot = prev;
            return;
        }
        if self.materialize_backward() {
            it.slot = self.ring.prev(it.slot);
        } else {
            it.slot = SENTINEL;
        }
    }

    /// Window length of the iterator's page; 0 at the end iterator.
    pub fn page_len(&self, it: PageIter) -> usize {
        self.ring.page_len(it.slot)
    }

    /// The bytes visible through the iterator's page; empty at the end
    /// iterator.
    pub fn page_data(&self, it: PageIter) -> &[u8] {
        self.ring.page(it.slot).map_or(&[], Page::data)
    }

    /// Byte iterator at the first byte, or at the end for an empty buffer.
    pub fn bytes_head(&mut self) -> ByteIter {
        ByteIter {
            it: self.head(),
            page_offset: 0,
        }
    }

    /// Byte iterator at the end of the buffer.
    pub fn bytes_end(&self) -> ByteIter {
        ByteIter {
            it: self.end(),
            page_offset: 0,
        }
    }

    pub fn byte_is_end(&self, it: &ByteIter) -> bool {
        self.is_end(it.it)
    }

    /// The byte under the iterator, or `b'\0'` at the end.
    pub fn byte_at(&self, it: &ByteIter) -> u8 {
        match self.ring.page(it.it.slot) {
            Some(page) if it.page_offset < page.len() => page.data()[it.page_offset],
            _ => 0,
        }
    }

    pub fn byte_next(&mut self, it: &mut ByteIter) {
        it.page_offset += 1;
        if it.page_offset >= self.page_len(it.it) {
            self.next(&mut it.it);
            it.page_offset = 0;
        }
    }

    pub fn byte_prev(&mut self, it: &mut ByteIter) {
        if it.page_offset == 0 {
            self.prev(&mut it.it);
            it.page_offset = self.page_len(it.it);
            if self.is_end(it.it) {
                return;
            }
        }
        it.page_offset -= 1;
    }

    fn materialize_forward(&mut self) -> bool {
        let Backend::Mmap { shared } = &self.backend else {
            return false;
        };
        let shared = shared.clone();
        let tail = self.ring.tail();
        let page = {
            let last = if tail == SENTINEL {
                None
            } else {
                self.ring.page(tail)
            };
            mmap::page_map_forward(&shared, last)
        };
        match page {
            Some(page) => {
                self.ring.link_before(SENTINEL, page);
                true
            }
            None => false,
        }
    }

    fn materialize_backward(&mut self) -> bool {
        let Backend::Mmap { shared } = &self.backend else {
            return false;
        };
        let shared = shared.clone();
        let head = self.ring.head();
        let page = {
            let first = if head == SENTINEL {
                None
            } else {
                self.ring.page(head)
            };
            mmap::page_map_backward(&shared, first)
        };
        match page {
            Some(page) => {
                self.ring.link_before(head, page);
                true
            }
            None => false,
        }
    }

    // ---- growth and shrinkage ----

    /// Append `len` fresh owned bytes at the tail, split into pages of at
    /// most the strategy page size. The new bytes are uninitialised storage
    /// to be filled through iteration or overwrite. Returns the number of
    /// bytes actually added.
    pub fn extend(&mut self, len: u64) -> u64 {
        if self.strategy.rejects_extend {
            return 0;
        }
        if self.is_mmap() {
            return mmap::extend(self, len);
        }
        let mut extended = 0u64;
        let mut remaining = len;
        while remaining > 0 {
            let chunk = chunk_len(self.strategy.page_size, remaining);
            let Some(page) = self.page_create(chunk) else {
                return extended;
            };
            let added = self.insert_impl(self.end(), 0, page);
            if added == 0 {
                break;
            }
            remaining -= added;
            extended += added;
        }
        extended
    }

    /// Extend the buffer so its size is at least `size`. Returns the number
    /// of bytes added.
    pub fn reserve(&mut self, size: u64) -> u64 {
        if self.strategy.rejects_extend {
            return 0;
        }
        let data_size = self.size();
        if size <= data_size {
            return 0;
        }
        self.extend(size - data_size)
    }

    /// Prepend `len` fresh owned bytes at the head (the mirror of
    /// [`extend`](PageBuffer::extend)). Existing bytes are untouched, so the
    /// revision does not change.
    pub fn rewind(&mut self, len: u64) -> u64 {
        if self.strategy.rejects_rewind {
            return 0;
        }
        if self.is_mmap() {
            return mmap::rewind(self, len);
        }
        let mut rewound = 0u64;
        let mut remaining = len;
        while remaining > 0 {
            let chunk = chunk_len(self.strategy.page_size, remaining);
            let Some(page) = self.page_create(chunk) else {
                return rewound;
            };
            let added = page.len() as u64;
            let head = self.ring.head();
            self.ring.link_before(head, page);
            self.size += added;
            remaining -= added;
            rewound += added;
        }
        rewound
    }

    /// Discard up to `len` bytes from the head, freeing wholly consumed
    /// pages. Returns the number of bytes discarded.
    pub fn seek(&mut self, len: u64) -> u64 {
        if self.strategy.rejects_seek {
            return 0;
        }
        if self.is_mmap() {
            return mmap::seek(self, len);
        }
        let mut seeked = 0u64;
        let mut remaining = len;
        let mut slot = self.ring.head();
        while remaining > 0 && slot != SENTINEL {
            let consumed = {
                let page = self.ring.page_mut(slot).expect("ring slot without a page");
                let consumed = (page.len() as u64).min(remaining);
                page.advance(consumed as usize);
                consumed
            };
            let next = self.ring.next(slot);
            if self.ring.page_len(slot) == 0 {
                self.ring.unlink(slot);
            }
            if consumed == 0 {
                break;
            }
            remaining -= consumed;
            seeked += consumed;
            self.size -= consumed;
            slot = next;
        }
        if seeked > 0 {
            self.bump_revision();
        }
        seeked
    }

    /// Discard up to `len` bytes from the tail, the mirror of
    /// [`seek`](PageBuffer::seek).
    pub fn trim(&mut self, len: u64) -> u64 {
        if self.strategy.rejects_trim {
            return 0;
        }
        if self.is_mmap() {
            return mmap::trim(self, len);
        }
        let mut trimmed = 0u64;
        let mut remaining = len;
        let mut slot = self.ring.tail();
        while remaining > 0 && slot != SENTINEL {
            let consumed = {
                let page = self.ring.page_mut(slot).expect("ring slot without a page");
                let consumed = (page.len() as u64).min(remaining);
                page.shrink(consumed as usize);
                consumed
            };
            let prev = self.ring.prev(slot);
            if self.ring.page_len(slot) == 0 {
                self.ring.unlink(slot);
            }
            if consumed == 0 {
                break;
            }
            remaining -= consumed;
            trimmed += consumed;
            self.size -= consumed;
            slot = prev;
        }
        if trimmed > 0 {
            self.bump_revision();
        }
        trimmed
    }

    // ---- insertion ----

    /// Splice a page into the buffer at the iterator position.
    ///
    /// With `offset = 0` the page lands in front of the iterator's page;
    /// otherwise the iterator's page is split into two windows over its
    /// region and the page lands between them. Inserting at the end iterator
    /// appends. Returns the number of bytes inserted.
    pub fn insert_page(&mut self, it: PageIter, offset: usize, page: Page) -> u64 {
        if !self.is_end(it) && self.strategy.rejects_insert {
            return 0;
        }
        if self.is_mmap() {
            if !self.is_end(it) {
                return 0;
            }
            return mmap::write_data(self, page.data());
        }
        self.insert_impl(it, offset, page)
    }

    /// Copy `buf` into owned pages and splice them at the iterator position.
    pub fn insert_data(&mut self, it: PageIter, offset: usize, buf: &[u8]) -> u64 {
        if !self.is_end(it) && self.strategy.rejects_insert {
            return 0;
        }
        if self.is_mmap() {
            if !self.is_end(it) {
                return 0;
            }
            return mmap::write_data(self, buf);
        }
        self.insert_data_impl(it, offset, buf)
    }

    /// Splice pages referencing `buf` (no copy) at the iterator position.
    ///
    /// # Safety
    ///
    /// The caller MUST keep `buf` alive and unmodified-by-others for as long
    /// as this buffer, or any buffer data was transferred to, can still
    /// reference it.
    pub unsafe fn insert_data_ref(&mut self, it: PageIter, offset: usize, buf: &[u8]) -> u64 {
        if !self.is_end(it) && self.strategy.rejects_insert {
            return 0;
        }
        if self.is_mmap() {
            if !self.is_end(it) {
                return 0;
            }
            return mmap::write_data(self, buf);
        }
        self.insert_data_ref_impl(it, offset, buf)
    }

    /// Transfer up to `len` bytes from the head of `src` into this buffer at
    /// the iterator position. Whether the bytes are shared or copied, and
    /// how they are re-fragmented, follows this buffer's strategy.
    pub fn insert_buffer(
        &mut self,
        it: PageIter,
        offset: usize,
        src: &mut PageBuffer,
        len: u64,
    ) -> u64 {
        if !self.is_end(it) && self.strategy.rejects_insert {
            return 0;
        }
        if self.is_mmap() {
            if !self.is_end(it) {
                return 0;
            }
            return mmap::write_buffer(self, src, len);
        }
        if self.strategy.clone_on_write {
            self.insert_buffer_copies(it, offset, src, len)
        } else {
            self.insert_buffer_refs(it, offset, src, len)
        }
    }

    // ---- writes (insertion at the end) ----

    /// Append a copy of `buf`. Appending never changes existing data, so the
    /// revision is unchanged except for the very first write into an empty
    /// buffer.
    pub fn write_data(&mut self, buf: &[u8]) -> u64 {
        if self.strategy.rejects_write {
            return 0;
        }
        if self.is_mmap() {
            return mmap::write_data(self, buf);
        }
        self.insert_data_impl(self.end(), 0, buf)
    }

    /// Append pages referencing `buf` without copying.
    ///
    /// # Safety
    ///
    /// Same contract as [`insert_data_ref`](PageBuffer::insert_data_ref).
    pub unsafe fn write_data_ref(&mut self, buf: &[u8]) -> u64 {
        if self.strategy.rejects_write {
            return 0;
        }
        if self.is_mmap() {
            return mmap::write_data(self, buf);
        }
        self.insert_data_ref_impl(self.end(), 0, buf)
    }

    /// Append up to `len` bytes from the head of `src`, sharing regions when
    /// the strategy allows write-by-reference.
    pub fn write_buffer(&mut self, src: &mut PageBuffer, len: u64) -> u64 {
        if self.strategy.rejects_write {
            return 0;
        }
        if self.is_mmap() {
            return mmap::write_buffer(self, src, len);
        }
        let end = self.end();
        if self.strategy.clone_on_write {
            self.insert_buffer_copies(end, 0, src, len)
        } else {
            self.insert_buffer_refs(end, 0, src, len)
        }
    }

    // ---- overwrites ----

    /// Overwrite the head of the buffer with `buf`, never growing it. Pages
    /// whose storage is shared or borrowed are detached onto fresh owned
    /// regions before being written.
    pub fn overwrite_data(&mut self, buf: &[u8]) -> u64 {
        if self.strategy.rejects_overwrite {
            return 0;
        }
        let mut written = 0u64;
        let mut remaining = buf.len() as u64;
        let mut it = self.head();
        while remaining > 0 && !self.is_end(it) {
            if !self.make_page_writable(it.slot) {
                break;
            }
            let wrote = {
                let page = self.ring.page(it.slot).expect("ring slot without a page");
                let wrote = (page.len() as u64).min(remaining);
                unsafe {
                    ptr::copy_nonoverlapping(
                        buf.as_ptr().add(written as usize),
                        page.base_ptr(),
                        wrote as usize,
                    );
                }
                wrote
            };
            remaining -= wrote;
            written += wrote;
            self.next(&mut it);
        }
        if written > 0 {
            self.bump_revision();
        }
        written
    }

    /// Overwrite the head of the buffer with the head of `src`.
    pub fn overwrite_buffer(&mut self, src: &mut PageBuffer, len: u64) -> u64 {
        if self.strategy.rejects_overwrite {
            return 0;
        }
        let mut written = 0u64;
        let mut remaining = len;
        let mut off = 0usize;
        let mut src_off = 0usize;
        let mut it = self.head();
        let mut src_it = src.head();
        while remaining > 0 && !self.is_end(it) && !src.is_end(src_it) {
            if !self.make_page_writable(it.slot) {
                break;
            }
            let page_len = self.ring.page_len(it.slot);
            let src_len = src.ring.page_len(src_it.slot);
            let wrote = ((page_len - off) as u64)
                .min((src_len - src_off) as u64)
                .min(remaining);
            if wrote == 0 {
                break;
            }
            unsafe {
                let dst = self
                    .ring
                    .page(it.slot)
                    .expect("ring slot without a page")
                    .base_ptr()
                    .add(off);
                let from = src
                    .ring
                    .page(src_it.slot)
                    .expect("ring slot without a page")
                    .base_ptr()
                    .add(src_off);
                ptr::copy_nonoverlapping(from, dst, wrote as usize);
            }
            remaining -= wrote;
            written += wrote;
            off += wrote as usize;
            src_off += wrote as usize;
            if off == page_len {
                self.next(&mut it);
                off = 0;
            }
            if src_off == src_len {
                src.next(&mut src_it);
                src_off = 0;
            }
        }
        if written > 0 {
            self.bump_revision();
        }
        written
    }

    // ---- reading ----

    /// Copy up to `dst.len()` bytes from the head of the buffer without
    /// consuming them. Returns the number of bytes copied.
    pub fn read_data(&mut self, dst: &mut [u8]) -> u64 {
        let mut read = 0u64;
        let mut remaining = dst.len() as u64;
        let mut it = self.head();
        while remaining > 0 && !self.is_end(it) {
            let n = {
                let page = self.ring.page(it.slot).expect("ring slot without a page");
                let n = (page.len() as u64).min(remaining);
                dst[read as usize..read as usize + n as usize]
                    .copy_from_slice(&page.data()[..n as usize]);
                n
            };
            remaining -= n;
            read += n;
            self.next(&mut it);
        }
        read
    }

    /// Free every page. A file-backed buffer moves its head offset to the
    /// end of the file; the file itself is untouched.
    pub fn clear(&mut self) {
        if self.is_mmap() {
            return mmap::clear(self);
        }
        let had_data = self.size > 0;
        self.ring.clear();
        self.size = 0;
        if had_data {
            self.bump_revision();
        }
    }

    // ---- internals ----

    fn page_create(&self, len: usize) -> Option<Page> {
        let Backend::Heap { allocator } = &self.backend else {
            return None;
        };
        Some(Page::new(Region::owned(len, allocator)?))
    }

    /// The one true splice: bumps the revision unless this is a pure append
    /// to a non-empty buffer (the first insert into an empty buffer does
    /// bump), splits the iterator page when `offset` falls inside it, and
    /// keeps the size counter exact.
    fn insert_impl(&mut self, it: PageIter, offset: usize, page: Page) -> u64 {
        if page.is_empty() {
            return 0;
        }
        if it.slot != SENTINEL || self.size == 0 {
            self.bump_revision();
        }
        let next_slot = it.slot;
        let offset = offset.min(self.ring.page_len(next_slot));
        if offset != 0 {
            // Split the iterator page in place: both halves window the same
            // region, which gains one reference.
            let target = self
                .ring
                .page_mut(next_slot)
                .expect("split of a sentinel page");
            let mut front = Page::transfer(target, target.len(), 0);
            front.truncate(offset);
            target.advance(offset);
            self.ring.link_before(next_slot, front);
        }
        let added = page.len() as u64;
        self.ring.link_before(next_slot, page);
        self.size += added;
        added
    }

    fn insert_data_impl(&mut self, it: PageIter, mut offset: usize, buf: &[u8]) -> u64 {
        let mut inserted = 0u64;
        let mut remaining = buf.len() as u64;
        while remaining > 0 {
            let chunk = chunk_len(self.strategy.page_size, remaining);
            let Some(page) = self.page_create(chunk) else {
                return inserted;
            };
            unsafe {
                ptr::copy_nonoverlapping(
                    buf.as_ptr().add(inserted as usize),
                    page.base_ptr(),
                    page.len(),
                );
            }
            let added = self.insert_impl(it, offset, page);
            if added == 0 {
                break;
            }
            offset = 0;
            remaining -= added;
            inserted += added;
        }
        inserted
    }

    unsafe fn insert_data_ref_impl(&mut self, it: PageIter, mut offset: usize, buf: &[u8]) -> u64 {
        let Backend::Heap { allocator } = &self.backend else {
            return 0;
        };
        let allocator = allocator.clone();
        let mut inserted = 0u64;
        let mut remaining = buf.len() as u64;
        while remaining > 0 {
            let chunk = chunk_len(self.strategy.page_size, remaining);
            let region = Region::borrowed(buf.as_ptr().add(inserted as usize), chunk, &allocator);
            let added = self.insert_impl(it, offset, Page::new(region));
            if added == 0 {
                break;
            }
            offset = 0;
            remaining -= added;
            inserted += added;
        }
        inserted
    }

    /// Write-by-reference transfer: the target pages window the source
    /// regions. Source fragmentation dominates unless the strategy says the
    /// target's page size does.
    fn insert_buffer_refs(
        &mut self,
        it: PageIter,
        mut offset: usize,
        src: &mut PageBuffer,
        mut len: u64,
    ) -> u64 {
        let refragment = self.strategy.fragment_as_target;
        let mut inserted = 0u64;
        let mut src_off = 0usize;
        let mut src_it = src.head();
        while len > 0 && !src.is_end(src_it) {
            let page = {
                let src_page = src.ring.page(src_it.slot).expect("ring slot without a page");
                let mut take = ((src_page.len() - src_off) as u64).min(len);
                if refragment {
                    take = chunk_len(self.strategy.page_size, take) as u64;
                }
                Page::transfer(src_page, take as usize, src_off)
            };
            let added = self.insert_impl(it, offset, page);
            if added == 0 {
                break;
            }
            offset = 0;
            len -= added;
            inserted += added;
            src_off += added as usize;
            if src_off == src.ring.page_len(src_it.slot) {
                src.next(&mut src_it);
                src_off = 0;
            }
        }
        inserted
    }

    /// Cloning transfer: fresh owned pages, data copied across from the
    /// source windows.
    fn insert_buffer_copies(
        &mut self,
        it: PageIter,
        mut offset: usize,
        src: &mut PageBuffer,
        mut len: u64,
    ) -> u64 {
        let refragment = self.strategy.fragment_as_target;
        let mut inserted = 0u64;
        let mut src_off = 0usize;
        let mut src_it = src.head();
        while len > 0 && !src.is_end(src_it) {
            let mut take = ((src.ring.page_len(src_it.slot) - src_off) as u64).min(len);
            if refragment {
                take = chunk_len(self.strategy.page_size, take) as u64;
            }
            let Some(page) = self.page_create(take as usize) else {
                return inserted;
            };
            unsafe {
                let src_page = src.ring.page(src_it.slot).expect("ring slot without a page");
                ptr::copy_nonoverlapping(
                    src_page.base_ptr().add(src_off),
                    page.base_ptr(),
                    page.len(),
                );
            }
            let added = self.insert_impl(it, offset, page);
            if added == 0 {
                break;
            }
            offset = 0;
            len -= added;
            inserted += added;
            src_off += added as usize;
            if src_off == src.ring.page_len(src_it.slot) {
                src.next(&mut src_it);
                src_off = 0;
            }
        }
        inserted
    }

    /// Detach the page in `slot` from storage it does not exclusively own,
    /// so an overwrite cannot leak through a shared or borrowed region. The
    /// transfer mark is only a hint; the test is exclusive ownership.
    /// Mapping-backed pages are written through on purpose.
    fn make_page_writable(&mut self, slot: u32) -> bool {
        let needs_copy = {
            let page = self.ring.page(slot).expect("ring slot without a page");
            let region = page.region();
            if region.is_mapped() {
                false
            } else {
                region.is_borrowed() || Rc::strong_count(region) > 1
            }
        };
        if !needs_copy {
            return true;
        }
        let Backend::Heap { allocator } = &self.backend else {
            return false;
        };
        let allocator = allocator.clone();
        let len = self.ring.page_len(slot);
        let Some(region) = Region::owned(len, &allocator) else {
            return false;
        };
        let page = self.ring.page_mut(slot).expect("ring slot without a page");
        unsafe {
            ptr::copy_nonoverlapping(page.base_ptr(), region.base(), len);
        }
        page.set_region(region);
        true
    }
}

impl Default for PageBuffer {
    fn default() -> PageBuffer {
        PageBuffer::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alloc::AllocKind;
    use std::cell::Cell;
    use std::ptr::NonNull;

    fn contents(buf: &mut PageBuffer) -> Vec<u8> {
        let mut out = Vec::new();
        let mut it = buf.bytes_head();
        while !buf.byte_is_end(&it) {
            out.push(buf.byte_at(&it));
            buf.byte_next(&mut it);
        }
        out
    }

    fn page_lens(buf: &PageBuffer) -> Vec<usize> {
        let mut lens = Vec::new();
        let mut slot = buf.ring.head();
        while slot != SENTINEL {
            lens.push(buf.ring.page_len(slot));
            slot = buf.ring.next(slot);
        }
        lens
    }

    fn regions(buf: &PageBuffer) -> Vec<Rc<Region>> {
        let mut out = Vec::new();
        let mut slot = buf.ring.head();
        while slot != SENTINEL {
            out.push(buf.ring.page(slot).unwrap().region().clone());
            slot = buf.ring.next(slot);
        }
        out
    }

    fn audit_size(buf: &PageBuffer) {
        assert_eq!(
            page_lens(buf).iter().map(|&l| l as u64).sum::<u64>(),
            buf.size()
        );
    }

    #[test]
    fn insert_splits_a_page() {
        let mut buf = PageBuffer::new();
        assert_eq!(buf.write_data(b"abcdejklmnopqrstuvwxyz"), 22);
        assert_eq!(buf.revision(), 1);
        let it = buf.head();
        assert_eq!(buf.insert_data(it, 5, b"fghi"), 4);
        assert_eq!(buf.size(), 26);
        assert_eq!(buf.revision(), 2);
        assert_eq!(contents(&mut buf), b"abcdefghijklmnopqrstuvwxyz");
        audit_size(&buf);
    }

    #[test]
    fn split_halves_share_the_region() {
        let mut buf = PageBuffer::new();
        buf.write_data(b"0123456789");
        let region = regions(&buf).remove(0);
        assert_eq!(Rc::strong_count(&region), 2); // the page, plus our handle
        let it = buf.head();
        assert_eq!(buf.insert_data(it, 4, b"xx"), 2);
        assert_eq!(Rc::strong_count(&region), 3); // both halves, plus our handle
        assert_eq!(contents(&mut buf), b"0123xx456789");
        audit_size(&buf);
    }

    #[test]
    fn overwrite_detaches_borrowed_storage() {
        static BACKING: &[u8] = b"abcdefghij";
        let mut buf = PageBuffer::new();
        assert_eq!(unsafe { buf.write_data_ref(BACKING) }, 10);
        assert_eq!(buf.seek(4), 4);
        let rev = buf.revision();
        assert_eq!(buf.overwrite_data(b"WXYZ"), 4);
        assert_eq!(buf.revision(), rev + 1);
        assert_eq!(contents(&mut buf), b"WXYZij");
        // The borrowed memory is untouched outside the buffer.
        assert_eq!(BACKING, b"abcdefghij");
    }

    #[test]
    fn write_buffer_shares_regions() {
        let mut src = PageBuffer::new();
        let data = vec![0xA5u8; 8192];
        assert_eq!(src.write_data(&data), 8192);
        let src_regions = regions(&src);
        assert_eq!(src_regions.len(), 2);
        for region in &src_regions {
            assert_eq!(Rc::strong_count(region), 2); // the page, plus our handle
        }

        let mut dst = PageBuffer::new();
        assert_eq!(dst.write_buffer(&mut src, 8192), 8192);
        assert_eq!(dst.size(), 8192);
        assert_eq!(src.size(), 8192);
        for region in &src_regions {
            assert_eq!(Rc::strong_count(region), 3); // a page in each buffer
        }
        let dst_regions = regions(&dst);
        assert_eq!(dst_regions.len(), 2);
        for (a, b) in src_regions.iter().zip(&dst_regions) {
            assert!(Rc::ptr_eq(a, b));
        }
        let head = dst.head();
        assert!(dst.ring.page(head.slot).unwrap().is_transfer());
        assert_eq!(contents(&mut dst), data);
    }

    struct FailingAllocator {
        inner: HeapAllocator,
        count: Cell<u32>,
    }

    impl Allocator for FailingAllocator {
        fn alloc(&self, kind: AllocKind, size: usize) -> Option<NonNull<u8>> {
            let n = self.count.get() + 1;
            self.count.set(n);
            if n % 3 == 0 {
                return None;
            }
            self.inner.alloc(kind, size)
        }

        unsafe fn free(&self, kind: AllocKind, ptr: NonNull<u8>, size: usize) {
            self.inner.free(kind, ptr, size)
        }
    }

    #[test]
    fn allocation_failure_returns_the_prefix() {
        let mut buf = PageBuffer::with_allocator(Rc::new(FailingAllocator {
            inner: HeapAllocator,
            count: Cell::new(0),
        }));
        let data: Vec<u8> = (0..1_000_000u32).map(|i| i as u8).collect();
        let written = buf.write_data(&data);
        assert_eq!(written, 8192); // two pages land, the third allocation fails
        assert_eq!(buf.size(), written);
        assert_eq!(buf.revision(), 1); // only the initial write into an empty buffer
        assert_eq!(contents(&mut buf), &data[..written as usize]);
        audit_size(&buf);
        for region in regions(&buf) {
            assert_eq!(Rc::strong_count(&region), 2); // one page, plus our handle
        }
    }

    #[test]
    fn extend_then_trim_restores_size() {
        let mut buf = PageBuffer::new();
        buf.write_data(b"seed");
        let size = buf.size();
        let rev = buf.revision();
        assert_eq!(buf.extend(10000), 10000);
        assert_eq!(buf.revision(), rev); // appending fresh pages only
        assert_eq!(buf.size(), size + 10000);
        assert_eq!(page_lens(&buf), vec![4, 4096, 4096, 1808]);
        assert_eq!(buf.trim(10000), 10000);
        assert_eq!(buf.size(), size);
        assert_eq!(buf.revision(), rev + 1); // the trim
        audit_size(&buf);
    }

    #[test]
    fn rewind_does_not_bump_the_revision() {
        let mut buf = PageBuffer::new();
        buf.write_data(b"data");
        let rev = buf.revision();
        assert_eq!(buf.rewind(100), 100);
        assert_eq!(buf.revision(), rev);
        assert_eq!(buf.size(), 104);
        assert_eq!(buf.seek(100), 100);
        assert_eq!(buf.revision(), rev + 1); // only the seek
        assert_eq!(contents(&mut buf), b"data");
    }

    #[test]
    fn seek_boundaries() {
        let mut buf = PageBuffer::new();
        buf.write_data(b"abc");
        let rev = buf.revision();
        assert_eq!(buf.seek(0), 0);
        assert_eq!(buf.revision(), rev);
        assert_eq!(buf.seek(buf.size()), 3);
        assert_eq!(buf.size(), 0);
        assert!(buf.ring.is_empty());
        assert_eq!(buf.revision(), rev + 1);
        assert_eq!(buf.seek(10), 0);
    }

    #[test]
    fn empty_buffer_byte_iterator_is_end() {
        let mut buf = PageBuffer::new();
        let it = buf.bytes_head();
        assert!(buf.byte_is_end(&it));
        assert_eq!(it, buf.bytes_end());
        assert_eq!(buf.byte_at(&it), b'\0');
    }

    #[test]
    fn rejecting_strategy_blocks_mid_buffer_insert() {
        let strategy = Strategy {
            rejects_insert: true,
            ..Strategy::default()
        };
        let mut buf = PageBuffer::with_strategy(strategy);
        buf.write_data(b"abcdef");
        let it = buf.head();
        assert_eq!(buf.insert_data(it, 2, b"xx"), 0);
        let end = buf.end();
        assert_eq!(buf.insert_data(end, 0, b"xx"), 2);
        assert_eq!(contents(&mut buf), b"abcdefxx");
    }

    #[test]
    fn insert_at_end_is_write() {
        let mut a = PageBuffer::new();
        let mut b = PageBuffer::new();
        let end = a.end();
        assert_eq!(a.insert_data(end, 0, b"xyz"), 3);
        assert_eq!(b.write_data(b"xyz"), 3);
        // Including the first-write-into-an-empty-buffer revision bump.
        assert_eq!(a.revision(), 1);
        assert_eq!(b.revision(), 1);
        assert_eq!(a.size(), b.size());
        assert_eq!(contents(&mut a), contents(&mut b));
    }

    #[test]
    fn write_read_seek_roundtrip() {
        let mut buf = PageBuffer::new();
        buf.write_data(b"before");
        let x: Vec<u8> = (0..5000u32).map(|i| (i % 251) as u8).collect();
        assert_eq!(buf.write_data(&x), 5000);
        assert_eq!(buf.seek(6), 6);
        let mut y = vec![0u8; 5000];
        assert_eq!(buf.read_data(&mut y), 5000);
        assert_eq!(y, x);
        assert_eq!(buf.size(), 5000); // reads are non-destructive
        assert_eq!(buf.seek(5000), 5000);
        assert_eq!(buf.size(), 0);
    }

    #[test]
    fn transfer_modes_follow_the_strategy() {
        let src_strategy = Strategy {
            page_size: 1000,
            ..Strategy::default()
        };
        let data: Vec<u8> = (0..2500u32).map(|i| i as u8).collect();
        let make_src = || {
            let mut src = PageBuffer::with_strategy(src_strategy);
            src.write_data(&data);
            src
        };

        // Reference, fragment as source: source page sizes carry over.
        let mut dst = PageBuffer::with_strategy(Strategy {
            page_size: 400,
            ..Strategy::default()
        });
        let mut src = make_src();
        assert_eq!(dst.write_buffer(&mut src, 2500), 2500);
        assert_eq!(page_lens(&dst), vec![1000, 1000, 500]);
        assert!(Rc::ptr_eq(&regions(&dst)[0], &regions(&src)[0]));
        assert_eq!(contents(&mut dst), data);

        // Clone, fragment as source: same shape, fresh storage.
        let mut dst = PageBuffer::with_strategy(Strategy {
            page_size: 400,
            clone_on_write: true,
            ..Strategy::default()
        });
        let mut src = make_src();
        assert_eq!(dst.write_buffer(&mut src, 2500), 2500);
        assert_eq!(page_lens(&dst), vec![1000, 1000, 500]);
        assert!(!Rc::ptr_eq(&regions(&dst)[0], &regions(&src)[0]));
        assert_eq!(contents(&mut dst), data);

        // Reference, fragment as target: transfer windows capped at 400.
        let mut dst = PageBuffer::with_strategy(Strategy {
            page_size: 400,
            fragment_as_target: true,
            ..Strategy::default()
        });
        let mut src = make_src();
        assert_eq!(dst.write_buffer(&mut src, 2500), 2500);
        assert_eq!(
            page_lens(&dst),
            vec![400, 400, 200, 400, 400, 200, 400, 100]
        );
        assert!(Rc::ptr_eq(&regions(&dst)[0], &regions(&src)[0]));
        assert_eq!(contents(&mut dst), data);

        // Clone, fragment as target: same shape, fresh storage.
        let mut dst = PageBuffer::with_strategy(Strategy {
            page_size: 400,
            clone_on_write: true,
            fragment_as_target: true,
            ..Strategy::default()
        });
        let mut src = make_src();
        assert_eq!(dst.write_buffer(&mut src, 2500), 2500);
        assert_eq!(
            page_lens(&dst),
            vec![400, 400, 200, 400, 400, 200, 400, 100]
        );
        assert!(!Rc::ptr_eq(&regions(&dst)[0], &regions(&src)[0]));
        assert_eq!(contents(&mut dst), data);
    }

    #[test]
    fn overwrite_buffer_copies_across_fragments() {
        let mut dst = PageBuffer::with_strategy(Strategy {
            page_size: 4,
            ..Strategy::default()
        });
        dst.write_data(b"aaaaaaaaaa");
        let mut src = PageBuffer::with_strategy(Strategy {
            page_size: 3,
            ..Strategy::default()
        });
        src.write_data(b"0123456");
        let rev = dst.revision();
        assert_eq!(dst.overwrite_buffer(&mut src, 7), 7);
        assert_eq!(dst.revision(), rev + 1);
        assert_eq!(contents(&mut dst), b"0123456aaa");
        assert_eq!(contents(&mut src), b"0123456");
    }

    #[test]
    fn overwrite_never_grows_the_buffer() {
        let mut buf = PageBuffer::new();
        buf.write_data(b"abc");
        assert_eq!(buf.overwrite_data(b"0123456789"), 3);
        assert_eq!(buf.size(), 3);
        assert_eq!(contents(&mut buf), b"012");
    }

    #[test]
    fn overwrite_leaves_transfer_sources_intact() {
        let mut a = PageBuffer::new();
        a.write_data(b"shared-bytes");
        let mut b = PageBuffer::new();
        assert_eq!(b.write_buffer(&mut a, 12), 12);
        assert_eq!(b.overwrite_data(b"SHARED"), 6);
        assert_eq!(contents(&mut b), b"SHARED-bytes");
        assert_eq!(contents(&mut a), b"shared-bytes");
    }

    #[test]
    fn clear_empties_the_ring() {
        let mut buf = PageBuffer::new();
        buf.clear();
        assert_eq!(buf.revision(), 0); // nothing changed
        buf.write_data(b"abc");
        let rev = buf.revision();
        buf.clear();
        assert_eq!(buf.size(), 0);
        assert!(buf.ring.is_empty());
        assert_eq!(buf.revision(), rev + 1);
    }

    #[test]
    fn reserve_tops_up_to_size() {
        let mut buf = PageBuffer::new();
        buf.write_data(b"12345");
        assert_eq!(buf.reserve(3), 0);
        assert_eq!(buf.reserve(5000), 4995);
        assert_eq!(buf.size(), 5000);
        audit_size(&buf);
    }

    #[test]
    fn insert_page_respects_the_window() {
        let mut buf = PageBuffer::new();
        buf.write_data(b"aabb");
        let alloc = HeapAllocator::shared();
        let region = Region::owned(2, &alloc).unwrap();
        let page = Page::new(region);
        unsafe { ptr::copy_nonoverlapping(b"xy".as_ptr(), page.base_ptr(), 2) };
        let it = buf.head();
        assert_eq!(buf.insert_page(it, 2, page), 2);
        assert_eq!(contents(&mut buf), b"aaxybb");
        audit_size(&buf);
    }

    #[test]
    fn page_iteration_walks_both_ways() {
        let mut buf = PageBuffer::with_strategy(Strategy {
            page_size: 2,
            ..Strategy::default()
        });
        buf.write_data(b"abcdef");
        let mut it = buf.head();
        let mut forward = Vec::new();
        while !buf.is_end(it) {
            forward.extend_from_slice(buf.page_data(it));
            buf.next(&mut it);
        }
        assert_eq!(forward, b"abcdef");
        buf.prev(&mut it);
        let mut backward = Vec::new();
        while !buf.is_end(it) {
            backward.extend_from_slice(buf.page_data(it));
            buf.prev(&mut it);
        }
        assert_eq!(backward, b"efcdab");
    }
}
