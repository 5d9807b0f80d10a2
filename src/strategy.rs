/// The default size of dynamically allocated buffer pages.
pub const DEFAULT_PAGE_SIZE: usize = 4096;

/// Immutable per-buffer policy bundle.
///
/// A strategy is copied into the buffer at creation and never changes
/// afterwards. `page_size` caps every dynamically allocated page (0 means
/// unlimited, so a write allocates one region per operation).
/// `clone_on_write` forces buffer-to-buffer writes to copy instead of
/// referencing the source regions. `fragment_as_target` lets this buffer's
/// `page_size` dominate source fragmentation during transfers. The
/// `rejects_*` flags disable individual operations, which then return 0
/// without touching the buffer.
#[derive(Clone, Copy, Debug)]
pub struct Strategy {
    pub page_size: usize,
    pub clone_on_write: bool,
    pub fragment_as_target: bool,
    pub rejects_insert: bool,
    pub rejects_extend: bool,
    pub rejects_rewind: bool,
    pub rejects_seek: bool,
    pub rejects_trim: bool,
    pub rejects_write: bool,
    pub rejects_overwrite: bool,
}

impl Default for Strategy {
    fn default() -> Strategy {
        Strategy {
            page_size: DEFAULT_PAGE_SIZE,
            clone_on_write: false,
            fragment_as_target: false,
            rejects_insert: false,
            rejects_extend: false,
            rejects_rewind: false,
            rejects_seek: false,
            rejects_trim: false,
            rejects_write: false,
            rejects_overwrite: false,
        }
    }
}

impl Strategy {
    /// The strategy of file-backed buffers: transfers copy and re-fragment
    /// at the mapping unit, and mid-buffer insertion is refused.
    pub fn mmap() -> Strategy {
        Strategy {
            clone_on_write: true,
            fragment_as_target: true,
            rejects_insert: true,
            ..Strategy::default()
        }
    }
}
