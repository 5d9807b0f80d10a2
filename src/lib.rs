//! A fragmented, zero-copy byte-buffer engine for IO-heavy, non-blocking
//! systems.
//!
//! A [`PageBuffer`] presents a logically contiguous byte sequence while
//! physically storing it as an ordered ring of page fragments over
//! reference-counted memory regions. Producers append data from sockets,
//! files, or other buffers; consumers read, parse, or forward it; transfers
//! between buffers share the underlying regions whenever the target's
//! [`Strategy`] allows write-by-reference.
//!
//! Two storage backends share the engine: the default heap backend, and a
//! file backend (see [`mmap`]) whose pages are windows into a file
//! memory-mapped on demand.
//!
//! ```
//! use fragbuf::PageBuffer;
//!
//! let mut buffer = PageBuffer::new();
//! buffer.write_data(b"hello ");
//! buffer.write_data(b"world");
//!
//! let mut out = [0u8; 11];
//! assert_eq!(buffer.read_data(&mut out), 11);
//! assert_eq!(&out, b"hello world");
//!
//! // Reading is non-destructive; consuming is an explicit seek.
//! buffer.seek(6);
//! assert_eq!(buffer.size(), 5);
//! ```
//!
//! Buffers are single-actor structures: no locking, no atomics, and
//! deliberately `!Send`. Detached cursors ([`DataReader`], [`LineReader`])
//! stay consistent against buffer mutation through the buffer's revision
//! counter instead of borrows.

mod alloc;
mod buffer;
mod error;
pub mod mmap;
mod page;
mod reader;
mod region;
mod ring;
mod strategy;

pub use alloc::{AllocKind, Allocator, HeapAllocator};
pub use buffer::{ByteIter, PageBuffer, PageIter};
pub use error::Error;
pub use page::Page;
pub use reader::{DataReader, LineReader, MAX_LINE};
pub use region::{Ownership, Region};
pub use strategy::{Strategy, DEFAULT_PAGE_SIZE};
