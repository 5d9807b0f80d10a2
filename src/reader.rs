use crate::buffer::{ByteIter, PageBuffer, PageIter};

/// Longest line the line reader will discover before forcing a break.
pub const MAX_LINE: usize = 16_777_216;

/// Stateful sequential reader over a buffer.
///
/// The reader is a detached cursor: it holds no borrow of the buffer, only a
/// position and a revision snapshot. Whenever the buffer's revision has
/// moved since the snapshot, the next call silently rewinds to the buffer
/// head — appends leave the revision alone, so a reader keeps its place
/// across them.
#[derive(Clone, Debug)]
pub struct DataReader {
    it: PageIter,
    page_offset: usize,
    revision: u64,
}

impl DataReader {
    pub fn new(buffer: &mut PageBuffer) -> DataReader {
        let mut reader = DataReader {
            it: buffer.end(),
            page_offset: 0,
            revision: 0,
        };
        reader.reset(buffer);
        reader
    }

    /// Copy up to `dst.len()` bytes from the cursor onward, advancing the
    /// cursor. When the buffer runs out, the cursor parks on the last page
    /// just past its final byte, never on the end sentinel.
    pub fn read(&mut self, buffer: &mut PageBuffer, dst: &mut [u8]) -> u64 {
        if buffer.revision() != self.revision {
            self.reset(buffer);
        }
        if self.page_offset == buffer.page_len(self.it) {
            buffer.next(&mut self.it);
            self.page_offset = 0;
        }
        let mut read = 0u64;
        let mut remaining = dst.len() as u64;
        while remaining > 0 && !buffer.is_end(self.it) {
            let n = {
                let data = buffer.page_data(self.it);
                let n = ((data.len() - self.page_offset) as u64).min(remaining);
                dst[read as usize..read as usize + n as usize]
                    .copy_from_slice(&data[self.page_offset..self.page_offset + n as usize]);
                n
            };
            self.page_offset += n as usize;
            remaining -= n;
            read += n;
            if self.page_offset != buffer.page_len(self.it) {
                return read;
            }
            buffer.next(&mut self.it);
            self.page_offset = 0;
        }
        if buffer.is_end(self.it) {
            buffer.prev(&mut self.it);
            self.page_offset = buffer.page_len(self.it);
        }
        read
    }

    /// Read into `dst`, then seek the buffer past everything the cursor has
    /// traversed. Returns the seeked count.
    pub fn consume(&mut self, buffer: &mut PageBuffer, dst: &mut [u8]) -> u64 {
        self.read(buffer, dst);
        let mut seeked = 0u64;
        let mut it = buffer.head();
        while !buffer.is_end(it) && it != self.it {
            seeked += buffer.page_len(it) as u64;
            buffer.next(&mut it);
        }
        if it == self.it && self.page_offset > 0 {
            seeked += self.page_offset as u64;
        }
        buffer.seek(seeked)
    }

    /// Re-snapshot the revision and rewind the cursor to the buffer head.
    pub fn reset(&mut self, buffer: &mut PageBuffer) {
        self.it = buffer.head();
        self.revision = buffer.revision();
        self.page_offset = 0;
    }
}

/// Discovers LF- or CRLF-terminated lines at the head of a buffer.
///
/// `has_line` scans forward byte by byte, remembering its position between
/// calls, and declares a line on a LF, at the [`MAX_LINE`] bound, or at the
/// end of the buffer once a `terminate_line*` call marked it as a line end.
/// Like [`DataReader`], the reader auto-resets when the buffer revision has
/// moved from its snapshot.
#[derive(Clone, Debug)]
pub struct LineReader {
    it: ByteIter,
    offset: usize,
    has_cr: bool,
    has_line: bool,
    is_terminated: bool,
    is_terminated_with_cr: bool,
    revision: u64,
}

impl LineReader {
    pub fn new(buffer: &mut PageBuffer) -> LineReader {
        let mut reader = LineReader {
            it: buffer.bytes_end(),
            offset: 0,
            has_cr: false,
            has_line: false,
            is_terminated: false,
            is_terminated_with_cr: false,
            revision: 0,
        };
        reader.reset(buffer);
        reader
    }

    fn sync(&mut self, buffer: &mut PageBuffer) {
        if buffer.revision() != self.revision {
            self.reset(buffer);
        }
    }

    /// Whether a line is available at the buffer head, scanning forward from
    /// the current position as needed.
    pub fn has_line(&mut self, buffer: &mut PageBuffer) -> bool {
        self.sync(buffer);
        if self.has_line {
            return true;
        }
        if buffer.size() == 0 {
            return false;
        }
        while !buffer.byte_is_end(&self.it) {
            match buffer.byte_at(&self.it) {
                b'\n' => {
                    self.has_line = true;
                    return true;
                }
                b'\r' => self.has_cr = true,
                _ => self.has_cr = false,
            }
            buffer.byte_next(&mut self.it);
            self.offset += 1;
            if self.offset == MAX_LINE {
                self.has_cr = false;
                self.has_line = true;
                return true;
            }
        }
        // Park on the last byte so the scan resumes there after an append.
        buffer.byte_prev(&mut self.it);
        self.offset -= 1;
        if self.is_terminated_with_cr {
            self.has_line = true;
            return true;
        }
        if self.is_terminated {
            self.has_cr = false;
            self.has_line = true;
            return true;
        }
        false
    }

    /// Length of the discovered line, excluding its terminator(s).
    pub fn get_line_len(&mut self, buffer: &mut PageBuffer) -> usize {
        self.sync(buffer);
        if !self.has_line {
            return 0;
        }
        self.line_len()
    }

    /// Copy the discovered line into `dst`, capped by the line length.
    /// Returns the number of bytes copied.
    pub fn get_line_data(&mut self, buffer: &mut PageBuffer, dst: &mut [u8]) -> usize {
        self.sync(buffer);
        if !self.has_line {
            return 0;
        }
        let mut line_len = self.line_len();
        let mut got = 0usize;
        let mut remaining = dst.len();
        let mut it = buffer.head();
        while remaining > 0 && line_len > 0 && !buffer.is_end(it) {
            let take = {
                let data = buffer.page_data(it);
                let take = data.len().min(remaining).min(line_len);
                dst[got..got + take].copy_from_slice(&data[..take]);
                take
            };
            remaining -= take;
            line_len -= take;
            got += take;
            buffer.next(&mut it);
        }
        got
    }

    /// Consume the discovered line and its terminator(s); a line declared by
    /// `terminate_line` at the end of the buffer has no terminator bytes to
    /// consume. Resets the reader.
    pub fn seek_line(&mut self, buffer: &mut PageBuffer) -> u64 {
        self.sync(buffer);
        if !self.has_line {
            return 0;
        }
        let to_seek = if self.is_terminated {
            self.offset as u64
        } else {
            self.offset as u64 + 1
        };
        let seeked = buffer.seek(to_seek);
        self.reset(buffer);
        seeked
    }

    /// Whether the discovered line ends in CRLF rather than a bare LF.
    pub fn is_crlf(&mut self, buffer: &mut PageBuffer) -> bool {
        self.sync(buffer);
        self.has_cr
    }

    /// Whether line discovery has reached the end of the buffer.
    pub fn is_end(&mut self, buffer: &mut PageBuffer) -> bool {
        self.sync(buffer);
        buffer.byte_is_end(&self.it)
    }

    /// Mark the present scan position as a line end. A CR just before it is
    /// kept out of the length calculation.
    pub fn terminate_line(&mut self) {
        self.is_terminated = true;
    }

    /// Mark the present scan position as a line end, crediting a CR just
    /// before it as a CRLF terminator.
    pub fn terminate_line_check_cr(&mut self) {
        self.is_terminated_with_cr = true;
    }

    /// Abandon the current discovery and restart from the buffer head.
    pub fn reset(&mut self, buffer: &mut PageBuffer) {
        self.it = buffer.bytes_head();
        self.revision = buffer.revision();
        self.offset = 0;
        self.has_cr = false;
        self.has_line = false;
        self.is_terminated = false;
        self.is_terminated_with_cr = false;
    }

    fn line_len(&self) -> usize {
        if self.has_cr {
            self.offset - 1
        } else {
            self.offset
        }
    }
}
