//! Block handles and the positional I/O engine.
//!
//! # Background
//!
//! A block is one column of a file: a directory holding a `header`, an
//! optional `attr-v2` table, and `Nfile` physical data files named
//! `000000`, `000001`, ...  Records are striped over the physical files
//! by prefix sum (see `stripe`); a handle maps logical record ranges to
//! per-file byte ranges and moves raw bytes with positional reads and
//! writes, so many processes can share descriptors on the same file
//! without coordinating a seek pointer.
//!
//! # Write combining
//!
//! Small sequential writes are the common case when a rank streams its
//! shard, so every handle owns one contiguous staging buffer.  A write is
//! appended to the buffer iff it lands exactly at the end of the current
//! dirty region in the same physical file; anything else flushes the
//! region first and starts a new one.  Writes larger than the buffer skip
//! it entirely.  Reads flush the buffer before touching disk, so a handle
//! always reads its own writes.
//!
//! # Lifecycle
//!
//! ```text
//!   Fresh ──read/write──▶ Open ⇄ Dirty ──close──▶ Closed
//! ```
//!
//! Closing flushes, folds the accumulated per-file checksums into the
//! header, rewrites it atomically, and drops the descriptors.  Every
//! operation on a closed handle fails with `BlockClosed`.

use std::borrow::Cow;
use std::fs;
use std::os::unix::fs::FileExt;
use std::path::PathBuf;

use crate::array::Array;
use crate::attrs::{Attr, AttrSet};
use crate::config;
use crate::dtype::Dtype;
use crate::error::BigFileError;
use crate::header::Header;
use crate::stripe::Striping;

/// Name of the `i`-th physical data file inside a block directory.
pub(crate) fn stripe_file_name(index: usize) -> String {
    format!("{index:06}")
}

/// Where a block handle is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockState {
    /// Created, no reads or writes performed yet.
    Fresh,
    /// Header loaded; descriptors open lazily per physical file.
    Open,
    /// The staging buffer holds unflushed bytes.
    Dirty,
    /// Terminal; every operation errors.
    Closed,
}

// ── Write-combining buffer ──────────────────────────────────────────

#[derive(Debug)]
struct WriteBuffer {
    data: Vec<u8>,
    capacity: usize,
    /// Physical file of the dirty region.
    file: usize,
    /// Byte offset of `data[0]` within that file.
    start: u64,
}

impl WriteBuffer {
    fn new(capacity: usize) -> WriteBuffer {
        WriteBuffer {
            data: Vec::new(),
            capacity,
            file: 0,
            start: 0,
        }
    }

    fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Whether `bytes` at `(file, offset)` extends the dirty region.
    fn extends(&self, file: usize, offset: u64, len: usize) -> bool {
        !self.data.is_empty()
            && self.file == file
            && self.start + self.data.len() as u64 == offset
            && self.data.len() + len <= self.capacity
    }
}

// ── Block handle ────────────────────────────────────────────────────

/// An open handle on one block.
#[derive(Debug)]
pub struct Block {
    dir: PathBuf,
    name: String,
    header: Header,
    striping: Striping,
    attrs: AttrSet,
    /// Lazily opened descriptors, one per physical file, with the mode
    /// they were opened in.
    fds: Vec<Option<(fs::File, bool)>>,
    buffer: WriteBuffer,
    /// Checksum contributions of this handle, per physical file.
    partial_sums: Vec<u64>,
    wrote: bool,
    state: BlockState,
}

impl Block {
    pub(crate) fn from_parts(dir: PathBuf, name: String, header: Header, fresh: bool) -> Result<Block, BigFileError> {
        let attrs = AttrSet::load(&dir)?;
        let striping = Striping::new(&header.counts);
        let nfile = header.nfile();
        Ok(Block {
            dir,
            name,
            header,
            striping,
            attrs,
            fds: (0..nfile).map(|_| None).collect(),
            buffer: WriteBuffer::new(config::buffer_size()),
            partial_sums: vec![0; nfile],
            wrote: false,
            state: if fresh { BlockState::Fresh } else { BlockState::Open },
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Total logical record count.
    pub fn size(&self) -> u64 {
        self.striping.size()
    }

    /// Element dtype, record shape included.
    pub fn dtype(&self) -> Dtype {
        self.header.element_dtype()
    }

    pub fn nfile(&self) -> usize {
        self.header.nfile()
    }

    /// Per-file record counts, in stripe order.
    pub fn counts(&self) -> &[u64] {
        &self.header.counts
    }

    /// Per-file checksums as of the last header load, this handle's
    /// unflushed contributions excluded.
    pub fn checksums(&self) -> &[u64] {
        &self.header.checksums
    }

    pub fn state(&self) -> BlockState {
        self.state
    }

    fn check_open(&self) -> Result<(), BigFileError> {
        if self.state == BlockState::Closed {
            return Err(BigFileError::BlockClosed);
        }
        Ok(())
    }

    // ── Attributes ──────────────────────────────────────────────

    pub fn attrs(&self) -> &AttrSet {
        &self.attrs
    }

    pub fn get_attr(&self, key: &str) -> Result<&Attr, BigFileError> {
        self.check_open()?;
        self.attrs.get(key)
    }

    pub fn set_attr(&mut self, key: &str, value: Attr) -> Result<(), BigFileError> {
        self.check_open()?;
        self.attrs.set(key, value)
    }

    pub fn delete_attr(&mut self, key: &str) -> Result<(), BigFileError> {
        self.check_open()?;
        self.attrs.delete(key)
    }

    /// Update the in-memory table only; non-root ranks of a collective
    /// write go through here so rank 0 stays the sole writer on disk.
    pub(crate) fn set_attr_unpersisted(&mut self, key: &str, value: Attr) -> Result<(), BigFileError> {
        self.check_open()?;
        self.attrs.set_in_memory(key, value)
    }

    pub(crate) fn delete_attr_unpersisted(&mut self, key: &str) -> Result<(), BigFileError> {
        self.check_open()?;
        self.attrs.delete_in_memory(key)
    }

    // ── Positional I/O ──────────────────────────────────────────

    /// Write `data` at logical record `offset`.
    ///
    /// The buffer must be value-compatible with the block's dtype; bytes
    /// are swapped into the on-disk order on a staging copy when the
    /// orders differ.  Fails with `Bounds` before touching anything if
    /// the range does not fit.
    pub fn write(&mut self, offset: u64, data: &Array) -> Result<(), BigFileError> {
        self.check_open()?;
        let element = self.header.element_dtype();
        if !data.dtype().value_compatible(&element) {
            return Err(BigFileError::Dtype {
                message: format!(
                    "cannot write '{}' data into a '{element}' block",
                    data.dtype()
                ),
            });
        }
        let n = data.len();
        if offset + n > self.size() {
            return Err(BigFileError::Bounds {
                message: format!(
                    "write of records [{offset}, {}) into '{}' of {} records",
                    offset + n,
                    self.name,
                    self.size()
                ),
            });
        }
        if n == 0 {
            return Ok(());
        }

        let staged: Cow<'_, [u8]> =
            if data.dtype().resolved().endian != element.resolved().endian {
                let mut copy = data.as_bytes().to_vec();
                element.byte_swap(&mut copy);
                Cow::Owned(copy)
            } else {
                Cow::Borrowed(data.as_bytes())
            };

        let itemsize = element.itemsize();
        let mut consumed = 0usize;
        for seg in self.striping.segments(offset, n)? {
            let len = (seg.count * itemsize) as usize;
            let bytes = &staged[consumed..consumed + len];
            consumed += len;
            self.buffered_write(seg.file, seg.offset * itemsize, bytes)?;
            let sum = bytes
                .iter()
                .fold(0u64, |acc, &b| acc.wrapping_add(b as u64));
            self.partial_sums[seg.file] = self.partial_sums[seg.file].wrapping_add(sum);
        }
        self.wrote = true;
        if self.state != BlockState::Dirty {
            self.state = BlockState::Open;
        }
        Ok(())
    }

    /// Read `count` records starting at logical record `offset`, in the
    /// block's on-disk dtype.
    pub fn read(&mut self, offset: u64, count: u64) -> Result<Array, BigFileError> {
        self.check_open()?;
        let segments = self.striping.segments(offset, count)?;

        // read-your-writes: anything staged must land first
        if !self.buffer.is_empty() {
            self.flush()?;
        }

        let element = self.header.element_dtype();
        let itemsize = element.itemsize();
        let mut out = vec![0u8; (count * itemsize) as usize];
        let mut consumed = 0usize;
        for seg in segments {
            let len = (seg.count * itemsize) as usize;
            let byte_offset = seg.offset * itemsize;
            let path = self.dir.join(stripe_file_name(seg.file));
            let fd = self.fd(seg.file, false)?;
            fd.read_exact_at(&mut out[consumed..consumed + len], byte_offset)
                .map_err(|e| BigFileError::Io {
                    context: format!("reading {len} bytes from {}", path.display()),
                    source: e,
                })?;
            consumed += len;
        }
        if self.state == BlockState::Fresh {
            self.state = BlockState::Open;
        }
        Array::from_bytes(element, out)
    }

    /// Read into a caller buffer of value-compatible dtype, swapping into
    /// the destination's byte order.  The destination's length picks the
    /// record count.
    pub fn read_into(&mut self, offset: u64, dest: &mut Array) -> Result<(), BigFileError> {
        let element = self.header.element_dtype();
        if !dest.dtype().value_compatible(&element) {
            return Err(BigFileError::Dtype {
                message: format!(
                    "cannot read '{element}' block into a '{}' buffer",
                    dest.dtype()
                ),
            });
        }
        let got = self.read(offset, dest.len())?;
        let got = got.cast_endian(dest.dtype().endian);
        dest.as_bytes_mut().copy_from_slice(got.as_bytes());
        Ok(())
    }

    /// Write the dirty region to its physical file and clear it.  The
    /// on-disk header is untouched; `close` updates it.
    pub fn flush(&mut self) -> Result<(), BigFileError> {
        self.check_open()?;
        if self.buffer.is_empty() {
            return Ok(());
        }
        let file = self.buffer.file;
        let start = self.buffer.start;
        let mut data = std::mem::take(&mut self.buffer.data);
        match self.pwrite(file, start, &data) {
            Ok(()) => {
                tracing::debug!(
                    block = %self.name,
                    file,
                    start,
                    bytes = data.len(),
                    "flushed write buffer"
                );
                data.clear();
                self.buffer.data = data;
                self.state = BlockState::Open;
                Ok(())
            }
            Err(e) => {
                // keep the dirty bytes so the caller may retry
                self.buffer.data = data;
                Err(e)
            }
        }
    }

    /// Flush, fold this handle's checksum contributions into the header,
    /// rewrite it, and drop the descriptors.  The handle transitions to
    /// `Closed` even when flushing fails.
    pub fn close(&mut self) -> Result<(), BigFileError> {
        self.check_open()?;
        self.close_inner(true)
    }

    /// Collective close, rank 0: fold externally combined checksum
    /// contributions instead of this handle's own.
    pub(crate) fn close_with_combined(&mut self, combined: &[u64]) -> Result<(), BigFileError> {
        self.check_open()?;
        self.partial_sums = combined.to_vec();
        self.wrote = true;
        self.close_inner(true)
    }

    /// Collective close, other ranks: never touch the header.
    pub(crate) fn close_without_header(&mut self) -> Result<(), BigFileError> {
        self.check_open()?;
        self.close_inner(false)
    }

    pub(crate) fn partial_sums(&self) -> &[u64] {
        &self.partial_sums
    }

    fn close_inner(&mut self, write_header: bool) -> Result<(), BigFileError> {
        let mut first_err: Option<BigFileError> = None;
        if !self.buffer.is_empty() {
            if let Err(e) = self.flush() {
                first_err.get_or_insert(e);
            }
        }
        if write_header && self.wrote {
            for (sum, partial) in self.header.checksums.iter_mut().zip(&self.partial_sums) {
                *sum = sum.wrapping_add(*partial);
            }
            self.partial_sums.iter_mut().for_each(|p| *p = 0);
            if let Err(e) = self.header.store(&self.dir) {
                first_err.get_or_insert(e);
            }
        }
        self.fds.iter_mut().for_each(|fd| *fd = None);
        self.state = BlockState::Closed;
        tracing::debug!(block = %self.name, "closed block");
        match first_err {
            None => Ok(()),
            Some(e) => Err(e),
        }
    }

    // ── Internals ───────────────────────────────────────────────

    fn buffered_write(&mut self, file: usize, offset: u64, bytes: &[u8]) -> Result<(), BigFileError> {
        // oversized writes bypass the buffer
        if bytes.len() >= self.buffer.capacity {
            if !self.buffer.is_empty() {
                self.flush()?;
            }
            return self.pwrite(file, offset, bytes);
        }

        if !self.buffer.extends(file, offset, bytes.len()) {
            if !self.buffer.is_empty() {
                self.flush()?;
            }
            self.buffer.file = file;
            self.buffer.start = offset;
            if self.buffer.data.capacity() == 0 {
                self.buffer.data.reserve_exact(self.buffer.capacity);
            }
        }
        self.buffer.data.extend_from_slice(bytes);
        self.state = BlockState::Dirty;
        Ok(())
    }

    fn pwrite(&mut self, file: usize, offset: u64, bytes: &[u8]) -> Result<(), BigFileError> {
        let path = self.dir.join(stripe_file_name(file));
        let fd = self.fd(file, true)?;
        fd.write_all_at(bytes, offset).map_err(|e| BigFileError::Io {
            context: format!(
                "writing {} bytes at offset {offset} of {}",
                bytes.len(),
                path.display()
            ),
            source: e,
        })
    }

    /// The descriptor for one physical file, opened lazily.  A read-only
    /// descriptor is upgraded in place when a write first needs it.
    fn fd(&mut self, file: usize, write: bool) -> Result<&fs::File, BigFileError> {
        let reopen = match &self.fds[file] {
            Some((_, writable)) => write && !writable,
            None => true,
        };
        if reopen {
            let path = self.dir.join(stripe_file_name(file));
            let fd = fs::OpenOptions::new()
                .read(true)
                .write(write)
                .open(&path)
                .map_err(|e| BigFileError::Io {
                    context: format!("opening data file {}", path.display()),
                    source: e,
                })?;
            self.fds[file] = Some((fd, write));
        }
        Ok(&self.fds[file].as_ref().expect("descriptor just opened").0)
    }
}

impl Drop for Block {
    fn drop(&mut self) {
        if self.state != BlockState::Closed {
            let _ = self.close_inner(true);
        }
    }
}
