//! Collective file and block operations for cooperating ranks.
//!
//! # Background
//!
//! The serial engine already tolerates many processes holding
//! descriptors on the same physical files, because all data I/O is
//! positional.  What it cannot decide alone is who mutates the shared
//! metadata.  This module layers that coordination on top: rank 0 is the
//! only rank that creates directories, writes headers, and rewrites
//! attribute tables; every other rank observes those mutations after a
//! barrier.  Data writes stay fully independent — each rank writes its
//! own disjoint record range, a caller contract the engine does not
//! validate.
//!
//! # Checksums
//!
//! Each handle accumulates per-file byte sums for its own writes.  A
//! collective close combines them with an allreduce and rank 0 folds the
//! total into the header, so the on-disk checksum covers every rank's
//! bytes exactly once.
//!
//! # Open after create
//!
//! Creation barriers before the other ranks open, but on network
//! filesystems a directory created on one node can take a moment to
//! appear on another.  Opens after a collective create therefore retry
//! a bounded number of times with a short sleep.

use std::cell::RefCell;
use std::path::Path;
use std::time::Duration;

use crate::array::Array;
use crate::attrs::{Attr, AttrSet};
use crate::block::{Block, BlockState};
use crate::comm::Communicator;
use crate::dtype::Dtype;
use crate::error::BigFileError;
use crate::file::File;

/// Default striping target for `create_from_array`: 32 Mi records per
/// physical file.
pub const RECORDS_PER_FILE: u64 = 32 * 1024 * 1024;

/// Default byte budget for one `create_from_array` write chunk.
pub const DEFAULT_MEMORY_LIMIT: usize = 256 * 1024 * 1024;

const OPEN_RETRIES: u32 = 100;
const OPEN_RETRY_DELAY: Duration = Duration::from_millis(10);

// ── Parallel file ───────────────────────────────────────────────────

/// A file handle shared by all ranks of a communicator.
#[derive(Debug)]
pub struct ParallelFile<C: Communicator> {
    comm: C,
    file: File,
    blocks: RefCell<Vec<String>>,
}

impl<C: Communicator> ParallelFile<C> {
    /// Collectively create a file: rank 0 makes the directory, everyone
    /// else opens it after the barrier.
    pub fn create(comm: C, path: impl AsRef<Path>) -> Result<ParallelFile<C>, BigFileError> {
        let path = path.as_ref();
        let file = if comm.rank() == 0 {
            let file = File::create(path)?;
            comm.barrier()?;
            file
        } else {
            comm.barrier()?;
            File::open(path)?
        };
        let pf = ParallelFile {
            comm,
            file,
            blocks: RefCell::new(Vec::new()),
        };
        pf.refresh()?;
        Ok(pf)
    }

    /// Collectively open an existing file on all ranks.
    pub fn open(comm: C, path: impl AsRef<Path>) -> Result<ParallelFile<C>, BigFileError> {
        let file = File::open(path)?;
        let pf = ParallelFile {
            comm,
            file,
            blocks: RefCell::new(Vec::new()),
        };
        pf.refresh()?;
        Ok(pf)
    }

    pub fn comm(&self) -> &C {
        &self.comm
    }

    /// The local (serial) handle; data reads through it are always safe.
    pub fn file(&self) -> &File {
        &self.file
    }

    /// The block list from the last collective refresh.
    pub fn blocks(&self) -> Vec<String> {
        self.blocks.borrow().clone()
    }

    /// Collectively refresh the block list: rank 0 walks the tree, the
    /// result is broadcast.  Every mutation of the list goes through
    /// this path.
    pub fn refresh(&self) -> Result<(), BigFileError> {
        self.file.ensure_open()?;
        let mut payload = if self.comm.rank() == 0 {
            self.file.list_blocks()?.join("\n").into_bytes()
        } else {
            Vec::new()
        };
        self.comm.broadcast(0, &mut payload)?;
        let joined = String::from_utf8(payload).map_err(|_| BigFileError::Collective {
            message: "broadcast block list is not UTF-8".into(),
        })?;
        *self.blocks.borrow_mut() = if joined.is_empty() {
            Vec::new()
        } else {
            joined.split('\n').map(String::from).collect()
        };
        Ok(())
    }

    /// Collectively create a block: rank 0 creates it and writes the
    /// header, then every rank opens its own handle.
    pub fn create_block(
        &self,
        name: &str,
        dtype: &Dtype,
        size: u64,
        nfile: usize,
    ) -> Result<ParallelBlock<'_, C>, BigFileError> {
        if self.comm.rank() == 0 {
            self.file.create_block(name, dtype, size, nfile)?.close()?;
            tracing::info!(block = name, size, nfile, "collectively created block");
        }
        self.comm.barrier()?;
        self.refresh()?;
        let block = open_with_retry(&self.file, name)?;
        Ok(ParallelBlock {
            comm: &self.comm,
            block,
        })
    }

    /// Open a block on this rank.  Opening is local; the block list does
    /// not change.
    pub fn open_block(&self, name: &str) -> Result<ParallelBlock<'_, C>, BigFileError> {
        let block = self.file.open_block(name)?;
        Ok(ParallelBlock {
            comm: &self.comm,
            block,
        })
    }

    /// A parallel handle on the file rooted at `<path>/<prefix>`.
    pub fn subfile(&self, prefix: &str) -> Result<ParallelFile<&C>, BigFileError> {
        let prefix = prefix.trim_end_matches('/');
        ParallelFile::open(&self.comm, self.file.path().join(prefix))
    }

    /// Create a block from a distributed array: every rank contributes
    /// its local shard, in rank order.  Returns the finished block,
    /// collectively reopened.
    ///
    /// `nfile` defaults to one physical file per 32 Mi records.  Writes
    /// are chunked to at most `memory_limit` bytes, rounded down to a
    /// multiple of 1024 records.
    pub fn create_from_array(
        &self,
        name: &str,
        array: &Array,
        nfile: Option<usize>,
        memory_limit: usize,
    ) -> Result<ParallelBlock<'_, C>, BigFileError> {
        let local_len = array.len();
        let size = self.comm.allreduce_sum(local_len)?;
        let nfile = nfile.unwrap_or_else(|| size.div_ceil(RECORDS_PER_FILE) as usize);

        let lengths = self.comm.allgather(local_len)?;
        let offset: u64 = lengths[..self.comm.rank()].iter().sum();

        let itemsize = array.dtype().itemsize();
        let chunk = ((memory_limit as u64 / itemsize) / 1024 * 1024).max(1024);

        let mut block = self.create_block(name, array.dtype(), size, nfile)?;
        let mut written = 0u64;
        while written < local_len {
            let n = chunk.min(local_len - written);
            block.write(offset + written, &array.slice(written, n)?)?;
            written += n;
        }
        block.close()?;

        let block = open_with_retry(&self.file, name)?;
        Ok(ParallelBlock {
            comm: &self.comm,
            block,
        })
    }

    /// Collectively close the file handle.
    pub fn close(&self) -> Result<(), BigFileError> {
        self.comm.barrier()?;
        self.file.close();
        Ok(())
    }
}

/// Open with a bounded retry loop, for opens that chase a create done on
/// another node.
fn open_with_retry(file: &File, name: &str) -> Result<Block, BigFileError> {
    for _ in 0..OPEN_RETRIES {
        match file.open_block(name) {
            Ok(block) => return Ok(block),
            Err(_) => std::thread::sleep(OPEN_RETRY_DELAY),
        }
    }
    file.open_block(name)
}

// ── Parallel block ──────────────────────────────────────────────────

/// One rank's handle on a collectively managed block.
///
/// Reads and writes are plain local operations — ranks are expected to
/// touch disjoint record ranges.  Flush and close are collective; every
/// rank must call them.
#[derive(Debug)]
pub struct ParallelBlock<'a, C: Communicator> {
    comm: &'a C,
    block: Block,
}

impl<C: Communicator> ParallelBlock<'_, C> {
    pub fn size(&self) -> u64 {
        self.block.size()
    }

    pub fn dtype(&self) -> Dtype {
        self.block.dtype()
    }

    pub fn nfile(&self) -> usize {
        self.block.nfile()
    }

    pub fn state(&self) -> BlockState {
        self.block.state()
    }

    pub fn write(&mut self, offset: u64, data: &Array) -> Result<(), BigFileError> {
        self.block.write(offset, data)
    }

    pub fn read(&mut self, offset: u64, count: u64) -> Result<Array, BigFileError> {
        self.block.read(offset, count)
    }

    pub fn read_into(&mut self, offset: u64, dest: &mut Array) -> Result<(), BigFileError> {
        self.block.read_into(offset, dest)
    }

    pub fn attrs(&self) -> &AttrSet {
        self.block.attrs()
    }

    pub fn get_attr(&self, key: &str) -> Result<&Attr, BigFileError> {
        self.block.get_attr(key)
    }

    /// Set an attribute on every rank's table; only rank 0 writes the
    /// file.
    pub fn set_attr(&mut self, key: &str, value: Attr) -> Result<(), BigFileError> {
        if self.comm.rank() == 0 {
            self.block.set_attr(key, value)
        } else {
            self.block.set_attr_unpersisted(key, value)
        }
    }

    pub fn delete_attr(&mut self, key: &str) -> Result<(), BigFileError> {
        if self.comm.rank() == 0 {
            self.block.delete_attr(key)
        } else {
            self.block.delete_attr_unpersisted(key)
        }
    }

    /// Collective flush: every rank lands its own buffer, then all wait.
    /// After this, any rank may read any range and see all writes.
    pub fn flush(&mut self) -> Result<(), BigFileError> {
        self.block.flush()?;
        self.comm.barrier()
    }

    /// Collective close: flush everywhere, combine the per-file checksum
    /// contributions of all ranks, let rank 0 fold them into the header,
    /// and barrier so the header is visible to everyone afterwards.
    pub fn close(mut self) -> Result<(), BigFileError> {
        self.block.flush()?;
        let mut combined = Vec::with_capacity(self.block.nfile());
        for i in 0..self.block.nfile() {
            combined.push(self.comm.allreduce_sum(self.block.partial_sums()[i])?);
        }
        if self.comm.rank() == 0 {
            self.block.close_with_combined(&combined)?;
        } else {
            self.block.close_without_header()?;
        }
        self.comm.barrier()
    }
}
