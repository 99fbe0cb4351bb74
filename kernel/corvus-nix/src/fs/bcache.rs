// SPDX-License-Identifier: MPL-2.0

//! The per-device block cache.
//!
//! Blocks are keyed by their device-relative, block-aligned offset.
//! Reads are read-through and writes are write-through; threads that hit
//! a block with in-flight I/O wait on the block's own queue, so at most
//! one physical request per block is ever outstanding.

use core::sync::atomic::{AtomicU32, Ordering};

use corvus_frame::mm::io::{VmReader, VmWriter};
use corvus_util::HashTable;

use super::device::Device;
use crate::prelude::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockState {
    Ok,
    Reading,
    Writing,
    Error,
}

/// The in-memory representative of one device block.
pub struct Block {
    offset: u64,
    state: SpinLock<BlockState>,
    /// Lock holders; an entry may be evicted only at zero.
    lock_count: AtomicU32,
    /// Threads awaiting a state transition.
    waiters: WaitQueue,
    data: SpinLock<Box<[u8]>>,
}

impl core::fmt::Debug for Block {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Block").field("offset", &self.offset).finish()
    }
}

impl Block {
    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn state(&self) -> BlockState {
        *self.state.lock()
    }

    fn set_state(&self, state: BlockState) {
        *self.state.lock() = state;
    }

    pub fn lock_count(&self) -> u32 {
        self.lock_count.load(Ordering::Relaxed)
    }

    /// Copies bytes out of the block's buffer.
    pub fn read_at(&self, offset: usize, dst: &mut [u8]) {
        let data = self.data.lock();
        dst.copy_from_slice(&data[offset..offset + dst.len()]);
    }
}

struct CacheInner {
    table: HashTable<Arc<Block>>,
    /// Every live block, for teardown; error blocks leave `table` first.
    blocks: Vec<Arc<Block>>,
}

/// A block cache bound to one device.
pub struct BlockCache {
    block_size: usize,
    inner: SpinLock<CacheInner>,
}

impl BlockCache {
    /// Creates a cache. The block size must be a power of two.
    pub fn new(block_size: usize) -> Result<Self> {
        if block_size == 0 || !block_size.is_power_of_two() {
            error!("block cache: block size must be a power of two");
            return_errno!(Errno::EINVAL);
        }
        if block_size < 16 {
            warn!("block cache: very small block sizes are inefficient");
        }
        Ok(Self {
            block_size,
            inner: SpinLock::new(CacheInner {
                table: HashTable::new(),
                blocks: Vec::new(),
            }),
        })
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    fn align(&self, offset: u64) -> u64 {
        offset & !(self.block_size as u64 - 1)
    }

    fn find(&self, aligned: u64) -> Option<Arc<Block>> {
        self.inner.lock().table.find(&aligned.to_le_bytes()).cloned()
    }

    /// Creates a locked empty block and hashes it. The offset must be
    /// aligned and absent.
    fn create_empty(&self, aligned: u64, state: BlockState) -> Arc<Block> {
        let block = Arc::new(Block {
            offset: aligned,
            state: SpinLock::new(state),
            lock_count: AtomicU32::new(1),
            waiters: WaitQueue::new(),
            data: SpinLock::new(vec![0u8; self.block_size].into_boxed_slice()),
        });
        let mut inner = self.inner.lock();
        let inserted = inner.table.insert(&aligned.to_le_bytes(), block.clone());
        debug_assert!(inserted);
        inner.blocks.push(block.clone());
        block
    }

    /// Reads the block covering `offset`, locking it for the caller.
    ///
    /// A miss issues exactly one device read; concurrent readers of an
    /// in-flight block join the existing read via the block's wait
    /// queue.
    pub fn read(&self, device: &Device, offset: u64) -> Result<Arc<Block>> {
        let aligned = self.align(offset);

        if let Some(block) = self.find(aligned) {
            block.lock_count.fetch_add(1, Ordering::Relaxed);
            if block.state() == BlockState::Reading {
                block.waiters.wait(false);
                if block.state() == BlockState::Error {
                    self.unlock(&block);
                    return_errno!(Errno::EIO);
                }
            }
            return Ok(block);
        }

        let block = self.create_empty(aligned, BlockState::Reading);
        let result = {
            let mut data = block.data.lock();
            let mut writer = VmWriter::from_kernel(&mut data);
            device.ops().read(device, aligned, &mut writer)
        };

        match result {
            Ok(_) => {
                block.set_state(BlockState::Ok);
                block.waiters.wake_all();
                Ok(block)
            }
            Err(_) => {
                // Later lookups must miss; current holders still see the
                // error state.
                block.set_state(BlockState::Error);
                self.inner.lock().table.remove(&aligned.to_le_bytes());
                block.waiters.wake_all();
                self.unlock(&block);
                return_errno!(Errno::EIO)
            }
        }
    }

    /// Releases a lock taken by [`read`]. An error block with no holders
    /// left is destroyed.
    pub fn unlock(&self, block: &Arc<Block>) {
        let previous = block.lock_count.fetch_sub(1, Ordering::Relaxed);
        if previous == 0 {
            warn!("block cache: block already unlocked");
            block.lock_count.store(0, Ordering::Relaxed);
            return;
        }
        if previous == 1 && block.state() == BlockState::Error {
            let mut inner = self.inner.lock();
            inner.blocks.retain(|other| !Arc::ptr_eq(other, block));
        }
    }

    /// Copies `len` bytes starting at `offset` into `writer`,
    /// block by block. The destination is committed once per block
    /// iteration.
    pub fn read_buffer(
        &self,
        device: &Device,
        mut offset: u64,
        mut len: usize,
        writer: &mut VmWriter,
    ) -> Result<usize> {
        let total = len;
        while len > 0 {
            let block = self.read(device, offset)?;

            let block_off = (offset & (self.block_size as u64 - 1)) as usize;
            let chunk = (self.block_size - block_off).min(len);

            if writer.commit(chunk).is_err() {
                self.unlock(&block);
                return_errno!(Errno::EFAULT);
            }
            {
                let data = block.data.lock();
                if writer.write(&data[block_off..block_off + chunk]).is_err() {
                    drop(data);
                    self.unlock(&block);
                    return_errno!(Errno::EFAULT);
                }
            }
            self.unlock(&block);

            offset += chunk as u64;
            len -= chunk;
        }
        Ok(total)
    }

    /// Copies `len` bytes from `reader` to the device through the cache.
    ///
    /// The cache is write-through: every block is submitted to the
    /// device before the call moves on. A partial-block write reads the
    /// block first. On a device error the block is marked `Error` and
    /// unhashed, leaving the cache coherent with what was actually
    /// written.
    pub fn write_buffer(
        &self,
        device: &Device,
        mut offset: u64,
        mut len: usize,
        reader: &mut VmReader,
    ) -> Result<usize> {
        let total = len;
        while len > 0 {
            let block_off = (offset & (self.block_size as u64 - 1)) as usize;
            let chunk = (self.block_size - block_off).min(len);
            let aligned = self.align(offset);

            // A partial block must be read first; a whole block may be
            // created or replaced in place.
            let block = if block_off != 0 || chunk != self.block_size {
                self.read(device, offset)?
            } else {
                match self.find(aligned) {
                    Some(block) => {
                        block.lock_count.fetch_add(1, Ordering::Relaxed);
                        block
                    }
                    None => self.create_empty(aligned, BlockState::Ok),
                }
            };

            // Wait out any in-flight I/O on this block.
            while matches!(block.state(), BlockState::Reading | BlockState::Writing) {
                block.waiters.wait(false);
            }
            if block.state() == BlockState::Error {
                self.unlock(&block);
                return_errno!(Errno::EIO);
            }

            if reader.commit(chunk).is_err() {
                self.unlock(&block);
                return_errno!(Errno::EFAULT);
            }

            block.set_state(BlockState::Writing);
            let result = {
                let mut data = block.data.lock();
                if reader.read(&mut data[block_off..block_off + chunk]).is_err() {
                    Err(Error::new(Errno::EFAULT))
                } else {
                    // Write-through, always from the cache buffer.
                    let mut chunk_reader = VmReader::from_kernel(&data[block_off..block_off + chunk]);
                    device
                        .ops()
                        .write(device, offset, &mut chunk_reader)
                        .map(|_| ())
                        .map_err(|_| Error::new(Errno::EIO))
                }
            };

            match result {
                Ok(()) => block.set_state(BlockState::Ok),
                Err(_) => {
                    block.set_state(BlockState::Error);
                    self.inner.lock().table.remove(&aligned.to_le_bytes());
                }
            }
            block.waiters.wake_all();
            let failed = block.state() == BlockState::Error;
            self.unlock(&block);
            if failed {
                return_errno!(Errno::EIO);
            }

            offset += chunk as u64;
            len -= chunk;
        }
        Ok(total)
    }

    /// Evicts every unlocked block. Returns whether the cache is now
    /// empty (no block was held).
    pub fn empty(&self) -> bool {
        let mut inner = self.inner.lock();
        let blocks = core::mem::take(&mut inner.blocks);
        let mut all_unlocked = true;
        for block in blocks {
            if block.lock_count() == 0 {
                inner.table.remove(&block.offset.to_le_bytes());
            } else {
                all_unlocked = false;
                inner.blocks.push(block);
            }
        }
        all_unlocked
    }

    /// Number of cached blocks, for diagnostics.
    pub fn block_count(&self) -> usize {
        self.inner.lock().blocks.len()
    }
}
