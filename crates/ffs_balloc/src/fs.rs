//! Per-mount allocation context and the `balloc` entry point.

use core::fmt;

use bitflags::bitflags;
use block_io::{BlockDevice, BufferCache, CacheState};
use mutex_api::Mutex;
use ufs_types::{BlockPtr, Daddr, FsGeometry, InodeNo, LogicalBlock, MAXBSIZE, NDADDR, NXADDR};

use crate::{
    block_alloc::BlockAllocator,
    error::{AllocError, BallocError},
    inode::{Area, Inode},
    ordering::WriteOrdering,
    softdep::DependencyTracker,
};

/// Identity of a cached buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BufKey {
    pub ino: InodeNo,
    pub block: LogicalBlock,
}

impl BufKey {
    #[must_use]
    pub const fn new(ino: InodeNo, block: LogicalBlock) -> Self {
        Self { ino, block }
    }
}

impl fmt::Display for BufKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ino {} {}", self.ino, self.block)
    }
}

/// A buffer checked out from the file system's buffer cache.
pub type Buf<'a, D, M> = block_io::Buf<'a, D, M, BufKey>;

/// Byte offset into one of the address spaces of an inode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Address {
    /// Offset into the file content.
    Data(u64),
    /// Offset into the extended attribute area (UFS2 only).
    ExtAttr(u64),
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct BallocFlags: u8 {
        /// Zero newly allocated blocks, and read existing ones.
        const CLEAR_BUF = 1 << 0;
        /// Return the lowest indirect block instead of the data block.
        const META_ONLY = 1 << 1;
        /// Write metadata synchronously.
        const SYNC = 1 << 2;
    }
}

/// Block allocation context of a mounted file system.
///
/// Binds the geometry to the services shared by every file of the mount:
/// the buffer cache, the physical allocator and, if soft updates are
/// enabled, the dependency tracker.
pub struct Filesystem<'a, D, M, A> {
    pub(crate) geom: FsGeometry,
    pub(crate) cache: &'a BufferCache<D, M>,
    pub(crate) allocator: &'a A,
    pub(crate) tracker: Option<&'a dyn DependencyTracker>,
}

impl<'a, D, M, A> Filesystem<'a, D, M, A>
where
    D: BlockDevice,
    D::Error: fmt::Debug,
    M: Mutex<Data = CacheState<BufKey>>,
    A: BlockAllocator,
{
    /// Creates a context without dependency tracking.
    pub fn new(geom: FsGeometry, cache: &'a BufferCache<D, M>, allocator: &'a A) -> Self {
        Self {
            geom,
            cache,
            allocator,
            tracker: None,
        }
    }

    /// Enables soft updates with `tracker`.
    #[must_use]
    pub fn with_tracker(self, tracker: &'a dyn DependencyTracker) -> Self {
        Self {
            tracker: Some(tracker),
            ..self
        }
    }

    #[must_use]
    pub fn geometry(&self) -> &FsGeometry {
        &self.geom
    }

    #[must_use]
    pub fn cache(&self) -> &'a BufferCache<D, M> {
        self.cache
    }

    #[must_use]
    pub fn allocator(&self) -> &'a A {
        self.allocator
    }

    /// Allocates the block holding `size` bytes at `addr` of `inode`, and
    /// any indirect blocks needed to reach it.
    ///
    /// Returns the buffer of the block, already linked into the inode's
    /// block tree. With [`BallocFlags::CLEAR_BUF`] new blocks are zeroed
    /// and existing ones are read; otherwise the returned buffer's contents
    /// may not be valid and the caller is expected to overwrite it.
    ///
    /// On failure every block allocated by this call is released again and
    /// the inode's block tree is left as it was.
    ///
    /// # Panics
    ///
    /// Panics if the request crosses a block boundary, or if
    /// [`BallocFlags::META_ONLY`] is given for a block stored in the inode.
    pub fn balloc<P>(
        &self,
        inode: &mut Inode<P>,
        addr: Address,
        size: usize,
        flags: BallocFlags,
    ) -> Result<Buf<'a, D, M>, BallocError>
    where
        P: BlockPtr,
    {
        let (area, offset) = match addr {
            Address::Data(offset) => (Area::Data, offset),
            Address::ExtAttr(offset) => (Area::ExtAttr, offset),
        };
        let end = self.geom.blkoff(offset) + size as u64;
        assert!(
            end <= u64::from(self.geom.bsize()),
            "request of {size} bytes at {offset} crosses a block boundary"
        );
        let lbn = self.geom.lblkno(offset);
        let ordering = WriteOrdering::select(self.tracker, flags.contains(BallocFlags::SYNC));

        match area {
            Area::ExtAttr => {
                if !P::HAS_EXT_ATTR {
                    return Err(BallocError::NotSupported);
                }
                if lbn >= NXADDR as u64 {
                    return Err(BallocError::FileTooLarge);
                }
                assert!(
                    !flags.contains(BallocFlags::META_ONLY),
                    "META_ONLY for an extended attribute block"
                );
            }
            Area::Data => {
                if lbn < NDADDR as u64 {
                    assert!(
                        !flags.contains(BallocFlags::META_ONLY),
                        "META_ONLY for a direct block"
                    );
                }
            }
        }

        log::debug!(
            "ino {}: balloc {} lbn {lbn} end {end} flags {flags:?}",
            inode.ino,
            P::FORMAT
        );
        self.grow_last_fragment(inode, area, lbn, flags, &ordering)?;
        if lbn < area.nptrs() as u64 {
            return self.alloc_direct(inode, area, lbn, end, flags, &ordering);
        }
        self.alloc_indirect(inode, lbn, flags, &ordering)
    }

    /// Writes every dirty buffer of `ino` and resolves its dependencies.
    pub fn sync_file(&self, ino: InodeNo) -> Result<(), BallocError> {
        self.cache.flush(|key| key.ino == ino).map_err(|e| {
            log::error!("ino {ino}: sync failed: {e:?}");
            BallocError::Io
        })?;
        if let Some(tracker) = self.tracker {
            tracker.sync(ino);
        }
        Ok(())
    }

    /// Allocates `size` bytes for `block` and charges them to `inode`.
    pub(crate) fn alloc_block<P>(
        &self,
        inode: &mut Inode<P>,
        block: LogicalBlock,
        pref: Option<Daddr>,
        size: u64,
    ) -> Result<Daddr, BallocError>
    where
        P: BlockPtr,
    {
        let daddr = self
            .allocator
            .alloc(inode.ino, block, pref, size)
            .map_err(|e| alloc_failed(inode.ino, e))?;
        inode.blocks += self.geom.btodb(size);
        log::debug!(
            "ino {}: allocated {block} at {daddr} ({size} bytes)",
            inode.ino
        );
        Ok(daddr)
    }

    pub(crate) fn bsize(&self) -> u64 {
        u64::from(self.geom.bsize())
    }

    pub(crate) fn frag(&self) -> u64 {
        u64::from(self.geom.frag())
    }
}

pub(crate) fn alloc_failed(ino: InodeNo, error: AllocError) -> BallocError {
    if error == AllocError::NoSpace {
        log::warn!("ino {ino}: write failed, filesystem is full");
    }
    error.into()
}

pub(crate) fn io_failed<E>(key: &BufKey, error: E) -> BallocError
where
    E: fmt::Debug,
{
    log::error!("{key}: I/O error: {error:?}");
    BallocError::Io
}

/// Converts a byte count of at most one block to a buffer length.
#[expect(clippy::cast_possible_truncation)]
pub(crate) fn buf_len(bytes: u64) -> usize {
    assert!(bytes <= u64::from(MAXBSIZE));
    bytes as usize
}
