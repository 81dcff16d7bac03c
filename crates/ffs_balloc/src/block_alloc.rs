use ufs_types::{BlockPtr, Daddr, IndirectBlock, InodeNo, LogicalBlock};

use crate::error::AllocError;

/// Where a new block will be linked, used to compute a placement hint.
#[derive(Clone, Copy)]
pub enum Placement<'a, P> {
    /// A data block stored at `index` of a pointer array.
    Data {
        index: usize,
        siblings: IndirectBlock<'a, P>,
    },
    /// An indirect block of height `level` (1 for a single indirect block).
    Indirect { level: usize },
}

/// Physical space allocator of a file system.
///
/// Sizes are in bytes and are multiples of the fragment size no larger
/// than the block size. All methods take `&self`; implementations
/// synchronise internally because one allocator serves every file of a
/// mount.
pub trait BlockAllocator {
    /// Allocates `size` bytes for `block` of inode `ino`, near `pref` if
    /// possible.
    fn alloc(
        &self,
        ino: InodeNo,
        block: LogicalBlock,
        pref: Option<Daddr>,
        size: u64,
    ) -> Result<Daddr, AllocError>;

    /// Grows the fragment run at `old` from `osize` to `nsize` bytes.
    ///
    /// Returns `old` if the run could be extended in place. Otherwise a new
    /// run is allocated and `old` is released.
    fn realloc_frag(
        &self,
        ino: InodeNo,
        block: LogicalBlock,
        old: Daddr,
        pref: Option<Daddr>,
        osize: u64,
        nsize: u64,
    ) -> Result<Daddr, AllocError>;

    /// Releases `size` bytes at `daddr`.
    fn free(&self, daddr: Daddr, size: u64, ino: InodeNo);

    /// Returns a placement hint for `block`.
    fn preference<P>(
        &self,
        ino: InodeNo,
        block: LogicalBlock,
        placement: Placement<'_, P>,
    ) -> Option<Daddr>
    where
        P: BlockPtr;
}
