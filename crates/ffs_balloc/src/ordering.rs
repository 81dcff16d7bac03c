use core::fmt;

use block_io::{BlockDevice, Buf, CacheState};
use mutex_api::Mutex;
use ufs_types::{Daddr, InodeNo, LogicalBlock, NDADDR};

use crate::softdep::DependencyTracker;

/// How metadata writes are ordered during one allocation.
///
/// A pointer must never reach the disk before the block it points to has
/// been initialized there. With a tracker, new pointers are registered and
/// every write is delayed; the tracker enforces the order. Without one, a
/// new indirect block is written synchronously before it is linked, and
/// the parent is written synchronously only if the caller asked for it.
/// A synchronous parent write is preceded by the write of a new data
/// block below it, or delayed if that block has no valid contents yet.
#[derive(Clone, Copy)]
pub(crate) enum WriteOrdering<'t> {
    Tracked(&'t dyn DependencyTracker),
    Untracked { sync: bool },
}

impl fmt::Debug for WriteOrdering<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tracked(_) => f.write_str("Tracked"),
            Self::Untracked { sync } => f.debug_struct("Untracked").field("sync", sync).finish(),
        }
    }
}

impl<'t> WriteOrdering<'t> {
    pub(crate) fn select(tracker: Option<&'t dyn DependencyTracker>, sync: bool) -> Self {
        match tracker {
            Some(tracker) => Self::Tracked(tracker),
            None => Self::Untracked { sync },
        }
    }

    /// Registers a changed direct or extended attribute pointer of the inode.
    pub(crate) fn register_direct(
        &self,
        ino: InodeNo,
        block: LogicalBlock,
        new: Daddr,
        old: Option<Daddr>,
        nsize: u64,
        osize: u64,
    ) {
        let Self::Tracked(tracker) = self else {
            return;
        };
        match block {
            LogicalBlock::Data(lbn) => tracker.setup_alloc_direct(ino, lbn, new, old, nsize, osize),
            LogicalBlock::ExtAttr(lbn) => tracker.setup_alloc_ext(ino, lbn, new, old, nsize, osize),
            LogicalBlock::Indirect(_) => panic!("{block} is not stored in the inode"),
        }
    }

    /// Registers a new block linked at indirect pointer `level` of the inode.
    pub(crate) fn register_inode_indirect(&self, ino: InodeNo, level: usize, new: Daddr, size: u64) {
        if let Self::Tracked(tracker) = self {
            tracker.setup_alloc_direct(ino, (NDADDR + level) as u64, new, None, size, 0);
        }
    }

    /// Registers a new indirect block linked into `parent`.
    pub(crate) fn register_indir_meta(
        &self,
        ino: InodeNo,
        parent: LogicalBlock,
        ptrno: usize,
        new: Daddr,
    ) {
        if let Self::Tracked(tracker) = self {
            tracker.setup_alloc_indir_meta(ino, parent, ptrno, new);
        }
    }

    /// Registers a new data block linked into `parent`.
    pub(crate) fn register_indir_page(
        &self,
        ino: InodeNo,
        lbn: u64,
        parent: LogicalBlock,
        ptrno: usize,
        new: Daddr,
    ) {
        if let Self::Tracked(tracker) = self {
            tracker.setup_alloc_indir_page(ino, lbn, parent, ptrno, new, None);
        }
    }

    /// Whether the parent of a new data block is written synchronously, so
    /// that the data block has to be written first.
    pub(crate) const fn writes_data_first(&self) -> bool {
        matches!(self, Self::Untracked { sync: true })
    }

    /// Writes a newly allocated indirect block before it is linked.
    pub(crate) fn commit_new<D, M, K>(&self, bp: Buf<'_, D, M, K>) -> Result<(), D::Error>
    where
        D: BlockDevice,
        M: Mutex<Data = CacheState<K>>,
        K: Ord + Clone,
    {
        match self {
            Self::Tracked(_) => {
                bp.bdwrite();
                Ok(())
            }
            Self::Untracked { .. } => bp.bwrite(),
        }
    }

    /// Writes an indirect block whose pointers changed.
    pub(crate) fn commit_parent<D, M, K>(&self, bp: Buf<'_, D, M, K>) -> Result<(), D::Error>
    where
        D: BlockDevice,
        M: Mutex<Data = CacheState<K>>,
        K: Ord + Clone,
    {
        match self {
            Self::Untracked { sync: true } => bp.bwrite(),
            Self::Tracked(_) | Self::Untracked { sync: false } => {
                bp.bdwrite();
                Ok(())
            }
        }
    }
}
