//! Rollback of a failed indirect allocation.

use core::fmt;

use arrayvec::ArrayVec;
use block_io::{BlockDevice, CacheState};
use mutex_api::Mutex;
use ufs_types::{BlockPtr, Daddr, IndirectBlockMut, LogicalBlock, NIADDR};

use crate::{
    block_alloc::BlockAllocator,
    fs::{self, BufKey, Filesystem},
    inode::Inode,
    ordering::WriteOrdering,
    resolve::IndirPath,
};

/// The pointer that made the blocks of a call reachable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Link {
    /// Indirect pointer `slot` of the inode.
    Inode { slot: usize },
    /// The pointer of path entry `at`, stored in the indirect block at
    /// `daddr`.
    Indirect { at: usize, daddr: Daddr },
}

/// Blocks allocated by one call, and the first pointer installed.
///
/// Every block allocated after the first link hangs below it, so clearing
/// that one pointer detaches all of them.
#[derive(Debug, Default)]
pub(crate) struct RollbackLog {
    allocated: ArrayVec<(Daddr, LogicalBlock), { NIADDR + 1 }>,
    first_link: Option<Link>,
}

impl RollbackLog {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn allocated(&mut self, daddr: Daddr, block: LogicalBlock) {
        self.allocated.push((daddr, block));
    }

    pub(crate) fn linked(&mut self, link: Link) {
        self.first_link.get_or_insert(link);
    }

    fn is_empty(&self) -> bool {
        self.allocated.is_empty() && self.first_link.is_none()
    }
}

impl<D, M, A> Filesystem<'_, D, M, A>
where
    D: BlockDevice,
    D::Error: fmt::Debug,
    M: Mutex<Data = CacheState<BufKey>>,
    A: BlockAllocator,
{
    /// Releases every block in `rollback` and clears the pointer that
    /// linked them.
    ///
    /// Never fails; secondary errors are logged.
    pub(crate) fn unwind<P>(
        &self,
        inode: &mut Inode<P>,
        path: &IndirPath,
        rollback: &RollbackLog,
        ordering: &WriteOrdering<'_>,
    ) where
        P: BlockPtr,
    {
        if rollback.is_empty() {
            return;
        }
        let ino = inode.ino;
        let bsize = self.bsize();
        log::debug!(
            "ino {ino}: rolling back {} blocks, link {:?}",
            rollback.allocated.len(),
            rollback.first_link
        );

        // sync_file logs its own failures
        let _ = self.sync_file(ino);

        let mut freed = 0;
        for &(daddr, block) in &rollback.allocated {
            if let Some(bp) = self
                .cache
                .lookup(&BufKey::new(ino, block))
                .filter(|bp| bp.daddr() == Some(daddr.value()))
            {
                bp.invalidate();
            }
            self.allocator.free(daddr, bsize, ino);
            freed += bsize;
        }

        match rollback.first_link {
            None => {}
            Some(Link::Inode { slot }) => {
                inode.ib[slot] = P::encode(None);
                inode.mark_modified();
            }
            Some(Link::Indirect { at, daddr }) => {
                let step = path[at];
                let key = BufKey::new(ino, step.lbn);
                match self.cache.bread(key, daddr.value(), fs::buf_len(bsize)) {
                    Ok(mut bp) => {
                        IndirectBlockMut::<P>::new(bp.bytes_mut()).set(step.off, None);
                        if let Err(e) = ordering.commit_parent(bp) {
                            log::error!("{key}: cannot clear pointer {}: {e:?}", step.off);
                        }
                    }
                    Err(e) => {
                        log::error!("{key}: cannot read back to clear pointer {}: {e:?}", step.off);
                    }
                }
            }
        }

        if freed > 0 {
            inode.blocks -= self.geom.btodb(freed);
            inode.mark_modified();
        }

        let _ = self.sync_file(ino);
    }
}
