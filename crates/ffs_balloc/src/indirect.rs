//! Allocation through indirect blocks.
//!
//! The walk starts at the inode's indirect pointer and descends one level
//! at a time, allocating every missing indirect block on the way and
//! finally the data block. Each new block is zeroed and committed before
//! the pointer to it is installed in its parent. Everything allocated is
//! recorded in a [`RollbackLog`] so that a failure part way down can be
//! undone.

use core::fmt;

use block_io::{BlockDevice, CacheState};
use mutex_api::Mutex;
use ufs_types::{BlockPtr, Daddr, IndirectBlock, IndirectBlockMut, InodeNo, LogicalBlock};

use crate::{
    block_alloc::{BlockAllocator, Placement},
    error::BallocError,
    fs::{self, BallocFlags, Buf, BufKey, Filesystem},
    inode::Inode,
    ordering::WriteOrdering,
    resolve::{self, IndirPath},
    unwind::{Link, RollbackLog},
};

impl<'a, D, M, A> Filesystem<'a, D, M, A>
where
    D: BlockDevice,
    D::Error: fmt::Debug,
    M: Mutex<Data = CacheState<BufKey>>,
    A: BlockAllocator,
{
    /// Returns data block `lbn` (or, with [`BallocFlags::META_ONLY`], the
    /// indirect block holding its pointer), allocating whatever is missing.
    ///
    /// On failure the blocks allocated so far are released and the
    /// pointer linking them is cleared again.
    pub(crate) fn alloc_indirect<P>(
        &self,
        inode: &mut Inode<P>,
        lbn: u64,
        flags: BallocFlags,
        ordering: &WriteOrdering<'_>,
    ) -> Result<Buf<'a, D, M>, BallocError>
    where
        P: BlockPtr,
    {
        let path = resolve::resolve(self.geom.nindir::<P>(), lbn)?;
        let mut rollback = RollbackLog::new();
        match self.walk(inode, lbn, &path, flags, ordering, &mut rollback) {
            Ok(bp) => Ok(bp),
            Err(e) => {
                log::debug!("ino {}: allocation of lbn {lbn} failed: {e}", inode.ino);
                self.unwind(inode, &path, &rollback, ordering);
                Err(e)
            }
        }
    }

    fn walk<P>(
        &self,
        inode: &mut Inode<P>,
        lbn: u64,
        path: &IndirPath,
        flags: BallocFlags,
        ordering: &WriteOrdering<'_>,
        rollback: &mut RollbackLog,
    ) -> Result<Buf<'a, D, M>, BallocError>
    where
        P: BlockPtr,
    {
        let ino = inode.ino;
        let num = path.len() - 1;
        let bsize = self.bsize();
        let mut pref = None;

        let top = path[0];
        let mut nb = match inode.ib[top.off].get() {
            Some(nb) => nb,
            None => {
                let hint = self.allocator.preference::<P>(
                    ino,
                    top.lbn,
                    Placement::Indirect { level: num },
                );
                let new = self.alloc_block(inode, top.lbn, hint, bsize)?;
                rollback.allocated(new, top.lbn);
                pref = Some(new.add(self.frag()));
                ordering.register_inode_indirect(ino, top.off, new, bsize);
                self.commit_new_indirect(ino, top.lbn, new, ordering)?;
                inode.ib[top.off] = P::encode(Some(new));
                rollback.linked(Link::Inode { slot: top.off });
                inode.mark_modified();
                new
            }
        };

        // Descend to the indirect block holding the data pointer.
        let mut i = 1;
        let (mut bp, child) = loop {
            let step = path[i];
            let key = BufKey::new(ino, step.lbn);
            let mut bp = self
                .cache
                .bread(key, nb.value(), fs::buf_len(bsize))
                .map_err(|e| fs::io_failed(&key, e))?;
            let child = IndirectBlock::<P>::new(bp.bytes()).get(step.off);
            if i == num {
                break (bp, child);
            }
            i += 1;
            if let Some(child) = child {
                nb = child;
                continue;
            }

            let block = path[i].lbn;
            let hint = pref.or_else(|| {
                self.allocator.preference::<P>(
                    ino,
                    block,
                    Placement::Indirect { level: num - i + 1 },
                )
            });
            let new = self.alloc_block(inode, block, hint, bsize)?;
            rollback.allocated(new, block);
            pref = Some(new.add(self.frag()));
            ordering.register_indir_meta(ino, step.lbn, step.off, new);
            self.commit_new_indirect(ino, block, new, ordering)?;
            IndirectBlockMut::<P>::new(bp.bytes_mut()).set(step.off, Some(new));
            rollback.linked(Link::Indirect {
                at: i - 1,
                daddr: nb,
            });
            ordering
                .commit_parent(bp)
                .map_err(|e| fs::io_failed(&key, e))?;
            nb = new;
        };

        if flags.contains(BallocFlags::META_ONLY) {
            return Ok(bp);
        }

        let data = LogicalBlock::Data(lbn);
        let data_key = BufKey::new(ino, data);
        if let Some(nb) = child {
            drop(bp);
            if flags.contains(BallocFlags::CLEAR_BUF) {
                return self
                    .cache
                    .bread(data_key, nb.value(), fs::buf_len(bsize))
                    .map_err(|e| fs::io_failed(&data_key, e));
            }
            let mut nbp = self.cache.getblk(data_key, fs::buf_len(bsize));
            nbp.set_daddr(nb.value());
            return Ok(nbp);
        }

        let step = path[num];
        let hint = pref.or_else(|| {
            self.allocator.preference(
                ino,
                data,
                Placement::Data {
                    index: step.off,
                    siblings: IndirectBlock::<P>::new(bp.bytes()),
                },
            )
        });
        let new = self.alloc_block(inode, data, hint, bsize)?;
        rollback.allocated(new, data);
        let mut nbp = self.cache.getblk(data_key, fs::buf_len(bsize));
        nbp.set_daddr(new.value());
        if flags.contains(BallocFlags::CLEAR_BUF) {
            nbp.clear();
        }
        ordering.register_indir_page(ino, lbn, step.lbn, step.off, new);
        IndirectBlockMut::<P>::new(bp.bytes_mut()).set(step.off, Some(new));
        rollback.linked(Link::Indirect { at: num, daddr: nb });

        if !ordering.writes_data_first() {
            let parent_key = *bp.key();
            ordering
                .commit_parent(bp)
                .map_err(|e| fs::io_failed(&parent_key, e))?;
            return Ok(nbp);
        }
        if !flags.contains(BallocFlags::CLEAR_BUF) {
            // nothing valid to write yet, so the pointer has to wait too
            bp.bdwrite();
            return Ok(nbp);
        }
        let nbp = self.write_new_data(data_key, new, nbp)?;
        let parent_key = *bp.key();
        ordering
            .commit_parent(bp)
            .map_err(|e| fs::io_failed(&parent_key, e))?;
        Ok(nbp)
    }

    /// Writes the zeroed data block `bp` at `daddr` and checks it out again.
    fn write_new_data(
        &self,
        key: BufKey,
        daddr: Daddr,
        bp: Buf<'a, D, M>,
    ) -> Result<Buf<'a, D, M>, BallocError> {
        bp.bwrite().map_err(|e| fs::io_failed(&key, e))?;
        self.cache
            .bread(key, daddr.value(), fs::buf_len(self.bsize()))
            .map_err(|e| fs::io_failed(&key, e))
    }

    /// Zeroes the new indirect block `block` at `daddr` and writes it.
    fn commit_new_indirect(
        &self,
        ino: InodeNo,
        block: LogicalBlock,
        daddr: Daddr,
        ordering: &WriteOrdering<'_>,
    ) -> Result<(), BallocError> {
        let key = BufKey::new(ino, block);
        let mut bp = self.cache.getblk(key, fs::buf_len(self.bsize()));
        bp.set_daddr(daddr.value());
        bp.clear();
        ordering
            .commit_new(bp)
            .map_err(|e| fs::io_failed(&key, e))
    }
}
