//! Growth of a trailing fragment.
//!
//! Only the last block of a file may be a fragment, and only if it is a
//! direct block. Before a file is extended past that block, the fragment
//! is promoted to a full block.

use core::fmt;

use block_io::{BlockDevice, CacheState};
use mutex_api::Mutex;
use ufs_types::{BlockPtr, Daddr};

use crate::{
    block_alloc::{BlockAllocator, Placement},
    error::BallocError,
    fs::{self, BallocFlags, Buf, BufKey, Filesystem},
    inode::{Area, Inode},
    ordering::WriteOrdering,
};

impl<'a, D, M, A> Filesystem<'a, D, M, A>
where
    D: BlockDevice,
    D::Error: fmt::Debug,
    M: Mutex<Data = CacheState<BufKey>>,
    A: BlockAllocator,
{
    /// Promotes the last block of `area` to a full block if it is a
    /// fragment and `lbn` lies beyond it.
    pub(crate) fn grow_last_fragment<P>(
        &self,
        inode: &mut Inode<P>,
        area: Area,
        lbn: u64,
        flags: BallocFlags,
        ordering: &WriteOrdering<'_>,
    ) -> Result<(), BallocError>
    where
        P: BlockPtr,
    {
        let area_size = inode.area_size(area);
        let last = self.geom.lblkno(area_size);
        if last >= area.nptrs() as u64 || last >= lbn {
            return Ok(());
        }
        let osize = self.geom.sblksize(area_size, last);
        if osize == 0 || osize >= self.bsize() {
            return Ok(());
        }
        #[expect(clippy::cast_possible_truncation)]
        let idx = last as usize;
        let Some(old) = inode.area_ptrs(area).get(idx) else {
            return Ok(());
        };

        let (bp, new) = self.realloc_fragment(inode, area, last, old, osize, self.bsize())?;
        ordering.register_direct(inode.ino, area.block(last), new, Some(old), self.bsize(), osize);
        inode.set_area_size(area, self.geom.lblktosize(last + 1));
        inode.set_area_ptr(area, idx, Some(new));
        inode.mark_modified();

        if flags.contains(BallocFlags::SYNC) {
            let key = *bp.key();
            if let Err(e) = bp.bwrite() {
                // the buffer stays dirty and is retried by the next sync
                log::error!("{key}: write of grown fragment failed: {e:?}");
            }
        } else {
            bp.bawrite();
        }
        Ok(())
    }

    /// Grows the `osize` byte fragment run `old` holding block `lbn` of
    /// `area` to `nsize` bytes.
    ///
    /// Returns the new address and the buffer of the block, bound to it,
    /// with the old contents preserved and the rest zeroed. The difference
    /// is charged to the inode; the pointer in the inode is not changed.
    pub(crate) fn realloc_fragment<P>(
        &self,
        inode: &mut Inode<P>,
        area: Area,
        lbn: u64,
        old: Daddr,
        osize: u64,
        nsize: u64,
    ) -> Result<(Buf<'a, D, M>, Daddr), BallocError>
    where
        P: BlockPtr,
    {
        let ino = inode.ino;
        let block = area.block(lbn);
        let key = BufKey::new(ino, block);
        #[expect(clippy::cast_possible_truncation)]
        let pref = self.allocator.preference(
            ino,
            block,
            Placement::Data {
                index: lbn as usize,
                siblings: inode.area_ptrs(area),
            },
        );

        let mut bp = self
            .cache
            .bread(key, old.value(), fs::buf_len(osize))
            .map_err(|e| fs::io_failed(&key, e))?;
        let new = self
            .allocator
            .realloc_frag(ino, block, old, pref, osize, nsize)
            .map_err(|e| fs::alloc_failed(ino, e))?;
        bp.resize(fs::buf_len(nsize));
        bp.set_daddr(new.value());
        inode.blocks += self.geom.btodb(nsize - osize);
        log::debug!("ino {ino}: grew {block} from {old}/{osize} to {new}/{nsize}");
        Ok((bp, new))
    }
}
