use core::fmt;

use block_io::{BlockDevice, CacheState};
use mutex_api::Mutex;
use ufs_types::BlockPtr;

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
    /// Returns block `lbn` of the direct pointer area `area`, allocating or
    /// growing it so that it holds `end` bytes.
    pub(crate) fn alloc_direct<P>(
        &self,
        inode: &mut Inode<P>,
        area: Area,
        lbn: u64,
        end: u64,
        flags: BallocFlags,
        ordering: &WriteOrdering<'_>,
    ) -> Result<Buf<'a, D, M>, BallocError>
    where
        P: BlockPtr,
    {
        let ino = inode.ino;
        let block = area.block(lbn);
        let key = BufKey::new(ino, block);
        #[expect(clippy::cast_possible_truncation)]
        let idx = lbn as usize;
        let area_size = inode.area_size(area);
        let covered = area_size >= self.geom.lblktosize(lbn + 1);

        let (bp, new) = if let Some(nb) = inode.area_ptrs(area).get(idx) {
            if covered {
                // a full block that is already allocated
                return self
                    .cache
                    .bread(key, nb.value(), fs::buf_len(self.bsize()))
                    .map_err(|e| fs::io_failed(&key, e));
            }

            // the last block of the area, a fragment
            let osize = self.geom.fragroundup(self.geom.blkoff(area_size));
            let nsize = self.geom.fragroundup(end);
            if nsize <= osize {
                return self
                    .cache
                    .bread(key, nb.value(), fs::buf_len(osize))
                    .map_err(|e| fs::io_failed(&key, e));
            }
            let (bp, new) = self.realloc_fragment(inode, area, lbn, nb, osize, nsize)?;
            ordering.register_direct(ino, block, new, Some(nb), nsize, osize);
            (bp, new)
        } else {
            let nsize = if covered {
                self.bsize()
            } else {
                self.geom.fragroundup(end)
            };
            let pref = self.allocator.preference(
                ino,
                block,
                Placement::Data {
                    index: idx,
                    siblings: inode.area_ptrs(area),
                },
            );
            let new = self.alloc_block(inode, block, pref, nsize)?;
            let mut bp = self.cache.getblk(key, fs::buf_len(nsize));
            bp.set_daddr(new.value());
            if flags.contains(BallocFlags::CLEAR_BUF) {
                bp.clear();
            }
            ordering.register_direct(ino, block, new, None, nsize, 0);
            (bp, new)
        };

        inode.set_area_ptr(area, idx, Some(new));
        inode.mark_modified();
        Ok(bp)
    }
}
