//! In-memory fragment bitmap allocator.

use alloc::{vec, vec::Vec};

use mutex_api::Mutex;
use ufs_types::{BlockPtr, Daddr, FsGeometry, InodeNo, LogicalBlock};

use crate::{
    block_alloc::{BlockAllocator, Placement},
    error::AllocError,
};

/// A [`BlockAllocator`] over a bitmap with one bit per fragment.
///
/// Allocation is first fit, starting at the block of the placement hint
/// and wrapping around. A run of fragments never crosses a block boundary,
/// so full blocks are always block aligned.
pub struct FragMap<M> {
    geom: FsGeometry,
    state: M,
}

/// Bitmap of a [`FragMap`], protected by its mutex.
pub struct FragState {
    /// Bit `i` is set if fragment `i` is in use.
    bits: Vec<u64>,
    nfree: u64,
}

impl FragState {
    fn index(frag: u64) -> (usize, u64) {
        #[expect(clippy::cast_possible_truncation)]
        let word = (frag / 64) as usize;
        (word, 1 << (frag % 64))
    }

    fn is_used(&self, frag: u64) -> bool {
        let (word, mask) = Self::index(frag);
        self.bits[word] & mask != 0
    }

    fn set_used(&mut self, frag: u64) {
        let (word, mask) = Self::index(frag);
        assert_eq!(self.bits[word] & mask, 0, "fragment {frag} is already in use");
        self.bits[word] |= mask;
        self.nfree -= 1;
    }

    fn set_free(&mut self, frag: u64) {
        let (word, mask) = Self::index(frag);
        assert_ne!(self.bits[word] & mask, 0, "freeing free fragment {frag}");
        self.bits[word] &= !mask;
        self.nfree += 1;
    }
}

impl<M> FragMap<M>
where
    M: Mutex<Data = FragState>,
{
    /// Creates an allocator in which fragments `0..reserved` are in use.
    ///
    /// # Panics
    ///
    /// Panics if `reserved` is zero (fragment 0 is the null pointer) or
    /// exceeds the file system size.
    pub fn new(geom: FsGeometry, reserved: u64) -> Self {
        assert!(reserved > 0 && reserved <= geom.size());
        #[expect(clippy::cast_possible_truncation)]
        let words = geom.size().div_ceil(64) as usize;
        let mut state = FragState {
            bits: vec![0; words],
            nfree: geom.size(),
        };
        for frag in 0..reserved {
            state.set_used(frag);
        }
        Self {
            geom,
            state: M::new(state),
        }
    }

    /// Returns the number of free fragments.
    pub fn free_fragments(&self) -> u64 {
        self.state.lock().nfree
    }

    /// Returns `true` if every fragment of the `size` bytes at `daddr` is
    /// in use.
    pub fn is_allocated(&self, daddr: Daddr, size: u64) -> bool {
        let state = self.state.lock();
        (0..self.geom.numfrags(size)).all(|i| state.is_used(daddr.value() + i))
    }

    fn frags(&self, size: u64) -> u64 {
        let frags = self.geom.numfrags(size);
        assert!(
            frags > 0
                && frags <= u64::from(self.geom.frag())
                && self.geom.fragroundup(size) == size,
            "bad allocation size {size}"
        );
        frags
    }

    fn is_run_free(&self, state: &FragState, start: u64, count: u64) -> bool {
        start + count <= self.geom.size() && (start..start + count).all(|f| !state.is_used(f))
    }

    /// Finds `count` free fragments inside one block, searching from the
    /// block containing `pref`.
    fn find_run(&self, state: &FragState, pref: Option<Daddr>, count: u64) -> Option<u64> {
        let frag = u64::from(self.geom.frag());
        let nblocks = self.geom.size().div_ceil(frag);
        let start = pref
            .map(|d| d.value() / frag)
            .filter(|b| *b < nblocks)
            .unwrap_or(0);
        (start..nblocks)
            .chain(0..start)
            .flat_map(|b| (0..=frag - count).map(move |off| b * frag + off))
            .find(|&f| self.is_run_free(state, f, count))
    }

    fn mark_used(state: &mut FragState, start: u64, count: u64) {
        for f in start..start + count {
            state.set_used(f);
        }
    }
}

impl<M> BlockAllocator for FragMap<M>
where
    M: Mutex<Data = FragState>,
{
    fn alloc(
        &self,
        _ino: InodeNo,
        _block: LogicalBlock,
        pref: Option<Daddr>,
        size: u64,
    ) -> Result<Daddr, AllocError> {
        let count = self.frags(size);
        let mut state = self.state.lock();
        let start = self
            .find_run(&state, pref, count)
            .ok_or(AllocError::NoSpace)?;
        Self::mark_used(&mut state, start, count);
        Ok(Daddr::new(start))
    }

    fn realloc_frag(
        &self,
        _ino: InodeNo,
        _block: LogicalBlock,
        old: Daddr,
        pref: Option<Daddr>,
        osize: u64,
        nsize: u64,
    ) -> Result<Daddr, AllocError> {
        let (ocount, ncount) = (self.frags(osize), self.frags(nsize));
        assert!(ocount < ncount, "fragment does not grow: {osize} -> {nsize}");

        let frag = u64::from(self.geom.frag());
        let old = old.value();
        let mut state = self.state.lock();
        assert!((old..old + ocount).all(|f| state.is_used(f)));

        if old % frag + ncount <= frag && self.is_run_free(&state, old + ocount, ncount - ocount) {
            Self::mark_used(&mut state, old + ocount, ncount - ocount);
            return Ok(Daddr::new(old));
        }

        let start = self
            .find_run(&state, pref, ncount)
            .ok_or(AllocError::NoSpace)?;
        Self::mark_used(&mut state, start, ncount);
        for f in old..old + ocount {
            state.set_free(f);
        }
        Ok(Daddr::new(start))
    }

    fn free(&self, daddr: Daddr, size: u64, _ino: InodeNo) {
        let count = self.frags(size);
        let frag = u64::from(self.geom.frag());
        assert!(
            daddr.value() % frag + count <= frag,
            "freed run crosses a block boundary"
        );
        let mut state = self.state.lock();
        for f in daddr.value()..daddr.value() + count {
            state.set_free(f);
        }
    }

    fn preference<P>(
        &self,
        _ino: InodeNo,
        _block: LogicalBlock,
        placement: Placement<'_, P>,
    ) -> Option<Daddr>
    where
        P: BlockPtr,
    {
        match placement {
            Placement::Data { index, siblings } => (0..index)
                .rev()
                .find_map(|i| siblings.get(i))
                .map(|prev| prev.add(u64::from(self.geom.frag()))),
            Placement::Indirect { .. } => None,
        }
    }
}
