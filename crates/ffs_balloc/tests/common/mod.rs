//! Fixtures shared by the allocation tests.

use std::{
    cell::{Cell, RefCell},
    collections::BTreeSet,
};

use block_io::{BlockDevice, BufferCache, CacheState};
use ffs_balloc::{
    Address, AllocError, BallocError, BallocFlags, BlockAllocator, BufKey, DepState, Filesystem,
    FragMap, FragState, Inode, Placement, SoftDeps,
};
use mutex_api::StdMutex;
use ufs_types::{
    BlockPtr, Daddr, FsGeometry, IndirectBlock, InodeNo, LogicalBlock, NDADDR, NIADDR,
};

pub const BSIZE: u32 = 4096;
pub const FSIZE: u32 = 1024;
pub const NBLOCKS: u64 = 256;
/// Fragments in use before any file is allocated.
pub const RESERVED: u64 = 4;
pub const INO: InodeNo = InodeNo::new(7);

pub type Cache = BufferCache<MemDevice, StdMutex<CacheState<BufKey>>>;
pub type Deps = SoftDeps<StdMutex<DepState>>;
pub type Fs<'a> = Filesystem<'a, MemDevice, StdMutex<CacheState<BufKey>>, TestAllocator>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IoFault(pub u64);

/// In-memory disk addressed in fragments.
///
/// Every successful write is appended to a journal, and reads or writes of
/// chosen addresses can be made to fail.
pub struct MemDevice {
    fsize: usize,
    image: RefCell<Vec<u8>>,
    journal: RefCell<Vec<u64>>,
    bad_reads: RefCell<BTreeSet<u64>>,
    bad_writes: RefCell<BTreeSet<u64>>,
    fail_writes: Cell<bool>,
}

impl MemDevice {
    pub fn new(fsize: u32, nfrags: u64) -> Self {
        let fsize = fsize as usize;
        Self {
            fsize,
            image: RefCell::new(vec![0; fsize * usize::try_from(nfrags).unwrap()]),
            journal: RefCell::new(vec![]),
            bad_reads: RefCell::new(BTreeSet::new()),
            bad_writes: RefCell::new(BTreeSet::new()),
            fail_writes: Cell::new(false),
        }
    }

    pub fn fail_read(&self, addr: Daddr) {
        self.bad_reads.borrow_mut().insert(addr.value());
    }

    pub fn fail_write(&self, addr: Daddr) {
        self.bad_writes.borrow_mut().insert(addr.value());
    }

    pub fn fail_all_writes(&self) {
        self.fail_writes.set(true);
    }

    pub fn heal(&self) {
        self.bad_reads.borrow_mut().clear();
        self.bad_writes.borrow_mut().clear();
        self.fail_writes.set(false);
    }

    /// Returns the addresses written so far, in order.
    pub fn writes(&self) -> Vec<u64> {
        self.journal.borrow().clone()
    }

    /// Returns `len` bytes of the image starting at `addr`.
    pub fn peek(&self, addr: Daddr, len: usize) -> Vec<u8> {
        let start = self.offset(addr.value());
        self.image.borrow()[start..start + len].to_vec()
    }

    fn offset(&self, addr: u64) -> usize {
        usize::try_from(addr).unwrap() * self.fsize
    }
}

impl BlockDevice for MemDevice {
    type Error = IoFault;

    fn read(&self, addr: u64, data: &mut [u8]) -> Result<(), Self::Error> {
        if self.bad_reads.borrow().contains(&addr) {
            return Err(IoFault(addr));
        }
        let start = self.offset(addr);
        data.copy_from_slice(&self.image.borrow()[start..start + data.len()]);
        Ok(())
    }

    fn write(&self, addr: u64, data: &[u8]) -> Result<(), Self::Error> {
        if self.fail_writes.get() || self.bad_writes.borrow().contains(&addr) {
            return Err(IoFault(addr));
        }
        let start = self.offset(addr);
        self.image.borrow_mut()[start..start + data.len()].copy_from_slice(data);
        self.journal.borrow_mut().push(addr);
        Ok(())
    }
}

/// [`FragMap`] that records its allocations and can be told to fail.
pub struct TestAllocator {
    pub map: FragMap<StdMutex<FragState>>,
    /// Successful `alloc` calls remaining before the injected failure.
    countdown: Cell<Option<(usize, AllocError)>>,
    allocated: RefCell<Vec<(LogicalBlock, Daddr)>>,
    freed: RefCell<Vec<Daddr>>,
}

impl TestAllocator {
    fn new(geom: FsGeometry) -> Self {
        Self {
            map: FragMap::new(geom, RESERVED),
            countdown: Cell::new(None),
            allocated: RefCell::new(vec![]),
            freed: RefCell::new(vec![]),
        }
    }

    /// Makes `alloc` fail with `error` after `successes` more successful
    /// calls.
    pub fn fail_after(&self, successes: usize, error: AllocError) {
        self.countdown.set(Some((successes, error)));
    }

    /// Returns every block handed out by `alloc`, in order.
    pub fn allocated(&self) -> Vec<(LogicalBlock, Daddr)> {
        self.allocated.borrow().clone()
    }

    pub fn alloc_count(&self) -> usize {
        self.allocated.borrow().len()
    }

    pub fn freed(&self) -> Vec<Daddr> {
        self.freed.borrow().clone()
    }

    pub fn free_fragments(&self) -> u64 {
        self.map.free_fragments()
    }
}

impl BlockAllocator for TestAllocator {
    fn alloc(
        &self,
        ino: InodeNo,
        block: LogicalBlock,
        pref: Option<Daddr>,
        size: u64,
    ) -> Result<Daddr, AllocError> {
        match self.countdown.get() {
            Some((0, error)) => {
                self.countdown.set(None);
                return Err(error);
            }
            Some((n, error)) => self.countdown.set(Some((n - 1, error))),
            None => {}
        }
        let daddr = self.map.alloc(ino, block, pref, size)?;
        self.allocated.borrow_mut().push((block, daddr));
        Ok(daddr)
    }

    fn realloc_frag(
        &self,
        ino: InodeNo,
        block: LogicalBlock,
        old: Daddr,
        pref: Option<Daddr>,
        osize: u64,
        nsize: u64,
    ) -> Result<Daddr, AllocError> {
        self.map.realloc_frag(ino, block, old, pref, osize, nsize)
    }

    fn free(&self, daddr: Daddr, size: u64, ino: InodeNo) {
        self.freed.borrow_mut().push(daddr);
        self.map.free(daddr, size, ino);
    }

    fn preference<P>(
        &self,
        ino: InodeNo,
        block: LogicalBlock,
        placement: Placement<'_, P>,
    ) -> Option<Daddr>
    where
        P: BlockPtr,
    {
        self.map.preference(ino, block, placement)
    }
}

/// A file system of [`NBLOCKS`] blocks of [`BSIZE`] bytes.
pub struct Fixture {
    pub geom: FsGeometry,
    pub cache: Cache,
    pub alloc: TestAllocator,
    pub deps: Deps,
}

impl Fixture {
    pub fn new() -> Self {
        let geom = FsGeometry::with_sizes(BSIZE, FSIZE, NBLOCKS * u64::from(BSIZE / FSIZE)).unwrap();
        Self {
            geom,
            cache: Cache::new(MemDevice::new(FSIZE, geom.size()), 64),
            alloc: TestAllocator::new(geom),
            deps: Deps::new(),
        }
    }

    pub fn untracked(&self) -> Fs<'_> {
        Filesystem::new(self.geom, &self.cache, &self.alloc)
    }

    pub fn tracked(&self) -> Fs<'_> {
        self.untracked().with_tracker(&self.deps)
    }

    pub fn fs(&self, tracked: bool) -> Fs<'_> {
        if tracked {
            self.tracked()
        } else {
            self.untracked()
        }
    }

    pub fn device(&self) -> &MemDevice {
        self.cache.device()
    }

    /// Returns every block reachable from `inode`, reading indirect blocks
    /// through the cache.
    pub fn reachable<P>(&self, inode: &Inode<P>) -> Vec<(LogicalBlock, Daddr)>
    where
        P: BlockPtr,
    {
        walk_tree(inode, self.geom.nindir::<P>(), |block, daddr| {
            let key = BufKey::new(inode.ino, block);
            self.cache
                .bread(key, daddr.value(), BSIZE as usize)
                .unwrap()
                .bytes()
                .to_vec()
        })
    }

    /// Returns every block reachable from `inode` in the device image.
    pub fn reachable_on_disk<P>(&self, inode: &Inode<P>) -> Vec<(LogicalBlock, Daddr)>
    where
        P: BlockPtr,
    {
        walk_tree(inode, self.geom.nindir::<P>(), |_, daddr| {
            self.device().peek(daddr, BSIZE as usize)
        })
    }

    /// Returns the space charged for the blocks reachable from `inode`, in
    /// `DEV_BSIZE` units.
    pub fn reachable_blocks<P>(&self, inode: &Inode<P>) -> u64
    where
        P: BlockPtr,
    {
        self.reachable(inode)
            .iter()
            .map(|(block, _)| {
                let size = match *block {
                    LogicalBlock::Data(lbn) => self.geom.blksize(inode.size, lbn),
                    LogicalBlock::ExtAttr(lbn) => self.geom.sblksize(inode.ext_size, lbn),
                    LogicalBlock::Indirect(_) => u64::from(BSIZE),
                };
                self.geom.btodb(size)
            })
            .sum()
    }

    /// Reads the pointers of indirect block `meta` at `daddr`.
    pub fn indirect_ptrs<P>(&self, meta: u64, daddr: Daddr) -> Vec<Option<Daddr>>
    where
        P: BlockPtr,
    {
        let bp = self
            .cache
            .bread(
                BufKey::new(INO, LogicalBlock::Indirect(meta)),
                daddr.value(),
                BSIZE as usize,
            )
            .unwrap();
        IndirectBlock::<P>::new(bp.bytes()).iter().collect()
    }
}

/// Stores `data` at `offset` the way the write path does: allocate with
/// [`BallocFlags::CLEAR_BUF`], copy, delay the write, extend the size.
pub fn write<P>(fs: &Fs<'_>, inode: &mut Inode<P>, offset: u64, data: &[u8]) -> Result<(), BallocError>
where
    P: BlockPtr,
{
    let mut bp = fs.balloc(inode, Address::Data(offset), data.len(), BallocFlags::CLEAR_BUF)?;
    let off = usize::try_from(fs.geometry().blkoff(offset)).unwrap();
    bp.bytes_mut()[off..off + data.len()].copy_from_slice(data);
    bp.bdwrite();
    let end = offset + data.len() as u64;
    if end > inode.size {
        inode.set_size(end);
    }
    Ok(())
}

/// Returns the byte offset of data block `lbn`.
pub fn offset_of(lbn: u64) -> u64 {
    lbn * u64::from(BSIZE)
}

/// First data block reached through indirect pointer `level`.
pub fn first_lbn(nindir: u64, level: usize) -> u64 {
    (0..level).fold(NDADDR as u64, |lbn, l| lbn + nindir.pow(l as u32 + 1))
}

fn walk_tree<P, F>(inode: &Inode<P>, nindir: u64, mut read: F) -> Vec<(LogicalBlock, Daddr)>
where
    P: BlockPtr,
    F: FnMut(LogicalBlock, Daddr) -> Vec<u8>,
{
    let mut found = vec![];
    for (lbn, ptr) in (0..).zip(inode.db) {
        if let Some(daddr) = ptr.get() {
            found.push((LogicalBlock::Data(lbn), daddr));
        }
    }
    for (lbn, ptr) in (0..).zip(inode.extb) {
        if let Some(daddr) = ptr.get() {
            found.push((LogicalBlock::ExtAttr(lbn), daddr));
        }
    }
    for level in 0..NIADDR {
        if let Some(daddr) = inode.ib[level].get() {
            let first = first_lbn(nindir, level);
            walk_indirect::<P, F>(&mut read, nindir, first, level as u64 + 1, daddr, &mut found);
        }
    }
    found
}

fn walk_indirect<P, F>(
    read: &mut F,
    nindir: u64,
    first: u64,
    height: u64,
    daddr: Daddr,
    found: &mut Vec<(LogicalBlock, Daddr)>,
) where
    P: BlockPtr,
    F: FnMut(LogicalBlock, Daddr) -> Vec<u8>,
{
    let block = LogicalBlock::Indirect(first + height - 1);
    found.push((block, daddr));
    let bytes = read(block, daddr);
    let span = nindir.pow(height as u32 - 1);
    let ptrs = IndirectBlock::<P>::new(&bytes);
    for (i, child) in (0..).zip(ptrs.iter()) {
        let Some(child) = child else {
            continue;
        };
        let child_first = first + i * span;
        if height == 1 {
            found.push((LogicalBlock::Data(child_first), child));
        } else {
            walk_indirect::<P, F>(read, nindir, child_first, height - 1, child, found);
        }
    }
}
