//! In-memory inode fields used by block allocation.

use bitflags::bitflags;
use ufs_types::{BlockPtr, Daddr, IndirectBlock, InodeNo, LogicalBlock, NDADDR, NIADDR, NXADDR};

bitflags! {
    /// Pending inode updates.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct InodeFlags: u8 {
        /// Inode metadata changed.
        const CHANGE = 1 << 0;
        /// Inode content changed.
        const UPDATE = 1 << 1;
    }
}

/// An inode with block pointers of type `P`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Inode<P> {
    pub ino: InodeNo,
    /// File size in bytes.
    pub size: u64,
    /// Extended attribute area size in bytes.
    pub ext_size: u64,
    /// Allocated space in [`DEV_BSIZE`](ufs_types::DEV_BSIZE) units.
    pub blocks: u64,
    /// Direct block pointers.
    pub db: [P; NDADDR],
    /// Single, double and triple indirect block pointers.
    pub ib: [P; NIADDR],
    /// Extended attribute block pointers.
    pub extb: [P; NXADDR],
    pub flags: InodeFlags,
}

/// One of the two direct pointer areas of an inode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Area {
    Data,
    ExtAttr,
}

impl Area {
    /// Returns the number of direct pointers in the area.
    pub(crate) const fn nptrs(self) -> usize {
        match self {
            Self::Data => NDADDR,
            Self::ExtAttr => NXADDR,
        }
    }

    pub(crate) const fn block(self, lbn: u64) -> LogicalBlock {
        match self {
            Self::Data => LogicalBlock::Data(lbn),
            Self::ExtAttr => LogicalBlock::ExtAttr(lbn),
        }
    }
}

impl<P> Inode<P>
where
    P: BlockPtr,
{
    /// Creates an empty inode.
    #[must_use]
    pub fn new(ino: InodeNo) -> Self {
        Self {
            ino,
            size: 0,
            ext_size: 0,
            blocks: 0,
            db: [P::default(); NDADDR],
            ib: [P::default(); NIADDR],
            extb: [P::default(); NXADDR],
            flags: InodeFlags::empty(),
        }
    }

    #[must_use]
    pub fn direct(&self, lbn: usize) -> Option<Daddr> {
        self.db[lbn].get()
    }

    /// Returns the pointer to the indirect block of height `level + 1`.
    #[must_use]
    pub fn indirect(&self, level: usize) -> Option<Daddr> {
        self.ib[level].get()
    }

    #[must_use]
    pub fn ext(&self, lbn: usize) -> Option<Daddr> {
        self.extb[lbn].get()
    }

    /// Sets the file size, as the write path does after extending a file.
    pub fn set_size(&mut self, size: u64) {
        self.size = size;
        self.mark_modified();
    }

    /// Sets the extended attribute area size.
    pub fn set_ext_size(&mut self, size: u64) {
        self.ext_size = size;
        self.mark_modified();
    }

    pub fn mark_modified(&mut self) {
        self.flags |= InodeFlags::CHANGE | InodeFlags::UPDATE;
    }

    pub(crate) fn area_size(&self, area: Area) -> u64 {
        match area {
            Area::Data => self.size,
            Area::ExtAttr => self.ext_size,
        }
    }

    pub(crate) fn set_area_size(&mut self, area: Area, size: u64) {
        match area {
            Area::Data => self.size = size,
            Area::ExtAttr => self.ext_size = size,
        }
    }

    pub(crate) fn area_ptrs(&self, area: Area) -> IndirectBlock<'_, P> {
        match area {
            Area::Data => IndirectBlock::from_ptrs(&self.db),
            Area::ExtAttr => IndirectBlock::from_ptrs(&self.extb),
        }
    }

    pub(crate) fn set_area_ptr(&mut self, area: Area, lbn: usize, daddr: Option<Daddr>) {
        let ptrs: &mut [P] = match area {
            Area::Data => &mut self.db,
            Area::ExtAttr => &mut self.extb,
        };
        ptrs[lbn] = P::encode(daddr);
    }
}
