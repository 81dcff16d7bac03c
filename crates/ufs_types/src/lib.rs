//! Data types for the UFS/FFS on-disk block tree.
//!
//! An inode addresses its content through a fixed array of block pointers:
//!
//! | slot            | count      | points to                                  |
//! |-----------------|------------|--------------------------------------------|
//! | direct          | [`NDADDR`] | data blocks (the last one may be a fragment) |
//! | single indirect | 1          | a block of [`FsGeometry::nindir()`] pointers to data blocks |
//! | double indirect | 1          | a block of pointers to single indirect blocks |
//! | triple indirect | 1          | a block of pointers to double indirect blocks |
//!
//! UFS2 inodes additionally carry [`NXADDR`] direct pointers to extended
//! attribute blocks.
//!
//! Block pointers are fragment addresses ([`Daddr`]); zero means "not
//! allocated". UFS1 stores them as `u32`, UFS2 as `u64`; [`BlockPtr`]
//! abstracts over the width.

#![cfg_attr(not(test), no_std)]

use core::{fmt, mem};

use dataview::{DataView, Pod, PodMethods};

pub use self::geometry::{FsGeometry, GeometryError, SuperBlock};

mod geometry;

/// Number of direct block pointers in an inode.
pub const NDADDR: usize = 12;

/// Number of indirect block pointers in an inode (single, double, triple).
pub const NIADDR: usize = 3;

/// Number of direct extended attribute block pointers in a UFS2 inode.
pub const NXADDR: usize = 2;

/// Unit of the inode block count.
pub const DEV_BSIZE: u64 = 512;

/// Smallest supported block size.
pub const MIN_BSIZE: u32 = 4096;

/// Largest supported block size.
pub const MAXBSIZE: u32 = 65536;

/// Maximum number of fragments per block.
pub const MAXFRAG: u32 = 8;

/// Physical disk address, in fragments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct Daddr(u64);

impl fmt::Display for Daddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Daddr {
    /// Creates a new `Daddr`.
    ///
    /// # Panics
    ///
    /// Panics if `n` is zero, which encodes "not allocated" on disk.
    #[must_use]
    pub const fn new(n: u64) -> Self {
        assert!(n != 0);
        Self(n)
    }

    #[must_use]
    pub const fn value(self) -> u64 {
        self.0
    }

    /// Returns the address `n` fragments after this one.
    #[must_use]
    pub const fn add(self, n: u64) -> Self {
        Self(self.0 + n)
    }
}

/// Inode number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct InodeNo(u32);

impl fmt::Display for InodeNo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl InodeNo {
    #[must_use]
    pub const fn new(n: u32) -> Self {
        Self(n)
    }

    #[must_use]
    pub const fn value(self) -> u32 {
        self.0
    }
}

/// On-disk block pointer.
///
/// Implemented for `u32` (UFS1) and `u64` (UFS2).
pub trait BlockPtr: Pod + Copy + Default + Eq + fmt::Debug + Send + Sync + 'static {
    /// Name of the on-disk format using this pointer width.
    const FORMAT: &'static str;

    /// Whether inodes of this format have an extended attribute area.
    const HAS_EXT_ATTR: bool;

    /// Size of one pointer in bytes.
    const WIDTH: usize = mem::size_of::<Self>();

    /// Decodes the pointer.
    fn get(self) -> Option<Daddr>;

    /// Encodes a pointer.
    ///
    /// # Panics
    ///
    /// Panics if the address does not fit the pointer width.
    fn encode(daddr: Option<Daddr>) -> Self;
}

impl BlockPtr for u32 {
    const FORMAT: &'static str = "UFS1";
    const HAS_EXT_ATTR: bool = false;

    fn get(self) -> Option<Daddr> {
        (self != 0).then(|| Daddr(self.into()))
    }

    fn encode(daddr: Option<Daddr>) -> Self {
        daddr.map_or(0, |d| {
            u32::try_from(d.0).expect("address does not fit a UFS1 block pointer")
        })
    }
}

impl BlockPtr for u64 {
    const FORMAT: &'static str = "UFS2";
    const HAS_EXT_ATTR: bool = true;

    fn get(self) -> Option<Daddr> {
        (self != 0).then_some(Daddr(self))
    }

    fn encode(daddr: Option<Daddr>) -> Self {
        daddr.map_or(0, |d| d.0)
    }
}

/// Logical identity of a block within one inode.
///
/// Data and extended attribute blocks are numbered from zero in their own
/// address space. Indirect blocks are numbered by their *meta block
/// number*: the first data block they cover plus their height minus one
/// (a single indirect block has height one). No two indirect blocks of a
/// file share a meta block number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LogicalBlock {
    Data(u64),
    ExtAttr(u64),
    Indirect(u64),
}

impl fmt::Display for LogicalBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Data(lbn) => write!(f, "data:{lbn}"),
            Self::ExtAttr(lbn) => write!(f, "extattr:{lbn}"),
            Self::Indirect(meta) => write!(f, "indir:{meta}"),
        }
    }
}

/// Read-only view of an indirect block as an array of `P` pointers.
#[derive(Clone, Copy)]
pub struct IndirectBlock<'a, P> {
    bytes: &'a [u8],
    _ptr: core::marker::PhantomData<P>,
}

/// Mutable view of an indirect block as an array of `P` pointers.
pub struct IndirectBlockMut<'a, P> {
    bytes: &'a mut [u8],
    _ptr: core::marker::PhantomData<P>,
}

impl<'a, P> IndirectBlock<'a, P>
where
    P: BlockPtr,
{
    #[must_use]
    pub fn new(bytes: &'a [u8]) -> Self {
        assert_eq!(bytes.len() % P::WIDTH, 0);
        Self {
            bytes,
            _ptr: core::marker::PhantomData,
        }
    }

    /// Views an in-memory pointer array, such as the direct pointers of an
    /// inode.
    #[must_use]
    pub fn from_ptrs(ptrs: &'a [P]) -> Self {
        Self::new(PodMethods::as_bytes(ptrs))
    }

    /// Returns the number of pointers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.bytes.len() / P::WIDTH
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the `i`th pointer.
    #[must_use]
    pub fn get(&self, i: usize) -> Option<Daddr> {
        assert!(i < self.len());
        DataView::from(self.bytes).read::<P>(i * P::WIDTH).get()
    }

    /// Iterates over all pointers.
    pub fn iter(&self) -> impl Iterator<Item = Option<Daddr>> + '_ {
        (0..self.len()).map(|i| self.get(i))
    }
}

impl<'a, P> IndirectBlockMut<'a, P>
where
    P: BlockPtr,
{
    pub fn new(bytes: &'a mut [u8]) -> Self {
        assert_eq!(bytes.len() % P::WIDTH, 0);
        Self {
            bytes,
            _ptr: core::marker::PhantomData,
        }
    }

    /// Sets the `i`th pointer.
    pub fn set(&mut self, i: usize, daddr: Option<Daddr>) {
        assert!(i < self.bytes.len() / P::WIDTH);
        DataView::from_mut(&mut *self.bytes).write(i * P::WIDTH, &P::encode(daddr));
    }
}
