use dataview::Pod;

use crate::{BlockPtr, DEV_BSIZE, MAXBSIZE, MAXFRAG, MIN_BSIZE, NDADDR, NIADDR};

/// The part of the super block the block allocator depends on.
#[derive(Debug, Clone, Pod)]
#[repr(C)]
pub struct SuperBlock {
    /// Magic number. Must be [`Self::FS_UFS1_MAGIC`] or [`Self::FS_UFS2_MAGIC`].
    pub magic: u32,
    /// Block size in bytes.
    pub bsize: u32,
    /// Fragment size in bytes.
    pub fsize: u32,
    /// Number of fragments per block.
    pub frag: u32,
    /// Size of the file system in fragments.
    pub size: u64,
}

impl SuperBlock {
    pub const FS_UFS1_MAGIC: u32 = 0x0001_1954;
    pub const FS_UFS2_MAGIC: u32 = 0x1954_0119;
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GeometryError {
    #[error("bad super block magic {0:#x}")]
    BadMagic(u32),
    #[error("block size {0} is not a power of two in {MIN_BSIZE}..={MAXBSIZE}")]
    BlockSize(u32),
    #[error("fragment size {fsize} does not split block size {bsize} into 1..={MAXFRAG} pieces")]
    FragmentSize { bsize: u32, fsize: u32 },
    #[error("fragments per block {frag} does not match {bsize} / {fsize}")]
    FragmentCount { bsize: u32, fsize: u32, frag: u32 },
    #[error("file system size {0} is smaller than one block")]
    TooSmall(u64),
    #[error("file system size {0} does not fit UFS1 block pointers")]
    TooLargeForUfs1(u64),
}

/// Validated block geometry of a mounted file system.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FsGeometry {
    bsize: u32,
    fsize: u32,
    frag: u32,
    bshift: u32,
    fshift: u32,
    size: u64,
}

impl FsGeometry {
    /// Derives the geometry from a super block.
    pub fn new(sb: &SuperBlock) -> Result<Self, GeometryError> {
        if sb.magic != SuperBlock::FS_UFS1_MAGIC && sb.magic != SuperBlock::FS_UFS2_MAGIC {
            return Err(GeometryError::BadMagic(sb.magic));
        }
        if sb.magic == SuperBlock::FS_UFS1_MAGIC && sb.size > u64::from(u32::MAX) {
            return Err(GeometryError::TooLargeForUfs1(sb.size));
        }
        let geom = Self::with_sizes(sb.bsize, sb.fsize, sb.size)?;
        if sb.frag != geom.frag {
            return Err(GeometryError::FragmentCount {
                bsize: sb.bsize,
                fsize: sb.fsize,
                frag: sb.frag,
            });
        }
        Ok(geom)
    }

    /// Creates a geometry from block size, fragment size and file system
    /// size in fragments.
    pub fn with_sizes(bsize: u32, fsize: u32, size: u64) -> Result<Self, GeometryError> {
        if !bsize.is_power_of_two() || !(MIN_BSIZE..=MAXBSIZE).contains(&bsize) {
            return Err(GeometryError::BlockSize(bsize));
        }
        if !fsize.is_power_of_two() || fsize > bsize || bsize / fsize > MAXFRAG {
            return Err(GeometryError::FragmentSize { bsize, fsize });
        }
        let frag = bsize / fsize;
        if size < u64::from(frag) {
            return Err(GeometryError::TooSmall(size));
        }
        Ok(Self {
            bsize,
            fsize,
            frag,
            bshift: bsize.trailing_zeros(),
            fshift: fsize.trailing_zeros(),
            size,
        })
    }

    #[must_use]
    pub const fn bsize(&self) -> u32 {
        self.bsize
    }

    #[must_use]
    pub const fn fsize(&self) -> u32 {
        self.fsize
    }

    /// Returns the number of fragments per block.
    #[must_use]
    pub const fn frag(&self) -> u32 {
        self.frag
    }

    /// Returns the file system size in fragments.
    #[must_use]
    pub const fn size(&self) -> u64 {
        self.size
    }

    /// Returns the logical block number containing byte `offset`.
    #[must_use]
    pub const fn lblkno(&self, offset: u64) -> u64 {
        offset >> self.bshift
    }

    /// Returns the offset of byte `offset` within its block.
    #[must_use]
    pub const fn blkoff(&self, offset: u64) -> u64 {
        offset & (self.bsize as u64 - 1)
    }

    /// Returns the byte offset where logical block `lbn` starts.
    #[must_use]
    pub const fn lblktosize(&self, lbn: u64) -> u64 {
        lbn << self.bshift
    }

    /// Rounds `size` up to a multiple of the fragment size.
    #[must_use]
    pub const fn fragroundup(&self, size: u64) -> u64 {
        (size + self.fsize as u64 - 1) & !(self.fsize as u64 - 1)
    }

    /// Returns the number of fragments in `size` bytes.
    #[must_use]
    pub const fn numfrags(&self, size: u64) -> u64 {
        size >> self.fshift
    }

    /// Converts bytes to [`DEV_BSIZE`] units.
    #[must_use]
    pub const fn btodb(&self, bytes: u64) -> u64 {
        bytes / DEV_BSIZE
    }

    /// Returns the allocated size of block `lbn` in an area of `area_size`
    /// bytes, where only the last block may be a fragment.
    #[must_use]
    pub const fn sblksize(&self, area_size: u64, lbn: u64) -> u64 {
        if area_size >= self.lblktosize(lbn + 1) {
            self.bsize as u64
        } else {
            self.fragroundup(self.blkoff(area_size))
        }
    }

    /// Returns the allocated size of data block `lbn` of a file of
    /// `file_size` bytes.
    ///
    /// Blocks beyond the direct area are always full blocks.
    #[must_use]
    pub const fn blksize(&self, file_size: u64, lbn: u64) -> u64 {
        if lbn >= NDADDR as u64 {
            self.bsize as u64
        } else {
            self.sblksize(file_size, lbn)
        }
    }

    /// Returns the number of pointers in an indirect block.
    #[must_use]
    pub const fn nindir<P>(&self) -> u64
    where
        P: BlockPtr,
    {
        self.bsize as u64 / P::WIDTH as u64
    }

    /// Returns the first data block number an inode cannot address.
    ///
    /// Saturates at `u64::MAX`.
    #[must_use]
    pub fn max_lbn<P>(&self) -> u64
    where
        P: BlockPtr,
    {
        let nindir = self.nindir::<P>();
        let mut total = NDADDR as u64;
        let mut per_level = 1_u64;
        for _ in 0..NIADDR {
            per_level = per_level.saturating_mul(nindir);
            total = total.saturating_add(per_level);
        }
        total
    }
}
