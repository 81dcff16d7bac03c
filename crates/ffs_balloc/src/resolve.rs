//! Indirect path computation.
//!
//! A data block beyond the direct area is reached from one of the inode's
//! indirect pointers through one to [`NIADDR`] indirect blocks. The blocks
//! reachable from indirect pointer `k` cover `nindir^(k+1)` data blocks,
//! and the pointer followed at each level is a digit of the block number
//! in base `nindir`, relative to the start of that range.

use arrayvec::ArrayVec;
use ufs_types::{LogicalBlock, NDADDR, NIADDR};

use crate::error::BallocError;

/// One step of an indirect path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Indir {
    /// The indirect block of this step.
    pub lbn: LogicalBlock,
    /// Pointer index to follow.
    pub off: usize,
}

/// Steps from an inode to a data block pointer.
///
/// The first entry selects the inode's indirect pointer: `off` is the
/// index into the inode's indirect pointers, `lbn` the block it points to.
/// Entry `i >= 1` names the indirect block at depth `i` and the index of
/// the pointer inside it; the last entry holds the data block pointer.
pub type IndirPath = ArrayVec<Indir, { NIADDR + 1 }>;

/// Computes the indirect path to data block `lbn` in a file system whose
/// indirect blocks hold `nindir` pointers.
///
/// Returns an empty path for blocks in the direct area.
pub fn resolve(nindir: u64, lbn: u64) -> Result<IndirPath, BallocError> {
    assert!(nindir > 1);
    let mut path = IndirPath::new();
    if lbn < NDADDR as u64 {
        return Ok(path);
    }

    // Find the level of indirection and the offset of `lbn` within the
    // range covered by that level.
    let mut bn = lbn - NDADDR as u64;
    let mut blockcnt = 1_u64;
    let mut height = 1;
    loop {
        blockcnt = blockcnt
            .checked_mul(nindir)
            .ok_or(BallocError::FileTooLarge)?;
        if bn < blockcnt {
            break;
        }
        if height == NIADDR {
            return Err(BallocError::FileTooLarge);
        }
        bn -= blockcnt;
        height += 1;
    }

    let first = lbn - bn;
    let mut meta = first + height as u64 - 1;
    path.push(Indir {
        lbn: LogicalBlock::Indirect(meta),
        off: height - 1,
    });
    for _ in 0..height {
        blockcnt /= nindir;
        let off = (bn / blockcnt) % nindir;
        #[expect(clippy::cast_possible_truncation)]
        let idx = off as usize;
        path.push(Indir {
            lbn: LogicalBlock::Indirect(meta),
            off: idx,
        });
        meta = meta - 1 + off * blockcnt;
    }
    Ok(path)
}
