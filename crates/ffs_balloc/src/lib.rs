//! Block allocation for UFS1/UFS2 files.
//!
//! [`Filesystem::balloc()`] maps a byte offset of a file to the block that
//! holds it, allocating the block and every indirect block on the path to
//! it as needed:
//!
//! ```text
//! inode ─┬─ db[0..12] ───────────────────────────── data
//!        ├─ ib[0] ── indirect ───────────────────── data
//!        ├─ ib[1] ── indirect ── indirect ───────── data
//!        └─ ib[2] ── indirect ── indirect ── indirect ── data
//! ```
//!
//! The last direct block of a small file may be a fragment. It grows in
//! place or moves when the file is extended, and is promoted to a full
//! block before the file grows past it.
//!
//! Crash consistency relies on write ordering: a pointer must never reach
//! the disk before the block it points to. Without a
//! [`DependencyTracker`] new indirect blocks are written synchronously
//! before they are linked; with one, every write is delayed and the new
//! pointers are registered with the tracker instead.
//!
//! If an allocation fails part way down an indirect path, every block
//! allocated by the call is released and the pointer that linked them is
//! cleared, so the inode's block tree is unchanged.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub use self::{
    block_alloc::{BlockAllocator, Placement},
    error::{AllocError, BallocError, Errno},
    frag_map::{FragMap, FragState},
    fs::{Address, BallocFlags, Buf, BufKey, Filesystem},
    inode::{Inode, InodeFlags},
    resolve::{Indir, IndirPath, resolve},
    softdep::{AllocDirect, DepState, Dependency, DependencyTracker, SoftDeps},
};

mod block_alloc;
mod direct;
mod error;
mod frag_map;
mod fragment;
mod fs;
mod indirect;
mod inode;
mod ordering;
mod resolve;
mod softdep;
mod unwind;
