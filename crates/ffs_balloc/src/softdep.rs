//! Soft updates dependency tracking.
//!
//! With a tracker attached, newly allocated metadata is not written
//! synchronously before it is linked. Instead every new pointer is
//! registered here and the tracker orders the writes (or rolls the
//! pointer back in the parent image) until the pointed-to block is on
//! disk. [`SoftDeps`] keeps the registered dependencies per inode until
//! the inode is synced.

use alloc::{collections::BTreeMap, vec::Vec};

use mutex_api::Mutex;
use ufs_types::{Daddr, InodeNo, LogicalBlock};

/// Registration points called by the block allocator.
pub trait DependencyTracker {
    /// A pointer stored in the inode changed.
    ///
    /// `lbn` is the data block number for direct blocks, or
    /// `NDADDR + level` for the inode's indirect pointers.
    fn setup_alloc_direct(
        &self,
        ino: InodeNo,
        lbn: u64,
        new: Daddr,
        old: Option<Daddr>,
        nsize: u64,
        osize: u64,
    );

    /// An extended attribute pointer of the inode changed.
    fn setup_alloc_ext(
        &self,
        ino: InodeNo,
        lbn: u64,
        new: Daddr,
        old: Option<Daddr>,
        nsize: u64,
        osize: u64,
    );

    /// A new indirect block was linked at `ptrno` of indirect block `parent`.
    fn setup_alloc_indir_meta(&self, ino: InodeNo, parent: LogicalBlock, ptrno: usize, new: Daddr);

    /// A new data block was linked at `ptrno` of indirect block `parent`.
    fn setup_alloc_indir_page(
        &self,
        ino: InodeNo,
        lbn: u64,
        parent: LogicalBlock,
        ptrno: usize,
        new: Daddr,
        old: Option<Daddr>,
    );

    /// Resolves every pending dependency of `ino`.
    ///
    /// Called after the dirty buffers of the inode have been written.
    fn sync(&self, ino: InodeNo);
}

/// Allocation of a pointer stored in the inode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocDirect {
    pub lbn: u64,
    pub new: Daddr,
    /// Pointer value to restore if the inode is written before `new`.
    pub old: Option<Daddr>,
    pub nsize: u64,
    pub osize: u64,
    /// Fragments superseded by this allocation, released once it is
    /// complete.
    pub freefrags: Vec<(Daddr, u64)>,
}

/// A pending dependency.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dependency {
    AllocDirect(AllocDirect),
    AllocExt(AllocDirect),
    AllocIndirMeta {
        parent: LogicalBlock,
        ptrno: usize,
        new: Daddr,
    },
    AllocIndirPage {
        lbn: u64,
        parent: LogicalBlock,
        ptrno: usize,
        new: Daddr,
        old: Option<Daddr>,
    },
}

/// Pending dependencies of a [`SoftDeps`], protected by its mutex.
#[derive(Debug, Default)]
pub struct DepState {
    pending: BTreeMap<InodeNo, Vec<Dependency>>,
}

/// Reference [`DependencyTracker`] recording dependencies per inode.
pub struct SoftDeps<M> {
    state: M,
}

impl<M> Default for SoftDeps<M>
where
    M: Mutex<Data = DepState>,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<M> SoftDeps<M>
where
    M: Mutex<Data = DepState>,
{
    pub fn new() -> Self {
        Self {
            state: M::new(DepState::default()),
        }
    }

    /// Returns the pending dependencies of `ino`, in registration order.
    pub fn pending(&self, ino: InodeNo) -> Vec<Dependency> {
        self.state
            .lock()
            .pending
            .get(&ino)
            .cloned()
            .unwrap_or_default()
    }

    pub fn has_pending(&self, ino: InodeNo) -> bool {
        self.state.lock().pending.contains_key(&ino)
    }

    fn push(&self, ino: InodeNo, dep: Dependency) {
        self.state.lock().pending.entry(ino).or_default().push(dep);
    }

    /// Records an inode pointer change, merging it into a pending change
    /// of the same pointer whose new block it replaces.
    fn push_direct(&self, ino: InodeNo, ext: bool, mut adp: AllocDirect) {
        if let Some(old) = adp.old.filter(|old| *old != adp.new) {
            adp.freefrags.push((old, adp.osize));
        }

        let mut state = self.state.lock();
        let deps = state.pending.entry(ino).or_default();
        let merged = deps.iter_mut().find_map(|dep| {
            let prev = match dep {
                Dependency::AllocDirect(prev) if !ext => prev,
                Dependency::AllocExt(prev) if ext => prev,
                _ => return None,
            };
            (prev.lbn == adp.lbn && Some(prev.new) == adp.old).then_some(prev)
        });

        if let Some(prev) = merged {
            log::debug!(
                "ino {ino}: merging allocation of lbn {} ({} -> {})",
                adp.lbn,
                prev.new,
                adp.new
            );
            prev.new = adp.new;
            prev.nsize = adp.nsize;
            prev.freefrags.append(&mut adp.freefrags);
            return;
        }

        let dep = if ext {
            Dependency::AllocExt(adp)
        } else {
            Dependency::AllocDirect(adp)
        };
        deps.push(dep);
    }
}

impl<M> DependencyTracker for SoftDeps<M>
where
    M: Mutex<Data = DepState>,
{
    fn setup_alloc_direct(
        &self,
        ino: InodeNo,
        lbn: u64,
        new: Daddr,
        old: Option<Daddr>,
        nsize: u64,
        osize: u64,
    ) {
        self.push_direct(
            ino,
            false,
            AllocDirect {
                lbn,
                new,
                old,
                nsize,
                osize,
                freefrags: Vec::new(),
            },
        );
    }

    fn setup_alloc_ext(
        &self,
        ino: InodeNo,
        lbn: u64,
        new: Daddr,
        old: Option<Daddr>,
        nsize: u64,
        osize: u64,
    ) {
        self.push_direct(
            ino,
            true,
            AllocDirect {
                lbn,
                new,
                old,
                nsize,
                osize,
                freefrags: Vec::new(),
            },
        );
    }

    fn setup_alloc_indir_meta(&self, ino: InodeNo, parent: LogicalBlock, ptrno: usize, new: Daddr) {
        self.push(ino, Dependency::AllocIndirMeta { parent, ptrno, new });
    }

    fn setup_alloc_indir_page(
        &self,
        ino: InodeNo,
        lbn: u64,
        parent: LogicalBlock,
        ptrno: usize,
        new: Daddr,
        old: Option<Daddr>,
    ) {
        self.push(
            ino,
            Dependency::AllocIndirPage {
                lbn,
                parent,
                ptrno,
                new,
                old,
            },
        );
    }

    fn sync(&self, ino: InodeNo) {
        if let Some(deps) = self.state.lock().pending.remove(&ino) {
            log::debug!("ino {ino}: {} dependencies resolved", deps.len());
        }
    }
}
