//! Buffer cache for block I/O.
//!
//! Buffers are identified by a caller supplied key (for a filesystem,
//! typically the owning inode and a logical block) and carry the device
//! address they are read from and written to. The cache guarantees that at
//! most one in-memory buffer exists per key.
//!
//! A buffer is *checked out* by [`BufferCache::getblk()`],
//! [`BufferCache::bread()`] or [`BufferCache::lookup()`] and is owned
//! exclusively by the returned [`Buf`] until it is handed back with one of
//! the release operations:
//!
//! | operation         | device write      | buffer after release |
//! |-------------------|-------------------|----------------------|
//! | [`Buf::brelse()`] | none              | cached, unchanged    |
//! | [`Buf::bwrite()`] | now, result returned | cached, clean     |
//! | [`Buf::bdwrite()`]| deferred          | cached, dirty        |
//! | [`Buf::bawrite()`]| now, result dropped | cached, clean (dirty if the write failed) |
//! | [`Buf::invalidate()`] | none          | discarded            |
//!
//! Dropping a [`Buf`] is the same as [`Buf::brelse()`].
//!
//! Dirty buffers reach the device when they are flushed with
//! [`BufferCache::flush()`] or when they are recycled to make room for
//! another key.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

use alloc::{
    collections::{BTreeMap, VecDeque},
    vec,
    vec::Vec,
};
use core::fmt;

use mutex_api::Mutex;

/// A device addressed in fixed units.
///
/// The unit (sector, fragment, ...) is defined by the device; the cache
/// only passes addresses through.
pub trait BlockDevice {
    type Error;

    /// Reads `data.len()` bytes starting at unit `addr`.
    fn read(&self, addr: u64, data: &mut [u8]) -> Result<(), Self::Error>;

    /// Writes `data` starting at unit `addr`.
    fn write(&self, addr: u64, data: &[u8]) -> Result<(), Self::Error>;
}

/// A buffer cache for block I/O.
pub struct BufferCache<Device, CacheMutex> {
    device: Device,

    /// Number of buffers kept before idle ones are recycled.
    capacity: usize,

    state: CacheMutex,
}

/// Bookkeeping of a [`BufferCache`], protected by its mutex.
pub struct CacheState<K> {
    entries: BTreeMap<K, Slot>,

    /// Keys of idle buffers.
    ///
    /// `lru.front()` is least recently used, `lru.back()` is most.
    lru: VecDeque<K>,
}

enum Slot {
    Idle(BufData),
    Busy,
}

/// Contents of one cached buffer.
struct BufData {
    daddr: Option<u64>,
    valid: bool,
    dirty: bool,
    data: Vec<u8>,
}

impl BufData {
    fn new(size: usize) -> Self {
        Self {
            daddr: None,
            valid: false,
            dirty: false,
            data: vec![0; size],
        }
    }
}

/// A checked out buffer.
pub struct Buf<'a, Device, CacheMutex, K>
where
    K: Ord + Clone,
    CacheMutex: Mutex<Data = CacheState<K>>,
{
    cache: &'a BufferCache<Device, CacheMutex>,
    key: K,

    /// `None` once the buffer has been handed back.
    data: Option<BufData>,
}

impl<K> CacheState<K> {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
            lru: VecDeque::new(),
        }
    }
}

impl<K> Default for CacheState<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K> CacheState<K>
where
    K: Ord + Clone,
{
    fn touch(&mut self, key: &K) {
        if let Some(pos) = self.lru.iter().position(|k| k == key) {
            self.lru.remove(pos);
        }
    }

    fn check_out(&mut self, key: &K) -> Option<BufData> {
        let slot = self.entries.get_mut(key)?;
        match core::mem::replace(slot, Slot::Busy) {
            Slot::Idle(data) => {
                self.touch(key);
                Some(data)
            }
            Slot::Busy => panic!("buffer is already checked out"),
        }
    }

    fn check_in(&mut self, key: K, data: BufData) {
        let slot = self
            .entries
            .get_mut(&key)
            .expect("checked out buffer must stay in the cache");
        assert!(matches!(slot, Slot::Busy));
        *slot = Slot::Idle(data);
        self.lru.push_back(key);
    }
}

impl<Device, CacheMutex, K> BufferCache<Device, CacheMutex>
where
    Device: BlockDevice,
    CacheMutex: Mutex<Data = CacheState<K>>,
    K: Ord + Clone,
{
    /// Creates a cache over `device` holding about `capacity` buffers.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is 0.
    pub fn new(device: Device, capacity: usize) -> Self {
        assert!(capacity > 0);
        Self {
            device,
            capacity,
            state: CacheMutex::new(CacheState::new()),
        }
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Returns the number of cached buffers, including checked out ones.
    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns `true` if a buffer for `key` is cached.
    pub fn contains(&self, key: &K) -> bool {
        self.state.lock().entries.contains_key(key)
    }

    /// Returns `true` if the buffer for `key` is cached and dirty.
    pub fn is_dirty(&self, key: &K) -> bool {
        matches!(
            self.state.lock().entries.get(key),
            Some(Slot::Idle(BufData { dirty: true, .. }))
        )
    }

    /// Recycles the least recently used idle buffer.
    ///
    /// Dirty buffers are written back first; buffers whose write-back fails
    /// stay cached and the next one is tried. Returns `false` if nothing
    /// could be recycled.
    fn recycle_one(&self, state: &mut CacheState<K>) -> bool {
        for _ in 0..state.lru.len() {
            let Some(key) = state.lru.pop_front() else {
                break;
            };
            let Some(Slot::Idle(data)) = state.entries.get(&key) else {
                continue;
            };
            if data.dirty {
                let daddr = data.daddr.expect("dirty buffer must have an address");
                if self.device.write(daddr, &data.data).is_err() {
                    state.lru.push_back(key);
                    continue;
                }
            }
            state.entries.remove(&key);
            return true;
        }
        false
    }

    /// Returns the buffer for `key`, without reading it from the device.
    ///
    /// If the buffer is already cached its contents are kept and it is
    /// resized to `size` bytes (new bytes are zero).
    /// Otherwise a new buffer whose contents are not valid is returned;
    /// the caller must fill it with [`Buf::clear()`] or [`Buf::set_data()`],
    /// or read it with [`Buf::read()`].
    ///
    /// When the cache is full the least recently used idle buffer is
    /// recycled. If every buffer is checked out, the cache grows.
    ///
    /// # Panics
    ///
    /// Panics if the buffer for `key` is already checked out.
    pub fn getblk(&self, key: K, size: usize) -> Buf<'_, Device, CacheMutex, K> {
        let mut state = self.state.lock();

        let data = if let Some(mut data) = state.check_out(&key) {
            data.data.resize(size, 0);
            data
        } else {
            if state.entries.len() >= self.capacity {
                let _ = self.recycle_one(&mut state);
            }
            state.entries.insert(key.clone(), Slot::Busy);
            BufData::new(size)
        };
        drop(state);

        Buf {
            cache: self,
            key,
            data: Some(data),
        }
    }

    /// Returns the buffer for `key`, reading it from `daddr` unless the
    /// cached contents are valid.
    ///
    /// On a read error the buffer is discarded.
    pub fn bread(
        &self,
        key: K,
        daddr: u64,
        size: usize,
    ) -> Result<Buf<'_, Device, CacheMutex, K>, Device::Error> {
        let mut buf = self.getblk(key, size);
        if buf.daddr().is_none() || !buf.is_valid() {
            buf.set_daddr(daddr);
        }
        debug_assert_eq!(buf.daddr(), Some(daddr));
        if let Err(e) = buf.read() {
            buf.invalidate();
            return Err(e);
        }
        Ok(buf)
    }

    /// Returns the cached buffer for `key`, or `None` if it is not cached.
    ///
    /// # Panics
    ///
    /// Panics if the buffer for `key` is already checked out.
    pub fn lookup(&self, key: &K) -> Option<Buf<'_, Device, CacheMutex, K>> {
        let data = self.state.lock().check_out(key)?;
        Some(Buf {
            cache: self,
            key: key.clone(),
            data: Some(data),
        })
    }

    /// Writes every idle dirty buffer whose key matches `pred`.
    ///
    /// All matching buffers are attempted; the first error is returned and
    /// buffers that failed stay dirty.
    pub fn flush<F>(&self, mut pred: F) -> Result<(), Device::Error>
    where
        F: FnMut(&K) -> bool,
    {
        let mut taken = Vec::new();
        {
            let mut state = self.state.lock();
            let keys = state
                .entries
                .iter()
                .filter(|(k, slot)| {
                    matches!(slot, Slot::Idle(BufData { dirty: true, .. })) && pred(k)
                })
                .map(|(k, _)| k.clone())
                .collect::<Vec<_>>();
            for key in keys {
                if let Some(data) = state.check_out(&key) {
                    taken.push((key, data));
                }
            }
        }

        let mut result = Ok(());
        for (key, mut data) in taken {
            let daddr = data.daddr.expect("dirty buffer must have an address");
            match self.device.write(daddr, &data.data) {
                Ok(()) => data.dirty = false,
                Err(e) => {
                    if result.is_ok() {
                        result = Err(e);
                    }
                }
            }
            self.state.lock().check_in(key, data);
        }
        result
    }
}

impl<Device, CacheMutex, K> Buf<'_, Device, CacheMutex, K>
where
    Device: BlockDevice,
    CacheMutex: Mutex<Data = CacheState<K>>,
    K: Ord + Clone,
{
    fn inner(&self) -> &BufData {
        self.data.as_ref().expect("buffer is checked out")
    }

    fn inner_mut(&mut self) -> &mut BufData {
        self.data.as_mut().expect("buffer is checked out")
    }

    pub fn key(&self) -> &K {
        &self.key
    }

    /// Returns the device address the buffer is bound to.
    pub fn daddr(&self) -> Option<u64> {
        self.inner().daddr
    }

    /// Binds the buffer to device address `daddr`.
    pub fn set_daddr(&mut self, daddr: u64) {
        self.inner_mut().daddr = Some(daddr);
    }

    pub fn is_valid(&self) -> bool {
        self.inner().valid
    }

    pub fn is_dirty(&self) -> bool {
        self.inner().dirty
    }

    /// Returns the buffer size in bytes.
    pub fn len(&self) -> usize {
        self.inner().data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the buffer contents.
    ///
    /// # Panics
    ///
    /// Panics if the contents are not valid.
    pub fn bytes(&self) -> &[u8] {
        let inner = self.inner();
        assert!(inner.valid, "buffer contents are not valid");
        &inner.data
    }

    /// Returns the buffer contents for modification.
    ///
    /// # Panics
    ///
    /// Panics if the contents are not valid.
    pub fn bytes_mut(&mut self) -> &mut [u8] {
        let inner = self.inner_mut();
        assert!(inner.valid, "buffer contents are not valid");
        &mut inner.data
    }

    /// Fills the whole buffer with zero.
    pub fn clear(&mut self) {
        let inner = self.inner_mut();
        inner.data.fill(0);
        inner.valid = true;
    }

    /// Sets the whole buffer data.
    ///
    /// # Panics
    ///
    /// Panics if `data` is not as long as the buffer.
    pub fn set_data(&mut self, data: &[u8]) {
        let inner = self.inner_mut();
        inner.data.copy_from_slice(data);
        inner.valid = true;
    }

    /// Changes the buffer size, keeping the common prefix.
    ///
    /// Bytes added at the end are zero.
    pub fn resize(&mut self, size: usize) {
        self.inner_mut().data.resize(size, 0);
    }

    /// Reads the buffer from the device if the cached contents are not valid.
    ///
    /// # Panics
    ///
    /// Panics if the buffer has no device address.
    pub fn read(&mut self) -> Result<(), Device::Error> {
        let cache = self.cache;
        let inner = self.inner_mut();
        if !inner.valid {
            let daddr = inner.daddr.expect("buffer must have an address");
            cache.device.read(daddr, &mut inner.data)?;
            inner.valid = true;
        }
        Ok(())
    }

    fn write_now(&mut self) -> Result<(), Device::Error> {
        let cache = self.cache;
        let inner = self.inner_mut();
        assert!(inner.valid, "writing a buffer whose contents are not valid");
        let daddr = inner.daddr.expect("buffer must have an address");
        cache.device.write(daddr, &inner.data)?;
        inner.dirty = false;
        Ok(())
    }

    /// Writes the buffer synchronously and releases it.
    ///
    /// On error the buffer stays cached and dirty.
    pub fn bwrite(mut self) -> Result<(), Device::Error> {
        let res = self.write_now();
        if res.is_err() {
            self.inner_mut().dirty = true;
        }
        res
    }

    /// Marks the buffer dirty and releases it; the write is deferred.
    pub fn bdwrite(mut self) {
        assert!(self.is_valid(), "delayed write of a buffer that is not valid");
        self.inner_mut().dirty = true;
    }

    /// Starts writing the buffer and releases it without waiting for the
    /// result.
    ///
    /// A failed write leaves the buffer dirty so that the next flush
    /// retries and reports it.
    pub fn bawrite(mut self) {
        if self.write_now().is_err() {
            self.inner_mut().dirty = true;
        }
    }

    /// Releases the buffer, keeping its contents cached.
    pub fn brelse(self) {}

    /// Releases the buffer and removes it from the cache, discarding its
    /// contents even if dirty.
    pub fn invalidate(mut self) {
        self.data = None;
        let mut state = self.cache.state.lock();
        let slot = state.entries.remove(&self.key);
        assert!(matches!(slot, Some(Slot::Busy)));
    }
}

impl<Device, CacheMutex, K> Drop for Buf<'_, Device, CacheMutex, K>
where
    CacheMutex: Mutex<Data = CacheState<K>>,
    K: Ord + Clone,
{
    fn drop(&mut self) {
        if let Some(data) = self.data.take() {
            self.cache.state.lock().check_in(self.key.clone(), data);
        }
    }
}

impl<Device, CacheMutex, K> fmt::Debug for Buf<'_, Device, CacheMutex, K>
where
    CacheMutex: Mutex<Data = CacheState<K>>,
    K: Ord + Clone + fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let data = self.data.as_ref();
        f.debug_struct("Buf")
            .field("key", &self.key)
            .field("daddr", &data.and_then(|d| d.daddr))
            .field("valid", &data.is_some_and(|d| d.valid))
            .field("dirty", &data.is_some_and(|d| d.dirty))
            .field("len", &data.map_or(0, |d| d.data.len()))
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Arc;

    use mutex_api::StdMutex;

    const UNIT: usize = 512;

    #[derive(Clone)]
    struct MockDevice {
        data: Vec<Arc<StdMutex<MockData>>>,
    }

    struct MockData {
        data: [u8; UNIT],
        read: usize,
        write: usize,
        fail: bool,
    }

    type BufferCache = super::BufferCache<MockDevice, StdMutex<CacheState<u32>>>;

    #[derive(Debug, PartialEq, Eq)]
    struct MockError;

    impl MockDevice {
        fn new(size: usize) -> Self {
            Self {
                data: (0..size)
                    .map(|_| {
                        Arc::new(StdMutex::new(MockData {
                            data: [0; UNIT],
                            read: 0,
                            write: 0,
                            fail: false,
                        }))
                    })
                    .collect(),
            }
        }

        fn unit(&self, addr: u64) -> std::sync::MutexGuard<'_, MockData> {
            self.data[usize::try_from(addr).unwrap()].lock()
        }
    }

    impl BlockDevice for MockDevice {
        type Error = MockError;

        fn read(&self, addr: u64, data: &mut [u8]) -> Result<(), Self::Error> {
            for (i, chunk) in data.chunks_mut(UNIT).enumerate() {
                let mut mock = self.unit(addr + u64::try_from(i).unwrap());
                if mock.fail {
                    return Err(MockError);
                }
                mock.read += 1;
                chunk.copy_from_slice(&mock.data[..chunk.len()]);
            }
            Ok(())
        }

        fn write(&self, addr: u64, data: &[u8]) -> Result<(), Self::Error> {
            for (i, chunk) in data.chunks(UNIT).enumerate() {
                let mut mock = self.unit(addr + u64::try_from(i).unwrap());
                if mock.fail {
                    return Err(MockError);
                }
                mock.write += 1;
                mock.data[..chunk.len()].copy_from_slice(chunk);
            }
            Ok(())
        }
    }

    #[test]
    #[should_panic]
    fn test_buffer_cache_zero_capacity() {
        let _cache = BufferCache::new(MockDevice::new(10), 0);
    }

    #[test]
    fn test_buffer_cache_getblk_does_not_read() {
        let device = MockDevice::new(10);
        let cache = BufferCache::new(device.clone(), 5);

        let buf = cache.getblk(0, UNIT);
        assert_eq!(*buf.key(), 0);
        assert!(!buf.is_valid());
        drop(buf);

        assert_eq!(device.unit(0).read, 0);
        assert_eq!(device.unit(0).write, 0);
        assert!(cache.contains(&0));
    }

    #[test]
    fn test_buffer_cache_read_write() {
        let device = MockDevice::new(10);
        let cache = BufferCache::new(device.clone(), 5);

        {
            let mut buf = cache.bread(3, 7, UNIT).unwrap();
            buf.bytes_mut().fill(1);
            buf.bwrite().unwrap();
        }

        {
            let buf = cache.bread(3, 7, UNIT).unwrap();
            assert_eq!(buf.bytes(), &[1; UNIT]);
        }

        // data is read from the device only once.
        assert_eq!(device.unit(7).read, 1);
        assert_eq!(device.unit(7).write, 1);
    }

    #[test]
    fn test_buffer_cache_delayed_write_reaches_device_on_flush() {
        let device = MockDevice::new(10);
        let cache = BufferCache::new(device.clone(), 5);

        let mut buf = cache.getblk(1, UNIT);
        buf.set_daddr(2);
        buf.clear();
        buf.bytes_mut()[0] = 0xaa;
        buf.bdwrite();

        assert!(cache.is_dirty(&1));
        assert_eq!(device.unit(2).write, 0);

        cache.flush(|k| *k == 1).unwrap();
        assert!(!cache.is_dirty(&1));
        assert_eq!(device.unit(2).write, 1);
        assert_eq!(device.unit(2).data[0], 0xaa);
    }

    #[test]
    fn test_buffer_cache_flush_filters_keys() {
        let device = MockDevice::new(10);
        let cache = BufferCache::new(device.clone(), 5);

        for (key, daddr) in [(10, 0), (11, 1), (20, 2)] {
            let mut buf = cache.getblk(key, UNIT);
            buf.set_daddr(daddr);
            buf.clear();
            buf.bdwrite();
        }

        cache.flush(|k| *k / 10 == 1).unwrap();
        assert_eq!(device.unit(0).write, 1);
        assert_eq!(device.unit(1).write, 1);
        assert_eq!(device.unit(2).write, 0);
        assert!(cache.is_dirty(&20));
    }

    #[test]
    fn test_buffer_cache_flush_reports_error_and_keeps_dirty() {
        let device = MockDevice::new(10);
        let cache = BufferCache::new(device.clone(), 5);

        let mut buf = cache.getblk(1, UNIT);
        buf.set_daddr(4);
        buf.clear();
        buf.bdwrite();

        device.unit(4).fail = true;
        assert_eq!(cache.flush(|_| true), Err(MockError));
        assert!(cache.is_dirty(&1));

        device.unit(4).fail = false;
        cache.flush(|_| true).unwrap();
        assert!(!cache.is_dirty(&1));
    }

    #[test]
    fn test_buffer_cache_bread_error_discards_buffer() {
        let device = MockDevice::new(10);
        let cache = BufferCache::new(device.clone(), 5);

        device.unit(5).fail = true;
        assert!(cache.bread(1, 5, UNIT).is_err());
        assert!(!cache.contains(&1));
    }

    #[test]
    fn test_buffer_cache_async_write_failure_stays_dirty() {
        let device = MockDevice::new(10);
        let cache = BufferCache::new(device.clone(), 5);

        device.unit(6).fail = true;
        let mut buf = cache.getblk(1, UNIT);
        buf.set_daddr(6);
        buf.clear();
        buf.bawrite();
        assert!(cache.is_dirty(&1));
    }

    #[test]
    fn test_buffer_cache_lookup_only_existing() {
        let device = MockDevice::new(10);
        let cache = BufferCache::new(device, 5);

        assert!(cache.lookup(&1).is_none());
        let mut buf = cache.getblk(1, UNIT);
        buf.clear();
        drop(buf);
        let buf = cache.lookup(&1).unwrap();
        assert!(buf.is_valid());
    }

    #[test]
    fn test_buffer_cache_invalidate_discards_dirty_data() {
        let device = MockDevice::new(10);
        let cache = BufferCache::new(device.clone(), 5);

        let mut buf = cache.getblk(1, UNIT);
        buf.set_daddr(3);
        buf.clear();
        buf.bdwrite();

        cache.lookup(&1).unwrap().invalidate();
        assert!(!cache.contains(&1));
        cache.flush(|_| true).unwrap();
        assert_eq!(device.unit(3).write, 0);
    }

    #[test]
    #[should_panic = "already checked out"]
    fn test_buffer_cache_double_checkout() {
        let device = MockDevice::new(10);
        let cache = BufferCache::new(device, 5);

        let _buf1 = cache.getblk(1, UNIT);
        let _buf2 = cache.getblk(1, UNIT);
    }

    #[test]
    fn test_buffer_cache_resize_keeps_prefix() {
        let device = MockDevice::new(10);
        let cache = BufferCache::new(device, 5);

        let mut buf = cache.getblk(1, UNIT);
        buf.clear();
        buf.bytes_mut().fill(7);
        buf.resize(UNIT * 2);
        assert_eq!(&buf.bytes()[..UNIT], &[7; UNIT]);
        assert_eq!(&buf.bytes()[UNIT..], &[0; UNIT]);
    }

    #[test]
    fn test_buffer_cache_drop_from_old() {
        let device = MockDevice::new(10);
        let cache = BufferCache::new(device.clone(), 5);

        for i in 0..10 {
            let _buf = cache.bread(i, u64::from(i), UNIT).unwrap();
        }
        // cache: 5 -> 6 -> 7 -> 8 -> 9 (least recent first)
        assert_eq!(cache.len(), 5);

        // data is read from the device only once.
        for i in 0..10 {
            assert_eq!(device.unit(i).read, 1);
        }

        let _ = cache.bread(0, 0, UNIT).unwrap(); // 0 is not cached, drops 5
        assert_eq!(device.unit(0).read, 2);
        // cache: 6 -> 7 -> 8 -> 9 -> 0

        let _ = cache.bread(8, 8, UNIT).unwrap(); // 8 is cached
        assert_eq!(device.unit(8).read, 1);
        // cache: 6 -> 7 -> 9 -> 0 -> 8

        let _ = cache.bread(3, 3, UNIT).unwrap(); // 3 is not cached, drops 6
        assert_eq!(device.unit(3).read, 2);
        // cache: 7 -> 9 -> 0 -> 8 -> 3

        for (i, n) in [(3, 2), (8, 1), (0, 2), (9, 1), (7, 1)] {
            let _buf = cache.bread(i, u64::from(i), UNIT).unwrap();
            assert_eq!(device.unit(u64::from(i)).read, n);
        }
    }

    #[test]
    fn test_buffer_cache_recycle_writes_back_dirty() {
        let device = MockDevice::new(10);
        let cache = BufferCache::new(device.clone(), 1);

        let mut buf = cache.getblk(1, UNIT);
        buf.set_daddr(9);
        buf.clear();
        buf.bytes_mut()[0] = 5;
        buf.bdwrite();

        let _other = cache.getblk(2, UNIT);
        assert!(!cache.contains(&1));
        assert_eq!(device.unit(9).write, 1);
        assert_eq!(device.unit(9).data[0], 5);
    }

    #[test]
    fn test_buffer_cache_grows_when_all_checked_out() {
        let device = MockDevice::new(10);
        let cache = BufferCache::new(device, 1);

        let _buf1 = cache.getblk(1, UNIT);
        let _buf2 = cache.getblk(2, UNIT);
        assert_eq!(cache.len(), 2);
    }
}
