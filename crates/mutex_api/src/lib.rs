//! Lock abstraction shared by the buffer cache, the fragment map and the
//! dependency tracker.
//!
//! Those services are shared between every file of a mounted filesystem,
//! so they are written against this trait instead of a concrete lock.
//! A kernel supplies its own spin or sleep lock; hosted builds enable the
//! `std` feature and use [`StdMutex`].
#![cfg_attr(not(feature = "std"), no_std)]

use core::ops::DerefMut;

/// A mutex.
pub trait Mutex {
    /// The type of the data that the mutex protects.
    type Data;

    /// The type of the guard that the `lock` method returns.
    type Guard<'a>: DerefMut<Target = Self::Data>
    where
        Self: 'a;

    /// Creates a new mutex.
    fn new(data: Self::Data) -> Self;

    /// Locks the mutex.
    fn lock(&self) -> Self::Guard<'_>;
}

#[cfg(feature = "std")]
pub use self::std_mutex::StdMutex;

#[cfg(feature = "std")]
mod std_mutex {
    use std::sync::{self, MutexGuard, PoisonError};

    /// [`Mutex`](super::Mutex) backed by [`std::sync::Mutex`].
    ///
    /// Lock poisoning is ignored.
    #[derive(Debug, Default)]
    pub struct StdMutex<T>(sync::Mutex<T>);

    impl<T> super::Mutex for StdMutex<T> {
        type Data = T;

        type Guard<'a>
            = MutexGuard<'a, T>
        where
            Self: 'a;

        fn new(data: Self::Data) -> Self {
            Self(sync::Mutex::new(data))
        }

        fn lock(&self) -> Self::Guard<'_> {
            self.0.lock().unwrap_or_else(PoisonError::into_inner)
        }
    }

}
