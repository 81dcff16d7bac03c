use strum::FromRepr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum BallocError {
    #[error("file too large")]
    FileTooLarge,
    #[error("no space left on device")]
    NoSpace,
    #[error("disk quota exceeded")]
    QuotaExceeded,
    #[error("input/output error")]
    Io,
    #[error("operation not supported")]
    NotSupported,
}

/// Failure reported by a [`BlockAllocator`](crate::BlockAllocator).
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum AllocError {
    #[error("no free block")]
    NoSpace,
    #[error("quota exceeded")]
    QuotaExceeded,
    #[error("allocator I/O error")]
    Io,
}

impl From<AllocError> for BallocError {
    fn from(error: AllocError) -> Self {
        match error {
            AllocError::NoSpace => Self::NoSpace,
            AllocError::QuotaExceeded => Self::QuotaExceeded,
            AllocError::Io => Self::Io,
        }
    }
}

/// Error number returned to the write path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromRepr)]
#[repr(i32)]
pub enum Errno {
    // EIO
    Io = 5,
    // EFBIG
    FileTooLarge = 27,
    // ENOSPC
    NoSpace = 28,
    // EOPNOTSUPP
    NotSupported = 45,
    // EDQUOT
    QuotaExceeded = 69,
}

impl Errno {
    #[must_use]
    pub const fn code(self) -> i32 {
        self as i32
    }
}

impl From<BallocError> for Errno {
    fn from(error: BallocError) -> Self {
        match error {
            BallocError::FileTooLarge => Self::FileTooLarge,
            BallocError::NoSpace => Self::NoSpace,
            BallocError::QuotaExceeded => Self::QuotaExceeded,
            BallocError::Io => Self::Io,
            BallocError::NotSupported => Self::NotSupported,
        }
    }
}
