//! Pool positions and user addresses
//!
//! The kernel never hands out pointers into a pool. It works with
//! [`PoolOffset`]s (byte index into the pool's kernel region) and translates
//! to and from the [`UserAddr`] the owning process sees.

use core::fmt;

/// Byte offset inside a pool's kernel region
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct PoolOffset(pub usize);

impl PoolOffset {
    #[inline]
    pub const fn add(self, bytes: usize) -> Self {
        PoolOffset(self.0 + bytes)
    }
}

/// Address in a process' user address space
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct UserAddr(pub usize);

impl UserAddr {
    #[inline]
    pub const fn add(self, bytes: usize) -> Self {
        UserAddr(self.0 + bytes)
    }
}

impl fmt::Display for UserAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}
