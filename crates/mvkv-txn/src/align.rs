//! Cache-line alignment wrapper.

/// Wraps a value so it starts on its own cache line.
///
/// Per-core counters and spinlocks are stored in arrays of these so
/// neighboring cores do not false-share. 64 bytes covers x86-64 and
/// AArch64; over-aligning on other platforms is harmless.
#[repr(C, align(64))]
#[derive(Debug, Default)]
pub struct CacheAligned<T> {
    value: T,
}

impl<T> CacheAligned<T> {
    #[inline]
    pub const fn new(value: T) -> Self {
        Self { value }
    }
}

impl<T> std::ops::Deref for CacheAligned<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.value
    }
}

impl<T> std::ops::DerefMut for CacheAligned<T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.value
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alignment_and_size() {
        assert_eq!(std::mem::align_of::<CacheAligned<u8>>(), 64);
        assert_eq!(std::mem::size_of::<CacheAligned<u8>>(), 64);
        let c = CacheAligned::new(7_u64);
        assert_eq!(*c, 7);
    }
}
