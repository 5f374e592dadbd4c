use core::fmt;

/// A raw heap location. Arena bookkeeping is all byte offsets from the
/// reservation base, so the collector carries locations as plain integers
/// and only materializes typed pointers at the access site.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Address(usize);

impl Address {
    #[inline(always)]
    pub fn from_ptr<T>(ptr: *const T) -> Address {
        Address(ptr as usize)
    }

    #[inline(always)]
    pub const fn to_usize(self) -> usize {
        self.0
    }

    #[inline(always)]
    pub fn to_ptr<T>(self) -> *const T {
        self.0 as *const T
    }

    #[inline(always)]
    pub fn to_mut_ptr<T>(self) -> *mut T {
        self.0 as *mut T
    }

    /// The location `bytes` past this one.
    #[inline(always)]
    pub fn offset(self, bytes: usize) -> Address {
        Address(self.0 + bytes)
    }

    /// The location `bytes` before this one.
    #[inline(always)]
    pub fn sub(self, bytes: usize) -> Address {
        Address(self.0 - bytes)
    }

    /// Distance in bytes down to `base`; callers keep `base` below `self`.
    #[inline(always)]
    pub fn offset_from(self, base: Address) -> usize {
        debug_assert!(base <= self);
        self.0 - base.0
    }
}

impl From<usize> for Address {
    fn from(raw: usize) -> Address {
        Address(raw)
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "0x{:x}", self.0)
    }
}
