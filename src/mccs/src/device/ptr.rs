use std::fmt;
use std::num::NonZeroUsize;

/// Address of a buffer in device memory. Never dereferenced on the host.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct DevicePtr {
    addr: NonZeroUsize,
}

impl DevicePtr {
    #[inline]
    pub const fn new(addr: usize) -> Option<Self> {
        match NonZeroUsize::new(addr) {
            Some(addr) => Some(DevicePtr { addr }),
            None => None,
        }
    }

    #[inline]
    pub const fn addr(self) -> NonZeroUsize {
        self.addr
    }

    #[inline]
    pub fn map_addr(self, f: impl FnOnce(NonZeroUsize) -> NonZeroUsize) -> Self {
        DevicePtr {
            addr: f(self.addr),
        }
    }

    /// Offset by `bytes`, saturating at the top of the address space.
    #[inline]
    pub fn byte_add(self, bytes: usize) -> Self {
        self.map_addr(|addr| addr.saturating_add(bytes))
    }
}

impl fmt::Debug for DevicePtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("DevicePtr")
            .field(&format_args!("{:#x}", self.addr))
            .finish()
    }
}

impl fmt::Pointer for DevicePtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.addr)
    }
}
