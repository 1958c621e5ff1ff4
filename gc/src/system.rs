#[cfg(unix)]
#[allow(unused)]
mod unix {
    use core::ffi::{c_int, c_long};

    #[cfg(target_os = "linux")]
    pub const SC_PAGESIZE: c_int = 30;
    #[cfg(target_os = "linux")]
    pub const SC_PHYS_PAGES: c_int = 85;

    #[cfg(any(target_os = "macos", target_os = "ios"))]
    pub const SC_PAGESIZE: c_int = 29;
    #[cfg(any(target_os = "macos", target_os = "ios"))]
    pub const SC_PHYS_PAGES: c_int = 200;

    /// posix sysconf
    /// # Safety
    /// always safe to call; -1 signals an unsupported name
    unsafe extern "C" {
        pub fn sysconf(name: c_int) -> c_long;
    }
}

/// Number of bytes in a machine word.
pub const WORD_BYTES: usize = size_of::<usize>();

/// Total physical memory in bytes, or `None` if it cannot be determined.
#[must_use]
pub fn physical_memory_bytes() -> Option<u64> {
    #[cfg(unix)]
    {
        // SAFETY: sysconf performs no memory access through its argument
        let pages = unsafe { unix::sysconf(unix::SC_PHYS_PAGES) };
        // SAFETY: sysconf performs no memory access through its argument
        let page_size = unsafe { unix::sysconf(unix::SC_PAGESIZE) };
        if pages <= 0 || page_size <= 0 {
            return None;
        }
        (pages as u64).checked_mul(page_size as u64)
    }
    #[cfg(not(unix))]
    {
        None
    }
}
