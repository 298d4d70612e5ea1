//! Page-level system memory primitives for the sweep engine.
//!
//! Heap blocks are backed by anonymous mappings from this crate. Besides
//! mapping and unmapping, the sweeper needs two page operations: discarding
//! the contents of pages that belong to empty blocks, and resetting the
//! platform's write-watch tracking after a partial collection.

use std::io;

#[cfg(unix)]
mod unix;
#[cfg(unix)]
use unix as os;

#[cfg(windows)]
mod windows;
#[cfg(windows)]
use windows as os;

pub use os::page_size;

/// Returns the system allocation granularity.
///
/// On Windows, this is typically 64KB. On Unix, this is typically the system page size.
#[must_use]
pub fn allocation_granularity() -> usize {
    #[cfg(windows)]
    {
        os::allocation_granularity()
    }
    #[cfg(unix)]
    {
        os::page_size()
    }
}

/// A handle to an anonymous memory mapping.
///
/// The region is automatically unmapped when this handle is dropped.
pub struct Mmap {
    inner: os::MmapInner,
}

impl Mmap {
    /// Returns a pointer to the start of the memory mapping.
    #[must_use]
    pub fn ptr(&self) -> *mut u8 {
        self.inner.ptr()
    }

    /// Returns the length of the memory mapping in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// Returns `true` if the mapping has zero length.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.len() == 0
    }

    /// Whether this mapping was created with write-watch tracking.
    #[must_use]
    pub fn has_write_watch(&self) -> bool {
        self.inner.write_watch()
    }

    /// Tells the OS the contents of the mapping are no longer needed.
    ///
    /// The mapping stays valid. On Unix the next touch observes zeroed
    /// pages; on Windows the contents are undefined until written.
    ///
    /// # Errors
    ///
    /// Returns the OS error if the advice call fails.
    pub fn discard(&self) -> io::Result<()> {
        self.inner.discard()
    }

    /// Resets hardware write-watch tracking for every page of the mapping.
    ///
    /// # Errors
    ///
    /// Returns [`io::ErrorKind::Unsupported`] when the mapping was not
    /// created with [`MmapOptions::write_watch`] or the platform has no
    /// write-watch facility, and the OS error if the reset itself fails.
    pub fn reset_write_watch(&self) -> io::Result<()> {
        if !self.inner.write_watch() {
            return Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "mapping was not created with write watch",
            ));
        }
        self.inner.reset_write_watch()
    }
}

impl std::fmt::Debug for Mmap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mmap")
            .field("ptr", &self.ptr())
            .field("len", &self.len())
            .field("write_watch", &self.has_write_watch())
            .finish()
    }
}

// SAFETY: `Mmap` owns its region exclusively; the raw pointer is only an address.
unsafe impl Send for Mmap {}
// SAFETY: Shared access only reads the address and length.
unsafe impl Sync for Mmap {}

/// Configuration for creating a memory mapping.
#[derive(Debug, Clone, Default)]
pub struct MmapOptions {
    len: usize,
    write_watch: bool,
}

impl MmapOptions {
    /// Creates a new `MmapOptions` with default settings (length 0).
    /// You must set a length before mapping.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            len: 0,
            write_watch: false,
        }
    }

    /// Sets the length of the mapping in bytes.
    #[must_use]
    pub const fn len(mut self, len: usize) -> Self {
        self.len = len;
        self
    }

    /// Requests write-watch tracking for the mapping.
    ///
    /// Only Windows provides hardware write watch. Elsewhere the flag is
    /// recorded and [`Mmap::reset_write_watch`] reports `Unsupported`.
    #[must_use]
    pub const fn write_watch(mut self, write_watch: bool) -> Self {
        self.write_watch = write_watch;
        self
    }

    /// Creates an anonymous read/write memory map.
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` for a zero length and the OS error if the
    /// mapping fails.
    pub fn map_anon(&self) -> io::Result<Mmap> {
        if self.len == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "length must be greater than 0",
            ));
        }

        // SAFETY: We request a fresh anonymous mapping with no address hint,
        // so no existing memory can be affected.
        let inner = unsafe { os::MmapInner::map_anon(self.len, self.write_watch)? };

        Ok(Mmap { inner })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ptr;

    #[test]
    fn test_page_size() {
        let ps = page_size();
        assert!(ps > 0);
        assert_eq!(ps & (ps - 1), 0, "Page size should be power of 2");
    }

    #[test]
    fn test_allocation_granularity() {
        let ag = allocation_granularity();
        assert!(ag > 0);
        assert_eq!(
            ag & (ag - 1),
            0,
            "Allocation granularity should be power of 2"
        );
        assert!(ag >= page_size());
    }

    #[test]
    fn test_basic_map() {
        let len = page_size();
        let mmap = MmapOptions::new()
            .len(len)
            .map_anon()
            .expect("failed to map");

        let ptr = mmap.ptr();
        assert!(!ptr.is_null());
        assert_eq!(ptr as usize % page_size(), 0);
        assert_eq!(mmap.len(), len);

        unsafe {
            ptr::write_volatile(ptr, 42);
            assert_eq!(ptr::read_volatile(ptr), 42);
        }
    }

    #[test]
    fn test_zero_length_rejected() {
        let err = MmapOptions::new().map_anon().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }

    #[test]
    fn test_discard_keeps_mapping_usable() {
        let len = page_size() * 2;
        let mmap = MmapOptions::new()
            .len(len)
            .map_anon()
            .expect("failed to map");

        unsafe { ptr::write_volatile(mmap.ptr(), 7) };
        mmap.discard().expect("discard failed");

        unsafe {
            ptr::write_volatile(mmap.ptr().add(page_size()), 9);
            assert_eq!(ptr::read_volatile(mmap.ptr().add(page_size())), 9);
        }
    }

    #[test]
    fn test_reset_write_watch_requires_option() {
        let mmap = MmapOptions::new()
            .len(page_size())
            .map_anon()
            .expect("failed to map");
        assert!(!mmap.has_write_watch());
        let err = mmap.reset_write_watch().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::Unsupported);
    }

    #[cfg(unix)]
    #[test]
    fn test_write_watch_unsupported_on_unix() {
        let mmap = MmapOptions::new()
            .len(page_size())
            .write_watch(true)
            .map_anon()
            .expect("failed to map");
        assert!(mmap.has_write_watch());
        let err = mmap.reset_write_watch().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::Unsupported);
    }
}
