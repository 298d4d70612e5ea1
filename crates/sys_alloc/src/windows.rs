use std::io::{self, Error};
use std::mem;
use std::ptr;

#[cfg(not(miri))]
use windows_sys::Win32::System::Memory::{
    ResetWriteWatch, VirtualAlloc, VirtualFree, MEM_COMMIT, MEM_RELEASE, MEM_RESERVE, MEM_RESET,
    MEM_WRITE_WATCH, PAGE_READWRITE,
};
#[cfg(not(miri))]
use windows_sys::Win32::System::SystemInformation::{GetSystemInfo, SYSTEM_INFO};

/// Returns the system allocation granularity.
///
/// On Windows, `VirtualAlloc` address must be aligned to this value (typically 64KB),
/// which is often larger than the page size (typically 4KB).
pub fn allocation_granularity() -> usize {
    #[cfg(miri)]
    {
        65536
    }
    #[cfg(not(miri))]
    unsafe {
        let mut info: SYSTEM_INFO = mem::zeroed();
        GetSystemInfo(&mut info);
        let gran = info.dwAllocationGranularity as usize;
        if gran == 0 {
            65536
        } else {
            gran
        }
    }
}

pub fn page_size() -> usize {
    #[cfg(miri)]
    {
        4096
    }
    #[cfg(not(miri))]
    unsafe {
        let mut info: SYSTEM_INFO = mem::zeroed();
        GetSystemInfo(&mut info);
        let size = info.dwPageSize as usize;
        if size == 0 {
            4096
        } else {
            size
        }
    }
}

pub struct MmapInner {
    ptr: *mut std::ffi::c_void,
    len: usize,
    write_watch: bool,
}

impl MmapInner {
    /// Creates a new anonymous read/write mapping.
    pub unsafe fn map_anon(len: usize, write_watch: bool) -> io::Result<Self> {
        #[cfg(miri)]
        {
            use std::alloc::{alloc_zeroed, Layout};
            let align = allocation_granularity();
            let layout = Layout::from_size_align(len, align)
                .map_err(|_| Error::from(io::ErrorKind::InvalidInput))?;
            let ptr = alloc_zeroed(layout);
            if ptr.is_null() {
                return Err(Error::from(io::ErrorKind::OutOfMemory));
            }
            Ok(Self {
                ptr: ptr.cast::<std::ffi::c_void>(),
                len,
                write_watch,
            })
        }
        #[cfg(not(miri))]
        {
            let mut flags = MEM_COMMIT | MEM_RESERVE;
            if write_watch {
                flags |= MEM_WRITE_WATCH;
            }

            let ptr = VirtualAlloc(ptr::null(), len, flags, PAGE_READWRITE);
            if ptr.is_null() {
                return Err(Error::last_os_error());
            }

            Ok(Self {
                ptr,
                len,
                write_watch,
            })
        }
    }

    pub const fn ptr(&self) -> *mut u8 {
        self.ptr.cast::<u8>()
    }

    pub const fn len(&self) -> usize {
        self.len
    }

    pub const fn write_watch(&self) -> bool {
        self.write_watch
    }

    pub fn discard(&self) -> io::Result<()> {
        #[cfg(miri)]
        {
            Ok(())
        }
        #[cfg(not(miri))]
        {
            // SAFETY: The range is exactly the mapping we own.
            let ptr = unsafe { VirtualAlloc(self.ptr, self.len, MEM_RESET, PAGE_READWRITE) };
            if ptr.is_null() {
                return Err(Error::last_os_error());
            }
            Ok(())
        }
    }

    pub fn reset_write_watch(&self) -> io::Result<()> {
        #[cfg(miri)]
        {
            Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "write watch is not available under miri",
            ))
        }
        #[cfg(not(miri))]
        {
            // SAFETY: The mapping was created with MEM_WRITE_WATCH.
            let rc = unsafe { ResetWriteWatch(self.ptr, self.len) };
            if rc != 0 {
                return Err(Error::last_os_error());
            }
            Ok(())
        }
    }
}

impl Drop for MmapInner {
    fn drop(&mut self) {
        if self.len > 0 {
            unsafe {
                #[cfg(miri)]
                {
                    use std::alloc::{dealloc, Layout};
                    let align = allocation_granularity();
                    if let Ok(layout) = Layout::from_size_align(self.len, align) {
                        dealloc(self.ptr.cast::<u8>(), layout);
                    }
                }
                #[cfg(not(miri))]
                {
                    // MEM_RELEASE requires dwSize to be 0
                    VirtualFree(self.ptr, 0, MEM_RELEASE);
                }
            }
        }
    }
}

unsafe impl Send for MmapInner {}
unsafe impl Sync for MmapInner {}
