//! Aligned allocation with optional huge page support
//!
//! The fast-scan kernels read code blocks with 64-byte granularity, so every
//! buffer they touch is allocated through [`AlignedVec`]. Huge pages reduce
//! TLB misses on large code regions and can be enabled with the
//! `huge_pages` feature.

use std::alloc::{self, Layout};
use std::fmt;
use std::marker::PhantomData;
use std::ops::{Deref, DerefMut};
use std::ptr::NonNull;

use crate::SaqError;

/// Round `n` up to the next multiple of `multiple`.
#[inline(always)]
pub fn round_up_to_multiple_of(n: usize, multiple: usize) -> usize {
    (n + multiple - 1) / multiple * multiple
}

/// Contiguous zero-initialized buffer with 32- or 64-byte alignment.
///
/// Element types are restricted to plain scalar-like data (`Copy` and valid
/// when zeroed); everything stored here is `f32`/`u8`/`u16`/`u64` or
/// [`crate::Candidate`].
pub struct AlignedVec<T> {
    ptr: NonNull<T>,
    len: usize,
    layout: Layout,
    _marker: PhantomData<T>,
}

impl<T: Copy + Default> AlignedVec<T> {
    /// Allocate `len` zero-initialized elements aligned to `alignment` bytes.
    pub fn zeroed(len: usize, alignment: usize) -> Result<Self, SaqError> {
        assert!(
            alignment == 32 || alignment == 64,
            "alignment must be 32 or 64"
        );
        assert!(alignment >= std::mem::align_of::<T>());

        let bytes = round_up_to_multiple_of(len * std::mem::size_of::<T>(), alignment);
        let layout = Layout::from_size_align(bytes, alignment).map_err(|_| {
            SaqError::AllocationError {
                size: bytes,
                alignment,
            }
        })?;

        let ptr = if bytes == 0 {
            NonNull::dangling()
        } else {
            let raw = unsafe { alloc::alloc_zeroed(layout) } as *mut T;
            NonNull::new(raw).ok_or(SaqError::AllocationError {
                size: bytes,
                alignment,
            })?
        };

        Ok(Self {
            ptr,
            len,
            layout,
            _marker: PhantomData,
        })
    }

    /// Advise the kernel to back this buffer with huge pages.
    ///
    /// Advisory only; failure is logged and otherwise ignored.
    pub fn advise_huge_pages(&self) {
        if self.layout.size() == 0 {
            return;
        }
        let result =
            unsafe { enable_huge_pages(self.ptr.as_ptr() as *mut u8, self.layout.size()) };
        if let Err(e) = result {
            eprintln!("Warning: Could not enable huge pages: {}", e);
        }
    }
}

impl<T> AlignedVec<T> {
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_ptr(&self) -> *const T {
        self.ptr.as_ptr()
    }
}

impl<T> Deref for AlignedVec<T> {
    type Target = [T];

    fn deref(&self) -> &[T] {
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }
}

impl<T> DerefMut for AlignedVec<T> {
    fn deref_mut(&mut self) -> &mut [T] {
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }
}

impl<T> Drop for AlignedVec<T> {
    fn drop(&mut self) {
        if self.layout.size() > 0 {
            unsafe { alloc::dealloc(self.ptr.as_ptr() as *mut u8, self.layout) };
        }
    }
}

unsafe impl<T: Send> Send for AlignedVec<T> {}
unsafe impl<T: Sync> Sync for AlignedVec<T> {}

impl<T: fmt::Debug> fmt::Debug for AlignedVec<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.iter()).finish()
    }
}

/// Enable huge pages for a memory region (Linux only)
///
/// # Safety
/// The pointer must be valid and the size must match the allocated size.
#[cfg(all(feature = "huge_pages", target_os = "linux"))]
pub unsafe fn enable_huge_pages(ptr: *mut u8, size: usize) -> std::io::Result<()> {
    use libc::{madvise, MADV_HUGEPAGE};

    let result = madvise(ptr as *mut libc::c_void, size, MADV_HUGEPAGE);

    if result == 0 {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error())
    }
}

/// Enable huge pages - no-op on non-Linux or when the feature is disabled
#[cfg(not(all(feature = "huge_pages", target_os = "linux")))]
pub unsafe fn enable_huge_pages(_ptr: *mut u8, _size: usize) -> std::io::Result<()> {
    Ok(())
}

/// Hint that `addr` will be read soon; targets the innermost cache level.
#[inline(always)]
pub fn prefetch_l1(addr: *const u8) {
    #[cfg(target_arch = "x86_64")]
    unsafe {
        use std::arch::x86_64::{_mm_prefetch, _MM_HINT_T0};
        _mm_prefetch::<_MM_HINT_T0>(addr as *const i8);
    }
    #[cfg(not(target_arch = "x86_64"))]
    let _ = addr;
}

/// Hint that `addr` will be read soon; targets the mid-level cache.
#[inline(always)]
pub fn prefetch_l2(addr: *const u8) {
    #[cfg(target_arch = "x86_64")]
    unsafe {
        use std::arch::x86_64::{_mm_prefetch, _MM_HINT_T1};
        _mm_prefetch::<_MM_HINT_T1>(addr as *const i8);
    }
    #[cfg(not(target_arch = "x86_64"))]
    let _ = addr;
}

/// Prefetch up to 20 consecutive cache lines starting at `addr`.
#[inline]
pub fn mem_prefetch_l1(addr: *const u8, num_lines: usize) {
    let mut ptr = addr;
    for _ in 0..num_lines.min(20) {
        prefetch_l1(ptr);
        ptr = ptr.wrapping_add(64);
    }
}
