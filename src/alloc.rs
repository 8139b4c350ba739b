//! Entry-point routing.  Each request is classified by size (or, for
//! `free` and `realloc`, by pointer range) and either handed to the
//! underlying allocator or serviced by the matching region, with the
//! mapping side effects driven under the global lock.
use std::cell::Cell;
use std::cmp;
use std::ffi::c_void;
use std::ptr;

use crate::config;
use crate::global::{self, LargeAllocator, LoadState};
use crate::map;
use crate::real;
use crate::region::Region;

thread_local! {
    /// Set while this thread holds the global lock.  The chunk arena
    /// and free-heap storage allocate through the process allocator,
    /// so an entry point re-entered from inside a region operation
    /// must bypass straight to the underlying functions instead of
    /// deadlocking on the lock.
    static REGION_OP: Cell<bool> = const { Cell::new(false) };
}

/// Also claims reentrancy when the thread-local is gone (thread
/// teardown); bypassing is always the safe answer.
fn in_region_op() -> bool {
    REGION_OP.try_with(Cell::get).unwrap_or(true)
}

struct RegionOpGuard;

impl RegionOpGuard {
    fn enter() -> RegionOpGuard {
        let _ = REGION_OP.try_with(|flag| flag.set(true));
        RegionOpGuard
    }
}

impl Drop for RegionOpGuard {
    fn drop(&mut self) {
        let _ = REGION_OP.try_with(|flag| flag.set(false));
    }
}

fn set_oom_errno() {
    unsafe {
        *libc::__errno_location() = libc::ENOMEM;
    }
}

fn oom() {
    eprintln!("bigmaac: failed to find available space");
    set_oom_errno();
}

fn report_mapping_failure(err: i32, allocator: &LargeAllocator) {
    let spare = |region: &Region| 1.0 - (region.used() as f64) / (region.len() as f64);

    eprintln!(
        "bigmaac: mmap failed (active mappings: {}, bigmaac capacity free: {:.2}, \
         fries capacity free: {:.2}, check /proc/sys/vm/max_map_count): {}",
        map::active_mapping_count(),
        spare(&allocator.bigmaacs),
        spare(&allocator.fries),
        std::io::Error::from_raw_os_error(err),
    );
}

/// Allocates a chunk for `size` bytes from the region whose threshold
/// matches, installing the backing mapping for bigmaac chunks before
/// the lock is released.  Returns the chunk address.
fn create_chunk(size: usize) -> Option<usize> {
    let to_bigmaacs = size > global::min_bigmaac();

    let _guard = RegionOpGuard::enter();
    let mut regions = global::regions().lock().unwrap();
    let allocator = regions.as_mut()?;

    if to_bigmaacs {
        let size = config::round_up(size, map::page_size())?;
        let chunk = allocator.bigmaacs.allocate(size)?;

        // The chunk's pages only become usable once the file mapping
        // lands; on failure the chunk goes straight back so that no
        // unbacked IN_USE chunk survives the unlock.
        if let Err(err) = map::install_file_mapping(chunk, size) {
            report_mapping_failure(err, allocator);
            allocator.bigmaacs.release(chunk);
            return None;
        }

        Some(chunk)
    } else {
        let size = config::round_up(size, global::fry_multiple())?;
        allocator.fries.allocate(size)
    }
}

/// Copies `min(old, new)` bytes into `copy_to` (when given), releases
/// the chunk starting at `ptr`, and returns a bigmaac chunk's pages to
/// the anonymous reservation.  False when `ptr` does not start a live
/// chunk.
fn remove_chunk(ptr: usize, copy_to: Option<(usize, usize)>) -> bool {
    let _guard = RegionOpGuard::enter();
    let mut regions = global::regions().lock().unwrap();
    let allocator = match regions.as_mut() {
        Some(allocator) => allocator,
        None => return false,
    };

    let in_bigmaacs = ptr >= allocator.bigmaacs.base();
    let region = if in_bigmaacs {
        &mut allocator.bigmaacs
    } else {
        &mut allocator.fries
    };

    let (_, old_size) = match region.lookup(ptr) {
        Some(found) => found,
        None => return false,
    };

    if let Some((dst, new_size)) = copy_to {
        // The old pages are still mapped here; a bigmaac chunk loses
        // its backing just below.
        unsafe {
            ptr::copy_nonoverlapping(
                ptr as *const u8,
                dst as *mut u8,
                cmp::min(old_size, new_size),
            );
        }
    }

    if in_bigmaacs {
        if let Err(err) = map::reset_to_reserve(ptr, old_size) {
            eprintln!(
                "bigmaac: failed to release chunk pages: {}",
                std::io::Error::from_raw_os_error(err)
            );
            return false;
        }
    }

    region.release(ptr).is_some()
}

pub(crate) fn malloc_impl(size: usize) -> *mut c_void {
    global::ensure_loaded();

    if global::load_state() != LoadState::Loaded || size == 0 || in_region_op() {
        return real::malloc(size);
    }

    if size > global::min_fry() {
        match create_chunk(size) {
            Some(chunk) => chunk as *mut c_void,
            None => {
                oom();
                ptr::null_mut()
            }
        }
    } else {
        real::malloc(size)
    }
}

pub(crate) fn calloc_impl(count: usize, size: usize) -> *mut c_void {
    // glibc's dlsym allocates through calloc while we resolve it; it
    // tolerates a null return here and retries later.
    match global::load_state() {
        LoadState::LoadingMemFuncs | LoadState::LoadingLibrary => return ptr::null_mut(),
        _ => {}
    }

    global::ensure_loaded();

    if global::load_state() != LoadState::Loaded || count == 0 || size == 0 || in_region_op() {
        return real::calloc(count, size);
    }

    let total = match count.checked_mul(size) {
        Some(total) => total,
        None => {
            set_oom_errno();
            return ptr::null_mut();
        }
    };

    if total > global::min_fry() {
        let chunk = match create_chunk(total) {
            Some(chunk) => chunk,
            None => {
                oom();
                return ptr::null_mut();
            }
        };

        if total <= global::min_bigmaac() {
            // A fry may reuse previously written file pages; bigmaac
            // pages come from a fresh mapping and are already kernel
            // zero-filled.
            unsafe {
                ptr::write_bytes(chunk as *mut u8, 0, total);
            }
        }

        chunk as *mut c_void
    } else {
        real::calloc(count, size)
    }
}

pub(crate) fn realloc_impl(old: *mut c_void, size: usize) -> *mut c_void {
    global::ensure_loaded();

    if global::load_state() != LoadState::Loaded || in_region_op() {
        return real::realloc(old, size);
    }

    if old.is_null() || size == 0 {
        return malloc_impl(size);
    }

    let addr = old as usize;
    if global::owns(addr) {
        return realloc_owned(addr, size);
    }

    // A system block growing into our territory: the underlying
    // allocator knows the old usable length.
    if size > global::min_fry() {
        let old_size = real::usable_size(old);
        let chunk = match create_chunk(size) {
            Some(chunk) => chunk,
            None => {
                oom();
                return ptr::null_mut();
            }
        };

        unsafe {
            ptr::copy_nonoverlapping(
                old as *const u8,
                chunk as *mut u8,
                cmp::min(old_size, size),
            );
        }
        real::free(old);

        chunk as *mut c_void
    } else {
        real::realloc(old, size)
    }
}

fn realloc_owned(addr: usize, size: usize) -> *mut c_void {
    let current = {
        let _guard = RegionOpGuard::enter();
        let regions = global::regions().lock().unwrap();
        let allocator = match regions.as_ref() {
            Some(allocator) => allocator,
            None => return ptr::null_mut(),
        };

        let region = if addr >= allocator.bigmaacs.base() {
            &allocator.bigmaacs
        } else {
            &allocator.fries
        };
        match region.lookup(addr) {
            Some((_, current)) => current,
            None => {
                eprintln!("bigmaac: realloc on an address without a chunk");
                return ptr::null_mut();
            }
        }
    };

    // Chunks never shrink: one that already fits comes back unchanged.
    if current >= size {
        return addr as *mut c_void;
    }

    let fresh = if size > global::min_fry() {
        match create_chunk(size) {
            Some(chunk) => chunk,
            None => {
                oom();
                return ptr::null_mut();
            }
        }
    } else {
        let block = real::malloc(size);
        if block.is_null() {
            return ptr::null_mut();
        }
        block as usize
    };

    if !remove_chunk(addr, Some((fresh, size))) {
        eprintln!("bigmaac: lost a chunk while reallocating");
        return ptr::null_mut();
    }

    fresh as *mut c_void
}

pub(crate) fn reallocarray_impl(old: *mut c_void, count: usize, size: usize) -> *mut c_void {
    match count.checked_mul(size) {
        Some(total) => realloc_impl(old, total),
        None => {
            set_oom_errno();
            ptr::null_mut()
        }
    }
}

pub(crate) fn free_impl(old: *mut c_void) {
    global::ensure_loaded();

    let addr = old as usize;
    if global::load_state() != LoadState::Loaded || !global::owns(addr) {
        return real::free(old);
    }

    if !remove_chunk(addr, None) {
        eprintln!("bigmaac: free was called on a pointer without a chunk: {:p}", old);
    }
}
