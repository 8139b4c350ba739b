//! Discovery of, and passthrough to, the underlying allocator.
//!
//! When this library is interposed, everything it chooses not to
//! service must reach the *next* `malloc`/`free`/`calloc`/`realloc` in
//! the symbol search order.  Resolution itself may allocate (glibc's
//! `dlsym` calls `calloc`), which is why the load-state machine keeps
//! region bookkeeping out of the way while it runs.
use std::ffi::c_void;
use std::mem;
use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};

type MallocFn = unsafe extern "C" fn(usize) -> *mut c_void;
type CallocFn = unsafe extern "C" fn(usize, usize) -> *mut c_void;
type ReallocFn = unsafe extern "C" fn(*mut c_void, usize) -> *mut c_void;
type FreeFn = unsafe extern "C" fn(*mut c_void);

static REAL_MALLOC: AtomicPtr<c_void> = AtomicPtr::new(ptr::null_mut());
static REAL_CALLOC: AtomicPtr<c_void> = AtomicPtr::new(ptr::null_mut());
static REAL_REALLOC: AtomicPtr<c_void> = AtomicPtr::new(ptr::null_mut());
static REAL_FREE: AtomicPtr<c_void> = AtomicPtr::new(ptr::null_mut());

/// Looks `name` up past this library.  `RTLD_NEXT` only yields
/// something when we are an interposed shared object; when the crate
/// is linked straight into an executable (tests, the non-interposing
/// build) the default search finds the system allocator instead.
fn lookup(name: &'static [u8]) -> *mut c_void {
    debug_assert!(name.ends_with(b"\0"));
    let raw = name.as_ptr() as *const libc::c_char;

    let next = unsafe { libc::dlsym(libc::RTLD_NEXT, raw) };
    if !next.is_null() {
        return next;
    }

    unsafe { libc::dlsym(libc::RTLD_DEFAULT, raw) }
}

/// Captures the underlying allocator's entry points.  Returns false
/// when any symbol is missing; whatever was found is still usable.
pub fn resolve() -> bool {
    REAL_MALLOC.store(lookup(b"malloc\0"), Ordering::Release);
    REAL_CALLOC.store(lookup(b"calloc\0"), Ordering::Release);
    REAL_REALLOC.store(lookup(b"realloc\0"), Ordering::Release);
    REAL_FREE.store(lookup(b"free\0"), Ordering::Release);

    have_malloc()
        && !REAL_CALLOC.load(Ordering::Acquire).is_null()
        && !REAL_REALLOC.load(Ordering::Acquire).is_null()
        && !REAL_FREE.load(Ordering::Acquire).is_null()
}

#[inline]
pub fn have_malloc() -> bool {
    !REAL_MALLOC.load(Ordering::Acquire).is_null()
}

/// Calls the underlying `malloc`, or returns null while it is still
/// unresolved; callers in the bootstrap window tolerate that.
pub fn malloc(size: usize) -> *mut c_void {
    let f = REAL_MALLOC.load(Ordering::Acquire);
    if f.is_null() {
        return ptr::null_mut();
    }

    let f: MallocFn = unsafe { mem::transmute(f) };
    unsafe { f(size) }
}

pub fn calloc(count: usize, size: usize) -> *mut c_void {
    let f = REAL_CALLOC.load(Ordering::Acquire);
    if f.is_null() {
        return ptr::null_mut();
    }

    let f: CallocFn = unsafe { mem::transmute(f) };
    unsafe { f(count, size) }
}

pub fn realloc(old: *mut c_void, size: usize) -> *mut c_void {
    let f = REAL_REALLOC.load(Ordering::Acquire);
    if f.is_null() {
        return ptr::null_mut();
    }

    let f: ReallocFn = unsafe { mem::transmute(f) };
    unsafe { f(old, size) }
}

/// Hands `old` back to the underlying `free`.  Before the symbol is
/// resolved the pointer can only be dropped; leaking a block beats
/// crashing inside someone else's bootstrap.
pub fn free(old: *mut c_void) {
    let f = REAL_FREE.load(Ordering::Acquire);
    if f.is_null() {
        return;
    }

    let f: FreeFn = unsafe { mem::transmute(f) };
    unsafe { f(old) }
}

/// Usable length of a block owned by the underlying allocator.
pub fn usable_size(old: *mut c_void) -> usize {
    unsafe { libc::malloc_usable_size(old) }
}
