//! Concurrent mixed-operation stress over the public allocator API.
//!
//! Thirty-two workers hammer `bigmaac_malloc`/`bigmaac_calloc`/
//! `bigmaac_realloc`/`bigmaac_free` with sizes straddling both region
//! thresholds, each verifying the contents of its own blocks.  The
//! binary runs in its own process, so it configures the library
//! through the environment before the first call bootstraps it.
use std::ffi::c_void;
use std::thread;

use bigmaac::{bigmaac_calloc, bigmaac_free, bigmaac_malloc, bigmaac_realloc};

const THREADS: usize = 32;
const OPS_PER_THREAD: usize = 16384;
const SLOTS_PER_THREAD: usize = 8;

const MIN_SIZE: usize = 8 << 10;
const SIZE_SPREAD: usize = 16 << 10;

struct Block {
    ptr: *mut u8,
    len: usize,
    fill: u8,
}

fn xorshift(state: &mut u64) -> u64 {
    let mut x = *state;
    x ^= x << 13;
    x ^= x >> 7;
    x ^= x << 17;
    *state = x;
    x
}

fn fill(block: &Block) {
    unsafe {
        std::ptr::write_bytes(block.ptr, block.fill, block.len);
    }
}

fn verify(block: &Block, len: usize) {
    unsafe {
        for offset in [0, len / 2, len - 1].iter() {
            assert_eq!(
                *block.ptr.add(*offset),
                block.fill,
                "block content was clobbered"
            );
        }
    }
}

fn worker(seed: u64) {
    let mut rng = seed * 2 + 1;
    let mut slots: Vec<Option<Block>> = (0..SLOTS_PER_THREAD).map(|_| None).collect();

    for op in 0..OPS_PER_THREAD {
        let roll = xorshift(&mut rng);
        let slot = (roll % SLOTS_PER_THREAD as u64) as usize;
        let size = MIN_SIZE + (xorshift(&mut rng) as usize % SIZE_SPREAD);
        let fill_byte = (seed as u8).wrapping_mul(31).wrapping_add(op as u8) | 1;

        match slots[slot].take() {
            None => {
                let ptr = if roll & 1 == 0 {
                    bigmaac_malloc(size) as *mut u8
                } else {
                    let ptr = bigmaac_calloc(1, size) as *mut u8;
                    if !ptr.is_null() {
                        // Freshly calloc'ed memory must read as zero.
                        unsafe {
                            assert_eq!(*ptr, 0);
                            assert_eq!(*ptr.add(size - 1), 0);
                        }
                    }
                    ptr
                };
                assert!(!ptr.is_null(), "allocation of {} bytes failed", size);

                let block = Block {
                    ptr,
                    len: size,
                    fill: fill_byte,
                };
                fill(&block);
                slots[slot] = Some(block);
            }
            Some(block) => {
                verify(&block, block.len);

                if roll & 2 == 0 {
                    unsafe { bigmaac_free(block.ptr as *mut c_void) };
                } else {
                    let moved =
                        unsafe { bigmaac_realloc(block.ptr as *mut c_void, size) } as *mut u8;
                    assert!(!moved.is_null(), "realloc to {} bytes failed", size);

                    // Chunks never shrink, so a smaller request keeps
                    // the pointer (region-owned blocks only: length
                    // exactly MIN_SIZE stayed with the underlying
                    // allocator, which is free to move).  Either way
                    // the common prefix survives.
                    if size <= block.len && block.len > MIN_SIZE {
                        assert_eq!(moved, block.ptr);
                    }
                    let surviving = block.len.min(size);
                    let grown = Block {
                        ptr: moved,
                        len: size,
                        fill: block.fill,
                    };
                    verify(&grown, surviving);

                    fill(&grown);
                    slots[slot] = Some(grown);
                }
            }
        }
    }

    for block in slots.iter_mut().filter_map(Option::take) {
        verify(&block, block.len);
        unsafe { bigmaac_free(block.ptr as *mut c_void) };
    }
}

#[test]
fn concurrent_mixed_operations() {
    std::env::set_var("SIZE_FRIES", (64 << 20).to_string());
    std::env::set_var("SIZE_BIGMAAC", (256 << 20).to_string());
    std::env::set_var("BIGMAAC_MIN_FRY_SIZE", (8 << 10).to_string());
    std::env::set_var("BIGMAAC_MIN_BIGMAAC_SIZE", (16 << 10).to_string());

    let workers: Vec<_> = (0..THREADS)
        .map(|t| thread::spawn(move || worker(t as u64 + 1)))
        .collect();
    for worker in workers {
        worker.join().expect("worker thread must not crash");
    }

    // Every chunk went back, so a request close to the bigmaac
    // region's full capacity only fits if the holes coalesced back
    // into one.
    let probe = bigmaac_malloc(250 << 20);
    assert!(!probe.is_null(), "regions did not coalesce after the storm");
    unsafe {
        *(probe as *mut u8) = 1;
        bigmaac_free(probe as *mut c_void);
    }
}
