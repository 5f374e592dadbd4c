//! Virtual-memory and cycle-counter platform layer.
//!
//! The collector consumes two memory operations: map a read-write anonymous
//! region and unmap it again. Reservations and big-object bodies both go
//! through them; the halving retry loop for the initial reservation lives in
//! the caller.

use super::addr::Address;
use once_cell::sync::Lazy;
use std::time::{Duration, Instant};

#[cfg(target_family = "unix")]
pub fn map_memory(size: usize) -> Option<Address> {
    let ptr = unsafe {
        libc::mmap(
            core::ptr::null_mut(),
            size,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANON,
            -1,
            0,
        )
    };

    if ptr == libc::MAP_FAILED {
        None
    } else {
        Some(Address::from_ptr(ptr))
    }
}

#[cfg(target_family = "unix")]
pub fn unmap_memory(ptr: Address, size: usize) {
    let result = unsafe { libc::munmap(ptr.to_mut_ptr(), size) };

    if result != 0 {
        panic!("munmap() failed");
    }
}

#[cfg(target_family = "windows")]
pub fn map_memory(size: usize) -> Option<Address> {
    use winapi::um::memoryapi::VirtualAlloc;
    use winapi::um::winnt::{MEM_COMMIT, MEM_RESERVE, PAGE_READWRITE};

    let ptr =
        unsafe { VirtualAlloc(core::ptr::null_mut(), size, MEM_COMMIT | MEM_RESERVE, PAGE_READWRITE) };

    if ptr.is_null() {
        None
    } else {
        Some(Address::from_ptr(ptr))
    }
}

#[cfg(target_family = "windows")]
pub fn unmap_memory(ptr: Address, _size: usize) {
    use winapi::um::memoryapi::VirtualFree;
    use winapi::um::winnt::MEM_RELEASE;

    let result = unsafe { VirtualFree(ptr.to_mut_ptr(), 0, MEM_RELEASE) };

    if result == 0 {
        panic!("VirtualFree failed");
    }
}

#[cfg(not(any(target_family = "unix", target_family = "windows")))]
pub fn map_memory(_size: usize) -> Option<Address> {
    None
}

#[cfg(not(any(target_family = "unix", target_family = "windows")))]
pub fn unmap_memory(_ptr: Address, _size: usize) {}

#[cfg(target_arch = "x86_64")]
pub fn cycle_count() -> u64 {
    unsafe { core::arch::x86_64::_rdtsc() }
}

#[cfg(not(target_arch = "x86_64"))]
pub fn cycle_count() -> u64 {
    static EPOCH: Lazy<Instant> = Lazy::new(Instant::now);
    EPOCH.elapsed().as_nanos() as u64
}

/// Cycles per millisecond, estimated once per process against the monotonic
/// clock and read-only afterwards.
pub fn cycles_per_ms() -> u64 {
    *CYCLES_PER_MS
}

static CYCLES_PER_MS: Lazy<u64> = Lazy::new(|| {
    let start = Instant::now();
    let first = cycle_count();
    while start.elapsed() < Duration::from_millis(1) {}
    let cycles = cycle_count().wrapping_sub(first);
    let nanos = start.elapsed().as_nanos().max(1);
    ((cycles as u128 * 1_000_000 / nanos) as u64).max(1)
});
