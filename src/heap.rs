//! # Meteor heap implementation
//!
//! One contiguous reservation per context. Small objects are bump-allocated
//! as header+body pairs in the arena at the bottom; the relocation table and
//! the mark bitmap are carved from the top of the committed region; big
//! object descriptors grow downward from the top of the reservation and
//! their bodies live in separately mapped pages.
//!
//! Collection is incremental mark-compact: mark traces the value stack and
//! drains a worklist threaded through object headers, compact slides runs of
//! live objects toward the base and rewrites every pointer through a sorted
//! relocation table. Both phases yield when the cycle-counter deadline
//! expires, always leaving every live pointer valid.

use self::addr::Address;
use self::big_objects::BigObject;
use self::bitmap::{MarkBitmap, NUM_BITS};
use self::constants::*;
use self::header::{Header, Relocation, MARK_LIST_NULL};
use core::mem::size_of;
use std::time::Duration;

use crate::runtime::context::Stack;
use crate::runtime::options::Options;
use crate::runtime::value::Value;

pub mod addr;
pub mod big_objects;
pub mod bitmap;
pub mod compact;
pub mod constants;
pub mod header;
pub mod mark;
pub mod os;

#[derive(Default, Clone)]
pub struct HeapStats {
    pub num_collections: u64,
    pub mark_time: Duration,
    pub compact_time: Duration,
    /// Mid-compaction relocation sweeps forced by a full relocation buffer
    /// or an expired deadline.
    pub partial_relocations: u64,
}

pub struct Heap {
    base: Address,
    pointer: Address,
    limit: Address,
    /// Committed arena size including metadata, always a 16-byte multiple.
    size: usize,
    reserved_size: usize,
    relocs: *mut Relocation,
    relocs_end: *mut Relocation,
    relocs_size: usize,
    bitmap: *mut usize,
    /// Bitmap length in words.
    bitmap_size: usize,
    /// Lowest live big-object descriptor; the array ends at the top of the
    /// reservation and grows downward.
    big_objects: *mut BigObject,
    big_objects_end: *mut BigObject,
    mark_list: u32,
    mark_size: usize,
    /// Values with a tag at or above this are traced as pointers.
    pointer_tag: u16,
    /// Incremental collection deadline in cycles.
    latency: u64,
    verbose: bool,
    stats: HeapStats,
}

impl Heap {
    /// Reserve as much address space as the options ask for, halving on
    /// failure. Returns `None` once the floor is reached.
    pub(crate) fn new(options: &Options) -> Option<Heap> {
        let mut reserved_size = options.reserve_size.max(MIN_HEAP_SIZE);
        let base = loop {
            if let Some(base) = os::map_memory(reserved_size) {
                break base;
            }
            reserved_size /= 2;
            if reserved_size < MIN_HEAP_SIZE {
                return None;
            }
        };

        let big_objects_end = base.offset(reserved_size).to_mut_ptr::<BigObject>();
        let mut heap = Heap {
            base,
            pointer: base,
            limit: base,
            size: 0,
            reserved_size,
            relocs: core::ptr::null_mut(),
            relocs_end: core::ptr::null_mut(),
            relocs_size: 0,
            bitmap: core::ptr::null_mut(),
            bitmap_size: 0,
            big_objects: big_objects_end,
            big_objects_end,
            mark_list: MARK_LIST_NULL,
            mark_size: 0,
            pointer_tag: Value::POINTER_TAG_FLOOR,
            latency: options.gc_latency.saturating_mul(os::cycles_per_ms()),
            verbose: options.verbose_gc,
            stats: HeapStats::default(),
        };
        heap.set_heap_base(INITIAL_HEAP_SIZE.min(reserved_size));
        log_if!(
            heap.verbose,
            "heap reserved size: {} MB",
            reserved_size / (1024 * 1024)
        );
        Some(heap)
    }

    /// Carve the metadata tables from the top of a committed arena of
    /// `size` bytes and reset the bump pointer.
    fn set_heap_base(&mut self, size: usize) {
        let size = size & !(HEAP_ALIGNMENT - 1);
        let relocs_size = (size >> 5) / size_of::<Relocation>();
        let bitmap_size = (size / size_of::<Header>() + NUM_BITS - 1) / NUM_BITS;
        let metadata_size = align_usize(
            relocs_size * size_of::<Relocation>() + bitmap_size * size_of::<usize>(),
            HEAP_ALIGNMENT,
        );
        self.pointer = self.base;
        self.limit = self.base.offset(size - metadata_size);
        self.relocs = self.limit.to_mut_ptr::<Relocation>();
        self.relocs_end = self.relocs;
        self.bitmap = unsafe { self.relocs.add(relocs_size) as *mut usize };
        self.size = size;
        self.relocs_size = relocs_size;
        self.bitmap_size = bitmap_size;
        log_if!(
            self.verbose,
            "heap size: {} bytes total, {} bytes usable",
            size,
            size - metadata_size
        );
    }

    /// Grow the committed arena, keeping the bump offset. No-op beyond the
    /// reservation; callers check the ceiling first.
    pub(crate) fn resize(&mut self, new_size: usize) {
        debug_assert!(new_size > self.size);
        debug_assert!(new_size >= MIN_HEAP_SIZE);
        log_if!(self.verbose, "resizing heap: {} KB", new_size / 1024);

        if new_size <= self.reserved_size {
            let old_metadata = self.limit;
            let old_metadata_size = self.base.offset(self.size).offset_from(self.limit);
            let pointer_offset = self.pointer.offset_from(self.base);
            self.set_heap_base(new_size);
            self.pointer = self.base.offset(pointer_offset);
            // the old tables are bump space now and must read as zeroed
            unsafe {
                core::ptr::write_bytes(old_metadata.to_mut_ptr::<u8>(), 0, old_metadata_size);
            }
        }
    }

    pub(crate) fn bitmap(&self) -> MarkBitmap {
        MarkBitmap::new(self.bitmap, self.bitmap_size)
    }

    pub(crate) fn header_index(&self, header: *const Header) -> usize {
        Address::from_ptr(header).offset_from(self.base) / size_of::<Header>()
    }

    pub(crate) fn allocate(
        &mut self,
        stack: &mut Stack,
        object_size: usize,
        scan_offset: usize,
        scan_size: usize,
    ) -> Address {
        let object_size = (object_size + 7) & !7;
        let alloc_size = object_size + size_of::<Header>();
        let padded_size = alloc_size + size_of::<Header>();

        if object_size > max_small_object_bytes() {
            return self.allocate_big(stack, object_size, scan_offset, scan_size);
        }

        if self.pointer.offset(padded_size) >= self.limit {
            self.ensure_allocate(stack, padded_size);
        }

        unsafe {
            let mut header = self.pointer.to_mut_ptr::<Header>();
            if !is_header_aligned(header) {
                header.write(Header::FILLER);
                header = header.add(1);
            }
            header.write(Header::new(
                (object_size / size_of::<Value>()) as u32,
                scan_offset as u32,
                scan_size as u32,
            ));
            self.pointer = Address::from_ptr(header).offset(alloc_size);
            Address::from_ptr(header.add(1))
        }
    }

    /// Slow allocation path: collect, then grow or escalate to a full
    /// collection if the arena would still be more than half full.
    fn ensure_allocate(&mut self, stack: &mut Stack, size: usize) {
        if self.pointer.offset(size) < self.limit {
            return;
        }
        self.collect(stack);
        let usable_size = self.limit.offset_from(self.base);
        if self.pointer.offset(size) >= self.base.offset(usable_size / 2) {
            if self.size * 2 <= self.reserved_size {
                self.resize(self.size * 2);
            } else if self.pointer.offset(size) >= self.limit {
                self.collect_full(stack);
                if self.pointer.offset(size) >= self.limit {
                    out_of_memory();
                }
            }
        }
    }

    /// One deadline-bounded collection slice. Compaction is skipped when
    /// more than half the arena is live or the deadline already fired.
    pub(crate) fn collect(&mut self, stack: &mut Stack) {
        log_if!(
            self.verbose,
            "-- begin collection (heap size: {} KB)",
            self.size / 1024
        );
        let deadline = os::cycle_count() + self.latency;

        if self.mark(stack, deadline) {
            log_if!(self.verbose, "{} bytes marked", self.mark_size);
            if self.mark_size < self.size / 2 && os::cycle_count() < deadline {
                if self.compact(stack, deadline) {
                    log_if!(
                        self.verbose,
                        "{} KB used after collection",
                        self.used_bytes() / 1024
                    );
                }
            } else {
                log_if!(self.verbose, "skipping compaction");
            }
        }
        self.stats.num_collections += 1;
    }

    pub(crate) fn collect_full(&mut self, stack: &mut Stack) {
        log_if!(
            self.verbose,
            "-- begin full collection (heap size: {} KB)",
            self.size / 1024
        );
        self.mark(stack, 0);
        self.compact(stack, 0);
        self.stats.num_collections += 1;
        log_if!(
            self.verbose,
            "-- full collection done ({} KB used)",
            self.used_bytes() / 1024
        );
    }

    /// Mark, then sweep only the big-object pool. Used when mapping a big
    /// body fails and compaction would not help.
    pub(crate) fn collect_big_objects(&mut self, stack: &mut Stack) {
        self.mark(stack, 0);
        self.free_big_objects();
    }

    pub fn base(&self) -> Address {
        self.base
    }

    /// Bytes of arena currently behind the bump pointer, fillers included.
    pub fn used_bytes(&self) -> usize {
        self.pointer.offset_from(self.base)
    }

    pub fn arena_size(&self) -> usize {
        self.size
    }

    pub fn reserved_size(&self) -> usize {
        self.reserved_size
    }

    pub fn big_object_count(&self) -> usize {
        (self.big_objects_end as usize - self.big_objects as usize) / size_of::<BigObject>()
    }

    pub fn stats(&self) -> &HeapStats {
        &self.stats
    }

    /// Walk headers densely from the base and count live objects. Fillers
    /// sit at positions where a header would be misaligned, which is how
    /// they are told apart from zero-sized objects.
    pub fn object_count(&self) -> usize {
        let mut count = 0;
        let mut cur = self.base.to_mut_ptr::<Header>();
        let end = self.pointer.to_mut_ptr::<Header>();
        unsafe {
            while cur < end {
                if is_header_aligned(cur) {
                    count += 1;
                }
                cur = cur.add((*cur).size() + 1);
            }
        }
        count
    }
}

impl Drop for Heap {
    fn drop(&mut self) {
        unsafe {
            let mut big = self.big_objects;
            while big < self.big_objects_end {
                os::unmap_memory(Address::from_ptr((*big).body), (*big).size);
                big = big.add(1);
            }
        }
        os::unmap_memory(self.base, self.reserved_size);
    }
}

pub(crate) fn out_of_memory() -> ! {
    eprintln!("meteor: memory exhausted, aborting");
    std::process::exit(1);
}
