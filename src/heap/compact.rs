//! Compact phase: slide runs of marked objects toward the arena base,
//! recording each move in the relocation table, then rewrite every pointer
//! slot in the stack, the arena and the big objects. When the table fills
//! or the deadline fires mid-compaction, a partial sweep rewrites
//! everything against the moves made so far and the table is reset, so the
//! mutator always resumes with valid pointers.

use super::addr::Address;
use super::constants::{is_header_aligned, HEAP_ALIGNMENT};
use super::header::{Header, Relocation};
use super::os;
use super::Heap;
use crate::runtime::context::Stack;
use crate::runtime::value::Value;
use core::mem::size_of;
use std::time::Instant;

/// Greatest entry whose `src` does not exceed `index`.
fn lower_bound(relocs: &[Relocation], index: u32) -> Option<&Relocation> {
    let mut lo = 0;
    let mut hi = relocs.len();
    while lo < hi {
        let mid = (lo + hi) / 2;
        if relocs[mid].src <= index {
            lo = mid + 1;
        } else {
            hi = mid;
        }
    }
    if lo == 0 {
        None
    } else {
        Some(&relocs[lo - 1])
    }
}

impl Heap {
    /// Returns false when the deadline expired mid-compaction; a partial
    /// relocation sweep has then already made every live pointer valid.
    pub(crate) fn compact(&mut self, stack: &mut Stack, deadline: u64) -> bool {
        let phase_start = Instant::now();

        self.free_big_objects();
        if deadline != 0 && os::cycle_count() > deadline {
            log_if!(self.verbose, "deadline expired while compacting");
            self.stats.compact_time += phase_start.elapsed();
            return false;
        }

        let heap_start = self.base.to_mut_ptr::<Header>();
        let end = self.pointer.to_mut_ptr::<Header>();
        let end_index = self.pointer.offset_from(self.base) / size_of::<Header>();
        let relocs_limit = unsafe { self.relocs.add(self.relocs_size - 1) };
        let mut dest = heap_start;
        let mut moved = 0usize;
        self.relocs_end = self.relocs;

        let mut index = 0usize;
        while index < end_index {
            index = match unsafe { self.bitmap().find_first_set(index) } {
                Some(set_index) => set_index,
                None => break,
            };
            let src = unsafe { heap_start.add(index) };
            let mut cur = src;
            // extend the run across adjacent marked objects, coalescing
            // over fillers whose successor is marked
            unsafe {
                while cur < end
                    && (self.is_marked(cur) || ((*cur).size() == 0 && self.is_marked(cur.add(1))))
                {
                    cur = cur.add((*cur).size() + 1);
                }
            }
            let run = unsafe { cur.offset_from(src) } as usize;
            if !is_header_aligned(dest) {
                unsafe {
                    dest.write(Header::FILLER);
                    dest = dest.add(1);
                }
            }
            if dest != src && run > 0 {
                unsafe {
                    core::ptr::copy(src as *const Header, dest, run);
                    moved += run;
                    self.append_relocation(src.add(1), dest.add(1));
                    if self.relocs_end >= relocs_limit {
                        log_if!(self.verbose, "relocation buffer full");
                        self.relocate_partially_compacted(stack, dest.add(run), cur);
                        self.relocs_end = self.relocs;
                    }
                }
            }
            dest = unsafe { dest.add(run) };
            index = unsafe { cur.offset_from(heap_start) } as usize;

            if deadline != 0 && os::cycle_count() > deadline {
                log_if!(
                    self.verbose,
                    "compacted {} KB",
                    moved * size_of::<Header>() / 1024
                );
                log_if!(self.verbose, "deadline expired while compacting");
                self.relocate_partially_compacted(stack, dest, cur);
                self.relocs_end = self.relocs;
                self.stats.compact_time += phase_start.elapsed();
                return false;
            }
        }

        let freed = self.pointer.offset_from(Address::from_ptr(dest));
        self.pointer = Address::from_ptr(dest);
        if self.pointer < self.limit {
            unsafe {
                core::ptr::write_bytes(
                    self.pointer.to_mut_ptr::<u8>(),
                    0,
                    self.limit.offset_from(self.pointer),
                );
            }
        }

        self.relocate_fully_compacted(stack);

        log_if!(
            self.verbose,
            "compacted {} KB, freed {} KB",
            moved * size_of::<Header>() / 1024,
            freed / 1024
        );
        self.stats.compact_time += phase_start.elapsed();
        true
    }

    fn append_relocation(&mut self, from: *mut Header, dest: *mut Header) {
        debug_assert!(Address::from_ptr(from).offset_from(self.base) % HEAP_ALIGNMENT == 0);
        debug_assert!((from as usize - dest as usize) % HEAP_ALIGNMENT == 0);
        debug_assert!(self.relocs_end < unsafe { self.relocs.add(self.relocs_size) });
        unsafe {
            (*self.relocs_end).src =
                (Address::from_ptr(from).offset_from(self.base) / HEAP_ALIGNMENT) as u32;
            (*self.relocs_end).diff = ((from as usize - dest as usize) / HEAP_ALIGNMENT) as u32;
            self.relocs_end = self.relocs_end.add(1);
        }
    }

    /// How far the body at `body` moved, in 16-byte units.
    fn find_relocation(&self, body: Address) -> usize {
        let index = (body.offset_from(self.base) / HEAP_ALIGNMENT) as u32;
        let relocs = unsafe {
            core::slice::from_raw_parts(
                self.relocs,
                self.relocs_end.offset_from(self.relocs) as usize,
            )
        };
        match lower_bound(relocs, index) {
            Some(entry) => entry.diff as usize,
            None => 0,
        }
    }

    /// Rewrite pointer values in a slot range. Big-object bodies fall
    /// outside `[base, limit)` and stay untouched.
    unsafe fn relocate_slots(&self, mut slot: *mut Value, end: *mut Value) {
        while slot < end {
            let value = *slot;
            let tag = value.tag();
            if tag >= self.pointer_tag {
                let body = value.untag_pointer();
                if body >= self.base && body < self.limit {
                    let diff = self.find_relocation(body);
                    if diff != 0 {
                        slot.write(Value::tag_pointer(tag, body.sub(diff * HEAP_ALIGNMENT)));
                    }
                }
            }
            slot = slot.add(1);
        }
    }

    fn relocate_stack(&self, stack: &mut Stack) {
        let (base, pointer) = stack.value_range();
        unsafe { self.relocate_slots(base, pointer) };
    }

    unsafe fn relocate_object(&self, header: *mut Header) {
        let slot = (header.add(1) as *mut Value).add((*header).scan_offset());
        self.relocate_slots(slot, slot.add((*header).scan_size()));
    }

    /// Walk headers densely; every object in a compacted range is live.
    unsafe fn relocate_compacted(&self, start: *mut Header, end: *mut Header) {
        let mut cur = start;
        while cur < end {
            if (*cur).scan_size() > 0 {
                self.relocate_object(cur);
            }
            cur = cur.add((*cur).size() + 1);
        }
    }

    /// Walk headers densely but only rewrite marked objects; the range
    /// still contains garbage that compaction has not reached.
    unsafe fn relocate_uncompacted(&self, start: *mut Header, end: *mut Header) {
        let mut cur = start;
        while cur < end {
            if self.is_marked(cur) && (*cur).scan_size() > 0 {
                self.relocate_object(cur);
            }
            cur = cur.add((*cur).size() + 1);
        }
    }

    fn relocate_big_objects(&self) {
        unsafe {
            let mut big = self.big_objects;
            while big < self.big_objects_end {
                let slot = ((*big).body as *mut Value).add((*big).scan_offset as usize);
                self.relocate_slots(slot, slot.add((*big).scan_size as usize));
                big = big.add(1);
            }
        }
    }

    /// Mid-compaction sweep. A boundary entry at the first unmoved header
    /// caps the table so searches past the compacted region resolve to a
    /// zero shift, then every live slot is rewritten: the dense prefix, the
    /// marked tail, the stack and the big objects.
    fn relocate_partially_compacted(
        &mut self,
        stack: &mut Stack,
        compacted_end: *mut Header,
        uncompacted: *mut Header,
    ) {
        let from = if is_header_aligned(uncompacted) {
            unsafe { uncompacted.add(1) }
        } else {
            uncompacted
        };
        self.append_relocation(from, from);
        self.relocate_stack(stack);
        unsafe {
            self.relocate_compacted(self.base.to_mut_ptr(), compacted_end);
            self.relocate_uncompacted(uncompacted, self.pointer.to_mut_ptr());
        }
        self.relocate_big_objects();
        self.stats.partial_relocations += 1;
    }

    fn relocate_fully_compacted(&mut self, stack: &mut Stack) {
        let limit = self.limit.to_mut_ptr::<Header>();
        self.append_relocation(limit, limit);
        self.relocate_stack(stack);
        unsafe {
            self.relocate_compacted(self.base.to_mut_ptr(), self.pointer.to_mut_ptr());
        }
        self.relocate_big_objects();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(src: u32, diff: u32) -> Relocation {
        Relocation { src, diff }
    }

    #[test]
    fn lower_bound_picks_greatest_not_above() {
        let relocs = [entry(4, 1), entry(10, 3), entry(20, 0)];
        assert!(lower_bound(&relocs, 3).is_none());
        assert_eq!(lower_bound(&relocs, 4).unwrap().diff, 1);
        assert_eq!(lower_bound(&relocs, 9).unwrap().diff, 1);
        assert_eq!(lower_bound(&relocs, 10).unwrap().diff, 3);
        assert_eq!(lower_bound(&relocs, 19).unwrap().diff, 3);
        assert_eq!(lower_bound(&relocs, 25).unwrap().diff, 0);
    }

    #[test]
    fn lower_bound_on_empty_table() {
        assert!(lower_bound(&[], 5).is_none());
    }
}
