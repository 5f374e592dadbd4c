//! Mark phase: trace the value stack, then drain the worklist threaded
//! through object headers. Arena objects are recorded in the bitmap and
//! chained by index; big objects carry their own mark flag and are scanned
//! immediately on discovery.

use super::addr::Address;
use super::constants::HEAP_ALIGNMENT;
use super::header::{Header, MARK_LIST_NULL};
use super::os;
use super::Heap;
use crate::runtime::context::Stack;
use crate::runtime::value::Value;
use core::mem::size_of;
use std::time::Instant;

impl Heap {
    /// Returns false when the deadline expired before the worklist drained;
    /// the bitmap then holds a subset of the reachable objects and the next
    /// collection starts over.
    pub(crate) fn mark(&mut self, stack: &Stack, deadline: u64) -> bool {
        let phase_start = Instant::now();

        self.mark_size = 0;
        self.mark_list = MARK_LIST_NULL;
        unsafe {
            self.bitmap().clear_all();
        }
        self.sort_big_objects();

        let (stack_base, stack_pointer) = stack.value_range();
        let depth = (stack_pointer as usize - stack_base as usize) / size_of::<Value>();
        self.scan_object(Address::from_ptr(stack_base), 0, depth);

        while self.mark_list != MARK_LIST_NULL {
            let body = self.base.offset(self.mark_list as usize * HEAP_ALIGNMENT);
            unsafe {
                let header = body.to_mut_ptr::<Header>().sub(1);
                self.mark_list = (*header).mark_next();
                let scan_offset = (*header).scan_offset();
                let scan_size = (*header).scan_size();
                self.scan_object(body, scan_offset, scan_size);
            }
            if deadline != 0 && os::cycle_count() > deadline {
                log_if!(self.verbose, "deadline expired while marking");
                return false;
            }
        }

        self.stats.mark_time += phase_start.elapsed();
        true
    }

    /// Inspect one pointer-bearing slot range. Only values whose tag is at
    /// or above the pointer floor are followed.
    fn scan_object(&mut self, body: Address, scan_offset: usize, scan_size: usize) {
        unsafe {
            let mut cur = body.to_ptr::<Value>().add(scan_offset);
            let end = cur.add(scan_size);
            while cur < end {
                let value = *cur;
                if value.tag() >= self.pointer_tag {
                    let target = value.untag_pointer();
                    if target >= self.base && target <= self.pointer {
                        let header = target.to_mut_ptr::<Header>().sub(1);
                        let index = self.header_index(header);
                        if !self.bitmap().test(index) {
                            self.bitmap().set(index);
                            (*header).set_mark_next(self.mark_list);
                            self.mark_list =
                                (target.offset_from(self.base) / HEAP_ALIGNMENT) as u32;
                            self.mark_size +=
                                size_of::<Header>() + (*header).size() * size_of::<Value>();
                        }
                    } else if let Some(big) = self.find_big_object(target) {
                        if (*big).mark == 0 {
                            (*big).mark = 1;
                            self.scan_object(
                                Address::from_ptr((*big).body),
                                (*big).scan_offset as usize,
                                (*big).scan_size as usize,
                            );
                        }
                    }
                }
                cur = cur.add(1);
            }
        }
    }

    pub(crate) fn is_marked(&self, header: *const Header) -> bool {
        unsafe { self.bitmap().test(self.header_index(header)) }
    }
}
