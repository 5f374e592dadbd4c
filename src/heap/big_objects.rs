//! Big-object pool. Objects too large for the arena get their own mapped
//! pages and a descriptor in the array that grows downward from the top of
//! the reservation. Bodies never move; reclamation sorts the descriptors by
//! `(mark, body)` and drops the unmarked prefix.

use super::addr::Address;
use super::constants::max_big_object_bytes;
use super::os;
use super::{out_of_memory, Heap};
use crate::runtime::context::Stack;

#[derive(Copy, Clone)]
#[repr(C)]
pub struct BigObject {
    pub body: *mut u8,
    pub size: usize,
    pub scan_offset: u32,
    pub scan_size: u32,
    pub mark: u32,
}

impl Heap {
    fn live_descriptors(&mut self) -> &mut [BigObject] {
        unsafe { core::slice::from_raw_parts_mut(self.big_objects, self.big_object_count()) }
    }

    /// Order descriptors by body address so the mark phase can binary
    /// search them.
    pub(crate) fn sort_big_objects(&mut self) {
        self.live_descriptors()
            .sort_unstable_by_key(|big| big.body as usize);
    }

    /// Valid between `sort_big_objects` and the next `free_big_objects`.
    pub(crate) fn find_big_object(&self, body: Address) -> Option<*mut BigObject> {
        let descriptors =
            unsafe { core::slice::from_raw_parts(self.big_objects, self.big_object_count()) };
        descriptors
            .binary_search_by_key(&body.to_usize(), |big| big.body as usize)
            .ok()
            .map(|index| unsafe { self.big_objects.add(index) })
    }

    /// Sweep the pool after a completed mark: unmarked descriptors sort to
    /// the low end and their bodies are unmapped; survivors keep their
    /// addresses and have the mark cleared.
    pub(crate) fn free_big_objects(&mut self) {
        let verbose = self.verbose;
        let descriptors = self.live_descriptors();
        descriptors.sort_unstable_by_key(|big| (big.mark, big.body as usize));

        let mut freed = 0;
        for big in descriptors.iter() {
            if big.mark != 0 {
                break;
            }
            log_if!(verbose, "freeing big object {:p} ({} bytes)", big.body, big.size);
            os::unmap_memory(Address::from_ptr(big.body), big.size);
            freed += 1;
        }
        for big in descriptors[freed..].iter_mut() {
            big.mark = 0;
        }
        self.big_objects = unsafe { self.big_objects.add(freed) };
        log_if!(
            self.verbose,
            "{} big objects allocated after collection",
            self.big_object_count()
        );
    }

    pub(crate) fn allocate_big(
        &mut self,
        stack: &mut Stack,
        object_size: usize,
        scan_offset: usize,
        scan_size: usize,
    ) -> Address {
        if object_size > max_big_object_bytes() {
            eprintln!("meteor: invalid big object size {}", object_size);
            std::process::exit(1);
        }

        if !self.has_descriptor_space() {
            self.collect(stack);
            if !self.has_descriptor_space() {
                if self.size * 2 <= self.reserved_size {
                    self.resize(self.size * 2);
                } else {
                    self.collect_full(stack);
                }
                if !self.has_descriptor_space() {
                    out_of_memory();
                }
            }
        }

        let mut body = os::map_memory(object_size);
        if body.is_none() {
            log_if!(self.verbose, "allocation failed, collecting big objects");
            self.collect_big_objects(stack);
            body = os::map_memory(object_size);
            if body.is_none() {
                self.collect_full(stack);
                body = os::map_memory(object_size);
            }
        }
        let body = match body {
            Some(body) => body,
            None => out_of_memory(),
        };

        unsafe {
            let big = self.big_objects.sub(1);
            big.write(BigObject {
                body: body.to_mut_ptr(),
                size: object_size,
                scan_offset: scan_offset as u32,
                scan_size: scan_size as u32,
                mark: 0,
            });
            self.big_objects = big;
        }
        log_if!(
            self.verbose,
            "allocated big object {:?} ({} bytes)",
            body,
            object_size
        );
        body
    }

    /// A fresh descriptor must stay clear of the committed arena.
    fn has_descriptor_space(&self) -> bool {
        unsafe { self.big_objects.sub(1) as usize >= self.base.offset(self.size).to_usize() }
    }
}
