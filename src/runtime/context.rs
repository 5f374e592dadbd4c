//! Per-thread execution context: the value stack the collector treats as
//! its root range, and the heap itself. Contexts are threaded explicitly
//! through the code that needs them, never stored in a process global, so
//! isolated instances can coexist.

use core::mem::size_of;
use memmap2::MmapMut;

use super::objects::{GcArray, GcString};
use super::options::Options;
use super::value::Value;
use crate::heap::addr::Address;
use crate::heap::Heap;

/// Default stack capacity in value slots: one 4 KiB context page minus room
/// for the bookkeeping fields.
pub const DEFAULT_STACK_SIZE: usize = (0x1000 - 128) / size_of::<Value>();

/// Operand stack. Values grow upward from `base`; traceback entries grow
/// downward from `end` while an error unwinds, and stop rather than cross
/// the value pointer.
///
/// Everything in `[base, pointer)` is scanned as a root on every
/// collection, so the mutator must keep dead slots popped or overwritten.
pub struct Stack {
    map: MmapMut,
    base: *mut Value,
    pointer: *mut Value,
    limit: *mut Value,
    end: *mut Value,
    traceback: *mut u32,
}

impl Stack {
    fn new(stack_size: usize) -> Option<Stack> {
        let mut map = MmapMut::map_anon(stack_size * size_of::<Value>()).ok()?;
        let base = map.as_mut_ptr() as *mut Value;
        let end = unsafe { base.add(stack_size) };
        Some(Stack {
            map,
            base,
            pointer: base,
            limit: end,
            end,
            traceback: end as *mut u32,
        })
    }

    pub fn depth(&self) -> usize {
        (self.pointer as usize - self.base as usize) / size_of::<Value>()
    }

    pub fn capacity(&self) -> usize {
        self.map.len() / size_of::<Value>()
    }

    pub fn push(&mut self, value: Value) {
        assert!(self.pointer < self.limit, "value stack overflow");
        unsafe {
            self.pointer.write(value);
            self.pointer = self.pointer.add(1);
        }
    }

    pub fn pop(&mut self) -> Value {
        assert!(self.pointer > self.base, "value stack underflow");
        unsafe {
            self.pointer = self.pointer.sub(1);
            *self.pointer
        }
    }

    pub fn get(&self, slot: usize) -> Value {
        assert!(slot < self.depth());
        unsafe { *self.base.add(slot) }
    }

    pub fn set(&mut self, slot: usize, value: Value) {
        assert!(slot < self.depth());
        unsafe { self.base.add(slot).write(value) }
    }

    /// Root range scanned and rewritten by the collector.
    pub(crate) fn value_range(&self) -> (*mut Value, *mut Value) {
        (self.base, self.pointer)
    }

    pub fn append_traceback(&mut self, entry: u32) {
        unsafe {
            let traceback = self.traceback.sub(1);
            if traceback as usize >= self.pointer as usize {
                traceback.write(entry);
                self.traceback = traceback;
            }
        }
    }

    pub fn reset_traceback(&mut self) {
        let len = self.end as usize - self.traceback as usize;
        unsafe {
            core::ptr::write_bytes(self.traceback as *mut u8, 0, len);
        }
        self.traceback = self.end as *mut u32;
    }

    pub fn traceback_entries(&self) -> &[u32] {
        unsafe {
            core::slice::from_raw_parts(
                self.traceback,
                (self.end as usize - self.traceback as usize) / size_of::<u32>(),
            )
        }
    }
}

pub struct Context {
    stack: Stack,
    heap: Heap,
}

impl Context {
    /// Returns `None` when no acceptable heap reservation could be made.
    pub fn new(options: &Options) -> Option<Context> {
        let heap = Heap::new(options)?;
        let stack = Stack::new(options.stack_size.unwrap_or(DEFAULT_STACK_SIZE))?;
        Some(Context { stack, heap })
    }

    pub fn stack(&mut self) -> &mut Stack {
        &mut self.stack
    }

    pub fn stack_ref(&self) -> &Stack {
        &self.stack
    }

    pub fn heap(&self) -> &Heap {
        &self.heap
    }

    pub fn collect(&mut self) {
        let Context { stack, heap } = self;
        heap.collect(stack);
    }

    pub fn collect_full(&mut self) {
        let Context { stack, heap } = self;
        heap.collect_full(stack);
    }

    /// General allocation; `scan_offset`/`scan_size` delimit the
    /// pointer-bearing window of the body in value-sized units. May run a
    /// collection, which rewrites every stack slot, so callers re-read
    /// roots from the stack afterwards.
    pub fn allocate(
        &mut self,
        object_size: usize,
        scan_offset: usize,
        scan_size: usize,
    ) -> Address {
        let Context { stack, heap } = self;
        heap.allocate(stack, object_size, scan_offset, scan_size)
    }

    /// Raw data, never scanned.
    pub fn allocate_data(&mut self, size: usize) -> Address {
        self.allocate(size, 0, 0)
    }

    /// `num_slots` pointer slots, scanned from offset zero. Fresh slots
    /// read as zero and must be initialized before the next allocation.
    pub fn allocate_slots(&mut self, num_slots: usize) -> Address {
        self.allocate(size_of::<Value>() * num_slots, 0, num_slots)
    }

    pub fn allocate_array(&mut self, num_elems: usize) -> *mut GcArray {
        let size = size_of::<GcArray>() + size_of::<Value>() * num_elems;
        let array = self
            .allocate(size, GcArray::ELEMS_OFFSET, num_elems)
            .to_mut_ptr::<GcArray>();
        unsafe { (*array).size = num_elems as u32 };
        array
    }

    pub fn allocate_string(&mut self, size: usize) -> *mut GcString {
        let string = self
            .allocate_data(size_of::<GcString>() + size + 1)
            .to_mut_ptr::<GcString>();
        unsafe { (*string).size = size as u32 };
        string
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stack_push_pop() {
        let mut stack = Stack::new(8).unwrap();
        assert_eq!(stack.capacity(), 8);
        stack.push(Value::small_int(1));
        stack.push(Value::small_int(2));
        assert_eq!(stack.depth(), 2);
        assert_eq!(stack.pop().as_small_int(), 2);
        assert_eq!(stack.get(0).as_small_int(), 1);
        stack.set(0, Value::small_int(9));
        assert_eq!(stack.pop().as_small_int(), 9);
        assert_eq!(stack.depth(), 0);
    }

    #[test]
    fn traceback_entries_grow_downward() {
        let mut stack = Stack::new(8).unwrap();
        stack.push(Value::unit());
        stack.append_traceback(11);
        stack.append_traceback(22);
        assert_eq!(stack.traceback_entries(), &[22, 11]);
        stack.reset_traceback();
        assert!(stack.traceback_entries().is_empty());
    }

    #[test]
    fn traceback_stops_at_the_value_pointer() {
        let mut stack = Stack::new(4).unwrap();
        for _ in 0..4 {
            stack.push(Value::unit());
        }
        stack.append_traceback(7);
        assert!(stack.traceback_entries().is_empty());
    }

    #[test]
    fn isolated_contexts_coexist() {
        let options = Options {
            reserve_size: 16 << 20,
            stack_size: Some(64),
            ..Options::default()
        };
        let mut first = Context::new(&options).unwrap();
        let mut second = Context::new(&options).unwrap();
        let body = first.allocate_data(16);
        unsafe { body.to_mut_ptr::<u64>().write(3) };
        second.allocate_data(16);
        second.collect_full();
        assert_eq!(unsafe { *body.to_ptr::<u64>() }, 3);
    }
}

