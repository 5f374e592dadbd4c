//! End-to-end collector scenarios driven through the public context
//! surface: fragmentation, relocation-buffer overflow, big-object
//! lifetimes, deadline-bounded slices, heap growth and filler coalescing.

use meteor::runtime::context::Context;
use meteor::runtime::options::Options;
use meteor::runtime::value::{Value, TAG_BUFFER, TAG_SLOTS, TAG_SMALL_INT};

fn options(reserve_size: usize, gc_latency: u64) -> Options {
    Options {
        reserve_size,
        gc_latency,
        verbose_gc: false,
        gc_stats: false,
        stack_size: Some(4096),
    }
}

/// Allocate a 16-byte data object carrying `payload` and root it.
fn push_data(context: &mut Context, payload: u64) {
    let body = context.allocate_data(16);
    unsafe { body.to_mut_ptr::<u64>().write(payload) };
    context.stack().push(Value::tag_pointer(TAG_BUFFER, body));
}

fn read_payload(value: Value) -> u64 {
    unsafe { *value.untag_pointer().to_ptr::<u64>() }
}

#[test]
fn fragmented_collect_packs_survivors() {
    let mut context = Context::new(&options(64 << 20, 50)).unwrap();
    for i in 0..1000 {
        push_data(&mut context, i);
    }
    for i in (0..1000).step_by(2) {
        context.stack().set(i, Value::unit());
    }

    context.collect_full();

    // every survivor is a filler plus a 24-byte object
    assert_eq!(context.heap().object_count(), 500);
    assert_eq!(context.heap().used_bytes(), 500 * 32);
    for i in (1..1000).step_by(2) {
        let value = context.stack().get(i);
        assert_eq!(value.tag(), TAG_BUFFER);
        assert_eq!(read_payload(value), i as u64);
    }
}

#[test]
fn relocation_buffer_overflow_sweeps_partially() {
    let mut context = Context::new(&options(64 << 20, 50)).unwrap();
    for i in 0..1200 {
        push_data(&mut context, i);
    }
    for i in (0..1200).step_by(2) {
        context.stack().set(i, Value::unit());
    }

    context.collect_full();

    // 600 separated runs against a 256-entry table (one slot reserved for
    // the terminal entry) force a mid-compaction sweep every 255 moves
    assert_eq!(context.heap().stats().partial_relocations, 2);
    assert_eq!(context.heap().object_count(), 600);
    for i in (1..1200).step_by(2) {
        let value = context.stack().get(i);
        assert_eq!(value.tag(), TAG_BUFFER);
        assert_eq!(read_payload(value), i as u64);
    }
}

#[test]
fn big_objects_are_pinned_and_reclaimed() {
    let mut context = Context::new(&options(64 << 20, 50)).unwrap();

    let body = context.allocate_data(64 * 1024);
    unsafe {
        body.to_mut_ptr::<u64>().write(0xDEAD_BEEF);
        body.offset(64 * 1024 - 8).to_mut_ptr::<u64>().write(0xF00D);
    }
    context.stack().push(Value::tag_pointer(TAG_BUFFER, body));
    assert_eq!(context.heap().big_object_count(), 1);

    // churn the arena through at least two collections
    let before = context.heap().stats().num_collections;
    while context.heap().stats().num_collections < before + 2 {
        context.allocate_data(512);
    }

    let value = context.stack().get(0);
    assert_eq!(value.untag_pointer(), body);
    unsafe {
        assert_eq!(*body.to_ptr::<u64>(), 0xDEAD_BEEF);
        assert_eq!(*body.offset(64 * 1024 - 8).to_ptr::<u64>(), 0xF00D);
    }
    assert_eq!(context.heap().big_object_count(), 1);

    context.stack().set(0, Value::unit());
    context.collect_full();
    assert_eq!(context.heap().big_object_count(), 0);
}

#[test]
fn big_object_scan_ranges_keep_referents_alive() {
    let mut context = Context::new(&options(64 << 20, 50)).unwrap();

    context.allocate_data(16); // garbage in front, so the referent moves
    let small = context.allocate_data(16);
    unsafe { small.to_mut_ptr::<u64>().write(99) };
    context.stack().push(Value::tag_pointer(TAG_BUFFER, small));

    // 2048 slots exceed the arena object limit, so this lands in the pool
    let big = context.allocate_slots(2048);
    unsafe { big.to_mut_ptr::<Value>().write(context.stack().get(0)) };
    context.stack().push(Value::tag_pointer(TAG_SLOTS, big));
    assert_eq!(context.heap().big_object_count(), 1);

    // only the big object keeps the small one alive now
    context.stack().set(0, Value::unit());
    for _ in 0..100 {
        context.allocate_data(256);
    }
    context.collect_full();

    assert_eq!(context.heap().big_object_count(), 1);
    let referent = unsafe { *big.to_ptr::<Value>() };
    assert_eq!(referent.tag(), TAG_BUFFER);
    assert_ne!(referent.untag_pointer(), small);
    assert_eq!(read_payload(referent), 99);
}

#[test]
fn deadline_bounded_slices_never_break_roots() {
    // zero latency: every incremental mark gives up immediately and
    // allocation progresses through growth and full collections instead
    let mut context = Context::new(&options(1 << 20, 0)).unwrap();
    push_data(&mut context, 41);

    for _ in 0..1000 {
        context.allocate_data(1024);
        let value = context.stack().get(0);
        assert_eq!(value.tag(), TAG_BUFFER);
    }
    assert!(context.heap().stats().num_collections > 0);
    assert_eq!(read_payload(context.stack().get(0)), 41);

    // an undeadlined collection still catches up completely
    context.collect_full();
    assert_eq!(read_payload(context.stack().get(0)), 41);
    assert_eq!(context.heap().object_count(), 1);
}

#[test]
fn heap_doubles_up_to_the_reservation() {
    let mut context = Context::new(&options(1 << 20, 50)).unwrap();
    assert_eq!(context.heap().reserved_size(), 1 << 20);
    let initial_size = context.heap().arena_size();

    // a rooted chain of slot pairs; everything stays live, so the arena has
    // to double its way up to the reservation ceiling
    context.stack().push(Value::unit());
    for i in 0..28_000u32 {
        let node = context.allocate_slots(2);
        unsafe {
            let slots = node.to_mut_ptr::<Value>();
            slots.write(context.stack().get(0));
            slots.add(1).write(Value::small_int(i as i32));
        }
        context.stack().set(0, Value::tag_pointer(TAG_SLOTS, node));
    }

    assert!(context.heap().arena_size() > initial_size);
    assert_eq!(context.heap().arena_size(), context.heap().reserved_size());

    // walk the chain back down and verify every payload survived the moves
    let mut cursor = context.stack().get(0);
    let mut expected = 28_000i32;
    while cursor.tag() == TAG_SLOTS {
        expected -= 1;
        unsafe {
            let slots = cursor.untag_pointer().to_ptr::<Value>();
            assert_eq!((*slots.add(1)).as_small_int(), expected);
            cursor = *slots;
        }
    }
    assert_eq!(expected, 0);
}

#[test]
fn fillers_coalesce_away() {
    let mut context = Context::new(&options(64 << 20, 50)).unwrap();
    push_data(&mut context, 1);
    push_data(&mut context, 77);

    context.stack().set(0, Value::unit());
    context.collect_full();

    assert_eq!(context.heap().used_bytes(), 32);
    let survivor = context.stack().get(1);
    assert_eq!(
        survivor.untag_pointer().offset_from(context.heap().base()),
        16
    );
    assert_eq!(read_payload(survivor), 77);
}

#[test]
fn zero_sized_allocation_is_well_formed() {
    let mut context = Context::new(&options(64 << 20, 50)).unwrap();
    let body = context.allocate_data(0);
    assert_eq!(body.to_usize() % 16, 0);
    context.stack().push(Value::tag_pointer(TAG_BUFFER, body));

    context.collect_full();
    assert_eq!(context.heap().object_count(), 1);
    assert_eq!(context.heap().used_bytes(), 16);
}

#[test]
fn object_size_threshold_picks_the_pool() {
    let mut context = Context::new(&options(64 << 20, 50)).unwrap();

    context.allocate_data(1023 * 8);
    assert_eq!(context.heap().big_object_count(), 0);

    // one byte over the largest arena body
    context.allocate_data(1023 * 8 + 1);
    assert_eq!(context.heap().big_object_count(), 1);
}

#[test]
fn full_collection_is_idempotent() {
    let mut context = Context::new(&options(64 << 20, 50)).unwrap();
    for i in 0..600 {
        push_data(&mut context, i);
    }
    for i in (0..600).step_by(3) {
        context.stack().set(i, Value::unit());
    }

    context.collect_full();
    let used = context.heap().used_bytes();
    let count = context.heap().object_count();
    let addresses: Vec<usize> = (0..600)
        .map(|i| context.stack().get(i).payload() as usize)
        .collect();

    context.collect_full();
    assert_eq!(context.heap().used_bytes(), used);
    assert_eq!(context.heap().object_count(), count);
    for (i, address) in addresses.iter().enumerate() {
        assert_eq!(context.stack().get(i).payload() as usize, *address);
    }
}

#[test]
fn sub_floor_tags_are_never_followed_or_rewritten() {
    let mut context = Context::new(&options(64 << 20, 50)).unwrap();

    context.allocate_data(16); // garbage in front, so the survivor moves
    let body = context.allocate_data(16);
    unsafe { body.to_mut_ptr::<u64>().write(5) };
    context.stack().push(Value::tag_pointer(TAG_BUFFER, body));

    // an immediate whose payload happens to be a valid body address
    let lookalike = Value::from_parts(TAG_SMALL_INT, body.to_usize() as u64);
    context.stack().push(lookalike);

    context.collect_full();

    let moved = context.stack().get(0);
    assert_ne!(moved.untag_pointer(), body);
    assert_eq!(read_payload(moved), 5);
    assert_eq!(context.stack().get(1), lookalike);
}
