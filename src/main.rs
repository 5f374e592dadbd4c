use meteor::runtime::context::Context;
use meteor::runtime::options::Options;
use meteor::runtime::value::{Value, TAG_SLOTS};
use structopt::StructOpt;

fn main() {
    let options = Options::from_args();
    let mut context = match Context::new(&options) {
        Some(context) => context,
        None => {
            eprintln!("meteor: failed to reserve heap memory, aborting");
            std::process::exit(1);
        }
    };

    // churn a rooted list so the collector has live data to move around
    context.stack().push(Value::unit());
    for i in 0..1_000_000u32 {
        let node = context.allocate_slots(2);
        unsafe {
            let slots = node.to_mut_ptr::<Value>();
            slots.write(context.stack().get(0));
            slots.add(1).write(Value::small_int(i as i32));
        }
        let head = Value::tag_pointer(TAG_SLOTS, node);
        context.stack().set(0, head);
        if i % 4096 == 0 {
            context.stack().set(0, Value::unit());
        }
    }
    context.collect_full();

    if options.gc_stats {
        let stats = context.heap().stats();
        println!("collections:  {}", stats.num_collections);
        println!("- marking:    {} ms", stats.mark_time.as_millis());
        println!("- compacting: {} ms", stats.compact_time.as_millis());
    }
}
