use criterion::{black_box, criterion_group, criterion_main, Criterion};
use meteor::runtime::context::Context;
use meteor::runtime::options::Options;

fn bench_allocate(c: &mut Criterion) {
    let options = Options::default();
    let mut context = Context::new(&options).unwrap();
    c.bench_function("allocate 16 byte data", |b| {
        b.iter(|| black_box(context.allocate_data(16)))
    });
}

criterion_group!(benches, bench_allocate);
criterion_main!(benches);
