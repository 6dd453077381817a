use std::{collections::VecDeque, time};

use criterion::{BatchSize, Criterion, black_box, criterion_group, criterion_main};

use ultmem::{Configuration, LargePageKind, Memory, MemoryContext, ThreadAttributes, UnitHandle};

fn memory() -> Memory {
    let configuration = Configuration::new()
        .with_page_size(2 * 1024 * 1024)
        .with_stack_size(16 * 1024)
        .with_large_page(LargePageKind::TransparentHuge);

    MemoryContext::new(configuration, ultmem::DefaultPlatform::new()).expect("valid configuration")
}

//  Single-Thread Thread Round-Trip.
//
//  This benchmark repeatedly allocates and frees a thread on a single execution unit: the best case of the local pool,
//  compared with the direct allocation served to external callers.
fn single_threaded_thread_round_trip(c: &mut Criterion) {
    let memory = memory();
    let worker = memory.execution_unit();

    c.bench_function("ST thread round-trip - pooled", |b| b.iter(|| {
        let thread = black_box(worker.alloc_thread(None).expect("memory"));
        unsafe { worker.free_thread(thread) };
    }));

    c.bench_function("ST thread round-trip - direct", |b| b.iter(|| {
        let thread = black_box(memory.alloc_thread(None).expect("memory"));
        unsafe { memory.free_thread(thread) };
    }));

    let attributes = ThreadAttributes::main();

    c.bench_function("ST thread round-trip - main", |b| b.iter(|| {
        let thread = black_box(worker.alloc_thread(Some(&attributes)).expect("memory"));
        unsafe { worker.free_thread(thread) };
    }));
}

//  Single-Thread Task Round-Trip.
fn single_threaded_task_round_trip(c: &mut Criterion) {
    let memory = memory();
    let worker = memory.execution_unit();

    c.bench_function("ST task round-trip - pooled", |b| b.iter(|| {
        let task = black_box(worker.alloc_task().expect("memory"));
        unsafe { worker.free_task(task) };
    }));

    c.bench_function("ST task round-trip - direct", |b| b.iter(|| {
        let task = black_box(memory.alloc_task().expect("memory"));
        unsafe { memory.free_task(task) };
    }));
}

//  Single-Thread Batch.
//
//  This benchmark allocates a batch of threads, then frees them in FIFO order, spanning multiple pages.
fn single_threaded_batch(c: &mut Criterion) {
    const BATCH: usize = 1024;

    let memory = memory();
    let worker = memory.execution_unit();

    c.bench_function("ST thread batch", |b| b.iter_custom(|iterations| {
        let mut duration = time::Duration::default();

        for _ in 0..iterations {
            let start = time::Instant::now();

            let mut threads: VecDeque<_> = (0..BATCH).map(|_| worker.alloc_thread(None).expect("memory")).collect();

            while let Some(thread) = threads.pop_front() {
                unsafe { worker.free_thread(thread) };
            }

            duration += start.elapsed();
        }

        duration
    }));
}

//  Single-Thread Remote Free.
//
//  This benchmark frees threads allocated by another execution unit, pushing them onto the remote free lists.
fn single_threaded_remote_free(c: &mut Criterion) {
    const BATCH: usize = 64;

    let memory = memory();
    let (owner, other) = (memory.execution_unit(), memory.execution_unit());

    c.bench_function("ST thread remote free", |b| b.iter_batched(
        || (0..BATCH).map(|_| owner.alloc_thread(None).expect("memory")).collect::<Vec<_>>(),
        |threads| for thread in threads {
            unsafe { other.free_thread(thread) };
        },
        BatchSize::SmallInput,
    ));
}

//  Unit table: lock-free look-up, and locked map and unmap.
fn unit_table(c: &mut Criterion) {
    let memory = memory();
    let worker = memory.execution_unit();

    let thread = worker.alloc_thread(Some(&ThreadAttributes::main())).expect("memory");
    let units: Vec<_> = (1..=256).map(|i| UnitHandle::from_raw(i * 64).expect("non-null")).collect();

    for unit in &units {
        memory.map_unit(*unit, thread).expect("memory");
    }

    c.bench_function("Unit table get", |b| b.iter(|| {
        for unit in &units {
            black_box(memory.unit_thread(*unit));
        }
    }));

    c.bench_function("Unit table get - builtin", |b| {
        let builtin = UnitHandle::from_thread(thread);

        b.iter(|| black_box(memory.unit_thread(black_box(builtin))))
    });

    let spare = UnitHandle::from_raw(0x10_0000).expect("non-null");

    c.bench_function("Unit table map-unmap", |b| b.iter(|| {
        memory.map_unit(spare, thread).expect("memory");
        memory.unmap_unit(spare);
    }));

    for unit in units {
        memory.unmap_unit(unit);
    }

    unsafe { worker.free_thread(thread) };
}

criterion_group!(
    benches,
    single_threaded_thread_round_trip,
    single_threaded_task_round_trip,
    single_threaded_batch,
    single_threaded_remote_free,
    unit_table
);

criterion_main!(benches);
