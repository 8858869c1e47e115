use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use skein_tasks::{TaskQueue, Tasks, TasksConfig, TasksDefault};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

fn bench_push_pick(c: &mut Criterion) {
    let mut group = c.benchmark_group("queue_push_pick");

    for capacity in [16usize, 64, 256] {
        group.throughput(Throughput::Elements(capacity as u64));
        group.bench_with_input(BenchmarkId::from_parameter(capacity), &capacity, |b, &capacity| {
            let mut queue = TaskQueue::with_capacity(capacity).unwrap();
            b.iter(|| {
                for due in 0..capacity as u64 {
                    queue.push(Box::new(|| Ok(())), (due * 7919) % 1000).unwrap();
                }
                while let Ok(item) = queue.pick(1000) {
                    black_box(item.due_ms);
                }
            });
        });
    }

    group.finish();
}

fn bench_task_post(c: &mut Criterion) {
    let runner = TasksDefault::new(TasksConfig {
        worker_count: 2,
        queue_capacity: 1024,
        handle_capacity: 4,
    })
    .unwrap();
    let done = Arc::new(AtomicUsize::new(0));

    c.bench_function("task_post_and_drain", |b| {
        b.iter(|| {
            let start = done.load(Ordering::Acquire);
            for _ in 0..64 {
                let done = Arc::clone(&done);
                runner
                    .task_post(Box::new(move || {
                        done.fetch_add(1, Ordering::AcqRel);
                        Ok(())
                    }))
                    .unwrap();
            }
            while done.load(Ordering::Acquire) < start + 64 {
                std::hint::spin_loop();
            }
        });
    });

    runner.shutdown().unwrap();
}

criterion_group!(benches, bench_push_pick, bench_task_post);
criterion_main!(benches);
