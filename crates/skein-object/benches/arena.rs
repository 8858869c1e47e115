use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use skein_object::{default_allocator, HandleArena, HandleSystem, Object, ObjectHeader, Result};
use std::sync::Arc;

struct Node {
    header: ObjectHeader,
}

impl Object for Node {
    fn header(&self) -> &ObjectHeader {
        &self.header
    }

    fn destroy(&self) -> Result<()> {
        Ok(())
    }
}

fn bench_register_unregister(c: &mut Criterion) {
    let arena: HandleArena<Node> = HandleArena::with_capacity(1024, default_allocator()).unwrap();
    let node = Arc::new(Node {
        header: ObjectHeader::new(1, 0),
    });

    c.bench_function("register_unregister", |b| {
        b.iter(|| {
            let handle = arena.register_object(black_box(&node)).unwrap();
            arena.unregister_object(handle).unwrap();
        });
    });
}

fn bench_resolve(c: &mut Criterion) {
    let mut group = c.benchmark_group("resolve");

    for live in [1usize, 64, 1024] {
        let arena: HandleArena<Node> =
            HandleArena::with_capacity(live, default_allocator()).unwrap();
        let nodes: Vec<_> = (0..live)
            .map(|_| {
                Arc::new(Node {
                    header: ObjectHeader::new(1, 0),
                })
            })
            .collect();
        let handles: Vec<_> = nodes
            .iter()
            .map(|node| arena.register_object(node).unwrap())
            .collect();

        group.bench_with_input(BenchmarkId::new("live", live), &handles, |b, handles| {
            b.iter(|| {
                for handle in handles {
                    black_box(arena.resolve(*handle).unwrap());
                }
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_register_unregister, bench_resolve);
criterion_main!(benches);
