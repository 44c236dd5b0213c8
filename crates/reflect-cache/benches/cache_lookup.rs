use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use reflect_cache::{
    CacheConfig, ClassBuilder, ConcurrentMap, ManagerKind, ReflectionCache, StandardClasses,
};
use std::sync::Arc;

fn cache(manager: ManagerKind) -> ReflectionCache {
    ReflectionCache::new(CacheConfig::with_manager(manager), StandardClasses::new()).unwrap()
}

fn bench_get_cached_class(c: &mut Criterion) {
    let mut group = c.benchmark_group("get_cached_class");

    for manager in [ManagerKind::Callback, ManagerKind::Idle] {
        let cache = cache(manager);
        let classes = cache.classes().clone();
        cache.get_cached_class(&classes.array_list).unwrap();

        group.bench_with_input(
            BenchmarkId::new("hit", format!("{manager:?}")),
            &classes.array_list,
            |b, class| {
                b.iter(|| cache.get_cached_class(black_box(class)).unwrap());
            },
        );
    }

    let cache = cache(ManagerKind::Callback);
    let classes = cache.classes().clone();
    group.bench_function("populate_and_drop", |b| {
        b.iter(|| {
            let class = ClassBuilder::class("Transient")
                .extends(&classes.array_list)
                .build();
            cache.get_cached_class(black_box(&class)).unwrap()
        });
    });

    group.finish();
}

fn bench_assignability(c: &mut Criterion) {
    let mut group = c.benchmark_group("is_assignable_from");
    let cache = cache(ManagerKind::Callback);
    let classes = cache.classes().clone();

    cache.is_assignable_from(&classes.collection, &classes.array_list);
    group.bench_function("memoized", |b| {
        b.iter(|| cache.is_assignable_from(black_box(&classes.collection), black_box(&classes.array_list)));
    });

    group.bench_function("uncached", |b| {
        b.iter(|| {
            classes
                .collection
                .is_assignable_from(black_box(&classes.array_list))
        });
    });

    group.finish();
}

fn bench_method_lookup(c: &mut Criterion) {
    let cache = cache(ManagerKind::Callback);
    let classes = cache.classes().clone();
    let parameters = [classes.int.clone()];
    let entry = cache.get_cached_class(&classes.array_list).unwrap();
    entry.methods().unwrap();

    c.bench_function("search_methods", |b| {
        b.iter(|| entry.search_methods(black_box("get"), black_box(&parameters)).unwrap());
    });
}

fn bench_concurrent_map(c: &mut Criterion) {
    let mut group = c.benchmark_group("concurrent_map");

    for size in [16usize, 1024, 65536] {
        let map: ConcurrentMap<u64, Arc<str>> = ConcurrentMap::new();
        for i in 0..size as u64 {
            map.put(i, Arc::from(format!("value{i}")));
        }

        group.bench_with_input(BenchmarkId::new("get", size), &size, |b, &size| {
            let mut i = 0u64;
            b.iter(|| {
                i = (i + 7) % size as u64;
                map.get(black_box(&i))
            });
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_get_cached_class,
    bench_assignability,
    bench_method_lookup,
    bench_concurrent_map
);
criterion_main!(benches);
