use criterion::{Criterion, criterion_group, criterion_main};
use spire_buffer::{BufferAllocator, HostBackend, RingAllocator};
use spire_core::{AllocatorConfig, BufferKind, BufferUsage, FrameIndex};

/// Benchmark: 环形区的热路径分配。
///
/// *Why*：立即模式绘制每次调用都会走这条路径，游标对齐与回绕判断必须足够轻。
/// *How*：在 1 MiB 环形区上连续分配 192 字节，自然触发周期性回绕。
fn bench_ring_allocate(c: &mut Criterion) {
    let mut ring = RingAllocator::new(1024 * 1024, 256, 3).expect("合法容量");
    c.bench_function("ring_allocate_192b", |b| {
        b.iter(|| criterion::black_box(ring.allocate(192).expect("环形分配")));
    });
}

/// Benchmark: 动态缓冲的丢弃式写入。
///
/// *Why*：每帧改写的常量缓冲都会换块，换块成本包含空闲池出栈与隔离区登记。
/// *How*：每 64 次写锁推进一帧，使隔离区持续把块送回空闲池，测得稳态下的命中路径。
fn bench_dynamic_rename(c: &mut Criterion) {
    let config = AllocatorConfig {
        ring_capacity: 64 * 1024,
        ..AllocatorConfig::default()
    };
    let mut allocator = BufferAllocator::new(HostBackend::new(), config).expect("合法配置");
    let handle = allocator
        .create_buffer(BufferKind::Uniform, 256, BufferUsage::DYNAMIC)
        .expect("创建");
    let mut frame = 0u64;
    let mut writes = 0u32;
    c.bench_function("dynamic_rename_256b", |b| {
        b.iter(|| {
            let bytes = allocator.lock_for_write(handle, 0, 0).expect("写锁");
            bytes[0] = bytes[0].wrapping_add(1);
            allocator.unlock(handle).expect("解锁");
            writes += 1;
            if writes % 64 == 0 {
                frame += 1;
                allocator.advance_frame_and_reclaim(FrameIndex::new(frame));
            }
        });
    });
}

criterion_group!(ring_and_rename, bench_ring_allocate, bench_dynamic_rename);
criterion_main!(ring_and_rename);
