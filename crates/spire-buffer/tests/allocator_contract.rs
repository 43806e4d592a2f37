//! `allocator_contract` 集成测试：从 crate 外部驱动 `BufferAllocator`，验证帧流水线契约。
//!
//! # 测试目标（Why）
//! - 复用必须在 N 个帧边界之后才发生，且拿回的是同一块原生内存；
//! - 丢弃式写入不得触碰读者仍可能看到的内存；
//! - 同步、关闭与延迟释放路径对后端的副作用（等待次数、销毁次数、脏区间）符合约定。
//!
//! # 结构安排（How）
//! - 所有用例都基于 `HostBackend`，并通过 `HostProbe` 观察被分配器接管后的后端台账；
//! - 每个用例只验证一条契约，失败信息直接指出被破坏的约束。

use std::collections::BTreeSet;

use spire_buffer::{BufferAllocator, HostBackend, HostProbe};
use spire_core::{
    AllocatorConfig, BufferKind, BufferUsage, FrameIndex, GpuBackend, HandleState, LockMode,
    SpireError, StorageMode, codes, logging,
};

/// 阈值 `[256, 512, 1024]`、对齐 256、N = 2 的小型配置。
fn scenario_config() -> AllocatorConfig {
    AllocatorConfig {
        bucket_thresholds: vec![256, 512, 1024],
        bucket_alignment: 256,
        safe_frame_count: 2,
        ring_capacity: 64 * 1024,
        ring_alignment: 256,
        query_ring_capacity: 1024,
        query_slot_size: 8,
        ..AllocatorConfig::default()
    }
}

fn allocator_with_probe() -> (BufferAllocator<HostBackend>, HostProbe) {
    logging::try_install_for_tests();
    let backend = HostBackend::new();
    let probe = backend.probe();
    let allocator = BufferAllocator::new(backend, scenario_config()).expect("场景配置合法");
    (allocator, probe)
}

/// 帧 0 释放的块在帧 2 才可再次取得，且按后进先出拿回最后释放的那一块。
///
/// # 步骤说明（How）
/// 1. 300 字节请求落入 512 桶；
/// 2. 动态句柄写锁触发换块，随后在帧 0 销毁，两块都进入隔离区；
/// 3. 帧 1 时空闲池仍为空，帧 2 时两块回池；
/// 4. 再次请求 300 字节必须拿到刚销毁的那块原生内存，且没有新的未命中。
#[test]
fn block_released_at_frame_zero_is_reused_at_frame_two() {
    let (mut alloc, _probe) = allocator_with_probe();
    let table = alloc.bucket_table();
    assert_eq!(table.canonical_size(table.find_bucket(300)), Some(512));

    let h1 = alloc
        .create_buffer(BufferKind::Vertex, 300, BufferUsage::DYNAMIC)
        .expect("创建 H1");
    alloc.lock_for_write(h1, 0, 0).expect("写锁").fill(0x5A);
    alloc.unlock(h1).expect("解锁");
    let released = alloc
        .native_id(h1)
        .expect("H1 存在")
        .expect("H1 由池化块承载");
    alloc.destroy_buffer(h1).expect("销毁 H1");
    let misses = alloc.stats().pool_misses;

    alloc.advance_frame_and_reclaim(FrameIndex::new(1));
    assert_eq!(alloc.stats().pooled_blocks, 0, "帧 1 时隔离尚未期满");

    assert_eq!(alloc.advance_frame_and_reclaim(FrameIndex::new(2)), 2);
    let h2 = alloc
        .create_buffer(BufferKind::Vertex, 300, BufferUsage::STATIC)
        .expect("创建 H2");
    assert_eq!(alloc.native_id(h2).expect("H2 存在"), Some(released));
    assert_eq!(alloc.stats().pool_misses, misses, "复用路径不应产生新的原生分配");
}

/// 写锁返回的内存与此前读锁看到的内存不同。
#[test]
fn dynamic_write_never_touches_memory_seen_by_reader() {
    let (mut alloc, _probe) = allocator_with_probe();
    let h = alloc
        .create_buffer(BufferKind::Uniform, 256, BufferUsage::DYNAMIC)
        .expect("创建");
    alloc.lock_for_write(h, 0, 0).expect("写锁").fill(0x11);
    alloc.unlock(h).expect("解锁");

    let read_ptr = alloc.lock_for_read(h, 0, 0).expect("读锁").as_ptr() as usize;
    let err = alloc
        .lock_for_write(h, 0, 0)
        .expect_err("读锁未释放时不得写锁");
    assert_eq!(err.code(), codes::INVALID_STATE);
    alloc.unlock(h).expect("解锁读锁");

    let write_ptr = alloc.lock_for_write(h, 0, 0).expect("写锁").as_ptr() as usize;
    assert_ne!(read_ptr, write_ptr);
    alloc.unlock(h).expect("解锁");
}

/// `Managed` 存储：写解锁上报脏区间，读锁前阻塞等待 GPU；`Shared` 存储两者皆无。
#[test]
fn managed_storage_synchronises_reads_and_reports_dirty_ranges() {
    let (mut alloc, probe) = allocator_with_probe();
    let managed = alloc
        .create_buffer_with_storage(BufferKind::Structured, 64, BufferUsage::STATIC, StorageMode::Managed)
        .expect("创建 managed");
    let id = alloc.native_id(managed).expect("存在").expect("池化块");

    alloc.lock_for_write(managed, 16, 8).expect("写锁").fill(3);
    alloc.unlock(managed).expect("解锁");
    assert_eq!(probe.dirty_ranges(id), vec![16..24]);

    assert_eq!(alloc.lock_for_read(managed, 16, 8).expect("读锁"), &[3; 8]);
    alloc.unlock(managed).expect("解锁");
    assert_eq!(probe.waits(), 1);

    let shared = alloc
        .create_buffer(BufferKind::Structured, 64, BufferUsage::STATIC)
        .expect("创建 shared");
    alloc.lock_for_read(shared, 0, 0).expect("读锁");
    alloc.unlock(shared).expect("解锁");
    assert_eq!(probe.waits(), 1, "共享存储读取无需等待");
}

/// 同步超时是致命错误，句柄保持未锁定。
#[test]
fn synchronisation_timeout_is_fatal_and_leaves_handle_unlocked() {
    let (mut alloc, _probe) = allocator_with_probe();
    let h = alloc
        .create_buffer_with_storage(BufferKind::Vertex, 64, BufferUsage::STATIC, StorageMode::Managed)
        .expect("创建");
    alloc.backend_mut().fail_waits(true);
    let err = alloc.lock_for_read(h, 0, 0).expect_err("等待应超时");
    assert!(matches!(err, SpireError::SynchronizationTimeout { .. }));
    assert!(err.is_fatal());
    assert_eq!(alloc.handle_state(h).expect("存在"), HandleState::Unwritten);
}

/// GPU 私有存储不可映射。
#[test]
fn private_storage_rejects_cpu_locks() {
    let (mut alloc, _probe) = allocator_with_probe();
    let h = alloc
        .create_buffer_with_storage(BufferKind::Vertex, 64, BufferUsage::STATIC, StorageMode::Private)
        .expect("创建");
    let err = alloc.lock_for_write(h, 0, 0).expect_err("私有存储");
    assert_eq!(err.code(), codes::NOT_CPU_ACCESSIBLE);
}

/// 不同存储模式的块不会互相复用。
#[test]
fn pools_are_partitioned_by_storage_mode() {
    let (mut alloc, _probe) = allocator_with_probe();
    let h = alloc
        .create_buffer_with_storage(BufferKind::Vertex, 200, BufferUsage::STATIC, StorageMode::Managed)
        .expect("创建");
    let managed_id = alloc.native_id(h).expect("存在");
    alloc.destroy_buffer(h).expect("销毁");
    alloc.advance_frame_and_reclaim(FrameIndex::new(2));

    let shared = alloc
        .create_buffer(BufferKind::Vertex, 200, BufferUsage::STATIC)
        .expect("创建");
    assert_ne!(alloc.native_id(shared).expect("存在"), managed_id);
    let managed = alloc
        .create_buffer_with_storage(BufferKind::Vertex, 200, BufferUsage::STATIC, StorageMode::Managed)
        .expect("创建");
    assert_eq!(alloc.native_id(managed).expect("存在"), managed_id);
}

/// `begin_frame` 以后端帧序号驱动回收。
#[test]
fn begin_frame_follows_backend_frame_index() {
    let (mut alloc, _probe) = allocator_with_probe();
    let h = alloc
        .create_buffer(BufferKind::Index, 100, BufferUsage::STATIC)
        .expect("创建");
    alloc.destroy_buffer(h).expect("销毁");

    alloc.backend_mut().submit_frame();
    assert_eq!(alloc.begin_frame(), 0);
    alloc.backend_mut().submit_frame();
    assert_eq!(alloc.begin_frame(), 1);
    assert_eq!(alloc.frame(), FrameIndex::new(2));
    assert_eq!(alloc.begin_frame(), 0, "同一帧重复推进为空操作");
}

/// 延迟释放的原生缓冲在隔离期满后才交还后端。
#[test]
fn deferred_release_waits_for_safe_frames() {
    let (mut alloc, probe) = allocator_with_probe();
    let native = alloc
        .backend_mut()
        .new_buffer(128, StorageMode::Shared)
        .expect("后端分配");
    let id = spire_core::NativeBuffer::id(&native);
    alloc.defer_release(native);

    alloc.advance_frame_and_reclaim(FrameIndex::new(1));
    assert!(!probe.destroyed_ids().contains(&id));
    alloc.advance_frame_and_reclaim(FrameIndex::new(2));
    assert!(probe.destroyed_ids().contains(&id));
}

/// 关闭流程：等待 GPU 一次，所有原生缓冲恰好销毁一次。
#[test]
fn shutdown_waits_once_and_destroys_everything_exactly_once() {
    let (mut alloc, probe) = allocator_with_probe();
    let live = alloc
        .create_buffer(BufferKind::Vertex, 300, BufferUsage::STATIC)
        .expect("活跃句柄");
    let pooled = alloc
        .create_buffer(BufferKind::Vertex, 900, BufferUsage::STATIC)
        .expect("将入池");
    alloc.destroy_buffer(pooled).expect("销毁");
    alloc.advance_frame_and_reclaim(FrameIndex::new(2));
    let quarantined = alloc
        .create_buffer(BufferKind::Vertex, 5000, BufferUsage::STATIC)
        .expect("超大块");
    alloc.destroy_buffer(quarantined).expect("销毁");
    alloc.lock_for_write(live, 0, 0).expect("写锁").fill(1);
    let extra = alloc
        .backend_mut()
        .new_buffer(64, StorageMode::Shared)
        .expect("后端分配");
    alloc.defer_release(extra);

    alloc.shutdown().expect("关闭");
    assert_eq!(probe.waits(), 1);
    assert_eq!(probe.live_buffers(), 0, "所有原生缓冲都应交还后端");
    let destroyed = probe.destroyed_ids();
    let unique: BTreeSet<u64> = destroyed.iter().copied().collect();
    assert_eq!(unique.len(), destroyed.len(), "同一原生缓冲不得重复销毁");
}

/// 直接丢弃分配器同样完成销毁，但不等待 GPU。
#[test]
fn drop_tears_down_without_waiting() {
    let (mut alloc, probe) = allocator_with_probe();
    alloc
        .create_buffer(BufferKind::Vertex, 64, BufferUsage::STATIC)
        .expect("创建");
    drop(alloc);
    assert_eq!(probe.waits(), 0);
    assert_eq!(probe.live_buffers(), 0);
}

/// 环形区累计分配超过容量时回绕到 0，且统计可见。
#[test]
fn ring_allocations_wrap_and_are_counted() {
    let (mut alloc, _probe) = allocator_with_probe();
    let capacity = alloc.config().ring_capacity;
    let first = alloc.allocate_from_ring(capacity - 512).expect("分配");
    assert_eq!(first.offset, 0);
    let second = alloc.allocate_from_ring(1024).expect("回绕");
    assert_eq!(second.offset, 0);
    assert!(second.wrapped);
    let stats = alloc.stats();
    assert_eq!(stats.ring_wraps, 1);
    assert_eq!(stats.ring_cursor, 1024);
    assert_eq!(stats.ring_overrun_warnings, 1, "同一帧内回绕应告警");

    let err = alloc
        .allocate_from_ring(capacity + 1)
        .expect_err("超过环形区容量");
    assert_eq!(err.code(), codes::ALLOCATION_TOO_LARGE);
}

/// 在非零后端帧上构建的分配器，首帧内的回绕同样告警。
#[test]
fn ring_wrap_in_first_frame_warns_when_built_at_later_frame() {
    logging::try_install_for_tests();
    let mut backend = HostBackend::new();
    for _ in 0..100 {
        backend.submit_frame();
    }
    let mut alloc = BufferAllocator::new(backend, scenario_config()).expect("场景配置合法");
    assert_eq!(alloc.frame(), FrameIndex::new(100));

    let capacity = alloc.config().ring_capacity;
    alloc.allocate_from_ring(capacity - 512).expect("分配");
    assert!(alloc.allocate_from_ring(1024).expect("回绕").wrapped);
    let stats = alloc.stats();
    assert_eq!(stats.ring_wraps, 1);
    assert_eq!(stats.ring_overrun_warnings, 1, "构建帧内回绕应告警");
}

/// 零字节的环形请求不会开启新的一圈。
#[test]
fn zero_sized_ring_request_near_end_does_not_wrap() {
    let (mut alloc, _probe) = allocator_with_probe();
    let capacity = alloc.config().ring_capacity;
    alloc.allocate_from_ring(capacity - 100).expect("分配");
    let empty = alloc.allocate_from_ring(0).expect("零字节");
    assert!(!empty.wrapped);
    let stats = alloc.stats();
    assert_eq!(stats.ring_wraps, 0);
    assert_eq!(stats.ring_overrun_warnings, 0);
}

/// 通用 `lock` 的写模式交出可写视图，写入经解锁后对读锁可见。
#[test]
fn generic_lock_write_mode_is_writable() {
    let (mut alloc, probe) = allocator_with_probe();
    let h = alloc
        .create_buffer_with_storage(BufferKind::Uniform, 64, BufferUsage::STATIC, StorageMode::Managed)
        .expect("创建");
    let id = alloc.native_id(h).expect("存在").expect("池化块");

    alloc
        .lock(h, LockMode::WriteOnly, 8, 4)
        .expect("写锁")
        .copy_from_slice(&[1, 2, 3, 4]);
    alloc.unlock(h).expect("解锁");
    assert_eq!(probe.dirty_ranges(id), vec![8..12]);
    assert_eq!(alloc.handle_state(h).expect("存在"), HandleState::Readable);

    assert_eq!(alloc.lock(h, LockMode::ReadOnly, 8, 4).expect("读锁"), &[1, 2, 3, 4]);
    assert_eq!(probe.waits(), 1, "Managed 读锁前同步一次");
    alloc.unlock(h).expect("解锁");
    assert_eq!(probe.dirty_ranges(id), vec![8..12], "读解锁不上报脏区间");
}

/// 立即模式绘制的暂存数据可经环形分配重新取回。
#[test]
fn draw_staging_is_readable_through_ring_view() {
    let (mut alloc, _probe) = allocator_with_probe();
    let vertices = {
        let mut staging = alloc.begin_draw_primitive_up(16, 3).expect("暂存");
        staging.vertex_bytes.fill(0xEE);
        assert!(staging.indices.is_none());
        assert!(staging.index_bytes.is_empty());
        staging.vertices
    };
    assert_eq!(vertices.size, 48);
    assert!(alloc.ring_bytes_mut(vertices).expect("取回").iter().all(|&b| b == 0xEE));
}

/// 从 TOML 加载的配置直接驱动分配器；非法配置在申请任何原生资源前被拒绝。
#[test]
fn toml_configuration_drives_construction() {
    let config = AllocatorConfig::from_toml_str(
        r#"
        bucket_thresholds = [128, 4096]
        bucket_alignment = 128
        safe_frame_count = 2
        ring_capacity = 8192
        "#,
    )
    .expect("合法 TOML");
    let alloc = BufferAllocator::new(HostBackend::new(), config).expect("合法配置");
    assert_eq!(alloc.bucket_table().sizes(), &[128, 4096]);

    let backend = HostBackend::new();
    let probe = backend.probe();
    let invalid = AllocatorConfig {
        safe_frame_count: 0,
        ..scenario_config()
    };
    let err = BufferAllocator::new(backend, invalid).err().expect("非法配置");
    assert_eq!(err.code(), codes::INVALID_CONFIG);
    assert_eq!(probe.created(), 0);
}
