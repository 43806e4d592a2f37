use alloc::{collections::BTreeMap, vec::Vec};
use core::{mem, ops::Range};

use spire_core::{
    AllocatorConfig, AllocatorStats, BufferHandle, BufferKind, BufferUsage, FrameIndex, GpuBackend,
    HandleState, LockMode, NativeBuffer, Result, SpireError, StorageMode, logging::TARGET,
};
use tracing::{debug, error, info, trace, warn};

use crate::{
    block::{PooledBlock, Retired},
    bucket::{BucketSlot, BucketTable},
    free_pool::FreeBufferPool,
    handle::{Backing, HandleRecord},
    quarantine::FrameQuarantine,
    ring::{RingAllocation, RingAllocator},
};

const STORAGE_CLASSES: usize = 4;

fn storage_class(storage: StorageMode) -> usize {
    match storage {
        StorageMode::Shared => 0,
        StorageMode::Managed => 1,
        StorageMode::WriteCombined => 2,
        StorageMode::Private => 3,
    }
}

#[derive(Debug, Default)]
struct Counters {
    allocated_bytes: u64,
    peak_allocated_bytes: u64,
    pool_hits: u64,
    pool_misses: u64,
    renames: u64,
    reclaimed_blocks: u64,
    native_buffers_destroyed: u64,
}

/// 把原生缓冲交还后端。`owned` 表示该缓冲由分配器创建并计入 `allocated_bytes`。
fn destroy_native<Bk: GpuBackend>(
    backend: &mut Bk,
    counters: &mut Counters,
    native: Bk::Buffer,
    owned: bool,
) {
    if owned {
        counters.allocated_bytes = counters.allocated_bytes.saturating_sub(native.len() as u64);
    }
    counters.native_buffers_destroyed += 1;
    backend.destroy_buffer(native);
}

fn short_native(len: usize, storage: StorageMode) -> SpireError {
    SpireError::NativeAllocation {
        size: len as u64,
        storage,
        detail: "native buffer is shorter than the region it backs".to_owned(),
    }
}

fn ring_released() -> SpireError {
    SpireError::InvalidConfig {
        detail: "ring storage has already been released".to_owned(),
    }
}

/// 在句柄的后备存储上取出 `range` 对应的可写视图。
fn view_mut<'a, B: NativeBuffer>(
    backing: &'a mut Backing<B>,
    ring_storage: &'a mut Option<B>,
    range: Range<usize>,
) -> Result<&'a mut [u8]> {
    match backing {
        Backing::Block(block) => {
            let storage = block.storage();
            let len = block.native().len();
            block
                .native_mut()
                .contents_mut()
                .get_mut(range)
                .ok_or_else(|| short_native(len, storage))
        }
        Backing::Ring(region) => {
            let native = ring_storage.as_mut().ok_or_else(ring_released)?;
            let base = region.offset as usize;
            let (len, storage) = (native.len(), native.storage());
            native
                .contents_mut()
                .get_mut(base + range.start..base + range.end)
                .ok_or_else(|| short_native(len, storage))
        }
    }
}

fn view<'a, B: NativeBuffer>(
    backing: &'a Backing<B>,
    ring_storage: &'a Option<B>,
    range: Range<usize>,
) -> Result<&'a [u8]> {
    match backing {
        Backing::Block(block) => block
            .native()
            .contents()
            .get(range)
            .ok_or_else(|| short_native(block.native().len(), block.storage())),
        Backing::Ring(region) => {
            let native = ring_storage.as_ref().ok_or_else(ring_released)?;
            let base = region.offset as usize;
            native
                .contents()
                .get(base + range.start..base + range.end)
                .ok_or_else(|| short_native(native.len(), native.storage()))
        }
    }
}

/// 立即模式绘制在环形区上暂存的顶点（及索引）数据。
///
/// 顶点区与索引区来自同一次环形分配，二者永不重叠；`index_bytes` 在非索引绘制时为空切片。
#[derive(Debug)]
pub struct DrawStaging<'a> {
    pub vertices: RingAllocation,
    pub vertex_bytes: &'a mut [u8],
    pub indices: Option<RingAllocation>,
    pub index_bytes: &'a mut [u8],
}

/// `BufferAllocator` 是帧流水线缓冲分配器的唯一所有者对象。
///
/// # 教案式说明
/// - **意图 (Why)**：渲染管线每帧创建、改写、销毁大量顶点/索引/常量缓冲；
///   原生分配昂贵，而直接复用刚释放的内存又可能覆盖 GPU 仍在读取的数据。
///   分配器把“按桶复用”与“延迟 N 帧再复用”组合起来，同时为单次绘制数据提供零记账的环形区；
/// - **契约 (What)**：
///   - 任何原生块在同一时刻只属于空闲池、帧隔离区或一个活跃句柄之一；
///   - 释放（销毁句柄、丢弃式写入换下的旧块、`defer_release`）一律进入帧隔离区，
///     在帧 F 释放的块最早在 `advance_frame_and_reclaim(F + N)` 后才可能被再次交出；
///   - 超大块同样经过隔离，期满后销毁而非入池；
///   - 每个原生缓冲恰好一次交还 [`GpuBackend::destroy_buffer`]；
/// - **执行 (How)**：
///   - `create_buffer` 经 [`BucketTable`] 选桶，空闲池命中则复用，未命中则向后端申请规范尺寸的新块；
///   - `dynamic` 缓冲每次写锁先取新块，再把旧块送入隔离区，返回新块的视图；
///   - `volatile` 缓冲每次写锁从环形区取一段新区域；
/// - **权衡 (Trade-offs)**：
///   - 分配器以 `&mut self` 独占使用，单线程路径没有任何锁开销；
///     需要跨线程共享时统一使用 [`SharedBufferAllocator`](crate::SharedBufferAllocator)
///     包裹整个分配器，而不是给个别池单独加锁；
///   - 空闲池只增不减，峰值后的内存通过 [`trim`](Self::trim) 显式归还。
pub struct BufferAllocator<Bk: GpuBackend> {
    backend: Bk,
    config: AllocatorConfig,
    buckets: BucketTable,
    pools: [FreeBufferPool<Bk::Buffer>; STORAGE_CLASSES],
    quarantine: FrameQuarantine<Retired<Bk::Buffer>>,
    ring: RingAllocator,
    ring_storage: Option<Bk::Buffer>,
    query_ring: RingAllocator,
    query_storage: Option<Bk::Buffer>,
    handles: BTreeMap<BufferHandle, HandleRecord<Bk::Buffer>>,
    next_handle: u64,
    frame: FrameIndex,
    counters: Counters,
    torn_down: bool,
}

impl<Bk: GpuBackend> BufferAllocator<Bk> {
    /// 校验配置、构建桶表并向后端申请两块环形区存储。
    pub fn new(mut backend: Bk, config: AllocatorConfig) -> Result<Self> {
        config.validate()?;
        let safe_frames = config.safe_frames();
        let buckets = BucketTable::new(&config.bucket_thresholds, config.bucket_alignment)?;
        let frame = backend.current_frame_index();
        let ring = RingAllocator::new(config.ring_capacity, config.ring_alignment, safe_frames)?
            .starting_at(frame);
        let query_ring = RingAllocator::new(
            config.query_ring_capacity,
            config.query_slot_size,
            safe_frames,
        )?
        .starting_at(frame);

        let mut counters = Counters::default();
        let ring_storage =
            backend.new_buffer(config.ring_capacity as usize, config.default_storage)?;
        let query_storage =
            match backend.new_buffer(config.query_ring_capacity as usize, config.default_storage) {
                Ok(native) => native,
                Err(err) => {
                    backend.destroy_buffer(ring_storage);
                    return Err(err);
                }
            };
        counters.allocated_bytes = (ring_storage.len() + query_storage.len()) as u64;
        counters.peak_allocated_bytes = counters.allocated_bytes;

        let mut quarantine = FrameQuarantine::new(safe_frames);
        quarantine.reclaim(frame, |_| {});

        info!(
            target: TARGET,
            buckets = buckets.len(),
            safe_frames,
            ring_capacity = config.ring_capacity,
            storage = %config.default_storage,
            %frame,
            "buffer allocator initialised"
        );

        Ok(Self {
            backend,
            pools: core::array::from_fn(|_| FreeBufferPool::new(buckets.len())),
            buckets,
            quarantine,
            ring,
            ring_storage: Some(ring_storage),
            query_ring,
            query_storage: Some(query_storage),
            handles: BTreeMap::new(),
            next_handle: 1,
            frame,
            counters,
            torn_down: false,
            config,
        })
    }

    /// 以默认存储模式创建缓冲。
    pub fn create_buffer(
        &mut self,
        kind: BufferKind,
        logical_size: u32,
        usage: BufferUsage,
    ) -> Result<BufferHandle> {
        let storage = self.config.default_storage;
        self.create_buffer_with_storage(kind, logical_size, usage, storage)
    }

    /// 创建缓冲并指定存储模式；`volatile` 缓冲始终位于环形区，忽略 `storage`。
    pub fn create_buffer_with_storage(
        &mut self,
        kind: BufferKind,
        logical_size: u32,
        usage: BufferUsage,
        storage: StorageMode,
    ) -> Result<BufferHandle> {
        let (backing, storage) = if usage.volatile {
            (
                Backing::Ring(self.ring.allocate(logical_size)?),
                self.config.default_storage,
            )
        } else {
            (Backing::Block(self.acquire_block(logical_size, storage)?), storage)
        };
        let handle = BufferHandle(self.next_handle);
        self.next_handle += 1;
        trace!(
            target: TARGET,
            %handle,
            kind = kind.as_str(),
            logical_size,
            dynamic = usage.dynamic,
            volatile = usage.volatile,
            "buffer created"
        );
        self.handles.insert(
            handle,
            HandleRecord::new(kind, usage, storage, logical_size, backing),
        );
        Ok(handle)
    }

    /// 以写模式锁定 `[offset, offset + size)`，`size == 0` 表示到末尾。
    ///
    /// `dynamic` 缓冲在此执行丢弃式写入：新块先到位，旧块随后进入帧隔离区；
    /// 新块申请失败时句柄保持原状。
    pub fn lock_for_write(
        &mut self,
        handle: BufferHandle,
        offset: u32,
        size: u32,
    ) -> Result<&mut [u8]> {
        let record = self.record(handle)?;
        let range = record.check_lock(handle, LockMode::WriteOnly, offset, size)?;
        let (usage, storage, logical_size) = (record.usage, record.storage, record.logical_size);

        if usage.volatile {
            let region = self.ring.allocate(logical_size)?;
            self.record_mut(handle)?.backing = Backing::Ring(region);
            self.counters.renames += 1;
            trace!(target: TARGET, %handle, offset = region.offset, "volatile buffer moved to fresh ring region");
        } else if usage.dynamic {
            let fresh = self.acquire_block(logical_size, storage)?;
            let fresh_id = fresh.id();
            let Some(record) = self.handles.get_mut(&handle) else {
                self.quarantine.register(Retired::Block(fresh), self.frame);
                return Err(SpireError::UnknownHandle { handle });
            };
            if let Backing::Block(retired) = mem::replace(&mut record.backing, Backing::Block(fresh)) {
                trace!(
                    target: TARGET,
                    %handle,
                    retired = retired.id(),
                    fresh = fresh_id,
                    frame = %self.frame,
                    "discard-on-write rename"
                );
                self.quarantine.register(Retired::Block(retired), self.frame);
            }
            self.counters.renames += 1;
        }

        let record = self
            .handles
            .get_mut(&handle)
            .ok_or(SpireError::UnknownHandle { handle })?;
        record.enter_lock(LockMode::WriteOnly, range.clone());
        view_mut(&mut record.backing, &mut self.ring_storage, range)
    }

    /// 以读模式锁定。`Managed` 存储先阻塞等待 GPU 完成在途工作。
    pub fn lock_for_read(&mut self, handle: BufferHandle, offset: u32, size: u32) -> Result<&[u8]> {
        let range = self.enter_read_lock(handle, offset, size)?;
        let record = self.record(handle)?;
        view(&record.backing, &self.ring_storage, range)
    }

    /// 校验并登记读锁，`Managed` 存储在登记前同步。
    fn enter_read_lock(
        &mut self,
        handle: BufferHandle,
        offset: u32,
        size: u32,
    ) -> Result<Range<usize>> {
        let record = self
            .handles
            .get(&handle)
            .ok_or(SpireError::UnknownHandle { handle })?;
        let range = record.check_lock(handle, LockMode::ReadOnly, offset, size)?;
        if record.storage.requires_explicit_sync() {
            let timeout = self.config.sync_timeout();
            if let Err(err) = self.backend.submit_and_wait(timeout) {
                error!(
                    target: TARGET,
                    %handle,
                    frame = %self.frame,
                    error = %err,
                    "synchronisation before CPU read failed"
                );
                return Err(err);
            }
        }

        self.record_mut(handle)?
            .enter_lock(LockMode::ReadOnly, range.clone());
        Ok(range)
    }

    /// 按 `mode` 锁定并交出锁定区间的视图，语义与对应的 `lock_for_*` 相同。
    ///
    /// 两种模式都返回可变切片；读锁期间写入的内容不会作为脏区间上报，
    /// 只需读取时优先使用 [`lock_for_read`](Self::lock_for_read)。
    pub fn lock(
        &mut self,
        handle: BufferHandle,
        mode: LockMode,
        offset: u32,
        size: u32,
    ) -> Result<&mut [u8]> {
        match mode {
            LockMode::ReadOnly => {
                let range = self.enter_read_lock(handle, offset, size)?;
                let record = self
                    .handles
                    .get_mut(&handle)
                    .ok_or(SpireError::UnknownHandle { handle })?;
                view_mut(&mut record.backing, &mut self.ring_storage, range)
            }
            LockMode::WriteOnly => self.lock_for_write(handle, offset, size),
        }
    }

    /// 结束锁定；写锁会把锁定区间作为脏区间通知后端。
    pub fn unlock(&mut self, handle: BufferHandle) -> Result<()> {
        let record = self
            .handles
            .get_mut(&handle)
            .ok_or(SpireError::UnknownHandle { handle })?;
        let (mode, range) = record.leave_lock(handle)?;
        if mode == LockMode::WriteOnly {
            match &mut record.backing {
                Backing::Block(block) => block.native_mut().did_modify_range(range),
                Backing::Ring(region) => {
                    let base = region.offset as usize;
                    let native = self.ring_storage.as_mut().ok_or_else(ring_released)?;
                    native.did_modify_range(base + range.start..base + range.end);
                }
            }
        }
        Ok(())
    }

    /// 销毁句柄，其后备块进入帧隔离区；环形区缓冲无需任何回收动作。
    pub fn destroy_buffer(&mut self, handle: BufferHandle) -> Result<()> {
        let record = self
            .handles
            .remove(&handle)
            .ok_or(SpireError::UnknownHandle { handle })?;
        if record.is_locked() {
            warn!(target: TARGET, %handle, state = ?record.state(), "destroying a buffer that is still locked");
        }
        trace!(target: TARGET, %handle, kind = record.kind.as_str(), frame = %self.frame, "buffer destroyed");
        if let Backing::Block(block) = record.backing {
            self.quarantine.register(Retired::Block(block), self.frame);
        }
        Ok(())
    }

    /// 推进到帧 `frame`：期满的池化块回到空闲池，超大块与延迟释放的缓冲被销毁。
    ///
    /// 返回本次交出的隔离条目数；`frame` 不晚于当前帧时为空操作并返回 0。
    pub fn advance_frame_and_reclaim(&mut self, frame: FrameIndex) -> usize {
        if frame <= self.frame {
            return 0;
        }
        let Self {
            backend,
            pools,
            quarantine,
            counters,
            ..
        } = self;
        let reclaimed = quarantine.reclaim(frame, |retired| match retired {
            Retired::Block(block) => {
                if let Some(unpooled) = pools[storage_class(block.storage())].release(block) {
                    destroy_native(backend, counters, unpooled.into_native(), true);
                }
            }
            Retired::Deferred(native) => destroy_native(backend, counters, native, false),
        });
        self.counters.reclaimed_blocks += reclaimed as u64;
        self.frame = frame;
        self.ring.set_frame(frame);
        self.query_ring.set_frame(frame);
        trace!(target: TARGET, %frame, reclaimed, "frame advanced");
        reclaimed
    }

    /// 读取后端当前帧序号并推进。
    pub fn begin_frame(&mut self) -> usize {
        let frame = self.backend.current_frame_index();
        self.advance_frame_and_reclaim(frame)
    }

    /// 从环形区按默认对齐分配一段瞬态区域。
    pub fn allocate_from_ring(&mut self, size: u32) -> Result<RingAllocation> {
        self.ring.allocate(size)
    }

    pub fn allocate_from_ring_aligned(&mut self, size: u32, alignment: u32) -> Result<RingAllocation> {
        self.ring.allocate_aligned(size, alignment)
    }

    /// 取得先前环形分配的可写视图。
    pub fn ring_bytes_mut(&mut self, allocation: RingAllocation) -> Result<&mut [u8]> {
        let capacity = u64::from(self.ring.capacity());
        if allocation.end() > capacity {
            return Err(SpireError::AllocationTooLarge {
                requested: allocation.end(),
                capacity,
            });
        }
        let native = self.ring_storage.as_mut().ok_or_else(ring_released)?;
        let (len, storage) = (native.len(), native.storage());
        native
            .contents_mut()
            .get_mut(allocation.offset as usize..allocation.end() as usize)
            .ok_or_else(|| short_native(len, storage))
    }

    /// 为非索引的立即模式绘制暂存 `vertex_stride * vertex_count` 字节顶点数据。
    pub fn begin_draw_primitive_up(
        &mut self,
        vertex_stride: u32,
        vertex_count: u32,
    ) -> Result<DrawStaging<'_>> {
        self.stage_draw(u64::from(vertex_stride) * u64::from(vertex_count), None)
    }

    /// 为索引立即模式绘制暂存顶点与索引数据，索引区紧随按环形区对齐后的顶点区。
    pub fn begin_draw_indexed_primitive_up(
        &mut self,
        vertex_stride: u32,
        vertex_count: u32,
        index_stride: u32,
        index_count: u32,
    ) -> Result<DrawStaging<'_>> {
        self.stage_draw(
            u64::from(vertex_stride) * u64::from(vertex_count),
            Some(u64::from(index_stride) * u64::from(index_count)),
        )
    }

    fn stage_draw(&mut self, vertex_bytes: u64, index_bytes: Option<u64>) -> Result<DrawStaging<'_>> {
        let alignment = u64::from(self.ring.default_alignment());
        let vertex_span = match index_bytes {
            Some(_) => vertex_bytes.div_ceil(alignment) * alignment,
            None => vertex_bytes,
        };
        let total = vertex_span + index_bytes.unwrap_or(0);
        let total32 = u32::try_from(total).map_err(|_| SpireError::AllocationTooLarge {
            requested: total,
            capacity: u64::from(self.ring.capacity()),
        })?;
        let region = self.ring.allocate(total32)?;

        // 以下换算均不超过 total32，已确认落在 u32 内。
        let vertices = RingAllocation {
            offset: region.offset,
            size: vertex_bytes as u32,
            wrapped: region.wrapped,
        };
        let indices = index_bytes.map(|bytes| RingAllocation {
            offset: region.offset + vertex_span as u32,
            size: bytes as u32,
            wrapped: false,
        });

        let native = self.ring_storage.as_mut().ok_or_else(ring_released)?;
        let (len, storage) = (native.len(), native.storage());
        let bytes = native
            .contents_mut()
            .get_mut(region.offset as usize..region.end() as usize)
            .ok_or_else(|| short_native(len, storage))?;
        let (vertex_region, index_region) = bytes.split_at_mut(vertex_span as usize);
        Ok(DrawStaging {
            vertices,
            vertex_bytes: &mut vertex_region[..vertex_bytes as usize],
            indices,
            index_bytes: index_region,
        })
    }

    /// 从查询环分配一个固定尺寸的查询结果槽。
    pub fn allocate_query_slot(&mut self) -> Result<RingAllocation> {
        self.query_ring.allocate(self.config.query_slot_size)
    }

    /// 读取查询槽内容。
    pub fn query_slot_bytes(&self, slot: RingAllocation) -> Result<&[u8]> {
        let native = self.query_storage.as_ref().ok_or_else(ring_released)?;
        native
            .contents()
            .get(slot.offset as usize..slot.end() as usize)
            .ok_or_else(|| short_native(native.len(), native.storage()))
    }

    /// 接管任意原生缓冲，在 N 帧隔离期满后销毁。
    pub fn defer_release(&mut self, buffer: Bk::Buffer) {
        debug!(target: TARGET, id = buffer.id(), frame = %self.frame, "native buffer scheduled for deferred release");
        self.quarantine.register(Retired::Deferred(buffer), self.frame);
    }

    /// 销毁空闲池中的全部块，返回释放的字节数。隔离区与活跃句柄不受影响。
    pub fn trim(&mut self) -> u64 {
        let mut released = 0;
        let mut blocks = 0usize;
        for class in 0..STORAGE_CLASSES {
            for block in self.pools[class].drain() {
                released += block.bytes();
                blocks += 1;
                destroy_native(&mut self.backend, &mut self.counters, block.into_native(), true);
            }
        }
        info!(target: TARGET, blocks, released_bytes = released, "free pool trimmed");
        released
    }

    /// 当前统计快照。
    pub fn stats(&self) -> AllocatorStats {
        AllocatorStats {
            frame: self.frame,
            live_handles: self.handles.len(),
            allocated_bytes: self.counters.allocated_bytes,
            peak_allocated_bytes: self.counters.peak_allocated_bytes,
            pooled_bytes: self.pools.iter().map(FreeBufferPool::pooled_bytes).sum(),
            pooled_blocks: self.pools.iter().map(FreeBufferPool::pooled_blocks).sum(),
            quarantined_bytes: self.quarantine.iter().map(Retired::bytes).sum(),
            quarantined_blocks: self.quarantine.len(),
            pool_hits: self.counters.pool_hits,
            pool_misses: self.counters.pool_misses,
            renames: self.counters.renames,
            oversized_live: self
                .handles
                .values()
                .filter(|record| record.block().is_some_and(PooledBlock::is_oversized))
                .count(),
            reclaimed_blocks: self.counters.reclaimed_blocks,
            native_buffers_destroyed: self.counters.native_buffers_destroyed,
            ring_cursor: self.ring.cursor(),
            ring_wraps: self.ring.wraps(),
            ring_overrun_warnings: self.ring.overrun_warnings(),
        }
    }

    /// 句柄当前后备块的原生身份；环形区缓冲返回 `None`。
    pub fn native_id(&self, handle: BufferHandle) -> Result<Option<u64>> {
        Ok(self.record(handle)?.block().map(PooledBlock::id))
    }

    pub fn handle_state(&self, handle: BufferHandle) -> Result<HandleState> {
        Ok(self.record(handle)?.state())
    }

    pub fn frame(&self) -> FrameIndex {
        self.frame
    }

    pub fn config(&self) -> &AllocatorConfig {
        &self.config
    }

    pub fn bucket_table(&self) -> &BucketTable {
        &self.buckets
    }

    pub fn backend(&self) -> &Bk {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut Bk {
        &mut self.backend
    }

    /// 等待 GPU 空闲后销毁全部原生缓冲。
    ///
    /// 等待失败时仍会完成销毁（设备即将失效），并把等待错误返回给调用方。
    pub fn shutdown(mut self) -> Result<()> {
        let waited = self.backend.submit_and_wait(self.config.sync_timeout());
        if let Err(err) = &waited {
            error!(target: TARGET, error = %err, "GPU did not go idle before allocator shutdown");
        }
        self.teardown();
        waited
    }

    fn record(&self, handle: BufferHandle) -> Result<&HandleRecord<Bk::Buffer>> {
        self.handles
            .get(&handle)
            .ok_or(SpireError::UnknownHandle { handle })
    }

    fn record_mut(&mut self, handle: BufferHandle) -> Result<&mut HandleRecord<Bk::Buffer>> {
        self.handles
            .get_mut(&handle)
            .ok_or(SpireError::UnknownHandle { handle })
    }

    /// 为 `size` 字节取得一个块：桶内命中即复用，否则向后端申请。
    fn acquire_block(&mut self, size: u32, storage: StorageMode) -> Result<PooledBlock<Bk::Buffer>> {
        let slot = self.buckets.find_bucket(size);
        match slot {
            BucketSlot::Pooled(index) => {
                if let Some(block) = self.pools[storage_class(storage)].acquire(index) {
                    self.counters.pool_hits += 1;
                    return Ok(block);
                }
                self.counters.pool_misses += 1;
                let canonical = self.buckets.canonical_size(slot).unwrap_or(size);
                debug!(
                    target: TARGET,
                    bucket = index,
                    canonical,
                    requested = size,
                    %storage,
                    "pool miss; allocating native block"
                );
                let native = self.new_native(canonical, storage)?;
                Ok(PooledBlock::new(native, slot, canonical))
            }
            BucketSlot::Oversized => {
                debug!(target: TARGET, requested = size, %storage, "oversized request; allocating dedicated block");
                let native = self.new_native(size, storage)?;
                Ok(PooledBlock::new(native, slot, size))
            }
        }
    }

    fn new_native(&mut self, size: u32, storage: StorageMode) -> Result<Bk::Buffer> {
        let native = match self.backend.new_buffer(size as usize, storage) {
            Ok(native) => native,
            Err(err) => {
                error!(target: TARGET, size, %storage, error = %err, "native allocation failed");
                return Err(err);
            }
        };
        self.counters.allocated_bytes += native.len() as u64;
        self.counters.peak_allocated_bytes = self
            .counters
            .peak_allocated_bytes
            .max(self.counters.allocated_bytes);
        Ok(native)
    }

    fn teardown(&mut self) {
        if mem::replace(&mut self.torn_down, true) {
            return;
        }
        let locked = self.handles.values().filter(|record| record.is_locked()).count();
        if locked > 0 {
            warn!(target: TARGET, locked, "tearing down allocator with locked buffers");
        }
        let before = self.counters.native_buffers_destroyed;

        for (_, record) in mem::take(&mut self.handles) {
            if let Backing::Block(block) = record.backing {
                destroy_native(&mut self.backend, &mut self.counters, block.into_native(), true);
            }
        }
        for retired in self.quarantine.drain_all() {
            match retired {
                Retired::Block(block) => {
                    destroy_native(&mut self.backend, &mut self.counters, block.into_native(), true)
                }
                Retired::Deferred(native) => {
                    destroy_native(&mut self.backend, &mut self.counters, native, false)
                }
            }
        }
        let pooled: Vec<_> = self.pools.iter_mut().flat_map(FreeBufferPool::drain).collect();
        for block in pooled {
            destroy_native(&mut self.backend, &mut self.counters, block.into_native(), true);
        }
        for native in [self.ring_storage.take(), self.query_storage.take()]
            .into_iter()
            .flatten()
        {
            destroy_native(&mut self.backend, &mut self.counters, native, true);
        }
        info!(
            target: TARGET,
            destroyed = self.counters.native_buffers_destroyed - before,
            "buffer allocator torn down"
        );
    }
}

impl<Bk: GpuBackend> Drop for BufferAllocator<Bk> {
    fn drop(&mut self) {
        self.teardown();
    }
}
