use alloc::sync::Arc;

use spin::Mutex;

use spire_core::{
    AllocatorStats, BufferHandle, BufferKind, BufferUsage, FrameIndex, GpuBackend, Result,
};

use crate::{allocator::BufferAllocator, ring::RingAllocation};

/// `SharedBufferAllocator` 让多个线程（渲染线程与 RHI 提交线程）共用同一个分配器。
///
/// # 教案式说明
/// - **意图 (Why)**：启用独立提交线程后，池、隔离区与环形区都会被并发访问；
///   只给其中某一个池加锁会留下其余结构的数据竞争；
/// - **契约 (What)**：一把 `spin::Mutex` 保护整个 [`BufferAllocator`]，所有操作在同一把锁下串行；
///   锁定视图借用于锁守卫，因此读写以闭包形式提供，闭包返回后立即解锁句柄；
/// - **权衡 (Trade-offs)**：选择自旋锁以与空闲池的无阻塞假设保持一致，临界区内不得执行耗时工作。
///
/// # 限制
/// - `Managed` 存储的 [`read`](Self::read) 在持锁期间调用后端的 `submit_and_wait`：
///   后端归分配器独占，等待无法移出临界区。等待期间其余线程的每个操作都会自旋，
///   最长可达 `sync_timeout_ms`；
/// - 多线程场景下需要频繁回读的缓冲应使用 `Shared` 存储，它不经过这条同步路径。
pub struct SharedBufferAllocator<Bk: GpuBackend> {
    inner: Arc<Mutex<BufferAllocator<Bk>>>,
}

impl<Bk: GpuBackend> Clone for SharedBufferAllocator<Bk> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<Bk: GpuBackend> SharedBufferAllocator<Bk> {
    pub fn new(allocator: BufferAllocator<Bk>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(allocator)),
        }
    }

    pub fn create_buffer(
        &self,
        kind: BufferKind,
        logical_size: u32,
        usage: BufferUsage,
    ) -> Result<BufferHandle> {
        self.inner.lock().create_buffer(kind, logical_size, usage)
    }

    /// 写锁 `[offset, offset + size)`，把可写视图交给 `f`，随后解锁并上报脏区间。
    pub fn with_write_lock<R>(
        &self,
        handle: BufferHandle,
        offset: u32,
        size: u32,
        f: impl FnOnce(&mut [u8]) -> R,
    ) -> Result<R> {
        let mut allocator = self.inner.lock();
        let result = f(allocator.lock_for_write(handle, offset, size)?);
        allocator.unlock(handle)?;
        Ok(result)
    }

    /// 把 `data` 写到 `offset` 处。
    pub fn write(&self, handle: BufferHandle, offset: u32, data: &[u8]) -> Result<()> {
        // 超出 u32 的长度必然越界，交给加锁时的区间校验报告。
        let size = u32::try_from(data.len()).unwrap_or(u32::MAX);
        if size == 0 {
            return Ok(());
        }
        self.with_write_lock(handle, offset, size, |bytes| bytes.copy_from_slice(data))
    }

    /// 读锁 `[offset, offset + size)` 并把只读视图交给 `f`。
    pub fn read<R>(
        &self,
        handle: BufferHandle,
        offset: u32,
        size: u32,
        f: impl FnOnce(&[u8]) -> R,
    ) -> Result<R> {
        let mut allocator = self.inner.lock();
        let result = f(allocator.lock_for_read(handle, offset, size)?);
        allocator.unlock(handle)?;
        Ok(result)
    }

    pub fn destroy_buffer(&self, handle: BufferHandle) -> Result<()> {
        self.inner.lock().destroy_buffer(handle)
    }

    pub fn advance_frame_and_reclaim(&self, frame: FrameIndex) -> usize {
        self.inner.lock().advance_frame_and_reclaim(frame)
    }

    pub fn begin_frame(&self) -> usize {
        self.inner.lock().begin_frame()
    }

    pub fn allocate_from_ring(&self, size: u32) -> Result<RingAllocation> {
        self.inner.lock().allocate_from_ring(size)
    }

    pub fn stats(&self) -> AllocatorStats {
        self.inner.lock().stats()
    }

    /// 在锁内对分配器执行任意操作。
    pub fn with<R>(&self, f: impl FnOnce(&mut BufferAllocator<Bk>) -> R) -> R {
        f(&mut self.inner.lock())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::HostBackend;
    use spire_core::{AllocatorConfig, StorageMode};

    fn shared() -> SharedBufferAllocator<HostBackend> {
        let allocator =
            BufferAllocator::new(HostBackend::new(), AllocatorConfig::default()).expect("默认配置合法");
        SharedBufferAllocator::new(allocator)
    }

    #[test]
    fn write_then_read_round_trips_through_lock() {
        let shared = shared();
        let h = shared
            .create_buffer(BufferKind::Uniform, 64, BufferUsage::STATIC)
            .expect("创建");
        shared.write(h, 4, &[9, 8, 7]).expect("写入");
        let read = shared.read(h, 4, 3, <[u8]>::to_vec).expect("读取");
        assert_eq!(read, vec![9, 8, 7]);
    }

    #[test]
    fn managed_read_waits_for_gpu_once_per_read() {
        let backend = HostBackend::new();
        let probe = backend.probe();
        let shared = SharedBufferAllocator::new(
            BufferAllocator::new(backend, AllocatorConfig::default()).expect("默认配置合法"),
        );
        let managed = shared
            .with(|alloc| {
                alloc.create_buffer_with_storage(
                    BufferKind::Uniform,
                    32,
                    BufferUsage::STATIC,
                    StorageMode::Managed,
                )
            })
            .expect("创建");
        shared.write(managed, 0, &[5; 4]).expect("写入");
        assert_eq!(probe.waits(), 0, "写入无需等待");

        assert_eq!(shared.read(managed, 0, 4, <[u8]>::to_vec).expect("读取"), vec![5; 4]);
        assert_eq!(probe.waits(), 1);

        let plain = shared
            .create_buffer(BufferKind::Uniform, 32, BufferUsage::STATIC)
            .expect("创建");
        shared.read(plain, 0, 4, |_| ()).expect("读取");
        assert_eq!(probe.waits(), 1, "Shared 存储读取不进入同步路径");
    }

    #[test]
    fn failed_lock_does_not_run_closure() {
        let shared = shared();
        let h = shared
            .create_buffer(BufferKind::Uniform, 16, BufferUsage::STATIC)
            .expect("创建");
        let mut ran = false;
        let result = shared.with_write_lock(h, 8, 16, |_| ran = true);
        assert!(result.is_err());
        assert!(!ran);
    }
}
